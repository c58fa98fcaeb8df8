//! # Fluree DB Federation
//!
//! Join evaluation across federation members.
//!
//! This crate provides:
//! - `ResultStream`: the pull-based, close-safe solution stream every join returns
//! - Join strategies between a local binding stream and a remote operand:
//!   `AsyncNestedLoopJoin`, `CachingAsyncNestedLoopJoin`, `BlockBoundJoin`
//! - `CompetingRankJoin`: multi-plan evaluation for ORDER BY + LIMIT queries
//! - Leaf utilities: `ResultMaterializer`, `OrderComparator`, custom aggregates
//!
//! ## Design Principles
//!
//! 1. **Threads, not async**: each join cursor owns its worker threads and tears
//!    them down on close
//! 2. **Backpressure everywhere**: producers block on a bounded queue, never
//!    buffer without limit (materialization is the explicit exception)
//! 3. **Close is always safe**: idempotent, callable from any thread through a
//!    `CloseHandle`, and releases every stream produced so far
//!
//! Remote execution is delegated to a host-supplied `RemoteEvaluator`.
//!
//! ## Example
//!
//! ```ignore
//! use fluree_db_federation::{AsyncNestedLoopJoin, FederationConfig, ResultStream};
//!
//! let config = FederationConfig::from_env()?;
//! let mut join = AsyncNestedLoopJoin::new(left, operand, evaluator, &config)?;
//! while let Some(row) = join.next()? {
//!     // ...
//! }
//! join.close()?;
//! ```

pub mod aggregate;
pub mod binding;
pub mod bound_join;
pub mod caching_join;
pub mod config;
pub mod error;
pub mod executor;
pub mod expression;
mod join_cursor;
pub mod materializer;
pub mod nested_loop;
pub mod order;
pub mod queue;
pub mod rank_join;
pub mod remote;
pub mod stream;
pub mod value;

// Re-export main types
pub use aggregate::{
    AggregateService, AggregateServiceDispatcher, AggregateServiceRegistry,
    InMemoryAggregateRegistry, MedianAggregate, MEDIAN_AGGREGATE_IRI,
};
pub use binding::{var_set, Binding, JoinKey, JoinVars, Var, VarSet};
pub use bound_join::{BlockBoundJoin, BoundJoinDemux};
pub use caching_join::CachingAsyncNestedLoopJoin;
pub use config::FederationConfig;
pub use error::{FederationError, Result, TransportErrorKind};
pub use executor::{Task, TaskExecutor, ThreadPerTaskExecutor, WorkerPool};
pub use expression::{ExprRef, Expression, FnExpression};
pub use materializer::{MaterializedCursor, MaterializedResult, ResultMaterializer};
pub use nested_loop::AsyncNestedLoopJoin;
pub use order::{OrderComparator, OrderCondition, PriorityElement, SortDirection, TopK};
pub use queue::BoundedResultQueue;
pub use rank_join::{heuristic_extension, CompetingRankJoin, RankOrder};
pub use remote::{FederatedOperand, RemoteEvaluator, RemoteResultStream, BOUND_JOIN_INDEX_VAR};
pub use stream::{
    collect_all, BoxedStream, CloseFlag, CloseHandle, PeekableStream, ResultStream, VecStream,
};
pub use value::{compare_values, Value};
