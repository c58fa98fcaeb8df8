//! Competing rank join
//!
//! For ORDER BY + LIMIT over several federation members, the join tries more
//! than one join ordering at once. Each *branch* starts from a seed operand and
//! extends itself one operand at a time, in an order chosen by a simple
//! connectivity heuristic. Branches compete for the remaining operands: an
//! operand is claimed by the first branch that schedules it and disappears
//! from every other branch's queue.
//!
//! Evaluation is a barrier. The first `next` blocks until every branch has run
//! out of operands, then merges the branch results with a hash join on their
//! shared variables. Only the two-seed case is merged; for any other number of
//! seeds the join produces no rows.
//!
//! An optional ORDER BY comparator and limit are carried with the join, along
//! with a [`TopK`] buffer built from them ([`CompetingRankJoin::top_k`]). The
//! merge neither fills it nor uses it to stop early; callers sort and cut the
//! merged output themselves.

use crate::binding::{Binding, JoinKey, JoinVars, VarSet};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::executor::{run_guarded, TaskExecutor, ThreadPerTaskExecutor};
use crate::materializer::{MaterializedCursor, MaterializedResult, ResultMaterializer};
use crate::order::{OrderComparator, TopK};
use crate::remote::{FederatedOperand, RemoteEvaluator};
use crate::stream::{CloseFlag, CloseHandle, Closeable, ResultStream};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::Span;

/// ORDER BY + LIMIT carried by a rank join
#[derive(Clone, Debug)]
pub struct RankOrder {
    pub comparator: OrderComparator,
    pub limit: usize,
}

/// Extension order for the branch seeded with `operands[seed]`
///
/// Repeatedly picks the first remaining operand sharing a variable with the
/// variables accumulated so far; stops once only disconnected operands are
/// left. The seed itself is not part of the result.
pub fn heuristic_extension(operands: &[FederatedOperand], seed: usize) -> Vec<usize> {
    let Some(seed_op) = operands.get(seed) else {
        return Vec::new();
    };
    let mut accumulated = seed_op.free_vars().clone();
    let mut remaining: Vec<usize> = (0..operands.len()).filter(|&i| i != seed).collect();
    let mut order = Vec::with_capacity(remaining.len());

    while let Some(pos) = remaining
        .iter()
        .position(|&i| operands[i].shares_vars(&accumulated))
    {
        let next = remaining.remove(pos);
        accumulated.extend(operands[next].free_vars().iter().cloned());
        order.push(next);
    }
    order
}

struct Branch {
    seed: usize,
    queue: VecDeque<usize>,
    free_vars: VarSet,
    result: Option<MaterializedResult>,
    steps: usize,
}

enum StepEvent {
    Done {
        branch: usize,
        operand: usize,
        result: Result<MaterializedResult>,
    },
    Cancelled,
}

struct RankJoinCloser {
    flag: CloseFlag,
    wake: Mutex<Option<mpsc::Sender<StepEvent>>>,
}

impl Closeable for RankJoinCloser {
    fn close(&self) {
        if self.flag.close() {
            if let Some(wake) = self.wake.lock().take() {
                let _ = wake.send(StepEvent::Cancelled);
            }
        }
    }
}

enum RankState {
    Pending,
    Ready(MaterializedCursor),
    Done,
}

/// Multi-plan join over a set of federated operands
pub struct CompetingRankJoin {
    operands: Arc<[FederatedOperand]>,
    seeds: Vec<usize>,
    evaluator: Arc<dyn RemoteEvaluator>,
    executor: Arc<dyn TaskExecutor>,
    order: Option<RankOrder>,
    /// Built from `order`; not fed by the merge
    top_k: Option<TopK>,
    state: RankState,
    closer: Arc<RankJoinCloser>,
    span: Span,
}

impl CompetingRankJoin {
    /// Join `operands`, racing one branch per entry of `seeds` (operand indexes)
    pub fn new(
        operands: Vec<FederatedOperand>,
        seeds: Vec<usize>,
        evaluator: Arc<dyn RemoteEvaluator>,
        config: &FederationConfig,
    ) -> Result<Self> {
        config.validate()?;
        for (pos, &seed) in seeds.iter().enumerate() {
            if seed >= operands.len() {
                return Err(FederationError::Internal(format!(
                    "rank join seed {} out of range for {} operands",
                    seed,
                    operands.len()
                )));
            }
            if seeds[..pos].contains(&seed) {
                return Err(FederationError::Internal(format!(
                    "rank join seed {} listed twice",
                    seed
                )));
            }
        }
        let span = tracing::debug_span!(
            "competing_rank_join",
            operands = operands.len(),
            seeds = seeds.len(),
        );
        Ok(Self {
            operands: operands.into(),
            seeds,
            evaluator,
            executor: Arc::new(ThreadPerTaskExecutor::new(config.thread_name("rank-join"))),
            order: None,
            top_k: None,
            state: RankState::Pending,
            closer: Arc::new(RankJoinCloser {
                flag: CloseFlag::new(),
                wake: Mutex::new(None),
            }),
            span,
        })
    }

    /// Run branch steps on a host-supplied executor
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Attach the query's ORDER BY and LIMIT
    pub fn with_order(mut self, comparator: OrderComparator, limit: usize) -> Self {
        self.top_k = Some(TopK::new(comparator.clone(), limit));
        self.order = Some(RankOrder { comparator, limit });
        self
    }

    pub fn ordering(&self) -> Option<&RankOrder> {
        self.order.as_ref()
    }

    /// Priority buffer for the attached ORDER BY and LIMIT
    pub fn top_k(&self) -> Option<&TopK> {
        self.top_k.as_ref()
    }

    fn evaluate(&self) -> Result<MaterializedResult> {
        let (tx, rx) = mpsc::channel::<StepEvent>();
        *self.closer.wake.lock() = Some(tx.clone());
        if self.closer.flag.is_closed() {
            return Err(FederationError::Cancelled);
        }

        let mut claimed = vec![false; self.operands.len()];
        let mut branches: Vec<Branch> = self
            .seeds
            .iter()
            .map(|&seed| {
                claimed[seed] = true;
                Branch {
                    seed,
                    queue: heuristic_extension(&self.operands, seed).into(),
                    free_vars: self.operands[seed].free_vars().clone(),
                    result: None,
                    steps: 0,
                }
            })
            .collect();
        for branch in branches.iter_mut() {
            branch.queue.retain(|&op| !claimed[op]);
        }

        for (idx, branch) in branches.iter().enumerate() {
            self.submit_step(idx, branch.seed, None, VarSet::new(), &tx)?;
        }

        let mut remaining = branches.len();
        while remaining > 0 {
            let event = rx.recv().map_err(|_| {
                FederationError::Internal("rank join step channel disconnected".into())
            })?;
            let (idx, operand, result) = match event {
                StepEvent::Cancelled => return Err(FederationError::Cancelled),
                StepEvent::Done {
                    branch,
                    operand,
                    result,
                } => (branch, operand, result),
            };
            let result = result?;

            let next = {
                let branch = &mut branches[idx];
                branch.steps += 1;
                branch
                    .free_vars
                    .extend(self.operands[operand].free_vars().iter().cloned());
                branch.result = Some(result);
                branch.queue.pop_front()
            };

            match next {
                Some(op) => {
                    claimed[op] = true;
                    for (other, branch) in branches.iter_mut().enumerate() {
                        if other != idx {
                            branch.queue.retain(|&queued| queued != op);
                        }
                    }
                    let branch = &branches[idx];
                    self.submit_step(idx, op, branch.result.clone(), branch.free_vars.clone(), &tx)?;
                }
                None => {
                    let branch = &branches[idx];
                    tracing::debug!(
                        branch = idx,
                        seed = %self.operands[branch.seed].label(),
                        steps = branch.steps,
                        rows = branch.result.as_ref().map_or(0, |r| r.len()),
                        "rank join branch exhausted"
                    );
                    remaining -= 1;
                }
            }
        }
        self.closer.wake.lock().take();

        if branches.len() != 2 {
            tracing::warn!(
                seeds = branches.len(),
                "competing rank join merges exactly two seeds; producing no results"
            );
            return Ok(MaterializedResult::default());
        }
        let (a, b) = (&branches[0], &branches[1]);
        let merged = hash_join(
            a.result.as_ref().map_or(&[][..], |r| r.rows()),
            &a.free_vars,
            b.result.as_ref().map_or(&[][..], |r| r.rows()),
            &b.free_vars,
        );
        tracing::debug!(rows = merged.len(), "rank join merged");
        Ok(merged)
    }

    fn submit_step(
        &self,
        branch: usize,
        operand: usize,
        prev: Option<MaterializedResult>,
        bound_vars: VarSet,
        tx: &mpsc::Sender<StepEvent>,
    ) -> Result<()> {
        let evaluator = Arc::clone(&self.evaluator);
        let operands = Arc::clone(&self.operands);
        let tx = tx.clone();
        let step_span = tracing::debug_span!(
            parent: &self.span,
            "rank_join_step",
            branch,
            operand = %self.operands[operand].label(),
        );
        self.executor.execute(Box::new(move || {
            let _guard = step_span.enter();
            let result = run_guarded("rank join step", || {
                let op = &operands[operand];
                let stream = match prev {
                    None => evaluator.evaluate(op, &Binding::empty())?,
                    Some(prev) => evaluator.evaluate_join(prev.cursor().boxed(), op, &bound_vars)?,
                };
                ResultMaterializer::materialize_boxed(stream)
            });
            match &result {
                Ok(rows) => tracing::trace!(rows = rows.len(), "rank join step finished"),
                Err(e) => tracing::debug!(error = %e, "rank join step failed"),
            }
            // receiver is gone once evaluation ended early
            let _ = tx.send(StepEvent::Done {
                branch,
                operand,
                result,
            });
        }))
    }
}

/// Hash join of two materialized results on their shared variables
///
/// Rows missing a join variable cannot be hashed and are matched by scanning;
/// with no shared variables the result is the cross product.
fn hash_join(
    left: &[Binding],
    left_vars: &VarSet,
    right: &[Binding],
    right_vars: &VarSet,
) -> MaterializedResult {
    let join_vars = JoinVars::shared(left_vars, right_vars);
    let mut out = Vec::new();

    let mut table: FxHashMap<JoinKey, Vec<&Binding>> = FxHashMap::default();
    let mut unkeyed: Vec<&Binding> = Vec::new();
    for row in left {
        let key = join_vars.key(row);
        if key.has_unbound() {
            unkeyed.push(row);
        } else {
            table.entry(key).or_default().push(row);
        }
    }

    for row in right {
        let key = join_vars.key(row);
        if key.has_unbound() {
            out.extend(left.iter().filter_map(|l| l.merge(row)));
            continue;
        }
        if let Some(matches) = table.get(&key) {
            out.extend(matches.iter().filter_map(|l| l.merge(row)));
        }
        out.extend(unkeyed.iter().filter_map(|l| l.merge(row)));
    }
    MaterializedResult::new(out)
}

impl ResultStream for CompetingRankJoin {
    fn next(&mut self) -> Result<Option<Binding>> {
        if matches!(self.state, RankState::Pending) {
            let _guard = self.span.enter();
            match self.evaluate() {
                Ok(result) => self.state = RankState::Ready(result.cursor()),
                Err(e) if e.is_cancelled() => {
                    self.state = RankState::Done;
                    return Ok(None);
                }
                Err(e) => {
                    self.state = RankState::Done;
                    self.closer.close();
                    return Err(e);
                }
            }
        }
        if self.closer.flag.is_closed() {
            self.state = RankState::Done;
        }
        match &mut self.state {
            RankState::Ready(cursor) => cursor.next(),
            _ => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closer.close();
        self.state = RankState::Done;
        Ok(())
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        Some(CloseHandle::new(self.closer.clone() as Arc<dyn Closeable>))
    }
}

impl Drop for CompetingRankJoin {
    fn drop(&mut self) {
        self.closer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::var_set;
    use crate::value::Value;

    fn op(label: &str, vars: &[&str]) -> FederatedOperand {
        FederatedOperand::new(label, "member", label, var_set(vars.iter().copied()))
    }

    #[test]
    fn test_heuristic_stops_at_disconnected() {
        let operands = vec![
            op("a", &["x"]),
            op("b", &["z"]),
            op("c", &["x", "y"]),
            op("d", &["y", "z"]),
            op("e", &["q"]),
        ];
        // b only connects once d brings in ?z
        assert_eq!(heuristic_extension(&operands, 0), vec![2, 3, 1]);
        assert_eq!(heuristic_extension(&operands, 4), Vec::<usize>::new());
    }

    #[test]
    fn test_hash_join_on_shared_vars() {
        let row = |pairs: &[(&str, i64)]| -> Binding {
            pairs.iter().map(|(k, v)| (*k, Value::Long(*v))).collect()
        };
        let left = vec![row(&[("x", 1), ("a", 10)]), row(&[("x", 2), ("a", 20)])];
        let right = vec![
            row(&[("x", 1), ("b", 100)]),
            row(&[("x", 1), ("b", 101)]),
            row(&[("x", 3), ("b", 300)]),
        ];
        let merged = hash_join(&left, &var_set(["x", "a"]), &right, &var_set(["x", "b"]));
        assert_eq!(merged.len(), 2);
        assert!(merged
            .rows()
            .iter()
            .all(|r| r.get("a") == Some(&Value::Long(10))));

        let cross = hash_join(&left, &var_set(["x", "a"]), &[row(&[("c", 1)])], &var_set(["c"]));
        assert_eq!(cross.len(), 2);
    }
}
