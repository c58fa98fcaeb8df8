//! Integration tests for the adjacency-caching nested-loop join.

mod support;

use fluree_db_federation::{
    collect_all, Binding, CachingAsyncNestedLoopJoin, FederationConfig, FederationError,
    ResultStream, Value,
};
use std::time::{Duration, Instant};
use support::{left, multiset, naive_join, operand, row, wait_until, xs, FakeMember};

fn two_rows_per_x() -> Vec<Binding> {
    vec![
        row(&[("x", 1), ("y", 10)]),
        row(&[("x", 1), ("y", 11)]),
        row(&[("x", 2), ("y", 20)]),
        row(&[("x", 2), ("y", 21)]),
    ]
}

fn caching_join(member: &std::sync::Arc<FakeMember>, input: Vec<Binding>) -> CachingAsyncNestedLoopJoin {
    CachingAsyncNestedLoopJoin::new(
        left(input),
        operand("ys", &["x", "y"]),
        member.clone(),
        &FederationConfig::default().with_join_workers(4),
    )
    .expect("start caching join")
}

#[test]
fn adjacent_duplicates_share_one_remote_call() {
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .into_arc();
    let input = xs(&[1, 1, 2]);

    let mut join = caching_join(&member, input.clone());
    let rows = collect_all(&mut join).expect("join rows");

    assert_eq!(member.calls(), 2);
    assert_eq!(rows.len(), 6);
    assert_eq!(multiset(&rows), multiset(&naive_join(&input, &two_rows_per_x())));
    assert!(member.streams.all_closed());
}

#[test]
fn non_adjacent_duplicates_are_evaluated_again() {
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .into_arc();

    let mut join = caching_join(&member, xs(&[1, 2, 1]));
    let rows = collect_all(&mut join).expect("join rows");

    assert_eq!(member.calls(), 3);
    assert_eq!(rows.len(), 6);
}

#[test]
fn long_run_uses_etalon_only() {
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .into_arc();
    let input: Vec<Binding> = (0..5).map(|k| row(&[("x", 1), ("k", k)])).collect();

    let mut join = caching_join(&member, input.clone());
    let rows = collect_all(&mut join).expect("join rows");

    assert_eq!(member.calls(), 1);
    assert_eq!(member.evaluated.lock()[0], input[0]);
    assert_eq!(rows.len(), 10);
    // each replayed row carries its own member's extra variables
    for k in 0..5 {
        let for_k = rows
            .iter()
            .filter(|r| r.get("k") == Some(&Value::Long(k)))
            .count();
        assert_eq!(for_k, 2, "rows for k={}", k);
    }
}

#[test]
fn join_key_fixed_by_first_binding() {
    // ?y is not bound by the first binding, so it never joins the key
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .into_arc();
    let input = vec![
        row(&[("x", 1)]),
        row(&[("x", 1), ("y", 10)]),
        row(&[("x", 1), ("y", 11)]),
    ];

    let mut join = caching_join(&member, input);
    let rows = collect_all(&mut join).expect("join rows");

    assert_eq!(member.calls(), 1);
    assert_eq!(rows.len(), 6);
}

#[test]
fn worker_failure_aborts_cursor() {
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .failing_on_x(2)
        .into_arc();

    let mut join = caching_join(&member, xs(&[1, 1, 2, 2, 1]));
    let err = loop {
        match join.next() {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("failure was not surfaced"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, FederationError::RemoteEvaluation { .. }));
    assert!(join.next().expect("next after failure").is_none());
    join.close().expect("close after failure");
    assert!(wait_until(Duration::from_secs(5), || member.streams.all_closed()));
}

#[test]
fn close_before_exhaustion_stops_producers() {
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .with_delay(Duration::from_millis(30))
        .into_arc();
    // every binding starts a new run
    let input = xs(&(1..=200).collect::<Vec<_>>());

    let mut join = caching_join(&member, input);
    assert!(join.next().expect("first row").is_some());

    let started = Instant::now();
    join.close().expect("close");
    join.close().expect("second close is a no-op");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(join.next().expect("next after close").is_none());

    assert!(
        join.await_termination(Duration::from_secs(5)),
        "dispatcher or workers still running after close"
    );
    let calls_at_exit = member.calls();
    assert!(calls_at_exit < 50, "calls after close: {}", calls_at_exit);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(member.calls(), calls_at_exit);
    assert!(member.streams.all_closed());
}

#[test]
fn producers_exit_after_exhaustion() {
    let member = FakeMember::new()
        .with_table("ys", two_rows_per_x())
        .into_arc();

    let mut join = caching_join(&member, xs(&[1, 1, 2, 2]));
    assert_eq!(collect_all(&mut join).expect("join rows").len(), 8);
    assert!(join.await_termination(Duration::from_secs(5)));
}
