// Copyright 2020 Joyent, Inc.

mod common;

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use patroni_pool::cancel::CancelToken;
use patroni_pool::connection_pool::types::ConnectionPoolOptions;
use patroni_pool::error::Error;
use patroni_pool::retry::{Attempt, RetryError, RetryHelper};

use common::{manual_options, start_pool, Answer, Cluster, DummyConnection};

const DELAY: Duration = Duration::from_millis(100);

fn helper(cluster: &Cluster, max_retries: u32) -> RetryHelper<DummyConnection> {
    let cpo = ConnectionPoolOptions {
        max_retries: Some(max_retries),
        inter_retry_delay: Some(DELAY),
        ..manual_options()
    };
    RetryHelper::new(Arc::new(start_pool(cluster, cpo)))
}

fn unreachable_cluster() -> Cluster {
    let cluster = Cluster::with_members("pg-a", &["pg-b"]);
    cluster.set_answer("pg-a", Answer::Down);
    cluster.set_answer("pg-b", Answer::Down);
    cluster
}

#[test]
fn action_result_is_returned() {
    let cluster = Cluster::with_members("pg-a", &["pg-b"]);
    let helper = helper(&cluster, 3);
    let token = CancelToken::new();

    let node: Result<String, RetryError<io::Error>> =
        helper.do_write(&token, |_, conn| Ok(conn.node.clone()));
    assert_eq!(node.unwrap(), "pg-a");

    let node: Result<String, RetryError<io::Error>> =
        helper.do_read(&token, |_, conn| Ok(conn.node.clone()));
    assert_eq!(node.unwrap(), "pg-a");
}

#[test]
fn business_error_is_not_retried() {
    let cluster = Cluster::with_members("pg-a", &["pg-b"]);
    let helper = helper(&cluster, 3);
    let token = CancelToken::new();

    let mut calls = 0;
    let result: Result<(), _> = helper.do_write(&token, |_, _| {
        calls += 1;
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "duplicate key value violates unique constraint",
        ))
    });

    assert_eq!(calls, 1);
    match result {
        Err(RetryError::Action(e)) => {
            assert_eq!(e.kind(), io::ErrorKind::InvalidData);
            assert_eq!(
                e.to_string(),
                "duplicate key value violates unique constraint"
            );
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(helper.pool().write_conn().is_some());
}

#[test]
fn missing_connection_exhausts_retries() {
    let cluster = unreachable_cluster();
    let helper = helper(&cluster, 3);
    let token = CancelToken::new();

    let mut calls = 0;
    let start = Instant::now();
    let result: Result<(), RetryError<io::Error>> =
        helper.do_read(&token, |_, _| {
            calls += 1;
            Ok(())
        });
    let elapsed = start.elapsed();

    assert_eq!(calls, 0);
    // Two waits between three attempts
    assert!(elapsed >= DELAY * 2, "elapsed {:?}", elapsed);
    assert!(elapsed < DELAY * 5, "elapsed {:?}", elapsed);

    let err = result.unwrap_err();
    assert_eq!(err.history().len(), 3);
    assert!(err
        .history()
        .iter()
        .all(|a| matches!(a, Attempt::NoConnection)));
    assert!(matches!(err, RetryError::BadConnection(_)));
    assert_eq!(
        err.to_string(),
        "Bad connection; attempt 1: No connection; \
         attempt 2: No connection; attempt 3: No connection"
    );
}

#[test]
fn connection_failure_is_retried() {
    let cluster = Cluster::with_members("pg-a", &["pg-b"]);
    let helper = helper(&cluster, 5);
    let token = CancelToken::new();

    let mut calls = 0;
    let result = helper.do_write(&token, |_, conn| {
        calls += 1;
        if calls == 1 {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        } else {
            Ok(conn.id)
        }
    });

    // The refresh requested by the failure restores the leader connection
    assert_eq!(result.unwrap(), 0);
    assert!(calls >= 2);
}

#[test]
fn history_records_failed_nodes() {
    let cluster = Cluster::with_members("pg-a", &["pg-b"]);
    let helper = helper(&cluster, 2);
    let token = CancelToken::new();

    // The leader stays down once demoted, so the second attempt finds no
    // write connection.
    cluster.set_db_down("pg-a", true);
    let result: Result<(), _> = helper.do_write(&token, |_, _| {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
    });

    let err = result.unwrap_err();
    match err.history() {
        [Attempt::ConnectionFatal { node, error }, Attempt::NoConnection] => {
            assert_eq!(node.as_ref(), "pg-a");
            assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
        }
        other => panic!("unexpected history: {:?}", other),
    }
    assert!(err.to_string().contains("attempt 1: pg-a: broken pipe"));
}

#[test]
fn cancellation_interrupts_wait() {
    let cluster = unreachable_cluster();
    let cpo = ConnectionPoolOptions {
        max_retries: Some(10),
        inter_retry_delay: Some(Duration::from_secs(10)),
        ..manual_options()
    };
    let helper = RetryHelper::new(Arc::new(start_pool(&cluster, cpo)));

    let token = CancelToken::new();
    let canceller = token.clone();
    let cancel_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.cancel();
    });

    let start = Instant::now();
    let result: Result<(), RetryError<io::Error>> =
        helper.do_read(&token, |_, _| Ok(()));
    assert!(start.elapsed() < Duration::from_secs(5));

    match result {
        Err(RetryError::Interrupted {
            cause: Error::Cancelled,
            history,
        }) => assert_eq!(history.len(), 1),
        other => panic!("unexpected result: {:?}", other),
    }
    cancel_thread.join().unwrap();
}

#[test]
fn deadline_interrupts_wait() {
    let cluster = unreachable_cluster();
    let helper = helper(&cluster, 10);
    let token = CancelToken::with_timeout(Duration::from_millis(250));

    let result: Result<(), RetryError<io::Error>> =
        helper.do_write(&token, |_, _| Ok(()));
    match result {
        Err(RetryError::Interrupted {
            cause: Error::DeadlineExceeded,
            history,
        }) => assert!(history.len() >= 2 && history.len() < 10),
        other => panic!("unexpected result: {:?}", other),
    }
}
