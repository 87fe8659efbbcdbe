//! Query execution: sync, async, caching, timeouts, engine fallback

mod common;

use std::time::{Duration, Instant};

use common::{emit, harness, Options, Repl};
use cpgsession_orchestration::engine::shell_quote;
use cpgsession_orchestration::{
    EngineMode, ErrorKind, JobStatus, QueryResult, SessionStatus,
};
use serde_json::json;

const THREE_ROWS: &str = r#"[{"name":"main","line":1},{"name":"helper","line":7},{"name":"init","line":12}]"#;

fn rows(result: &QueryResult) -> Vec<serde_json::Value> {
    match result {
        QueryResult::Success { data, .. } => data.iter().cloned().map(serde_json::Value::Object).collect(),
        QueryResult::Failure { kind, message, .. } => panic!("query failed: {} {}", kind, message),
    }
}

async fn wait_for_job(h: &common::Harness, job_id: &str) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let status = h.service.query_status(job_id).unwrap().status;
        if status.is_terminal() || Instant::now() > deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_three_rows_and_limit_truncation() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let all = h
        .service
        .execute_query(&session.id, &emit(THREE_ROWS), None, None, None)
        .await
        .unwrap();
    let two = h
        .service
        .execute_query(&session.id, &emit(THREE_ROWS), None, Some(2), None)
        .await
        .unwrap();

    assert_eq!(rows(&all).len(), 3);
    assert_eq!(rows(&all)[1], json!({"name": "helper", "line": 7}));
    assert_eq!(rows(&two).len(), 2);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let h = harness(Options::default()).await;
    let a = h.ready_session("alpha").await;
    let b = h.ready_session("beta").await;
    let workspace_listing = r#"printf '[{"ws":"%s","files":"%s"}]' "$(basename "$PWD")" "$(ls source)" > "$OUT""#;

    let from_a = h.service.execute_query(&a.id, workspace_listing, None, None, None).await.unwrap();
    let from_b = h.service.execute_query(&b.id, workspace_listing, None, None, None).await.unwrap();

    assert_eq!(rows(&from_a)[0], json!({"ws": a.id, "files": "alpha.py"}));
    assert_eq!(rows(&from_b)[0], json!({"ws": b.id, "files": "beta.py"}));
}

#[tokio::test]
async fn test_repeated_query_is_served_from_cache() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;
    let hits = h.file("hits.log");
    let query = format!(
        "echo run >> {}; {}",
        shell_quote(&hits.to_string_lossy()),
        emit(r#"[{"n":1}]"#)
    );

    let first = h.service.execute_query(&session.id, &query, None, None, None).await.unwrap();
    let second = h.service.execute_query(&session.id, &query, None, None, None).await.unwrap();

    assert_eq!(rows(&first), rows(&second));
    assert_eq!(std::fs::read_to_string(&hits).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let first = h.service.execute_query(&session.id, "true", None, None, None).await.unwrap();
    let second = h.service.execute_query(&session.id, "true", None, None, None).await.unwrap();

    assert_eq!(first.error_kind(), Some(ErrorKind::QueryExecutionError));
    assert_eq!(second.error_kind(), Some(ErrorKind::QueryExecutionError));
}

#[tokio::test]
async fn test_non_json_output_becomes_value_row() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let result = h
        .service
        .execute_query(&session.id, "printf 'not json' > \"$OUT\"", None, None, None)
        .await
        .unwrap();

    assert_eq!(rows(&result), vec![json!({"value": "not json"})]);
}

#[tokio::test]
async fn test_timeout_kills_query_and_releases_session() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let started = Instant::now();
    let slow = h
        .service
        .execute_query(&session.id, &format!("sleep 5; {}", emit("[]")), Some(1), None, None)
        .await
        .unwrap();
    assert_eq!(slow.error_kind(), Some(ErrorKind::QueryTimeout));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(
        h.service.scheduler().engine_mode(&session.id).await,
        EngineMode::WarmSuspect
    );

    let quick = h
        .service
        .execute_query(&session.id, &emit(r#"[{"ok":true}]"#), Some(5), None, None)
        .await
        .unwrap();
    assert_eq!(rows(&quick), vec![json!({"ok": true})]);
    assert_eq!(
        h.service.scheduler().engine_mode(&session.id).await,
        EngineMode::WarmOk
    );
}

#[tokio::test]
async fn test_timed_out_job_does_not_block_next_query() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let job = h
        .service
        .submit_query(&session.id, &format!("sleep 5; {}", emit("[]")), Some(1), None, None)
        .await
        .unwrap();
    let started = Instant::now();
    let quick = h
        .service
        .execute_query(&session.id, &emit("[]"), Some(10), None, None)
        .await
        .unwrap();

    assert!(quick.is_success());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(wait_for_job(&h, &job).await, JobStatus::Timeout);
    assert_eq!(
        h.service.query_result(&job).unwrap_err().kind(),
        ErrorKind::QueryTimeout
    );
}

#[tokio::test]
async fn test_async_round_trip() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;
    let query = format!("sleep 0.5; {}", emit(THREE_ROWS));

    // Holds the session lane so the next job is seen waiting
    let blocker = h
        .service
        .submit_query(&session.id, &format!("sleep 0.5; {}", emit("[]")), None, None, None)
        .await
        .unwrap();
    let job_id = h
        .service
        .submit_query(&session.id, &query, None, None, None)
        .await
        .unwrap();
    let early = h.service.query_result(&job_id).unwrap_err();
    assert_eq!(early.kind(), ErrorKind::NotReady);

    let mut seen = vec![h.service.query_status(&job_id).unwrap().status];
    let deadline = Instant::now() + Duration::from_secs(15);
    while !seen[seen.len() - 1].is_terminal() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = h.service.query_status(&job_id).unwrap().status;
        if status != seen[seen.len() - 1] {
            seen.push(status);
        }
    }
    assert_eq!(
        seen,
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
    );
    assert_eq!(wait_for_job(&h, &blocker).await, JobStatus::Completed);

    let fetched = h.service.query_result(&job_id).unwrap();
    let direct = h
        .service
        .execute_query(&session.id, &query, None, None, None)
        .await
        .unwrap();
    assert_eq!(rows(&fetched).len(), 3);
    assert_eq!(rows(&fetched), rows(&direct));

    let listed = h.service.list_jobs(Some(&session.id));
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|job| job.job_id == job_id));
    assert_eq!(
        h.service.query_status("no-such-job").unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_offset_reaches_engine_and_keys_the_cache() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;
    let query = r#"printf '[{"offset":%s}]' "$OFFSET" > "$OUT""#;

    let first_page = h
        .service
        .execute_query(&session.id, query, None, Some(10), None)
        .await
        .unwrap();
    let third_page = h
        .service
        .execute_query(&session.id, query, None, Some(10), Some(20))
        .await
        .unwrap();

    assert_eq!(rows(&first_page), vec![json!({"offset": 0})]);
    assert_eq!(rows(&third_page), vec![json!({"offset": 20})]);

    let too_far = h
        .service
        .execute_query(&session.id, query, None, None, Some(1_000_001))
        .await
        .unwrap_err();
    assert_eq!(too_far.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn test_jobs_on_one_session_run_in_submission_order() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;
    let order = h.file("order.log");

    let mut jobs = Vec::new();
    for i in 1..=3 {
        let query = format!(
            "sleep 0.2; echo {} >> {}; {}",
            i,
            shell_quote(&order.to_string_lossy()),
            emit("[]")
        );
        jobs.push(h.service.submit_query(&session.id, &query, None, None, None).await.unwrap());
    }
    for job in &jobs {
        assert_eq!(wait_for_job(&h, job).await, JobStatus::Completed);
    }

    assert_eq!(std::fs::read_to_string(&order).unwrap(), "1\n2\n3\n");
}

#[tokio::test]
async fn test_closing_session_fails_pending_jobs() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let running = h
        .service
        .submit_query(&session.id, &format!("sleep 2; {}", emit("[]")), None, None, None)
        .await
        .unwrap();
    let queued = h
        .service
        .submit_query(&session.id, &emit("[]"), None, None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.service.close_session(&session.id).await.unwrap();

    for job in [&running, &queued] {
        let status = h.service.query_status(job).unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("session closed"));
        assert_eq!(
            h.service.query_result(job).unwrap_err().kind(),
            ErrorKind::QueryExecutionError
        );
    }
}

#[tokio::test]
async fn test_crashing_persistent_engine_falls_back_to_direct() {
    let h = harness(Options {
        repl: Repl::Crashing,
        ..Options::default()
    })
    .await;
    let session = h.ready_session("app").await;
    let scheduler = h.service.scheduler();

    let first = h
        .service
        .execute_query(&session.id, &emit(r#"[{"q":1}]"#), None, None, None)
        .await
        .unwrap();
    assert_eq!(rows(&first), vec![json!({"q": 1})]);
    assert_eq!(scheduler.engine_mode(&session.id).await, EngineMode::WarmSuspect);

    let second = h
        .service
        .execute_query(&session.id, &emit(r#"[{"q":2}]"#), None, None, None)
        .await
        .unwrap();
    assert!(second.is_success());
    assert_eq!(scheduler.engine_mode(&session.id).await, EngineMode::ColdFallback);

    let third = h
        .service
        .execute_query(&session.id, &emit(r#"[{"q":3}]"#), None, None, None)
        .await
        .unwrap();
    assert!(third.is_success());
    assert_eq!(scheduler.engine_mode(&session.id).await, EngineMode::ColdFallback);
}

#[tokio::test]
async fn test_direct_mode_only_when_persistence_disabled() {
    let h = harness(Options {
        persistent: false,
        ..Options::default()
    })
    .await;
    let session = h.ready_session("app").await;

    let result = h
        .service
        .execute_query(&session.id, &emit(THREE_ROWS), None, None, None)
        .await
        .unwrap();

    assert_eq!(rows(&result).len(), 3);
    assert_eq!(
        h.service.scheduler().engine_mode(&session.id).await,
        EngineMode::ColdFallback
    );
}

#[tokio::test]
async fn test_query_validation() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;
    let svc = &h.service;

    let forbidden = svc
        .execute_query(&session.id, "System.exit(0)", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(forbidden.kind(), ErrorKind::ValidationError);

    let zero_limit = svc.execute_query(&session.id, &emit("[]"), None, Some(0), None).await;
    assert_eq!(zero_limit.unwrap_err().kind(), ErrorKind::ValidationError);

    let long_timeout = svc.submit_query(&session.id, &emit("[]"), Some(301), None, None).await;
    assert_eq!(long_timeout.unwrap_err().kind(), ErrorKind::ValidationError);

    let unknown = svc.execute_query("missing", &emit("[]"), None, None, None).await;
    assert_eq!(unknown.unwrap_err().kind(), ErrorKind::NotFound);

    assert!(svc.list_jobs(None).is_empty());
}

#[tokio::test]
async fn test_query_touches_session() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.service
        .execute_query(&session.id, &emit("[]"), None, None, None)
        .await
        .unwrap();

    let after = h.service.get_session(&session.id).unwrap();
    assert!(after.last_accessed_at > session.last_accessed_at);
    assert_eq!(after.status, SessionStatus::Ready);
}
