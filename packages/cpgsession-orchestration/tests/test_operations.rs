//! JSON-lines request boundary

mod common;

use std::time::Duration;

use common::{emit, harness, Options};
use cpgsession_orchestration::operations::{handle, handle_line, Request};
use serde_json::{json, Value};

#[tokio::test]
async fn test_session_and_query_over_json_lines() {
    let h = harness(Options::default()).await;
    let src = h.source_dir("app");

    let line = json!({
        "id": 1,
        "op": "create_session",
        "source_kind": "local",
        "location": src,
        "language": "python",
        "options": {"metadata": {"team": "appsec"}}
    })
    .to_string();
    let created = handle_line(&h.service, &line).await;
    assert!(created.ok, "{:?}", created.error);
    assert_eq!(created.id, Some(json!(1)));
    let data = created.data.unwrap();
    assert_eq!(data["status"], "CREATING");
    assert_eq!(data["metadata"]["team"], "appsec");
    let session_id = data["id"].as_str().unwrap().to_string();

    h.service
        .wait_until_settled(&session_id, Duration::from_secs(15))
        .await
        .unwrap();

    let query = handle(
        &h.service,
        Request::ExecuteQuery {
            session_id: session_id.clone(),
            query: emit(r#"[{"a":1},{"a":2}]"#),
            timeout_seconds: None,
            limit: None,
            offset: None,
        },
    )
    .await;
    let result = query.data.unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["row_count"], 2);

    let listed = handle_line(&h.service, r#"{"op":"list_sessions","status":"ready"}"#).await;
    assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);

    let closed = handle(
        &h.service,
        Request::CloseSession {
            session_id: session_id.clone(),
        },
    )
    .await;
    assert_eq!(closed.data.unwrap()["status"], "CLOSED");
}

#[tokio::test]
async fn test_async_job_over_json_lines() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let submit = handle(
        &h.service,
        Request::SubmitQuery {
            session_id: session.id.clone(),
            query: emit(r#"[{"x":1}]"#),
            timeout_seconds: Some(10),
            limit: Some(5),
            offset: None,
        },
    )
    .await;
    let job_id = submit.data.unwrap()["job_id"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..200 {
        let poll = handle(&h.service, Request::QueryStatus { job_id: job_id.clone() }).await;
        status = poll.data.unwrap()["status"].clone();
        if status == "COMPLETED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, "COMPLETED");

    let fetched = handle(&h.service, Request::QueryResult { job_id }).await;
    assert_eq!(fetched.data.unwrap()["data"], json!([{"x": 1}]));
}

#[tokio::test]
async fn test_errors_carry_machine_readable_kind() {
    let h = harness(Options::default()).await;

    let cases = [
        (r#"{"op":"get_session","session_id":"nope"}"#, "not_found"),
        (r#"{"op":"fly_to_moon"}"#, "validation_error"),
        ("{not json", "validation_error"),
        (
            r#"{"op":"create_session","source_kind":"svn","location":"/x","language":"java"}"#,
            "validation_error",
        ),
        (
            r#"{"op":"create_session","source_kind":"local","location":"relative","language":"java"}"#,
            "validation_error",
        ),
        (r#"{"op":"query_result","job_id":"nope"}"#, "not_found"),
    ];

    for (line, kind) in cases {
        let response = handle_line(&h.service, line).await;
        assert!(!response.ok, "{}", line);
        let error = response.error.unwrap();
        assert_eq!(serde_json::to_value(error.kind).unwrap(), kind, "{}", line);
    }
    assert!(h.service.list_sessions(None, None).is_empty());
}

#[tokio::test]
async fn test_templated_operations_share_query_checks() {
    let h = harness(Options::default()).await;
    let session = h.ready_session("app").await;

    let cases = [
        (
            json!({"op": "list_methods", "session_id": session.id, "limit": 0}),
            "validation_error",
        ),
        (
            json!({"op": "list_calls", "session_id": session.id, "offset": 5_000_000}),
            "validation_error",
        ),
        (
            json!({"op": "get_method_source", "session_id": session.id, "method_name": "  "}),
            "validation_error",
        ),
        (
            json!({"op": "find_taint_sources", "session_id": "missing"}),
            "not_found",
        ),
    ];

    for (request, kind) in cases {
        let response = handle_line(&h.service, &request.to_string()).await;
        assert!(!response.ok, "{}", request);
        let error = response.error.unwrap();
        assert_eq!(serde_json::to_value(error.kind).unwrap(), kind, "{}", request);
    }
}
