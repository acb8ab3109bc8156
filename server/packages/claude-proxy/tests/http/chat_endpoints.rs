// Agent execution endpoint.
include!("../common/http.rs");

use std::time::Instant;

fn proxy_errors(records: &[Value]) -> Vec<&Value> {
    records
        .iter()
        .filter(|record| record["type"] == "proxy_error")
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn meta_endpoints() {
    let app = TestApp::new();

    let (status, body) = send_json(&app.app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true }));

    let (status, body) = send_json(&app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap_or_default().contains("/chat"));

    let (status, body) = send_json(&app.app, Method::GET, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.as_str().unwrap_or_default().starts_with("404 Not Found"));

    let (status, body) = send_json(&app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/chat"]["post"].is_object());
    assert!(body["paths"]["/files/download"]["post"].is_object());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_streams_stdout_lines() {
    let app = TestApp::new();
    let (status, headers, records) = chat(
        &app.app,
        json!({
            "session_id": "s1",
            "prompt": r#"echo '{"type":"a"}'; echo; echo '{"type":"b"}'; echo noise >&2"#
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok()),
        Some("application/x-ndjson; charset=utf-8")
    );
    assert_eq!(
        headers.get(header::CACHE_CONTROL).and_then(|value| value.to_str().ok()),
        Some("no-cache")
    );
    assert_eq!(
        headers.get("x-accel-buffering").and_then(|value| value.to_str().ok()),
        Some("no")
    );
    assert_eq!(records, vec![json!({ "type": "a" }), json!({ "type": "b" })]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_runs_in_session_root_with_layout() {
    let app = TestApp::new();
    let (status, _headers, records) = chat(
        &app.app,
        json!({
            "session_id": "s1",
            "prompt": r#"printf '{"cwd":"%s"}\n' "$(pwd -P)""#
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let root = app.session_root("s1");
    assert_eq!(records, vec![json!({ "cwd": root.display().to_string() })]);
    assert!(root.join(".files").is_dir());
    assert!(root.join(".claude/skills").is_dir());
    let manifest = std::fs::read_to_string(root.join("CLAUDE.md")).expect("manifest");
    assert!(manifest.contains(&root.display().to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_identity_is_sanitized_and_scoped_by_bot() {
    let app = TestApp::new();
    let prompt = r#"printf '{"cwd":"%s"}\n' "$(pwd -P)""#;

    let (_, _, records) = chat(
        &app.app,
        json!({ "session_id": "../../escape", "prompt": prompt }),
    )
    .await;
    assert_eq!(
        records,
        vec![json!({ "cwd": app.session_root(".._.._escape").display().to_string() })]
    );

    let (_, _, records) = chat(
        &app.app,
        json!({ "bot_id": "bot 1", "session_id": "chan", "prompt": prompt }),
    )
    .await;
    assert_eq!(
        records,
        vec![json!({ "cwd": app.bot_root("bot_1", "chan").display().to_string() })]
    );

    let (_, _, records) = chat(
        &app.app,
        json!({ "session_id": "bot_1", "prompt": prompt }),
    )
    .await;
    assert_eq!(
        records,
        vec![json!({ "cwd": app.session_root("bot_1").display().to_string() })]
    );

    let (_, _, records) = chat(&app.app, json!({ "prompt": prompt })).await;
    assert_eq!(
        records,
        vec![json!({ "cwd": app.session_root("default").display().to_string() })]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_passes_continue_flag() {
    let app = TestApp::new();
    let prompt = r#"for arg; do [ "$arg" = "-c" ] && echo '{"continued":true}'; done; echo '{"done":true}'"#;

    let (_, _, records) = chat(&app.app, json!({ "prompt": prompt, "continue": "yes" })).await;
    assert_eq!(records, vec![json!({ "continued": true }), json!({ "done": true })]);

    let (_, _, records) = chat(&app.app, json!({ "prompt": prompt, "continue": 0 })).await;
    assert_eq!(records, vec![json!({ "done": true })]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_reports_non_zero_exit_in_band() {
    let app = TestApp::new();
    let (status, _headers, records) = chat(
        &app.app,
        json!({ "prompt": r#"echo '{"n":1}'; echo boom >&2; exit 3"# }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records.len(), 2, "records: {records:?}");
    assert_eq!(records[0], json!({ "n": 1 }));
    assert_eq!(records[1]["type"], "proxy_error");
    assert_eq!(records[1]["error"], "boom");
    assert!(!records[1]["request_id"].as_str().unwrap_or_default().is_empty());

    let (_, _, records) = chat(&app.app, json!({ "prompt": "exit 4" })).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["error"], "agent exited with code 4");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_timeout_kills_agent() {
    let app = TestApp::new();
    let started = Instant::now();
    let (status, _headers, records) = chat(
        &app.app,
        json!({
            "prompt": r#"echo '{"n":1}'; sleep 30; echo '{"n":2}'"#,
            "timeout_seconds": "1"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(records.len(), 2, "records: {records:?}");
    assert_eq!(records[0], json!({ "n": 1 }));
    let errors = proxy_errors(&records);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"], "agent execution timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_spawn_failure_is_in_band() {
    let app = TestApp::with_config(|config| {
        config.agent = AgentCommand::new("/nonexistent/claude-proxy-agent");
    });
    let (status, _headers, records) = chat(&app.app, json!({ "prompt": "hello" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["type"], "proxy_error");
    assert!(records[0]["error"]
        .as_str()
        .unwrap_or_default()
        .starts_with("failed to spawn agent /nonexistent/claude-proxy-agent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_rejects_invalid_requests() {
    let app = TestApp::new();

    let (status, body) = send_raw(&app.app, "/chat", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, status, "invalid_request");
    assert_eq!(body["detail"], "invalid request: empty request body");

    let (status, body) = send_raw(&app.app, "/chat", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]
        .as_str()
        .unwrap_or_default()
        .starts_with("invalid request: invalid JSON"));

    for payload in [json!({}), json!({ "prompt": "   " }), json!({ "prompt": null })] {
        let (status, body) = send_json(&app.app, Method::POST, "/chat", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "invalid request: prompt is required");
    }

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(json!({ "prompt": "echo hi", "timeout_seconds": "soon" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "invalid request: invalid timeout_seconds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_workspace_conflict_fails_before_streaming() {
    let app = TestApp::new();
    std::fs::create_dir_all(app.session_root("s1").join("CLAUDE.md")).expect("create dir");
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(json!({ "session_id": "s1", "prompt": "echo hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_problem(&body, status, "workspace_conflict");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_problem_shape_is_stable() {
    let app = TestApp::new();
    let (_, body) = send_json(&app.app, Method::POST, "/chat", Some(json!({}))).await;
    let sorted: std::collections::BTreeMap<String, Value> =
        serde_json::from_value(body).expect("problem object");
    insta::assert_snapshot!(serde_json::to_string(&sorted).expect("encode"), @r###"{"detail":"invalid request: prompt is required","status":400,"title":"Invalid Request","type":"urn:claude-proxy:error:invalid_request"}"###);
}
