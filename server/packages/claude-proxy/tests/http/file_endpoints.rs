// Session file upload and download endpoints.
include!("../common/http.rs");

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

async fn upload(app: &Router, session_id: &str, filename: &str, content: &[u8]) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        "/files/upload",
        Some(json!({
            "session_id": session_id,
            "filename": filename,
            "content_base64": STANDARD.encode(content),
        })),
    )
    .await
}

async fn download(app: &Router, session_id: &str, file_path: &str) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        "/files/download",
        Some(json!({ "session_id": session_id, "file_path": file_path })),
    )
    .await
}

fn decoded(body: &Value) -> Vec<u8> {
    STANDARD
        .decode(body["content_base64"].as_str().expect("content_base64"))
        .expect("valid base64")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_never_overwrites() {
    let app = TestApp::new();
    let uploads = app.session_root("s1").join(".files");

    let mut names = Vec::new();
    for content in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
        let (status, body) = upload(&app.app, "s1", "report.md", content).await;
        assert_eq!(status, StatusCode::OK, "upload: {body}");
        assert_eq!(body["ok"], true);
        let name = body["filename"].as_str().expect("filename").to_string();
        assert_eq!(body["file_path"], uploads.join(&name).display().to_string());
        names.push(name);
    }
    assert_eq!(names, ["report.md", "report_1.md", "report_2.md"]);
    assert_eq!(read_file(&uploads.join("report.md")), b"one");
    assert_eq!(read_file(&uploads.join("report_2.md")), b"three");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_sanitizes_names_and_scopes_by_bot() {
    let app = TestApp::new();
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/files/upload",
        Some(json!({
            "bot_id": "b1",
            "session_id": "chan",
            "filename": "../../my notes.txt",
            "content_base64": STANDARD.encode("hi"),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filename"], "my_notes.txt");
    let expected = app.bot_root("b1", "chan").join(".files/my_notes.txt");
    assert_eq!(body["file_path"], expected.display().to_string());
    assert_eq!(read_file(&expected), b"hi");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_accepts_raw_body_with_headers() {
    let app = TestApp::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/upload")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("x-session-id", "s1")
        .header("x-filename", "image.png")
        .body(Body::from(vec![0u8, 1, 2, 3]))
        .expect("request");
    let (status, _headers, bytes) = send_request(&app.app, request).await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_body(&bytes);
    assert_eq!(body["filename"], "image.png");
    assert_eq!(
        read_file(&app.session_root("s1").join(".files/image.png")),
        [0u8, 1, 2, 3]
    );

    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/upload")
        .header("x-session-id", "s1")
        .header("x-filename", "empty.bin")
        .body(Body::empty())
        .expect("request");
    let (status, _headers, bytes) = send_request(&app.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_body(&bytes)["detail"], "invalid request: empty file content");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_rejects_invalid_requests() {
    let app = TestApp::new();

    let (status, body) = send_raw(&app.app, "/files/upload", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "invalid request: empty request body");

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/files/upload",
        Some(json!({ "session_id": "s1", "content_base64": STANDARD.encode("x") })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "invalid request: filename is required");

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/files/upload",
        Some(json!({ "session_id": "s1", "filename": "a.txt" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "invalid request: content_base64 is required");

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/files/upload",
        Some(json!({ "session_id": "s1", "filename": "a.txt", "content_base64": "!!notbase64" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, status, "invalid_request");
    assert!(body["detail"]
        .as_str()
        .unwrap_or_default()
        .starts_with("invalid request: invalid base64 content"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_uploads_leave_no_trace() {
    let app = TestApp::with_config(|config| config.max_file_bytes = 4);

    let (status, _body) = upload(&app.app, "too-big", "a.bin", &[1u8; 5]).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!app.session_root("too-big").exists());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/upload")
        .header("x-session-id", "raw-empty")
        .header("x-filename", "a.bin")
        .body(Body::empty())
        .expect("request");
    let (status, _headers, _bytes) = send_request(&app.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!app.session_root("raw-empty").exists());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/files/upload")
        .header("x-session-id", "raw-big")
        .header("x-filename", "a.bin")
        .body(Body::from(vec![1u8; 5]))
        .expect("request");
    let (status, _headers, _bytes) = send_request(&app.app, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!app.session_root("raw-big").exists());

    let (status, _body) = send_json(
        &app.app,
        Method::POST,
        "/files/upload",
        Some(json!({ "session_id": "no-name", "content_base64": STANDARD.encode("x") })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!app.workdir().join("sessions").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn size_limit_matches_for_upload_and_download() {
    let app = TestApp::with_config(|config| config.max_file_bytes = 8);

    let (status, _body) = upload(&app.app, "s1", "exact.bin", &[1u8; 8]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = upload(&app.app, "s1", "over.bin", &[1u8; 9]).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_problem(&body, status, "payload_too_large");
    assert!(!app.session_root("s1").join(".files/over.bin").exists());

    let (status, body) = download(&app.app, "s1", ".files/exact.bin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["size"], 8);
    assert_eq!(decoded(&body), [1u8; 8]);

    std::fs::write(app.session_root("s1").join("big.bin"), [1u8; 9]).expect("write");
    let (status, body) = download(&app.app, "s1", "big.bin").await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_problem(&body, status, "payload_too_large");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_resolves_path_forms() {
    let app = TestApp::new();
    let (status, _body) = upload(&app.app, "s1", "a.png", b"png-bytes").await;
    assert_eq!(status, StatusCode::OK);
    let root = app.session_root("s1");
    let expected_path = root.join(".files/a.png").display().to_string();

    let absolute = expected_path.clone();
    let uri = format!("file://{absolute}");
    let localhost_uri = format!("file://localhost{absolute}");
    for form in [
        ".files/a.png",
        "./.files/../.files/a.png",
        absolute.as_str(),
        "/.files/a.png",
        uri.as_str(),
        localhost_uri.as_str(),
        "file://.files/a.png",
    ] {
        let (status, body) = download(&app.app, "s1", form).await;
        assert_eq!(status, StatusCode::OK, "form {form}: {body}");
        assert_eq!(body["ok"], true);
        assert_eq!(body["filename"], "a.png");
        assert_eq!(body["file_path"], expected_path);
        assert_eq!(body["size"], 9);
        assert_eq!(decoded(&body), b"png-bytes");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_rejects_paths_outside_session() {
    let app = TestApp::new();
    let (status, _body) = upload(&app.app, "other", "secret.txt", b"secret").await;
    assert_eq!(status, StatusCode::OK);
    let other_file = app.session_root("other").join(".files/secret.txt");

    let other_abs = other_file.display().to_string();
    for form in [
        "/etc/passwd",
        "../../etc/passwd",
        "../other/.files/secret.txt",
        other_abs.as_str(),
    ] {
        let (status, body) = download(&app.app, "s1", form).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "form {form}: {body}");
        assert_problem(&body, status, "path_out_of_scope");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_sandbox_cannot_reach_bot_sandbox() {
    let app = TestApp::new();
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/files/upload",
        Some(json!({
            "bot_id": "acme",
            "session_id": "chan",
            "filename": "private.txt",
            "content_base64": STANDARD.encode("BOT-PRIVATE"),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "upload: {body}");
    let private = body["file_path"].as_str().expect("file_path").to_string();

    for form in ["chan/.files/private.txt", "../../bots/acme/chan/.files/private.txt", private.as_str()] {
        let (status, body) = download(&app.app, "acme", form).await;
        assert_ne!(status, StatusCode::OK, "form {form}: {body}");
    }

    let (status, _body) = upload(&app.app, "acme", "mine.txt", b"mine").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/files/download",
        Some(json!({ "bot_id": "acme", "session_id": ".files", "file_path": "mine.txt" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_reports_missing_files() {
    let app = TestApp::new();

    let (status, body) = download(&app.app, "s1", "missing.txt").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_problem(&body, status, "file_not_found");

    let (status, body) = download(&app.app, "s1", ".files").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_problem(&body, status, "file_not_found");

    let (status, body) = download(&app.app, "s1", "  ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "invalid request: file_path is required");

    let (status, body) = send_raw(&app.app, "/files/download", "[]").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_problem(&body, status, "invalid_request");
}
