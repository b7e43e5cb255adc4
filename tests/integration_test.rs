use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ollama_openai_proxy::translate::response::estimate_tokens;
use ollama_openai_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{any, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "sk-test-key";

fn app_for(server: &MockServer, api_key: Option<&str>) -> Router {
    let mut config = ProxyConfig::default();
    config.backend.base_url = server.uri();
    config.backend.timeout_secs = 5;
    config.stream.send_timeout_secs = 5;

    let state = AppState::new(
        &config,
        api_key.map(str::to_string),
        SharedLogger::in_memory(),
    )
    .unwrap();
    build_router(Arc::new(state))
}

fn post(uri: &str, body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, String, Option<String>) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap(), content_type)
}

fn parse(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

fn chat_line(content: &str, done: bool) -> String {
    json!({
        "model": "llama3.2:latest",
        "created_at": "2024-01-01T00:00:00Z",
        "message": {"role": "assistant", "content": content},
        "done": done
    })
    .to_string()
}

/// Split an SSE body into its `data:` payloads.
fn sse_payloads(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .filter(|f| !f.is_empty())
        .map(|f| f.strip_prefix("data: ").expect("frame must start with data: "))
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Chat completions
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_non_streaming_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "x",
            "stream": false,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "x",
            "created_at": "2024-01-01T00:00:00Z",
            "message": {"role": "assistant", "content": "hello"},
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(&server, None);
    let (status, body, _) = send(
        app,
        post(
            "/v1/chat/completions",
            json!({"model": "x", "messages": [{"role": "user", "content": "hi"}], "stream": false})
                .to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let resp = parse(&body);
    assert_eq!(resp["object"], "chat.completion");
    assert_eq!(resp["model"], "x");
    assert_eq!(resp["choices"].as_array().unwrap().len(), 1);
    assert_eq!(resp["choices"][0]["finish_reason"], "stop");
    assert_eq!(resp["choices"][0]["message"]["content"], "hello");
    assert_eq!(
        resp["usage"]["total_tokens"],
        estimate_tokens("user: hi\n") + estimate_tokens("hello")
    );
}

#[tokio::test]
async fn test_structured_content_and_options_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "messages": [{"role": "user", "content": "look here"}],
            "options": {"temperature": 0.0, "num_predict": 32, "stop": ["a", "b"]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"role": "assistant", "content": "ok"},
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(&server, None);
    let (status, _, _) = send(
        app,
        post(
            "/v1/chat/completions",
            json!({
                "model": "x",
                "messages": [{"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "http://img"}},
                    {"type": "text", "text": "here"}
                ]}],
                "temperature": 0,
                "max_tokens": 32,
                "stop": ["a", 5, "b"]
            })
            .to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_json_never_reaches_backend() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let app = app_for(&server, None);
    let (status, body, _) = send(app, post("/v1/chat/completions", "{not json")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err = parse(&body);
    assert_eq!(err["error"]["type"], "invalid_request_error");
    assert_eq!(err["error"]["code"], "invalid_json");
}

#[tokio::test]
async fn test_missing_fields() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse(&body)["error"]["code"], "missing_model");

    let (status, body, _) = send(
        app_for(&server, None),
        post("/v1/chat/completions", json!({"model": "x", "messages": []}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse(&body)["error"]["code"], "missing_messages");

    let (status, body, _) = send(
        app_for(&server, None),
        post("/v1/completions", json!({"model": "x"}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse(&body)["error"]["code"], "missing_prompt");
}

#[tokio::test]
async fn test_null_fields_read_as_missing() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let cases = [
        (
            "/v1/chat/completions",
            json!({"model": null, "messages": [{"role": "user", "content": "hi"}]}),
            "missing_model",
        ),
        (
            "/v1/chat/completions",
            json!({"model": "x", "messages": null}),
            "missing_messages",
        ),
        ("/v1/completions", json!({"model": null, "prompt": "hi"}), "missing_model"),
        ("/v1/completions", json!({"model": "x", "prompt": null}), "missing_prompt"),
    ];

    for (uri, body, code) in cases {
        let (status, body, _) = send(app_for(&server, None), post(uri, body.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} {code}");
        assert_eq!(parse(&body)["error"]["code"], code);
    }
}

#[tokio::test]
async fn test_message_without_role_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"messages": [{"role": "", "content": "hi"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "x",
            "message": {"role": "assistant", "content": "hello"},
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post(
            "/v1/chat/completions",
            json!({"model": "x", "messages": [{"content": "hi"}]}).to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["choices"][0]["message"]["content"], "hello");
}

#[tokio::test]
async fn test_backend_error_is_not_leaked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(503).set_body_string("model runtime exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post(
            "/v1/chat/completions",
            json!({"model": "x", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let err = parse(&body);
    assert_eq!(err["error"]["type"], "internal_error");
    assert_eq!(err["error"]["code"], "ollama_error");
    assert!(!body.contains("model runtime exploded"));
}

#[tokio::test]
async fn test_chat_streaming() {
    let server = MockServer::start().await;
    let ndjson = [
        chat_line("Hel", false),
        String::new(),
        "garbage".to_string(),
        chat_line("lo", false),
        chat_line("", true),
        chat_line("after done", false),
    ]
    .join("\n");

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, content_type) = send(
        app_for(&server, None),
        post(
            "/v1/chat/completions",
            json!({"model": "x", "messages": [{"role": "user", "content": "hi"}], "stream": true})
                .to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));
    assert!(body.ends_with("data: [DONE]\n\n"));
    assert!(!body.contains("after done"));

    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 4);
    assert_eq!(payloads[3], "[DONE]");

    let chunks: Vec<Value> = payloads[..3].iter().map(|p| parse(p)).collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "lo");
    assert!(chunks[0]["choices"][0]["finish_reason"].is_null());
    assert!(chunks[1]["choices"][0]["finish_reason"].is_null());
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");

    for chunk in &chunks {
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "x");
        assert_eq!(chunk["id"], chunks[0]["id"]);
        assert_eq!(chunk["created"], chunks[0]["created"]);
    }
}

#[tokio::test]
async fn test_chat_stream_error_line_ends_without_sentinel() {
    let server = MockServer::start().await;
    let ndjson = [
        chat_line("Hel", false),
        json!({"error": "model runner crashed"}).to_string(),
        chat_line("", true),
    ]
    .join("\n");

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post(
            "/v1/chat/completions",
            json!({"model": "x", "messages": [{"role": "user", "content": "hi"}], "stream": true})
                .to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 1);
    assert_eq!(parse(payloads[0])["choices"][0]["delta"]["content"], "Hel");
    assert!(!body.contains("[DONE]"));
    assert!(!body.contains("model runner crashed"));
}

#[tokio::test]
async fn test_streaming_setup_failure_is_a_json_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("no such model"))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, content_type) = send(
        app_for(&server, None),
        post(
            "/v1/chat/completions",
            json!({"model": "x", "messages": [{"role": "user", "content": "hi"}], "stream": true})
                .to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert_eq!(parse(&body)["error"]["code"], "ollama_stream_error");
    assert!(!body.contains("no such model"));
}

// ────────────────────────────────────────────────────────────────
// Text completions
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_completion_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "codellama",
            "prompt": "line one\nline two",
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "codellama",
            "created_at": "2024-01-01T00:00:00Z",
            "response": "line three",
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post(
            "/v1/completions",
            json!({"model": "codellama", "prompt": ["line one", "line two"]}).to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let resp = parse(&body);
    assert_eq!(resp["object"], "text_completion");
    assert_eq!(resp["model"], "codellama");
    assert_eq!(resp["choices"][0]["text"], "line three");
    assert_eq!(resp["choices"][0]["finish_reason"], "stop");
    assert!(resp["choices"][0]["logprobs"].is_null());
    assert_eq!(
        resp["usage"]["prompt_tokens"],
        estimate_tokens("line one\nline two")
    );
}

#[tokio::test]
async fn test_unsupported_prompt_is_rejected_locally() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post("/v1/completions", json!({"model": "x", "prompt": [1, 2, 3]}).to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err = parse(&body);
    assert_eq!(err["error"]["type"], "invalid_request_error");
    assert_eq!(err["error"]["code"], "invalid_prompt");
}

#[tokio::test]
async fn test_completion_streaming() {
    let server = MockServer::start().await;
    let ndjson = [
        json!({"model": "m", "response": "foo", "done": false}).to_string(),
        json!({"model": "m", "response": "bar", "done": false}).to_string(),
        json!({"model": "m", "response": "", "done": true}).to_string(),
    ]
    .join("\n");

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, _) = send(
        app_for(&server, None),
        post(
            "/v1/completions",
            json!({"model": "m", "prompt": "x", "stream": true}).to_string(),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let payloads = sse_payloads(&body);
    assert_eq!(payloads.len(), 4);
    let texts: Vec<Value> = payloads[..3]
        .iter()
        .map(|p| parse(p)["choices"][0]["text"].clone())
        .collect();
    assert_eq!(texts, vec![json!("foo"), json!("bar"), json!("")]);
    assert_eq!(parse(payloads[2])["choices"][0]["finish_reason"], "stop");
    assert_eq!(payloads[3], "[DONE]");
}

// ────────────────────────────────────────────────────────────────
// Models, health, auth
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_models_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "llama3.2:latest", "modified_at": "2024-05-01T10:00:00Z", "size": 1, "digest": "abc"},
                {"name": "mistral:7b", "modified_at": "2024-05-01T10:00:00Z", "size": 2, "digest": "def"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (status, body, _) = send(app_for(&server, None), get("/v1/models")).await;

    assert_eq!(status, StatusCode::OK);
    let list = parse(&body);
    assert_eq!(list["object"], "list");
    assert_eq!(list["data"][0]["id"], "llama3.2:latest");
    assert_eq!(list["data"][1]["id"], "mistral:7b");
    assert_eq!(list["data"][1]["object"], "model");
    assert_eq!(list["data"][1]["owned_by"], "ollama");
}

#[tokio::test]
async fn test_models_backend_down() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (status, body, _) = send(app_for(&server, None), get("/v1/models")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(parse(&body)["error"]["code"], "ollama_error");
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let server = MockServer::start().await;
    let (status, body, _) = send(app_for(&server, Some(API_KEY)), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["status"], "ok");
}

#[tokio::test]
async fn test_auth_rejections() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let cases = [
        (None, "missing_authorization"),
        (Some("Token sk-test-key"), "invalid_authorization_format"),
        (Some("Bearer wrong"), "invalid_api_key"),
    ];

    for (header, code) in cases {
        let mut builder = Request::builder().uri("/v1/models");
        if let Some(value) = header {
            builder = builder.header("authorization", value);
        }
        let (status, body, _) = send(
            app_for(&server, Some(API_KEY)),
            builder.body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED, "case {code}");
        assert_eq!(parse(&body)["error"]["code"], code);
    }
}

#[tokio::test]
async fn test_valid_key_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .expect(1)
        .mount(&server)
        .await;

    let req = Request::builder()
        .uri("/v1/models")
        .header("authorization", format!("Bearer {API_KEY}"))
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = send(app_for(&server, Some(API_KEY)), req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse(&body)["data"], json!([]));
}
