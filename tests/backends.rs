use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use call_speaker::config::{LlmConfig, TtsConfig};
use call_speaker::{BackendError, BackendRegistry, PipelineError, Role, Turn};
use serde_json::{json, Value};

#[derive(Default)]
struct Captured {
    headers: Vec<HeaderMap>,
    bodies: Vec<Value>,
    queries: Vec<HashMap<String, String>>,
    voices: Vec<String>,
}

type Shared = Arc<Mutex<Captured>>;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn messages() -> Vec<Turn> {
    vec![
        Turn::new(Role::User, "Do you have AirPods?"),
        Turn::new(Role::Assistant, "We do.•"),
        Turn::new(Role::User, "How much?"),
    ]
}

fn claude_config(base: &str) -> LlmConfig {
    LlmConfig {
        provider: "claude".into(),
        api_url: format!("{base}/v1/messages"),
        api_key: Some("test-key".into()),
        timeout_secs: 5,
        ..LlmConfig::default()
    }
}

fn elevenlabs_config(base: &str) -> TtsConfig {
    TtsConfig {
        api_url: base.to_string(),
        api_key: Some("xi-test".into()),
        voice_id: Some("voice-123".into()),
        timeout_secs: 5,
        ..TtsConfig::default()
    }
}

#[tokio::test]
async fn claude_sends_headers_and_joins_text_blocks() {
    let captured = Shared::default();
    let app = Router::new()
        .route(
            "/v1/messages",
            post(|State(c): State<Shared>, headers: HeaderMap, Json(body): Json<Value>| async move {
                let mut c = c.lock().unwrap();
                c.headers.push(headers);
                c.bodies.push(body);
                Json(json!({
                    "content": [
                        {"type": "text", "text": "They are $249.•"},
                        {"type": "text", "text": " Want a pair?•"}
                    ]
                }))
            }),
        )
        .with_state(captured.clone());
    let base = serve(app).await;

    let backend = BackendRegistry::with_defaults().build_llm(&claude_config(&base)).unwrap();
    let reply = backend.generate(&messages(), "Be brief.").await.unwrap();
    assert_eq!(reply, "They are $249.• Want a pair?•");

    let c = captured.lock().unwrap();
    assert_eq!(c.headers[0]["x-api-key"], "test-key");
    assert_eq!(c.headers[0]["anthropic-version"], "2023-06-01");
    let body = &c.bodies[0];
    assert_eq!(body["system"], "Be brief.");
    assert_eq!(body["model"], "claude-3-haiku-20240307");
    assert_eq!(body["messages"].as_array().unwrap().len(), 3);
    assert_eq!(body["messages"][1]["role"], "assistant");
}

#[tokio::test]
async fn claude_overload_is_rejected_by_provider() {
    let app = Router::new().route(
        "/v1/messages",
        post(|| async { (StatusCode::from_u16(529).unwrap(), "overloaded") }),
    );
    let base = serve(app).await;

    let backend = BackendRegistry::with_defaults().build_llm(&claude_config(&base)).unwrap();
    match backend.generate(&messages(), "").await {
        Err(BackendError::RejectedByProvider { status, body }) => {
            assert_eq!(status, 529);
            assert_eq!(body, "overloaded");
        }
        other => panic!("expected RejectedByProvider, got {other:?}"),
    }
}

#[tokio::test]
async fn claude_reply_without_content_is_malformed() {
    let app = Router::new().route("/v1/messages", post(|| async { Json(json!({"id": "msg_1"})) }));
    let base = serve(app).await;

    let backend = BackendRegistry::with_defaults().build_llm(&claude_config(&base)).unwrap();
    assert!(matches!(
        backend.generate(&messages(), "").await,
        Err(BackendError::MalformedPayload(_))
    ));
}

#[tokio::test]
async fn ollama_prepends_system_message_and_trims_reply() {
    let captured = Shared::default();
    let app = Router::new()
        .route(
            "/api/chat",
            post(|State(c): State<Shared>, Json(body): Json<Value>| async move {
                c.lock().unwrap().bodies.push(body);
                Json(json!({"message": {"role": "assistant", "content": "  Sure thing.•\n"}}))
            }),
        )
        .with_state(captured.clone());
    let base = serve(app).await;

    let config = LlmConfig {
        provider: "ollama".into(),
        model: "llama3".into(),
        api_url: format!("{base}/"),
        timeout_secs: 5,
        ..LlmConfig::default()
    };
    let backend = BackendRegistry::with_defaults().build_llm(&config).unwrap();
    assert_eq!(backend.generate(&messages(), "Be brief.").await.unwrap(), "Sure thing.•");

    let c = captured.lock().unwrap();
    let chat = c.bodies[0]["messages"].as_array().unwrap();
    assert_eq!(chat.len(), 4);
    assert_eq!(chat[0], json!({"role": "system", "content": "Be brief."}));
    assert_eq!(c.bodies[0]["stream"], false);
}

#[tokio::test]
async fn elevenlabs_posts_to_voice_stream_and_returns_bytes() {
    let captured = Shared::default();
    let app = Router::new()
        .route(
            "/{voice_id}/stream",
            post(
                |State(c): State<Shared>,
                 Path(voice_id): Path<String>,
                 Query(query): Query<HashMap<String, String>>,
                 headers: HeaderMap,
                 Json(body): Json<Value>| async move {
                    let mut c = c.lock().unwrap();
                    c.voices.push(voice_id);
                    c.queries.push(query);
                    c.headers.push(headers);
                    c.bodies.push(body);
                    vec![0xffu8, 0x7f, 0x00, 0x80]
                },
            ),
        )
        .with_state(captured.clone());
    let base = serve(app).await;

    let backend = BackendRegistry::with_defaults().build_tts(&elevenlabs_config(&base)).unwrap();
    let audio = backend.synthesize("How can I help?").await.unwrap();
    assert_eq!(audio, vec![0xff, 0x7f, 0x00, 0x80]);

    let c = captured.lock().unwrap();
    assert_eq!(c.voices, vec!["voice-123"]);
    assert_eq!(c.queries[0]["output_format"], "ulaw_8000");
    assert_eq!(c.queries[0]["optimize_streaming_latency"], "3");
    assert_eq!(c.headers[0]["xi-api-key"], "xi-test");
    assert_eq!(c.bodies[0]["text"], "How can I help?");
    assert_eq!(c.bodies[0]["model_id"], "eleven_monolingual_v1");
}

#[tokio::test]
async fn missing_voice_id_fails_at_construction() {
    let config = TtsConfig {
        api_key: Some("xi-test".into()),
        voice_id: None,
        voice_id_env: "CALL_SPEAKER_TEST_UNSET_VOICE".into(),
        ..TtsConfig::default()
    };
    assert!(matches!(
        BackendRegistry::with_defaults().build_tts(&config),
        Err(PipelineError::Config(_))
    ));
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    // Bind then drop to get a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = BackendRegistry::with_defaults()
        .build_tts(&elevenlabs_config(&format!("http://{addr}")))
        .unwrap();
    assert!(matches!(
        backend.synthesize("Hello").await,
        Err(BackendError::Unreachable(_))
    ));
}

#[test]
fn unknown_tts_backend_is_reported() {
    let config = TtsConfig {
        provider: "polly".into(),
        ..TtsConfig::default()
    };
    match BackendRegistry::with_defaults().build_tts(&config) {
        Err(PipelineError::UnknownBackend { name, .. }) => assert_eq!(name, "polly"),
        Err(other) => panic!("expected UnknownBackend, got {other:?}"),
        Ok(_) => panic!("expected UnknownBackend"),
    }
}
