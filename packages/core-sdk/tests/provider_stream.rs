//! 适配器层的流式对齐测试：用 wiremock 模拟各上游的 SSE 响应。

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use storyloom_core_sdk::error::AiError;
use storyloom_core_sdk::models::{ApiKey, ChatConfig, ChatMessage, KeyStatus, StreamChunk};
use storyloom_core_sdk::providers::AiProvider;

fn test_key(provider: &str, base_url: &str) -> ApiKey {
    ApiKey {
        id: 1,
        user_id: 1,
        provider: provider.to_string(),
        name: "test".to_string(),
        api_key: "sk-test".to_string(),
        base_url: base_url.to_string(),
        default_model: "test-model".to_string(),
        status: KeyStatus::Enabled,
        calls: 0,
    }
}

fn test_config(model: &str) -> ChatConfig {
    ChatConfig {
        model: model.to_string(),
        temperature: 0.7,
        max_tokens: 256,
        stream: true,
    }
}

fn user_message(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage {
        role: "user".to_string(),
        content: content.to_string(),
    }]
}

async fn collect_chunks(mut rx: tokio::sync::mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.push(chunk);
    }
    out
}

fn openai_sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n\n",
            fragment
        ));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn openai_stream_preserves_fragment_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(openai_sse_body(&["Hel", "lo ", "世界"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let key = test_key("openai", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let rx = provider
        .stream_chat(CancellationToken::new(), &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 4);
    let text: String = chunks[..3].iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, "Hello 世界");
    assert_eq!(chunks[0].content, "Hel");
    assert_eq!(chunks[1].content, "lo ");
    assert_eq!(chunks[2].content, "世界");
    let last = &chunks[3];
    assert!(last.done);
    assert!(last.error.is_none());
    assert!(last.content.is_empty());
}

#[tokio::test]
async fn openai_upstream_error_fails_before_any_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let key = test_key("openai", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let err = provider
        .stream_chat(CancellationToken::new(), &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect_err("expected upstream failure");

    match err {
        AiError::UpstreamStatus { status, ref body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "invalid api key");
        }
        other => panic!("expected UpstreamStatus, got {:?}", other),
    }
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("invalid api key"));
}

#[tokio::test]
async fn openai_stream_skips_malformed_data_lines() {
    let server = MockServer::start().await;
    let body = "data: {not json\n\n\
                data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n\
                data: also not json\n\n\
                data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let key = test_key("openai", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let rx = provider
        .stream_chat(CancellationToken::new(), &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].content, "ok");
    assert!(chunks[1].done);
    assert!(chunks[1].error.is_none());
}

#[tokio::test]
async fn openai_stream_without_done_sentinel_still_terminates_cleanly() {
    // 上游提前断流：EOF 后必须收到恰好一个终止块
    let server = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let key = test_key("openai", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let rx = provider
        .stream_chat(CancellationToken::new(), &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].content, "half");
    assert!(chunks[1].done);
}

#[tokio::test]
async fn openai_stream_aborts_after_malformed_line_threshold() {
    let server = MockServer::start().await;
    let mut body = String::from("data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n");
    for i in 0..33 {
        body.push_str(&format!("data: {{garbage-{}\n\n", i));
    }
    // 超限之后的内容不得再被转发
    body.push_str("data: {\"choices\":[{\"delta\":{\"content\":\"after\"}}]}\n\n");
    body.push_str("data: [DONE]\n\n");
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let key = test_key("openai", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let rx = provider
        .stream_chat(CancellationToken::new(), &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].content, "ok");
    assert!(chunks[1].done);
    assert_eq!(
        chunks[1].error.as_deref(),
        Some("too many malformed stream events from provider")
    );
}

#[tokio::test]
async fn mid_stream_disconnect_yields_chunk_then_single_error_terminal() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // wiremock 无法截断响应体；裸 TCP 先发一帧再在 chunked 体中途断开
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 8192];
        let _ = socket.read(&mut buf).await;

        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
            frame.len(),
            frame
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write partial response");
        socket.flush().await.expect("flush");
        // 不发 0\r\n\r\n 终止块，直接断开连接
    });

    let key = test_key("openai", &format!("http://{}/v1", addr));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let rx = provider
        .stream_chat(CancellationToken::new(), &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].content, "partial");
    assert!(!chunks[0].done);
    let last = &chunks[1];
    assert!(last.done);
    assert!(last
        .error
        .as_deref()
        .map(|e| e.starts_with("stream reading error"))
        .unwrap_or(false));
}

#[tokio::test]
async fn cancelled_token_terminates_stream_with_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(openai_sse_body(&["never", "seen"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let key = test_key("openai", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let token = CancellationToken::new();
    token.cancel();
    let rx = provider
        .stream_chat(token, &user_message("hi"), &test_config("gpt-4o"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].done);
    assert_eq!(
        chunks[0].error.as_deref(),
        Some("stream cancelled by client")
    );
}

#[tokio::test]
async fn claude_request_promotes_leading_system_message() {
    let server = MockServer::start().await;
    let body = "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"嗯\"}}\n\n\
                data: {\"type\":\"message_stop\"}\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let key = test_key("claude", &format!("{}/v1", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let messages = vec![
        ChatMessage {
            role: "system".to_string(),
            content: "你是写作助手".to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: "续写".to_string(),
        },
    ];
    let rx = provider
        .stream_chat(CancellationToken::new(), &messages, &test_config("claude-sonnet-4"))
        .await
        .expect("open stream");
    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks[0].content, "嗯");
    assert!(chunks.last().map(|c| c.done).unwrap_or(false));

    let requests = server.received_requests().await.expect("recorded requests");
    assert_eq!(requests.len(), 1);
    let sent: serde_json::Value =
        serde_json::from_slice(&requests[0].body).expect("request body json");
    assert_eq!(sent["system"], "你是写作助手");
    assert_eq!(sent["messages"].as_array().map(|m| m.len()), Some(1));
    assert_eq!(sent["messages"][0]["role"], "user");
    assert_eq!(sent["stream"], true);
}

#[tokio::test]
async fn gemini_request_uses_sse_query_and_maps_roles() {
    let server = MockServer::start().await;
    let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"山\"},{\"text\":\"海\"}]}}]}\n\n";
    Mock::given(method("POST"))
        .and(path("/models/gemini-pro:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .and(query_param("key", "sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let key = test_key("gemini", &format!("{}/models", server.uri()));
    let provider = AiProvider::from_api_key(&key).expect("build provider");
    let messages = vec![
        ChatMessage {
            role: "user".to_string(),
            content: "续写".to_string(),
        },
        ChatMessage {
            role: "assistant".to_string(),
            content: "从前".to_string(),
        },
    ];
    let rx = provider
        .stream_chat(CancellationToken::new(), &messages, &test_config("gemini-pro"))
        .await
        .expect("open stream");

    let chunks = collect_chunks(rx).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].content, "山海");
    assert!(chunks[1].done);
    assert!(chunks[1].error.is_none());

    let requests = server.received_requests().await.expect("recorded requests");
    let sent: serde_json::Value =
        serde_json::from_slice(&requests[0].body).expect("request body json");
    assert_eq!(sent["contents"][0]["role"], "user");
    assert_eq!(sent["contents"][1]["role"], "model");
    assert_eq!(sent["generationConfig"]["maxOutputTokens"], 256);
}
