use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    build_client, effective_base_url, pump_sse, upstream_error, ParsedLine, CHUNK_CHANNEL_CAPACITY,
};
use crate::error::AiError;
use crate::models::{ApiKey, ChatConfig, ChatMessage, ChatResponse, StreamChunk};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/** \brief 协议要求 max_tokens 必填；配置为 0 时的兜底值。 */
const FALLBACK_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Serialize)]
struct ClaudeRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ClaudeMessage<'a>>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClaudeStreamEvent {
    /** \brief 事件类型：content_block_delta / message_stop / 其他 */
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    delta: Option<ClaudeDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct ClaudeDelta {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

/**
 * \brief Anthropic Claude 协议适配器。
 */
#[derive(Debug)]
pub struct ClaudeAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl ClaudeAdapter {
    pub fn new(key: &ApiKey) -> Result<Self, AiError> {
        Ok(Self {
            api_key: key.api_key.clone(),
            base_url: effective_base_url(key, DEFAULT_BASE_URL),
            client: build_client()?,
        })
    }

    pub async fn chat(
        &self,
        _messages: &[ChatMessage],
        _config: &ChatConfig,
    ) -> Result<ChatResponse, AiError> {
        Err(AiError::NotImplemented("Claude"))
    }

    pub async fn stream_chat(
        &self,
        token: CancellationToken,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<mpsc::Receiver<StreamChunk>, AiError> {
        let (system, claude_messages) = prepare_messages(messages);
        let body = ClaudeRequest {
            model: &config.model,
            system,
            messages: claude_messages,
            stream: true,
            max_tokens: if config.max_tokens != 0 {
                config.max_tokens
            } else {
                FALLBACK_MAX_TOKENS
            },
            temperature: (config.temperature != 0.0).then_some(config.temperature),
        };

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(upstream_error(resp).await);
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(resp, token, tx, parse_data_line));
        Ok(rx)
    }
}

/**
 * \brief 首条 system 消息提升为顶层 system 字段，其余消息按位置透传。
 */
fn prepare_messages(messages: &[ChatMessage]) -> (Option<&str>, Vec<ClaudeMessage<'_>>) {
    let mut system = None;
    let mut out = Vec::new();
    for (idx, msg) in messages.iter().enumerate() {
        if idx == 0 && msg.role == "system" {
            system = Some(msg.content.as_str());
            continue;
        }
        out.push(ClaudeMessage {
            role: &msg.role,
            content: &msg.content,
        });
    }
    (system, out)
}

fn parse_data_line(data: &str) -> ParsedLine {
    let Ok(event) = serde_json::from_str::<ClaudeStreamEvent>(data) else {
        return ParsedLine::Invalid;
    };
    match event.kind.as_str() {
        "content_block_delta" => match event.delta {
            Some(delta) if delta.kind == "text_delta" => ParsedLine::Text(delta.text),
            _ => ParsedLine::Ignore,
        },
        "message_stop" => ParsedLine::Stop,
        _ => ParsedLine::Ignore,
    }
}
