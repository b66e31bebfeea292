use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    build_client, effective_base_url, pump_sse, upstream_error, ParsedLine, CHUNK_CHANNEL_CAPACITY,
};
use crate::error::AiError;
use crate::models::{ApiKey, ChatConfig, ChatMessage, ChatResponse, StreamChunk};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

/**
 * \brief OpenAI 协议适配器。
 */
#[derive(Debug)]
pub struct OpenAiAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
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
        // 流式是产品唯一路径
        Err(AiError::NotImplemented("OpenAI"))
    }

    /**
     * \brief 发起流式补全；非 2xx 时读取完整响应体并同步失败，不开启任何通道。
     */
    pub async fn stream_chat(
        &self,
        token: CancellationToken,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<mpsc::Receiver<StreamChunk>, AiError> {
        let body = OpenAiRequest {
            model: &config.model,
            messages,
            stream: true,
            temperature: (config.temperature != 0.0).then_some(config.temperature),
            max_tokens: (config.max_tokens != 0).then_some(config.max_tokens),
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
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
 * \brief 解析一行 data 负载：`[DONE]` 为结束哨兵，其余按增量 JSON 处理。
 */
fn parse_data_line(data: &str) -> ParsedLine {
    if data == "[DONE]" {
        return ParsedLine::Stop;
    }
    let Ok(parsed) = serde_json::from_str::<OpenAiStreamResponse>(data) else {
        return ParsedLine::Invalid;
    };
    match parsed.choices.into_iter().next() {
        Some(choice) => ParsedLine::Text(choice.delta.content.unwrap_or_default()),
        None => ParsedLine::Ignore,
    }
}
