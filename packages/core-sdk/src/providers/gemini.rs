use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    build_client, effective_base_url, pump_sse, upstream_error, ParsedLine, CHUNK_CHANNEL_CAPACITY,
};
use crate::error::AiError;
use crate::models::{ApiKey, ChatConfig, ChatMessage, ChatResponse, StreamChunk};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    /** \brief Gemini 只接受 user/model 两种角色 */
    role: &'static str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiStreamResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiCandidateContent,
}

#[derive(Debug, Deserialize, Default)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiTextPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiTextPart {
    #[serde(default)]
    text: String,
}

/**
 * \brief Google Gemini 协议适配器。
 */
#[derive(Debug)]
pub struct GeminiAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
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
        Err(AiError::NotImplemented("Gemini"))
    }

    /**
     * \brief 发起流式生成。Gemini 没有结束哨兵，响应体读完即为正常终止。
     */
    pub async fn stream_chat(
        &self,
        token: CancellationToken,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<mpsc::Receiver<StreamChunk>, AiError> {
        let generation_config = build_generation_config(config);
        let body = GeminiRequest {
            contents: prepare_contents(messages),
            generation_config,
        };

        let url = format!("{}/{}:streamGenerateContent", self.base_url, config.model);
        let resp = self
            .client
            .post(url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
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

fn build_generation_config(config: &ChatConfig) -> Option<GeminiGenerationConfig> {
    let temperature = (config.temperature != 0.0).then_some(config.temperature);
    let max_output_tokens = (config.max_tokens != 0).then_some(config.max_tokens);
    if temperature.is_none() && max_output_tokens.is_none() {
        return None;
    }
    Some(GeminiGenerationConfig {
        temperature,
        max_output_tokens,
    })
}

/**
 * \brief 角色映射：assistant→model，system 并入 user 内容，其余按 user 处理。
 */
fn prepare_contents(messages: &[ChatMessage]) -> Vec<GeminiContent<'_>> {
    messages
        .iter()
        .map(|msg| {
            let role = if msg.role == "assistant" { "model" } else { "user" };
            GeminiContent {
                role,
                parts: vec![GeminiPart { text: &msg.content }],
            }
        })
        .collect()
}

fn parse_data_line(data: &str) -> ParsedLine {
    let Ok(parsed) = serde_json::from_str::<GeminiStreamResponse>(data) else {
        return ParsedLine::Invalid;
    };
    match parsed.candidates.into_iter().next() {
        Some(candidate) => {
            let text: String = candidate
                .content
                .parts
                .into_iter()
                .map(|part| part.text)
                .collect();
            ParsedLine::Text(text)
        }
        None => ParsedLine::Ignore,
    }
}
