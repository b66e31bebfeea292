use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::error::AiError;
use crate::models::{
    ApiKey, ChatConfig, ChatMessage, ChatResponse, KeyStatus, StreamChunk, StreamEvent,
};
use crate::providers::AiProvider;
use crate::telemetry;

/** \brief 调用方未指定时的默认采样温度。 */
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/** \brief 调用方未指定时的默认最大 token 数。 */
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/** \brief 事件通道容量，与块通道一致地把背压传回上游。 */
const EVENT_CHANNEL_CAPACITY: usize = 1;

/**
 * \brief 凭据来源抽象：按 (id, user_id) 所有权范围查询，核心层只读。
 * \details 以注入方式提供，测试可以用内存假实现替换 SQLite。
 */
pub trait KeySource {
    fn api_key(&self, api_key_id: i64, user_id: i64) -> anyhow::Result<Option<ApiKey>>;
    fn api_keys_for_user(&self, user_id: i64) -> anyhow::Result<Vec<ApiKey>>;
}

impl KeySource for rusqlite::Connection {
    fn api_key(&self, api_key_id: i64, user_id: i64) -> anyhow::Result<Option<ApiKey>> {
        db::get_api_key(self, api_key_id, user_id)
    }

    fn api_keys_for_user(&self, user_id: i64) -> anyhow::Result<Vec<ApiKey>> {
        db::list_api_keys(self, user_id)
    }
}

/**
 * \brief 编辑器侧可选的 Provider 配置（温度以 0-100 百分比表示）。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProviderConfig {
    pub id: String,
    pub name: String,
    pub model: String,
    pub temperature: i32,
    #[serde(rename = "maxTokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub description: String,
}

/**
 * \brief 编辑器任务的入站载荷。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTaskPayload {
    pub prompt: String,
    pub config: AiProviderConfig,
    #[serde(rename = "taskType")]
    pub task_type: String,
    #[serde(rename = "sourceItemTitle", default)]
    pub source_item_title: String,
}

/**
 * \brief 解析并校验凭据：不存在/越权与停用都在任何网络动作之前同步失败。
 */
pub fn resolve_api_key<S: KeySource>(
    source: &S,
    api_key_id: i64,
    user_id: i64,
) -> Result<ApiKey, AiError> {
    let key = source
        .api_key(api_key_id, user_id)?
        .ok_or(AiError::KeyNotFound)?;
    if key.status == KeyStatus::Disabled {
        return Err(AiError::KeyDisabled);
    }
    Ok(key)
}

/**
 * \brief 列出该用户启用中的凭据，转换为编辑器 Provider 配置。
 */
pub fn providers_for_editor<S: KeySource>(
    source: &S,
    user_id: i64,
) -> Result<Vec<AiProviderConfig>, AiError> {
    let keys = source.api_keys_for_user(user_id)?;
    Ok(keys
        .into_iter()
        .filter(|key| key.status == KeyStatus::Enabled)
        .map(|key| AiProviderConfig {
            id: key.id.to_string(),
            description: format!("Provider: {}, Model: {}", key.provider, key.default_model),
            name: key.name,
            model: key.default_model,
            temperature: 70,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
        .collect())
}

/**
 * \brief 非流式对话。当前所有适配器都会返回 NotImplemented。
 */
pub async fn chat<S: KeySource + Send>(
    source: S,
    api_key_id: i64,
    user_id: i64,
    messages: Vec<ChatMessage>,
) -> Result<ChatResponse, AiError> {
    let key = resolve_api_key(&source, api_key_id, user_id)?;
    drop(source);

    let provider = AiProvider::from_api_key(&key)?;
    let config = ChatConfig {
        model: key.default_model.clone(),
        temperature: DEFAULT_TEMPERATURE,
        max_tokens: DEFAULT_MAX_TOKENS,
        stream: false,
    };
    provider.chat(&messages, &config).await
}

/**
 * \brief 流式对话：完整消息序列 + 凭据默认模型。
 * \details 流式开始前的失败同步返回；成功后事件顺序为
 *          start → chunk* → done|error，随后通道关闭。
 */
pub async fn stream_chat<S: KeySource + Send>(
    source: S,
    token: CancellationToken,
    api_key_id: i64,
    user_id: i64,
    messages: Vec<ChatMessage>,
) -> Result<mpsc::Receiver<StreamEvent>, AiError> {
    let key = resolve_api_key(&source, api_key_id, user_id)?;
    drop(source);

    let config = ChatConfig {
        model: key.default_model.clone(),
        temperature: DEFAULT_TEMPERATURE,
        max_tokens: DEFAULT_MAX_TOKENS,
        stream: true,
    };
    telemetry::log_event(
        "ai.chat",
        &format!(
            "provider={}({}) model={} msgs={}",
            key.name,
            key.provider,
            config.model,
            messages.len()
        ),
    );
    open_event_stream(token, &key, messages, config).await
}

/**
 * \brief 编辑器任务流：单条 prompt，配置来自载荷（温度按百分比换算）。
 */
pub async fn stream_task<S: KeySource + Send>(
    source: S,
    token: CancellationToken,
    payload: StreamTaskPayload,
    user_id: i64,
) -> Result<mpsc::Receiver<StreamEvent>, AiError> {
    let api_key_id = payload
        .config
        .id
        .parse::<i64>()
        .map_err(|_| AiError::KeyNotFound)?;
    let key = resolve_api_key(&source, api_key_id, user_id)?;
    drop(source);

    let config = ChatConfig {
        model: payload.config.model,
        temperature: payload.config.temperature as f32 / 100.0,
        max_tokens: payload.config.max_tokens,
        stream: true,
    };
    telemetry::log_event(
        "ai.task",
        &format!(
            "provider={}({}) model={} type={} prompt_len={}",
            key.name,
            key.provider,
            config.model,
            payload.task_type,
            payload.prompt.len()
        ),
    );

    let messages = vec![ChatMessage {
        role: "user".to_string(),
        content: payload.prompt,
    }];
    open_event_stream(token, &key, messages, config).await
}

/**
 * \brief 公共流式路径：工厂 → 适配器 → 变换工作器。
 * \details 变换工作器是两级通道的中间层：块通道解码上游协议，事件通道固定对外
 *          词汇表，新增 Provider 不影响中继与线格式。任何返回路径都会丢弃
 *          发送端，事件通道恰好关闭一次。
 */
async fn open_event_stream(
    token: CancellationToken,
    key: &ApiKey,
    messages: Vec<ChatMessage>,
    config: ChatConfig,
) -> Result<mpsc::Receiver<StreamEvent>, AiError> {
    let provider = AiProvider::from_api_key(key)?;
    let chunks = provider.stream_chat(token, &messages, &config).await?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(transform_chunks(chunks, tx));
    Ok(rx)
}

async fn transform_chunks(mut chunks: mpsc::Receiver<StreamChunk>, tx: mpsc::Sender<StreamEvent>) {
    let _ = tx.send(StreamEvent::Start).await;
    while let Some(chunk) = chunks.recv().await {
        if let Some(error) = chunk.error {
            telemetry::log_error("ai.stream", &format!("stream error: {}", error));
            let _ = tx.send(StreamEvent::Error { error }).await;
            return;
        }
        if chunk.done {
            let _ = tx.send(StreamEvent::Done).await;
            return;
        }
        if !chunk.content.is_empty() {
            let _ = tx.send(StreamEvent::Chunk {
                content: chunk.content,
            })
            .await;
        }
    }
    // 块通道在终止块之前就关闭属于异常退出：不补发事件，事件通道随 tx 丢弃关闭
}
