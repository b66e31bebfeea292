use serde::{Deserialize, Serialize};

/**
 * \brief 对话消息，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

/**
 * \brief 单次请求的模型配置，请求期间不可变。
 */
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /** \brief 模型标识 */
    pub model: String,
    /** \brief 采样温度，0 表示不下发该字段 */
    pub temperature: f32,
    /** \brief 最大生成 token 数，0 表示不下发该字段 */
    pub max_tokens: u32,
    /** \brief 是否流式返回 */
    pub stream: bool,
}

/**
 * \brief 非流式调用的完整回复。
 */
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
}

/**
 * \brief 适配器内部的归一化增量块。
 * \details 一旦出现 `done == true` 或 `error` 非空，发送端不再发送任何块并立即关闭通道。
 */
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /** \brief 增量文本，终止块为空 */
    pub content: String,
    /** \brief 是否为终止块 */
    pub done: bool,
    /** \brief 流中途失败时的错误描述 */
    pub error: Option<String>,
}

/**
 * \brief 对外可见的流事件，经中继层逐帧写入传输层。
 * \details 事件序列：至多一个 start（首帧），若干 chunk，最后恰好一个 done 或 error。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Start,
    Chunk { content: String },
    Done,
    Error { error: String },
}

/**
 * \brief 支持的上游服务类型（封闭集合）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Claude,
    Gemini,
}

impl ProviderKind {
    /**
     * \brief 解析存储的 provider 标签，未知标签返回 None。
     */
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "claude" | "anthropic" => Some(Self::Claude),
            "gemini" | "google" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }
}

/**
 * \brief API Key 的启用状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Enabled,
    Disabled,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }

    /** \brief 从存储文本恢复状态，未知值按启用处理。 */
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("disabled") {
            Self::Disabled
        } else {
            Self::Enabled
        }
    }
}

/**
 * \brief 存储的凭据记录，由设置层维护；流式核心只读不写。
 */
#[derive(Debug, Clone)]
pub struct ApiKey {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 所属用户 */
    pub user_id: i64,
    /** \brief Provider 标签（openai/claude/gemini 等） */
    pub provider: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 密钥明文 */
    pub api_key: String,
    /** \brief 基地址覆盖，空串表示使用默认端点 */
    pub base_url: String,
    /** \brief 默认模型名 */
    pub default_model: String,
    /** \brief 启用状态 */
    pub status: KeyStatus,
    /** \brief 历史调用次数，仅由设置层累计 */
    pub calls: i64,
}
