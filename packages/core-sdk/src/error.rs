use thiserror::Error;

/**
 * \brief AI 流式核心的错误分类。
 * \details 流式开始前的失败以同步 Result 形式返回；流式开始后的失败只会变成
 *          唯一一个终止 error 事件，不再走这里。
 */
#[derive(Debug, Error)]
pub enum AiError {
    /** \brief 凭据记录携带未知的 provider 标签。 */
    #[error("unknown AI provider type: {0}")]
    UnknownProvider(String),

    /** \brief 按 (id, user_id) 查不到凭据：不存在与无权限不作区分。 */
    #[error("invalid API key ID or permission denied")]
    KeyNotFound,

    /** \brief 凭据已被停用。 */
    #[error("API key is disabled")]
    KeyDisabled,

    /** \brief 该 Provider 仅支持流式调用。 */
    #[error("{0} non-streaming chat is not implemented")]
    NotImplemented(&'static str),

    /** \brief 上游返回非 2xx，携带状态码与完整响应体。 */
    #[error("API request failed with status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /** \brief 出站请求无法构建或发送。 */
    #[error("failed to send request: {0}")]
    Transport(#[from] reqwest::Error),

    /** \brief 凭据存储访问失败。 */
    #[error("credential store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AiError {
    /**
     * \brief 映射到对外 HTTP 状态码（流式开始前的同步失败路径）。
     */
    pub fn status_code(&self) -> u16 {
        match self {
            Self::KeyNotFound => 403,
            Self::UnknownProvider(_) | Self::KeyDisabled => 400,
            Self::NotImplemented(_) => 501,
            Self::UpstreamStatus { .. } | Self::Transport(_) => 502,
            Self::Store(_) => 500,
        }
    }
}
