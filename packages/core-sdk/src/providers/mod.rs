use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AiError;
use crate::models::{ApiKey, ChatConfig, ChatMessage, ChatResponse, ProviderKind, StreamChunk};

mod claude;
mod gemini;
mod openai;

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/** \brief 出站调用的固定超时，独立于取消信号。 */
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/** \brief 单条流内可容忍的畸形 data 行上限，超过即按致命错误终止。 */
pub const MAX_MALFORMED_DATA_LINES: usize = 32;

/** \brief 适配器间统一的块通道容量：近似无缓冲，向上游套接字施加背压。 */
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 1;

/**
 * \brief 封闭的适配器集合，工厂按凭据标签穷尽匹配。
 * \details 未知标签是可达、可测的分支，而不是运行时断言失败。
 */
#[derive(Debug)]
pub enum AiProvider {
    OpenAi(OpenAiAdapter),
    Claude(ClaudeAdapter),
    Gemini(GeminiAdapter),
}

impl AiProvider {
    /**
     * \brief 工厂：根据凭据记录构建对应适配器。
     * \details 无状态，每次请求构建新实例；任何网络动作之前即失败。
     */
    pub fn from_api_key(key: &ApiKey) -> Result<Self, AiError> {
        match ProviderKind::parse(&key.provider) {
            Some(ProviderKind::OpenAi) => Ok(Self::OpenAi(OpenAiAdapter::new(key)?)),
            Some(ProviderKind::Claude) => Ok(Self::Claude(ClaudeAdapter::new(key)?)),
            Some(ProviderKind::Gemini) => Ok(Self::Gemini(GeminiAdapter::new(key)?)),
            None => Err(AiError::UnknownProvider(key.provider.clone())),
        }
    }

    /**
     * \brief 非流式调用；当前三个适配器都只支持流式。
     */
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<ChatResponse, AiError> {
        match self {
            Self::OpenAi(adapter) => adapter.chat(messages, config).await,
            Self::Claude(adapter) => adapter.chat(messages, config).await,
            Self::Gemini(adapter) => adapter.chat(messages, config).await,
        }
    }

    /**
     * \brief 流式调用：成功时返回归一化块的接收端，同步失败不创建任何通道。
     */
    pub async fn stream_chat(
        &self,
        token: CancellationToken,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> Result<mpsc::Receiver<StreamChunk>, AiError> {
        match self {
            Self::OpenAi(adapter) => adapter.stream_chat(token, messages, config).await,
            Self::Claude(adapter) => adapter.stream_chat(token, messages, config).await,
            Self::Gemini(adapter) => adapter.stream_chat(token, messages, config).await,
        }
    }
}

/**
 * \brief 解析凭据里的基地址：空串取各 Provider 的默认端点，并去掉末尾斜杠。
 */
pub(crate) fn effective_base_url(key: &ApiKey, default_url: &str) -> String {
    if key.base_url.is_empty() {
        default_url.to_string()
    } else {
        key.base_url.trim_end_matches('/').to_string()
    }
}

/**
 * \brief 构建带固定超时的 HTTP 客户端。
 */
pub(crate) fn build_client() -> Result<reqwest::Client, AiError> {
    Ok(reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

/**
 * \brief 读取非 2xx 响应的完整响应体并包装为同步错误。
 */
pub(crate) async fn upstream_error(resp: reqwest::Response) -> AiError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    AiError::UpstreamStatus { status, body }
}

/**
 * \brief 单条 data 行的解析结果，由各适配器的解析器给出。
 */
pub(crate) enum ParsedLine {
    /** \brief 一个文本增量（可为空，空增量会被丢弃）。 */
    Text(String),
    /** \brief 上游的流结束哨兵。 */
    Stop,
    /** \brief 合法但无关的事件，跳过。 */
    Ignore,
    /** \brief 无法解析的负载，计入畸形行。 */
    Invalid,
}

enum LineFlow {
    Continue,
    Stop,
    Fail(String),
}

/**
 * \brief 共享的 SSE 泵：把上游响应体按行解码成归一化块。
 * \details 行为约束：
 *          - 取消信号与套接字读取做 select，取消立即生效；
 *          - 无论哪条路径退出，都恰好发出一个终止块，随后发送端被丢弃、通道关闭；
 *          - 畸形 data 行静默跳过，累计超过上限则按致命错误终止。
 */
pub(crate) async fn pump_sse<F>(
    resp: reqwest::Response,
    token: CancellationToken,
    tx: mpsc::Sender<StreamChunk>,
    parse: F,
) where
    F: Fn(&str) -> ParsedLine + Send + 'static,
{
    let mut body = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut malformed = 0usize;
    let mut failure: Option<String> = None;

    'read: loop {
        let next = tokio::select! {
            // 取消优先于继续读取
            biased;
            _ = token.cancelled() => {
                failure = Some("stream cancelled by client".to_string());
                break 'read;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match handle_line(line.trim(), &parse, &mut malformed, &tx).await {
                        LineFlow::Continue => {}
                        LineFlow::Stop => break 'read,
                        LineFlow::Fail(message) => {
                            failure = Some(message);
                            break 'read;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                failure = Some(format!("stream reading error: {}", err));
                break 'read;
            }
            None => {
                // 响应体正常读完；缓冲里可能残留未换行的最后一行
                if !buf.is_empty() {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    if let LineFlow::Fail(message) =
                        handle_line(&line, &parse, &mut malformed, &tx).await
                    {
                        failure = Some(message);
                    }
                }
                break 'read;
            }
        }
    }

    let _ = tx
        .send(StreamChunk {
            content: String::new(),
            done: true,
            error: failure,
        })
        .await;
    // tx 在此丢弃，通道随之关闭
}

async fn handle_line<F>(
    line: &str,
    parse: &F,
    malformed: &mut usize,
    tx: &mpsc::Sender<StreamChunk>,
) -> LineFlow
where
    F: Fn(&str) -> ParsedLine,
{
    let Some(data) = line.strip_prefix("data:") else {
        return LineFlow::Continue;
    };
    let data = data.trim();
    if data.is_empty() {
        return LineFlow::Continue;
    }

    match parse(data) {
        ParsedLine::Text(text) => {
            if text.is_empty() {
                return LineFlow::Continue;
            }
            let chunk = StreamChunk {
                content: text,
                done: false,
                error: None,
            };
            if tx.send(chunk).await.is_err() {
                // 接收端已放弃，停止继续读上游
                return LineFlow::Stop;
            }
            LineFlow::Continue
        }
        ParsedLine::Stop => LineFlow::Stop,
        ParsedLine::Ignore => LineFlow::Continue,
        ParsedLine::Invalid => {
            *malformed += 1;
            if *malformed > MAX_MALFORMED_DATA_LINES {
                LineFlow::Fail("too many malformed stream events from provider".to_string())
            } else {
                LineFlow::Continue
            }
        }
    }
}
