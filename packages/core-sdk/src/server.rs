use std::convert::Infallible;

use anyhow::Result;
use axum::{
    body::Body,
    extract::Path,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    db,
    error::AiError,
    models::{ChatMessage, KeyStatus, StreamEvent},
    service, telemetry,
};

/** \brief 单用户部署下 x-user-id 缺失时的默认用户。 */
const DEFAULT_USER_ID: i64 = 1;

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:8080"
 */
pub async fn run(addr: &str) -> Result<()> {
    let app = router();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 组装 API 路由。独立导出便于集成测试挂在随机端口上。
 */
pub fn router() -> Router {
    Router::new()
        .route("/api/ai/stream-chat", post(stream_chat))
        .route("/api/ai/tasks/stream", post(stream_task))
        .route("/api/ai/providers", get(list_providers))
        .route("/api/keys", get(list_keys).post(create_key))
        .route("/api/keys/{id}", put(update_key).delete(delete_key))
        .route("/api/health", get(health_check))
}

#[derive(Deserialize, Debug)]
struct StreamChatRequest {
    /** \brief 使用的凭据 ID */
    api_key_id: i64,
    /** \brief 完整消息序列，调用方负责裁剪 */
    messages: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize, Debug)]
struct KeyInput {
    provider: String,
    name: String,
    api_key: String,
    #[serde(default)]
    base_url: String,
    default_model: String,
    /** \brief 仅更新时生效："enabled" / "disabled" */
    #[serde(default)]
    status: Option<String>,
}

#[derive(Serialize, Debug)]
struct ApiKeyDto {
    id: i64,
    provider: String,
    name: String,
    /** \brief 脱敏后的密钥片段，完整密钥不回传 */
    key_fragment: String,
    base_url: String,
    default_model: String,
    status: String,
    calls: i64,
}

#[derive(Serialize, Debug)]
struct KeysResponse {
    keys: Vec<ApiKeyDto>,
}

/**
 * \brief 从请求头解析当前用户；单用户部署下缺省为 1。
 */
fn current_user(headers: &HeaderMap) -> i64 {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(DEFAULT_USER_ID)
}

fn mask_api_key(api_key: &str) -> String {
    let tail: String = api_key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", tail)
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn ai_err(e: AiError) -> (StatusCode, String) {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string())
}

fn open_db_with_telemetry() -> Result<rusqlite::Connection, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    db::migrate(&conn).map_err(internal_err)?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).map_err(internal_err)?;
    telemetry::set_enabled(telemetry_enabled);
    Ok(conn)
}

/**
 * \brief 聊天流接口：POST /api/ai/stream-chat
 * \details 流式开始前的失败返回普通错误响应；开始后以
 *          `data: <json>\n\n` 帧推送 start/chunk/done/error 事件。
 */
async fn stream_chat(
    headers: HeaderMap,
    Json(payload): Json<StreamChatRequest>,
) -> Result<Response, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    let api_key_id = payload.api_key_id;

    let token = CancellationToken::new();
    let events = service::stream_chat(conn, token.clone(), api_key_id, user_id, payload.messages)
        .await
        .map_err(ai_err)?;

    if let Err(err) =
        db::open_default_db().and_then(|conn2| db::bump_api_key_calls(&conn2, api_key_id, user_id))
    {
        // 计数失败不影响已开启的流
        telemetry::log_error("server.keys", &format!("bump calls failed: {}", err));
    }
    Ok(event_stream_response(events, token))
}

/**
 * \brief 编辑器任务流接口：POST /api/ai/tasks/stream
 */
async fn stream_task(
    headers: HeaderMap,
    Json(payload): Json<service::StreamTaskPayload>,
) -> Result<Response, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    let api_key_id = payload.config.id.parse::<i64>().ok();

    let token = CancellationToken::new();
    let events = service::stream_task(conn, token.clone(), payload, user_id)
        .await
        .map_err(ai_err)?;

    if let Some(id) = api_key_id {
        if let Err(err) =
            db::open_default_db().and_then(|conn2| db::bump_api_key_calls(&conn2, id, user_id))
        {
            telemetry::log_error("server.keys", &format!("bump calls failed: {}", err));
        }
    }
    Ok(event_stream_response(events, token))
}

/**
 * \brief 把事件通道转成 SSE 响应。
 * \details 客户端断开会丢弃响应流，drop guard 随之取消上游读取；
 *          事件序列化失败时推送一帧兜底 error 后终止。
 */
fn event_stream_response(mut events: mpsc::Receiver<StreamEvent>, token: CancellationToken) -> Response {
    let guard = token.clone().drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = events.recv() => {
                    let Some(event) = next else { break };
                    match serde_json::to_string(&event) {
                        Ok(json) => yield Ok::<_, Infallible>(format!("data: {}\n\n", json)),
                        Err(err) => {
                            telemetry::log_error(
                                "server.stream",
                                &format!("encode event failed: {}", err),
                            );
                            yield Ok(
                                "data: {\"event\":\"error\",\"error\":\"failed to encode stream event\"}\n\n"
                                    .to_string(),
                            );
                            break;
                        }
                    }
                }
            }
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| internal_err(err).into_response())
}

/**
 * \brief 编辑器可选的 Provider 配置列表：GET /api/ai/providers
 */
async fn list_providers(
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    let providers = service::providers_for_editor(&conn, user_id).map_err(ai_err)?;
    Ok(Json(serde_json::json!({ "providers": providers })))
}

fn keys_response(conn: &rusqlite::Connection, user_id: i64) -> Result<KeysResponse> {
    let keys = db::list_api_keys(conn, user_id)?;
    let items = keys
        .into_iter()
        .map(|k| ApiKeyDto {
            id: k.id,
            provider: k.provider,
            name: k.name,
            key_fragment: mask_api_key(&k.api_key),
            base_url: k.base_url,
            default_model: k.default_model,
            status: k.status.as_str().to_string(),
            calls: k.calls,
        })
        .collect();
    Ok(KeysResponse { keys: items })
}

/**
 * \brief 凭据列表：GET /api/keys
 */
async fn list_keys(headers: HeaderMap) -> Result<Json<KeysResponse>, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    let resp = keys_response(&conn, user_id).map_err(internal_err)?;
    Ok(Json(resp))
}

/**
 * \brief 新增凭据：POST /api/keys
 */
async fn create_key(
    headers: HeaderMap,
    Json(payload): Json<KeyInput>,
) -> Result<Json<KeysResponse>, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    db::insert_api_key(
        &conn,
        user_id,
        &payload.provider,
        &payload.name,
        &payload.api_key,
        &payload.base_url,
        &payload.default_model,
    )
    .map_err(internal_err)?;
    telemetry::log_event(
        "server.keys",
        &format!("create name={} provider={}", payload.name, payload.provider),
    );
    let resp = keys_response(&conn, user_id).map_err(internal_err)?;
    Ok(Json(resp))
}

/**
 * \brief 更新凭据：PUT /api/keys/{id}；status 字段可切换启停。
 */
async fn update_key(
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(payload): Json<KeyInput>,
) -> Result<Json<KeysResponse>, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    db::update_api_key(
        &conn,
        id,
        user_id,
        &payload.provider,
        &payload.name,
        &payload.api_key,
        &payload.base_url,
        &payload.default_model,
    )
    .map_err(internal_err)?;
    if let Some(raw) = payload.status.as_deref() {
        let status = match raw {
            "enabled" => KeyStatus::Enabled,
            "disabled" => KeyStatus::Disabled,
            _ => return Err((StatusCode::BAD_REQUEST, format!("unknown status: {}", raw))),
        };
        db::set_api_key_status(&conn, id, user_id, status).map_err(internal_err)?;
    }
    telemetry::log_event("server.keys", &format!("update id={}", id));
    let resp = keys_response(&conn, user_id).map_err(internal_err)?;
    Ok(Json(resp))
}

/**
 * \brief 删除凭据：DELETE /api/keys/{id}
 */
async fn delete_key(
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<KeysResponse>, (StatusCode, String)> {
    let conn = open_db_with_telemetry()?;
    let user_id = current_user(&headers);
    db::delete_api_key(&conn, id, user_id).map_err(internal_err)?;
    telemetry::log_event("server.keys", &format!("delete id={}", id));
    let resp = keys_response(&conn, user_id).map_err(internal_err)?;
    Ok(Json(resp))
}

/**
 * \brief 健康检查。
 */
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_user_defaults_to_one() {
        let headers = HeaderMap::new();
        assert_eq!(current_user(&headers), 1);
    }

    #[test]
    fn test_current_user_reads_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "42".parse().expect("header value"));
        assert_eq!(current_user(&headers), 42);
    }

    #[test]
    fn test_current_user_ignores_garbage_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "abc".parse().expect("header value"));
        assert_eq!(current_user(&headers), 1);
    }

    #[test]
    fn test_mask_api_key_keeps_tail() {
        assert_eq!(mask_api_key("sk-1234567890"), "****7890");
        assert_eq!(mask_api_key("ab"), "****ab");
    }
}
