use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{thread, time::Duration};

use crate::models::{ApiKey, KeyStatus};

/**
 * \brief 打开默认数据库文件。
 * \details 路径可用 STORYLOOM_DB 覆盖，默认本地目录下的 storyloom.db。
 */
pub fn open_default_db() -> Result<Connection> {
    let path = std::env::var("STORYLOOM_DB").unwrap_or_else(|_| "storyloom.db".to_string());
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            provider TEXT NOT NULL,
            name TEXT NOT NULL,
            api_key TEXT NOT NULL,
            base_url TEXT NOT NULL DEFAULT '',
            default_model TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'enabled',
            calls INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 新增凭据记录。
 */
pub fn insert_api_key(
    conn: &Connection,
    user_id: i64,
    provider: &str,
    name: &str,
    api_key: &str,
    base_url: &str,
    default_model: &str,
) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO api_keys (user_id, provider, name, api_key, base_url, default_model) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, provider, name, api_key, base_url, default_model],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 更新凭据记录（按 (id, user_id) 限定归属）。
 */
pub fn update_api_key(
    conn: &Connection,
    id: i64,
    user_id: i64,
    provider: &str,
    name: &str,
    api_key: &str,
    base_url: &str,
    default_model: &str,
) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE api_keys SET provider=?1, name=?2, api_key=?3, base_url=?4, default_model=?5 WHERE id=?6 AND user_id=?7",
            params![provider, name, api_key, base_url, default_model, id, user_id],
        )
    })?;
    if rows == 0 {
        bail!("api key id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 删除凭据记录（按 (id, user_id) 限定归属）。
 */
pub fn delete_api_key(conn: &Connection, id: i64, user_id: i64) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM api_keys WHERE id=?1 AND user_id=?2",
            params![id, user_id],
        )
    })?;
    if rows == 0 {
        bail!("api key id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 更新凭据启停状态。
 */
pub fn set_api_key_status(
    conn: &Connection,
    id: i64,
    user_id: i64,
    status: KeyStatus,
) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE api_keys SET status=?1 WHERE id=?2 AND user_id=?3",
            params![status.as_str(), id, user_id],
        )
    })?;
    if rows == 0 {
        bail!("api key id {} not found", id);
    }
    Ok(())
}

fn map_api_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKey> {
    let status: String = row.get(7)?;
    Ok(ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        name: row.get(3)?,
        api_key: row.get(4)?,
        base_url: row.get(5)?,
        default_model: row.get(6)?,
        status: KeyStatus::parse(&status),
        calls: row.get(8)?,
    })
}

/**
 * \brief 按 (id, user_id) 获取凭据。越权访问与不存在不可区分，都返回 None。
 */
pub fn get_api_key(conn: &Connection, id: i64, user_id: i64) -> Result<Option<ApiKey>> {
    conn.query_row(
        "SELECT id, user_id, provider, name, api_key, base_url, default_model, status, calls
         FROM api_keys WHERE id=?1 AND user_id=?2",
        params![id, user_id],
        map_api_key,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出该用户的全部凭据。
 */
pub fn list_api_keys(conn: &Connection, user_id: i64) -> Result<Vec<ApiKey>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, provider, name, api_key, base_url, default_model, status, calls
         FROM api_keys WHERE user_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], map_api_key)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 累加凭据调用计数。
 */
pub fn bump_api_key_calls(conn: &Connection, id: i64, user_id: i64) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE api_keys SET calls=calls+1 WHERE id=?1 AND user_id=?2",
            params![id, user_id],
        )
    })?;
    Ok(())
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
