use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use storyloom_core_sdk::{db, models::ChatMessage, models::StreamEvent, server, service, telemetry};

/**
 * \brief CLI 程序入口：凭据管理、本地服务与流式试聊。
 */
#[derive(Parser, Debug)]
#[command(name = "storyloom", version, about = "Storyloom AI streaming core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 新增一条 Provider 凭据。
     */
    AddKey {
        #[arg(long, default_value = "openai")]
        provider: String,
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "")]
        base_url: String,
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /**
     * \brief 列出当前用户的全部凭据。
     */
    Keys,

    /**
     * \brief 用指定凭据发送一条消息并流式显示回复，Ctrl-C 取消。
     */
    Chat {
        #[arg(long)]
        key_id: i64,
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

/** \brief CLI 为单用户场景，固定用户 1。 */
const CLI_USER_ID: i64 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::AddKey {
            provider,
            name,
            api_key,
            base_url,
            model,
            enable_telemetry,
        } => {
            let id = db::insert_api_key(&conn, CLI_USER_ID, &provider, &name, &api_key, &base_url, &model)
                .context("save api key failed")?;
            db::set_telemetry_enabled(&conn, enable_telemetry).context("save telemetry failed")?;
            telemetry::set_enabled(enable_telemetry);
            println!(
                "Saved api key id={} (name={} | {} | {})",
                id, name, provider, model
            );
        }
        Commands::Keys => {
            let keys = db::list_api_keys(&conn, CLI_USER_ID).context("list api keys failed")?;
            if keys.is_empty() {
                println!("No api keys, run: storyloom add-key --api-key ... --model ...");
            }
            for key in keys {
                println!(
                    "id={} name={} provider={} model={} status={} calls={}",
                    key.id,
                    key.name,
                    key.provider,
                    key.default_model,
                    key.status.as_str(),
                    key.calls
                );
            }
        }
        Commands::Chat { key_id, prompt } => {
            let messages = vec![ChatMessage {
                role: "user".to_string(),
                content: prompt,
            }];

            let token = CancellationToken::new();
            let ctrl_c_token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_token.cancel();
                }
            });

            let mut events =
                service::stream_chat(conn, token, key_id, CLI_USER_ID, messages)
                    .await
                    .context("open stream failed")?;

            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::Start => {}
                    StreamEvent::Chunk { content } => {
                        print!("{}", content);
                        use std::io::Write;
                        std::io::stdout().flush().ok();
                    }
                    StreamEvent::Done => break,
                    StreamEvent::Error { error } => {
                        eprintln!("\nstream error: {}", error);
                        break;
                    }
                }
            }
            println!();
        }
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
    }

    Ok(())
}
