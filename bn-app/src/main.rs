//! Benjamin main binary.

mod agent_loop;
mod capabilities;
mod catalog;
mod commands;
mod config;
mod escalation;
mod executor;
mod gateway;
mod handler;
mod init;
mod locale;
mod memory;
mod orchestrator;
mod plan;
mod planner;
mod routes;
mod run;
mod server;
mod session;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "benjamin", version, about = "Benjamin personal assistant")]
struct Cli {
    /// Config file. Defaults to ~/.benjamin/config.toml.
    #[arg(long, global = true, env = "BENJAMIN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start Telegram polling and the local HTTP API (default).
    Serve,
    /// Create ~/.benjamin with a config template (idempotent).
    Init,
    /// Validate config, model keys and the memory database.
    Doctor,
    /// Send one message through the full pipeline and print the reply.
    Chat {
        #[arg(long, default_value = "local")]
        user: String,
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(anyhow::anyhow!("load .env: {e}"));
        }
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Init => {
            let report = init::initialize_default().await?;
            if report.created.is_empty() {
                println!("benjamin init: already initialized at {}", report.root.display());
            } else {
                println!("benjamin init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
            }
            println!(
                "next: add api keys and a telegram token to {}",
                report.root.join("config.toml").display()
            );
            Ok(())
        }
        Command::Doctor => server::doctor(cli.config).await,
        Command::Chat { user, message } => {
            let reply = server::chat_once(cli.config, &user, &message).await?;
            println!("{reply}");
            Ok(())
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,benjamin=debug,bn_app=debug,bn_llm=debug,bn_channels=debug,bn_tools=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("BENJAMIN_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match log_format.as_str() {
        "json" => builder
            .with_span_events(FmtSpan::CLOSE)
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported BENJAMIN_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(log_format = %log_format, "tracing initialized");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(panic_location = %location, panic_payload = %payload, "panic captured");
        default_hook(panic_info);
    }));
}
