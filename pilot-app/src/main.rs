//! opencode-pilot main binary.

mod broker;
mod callback;
mod commands;
mod config;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(
    name = "opencode-pilot",
    version,
    about = "Push-notification approvals for agent sessions"
)]
struct Cli {
    /// Config file (default: ~/.opencode-pilot/config.toml).
    #[arg(long, global = true, env = "PILOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the session broker and callback server (default).
    Serve,
    /// Validate config and print the callback URL.
    Doctor,
    /// Probe the broker socket and callback server.
    Status,
    /// Request approval as a session and wait for the decision.
    Ask {
        /// Short name of the action, shown in the title.
        #[arg(long, default_value = "")]
        tool: String,
        /// What is being approved.
        description: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        permission_id: Option<String>,
        /// Sign a token locally instead of asking the broker for a nonce.
        #[arg(long)]
        token: bool,
        /// Seconds to wait for a decision.
        #[arg(long, default_value_t = 300)]
        wait: u64,
    },
    /// Send a plain notification.
    Notify {
        title: String,
        message: String,
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Evaluate readiness of a JSON item against the configured rules.
    CheckReady { item: PathBuf },
    /// List built-in source presets and the configured sources, expanded.
    Sources,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(error) if error.not_found() => {}
        Err(error) => eprintln!("failed to load .env: {error}"),
    }
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config_path).await,
        Command::Doctor => server::doctor(config_path).await,
        Command::Status => server::status(config_path).await,
        Command::Ask {
            tool,
            description,
            session_id,
            permission_id,
            token,
            wait,
        } => {
            commands::ask(
                config_path,
                commands::AskRequest {
                    session_id,
                    permission_id,
                    tool,
                    description,
                    use_token: token,
                    wait: Duration::from_secs(wait),
                },
            )
            .await
        }
        Command::Notify {
            title,
            message,
            priority,
            tags,
        } => commands::notify(config_path, &title, &message, priority, tags).await,
        Command::CheckReady { item } => commands::check_ready(config_path, &item).await,
        Command::Sources => commands::sources(config_path).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,opencode_pilot=debug,pilot_app=debug,pilot_ipc=debug,pilot_auth=debug,pilot_notify=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("PILOT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported PILOT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_defaults_to_serve() {
        let cli = Cli::try_parse_from(["opencode-pilot"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn ask_parses_flags() {
        let cli = Cli::try_parse_from([
            "opencode-pilot",
            "ask",
            "--tool",
            "bash",
            "--permission-id",
            "p1",
            "--token",
            "run migrations",
        ])
        .expect("parse");
        let Some(Command::Ask {
            tool,
            description,
            permission_id,
            token,
            wait,
            ..
        }) = cli.command
        else {
            panic!("expected ask");
        };
        assert_eq!(tool, "bash");
        assert_eq!(description, "run migrations");
        assert_eq!(permission_id.as_deref(), Some("p1"));
        assert!(token);
        assert_eq!(wait, 300);
    }

    #[test]
    fn sources_subcommand_parses() {
        let cli = Cli::try_parse_from(["opencode-pilot", "sources"]).expect("parse");
        assert!(matches!(cli.command, Some(Command::Sources)));
    }

    #[test]
    fn panic_payload_handles_str_and_string() {
        let s: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(s.as_ref()), "boom");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(s.as_ref()), "bang");
        let s: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_payload_to_string(s.as_ref()), "non-string panic payload");
    }
}
