use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wayfarer_core::{load_config, WayfarerConfig};
use wayfarer_gateway::{spawn_session_reaper, Gateway};
use wayfarer_memory::{ConversationStore, SqliteConversationStore};
use wayfarer_schema::{AuthLevel, Channel, InboundMessage};
use wayfarer_server::state::AppState;

#[derive(Parser)]
#[command(name = "wayfarer", version, about = "wayfarer travel assistant")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.wayfarer/config",
        help = "Config root directory (contains wayfarer.yaml)"
    )]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the HTTP and voice server")]
    Serve {
        #[arg(long, help = "Override the port from server.bind")]
        port: Option<u16>,
    },
    #[command(about = "Local REPL against the assistant")]
    Chat {
        #[arg(long, default_value = "local", help = "User id to chat as")]
        user: String,
        #[arg(long, default_value = "authenticated", value_parser = parse_level)]
        level: AuthLevel,
    },
    #[command(about = "Validate the config file")]
    Validate,
    #[command(about = "Print a user's stored conversation")]
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn parse_level(raw: &str) -> Result<AuthLevel, String> {
    match raw {
        "public" => Ok(AuthLevel::Public),
        "authenticated" => Ok(AuthLevel::Authenticated),
        "admin" => Ok(AuthLevel::Admin),
        other => Err(format!(
            "unknown level '{other}' (expected public, authenticated or admin)"
        )),
    }
}

fn expand_tilde(path: PathBuf) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path;
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path,
    }
}

/// `host:port` with the port replaced.
fn bind_with_port(bind: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => {
            let host = bind.rsplit_once(':').map_or(bind, |(host, _)| host);
            format!("{host}:{port}")
        }
        None => bind.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = expand_tilde(cli.config_root);

    let log_dir = root.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log dir: {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "wayfarer.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Validate => {
            let config = load_config(&root)?;
            print_summary(&config, &root);
        }
        Commands::Serve { port } => serve(&root, port).await?,
        Commands::Chat { user, level } => run_repl(&root, &user, level).await?,
        Commands::History { user, limit } => print_history(&root, &user, limit).await?,
    }

    Ok(())
}

fn print_summary(config: &WayfarerConfig, root: &Path) {
    println!("Config valid.");
    println!("  server:   {}", config.server.bind);
    println!(
        "  provider: {:?} ({})",
        config.provider.provider_type, config.provider.model
    );
    println!("  storage:  {}", config.storage_path(root).display());
    println!(
        "  limits:   chat {}/{}s, voice {}/{}s, tool_heavy {}/{}s",
        config.rate_limits.chat.limit,
        config.rate_limits.chat.window_secs,
        config.rate_limits.voice.limit,
        config.rate_limits.voice.window_secs,
        config.rate_limits.tool_heavy.limit,
        config.rate_limits.tool_heavy.window_secs,
    );
    let voice = if config.voice.transcriber_url.is_some() && config.voice.synthesizer_url.is_some()
    {
        "enabled"
    } else {
        "disabled"
    };
    println!("  voice:    {voice}");
}

async fn serve(root: &Path, port: Option<u16>) -> Result<()> {
    let config = load_config(root)?;
    let bind = bind_with_port(&config.server.bind, port);
    let gateway = Arc::new(Gateway::from_config(&config, root)?);

    let shutdown = CancellationToken::new();
    let reaper = spawn_session_reaper(gateway.clone(), shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            return;
        }
        tracing::info!("shutdown requested");
        signal.cancel();
    });

    let state = AppState::new(root, gateway.clone());
    let served = wayfarer_server::serve(state, &bind, shutdown.clone()).await;
    shutdown.cancel();
    let _ = reaper.await;
    gateway.orchestrator().settle_all().await;
    served
}

async fn run_repl(root: &Path, user: &str, level: AuthLevel) -> Result<()> {
    let config = load_config(root)?;
    let gateway = Gateway::from_config(&config, root)?;

    println!("wayfarer REPL as {user} ({}). Type 'quit' to exit.", level.as_str());
    println!("---");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input == "quit" || input == "exit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        let inbound = InboundMessage::new(user, Channel::Repl, input).with_auth_level(level);
        match gateway.handle_chat(inbound).await {
            Ok(out) => {
                println!("{}", out.text);
                for entry in &out.tool_trace {
                    println!("  [tool {} {:?} {}ms]", entry.tool, entry.status, entry.duration_ms);
                }
            }
            Err(err) => eprintln!("Error: {err}"),
        }
    }

    gateway.orchestrator().settle(user).await;
    Ok(())
}

async fn print_history(root: &Path, user: &str, limit: usize) -> Result<()> {
    let config = load_config(root)?;
    let store = SqliteConversationStore::open(config.storage_path(root))?;
    let Some(conversation) = store.get_conversation(user).await? else {
        println!("No conversation for {user}.");
        return Ok(());
    };

    let messages = store.fetch_last_messages(conversation.id, limit).await?;
    for message in messages {
        println!(
            "{} {:<9} {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.role.as_str(),
            message.content
        );
    }
    Ok(())
}
