use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hbm_core::{render_events, render_subscriptions};
use hbm_storage::SubscriptionStore;
use hbm_sync::{build_source, query_once, Bot, BotConfig, Notification, Notifier};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hbm-cli")]
#[command(about = "Hiking Buddies event bot")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the bot with stdin as a chat; notifications print to stdout.
    Run {
        #[arg(long, default_value_t = 1)]
        chat_id: i64,
    },
    /// Fetch the listing once and print the result of a command.
    Query {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Create the subscription table if it does not exist.
    Migrate,
    /// Print stored subscriptions.
    Subscriptions {
        #[arg(long)]
        chat_id: Option<i64>,
    },
}

struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        println!("[chat {}] {}", notification.chat_id, notification.render());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = BotConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { chat_id: 1 }) {
        Commands::Run { chat_id } => run(&config, chat_id).await?,
        Commands::Query { command, args } => {
            let source = build_source(&config)?;
            let events = query_once(&source, &command, &args).await?;
            println!("{}", render_events(&events));
        }
        Commands::Migrate => {
            let store = SubscriptionStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            let count = store.load_all().await?.len();
            store.close().await;
            println!("schema ready: {} ({count} subscriptions)", config.database_url);
        }
        Commands::Subscriptions { chat_id } => {
            let store = SubscriptionStore::connect(&config.database_url).await?;
            let mut subs = store.load_all().await?;
            store.close().await;
            if let Some(chat_id) = chat_id {
                subs.retain(|s| s.chat_id == chat_id);
            }
            println!("{}", render_subscriptions(&subs));
        }
    }

    Ok(())
}

async fn run(config: &BotConfig, chat_id: i64) -> Result<()> {
    info!(
        crates = ?[
            hbm_core::CRATE_NAME,
            hbm_storage::CRATE_NAME,
            hbm_adapters::CRATE_NAME,
            hbm_sync::CRATE_NAME,
        ],
        database = %config.database_url,
        "starting bot"
    );
    let source = Arc::new(build_source(config)?);
    let bot = Bot::start(config, source, Arc::new(ConsoleNotifier)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let mut words = line.split_whitespace();
                    let Some(command) = words.next() else { continue };
                    let args = words.collect::<Vec<_>>();
                    match bot.handle_command(chat_id, command, &args) {
                        Ok(reply) => println!("{}", reply.render()),
                        Err(err) => println!("{err}"),
                    }
                }
                Ok(None) => {
                    info!("stdin closed, running until interrupted");
                    stdin_open = false;
                }
                Err(err) => {
                    warn!(error = %err, "reading stdin failed");
                    stdin_open = false;
                }
            },
        }
    }

    if !bot.shutdown().await {
        warn!("some background loops did not stop in time");
    }
    Ok(())
}
