//! tagmq – runs the delivery engine as a daemon, or exercises it in-process.
//
//  $ tagmq start --config tagmq.toml
//  $ tagmq check --config tagmq.toml
//  $ tagmq demo --items 100
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use tagmq::core::message::Ack;
use tagmq::logging::init_logging;
use tagmq::shutdown::{shutdown_coordinator, wait_for_signal};
use tagmq::{load_config, metrics, Config, Coordinator, EnqueueItem, KeyValues, LocalAdmission, TagQuery};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "tagmq", version, about = "tagmq delivery engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the engine and wait for SIGINT/SIGTERM.
    Start {
        /// Path to config TOML (env TAGMQ_CONFIG overrides)
        #[arg(short, long, default_value = "tagmq.toml")]
        config: String,
    },
    /// Parse a config file and print the effective settings.
    Check {
        #[arg(short, long, default_value = "tagmq.toml")]
        config: String,
    },
    /// Push items through an in-process engine and print the counters.
    Demo {
        #[arg(short, long, default_value_t = 10)]
        items: usize,
    },
}

fn read_config(path: String) -> Config {
    let path: String = std::env::var("TAGMQ_CONFIG").unwrap_or(path);
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[FATAL] Failed to load config {path}: {e}");
            process::exit(1);
        }
    }
}

fn build(config: &Config) -> Coordinator {
    let admission = LocalAdmission::with_rules(
        config.admission.rules.clone(),
        config.admission.overrides.clone(),
    );
    Coordinator::new(Arc::new(admission), &config.broker)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg = read_config(config);
            init_logging(&cfg.logging.level)?;
            let coordinator = build(&cfg);
            metrics::set_ready(true);
            info!(
                rules = cfg.admission.rules.len(),
                overrides = cfg.admission.overrides.len(),
                "tagmq engine ready"
            );

            wait_for_signal().await?;
            metrics::set_ready(false);
            shutdown_coordinator(&coordinator, SHUTDOWN_TIMEOUT).await;
            print!("{}", metrics::snapshot());
        }
        Command::Check { config } => {
            let cfg = read_config(config);
            println!("{cfg:#?}");
        }
        Command::Demo { items } => {
            init_logging("info")?;
            demo(items).await?;
        }
    }
    Ok(())
}

async fn demo(items: usize) -> anyhow::Result<()> {
    let mut cfg = Config::default();
    cfg.broker.min_heartbeat_timeout_ms = 100;
    let coordinator = build(&cfg);

    for i in 0..items {
        let tags = KeyValues::new()
            .with("demo", "true")
            .with("shard", (i % 3).to_string());
        let item = EnqueueItem::new(format!("item-{i}"), tags, Duration::from_secs(1));
        coordinator.enqueue("demo", item).await?;
    }

    let query = TagQuery::Subset(KeyValues::new().with("demo", "true"));
    for _ in 0..items {
        let delivery = coordinator
            .dequeue("demo", query.clone(), CancellationToken::new())
            .await?;
        let item = delivery.commit();
        coordinator
            .ack(
                "demo",
                Ack {
                    item_id: item.id,
                    tags: item.tags,
                    passed: true,
                },
            )
            .await?;
    }

    coordinator.shutdown().await;
    print!("{}", metrics::snapshot());
    Ok(())
}
