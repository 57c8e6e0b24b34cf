use clap::{Parser, Subcommand};
use creditsync::storage::{Namespace, StorageEngine};
use creditsync::sync::SyncHistory;
use creditsync::{ClientConfig, MutationQueue, OptimisticLedger};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "creditsync")]
#[command(about = "Inspect the offline queue and credit ledger of a device", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Data directory path (overrides the configuration file)
    #[arg(long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Balance, queue length and last server sync
    Status,
    /// Pending mutations, oldest first
    Queue,
    /// Full ledger snapshot
    Ledger,
    /// Stored records
    Records {
        /// Only keys starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Settled replays, newest first
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete every stored record (queue and ledger are kept)
    ClearRecords,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "creditsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => {
            let mut config = ClientConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir.into();
    }

    let engine = StorageEngine::open(&config.data_dir)?;
    let clock = engine.clock();

    match args.command {
        Command::Status => {
            let queue = MutationQueue::open(engine.store(Namespace::Queue), clock)?;
            let ledger = OptimisticLedger::open(engine.store(Namespace::Ledger), 1)?;
            let snapshot = ledger.snapshot();
            let status = serde_json::json!({
                "data_dir": config.data_dir,
                "user_id": config.user_id,
                "visible_balance": snapshot.visible_balance(),
                "confirmed_balance": snapshot.confirmed_balance,
                "pending_transactions": snapshot.pending_deltas.len(),
                "pending_mutations": queue.len()?,
                "last_server_sync_at": snapshot.last_server_sync_at,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Queue => {
            let queue = MutationQueue::open(engine.store(Namespace::Queue), clock)?;
            for entry in queue.entries()? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Ledger => {
            let ledger = OptimisticLedger::open(engine.store(Namespace::Ledger), 1)?;
            println!("{}", serde_json::to_string_pretty(&ledger.snapshot())?);
        }
        Command::Records { prefix } => {
            for record in engine.store(Namespace::Records).scan_prefix(&prefix, None)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::History { limit } => {
            let history =
                SyncHistory::new(engine.store(Namespace::History), clock, config.history_limit);
            for entry in history.recent(limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::ClearRecords => {
            engine.store(Namespace::Records).clear()?;
            tracing::info!("Cleared records in {}", config.data_dir.display());
        }
    }

    engine.flush()?;
    Ok(())
}
