//! queuelite CLI: publish, consume and inspect a queue directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use queuelite::config::Config;
use queuelite::consumer::Consumer;
use queuelite::hook::{CommandHook, DEFAULT_ABORT_EXIT_CODE};
use queuelite::model::MessageId;
use queuelite::signal::ShutdownSignal;
use queuelite::storage::{Storage, StorageOptions};
use queuelite::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "queuelite", about = "Filesystem-persisted priority work queue")]
struct Cli {
    /// Queue data directory
    #[arg(long, env = "QUEUELITE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,
    /// Consumer identity; names the working directory (default: process id)
    #[arg(long, env = "QUEUELITE_CONSUMER_ID", global = true)]
    consumer_id: Option<String>,
    /// TOML config file; flags above override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a JSON message
    Publish {
        /// Message body (JSON)
        body: String,
        /// Priority 1 (highest) to 9 (lowest) [default: 5]
        #[arg(long)]
        priority: Option<u8>,
    },
    /// Run the consumer loop, handing each message to a command
    Consume {
        /// Executable run once per delivery, body on stdin
        #[arg(long)]
        command: PathBuf,
        /// Hook exit code meaning "abort this message"
        #[arg(long, default_value_t = DEFAULT_ABORT_EXIT_CODE)]
        abort_exit_code: i32,
    },
    /// List message ids in an area
    List {
        #[arg(long, value_enum, default_value_t = Area::Pending)]
        state: Area,
    },
    /// Print a message body
    Show {
        id: String,
        #[arg(long, value_enum, default_value_t = Area::Pending)]
        state: Area,
    },
    /// Message counts per area
    Stats,
    /// Return this consumer's claimed messages to pending
    Recover,
    /// Move an aborted message back to pending
    Requeue { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Area {
    Pending,
    Working,
    Abort,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Consume {
            command,
            abort_exit_code,
        } => cmd_consume(config, command, abort_exit_code).await,
        Command::Publish { body, priority } => {
            let storage = open(&config, false).await?;
            finish(&storage, cmd_publish(&storage, &body, priority).await).await
        }
        Command::List { state } => {
            let storage = open(&config, false).await?;
            finish(&storage, cmd_list(&storage, state).await).await
        }
        Command::Show { id, state } => {
            let storage = open(&config, false).await?;
            finish(&storage, cmd_show(&storage, &id, state).await).await
        }
        Command::Stats => {
            let storage = open(&config, false).await?;
            finish(&storage, cmd_stats(&storage).await).await
        }
        Command::Recover => {
            let storage = open(&config, false).await?;
            finish(&storage, cmd_recover(&storage).await).await
        }
        Command::Requeue { id } => {
            let storage = open(&config, false).await?;
            finish(&storage, cmd_requeue(&storage, &id).await).await
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match (&cli.config, &cli.data_dir) {
        (Some(path), _) => Config::from_file(path)?,
        (None, Some(dir)) => Config::new(dir),
        (None, None) => Config::from_env()?,
    };
    if let Some(ref dir) = cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(ref id) = cli.consumer_id {
        config.consumer_id = id.clone();
    }
    Ok(config)
}

async fn open(config: &Config, watch: bool) -> anyhow::Result<Storage> {
    let options = StorageOptions {
        watch,
        ..config.storage_options()
    };
    Ok(Storage::open(&config.data_dir, &config.consumer_id, options).await?)
}

/// Short-lived handles never claim; don't leave an empty working dir behind.
async fn finish(storage: &Storage, result: anyhow::Result<()>) -> anyhow::Result<()> {
    storage.prune_working_dir().await?;
    result
}

async fn cmd_consume(config: Config, command: PathBuf, abort_exit_code: i32) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "queuelite".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let storage = Arc::new(open(&config, true).await?);
    let consumer = Consumer::new(storage);
    let hook = CommandHook::new(&command)?.abort_exit_code(abort_exit_code);

    consumer.shutdown_on(ShutdownSignal::install()?.recv());

    consumer
        .run(|body: serde_json::Value, delivery| {
            let hook = hook.clone();
            async move { hook.handle(body, delivery).await }
        })
        .await?;
    consumer.close().await?;
    Ok(())
}

async fn cmd_publish(storage: &Storage, body: &str, priority: Option<u8>) -> anyhow::Result<()> {
    let body: serde_json::Value = serde_json::from_str(body)?;
    let id = storage.enqueue(&body, priority).await?;
    println!("{id}");
    Ok(())
}

async fn cmd_list(storage: &Storage, state: Area) -> anyhow::Result<()> {
    let ids = match state {
        Area::Pending => storage.list_pending().await?,
        Area::Working => storage.list_working().await?,
        Area::Abort => storage.list_aborted().await?,
    };
    if ids.is_empty() {
        println!("No messages.");
        return Ok(());
    }

    println!("{:<24}  {:<3}  ENQUEUED", "ID", "PRI");
    println!("{}", "-".repeat(60));
    for id in &ids {
        println!(
            "{:<24}  {:<3}  {}",
            id.to_string(),
            id.priority(),
            id.enqueued_at().format("%Y-%m-%d %H:%M:%S%.3f")
        );
    }
    println!("\n{} message(s)", ids.len());
    Ok(())
}

async fn cmd_show(storage: &Storage, id: &str, state: Area) -> anyhow::Result<()> {
    let id: MessageId = id.parse()?;
    let body: serde_json::Value = match state {
        Area::Pending => storage.read_pending(&id).await?,
        Area::Working => storage.read_claimed(&id).await?,
        Area::Abort => storage.read_aborted(&id).await?,
    };
    println!("ID:        {id}");
    println!("Priority:  {}", id.priority());
    println!("Enqueued:  {}", id.enqueued_at());
    println!("Body:      {}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_stats(storage: &Storage) -> anyhow::Result<()> {
    let stats = storage.stats().await?;
    println!("queue:    {}", storage.data_dir().display());
    println!("pending:  {}", stats.pending);
    println!("working:  {}", stats.working);
    println!("aborted:  {}", stats.aborted);
    Ok(())
}

async fn cmd_recover(storage: &Storage) -> anyhow::Result<()> {
    let recovered = storage.recover_in_flight().await?;
    println!("Recovered {} message(s)", recovered.len());
    Ok(())
}

async fn cmd_requeue(storage: &Storage, id: &str) -> anyhow::Result<()> {
    let id: MessageId = id.parse()?;
    storage.requeue_aborted(&id).await?;
    println!("Requeued: {id}");
    Ok(())
}
