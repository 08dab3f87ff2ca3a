use clap::{Parser, Subcommand};
use mimir::{CacheError, Manager, TaskScope, Value};
use tracing::{error, info};
use tracing_appender::non_blocking;
// no EnvFilter feature; use a simple level switch via RUST_LOG

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "mimir")]
#[command(about = "Pooled cache access over file and remote stores")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/simple.yaml")]
    config: String,

    /// Group to use (defaults to the configured default group)
    #[arg(short, long)]
    group: Option<String>,

    /// Shard key within the group
    #[arg(short = 'k', long = "key")]
    shard: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Print a value
    Get { key: String },
    /// Store a value (parsed as JSON when possible)
    Set {
        key: String,
        value: String,
        /// Expiry in seconds, 0 = shard default
        #[arg(long)]
        ttl: Option<u64>,
    },
    Has { key: String },
    Incr {
        key: String,
        #[arg(long, default_value_t = 1)]
        step: i64,
    },
    Decr {
        key: String,
        #[arg(long, default_value_t = 1)]
        step: i64,
    },
    Delete { key: String },
    /// Remove every record in the shard
    Clear,
    /// Print pool statistics
    Stats,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // Map RUST_LOG to a max level (debug/info/warn/error/trace)
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "warn".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::WARN,
    };

    let _ = fmt.with_max_level(level).try_init();
}

/// Command-line values are JSON when they parse, strings otherwise
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn execute(
    manager: &Manager,
    scope: &mut TaskScope,
    group: Option<&str>,
    shard: Option<&str>,
    command: &Command,
) -> Result<String, CacheError> {
    // Pin the selected shard; the verbs below follow the scope's last shard
    manager.connection(scope, shard, group).await?;

    let output = match command {
        Command::Get { key } => match manager.get(scope, key).await? {
            Some(value) => value.to_string(),
            None => "(nil)".to_string(),
        },
        Command::Set { key, value, ttl } => manager
            .set(scope, key, &parse_value(value), *ttl)
            .await?
            .to_string(),
        Command::Has { key } => manager.has(scope, key).await?.to_string(),
        Command::Incr { key, step } => manager.incr(scope, key, *step).await?.to_string(),
        Command::Decr { key, step } => manager.decr(scope, key, *step).await?.to_string(),
        Command::Delete { key } => manager.delete(scope, key).await?.to_string(),
        Command::Clear => manager.clear(scope).await?.to_string(),
        Command::Stats => manager
            .stats()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
    };

    Ok(output)
}

/// Run one command. Returns `None` when `shutdown` fires first.
async fn run_with_config_path_and_shutdown(
    config_path: &str,
    group: Option<&str>,
    shard: Option<&str>,
    command: &Command,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let manager = Manager::from_yaml_file(config_path).await?;
    let mut scope = manager.scope();

    let outcome = tokio::select! {
        result = execute(&manager, &mut scope, group, shard, command) => Some(result),
        _ = shutdown => {
            info!("Shutdown signal received");
            None
        }
    };
    scope.close();

    match outcome {
        Some(Ok(output)) => Ok(Some(output)),
        Some(Err(e)) => {
            error!("Command failed: {}", e);
            Err(e.into())
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    info!("Starting mimir with {}", args.config);

    let output = run_with_config_path_and_shutdown(
        &args.config,
        args.group.as_deref(),
        args.shard.as_deref(),
        &args.command,
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    )
    .await?;

    if let Some(output) = output {
        println!("{}", output);
    }
    Ok(())
}
