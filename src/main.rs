use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use scopestore::{config, with_lock, Endpoint, PoolRegistry, ScopedStore, Store};

const DEFAULT_ENDPOINT: &str = "redis://127.0.0.1:6379";

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "scopestore", about = "Scoped records and FIFO locks on KeyDB / Redis")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Engine URI; overrides the config file and SCOPESTORE_ENDPOINT.
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the JSON value of KEY in SCOPE.
    Get { scope: String, key: String },
    /// Store a JSON value under KEY in SCOPE.
    Set {
        scope: String,
        key: String,
        json: String,
    },
    /// List the keys of SCOPE.
    Keys { scope: String },
    /// Remove one or more keys from SCOPE.
    Delete {
        scope: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Remove every key in SCOPE.
    Clear { scope: String },
    /// Run a command while holding the lock NAME.
    Lock {
        name: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the metrics registry in Prometheus text format.
    Metrics,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run(cli: Cli, registry: &PoolRegistry, endpoint: &Endpoint) -> Result<ExitCode> {
    match cli.command {
        Command::Get { scope, key } => {
            let store = ScopedStore::new(registry, endpoint, &scope);
            match store.get(&key).await? {
                Some(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("{key}: not found in scope {scope}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Set { scope, key, json } => {
            let value: serde_json::Value =
                serde_json::from_str(&json).with_context(|| format!("invalid JSON for {key}"))?;
            ScopedStore::new(registry, endpoint, &scope)
                .set(&key, &value)
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Keys { scope } => {
            let mut keys: Vec<String> = ScopedStore::new(registry, endpoint, &scope)
                .keys()
                .await?
                .into_iter()
                .collect();
            keys.sort();
            for key in keys {
                println!("{key}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { scope, keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            ScopedStore::new(registry, endpoint, &scope)
                .delete(&keys)
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear { scope } => {
            ScopedStore::new(registry, endpoint, &scope).clear().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Lock { name, command } => {
            let status = with_lock(registry, endpoint, &name, |ctx| async move {
                tracing::info!(lock = %ctx.name(), token = %ctx.token(), "running locked command");
                let (program, args) = command
                    .split_first()
                    .context("no command given")?;
                tokio::process::Command::new(program)
                    .args(args)
                    .status()
                    .await
                    .with_context(|| format!("failed to run {program}"))
            })
            .await?;
            let code = status.code().unwrap_or(1);
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Command::Metrics => {
            print!("{}", registry.metrics().encode());
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load(cli.config.as_deref())?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let uri = cli
        .endpoint
        .clone()
        .or_else(|| config.endpoint.clone())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let endpoint: Endpoint = uri
        .parse()
        .with_context(|| format!("invalid endpoint {uri:?}"))?;

    tracing::debug!(%endpoint, layout = ?config.layout, serializer = %config.serializer, "starting scopestore");

    let registry = PoolRegistry::redis(config).context("failed to build pool registry")?;
    run(cli, &registry, &endpoint).await
}
