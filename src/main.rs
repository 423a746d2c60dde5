#![warn(clippy::all, rust_2018_idioms)]

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dbfleet::app::fleet::{
    CacheResponse, Identity, JsonFileStore, KeyValueStore, OperationOutcome, OperationRequest,
};
use dbfleet::app::fleet_config::ALL_SCOPE;
use dbfleet::{FleetConfig, FleetService};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;

/// Fleet discovery and self-service operations for RDS instances across AWS accounts.
#[derive(Parser, Debug)]
#[command(name = "dbfleet", version)]
struct Cli {
    /// Path to the fleet configuration file
    #[arg(long, global = true, env = "DBFLEET_CONFIG", default_value = "dbfleet.toml")]
    config: PathBuf,

    /// Path to the JSON state file holding inventory and audit records
    #[arg(long, global = true, env = "DBFLEET_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover instances across the configured targets and reconcile the inventory
    Discover {
        /// `all`, or a single account id
        #[arg(long, default_value = ALL_SCOPE)]
        scope: String,
    },
    /// List the reconciled inventory
    Inventory {
        /// Include soft-deleted records
        #[arg(long, default_value_t = false)]
        include_removed: bool,
    },
    /// Run one operation against an instance
    Operate {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        operation: String,
        /// Caller identity
        #[arg(long)]
        user: String,
        /// Role memberships of the caller (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
        /// Operation parameter as key=value; values are parsed as JSON when possible
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, serde_json::Value)>,
    },
    /// Show the audit history of an instance, newest first
    Audit {
        #[arg(long)]
        instance: String,
    },
    /// Load and validate the configuration and target registry, then exit
    ValidateConfig,
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value: no `=` found in `{}`", s))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "dbfleet=info,aws_config=warn,aws_sigv4=warn,aws_smithy_runtime=warn,aws_smithy_runtime_api=warn,hyper=warn",
        )
    });

    let log_file = directories::ProjectDirs::from("com", "", "dbfleet").and_then(|proj_dirs| {
        let log_dir = proj_dirs.data_dir().join("logs");
        let _ = std::fs::create_dir_all(&log_dir);
        let log_path = log_dir.join("dbfleet.log");

        let file = match std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {:?}: {}", log_path, e);
                return None;
            }
        };

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = file.metadata() {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                if let Err(e) = std::fs::set_permissions(&log_path, perms) {
                    eprintln!("[SECURITY] Failed to set log file permissions: {}", e);
                }
            }
        }
        Some((file, log_path))
    });

    let result = match log_file {
        Some((file, log_path)) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .with_writer(move || match file.try_clone() {
                        Ok(f) => Box::new(f) as Box<dyn std::io::Write>,
                        Err(_) => Box::new(std::io::stderr()),
                    })
                    .with_ansi(false),
            );
            let result = tracing::subscriber::set_global_default(subscriber);
            tracing::info!("Logging initialized to: {:?}", log_path);
            result
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    // Bridge `log` records emitted by dependencies
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to initialize log-to-tracing bridge: {}", e);
    }
}

fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("com", "", "dbfleet")
        .map(|dirs| dirs.data_dir().join("state").join("dbfleet-store.json"))
        .unwrap_or_else(|| PathBuf::from("dbfleet-store.json"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("dbfleet failed: {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = FleetConfig::load_from_path(&cli.config)?;

    if let Command::ValidateConfig = cli.command {
        let registry = config.target_registry()?;
        print_json(&serde_json::json!({
            "valid": true,
            "home_account_id": config.home_account_id,
            "role_name": config.role_name,
            "accounts": registry.accounts().len(),
            "units": registry.units(),
        }))?;
        return Ok(ExitCode::SUCCESS);
    }

    let store_path = cli.store.unwrap_or_else(default_store_path);
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&store_path)?);
    let service = FleetService::from_aws(config, store).await?;

    match cli.command {
        Command::Discover { scope } => match service.discover(&scope).await {
            CacheResponse::Unavailable { reason } => {
                print_json(&serde_json::json!({
                    "state": "miss",
                    "scope": scope,
                    "unavailable": reason,
                }))?;
                Ok(ExitCode::from(2))
            }
            response => {
                let state = response.state();
                let snapshot = response
                    .into_payload()
                    .ok_or_else(|| anyhow!("discovery returned no payload"))?;
                print_json(&serde_json::json!({
                    "state": state.as_str(),
                    "scope": snapshot.scope,
                    "accounts_attempted": snapshot.run.accounts_attempted(),
                    "accounts_scanned": snapshot.run.accounts_scanned(),
                    "partial_error": snapshot.run.partial_error().map(|e| e.to_string()),
                    "run": snapshot.run,
                    "reconciliation": snapshot.reconciliation,
                }))?;
                Ok(ExitCode::SUCCESS)
            }
        },
        Command::Inventory { include_removed } => {
            let records = if include_removed {
                service.inventory().list_all().await?
            } else {
                service.inventory().list_active().await?
            };
            print_json(&records)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Operate {
            instance,
            operation,
            user,
            roles,
            params,
        } => {
            let identity = Identity::new(user, roles);
            let mut request = OperationRequest::new(instance, operation, identity);
            request.parameters.extend(params);
            let result = service.execute(request).await;
            print_json(&result)?;
            Ok(match result.outcome {
                OperationOutcome::Completed => ExitCode::SUCCESS,
                _ => ExitCode::from(3),
            })
        }
        Command::Audit { instance } => {
            print_json(&service.audit_history(&instance).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ValidateConfig => Ok(ExitCode::SUCCESS),
    }
}
