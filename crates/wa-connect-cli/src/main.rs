// wa-connect CLI — operator tooling for the connection engine
// Everything here runs against the same SQLite store and config the
// ConnectionManager uses; nothing opens a WhatsApp session.

use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use serde::Serialize;
use std::path::PathBuf;
use wa_connect::engine::paths;
use wa_connect::engine::whatsapp::{self, classify_parts, qr, ConnectionConfig, RetryPolicy};
use wa_connect::{EngineError, EngineResult, RemediationDecision, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "wa-connect")]
#[command(about = "WhatsApp multi-device connection manager — operator tools")]
#[command(version)]
struct Cli {
    /// Log at debug instead of info. RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Bot store database (defaults to the platform data dir)
    #[arg(long, global = true, env = "WA_CONNECT_DB", value_name = "FILE")]
    db: Option<PathBuf>,

    /// Connection config TOML; when absent the config stored in the database is used
    #[arg(long, global = true, env = "WA_CONNECT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a pairing payload as a QR data URI (raw payload on failure)
    Qr {
        payload: String,
        /// Minimum rendered size in pixels
        #[arg(long)]
        min_dimension: Option<u32>,
    },
    /// Classify a disconnect into a remediation decision
    Classify {
        /// Status code reported by the transport
        #[arg(long)]
        status: Option<u16>,
        /// Error message
        #[arg(long, default_value = "")]
        message: String,
        /// Nested error code (e.g. device_removed)
        #[arg(long)]
        nested: Option<String>,
    },
    /// Print the retry schedule: delay and profile for every attempt
    Backoff {
        #[arg(long, value_enum, default_value = "simple")]
        decision: DecisionArg,
    },
    /// Print the effective config as TOML
    Config {
        /// Store the effective config in the database
        #[arg(long)]
        save: bool,
    },
    /// Bot records
    Bot {
        #[command(subcommand)]
        action: BotAction,
    },
    /// Subscription plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Subscriptions
    Subscription {
        #[command(subcommand)]
        action: SubscriptionAction,
    },
    /// Mark active bots past their expiry as expired and clear their sessions
    Expire,
    /// Remove Working Areas left behind by a previous process
    Purge,
}

#[derive(Subcommand, Debug)]
enum BotAction {
    Add {
        id: String,
        #[arg(long)]
        subscription: Option<String>,
    },
    Show {
        id: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum PlanAction {
    Add { id: String, name: String, duration_days: i64 },
    List,
}

#[derive(Subcommand, Debug)]
enum SubscriptionAction {
    Add {
        id: String,
        #[arg(long)]
        plan: String,
        #[arg(long)]
        owner: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DecisionArg {
    Simple,
    Different,
}

impl From<DecisionArg> for RemediationDecision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Simple => RemediationDecision::RetrySimple,
            DecisionArg::Different => RemediationDecision::RetryDifferentApproach,
        }
    }
}

#[derive(Serialize)]
struct ScheduleRow {
    attempt: u32,
    delay_ms: u128,
    profile: String,
}

fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        _ => "debug",
    }
}

fn init_logging(verbosity: u8) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level(verbosity)))
        .format_timestamp_millis()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> EngineResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(cli: &Cli) -> EngineResult<SessionStore> {
    let path = cli.db.clone().unwrap_or_else(paths::engine_db_path);
    debug!("[cli] store: {}", path.display());
    SessionStore::open(&path)
}

fn effective_config(cli: &Cli) -> EngineResult<ConnectionConfig> {
    match &cli.config {
        Some(path) => ConnectionConfig::from_toml_file(path),
        None => whatsapp::load_config(&open_store(cli)?),
    }
}

async fn run(cli: Cli) -> EngineResult<()> {
    match &cli.command {
        Command::Qr { payload, min_dimension } => {
            let min = match min_dimension {
                Some(v) => *v,
                None => effective_config(&cli)?.qr_min_dimension,
            };
            let (rendered, degraded) = qr::render(payload.clone(), min).await;
            if let Some(e) = degraded {
                eprintln!("QR encoding failed ({}); showing raw payload", e);
            }
            println!("{}", rendered.as_str());
        }

        Command::Classify { status, message, nested } => {
            let decision = classify_parts(*status, message, nested.as_deref());
            println!("{}", decision);
        }

        Command::Backoff { decision } => {
            let config = effective_config(&cli)?;
            let policy = RetryPolicy::from_config(&config);
            let decision = RemediationDecision::from(*decision);
            let mut rows = Vec::new();
            let mut profile_index = 0;
            for count in 0..policy.max_retry_attempts() {
                if let whatsapp::RetryPlan::Retry { delay, profile_index: next, .. } =
                    policy.plan(decision, count, profile_index)
                {
                    profile_index = next;
                    rows.push(ScheduleRow {
                        attempt: count + 1,
                        delay_ms: delay.as_millis(),
                        profile: config.profiles[next].to_string(),
                    });
                }
            }
            print_json(&rows)?;
        }

        Command::Config { save } => {
            let config = effective_config(&cli)?;
            if *save {
                whatsapp::save_config(&open_store(&cli)?, &config)?;
            }
            print!("{}", config.to_toml_string()?);
        }

        Command::Bot { action } => {
            let store = open_store(&cli)?;
            match action {
                BotAction::Add { id, subscription } => print_json(&store.create_bot(id, subscription.as_deref())?)?,
                BotAction::Show { id } => match store.get_bot(id)? {
                    Some(bot) => print_json(&bot)?,
                    None => return Err(EngineError::Other(format!("Unknown bot '{}'", id))),
                },
                BotAction::List => print_json(&store.list_bots()?)?,
            }
        }

        Command::Plan { action } => {
            let store = open_store(&cli)?;
            match action {
                PlanAction::Add { id, name, duration_days } => {
                    print_json(&store.create_plan(id, name, *duration_days)?)?
                }
                PlanAction::List => print_json(&store.list_plans()?)?,
            }
        }

        Command::Subscription { action } => {
            let store = open_store(&cli)?;
            match action {
                SubscriptionAction::Add { id, plan, owner } => {
                    print_json(&store.create_subscription(id, plan, owner)?)?
                }
            }
        }

        Command::Expire => {
            let expired = open_store(&cli)?.expire_due(chrono::Utc::now())?;
            println!("{} bot(s) expired", expired);
        }

        Command::Purge => {
            let config = effective_config(&cli)?;
            let removed = whatsapp::purge_orphans(&config.sessions_root).await?;
            println!("{} working area(s) removed from {}", removed, config.sessions_root.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
