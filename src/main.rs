use anyhow::Context;
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use prod_sync::auth::{AuthConfig, TokenIssuer};
use prod_sync::config::{parse_table_list, ConflictPolicy, IsolationLevel, SyncTarget};
use prod_sync::postgres::{ConnectionManager, Endpoint};
use prod_sync::report::ReportWriter;
use prod_sync::{settings, sync_from_production, CancelSignal, Config, SyncResult, SyncStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "prod-sync")]
#[command(about = "Refresh a local PostgreSQL database from production", long_about = None)]
struct Args {
    #[arg(short, long, global = true, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, global = true, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy production tables into the local database (default)
    Sync(SyncArgs),
    /// Insert settings rows that do not exist yet
    SeedSettings {
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value = "settings")]
        table: String,
        #[arg(long, default_value = "public")]
        schema: String,
    },
    /// Print a signed bearer token
    IssueToken {
        #[arg(long)]
        subject: String,
        #[arg(long, default_value = "admin")]
        role: String,
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct SyncArgs {
    #[arg(long, help = "Rows per batch")]
    batch_size: Option<usize>,

    #[arg(long, value_name = "T1,T2", help = "Only sync these tables")]
    tables: Option<String>,

    #[arg(long, help = "Per-call timeout in seconds")]
    timeout_secs: Option<u64>,

    #[arg(long, help = "Schema to sync on both sides")]
    schema: Option<String>,

    #[arg(long, value_name = "POLICY", help = "source-wins or insert-only")]
    conflict_policy: Option<String>,

    #[arg(long, value_name = "LEVEL", help = "read-committed, repeatable-read or serializable")]
    isolation: Option<String>,

    #[arg(long, help = "Delete target rows of planned tables before copying")]
    clean_target: bool,

    #[arg(long, value_name = "FILE", help = "Also write the result to this file")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    match args.command.unwrap_or_else(|| Command::Sync(SyncArgs::default())) {
        Command::Sync(sync_args) => run_sync(sync_args).await,
        Command::SeedSettings {
            file,
            table,
            schema,
        } => seed(file, table, schema).await,
        Command::IssueToken {
            subject,
            role,
            ttl_minutes,
        } => {
            let issuer = TokenIssuer::new(AuthConfig::from_env()?);
            let token = issuer.issue(&subject, &role, chrono::Duration::minutes(ttl_minutes))?;
            println!("{}", token);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(args: &SyncArgs) -> anyhow::Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration")?;

    if let Some(batch_size) = args.batch_size {
        config.sync.batch_size = batch_size;
    }
    if let Some(tables) = &args.tables {
        config.sync.tables = Some(parse_table_list(tables));
    }
    if let Some(timeout) = args.timeout_secs {
        config.sync.call_timeout_secs = timeout;
    }
    if let Some(schema) = &args.schema {
        config.sync.schema = schema.clone();
    }
    if let Some(policy) = &args.conflict_policy {
        config.sync.conflict_policy = policy.parse::<ConflictPolicy>()?;
    }
    if let Some(level) = &args.isolation {
        config.sync.isolation = level.parse::<IsolationLevel>()?;
    }
    if args.clean_target {
        config.sync.clean_target = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run_sync(args: SyncArgs) -> anyhow::Result<ExitCode> {
    info!("Starting prod-sync");
    let config = load_config(&args)?;

    info!(
        source_host = %config.source.host,
        source_port = %config.source.port,
        source_database = %config.source.database,
        target_host = %config.target.host,
        target_port = %config.target.port,
        target_database = %config.target.database,
        schema = %config.sync.schema,
        tables = ?config.sync.tables,
        batch_size = config.sync.batch_size,
        "Configuration summary"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested, finishing the current batch");
            let _ = cancel_tx.send(true);
        }
    });

    let started_at = Utc::now();
    let result = match sync_from_production(&config, CancelSignal::new(cancel_rx)).await {
        Ok(result) => result,
        Err(e) => SyncResult::aborted(started_at, Utc::now(), &e),
    };

    if let Some(path) = &args.report {
        ReportWriter::new(path)
            .save(&result)
            .await
            .with_context(|| format!("Failed to write report to {:?}", path))?;
    }
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(match result.status {
        SyncStatus::Success => ExitCode::SUCCESS,
        SyncStatus::PartialFailure => {
            error!(tables = ?result.failed_tables(), "Some tables failed to sync");
            ExitCode::from(2)
        }
        SyncStatus::Failure => ExitCode::from(1),
        SyncStatus::Cancelled => ExitCode::from(130),
    })
}

async fn seed(file: PathBuf, table: String, schema: String) -> anyhow::Result<ExitCode> {
    let target = SyncTarget::local_from_env().context("Failed to load target configuration")?;
    let rows = settings::load_settings(&file)
        .await
        .with_context(|| format!("Failed to read settings from {:?}", file))?;

    let mut connections = ConnectionManager::new();
    let pool = connections.open(Endpoint::Target, &target).await?;
    let mut conn = pool.acquire().await?;
    let inserted = settings::seed_settings(&mut conn, &schema, &table, &rows).await?;
    conn.release();
    connections.close();

    info!(inserted, total = rows.len(), "Settings seeded");
    Ok(ExitCode::SUCCESS)
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("prod_sync=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("prod_sync=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
