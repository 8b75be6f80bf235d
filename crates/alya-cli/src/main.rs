use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use alya_engine::JobManager;
use alya_registry::Registry;
use alya_schemas::NewRow;

#[derive(Parser)]
#[command(name = "alya")]
#[command(about = "Batch/slow-query job engine operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database maintenance commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },
    /// Batch lifecycle commands.
    Batch {
        #[command(subcommand)]
        cmd: BatchCmd,
    },
    /// Slow-query lifecycle commands.
    SlowQuery {
        #[command(subcommand)]
        cmd: SlowQueryCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum BatchCmd {
    /// Create a batch and submit its rows.
    Submit {
        #[arg(long)]
        app: String,
        #[arg(long)]
        op: String,
        /// Batch context, inline JSON (defaults to `{}`).
        #[arg(long, default_value = "{}")]
        ctx: String,
        /// Path to a JSON array of `{"line": N, "input": ...}` rows.
        #[arg(long)]
        rows: Option<String>,
        /// Hold rows briefly before they become claimable, to give a
        /// follow-up `batch append` a window to add more.
        #[arg(long)]
        wait_a_bit: bool,
    },
    /// Append more rows to an existing batch.
    Append {
        #[arg(long = "batch-id")]
        batch_id: Uuid,
        #[arg(long)]
        rows: String,
        #[arg(long)]
        wait_a_bit: bool,
    },
    /// Poll a batch's terminal status and result.
    Done {
        #[arg(long = "batch-id")]
        batch_id: Uuid,
    },
    /// Abort a batch still in progress.
    Abort {
        #[arg(long = "batch-id")]
        batch_id: Uuid,
    },
}

#[derive(Subcommand)]
enum SlowQueryCmd {
    Submit {
        #[arg(long)]
        app: String,
        #[arg(long)]
        op: String,
        #[arg(long, default_value = "{}")]
        ctx: String,
        #[arg(long)]
        input: String,
    },
    Done {
        #[arg(long = "req-id")]
        req_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => run_db(cmd).await,
        Commands::Batch { cmd } => run_batch(cmd).await,
        Commands::SlowQuery { cmd } => run_slow_query(cmd).await,
    }
}

async fn run_db(cmd: DbCmd) -> Result<()> {
    let pool = alya_db::connect_from_env().await?;
    match cmd {
        DbCmd::Status => {
            let s = alya_db::status(&pool).await?;
            println!("db_ok={} has_batches_table={}", s.ok, s.has_batches_table);
        }
        DbCmd::Migrate => {
            alya_db::migrate(&pool).await?;
            println!("migrations_applied=true");
        }
    }
    Ok(())
}

async fn build_manager() -> Result<JobManager> {
    let db = alya_db::connect_from_env().await.context("connecting to Postgres")?;
    let cache = alya_cache::connect_from_env().await.context("connecting to Redis")?;
    let object_store =
        Arc::new(alya_objectstore::ObjectStoreFacade::connect_from_env().context("initializing object store")?);
    let registry = Arc::new(Registry::new());
    Ok(JobManager::new(db, cache, object_store, registry))
}

fn load_rows(path: &str) -> Result<Vec<NewRow>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read rows file: {path}"))?;
    let rows: Vec<NewRow> =
        serde_json::from_str(&raw).with_context(|| format!("parse rows file: {path}"))?;
    Ok(rows)
}

async fn run_batch(cmd: BatchCmd) -> Result<()> {
    let manager = build_manager().await?;
    match cmd {
        BatchCmd::Submit { app, op, ctx, rows, wait_a_bit } => {
            let ctx: serde_json::Value = serde_json::from_str(&ctx).context("--ctx must be valid JSON")?;
            let rows = rows.map(|p| load_rows(&p)).transpose()?.unwrap_or_default();
            let batch_id = manager.batch_submit(&app, &op, ctx, rows, wait_a_bit).await?;
            println!("batch_id={batch_id}");
        }
        BatchCmd::Append { batch_id, rows, wait_a_bit } => {
            let rows = load_rows(&rows)?;
            let total = manager.batch_append(batch_id, rows, wait_a_bit).await?;
            println!("row_count={total}");
        }
        BatchCmd::Done { batch_id } => {
            let view = manager.batch_done(batch_id).await?;
            println!("status={}", view.status);
            println!("n_success={}", view.n_success);
            println!("n_failed={}", view.n_failed);
            println!("n_aborted={}", view.n_aborted);
            println!(
                "output_files={}",
                serde_json::to_string(&view.output_files).unwrap_or_default()
            );
        }
        BatchCmd::Abort { batch_id } => {
            manager.batch_abort(batch_id).await?;
            println!("aborted=true");
        }
    }
    Ok(())
}

async fn run_slow_query(cmd: SlowQueryCmd) -> Result<()> {
    let manager = build_manager().await?;
    match cmd {
        SlowQueryCmd::Submit { app, op, ctx, input } => {
            let ctx: serde_json::Value = serde_json::from_str(&ctx).context("--ctx must be valid JSON")?;
            let input: serde_json::Value = serde_json::from_str(&input).context("--input must be valid JSON")?;
            let req_id = manager.slow_query_submit(&app, &op, ctx, input).await?;
            println!("req_id={req_id}");
        }
        SlowQueryCmd::Done { req_id } => {
            let view = manager.slow_query_done(req_id).await?;
            println!("status={}", view.status);
            println!("result={}", serde_json::to_string(&view.result).unwrap_or_default());
        }
    }
    Ok(())
}
