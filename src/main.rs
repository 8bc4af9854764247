use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use rustshard::{
    ClusterConfig, DbError, ParallelTaskGroup, QueryResult, Row, ShardCluster, ShardTaskExecutor,
    connection::redact_url,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rustshard", version, about = "Inspect and operate a sharded SQL cluster")]
struct Cli {
    /// Cluster config (JSON)
    #[arg(short, long, global = true, default_value = "rustshard.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the shard, physical database and URL serving each id
    Locate {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Run a query on every shard and print the merged rows
    Query { sql: String },
    /// Run a statement on every shard and print the affected row count
    Exec { sql: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ClusterConfig::from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let cluster = Arc::new(ShardCluster::from_config(&config).context("building cluster")?);
    let tasks = ShardTaskExecutor::new(config.thread_pool_size);

    let outcome = run(cli.command, &cluster, &tasks).await;
    cluster.close().context("closing cluster")?;
    outcome
}

async fn run(
    command: Command,
    cluster: &Arc<ShardCluster>,
    tasks: &ShardTaskExecutor,
) -> anyhow::Result<()> {
    match command {
        Command::Locate { ids } => {
            for id in ids {
                let shard = cluster.shard_for_id(&id);
                let physical = cluster.resolver().physical_index(shard);
                let url = cluster.shard_url(shard)?;
                println!("{}\tshard={}\tphysical={}\t{}", id, shard, physical, redact_url(&url));
            }
        }
        Command::Query { sql } => {
            let merged = Arc::new(Mutex::new(Vec::<Row>::new()));
            let mut group = ParallelTaskGroup::new();
            for shard in 0..cluster.virtual_size() {
                let executor = cluster.executor(shard)?;
                let merged = Arc::clone(&merged);
                let sql = sql.clone();
                group.add_task(shard, move |_| async move {
                    let rows = executor.query(&sql, &[]).await?;
                    merged.lock()?.extend(rows);
                    Ok::<_, DbError>(())
                });
            }
            group.execute(tasks).await.context("query failed")?;

            let rows = match Arc::try_unwrap(merged) {
                Ok(rows) => rows.into_inner().map_err(|_| DbError::LockError("rows".into()))?,
                Err(_) => bail!("query tasks still hold the result buffer"),
            };
            QueryResult::from_rows(rows).print();
        }
        Command::Exec { sql } => {
            let affected = Arc::new(AtomicU64::new(0));
            let mut group = ParallelTaskGroup::new();
            for shard in 0..cluster.virtual_size() {
                let executor = cluster.executor(shard)?;
                let affected = Arc::clone(&affected);
                let sql = sql.clone();
                group.add_task(shard, move |_| async move {
                    let count = executor.update(&sql, &[]).await?;
                    affected.fetch_add(count, Ordering::SeqCst);
                    Ok::<_, DbError>(())
                });
            }
            group.execute(tasks).await.context("statement failed")?;
            println!("{} rows affected", affected.load(Ordering::SeqCst));
        }
    }
    Ok(())
}
