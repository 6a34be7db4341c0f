//! Operator CLI: migrations, startup recovery, and queue inspection.

use clap::{Parser, Subcommand};
use uuid::Uuid;

use foreman::db::Database;
use foreman::queue::types::{parse_item_status, WorkItemFilter};
use foreman::{recover_orphaned_work_items, DatabaseConfig, Store};

#[derive(Parser, Debug)]
#[command(name = "foreman", about = "Task-orchestration core for autonomous agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Reset work items orphaned by a crash back to pending
    Recover,

    /// List all work queues
    Queues,

    /// List work items in a queue
    Items {
        /// Queue ID
        queue_id: Uuid,

        /// Filter by status (pending, blocked, in_progress, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foreman=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = DatabaseConfig::from_env()?;
    let store = Store::connect(&config).await?;

    match cli.command {
        Command::Migrate => {
            store.run_migrations().await?;
            println!("Migrations applied");
        }
        Command::Recover => {
            let report = recover_orphaned_work_items(Some(&store as &dyn Database)).await?;
            println!(
                "Recovery: {} scanned, {} recovered, {} failed",
                report.scanned, report.recovered, report.failed
            );
        }
        Command::Queues => {
            let queues = store.list_queues().await?;
            if queues.is_empty() {
                println!("No queues");
                return Ok(());
            }
            for queue in queues {
                println!(
                    "{}  {}  agent={}  limit={}",
                    queue.id, queue.name, queue.agent_id, queue.concurrency_limit
                );
            }
        }
        Command::Items { queue_id, status } => {
            let mut filter = WorkItemFilter::for_queue(queue_id);
            if let Some(status) = status {
                filter.status = Some(parse_item_status(&status));
            }
            let items = store.list_items(&filter).await?;
            if items.is_empty() {
                println!("No items");
                return Ok(());
            }
            for item in items {
                println!(
                    "{}  [{}]  p{}  retries={}  {}",
                    item.id, item.status, item.priority, item.retry_count, item.title
                );
            }
        }
    }

    Ok(())
}
