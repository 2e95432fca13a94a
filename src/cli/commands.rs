//! CLI command definitions for taskforge.
//!
//! Operator commands against the Redis-backed queue store: collection counts,
//! dead-letter inspection, replay and crash recovery. Every command prints
//! JSON to stdout.

use std::fs;
use std::path::Path;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::config::{DEFAULT_QUEUE_NAME, DEFAULT_REDIS_URL};
use crate::scheduler::redis_store::RedisQueueStore;
use crate::scheduler::store::{DeadLetterEntry, QueueStats, QueueStore};

/// Default number of dead-letter entries shown.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;

/// Operator tool for the taskforge queue store.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Inspect and repair a taskforge queue")]
#[command(version)]
#[command(
    long_about = "taskforge inspects the durable queue used by the taskforge scheduler.\n\nExample usage:\n  taskforge stats\n  taskforge dead-letters --limit 5 --output dlq.json\n  taskforge replay 0b7c1c9e-4c55-4a55-8b2f-9d7b8f1f0c11"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL of the queue store.
    #[arg(long, env = "TASKFORGE_REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Name of the queue.
    #[arg(short, long, env = "TASKFORGE_QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME, global = true)]
    pub queue_name: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Show queued, processing and dead-letter counts.
    Stats,

    /// List dead-lettered tasks, newest first.
    #[command(alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Move a dead-lettered task back to the queue with its attempts reset.
    Replay(ReplayArgs),

    /// Return every task left in processing to the queue.
    ///
    /// Only run this while no scheduler is running against the queue:
    /// tasks held by live workers would be executed twice.
    Recover,
}

/// Arguments for the dead-letters command.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of entries to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
    pub limit: usize,

    /// Also write the entries to this file.
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Arguments for the replay command.
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// Id of the dead-lettered task.
    pub task_id: Uuid,
}

/// JSON output of the dead-letters command.
#[derive(Debug, Serialize)]
pub struct DeadLettersOutput {
    pub queue_name: String,
    pub dead_letter_count: usize,
    pub entries: Vec<DeadLetterEntry>,
}

/// JSON output of the replay command.
#[derive(Debug, Serialize)]
pub struct ReplayOutput {
    pub task_id: Uuid,
    pub status: String,
}

/// JSON output of the recover command.
#[derive(Debug, Serialize)]
pub struct RecoverOutput {
    pub queue_name: String,
    pub recovered: usize,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let store = RedisQueueStore::connect(&cli.redis_url, &cli.queue_name)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", cli.redis_url, e))?;

    let json_output = match cli.command {
        Commands::Stats => to_json(&run_stats_command(&store).await?)?,
        Commands::DeadLetters(args) => to_json(&run_dead_letters_command(&store, args).await?)?,
        Commands::Replay(args) => to_json(&run_replay_command(&store, args).await?)?,
        Commands::Recover => to_json(&run_recover_command(&store).await?)?,
    };

    println!("{}", json_output);
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_stats_command(store: &dyn QueueStore) -> anyhow::Result<QueueStats> {
    Ok(store.stats().await?)
}

async fn run_dead_letters_command(
    store: &dyn QueueStore,
    args: DeadLettersArgs,
) -> anyhow::Result<DeadLettersOutput> {
    let stats = store.stats().await?;
    let entries = store.peek_dead_letter(args.limit).await?;

    let output = DeadLettersOutput {
        queue_name: stats.queue_name,
        dead_letter_count: stats.dead_letter,
        entries,
    };

    if let Some(path) = &args.output {
        write_output_file(Path::new(path), &output)?;
        info!(path = %path, entries = output.entries.len(), "Wrote dead-letter entries");
    }

    Ok(output)
}

async fn run_replay_command(
    store: &dyn QueueStore,
    args: ReplayArgs,
) -> anyhow::Result<ReplayOutput> {
    match store.replay_dead_letter(args.task_id, Utc::now()).await? {
        Some(task) => {
            info!(task_id = %task.id, task_type = %task.task_type, "Replayed dead-lettered task");
            Ok(ReplayOutput {
                task_id: task.id,
                status: "queued".to_string(),
            })
        }
        None => Err(anyhow::anyhow!(
            "Task {} is not in the dead-letter collection",
            args.task_id
        )),
    }
}

async fn run_recover_command(store: &dyn QueueStore) -> anyhow::Result<RecoverOutput> {
    let recovered = store.recover_processing(Utc::now()).await?;
    if recovered == 0 {
        warn!("No tasks found in processing");
    }

    Ok(RecoverOutput {
        queue_name: store.queue_name().to_string(),
        recovered,
    })
}

fn write_output_file<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, to_json(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::memory_store::MemoryQueueStore;
    use crate::scheduler::store::score_of;
    use crate::scheduler::task::{Priority, Task, TaskType};
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_dead_letters_defaults() {
        let cli = Cli::try_parse_from(["taskforge", "dead-letters"]).expect("should parse");
        match cli.command {
            Commands::DeadLetters(args) => {
                assert_eq!(args.limit, DEFAULT_DEAD_LETTER_LIMIT);
                assert!(args.output.is_none());
            }
            other => panic!("Expected DeadLetters command, got {other:?}"),
        }
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from([
            "taskforge",
            "stats",
            "--queue-name",
            "content",
            "--redis-url",
            "redis://queue.internal:6380",
            "-l",
            "debug",
        ])
        .expect("should parse");

        assert!(matches!(cli.command, Commands::Stats));
        assert_eq!(cli.queue_name, "content");
        assert_eq!(cli.redis_url, "redis://queue.internal:6380");
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_defaults_match_scheduler_config() {
        let cli = Cli::try_parse_from(["taskforge", "stats"]).expect("should parse");
        let config = crate::scheduler::SchedulerConfig::default();

        assert_eq!(cli.queue_name, config.queue_name);
        assert_eq!(cli.redis_url, config.redis_url);
    }

    #[test]
    fn test_replay_requires_uuid() {
        assert!(Cli::try_parse_from(["taskforge", "replay", "not-a-uuid"]).is_err());

        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["taskforge", "replay", &id.to_string()]).expect("should parse");
        match cli.command {
            Commands::Replay(args) => assert_eq!(args.task_id, id),
            other => panic!("Expected Replay command, got {other:?}"),
        }
    }

    async fn dead_lettered(store: &MemoryQueueStore, error: &str) -> Task {
        let task = Task::new(TaskType::Validation, serde_json::json!({"doc": 7}), Priority::High);
        store.enqueue(&task, score_of(&task)).await.unwrap();
        store.move_to_processing(task.id).await.unwrap();
        store.move_to_dead_letter(&task, error).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_dead_letters_writes_output_file() {
        let store = MemoryQueueStore::default();
        let task = dead_lettered(&store, "compliance backend unavailable").await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("dlq.json");
        let args = DeadLettersArgs {
            limit: 10,
            output: Some(path.to_string_lossy().into_owned()),
        };

        let output = run_dead_letters_command(&store, args).await.unwrap();
        assert_eq!(output.dead_letter_count, 1);
        assert_eq!(output.entries[0].task.id, task.id);

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["dead_letter_count"], 1);
        assert_eq!(
            written["entries"][0]["last_error"],
            "compliance backend unavailable"
        );
    }

    #[tokio::test]
    async fn test_replay_command() {
        let store = MemoryQueueStore::default();
        let task = dead_lettered(&store, "boom").await;

        let output = run_replay_command(&store, ReplayArgs { task_id: task.id })
            .await
            .unwrap();
        assert_eq!(output.task_id, task.id);
        assert!(store.is_queued(task.id).await);

        // A second replay finds nothing.
        assert!(run_replay_command(&store, ReplayArgs { task_id: task.id })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recover_command() {
        let store = MemoryQueueStore::default();
        let task = Task::new(TaskType::ContentGeneration, serde_json::Value::Null, Priority::Low);
        store.enqueue(&task, score_of(&task)).await.unwrap();
        store.move_to_processing(task.id).await.unwrap();

        let output = run_recover_command(&store).await.unwrap();
        assert_eq!(output.recovered, 1);

        let stats = run_stats_command(&store).await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.processing, 0);
    }
}
