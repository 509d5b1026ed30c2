use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use foreman_agent::{BackendRegistry, BackendSettings};
use foreman_orchestrator::{Orchestrator, OrchestratorConfig};
use foreman_quota::QuotaTracker;
use foreman_task::{Task, TaskRegistry, TaskStatus};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman - AI agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all ready tasks until the graph is drained
    Run {
        /// Force every task onto this backend
        #[arg(long)]
        backend: Option<String>,
        /// Maximum tasks in flight (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
    /// Run a single pending task
    Work {
        /// Task ID to execute
        task_id: String,
        /// Force this backend instead of the task's routing hint
        #[arg(long)]
        backend: Option<String>,
    },
    /// List tasks
    Tasks {
        /// Filter by status (pending, in_progress, complete, failed)
        #[arg(long)]
        status: Option<String>,
        /// Filter by repo grouping
        #[arg(long)]
        repo: Option<String>,
    },
    /// Add a task to the graph
    Add {
        /// Task ID (unique)
        id: String,
        /// Short title
        title: String,
        /// Longer description handed to the agent
        #[arg(short, long, default_value = "")]
        description: String,
        /// Task IDs this task depends on
        #[arg(long)]
        dep: Vec<String>,
        /// Logical grouping, e.g. the target repository
        #[arg(long, default_value = "")]
        repo: String,
        /// Scheduling priority (higher runs first)
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Routing hint, "backend/model"
        #[arg(long, default_value = "")]
        model: String,
        /// Fallback route on quota exhaustion, "backend/model"
        #[arg(long, default_value = "")]
        fallback: String,
    },
    /// Move a failed task back to pending
    Requeue {
        /// Task ID to requeue
        task_id: String,
    },
    /// Show backend usage and quota status
    Quota,
}

#[derive(Deserialize)]
struct ForemanConfig {
    #[serde(default = "default_backend")]
    default_backend: String,
    #[serde(default = "default_concurrency")]
    max_concurrency: usize,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    backends: HashMap<String, BackendSettings>,
    #[serde(default)]
    limits: HashMap<String, u64>,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            max_concurrency: default_concurrency(),
            data_dir: default_data_dir(),
            backends: HashMap::new(),
            limits: HashMap::new(),
        }
    }
}

fn default_backend() -> String {
    "claude".to_string()
}
fn default_concurrency() -> usize {
    2
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./.foreman")
}

/// Request limits applied when the config does not override them.
fn default_limits() -> HashMap<String, u64> {
    HashMap::from([("claude".to_string(), 50), ("codex".to_string(), 100)])
}

fn load_config(path: &PathBuf) -> anyhow::Result<ForemanConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(toml::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ForemanConfig::default()),
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

fn parse_status(raw: &str) -> anyhow::Result<TaskStatus> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "complete" => Ok(TaskStatus::Complete),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(anyhow::anyhow!("unknown status: {other}")),
    }
}

struct Stores {
    tasks: Arc<TaskRegistry>,
    quota: Arc<QuotaTracker>,
    tasks_path: PathBuf,
}

fn open_stores(config: &ForemanConfig) -> anyhow::Result<Stores> {
    let tasks_path = config.data_dir.join("tasks.json");
    let tasks = Arc::new(TaskRegistry::new());
    if tasks_path.exists() {
        tasks.load(&tasks_path)?;
    }

    let quota = Arc::new(QuotaTracker::new(config.data_dir.join("quota.json")));
    quota.load()?;
    let mut limits = default_limits();
    limits.extend(config.limits.clone());
    for (backend, requests) in &limits {
        quota.set_limit(backend, *requests);
    }

    Ok(Stores {
        tasks,
        quota,
        tasks_path,
    })
}

fn orchestrator_config(
    config: &ForemanConfig,
    tasks_path: PathBuf,
    backend_override: Option<String>,
    concurrency: Option<usize>,
) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrency: concurrency.unwrap_or(config.max_concurrency),
        default_backend: config.default_backend.clone(),
        backend_override,
        workspace_root: config.data_dir.join("work"),
        registry_snapshot: Some(tasks_path),
        backend_settings: config.backends.clone(),
        ..OrchestratorConfig::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            backend,
            concurrency,
        } => {
            let stores = open_stores(&config)?;
            let orch_config =
                orchestrator_config(&config, stores.tasks_path.clone(), backend, concurrency);
            let orchestrator = Orchestrator::new(
                orch_config,
                stores.tasks,
                stores.quota,
                Arc::new(BackendRegistry::with_defaults()),
            );

            let handle = orchestrator.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping dispatch");
                    handle.shutdown();
                }
            });

            let summary = orchestrator.run().await?;
            println!(
                "Run finished: {} completed, {} failed, {} still pending",
                summary.completed, summary.failed, summary.pending
            );
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Work { task_id, backend } => {
            let stores = open_stores(&config)?;
            let task = stores.tasks.get(&task_id)?;
            let orch_config =
                orchestrator_config(&config, stores.tasks_path.clone(), backend, Some(1));

            println!("Starting work on task: {task_id}");
            println!("  Title: {}", task.title);

            let orchestrator = Orchestrator::new(
                orch_config,
                stores.tasks,
                stores.quota,
                Arc::new(BackendRegistry::with_defaults()),
            );
            match orchestrator.run_task(&task_id).await {
                Ok(task) => println!("Task {task_id} completed ({})", task.status),
                Err(e) => {
                    println!("Task {task_id} failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Tasks { status, repo } => {
            let stores = open_stores(&config)?;
            let tasks = match (status.as_deref(), repo.as_deref()) {
                (Some(raw), None) => stores.tasks.list_by_status(parse_status(raw)?),
                (None, Some(repo)) => stores.tasks.list_by_repo(repo),
                (None, None) => stores.tasks.list(),
                (Some(raw), Some(repo)) => {
                    let mut tasks = stores.tasks.list_by_status(parse_status(raw)?);
                    tasks.retain(|t| t.repo == repo);
                    tasks
                }
            };
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            println!(
                "{:<16} {:<12} {:>8}  {:<24} DEPS",
                "ID", "STATUS", "PRIORITY", "TITLE"
            );
            for task in &tasks {
                println!(
                    "{:<16} {:<12} {:>8}  {:<24} {}",
                    task.id,
                    task.status.to_string(),
                    task.priority,
                    task.title,
                    task.deps.join(", ")
                );
            }
        }
        Commands::Add {
            id,
            title,
            description,
            dep,
            repo,
            priority,
            model,
            fallback,
        } => {
            let stores = open_stores(&config)?;
            let mut task = Task::new(id.clone(), title)
                .with_description(description)
                .with_deps(dep)
                .with_repo(repo)
                .with_priority(priority);
            if !model.is_empty() {
                task = task.with_model(model);
            }
            if !fallback.is_empty() {
                task = task.with_fallback(fallback);
            }
            stores.tasks.add(task)?;
            stores.tasks.save(&stores.tasks_path)?;
            println!("Added task {id}");
        }
        Commands::Requeue { task_id } => {
            let stores = open_stores(&config)?;
            let tasks = Arc::clone(&stores.tasks);
            let orch_config =
                orchestrator_config(&config, stores.tasks_path.clone(), None, None);
            let orchestrator = Orchestrator::new(
                orch_config,
                stores.tasks,
                stores.quota,
                Arc::new(BackendRegistry::with_defaults()),
            );
            orchestrator.requeue(&task_id)?;
            tasks.save(&stores.tasks_path)?;
            println!("Task {task_id} is pending again");
        }
        Commands::Quota => {
            let stores = open_stores(&config)?;
            let usage = stores.quota.list_usage();
            if usage.is_empty() {
                println!("No usage data recorded yet.");
                return Ok(());
            }

            let mut backends: Vec<&String> = usage.keys().collect();
            backends.sort();

            println!(
                "{:<10} {:>8} {:>10}  {:<32} {:<16} WINDOW",
                "BACKEND", "REQUESTS", "TOKENS", "STATUS", "LAST REQUEST"
            );
            let now = Utc::now();
            for backend in backends {
                let u = &usage[backend];
                let status = match u.retry_after {
                    Some(retry) if u.is_exhausted => {
                        format!("EXHAUSTED (retry after {})", format_duration(retry - now))
                    }
                    _ => "OK".to_string(),
                };
                let last = u
                    .last_request
                    .map_or_else(|| "never".to_string(), |t| format_relative_time(t, now));
                println!(
                    "{:<10} {:>8} {:>10}  {:<32} {:<16} {}",
                    backend,
                    u.requests,
                    u.tokens,
                    status,
                    last,
                    format_duration(now - u.window_start)
                );
            }
        }
    }

    Ok(())
}

/// "just now", "5 minutes ago", "2 hours ago", "3 days ago".
fn format_relative_time(t: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - t;
    if elapsed < Duration::minutes(1) {
        return "just now".to_string();
    }
    if elapsed < Duration::hours(1) {
        let mins = elapsed.num_minutes();
        return if mins == 1 {
            "1 minute ago".to_string()
        } else {
            format!("{mins} minutes ago")
        };
    }
    if elapsed < Duration::days(1) {
        let hours = elapsed.num_hours();
        return if hours == 1 {
            "1 hour ago".to_string()
        } else {
            format!("{hours} hours ago")
        };
    }
    let days = elapsed.num_days();
    if days == 1 {
        "1 day ago".to_string()
    } else {
        format!("{days} days ago")
    }
}

/// Compact duration for table cells: "45s", "12m30s", "2h05m".
fn format_duration(d: Duration) -> String {
    if d < Duration::zero() {
        return "expired".to_string();
    }
    let secs = d.num_seconds();
    if secs < 60 {
        return format!("{secs}s");
    }
    if secs < 3600 {
        return format!("{}m{:02}s", secs / 60, secs % 60);
    }
    format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(format_relative_time(now - Duration::seconds(10), now), "just now");
        assert_eq!(
            format_relative_time(now - Duration::minutes(1), now),
            "1 minute ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::minutes(45), now),
            "45 minutes ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::hours(3), now),
            "3 hours ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::days(2), now),
            "2 days ago"
        );
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::seconds(-5)), "expired");
        assert_eq!(format_duration(Duration::seconds(45)), "45s");
        assert_eq!(format_duration(Duration::seconds(750)), "12m30s");
        assert_eq!(format_duration(Duration::seconds(7500)), "2h05m");
    }

    #[test]
    fn config_parses_with_defaults() {
        let config: ForemanConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_backend, "claude");
        assert_eq!(config.max_concurrency, 2);

        let config: ForemanConfig = toml::from_str(
            r#"
            default_backend = "codex"
            max_concurrency = 4

            [backends.codex]
            model = "gpt-5"
            extra_args = ["--sandbox"]

            [limits]
            codex = 200
            "#,
        )
        .unwrap();
        assert_eq!(config.default_backend, "codex");
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.backends["codex"].model.as_deref(), Some("gpt-5"));
        assert_eq!(config.limits["codex"], 200);
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(parse_status("pending").is_ok());
        assert!(parse_status("done").is_err());
    }
}
