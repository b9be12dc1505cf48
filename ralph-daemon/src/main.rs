mod session_process;

use chrono::Utc;
use ralph_core::clock::{Clock, SystemClock};
use ralph_core::control::{registry_path, ControlPlane, DaemonRegistryEntry};
use ralph_core::escalation::EscalationWriteback;
use ralph_core::events::RalphEvent;
use ralph_core::governor::BudgetGovernor;
use ralph_core::hosting::{GithubHostingClient, HostingClient};
use ralph_core::merge_gate::MergeGate;
use ralph_core::notify::NullNotifier;
use ralph_core::queue_driver::QueueDriver;
use ralph_core::relationship::{Coverage, DependencySignal};
use ralph_core::session::SessionRunner;
use ralph_core::store::Store;
use ralph_core::store_sqlite::SqliteStore;
use ralph_core::types::{DaemonId, RepoConfig, RepoId, TokenId};
use ralph_core::worker::LifecycleWorker;
use session_process::ProcessSessionRunner;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct DaemonConfig {
    state_db_path: String,
    github_api_base_url: String,
    github_token: String,
    repo: String,
    agent_bin: String,
    max_workers: u32,
    control_file_path: String,
}

impl DaemonConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            state_db_path: std::env::var("RALPH_STATE_DB_PATH").unwrap_or_else(|_| "ralph-state.db".into()),
            github_api_base_url: std::env::var("RALPH_GITHUB_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.github.com".into()),
            github_token: std::env::var("GH_TOKEN")
                .or_else(|_| std::env::var("GITHUB_TOKEN"))
                .map_err(|_| anyhow::anyhow!("GH_TOKEN or GITHUB_TOKEN must be set"))?,
            repo: std::env::var("RALPH_REPO").map_err(|_| anyhow::anyhow!("RALPH_REPO must be set, e.g. acme/widgets"))?,
            agent_bin: std::env::var("RALPH_AGENT_BIN").unwrap_or_else(|_| "ralph-agent".into()),
            max_workers: std::env::var("RALPH_MAX_WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or(2),
            control_file_path: std::env::var("RALPH_CONTROL_FILE").unwrap_or_else(|_| "control.json".into()),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .json()
        .init();

    let config = DaemonConfig::from_env()?;
    let daemon_id = DaemonId(uuid::Uuid::now_v7().to_string());
    info!(daemon_id = %daemon_id.0, "starting ralph-daemon");

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&format!("sqlite://{}?mode=rwc", config.state_db_path))
        .await?;
    let store: Arc<dyn Store> = {
        let sqlite = SqliteStore::new(pool);
        sqlite.migrate().await?;
        Arc::new(sqlite)
    };

    let token_id = TokenId("primary".into());
    let hosting: Arc<dyn HostingClient> = Arc::new(GithubHostingClient::new(
        config.github_api_base_url.clone(),
        token_id.clone(),
        config.github_token.clone(),
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sessions: Arc<dyn SessionRunner> = Arc::new(ProcessSessionRunner::new(config.agent_bin.clone()));
    let governor = Arc::new(BudgetGovernor::new(
        nonzero_u32(600),
        nonzero_u32(200),
        20,
    ));
    let control = Arc::new(ControlPlane::new(config.control_file_path.clone()));
    let merge_gate = Arc::new(MergeGate::new(hosting.clone(), clock.clone()));
    let escalation = Arc::new(EscalationWriteback::new(store.clone(), hosting.clone(), Arc::new(NullNotifier)));
    let queue_driver = Arc::new(QueueDriver::new(store.clone(), hosting.clone(), clock.clone()));

    let repo_config = RepoConfig {
        id: RepoId(config.repo.clone()),
        token_id,
        bot_branch: "bot/integration".into(),
        required_checks: vec![],
        auto_update_enabled: true,
        auto_update_min_minutes: 5,
        auto_update_label_gate: None,
        auto_queue: true,
        allowlisted_owners: BTreeSet::new(),
        max_workers: config.max_workers,
        ci_fix_attempts: 3,
        merge_retry_limit: 2,
        required_check_timeout_secs: 3600,
        merge_poll_interval_secs: 30,
    };

    store.append_event(&RalphEvent::DaemonStarted { daemon_id: daemon_id.clone() }, clock.now()).await.ok();
    write_registry_entry(&config, &daemon_id);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());
    spawn_control_poller(control.clone(), shutdown.clone());

    let mut handles = Vec::new();
    for slot in 0..repo_config.max_workers {
        let worker = LifecycleWorker::new(
            slot,
            daemon_id.clone(),
            store.clone(),
            sessions.clone(),
            governor.clone(),
            control.clone(),
            merge_gate.clone(),
            escalation.clone(),
            clock.clone(),
            hosting.clone(),
            Arc::new(NullNotifier),
        );
        let queue_driver = queue_driver.clone();
        let repo_config = repo_config.clone();
        let shutdown = shutdown.clone();
        let daemon_id = daemon_id.clone();
        handles.push(tokio::spawn(async move {
            run_slot(worker, queue_driver, repo_config, daemon_id, slot, shutdown).await;
        }));
    }

    shutdown.cancelled().await;
    info!("shutdown requested, draining worker slots");
    for handle in handles {
        handle.await.ok();
    }
    store
        .append_event(
            &RalphEvent::DaemonShuttingDown { daemon_id, reason: "shutdown signal".into() },
            clock.now(),
        )
        .await
        .ok();
    Ok(())
}

fn nonzero_u32(v: u32) -> std::num::NonZeroU32 {
    std::num::NonZeroU32::new(v).expect("nonzero quota")
}

async fn run_slot(
    worker: LifecycleWorker,
    queue_driver: Arc<QueueDriver>,
    config: RepoConfig,
    daemon_id: DaemonId,
    slot: u32,
    shutdown: CancellationToken,
) {
    let worker_id = format!("{}-{}", daemon_id.0, slot);
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let queued = match queue_driver.list_queued(&config.id).await {
            Ok(q) => q,
            Err(e) => {
                error!(error = %e, "failed to list queued tasks");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => continue,
                    _ = shutdown.cancelled() => return,
                }
            }
        };
        let Some(task) = queued.first() else {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => continue,
                _ = shutdown.cancelled() => return,
            }
        };

        // No graph/body dependency evidence wired at this layer yet; an
        // empty signal set with unknown coverage defers to C5's default.
        let signals: Vec<DependencySignal> = vec![];
        let coverage = Coverage::default();
        let claimed = queue_driver
            .try_claim(&config.id, task.number, &daemon_id, &worker_id, slot, &signals, &coverage, &config)
            .await;

        let view = match claimed {
            Ok(ralph_core::queue_driver::ClaimResult::Claimed(v)) => v,
            Ok(ralph_core::queue_driver::ClaimResult::ProceedUnknown(v)) => v,
            Ok(ralph_core::queue_driver::ClaimResult::Blocked(_)) => continue,
            Err(e) => {
                error!(error = %e, number = task.number, "failed to claim task");
                continue;
            }
        };

        let worktree = format!("/var/ralph/worktrees/{}-{}", config.id.0.replace('/', "_"), view.number);
        let result = worker
            .run_task(
                &config.id,
                view.number,
                &view.path,
                &view.author,
                view.issue_open,
                &config,
                &worktree,
                None,
                &shutdown,
            )
            .await;
        if let Err(e) = result {
            error!(error = %e, task = %view.path, "task run failed");
        }
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt signal");
        shutdown.cancel();
    });
}

fn spawn_control_poller(control: Arc<ControlPlane>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            control.poll();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

fn write_registry_entry(config: &DaemonConfig, daemon_id: &DaemonId) {
    let entry = DaemonRegistryEntry {
        version: 1,
        daemon_id: daemon_id.0.clone(),
        pid: std::process::id() as i32,
        started_at: Utc::now(),
        heartbeat_at: Utc::now(),
        control_root: ".".into(),
        control_file_path: config.control_file_path.clone(),
        cwd: std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default(),
        command: std::env::args().collect::<Vec<_>>().join(" "),
    };
    let state_dir = std::path::Path::new(".");
    let path = registry_path(state_dir, daemon_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if let Ok(json) = serde_json::to_string_pretty(&entry) {
        std::fs::write(&path, json).ok();
    }
}
