use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use ai_automations::automation::routes::automation_routes;
use ai_automations::automation::runner::UnavailableRunner;
use ai_automations::automation::{
    AutomationControl, ConcurrencyGate, ExecutionCoordinator, RunHistoryStore, ScheduleManager,
    ScriptTaskRunner, TaskRunner,
};
use ai_automations::config::{AutomationConfig, RunnerConfig};
use ai_automations::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = AutomationConfig::from_env().context("Invalid automation configuration")?;
    let runner_config = RunnerConfig::from_env().context("Invalid task runner configuration")?;

    eprintln!("⏱  AI Automations v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Max concurrent: {}", config.max_concurrent);
    eprintln!("   API: http://127.0.0.1:{}/api/automations", config.port);

    // ── Storage ───────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("Failed to open automation database")?,
    );

    let history = Arc::new(RunHistoryStore::new(Arc::clone(&db)));
    history
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted runs")?;

    // ── Task runner ───────────────────────────────────────────────────────
    let runner: Arc<dyn TaskRunner> = match runner_config {
        Some(runner_config) => {
            tracing::info!(
                script = %runner_config.script.display(),
                provider = runner_config.provider.as_str(),
                model = %runner_config.model,
                "Script task runner configured"
            );
            Arc::new(ScriptTaskRunner::new(runner_config))
        }
        None => {
            tracing::warn!("AUTOMATION_SCRIPT not set, every run will fail");
            Arc::new(UnavailableRunner::new(
                "no task runner configured (set AUTOMATION_SCRIPT)",
            ))
        }
    };

    // ── Scheduler ─────────────────────────────────────────────────────────
    let gate = Arc::new(ConcurrencyGate::new(
        config.max_concurrent,
        config.max_queue_len,
    ));
    let coordinator = Arc::new(ExecutionCoordinator::new(
        db,
        history,
        gate,
        runner,
        config.cancel_grace,
    ));
    let manager = Arc::new(ScheduleManager::new(coordinator));

    manager
        .load_schedules()
        .await
        .context("Failed to load automation schedules")?;
    manager
        .run_startup_automations()
        .await
        .context("Failed to trigger startup automations")?;

    // ── HTTP control surface ──────────────────────────────────────────────
    let control = Arc::new(AutomationControl::new(
        Arc::clone(&manager),
        config.history_limit,
    ));
    let app = automation_routes(control);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("Failed to bind automation server port {}", config.port))?;
    tracing::info!(port = config.port, "Automation server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Automation server failed")?;

    manager.shutdown();
    tracing::info!("Shut down");
    Ok(())
}

/// Console logging, plus a daily-rolling file when `AI_AUTOMATIONS_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("AI_AUTOMATIONS_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ai-automations.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
