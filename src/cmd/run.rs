//! Grading workers: `labcheck run`.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

use labcheck::checker::db::{CheckerDb, DbHandle};
use labcheck::checker::pipeline::Orchestrator;
use labcheck::checker::runtime::DockerRuntime;
use labcheck::checker::sandbox::Sandbox;
use labcheck::checker::stager::{SubmissionStager, sweep_staging};
use labcheck::config::LabcheckConfig;

pub async fn cmd_run(config: &LabcheckConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let temp_root = &config.checker.temp_dir;
    std::fs::create_dir_all(temp_root)?;
    let swept = sweep_staging(temp_root)?;
    if swept > 0 {
        tracing::info!(swept, dir = %temp_root.display(), "removed stale staging directories");
    }

    let db = DbHandle::new(CheckerDb::new(&config.checker.db_path)?);
    let runtime = Arc::new(DockerRuntime::connect()?);
    let orchestrator = Arc::new(Orchestrator::new(
        db,
        SubmissionStager::new(temp_root),
        Sandbox::new(runtime, config.sandbox.clone()),
        config.orchestrator_settings(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received Ctrl+C");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ctrl+C handler unavailable");
                // dropping the sender would read as a shutdown request
                std::future::pending::<()>().await;
            }
        }
    });

    println!(
        "{} with {} worker(s); press Ctrl+C to stop",
        console::style("labcheck grading").bold().cyan(),
        config.orchestrator_settings().workers
    );
    orchestrator.run(shutdown_rx).await
}
