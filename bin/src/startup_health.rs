use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use keylease_core::tokio::{self, task::JoinHandle};

const STARTUP_STABILIZATION_WINDOW: Duration = Duration::from_millis(300);

pub async fn verify_startup_subsystems(
    api_task: &mut JoinHandle<()>,
    reconciler_task: &mut JoinHandle<()>,
    backend: &str,
) -> Result<()> {
    verify_background_task_running("external API", api_task)
        .await
        .with_context(|| format!("{backend} startup check failed"))?;
    verify_background_task_running("reconciler", reconciler_task)
        .await
        .with_context(|| format!("{backend} startup check failed"))?;
    Ok(())
}

pub async fn verify_background_task_running(name: &str, task: &mut JoinHandle<()>) -> Result<()> {
    match tokio::time::timeout(STARTUP_STABILIZATION_WINDOW, task).await {
        Err(_) => Ok(()),
        Ok(join_res) => match join_res {
            Ok(()) => Err(anyhow!("{name} exited during startup stabilization window")),
            Err(err) => Err(anyhow!("{name} panicked during startup: {err}")),
        },
    }
}
