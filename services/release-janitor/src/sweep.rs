use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use release_core::{app::Apps, lineage::LineageTracker};
use shared::{models::AppRef, utilities::errors::AppError};

/// Periodically removes superseded build artifacts across all managed
/// applications. Each cycle waits the configured interval plus a small
/// random jitter so replicas don't sweep in lockstep.
pub async fn start_sweeper(
    apps: Apps,
    lineage: LineageTracker,
    sweep_secs: u64,
) -> Result<(), AppError> {
    let max_jitter = sweep_secs / 10 + 1;

    loop {
        let jitter = rand::rng().random_range(0..max_jitter);
        tokio::time::sleep(Duration::from_secs(sweep_secs + jitter)).await;

        match sweep_once(&apps, &lineage).await {
            Ok(0) => {}
            Ok(removed) => info!("Swept {} superseded builds", removed),
            Err(e) => error!("Sweep failed: {}", e),
        }
    }
}

/// One pass over every application record: everything but the build the
/// record points at is superseded and goes away.
pub async fn sweep_once(apps: &Apps, lineage: &LineageTracker) -> Result<u32, AppError> {
    let records = apps.list_all().await?;

    let mut removed = 0;
    for record in records {
        let (Some(name), Some(namespace)) = (
            record.metadata.name.as_deref(),
            record.metadata.namespace.as_deref(),
        ) else {
            continue;
        };
        let app = AppRef::new(name, namespace);

        match lineage.unstage(&app, record.spec.stage_id.as_deref()).await {
            Ok(count) => removed += count,
            Err(e) => warn!(
                "Could not sweep builds of {}/{}: {}",
                app.namespace, app.name, e
            ),
        }
    }

    Ok(removed)
}
