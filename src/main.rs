//! Camflow demo: simulated camera feeding the acquisition pipeline

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camflow::{
    AcquisitionController, CameraDriver, Config, Reconfiguration, RegionRequest, SimulatedCamera,
};
use color_eyre::Result;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camflow=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Camflow launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    camflow::CONFIG.store(Arc::new(config.clone()));

    let camera: Arc<dyn CameraDriver> = Arc::new(SimulatedCamera::new(config.simulator.clone()));
    let controller = Arc::new(AcquisitionController::from_global(camera));
    controller.start()?;

    // Consumer: read the snapshot on every notification
    let notifications = controller.notifications();
    let reader = Arc::clone(&controller);
    let consumer = tokio::spawn(async move {
        while let Ok(note) = notifications.recv_async().await {
            if let Some(snapshot) = reader.snapshot() {
                tracing::trace!(
                    session = note.session_id,
                    sequence = note.sequence,
                    "{}x{} {} range {}..{}",
                    snapshot.width,
                    snapshot.height,
                    snapshot.format_label(),
                    snapshot.min,
                    snapshot.max
                );
            }
        }
    });

    let mut state = controller.watch_state();
    let watcher = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            info!("State: {:?}", *state.borrow());
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut ticks = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                ticks += 1;
                let rate = controller.frame_rate();
                info!(
                    frames = rate.frames,
                    fps = rate.fps.unwrap_or_default(),
                    "Status"
                );

                // exercise a mid-stream region change once
                if ticks == 3 {
                    let change = Reconfiguration::Region(RegionRequest::from_rect(64, 32, 640, 480));
                    let ctl = Arc::clone(&controller);
                    match tokio::task::spawn_blocking(move || ctl.reconfigure(change)).await? {
                        Ok(()) => after_region_change(&controller),
                        Err(e) => warn!("Region change rejected: {}", e),
                    }
                }
            }
        }
    }

    let ctl = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || ctl.shutdown()).await?;
    consumer.abort();
    watcher.abort();

    info!("Camflow shutting down");
    Ok(())
}

fn after_region_change(controller: &AcquisitionController) {
    controller.reset_frame_rate();
    if let Some(session) = controller.session() {
        info!(session = session.id, buffers = session.buffers, "Region applied");
    }
}
