//! multicam demo: preview every configured camera into ring buffers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};

use multicam::capture::platform::{CameraPlatform, Facing};
use multicam::capture::size::{find_size, maximum_output_size, preview_output_size};
use multicam::capture::{SyntheticPlatform, V4l2Platform};
use multicam::pipeline::RingSink;
use multicam::{CameraCoordinator, Config, CoordinatorOptions, PlatformKind, Resolution};

const ALL_FACINGS: [Facing; 3] = [Facing::Rear, Facing::Front, Facing::External];

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("multicam=debug"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn select_platform(kind: PlatformKind) -> Arc<dyn CameraPlatform> {
    let v4l2 = V4l2Platform::new();
    let use_v4l2 = match kind {
        PlatformKind::V4l2 => true,
        PlatformKind::Synthetic => false,
        PlatformKind::Auto => v4l2.camera_ids().is_ok_and(|ids| !ids.is_empty()),
    };
    if use_v4l2 {
        info!("Using V4L2 cameras");
        Arc::new(v4l2)
    } else {
        info!("Using synthetic cameras");
        Arc::new(SyntheticPlatform::rear_and_front())
    }
}

/// The configured size if the camera offers it, else the best fit
fn pick_size(target: Resolution, sizes: &[Resolution]) -> Option<Resolution> {
    if find_size(sizes, target).is_some() {
        return Some(target);
    }
    preview_output_size(target, sizes)
        .map(|chosen| chosen.size)
        .or_else(|| maximum_output_size(sizes))
}

/// Drain the sink on a blocking thread, logging per-camera fps once a second
fn spawn_consumer(sink: Arc<RingSink>, running: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut window = Instant::now();
        while running.load(Ordering::Acquire) {
            if let Some(camera) = sink.wait_frame(Duration::from_millis(200)) {
                let frames = sink.drain(&camera);
                *counts.entry(camera.to_string()).or_default() += frames.len() as u64;
            }

            let elapsed = window.elapsed();
            if elapsed >= Duration::from_secs(1) {
                for camera in sink.cameras() {
                    let frames = counts.remove(&camera).unwrap_or(0);
                    let fps = frames as f64 / elapsed.as_secs_f64();
                    let stats = sink.stats(&camera).unwrap_or_default();
                    info!(
                        camera = %camera,
                        fps = %format!("{fps:.1}"),
                        dropped = stats.dropped,
                        "Preview"
                    );
                }
                window = Instant::now();
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("multicam launching...");

    let path = std::env::args().nth(1).map(PathBuf::from);
    Config::load(path.as_deref().or(Some(Path::new("multicam.toml"))))?.install();
    let config = multicam::config();

    let platform = select_platform(config.capture.platform);
    let sink = Arc::new(RingSink::new());
    let mut coordinator =
        CameraCoordinator::new(platform, sink.clone(), CoordinatorOptions::from(config.as_ref()));

    let available: HashMap<String, Vec<Resolution>> = coordinator
        .enumerate(&ALL_FACINGS, config.capture.high_frame_rate)?
        .into_iter()
        .collect();
    let wanted: Vec<String> = if config.capture.cameras.is_empty() {
        available.keys().cloned().collect()
    } else {
        config.capture.cameras.clone()
    };
    if wanted.is_empty() {
        return Err(eyre!("no cameras found"));
    }

    let ids: Vec<&str> = wanted.iter().map(String::as_str).collect();
    let results = tokio::task::block_in_place(|| {
        coordinator.initialize(
            &ids,
            config.pipeline.queue_capacity,
            config.capture.high_frame_rate,
            config.acceleration.enabled,
        )
    });

    let requests: HashMap<String, Resolution> = results
        .iter()
        .filter(|(_, ok)| **ok)
        .filter_map(|(id, _)| {
            let sizes = available.get(id)?;
            let size = pick_size(config.resolution(), sizes)?;
            Some((id.clone(), size))
        })
        .collect();
    if requests.is_empty() {
        return Err(eyre!("no camera could be initialized: {results:?}"));
    }
    for (id, size) in &requests {
        info!(camera = %id, %size, "Requesting preview");
    }

    let running = Arc::new(AtomicBool::new(true));
    let consumer = spawn_consumer(sink.clone(), running.clone());

    if let Err(err) = tokio::task::block_in_place(|| coordinator.start_preview(&requests)) {
        // cameras that came up keep streaming
        warn!("{err}");
    }

    match config.pipeline.run_seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Run time elapsed"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    let started: Vec<&str> = requests.keys().map(String::as_str).collect();
    tokio::task::block_in_place(|| {
        coordinator.stop_preview(&started);
        coordinator.shutdown();
    });
    running.store(false, Ordering::Release);
    if consumer.join().is_err() {
        error!("Consumer thread panicked");
    }

    info!("multicam shutting down");
    Ok(())
}
