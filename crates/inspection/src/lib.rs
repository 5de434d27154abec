//! Inspection station runtime.
//!
//! The line controller reports `DETECTED` over a serial link; the station
//! captures a frame, classifies the region of interest and writes the label
//! back so the controller can sort the object. [`run`] wires the frame
//! source, the trigger channel and an injected classifier together and
//! supervises the loop until Ctrl+C.

pub mod config;
pub mod orchestrator;
pub mod stage;
pub mod supervisor;
pub mod telemetry;

use std::sync::{
    Arc, Once,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, bail};
use ml_core::Classifier;
use tracing::{info, warn};
use trigger_link::SerialTriggerChannel;

pub use config::{StationCliArgs, StationConfig};
pub use orchestrator::{CycleFault, CycleOutcome, CycleSettings, Orchestrator, State};
pub use stage::StageError;
pub use supervisor::{ReconnectPolicy, connect, supervise};

/// Run the station until Ctrl+C or until the trigger channel is lost for good.
pub fn run(config: StationConfig, classifier: Box<dyn Classifier>) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _ = telemetry::init_metrics_recorder();
    let station_span = tracing::info_span!(
        "inspection.station",
        source = %config.source_uri,
        source_kind = ?config.source_kind,
        port = %config.port,
        labels = %config.labels,
    );
    let _station_guard = station_span.enter();

    if classifier.labels() != &config.labels {
        bail!(
            "classifier labels [{}] do not match configured labels [{}]",
            classifier.labels(),
            config.labels
        );
    }

    let source = video_ingest::open_source(&config.source_uri, config.capture_policy)
        .with_context(|| format!("failed to open frame source {}", config.source_uri))?;
    info!("frame source ready: {}", source.describe());

    let channel = connect(
        || SerialTriggerChannel::open(&config.port, config.baud_rate, config.read_timeout),
        &config.reconnect,
        &shutdown,
    )
    .with_context(|| format!("failed to open trigger channel {}", config.port))?;
    let Some(channel) = channel else {
        info!("shutdown requested before the trigger channel opened");
        return Ok(());
    };

    let mut orchestrator = Orchestrator::new(
        channel,
        source,
        classifier,
        config.extractor(),
        config.cycle_settings(),
    )
    .context("failed to start stage workers")?;
    info!(
        "listening on {} at {} baud; labels [{}]",
        config.port,
        config.baud_rate,
        orchestrator.labels()
    );

    let result = supervise(&mut orchestrator, &config.reconnect, &shutdown);
    info!("station stopped after {} cycle(s)", orchestrator.cycles());
    if let Some(snapshot) = telemetry::render_metrics() {
        info!("metrics at shutdown:\n{snapshot}");
    }

    result.with_context(|| format!("trigger channel {} lost", config.port))
}
