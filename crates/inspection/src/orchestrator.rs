//! Inspection state machine.
//!
//! The orchestrator listens on the trigger channel and, for each `DETECTED`
//! token, runs exactly one capture → extract → classify → report cycle
//! before listening again. Per-cycle failures drop the inspection and return
//! to listening; only trigger channel failures escape.

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use ml_core::{
    Classification, Classifier, ClassifierError, InputTensor, LabelSet, MalformedFrame,
    RegionExtractor,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use trigger_link::{ChannelError, Trigger, TriggerChannel};
use video_ingest::{CaptureError, Frame, FrameSource};

use crate::stage::{StageError, StageWorker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Listening,
    Capturing,
    Classifying,
    Reporting,
}

impl State {
    /// Only `DETECTED` while listening starts a cycle; every other token
    /// leaves the state as it is.
    pub fn on_trigger(self, trigger: Trigger<'_>) -> State {
        match (self, trigger) {
            (State::Listening, Trigger::Detected) => State::Capturing,
            (state, _) => state,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            State::Listening => "listening",
            State::Capturing => "capturing",
            State::Classifying => "classifying",
            State::Reporting => "reporting",
        }
    }
}

/// Reason an inspection was dropped without a report.
#[derive(Debug, Error)]
pub enum CycleFault {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("malformed frame: {0}")]
    Malformed(#[from] MalformedFrame),
    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl CycleFault {
    pub fn label(&self) -> &'static str {
        match self {
            CycleFault::Capture(_) => "capture_error",
            CycleFault::Malformed(_) => "malformed_frame",
            CycleFault::Classifier(_) => "classifier_error",
            CycleFault::Stage(StageError::Timeout { .. }) => "stage_timeout",
            CycleFault::Stage(_) => "stage_unavailable",
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Reported(Classification),
    Dropped(CycleFault),
}

/// Timing knobs for one cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleSettings {
    /// Pause between the trigger and the capture so the object stops moving.
    pub settle_delay: Duration,
    /// Pause after reporting so a bouncing sensor does not re-trigger on the
    /// same object.
    pub post_report_delay: Duration,
    pub capture_timeout: Option<Duration>,
    pub inference_timeout: Option<Duration>,
    /// Send the result a second time after this delay.
    pub report_repeat: Option<Duration>,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            post_report_delay: Duration::from_secs(3),
            capture_timeout: None,
            inference_timeout: None,
            report_repeat: None,
        }
    }
}

type CaptureStage = StageWorker<(), Result<Frame, CaptureError>>;
type InferenceStage = StageWorker<InputTensor, Result<Classification, ClassifierError>>;

pub struct Orchestrator<C: TriggerChannel> {
    channel: C,
    extractor: RegionExtractor,
    capture: CaptureStage,
    inference: InferenceStage,
    labels: LabelSet,
    settings: CycleSettings,
    state: State,
    cycles: u64,
}

impl<C: TriggerChannel> Orchestrator<C> {
    /// Takes ownership of the frame source and the loaded classifier; each
    /// moves onto its own stage worker thread.
    pub fn new<S, K>(
        channel: C,
        source: S,
        classifier: K,
        extractor: RegionExtractor,
        settings: CycleSettings,
    ) -> io::Result<Self>
    where
        S: FrameSource + 'static,
        K: Classifier + 'static,
    {
        let labels = classifier.labels().clone();
        let mut source = source;
        let capture = StageWorker::spawn("capture", settings.capture_timeout, move |()| {
            source.capture()
        })?;
        let inference = StageWorker::spawn(
            "inference",
            settings.inference_timeout,
            move |tensor: InputTensor| classifier.classify(&tensor),
        )?;

        Ok(Self {
            channel,
            extractor,
            capture,
            inference,
            labels,
            settings,
            state: State::Listening,
            cycles: 0,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Poll the channel once. Returns the cycle outcome when the line was a
    /// trigger, `None` otherwise.
    pub fn listen(&mut self) -> Result<Option<CycleOutcome>, ChannelError> {
        let Some(line) = self.channel.poll()? else {
            return Ok(None);
        };

        let trigger = Trigger::parse(&line);
        metrics::counter!("inspection_triggers_total", "kind" => trigger.label()).increment(1);
        match trigger {
            Trigger::Detected => debug!("controller: {line:?}"),
            Trigger::Idle => trace!("controller: blank line"),
            Trigger::Other(text) => info!("ignoring controller message {text:?}"),
        }

        if self.state.on_trigger(trigger) != State::Capturing {
            return Ok(None);
        }
        self.run_cycle().map(Some)
    }

    /// Listen until `shutdown` is raised or the channel fails.
    pub fn run_until(&mut self, shutdown: &AtomicBool) -> Result<(), ChannelError> {
        while !shutdown.load(Ordering::SeqCst) {
            self.listen()?;
        }
        Ok(())
    }

    fn run_cycle(&mut self) -> Result<CycleOutcome, ChannelError> {
        self.cycles = self.cycles.wrapping_add(1);
        let span = tracing::info_span!("inspection.cycle", cycle = self.cycles);
        let _guard = span.enter();
        let started = Instant::now();

        let outcome = self.cycle_steps();
        self.state = State::Listening;
        let outcome = outcome?;

        let label = match &outcome {
            CycleOutcome::Reported(_) => "reported",
            CycleOutcome::Dropped(fault) => fault.label(),
        };
        metrics::counter!("inspection_cycles_total", "outcome" => label).increment(1);
        metrics::histogram!("inspection_stage_latency_seconds", "stage" => "cycle")
            .record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    fn cycle_steps(&mut self) -> Result<CycleOutcome, ChannelError> {
        info!("object detected, capturing in {:?}", self.settings.settle_delay);
        self.state = State::Capturing;
        pause(self.settings.settle_delay);

        let classification = match self.inspect() {
            Ok(classification) => classification,
            Err(fault) => {
                warn!("inspection dropped: {fault}");
                self.channel.discard_pending()?;
                return Ok(CycleOutcome::Dropped(fault));
            }
        };

        self.state = State::Reporting;
        self.channel.send(&classification.label)?;
        info!(
            "reported {} (score {:.3}, scores {:?})",
            classification.label,
            classification.score(),
            classification.confidence
        );
        if let Some(delay) = self.settings.report_repeat {
            pause(delay);
            self.channel.send(&classification.label)?;
            debug!("repeated report {}", classification.label);
        }

        pause(self.settings.post_report_delay);
        self.channel.discard_pending()?;
        Ok(CycleOutcome::Reported(classification))
    }

    fn inspect(&mut self) -> Result<Classification, CycleFault> {
        let frame = timed("capture", || self.capture.call(()))??;
        debug!(
            "captured {}x{} frame at {}",
            frame.width, frame.height, frame.timestamp_ms
        );

        self.state = State::Classifying;
        let tensor = timed("extract", || self.extractor.extract(&frame))?;
        drop(frame);

        let classification = timed("inference", || self.inference.call(tensor))??;
        Ok(classification)
    }
}

/// Run one stage inside its own span and record how long it took.
fn timed<T>(stage: &'static str, f: impl FnOnce() -> T) -> T {
    let _span = tracing::debug_span!("inspection.stage", stage).entered();
    let started = Instant::now();
    let output = f();
    metrics::histogram!("inspection_stage_latency_seconds", "stage" => stage)
        .record(started.elapsed().as_secs_f64());
    output
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}
