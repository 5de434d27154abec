use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Args;
use ml_core::{DEFAULT_BAND_RATIO, DEFAULT_INPUT_EDGE, LabelSet, RegionExtractor};
use video_ingest::{CapturePolicy, SourceKind};

use crate::{orchestrator::CycleSettings, supervisor::ReconnectPolicy};

/// Flags of the `run` command.
#[derive(Args, Clone, Debug)]
pub struct StationCliArgs {
    /// Camera index, /dev/videoN, stream URL, or a still image file/directory
    #[arg(long)]
    pub source: String,

    /// Serial port of the line controller, e.g. /dev/ttyACM0 or COM3
    #[arg(long)]
    pub port: String,

    #[arg(long, default_value_t = 9600)]
    pub baud: u32,

    #[arg(long, default_value_t = 1000)]
    pub read_timeout_ms: u64,

    /// Delay between DETECTED and the capture
    #[arg(long, default_value_t = 1000)]
    pub settle_ms: u64,

    /// Delay after the result is written
    #[arg(long, default_value_t = 3000)]
    pub post_report_ms: u64,

    /// TorchScript classifier
    #[arg(long)]
    pub model: PathBuf,

    /// Ordered label set matching the model outputs [default: Green,Red]
    #[arg(long, value_delimiter = ',')]
    pub labels: Option<Vec<String>>,

    #[arg(long, default_value_t = DEFAULT_INPUT_EDGE)]
    pub input_width: u32,

    #[arg(long, default_value_t = DEFAULT_INPUT_EDGE)]
    pub input_height: u32,

    /// Share of the frame height kept by the vertical band crop
    #[arg(long, default_value_t = DEFAULT_BAND_RATIO)]
    pub band_ratio: f64,

    /// Keep the camera open between captures
    #[arg(long)]
    pub keep_open: bool,

    #[arg(long)]
    pub capture_timeout_ms: Option<u64>,

    #[arg(long)]
    pub inference_timeout_ms: Option<u64>,

    /// Channel reopen attempts before giving up (0 fails fast)
    #[arg(long, default_value_t = 5)]
    pub reconnect_attempts: u32,

    #[arg(long, default_value_t = 500)]
    pub reconnect_backoff_ms: u64,

    /// Write the result a second time after this delay
    #[arg(long)]
    pub repeat_report_ms: Option<u64>,

    /// Feed the model NCHW instead of NHWC
    #[arg(long)]
    pub channels_first: bool,

    #[arg(long)]
    pub cpu: bool,

    #[arg(long)]
    pub verbose: bool,
}

#[derive(Clone, Debug)]
pub struct StationConfig {
    pub source_uri: String,
    pub source_kind: SourceKind,
    pub capture_policy: CapturePolicy,
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub model_path: PathBuf,
    pub labels: LabelSet,
    pub input_width: u32,
    pub input_height: u32,
    pub band_ratio: f64,
    pub settle_delay: Duration,
    pub post_report_delay: Duration,
    pub capture_timeout: Option<Duration>,
    pub inference_timeout: Option<Duration>,
    pub report_repeat: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    pub channels_first: bool,
    pub use_cpu: bool,
}

impl TryFrom<StationCliArgs> for StationConfig {
    type Error = anyhow::Error;

    fn try_from(args: StationCliArgs) -> Result<Self> {
        if args.source.trim().is_empty() {
            bail!("--source must not be empty");
        }
        if args.port.trim().is_empty() {
            bail!("--port must not be empty");
        }
        if args.baud == 0 {
            bail!("--baud must be a positive integer");
        }
        if args.read_timeout_ms == 0 {
            bail!("--read-timeout-ms must be at least 1");
        }
        if args.input_width == 0 || args.input_height == 0 {
            bail!("--input-width and --input-height must be positive");
        }
        if !(args.band_ratio > 0.0 && args.band_ratio <= 1.0) {
            bail!("--band-ratio must be in (0, 1], got {}", args.band_ratio);
        }
        if args.capture_timeout_ms == Some(0) {
            bail!("--capture-timeout-ms must be at least 1");
        }
        if args.inference_timeout_ms == Some(0) {
            bail!("--inference-timeout-ms must be at least 1");
        }

        let labels = match args.labels {
            Some(labels) => LabelSet::new(labels).context("invalid --labels")?,
            None => LabelSet::default(),
        };
        let capture_policy = if args.keep_open {
            CapturePolicy::KeepOpen
        } else {
            CapturePolicy::PerCapture
        };

        Ok(Self {
            source_kind: SourceKind::from_uri(&args.source),
            source_uri: args.source,
            capture_policy,
            port: args.port,
            baud_rate: args.baud,
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            model_path: args.model,
            labels,
            input_width: args.input_width,
            input_height: args.input_height,
            band_ratio: args.band_ratio,
            settle_delay: Duration::from_millis(args.settle_ms),
            post_report_delay: Duration::from_millis(args.post_report_ms),
            capture_timeout: args.capture_timeout_ms.map(Duration::from_millis),
            inference_timeout: args.inference_timeout_ms.map(Duration::from_millis),
            report_repeat: args.repeat_report_ms.map(Duration::from_millis),
            reconnect: ReconnectPolicy::new(
                args.reconnect_attempts,
                Duration::from_millis(args.reconnect_backoff_ms),
            ),
            channels_first: args.channels_first,
            use_cpu: args.cpu,
        })
    }
}

impl StationConfig {
    pub fn extractor(&self) -> RegionExtractor {
        RegionExtractor::new(self.input_width, self.input_height).with_band_ratio(self.band_ratio)
    }

    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            settle_delay: self.settle_delay,
            post_report_delay: self.post_report_delay,
            capture_timeout: self.capture_timeout,
            inference_timeout: self.inference_timeout,
            report_repeat: self.report_repeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: StationCliArgs,
    }

    fn parse(extra: &[&str]) -> Result<StationConfig> {
        let mut argv = vec![
            "inspection-station",
            "--source",
            "0",
            "--port",
            "/dev/ttyACM0",
            "--model",
            "model.pt",
        ];
        argv.extend_from_slice(extra);
        let harness = Harness::try_parse_from(argv)?;
        StationConfig::try_from(harness.args)
    }

    #[test]
    fn defaults_match_the_station_profile() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.source_kind, SourceKind::Device(0));
        assert_eq!(config.capture_policy, CapturePolicy::PerCapture);
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.labels, LabelSet::default());
        assert_eq!(config.extractor().input_size(), (64, 64));
        assert_eq!(config.cycle_settings(), CycleSettings::default());
        assert_eq!(config.reconnect.attempts, 5);
        assert!(!config.channels_first);
    }

    #[test]
    fn parses_overrides() {
        let config = parse(&[
            "--labels",
            "Good,Bad,Unknown",
            "--keep-open",
            "--repeat-report-ms",
            "250",
            "--capture-timeout-ms",
            "2000",
            "--band-ratio",
            "1.0",
        ])
        .unwrap();
        assert_eq!(config.labels.len(), 3);
        assert_eq!(config.labels.get(2), Some("Unknown"));
        assert_eq!(config.capture_policy, CapturePolicy::KeepOpen);
        assert_eq!(config.report_repeat, Some(Duration::from_millis(250)));
        assert_eq!(config.capture_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.band_ratio, 1.0);
    }

    #[test]
    fn rejects_bad_values() {
        for extra in [
            &["--band-ratio", "0"][..],
            &["--band-ratio", "1.5"],
            &["--input-width", "0"],
            &["--baud", "0"],
            &["--labels", "Red,Red"],
            &["--inference-timeout-ms", "0"],
        ] {
            assert!(parse(extra).is_err(), "accepted {extra:?}");
        }
    }

    #[test]
    fn missing_required_flags_fail_to_parse() {
        assert!(Harness::try_parse_from(["inspection-station", "--source", "0"]).is_err());
    }
}
