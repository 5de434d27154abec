use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use inspection::{StationCliArgs, StationConfig};
use ml_core::{Classifier, DEFAULT_BAND_RATIO, DEFAULT_INPUT_EDGE, LabelSet, RegionExtractor};
use tracing::info;

#[derive(Parser)]
#[command(name = "inspection-station")]
#[command(about = "Sensor-triggered visual inspection station", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Listen for triggers and report a label for every detected object
    Run(StationCliArgs),
    /// Write the normalised region of interest of a still image as PNG
    Roi {
        image: PathBuf,
        out: PathBuf,
        #[command(flatten)]
        region: RegionArgs,
        #[arg(long)]
        verbose: bool,
    },
    /// Classify a still image and print the label and scores
    Classify {
        image: PathBuf,
        #[arg(long)]
        model: PathBuf,
        /// Ordered label set matching the model outputs [default: Green,Red]
        #[arg(long, value_delimiter = ',')]
        labels: Option<Vec<String>>,
        #[command(flatten)]
        region: RegionArgs,
        #[arg(long)]
        channels_first: bool,
        #[arg(long)]
        cpu: bool,
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Args, Clone, Debug)]
pub struct RegionArgs {
    #[arg(long, default_value_t = DEFAULT_INPUT_EDGE)]
    pub input_width: u32,
    #[arg(long, default_value_t = DEFAULT_INPUT_EDGE)]
    pub input_height: u32,
    #[arg(long, default_value_t = DEFAULT_BAND_RATIO)]
    pub band_ratio: f64,
}

impl RegionArgs {
    fn extractor(&self) -> Result<RegionExtractor> {
        if self.input_width == 0 || self.input_height == 0 {
            bail!("--input-width and --input-height must be positive");
        }
        if !(self.band_ratio > 0.0 && self.band_ratio <= 1.0) {
            bail!("--band-ratio must be in (0, 1], got {}", self.band_ratio);
        }
        Ok(RegionExtractor::new(self.input_width, self.input_height)
            .with_band_ratio(self.band_ratio))
    }
}

impl Cli {
    pub fn verbose(&self) -> bool {
        match &self.command {
            Command::Run(args) => args.verbose,
            Command::Roi { verbose, .. } | Command::Classify { verbose, .. } => *verbose,
        }
    }
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = StationConfig::try_from(args)?;
            let classifier = load_classifier(
                &config.model_path,
                config.labels.clone(),
                (config.input_width, config.input_height),
                config.channels_first,
                config.use_cpu,
            )?;
            inspection::run(config, classifier)
        }
        Command::Roi {
            image, out, region, ..
        } => {
            let extractor = region.extractor()?;
            let frame = video_ingest::load_frame(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let crop = extractor
                .extract_image(&frame)
                .with_context(|| format!("cannot extract a region from {}", image.display()))?;
            crop.save(&out)
                .with_context(|| format!("failed to write {}", out.display()))?;
            info!(
                "wrote {}x{} region of {} to {}",
                crop.width(),
                crop.height(),
                image.display(),
                out.display()
            );
            Ok(())
        }
        Command::Classify {
            image,
            model,
            labels,
            region,
            channels_first,
            cpu,
            ..
        } => {
            let labels = match labels {
                Some(labels) => LabelSet::new(labels).context("invalid --labels")?,
                None => LabelSet::default(),
            };
            let extractor = region.extractor()?;
            let classifier =
                load_classifier(&model, labels, extractor.input_size(), channels_first, cpu)?;
            let frame = video_ingest::load_frame(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let tensor = extractor
                .extract(&frame)
                .with_context(|| format!("cannot extract a region from {}", image.display()))?;
            let result = classifier.classify(&tensor)?;

            println!("{}", result.label);
            for (label, score) in classifier.labels().iter().zip(&result.confidence) {
                println!("  {label:<12} {score:.4}");
            }
            Ok(())
        }
    }
}

#[cfg(feature = "with-tch")]
fn load_classifier(
    model: &Path,
    labels: LabelSet,
    input_size: (u32, u32),
    channels_first: bool,
    use_cpu: bool,
) -> Result<Box<dyn Classifier>> {
    use ml_core::{InputLayout, TorchClassifier, tch::Device};

    let device = if use_cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let layout = if channels_first {
        InputLayout::ChannelsFirst
    } else {
        InputLayout::ChannelsLast
    };
    let classifier = TorchClassifier::load(model, device, labels, input_size, layout)?;
    info!("model {} ready on {:?}", model.display(), classifier.device());
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "with-tch"))]
fn load_classifier(
    model: &Path,
    _labels: LabelSet,
    _input_size: (u32, u32),
    _channels_first: bool,
    _use_cpu: bool,
) -> Result<Box<dyn Classifier>> {
    bail!(
        "cannot load {}: this build has no TorchScript support, rebuild with `--features with-tch`",
        model.display()
    )
}
