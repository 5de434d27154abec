//! TorchScript-backed classifier.

use std::{convert::TryFrom, path::Path};

use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use crate::{
    classifier::{Classification, Classifier, ClassifierError, LabelSet, normalize_scores},
    roi::InputTensor,
};

/// Memory layout the exported model expects its input in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputLayout {
    /// `[batch, height, width, channels]`, as produced by the extractor.
    #[default]
    ChannelsLast,
    /// `[batch, channels, height, width]`, the PyTorch convention.
    ChannelsFirst,
}

pub struct TorchClassifier {
    module: tch::CModule,
    device: Device,
    labels: LabelSet,
    input_size: (i64, i64),
    layout: InputLayout,
}

impl TorchClassifier {
    /// Load a TorchScript module and check it against the label set with a
    /// warm-up pass. `input_size` is `(width, height)`.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        labels: LabelSet,
        input_size: (u32, u32),
        layout: InputLayout,
    ) -> Result<Self, ClassifierError> {
        let path = model_path.as_ref();
        let load_error = |reason: String| ClassifierError::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            return Err(load_error("model artifact does not exist".to_string()));
        }

        let module =
            tch::CModule::load_on_device(path, device).map_err(|err| load_error(err.to_string()))?;
        let classifier = Self {
            module,
            device,
            labels,
            input_size: (i64::from(input_size.0), i64::from(input_size.1)),
            layout,
        };

        let (w, h) = classifier.input_size;
        let probe = Tensor::zeros([1, h, w, 3], (Kind::Float, device));
        let scores = classifier
            .forward(probe)
            .map_err(|err| load_error(format!("warm-up inference failed: {err}")))?;
        if scores.len() != classifier.labels.len() {
            return Err(load_error(format!(
                "model emits {} score(s) but {} label(s) are configured",
                scores.len(),
                classifier.labels.len()
            )));
        }

        debug!(
            "classifier loaded from {} on {:?} ({} labels)",
            path.display(),
            device,
            classifier.labels.len()
        );
        Ok(classifier)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Run the module on an NHWC batch and return the flattened output.
    fn forward(&self, nhwc: Tensor) -> Result<Vec<f32>, ClassifierError> {
        let input = match self.layout {
            InputLayout::ChannelsLast => nhwc,
            InputLayout::ChannelsFirst => nhwc.permute([0, 3, 1, 2]).contiguous(),
        };
        let output = tch::no_grad(|| self.module.forward_ts(&[&input]))
            .map_err(|err| ClassifierError::Inference(err.to_string()))?;
        let flat = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .flatten(0, -1);
        Vec::<f32>::try_from(&flat).map_err(|err| ClassifierError::Inference(err.to_string()))
    }
}

impl Classifier for TorchClassifier {
    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn classify(&self, input: &InputTensor) -> Result<Classification, ClassifierError> {
        let (w, h) = self.input_size;
        if (input.width() as i64, input.height() as i64) != (w, h) {
            return Err(ClassifierError::Inference(format!(
                "input {}x{} does not match model input {w}x{h}",
                input.width(),
                input.height()
            )));
        }
        let tensor = Tensor::from_slice(input.as_slice())
            .to_device(self.device)
            .view([1, h, w, 3]);
        let scores = self.forward(tensor)?;
        self.labels.resolve(normalize_scores(scores))
    }
}
