//! Model-side building blocks: the region-of-interest extractor that turns a
//! raw frame into a fixed-size tensor, and the classifier adapter around the
//! trained model.

pub mod classifier;
pub mod roi;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use classifier::{
    Classification, Classifier, ClassifierError, LabelSet, argmax, normalize_scores,
};
pub use roi::{
    DEFAULT_BAND_RATIO, DEFAULT_INPUT_EDGE, InputTensor, MalformedFrame, Region, RegionExtractor,
};
#[cfg(feature = "with-tch")]
pub use torch::{InputLayout, TorchClassifier};

#[cfg(feature = "with-tch")]
pub use tch;
