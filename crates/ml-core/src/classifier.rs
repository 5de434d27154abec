use std::{collections::HashSet, fmt, path::PathBuf};

use thiserror::Error;

use crate::roi::InputTensor;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to load model {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("invalid label set: {0}")]
    Labels(String),
    #[error("model produced {actual} score(s) for {expected} label(s)")]
    Shape { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Ordered set of class names. Index `i` names output `i` of the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSet(Vec<String>);

impl Default for LabelSet {
    /// Classes sorted by name, the order the reference model was trained with.
    fn default() -> Self {
        Self(vec!["Green".to_string(), "Red".to_string()])
    }
}

impl LabelSet {
    /// Labels travel over the serial link as bare tokens, so they must be
    /// non-empty, unique and free of whitespace.
    pub fn new<I, S>(labels: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(ClassifierError::Labels("at least one label is required".into()));
        }
        let mut seen = HashSet::new();
        for label in &labels {
            if label.is_empty() || label.chars().any(char::is_whitespace) {
                return Err(ClassifierError::Labels(format!(
                    "label {label:?} must be a non-empty token without whitespace"
                )));
            }
            if !seen.insert(label.as_str()) {
                return Err(ClassifierError::Labels(format!("duplicate label {label:?}")));
            }
        }
        Ok(Self(labels))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Pick the highest scoring label. Ties go to the lowest index.
    pub fn resolve(&self, confidence: Vec<f32>) -> Result<Classification, ClassifierError> {
        if confidence.len() != self.0.len() {
            return Err(ClassifierError::Shape {
                expected: self.0.len(),
                actual: confidence.len(),
            });
        }
        let index = argmax(&confidence).ok_or_else(|| {
            ClassifierError::Inference("model produced no finite scores".to_string())
        })?;
        Ok(Classification {
            label: self.0[index].clone(),
            index,
            confidence,
        })
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// Index of the largest finite score, first one wins on ties.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if !score.is_finite() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Outcome of a single inference.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub label: String,
    pub index: usize,
    /// Per-label scores aligned with the label set.
    pub confidence: Vec<f32>,
}

impl Classification {
    /// Score of the winning label.
    pub fn score(&self) -> f32 {
        self.confidence[self.index]
    }
}

/// A loaded model that maps normalised input tensors to labels.
pub trait Classifier: Send {
    fn labels(&self) -> &LabelSet;

    fn classify(&self, input: &InputTensor) -> Result<Classification, ClassifierError>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn labels(&self) -> &LabelSet {
        (**self).labels()
    }

    fn classify(&self, input: &InputTensor) -> Result<Classification, ClassifierError> {
        (**self).classify(input)
    }
}

/// Turn raw model outputs into probabilities when they are not already.
pub fn normalize_scores(raw: Vec<f32>) -> Vec<f32> {
    let is_distribution = raw.iter().all(|v| (0.0..=1.0).contains(v))
        && (raw.iter().sum::<f32>() - 1.0).abs() < 1e-3;
    if is_distribution || raw.is_empty() {
        return raw;
    }
    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = raw.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_argmax_against_label_order() {
        let labels = LabelSet::default();
        let result = labels.resolve(vec![0.1, 0.9]).unwrap();
        assert_eq!(result.label, "Red");
        assert_eq!(result.index, 1);
        assert_eq!(result.score(), 0.9);

        let result = labels.resolve(vec![0.7, 0.3]).unwrap();
        assert_eq!(result.label, "Green");
    }

    #[test]
    fn ties_and_nans() {
        assert_eq!(argmax(&[0.5, 0.5]), Some(0));
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.1]), Some(1));
        assert_eq!(argmax(&[f32::NAN]), None);
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn mismatched_score_count_is_a_shape_error() {
        let err = LabelSet::default().resolve(vec![1.0]).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::Shape {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn label_sets_are_validated() {
        assert!(LabelSet::new(Vec::<String>::new()).is_err());
        assert!(LabelSet::new(["Red", "Red"]).is_err());
        assert!(LabelSet::new(["Dark Red"]).is_err());
        assert!(LabelSet::new([""]).is_err());
        let labels = LabelSet::new(["Green", "Red", "Blue"]).unwrap();
        assert_eq!(labels.to_string(), "Green,Red,Blue");
        assert_eq!(labels.get(2), Some("Blue"));
    }

    #[test]
    fn logits_are_softmaxed_probabilities_pass_through() {
        let probs = vec![0.25, 0.75];
        assert_eq!(normalize_scores(probs.clone()), probs);

        let normalized = normalize_scores(vec![2.0, 0.0]);
        assert!((normalized.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(normalized[0] > normalized[1]);
    }
}
