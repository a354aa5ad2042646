//! Boundary to the external audio classifier.
//!
//! The classifier never sees the capture buffer directly. It pulls samples
//! through a [`Signal`], which converts the window's signed 16-bit samples to
//! `f32` on demand, and hands back one score per label.

use crate::capture::AudioWindow;
use clap::ValueEnum;
use dasp_sample::Sample;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod tflite;

pub use tflite::TfliteClassifier;

/// How window samples are presented to the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SampleEncoding {
    /// `i16 / 32768` in `[-1.0, 1.0)`
    #[default]
    Normalized,
    /// The raw `i16` value widened to `f32`
    Raw,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Requested samples {offset}..{end} but the signal holds {len}")]
    OutOfRange { offset: usize, end: usize, len: usize },
}

/// Pull-based view of the samples handed to a classifier.
pub trait Signal {
    fn total_length(&self) -> usize;

    /// Fill `out` with `out.len()` samples starting at `offset`.
    fn get_data(&self, offset: usize, out: &mut [f32]) -> Result<(), SignalError>;
}

/// A [`Signal`] over a completed capture window.
pub struct WindowSignal<'a> {
    samples: &'a [i16],
    encoding: SampleEncoding,
}

impl<'a> WindowSignal<'a> {
    pub fn new(window: &'a AudioWindow, encoding: SampleEncoding) -> Self {
        Self {
            samples: window.samples(),
            encoding,
        }
    }
}

impl Signal for WindowSignal<'_> {
    fn total_length(&self) -> usize {
        self.samples.len()
    }

    fn get_data(&self, offset: usize, out: &mut [f32]) -> Result<(), SignalError> {
        let end = offset + out.len();
        let source = self.samples.get(offset..end).ok_or(SignalError::OutOfRange {
            offset,
            end,
            len: self.samples.len(),
        })?;

        match self.encoding {
            SampleEncoding::Normalized => {
                for (dst, &src) in out.iter_mut().zip(source) {
                    *dst = src.to_sample::<f32>();
                }
            }
            SampleEncoding::Raw => {
                for (dst, &src) in out.iter_mut().zip(source) {
                    *dst = src as f32;
                }
            }
        }
        Ok(())
    }
}

/// One label and its probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub score: f32,
}

/// Time spent in feature extraction and in inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timing {
    pub dsp: Duration,
    pub classification: Duration,
}

/// Scores for every label, in the classifier's label order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub predictions: Vec<Prediction>,
    pub timing: Timing,
}

impl ClassificationResult {
    pub fn score(&self, class_index: usize) -> Option<f32> {
        self.predictions.get(class_index).map(|p| p.score)
    }

    /// Highest scoring prediction.
    pub fn top(&self) -> Option<&Prediction> {
        self.predictions
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

impl fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .predictions
            .iter()
            .map(|p| p.label.len())
            .max()
            .unwrap_or(0)
            .max(5);

        writeln!(f, "{:<width$} | score", "label", width = width)?;
        writeln!(f, "{:-<width$}-+------", "", width = width)?;
        for prediction in &self.predictions {
            writeln!(
                f,
                "{:<width$} | {:.3}",
                prediction.label,
                prediction.score,
                width = width
            )?;
        }
        write!(
            f,
            "(DSP: {} ms, inference: {} ms)",
            self.timing.dsp.as_millis(),
            self.timing.classification.as_millis()
        )
    }
}

/// Non-success status reported by a classifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("status {code}: {message}")]
pub struct ClassifierStatus {
    pub code: i32,
    pub message: String,
}

/// An external audio classifier.
pub trait Classifier {
    /// Labels in output order.
    fn labels(&self) -> &[String];

    fn run(&mut self, signal: &dyn Signal) -> Result<ClassificationResult, ClassifierStatus>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("Classifier failed with status {code}: {message}")]
    Status { code: i32, message: String },
    #[error("Window holds {actual} samples, classifier expects {expected}")]
    WindowLength { expected: usize, actual: usize },
    #[error("Classifier returned {actual} scores for {expected} labels")]
    LabelCount { expected: usize, actual: usize },
    #[error("Classification took {elapsed:?}, over the {budget:?} budget")]
    BudgetExceeded { elapsed: Duration, budget: Duration },
}

impl From<ClassifierStatus> for ClassifyError {
    fn from(status: ClassifierStatus) -> Self {
        ClassifyError::Status {
            code: status.code,
            message: status.message,
        }
    }
}

/// Runs the classifier over completed windows.
pub struct ClassifierAdapter {
    classifier: Box<dyn Classifier>,
    window_len: usize,
    encoding: SampleEncoding,
    budget: Option<Duration>,
}

impl ClassifierAdapter {
    pub fn new(classifier: Box<dyn Classifier>, window_len: usize, encoding: SampleEncoding) -> Self {
        Self {
            classifier,
            window_len,
            encoding,
            budget: None,
        }
    }

    /// Results that take longer than `budget` are discarded.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn labels(&self) -> &[String] {
        self.classifier.labels()
    }

    /// Classify one window. Blocks the caller until the classifier returns.
    pub fn classify(&mut self, window: &AudioWindow) -> Result<ClassificationResult, ClassifyError> {
        if window.len() != self.window_len {
            return Err(ClassifyError::WindowLength {
                expected: self.window_len,
                actual: window.len(),
            });
        }

        let signal = WindowSignal::new(window, self.encoding);
        let started = Instant::now();
        let result = self.classifier.run(&signal)?;
        let elapsed = started.elapsed();

        if let Some(budget) = self.budget {
            if elapsed > budget {
                return Err(ClassifyError::BudgetExceeded { elapsed, budget });
            }
        }

        let expected = self.classifier.labels().len();
        if result.predictions.len() != expected {
            return Err(ClassifyError::LabelCount {
                expected,
                actual: result.predictions.len(),
            });
        }

        for prediction in &result.predictions {
            if !(0.0..=1.0).contains(&prediction.score) {
                log::warn!(
                    "Score for '{}' out of range: {:.6} (expected 0.0-1.0)",
                    prediction.label,
                    prediction.score
                );
            }
        }

        log::debug!("Classification finished in {:?}", elapsed);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClassifier {
        labels: Vec<String>,
        outcome: Result<Vec<f32>, ClassifierStatus>,
    }

    impl Classifier for FixedClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn run(&mut self, signal: &dyn Signal) -> Result<ClassificationResult, ClassifierStatus> {
            let mut samples = vec![0.0f32; signal.total_length()];
            signal.get_data(0, &mut samples).unwrap();

            let scores = self.outcome.clone()?;
            Ok(ClassificationResult {
                predictions: self
                    .labels
                    .iter()
                    .zip(scores)
                    .map(|(label, score)| Prediction {
                        label: label.clone(),
                        score,
                    })
                    .collect(),
                timing: Timing::default(),
            })
        }
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalized_signal() {
        let window = AudioWindow::from_samples(vec![i16::MIN, 0, 16384]);
        let signal = WindowSignal::new(&window, SampleEncoding::Normalized);
        let mut out = [0.0f32; 3];

        signal.get_data(0, &mut out).unwrap();

        assert_eq!(out, [-1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_raw_signal_with_offset() {
        let window = AudioWindow::from_samples(vec![1, -2, 300, 4]);
        let signal = WindowSignal::new(&window, SampleEncoding::Raw);
        let mut out = [0.0f32; 2];

        signal.get_data(1, &mut out).unwrap();

        assert_eq!(out, [-2.0, 300.0]);
        assert_eq!(signal.total_length(), 4);
    }

    #[test]
    fn test_signal_rejects_out_of_range() {
        let window = AudioWindow::new(4);
        let signal = WindowSignal::new(&window, SampleEncoding::Normalized);
        let mut out = [0.0f32; 3];

        let err = signal.get_data(2, &mut out).unwrap_err();
        assert_eq!(err, SignalError::OutOfRange { offset: 2, end: 5, len: 4 });
    }

    #[test]
    fn test_adapter_passes_normalized_samples() {
        let classifier = FixedClassifier {
            labels: labels(&["noise", "light"]),
            outcome: Ok(vec![0.2, 0.8]),
        };
        let mut adapter = ClassifierAdapter::new(Box::new(classifier), 2, SampleEncoding::Normalized);

        let result = adapter
            .classify(&AudioWindow::from_samples(vec![-16384, 0]))
            .unwrap();

        assert_eq!(result.score(1), Some(0.8));
        assert_eq!(result.top().map(|p| p.label.as_str()), Some("light"));
    }

    #[test]
    fn test_adapter_reports_status() {
        let classifier = FixedClassifier {
            labels: labels(&["noise"]),
            outcome: Err(ClassifierStatus {
                code: -5,
                message: "dsp failed".into(),
            }),
        };
        let mut adapter = ClassifierAdapter::new(Box::new(classifier), 2, SampleEncoding::Normalized);

        let err = adapter.classify(&AudioWindow::new(2)).unwrap_err();
        assert_eq!(
            err,
            ClassifyError::Status {
                code: -5,
                message: "dsp failed".into()
            }
        );
    }

    #[test]
    fn test_adapter_rejects_wrong_window() {
        let classifier = FixedClassifier {
            labels: labels(&["noise"]),
            outcome: Ok(vec![1.0]),
        };
        let mut adapter = ClassifierAdapter::new(Box::new(classifier), 16, SampleEncoding::Raw);

        let err = adapter.classify(&AudioWindow::new(8)).unwrap_err();
        assert_eq!(err, ClassifyError::WindowLength { expected: 16, actual: 8 });
    }

    #[test]
    fn test_adapter_rejects_missing_scores() {
        let classifier = FixedClassifier {
            labels: labels(&["a", "b", "c"]),
            outcome: Ok(vec![0.1, 0.9]),
        };
        let mut adapter = ClassifierAdapter::new(Box::new(classifier), 1, SampleEncoding::Raw);

        let err = adapter.classify(&AudioWindow::new(1)).unwrap_err();
        assert_eq!(err, ClassifyError::LabelCount { expected: 3, actual: 2 });
    }

    #[test]
    fn test_results_table() {
        let result = ClassificationResult {
            predictions: vec![
                Prediction {
                    label: "green".into(),
                    score: 0.125,
                },
                Prediction {
                    label: "red".into(),
                    score: 0.875,
                },
            ],
            timing: Timing {
                dsp: Duration::from_millis(3),
                classification: Duration::from_millis(41),
            },
        };

        let table = result.to_string();
        assert!(table.contains("green | 0.125"));
        assert!(table.contains("red   | 0.875"));
        assert!(table.ends_with("(DSP: 3 ms, inference: 41 ms)"));
    }
}
