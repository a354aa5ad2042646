//! Keyword classification using TensorFlow Lite
//!
//! The model takes the whole window as a `[1, window_len]` float tensor and
//! produces one probability per label.

use super::{ClassificationResult, Classifier, ClassifierStatus, Prediction, Signal, Timing};
use crate::error::{EdgeError, Result};
use std::path::Path;
use std::time::Instant;

use tflitec::interpreter::{Interpreter, Options};
use tflitec::model::Model;
use tflitec::tensor::Shape;

/// Signal could not provide the requested samples
pub const STATUS_SIGNAL_ERROR: i32 = -5;
/// Interpreter rejected the input or failed to run
pub const STATUS_INFERENCE_ERROR: i32 = -6;
/// Output tensor does not match the label set
pub const STATUS_OUTPUT_MISMATCH: i32 = -7;

pub struct TfliteClassifier {
    interpreter: Interpreter<'static>,
    labels: Vec<String>,
    input: Vec<f32>,
}

impl TfliteClassifier {
    pub fn new(model_path: &Path, labels: Vec<String>, window_len: usize) -> Result<Self> {
        if labels.is_empty() {
            return Err(EdgeError::ModelLoadError("Label list is empty".into()));
        }

        let path = model_path.to_string_lossy();
        // Load the model and leak it for 'static lifetime
        let model = Box::leak(Box::new(Model::new(&path).map_err(|e| {
            EdgeError::ModelLoadError(format!("Failed to load classifier model {}: {}", path, e))
        })?));

        let mut options = Options::default();
        options.thread_count = 1;

        let interpreter = Interpreter::new(model, Some(options)).map_err(|e| {
            EdgeError::ModelLoadError(format!("Failed to create classifier interpreter: {}", e))
        })?;

        interpreter
            .resize_input(0, Shape::new(vec![1, window_len]))
            .map_err(|e| {
                EdgeError::ModelLoadError(format!("Failed to resize classifier input: {}", e))
            })?;

        interpreter.allocate_tensors().map_err(|e| {
            EdgeError::ModelLoadError(format!("Failed to allocate classifier tensors: {}", e))
        })?;

        log::info!(
            "🧠 Loaded classifier {} ({} labels, {} input samples)",
            path,
            labels.len(),
            window_len
        );

        Ok(Self {
            interpreter,
            labels,
            input: vec![0.0; window_len],
        })
    }

    /// Read one label per line, skipping blank lines.
    pub fn load_labels(path: &Path) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(path)?;
        let labels: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        if labels.is_empty() {
            return Err(EdgeError::ModelLoadError(format!(
                "No labels found in {}",
                path.display()
            )));
        }
        Ok(labels)
    }
}

impl Classifier for TfliteClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn run(&mut self, signal: &dyn Signal) -> std::result::Result<ClassificationResult, ClassifierStatus> {
        if signal.total_length() != self.input.len() {
            return Err(ClassifierStatus {
                code: STATUS_SIGNAL_ERROR,
                message: format!(
                    "signal has {} samples, model expects {}",
                    signal.total_length(),
                    self.input.len()
                ),
            });
        }

        let dsp_started = Instant::now();
        signal
            .get_data(0, &mut self.input)
            .map_err(|e| ClassifierStatus {
                code: STATUS_SIGNAL_ERROR,
                message: e.to_string(),
            })?;
        let dsp = dsp_started.elapsed();

        let inference_started = Instant::now();
        let inference_error = |e: tflitec::Error| ClassifierStatus {
            code: STATUS_INFERENCE_ERROR,
            message: e.to_string(),
        };
        self.interpreter
            .copy(&self.input[..], 0)
            .map_err(inference_error)?;
        self.interpreter.invoke().map_err(inference_error)?;

        let output = self.interpreter.output(0).map_err(inference_error)?;
        let scores = output.data::<f32>();
        if scores.len() != self.labels.len() {
            return Err(ClassifierStatus {
                code: STATUS_OUTPUT_MISMATCH,
                message: format!(
                    "model produced {} scores for {} labels",
                    scores.len(),
                    self.labels.len()
                ),
            });
        }

        let predictions = self
            .labels
            .iter()
            .zip(scores)
            .map(|(label, &score)| Prediction {
                label: label.clone(),
                score,
            })
            .collect();

        Ok(ClassificationResult {
            predictions,
            timing: Timing {
                dsp,
                classification: inference_started.elapsed(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_labels_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "_noise\n\nblue\n  green  \n").unwrap();

        let labels = TfliteClassifier::load_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["_noise", "blue", "green"]);
    }

    #[test]
    fn test_load_labels_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(TfliteClassifier::load_labels(file.path()).is_err());
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let result = TfliteClassifier::new(Path::new("does/not/exist.tflite"), vec!["a".into()], 16);
        assert!(matches!(result, Err(EdgeError::ModelLoadError(_))));
    }
}
