//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use voice_led_edge::capture::{
    SegmentCallback, SegmentEvent, SegmentRequest, SegmentSource, SegmentSourceError,
};
use voice_led_edge::classifier::{
    ClassificationResult, Classifier, ClassifierStatus, Prediction, Signal, Timing,
};

#[derive(Default)]
struct MockState {
    callback: Option<SegmentCallback>,
    requests: Vec<SegmentRequest>,
    pending: Option<SegmentRequest>,
    fail_at: Option<usize>,
    aborts: usize,
}

/// Segment source whose completions are fired by the test through a
/// [`MockHandle`].
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
}

#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

pub fn mock_source() -> (MockSource, MockHandle) {
    let state = Arc::new(Mutex::new(MockState::default()));
    (
        MockSource {
            state: Arc::clone(&state),
        },
        MockHandle { state },
    )
}

impl SegmentSource for MockSource {
    fn register_callback(&mut self, callback: SegmentCallback) {
        self.state.lock().unwrap().callback = Some(callback);
    }

    fn start_segment(&mut self, request: SegmentRequest) -> Result<(), SegmentSourceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_at == Some(request.index) {
            return Err(SegmentSourceError::NotRunning("scripted failure".into()));
        }
        if let Some(pending) = state.pending {
            return Err(SegmentSourceError::Busy(pending.index));
        }
        state.requests.push(request);
        state.pending = Some(request);
        Ok(())
    }

    fn abort(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        state.aborts += 1;
    }
}

impl MockHandle {
    pub fn requests(&self) -> Vec<SegmentRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn pending(&self) -> Option<SegmentRequest> {
        self.state.lock().unwrap().pending
    }

    pub fn aborts(&self) -> usize {
        self.state.lock().unwrap().aborts
    }

    pub fn fail_at(&self, index: Option<usize>) {
        self.state.lock().unwrap().fail_at = index;
    }

    /// Complete the pending request with samples equal to `index + 1`.
    /// Returns `false` if nothing was pending.
    pub fn complete_pending(&self) -> bool {
        let request = self.state.lock().unwrap().pending.take();
        match request {
            Some(request) => {
                self.deliver(&vec![request.index as i16 + 1; request.len]);
                true
            }
            None => false,
        }
    }

    /// Complete the pending request with exactly `samples`.
    pub fn complete_with(&self, samples: &[i16]) {
        let request = self.state.lock().unwrap().pending.take();
        assert!(request.is_some(), "no segment pending");
        self.deliver(samples);
    }

    /// Complete `count` pending requests in order.
    pub fn complete(&self, count: usize) {
        for _ in 0..count {
            assert!(self.complete_pending(), "no segment pending");
        }
    }

    /// Fire a completion with `samples`, pending request or not.
    pub fn deliver(&self, samples: &[i16]) {
        // Never call back with the mock's lock held: the completion chains
        // straight into start_segment.
        let callback = self.state.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            callback(SegmentEvent::Complete { samples });
        }
    }

    pub fn fault(&self, reason: &str) {
        let callback = self.state.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            callback(SegmentEvent::Fault(reason.to_string()));
        }
    }
}

/// Classifier returning queued outcomes; repeats the last one when the
/// queue runs dry.
pub struct ScriptedClassifier {
    labels: Vec<String>,
    outcomes: VecDeque<Result<Vec<f32>, ClassifierStatus>>,
    last: Result<Vec<f32>, ClassifierStatus>,
    inputs: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl ScriptedClassifier {
    pub fn new(labels: &[&str], outcomes: Vec<Result<Vec<f32>, ClassifierStatus>>) -> Self {
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let last = Ok(vec![0.0; labels.len()]);
        Self {
            labels,
            outcomes: outcomes.into(),
            last,
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every signal the classifier was run on.
    pub fn inputs(&self) -> Arc<Mutex<Vec<Vec<f32>>>> {
        Arc::clone(&self.inputs)
    }
}

impl Classifier for ScriptedClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn run(&mut self, signal: &dyn Signal) -> Result<ClassificationResult, ClassifierStatus> {
        let mut samples = vec![0.0f32; signal.total_length()];
        signal
            .get_data(0, &mut samples)
            .map_err(|e| ClassifierStatus {
                code: -5,
                message: e.to_string(),
            })?;
        self.inputs.lock().unwrap().push(samples);

        if let Some(outcome) = self.outcomes.pop_front() {
            self.last = outcome;
        }
        let scores = self.last.clone()?;
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

pub fn status(code: i32, message: &str) -> ClassifierStatus {
    ClassifierStatus {
        code,
        message: message.to_string(),
    }
}
