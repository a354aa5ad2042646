use super::{SegmentCallback, SegmentEvent, SegmentRequest, SegmentSource, SegmentSourceError};
use crate::error::{EdgeError, Result};
use crate::lock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Replay configuration
#[derive(Debug, Clone)]
pub struct WavSourceConfig {
    pub path: PathBuf,
    /// Rate the classifier expects; the file must match it
    pub sample_rate: u32,
    /// Pace segments at the real capture rate instead of as fast as possible
    pub realtime: bool,
}

/// Segment source replaying a mono 16-bit WAV clip, looping at the end.
///
/// Requests are served in order by a worker thread, which plays the role of
/// the DMA engine: each request completes after (optionally) the time the
/// segment would take to record.
pub struct WavSegmentSource {
    requests: Option<mpsc::Sender<(u64, SegmentRequest)>>,
    callback: Arc<Mutex<Option<SegmentCallback>>>,
    epoch: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl WavSegmentSource {
    pub fn open(config: WavSourceConfig) -> Result<Self> {
        let mut reader = hound::WavReader::open(&config.path).map_err(|e| {
            EdgeError::Audio(format!("Failed to open {}: {}", config.path.display(), e))
        })?;

        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(EdgeError::Audio(format!(
                "{} must be mono 16-bit PCM, got {:?}",
                config.path.display(),
                spec
            )));
        }
        if spec.sample_rate != config.sample_rate {
            return Err(EdgeError::Audio(format!(
                "{} is sampled at {} Hz, expected {} Hz",
                config.path.display(),
                spec.sample_rate,
                config.sample_rate
            )));
        }

        let samples = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EdgeError::Audio(format!("Failed to read samples: {}", e)))?;

        log::info!(
            "📼 Replaying {} ({} samples, {:.2}s)",
            config.path.display(),
            samples.len(),
            samples.len() as f32 / config.sample_rate as f32
        );
        Self::from_samples(samples, config.sample_rate, config.realtime)
    }

    /// Replay an in-memory clip.
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32, realtime: bool) -> Result<Self> {
        if samples.is_empty() {
            return Err(EdgeError::Audio("Cannot replay an empty clip".into()));
        }

        let (tx, rx) = mpsc::channel::<(u64, SegmentRequest)>();
        let callback: Arc<Mutex<Option<SegmentCallback>>> = Arc::new(Mutex::new(None));
        let epoch = Arc::new(AtomicU64::new(0));

        let worker = {
            let callback = Arc::clone(&callback);
            let epoch = Arc::clone(&epoch);
            std::thread::Builder::new()
                .name("wav-replay".into())
                .spawn(move || {
                    let mut cursor = 0usize;
                    let mut segment = Vec::new();
                    while let Ok((issued_in, request)) = rx.recv() {
                        if realtime {
                            std::thread::sleep(Duration::from_secs_f64(
                                request.len as f64 / sample_rate as f64,
                            ));
                        }
                        if issued_in != epoch.load(Ordering::Acquire) {
                            continue;
                        }

                        segment.clear();
                        let mut next = cursor;
                        while segment.len() < request.len {
                            let take = (request.len - segment.len()).min(samples.len() - next);
                            segment.extend_from_slice(&samples[next..next + take]);
                            next = (next + take) % samples.len();
                        }

                        // An abort can land while the segment is gathered.
                        if issued_in != epoch.load(Ordering::Acquire) {
                            log::debug!("Discarding segment #{} after abort", request.index);
                            continue;
                        }
                        cursor = next;

                        let callback = lock(&callback).clone();
                        if let Some(callback) = callback {
                            callback(SegmentEvent::Complete { samples: &segment });
                        }
                    }
                    log::debug!("Replay worker finished");
                })?
        };

        Ok(Self {
            requests: Some(tx),
            callback,
            epoch,
            worker: Some(worker),
        })
    }
}

impl SegmentSource for WavSegmentSource {
    fn register_callback(&mut self, callback: SegmentCallback) {
        *lock(&self.callback) = Some(callback);
    }

    fn start_segment(&mut self, request: SegmentRequest) -> std::result::Result<(), SegmentSourceError> {
        if request.len == 0 {
            return Err(SegmentSourceError::InvalidRequest(format!(
                "segment #{} has no samples",
                request.index
            )));
        }
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| SegmentSourceError::NotRunning("replay stopped".into()))?;
        requests
            .send((self.epoch.load(Ordering::Acquire), request))
            .map_err(|_| SegmentSourceError::NotRunning("replay worker exited".into()))
    }

    fn abort(&mut self) {
        // Requests already queued belong to the previous epoch and are skipped.
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for WavSegmentSource {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            // The last owner can be dropped from inside a completion callback.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}
