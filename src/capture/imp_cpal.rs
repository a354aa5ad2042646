use super::{SegmentCallback, SegmentEvent, SegmentRequest, SegmentSource, SegmentSourceError};
use crate::error::{EdgeError, Result};
use crate::lock;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Microphone capture configuration
#[derive(Debug, Clone)]
pub struct CpalSourceConfig {
    /// Device name to capture from (None = default device)
    pub device_name: Option<String>,
    /// Rate the classifier expects
    pub sample_rate: u32,
    /// Channel to keep from interleaved input (0-based)
    pub channel: u16,
}

impl Default for CpalSourceConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16_000,
            channel: 0,
        }
    }
}

#[derive(Default)]
struct Transfer {
    request: Option<SegmentRequest>,
    collected: Vec<i16>,
}

/// Segment source backed by a live input device.
///
/// The input stream runs continuously on its own thread, like a PDM block
/// that is started once at boot. Samples only land in a segment while a
/// transfer is pending; samples arriving between transfers are dropped,
/// except for the overflow of a just-completed segment which seeds the next
/// chained one.
pub struct CpalSegmentSource {
    transfer: Arc<Mutex<Transfer>>,
    callback: Arc<Mutex<Option<SegmentCallback>>>,
    running: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSegmentSource {
    /// Open the device and start streaming. Fails if no usable input
    /// configuration exists.
    pub fn open(config: CpalSourceConfig) -> Result<Self> {
        let transfer = Arc::new(Mutex::new(Transfer::default()));
        let callback: Arc<Mutex<Option<SegmentCallback>>> = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (init_tx, init_rx) = mpsc::channel::<Result<()>>();

        let worker = {
            let transfer = Arc::clone(&transfer);
            let callback = Arc::clone(&callback);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("pdm-capture".into())
                .spawn(move || {
                    // cpal streams are not Send on every host, so the stream
                    // lives and dies on this thread.
                    let stream = match build_stream(&config, transfer, Arc::clone(&callback)) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = init_tx.send(Err(EdgeError::Audio(format!(
                            "Failed to start input stream: {}",
                            e
                        ))));
                        return;
                    }
                    running.store(true, Ordering::Release);
                    let _ = init_tx.send(Ok(()));

                    let _ = stop_rx.recv();
                    running.store(false, Ordering::Release);
                    drop(stream);
                    log::debug!("Input stream stopped");
                })?
        };

        init_rx
            .recv()
            .map_err(|_| EdgeError::Audio("Capture thread exited during startup".into()))??;

        Ok(Self {
            transfer,
            callback,
            running,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }
}

impl SegmentSource for CpalSegmentSource {
    fn register_callback(&mut self, callback: SegmentCallback) {
        *lock(&self.callback) = Some(callback);
    }

    fn start_segment(&mut self, request: SegmentRequest) -> std::result::Result<(), SegmentSourceError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SegmentSourceError::NotRunning(
                "input stream is not running".into(),
            ));
        }
        if request.len == 0 {
            return Err(SegmentSourceError::InvalidRequest(format!(
                "segment #{} has no samples",
                request.index
            )));
        }

        let mut transfer = lock(&self.transfer);
        if let Some(pending) = transfer.request {
            return Err(SegmentSourceError::Busy(pending.index));
        }
        if request.index == 0 {
            transfer.collected.clear();
        }
        transfer.request = Some(request);
        Ok(())
    }

    fn abort(&mut self) {
        let mut transfer = lock(&self.transfer);
        transfer.request = None;
        transfer.collected.clear();
    }
}

impl Drop for CpalSegmentSource {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            // The last owner can be dropped from inside a completion callback.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Push freshly captured samples into the pending transfer and fire the
/// completion once it is full.
fn deliver(
    transfer: &Mutex<Transfer>,
    callback: &Mutex<Option<SegmentCallback>>,
    samples: &[i16],
) {
    let segment = {
        let mut transfer = lock(transfer);
        let Some(request) = transfer.request else {
            return;
        };
        transfer.collected.extend_from_slice(samples);
        if transfer.collected.len() < request.len {
            return;
        }
        transfer.request = None;
        let overflow = transfer.collected.split_off(request.len);
        std::mem::replace(&mut transfer.collected, overflow)
    };

    // Never hold the transfer lock here: the completion chains the next
    // request straight back into `start_segment`.
    let callback = lock(callback).clone();
    if let Some(callback) = callback {
        callback(SegmentEvent::Complete { samples: &segment });
    }
}

fn find_input_config(
    device: &Device,
    config: &CpalSourceConfig,
) -> Result<(StreamConfig, SampleFormat, usize)> {
    let supported = device
        .supported_input_configs()
        .map_err(|e| EdgeError::Audio(format!("Failed to query input configs: {}", e)))?;

    let mut best: Option<(i32, StreamConfig, SampleFormat, usize)> = None;
    let mut seen = Vec::new();

    for candidate in supported {
        let min_rate = candidate.min_sample_rate().0;
        let max_rate = candidate.max_sample_rate().0;
        let format = candidate.sample_format();
        seen.push(format!(
            "  Format: {:?}, Channels: {}, Sample Rate: {}-{} Hz",
            format,
            candidate.channels(),
            min_rate,
            max_rate
        ));

        if candidate.channels() <= config.channel {
            continue;
        }

        // Exact rate first, then the smallest integer multiple we can decimate from.
        let Some(factor) = (1..=6u32).find(|factor| {
            let rate = config.sample_rate * factor;
            min_rate <= rate && rate <= max_rate
        }) else {
            continue;
        };

        let mut score = 1000 - (factor as i32 - 1) * 100;
        score += match format {
            SampleFormat::I16 => 50,
            SampleFormat::F32 => 25,
            _ => continue,
        };

        if best.as_ref().map_or(true, |(best_score, ..)| score > *best_score) {
            let chosen = candidate.with_sample_rate(cpal::SampleRate(config.sample_rate * factor));
            best = Some((score, chosen.config(), format, factor as usize));
        }
    }

    log::debug!("Available input configurations:");
    for line in &seen {
        log::debug!("{}", line);
    }

    let (_, stream_config, format, decimation) = best.ok_or_else(|| {
        EdgeError::Audio(format!(
            "No input configuration provides channel {} at {} Hz (or a multiple). Available:\n{}",
            config.channel,
            config.sample_rate,
            seen.join("\n")
        ))
    })?;

    log::info!(
        "🎤 Input config: {:?}, {} channels, {} Hz (decimate by {})",
        format,
        stream_config.channels,
        stream_config.sample_rate.0,
        decimation
    );
    Ok((stream_config, format, decimation))
}

fn build_stream(
    config: &CpalSourceConfig,
    transfer: Arc<Mutex<Transfer>>,
    callback: Arc<Mutex<Option<SegmentCallback>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match &config.device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| EdgeError::Audio(format!("Failed to enumerate devices: {}", e)))?
            .find(|dev| dev.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| EdgeError::Audio(format!("Device '{}' not found", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| EdgeError::Audio("No default input device available".into()))?,
    };

    let (stream_config, format, decimation) = find_input_config(&device, config)?;
    match format {
        SampleFormat::I16 => {
            build_typed::<i16>(&device, &stream_config, config.channel, decimation, transfer, callback)
        }
        SampleFormat::F32 => {
            build_typed::<f32>(&device, &stream_config, config.channel, decimation, transfer, callback)
        }
        other => Err(EdgeError::Audio(format!("Unsupported format: {:?}", other))),
    }
}

fn build_typed<T>(
    device: &Device,
    stream_config: &StreamConfig,
    channel: u16,
    decimation: usize,
    transfer: Arc<Mutex<Transfer>>,
    callback: Arc<Mutex<Option<SegmentCallback>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let channels = stream_config.channels as usize;
    let channel = channel as usize;
    let fault_callback = Arc::clone(&callback);

    // Decimation state carried across driver callbacks.
    let mut acc = 0i32;
    let mut acc_len = 0usize;
    let mut mono = Vec::new();

    device
        .build_input_stream(
            stream_config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                for frame in data.chunks(channels) {
                    let Some(&sample) = frame.get(channel) else {
                        continue;
                    };
                    acc += sample.to_sample::<i16>() as i32;
                    acc_len += 1;
                    if acc_len == decimation {
                        mono.push((acc / decimation as i32) as i16);
                        acc = 0;
                        acc_len = 0;
                    }
                }
                deliver(&transfer, &callback, &mono);
            },
            move |err| {
                log::error!("Input stream error: {}", err);
                let callback = lock(&fault_callback).clone();
                if let Some(callback) = callback {
                    callback(SegmentEvent::Fault(err.to_string()));
                }
            },
            None,
        )
        .map_err(|e| EdgeError::Audio(format!("Failed to build input stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_callback() -> (Arc<Mutex<Option<SegmentCallback>>>, Arc<Mutex<Vec<Vec<i16>>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let callback: SegmentCallback = Arc::new(move |event| {
            if let SegmentEvent::Complete { samples } = event {
                sink.lock().unwrap().push(samples.to_vec());
            }
        });
        (Arc::new(Mutex::new(Some(callback))), delivered)
    }

    #[test]
    fn test_samples_without_pending_transfer_are_dropped() {
        let transfer = Mutex::new(Transfer::default());
        let (callback, delivered) = recording_callback();

        deliver(&transfer, &callback, &[1, 2, 3]);

        assert!(delivered.lock().unwrap().is_empty());
        assert!(transfer.lock().unwrap().collected.is_empty());
    }

    #[test]
    fn test_overflow_seeds_next_segment() {
        let transfer = Mutex::new(Transfer {
            request: Some(SegmentRequest { index: 0, offset: 0, len: 4 }),
            collected: Vec::new(),
        });
        let (callback, delivered) = recording_callback();

        deliver(&transfer, &callback, &[1, 2, 3]);
        assert!(delivered.lock().unwrap().is_empty());

        deliver(&transfer, &callback, &[4, 5, 6]);
        assert_eq!(delivered.lock().unwrap().as_slice(), &[vec![1, 2, 3, 4]]);

        let transfer = transfer.lock().unwrap();
        assert!(transfer.request.is_none());
        assert_eq!(transfer.collected, vec![5, 6]);
    }

    #[test]
    #[cfg(feature = "test-audio")]
    fn test_default_device_completes_a_segment() {
        env_logger::try_init().ok();
        let mut source = CpalSegmentSource::open(CpalSourceConfig::default())
            .expect("no usable input device");
        let (tx, rx) = mpsc::channel();
        source.register_callback(Arc::new(move |event: SegmentEvent<'_>| {
            if let SegmentEvent::Complete { samples } = event {
                let _ = tx.send(samples.len());
            }
        }));

        source
            .start_segment(SegmentRequest { index: 0, offset: 0, len: 1_600 })
            .unwrap();

        let len = rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("segment did not complete");
        println!("🎤 Captured {} samples", len);
        assert_eq!(len, 1_600);
    }
}
