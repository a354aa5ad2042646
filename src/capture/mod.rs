//! # Capture Window Assembly
//!
//! A classifier window is filled by chaining fixed-size asynchronous segment
//! transfers into consecutive regions of one buffer:
//!
//! ```text
//! arm(window) ─► request #0 @ 0 ─► complete ─► request #1 @ S ─► ... ─► complete #N-1 ─► READY
//! ```
//!
//! Completions arrive on the audio driver's thread (the "interrupt" side). They
//! only copy samples, bump the segment counter and either chain the next request
//! or raise the ready flag. Everything that blocks (classification, actuator
//! ramps) happens in the main control loop, which observes the flags and is
//! woken through a shared [`Notify`].
//!
//! ## Ownership
//!
//! The [`AudioWindow`] is moved into the assembler by [`WindowAssembler::arm`]
//! and moved back out by [`WindowAssembler::take_window`] once it is ready (or by
//! [`WindowAssembler::disarm`] when a cycle is aborted). While the main loop owns
//! the window no transfer can be scheduled into it.
//!
//! ## Segment count invariant
//!
//! The counter only ever increments by one per accepted completion, and
//! completions are rejected once the counter reaches `N`. Readiness is therefore
//! raised on exactly the `N`-th completion; a surplus notification (a driver
//! delivering more completions than requested) is logged and dropped instead of
//! touching the buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::Notify;

use crate::lock;

pub mod imp_cpal;
pub mod imp_wav;

pub use imp_cpal::{CpalSegmentSource, CpalSourceConfig};
pub use imp_wav::{WavSegmentSource, WavSourceConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentSourceError {
    #[error("Segment source is not running: {0}")]
    NotRunning(String),
    #[error("A transfer is already pending, cannot start segment {0}")]
    Busy(usize),
    #[error("Invalid segment request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Segment request #{index} at offset {offset} failed to start: {source}")]
    SegmentRequestFailed {
        index: usize,
        offset: usize,
        source: SegmentSourceError,
    },
    #[error("Segment source fault: {0}")]
    SourceFault(String),
    #[error("Capture window is already armed")]
    AlreadyArmed,
    #[error("Window holds {actual} samples, capture geometry needs {expected}")]
    WindowLength { expected: usize, actual: usize },
}

/// Layout of one capture window: `total_samples` split into segments of
/// `segment_samples`. The final segment is truncated when the two don't divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub total_samples: usize,
    pub segment_samples: usize,
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self::new(16_000, 1_000)
    }
}

impl WindowGeometry {
    pub const fn new(total_samples: usize, segment_samples: usize) -> Self {
        Self {
            total_samples,
            segment_samples,
        }
    }

    /// Number of segments needed to fill the window.
    pub fn segment_count(&self) -> usize {
        if self.segment_samples == 0 {
            return 0;
        }
        self.total_samples.div_ceil(self.segment_samples)
    }

    pub fn segment_offset(&self, index: usize) -> usize {
        index * self.segment_samples
    }

    pub fn segment_len(&self, index: usize) -> usize {
        self.total_samples
            .saturating_sub(self.segment_offset(index))
            .min(self.segment_samples)
    }

    pub fn request(&self, index: usize) -> SegmentRequest {
        SegmentRequest {
            index,
            offset: self.segment_offset(index),
            len: self.segment_len(index),
        }
    }
}

/// Fixed-length buffer of signed 16-bit samples handed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioWindow {
    samples: Box<[i16]>,
}

impl AudioWindow {
    /// A silent window of `len` samples.
    pub fn new(len: usize) -> Self {
        Self {
            samples: vec![0; len].into_boxed_slice(),
        }
    }

    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    fn region_mut(&mut self, request: &SegmentRequest) -> &mut [i16] {
        let end = (request.offset + request.len).min(self.samples.len());
        let start = request.offset.min(end);
        &mut self.samples[start..end]
    }
}

/// Destination of one asynchronous transfer inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRequest {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

/// Notification delivered by a segment source on its own thread.
#[derive(Debug)]
pub enum SegmentEvent<'a> {
    /// The pending transfer finished with these samples.
    Complete { samples: &'a [i16] },
    /// The underlying stream failed; no completion will follow.
    Fault(String),
}

pub type SegmentCallback = Arc<dyn Fn(SegmentEvent<'_>) + Send + Sync>;

/// Peripheral that can fill one segment asynchronously and report back
/// through a registered callback.
///
/// Implementations must never invoke the callback from inside
/// `start_segment`; completions always arrive from the source's own context.
pub trait SegmentSource: Send {
    fn register_callback(&mut self, callback: SegmentCallback);

    fn start_segment(&mut self, request: SegmentRequest) -> Result<(), SegmentSourceError>;

    /// Drop any pending transfer. Called when a cycle is aborted.
    fn abort(&mut self) {}
}

/// Observability hook toggled on while a window is being filled.
pub trait CaptureIndicator: Send + Sync {
    fn set_capturing(&self, on: bool);
}

/// Indicator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicator;

impl CaptureIndicator for NoIndicator {
    fn set_capturing(&self, _on: bool) {}
}

/// Chains segment transfers into one [`AudioWindow`] and raises a ready flag
/// when the last segment lands.
pub struct WindowAssembler {
    geometry: WindowGeometry,
    source: Mutex<Box<dyn SegmentSource>>,
    window: Mutex<Option<AudioWindow>>,
    segments: AtomicUsize,
    ready: AtomicBool,
    failed: AtomicBool,
    failure: Mutex<Option<CaptureError>>,
    indicator: Arc<dyn CaptureIndicator>,
    wake: Arc<Notify>,
}

impl WindowAssembler {
    pub fn new(
        geometry: WindowGeometry,
        mut source: Box<dyn SegmentSource>,
        indicator: Arc<dyn CaptureIndicator>,
        wake: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            source.register_callback(Arc::new(move |event: SegmentEvent<'_>| {
                if let Some(assembler) = weak.upgrade() {
                    assembler.on_segment_event(event);
                }
            }));

            Self {
                geometry,
                source: Mutex::new(source),
                window: Mutex::new(None),
                segments: AtomicUsize::new(0),
                ready: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                failure: Mutex::new(None),
                indicator,
                wake,
            }
        })
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    /// Take ownership of `window`, reset the counter and start segment #0.
    ///
    /// On error the window stays parked in the assembler; get it back with
    /// [`WindowAssembler::disarm`].
    pub fn arm(&self, window: AudioWindow) -> Result<(), CaptureError> {
        let mut slot = lock(&self.window);
        if slot.is_some() {
            return Err(CaptureError::AlreadyArmed);
        }

        let actual = window.len();
        *slot = Some(window);
        self.segments.store(0, Ordering::Release);
        self.ready.store(false, Ordering::Release);
        self.failed.store(false, Ordering::Release);
        lock(&self.failure).take();

        if actual != self.geometry.total_samples {
            return Err(CaptureError::WindowLength {
                expected: self.geometry.total_samples,
                actual,
            });
        }

        self.indicator.set_capturing(true);
        let request = self.geometry.request(0);
        if let Err(source) = lock(&self.source).start_segment(request) {
            self.indicator.set_capturing(false);
            return Err(CaptureError::SegmentRequestFailed {
                index: request.index,
                offset: request.offset,
                source,
            });
        }

        log::debug!(
            "Armed capture window: {} segments of {} samples",
            self.geometry.segment_count(),
            self.geometry.segment_samples
        );
        Ok(())
    }

    /// Number of segments completed in the current fill cycle.
    pub fn segments_completed(&self) -> usize {
        self.segments.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.window).is_some()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Collect an escalated failure, if any.
    pub fn take_failure(&self) -> Option<CaptureError> {
        if !self.failed.swap(false, Ordering::AcqRel) {
            return None;
        }
        lock(&self.failure).take()
    }

    /// Hand the completed window to the caller and clear the ready flag.
    pub fn take_window(&self) -> Option<AudioWindow> {
        let mut slot = lock(&self.window);
        if !self.ready.swap(false, Ordering::AcqRel) {
            return None;
        }
        slot.take()
    }

    /// Abort the current cycle and return whatever window was parked.
    pub fn disarm(&self) -> Option<AudioWindow> {
        lock(&self.source).abort();
        let window = lock(&self.window).take();
        self.ready.store(false, Ordering::Release);
        self.indicator.set_capturing(false);
        window
    }

    fn on_segment_event(&self, event: SegmentEvent<'_>) {
        match event {
            SegmentEvent::Complete { samples } => self.on_segment_complete(samples),
            SegmentEvent::Fault(reason) => {
                if self.is_armed() && !self.is_ready() {
                    self.escalate(CaptureError::SourceFault(reason));
                } else {
                    log::debug!("Ignoring source fault outside a fill cycle: {}", reason);
                }
            }
        }
    }

    fn on_segment_complete(&self, samples: &[i16]) {
        let mut slot = lock(&self.window);
        let Some(window) = slot.as_mut() else {
            log::debug!("Dropping segment completion: no window armed");
            return;
        };
        if self.ready.load(Ordering::Acquire) || self.failed.load(Ordering::Acquire) {
            log::warn!("Dropping segment completion after the cycle ended");
            return;
        }

        let count = self.geometry.segment_count();
        let index = self.segments.load(Ordering::Acquire);
        if index >= count {
            log::warn!("Dropping surplus segment completion #{}", index);
            return;
        }

        let request = self.geometry.request(index);
        let region = window.region_mut(&request);
        let copied = samples.len().min(region.len());
        region[..copied].copy_from_slice(&samples[..copied]);
        if copied < region.len() {
            log::warn!(
                "Segment #{} delivered {} of {} samples, padding with silence",
                index,
                copied,
                region.len()
            );
            region[copied..].fill(0);
        }

        let completed = self.segments.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("Segment {}/{} complete", completed, count);

        if completed == count {
            self.ready.store(true, Ordering::Release);
            drop(slot);
            self.indicator.set_capturing(false);
            log::debug!("Capture window complete ({} segments)", count);
            self.wake.notify_one();
            return;
        }

        let next = self.geometry.request(completed);
        let started = lock(&self.source).start_segment(next);
        drop(slot);

        if let Err(source) = started {
            self.escalate(CaptureError::SegmentRequestFailed {
                index: next.index,
                offset: next.offset,
                source,
            });
        }
    }

    fn escalate(&self, error: CaptureError) {
        log::error!("Capture cycle failed: {}", error);
        lock(&self.failure).get_or_insert(error);
        self.failed.store(true, Ordering::Release);
        self.indicator.set_capturing(false);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_geometry() {
        let geometry = WindowGeometry::new(16_000, 1_000);
        assert_eq!(geometry.segment_count(), 16);
        assert_eq!(geometry.segment_offset(15), 15_000);
        assert_eq!(geometry.segment_len(15), 1_000);
    }

    #[test]
    fn test_truncated_final_segment() {
        let geometry = WindowGeometry::new(16_000, 1_024);
        assert_eq!(geometry.segment_count(), 16);
        assert_eq!(geometry.segment_len(14), 1_024);
        assert_eq!(geometry.segment_len(15), 16_000 - 15 * 1_024);
        assert_eq!(geometry.segment_len(16), 0);
    }

    #[test]
    fn test_zero_segment_size_has_no_segments() {
        assert_eq!(WindowGeometry::new(100, 0).segment_count(), 0);
    }

    #[test]
    fn test_window_region_is_clamped() {
        let mut window = AudioWindow::new(10);
        let region = window.region_mut(&SegmentRequest {
            index: 2,
            offset: 8,
            len: 4,
        });
        assert_eq!(region.len(), 2);
    }
}
