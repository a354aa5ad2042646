//! # Capture / Classify / Actuate Loop
//!
//! ```text
//!          capture tick                first request issued
//!  Idle ───────────────────► Armed ───────────────────────► Filling
//!   ▲                                                         │ ready flag
//!   │  classifier returned (ok or not)                        ▼
//!   └──────────────────────────────── Classifying ◄──────── Ready
//! ```
//!
//! The controller is the single cooperative main loop. Timer tasks and the
//! segment source only flip flags and wake it; every blocking step
//! (classification, driving pins, advancing the fade ramp) runs here. At most
//! one capture cycle is in flight: a capture tick arriving while a cycle is
//! running is dropped.

use crate::actuator::{ActuatorMapper, ActuatorState, Actuators, BlinkController};
use crate::capture::{AudioWindow, CaptureError, WindowAssembler};
use crate::classifier::{ClassificationResult, ClassifierAdapter};
use crate::config::CapturePolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Filling,
    Ready,
    Classifying,
}

/// Flags raised from timer and driver context, taken by the main loop.
#[derive(Debug, Default)]
pub struct InterruptFlags {
    capture_tick: AtomicBool,
    wake: Arc<Notify>,
}

impl InterruptFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle the segment source side uses to wake the main loop.
    pub fn waker(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn raise_capture_tick(&self) {
        self.capture_tick.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn take_capture_tick(&self) -> bool {
        self.capture_tick.swap(false, Ordering::AcqRel)
    }

    /// Sleep until anything raises a flag.
    pub async fn wait(&self) {
        self.wake.notified().await;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Cycles started
    pub cycles: u64,
    pub classified: u64,
    pub classify_failures: u64,
    pub capture_failures: u64,
    /// Capture ticks that arrived while a cycle was in flight
    pub ticks_dropped: u64,
}

pub struct CaptureController {
    state: CaptureState,
    policy: CapturePolicy,
    assembler: Arc<WindowAssembler>,
    /// Parked here between cycles
    window: Option<AudioWindow>,
    classifier: ClassifierAdapter,
    mapper: ActuatorMapper,
    actuators: Actuators,
    flags: Arc<InterruptFlags>,
    stats: CycleStats,
}

impl CaptureController {
    pub fn new(
        policy: CapturePolicy,
        assembler: Arc<WindowAssembler>,
        classifier: ClassifierAdapter,
        mapper: ActuatorMapper,
        actuators: Actuators,
        flags: Arc<InterruptFlags>,
    ) -> Self {
        let window = AudioWindow::new(assembler.geometry().total_samples);
        Self {
            state: CaptureState::Idle,
            policy,
            assembler,
            window: Some(window),
            classifier,
            mapper,
            actuators,
            flags,
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    pub fn actuator_state(&self) -> &ActuatorState {
        self.actuators.state()
    }

    pub fn actuators_mut(&mut self) -> &mut Actuators {
        &mut self.actuators
    }

    /// Kick off the first cycle when capturing continuously.
    pub fn start(&mut self) {
        log::info!(
            "🚀 Capture loop started ({:?} policy, {} segments of {} samples)",
            self.policy,
            self.assembler.geometry().segment_count(),
            self.assembler.geometry().segment_samples
        );
        if self.policy == CapturePolicy::Continuous && self.state == CaptureState::Idle {
            self.begin_capture();
        }
    }

    /// One pass over the pending flags. Returns whether anything happened.
    pub fn poll(&mut self) -> bool {
        let mut worked = false;

        if self.flags.take_capture_tick() {
            self.on_capture_tick();
            worked = true;
        }

        if self.state == CaptureState::Filling {
            if let Some(error) = self.assembler.take_failure() {
                self.abort_cycle(error);
                worked = true;
            } else if self.assembler.is_ready() {
                self.on_window_ready();
                worked = true;
            }
        }

        worked
    }

    /// Run until cancelled, sleeping whenever no flag is pending and no fade
    /// is in progress.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let flags = Arc::clone(&self.flags);
        let mut fade = tokio::time::interval(self.actuators.fade_config().step_interval);
        fade.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.start();
        loop {
            while self.poll() {}

            let fading = self.actuators.is_fading();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = flags.wait() => {}
                _ = fade.tick(), if fading => {
                    self.actuators.fade_tick();
                }
            }
        }

        self.shutdown();
    }

    /// Abort any cycle in flight and switch every actuator off.
    pub fn shutdown(&mut self) {
        if self.state != CaptureState::Idle {
            if let Some(window) = self.assembler.disarm() {
                self.window = Some(window);
            }
            self.state = CaptureState::Idle;
        }
        self.actuators.shutdown();
        log::info!(
            "🛑 Capture loop stopped: {} cycles, {} classified, {} classifier failures, {} capture failures, {} ticks dropped",
            self.stats.cycles,
            self.stats.classified,
            self.stats.classify_failures,
            self.stats.capture_failures,
            self.stats.ticks_dropped
        );
    }

    fn on_capture_tick(&mut self) {
        if self.state == CaptureState::Idle {
            self.begin_capture();
            return;
        }

        self.stats.ticks_dropped += 1;
        match self.policy {
            CapturePolicy::Timer => {
                log::warn!("⏭️ Capture tick dropped, cycle still {:?}", self.state)
            }
            CapturePolicy::Continuous => {
                log::debug!("Capture tick ignored, cycle still {:?}", self.state)
            }
        }
    }

    fn begin_capture(&mut self) {
        let window = self
            .window
            .take()
            .unwrap_or_else(|| AudioWindow::new(self.assembler.geometry().total_samples));

        self.stats.cycles += 1;
        self.state = CaptureState::Armed;
        match self.assembler.arm(window) {
            Ok(()) => {
                self.state = CaptureState::Filling;
                log::debug!("🎙️ Capture cycle #{} filling", self.stats.cycles);
            }
            Err(error) => self.abort_cycle(error),
        }
    }

    /// Back to idle after a capture failure. Under the continuous policy the
    /// next tick retries.
    fn abort_cycle(&mut self, error: CaptureError) {
        log::error!("❌ Capture cycle #{} aborted: {}", self.stats.cycles, error);
        self.stats.capture_failures += 1;

        let parked = self.assembler.disarm();
        if self.window.is_none() {
            self.window = parked;
        }
        self.state = CaptureState::Idle;
    }

    fn on_window_ready(&mut self) {
        let Some(window) = self.assembler.take_window() else {
            return;
        };
        self.state = CaptureState::Ready;
        log::info!(
            "✅ Window ready after {} segments",
            self.assembler.segments_completed()
        );

        self.state = CaptureState::Classifying;
        match self.classifier.classify(&window) {
            Ok(result) => {
                self.stats.classified += 1;
                print_results(&result);
                self.actuate(&result);
            }
            Err(e) => {
                self.stats.classify_failures += 1;
                log::warn!("⚠️ Classification failed, actuators unchanged: {}", e);
            }
        }

        self.window = Some(window);
        self.state = CaptureState::Idle;

        if self.policy == CapturePolicy::Continuous {
            self.begin_capture();
        }
    }

    fn actuate(&mut self, result: &ClassificationResult) {
        match self.mapper.matching_rule(result) {
            Some(rule) => log::info!(
                "🎯 Class {} ({}) reached the threshold",
                rule.class_index,
                result.predictions[rule.class_index].label
            ),
            None => {
                log::debug!("No rule matched, actuators unchanged");
                return;
            }
        }
        let next = self.mapper.apply(self.actuators.state(), result);
        self.actuators.update(next);
    }
}

fn print_results(result: &ClassificationResult) {
    println!(
        "\n[{}] Predictions",
        chrono::Local::now().format("%H:%M:%S%.3f")
    );
    println!("{}", result);
}

/// Raise the capture tick every `period`, starting one period from now.
pub fn spawn_ticker(
    flags: Arc<InterruptFlags>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => flags.raise_capture_tick(),
            }
        }
        log::debug!("Capture ticker stopped");
    })
}

/// Drive the blink controller every `period`.
pub fn spawn_blinker(
    mut blink: BlinkController,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    blink.tick();
                }
            }
        }
        log::debug!("Blink ticker stopped");
    })
}
