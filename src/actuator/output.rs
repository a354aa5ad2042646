//! Physical side of the actuators.
//!
//! Every logical channel drives two pins: the on-board LED (active-high) and
//! an external LED wired active-low, so the two always sit at opposite levels.
//! The accent channel's board output is either a plain GPIO or a PWM output
//! whose duty is ramped by a [`FadeRamp`].

use super::fade::{FadeConfig, FadeRamp};
use super::{ActuatorState, Channel};
use crate::capture::CaptureIndicator;
use crate::error::Result;
use crate::lock;
use clap::ValueEnum;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use strum::{EnumCount, IntoEnumIterator};

const PIN_COUNT: usize = 2 * Channel::COUNT + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// On-board LED, high = on
    Board(Channel),
    /// External LED, low = on
    External(Channel),
    /// Lit while a window is being captured
    CaptureIndicator,
}

impl Pin {
    fn slot(self) -> usize {
        match self {
            Pin::Board(channel) => channel.index(),
            Pin::External(channel) => Channel::COUNT + channel.index(),
            Pin::CaptureIndicator => 2 * Channel::COUNT,
        }
    }
}

/// Pin driver. Writes come from the main loop, the blink ticker and the
/// capture completion path, serialised by [`Outputs`].
pub trait OutputBackend: Send {
    fn write(&mut self, pin: Pin, high: bool) -> Result<()>;

    /// Duty cycle in percent on a PWM-capable output.
    fn set_duty(&mut self, channel: Channel, percent: u8) -> Result<()>;
}

/// How the accent channel's board output is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AccentOutput {
    /// Binary on/off
    Gpio,
    /// Dimmable, fades between off and on
    #[default]
    Pwm,
}

struct Bank {
    backend: Box<dyn OutputBackend>,
    levels: [bool; PIN_COUNT],
    duty: [u8; Channel::COUNT],
}

impl Bank {
    fn write(&mut self, pin: Pin, high: bool) {
        self.levels[pin.slot()] = high;
        if let Err(e) = self.backend.write(pin, high) {
            log::warn!("Failed to write {:?}: {}", pin, e);
        }
    }

    fn set_duty(&mut self, channel: Channel, percent: u8) {
        let percent = percent.min(100);
        self.duty[channel.index()] = percent;
        if let Err(e) = self.backend.set_duty(channel, percent) {
            log::warn!("Failed to set {} duty: {}", channel, e);
        }
    }
}

/// Shared handle to the pin driver, with the last written level of every pin.
#[derive(Clone)]
pub struct Outputs {
    bank: Arc<Mutex<Bank>>,
}

impl Outputs {
    pub fn new(backend: Box<dyn OutputBackend>) -> Self {
        Self {
            bank: Arc::new(Mutex::new(Bank {
                backend,
                levels: [false; PIN_COUNT],
                duty: [0; Channel::COUNT],
            })),
        }
    }

    pub fn write(&self, pin: Pin, high: bool) {
        lock(&self.bank).write(pin, high);
    }

    /// Drive both pins of `channel` for the logical level `on`.
    pub fn write_channel(&self, channel: Channel, on: bool) {
        let mut bank = lock(&self.bank);
        bank.write(Pin::Board(channel), on);
        bank.write(Pin::External(channel), !on);
    }

    /// Invert the logical level of `channel`, returning the new board level.
    ///
    /// The external pin is derived from the board pin under the same lock, so
    /// the pair is complementary afterwards whatever was written in between.
    pub fn toggle_channel(&self, channel: Channel) -> bool {
        let mut bank = lock(&self.bank);
        let on = !bank.levels[Pin::Board(channel).slot()];
        bank.write(Pin::Board(channel), on);
        bank.write(Pin::External(channel), !on);
        on
    }

    pub fn set_duty(&self, channel: Channel, percent: u8) {
        lock(&self.bank).set_duty(channel, percent);
    }

    /// Drive a dimmable channel lit at `percent` or dark, keeping its
    /// active-low external pin in step.
    pub fn set_dimmed(&self, channel: Channel, lit: bool, percent: u8) {
        let mut bank = lock(&self.bank);
        bank.set_duty(channel, if lit { percent } else { 0 });
        bank.write(Pin::External(channel), !lit);
    }

    pub fn level(&self, pin: Pin) -> bool {
        lock(&self.bank).levels[pin.slot()]
    }

    pub fn duty(&self, channel: Channel) -> u8 {
        lock(&self.bank).duty[channel.index()]
    }
}

impl CaptureIndicator for Outputs {
    fn set_capturing(&self, on: bool) {
        self.write(Pin::CaptureIndicator, on);
    }
}

#[derive(Debug, Default)]
struct SimulatedPins {
    levels: [bool; PIN_COUNT],
    duty_writes: Vec<(Channel, u8)>,
}

/// In-memory pin driver. Clones share the same pins, so a test (or the
/// console) can keep one clone and inspect what the actuators wrote.
#[derive(Debug, Clone, Default)]
pub struct SimulatedOutputs {
    pins: Arc<Mutex<SimulatedPins>>,
}

impl SimulatedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: Pin) -> bool {
        lock(&self.pins).levels[pin.slot()]
    }

    /// Last duty written to `channel`.
    pub fn duty(&self, channel: Channel) -> u8 {
        self.duty_writes(channel).last().copied().unwrap_or(0)
    }

    /// Every duty written to `channel`, oldest first.
    pub fn duty_writes(&self, channel: Channel) -> Vec<u8> {
        lock(&self.pins)
            .duty_writes
            .iter()
            .filter(|(written, _)| *written == channel)
            .map(|(_, percent)| *percent)
            .collect()
    }

    pub fn clear_history(&self) {
        lock(&self.pins).duty_writes.clear();
    }
}

impl OutputBackend for SimulatedOutputs {
    fn write(&mut self, pin: Pin, high: bool) -> Result<()> {
        log::trace!("{:?} -> {}", pin, if high { "high" } else { "low" });
        lock(&self.pins).levels[pin.slot()] = high;
        Ok(())
    }

    fn set_duty(&mut self, channel: Channel, percent: u8) -> Result<()> {
        log::trace!("{} duty -> {}%", channel, percent);
        lock(&self.pins).duty_writes.push((channel, percent));
        Ok(())
    }
}

/// The parts of [`ActuatorState`] the blink ticker needs, readable without
/// touching the main loop's state.
#[derive(Debug, Default)]
pub struct SharedActuatorState {
    on: [AtomicBool; Channel::COUNT],
    blink: [AtomicBool; Channel::COUNT],
    accent_level: AtomicU8,
}

impl SharedActuatorState {
    pub fn publish(&self, state: &ActuatorState) {
        for channel in Channel::iter() {
            let channel_state = state.get(channel);
            self.on[channel.index()].store(channel_state.on, Ordering::Release);
            self.blink[channel.index()].store(channel_state.blink, Ordering::Release);
        }
    }

    pub fn is_on(&self, channel: Channel) -> bool {
        self.on[channel.index()].load(Ordering::Acquire)
    }

    pub fn is_blinking(&self, channel: Channel) -> bool {
        self.blink[channel.index()].load(Ordering::Acquire)
    }

    /// Duty the accent ramp last emitted.
    pub fn accent_level(&self) -> u8 {
        self.accent_level.load(Ordering::Acquire)
    }

    fn set_accent_level(&self, percent: u8) {
        self.accent_level.store(percent, Ordering::Release);
    }
}

/// Applies logical actuator states to the outputs. Owned by the main loop.
pub struct Actuators {
    outputs: Outputs,
    accent: AccentOutput,
    fade: FadeConfig,
    ramp: FadeRamp,
    state: ActuatorState,
    shared: Arc<SharedActuatorState>,
}

impl Actuators {
    /// Drive every channel to its off level: board pins low, external pins
    /// high, capture indicator off, accent duty 0.
    pub fn new(outputs: Outputs, accent: AccentOutput, fade: FadeConfig) -> Self {
        let actuators = Self {
            state: ActuatorState::all_off(dimmable_channels(accent)),
            outputs,
            accent,
            fade,
            ramp: FadeRamp::new(fade),
            shared: Arc::new(SharedActuatorState::default()),
        };
        actuators.drive_all_off();
        actuators
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    pub fn shared(&self) -> Arc<SharedActuatorState> {
        Arc::clone(&self.shared)
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn accent_output(&self) -> AccentOutput {
        self.accent
    }

    pub fn fade_config(&self) -> FadeConfig {
        self.fade
    }

    /// Channels with an intensity.
    pub fn dimmable(&self) -> &'static [Channel] {
        dimmable_channels(self.accent)
    }

    /// Apply a new logical state. Binary channels switch immediately; a
    /// dimmable accent starts a ramp that [`Actuators::fade_tick`] advances.
    pub fn update(&mut self, next: ActuatorState) {
        self.shared.publish(&next);

        for channel in Channel::iter() {
            let wanted = next.get(channel);
            if self.is_dimmable(channel) {
                self.fade(channel, wanted.on);
                if !wanted.blink && !self.ramp.is_active() {
                    // Blinking may have left the output dark.
                    self.outputs.set_duty(channel, self.ramp.level());
                }
                self.outputs.write(Pin::External(channel), !wanted.on);
            } else {
                self.outputs.write_channel(channel, wanted.on);
            }
        }

        if next != self.state {
            log::info!("💡 Actuators: {}", describe(&next));
        }
        self.state = next;
    }

    /// Move `channel` toward on or off. Dimmable channels ramp; binary ones
    /// switch at once.
    pub fn fade(&mut self, channel: Channel, on: bool) {
        if !self.is_dimmable(channel) {
            self.outputs.write_channel(channel, on);
            return;
        }
        if self.ramp.fade(on) {
            log::debug!(
                "Fading {} {} from {}%",
                channel,
                if on { "in" } else { "out" },
                self.ramp.level()
            );
        }
    }

    pub fn is_fading(&self) -> bool {
        self.ramp.is_active()
    }

    /// Emit the next ramp level, if any. Returns whether the ramp is still
    /// running afterwards.
    pub fn fade_tick(&mut self) -> bool {
        if let Some(level) = self.ramp.tick() {
            self.outputs.set_duty(Channel::Accent, level);
            self.shared.set_accent_level(level);
        }
        self.ramp.is_active()
    }

    /// Switch everything off without ramping.
    pub fn shutdown(&mut self) {
        self.state = ActuatorState::all_off(self.dimmable());
        self.shared.publish(&self.state);
        self.ramp.set_immediate(0);
        self.shared.set_accent_level(0);
        self.drive_all_off();
    }

    fn is_dimmable(&self, channel: Channel) -> bool {
        self.dimmable().contains(&channel)
    }

    fn drive_all_off(&self) {
        for channel in Channel::iter() {
            self.outputs.write_channel(channel, false);
        }
        if self.accent == AccentOutput::Pwm {
            self.outputs.set_duty(Channel::Accent, 0);
        }
        self.outputs.write(Pin::CaptureIndicator, false);
    }
}

fn dimmable_channels(accent: AccentOutput) -> &'static [Channel] {
    match accent {
        AccentOutput::Pwm => &[Channel::Accent],
        AccentOutput::Gpio => &[],
    }
}

fn describe(state: &ActuatorState) -> String {
    Channel::iter()
        .map(|channel| {
            let s = state.get(channel);
            let level = match (s.on, s.blink) {
                (false, _) => "off",
                (true, false) => "on",
                (true, true) => "blink",
            };
            format!("{}={}", channel, level)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ChannelCommand;

    fn actuators(accent: AccentOutput) -> (Actuators, SimulatedOutputs) {
        let sim = SimulatedOutputs::new();
        let outputs = Outputs::new(Box::new(sim.clone()));
        (Actuators::new(outputs, accent, FadeConfig::default()), sim)
    }

    fn with(state: &ActuatorState, channel: Channel, command: ChannelCommand) -> ActuatorState {
        let mut next = *state;
        next.apply_command(channel, command);
        next
    }

    #[test]
    fn test_startup_levels() {
        let (_actuators, sim) = actuators(AccentOutput::Pwm);
        for channel in Channel::iter() {
            assert!(!sim.level(Pin::Board(channel)));
            assert!(sim.level(Pin::External(channel)));
        }
        assert!(!sim.level(Pin::CaptureIndicator));
        assert_eq!(sim.duty(Channel::Accent), 0);
    }

    #[test]
    fn test_binary_channel_drives_polarity_pair() {
        let (mut actuators, sim) = actuators(AccentOutput::Pwm);
        let next = with(actuators.state(), Channel::Red, ChannelCommand::On);

        actuators.update(next);

        assert!(sim.level(Pin::Board(Channel::Red)));
        assert!(!sim.level(Pin::External(Channel::Red)));
        assert!(!sim.level(Pin::Board(Channel::Green)));
        assert!(sim.level(Pin::External(Channel::Green)));
    }

    #[test]
    fn test_pwm_accent_ramps_on_ticks() {
        let (mut actuators, sim) = actuators(AccentOutput::Pwm);
        sim.clear_history();
        let next = with(actuators.state(), Channel::Accent, ChannelCommand::On);

        actuators.update(next);
        assert!(actuators.is_fading());
        assert!(sim.duty_writes(Channel::Accent).is_empty());

        while actuators.fade_tick() {}

        let writes = sim.duty_writes(Channel::Accent);
        assert_eq!(writes.len(), 101);
        assert_eq!(sim.duty(Channel::Accent), 100);
        assert_eq!(actuators.shared().accent_level(), 100);
        assert!(!sim.level(Pin::External(Channel::Accent)));
    }

    #[test]
    fn test_gpio_accent_switches_immediately() {
        let (mut actuators, sim) = actuators(AccentOutput::Gpio);
        let next = with(actuators.state(), Channel::Accent, ChannelCommand::On);

        actuators.update(next);

        assert!(!actuators.is_fading());
        assert!(sim.level(Pin::Board(Channel::Accent)));
        assert!(actuators.dimmable().is_empty());
    }

    #[test]
    fn test_shutdown_drives_everything_off() {
        let (mut actuators, sim) = actuators(AccentOutput::Pwm);
        let mut next = with(actuators.state(), Channel::Blue, ChannelCommand::Blink);
        next.apply_command(Channel::Accent, ChannelCommand::On);
        actuators.update(next);
        actuators.fade_tick();
        actuators.fade_tick();
        actuators.outputs().set_capturing(true);

        actuators.shutdown();

        assert!(!sim.level(Pin::Board(Channel::Blue)));
        assert!(!sim.level(Pin::CaptureIndicator));
        assert_eq!(sim.duty(Channel::Accent), 0);
        assert!(!actuators.is_fading());
        assert!(!actuators.shared().is_blinking(Channel::Blue));
    }

    #[test]
    fn test_toggle_channel_restores_polarity_pair() {
        let sim = SimulatedOutputs::new();
        let outputs = Outputs::new(Box::new(sim.clone()));

        assert!(outputs.toggle_channel(Channel::Green));
        assert!(!sim.level(Pin::External(Channel::Green)));

        // Both pins high, as left by a write landing mid-blink.
        outputs.write(Pin::External(Channel::Green), true);
        assert!(!outputs.toggle_channel(Channel::Green));
        assert!(!sim.level(Pin::Board(Channel::Green)));
        assert!(sim.level(Pin::External(Channel::Green)));
    }

    #[test]
    fn test_set_dimmed_drives_external_pin() {
        let sim = SimulatedOutputs::new();
        let outputs = Outputs::new(Box::new(sim.clone()));

        outputs.set_dimmed(Channel::Accent, true, 60);
        assert_eq!(sim.duty(Channel::Accent), 60);
        assert!(!sim.level(Pin::External(Channel::Accent)));

        outputs.set_dimmed(Channel::Accent, false, 60);
        assert_eq!(sim.duty(Channel::Accent), 0);
        assert!(sim.level(Pin::External(Channel::Accent)));
    }
}
