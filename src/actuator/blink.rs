use super::output::{AccentOutput, Outputs, SharedActuatorState};
use super::Channel;
use std::sync::Arc;
use strum::{EnumCount, IntoEnumIterator};

/// Toggles every blinking channel on each blink tick.
///
/// Runs on its own ticker and only reads the published actuator flags. A
/// binary channel has both of its pins inverted together; the PWM accent
/// alternates between dark and the level its ramp last emitted, with its
/// external pin following.
pub struct BlinkController {
    outputs: Outputs,
    shared: Arc<SharedActuatorState>,
    accent: AccentOutput,
    dark: [bool; Channel::COUNT],
}

impl BlinkController {
    pub fn new(outputs: Outputs, shared: Arc<SharedActuatorState>, accent: AccentOutput) -> Self {
        Self {
            outputs,
            shared,
            accent,
            dark: [false; Channel::COUNT],
        }
    }

    /// Returns the number of channels toggled.
    pub fn tick(&mut self) -> usize {
        let mut toggled = 0;
        for channel in Channel::iter() {
            if !self.shared.is_blinking(channel) {
                self.dark[channel.index()] = false;
                continue;
            }

            if channel == Channel::Accent && self.accent == AccentOutput::Pwm {
                let dark = &mut self.dark[channel.index()];
                *dark = !*dark;
                self.outputs
                    .set_dimmed(channel, !*dark, self.shared.accent_level());
            } else {
                self.outputs.toggle_channel(channel);
            }
            toggled += 1;
        }
        toggled
    }
}
