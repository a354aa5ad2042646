//! # Actuator Mapping
//!
//! Classification scores are mapped onto four logical indicator channels by a
//! declarative rule table. The table is scanned in order and the first rule
//! whose class score reaches the threshold wins; rules are exclusive, never
//! additive. A rule only touches the channels it names, and a cycle where no
//! rule matches leaves the state exactly as it was.
//!
//! ```text
//! scores ─► ActuatorMapper::apply ─► ActuatorState ─► Actuators (pins, fade) ─► BlinkController
//! ```

use crate::classifier::ClassificationResult;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter};

pub mod blink;
pub mod fade;
pub mod output;

pub use blink::BlinkController;
pub use fade::{FadeConfig, FadeRamp};
pub use output::{AccentOutput, Actuators, OutputBackend, Outputs, Pin, SharedActuatorState, SimulatedOutputs};

/// Logical indicator channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Red,
    Green,
    Blue,
    /// Dimmable when driven from a PWM output
    Accent,
}

impl Channel {
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelState {
    pub on: bool,
    /// Target duty (0-100) for dimmable channels, `None` for binary ones
    pub intensity: Option<u8>,
    pub blink: bool,
}

/// Logical state of every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    channels: [ChannelState; Channel::COUNT],
}

impl ActuatorState {
    /// Everything off. `dimmable` channels carry an intensity of 0.
    pub fn all_off(dimmable: &[Channel]) -> Self {
        let mut channels = [ChannelState::default(); Channel::COUNT];
        for channel in dimmable {
            channels[channel.index()].intensity = Some(0);
        }
        Self { channels }
    }

    pub fn get(&self, channel: Channel) -> ChannelState {
        self.channels[channel.index()]
    }

    pub fn is_on(&self, channel: Channel) -> bool {
        self.get(channel).on
    }

    pub fn apply_command(&mut self, channel: Channel, command: ChannelCommand) {
        let state = &mut self.channels[channel.index()];
        state.on = command != ChannelCommand::Off;
        state.blink = command == ChannelCommand::Blink;
        if state.intensity.is_some() {
            state.intensity = Some(if state.on { 100 } else { 0 });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelCommand {
    Off,
    On,
    /// On and toggled by the blink ticker
    Blink,
}

/// `class_index` scoring at or above the threshold drives the named channels.
/// Channels left as `None` keep their previous state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub class_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub red: Option<ChannelCommand>,
    #[serde(default)]
    pub green: Option<ChannelCommand>,
    #[serde(default)]
    pub blue: Option<ChannelCommand>,
    #[serde(default)]
    pub accent: Option<ChannelCommand>,
}

impl Rule {
    /// Rule that turns `lit` on and every other channel off.
    pub fn exclusive(class_index: usize, label: &str, lit: &[Channel]) -> Self {
        let command = |channel: Channel| {
            Some(if lit.contains(&channel) {
                ChannelCommand::On
            } else {
                ChannelCommand::Off
            })
        };
        Self {
            class_index,
            label: Some(label.to_string()),
            red: command(Channel::Red),
            green: command(Channel::Green),
            blue: command(Channel::Blue),
            accent: command(Channel::Accent),
        }
    }

    pub fn command(&self, channel: Channel) -> Option<ChannelCommand> {
        match channel {
            Channel::Red => self.red,
            Channel::Green => self.green,
            Channel::Blue => self.blue,
            Channel::Accent => self.accent,
        }
    }
}

fn default_threshold() -> f32 {
    0.5
}

/// Ordered rule list plus the decision threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    pub rules: Vec<Rule>,
}

impl RuleTable {
    pub fn preset(preset: MappingPreset) -> Self {
        let rules = match preset {
            MappingPreset::Lights => vec![
                Rule::exclusive(3, "light", &[Channel::Accent]),
                Rule::exclusive(5, "off", &[]),
                Rule::exclusive(6, "red", &[Channel::Red]),
                Rule::exclusive(1, "blue", &[Channel::Blue]),
                Rule::exclusive(2, "green", &[Channel::Green]),
            ],
            MappingPreset::Accent => vec![
                Rule::exclusive(2, "accent", &[Channel::Accent]),
                Rule::exclusive(0, "off", &[]),
            ],
        };
        Self {
            threshold: default_threshold(),
            rules,
        }
    }

    /// Highest class index any rule refers to.
    pub fn max_class_index(&self) -> Option<usize> {
        self.rules.iter().map(|rule| rule.class_index).max()
    }
}

/// Built-in rule tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MappingPreset {
    /// light → accent, off → all off, red/blue/green → that colour only
    #[default]
    Lights,
    /// class 2 → accent only, class 0 → all off
    Accent,
}

/// Turns classification results into actuator states.
#[derive(Debug, Clone)]
pub struct ActuatorMapper {
    table: RuleTable,
}

impl ActuatorMapper {
    pub fn new(table: RuleTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    /// First rule in table order whose score reaches the threshold.
    ///
    /// # Panics
    ///
    /// If a rule refers to a class the result has no score for. Tables are
    /// validated against the classifier's labels at startup.
    pub fn matching_rule(&self, result: &ClassificationResult) -> Option<&Rule> {
        self.table.rules.iter().find(|rule| {
            let score = result.score(rule.class_index).unwrap_or_else(|| {
                panic!(
                    "rule for class {} but the classifier produced {} scores",
                    rule.class_index,
                    result.predictions.len()
                )
            });
            score >= self.table.threshold
        })
    }

    /// Next state given the previous one. Deterministic, no side effects.
    pub fn apply(&self, previous: &ActuatorState, result: &ClassificationResult) -> ActuatorState {
        let mut next = *previous;
        if let Some(rule) = self.matching_rule(result) {
            for channel in <Channel as strum::IntoEnumIterator>::iter() {
                if let Some(command) = rule.command(channel) {
                    next.apply_command(channel, command);
                }
            }
        }
        next
    }
}
