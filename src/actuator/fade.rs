//! Tick-driven intensity ramp for the dimmable accent channel.
//!
//! A ramp never blocks: [`FadeRamp::fade`] only sets the target and every
//! call to [`FadeRamp::tick`] emits at most one duty level. The first tick of
//! a ramp emits the level it starts from, so a full 0 → 100 ramp at 1 % steps
//! emits 101 levels.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeConfig {
    /// Duty change per tick, 1-100
    pub step_percent: u8,
    /// Time between ticks
    pub step_interval: Duration,
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            step_percent: 1,
            step_interval: Duration::from_millis(5),
        }
    }
}

impl FadeConfig {
    /// Levels emitted by one full ramp, both end points included.
    pub fn steps_per_ramp(&self) -> usize {
        100usize.div_ceil(self.step_percent.max(1) as usize) + 1
    }

    /// Wall time of one full ramp.
    pub fn ramp_duration(&self) -> Duration {
        self.step_interval * (self.steps_per_ramp() as u32 - 1)
    }
}

/// Current duty, target duty and step size of one dimmable output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FadeRamp {
    step: u8,
    level: u8,
    target: u8,
    emit_start: bool,
}

impl FadeRamp {
    pub fn new(config: FadeConfig) -> Self {
        Self {
            step: config.step_percent.clamp(1, 100),
            level: 0,
            target: 0,
            emit_start: false,
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    pub fn is_active(&self) -> bool {
        self.emit_start || self.level != self.target
    }

    /// Ramp toward fully on or fully off. Returns `false` if the ramp was
    /// already heading there.
    ///
    /// Reversing direction mid-ramp continues from the current level.
    pub fn fade(&mut self, on: bool) -> bool {
        let target = if on { 100 } else { 0 };
        if target == self.target {
            return false;
        }
        if !self.is_active() {
            self.emit_start = true;
        }
        self.target = target;
        true
    }

    /// Next duty level to write, or `None` when idle.
    pub fn tick(&mut self) -> Option<u8> {
        if self.emit_start {
            self.emit_start = false;
            return Some(self.level);
        }
        if self.level == self.target {
            return None;
        }

        self.level = if self.level < self.target {
            self.level.saturating_add(self.step).min(self.target)
        } else {
            self.level.saturating_sub(self.step).max(self.target)
        };
        Some(self.level)
    }

    /// Jump to `level` without ramping.
    pub fn set_immediate(&mut self, level: u8) {
        let level = level.min(100);
        self.level = level;
        self.target = level;
        self.emit_start = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ramp: &mut FadeRamp) -> Vec<u8> {
        std::iter::from_fn(|| ramp.tick()).collect()
    }

    #[test]
    fn test_full_ramp_up_and_down() {
        let config = FadeConfig::default();
        let mut ramp = FadeRamp::new(config);

        assert!(ramp.fade(true));
        let up = drain(&mut ramp);
        assert_eq!(up.len(), config.steps_per_ramp());
        assert_eq!(up.len(), 101);
        assert_eq!(up.first(), Some(&0));
        assert_eq!(up.last(), Some(&100));
        assert!(up.windows(2).all(|w| w[0] < w[1]));

        assert!(ramp.fade(false));
        let down = drain(&mut ramp);
        assert_eq!(down.len(), 101);
        assert_eq!(down.first(), Some(&100));
        assert!(down.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(ramp.level(), 0);
        assert!(!ramp.is_active());
    }

    #[test]
    fn test_coarse_step_is_clamped() {
        let config = FadeConfig {
            step_percent: 30,
            step_interval: Duration::from_millis(5),
        };
        let mut ramp = FadeRamp::new(config);
        ramp.fade(true);

        assert_eq!(drain(&mut ramp), vec![0, 30, 60, 90, 100]);
        assert_eq!(config.steps_per_ramp(), 5);
        assert_eq!(config.ramp_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_fade_to_current_target_is_noop() {
        let mut ramp = FadeRamp::new(FadeConfig::default());
        assert!(!ramp.fade(false));
        assert_eq!(ramp.tick(), None);

        ramp.set_immediate(100);
        assert!(!ramp.fade(true));
        assert_eq!(ramp.tick(), None);
    }

    #[test]
    fn test_reversal_continues_from_current_level() {
        let mut ramp = FadeRamp::new(FadeConfig::default());
        ramp.fade(true);
        for _ in 0..41 {
            ramp.tick();
        }
        assert_eq!(ramp.level(), 40);

        assert!(ramp.fade(false));
        assert_eq!(ramp.tick(), Some(39));
        assert_eq!(drain(&mut ramp).len(), 39);
        assert_eq!(ramp.level(), 0);
    }

    #[test]
    fn test_default_ramp_takes_half_a_second() {
        assert_eq!(FadeConfig::default().ramp_duration(), Duration::from_millis(500));
    }
}
