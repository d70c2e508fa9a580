//! Temperature threshold engine
//!
//! # How It Works
//!
//! 1. **Samples**: every reading shifts `current` into `previous`. The sample counter
//!    saturates at two, which is all the edge detector needs.
//!
//! 2. **First sample**: with only one reading there is no edge to look at, so the
//!    highest configured `hi` at or below the reading counts as an "above" crossing.
//!    `lo` thresholds are never considered on the first sample.
//!
//! 3. **Edges**: from the second sample on, "above" needs a rising edge through `hi`
//!    (`previous < hi <= current`, highest qualifying `hi` wins) and "below" needs a
//!    falling edge through `lo` (`current < lo <= previous`, lowest qualifying `lo`
//!    wins). A reading equal to the previous one is never checked.
//!
//! 4. **Last crossed**: a crossing that differs from the recorded one in temperature
//!    or direction replaces it and is reported once.

use cm_protocol::{FaultType, ThresholdView};
use tracing::{debug, error, info};

use super::{status_changed, ParentState};
use crate::constants::thermal;
use crate::data::{now_millis, TempSensor};
use crate::hw::Hal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Threshold {
    pub hi: i32,
    pub lo: i32,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastCrossed {
    pub temperature: i32,
    /// +1 rising through a `hi`, -1 falling through a `lo`
    pub direction: i8,
}

impl LastCrossed {
    pub fn sentinel() -> Self {
        Self { temperature: thermal::LAST_CROSSED_SENTINEL, direction: 1 }
    }
}

/// Hysteretic multi-threshold crossing detector for one sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdTracker {
    previous: Option<i32>,
    current: Option<i32>,
    samples: u8,
    thresholds: Vec<Threshold>,
    enabled: bool,
    last_crossed: LastCrossed,
}

impl ThresholdTracker {
    /// Tracker with `slots` unconfigured thresholds, enabled
    pub fn new(slots: usize) -> Self {
        Self {
            previous: None,
            current: None,
            samples: 0,
            thresholds: vec![Threshold::default(); slots],
            enabled: true,
            last_crossed: LastCrossed::sentinel(),
        }
    }

    pub fn current(&self) -> Option<i32> {
        self.current
    }

    pub fn previous(&self) -> Option<i32> {
        self.previous
    }

    pub fn samples(&self) -> u8 {
        self.samples
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_crossed(&self) -> LastCrossed {
        self.last_crossed
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn views(&self) -> Vec<ThresholdView> {
        self.thresholds
            .iter()
            .enumerate()
            .map(|(index, t)| ThresholdView { index, hi: t.hi, lo: t.lo, valid: t.valid })
            .collect()
    }

    pub fn record_sample(&mut self, celsius: i32) {
        self.previous = self.current;
        self.current = Some(celsius);
        self.samples = (self.samples + 1).min(thermal::MAX_SAMPLES);
    }

    /// Configure one threshold slot. Returns false when `index` is out of range.
    pub fn set_threshold(&mut self, index: usize, hi: i32, lo: i32) -> bool {
        match self.thresholds.get_mut(index) {
            Some(slot) => {
                *slot = Threshold { hi, lo, valid: true };
                true
            }
            None => false,
        }
    }

    /// Enable or disable crossing detection. Returns true when a notification is due.
    ///
    /// Enabling resets the last crossing to the sentinel and forces a notification
    /// after one immediate check.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if !enabled {
            let changed = self.enabled;
            self.enabled = false;
            return changed;
        }
        self.enabled = true;
        self.last_crossed = LastCrossed::sentinel();
        self.check();
        true
    }

    /// Look for a new crossing. Returns true when the last crossing changed.
    pub fn check(&mut self) -> bool {
        if !self.enabled || self.samples == 0 || !self.thresholds.iter().any(|t| t.valid) {
            return false;
        }
        let Some(current) = self.current else {
            return false;
        };

        let crossing = if self.samples == 1 {
            self.thresholds
                .iter()
                .filter(|t| t.valid && t.hi <= current)
                .map(|t| t.hi)
                .max()
                .map(|hi| LastCrossed { temperature: hi, direction: 1 })
        } else {
            let Some(previous) = self.previous else {
                return false;
            };
            if current == previous {
                return false;
            }
            let above = self
                .thresholds
                .iter()
                .filter(|t| t.valid && current >= t.hi && previous < t.hi)
                .map(|t| t.hi)
                .max();
            let below = self
                .thresholds
                .iter()
                .filter(|t| t.valid && current < t.lo && previous >= t.lo)
                .map(|t| t.lo)
                .min();
            above
                .map(|hi| LastCrossed { temperature: hi, direction: 1 })
                .or_else(|| below.map(|lo| LastCrossed { temperature: lo, direction: -1 }))
        };

        match crossing {
            Some(crossed) if crossed != self.last_crossed => {
                self.last_crossed = crossed;
                true
            }
            _ => false,
        }
    }
}

/// Poll one sensor. Returns true when the sensor should be notified.
pub fn poll_temp_sensor(hal: &mut dyn Hal, sensor: &mut TempSensor, parent: &ParentState) -> bool {
    let prior = sensor.fault;
    sensor.fault.reset();

    if parent.unpowered_psu {
        sensor.fault.update(parent.unpowered_fault());
        return status_changed(&prior, &sensor.fault);
    }

    let celsius = match hal.temperature(sensor.handle) {
        Ok(celsius) => celsius,
        Err(e) => {
            debug!(sensor = %sensor.name, error = %e, "Temperature read failed");
            sensor.fault.update(FaultType::CommError);
            return status_changed(&prior, &sensor.fault);
        }
    };
    sensor.tracker.record_sample(celsius);
    sensor.last_poll_ms = now_millis();

    let over = sensor.shutdown_threshold.map(|limit| celsius >= limit).unwrap_or(false);
    let over_changed = over != sensor.over_shutdown;
    if over && over_changed {
        error!(sensor = %sensor.name, celsius, "Temperature at or above shutdown threshold");
    }
    sensor.over_shutdown = over;

    let crossed = sensor.tracker.check();
    if crossed {
        let last = sensor.tracker.last_crossed();
        info!(
            sensor = %sensor.name,
            celsius,
            threshold = last.temperature,
            direction = last.direction,
            "Temperature threshold crossed"
        );
    }

    crossed || over_changed || status_changed(&prior, &sensor.fault)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(pairs: &[(i32, i32)]) -> ThresholdTracker {
        let mut t = ThresholdTracker::new(pairs.len());
        for (i, (hi, lo)) in pairs.iter().enumerate() {
            assert!(t.set_threshold(i, *hi, *lo));
        }
        t
    }

    fn feed(t: &mut ThresholdTracker, celsius: i32) -> bool {
        t.record_sample(celsius);
        t.check()
    }

    #[test]
    fn test_hysteresis_walkthrough() {
        let mut t = tracker(&[(60, 50)]);
        assert!(!feed(&mut t, 55));
        assert!(feed(&mut t, 65));
        assert_eq!(t.last_crossed(), LastCrossed { temperature: 60, direction: 1 });
        assert!(!feed(&mut t, 58));
        assert!(feed(&mut t, 45));
        assert_eq!(t.last_crossed(), LastCrossed { temperature: 50, direction: -1 });
    }

    #[test]
    fn test_single_sample_never_reports_below() {
        for reading in [-40, 0, 10, 49] {
            let mut t = tracker(&[(60, 50), (80, 70)]);
            assert!(!feed(&mut t, reading));
            assert_eq!(t.last_crossed(), LastCrossed::sentinel());
        }
    }

    #[test]
    fn test_single_sample_picks_highest_hi() {
        let mut t = tracker(&[(60, 50), (80, 70), (95, 90)]);
        assert!(feed(&mut t, 85));
        assert_eq!(t.last_crossed(), LastCrossed { temperature: 80, direction: 1 });
    }

    #[test]
    fn test_rising_edge_highest_wins() {
        let mut t = tracker(&[(60, 50), (80, 70)]);
        feed(&mut t, 40);
        assert!(feed(&mut t, 85));
        assert_eq!(t.last_crossed().temperature, 80);
    }

    #[test]
    fn test_falling_edge_lowest_wins() {
        let mut t = tracker(&[(60, 50), (80, 70)]);
        feed(&mut t, 85);
        assert!(feed(&mut t, 40));
        assert_eq!(t.last_crossed(), LastCrossed { temperature: 50, direction: -1 });
    }

    #[test]
    fn test_equal_reading_skipped() {
        let mut t = tracker(&[(60, 50)]);
        feed(&mut t, 65);
        assert!(!feed(&mut t, 65));
    }

    #[test]
    fn test_unconfigured_or_disabled_never_crosses() {
        let mut t = ThresholdTracker::new(2);
        feed(&mut t, 20);
        assert!(!feed(&mut t, 90));

        let mut t = tracker(&[(60, 50)]);
        t.set_enabled(false);
        feed(&mut t, 40);
        assert!(!feed(&mut t, 70));
    }

    #[test]
    fn test_reenable_resets_and_forces_notify() {
        let mut t = tracker(&[(60, 50)]);
        feed(&mut t, 55);
        feed(&mut t, 65);
        assert!(t.set_enabled(false));
        assert!(t.set_enabled(true));
        // Latest pair (55 -> 65) is rechecked against the sentinel
        assert_eq!(t.last_crossed(), LastCrossed { temperature: 60, direction: 1 });
    }

    #[test]
    fn test_set_threshold_out_of_range() {
        let mut t = ThresholdTracker::new(1);
        assert!(!t.set_threshold(1, 60, 50));
    }
}
