use crate::parameters::DeviceParameters;
use common::messages::{MoistureState, ReportedCalibration};
use rand::Rng;

/// Raw sensor bounds and the percentage at which the soil counts as dry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorCalibration {
    pub hydrated: i64,
    pub dry: i64,
    pub trigger_percentage: i64,
}

impl From<&DeviceParameters> for SensorCalibration {
    fn from(parameters: &DeviceParameters) -> Self {
        Self {
            hydrated: parameters.abs_hydrated_state_value,
            dry: parameters.abs_dry_state_value,
            trigger_percentage: parameters.sprinkler_trigger_percentage,
        }
    }
}

impl SensorCalibration {
    /// Overlay the values the shadow holds; absent values are kept
    pub fn merged(&self, reported: &ReportedCalibration) -> Self {
        Self {
            hydrated: reported.abs_hydrated_state_value.unwrap_or(self.hydrated),
            dry: reported.abs_dry_state_value.unwrap_or(self.dry),
            trigger_percentage: reported
                .sprinkler_trigger_percentage
                .unwrap_or(self.trigger_percentage),
        }
    }

    /// Linear rescale of `raw` from [hydrated, dry] onto [100, 0], truncated
    /// toward zero. Values outside the bounds are not clamped. `None` when
    /// the bounds coincide.
    pub fn moisture_percentage(&self, raw: i64) -> Option<i64> {
        if self.dry == self.hydrated {
            return None;
        }
        let scaled = (raw - self.hydrated) as f64 * -100.0 / (self.dry - self.hydrated) as f64;
        Some((scaled + 100.0) as i64)
    }

    /// Dry iff the percentage is at or below the trigger
    pub fn classify(&self, percentage: i64) -> MoistureState {
        if percentage <= self.trigger_percentage {
            MoistureState::Dry
        } else {
            MoistureState::Hydrated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Drying,
    Rehydrating,
}

/// Oscillating soil moisture source.
///
/// Each cycle starts at the hydrated bound, climbs by an even random step
/// until it reaches the dry bound, then descends by a fresh step until it is
/// back at or below the hydrated bound.
pub struct MoistureSimulator<R> {
    rng: R,
    value: Option<i64>,
    step: i64,
    direction: Direction,
}

impl<R: Rng> MoistureSimulator<R> {
    pub fn new(rng: R) -> Self {
        Self {
            rng,
            value: None,
            step: 0,
            direction: Direction::Drying,
        }
    }

    fn next_step(&mut self) -> i64 {
        // even, 4..=18
        self.rng.gen_range(2..10) * 2
    }

    /// Next raw reading. `None` when the calibration has no drying range.
    pub fn next_reading(&mut self, calibration: &SensorCalibration) -> Option<i64> {
        if calibration.hydrated >= calibration.dry {
            self.value = None;
            return None;
        }

        let value = match self.value {
            Some(value) => value,
            None => {
                self.direction = Direction::Drying;
                self.step = self.next_step();
                calibration.hydrated
            }
        };

        let next = match self.direction {
            Direction::Drying => value + self.step,
            Direction::Rehydrating => value - self.step,
        };

        match self.direction {
            Direction::Drying if next >= calibration.dry => {
                self.direction = Direction::Rehydrating;
                self.step = self.next_step();
                self.value = Some(next);
            }
            Direction::Rehydrating if next <= calibration.hydrated => {
                // the next cycle restarts from the hydrated bound
                self.value = None;
            }
            _ => self.value = Some(next),
        }

        Some(next)
    }
}
