//! Stepper, endstop and rail abstractions. The step-pulse generation and
//! the MCU transport behind them are external; the core only consumes the
//! interfaces below (step counters, step history lookups and endstop
//! arming).

use crate::{
    comms::Completion,
    config,
    toolhead::MoveError,
};
use std::sync::Arc;

/// A single motor channel with an integer step counter and a known
/// step-to-distance ratio. Commanded positions are in machine units, MCU
/// positions in steps.
pub trait Stepper: Send + Sync {
    fn name(&self) -> &str;
    fn step_distance(&self) -> f64;
    fn get_mcu_position(&self) -> i64;
    /// Step counter corresponding to a commanded coordinate recorded
    /// earlier, used to audit for position skew after probing.
    fn mcu_position_at(&self, commanded_pos: f64) -> i64;
    /// Search the step history for the position at a past print time.
    /// Only exact for times at or before the last flush.
    fn get_past_mcu_position(&self, print_time: f64) -> i64;
    fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64;
    fn get_commanded_position(&self) -> f64;
    /// Re-declare the commanded position without moving the motor; the
    /// step counter is unaffected.
    fn set_position(&self, newpos: &[f64]);
    fn calc_position_from_coord(&self, coord: &[f64]) -> f64;
}

/// A limit sensor whose trigger time during a motion can be correlated to
/// the step history.
pub trait Endstop: Send + Sync {
    fn get_steppers(&self) -> Vec<Arc<dyn Stepper>>;
    /// Arms the endstop for a homing move. The returned completion fires
    /// with a nonzero value on trigger (or cancellation).
    fn home_start(
        &self,
        print_time: f64,
        sample_time: f64,
        sample_count: u32,
        rest_time: f64,
        triggered: bool,
    ) -> Completion;
    /// Waits for the final endstop verdict. A positive return is the
    /// trigger time, 0.0 means the endstop did not trigger during the move.
    fn home_wait(&self, home_end_time: f64) -> Result<f64, MoveError>;
}

/// Motor power control, consumed by the homing core to de-energize the
/// steppers when a homing attempt fails.
pub trait StepperEnable: Send + Sync {
    fn motor_off(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct HomingInfo {
    pub speed: f64,
    pub retract_dist: f64,
    pub retract_speed: f64,
    pub second_homing_speed: f64,
    pub positive_dir: bool,
    pub position_endstop: f64,
}

impl From<&config::Stepper> for HomingInfo {
    fn from(cfg: &config::Stepper) -> Self {
        Self {
            speed: cfg.homing_speed,
            retract_dist: cfg.homing_retract_dist,
            retract_speed: cfg.homing_retract_speed(),
            second_homing_speed: cfg.second_homing_speed(),
            positive_dir: cfg.homing_positive_dir,
            position_endstop: cfg.position_endstop,
        }
    }
}

impl From<&config::ExtruderEndstop> for HomingInfo {
    fn from(cfg: &config::ExtruderEndstop) -> Self {
        Self {
            speed: cfg.homing_speed,
            retract_dist: cfg.homing_retract_dist,
            retract_speed: cfg.homing_retract_speed.unwrap_or(cfg.homing_speed),
            second_homing_speed: cfg.second_homing_speed.unwrap_or(cfg.homing_speed / 2.),
            positive_dir: cfg.homing_positive_dir,
            position_endstop: cfg.position_endstop,
        }
    }
}

/// A mechanical axis abstraction owning one or more steppers and their
/// endstops, with a known travel range and homing parameters.
pub struct Rail {
    name: String,
    steppers: Vec<Arc<dyn Stepper>>,
    endstops: Vec<(Arc<dyn Endstop>, String)>,
    homing_info: HomingInfo,
    position_min: f64,
    position_max: f64,
}

impl Rail {
    pub fn new(
        name: String,
        steppers: Vec<Arc<dyn Stepper>>,
        endstops: Vec<(Arc<dyn Endstop>, String)>,
        homing_info: HomingInfo,
        range: (f64, f64),
    ) -> Self {
        Self {
            name,
            steppers,
            endstops,
            homing_info,
            position_min: range.0,
            position_max: range.1,
        }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_steppers(&self) -> &[Arc<dyn Stepper>] {
        &self.steppers
    }

    pub fn get_endstops(&self) -> &[(Arc<dyn Endstop>, String)] {
        &self.endstops
    }

    pub fn get_homing_info(&self) -> HomingInfo {
        self.homing_info
    }

    pub fn get_range(&self) -> (f64, f64) {
        (self.position_min, self.position_max)
    }

    pub fn set_position(&self, newpos: &[f64]) {
        for stepper in self.steppers.iter() {
            stepper.set_position(newpos);
        }
    }
}
