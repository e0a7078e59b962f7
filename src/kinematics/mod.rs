//! Cartesian-style kinematics: one rail per logical axis, each owning its
//! steppers and endstop. A kinematic instance covers one axis triplet
//! (XYZ or ABC) of the toolhead position vector.

pub mod extruder;

use crate::{
    homing::{error::HomingError, Homing},
    log::target,
    stepper::{Rail, Stepper},
    toolhead::{Move, MoveError},
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// Sentinel range of an axis that has not been homed yet.
pub const UNHOMED_LIMITS: (f64, f64) = (1.0, -1.0);

#[derive(Debug, Serialize)]
pub struct KinStatus {
    pub homed_axes: String,
    pub axis_minimum: Vec<f64>,
    pub axis_maximum: Vec<f64>,
}

/// The mapping between logical axis positions and stepper positions for a
/// group of axes.
pub trait Kinematics: Send + Sync {
    /// Axis letters this kinematic owns, e.g. `"XYZ"` or `"AB"`.
    fn axis_names(&self) -> &str;
    /// Global toolhead-vector indices of the owned axes.
    fn axes(&self) -> &[usize];
    fn get_steppers(&self) -> Vec<Arc<dyn Stepper>>;
    /// Logical positions of the owned axes, one entry per rail in
    /// [`Kinematics::axes`] order, from per-stepper commanded positions
    /// keyed by rail name.
    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec<f64>;
    fn set_position(&self, newpos: &[f64], homing_axes: &[usize]);
    /// Helper for safe-Z-home style flows: mark only the vertical axis as
    /// not homed.
    fn note_z_not_homed(&self) {}
    fn check_move(&self, mv: &mut Move) -> Result<(), MoveError>;
    fn home(&self, homing_state: &mut Homing) -> Result<(), HomingError>;
    fn motor_off(&self);
    fn get_status(&self) -> KinStatus;
}

pub struct CartKinematics {
    axis_names: String,
    axes: Vec<usize>,
    rails: Vec<Arc<Rail>>,
    limits: Mutex<Vec<(f64, f64)>>,
    max_z_velocity: f64,
    max_z_accel: f64,
}

impl CartKinematics {
    pub fn new(
        axis_names: String,
        axes: Vec<usize>,
        rails: Vec<Arc<Rail>>,
        max_z_velocity: f64,
        max_z_accel: f64,
    ) -> Self {
        assert_eq!(axes.len(), rails.len());
        let limits = Mutex::new(vec![UNHOMED_LIMITS; rails.len()]);
        Self {
            axis_names,
            axes,
            rails,
            limits,
            max_z_velocity,
            max_z_accel,
        }
    }

    fn check_endstops(&self, mv: &Move) -> Result<(), MoveError> {
        let limits = self.limits.lock().unwrap();
        for (i, (low, high)) in limits.iter().enumerate() {
            let axis = self.axes[i];
            if mv.axes_d[axis] != 0.
                && (mv.end_pos[axis] < *low || mv.end_pos[axis] > *high)
            {
                if low > high {
                    return Err(MoveError::MustHomeFirst);
                }
                return Err(MoveError::OutOfRange(format!(
                    "{}={:.3} not in [{:.3}; {:.3}]",
                    self.axis_names.chars().nth(i).unwrap_or('?'),
                    mv.end_pos[axis],
                    low,
                    high
                )));
            }
        }
        Ok(())
    }

    fn home_axis(
        &self,
        homing_state: &mut Homing,
        axis: usize,
        rail: &Arc<Rail>,
    ) -> Result<(), HomingError> {
        let (position_min, position_max) = rail.get_range();
        let hi = rail.get_homing_info();
        let pos_length = homing_state.pos_length();
        let mut homepos = vec![None; pos_length];
        homepos[axis] = Some(hi.position_endstop);
        let mut forcepos = homepos.clone();
        // push the forced start 1.5x past the opposing travel limit, in
        // the direction opposite to the homing move
        if hi.positive_dir {
            forcepos[axis] = Some(hi.position_endstop - 1.5 * (hi.position_endstop - position_min));
        } else {
            forcepos[axis] = Some(hi.position_endstop + 1.5 * (position_max - hi.position_endstop));
        }
        homing_state.home_rails(&[Arc::clone(rail)], forcepos, homepos)
    }
}

impl Kinematics for CartKinematics {
    fn axis_names(&self) -> &str {
        &self.axis_names
    }

    fn axes(&self) -> &[usize] {
        &self.axes
    }

    fn get_steppers(&self) -> Vec<Arc<dyn Stepper>> {
        self.rails
            .iter()
            .flat_map(|rail| rail.get_steppers().iter().cloned())
            .collect()
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec<f64> {
        self.rails
            .iter()
            .map(|rail| {
                stepper_positions
                    .get(rail.get_name())
                    .copied()
                    .unwrap_or(0.)
            })
            .collect()
    }

    fn set_position(&self, newpos: &[f64], homing_axes: &[usize]) {
        let mut limits = self.limits.lock().unwrap();
        for (i, rail) in self.rails.iter().enumerate() {
            rail.set_position(newpos);
            if homing_axes.contains(&self.axes[i]) {
                limits[i] = rail.get_range();
            }
        }
    }

    fn note_z_not_homed(&self) {
        let mut limits = self.limits.lock().unwrap();
        if limits.len() >= 3 {
            limits[2] = UNHOMED_LIMITS;
        }
    }

    fn check_move(&self, mv: &mut Move) -> Result<(), MoveError> {
        let outside_xy = {
            let limits = self.limits.lock().unwrap();
            let mut outside = false;
            for i in 0..limits.len().min(2) {
                let axis = self.axes[i];
                if mv.end_pos[axis] < limits[i].0 || mv.end_pos[axis] > limits[i].1 {
                    outside = true;
                }
            }
            outside
        };
        if outside_xy {
            self.check_endstops(mv)?;
        }
        // the third rail of the group is the slow vertical axis
        if self.rails.len() < 3 {
            return Ok(());
        }
        let z_axis = self.axes[2];
        if mv.axes_d[z_axis] == 0. {
            return Ok(());
        }
        self.check_endstops(mv)?;
        let z_ratio = mv.move_d / mv.axes_d[z_axis].abs();
        mv.limit_speed(self.max_z_velocity * z_ratio, self.max_z_accel * z_ratio);
        Ok(())
    }

    fn home(&self, homing_state: &mut Homing) -> Result<(), HomingError> {
        // each axis is homed independently and in order
        let requested = homing_state.get_axes().to_vec();
        for (i, rail) in self.rails.iter().enumerate() {
            let axis = self.axes[i];
            if requested.contains(&axis) {
                debug!(
                    target: target::INTERNAL,
                    "homing axis {} of group {}", axis, self.axis_names
                );
                self.home_axis(homing_state, axis, rail)?;
            }
        }
        Ok(())
    }

    fn motor_off(&self) {
        let mut limits = self.limits.lock().unwrap();
        for limit in limits.iter_mut() {
            *limit = UNHOMED_LIMITS;
        }
    }

    fn get_status(&self) -> KinStatus {
        let limits = self.limits.lock().unwrap();
        let homed_axes = self
            .axis_names
            .chars()
            .zip(limits.iter())
            .filter(|(_, (low, high))| low <= high)
            .map(|(letter, _)| letter.to_ascii_lowercase())
            .collect();
        let ranges: Vec<(f64, f64)> = self.rails.iter().map(|r| r.get_range()).collect();
        KinStatus {
            homed_axes,
            axis_minimum: ranges.iter().map(|r| r.0).collect(),
            axis_maximum: ranges.iter().map(|r| r.1).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comms::Event, exec::dispatch, testutil, toolhead::Toolhead};

    #[test]
    fn moves_require_homing_first() {
        let rig = testutil::zero_rig();
        let err = dispatch(&rig, "G1 X10 F600").unwrap_err();
        assert!(err.contains("Must home axis first"), "{}", err);
    }

    #[test]
    fn homing_adopts_rail_limits() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        let kins = rig.toolhead.kinematics();
        assert_eq!(kins[0].get_status().homed_axes, "xyz");
        let err = dispatch(&rig, "G1 X300 F600").unwrap_err();
        assert!(err.contains("Move out of range"), "{}", err);
    }

    #[test]
    fn z_moves_are_velocity_capped() {
        let rig = testutil::base_rig();
        testutil::home_base(&rig);
        let kins = rig.toolhead.kinematics();
        let start = rig.toolhead.get_position();
        let mut end = start.clone();
        end[2] += 10.;
        let mut mv = Move::new(start, end, 100., 3000.);
        kins[0].check_move(&mut mv).unwrap();
        // pure z move, z_ratio is 1: capped at max_z_velocity
        assert!((mv.speed() - 25.).abs() < 1e-9);
    }

    #[test]
    fn diagonal_z_moves_scale_the_cap() {
        let rig = testutil::base_rig();
        testutil::home_base(&rig);
        let kins = rig.toolhead.kinematics();
        let start = rig.toolhead.get_position();
        let mut end = start.clone();
        end[0] -= 30.;
        end[2] += 40.;
        let mut mv = Move::new(start, end, 500., 3000.);
        kins[0].check_move(&mut mv).unwrap();
        // move_d 50, dz 40: the cap scales by 50/40
        assert!((mv.speed() - 25. * 50. / 40.).abs() < 1e-9);
    }

    #[test]
    fn motor_off_forgets_homing() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        rig.bus.publish(Event::MotorOff);
        let kins = rig.toolhead.kinematics();
        assert_eq!(kins[0].get_status().homed_axes, "");
        let err = dispatch(&rig, "G1 X10 F600").unwrap_err();
        assert!(err.contains("Must home axis first"), "{}", err);
    }

    #[test]
    fn note_z_not_homed_only_clears_z() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        let kins = rig.toolhead.kinematics();
        kins[0].note_z_not_homed();
        assert_eq!(kins[0].get_status().homed_axes, "xy");
    }

    #[test]
    fn calc_position_reads_rails_by_name() {
        let rig = testutil::zero_rig();
        let kins = rig.toolhead.kinematics();
        let mut spos = HashMap::new();
        spos.insert(String::from("stepper_x"), 12.5);
        spos.insert(String::from("stepper_y"), -3.);
        spos.insert(String::from("stepper_z"), 7.);
        assert_eq!(kins[0].calc_position(&spos), vec![12.5, -3., 7.]);
    }

    #[test]
    fn partial_group_calc_position_matches_rail_count() {
        let rig = testutil::rig_from(testutil::PARTIAL_CONFIG);
        let kins = rig.toolhead.kinematics();
        let mut spos = HashMap::new();
        spos.insert(String::from("stepper_a"), 4.5);
        assert_eq!(kins[1].calc_position(&spos), vec![4.5]);
    }
}
