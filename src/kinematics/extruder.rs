//! The extruder pseudo-axis. It occupies the last slot of the toolhead
//! position vector, has no geometric transform, and becomes home-able when
//! an endstop is configured for it.

use crate::{
    config,
    log::target,
    stepper::{Rail, Stepper},
    toolhead::{Move, MoveError},
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tracing::debug;

use super::UNHOMED_LIMITS;

#[derive(Debug, Serialize)]
pub struct ExtruderStatus {
    pub can_extrude: bool,
    pub homed_axes: String,
}

/// The motor side of an extruder: a single-stepper rail, plus software
/// limits when the rail carries an endstop.
pub struct ExtruderStepper {
    rail: Arc<Rail>,
    can_home: bool,
    limits: Mutex<(f64, f64)>,
}

impl ExtruderStepper {
    pub fn new(rail: Arc<Rail>) -> Self {
        let can_home = !rail.get_endstops().is_empty();
        Self {
            rail,
            can_home,
            limits: Mutex::new(UNHOMED_LIMITS),
        }
    }

    pub fn name(&self) -> &str {
        self.rail.get_name()
    }

    pub fn rail(&self) -> &Arc<Rail> {
        &self.rail
    }

    pub fn stepper(&self) -> Arc<dyn Stepper> {
        Arc::clone(&self.rail.get_steppers()[0])
    }

    pub fn can_home(&self) -> bool {
        self.can_home
    }

    pub fn limits(&self) -> (f64, f64) {
        *self.limits.lock().unwrap()
    }

    pub fn set_position(&self, newpos: &[f64], homing_e: bool) {
        self.rail.set_position(newpos);
        if homing_e && self.can_home {
            let range = self.rail.get_range();
            debug!(
                target: target::INTERNAL,
                "setting limits {:?} on extruder stepper {}", range, self.name()
            );
            *self.limits.lock().unwrap() = range;
        }
    }

    pub fn motor_off(&self) {
        *self.limits.lock().unwrap() = UNHOMED_LIMITS;
    }

    /// Software limit check for the E component of a move. Only applies to
    /// home-able extruders.
    pub fn check_move_limits(&self, mv: &Move) -> Result<(), MoveError> {
        if !self.can_home {
            return Ok(());
        }
        let e_index = mv.end_pos.len() - 1;
        let epos = mv.end_pos[e_index];
        let (low, high) = *self.limits.lock().unwrap();
        if mv.axes_d[e_index] != 0. && (epos < low || epos > high) {
            if low > high {
                return Err(MoveError::MustHomeFirst);
            }
            return Err(MoveError::OutOfRange(format!(
                "E={:.3} not in [{:.3}; {:.3}]",
                epos, low, high
            )));
        }
        Ok(())
    }

    fn homed_axes(&self) -> String {
        let (low, high) = *self.limits.lock().unwrap();
        if self.can_home && low <= high {
            String::from("e")
        } else {
            String::new()
        }
    }
}

/// Extrusion-specific move validation and junction handling for one
/// extruder. Heating is external; only the "ready to extrude" verdict is
/// consumed here.
pub struct PrinterExtruder {
    name: String,
    stepper: Arc<ExtruderStepper>,
    nozzle_diameter: f64,
    filament_area: f64,
    max_extrude_ratio: f64,
    max_e_velocity: f64,
    max_e_accel: f64,
    max_e_dist: f64,
    instant_corner_v: f64,
    symmetric: bool,
    can_extrude: AtomicBool,
    last_position: Mutex<f64>,
}

impl PrinterExtruder {
    pub fn new(
        name: String,
        cfg: &config::Extruder,
        stepper: Arc<ExtruderStepper>,
        max_velocity: f64,
        max_accel: f64,
    ) -> Self {
        let filament_area = std::f64::consts::PI * (cfg.filament_diameter * 0.5).powi(2);
        let def_max_cross_section = 4. * cfg.nozzle_diameter.powi(2);
        let def_max_extrude_ratio = def_max_cross_section / filament_area;
        let max_cross_section = cfg
            .max_extrude_cross_section
            .unwrap_or(def_max_cross_section);
        let max_extrude_ratio = max_cross_section / filament_area;
        debug!(
            target: target::INTERNAL,
            "extruder {} max_extrude_ratio={:.6}", name, max_extrude_ratio
        );
        Self {
            name,
            stepper,
            nozzle_diameter: cfg.nozzle_diameter,
            filament_area,
            max_extrude_ratio,
            max_e_velocity: cfg
                .max_extrude_only_velocity
                .unwrap_or(max_velocity * def_max_extrude_ratio),
            max_e_accel: cfg
                .max_extrude_only_accel
                .unwrap_or(max_accel * def_max_extrude_ratio),
            max_e_dist: cfg.max_extrude_only_distance,
            instant_corner_v: cfg.instantaneous_corner_velocity,
            symmetric: cfg.symmetric_speed_limits,
            can_extrude: AtomicBool::new(cfg.min_extrude_temp <= 0.),
            last_position: Mutex::new(0.),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stepper(&self) -> &Arc<ExtruderStepper> {
        &self.stepper
    }

    pub fn can_home(&self) -> bool {
        self.stepper.can_home()
    }

    pub fn can_extrude(&self) -> bool {
        self.can_extrude.load(Ordering::Acquire)
    }

    /// Verdict of the external thermal control.
    pub fn set_can_extrude(&self, ready: bool) {
        self.can_extrude.store(ready, Ordering::Release);
    }

    pub fn last_position(&self) -> f64 {
        *self.last_position.lock().unwrap()
    }

    pub fn set_last_position(&self, pos: f64) {
        *self.last_position.lock().unwrap() = pos;
    }

    pub fn check_move(&self, mv: &mut Move) -> Result<(), MoveError> {
        let e_index = mv.end_pos.len() - 1;
        let axis_r = mv.axes_r[e_index];
        if !self.can_extrude() {
            return Err(MoveError::ExtrudeBelowMinTemp);
        }
        if (mv.axes_d[0] == 0. && mv.axes_d[1] == 0.) || axis_r < 0. || self.symmetric {
            // extrude only move (or retraction move), limit accel and velocity
            if mv.axes_d[e_index].abs() > self.max_e_dist {
                return Err(MoveError::ExtrudeOnlyTooLong(
                    mv.axes_d[e_index],
                    self.max_e_dist,
                ));
            }
            let inv_extrude_r = 1. / axis_r.abs();
            mv.limit_speed(
                self.max_e_velocity * inv_extrude_r,
                self.max_e_accel * inv_extrude_r,
            );
        } else if axis_r > self.max_extrude_ratio {
            if mv.axes_d[e_index] <= self.nozzle_diameter * self.max_extrude_ratio {
                // permit extrusion if amount extruded is tiny
                return Ok(());
            }
            let area = axis_r * self.filament_area;
            debug!(
                target: target::INTERNAL,
                "overextrude: {} vs {} (area={:.3} dist={:.3})",
                axis_r,
                self.max_extrude_ratio,
                area,
                mv.move_d
            );
            return Err(MoveError::ExceedsMaxExtrusion(
                area,
                self.max_extrude_ratio * self.filament_area,
            ));
        }
        self.stepper.check_move_limits(mv)
    }

    /// Junction speed contribution of the extruder between two moves.
    pub fn calc_junction(&self, prev_move: &Move, mv: &Move) -> f64 {
        let e_index = mv.end_pos.len() - 1;
        let diff_r = mv.axes_r[e_index] - prev_move.axes_r[e_index];
        if diff_r != 0. {
            return (self.instant_corner_v / diff_r.abs()).powi(2);
        }
        mv.max_cruise_v2
    }

    pub fn get_status(&self) -> ExtruderStatus {
        ExtruderStatus {
            can_extrude: self.can_extrude(),
            homed_axes: self.stepper.homed_axes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        exec::dispatch,
        testutil,
        toolhead::{Move, Toolhead},
    };

    #[test]
    fn cold_extruder_rejects_extrusion() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        rig.toolhead
            .active_extruder()
            .unwrap()
            .set_can_extrude(false);
        let err = dispatch(&rig, "G1 X10 E1 F600").unwrap_err();
        assert!(err.contains("Extrude below minimum temp"), "{}", err);
    }

    #[test]
    fn extrude_only_distance_is_limited() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        let err = dispatch(&rig, "G1 E60 F300").unwrap_err();
        assert!(err.contains("Extrude only move too long"), "{}", err);
    }

    #[test]
    fn overextrusion_is_rejected() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        let err = dispatch(&rig, "G1 X0.5 E10 F600").unwrap_err();
        assert!(err.contains("exceeds maximum extrusion"), "{}", err);
    }

    #[test]
    fn retraction_and_normal_extrusion_pass() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 X50 E1 F600").unwrap();
        dispatch(&rig, "G1 E-4 F300").unwrap();
        assert!((rig.toolhead.get_position()[3] - -4.).abs() < 1e-9);
    }

    #[test]
    fn calc_junction_scales_with_ratio_change() {
        let rig = testutil::zero_rig();
        let extruder = rig.toolhead.active_extruder().unwrap();
        let prev = Move::new(vec![0., 0., 0., 0.], vec![10., 0., 0., 0.5], 100., 3000.);
        let cur = Move::new(vec![10., 0., 0., 0.5], vec![20., 0., 0., 1.5], 100., 3000.);
        // ratios 0.05 and 0.1: (1.0 / 0.05)^2
        assert!((extruder.calc_junction(&prev, &cur) - 400.).abs() < 1e-6);
        let same = Move::new(vec![20., 0., 0., 1.5], vec![30., 0., 0., 2.5], 100., 3000.);
        assert_eq!(extruder.calc_junction(&cur, &same), same.max_cruise_v2);
    }

    #[test]
    fn homeable_extruder_enforces_limits_until_homed() {
        let rig = testutil::rig_from(testutil::E_HOME_CONFIG);
        for letter in ['X', 'Y', 'Z'] {
            rig.endstops[&letter].set_trigger_pos(0.);
        }
        dispatch(&rig, "G28 X Y Z").unwrap();
        let err = dispatch(&rig, "G1 E5 F300").unwrap_err();
        assert!(err.contains("Must home axis first"), "{}", err);
        rig.endstops[&'E'].set_trigger_pos(0.);
        dispatch(&rig, "G28 E").unwrap();
        let extruder = rig.toolhead.active_extruder().unwrap();
        assert_eq!(extruder.stepper().limits(), (0., 100.));
        assert_eq!(extruder.get_status().homed_axes, "e");
        dispatch(&rig, "G1 E5 F300").unwrap();
        let err = dispatch(&rig, "G1 E150 F300").unwrap_err();
        assert!(err.contains("Move out of range"), "{}", err);
    }
}
