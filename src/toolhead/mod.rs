//! The toolhead facade interface and the move-validation type. The actual
//! toolhead (lookahead planner, trapezoid queue, MCU flushing) is an
//! external collaborator; the core drives it exclusively through the
//! [`Toolhead`] trait.

use crate::{
    comms::Completion,
    kinematics::{
        extruder::{ExtruderStepper, PrinterExtruder},
        Kinematics,
    },
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("Must home axis first")]
    MustHomeFirst,
    #[error("Move out of range: {}", .0)]
    OutOfRange(String),
    #[error("Extrude below minimum temp\nSee the 'min_extrude_temp' config option for details")]
    ExtrudeBelowMinTemp,
    #[error("Extrude only move too long ({:.3}mm vs {:.3}mm)\nSee the 'max_extrude_only_distance' config option for details", .0, .1)]
    ExtrudeOnlyTooLong(f64, f64),
    #[error("Move exceeds maximum extrusion ({:.3}mm^2 vs {:.3}mm^2)\nSee the 'max_extrude_cross_section' config option for details", .0, .1)]
    ExceedsMaxExtrusion(f64, f64),
    #[error("Extrude when no extruder present")]
    NoExtruder,
    #[error("printer is shutting down")]
    Shutdown,
    #[error("endstop error: {}", .0)]
    Endstop(String),
}

// Moves below this kinematic distance are treated as extrude-only.
const KIN_MOVE_EPSILON: f64 = 0.000000001;

/// A planned linear move as seen by the validity checks. The trajectory
/// shaping itself happens downstream in the external planner; checks may
/// only tighten the velocity and acceleration caps via [`Move::limit_speed`].
#[derive(Debug, Clone)]
pub struct Move {
    pub start_pos: Vec<f64>,
    pub end_pos: Vec<f64>,
    pub axes_d: Vec<f64>,
    pub axes_r: Vec<f64>,
    pub move_d: f64,
    pub is_kinematic_move: bool,
    pub accel: f64,
    pub max_cruise_v2: f64,
}

impl Move {
    pub fn new(start_pos: Vec<f64>, end_pos: Vec<f64>, speed: f64, max_accel: f64) -> Self {
        let mut end_pos = end_pos;
        let mut axes_d: Vec<f64> = end_pos
            .iter()
            .zip(start_pos.iter())
            .map(|(e, s)| e - s)
            .collect();
        let e_index = end_pos.len() - 1;
        let mut move_d = axes_d[..e_index]
            .iter()
            .map(|d| d * d)
            .sum::<f64>()
            .sqrt();
        let mut is_kinematic_move = true;
        if move_d < KIN_MOVE_EPSILON {
            // extrude only move
            end_pos[..e_index].copy_from_slice(&start_pos[..e_index]);
            for d in axes_d[..e_index].iter_mut() {
                *d = 0.;
            }
            move_d = axes_d[e_index].abs();
            is_kinematic_move = false;
        }
        let axes_r = if move_d > 0. {
            axes_d.iter().map(|d| d / move_d).collect()
        } else {
            vec![0.; axes_d.len()]
        };
        Self {
            start_pos,
            end_pos,
            axes_d,
            axes_r,
            move_d,
            is_kinematic_move,
            accel: max_accel,
            max_cruise_v2: speed * speed,
        }
    }

    /// Tightens the velocity and acceleration caps. Checks may only ever
    /// lower them.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
        }
        self.accel = self.accel.min(accel);
    }

    pub fn speed(&self) -> f64 {
        self.max_cruise_v2.sqrt()
    }
}

/// A transform layer the G-code frontend routes outgoing moves through
/// (bed meshes, skew correction and the like install one).
pub trait MoveTransform: Send + Sync {
    fn move_to(&self, newpos: &[f64], speed: f64) -> Result<(), MoveError>;
    fn get_position(&self) -> Vec<f64>;
}

/// The motion facade. Owns the kinematics, the active extruder and the
/// commanded position vector; executes planned motion on behalf of the
/// core.
pub trait Toolhead: Send + Sync {
    fn move_to(&self, newpos: &[f64], speed: f64) -> Result<(), MoveError>;
    /// Begins executing a planned motion that aborts as soon as
    /// `drip_completion` resolves. Step history must remain queryable
    /// after an abort.
    fn drip_move(
        &self,
        newpos: &[f64],
        speed: f64,
        drip_completion: &Completion,
    ) -> Result<(), MoveError>;
    fn set_position(&self, newpos: &[f64], homing_axes: &[usize]);
    fn get_position(&self) -> Vec<f64>;
    fn get_last_move_time(&self) -> f64;
    fn flush_step_generation(&self);
    fn dwell(&self, delay: f64);
    fn is_shutdown(&self) -> bool;
    /// Whether the printer runs on replayed debug input; position audits
    /// are skipped then.
    fn replayed_input(&self) -> bool {
        false
    }
    fn kinematics(&self) -> Vec<Arc<dyn Kinematics>>;
    fn extruder_steppers(&self) -> Vec<Arc<ExtruderStepper>>;
    fn active_extruder(&self) -> Option<Arc<PrinterExtruder>>;
}
