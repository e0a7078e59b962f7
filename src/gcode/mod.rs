//! The G-code movement frontend: coordinate state (absolute/relative
//! flags, base and homing offsets, feed-rate and extrusion factors, saved
//! states) and the translation of movement commands into toolhead calls.

pub mod error;
mod parser;

pub use self::parser::GCodeCommand;
use self::error::GCodeError;
use crate::{
    comms::{AxisMap, Event, EventBus},
    config,
    kinematics::Kinematics,
    log::target,
    stepper::Stepper,
    toolhead::{MoveError, MoveTransform, Toolhead},
    util::ensure_own,
};
use indexmap::IndexMap;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct GCodeStatus {
    // in F-space, a fraction: 1.0 when unscaled
    pub speed_factor: f64,
    // in F-space units (distance per minute)
    pub speed: f64,
    pub extrude_factor: f64,
    pub absolute_coordinates: bool,
    pub absolute_extrude: bool,
    pub homing_origin: Vec<f64>,
    pub position: Vec<f64>,
    pub gcode_position: Vec<f64>,
}

#[derive(Debug, Clone)]
struct SavedState {
    absolute_coord: bool,
    absolute_extrude: bool,
    base_position: Vec<f64>,
    last_position: Vec<f64>,
    homing_position: Vec<f64>,
    speed: f64,
    speed_factor: f64,
    extrude_factor: f64,
}

/// What the move transform chain pointed at before an install.
pub enum PreviousTransform {
    Toolhead(Arc<dyn Toolhead>),
    Transform(Arc<dyn MoveTransform>),
}

pub struct GCodeMove {
    axis_map: AxisMap,
    relative_e_restore: bool,
    toolhead: Arc<dyn Toolhead>,
    bus: Arc<EventBus>,
    is_printer_ready: bool,
    absolute_coord: bool,
    absolute_extrude: bool,
    base_position: Vec<f64>,
    last_position: Vec<f64>,
    homing_position: Vec<f64>,
    speed: f64,
    speed_factor: f64,
    extrude_factor: f64,
    saved_states: IndexMap<String, SavedState>,
    move_transform: Option<Arc<dyn MoveTransform>>,
}

impl GCodeMove {
    pub fn new(
        cfg: &config::Config,
        axis_map: AxisMap,
        toolhead: Arc<dyn Toolhead>,
        bus: Arc<EventBus>,
    ) -> Self {
        let pos_length = axis_map.pos_length();
        debug!(
            target: target::INTERNAL,
            "gcode frontend starting with axis set '{}' and {} position slots",
            axis_map.names(),
            pos_length
        );
        Self {
            axis_map,
            relative_e_restore: cfg.printer.relative_e_restore,
            toolhead,
            bus,
            is_printer_ready: false,
            absolute_coord: true,
            absolute_extrude: true,
            base_position: vec![0.; pos_length],
            last_position: vec![0.; pos_length],
            homing_position: vec![0.; pos_length],
            speed: 25.,
            // incoming F values are distance/minute, internal speeds are
            // distance/second
            speed_factor: 1. / 60.,
            extrude_factor: 1.,
            saved_states: IndexMap::new(),
            move_transform: None,
        }
    }

    // event handlers, wired up by the executor setup

    pub fn handle_ready(&mut self) {
        self.is_printer_ready = true;
        self.reset_last_position();
    }

    pub fn handle_shutdown(&mut self) {
        if !self.is_printer_ready {
            return;
        }
        self.is_printer_ready = false;
        info!(
            target: target::INTERNAL,
            "gcode state: absolute_coord={} absolute_extrude={} base_position={:?} \
             last_position={:?} homing_position={:?} speed_factor={} extrude_factor={} speed={}",
            self.absolute_coord,
            self.absolute_extrude,
            self.base_position,
            self.last_position,
            self.homing_position,
            self.speed_factor,
            self.extrude_factor,
            self.speed
        );
    }

    pub fn handle_activate_extruder(&mut self) {
        // the toolhead already updated its E slot to the new extruder's
        // last position, re-reading it is enough
        self.reset_last_position();
        self.extrude_factor = 1.;
    }

    pub fn handle_home_rails_end(&mut self, axes: &[usize]) {
        self.reset_last_position();
        for axis in axes {
            self.base_position[*axis] = self.homing_position[*axis];
        }
    }

    pub fn reset_last_position(&mut self) {
        if self.is_printer_ready {
            self.last_position = self.position_with_transform();
        }
    }

    // transform chain

    /// Installs a move transform. Only one layer is stored; chaining is
    /// achieved by the caller wrapping the returned previous target.
    pub fn set_move_transform(
        &mut self,
        transform: Arc<dyn MoveTransform>,
        force: bool,
    ) -> Result<PreviousTransform, GCodeError> {
        ensure_own!(
            self.move_transform.is_none() || force,
            GCodeError::TransformAlreadySet
        );
        let old = match self.move_transform.take() {
            Some(t) => PreviousTransform::Transform(t),
            None => PreviousTransform::Toolhead(Arc::clone(&self.toolhead)),
        };
        self.move_transform = Some(transform);
        Ok(old)
    }

    fn move_with_transform(&self, newpos: &[f64], speed: f64) -> Result<(), MoveError> {
        match &self.move_transform {
            Some(transform) => transform.move_to(newpos, speed),
            None => self.toolhead.move_to(newpos, speed),
        }
    }

    fn position_with_transform(&self) -> Vec<f64> {
        if !self.is_printer_ready {
            return vec![0.; self.axis_map.pos_length()];
        }
        match &self.move_transform {
            Some(transform) => transform.get_position(),
            None => self.toolhead.get_position(),
        }
    }

    // reporting

    fn get_gcode_position(&self) -> Vec<f64> {
        let mut pos: Vec<f64> = self
            .last_position
            .iter()
            .zip(self.base_position.iter())
            .map(|(lp, bp)| lp - bp)
            .collect();
        let e_index = pos.len() - 1;
        pos[e_index] /= self.extrude_factor;
        pos
    }

    fn get_gcode_speed(&self) -> f64 {
        self.speed / self.speed_factor
    }

    fn get_gcode_speed_override(&self) -> f64 {
        self.speed_factor * 60.
    }

    pub fn get_status(&self) -> GCodeStatus {
        GCodeStatus {
            speed_factor: self.get_gcode_speed_override(),
            speed: self.get_gcode_speed(),
            extrude_factor: self.extrude_factor,
            absolute_coordinates: self.absolute_coord,
            absolute_extrude: self.absolute_extrude,
            homing_origin: self.homing_position.clone(),
            position: self.last_position.clone(),
            gcode_position: self.get_gcode_position(),
        }
    }

    // state accessors used by the diagnostics and tests

    pub fn last_position(&self) -> &[f64] {
        &self.last_position
    }

    pub fn base_position(&self) -> &[f64] {
        &self.base_position
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn absolute_coord(&self) -> bool {
        self.absolute_coord
    }

    pub fn absolute_extrude(&self) -> bool {
        self.absolute_extrude
    }

    pub fn extrude_factor(&self) -> f64 {
        self.extrude_factor
    }

    // command implementations

    pub fn cmd_g1(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let e_index = self.axis_map.e_index();
        let axis_map = self.axis_map.clone();
        for (letter, pos) in axis_map.iter_kinematic() {
            let raw = match cmd.get(&letter.to_string()) {
                Some(raw) => raw,
                None => continue,
            };
            ensure_own!(
                self.axis_map.is_configured(letter),
                GCodeError::UnconfiguredAxis(letter)
            );
            let v: f64 = raw
                .parse()
                .map_err(|_| GCodeError::ParseError(String::from(cmd.commandline())))?;
            if !self.absolute_coord {
                // value relative to position of last move
                self.last_position[pos] += v;
            } else {
                // value relative to base coordinate position
                self.last_position[pos] = v + self.base_position[pos];
            }
        }
        if let Some(raw) = cmd.get("E") {
            let v: f64 = raw
                .parse::<f64>()
                .map_err(|_| GCodeError::ParseError(String::from(cmd.commandline())))?
                * self.extrude_factor;
            if !self.absolute_coord || !self.absolute_extrude {
                self.last_position[e_index] += v;
            } else {
                self.last_position[e_index] = v + self.base_position[e_index];
            }
        }
        if let Some(gcode_speed) = cmd.get_float("F")? {
            ensure_own!(
                gcode_speed > 0.,
                GCodeError::InvalidSpeed(String::from(cmd.commandline()))
            );
            self.speed = gcode_speed * self.speed_factor;
        }
        self.bus.publish(Event::ParsingMoveCommand {
            command: String::from(cmd.commandline()),
        });
        debug!(
            target: target::INTERNAL,
            "G1 moving to {:?} at speed {}", self.last_position, self.speed
        );
        let newpos = self.last_position.clone();
        self.move_with_transform(&newpos, self.speed)?;
        Ok(())
    }

    pub fn cmd_g20(&mut self, _cmd: &GCodeCommand) -> Result<(), GCodeError> {
        Err(GCodeError::InchesNotSupported)
    }

    pub fn cmd_g21(&mut self, _cmd: &GCodeCommand) -> Result<(), GCodeError> {
        // millimeters are all there is
        Ok(())
    }

    pub fn cmd_m82(&mut self, _cmd: &GCodeCommand) -> Result<(), GCodeError> {
        self.absolute_extrude = true;
        Ok(())
    }

    pub fn cmd_m83(&mut self, _cmd: &GCodeCommand) -> Result<(), GCodeError> {
        self.absolute_extrude = false;
        Ok(())
    }

    pub fn cmd_g90(&mut self, _cmd: &GCodeCommand) -> Result<(), GCodeError> {
        self.absolute_coord = true;
        Ok(())
    }

    pub fn cmd_g91(&mut self, _cmd: &GCodeCommand) -> Result<(), GCodeError> {
        self.absolute_coord = false;
        Ok(())
    }

    pub fn cmd_g92(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let e_index = self.axis_map.e_index();
        let axis_map = self.axis_map.clone();
        let mut any = false;
        for (letter, pos) in axis_map.iter() {
            if let Some(mut offset) = cmd.get_float(&letter.to_string())? {
                if pos == e_index {
                    offset *= self.extrude_factor;
                }
                self.base_position[pos] = self.last_position[pos] - offset;
                any = true;
            }
        }
        if !any {
            self.base_position = self.last_position.clone();
        }
        Ok(())
    }

    pub fn cmd_m114(&self, _cmd: &GCodeCommand) -> Result<String, GCodeError> {
        let pos = self.get_gcode_position();
        let msg = self
            .axis_map
            .iter()
            .map(|(letter, index)| format!("{}:{:.3}", letter, pos[index]))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(msg)
    }

    pub fn cmd_m220(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let value = (cmd.get_float_above("S", 100., 0.)? / 100.) / 60.;
        // speed_factor still holds the old value here; dividing by it
        // removes the old scaling before the new one is applied
        self.speed = self.get_gcode_speed() * value;
        self.speed_factor = value;
        Ok(())
    }

    pub fn cmd_m221(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let new_extrude_factor = cmd.get_float_above("S", 100., 0.)? / 100.;
        let e_index = self.axis_map.e_index();
        let last_e_pos = self.last_position[e_index];
        let e_value = (last_e_pos - self.base_position[e_index]) / self.extrude_factor;
        self.base_position[e_index] = last_e_pos - e_value * new_extrude_factor;
        self.extrude_factor = new_extrude_factor;
        Ok(())
    }

    pub fn cmd_set_gcode_offset(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let mut move_delta = vec![0.; self.axis_map.pos_length()];
        let axis_map = self.axis_map.clone();
        for (letter, pos) in axis_map.iter() {
            let offset = match cmd.get_float(&letter.to_string())? {
                Some(offset) => offset,
                None => match cmd.get_float(&format!("{}_ADJUST", letter))? {
                    Some(adjust) => adjust + self.homing_position[pos],
                    None => continue,
                },
            };
            let delta = offset - self.homing_position[pos];
            move_delta[pos] = delta;
            self.base_position[pos] += delta;
            self.homing_position[pos] = offset;
        }
        // move the toolhead the given offset if requested
        if cmd.get_int_or("MOVE", 0)? != 0 {
            let speed = cmd.get_float_above("MOVE_SPEED", self.speed, 0.)?;
            for (pos, delta) in move_delta.iter().enumerate() {
                self.last_position[pos] += *delta;
            }
            let newpos = self.last_position.clone();
            self.move_with_transform(&newpos, speed)?;
        }
        Ok(())
    }

    pub fn cmd_save_gcode_state(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let state_name = String::from(cmd.get_or("NAME", "default"));
        self.saved_states.insert(
            state_name,
            SavedState {
                absolute_coord: self.absolute_coord,
                absolute_extrude: self.absolute_extrude,
                base_position: self.base_position.clone(),
                last_position: self.last_position.clone(),
                homing_position: self.homing_position.clone(),
                speed: self.speed,
                speed_factor: self.speed_factor,
                extrude_factor: self.extrude_factor,
            },
        );
        Ok(())
    }

    pub fn cmd_restore_gcode_state(&mut self, cmd: &GCodeCommand) -> Result<(), GCodeError> {
        let state_name = cmd.get_or("NAME", "default");
        let state = match self.saved_states.get(state_name) {
            Some(state) => state.clone(),
            None => return Err(GCodeError::UnknownState(String::from(state_name))),
        };
        self.absolute_coord = state.absolute_coord;
        self.absolute_extrude = state.absolute_extrude;
        self.base_position = state.base_position.clone();
        self.homing_position = state.homing_position.clone();
        self.speed = state.speed;
        self.speed_factor = state.speed_factor;
        self.extrude_factor = state.extrude_factor;
        // preserve the relative extruder displacement accumulated since
        // the save by folding it into the base offset
        let e_index = self.axis_map.e_index();
        if self.relative_e_restore {
            let e_diff = self.last_position[e_index] - state.last_position[e_index];
            self.base_position[e_index] += e_diff;
        }
        // move the toolhead back if requested
        if cmd.get_int_or("MOVE", 0)? != 0 {
            let speed = cmd.get_float_above("MOVE_SPEED", self.speed, 0.)?;
            self.last_position[..e_index].copy_from_slice(&state.last_position[..e_index]);
            let newpos = self.last_position.clone();
            self.move_with_transform(&newpos, speed)?;
        }
        Ok(())
    }

    pub fn cmd_get_position(&self, _cmd: &GCodeCommand) -> Result<String, GCodeError> {
        let kins = self.toolhead.kinematics();
        let mut mcu_pos_list = Vec::new();
        let mut stepper_pos_list = Vec::new();
        let mut kin_pos_list = Vec::new();
        for kin in kins.iter() {
            let steppers = kin.get_steppers();
            mcu_pos_list.push(
                steppers
                    .iter()
                    .map(|s| format!("{}:{}", s.name(), s.get_mcu_position()))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            let cinfo: Vec<(String, f64)> = steppers
                .iter()
                .map(|s| (String::from(s.name()), s.get_commanded_position()))
                .collect();
            stepper_pos_list.push(
                cinfo
                    .iter()
                    .map(|(name, pos)| format!("{}:{:.6}", name, pos))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            let spos: HashMap<String, f64> = cinfo.into_iter().collect();
            kin_pos_list.push(
                kin.axis_names()
                    .chars()
                    .zip(kin.calc_position(&spos))
                    .map(|(letter, pos)| format!("{}:{:.6}", letter, pos))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
        let letters: Vec<char> = self
            .axis_map
            .names()
            .chars()
            .chain(std::iter::once('E'))
            .collect();
        let fmt_axes = |coords: &[f64]| {
            letters
                .iter()
                .filter_map(|letter| {
                    self.axis_map
                        .index(*letter)
                        .map(|index| format!("{}:{:.6}", letter, coords[index]))
                })
                .collect::<Vec<_>>()
                .join(" ")
        };
        let toolhead_coords = self.toolhead.get_position();
        Ok(format!(
            "mcu: {}\nstepper: {}\nkinematic: {}\ntoolhead: {}\ngcode: {}\ngcode base: {}\ngcode homing: {}",
            mcu_pos_list.join(" "),
            stepper_pos_list.join(" "),
            kin_pos_list.join(" "),
            fmt_axes(&toolhead_coords),
            fmt_axes(&self.last_position),
            fmt_axes(&self.base_position),
            fmt_axes(&self.homing_position),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exec::dispatch, testutil};
    use std::sync::Mutex;

    fn parse(line: &str) -> GCodeCommand {
        GCodeCommand::parse(line).unwrap().unwrap()
    }

    #[test]
    fn relative_and_absolute_moves() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G91").unwrap();
        dispatch(&rig, "G1 X10 Y5 F600").unwrap();
        {
            let gm = rig.gcode_move.lock().unwrap();
            assert!(!gm.absolute_coord());
            assert!((gm.speed() - 10.).abs() < 1e-9);
            assert_eq!(gm.last_position(), &[10., 5., 0., 0.]);
        }
        let (target, speed) = rig.toolhead.last_move().unwrap();
        assert_eq!(target, vec![10., 5., 0., 0.]);
        assert!((speed - 10.).abs() < 1e-9);
        dispatch(&rig, "G90").unwrap();
        dispatch(&rig, "G1 X20").unwrap();
        assert_eq!(rig.gcode_move.lock().unwrap().last_position()[0], 20.);
    }

    #[test]
    fn g92_offsets_reported_positions() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G91").unwrap();
        dispatch(&rig, "G1 X10 Y5 F600").unwrap();
        dispatch(&rig, "G92 X0").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        assert_eq!(gm.base_position(), &[10., 0., 0., 0.]);
        assert_eq!(gm.last_position(), &[10., 5., 0., 0.]);
        let report = gm.cmd_m114(&parse("M114")).unwrap();
        assert_eq!(report, "X:0.000 Y:5.000 Z:0.000 E:0.000");
    }

    #[test]
    fn g92_without_axes_zeroes_all_offsets() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 X12 Y3 F600").unwrap();
        dispatch(&rig, "G92").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        assert_eq!(gm.base_position(), gm.last_position());
        let report = gm.cmd_m114(&parse("M114")).unwrap();
        assert_eq!(report, "X:0.000 Y:0.000 Z:0.000 E:0.000");
    }

    #[test]
    fn invalid_feed_rate_is_rejected() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        let err = dispatch(&rig, "G1 X1 F0").unwrap_err();
        assert!(err.contains("Invalid speed"), "{}", err);
    }

    #[test]
    fn unconfigured_axis_is_rejected() {
        let rig = testutil::rig_from(testutil::PARTIAL_CONFIG);
        let err = dispatch(&rig, "G1 B5 F600").unwrap_err();
        assert!(err.contains("must configure the B axis"), "{}", err);
        // letters outside the mapped triplets are ignored entirely
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 U5 F600").unwrap();
    }

    #[test]
    fn inches_are_rejected_millimeters_accepted() {
        let rig = testutil::zero_rig();
        let err = dispatch(&rig, "G20").unwrap_err();
        assert!(err.contains("does not support G20"), "{}", err);
        dispatch(&rig, "G21").unwrap();
    }

    #[test]
    fn m220_preserves_f_space_speed() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 F600").unwrap();
        assert!((rig.gcode_move.lock().unwrap().speed() - 10.).abs() < 1e-9);
        dispatch(&rig, "M220 S200").unwrap();
        {
            let gm = rig.gcode_move.lock().unwrap();
            assert!((gm.speed() - 20.).abs() < 1e-9);
            let status = gm.get_status();
            assert!((status.speed_factor - 2.).abs() < 1e-9);
            assert!((status.speed - 600.).abs() < 1e-9);
        }
        dispatch(&rig, "M220 S50").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        assert!((gm.speed() - 5.).abs() < 1e-9);
        assert!((gm.get_status().speed - 600.).abs() < 1e-9);
    }

    #[test]
    fn m221_preserves_reported_e_coordinate() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 E5 F300").unwrap();
        dispatch(&rig, "M221 S50").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        assert_eq!(gm.extrude_factor(), 0.5);
        let status = gm.get_status();
        assert!((status.gcode_position[3] - 5.).abs() < 1e-9);
    }

    #[test]
    fn m221_scales_subsequent_extrusion() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "M221 S50").unwrap();
        dispatch(&rig, "G1 E6 F300").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        // machine E moved half the commanded distance
        assert!((gm.last_position()[3] - 3.).abs() < 1e-9);
        assert!((gm.get_status().gcode_position[3] - 6.).abs() < 1e-9);
    }

    #[test]
    fn save_and_restore_round_trips_all_state() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G91").unwrap();
        dispatch(&rig, "M83").unwrap();
        dispatch(&rig, "M220 S200").unwrap();
        dispatch(&rig, "M221 S50").unwrap();
        dispatch(&rig, "SAVE_GCODE_STATE NAME=snap").unwrap();
        dispatch(&rig, "G90").unwrap();
        dispatch(&rig, "M82").unwrap();
        dispatch(&rig, "M220 S100").unwrap();
        dispatch(&rig, "M221 S100").unwrap();
        dispatch(&rig, "RESTORE_GCODE_STATE NAME=snap").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        assert!(!gm.absolute_coord());
        assert!(!gm.absolute_extrude());
        assert_eq!(gm.extrude_factor(), 0.5);
        assert!((gm.get_status().speed_factor - 2.).abs() < 1e-9);
    }

    #[test]
    fn restore_unknown_state_fails() {
        let rig = testutil::zero_rig();
        let err = dispatch(&rig, "RESTORE_GCODE_STATE NAME=nope").unwrap_err();
        assert!(err.contains("Unknown g-code state: nope"), "{}", err);
    }

    #[test]
    fn restore_preserves_relative_e_displacement() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 E2 F300").unwrap();
        dispatch(&rig, "SAVE_GCODE_STATE").unwrap();
        dispatch(&rig, "G1 E5").unwrap();
        dispatch(&rig, "RESTORE_GCODE_STATE").unwrap();
        let gm = rig.gcode_move.lock().unwrap();
        // the machine E kept its ground, the reported E matches the save
        assert!((gm.last_position()[3] - 5.).abs() < 1e-9);
        assert!((gm.get_status().gcode_position[3] - 2.).abs() < 1e-9);
    }

    #[test]
    fn restore_move_returns_to_saved_position() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "G1 X10 Y10 F600").unwrap();
        dispatch(&rig, "SAVE_GCODE_STATE").unwrap();
        dispatch(&rig, "G1 X50 Y20").unwrap();
        dispatch(&rig, "RESTORE_GCODE_STATE MOVE=1 MOVE_SPEED=30").unwrap();
        let (target, speed) = rig.toolhead.last_move().unwrap();
        assert_eq!(&target[..3], &[10., 10., 0.]);
        assert_eq!(speed, 30.);
        assert_eq!(&rig.gcode_move.lock().unwrap().last_position()[..3], &[10., 10., 0.]);
    }

    #[test]
    fn set_gcode_offset_adjusts_base_and_origin() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        dispatch(&rig, "SET_GCODE_OFFSET X=5").unwrap();
        {
            let gm = rig.gcode_move.lock().unwrap();
            assert_eq!(gm.base_position()[0], 5.);
            assert_eq!(gm.get_status().homing_origin[0], 5.);
        }
        dispatch(&rig, "SET_GCODE_OFFSET X_ADJUST=-2").unwrap();
        {
            let gm = rig.gcode_move.lock().unwrap();
            assert_eq!(gm.base_position()[0], 3.);
            assert_eq!(gm.get_status().homing_origin[0], 3.);
        }
        dispatch(&rig, "SET_GCODE_OFFSET Y=1 MOVE=1 MOVE_SPEED=40").unwrap();
        let (target, speed) = rig.toolhead.last_move().unwrap();
        assert_eq!(target[1], 1.);
        assert_eq!(speed, 40.);
    }

    #[test]
    fn homing_applies_homing_origin_to_base() {
        let rig = testutil::zero_rig();
        dispatch(&rig, "SET_GCODE_OFFSET X=5").unwrap();
        testutil::home_zero(&rig);
        let gm = rig.gcode_move.lock().unwrap();
        assert_eq!(gm.base_position()[0], 5.);
        assert_eq!(gm.last_position()[0], 0.);
    }

    struct ShiftTransform {
        toolhead: Arc<dyn Toolhead>,
        calls: Mutex<Vec<(Vec<f64>, f64)>>,
    }

    impl MoveTransform for ShiftTransform {
        fn move_to(&self, newpos: &[f64], speed: f64) -> Result<(), MoveError> {
            self.calls.lock().unwrap().push((newpos.to_vec(), speed));
            let mut shifted = newpos.to_vec();
            shifted[2] += 0.1;
            self.toolhead.move_to(&shifted, speed)
        }

        fn get_position(&self) -> Vec<f64> {
            let mut pos = self.toolhead.get_position();
            pos[2] -= 0.1;
            pos
        }
    }

    #[test]
    fn transform_chain_routes_moves() {
        let rig = testutil::zero_rig();
        testutil::home_zero(&rig);
        let transform = Arc::new(ShiftTransform {
            toolhead: rig.toolhead.clone(),
            calls: Mutex::new(Vec::new()),
        });
        {
            let mut gm = rig.gcode_move.lock().unwrap();
            let previous = gm
                .set_move_transform(transform.clone(), false)
                .unwrap();
            assert!(matches!(previous, PreviousTransform::Toolhead(_)));
            assert!(matches!(
                gm.set_move_transform(transform.clone(), false),
                Err(GCodeError::TransformAlreadySet)
            ));
            gm.set_move_transform(transform.clone(), true).unwrap();
        }
        dispatch(&rig, "G1 Z1 F300").unwrap();
        assert_eq!(transform.calls.lock().unwrap().len(), 1);
        // the toolhead saw the shifted coordinate
        assert!((rig.toolhead.get_position()[2] - 1.1).abs() < 1e-9);
        // positions read back through the transform undo the shift
        let mut gm = rig.gcode_move.lock().unwrap();
        gm.reset_last_position();
        assert!((gm.last_position()[2] - 1.).abs() < 1e-9);
    }
}
