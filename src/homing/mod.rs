//! Homing and probing: the one-shot [`HomingMove`] that correlates endstop
//! trigger times to the step history, the per-G28 [`Homing`] state, and the
//! [`PrinterHoming`] dispatch entry point.

pub mod error;

use self::error::HomingError;
use crate::{
    comms::{multi_complete, AxisMap, Event, EventBus},
    gcode::GCodeCommand,
    kinematics::Kinematics,
    log::target,
    stepper::{Endstop, Rail, Stepper, StepperEnable},
    toolhead::Toolhead,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

// This dwell used to be needed by low-power hosts so the arming
// calculations would land before the move's mcu time. Preserved.
const HOMING_START_DELAY: f64 = 0.001;
const ENDSTOP_SAMPLE_TIME: f64 = 0.000015;
const ENDSTOP_SAMPLE_COUNT: u32 = 4;

/// Tracking of one stepper's positions during a homing/probing move.
pub struct StepperPosition {
    stepper: Arc<dyn Stepper>,
    pub endstop_name: String,
    pub stepper_name: String,
    pub start_pos: i64,
    start_cmd_pos: f64,
    pub halt_pos: Option<i64>,
    pub trig_pos: Option<i64>,
}

impl StepperPosition {
    fn new(stepper: Arc<dyn Stepper>, endstop_name: String) -> Self {
        let stepper_name = String::from(stepper.name());
        let start_pos = stepper.get_mcu_position();
        let start_cmd_pos = stepper.mcu_to_commanded_position(start_pos);
        debug!(
            target: target::INTERNAL,
            "tracking stepper {} for endstop {}", stepper_name, endstop_name
        );
        Self {
            stepper,
            endstop_name,
            stepper_name,
            start_pos,
            start_cmd_pos,
            halt_pos: None,
            trig_pos: None,
        }
    }

    fn note_home_end(&mut self, trigger_time: f64) {
        self.halt_pos = Some(self.stepper.get_mcu_position());
        self.trig_pos = Some(self.stepper.get_past_mcu_position(trigger_time));
    }

    fn verify_no_probe_skew(&self) {
        let new_start_pos = self.stepper.mcu_position_at(self.start_cmd_pos);
        if new_start_pos != self.start_pos {
            warn!(
                target: target::PUBLIC,
                "Stepper '{}' position skew after probe: pos {} now {}",
                self.stepper_name,
                self.start_pos,
                new_start_pos
            );
        }
    }
}

/// One homing or probing action: arms the endstops, issues the
/// interruptible drip move and reconciles the post-trigger positions.
pub struct HomingMove {
    toolhead: Arc<dyn Toolhead>,
    bus: Arc<EventBus>,
    endstops: Vec<(Arc<dyn Endstop>, String)>,
    pub stepper_positions: Vec<StepperPosition>,
}

impl HomingMove {
    pub fn new(
        toolhead: Arc<dyn Toolhead>,
        bus: Arc<EventBus>,
        endstops: Vec<(Arc<dyn Endstop>, String)>,
    ) -> Self {
        Self {
            toolhead,
            bus,
            endstops,
            stepper_positions: Vec::new(),
        }
    }

    // time per step of the endstop's busiest stepper, used as the endstop
    // re-check interval during the move
    fn calc_endstop_rate(&self, endstop: &Arc<dyn Endstop>, movepos: &[f64], speed: f64) -> f64 {
        let startpos = self.toolhead.get_position();
        let e_index = movepos.len() - 1;
        let move_d = movepos[..e_index]
            .iter()
            .zip(startpos[..e_index].iter())
            .map(|(mp, sp)| (mp - sp) * (mp - sp))
            .sum::<f64>()
            .sqrt();
        let move_t = move_d / speed;
        let max_steps = endstop
            .get_steppers()
            .iter()
            .map(|s| {
                (s.calc_position_from_coord(&startpos) - s.calc_position_from_coord(movepos)).abs()
                    / s.step_distance()
            })
            .fold(0., f64::max);
        if max_steps <= 0. {
            return 0.001;
        }
        move_t / max_steps
    }

    // commanded position of every stepper across all kinematics plus the
    // configured extruder steppers, keyed by stepper name
    fn all_commanded_positions(&self) -> HashMap<String, f64> {
        let mut kin_spos = HashMap::new();
        for kin in self.toolhead.kinematics() {
            for stepper in kin.get_steppers() {
                kin_spos.insert(
                    String::from(stepper.name()),
                    stepper.get_commanded_position(),
                );
            }
        }
        for extruder_stepper in self.toolhead.extruder_steppers() {
            for stepper in extruder_stepper.rail().get_steppers() {
                kin_spos.insert(
                    String::from(stepper.name()),
                    stepper.get_commanded_position(),
                );
            }
        }
        kin_spos
    }

    /// New toolhead position vector from per-stepper commanded positions
    /// plus per-stepper step offsets.
    pub fn calc_toolhead_pos(
        &self,
        kin_spos: &HashMap<String, f64>,
        offsets: &HashMap<String, i64>,
    ) -> Vec<f64> {
        let mut spos = kin_spos.clone();
        for kin in self.toolhead.kinematics() {
            for stepper in kin.get_steppers() {
                if let Some(pos) = spos.get_mut(stepper.name()) {
                    *pos += offsets.get(stepper.name()).copied().unwrap_or(0) as f64
                        * stepper.step_distance();
                }
            }
        }
        for extruder_stepper in self.toolhead.extruder_steppers() {
            for stepper in extruder_stepper.rail().get_steppers() {
                if let Some(pos) = spos.get_mut(stepper.name()) {
                    *pos += offsets.get(stepper.name()).copied().unwrap_or(0) as f64
                        * stepper.step_distance();
                }
            }
        }
        // start from the current toolhead vector so slots no rail owns
        // (and the E slot when there is no extruder) keep their coordinates
        let mut result = self.toolhead.get_position();
        for kin in self.toolhead.kinematics() {
            let kin_pos = kin.calc_position(&spos);
            for (i, axis) in kin.axes().iter().enumerate() {
                result[*axis] = kin_pos[i];
            }
        }
        // the extruder has no geometric transform, its contribution is a
        // direct read of the stepper's adjusted commanded position
        if let Some(extruder) = self.toolhead.active_extruder() {
            let e_index = result.len() - 1;
            if let Some(pos) = spos.get(extruder.stepper().name()) {
                result[e_index] = *pos;
            }
        }
        debug!(target: target::INTERNAL, "calc_toolhead_pos result={:?}", result);
        result
    }

    pub fn homing_move(
        &mut self,
        movepos: &[f64],
        speed: f64,
        probe_pos: bool,
        triggered: bool,
        check_triggered: bool,
    ) -> Result<Vec<f64>, HomingError> {
        self.bus.publish(Event::HomingMoveBegin);

        // note start location; the flush guarantees the step history is
        // complete before the move is issued
        self.toolhead.flush_step_generation();
        let kin_spos = self.all_commanded_positions();
        self.stepper_positions = self
            .endstops
            .iter()
            .flat_map(|(endstop, name)| {
                endstop
                    .get_steppers()
                    .into_iter()
                    .map(|s| StepperPosition::new(s, name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        // start endstop checking
        let print_time = self.toolhead.get_last_move_time();
        let mut endstop_triggers = Vec::new();
        for (endstop, _name) in self.endstops.iter() {
            let rest_time = self.calc_endstop_rate(endstop, movepos, speed);
            endstop_triggers.push(endstop.home_start(
                print_time,
                ENDSTOP_SAMPLE_TIME,
                ENDSTOP_SAMPLE_COUNT,
                rest_time,
                triggered,
            ));
        }
        let all_endstop_trigger = multi_complete(endstop_triggers);
        self.toolhead.dwell(HOMING_START_DELAY);

        // issue the interruptible move
        let mut error = None;
        if let Err(e) = self.toolhead.drip_move(movepos, speed, &all_endstop_trigger) {
            error = Some(HomingError::MoveFailed(e.to_string()));
        }

        // wait for endstops to trigger
        let mut trigger_times: HashMap<String, f64> = HashMap::new();
        let move_end_print_time = self.toolhead.get_last_move_time();
        for (endstop, name) in self.endstops.iter() {
            match endstop.home_wait(move_end_print_time) {
                Err(e) => {
                    if error.is_none() {
                        error = Some(HomingError::EndstopWait(name.clone(), e.to_string()));
                    }
                }
                Ok(trigger_time) if trigger_time > 0. => {
                    trigger_times.insert(name.clone(), trigger_time);
                }
                Ok(_) => {
                    // a zero means the endstop did not trigger during the move
                    if check_triggered && error.is_none() {
                        error = Some(HomingError::NoTrigger(name.clone()));
                    }
                }
            }
        }

        // determine stepper halt positions
        self.toolhead.flush_step_generation();
        for sp in self.stepper_positions.iter_mut() {
            let trigger_time = trigger_times
                .get(&sp.endstop_name)
                .copied()
                .unwrap_or(move_end_print_time);
            sp.note_home_end(trigger_time);
        }

        let trigpos;
        if probe_pos {
            let halt_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| (sp.stepper_name.clone(), sp.halt_pos.unwrap() - sp.start_pos))
                .collect();
            let trig_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| (sp.stepper_name.clone(), sp.trig_pos.unwrap() - sp.start_pos))
                .collect();
            trigpos = self.calc_toolhead_pos(&kin_spos, &trig_steps);
            let haltpos = if trig_steps != halt_steps {
                self.calc_toolhead_pos(&kin_spos, &halt_steps)
            } else {
                trigpos.clone()
            };
            self.toolhead.set_position(&haltpos, &[]);
            for sp in self.stepper_positions.iter() {
                sp.verify_no_probe_skew();
            }
        } else {
            trigpos = movepos.to_vec();
            let over_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| (sp.stepper_name.clone(), sp.halt_pos.unwrap() - sp.trig_pos.unwrap()))
                .collect();
            let haltpos = if over_steps.values().any(|v| *v != 0) {
                // provisionally adopt the target, then correct for the
                // steps traveled past the trigger
                self.toolhead.set_position(movepos, &[]);
                let halt_kin_spos = self.all_commanded_positions();
                self.calc_toolhead_pos(&halt_kin_spos, &over_steps)
            } else {
                movepos.to_vec()
            };
            self.toolhead.set_position(&haltpos, &[]);
        }

        self.bus.publish(Event::HomingMoveEnd);

        if let Some(error) = error {
            return Err(error);
        }
        Ok(trigpos)
    }

    /// Detects a homing/probing move that never actually moved (endstop
    /// already triggered or stuck). Returns the offending endstop's name.
    pub fn check_no_movement(&self, axes: Option<&[String]>) -> Option<String> {
        if self.toolhead.replayed_input() {
            return None;
        }
        match axes {
            None => {
                let moved = self
                    .stepper_positions
                    .iter()
                    .any(|sp| Some(sp.start_pos) != sp.trig_pos);
                if !moved {
                    return self
                        .stepper_positions
                        .first()
                        .map(|sp| sp.endstop_name.clone());
                }
                None
            }
            Some(axes) => {
                for sp in self.stepper_positions.iter() {
                    if Some(sp.start_pos) != sp.trig_pos {
                        continue;
                    }
                    let name = sp.stepper_name.to_ascii_lowercase();
                    if name.starts_with("extruder") {
                        if axes.iter().any(|axis| axis.eq_ignore_ascii_case(&name)) {
                            return Some(sp.endstop_name.clone());
                        }
                    } else if axes.iter().any(|axis| {
                        axis.len() == 1
                            && "xyzabc".contains(axis.as_str())
                            && name.contains(axis.as_str())
                    }) {
                        return Some(sp.endstop_name.clone());
                    }
                }
                None
            }
        }
    }
}

/// State tracking of one G28 invocation.
pub struct Homing {
    toolhead: Arc<dyn Toolhead>,
    bus: Arc<EventBus>,
    changed_axes: Vec<usize>,
    trigger_mcu_pos: HashMap<String, i64>,
    adjust_pos: HashMap<String, f64>,
}

impl Homing {
    pub fn new(toolhead: Arc<dyn Toolhead>, bus: Arc<EventBus>) -> Self {
        Self {
            toolhead,
            bus,
            changed_axes: Vec::new(),
            trigger_mcu_pos: HashMap::new(),
            adjust_pos: HashMap::new(),
        }
    }

    pub fn set_axes(&mut self, axes: Vec<usize>) {
        self.changed_axes = axes;
    }

    pub fn get_axes(&self) -> &[usize] {
        &self.changed_axes
    }

    /// MCU step position of a stepper at the moment its endstop triggered
    /// during the last homing move.
    pub fn get_trigger_position(&self, stepper_name: &str) -> Option<i64> {
        self.trigger_mcu_pos.get(stepper_name).copied()
    }

    pub fn adjust_pos(&self) -> &HashMap<String, f64> {
        &self.adjust_pos
    }

    pub fn pos_length(&self) -> usize {
        self.toolhead.get_position().len()
    }

    // fill in any None entries with the current toolhead position
    fn fill_coord(&self, coord: &[Option<f64>]) -> Vec<f64> {
        let mut thcoord = self.toolhead.get_position();
        for (i, value) in coord.iter().enumerate() {
            if let Some(value) = value {
                thcoord[i] = *value;
            }
        }
        thcoord
    }

    pub fn set_homed_position(&self, pos: &[Option<f64>]) {
        self.toolhead.set_position(&self.fill_coord(pos), &[]);
    }

    /// Homes one axis group: forces the start position, performs the
    /// homing move (twice when a retract distance is configured) and
    /// reconciles the final position.
    pub fn home_rails(
        &mut self,
        rails: &[Arc<Rail>],
        forcepos: Vec<Option<f64>>,
        movepos: Vec<Option<f64>>,
    ) -> Result<(), HomingError> {
        info!(
            target: target::INTERNAL,
            "homing begins with forcepos={:?} movepos={:?}", forcepos, movepos
        );
        let force_axes: Vec<usize> = forcepos
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|_| i))
            .collect();
        let rail_names: Vec<String> = rails.iter().map(|r| String::from(r.get_name())).collect();
        // notify of the upcoming homing operation before any position is
        // forced
        self.bus.publish(Event::HomeRailsBegin {
            axes: force_axes.clone(),
            rails: rail_names.clone(),
        });

        // alter the kinematics to think the printer is at forcepos
        let startpos = self.fill_coord(&forcepos);
        let homepos = self.fill_coord(&movepos);
        self.toolhead.set_position(&startpos, &force_axes);

        // perform first home
        let endstops: Vec<_> = rails
            .iter()
            .flat_map(|rail| rail.get_endstops().to_vec())
            .collect();
        let hi = rails[0].get_homing_info();
        let mut hmove = HomingMove::new(
            Arc::clone(&self.toolhead),
            Arc::clone(&self.bus),
            endstops.clone(),
        );
        hmove.homing_move(&homepos, hi.speed, false, true, true)?;

        // perform second home
        if hi.retract_dist > 0. {
            // retract by backing off along the homing vector
            let startpos = self.fill_coord(&forcepos);
            let homepos = self.fill_coord(&movepos);
            let axes_d: Vec<f64> = homepos
                .iter()
                .zip(startpos.iter())
                .map(|(hp, sp)| hp - sp)
                .collect();
            // all coordinates count here, an extruder homes along E alone
            let move_d = axes_d.iter().map(|d| d * d).sum::<f64>().sqrt();
            let retract_r = (hi.retract_dist / move_d).min(1.);
            let retractpos: Vec<f64> = homepos
                .iter()
                .zip(axes_d.iter())
                .map(|(hp, ad)| hp - ad * retract_r)
                .collect();
            self.toolhead.move_to(&retractpos, hi.retract_speed)?;

            // home again
            let startpos: Vec<f64> = retractpos
                .iter()
                .zip(axes_d.iter())
                .map(|(rp, ad)| rp - ad * retract_r)
                .collect();
            self.toolhead.set_position(&startpos, &[]);
            hmove = HomingMove::new(
                Arc::clone(&self.toolhead),
                Arc::clone(&self.bus),
                endstops,
            );
            hmove.homing_move(&homepos, hi.second_homing_speed, false, true, true)?;

            // the endstop should have deactivated during the retract
            if let Some(endstop_name) = hmove.check_no_movement(None) {
                return Err(HomingError::StillTriggered(endstop_name));
            }
        }

        // signal home operation complete
        self.toolhead.flush_step_generation();
        self.trigger_mcu_pos = hmove
            .stepper_positions
            .iter()
            .map(|sp| (sp.stepper_name.clone(), sp.trig_pos.unwrap()))
            .collect();
        let adjust_pos = Arc::new(Mutex::new(HashMap::new()));
        self.bus.publish(Event::HomeRailsEnd {
            axes: force_axes.clone(),
            rails: rail_names,
            adjust_pos: Arc::clone(&adjust_pos),
        });
        self.adjust_pos = adjust_pos.lock().unwrap().clone();
        if self.adjust_pos.values().any(|v| *v != 0.) {
            // apply the homing offsets requested by the event handlers,
            // on the homed axes only
            let mut homepos = self.toolhead.get_position();
            let mut kin_spos = HashMap::new();
            for kin in self.toolhead.kinematics() {
                for stepper in kin.get_steppers() {
                    kin_spos.insert(
                        String::from(stepper.name()),
                        stepper.get_commanded_position()
                            + self.adjust_pos.get(stepper.name()).copied().unwrap_or(0.),
                    );
                }
                let kin_pos = kin.calc_position(&kin_spos);
                for (i, axis) in kin.axes().iter().enumerate() {
                    if force_axes.contains(axis) {
                        homepos[*axis] = kin_pos[i];
                    }
                }
            }
            self.toolhead.set_position(&homepos, &[]);
        }
        info!(target: target::PUBLIC, "homing of {:?} finished", force_axes);
        Ok(())
    }
}

/// G28 dispatch and the probing/manual-homing entry points.
pub struct PrinterHoming {
    toolhead: Arc<dyn Toolhead>,
    bus: Arc<EventBus>,
    stepper_enable: Arc<dyn StepperEnable>,
    axis_map: AxisMap,
}

impl PrinterHoming {
    pub fn new(
        toolhead: Arc<dyn Toolhead>,
        bus: Arc<EventBus>,
        stepper_enable: Arc<dyn StepperEnable>,
        axis_map: AxisMap,
    ) -> Self {
        Self {
            toolhead,
            bus,
            stepper_enable,
            axis_map,
        }
    }

    pub fn cmd_g28(&self, cmd: &GCodeCommand) -> Result<(), HomingError> {
        let e_index = self.axis_map.e_index();
        let mut axes: Vec<usize> = Vec::new();
        for (letter, pos) in self.axis_map.iter() {
            if cmd.get(&letter.to_string()).is_none() {
                continue;
            }
            if letter == 'E' {
                match self.toolhead.active_extruder() {
                    Some(extruder) if extruder.can_home() => axes.push(pos),
                    _ => return Err(HomingError::ExtruderNotHomeable),
                }
            } else {
                if !self.axis_map.is_configured(letter) {
                    return Err(HomingError::UnconfiguredAxis(letter));
                }
                axes.push(pos);
            }
        }
        if axes.is_empty() {
            // home the entire active axis set, plus the extruder when the
            // active extruder declares it can home
            for kin in self.toolhead.kinematics() {
                axes.extend(kin.axes().iter().copied());
            }
            if let Some(extruder) = self.toolhead.active_extruder() {
                if extruder.can_home() {
                    axes.push(e_index);
                }
            }
        }
        debug!(target: target::INTERNAL, "G28 homing axes {:?}", axes);
        let home_e = axes.contains(&e_index);

        let mut homing_state = Homing::new(Arc::clone(&self.toolhead), Arc::clone(&self.bus));
        homing_state.set_axes(axes.clone());
        let result = self.home_requested(&mut homing_state, &axes, home_e);
        if let Err(error) = result {
            self.stepper_enable.motor_off();
            if self.toolhead.is_shutdown() {
                return Err(HomingError::Shutdown);
            }
            return Err(error);
        }
        Ok(())
    }

    fn home_requested(
        &self,
        homing_state: &mut Homing,
        axes: &[usize],
        home_e: bool,
    ) -> Result<(), HomingError> {
        for kin in self.toolhead.kinematics() {
            if kin.axes().iter().any(|a| axes.contains(a)) {
                kin.home(homing_state)?;
            }
        }
        if home_e {
            self.home_extruder(homing_state)?;
        }
        Ok(())
    }

    // the extruder has a single rail, homed the same way a kinematic axis
    // would be
    fn home_extruder(&self, homing_state: &mut Homing) -> Result<(), HomingError> {
        let extruder = match self.toolhead.active_extruder() {
            Some(extruder) if extruder.can_home() => extruder,
            _ => return Err(HomingError::ExtruderNotHomeable),
        };
        let rail = Arc::clone(extruder.stepper().rail());
        let (position_min, position_max) = rail.get_range();
        let hi = rail.get_homing_info();
        let e_index = self.axis_map.e_index();
        let mut homepos = vec![None; self.axis_map.pos_length()];
        homepos[e_index] = Some(hi.position_endstop);
        let mut forcepos = homepos.clone();
        if hi.positive_dir {
            forcepos[e_index] =
                Some(hi.position_endstop - 1.5 * (hi.position_endstop - position_min));
        } else {
            forcepos[e_index] =
                Some(hi.position_endstop + 1.5 * (position_max - hi.position_endstop));
        }
        homing_state.home_rails(&[rail], forcepos, homepos)
    }

    /// Single-endstop probing move; the toolhead position is corrected to
    /// the exact trigger point and returned.
    pub fn probing_move(
        &self,
        mcu_probe: Arc<dyn Endstop>,
        pos: &[f64],
        speed: f64,
        check_triggered: bool,
        triggered: bool,
        probe_axes: Option<&[String]>,
    ) -> Result<Vec<f64>, HomingError> {
        let endstops = vec![(mcu_probe, String::from("probe"))];
        let mut hmove = HomingMove::new(Arc::clone(&self.toolhead), Arc::clone(&self.bus), endstops);
        let epos = match hmove.homing_move(pos, speed, true, triggered, check_triggered) {
            Ok(epos) => epos,
            Err(_) if self.toolhead.is_shutdown() => return Err(HomingError::ProbingShutdown),
            Err(error) => return Err(error),
        };
        if hmove.check_no_movement(probe_axes).is_some() {
            return Err(HomingError::ProbeTriggeredPriorToMovement);
        }
        Ok(epos)
    }

    pub fn manual_home(
        &self,
        endstops: Vec<(Arc<dyn Endstop>, String)>,
        pos: &[f64],
        speed: f64,
        triggered: bool,
        check_triggered: bool,
    ) -> Result<(), HomingError> {
        let mut hmove = HomingMove::new(Arc::clone(&self.toolhead), Arc::clone(&self.bus), endstops);
        match hmove.homing_move(pos, speed, false, triggered, check_triggered) {
            Ok(_) => Ok(()),
            Err(_) if self.toolhead.is_shutdown() => Err(HomingError::Shutdown),
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        exec::dispatch, kinematics::Kinematics, testutil, toolhead::Toolhead,
    };

    #[test]
    fn missing_trigger_reports_no_trigger_error() {
        let rig = testutil::base_rig();
        let err = dispatch(&rig, "G28 X").unwrap_err();
        assert!(
            err.contains("No trigger on stepper_x after full movement"),
            "{}",
            err
        );
    }

    #[test]
    fn stuck_endstop_fails_after_retract() {
        let rig = testutil::base_rig();
        rig.endstops[&'X'].set_stuck_triggered(true);
        let err = dispatch(&rig, "G28 X").unwrap_err();
        assert!(
            err.contains("Endstop stepper_x still triggered after retract"),
            "{}",
            err
        );
    }

    #[test]
    fn endstop_failure_is_collected_per_endstop() {
        let rig = testutil::base_rig();
        rig.endstops[&'X'].set_fail(Some(String::from("timeout")));
        let err = dispatch(&rig, "G28 X").unwrap_err();
        assert!(err.contains("Error during homing stepper_x"), "{}", err);
    }

    #[test]
    fn homing_unconfigured_axis_fails() {
        let rig = testutil::rig_from(testutil::PARTIAL_CONFIG);
        let err = dispatch(&rig, "G28 B").unwrap_err();
        assert!(err.contains("must configure the B axis"), "{}", err);
    }

    #[test]
    fn g28_without_axes_homes_the_active_set() {
        let rig = testutil::base_rig();
        testutil::home_base(&rig);
        let kins = rig.toolhead.kinematics();
        assert_eq!(kins[0].get_status().homed_axes, "xyz");
        // the extruder has no endstop here, it stays out of the homing
        let extruder = rig.toolhead.active_extruder().unwrap();
        assert_eq!(extruder.get_status().homed_axes, "");
    }

    #[test]
    fn g28_e_without_endstop_is_rejected() {
        let rig = testutil::base_rig();
        let err = dispatch(&rig, "G28 E").unwrap_err();
        assert!(err.contains("not home-able"), "{}", err);
    }

    #[test]
    fn abc_axes_home_like_the_primary_triplet() {
        let rig = testutil::rig_from(testutil::ABC_CONFIG);
        rig.endstops[&'A'].set_trigger_pos(0.);
        dispatch(&rig, "G28 A").unwrap();
        let kins = rig.toolhead.kinematics();
        assert_eq!(kins[1].get_status().homed_axes, "a");
        assert_eq!(kins[0].get_status().homed_axes, "");
        assert!((rig.toolhead.get_position()[3] - 0.).abs() < 1e-9);
    }

    #[test]
    fn overshoot_correction_with_partial_secondary_group() {
        let rig = testutil::rig_from(testutil::PARTIAL_CONFIG);
        for letter in ['X', 'Y', 'Z'] {
            rig.endstops[&letter].set_trigger_pos(0.);
        }
        dispatch(&rig, "G28 X Y Z").unwrap();
        dispatch(&rig, "G1 E2 F300").unwrap();
        // park a coordinate in the unconfigured B slot; the correction
        // must not touch slots no rail owns
        let mut parked = rig.toolhead.get_position();
        parked[4] = 1.25;
        rig.toolhead.set_position(&parked, &[]);

        rig.endstops[&'A'].set_trigger_pos(0.5);
        rig.endstops[&'A'].set_overshoot_steps(10);
        dispatch(&rig, "G28 A").unwrap();

        let pos = rig.toolhead.get_position();
        assert_eq!(pos.len(), 7);
        // 10 steps of 0.005 past the declared endstop position
        assert!((pos[3] - -0.05).abs() < 1e-6, "pos was {:?}", pos);
        assert!((pos[4] - 1.25).abs() < 1e-9, "pos was {:?}", pos);
        assert!((pos[6] - 2.).abs() < 1e-9, "pos was {:?}", pos);
        assert!((rig.gcode_move.lock().unwrap().last_position()[6] - 2.).abs() < 1e-9);
    }

    #[test]
    fn homeable_extruder_homes_through_home_rails() {
        let rig = testutil::rig_from(testutil::E_HOME_CONFIG);
        rig.endstops[&'E'].set_trigger_pos(0.);
        dispatch(&rig, "G28 E").unwrap();
        let extruder = rig.toolhead.active_extruder().unwrap();
        assert_eq!(extruder.stepper().limits(), (0., 100.));
        let pos = rig.toolhead.get_position();
        assert!((pos[3] - 0.).abs() < 1e-9);
        // the frontend re-read the position when homing ended
        assert!((rig.gcode_move.lock().unwrap().last_position()[3] - 0.).abs() < 1e-9);
    }
}
