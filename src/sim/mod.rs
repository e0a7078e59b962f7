//! Simulated motion hardware: steppers with a queryable step history,
//! scriptable endstops and a drip-capable toolhead. Stands in for the real
//! planner/MCU stack behind the [`Toolhead`]/[`Stepper`]/[`Endstop`]
//! traits, both for the dev binary and for the tests.

use crate::{
    comms::{Completion, Event, EventBus},
    kinematics::{
        extruder::{ExtruderStepper, PrinterExtruder},
        Kinematics,
    },
    log::target,
    stepper::{Endstop, Stepper, StepperEnable},
    toolhead::{Move, MoveError, Toolhead},
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

struct StepperState {
    mcu_pos: i64,
    // commanded = offset + mcu_pos * step_distance
    offset: f64,
    history: Vec<(f64, i64)>,
}

/// A stepper whose "MCU" is a step counter plus a (print_time, position)
/// history, advanced analytically by the sim toolhead.
pub struct SimStepper {
    name: String,
    axis: usize,
    step_distance: f64,
    state: Mutex<StepperState>,
}

impl SimStepper {
    pub fn new(name: String, axis: usize, step_distance: f64) -> Arc<Self> {
        Arc::new(Self {
            name,
            axis,
            step_distance,
            state: Mutex::new(StepperState {
                mcu_pos: 0,
                offset: 0.,
                history: vec![(0., 0)],
            }),
        })
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    // step the motor so its commanded position is `commanded` at `time`
    fn advance_to(&self, commanded: f64, time: f64) {
        let mut state = self.state.lock().unwrap();
        let steps = ((commanded - state.offset) / self.step_distance).round() as i64;
        if steps != state.mcu_pos {
            state.mcu_pos = steps;
            state.history.push((time, steps));
        }
    }

    fn advance_steps(&self, delta: i64, time: f64) {
        if delta == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.mcu_pos += delta;
        let mcu_pos = state.mcu_pos;
        state.history.push((time, mcu_pos));
    }
}

impl Stepper for SimStepper {
    fn name(&self) -> &str {
        &self.name
    }

    fn step_distance(&self) -> f64 {
        self.step_distance
    }

    fn get_mcu_position(&self) -> i64 {
        self.state.lock().unwrap().mcu_pos
    }

    fn mcu_position_at(&self, commanded_pos: f64) -> i64 {
        let state = self.state.lock().unwrap();
        ((commanded_pos - state.offset) / self.step_distance).round() as i64
    }

    fn get_past_mcu_position(&self, print_time: f64) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .rev()
            .find(|(time, _)| *time <= print_time)
            .map(|(_, pos)| *pos)
            .unwrap_or(state.history[0].1)
    }

    fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64 {
        let state = self.state.lock().unwrap();
        state.offset + mcu_pos as f64 * self.step_distance
    }

    fn get_commanded_position(&self) -> f64 {
        let state = self.state.lock().unwrap();
        state.offset + state.mcu_pos as f64 * self.step_distance
    }

    fn set_position(&self, newpos: &[f64]) {
        let mut state = self.state.lock().unwrap();
        state.offset = newpos[self.axis] - state.mcu_pos as f64 * self.step_distance;
    }

    fn calc_position_from_coord(&self, coord: &[f64]) -> f64 {
        coord[self.axis]
    }
}

/// What the scripted endstop does during the next drip moves.
#[derive(Debug, Clone, Default)]
pub struct EndstopScript {
    // commanded coordinate on the endstop's axis at which it triggers
    pub trigger_pos: Option<f64>,
    // steps the motor keeps moving after the trigger
    pub overshoot_steps: i64,
    // reads as triggered before any motion (e.g. retract failed)
    pub stuck_triggered: bool,
    // communication failure reported by home_wait
    pub fail: Option<String>,
}

struct Armed {
    completion: Completion,
    trigger_time: f64,
}

pub struct SimEndstop {
    steppers: Vec<Arc<SimStepper>>,
    script: Mutex<EndstopScript>,
    armed: Mutex<Option<Armed>>,
}

impl SimEndstop {
    pub fn new(steppers: Vec<Arc<SimStepper>>) -> Arc<Self> {
        Arc::new(Self {
            steppers,
            script: Mutex::new(EndstopScript::default()),
            armed: Mutex::new(None),
        })
    }

    pub fn set_trigger_pos(&self, pos: f64) {
        self.script.lock().unwrap().trigger_pos = Some(pos);
    }

    pub fn clear_trigger_pos(&self) {
        self.script.lock().unwrap().trigger_pos = None;
    }

    pub fn set_overshoot_steps(&self, steps: i64) {
        self.script.lock().unwrap().overshoot_steps = steps;
    }

    pub fn set_stuck_triggered(&self, stuck: bool) {
        self.script.lock().unwrap().stuck_triggered = stuck;
    }

    pub fn set_fail(&self, message: Option<String>) {
        self.script.lock().unwrap().fail = message;
    }

    fn script_snapshot(&self) -> EndstopScript {
        self.script.lock().unwrap().clone()
    }

    fn is_armed(&self) -> bool {
        self.armed.lock().unwrap().is_some()
    }

    fn primary_axis(&self) -> usize {
        self.steppers[0].axis()
    }

    fn sim_steppers(&self) -> &[Arc<SimStepper>] {
        &self.steppers
    }

    fn note_trigger(&self, time: f64) {
        let mut armed = self.armed.lock().unwrap();
        if let Some(armed) = armed.as_mut() {
            armed.trigger_time = time;
            armed.completion.complete(1);
        }
    }
}

impl Endstop for SimEndstop {
    fn get_steppers(&self) -> Vec<Arc<dyn Stepper>> {
        self.steppers
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Stepper>)
            .collect()
    }

    fn home_start(
        &self,
        _print_time: f64,
        _sample_time: f64,
        _sample_count: u32,
        _rest_time: f64,
        _triggered: bool,
    ) -> Completion {
        let completion = Completion::new();
        *self.armed.lock().unwrap() = Some(Armed {
            completion: completion.clone(),
            trigger_time: 0.,
        });
        completion
    }

    fn home_wait(&self, _home_end_time: f64) -> Result<f64, MoveError> {
        let armed = self.armed.lock().unwrap().take();
        if let Some(message) = self.script.lock().unwrap().fail.clone() {
            return Err(MoveError::Endstop(message));
        }
        match armed {
            Some(armed) => Ok(armed.trigger_time),
            None => Ok(0.),
        }
    }
}

pub struct SimStepperEnable {
    bus: Arc<EventBus>,
}

impl SimStepperEnable {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self { bus })
    }
}

impl StepperEnable for SimStepperEnable {
    fn motor_off(&self) {
        info!(target: target::PUBLIC, "turning motors off");
        self.bus.publish(Event::MotorOff);
    }
}

struct ToolheadState {
    commanded_pos: Vec<f64>,
    print_time: f64,
    shutdown: bool,
    // (target, speed) per issued move, for the tests
    moves: Vec<(Vec<f64>, f64)>,
}

/// Synchronous, deterministic toolhead: moves execute instantly at a
/// constant feed rate, drip moves halt at the earliest scripted endstop
/// trigger with the scripted overshoot applied to the step history.
pub struct SimToolhead {
    bus: Arc<EventBus>,
    kins: Vec<Arc<dyn Kinematics>>,
    extruders: Vec<Arc<PrinterExtruder>>,
    active_extruder: Mutex<Option<usize>>,
    endstops: Mutex<Vec<Arc<SimEndstop>>>,
    sim_steppers: Vec<Arc<SimStepper>>,
    state: Mutex<ToolheadState>,
    max_velocity: f64,
    max_accel: f64,
}

impl SimToolhead {
    pub fn new(
        bus: Arc<EventBus>,
        pos_length: usize,
        kins: Vec<Arc<dyn Kinematics>>,
        extruders: Vec<Arc<PrinterExtruder>>,
        endstops: Vec<Arc<SimEndstop>>,
        sim_steppers: Vec<Arc<SimStepper>>,
        max_velocity: f64,
        max_accel: f64,
    ) -> Arc<Self> {
        let active_extruder = if extruders.is_empty() { None } else { Some(0) };
        Arc::new(Self {
            bus,
            kins,
            extruders,
            active_extruder: Mutex::new(active_extruder),
            endstops: Mutex::new(endstops),
            sim_steppers,
            state: Mutex::new(ToolheadState {
                commanded_pos: vec![0.; pos_length],
                print_time: 0.,
                shutdown: false,
                moves: Vec::new(),
            }),
            max_velocity,
            max_accel,
        })
    }

    pub fn set_shutdown(&self, shutdown: bool) {
        self.state.lock().unwrap().shutdown = shutdown;
    }

    /// Registers an extra endstop (e.g. a probe) with the drip scanner.
    pub fn register_endstop(&self, endstop: Arc<SimEndstop>) {
        self.endstops.lock().unwrap().push(endstop);
    }

    pub fn sim_stepper(&self, name: &str) -> Option<Arc<SimStepper>> {
        self.sim_steppers
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub fn moves(&self) -> Vec<(Vec<f64>, f64)> {
        self.state.lock().unwrap().moves.clone()
    }

    pub fn last_move(&self) -> Option<(Vec<f64>, f64)> {
        self.state.lock().unwrap().moves.last().cloned()
    }

    pub fn activate_extruder(&self, name: &str) -> Result<(), String> {
        let index = self
            .extruders
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| format!("Unknown extruder: {}", name))?;
        {
            let mut active = self.active_extruder.lock().unwrap();
            if *active == Some(index) {
                return Ok(());
            }
            *active = Some(index);
        }
        {
            let mut state = self.state.lock().unwrap();
            let e_index = state.commanded_pos.len() - 1;
            state.commanded_pos[e_index] = self.extruders[index].last_position();
        }
        self.bus.publish(Event::ActivateExtruder);
        Ok(())
    }

    fn check_move(&self, mv: &mut Move) -> Result<(), MoveError> {
        if self.is_shutdown() {
            return Err(MoveError::Shutdown);
        }
        for kin in self.kins.iter() {
            if kin.axes().iter().any(|a| mv.axes_d[*a] != 0.) {
                kin.check_move(mv)?;
            }
        }
        let e_index = mv.end_pos.len() - 1;
        if mv.axes_d[e_index] != 0. {
            match self.active_extruder() {
                Some(extruder) => extruder.check_move(mv)?,
                None => return Err(MoveError::NoExtruder),
            }
        }
        Ok(())
    }

    fn run_move(
        &self,
        newpos: &[f64],
        requested_speed: f64,
        drip: bool,
    ) -> Result<(), MoveError> {
        let startpos = self.get_position();
        let mut mv = Move::new(
            startpos.clone(),
            newpos.to_vec(),
            requested_speed.min(self.max_velocity),
            self.max_accel,
        );
        self.check_move(&mut mv)?;
        let speed = mv.speed();
        let duration = if speed > 0. && mv.move_d > 0. {
            mv.move_d / speed
        } else {
            0.
        };
        let start_time = self.state.lock().unwrap().print_time;
        let end_pos = mv.end_pos.clone();

        // earliest armed-endstop trigger along this move
        let mut trigger: Option<(f64, Arc<SimEndstop>)> = None;
        if drip {
            let endstops = self.endstops.lock().unwrap().clone();
            for endstop in endstops.iter() {
                if !endstop.is_armed() {
                    continue;
                }
                let script = endstop.script_snapshot();
                let frac = if script.stuck_triggered {
                    Some(0.)
                } else if let Some(trigger_pos) = script.trigger_pos {
                    let axis = endstop.primary_axis();
                    let start = startpos[axis];
                    let delta = end_pos[axis] - start;
                    if delta != 0. {
                        let frac = (trigger_pos - start) / delta;
                        (0. ..=1.).contains(&frac).then(|| frac)
                    } else {
                        None
                    }
                } else {
                    None
                };
                if let Some(frac) = frac {
                    if trigger.as_ref().map_or(true, |(f, _)| frac < *f) {
                        trigger = Some((frac, Arc::clone(endstop)));
                    }
                }
            }
        }

        match trigger {
            Some((frac, endstop)) => {
                let trig_time = start_time + frac * duration;
                let trig_vec: Vec<f64> = startpos
                    .iter()
                    .zip(end_pos.iter())
                    .map(|(s, e)| s + (e - s) * frac)
                    .collect();
                for stepper in self.sim_steppers.iter() {
                    let axis = stepper.axis();
                    if axis < trig_vec.len() && mv.axes_d[axis] != 0. {
                        stepper.advance_to(trig_vec[axis], trig_time);
                    }
                }
                // the endstop's motors coast past the trigger point
                let overshoot = endstop.script_snapshot().overshoot_steps;
                let mut halt_vec = trig_vec.clone();
                let mut halt_time = trig_time;
                if overshoot != 0 {
                    for stepper in endstop.sim_steppers() {
                        let axis = stepper.axis();
                        let direction = if mv.axes_d[axis] >= 0. { 1 } else { -1 };
                        halt_time =
                            trig_time + overshoot.abs() as f64 * stepper.step_distance() / speed;
                        stepper.advance_steps(direction * overshoot, halt_time);
                        halt_vec[axis] += (direction * overshoot) as f64 * stepper.step_distance();
                    }
                }
                {
                    let mut state = self.state.lock().unwrap();
                    state.print_time = halt_time;
                    state.commanded_pos = halt_vec;
                    state.moves.push((newpos.to_vec(), requested_speed));
                }
                endstop.note_trigger(trig_time);
                debug!(
                    target: target::INTERNAL,
                    "drip move interrupted at t={} (frac={})", trig_time, frac
                );
            }
            None => {
                let end_time = start_time + duration;
                for stepper in self.sim_steppers.iter() {
                    let axis = stepper.axis();
                    if axis < end_pos.len() && mv.axes_d[axis] != 0. {
                        stepper.advance_to(end_pos[axis], end_time);
                    }
                }
                let mut state = self.state.lock().unwrap();
                state.print_time = end_time;
                state.commanded_pos = end_pos;
                state.moves.push((newpos.to_vec(), requested_speed));
            }
        }

        if let Some(extruder) = self.active_extruder() {
            let pos = self.get_position();
            extruder.set_last_position(*pos.last().unwrap());
        }
        Ok(())
    }
}

impl Toolhead for SimToolhead {
    fn move_to(&self, newpos: &[f64], speed: f64) -> Result<(), MoveError> {
        self.run_move(newpos, speed, false)
    }

    fn drip_move(
        &self,
        newpos: &[f64],
        speed: f64,
        _drip_completion: &Completion,
    ) -> Result<(), MoveError> {
        self.run_move(newpos, speed, true)
    }

    fn set_position(&self, newpos: &[f64], homing_axes: &[usize]) {
        self.flush_step_generation();
        for kin in self.kins.iter() {
            kin.set_position(newpos, homing_axes);
        }
        let e_index = newpos.len() - 1;
        if let Some(extruder) = self.active_extruder() {
            extruder
                .stepper()
                .set_position(newpos, homing_axes.contains(&e_index));
            extruder.set_last_position(newpos[e_index]);
        }
        self.state.lock().unwrap().commanded_pos = newpos.to_vec();
        self.bus.publish(Event::SetPosition);
    }

    fn get_position(&self) -> Vec<f64> {
        self.state.lock().unwrap().commanded_pos.clone()
    }

    fn get_last_move_time(&self) -> f64 {
        self.state.lock().unwrap().print_time
    }

    fn flush_step_generation(&self) {
        // the sim step history is always current
    }

    fn dwell(&self, delay: f64) {
        self.state.lock().unwrap().print_time += delay;
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    fn kinematics(&self) -> Vec<Arc<dyn Kinematics>> {
        self.kins.clone()
    }

    fn extruder_steppers(&self) -> Vec<Arc<ExtruderStepper>> {
        self.extruders
            .iter()
            .map(|e| Arc::clone(e.stepper()))
            .collect()
    }

    fn active_extruder(&self) -> Option<Arc<PrinterExtruder>> {
        let active = *self.active_extruder.lock().unwrap();
        active.map(|index| Arc::clone(&self.extruders[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepper_history_answers_past_lookups() {
        let stepper = SimStepper::new(String::from("stepper_x"), 0, 0.01);
        stepper.advance_to(1., 1.);
        stepper.advance_to(2., 2.);
        assert_eq!(stepper.get_mcu_position(), 200);
        assert_eq!(stepper.get_past_mcu_position(1.), 100);
        assert_eq!(stepper.get_past_mcu_position(1.5), 100);
        assert_eq!(stepper.get_past_mcu_position(5.), 200);
        assert_eq!(stepper.get_past_mcu_position(0.), 0);
    }

    #[test]
    fn set_position_keeps_step_counter() {
        let stepper = SimStepper::new(String::from("stepper_x"), 0, 0.01);
        stepper.advance_to(1., 1.);
        let mcu = stepper.get_mcu_position();
        stepper.set_position(&[-100., 0., 0., 0.]);
        assert_eq!(stepper.get_mcu_position(), mcu);
        assert!((stepper.get_commanded_position() - -100.).abs() < 1e-9);
        assert_eq!(stepper.mcu_position_at(-100.), mcu);
    }
}
