//! Rig construction and the executor thread. The executor owns the whole
//! motion core and processes command lines sent over a channel; the
//! [`MotionCtrl`] handle is how the rest of the program (and the tests)
//! talk to it.

use crate::{
    comms::{AxisMap, ControlComms, Event, EventBus, EventKind},
    config::{Config, ConfigError},
    gcode::{error::GCodeError, GCodeCommand, GCodeMove},
    homing::PrinterHoming,
    kinematics::{
        extruder::{ExtruderStepper, PrinterExtruder},
        CartKinematics, Kinematics,
    },
    log::target,
    sim::{SimEndstop, SimStepper, SimStepperEnable, SimToolhead},
    stepper::{Endstop, HomingInfo, Rail, Stepper},
    toolhead::Toolhead,
};
use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::{
    collections::HashMap,
    mem::ManuallyDrop,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};
use tracing::debug;

/// The assembled motion core over the simulated hardware.
pub struct Rig {
    pub bus: Arc<EventBus>,
    pub toolhead: Arc<SimToolhead>,
    pub gcode_move: Arc<Mutex<GCodeMove>>,
    pub homing: PrinterHoming,
    pub axis_map: AxisMap,
    // per axis letter (plus 'E' for a home-able extruder), for scripting
    pub endstops: HashMap<char, Arc<SimEndstop>>,
}

pub fn build_rig(cfg: &Config) -> Result<Rig> {
    let bus = Arc::new(EventBus::new());
    let axis_map = cfg.axis_map()?;

    let mut sim_steppers: Vec<Arc<SimStepper>> = Vec::new();
    let mut endstops: Vec<Arc<SimEndstop>> = Vec::new();
    let mut endstop_map: HashMap<char, Arc<SimEndstop>> = HashMap::new();
    let mut rails: Vec<(char, usize, Arc<Rail>)> = Vec::new();
    for letter in axis_map.names().chars() {
        // the unwrap can't fail, configured letters are always mapped
        let index = axis_map.index(letter).unwrap();
        let stepper_cfg = cfg
            .stepper(letter)
            .ok_or(ConfigError::MissingStepper(letter))?;
        let name = format!("stepper_{}", letter.to_ascii_lowercase());
        let stepper = SimStepper::new(name.clone(), index, stepper_cfg.step_distance);
        let endstop = SimEndstop::new(vec![Arc::clone(&stepper)]);
        sim_steppers.push(Arc::clone(&stepper));
        endstops.push(Arc::clone(&endstop));
        endstop_map.insert(letter, Arc::clone(&endstop));
        let stepper_dyn: Arc<dyn Stepper> = stepper;
        let endstop_dyn: Arc<dyn Endstop> = endstop;
        let rail = Arc::new(Rail::new(
            name.clone(),
            vec![stepper_dyn],
            vec![(endstop_dyn, name)],
            HomingInfo::from(stepper_cfg),
            (stepper_cfg.position_min, stepper_cfg.position_max),
        ));
        rails.push((letter, index, rail));
    }

    // one cartesian kinematic per axis triplet
    let mut kins: Vec<Arc<dyn Kinematics>> = Vec::new();
    for group_letters in ["XYZ", "ABC"] {
        let group: Vec<&(char, usize, Arc<Rail>)> = rails
            .iter()
            .filter(|entry| group_letters.contains(entry.0))
            .collect();
        if group.is_empty() {
            continue;
        }
        let names: String = group.iter().map(|entry| entry.0).collect();
        let axes: Vec<usize> = group.iter().map(|entry| entry.1).collect();
        let group_rails: Vec<Arc<Rail>> = group.iter().map(|entry| Arc::clone(&entry.2)).collect();
        kins.push(Arc::new(CartKinematics::new(
            names,
            axes,
            group_rails,
            cfg.printer.max_z_velocity(),
            cfg.printer.max_z_accel(),
        )));
    }

    let mut extruders: Vec<Arc<PrinterExtruder>> = Vec::new();
    if let Some(extruder_cfg) = &cfg.extruder {
        let name = String::from("extruder");
        let stepper = SimStepper::new(name.clone(), axis_map.e_index(), extruder_cfg.step_distance);
        sim_steppers.push(Arc::clone(&stepper));
        let (rail_endstops, homing_info, range) = match &extruder_cfg.endstop {
            Some(endstop_cfg) => {
                let endstop = SimEndstop::new(vec![Arc::clone(&stepper)]);
                endstops.push(Arc::clone(&endstop));
                endstop_map.insert('E', Arc::clone(&endstop));
                let endstop_dyn: Arc<dyn Endstop> = endstop;
                (
                    vec![(endstop_dyn, name.clone())],
                    HomingInfo::from(endstop_cfg),
                    (endstop_cfg.position_min, endstop_cfg.position_max),
                )
            }
            None => (
                Vec::new(),
                HomingInfo {
                    speed: 0.,
                    retract_dist: 0.,
                    retract_speed: 0.,
                    second_homing_speed: 0.,
                    positive_dir: false,
                    position_endstop: 0.,
                },
                (0., 0.),
            ),
        };
        let stepper_dyn: Arc<dyn Stepper> = stepper;
        let rail = Arc::new(Rail::new(
            name.clone(),
            vec![stepper_dyn],
            rail_endstops,
            homing_info,
            range,
        ));
        let extruder = Arc::new(PrinterExtruder::new(
            name,
            extruder_cfg,
            Arc::new(ExtruderStepper::new(rail)),
            cfg.printer.max_velocity,
            cfg.printer.max_accel,
        ));
        // thermal control is an external collaborator; the simulated
        // hotend is always ready
        extruder.set_can_extrude(true);
        extruders.push(extruder);
    }

    let toolhead = SimToolhead::new(
        Arc::clone(&bus),
        axis_map.pos_length(),
        kins.clone(),
        extruders,
        endstops,
        sim_steppers,
        cfg.printer.max_velocity,
        cfg.printer.max_accel,
    );
    let toolhead_dyn: Arc<dyn Toolhead> = toolhead.clone() as Arc<dyn Toolhead>;
    let gcode_move = Arc::new(Mutex::new(GCodeMove::new(
        cfg,
        axis_map.clone(),
        Arc::clone(&toolhead_dyn),
        Arc::clone(&bus),
    )));
    let homing = PrinterHoming::new(
        Arc::clone(&toolhead_dyn),
        Arc::clone(&bus),
        SimStepperEnable::new(Arc::clone(&bus)),
        axis_map.clone(),
    );

    // wire the frontend's event handlers
    for kind in [
        EventKind::SetPosition,
        EventKind::ManualMove,
        EventKind::CommandError,
    ] {
        let gm = Arc::clone(&gcode_move);
        bus.subscribe(kind, move |_| gm.lock().unwrap().reset_last_position());
    }
    let gm = Arc::clone(&gcode_move);
    bus.subscribe(EventKind::ActivateExtruder, move |_| {
        gm.lock().unwrap().handle_activate_extruder()
    });
    let gm = Arc::clone(&gcode_move);
    bus.subscribe(EventKind::HomeRailsEnd, move |event| {
        if let Event::HomeRailsEnd { axes, .. } = event {
            gm.lock().unwrap().handle_home_rails_end(axes);
        }
    });
    let gm = Arc::clone(&gcode_move);
    bus.subscribe(EventKind::Ready, move |_| gm.lock().unwrap().handle_ready());
    let gm = Arc::clone(&gcode_move);
    bus.subscribe(EventKind::Shutdown, move |_| {
        gm.lock().unwrap().handle_shutdown()
    });
    // motor-off de-energizes everything, all axes forget their homing
    let motor_off_kins = kins.clone();
    let motor_off_extruders = toolhead.extruder_steppers();
    bus.subscribe(EventKind::MotorOff, move |_| {
        for kin in motor_off_kins.iter() {
            kin.motor_off();
        }
        for extruder_stepper in motor_off_extruders.iter() {
            extruder_stepper.motor_off();
        }
    });

    bus.publish(Event::Ready);
    Ok(Rig {
        bus,
        toolhead,
        gcode_move,
        homing,
        axis_map,
        endstops: endstop_map,
    })
}

fn status_doc(rig: &Rig) -> String {
    let gcode_status = rig.gcode_move.lock().unwrap().get_status();
    let mut doc = serde_json::json!({ "gcode_move": gcode_status });
    for kin in rig.toolhead.kinematics() {
        doc["kinematics"][kin.axis_names()] = serde_json::json!(kin.get_status());
    }
    if let Some(extruder) = rig.toolhead.active_extruder() {
        doc["extruder"] = serde_json::json!(extruder.get_status());
    }
    doc.to_string()
}

/// Routes one command line to its handler. Any command error publishes
/// `gcode:command_error` so the frontend re-reads its position.
pub fn dispatch(rig: &Rig, line: &str) -> Result<Vec<String>, String> {
    let cmd = match GCodeCommand::parse(line) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => return Ok(Vec::new()),
        Err(e) => return Err(e.to_string()),
    };
    debug!(target: target::PUBLIC, "executing {}", cmd.commandline());
    let mut output: Vec<String> = Vec::new();
    macro_rules! frontend {
        ($func:ident) => {
            rig.gcode_move
                .lock()
                .unwrap()
                .$func(&cmd)
                .map_err(|e| e.to_string())
        };
    }
    let result: Result<(), String> = match cmd.name() {
        "G0" | "G1" => frontend!(cmd_g1),
        "G20" => frontend!(cmd_g20),
        "G21" => frontend!(cmd_g21),
        "G28" => rig.homing.cmd_g28(&cmd).map_err(|e| e.to_string()),
        "G90" => frontend!(cmd_g90),
        "G91" => frontend!(cmd_g91),
        "G92" => frontend!(cmd_g92),
        "M82" => frontend!(cmd_m82),
        "M83" => frontend!(cmd_m83),
        "M220" => frontend!(cmd_m220),
        "M221" => frontend!(cmd_m221),
        "SET_GCODE_OFFSET" => frontend!(cmd_set_gcode_offset),
        "SAVE_GCODE_STATE" => frontend!(cmd_save_gcode_state),
        "RESTORE_GCODE_STATE" => frontend!(cmd_restore_gcode_state),
        "M114" => frontend!(cmd_m114).map(|msg| output.push(msg)),
        "GET_POSITION" => frontend!(cmd_get_position).map(|msg| output.push(msg)),
        "ACTIVATE_EXTRUDER" => match cmd.get("EXTRUDER") {
            Some(name) => rig.toolhead.activate_extruder(name),
            None => Err(String::from("missing EXTRUDER parameter")),
        },
        "STATUS" => {
            output.push(status_doc(rig));
            Ok(())
        }
        other => Err(GCodeError::UnknownCommand(String::from(other)).to_string()),
    };
    match result {
        Ok(()) => Ok(output),
        Err(error) => {
            rig.bus.publish(Event::CommandError);
            Err(error)
        }
    }
}

enum ExecutorComms {
    Line(String, Sender<Result<Vec<String>, String>>),
}

fn executor_loop(rig: Rig, executor_recv: Receiver<ControlComms<ExecutorComms>>) {
    loop {
        match executor_recv.recv().unwrap() {
            ControlComms::Msg(ExecutorComms::Line(line, response_send)) => {
                // a disconnected requester only means the caller gave up
                // on the response
                let _ = response_send.send(dispatch(&rig, &line));
            }
            ControlComms::Exit => {
                debug!(target: target::INTERNAL, "received exit, exiting...");
                rig.bus.publish(Event::Shutdown);
                break;
            }
        }
    }
}

// not implementing clone since that could lead to the executor thread
// being stopped twice due to implementing drop
pub struct MotionCtrl {
    executor_send: Sender<ControlComms<ExecutorComms>>,
    executor_handle: ManuallyDrop<JoinHandle<()>>,
}

impl MotionCtrl {
    /// Executes one command line on the executor thread and waits for the
    /// outcome. `Ok` carries the response lines (possibly none).
    pub fn execute_line(&self, line: &str) -> Result<Vec<String>, String> {
        let (response_send, response_recv) = channel::bounded(1);
        self.executor_send
            .send(ControlComms::Msg(ExecutorComms::Line(
                String::from(line),
                response_send,
            )))
            .unwrap();
        response_recv.recv().unwrap()
    }
}

impl Drop for MotionCtrl {
    fn drop(&mut self) {
        self.executor_send.send(ControlComms::Exit).unwrap();
        // safety:
        // since we are in drop, self.executor_handle will not be used again
        unsafe { ManuallyDrop::take(&mut self.executor_handle) }
            .join()
            .unwrap();
    }
}

/// Starts the executor thread. The setup happens on the thread itself so
/// the rig never crosses threads; setup errors are reported back through
/// a bounded channel.
pub fn start(cfg: Config) -> Result<MotionCtrl> {
    let (executor_send, executor_recv) = channel::unbounded();
    let (setup_send, setup_recv) = channel::bounded(1);
    let executor_handle = thread::Builder::new()
        .name(String::from("executor"))
        .spawn(move || match build_rig(&cfg) {
            Ok(rig) => {
                setup_send.send(Ok(())).unwrap();
                executor_loop(rig, executor_recv);
            }
            Err(e) => setup_send.send(Err(e)).unwrap(),
        })
        .context("Creating the executor thread failed")?;
    setup_recv.recv().unwrap()?;
    Ok(MotionCtrl {
        executor_send,
        executor_handle: ManuallyDrop::new(executor_handle),
    })
}
