use crate::toolhead::MoveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HomingError {
    #[error("Error during homing move: {}", .0)]
    MoveFailed(String),
    #[error("Error during homing {}: {}", .0, .1)]
    EndstopWait(String, String),
    #[error("No trigger on {} after full movement", .0)]
    NoTrigger(String),
    #[error("Endstop {} still triggered after retract", .0)]
    StillTriggered(String),
    #[error("Probe triggered prior to movement")]
    ProbeTriggeredPriorToMovement,
    #[error("Homing failed due to printer shutdown")]
    Shutdown,
    #[error("Probing failed due to printer shutdown")]
    ProbingShutdown,
    #[error("Homing error: you must configure the {} axis in order to use it.", .0)]
    UnconfiguredAxis(char),
    #[error("Homing error: the active extruder is not home-able")]
    ExtruderNotHomeable,
    #[error(transparent)]
    Move(#[from] MoveError),
}
