use crate::toolhead::MoveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GCodeError {
    #[error("Unable to parse move '{}'", .0)]
    ParseError(String),
    #[error("Invalid speed in '{}'", .0)]
    InvalidSpeed(String),
    #[error("G1 error: you must configure the {} axis in order to use it.", .0)]
    UnconfiguredAxis(char),
    #[error("Machine does not support G20 (inches) command")]
    InchesNotSupported,
    #[error("Unknown g-code state: {}", .0)]
    UnknownState(String),
    #[error("Malformed command '{}'", .0)]
    Malformed(String),
    #[error("Unknown command: {}", .0)]
    UnknownCommand(String),
    #[error("G-Code move transform already specified")]
    TransformAlreadySet,
    #[error("Error on '{}': {} must be above {}", .0, .1, .2)]
    MustBeAbove(String, String, f64),
    #[error(transparent)]
    Move(#[from] MoveError),
}
