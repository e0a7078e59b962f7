//! Logging setup. Events in this crate use one of two explicit targets:
//! [`target::PUBLIC`] for operator-facing messages (homing finished,
//! motors cut, command errors) and [`target::INTERNAL`] for tracing the
//! motion pipeline itself; everything else keeps its module path.

use crate::APP_NAME;
use std::io;
use tracing::Level;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub mod target {
    pub const INTERNAL: &'static str = "motiond::internal";
    pub const PUBLIC: &'static str = "motiond::public";
}

// operator-facing messages stay visible down to info regardless of the
// configured level; the pipeline targets and module-path events follow it
fn filter(level: Level) -> Targets {
    Targets::new()
        .with_target(target::PUBLIC, level.max(Level::INFO))
        .with_target(target::INTERNAL, level)
        .with_target(APP_NAME, level)
}

pub fn setup(level: Level) {
    let format = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr));
    if level < Level::DEBUG {
        // terse single-line output for normal operation
        tracing_subscriber::registry()
            .with(format.compact().with_target(false))
            .with(filter(level))
            .init()
    } else {
        // debugging gets thread names and source locations
        tracing_subscriber::registry()
            .with(
                format
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter(level))
            .init()
    }
}
