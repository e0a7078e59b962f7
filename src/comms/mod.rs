//! Shared plumbing between the frontend, the homing core and the executor:
//! the control-channel envelope, the axis map, the typed event bus and the
//! completion primitive used to join endstop triggers.

use indexmap::IndexMap;
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};
use thiserror::Error;

pub enum ControlComms<T> {
    Msg(T),
    Exit,
}

// The axis universe. UVW is enumerated for completeness but not wired to
// any kinematic, so configuring it is rejected.
const AXIS_LETTERS: &'static str = "XYZABC";

#[derive(Debug, Error)]
pub enum AxisSetError {
    #[error("axis set must not be empty")]
    Empty,
    #[error("the UVW triplet is recognized but not wired, can't use axis set '{}'", .0)]
    UvwNotWired(String),
    #[error("axis set '{}' must be a contiguous prefix of '{}'", .0, AXIS_LETTERS)]
    NotAPrefix(String),
}

/// Stable mapping from axis letters to indices in the toolhead position
/// vector. The vector is `min_axes + 1` long, the last slot always being
/// the extruder pseudo-axis `E`.
#[derive(Debug, Clone)]
pub struct AxisMap {
    names: String,
    map: IndexMap<char, usize>,
    min_axes: usize,
}

impl AxisMap {
    pub fn new(axis_names: &str) -> Result<Self, AxisSetError> {
        let names = axis_names.trim().to_ascii_uppercase();
        if names.is_empty() {
            return Err(AxisSetError::Empty);
        }
        if !AXIS_LETTERS.starts_with(&names) {
            if "XYZABCUVW".starts_with(&names) {
                return Err(AxisSetError::UvwNotWired(names));
            }
            return Err(AxisSetError::NotAPrefix(names));
        }
        // smallest multiple of 3 covering the configured letters, so that
        // partial triplets like "XYZA" still get a full triplet's slots
        let min_axes = 3 * ((names.len() + 2) / 3);
        let mut map = IndexMap::with_capacity(min_axes + 1);
        for (i, letter) in AXIS_LETTERS.chars().take(min_axes).enumerate() {
            map.insert(letter, i);
        }
        map.insert('E', min_axes);
        Ok(Self {
            names,
            map,
            min_axes,
        })
    }

    /// The configured axis letters, e.g. `"XYZ"` or `"XYZAB"`.
    pub fn names(&self) -> &str {
        &self.names
    }

    pub fn min_axes(&self) -> usize {
        self.min_axes
    }

    /// Length of every position vector, including the trailing E slot.
    pub fn pos_length(&self) -> usize {
        self.min_axes + 1
    }

    pub fn e_index(&self) -> usize {
        self.min_axes
    }

    pub fn index(&self, letter: char) -> Option<usize> {
        self.map.get(&letter.to_ascii_uppercase()).copied()
    }

    pub fn letter(&self, index: usize) -> Option<char> {
        self.map
            .iter()
            .find(|(_, i)| **i == index)
            .map(|(l, _)| *l)
    }

    /// All letters of the position vector in slot order, E last.
    pub fn iter(&self) -> impl Iterator<Item = (char, usize)> + '_ {
        self.map.iter().map(|(l, i)| (*l, *i))
    }

    /// Letters of the non-extruder slots in order.
    pub fn iter_kinematic(&self) -> impl Iterator<Item = (char, usize)> + '_ {
        self.iter().filter(|(l, _)| *l != 'E')
    }

    /// Whether a command may use the letter: it must be configured (or be
    /// the extruder pseudo-axis, whose presence is checked elsewhere).
    pub fn is_configured(&self, letter: char) -> bool {
        let letter = letter.to_ascii_uppercase();
        letter == 'E' || self.names.contains(letter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Shutdown,
    ParsingMoveCommand,
    SetPosition,
    ManualMove,
    CommandError,
    ActivateExtruder,
    MotorOff,
    HomingMoveBegin,
    HomingMoveEnd,
    HomeRailsBegin,
    HomeRailsEnd,
}

/// The events the core publishes and consumes. Payloads carry only what
/// subscribers need; handlers run synchronously on the publishing thread.
#[derive(Debug, Clone)]
pub enum Event {
    Ready,
    Shutdown,
    ParsingMoveCommand { command: String },
    SetPosition,
    ManualMove,
    CommandError,
    ActivateExtruder,
    MotorOff,
    HomingMoveBegin,
    HomingMoveEnd,
    HomeRailsBegin {
        axes: Vec<usize>,
        rails: Vec<String>,
    },
    HomeRailsEnd {
        axes: Vec<usize>,
        rails: Vec<String>,
        // per-stepper adjustments (in distance units) subscribers may
        // request; home_rails applies them after all handlers ran
        adjust_pos: Arc<Mutex<HashMap<String, f64>>>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Ready => EventKind::Ready,
            Event::Shutdown => EventKind::Shutdown,
            Event::ParsingMoveCommand { .. } => EventKind::ParsingMoveCommand,
            Event::SetPosition => EventKind::SetPosition,
            Event::ManualMove => EventKind::ManualMove,
            Event::CommandError => EventKind::CommandError,
            Event::ActivateExtruder => EventKind::ActivateExtruder,
            Event::MotorOff => EventKind::MotorOff,
            Event::HomingMoveBegin => EventKind::HomingMoveBegin,
            Event::HomingMoveEnd => EventKind::HomingMoveEnd,
            Event::HomeRailsBegin { .. } => EventKind::HomeRailsBegin,
            Event::HomeRailsEnd { .. } => EventKind::HomeRailsEnd,
        }
    }
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registry of subscribers keyed by event kind. Publishing clones the
/// subscriber list before invoking it, so handlers may publish further
/// events without re-entering the lock.
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(Arc::new(handler));
    }

    pub fn publish(&self, event: Event) {
        let subscribers = {
            let map = self.subscribers.lock().unwrap();
            map.get(&event.kind()).cloned().unwrap_or_default()
        };
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }
}

struct CompletionState {
    result: Option<i32>,
    dependents: Vec<Arc<MultiJoin>>,
}

struct CompletionInner {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

/// One-shot result slot. An endstop arms one per homing move and completes
/// it with a nonzero value on trigger (or an error); the drip loop observes
/// the combined completion built by [`multi_complete`].
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                state: Mutex::new(CompletionState {
                    result: None,
                    dependents: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Completes with `result`. Only the first call wins.
    pub fn complete(&self, result: i32) {
        let dependents = {
            let mut state = self.inner.state.lock().unwrap();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.dependents)
        };
        self.inner.cond.notify_all();
        for dependent in dependents {
            dependent.child_done(result);
        }
    }

    pub fn test(&self) -> Option<i32> {
        self.inner.state.lock().unwrap().result
    }

    pub fn wait(&self) -> i32 {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(result) = state.result {
                return result;
            }
            state = self.inner.cond.wait(state).unwrap();
        }
    }

    fn add_dependent(&self, join: Arc<MultiJoin>) {
        let fire = {
            let mut state = self.inner.state.lock().unwrap();
            match state.result {
                Some(result) => Some(result),
                None => {
                    state.dependents.push(Arc::clone(&join));
                    None
                }
            }
        };
        if let Some(result) = fire {
            join.child_done(result);
        }
    }
}

// Join with one slot for the first error and a counter of outstanding
// members: the combined completion fires early (with 1) when any member
// resolves nonzero, or with 0 once all members resolved normally.
struct MultiJoin {
    outstanding: Mutex<usize>,
    combined: Completion,
}

impl MultiJoin {
    fn child_done(&self, result: i32) {
        if result != 0 {
            self.combined.complete(1);
            return;
        }
        let fire = {
            let mut outstanding = self.outstanding.lock().unwrap();
            *outstanding -= 1;
            *outstanding == 0
        };
        if fire {
            self.combined.complete(0);
        }
    }
}

pub fn multi_complete(completions: Vec<Completion>) -> Completion {
    if completions.len() == 1 {
        return completions.into_iter().next().unwrap();
    }
    let combined = Completion::new();
    let join = Arc::new(MultiJoin {
        outstanding: Mutex::new(completions.len()),
        combined: combined.clone(),
    });
    for completion in completions.iter() {
        completion.add_dependent(Arc::clone(&join));
    }
    combined
}
