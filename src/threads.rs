//! Execution-unit thread identity and run-state.

use std::fmt;

/// Wildcard index in an API thread selector.
pub const ALL: u32 = u32::MAX;

/// Physical identity of one EU thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    pub tile: u32,
    pub slice: u32,
    pub subslice: u32,
    pub eu: u32,
    pub thread: u32,
}

impl ThreadId {
    pub fn new(tile: u32, slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            tile,
            slice,
            subslice,
            eu,
            thread,
        }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t{}.s{}.ss{}.eu{}.th{}",
            self.tile, self.slice, self.subslice, self.eu, self.thread
        )
    }
}

/// API thread descriptor. Each index is either concrete or [`ALL`]; slice
/// indices address the flat (tile * slices + slice) space of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSelector {
    pub slice: u32,
    pub subslice: u32,
    pub eu: u32,
    pub thread: u32,
}

impl ThreadSelector {
    pub fn all() -> Self {
        Self {
            slice: ALL,
            subslice: ALL,
            eu: ALL,
            thread: ALL,
        }
    }

    pub fn single(slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            slice,
            subslice,
            eu,
            thread,
        }
    }

    /// True when no field is a wildcard.
    pub fn is_single(&self) -> bool {
        self.slice != ALL && self.subslice != ALL && self.eu != ALL && self.thread != ALL
    }

    /// True when every field is a wildcard.
    pub fn is_all(&self) -> bool {
        self.slice == ALL && self.subslice == ALL && self.eu == ALL && self.thread == ALL
    }

    /// Whether a concrete API-space thread falls inside this selector.
    pub fn covers(&self, slice: u32, subslice: u32, eu: u32, thread: u32) -> bool {
        (self.slice == ALL || self.slice == slice)
            && (self.subslice == ALL || self.subslice == subslice)
            && (self.eu == ALL || self.eu == eu)
            && (self.thread == ALL || self.thread == thread)
    }
}

impl fmt::Display for ThreadSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = |v: u32| -> String {
            if v == ALL {
                "all".into()
            } else {
                v.to_string()
            }
        };
        write!(
            f,
            "s{}.ss{}.eu{}.th{}",
            field(self.slice),
            field(self.subslice),
            field(self.eu),
            field(self.thread)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Stopped,
}

/// Run-state of one EU thread.
///
/// The counter mirrors the system-routine entry counter for this thread's
/// save-area slot: it increments when the thread enters the system routine
/// (odd) and again when it leaves (even). A stop is only trusted when the
/// observed counter is odd and not older than the last recorded one.
#[derive(Debug)]
pub struct EuThread {
    id: ThreadId,
    state: RunState,
    counter: u32,
    memory_handle: Option<u64>,
}

impl EuThread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: RunState::Running,
            counter: 0,
            memory_handle: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.state == RunState::Stopped
    }

    /// Counter value recorded at the last accepted stop.
    pub fn last_counter(&self) -> u32 {
        self.counter
    }

    /// VM handle the thread was stopped under, while stopped.
    pub fn memory_handle(&self) -> Option<u64> {
        self.memory_handle
    }

    /// Validates a stop report against the save-area counter.
    ///
    /// Returns true when the thread is (still) inside the system routine
    /// for this generation. Repeated reports for the same generation are
    /// accepted while stopped; an even counter means the thread already
    /// left the routine and the report is ignored.
    pub fn verify_stopped(&mut self, new_counter: u32) -> bool {
        if new_counter == self.counter {
            return self.state == RunState::Stopped;
        }
        if new_counter < self.counter {
            log::warn!(
                "thread {} reported stale counter {} (recorded {})",
                self.id,
                new_counter,
                self.counter
            );
            return false;
        }
        if new_counter % 2 == 0 {
            // Left the system routine between report and handling.
            self.counter = new_counter;
            return false;
        }
        self.counter = new_counter;
        true
    }

    pub fn stop(&mut self, memory_handle: u64) {
        if self.state != RunState::Stopped {
            log::trace!("thread {} stopped, counter {}", self.id, self.counter);
        }
        self.state = RunState::Stopped;
        self.memory_handle = Some(memory_handle);
    }

    pub fn resume(&mut self) {
        if self.state != RunState::Running {
            log::trace!("thread {} resumed", self.id);
        }
        self.state = RunState::Running;
        self.memory_handle = None;
    }
}
