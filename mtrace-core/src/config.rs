//! Session configuration: buffer sizing, clock selection, flags, and sink
//! target, gathered into one validated struct so the CLI front end and
//! programmatic callers share the same entry point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::clock;
use crate::clock::ClockSource;
use crate::collab::Sink;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceFlags: u32 {
        const COUNT_ALLOCS = 0b1;
    }
}

/// Where the finalized trace is written.
pub enum SinkTarget {
    Path(PathBuf),
    /// An already-open fd adopted from the caller; `close_on_drop` controls
    /// whether this crate closes it when the session ends.
    Fd {
        fd: i32,
        close_on_drop: bool,
    },
    /// Stream the finalized preamble+buffer as a chunk over an
    /// externally-supplied transport (e.g. a debugger connection) instead
    /// of a file. Corresponds to `direct_to_external_sink` in the lifecycle
    /// contract: no file is opened for this session.
    External(Box<dyn Sink>),
}

const CLOCK_WALL: u8 = 0;
const CLOCK_THREAD_CPU: u8 = 1;
const CLOCK_DUAL: u8 = 2;

static DEFAULT_CLOCK_SOURCE: AtomicU8 = AtomicU8::new(CLOCK_WALL);

fn encode_clock(clock: ClockSource) -> u8 {
    match clock {
        ClockSource::Wall => CLOCK_WALL,
        ClockSource::ThreadCpu => CLOCK_THREAD_CPU,
        ClockSource::Dual => CLOCK_DUAL,
    }
}

fn decode_clock(value: u8) -> ClockSource {
    match value {
        CLOCK_THREAD_CPU => ClockSource::ThreadCpu,
        CLOCK_DUAL => ClockSource::Dual,
        _ => ClockSource::Wall,
    }
}

/// Sets the process-wide default clock source used by `TraceConfig::new`
/// when no explicit clock is requested. Only meaningful between sessions —
/// hot reconfiguration while tracing is active is out of scope.
pub fn set_default_clock_source(clock: ClockSource) {
    DEFAULT_CLOCK_SOURCE.store(encode_clock(clock), Ordering::SeqCst);
}

pub fn default_clock_source() -> ClockSource {
    decode_clock(DEFAULT_CLOCK_SOURCE.load(Ordering::SeqCst))
}

pub struct TraceConfig {
    pub sink: SinkTarget,
    pub buffer_size: usize,
    pub flags: TraceFlags,
    pub clock_source: ClockSource,
}

impl TraceConfig {
    pub fn new(sink: SinkTarget, buffer_size: usize, flags: TraceFlags) -> Self {
        TraceConfig {
            sink,
            buffer_size,
            flags,
            clock_source: Self::resolve_clock(default_clock_source()),
        }
    }

    pub fn with_clock_source(mut self, clock: ClockSource) -> Self {
        self.clock_source = Self::resolve_clock(clock);
        self
    }

    /// Degrades `thread_cpu`/`dual` to `wall` with a single warning if this
    /// platform has no per-thread CPU clock.
    fn resolve_clock(requested: ClockSource) -> ClockSource {
        if requested.has_cpu() && clock::thread_cpu_us().is_none() {
            log::warn!("per-thread CPU clock unavailable on this platform; falling back to wall clock");
            return ClockSource::Wall;
        }
        requested
    }

    pub fn count_allocs(&self) -> bool {
        self.flags.contains(TraceFlags::COUNT_ALLOCS)
    }
}
