//! Wall and per-thread CPU microsecond clocks, plus overhead calibration.

use std::time::{SystemTime, UNIX_EPOCH};

/// Which clock(s) a session records per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Wall,
    ThreadCpu,
    Dual,
}

impl ClockSource {
    pub fn has_cpu(self) -> bool {
        matches!(self, ClockSource::ThreadCpu | ClockSource::Dual)
    }

    pub fn has_wall(self) -> bool {
        matches!(self, ClockSource::Wall | ClockSource::Dual)
    }

    /// Version byte stored in the trace header: 2 for a single clock, 3 for dual.
    pub fn header_version(self) -> u16 {
        if self == ClockSource::Dual {
            3
        } else {
            2
        }
    }
}

/// Monotonic-ish wall clock, in microseconds since the Unix epoch.
pub fn wall_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Per-thread CPU time in microseconds, if the platform exposes one.
#[cfg(unix)]
pub fn thread_cpu_us() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, correctly sized out-parameter for clock_gettime.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some((ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000)
}

#[cfg(not(unix))]
pub fn thread_cpu_us() -> Option<u64> {
    None
}

/// Calibrates the cost, in nanoseconds, of reading the clock(s) enabled for
/// `clock`, by sampling them in a fixed 4000x8 loop and dividing the elapsed
/// thread-CPU time by the iteration count.
pub fn measure_overhead(clock: ClockSource) -> u32 {
    const OUTER: u64 = 4000;
    const INNER: u64 = 8;

    let start = thread_cpu_us().unwrap_or(0);
    for _ in 0..OUTER {
        for _ in 0..INNER {
            if clock.has_wall() {
                std::hint::black_box(wall_us());
            }
            if clock.has_cpu() {
                std::hint::black_box(thread_cpu_us());
            }
        }
    }
    let elapsed_us = thread_cpu_us().unwrap_or(0).saturating_sub(start);
    let iterations = OUTER * INNER;
    ((elapsed_us * 1000) / iterations) as u32
}
