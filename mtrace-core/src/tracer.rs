//! The active tracing session: buffer + config + per-thread CPU clock
//! bookkeeping, and the instrumentation callback implementation that feeds
//! the buffer from arbitrary runtime threads.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::buffer::EventBuffer;
use crate::clock::{self, ClockSource};
use crate::collab::{MethodListener, ReturnValue, Sink};
use crate::encode::put_u16_le;
use crate::record::{self, ACTION_ENTER, ACTION_EXIT, ACTION_UNWIND, HEADER_LEN};

const SHARD_COUNT: usize = 16;

/// Sharded map from thread id to that thread's CPU-clock base (the value
/// read at its first logged event this session). Sharding by `tid %
/// SHARD_COUNT` keeps the common "entry already exists" path from
/// contending with inserts for unrelated threads, while still being a
/// single short lock on the (rare) miss path.
struct ThreadCpuBase {
    shards: Vec<Mutex<HashMap<u16, u64>>>,
}

impl ThreadCpuBase {
    fn new() -> Self {
        ThreadCpuBase {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, tid: u16) -> &Mutex<HashMap<u16, u64>> {
        &self.shards[tid as usize % SHARD_COUNT]
    }

    /// Returns the microsecond delta since this thread's first logged
    /// event. First call for a given `tid` always returns 0 and records the
    /// current clock reading as that thread's base.
    fn delta_us(&self, tid: u16) -> u32 {
        let mut shard = self.shard_for(tid).lock().expect("thread_cpu_base shard poisoned");
        match shard.get(&tid) {
            Some(&base) => {
                let now = clock::thread_cpu_us().unwrap_or(base);
                now.wrapping_sub(base) as u32
            }
            None => {
                let now = clock::thread_cpu_us().unwrap_or(0);
                shard.insert(tid, now);
                0
            }
        }
    }
}

/// One active tracing session. At most one exists process-wide; see
/// `crate::lifecycle`.
pub struct Tracer {
    buffer: EventBuffer,
    clock_source: ClockSource,
    start_time_us: u64,
    count_allocs: bool,
    thread_cpu_base: ThreadCpuBase,
    sink: Mutex<Box<dyn Sink>>,
}

impl Tracer {
    /// Constructs a tracer, writes the 32-byte header, and takes ownership
    /// of the already-opened sink. Single-threaded: called only from inside
    /// the lifecycle's start critical section.
    pub fn new(
        buffer_size: usize,
        clock_source: ClockSource,
        count_allocs: bool,
        sink: Box<dyn Sink>,
    ) -> Self {
        let start_time_us = clock::wall_us();
        let mut buffer = EventBuffer::new(buffer_size);
        write_header(buffer.header_mut(), clock_source, start_time_us);
        Tracer {
            buffer,
            clock_source,
            start_time_us,
            count_allocs,
            thread_cpu_base: ThreadCpuBase::new(),
            sink: Mutex::new(sink),
        }
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    pub fn start_time_us(&self) -> u64 {
        self.start_time_us
    }

    pub fn count_allocs(&self) -> bool {
        self.count_allocs
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    /// Locks and hands out the sink for the finalizer's single write. Only
    /// called once, under world-stop, during `stop`.
    pub fn sink(&self) -> std::sync::MutexGuard<'_, Box<dyn Sink>> {
        self.sink.lock().expect("sink lock poisoned")
    }

    /// The hot path. Non-blocking, non-allocating, and safe to call with
    /// any runtime lock held except the tracer's own.
    fn log_event(&self, tid: u16, method_ref: u32, action: u32) {
        let n = record::record_size(self.clock_source);
        let Some(offset) = self.buffer.reserve(n) else {
            return; // overflow already recorded by the buffer
        };

        let tmid = record::encode_method_action(method_ref, action);
        let dt_cpu = self.clock_source.has_cpu().then(|| self.thread_cpu_base.delta_us(tid));
        let dt_wall = self
            .clock_source
            .has_wall()
            .then(|| (clock::wall_us() - self.start_time_us) as u32);

        // Stack-allocated: the hot path must not allocate.
        let mut rec = [0u8; 14];
        record::encode_record(&mut rec[..n], tid, tmid, dt_cpu, dt_wall);

        // SAFETY: `offset` came from `self.buffer.reserve(n)` immediately
        // above and is written exactly once here.
        unsafe {
            self.buffer.write_at(offset, &rec[..n]);
        }
    }
}

impl MethodListener for Tracer {
    fn on_method_entered(&self, tid: u16, method: u32) {
        self.log_event(tid, method, ACTION_ENTER);
    }

    fn on_method_exited(&self, tid: u16, method: u32, _return_value: ReturnValue) {
        self.log_event(tid, method, ACTION_EXIT);
    }

    fn on_method_unwind(&self, tid: u16, method: u32) {
        self.log_event(tid, method, ACTION_UNWIND);
    }

    fn on_dex_pc_moved(&self, tid: u16, method: u32, _dex_pc: u32) {
        log::error!("unexpected dex-pc-moved event delivered to tracer (tid={tid}, method={method:#x})");
    }

    fn on_exception_caught(&self, tid: u16, method: u32) {
        log::error!("unexpected exception-caught event delivered to tracer (tid={tid}, method={method:#x})");
    }
}

fn write_header(header: &mut [u8], clock_source: ClockSource, start_time_us: u64) {
    debug_assert_eq!(header.len(), HEADER_LEN);
    for b in header.iter_mut() {
        *b = 0;
    }
    crate::encode::put_u32_le(header, 0, record::MAGIC);
    put_u16_le(header, 4, clock_source.header_version());
    put_u16_le(header, 6, HEADER_LEN as u16);
    crate::encode::put_u64_le(header, 8, start_time_us);
    if clock_source.header_version() >= 3 {
        put_u16_le(header, 16, record::record_size(clock_source) as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::RecordingSink;

    fn tracer(buffer_size: usize, clock: ClockSource) -> Tracer {
        Tracer::new(buffer_size, clock, false, Box::new(RecordingSink::new()))
    }

    #[test]
    fn empty_session_header_matches_literal_bytes() {
        let tracer = tracer(4096, ClockSource::Dual);
        let header = tracer.buffer().as_slice();
        assert_eq!(&header[0..8], &[0x53, 0x4C, 0x4F, 0x57, 0x03, 0x00, 0x20, 0x00]);
        assert_eq!(&header[16..18], &[0x0E, 0x00]);
        assert_eq!(tracer.buffer().published_len(), HEADER_LEN);
        assert!(!tracer.buffer().overflowed());
    }

    #[test]
    fn first_event_per_thread_has_zero_cpu_delta() {
        let tracer = tracer(4096, ClockSource::ThreadCpu);
        assert_eq!(tracer.thread_cpu_base.delta_us(7), 0);
    }

    #[test]
    fn logging_advances_cursor_by_record_size() {
        let tracer = tracer(4096, ClockSource::Wall);
        let before = tracer.buffer().published_len();
        tracer.on_method_entered(1, 0x1000);
        assert_eq!(tracer.buffer().published_len(), before + 10);
    }

    #[test]
    fn overflow_drops_events_past_capacity() {
        // header (32) + exactly one 10-byte wall-only record = 42.
        let tracer = tracer(42, ClockSource::Wall);
        tracer.on_method_entered(1, 0x1000);
        assert!(!tracer.buffer().overflowed());
        tracer.on_method_entered(1, 0x1000);
        assert!(tracer.buffer().overflowed());
        assert_eq!(tracer.buffer().published_len(), 42);
    }

    #[test]
    fn unexpected_instrumentation_events_do_not_advance_cursor() {
        let tracer = tracer(4096, ClockSource::Wall);
        let before = tracer.buffer().published_len();
        tracer.on_dex_pc_moved(1, 0x1000, 4);
        tracer.on_exception_caught(1, 0x1000);
        assert_eq!(tracer.buffer().published_len(), before);
    }
}
