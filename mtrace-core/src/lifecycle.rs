//! Process-wide start/stop/shutdown entry points and the single global slot
//! that makes "a session exists" and "a Tracer is registered with
//! Instrumentation" the same fact.
//!
//! Everything here runs under `runtime.suspend_all()`/`resume_all()`; the
//! lock itself is only ever held for the duration of a slot swap, never
//! across a suspend-all bracket or a sink write.

use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};

use crate::collab::{EventMask, FileSink, Instrumentation, MethodListener, MethodMetadata, Runtime, Sink};
use crate::config::{SinkTarget, TraceConfig};
use crate::error::{Error, Result};
use crate::finalize;
use crate::tracer::Tracer;

static THE_TRACE: Mutex<Option<Arc<Tracer>>> = Mutex::new(None);

fn open_sink(target: SinkTarget) -> Result<Box<dyn Sink>> {
    match target {
        SinkTarget::Path(path) => {
            let file = std::fs::File::create(&path).map_err(Error::SinkOpenFailed)?;
            Ok(Box::new(FileSink::new(file)))
        }
        SinkTarget::Fd { fd, close_on_drop } => {
            let owned_fd = if close_on_drop {
                fd
            } else {
                // SAFETY: `fd` is asserted by the caller to be a currently
                // open descriptor; dup it so this crate's File can close its
                // own handle on drop without closing the caller's.
                let dup = unsafe { libc::dup(fd) };
                if dup < 0 {
                    return Err(Error::SinkOpenFailed(std::io::Error::last_os_error()));
                }
                dup
            };
            // SAFETY: `owned_fd` is either a fresh dup this function just
            // created, or an fd the caller told us to take ownership of.
            let file = unsafe { std::fs::File::from_raw_fd(owned_fd) };
            Ok(Box::new(FileSink::new(file)))
        }
        SinkTarget::External(sink) => Ok(sink),
    }
}

/// Starts a tracing session: suspends the world, opens the sink, installs
/// the tracer as an instrumentation listener, resumes the world.
///
/// A no-op (logged, `Ok(())`) if a session is already active — this crate's
/// equivalent of the original's `AlreadyActive` policy.
pub fn start(config: TraceConfig, runtime: &dyn Runtime, instrumentation: &dyn Instrumentation) -> Result<()> {
    {
        let guard = THE_TRACE.lock().expect("trace slot poisoned");
        if guard.is_some() {
            log::error!("trace already in progress");
            return Ok(());
        }
    }

    runtime.suspend_all();

    let count_allocs = config.count_allocs();
    let sink = match open_sink(config.sink) {
        Ok(sink) => sink,
        Err(err) => {
            runtime.resume_all();
            return Err(err);
        }
    };

    let tracer = Arc::new(Tracer::new(config.buffer_size, config.clock_source, count_allocs, sink));

    {
        let mut guard = THE_TRACE.lock().expect("trace slot poisoned");
        if guard.is_some() {
            // Another start() won the race between our first check and here.
            // suspend_all should make this unreachable in practice; treated
            // as AlreadyActive rather than replacing the existing session.
            log::error!("trace already in progress");
            runtime.resume_all();
            return Ok(());
        }
        *guard = Some(tracer.clone());
    }

    if count_allocs {
        runtime.set_stats_enabled(true);
    }

    let listener: Arc<dyn MethodListener> = tracer;
    instrumentation.add_listener(EventMask::ENTERED | EventMask::EXITED | EventMask::UNWIND, listener);

    runtime.resume_all();
    Ok(())
}

/// Stops the active session: suspends the world, detaches the tracer from
/// Instrumentation, finalizes the buffer to its sink, resumes the world.
///
/// A no-op (logged, `Ok(())`) if no session is active. Any finalize error is
/// returned to the caller only after the world has been resumed.
pub fn stop(runtime: &dyn Runtime, instrumentation: &dyn Instrumentation, metadata: &dyn MethodMetadata) -> Result<()> {
    runtime.suspend_all();

    let tracer = THE_TRACE.lock().expect("trace slot poisoned").take();

    let Some(tracer) = tracer else {
        log::error!("stop() called with no active trace");
        runtime.resume_all();
        return Ok(());
    };

    let result = finalize::finalize(&tracer, runtime, metadata);

    let listener: Arc<dyn MethodListener> = tracer;
    instrumentation.remove_listener(&listener);
    drop(listener);

    runtime.resume_all();
    result
}

/// Stops the session if one is active; otherwise a logged no-op.
pub fn shutdown(runtime: &dyn Runtime, instrumentation: &dyn Instrumentation, metadata: &dyn MethodMetadata) -> Result<()> {
    if is_active() {
        stop(runtime, instrumentation, metadata)
    } else {
        log::warn!("shutdown() called with no active trace");
        Ok(())
    }
}

pub fn is_active() -> bool {
    THE_TRACE.lock().expect("trace slot poisoned").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSource;
    use crate::collab::mock::{MockInstrumentation, MockMethodMetadata, MockRuntime, RecordingSink};
    use crate::config::TraceFlags;

    // These tests share a process-wide singleton, so they must not run
    // concurrently with each other.
    static LOCK: Mutex<()> = Mutex::new(());

    fn config(sink: Box<dyn Sink>) -> TraceConfig {
        TraceConfig::new(SinkTarget::External(sink), 4096, TraceFlags::empty())
            .with_clock_source(ClockSource::Wall)
    }

    #[test]
    fn start_then_stop_round_trips_is_active() {
        let _g = LOCK.lock().unwrap();
        let runtime = MockRuntime::new(vec![]);
        let instrumentation = MockInstrumentation::new();
        let metadata = MockMethodMetadata;

        assert!(!is_active());
        start(config(Box::new(RecordingSink::new())), &runtime, &instrumentation).unwrap();
        assert!(is_active());
        assert_eq!(instrumentation.listener_count(), 1);

        stop(&runtime, &instrumentation, &metadata).unwrap();
        assert!(!is_active());
        assert_eq!(instrumentation.listener_count(), 0);
        assert!(!runtime.is_suspended());
    }

    #[test]
    fn start_while_active_is_a_no_op_and_leaves_listener_count_at_one() {
        let _g = LOCK.lock().unwrap();
        let runtime = MockRuntime::new(vec![]);
        let instrumentation = MockInstrumentation::new();
        let metadata = MockMethodMetadata;

        start(config(Box::new(RecordingSink::new())), &runtime, &instrumentation).unwrap();
        assert_eq!(instrumentation.listener_count(), 1);

        start(config(Box::new(RecordingSink::new())), &runtime, &instrumentation).unwrap();
        assert_eq!(instrumentation.listener_count(), 1);

        stop(&runtime, &instrumentation, &metadata).unwrap();
    }

    #[test]
    fn stop_without_active_session_is_a_logged_no_op() {
        let _g = LOCK.lock().unwrap();
        let runtime = MockRuntime::new(vec![]);
        let instrumentation = MockInstrumentation::new();
        let metadata = MockMethodMetadata;

        assert!(!is_active());
        stop(&runtime, &instrumentation, &metadata).unwrap();
        assert!(!is_active());
    }

    #[test]
    fn world_is_suspended_for_the_duration_of_start_and_stop() {
        let _g = LOCK.lock().unwrap();

        struct ObservingRuntime(MockRuntime, std::sync::atomic::AtomicBool);
        impl Runtime for ObservingRuntime {
            fn suspend_all(&self) {
                self.0.suspend_all();
                self.1.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            fn resume_all(&self) {
                self.0.resume_all();
            }
            fn thread_list(&self) -> Vec<crate::collab::ThreadInfo> {
                self.0.thread_list()
            }
            fn set_stats_enabled(&self, enabled: bool) {
                self.0.set_stats_enabled(enabled);
            }
            fn stat(&self, kind: crate::collab::StatKind) -> u64 {
                self.0.stat(kind)
            }
        }

        let runtime = ObservingRuntime(MockRuntime::new(vec![]), std::sync::atomic::AtomicBool::new(false));
        let instrumentation = MockInstrumentation::new();
        let metadata = MockMethodMetadata;

        start(config(Box::new(RecordingSink::new())), &runtime, &instrumentation).unwrap();
        assert!(runtime.1.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!runtime.0.is_suspended());

        stop(&runtime, &instrumentation, &metadata).unwrap();
        assert!(!runtime.0.is_suspended());
    }

    /// Full start -> log(enter/exit across threads) -> stop -> finalize
    /// round trip: decodes the raw buffer actually written to the sink and
    /// checks every logged `(tid, method, action)` tuple survived the trip.
    #[test]
    fn start_log_stop_round_trips_through_the_sink() {
        use crate::collab::mock::SharedSink;
        use crate::collab::{EventMask, ReturnValue};
        use crate::record::{self, HEADER_LEN};

        let _g = LOCK.lock().unwrap();
        let runtime = MockRuntime::new(vec![]);
        let instrumentation = MockInstrumentation::new();
        let metadata = MockMethodMetadata;
        let sink = SharedSink::new();

        let clock = ClockSource::Wall;
        let cfg = TraceConfig::new(SinkTarget::External(Box::new(sink.clone())), 4096, TraceFlags::empty())
            .with_clock_source(clock);
        start(cfg, &runtime, &instrumentation).unwrap();

        let logged = vec![
            (1u16, 0x1000u32, EventMask::ENTERED),
            (1u16, 0x1004u32, EventMask::ENTERED),
            (2u16, 0x1008u32, EventMask::ENTERED),
            (1u16, 0x1004u32, EventMask::EXITED),
            (1u16, 0x1000u32, EventMask::EXITED),
        ];
        for (tid, method, kind) in &logged {
            match *kind {
                EventMask::ENTERED => instrumentation.dispatch_entered(*tid, *method),
                EventMask::EXITED => instrumentation.dispatch_exited(*tid, *method, ReturnValue(0)),
                _ => unreachable!(),
            }
        }

        stop(&runtime, &instrumentation, &metadata).unwrap();

        let written = sink.bytes();
        let marker = b"*end\n";
        let marker_pos = written
            .windows(marker.len())
            .position(|w| w == marker)
            .expect("preamble must end with *end\\n before the raw buffer");
        let buffer = &written[marker_pos + marker.len()..];

        let record_size = record::record_size(clock);
        let mut offset = HEADER_LEN;
        let mut decoded = Vec::new();
        while offset + record_size <= buffer.len() {
            decoded.push(record::decode_record(&buffer[offset..offset + record_size], clock));
            offset += record_size;
        }

        assert_eq!(decoded.len(), logged.len());
        for (d, (tid, method, kind)) in decoded.iter().zip(logged.iter()) {
            assert_eq!(d.tid, *tid);
            assert_eq!(d.method_ref, *method);
            let expected_action = match *kind {
                EventMask::ENTERED => record::ACTION_ENTER,
                EventMask::EXITED => record::ACTION_EXIT,
                _ => unreachable!(),
            };
            assert_eq!(d.action, expected_action);
            assert_eq!(d.dt_cpu, None);
            assert!(d.dt_wall.is_some());
        }
    }
}
