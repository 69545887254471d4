//! Contracts for the collaborators this crate consumes — the managed
//! runtime, its instrumentation subsystem, method metadata, and the output
//! sink — plus in-memory mock implementations used by tests and by
//! `mtrace-cli`/`mtrace-demo`.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

bitflags! {
    /// Which instrumentation events a listener wants delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const ENTERED = 0b001;
        const EXITED  = 0b010;
        const UNWIND  = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    AllocatedObjects,
    AllocatedBytes,
    GcInvocations,
}

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub tid: u16,
    pub name: String,
}

/// A method's return value. The tracer never inspects it.
#[derive(Debug, Clone, Copy)]
pub struct ReturnValue(pub u64);

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub declaring_class_descriptor: String,
    pub method_name: String,
    pub signature: String,
    pub source_file: String,
}

/// Callback set the instrumentation subsystem invokes on arbitrary runtime
/// threads. Only the first three hooks are meaningful to this crate; the
/// last two firing is a defect in the instrumentation wiring.
pub trait MethodListener: Send + Sync {
    fn on_method_entered(&self, tid: u16, method: u32);
    fn on_method_exited(&self, tid: u16, method: u32, return_value: ReturnValue);
    fn on_method_unwind(&self, tid: u16, method: u32);
    fn on_dex_pc_moved(&self, tid: u16, method: u32, dex_pc: u32);
    fn on_exception_caught(&self, tid: u16, method: u32);
}

pub trait Runtime: Send + Sync {
    fn suspend_all(&self);
    fn resume_all(&self);
    fn thread_list(&self) -> Vec<ThreadInfo>;
    fn set_stats_enabled(&self, enabled: bool);
    fn stat(&self, kind: StatKind) -> u64;
}

pub trait Instrumentation: Send + Sync {
    fn add_listener(&self, events: EventMask, listener: Arc<dyn MethodListener>);
    fn remove_listener(&self, listener: &Arc<dyn MethodListener>);
}

pub trait MethodMetadata: Send + Sync {
    fn describe(&self, method_ref: u32) -> MethodInfo;
}

/// Tag distinguishing the chunk types an external streaming sink can carry.
/// This crate only ever emits one: the finalized trace (preamble + buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Trace,
}

/// Where the finalized trace artifact is written: a plain file, or an
/// external chunked transport (e.g. a debugger connection).
pub trait Sink: Send {
    fn write_chunk(&mut self, chunk_type: ChunkType, iovecs: &[&[u8]]) -> io::Result<()>;
}

pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    pub fn new(file: std::fs::File) -> Self {
        FileSink { file }
    }
}

impl Sink for FileSink {
    fn write_chunk(&mut self, _chunk_type: ChunkType, iovecs: &[&[u8]]) -> io::Result<()> {
        for iov in iovecs {
            self.file.write_all(iov)?;
        }
        Ok(())
    }
}

/// Mock collaborators for tests and the demo CLI — they simulate a managed
/// runtime well enough to exercise the full start/log/stop/finalize path
/// without an actual VM attached.
pub mod mock {
    use super::*;

    /// A sink that records every chunk it receives, for assertions in
    /// tests and for the demo CLI's `--dry-run`-style external-sink mode.
    #[derive(Default)]
    pub struct RecordingSink {
        pub chunks: Vec<(ChunkType, Vec<u8>)>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl Sink for RecordingSink {
        fn write_chunk(&mut self, chunk_type: ChunkType, iovecs: &[&[u8]]) -> io::Result<()> {
            let mut bytes = Vec::new();
            for iov in iovecs {
                bytes.extend_from_slice(iov);
            }
            self.chunks.push((chunk_type, bytes));
            Ok(())
        }
    }

    /// A clonable sink backed by a shared buffer, for tests that need to
    /// inspect what was written after handing the sink's `Box<dyn Sink>` half
    /// off to a `Tracer` (which only ever returns `&mut dyn Sink`, not a
    /// concrete, downcastable type).
    #[derive(Clone, Default)]
    pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.0.lock().expect("shared sink lock poisoned").clone()
        }
    }

    impl Sink for SharedSink {
        fn write_chunk(&mut self, _chunk_type: ChunkType, iovecs: &[&[u8]]) -> io::Result<()> {
            let mut buf = self.0.lock().expect("shared sink lock poisoned");
            for iov in iovecs {
                buf.extend_from_slice(iov);
            }
            Ok(())
        }
    }

    pub struct MockRuntime {
        suspended: AtomicBool,
        stats_enabled: AtomicBool,
        threads: Mutex<Vec<ThreadInfo>>,
        allocated_objects: AtomicU64,
        allocated_bytes: AtomicU64,
        gc_invocations: AtomicU64,
    }

    impl MockRuntime {
        pub fn new(threads: Vec<ThreadInfo>) -> Self {
            MockRuntime {
                suspended: AtomicBool::new(false),
                stats_enabled: AtomicBool::new(false),
                threads: Mutex::new(threads),
                allocated_objects: AtomicU64::new(0),
                allocated_bytes: AtomicU64::new(0),
                gc_invocations: AtomicU64::new(0),
            }
        }

        pub fn is_suspended(&self) -> bool {
            self.suspended.load(Ordering::SeqCst)
        }

        pub fn stats_enabled(&self) -> bool {
            self.stats_enabled.load(Ordering::SeqCst)
        }

        pub fn bump_allocated(&self, objects: u64, bytes: u64) {
            self.allocated_objects.fetch_add(objects, Ordering::Relaxed);
            self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    impl Runtime for MockRuntime {
        fn suspend_all(&self) {
            self.suspended.store(true, Ordering::SeqCst);
        }

        fn resume_all(&self) {
            self.suspended.store(false, Ordering::SeqCst);
        }

        fn thread_list(&self) -> Vec<ThreadInfo> {
            self.threads.lock().expect("thread list lock poisoned").clone()
        }

        fn set_stats_enabled(&self, enabled: bool) {
            self.stats_enabled.store(enabled, Ordering::SeqCst);
        }

        fn stat(&self, kind: StatKind) -> u64 {
            match kind {
                StatKind::AllocatedObjects => self.allocated_objects.load(Ordering::Relaxed),
                StatKind::AllocatedBytes => self.allocated_bytes.load(Ordering::Relaxed),
                StatKind::GcInvocations => self.gc_invocations.load(Ordering::Relaxed),
            }
        }
    }

    #[derive(Default)]
    pub struct MockInstrumentation {
        listeners: Mutex<Vec<(EventMask, Arc<dyn MethodListener>)>>,
    }

    impl MockInstrumentation {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn listener_count(&self) -> usize {
            self.listeners.lock().expect("listener lock poisoned").len()
        }

        /// Delivers a method-entered event to every registered listener
        /// whose mask includes `ENTERED`, simulating what the instrumented
        /// runtime would do at an interpreter/JIT entry trampoline.
        pub fn dispatch_entered(&self, tid: u16, method: u32) {
            for (mask, listener) in self.listeners.lock().expect("listener lock poisoned").iter() {
                if mask.contains(EventMask::ENTERED) {
                    listener.on_method_entered(tid, method);
                }
            }
        }

        pub fn dispatch_exited(&self, tid: u16, method: u32, return_value: ReturnValue) {
            for (mask, listener) in self.listeners.lock().expect("listener lock poisoned").iter() {
                if mask.contains(EventMask::EXITED) {
                    listener.on_method_exited(tid, method, return_value);
                }
            }
        }

        pub fn dispatch_unwind(&self, tid: u16, method: u32) {
            for (mask, listener) in self.listeners.lock().expect("listener lock poisoned").iter() {
                if mask.contains(EventMask::UNWIND) {
                    listener.on_method_unwind(tid, method);
                }
            }
        }
    }

    impl Instrumentation for MockInstrumentation {
        fn add_listener(&self, events: EventMask, listener: Arc<dyn MethodListener>) {
            self.listeners
                .lock()
                .expect("listener lock poisoned")
                .push((events, listener));
        }

        fn remove_listener(&self, listener: &Arc<dyn MethodListener>) {
            let mut listeners = self.listeners.lock().expect("listener lock poisoned");
            listeners.retain(|(_, l)| !Arc::ptr_eq(l, listener));
        }
    }

    pub struct MockMethodMetadata;

    impl MethodMetadata for MockMethodMetadata {
        fn describe(&self, method_ref: u32) -> MethodInfo {
            MethodInfo {
                declaring_class_descriptor: "Lcom/example/Demo;".to_string(),
                method_name: format!("method_{method_ref:#010x}"),
                signature: "()V".to_string(),
                source_file: "Demo.java".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    struct CountingListener {
        entered: std::sync::atomic::AtomicU32,
    }

    impl MethodListener for CountingListener {
        fn on_method_entered(&self, _tid: u16, _method: u32) {
            self.entered.fetch_add(1, Ordering::SeqCst);
        }
        fn on_method_exited(&self, _tid: u16, _method: u32, _return_value: ReturnValue) {}
        fn on_method_unwind(&self, _tid: u16, _method: u32) {}
        fn on_dex_pc_moved(&self, _tid: u16, _method: u32, _dex_pc: u32) {}
        fn on_exception_caught(&self, _tid: u16, _method: u32) {}
    }

    #[test]
    fn dispatch_only_reaches_matching_mask() {
        let instr = MockInstrumentation::new();
        let listener = Arc::new(CountingListener {
            entered: std::sync::atomic::AtomicU32::new(0),
        });
        instr.add_listener(EventMask::ENTERED, listener.clone());
        instr.dispatch_entered(1, 0x1000);
        instr.dispatch_exited(1, 0x1000, ReturnValue(0));
        assert_eq!(listener.entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_listener_drops_it_from_dispatch() {
        let instr = MockInstrumentation::new();
        let listener = Arc::new(CountingListener {
            entered: std::sync::atomic::AtomicU32::new(0),
        });
        instr.add_listener(EventMask::ENTERED, listener.clone());
        assert_eq!(instr.listener_count(), 1);
        instr.remove_listener(&(listener.clone() as Arc<dyn MethodListener>));
        assert_eq!(instr.listener_count(), 0);
        instr.dispatch_entered(1, 0x1000);
        assert_eq!(listener.entered.load(Ordering::SeqCst), 0);
    }
}
