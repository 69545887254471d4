//! Method-level execution tracer for a managed runtime: a lock-free event
//! log fed from instrumentation callbacks, a start/stop lifecycle that
//! coordinates with stop-the-world suspension, and a finalizer that derives
//! a textual preamble from the accumulated binary trace.
//!
//! Host binaries (`mtrace-cli`, `mtrace-demo`, or an embedding runtime)
//! implement [`collab::Runtime`], [`collab::Instrumentation`], and
//! [`collab::MethodMetadata`] against their own VM, then drive a session
//! through [`lifecycle::start`] / [`lifecycle::stop`].

pub mod buffer;
pub mod clock;
pub mod collab;
pub mod config;
pub mod encode;
pub mod error;
pub mod finalize;
pub mod lifecycle;
pub mod record;
pub mod tracer;

pub use clock::ClockSource;
pub use collab::{EventMask, Instrumentation, MethodListener, MethodMetadata, Runtime, Sink};
pub use config::{SinkTarget, TraceConfig, TraceFlags};
pub use error::{Error, Result};
pub use tracer::Tracer;
