//! Error kinds raised at tracing session boundaries.
//!
//! The hot path (`Tracer::log_event`) never returns an error: overflow drops
//! the event, and unexpected instrumentation events are logged and ignored.
//! Only `start`/`stop` can fail the caller, and even then only for sink I/O —
//! `start`-while-active and `stop`-while-inactive are policy no-ops, logged
//! rather than surfaced (see `lifecycle`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to open trace sink")]
    SinkOpenFailed(#[source] std::io::Error),

    #[error("failed writing trace output")]
    SinkWriteFailed(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
