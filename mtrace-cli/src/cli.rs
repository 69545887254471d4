use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use mtrace_core::ClockSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockArg {
    Wall,
    ThreadCpu,
    Dual,
}

impl From<ClockArg> for ClockSource {
    fn from(value: ClockArg) -> Self {
        match value {
            ClockArg::Wall => ClockSource::Wall,
            ClockArg::ThreadCpu => ClockSource::ThreadCpu,
            ClockArg::Dual => ClockSource::Dual,
        }
    }
}

/// Drives a synthetic workload against the method tracer and writes the
/// resulting trace file, for exercising the full start/log/stop/finalize
/// path without an attached managed runtime.
#[derive(Debug, Parser)]
#[command(name = "mtrace", version, about)]
pub struct Args {
    /// Where to write the finalized trace.
    #[arg(short, long, default_value = "trace.bin")]
    pub output: PathBuf,

    /// Event buffer size in bytes.
    #[arg(short, long, default_value_t = 1 << 20)]
    pub buffer_size: usize,

    /// Which clock(s) to record per event.
    #[arg(short, long, value_enum, default_value_t = ClockArg::Wall)]
    pub clock: ClockArg,

    /// How long to let the synthetic workload run before stopping the trace.
    #[arg(short, long, default_value_t = 2)]
    pub duration_secs: u64,

    /// Number of worker threads in the synthetic workload.
    #[arg(short = 'w', long, default_value_t = 2)]
    pub workers: usize,

    /// Method calls logged per worker per iteration.
    #[arg(short = 'n', long, default_value_t = 500)]
    pub calls_per_iteration: usize,

    /// Track allocation/GC counters in the preamble.
    #[arg(long)]
    pub count_allocs: bool,
}
