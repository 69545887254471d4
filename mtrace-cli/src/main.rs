use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::info;

use mtrace_core::collab::mock::{MockInstrumentation, MockMethodMetadata, MockRuntime};
use mtrace_core::collab::{ReturnValue, ThreadInfo};
use mtrace_core::{lifecycle, Result, SinkTarget, TraceConfig, TraceFlags};

mod cli;

use cli::Args;

fn run(args: Args) -> Result<()> {
    let threads: Vec<ThreadInfo> = (0..args.workers)
        .map(|i| ThreadInfo {
            tid: (i + 1) as u16,
            name: format!("worker-{i}"),
        })
        .collect();

    let runtime = MockRuntime::new(threads.clone());
    let instrumentation = Arc::new(MockInstrumentation::new());
    let metadata = MockMethodMetadata;

    let flags = if args.count_allocs {
        TraceFlags::COUNT_ALLOCS
    } else {
        TraceFlags::empty()
    };
    let config = TraceConfig::new(SinkTarget::Path(args.output.clone()), args.buffer_size, flags)
        .with_clock_source(args.clock.into());

    lifecycle::start(config, &runtime, &*instrumentation)?;
    info!("trace started, writing to {}", args.output.display());

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let calls_per_iteration = args.calls_per_iteration;
    let handles: Vec<_> = threads
        .iter()
        .map(|thread_info| {
            let instrumentation = instrumentation.clone();
            let tid = thread_info.tid;
            thread::spawn(move || {
                let mut method_ref: u32 = 0;
                while Instant::now() < deadline {
                    for _ in 0..calls_per_iteration {
                        instrumentation.dispatch_entered(tid, method_ref);
                        instrumentation.dispatch_exited(tid, method_ref, ReturnValue(0));
                        method_ref = method_ref.wrapping_add(4);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    lifecycle::stop(&runtime, &*instrumentation, &metadata)?;
    info!("trace stopped");
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        log::error!("mtrace failed: {err}");
        std::process::exit(1);
    }
}
