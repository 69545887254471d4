//! Exercises a full start → log(enter/exit/unwind) → stop → finalize cycle
//! against mock collaborators, for manual inspection of the emitted trace.

use mtrace_core::collab::mock::{MockInstrumentation, MockMethodMetadata, MockRuntime};
use mtrace_core::collab::{ReturnValue, ThreadInfo};
use mtrace_core::{lifecycle, ClockSource, SinkTarget, TraceConfig, TraceFlags};

const TID: u16 = 1;

// Method references are packed with a 2-bit action tag, so they must be
// 4-byte aligned; see mtrace_core::record::encode_method_action.
const METHOD_MAIN: u32 = 0x1000;
const METHOD_F1: u32 = 0x1004;
const METHOD_SUB_BLOCK: u32 = 0x1008;
const METHOD_RISKY: u32 = 0x100C;

fn sub_block(instrumentation: &MockInstrumentation) {
    instrumentation.dispatch_entered(TID, METHOD_SUB_BLOCK);
    instrumentation.dispatch_exited(TID, METHOD_SUB_BLOCK, ReturnValue(0));
}

/// Simulates a method that unwinds via an exception instead of returning
/// normally, exercising the `on_method_unwind` path.
fn risky(instrumentation: &MockInstrumentation) {
    instrumentation.dispatch_entered(TID, METHOD_RISKY);
    instrumentation.dispatch_unwind(TID, METHOD_RISKY);
}

fn f1(instrumentation: &MockInstrumentation) {
    instrumentation.dispatch_entered(TID, METHOD_F1);
    sub_block(instrumentation);
    risky(instrumentation);
    instrumentation.dispatch_exited(TID, METHOD_F1, ReturnValue(0));
}

fn main() {
    env_logger::init();

    let runtime = MockRuntime::new(vec![ThreadInfo {
        tid: TID,
        name: "main".to_string(),
    }]);
    let instrumentation = MockInstrumentation::new();
    let metadata = MockMethodMetadata;

    let config = TraceConfig::new(
        SinkTarget::Path("mtrace-demo.bin".into()),
        64 * 1024,
        TraceFlags::empty(),
    )
    .with_clock_source(ClockSource::Dual);

    lifecycle::start(config, &runtime, &instrumentation).expect("start trace");

    instrumentation.dispatch_entered(TID, METHOD_MAIN);
    f1(&instrumentation);
    instrumentation.dispatch_exited(TID, METHOD_MAIN, ReturnValue(0));

    lifecycle::stop(&runtime, &instrumentation, &metadata).expect("stop trace");

    println!("wrote mtrace-demo.bin");
}
