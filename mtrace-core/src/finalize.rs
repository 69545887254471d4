//! Walks the quiesced event buffer, builds the textual preamble, and flushes
//! preamble + buffer to the sink. Runs entirely under the lifecycle's
//! stop-the-world bracket.

use std::collections::BTreeSet;

use crate::clock::{self, ClockSource};
use crate::collab::{ChunkType, MethodMetadata, Runtime, StatKind};
use crate::error::{Error, Result};
use crate::record::{self, HEADER_LEN};
use crate::tracer::Tracer;

fn clock_name(clock: ClockSource) -> &'static str {
    match clock {
        ClockSource::Wall => "wall",
        ClockSource::ThreadCpu => "thread-cpu",
        ClockSource::Dual => "dual",
    }
}

/// Scans `buffer[HEADER_LEN..final_offset]` and returns the distinct method
/// references visited this session, in ascending order.
fn visited_methods(buffer: &[u8], final_offset: usize, clock: ClockSource) -> BTreeSet<u32> {
    let record_size = record::record_size(clock);
    let mut methods = BTreeSet::new();
    let mut offset = HEADER_LEN;
    while offset + record_size <= final_offset {
        let decoded = record::decode_record(&buffer[offset..offset + record_size], clock);
        methods.insert(decoded.method_ref);
        offset += record_size;
    }
    methods
}

/// Builds the textual preamble and writes it plus the raw event buffer to
/// the tracer's own sink as a single chunk. Called once, under world-stop,
/// from `crate::lifecycle::stop`.
pub fn finalize(tracer: &Tracer, runtime: &dyn Runtime, metadata: &dyn MethodMetadata) -> Result<()> {
    let elapsed_us = clock::wall_us().saturating_sub(tracer.start_time_us());
    let final_offset = tracer.buffer().published_len();
    let clock_overhead_ns = clock::measure_overhead(tracer.clock_source());

    if tracer.count_allocs() {
        runtime.set_stats_enabled(false);
    }

    let buf = tracer.buffer().as_slice();
    let record_size = record::record_size(tracer.clock_source());
    let num_method_calls = (final_offset - HEADER_LEN) / record_size;
    let methods = visited_methods(buf, final_offset, tracer.clock_source());

    let mut preamble = String::new();
    preamble.push_str("*version\n");
    preamble.push_str(&format!("{}\n", tracer.clock_source().header_version()));
    preamble.push_str(&format!(
        "data-file-overflow={}\n",
        tracer.buffer().overflowed()
    ));
    preamble.push_str(&format!("clock={}\n", clock_name(tracer.clock_source())));
    preamble.push_str(&format!("elapsed-time-usec={elapsed_us}\n"));
    preamble.push_str(&format!("num-method-calls={num_method_calls}\n"));
    preamble.push_str(&format!("clock-call-overhead-nsec={clock_overhead_ns}\n"));
    preamble.push_str("vm=art\n");
    if tracer.count_allocs() {
        preamble.push_str(&format!(
            "alloc-count={}\n",
            runtime.stat(StatKind::AllocatedObjects)
        ));
        preamble.push_str(&format!(
            "alloc-size={}\n",
            runtime.stat(StatKind::AllocatedBytes)
        ));
        preamble.push_str(&format!(
            "gc-count={}\n",
            runtime.stat(StatKind::GcInvocations)
        ));
    }
    preamble.push_str("*threads\n");
    for thread in runtime.thread_list() {
        preamble.push_str(&format!("{}\t{}\n", thread.tid, thread.name));
    }
    preamble.push_str("*methods\n");
    for method_ref in &methods {
        let info = metadata.describe(*method_ref);
        preamble.push_str(&format!(
            "{:#x}\t{}\t{}\t{}\t{}\n",
            method_ref,
            info.declaring_class_descriptor,
            info.method_name,
            info.signature,
            info.source_file
        ));
    }
    preamble.push_str("*end\n");

    tracer
        .sink()
        .write_chunk(ChunkType::Trace, &[preamble.as_bytes(), &buf[..final_offset]])
        .map_err(Error::SinkWriteFailed)
}
