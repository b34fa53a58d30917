use std::fs;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use wasmscope::cli::Args;
use wasmscope::Profiling;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Warn })
        .format_timestamp(None)
        .init();

    if !(args.sample > 0.0 && args.sample <= 1.0) {
        anyhow::bail!("--sample must be in (0, 1], got {}", args.sample);
    }

    let wasm = fs::read(&args.module)
        .with_context(|| format!("reading wasm module {}", args.module.display()))?;
    let name = args
        .module
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.module.display().to_string());

    let profiling = Profiling::prepare(&wasm, &name)
        .with_context(|| format!("preparing {name} for profiling"))?;
    let report = profiling.report();

    println!("module: {name} ({} bytes)", wasm.len());
    println!("guest language: {}", report.language);
    println!("symbolizer: {}", report.symbolizer);
    println!(
        "sampling: rate {:.4} (cycle of {})",
        args.sample,
        (1.0 / args.sample).ceil() as u64
    );
    println!("host time accounting: {}", if args.host { "on" } else { "off" });
    println!("in-use tracking: {}", if args.inuse { "on" } else { "off" });
    println!(
        "data segments: {}, imported functions: {}",
        report.data_segments, report.imported_functions
    );

    if report.custom_sections.is_empty() {
        println!("custom sections: none");
    } else {
        println!("custom sections:");
        for (section, size) in &report.custom_sections {
            println!("  {section} ({size} bytes)");
        }
    }

    let debug_sections: Vec<&str> = wasmscope::symbolization::dwarf::DEBUG_SECTIONS
        .iter()
        .copied()
        .filter(|name| report.custom_sections.iter().any(|(s, _)| s == name))
        .collect();
    if debug_sections.is_empty() {
        println!("debug info: none");
    } else {
        println!("debug info: {}", debug_sections.join(", "));
    }

    if report.allocator_exports.is_empty() {
        println!("allocator hooks: none exported (memory profile needs runtime name info)");
    } else {
        println!("allocator hooks: {}", report.allocator_exports.join(", "));
    }

    // Exercise the wiring the embedder would use, so configuration
    // errors surface here instead of mid-run.
    let cpu = profiling.cpu_profiler();
    cpu.set_host_time(args.host);
    let mem = profiling.memory_profiler();
    mem.set_inuse_tracking(args.inuse);
    let _cpu_factory = profiling.cpu_listeners(&cpu);
    let _mem_factory = profiling.memory_listeners(&mem);
    println!("profilers: {} and {} ready", cpu.name(), mem.name());

    Ok(())
}
