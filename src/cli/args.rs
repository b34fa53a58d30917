//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

/// Inspect a WebAssembly module and report how wasmscope would profile
/// it: detected guest language, symbolization support and allocator
/// hooks. Running the module is the embedding runtime's job; this tool
/// only performs the preparation step.
#[derive(Parser)]
#[command(name = "wasmscope", version)]
pub struct Args {
    /// Path to the wasm module to inspect
    pub module: PathBuf,

    /// Sampling rate the embedder will apply, in (0, 1]
    #[arg(long, default_value_t = crate::DEFAULT_SAMPLE_RATE)]
    pub sample: f64,

    /// Report in-use tracking (inuse_objects/inuse_space) as enabled
    #[arg(long)]
    pub inuse: bool,

    /// Report host-time accounting as enabled
    #[arg(long)]
    pub host: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
