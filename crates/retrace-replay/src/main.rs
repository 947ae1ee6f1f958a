#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use retrace_format::{DescriptorTable, ReaderOptions, TraceError, TraceReader};
use retrace_replay::dump::{self, DumpError};
use retrace_replay::{
    FailureClass, MismatchPolicy, ReplayError, ReplayOptions, ReplayReport, Replayer, ShaderCache,
    ShaderCacheConfig, StubDriver,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "retrace", about = "Replay and inspect retrace GPU API captures.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a trace against a driver adapter
    Replay(ReplayArgs),

    /// List the entries of a trace without replaying them
    Dump(DumpArgs),

    /// Summarize a trace: header, metadata and entry counts
    Info(InfoArgs),
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    /// Trace file to replay
    trace: PathBuf,

    /// Replay against the inert stub driver (validates handles, ordering and the shader cache)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    stub: bool,

    /// Persistent shader cache directory (defaults to $RETRACE_SHADER_CACHE_DIR or the XDG cache)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Disable the shader cache for this run
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_shader_cache: bool,

    /// Descriptor table JSON to use instead of the built-in Vulkan table
    #[arg(long, value_name = "FILE")]
    descriptors: Option<PathBuf>,

    /// Treat any result-code mismatch as fatal
    #[arg(long, action = clap::ArgAction::SetTrue)]
    strict_results: bool,

    /// Shader compile threads; 0 compiles inline on the queue worker
    #[arg(long, value_name = "N")]
    compile_workers: Option<usize>,

    /// Print the replay report as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Read a trace whose capture was never finalized, up to its last complete chunk
    #[arg(long, action = clap::ArgAction::SetTrue)]
    allow_unfinalized: bool,
}

#[derive(clap::Args, Debug)]
struct DumpArgs {
    /// Trace file to list
    trace: PathBuf,

    /// Descriptor table JSON to use instead of the built-in Vulkan table
    #[arg(long, value_name = "FILE")]
    descriptors: Option<PathBuf>,

    /// One JSON object per line instead of text
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Stop after this many entries
    #[arg(long, value_name = "N")]
    limit: Option<u64>,

    /// Read a trace whose capture was never finalized, up to its last complete chunk
    #[arg(long, action = clap::ArgAction::SetTrue)]
    allow_unfinalized: bool,
}

#[derive(clap::Args, Debug)]
struct InfoArgs {
    /// Trace file to summarize
    trace: PathBuf,

    /// Print the summary as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Read a trace whose capture was never finalized, up to its last complete chunk
    #[arg(long, action = clap::ArgAction::SetTrue)]
    allow_unfinalized: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("retrace: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<ReplayError>() {
        return err.exit_code();
    }
    let trace_err = match err.downcast_ref::<DumpError>() {
        Some(DumpError::Trace(err)) => Some(err),
        _ => err.downcast_ref::<TraceError>(),
    };
    match trace_err {
        Some(err) => FailureClass::of_trace_error(err).exit_code(),
        None => FailureClass::Other.exit_code(),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Replay(args) => run_replay(args),
        Command::Dump(args) => run_dump(args),
        Command::Info(args) => run_info(args),
    }
}

fn load_table(path: Option<&Path>) -> anyhow::Result<DescriptorTable> {
    match path {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("open descriptors {}", path.display()))?;
            DescriptorTable::from_reader(BufReader::new(file))
                .with_context(|| format!("load descriptors {}", path.display()))
        }
        None => Ok(DescriptorTable::vulkan_core()),
    }
}

fn open_trace(
    path: &Path,
    allow_unfinalized: bool,
) -> anyhow::Result<TraceReader<BufReader<File>>> {
    let options = ReaderOptions { allow_unfinalized };
    TraceReader::open_with(path, options).with_context(|| format!("open trace {}", path.display()))
}

fn run_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let table = load_table(args.descriptors.as_deref())?;

    let mut options = ReplayOptions::from_env()?;
    if args.strict_results {
        options.mismatch_policy = MismatchPolicy::Fatal;
    }
    if let Some(workers) = args.compile_workers {
        options.compile_workers = workers;
    }
    options.allow_unfinalized = args.allow_unfinalized;

    let mut cache_config = ShaderCacheConfig::from_env()?;
    if let Some(dir) = args.cache_dir {
        cache_config.root = Some(dir);
    }
    if args.no_shader_cache {
        cache_config.enabled = false;
    }

    if !args.stub {
        bail!("no live driver adapter is linked into this build; rerun with --stub");
    }
    let driver = Arc::new(StubDriver::new());

    let reader_options = ReaderOptions {
        allow_unfinalized: args.allow_unfinalized,
    };
    let mut reader = TraceReader::open_with(&args.trace, reader_options)
        .map_err(ReplayError::CorruptTrace)
        .with_context(|| format!("open trace {}", args.trace.display()))?;
    let mut replayer = Replayer::new(
        Arc::new(table),
        driver.clone(),
        Arc::new(ShaderCache::new(cache_config)),
        options,
    );
    let result = replayer.run(&mut reader);

    if let Some(report) = replayer.report() {
        print_report(report, args.json)?;
    }
    tracing::debug!(stats = ?driver.stats(), "stub driver");
    result
        .map(|_| ())
        .with_context(|| format!("replay {}", args.trace.display()))
}

fn print_report(report: &ReplayReport, json: bool) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, report)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(out, "state: {:?}", report.state)?;
    writeln!(out, "entries dispatched: {}", report.entries_dispatched)?;
    for (queue, count) in &report.per_queue {
        writeln!(out, "  queue {queue}: {count}")?;
    }
    writeln!(out, "result mismatches: {}", report.result_mismatches)?;
    writeln!(
        out,
        "handles: {} created, {} destroyed, {} released at teardown",
        report.handles_created, report.handles_destroyed, report.handles_released
    )?;
    writeln!(
        out,
        "shaders: {} compiled, {} served from cache",
        report.shader_compiles, report.shader_cache_hits
    )?;
    if let Some(error) = &report.error {
        writeln!(out, "error: {error}")?;
    }
    Ok(())
}

fn run_dump(args: DumpArgs) -> anyhow::Result<()> {
    let table = load_table(args.descriptors.as_deref())?;
    let mut reader = open_trace(&args.trace, args.allow_unfinalized)?;
    let mut out = io::stdout().lock();
    let summary = dump::dump_trace(&mut reader, &table, &mut out, args.json, args.limit)
        .with_context(|| format!("dump {}", args.trace.display()))?;
    if summary.undecoded > 0 {
        tracing::warn!(
            undecoded = summary.undecoded,
            "some entries did not decode with the descriptor table"
        );
    }
    Ok(())
}

fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let mut reader = open_trace(&args.trace, args.allow_unfinalized)?;
    let info = dump::trace_info(&mut reader)
        .with_context(|| format!("scan {}", args.trace.display()))?;

    let mut out = io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &info)?;
        writeln!(out)?;
        return Ok(());
    }
    writeln!(out, "format version: {}", info.format_version)?;
    writeln!(out, "api version: {}", info.api_version)?;
    writeln!(out, "flags: 0x{:08x}", info.flags)?;
    writeln!(out, "metadata: {}", serde_json::to_string(&info.meta)?)?;
    writeln!(out, "indexed: {}", if info.indexed { "yes" } else { "no" })?;
    writeln!(out, "chunks: {}", info.chunks)?;
    writeln!(out, "entries: {}", info.entries)?;
    if let (Some(first), Some(last)) = (info.first_ordinal, info.last_ordinal) {
        writeln!(out, "ordinals: {first}..={last}")?;
    }
    for (queue, count) in &info.queues {
        writeln!(out, "  queue {queue}: {count} entries")?;
    }
    Ok(())
}
