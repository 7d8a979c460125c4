//! CLI entrypoint for the segalloc trace harness.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use segalloc_core::{AllocatorConfig, AllocatorLogLevel};
use segalloc_harness::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
use segalloc_harness::{ReplayOptions, ReplayReport, Trace, replay_with_sink, synth};

/// Trace tooling for the segalloc allocator.
#[derive(Debug, Parser)]
#[command(name = "segalloc-harness")]
#[command(about = "Trace replay harness for the segalloc allocator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay traces and report utilization and timing as JSON.
    Replay {
        /// Trace files in `.rep` format.
        #[arg(long = "trace", required = true, num_args = 1..)]
        traces: Vec<PathBuf>,
        /// Validate the heap after every operation.
        #[arg(long)]
        check: bool,
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Lowest allocator record level written to `--log`.
        #[arg(long)]
        log_level: Option<String>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        heap: HeapArgs,
    },
    /// Generate a random well-formed trace.
    Synth {
        /// Output trace path.
        #[arg(long)]
        output: PathBuf,
        /// PRNG seed (decimal or 0x...).
        #[arg(long, default_value = "0x9E37_79B9_7F4A_7C15")]
        seed: String,
        /// Number of operations.
        #[arg(long, default_value_t = 2000)]
        ops: usize,
        /// Largest request size in bytes.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
    },
    /// Replay traces with the heap validator after every operation. Exits
    /// with status 1 when any trace fails.
    Check {
        /// Trace files in `.rep` format.
        #[arg(long = "trace", required = true, num_args = 1..)]
        traces: Vec<PathBuf>,
        #[command(flatten)]
        heap: HeapArgs,
    },
}

/// Allocator overrides applied on top of `SEGALLOC_*` environment settings.
#[derive(Debug, Args)]
struct HeapArgs {
    /// Minimum arena growth step in bytes.
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Arena byte limit.
    #[arg(long)]
    max_heap: Option<usize>,
}

impl HeapArgs {
    fn config(&self) -> Result<AllocatorConfig, Box<dyn std::error::Error>> {
        let mut config = AllocatorConfig::from_env()?;
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(max_heap) = self.max_heap {
            config.max_heap = max_heap;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|err| format!("invalid seed {raw:?}: {err}"))
}

fn write_json(
    output: Option<&Path>,
    value: &impl serde::Serialize,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, json + "\n")?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Replays every trace in order. Failures are reported on stderr (and in
/// the log) and do not stop the remaining traces.
fn run_traces(
    traces: &[PathBuf],
    options: &ReplayOptions,
    mut emitter: Option<&mut LogEmitter>,
) -> Result<(Vec<ReplayReport>, usize), Box<dyn std::error::Error>> {
    let mut reports = Vec::new();
    let mut failures = 0;

    for path in traces {
        let trace_file = path.display().to_string();
        let trace = match Trace::from_file(path) {
            Ok(trace) => trace,
            Err(err) => {
                eprintln!("{trace_file}: {err}");
                failures += 1;
                if let Some(emitter) = emitter.as_deref_mut() {
                    emitter.emit_entry(
                        LogEntry::new("", LogLevel::Error, "trace_parse_failed")
                            .with_trace_file(&trace_file)
                            .with_outcome(Outcome::Error)
                            .with_details(serde_json::json!({ "error": err.to_string() })),
                    )?;
                }
                continue;
            }
        };

        let keep_records = emitter.is_some();
        let mut records = Vec::new();
        let result = replay_with_sink(&trace, options, |record| {
            if keep_records {
                records.push(record);
            }
        });

        if let Some(emitter) = emitter.as_deref_mut() {
            for record in &records {
                emitter.emit_record(record, Some(&trace_file))?;
            }
            let entry = match &result {
                Ok(report) => LogEntry::new("", LogLevel::Info, "replay_result")
                    .with_outcome(Outcome::Pass)
                    .with_duration_ms(report.elapsed_us / 1000)
                    .with_details(serde_json::to_value(report)?),
                Err(err) => LogEntry::new("", LogLevel::Error, "replay_result")
                    .with_outcome(Outcome::Fail)
                    .with_details(serde_json::json!({ "error": err.to_string() })),
            };
            emitter.emit_entry(entry.with_trace_file(&trace_file))?;
        }

        match result {
            Ok(report) => {
                eprintln!(
                    "{trace_file}: {} ops, utilization {:.1}%, {} us",
                    report.ops,
                    report.utilization * 100.0,
                    report.elapsed_us
                );
                reports.push(report);
            }
            Err(err) => {
                eprintln!("{trace_file}: {err}");
                failures += 1;
            }
        }
    }
    Ok((reports, failures))
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            traces,
            check,
            log,
            log_level,
            output,
            heap,
        } => {
            let mut config = heap.config()?;
            if let Some(raw) = log_level.as_deref() {
                config.log_level = AllocatorLogLevel::parse_filter(raw)
                    .map_err(|()| format!("invalid log level {raw:?}"))?;
            }
            let mut emitter = match &log {
                Some(path) => Some(LogEmitter::to_file(path, "replay")?),
                None => {
                    // Nothing would read the records.
                    config.log_level = None;
                    None
                }
            };
            let options = ReplayOptions {
                config,
                check_each_op: check,
            };

            let (reports, failures) = run_traces(&traces, &options, emitter.as_mut())?;
            if let Some(emitter) = emitter.as_mut() {
                emitter.flush()?;
            }
            write_json(output.as_deref(), &reports)?;
            if failures > 0 {
                return Ok(ExitCode::from(1));
            }
        }
        Command::Synth {
            output,
            seed,
            ops,
            max_size,
        } => {
            let seed = parse_seed(&seed)?;
            let trace = synth(seed, ops, max_size);
            std::fs::write(&output, trace.to_rep())?;
            eprintln!(
                "Wrote {} ({} ops, {} ids)",
                output.display(),
                trace.ops.len(),
                trace.num_ids
            );
        }
        Command::Check { traces, heap } => {
            let mut config = heap.config()?;
            config.log_level = None;
            let options = ReplayOptions {
                config,
                check_each_op: true,
            };
            let (reports, failures) = run_traces(&traces, &options, None)?;
            let summary = serde_json::json!({
                "ok": failures == 0,
                "traces": traces.len(),
                "passed": reports.len(),
                "failed": failures,
                "reports": reports,
            });
            write_json(None, &summary)?;
            if failures > 0 {
                return Ok(ExitCode::from(1));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
