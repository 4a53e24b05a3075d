//! Purpose: `termlog` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout on success.
//! Invariants: Errors are emitted as JSON on stderr; exit code comes from `to_exit_code`.
//! Invariants: A tripped or failed append is reported as `Busy`; the term must be rotated.
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

mod bench;

use bench::{BenchArgs, BenchFormat, run_bench};
use termlog::core::appender::AppendOutcome;
use termlog::core::error::{Error, ErrorKind, to_exit_code};
use termlog::core::log::{TERM_MIN_LENGTH, TermLog, TermLogOptions};
use termlog::core::tail;
use termlog::core::validate::FrameSummary;

#[derive(Parser)]
#[command(
    name = "termlog",
    version,
    about = "Lock-free shared-memory term logs",
    long_about = None,
    after_help = r#"EXAMPLES
  $ termlog create events.termlog --session-id 7 --stream-id 1001
  $ termlog append events.termlog 'hello'
  $ termlog append events.termlog --max-payload 992 "$(cat big.txt)"
  $ termlog inspect events.termlog --frames
  $ termlog rotate events.termlog
  $ termlog bench --threads 1,2,4,8 --format table"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Create a term log file")]
    Create {
        #[arg(help = "Path of the new log file", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, default_value_t = TERM_MIN_LENGTH, help = "Term length in bytes (power of two)")]
        term_length: usize,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        session_id: i32,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        stream_id: i32,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        initial_term_id: i32,
    },
    #[command(about = "Append one message to the active term")]
    Append {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(help = "Message payload (UTF-8 text)")]
        message: String,
        #[arg(long, help = "Split into fragments carrying at most this many payload bytes")]
        max_payload: Option<usize>,
        #[arg(long, conflicts_with = "max_payload", help = "Write through a zero-copy claim")]
        claim: bool,
    },
    #[command(about = "Validate the term and print its state")]
    Inspect {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Include every published frame")]
        frames: bool,
    },
    #[command(about = "Recycle the term under a new term id")]
    Rotate {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, allow_negative_numbers = true, help = "Next term id (default: current + 1)")]
        term_id: Option<i32>,
    },
    #[command(about = "Measure multi-producer append throughput")]
    Bench {
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        term_length: usize,
        #[arg(long, value_delimiter = ',', default_values_t = vec![64usize, 1024])]
        payload: Vec<usize>,
        #[arg(long, value_delimiter = ',', default_values_t = vec![1usize, 2, 4])]
        threads: Vec<usize>,
        #[arg(long, value_enum, default_value = "json")]
        format: BenchFormat,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run(Cli::parse()) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Create {
            path,
            term_length,
            session_id,
            stream_id,
            initial_term_id,
        } => {
            let options = TermLogOptions::new(term_length)
                .with_ids(session_id, stream_id)
                .with_initial_term_id(initial_term_id);
            let log = TermLog::create(&path, options)?;
            emit_json(&json!({
                "created": log.path().display().to_string(),
                "term_length": log.header().term_length,
                "term_id": initial_term_id,
                "session_id": session_id,
                "stream_id": stream_id,
            }))
        }
        Command::Append {
            path,
            message,
            max_payload,
            claim,
        } => {
            let log = TermLog::open(&path)?;
            let appender = log.appender()?;
            let header = log.header_writer();
            let payload = message.as_bytes();
            if payload.len() > log.max_message_length() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "message of {} bytes exceeds the {} byte limit for this log",
                        payload.len(),
                        log.max_message_length()
                    ))
                    .with_path(&path));
            }
            let result = if claim {
                let (result, claimed) = appender.claim(&header, payload.len())?;
                if let Some(mut claimed) = claimed {
                    claimed.payload_mut()?.copy_from_slice(payload);
                    claimed.commit()?;
                }
                result
            } else if let Some(max_payload) = max_payload {
                appender.append_fragmented(&header, payload, max_payload, None)?
            } else {
                appender.append_unfragmented(&header, payload, None)?
            };
            match AppendOutcome::from_result(result) {
                AppendOutcome::Appended {
                    term_id,
                    term_offset,
                } => emit_json(&json!({
                    "term_id": term_id,
                    "term_offset": term_offset,
                    "payload_bytes": payload.len(),
                })),
                AppendOutcome::Tripped { term_id } => Err(Error::new(ErrorKind::Busy)
                    .with_message("term exhausted; rotate before appending")
                    .with_term_id(term_id)
                    .with_path(&path)),
                AppendOutcome::Failed { term_id } => Err(Error::new(ErrorKind::Busy)
                    .with_message("term already exhausted by another producer")
                    .with_term_id(term_id)
                    .with_path(&path)),
            }
        }
        Command::Inspect { path, frames } => {
            let log = TermLog::open(&path)?;
            let report = log.validate()?;
            let mut value = serde_json::to_value(report).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode report")
                    .with_source(err)
            })?;
            value["term_length"] = json!(log.header().term_length);
            value["session_id"] = json!(log.header().session_id);
            value["stream_id"] = json!(log.header().stream_id);
            if frames {
                value["frames"] = Value::Array(log.frames()?.iter().map(frame_json).collect());
            }
            emit_json(&value)
        }
        Command::Rotate { path, term_id } => {
            let log = TermLog::open(&path)?;
            let current = tail::term_id(log.raw_tail()?);
            let next = term_id.unwrap_or_else(|| current.wrapping_add(1));
            log.rotate(next)?;
            emit_json(&json!({
                "rotated": log.path().display().to_string(),
                "previous_term_id": current,
                "term_id": next,
            }))
        }
        Command::Bench {
            term_length,
            payload,
            threads,
            format,
        } => run_bench(
            BenchArgs {
                term_length,
                payload_sizes: payload,
                threads,
                format,
            },
            env!("CARGO_PKG_VERSION"),
        ),
    }
}

fn frame_json(frame: &FrameSummary) -> Value {
    let header = frame.header;
    json!({
        "offset": frame.offset,
        "length": header.frame_length,
        "type": if header.is_padding() { "padding" } else { "data" },
        "flags": header.flags,
        "term_id": header.term_id,
        "reserved_value": header.reserved_value,
    })
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let text = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{text}");
    Ok(())
}

fn error_json(err: &Error) -> Value {
    let mut inner = json!({ "kind": format!("{:?}", err.kind()) });
    if let Some(message) = err.message() {
        inner["message"] = json!(message);
    }
    if let Some(path) = err.path() {
        inner["path"] = json!(path.display().to_string());
    }
    if let Some(term_id) = err.term_id() {
        inner["term_id"] = json!(term_id);
    }
    if let Some(offset) = err.offset() {
        inner["offset"] = json!(offset);
    }
    if let Some(source) = std::error::Error::source(err) {
        inner["cause"] = json!(source.to_string());
    }
    json!({ "error": inner })
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {err}");
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}
