// Benchmark harness for multi-producer term appends.
//
// Purpose:
// - Measure append throughput while N producer threads race on one tail counter.
// - Emit machine-readable JSON to stdout and a human-readable table to stderr.
//
// Design notes:
// - Runs over anonymous memory; each run fills one term and stops producers once it trips.
// - The term is validated after every run so the numbers never come from a broken term.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use clap::ValueEnum;
use memmap2::MmapMut;
use serde_json::{Value, json};

use termlog::core::appender::{AppendOutcome, TermAppender};
use termlog::core::buffer::AtomicBuffer;
use termlog::core::error::{Error, ErrorKind};
use termlog::core::header::HeaderWriter;
use termlog::core::tail::TailCounter;
use termlog::core::validate;

#[derive(Clone, Debug)]
pub struct BenchArgs {
    pub term_length: usize,
    pub payload_sizes: Vec<usize>,
    pub threads: Vec<usize>,
    pub format: BenchFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum BenchFormat {
    Json,
    Table,
    Both,
}

#[derive(Clone, Copy, Debug)]
struct BenchResult {
    threads: usize,
    payload_bytes: usize,
    appended: u64,
    failed: u64,
    elapsed: Duration,
}

impl BenchResult {
    fn msgs_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.appended as f64 / secs
    }

    fn to_json(self) -> Value {
        json!({
            "threads": self.threads,
            "payload_bytes": self.payload_bytes,
            "appended": self.appended,
            "failed": self.failed,
            "elapsed_ms": self.elapsed.as_secs_f64() * 1000.0,
            "msgs_per_sec": self.msgs_per_sec(),
        })
    }
}

pub fn run_bench(args: BenchArgs, program_version: &str) -> Result<(), Error> {
    if args.threads.iter().any(|threads| *threads == 0) {
        return Err(Error::new(ErrorKind::Usage).with_message("thread count must be positive"));
    }

    let mut results = Vec::new();
    for &payload_bytes in &args.payload_sizes {
        for &threads in &args.threads {
            let result = run_case(args.term_length, payload_bytes, threads)?;
            tracing::debug!(threads, payload_bytes, appended = result.appended, "bench case done");
            results.push(result);
        }
    }

    if matches!(args.format, BenchFormat::Json | BenchFormat::Both) {
        let report = json!({
            "version": program_version,
            "term_length": args.term_length,
            "results": results.iter().map(|result| result.to_json()).collect::<Vec<_>>(),
        });
        let text = serde_json::to_string_pretty(&report).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode bench report")
                .with_source(err)
        })?;
        println!("{text}");
    }
    if matches!(args.format, BenchFormat::Table | BenchFormat::Both) {
        write_table(&results).map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
    }
    Ok(())
}

fn run_case(term_length: usize, payload_bytes: usize, threads: usize) -> Result<BenchResult, Error> {
    let mut term_map = MmapMut::map_anon(term_length)
        .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
    let mut metadata_map =
        MmapMut::map_anon(64).map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
    let term = AtomicBuffer::new(&mut term_map[..])?;
    let tail = TailCounter::new(AtomicBuffer::new(&mut metadata_map[..])?, 0)?;
    tail.reset(0)?;
    let appender = TermAppender::new(term, tail)?;
    let header = HeaderWriter::new(1, 1);
    let header = &header;
    let payload = vec![0x5Au8; payload_bytes];
    let payload = payload.as_slice();

    let started = Instant::now();
    let counts = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|_| scope.spawn(move || produce(appender, header, payload)))
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    Err(Error::new(ErrorKind::Internal).with_message("producer panicked"))
                })
            })
            .collect::<Result<Vec<_>, Error>>()
    })?;
    let elapsed = started.elapsed();

    validate::validate_term(&term, tail.raw_tail_volatile()?)?;

    let (appended, failed) = counts
        .iter()
        .fold((0, 0), |(appended, failed), (a, f)| (appended + a, failed + f));
    Ok(BenchResult {
        threads,
        payload_bytes,
        appended,
        failed,
        elapsed,
    })
}

fn produce(appender: TermAppender<'_>, header: &HeaderWriter, payload: &[u8]) -> Result<(u64, u64), Error> {
    let mut appended = 0u64;
    loop {
        let result = appender.append_unfragmented(header, payload, None)?;
        match AppendOutcome::from_result(result) {
            AppendOutcome::Appended { .. } => appended += 1,
            AppendOutcome::Tripped { .. } => return Ok((appended, 0)),
            AppendOutcome::Failed { .. } => return Ok((appended, 1)),
        }
    }
}

fn write_table(results: &[BenchResult]) -> io::Result<()> {
    let mut err = io::stderr().lock();
    writeln!(
        err,
        "{:>8} {:>10} {:>12} {:>8} {:>12} {:>14}",
        "threads", "payload", "appended", "failed", "elapsed_ms", "msgs/sec"
    )?;
    for result in results {
        writeln!(
            err,
            "{:>8} {:>10} {:>12} {:>8} {:>12.3} {:>14.0}",
            result.threads,
            result.payload_bytes,
            result.appended,
            result.failed,
            result.elapsed.as_secs_f64() * 1000.0,
            result.msgs_per_sec()
        )?;
    }
    Ok(())
}
