// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command-line wrapper around the decoder: replays a compressed log to
//! stdout or a file, in arrival or chronological order, with an optional
//! per-id aggregation count.

use anyhow::Context;
use clap::Parser;
use libdd_binlog_decoder::{Aggregation, Decoder};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "datadog-binlog-decoder",
    about = "Decompresses a binary log file into human-readable text"
)]
struct Args {
    /// Compressed log file to decode.
    log_file: PathBuf,

    /// Output file; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Replay in chronological order instead of arrival order.
    #[arg(long)]
    ordered: bool,

    /// Count the records carrying this message id (arrival-order replay
    /// only).
    #[arg(long)]
    filter_id: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut decoder = Decoder::new();
    decoder.open(&args.log_file)?;

    let mut out: BufWriter<Box<dyn Write>> = BufWriter::new(match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("could not create {path:?}"))?,
        ),
        None => Box::new(std::io::stdout()),
    });

    if args.ordered {
        let printed = decoder.decompress_ordered(&mut out)?;
        writeln!(out, "\n# {printed} log messages in chronological order")?;
    } else {
        let mut matched = 0u64;
        let mut callback = |_format: &str, _msg: &libdd_binlog_decoder::LogMessage| matched += 1;
        let aggregation = args.filter_id.map(|target_id| Aggregation {
            target_id,
            callback: &mut callback,
        });
        decoder.decompress_unordered_filtered(&mut out, aggregation)?;
        if let Some(id) = args.filter_id {
            writeln!(out, "# {matched} records matched id {id}")?;
        }
    }
    out.flush()?;
    Ok(())
}
