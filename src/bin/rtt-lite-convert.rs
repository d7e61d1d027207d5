use anyhow::{Context, Result};
use rtt_lite_trace::sysview::{Dispatcher, SystemView, TextSink};
use rtt_lite_trace::{Decoder, DecoderError, DecoderOptions};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

// Exit codes understood by an external supervisor: a recoverable failure
// (the byte source went away) is worth a restart, anything else is not.
const RECOVERABLE_EXIT_CODE: i32 = 2;
const UNRECOVERABLE_EXIT_CODE: i32 = 3;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Converts an RTT lite trace capture into SystemView-style events. Each recovered stream defect is reported on stderr and embedded in the output as an error event."
)]
struct Opt {
    #[structopt(
        long = "--buffer-cap",
        default_value = "65536",
        help = "Reject any side-band buffer assembly larger than this many bytes"
    )]
    buffer_cap: usize,

    #[structopt(
        short = "-o",
        long = "--output",
        parse(from_os_str),
        help = "Write converted events to this file instead of stdout"
    )]
    output: Option<PathBuf>,

    #[structopt(name = "FILE", parse(from_os_str), help = "Raw trace capture file.")]
    file: PathBuf,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();

    if let Err(e) = run(Opt::from_args()) {
        eprintln!("{:#}", e);

        let recoverable = e.downcast_ref::<DecoderError>().is_some()
            || e.downcast_ref::<io::Error>().is_some();
        process::exit(if recoverable {
            RECOVERABLE_EXIT_CODE
        } else {
            UNRECOVERABLE_EXIT_CODE
        })
    }
}

fn run(opt: Opt) -> Result<()> {
    let file = File::open(&opt.file)
        .with_context(|| format!("failed to open {}", opt.file.display()))?;
    let mut decoder = Decoder::new(
        file,
        DecoderOptions {
            buffer_cap: opt.buffer_cap,
            ..DecoderOptions::default()
        },
    );

    let out: Box<dyn Write> = match &opt.output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("failed to create {}", path.display())
        })?)),
        None => Box::new(io::stdout()),
    };
    let mut dispatcher = Dispatcher::new(TextSink::new(out));

    let mut records = 0u64;
    loop {
        match decoder.next_record().context("decoder error")? {
            None => break,
            Some(record) => {
                dispatcher
                    .dispatch(&record)
                    .context("failed to write converted event")?;
                records += 1;
            }
        }
    }

    for line in decoder.header_lines() {
        log::info!("capture header: {}", line);
    }
    for line in decoder.footer_lines() {
        log::info!("capture footer: {}", line);
    }
    log::info!("{} event(s) converted", records);

    dispatcher.into_inner().flush()?;
    Ok(())
}
