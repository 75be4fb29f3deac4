use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::tick;
use dma_readout::{Conf, PcieDevice, Readout, RunOutcome, SimDevice, Status, StatusExit};
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode, WriteLogger};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Words per simulated event when no hardware is attached.
const SIM_WORDS_PER_EVENT: usize = 64;

#[derive(Parser, Debug)]
#[command(version, about = "DMA readout for the detector crate", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run number, overriding the configuration
    #[arg(short, long)]
    run: Option<u64>,

    /// Log status to the terminal instead of drawing the status view
    #[arg(long)]
    headless: bool,

    /// Log file used while the status view owns the terminal
    #[arg(long, default_value = "readout.log")]
    log_file: PathBuf,
}

fn init_logging(args: &Args) -> Result<()> {
    if args.headless {
        TermLogger::init(
            LevelFilter::Info,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )?;
    } else {
        let file = File::create(&args.log_file)
            .with_context(|| format!("creating log file {:?}", args.log_file))?;
        WriteLogger::init(LevelFilter::Info, simplelog::Config::default(), file)?;
    }
    Ok(())
}

fn report(outcome: Option<RunOutcome>) {
    let Some(outcome) = outcome else { return };
    match outcome.acquisition {
        Some(Ok(summary)) => info!(
            "Run {}: {} transfers, {} bytes",
            outcome.run_number, summary.transfers, summary.bytes
        ),
        Some(Err(e)) => error!("Run {} ended with error: {e}", outcome.run_number),
        None => error!("Run {} reader thread did not finish cleanly", outcome.run_number),
    }
}

fn run_headless(readout: &mut Readout) -> Result<()> {
    let ticker = tick(Duration::from_secs(1));
    while !readout.is_finished() {
        let _ = ticker.recv();
        let snap = readout.snapshot();
        let fields: Vec<String> = snap
            .named()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        info!("{}", fields.join(" "));
    }
    report(readout.wait());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut conf = Conf::from_file(&args.config)
        .with_context(|| format!("loading config {:?}", args.config))?;
    if let Some(run) = args.run {
        conf.run_settings.run_number = run;
        conf.run_settings.persist_run_number = false;
    }

    // The vendor driver binding is supplied by the hardware host; stand-alone
    // builds read out the simulated crate.
    let device: Arc<dyn PcieDevice> = Arc::new(SimDevice::new(
        conf.run_settings.run_number,
        SIM_WORDS_PER_EVENT,
    ));
    let mut readout = Readout::new(device);
    readout.configure(conf)?;
    readout.set_running(true)?;

    if args.headless {
        return run_headless(&mut readout);
    }

    let mut terminal = ratatui::init();
    let mut status = Status::new(readout.metrics());
    let result = status.run(&mut terminal, &mut readout);
    ratatui::restore();
    match result? {
        StatusExit::Quit => info!("Stopped by user"),
        StatusExit::Finished => info!("Run finished"),
    }
    Ok(())
}
