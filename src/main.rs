use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serialport::SerialPort as _;

use bioz_core::{
    logging, ring_buffer, AcquisitionConfig, ByteCollector, CalibrationKind, DataSignal, Pipeline,
    PipelineSettings, SweepEvent,
};

#[derive(Parser, Debug)]
#[command(name = "bioz-demo", about = "Run a bio-impedance sweep against the measurement controller")]
struct Args {
    /// Serial port connected to the controller (e.g. /dev/ttyUSB0)
    port: Option<String>,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of DUTs to sweep (1-4)
    #[arg(long)]
    duts: Option<u8>,
    /// First frequency index
    #[arg(long)]
    start_index: Option<u8>,
    /// Last frequency index (inclusive)
    #[arg(long)]
    end_index: Option<u8>,
    /// Calibration table CSV (default: analytic front-end model)
    #[arg(long)]
    calibration: Option<PathBuf>,
}

fn main() {
    logging::init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::load(path)?,
        None => AcquisitionConfig::default(),
    };
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(duts) = args.duts {
        config.sweep.dut_count = duts;
    }
    if let Some(idx) = args.start_index {
        config.sweep.start_freq_index = idx;
    }
    if let Some(idx) = args.end_index {
        config.sweep.end_freq_index = idx;
    }
    if let Some(path) = &args.calibration {
        config.calibration.strategy = CalibrationKind::Table;
        config.calibration.table_path = Some(path.clone());
    }
    let calibration = config.build_calibration()?;

    println!("--- Connecting to measurement controller ---");
    let port = serialport::new(&config.serial.port, config.serial.baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
        .with_context(|| format!("failed to open serial port {}", config.serial.port))?;
    let writer = port
        .try_clone()
        .context("failed to clone serial port for command channel")?;

    // The collector thread plays the receive-interrupt role: it only drains
    // the peripheral into the ring and raises the data signal.
    let (producer, consumer) = ring_buffer(512);
    let signal = Arc::new(DataSignal::new());
    let collecting = Arc::new(AtomicBool::new(true));
    let collector_thread = {
        let mut collector = ByteCollector::new(port, producer, Arc::clone(&signal));
        let collecting = Arc::clone(&collecting);
        thread::spawn(move || {
            while collecting.load(Ordering::Acquire) {
                collector.poll();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let settings = PipelineSettings {
        command: config.command.clone(),
        ..PipelineSettings::default()
    };
    let pipeline = Pipeline::spawn(consumer, Arc::clone(&signal), Box::new(writer), calibration, settings)?;
    let events = pipeline.events();

    let sweep = &config.sweep;
    println!(
        "Starting sweep: {} DUT(s), frequency indices {}..={}",
        sweep.dut_count, sweep.start_freq_index, sweep.end_freq_index
    );
    if !pipeline.start_sweep(sweep.dut_count, sweep.start_freq_index, sweep.end_freq_index)? {
        bail!("controller did not acknowledge the start command");
    }

    loop {
        match events.recv_timeout(Duration::from_secs(120)) {
            Ok(SweepEvent::DutComplete { dut_id }) => {
                println!("DUT {dut_id} complete");
            }
            Ok(SweepEvent::SweepComplete) => {
                println!("Sweep complete");
                break;
            }
            Err(_) => {
                let _ = pipeline.stop_sweep();
                bail!("timed out waiting for sweep data");
            }
        }
    }

    // The store fills on the pipeline worker, slightly behind the completion
    // signal; give it a moment to drain the sample channel.
    thread::sleep(Duration::from_millis(100));

    let kind = pipeline.active_sweep();
    let store = pipeline.store();
    let store = store.lock().unwrap();
    for dut in 0..sweep.dut_count as usize {
        let points = store.set(kind).dut_points(dut);
        println!("DUT {} ({} points):", dut + 1, points.len());
        for p in points {
            println!(
                "  {:>8} Hz  |Z| = {:>10.2} ohm  phase = {:>7.2} deg{}",
                p.freq_hz,
                p.magnitude_ohm,
                p.phase_deg,
                if p.valid { "" } else { "  (invalid)" }
            );
        }
    }
    drop(store);

    let stats = pipeline.stats();
    if stats != Default::default() {
        println!(
            "Losses: ring overflow {}, samples dropped {}, calibration misses {}, rejected points {}",
            stats.ring_overflow, stats.samples_dropped, stats.calibration_misses, stats.rejected_points
        );
    }

    collecting.store(false, Ordering::Release);
    let _ = collector_thread.join();
    pipeline.shutdown();
    println!("Done.");
    Ok(())
}
