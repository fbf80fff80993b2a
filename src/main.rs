mod agent;
mod blob;
mod camera_controller;
mod classify;
mod common;
mod decoder;
mod error;
mod led_controller;
mod link;
mod polarity;
mod power_controller;
mod user_config;

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use crate::{
    agent::run_consensus,
    blob::detect_led_center,
    camera_controller::{skip_frames, start_camera_controller, CameraSource},
    common::{Clock, FrameSource, MonotonicClock, Point},
    decoder::monitor_led_frequencies,
    led_controller::start_led_controller,
    link::{format_decode_report, format_frequency, open_link, UartLink},
    polarity::{measure_frequency, measure_led_frequency, offset_probe},
    power_controller::monitor_power,
    user_config::{
        AgentsConfig, BeaconConfig, PipelineConfig, SensorConfig, UartConfig, CONFIG_PATH,
    },
};

/// LED blink-rate measurement and decoding with an event camera.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding sensor.json, uart.json, pipeline.json, agents.json and beacon.json.
    #[arg(short, long, default_value = CONFIG_PATH)]
    config_dir: PathBuf,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Find the LED, measure its frequency once and report it.
    Measure,
    /// Like measure, with a second probe next to the LED centre.
    Dual,
    /// Read a bit stream sent as alternating blink rates.
    Decode,
    /// Run the frequency consensus agents.
    Consensus {
        /// Stop after this many ticks instead of running forever.
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Blink a WS281x LED at the frequency received over UART.
    Beacon,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    let task = match cli.command {
        Command::Beacon => return run_beacon(&cli.config_dir),
        Command::Measure => SensorTask::Measure,
        Command::Dual => SensorTask::Dual,
        Command::Decode => SensorTask::Decode,
        Command::Consensus { ticks } => SensorTask::Consensus { ticks },
    };
    run_sensor(&cli.config_dir, task)
}

/// The commands that read the event sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorTask {
    Measure,
    Dual,
    Decode,
    Consensus { ticks: Option<u64> },
}

fn run_sensor(config_dir: &Path, task: SensorTask) -> Result<()> {
    let sensor = SensorConfig::read(config_dir)?;
    let uart = UartConfig::read(config_dir)?;
    let pipeline = PipelineConfig::read(config_dir)?;

    let power_on = Arc::new(AtomicBool::new(false));
    let camera = start_camera_controller(power_on.clone(), sensor.clone());
    let _power_thread = monitor_power(
        sensor.power_pin,
        power_on.clone(),
        vec![camera.thread_handle.thread().clone(), thread::current()],
    )?;
    while !power_on.load(Ordering::Relaxed) {
        thread::park_timeout(Duration::from_secs(10));
    }

    let clock = MonotonicClock::new();
    let mut source = CameraSource::new(
        camera.frame_queue.clone(),
        power_on.clone(),
        sensor.frame_timeout_ms,
    );
    skip_frames(&mut source, &clock, sensor.warmup_ms).context("sensor warm-up failed")?;
    let mut link = open_link(&uart);

    match task {
        SensorTask::Measure => {
            let center = locate_led(&mut source, &clock, &pipeline)?;
            let m = measure_led_frequency(&mut source, &clock, center, &pipeline.measure)?;
            info!(
                "Transitions: {} detected at {:?} (threshold {:?}), frequency {:.2} Hz",
                m.transition_count(),
                center,
                m.threshold,
                m.frequency_hz
            );
            info!("Transition times: {:?}", m.transitions);
            info!("Intervals between transitions: {:?}", m.intervals());
            link.send_line(&format_frequency(m.frequency_hz))?;
        }
        SensorTask::Dual => {
            let center = locate_led(&mut source, &clock, &pipeline)?;
            let mut probes = vec![center];
            match offset_probe(center, pipeline.dual_offset, sensor.resolution) {
                Some(probe) => probes.push(probe),
                None => warn!(
                    "Second probe {:?} from {:?} is outside the frame, measuring the centre only",
                    pipeline.dual_offset, center
                ),
            }
            let measurements = measure_frequency(&mut source, &clock, &probes, &pipeline.measure)?;
            for m in &measurements {
                info!(
                    "Transitions: {} detected at {:?}, frequency {:.2} Hz",
                    m.transition_count(),
                    m.probe,
                    m.frequency_hz
                );
            }
            if let Some(primary) = measurements.first() {
                link.send_line(&format_frequency(primary.frequency_hz))?;
            }
        }
        SensorTask::Decode => {
            let center = locate_led(&mut source, &clock, &pipeline)?;
            let report = monitor_led_frequencies(&mut source, &clock, center, &pipeline.decode)?;
            link.send_line(&format_decode_report(&report))?;

            info!("=== FINAL RESULTS ===");
            info!("Synchronized: {}", report.synced);
            info!("Frequencies: {:?}", report.frequencies);
            info!("Binary: {:?}", report.bits);
            info!("Timestamps (ms): {:?}", report.timestamps);
            info!("Time differences (ms): {:?}", report.timestamp_diffs());
            info!("Text: {}", report.text.concat());
        }
        SensorTask::Consensus { ticks } => {
            let mut config = AgentsConfig::read(config_dir)?;
            run_consensus(
                &mut config.agents,
                &mut source,
                &clock,
                link.as_mut(),
                &config.measure,
                config.tick_ms,
                ticks,
            )?;
        }
    }

    // Let the capture thread release the device.
    power_on.store(false, Ordering::Relaxed);
    Ok(())
}

/// Largest blob centroid, or the configured default when nothing is bright.
fn locate_led<S, C>(source: &mut S, clock: &C, pipeline: &PipelineConfig) -> Result<Point>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    info!("Detecting LED blob...");
    let center = detect_led_center(source, clock, pipeline.detect_ms, &pipeline.blob)?;
    Ok(match center {
        Some(center) => {
            info!("Detected LED center: {:?}", center);
            center
        }
        None => {
            warn!(
                "No LED blob detected! Using default center {:?}.",
                pipeline.default_center
            );
            pipeline.default_center
        }
    })
}

fn run_beacon(config_dir: &Path) -> Result<()> {
    let beacon = BeaconConfig::read(config_dir)?;
    let uart = UartConfig::read(config_dir)?;

    let uart_link = if beacon.listen_uart && uart.enabled {
        match UartLink::open(&uart) {
            Ok(link) => Some(link),
            Err(e) => {
                warn!("UART not available ({}), blinking without updates", e);
                None
            }
        }
    } else {
        None
    };

    let power_on = Arc::new(AtomicBool::new(false));
    let led_thread_handle = start_led_controller(power_on.clone(), beacon.clone(), uart_link);
    let _power_thread = monitor_power(
        beacon.power_pin,
        power_on,
        vec![led_thread_handle.thread().clone()],
    )?;

    led_thread_handle
        .join()
        .map_err(|_| anyhow!("LED controller thread panicked"))
}
