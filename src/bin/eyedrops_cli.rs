use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eyedrops::calibration::CalibrationPhase;
use eyedrops::config::{AppConfig, CalibrationConfig};
use eyedrops::engine::EngineHandle;
use eyedrops::link::{Device, DeviceId, SimulatedTransport};
use eyedrops::managers::CoreEvent;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;

/// Simulated sensor sample period
const SAMPLE_PERIOD_US: u32 = 10_000;

/// Excursion of a scripted blink above or below baseline
const BLINK_AMPLITUDE: i16 = 150;

const RESTING_LEVEL: i16 = 20;

#[derive(Parser, Debug)]
#[command(
    name = "eyedrops_cli",
    about = "Drive the eyedrops core against a simulated blink sensor"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Calibrate, then classify scripted blinks; prints every event as JSON
    Simulate {
        /// JSON configuration file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of blinks to script after calibration
        #[arg(long, default_value_t = 4)]
        blinks: u32,
        /// Name under which the calibrated profile is stored
        #[arg(long, default_value = "default")]
        profile: String,
    },
    /// Print the default configuration as JSON
    DefaultConfig,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate {
            config,
            blinks,
            profile,
        } => {
            let config = config
                .map(AppConfig::load_from_file)
                .unwrap_or_default();
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            runtime.block_on(run_simulate(config, blinks, &profile))
        }
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&AppConfig::default())?);
            Ok(ExitCode::from(0))
        }
    }
}

async fn run_simulate(config: AppConfig, blinks: u32, profile_name: &str) -> Result<ExitCode> {
    let calibration_config = config.calibration.clone();
    let sensor = Device {
        id: DeviceId::new("SIM:00:00:01"),
        name: "eyeDrops (simulated)".to_string(),
        rssi: -45,
    };
    let transport = Arc::new(SimulatedTransport::with_device(sensor));
    let engine = EngineHandle::new(transport.clone(), config);

    let mut printer_rx = engine.subscribe_events_unbounded();
    let printer = tokio::spawn(async move {
        while let Some(event) = printer_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => log::warn!("[CLI] Could not encode event: {}", err),
            }
        }
    });
    let mut blink_rx = engine.subscribe_events();

    let scan = engine
        .link()
        .scan(Some(Duration::from_millis(200)))
        .await
        .context("scanning for sensors")?;
    let devices: Vec<Device> = scan.collect().await;
    let Some(device) = devices.into_iter().next() else {
        bail!("no sensor found");
    };

    let mut rng = StdRng::seed_from_u64(7);
    let mut clock_us = 0u32;

    engine
        .start_calibration(&device.id)
        .await
        .context("starting calibration")?;
    let mut phases = engine.calibration().subscribe_phase();
    phases
        .wait_for(|phase| *phase == CalibrationPhase::CollectingBaseline || phase.is_terminal())
        .await?;

    feed_calibration(&transport, &calibration_config, &mut rng, &mut clock_us).await;

    let outcome = tokio::time::timeout(
        calibration_config.stage_timeout(),
        phases.wait_for(|phase| matches!(phase, CalibrationPhase::Ready(_)) || phase.is_terminal()),
    )
    .await
    .context("calibration did not finish")??
    .clone();
    if let CalibrationPhase::Failed(reason) = outcome {
        bail!("calibration failed: {reason}");
    }

    engine
        .commit_calibration(profile_name, true)
        .await
        .context("committing calibration")?;
    engine
        .start_streaming(profile_name)
        .await
        .context("starting classification")?;

    feed_blinks(&transport, blinks, &mut rng, &mut clock_us).await;
    let detected = count_blinks(&mut blink_rx, blinks).await;

    engine.shutdown().await;
    drop(engine);
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    let snapshot = eyedrops::telemetry::hub().snapshot();
    eprintln!(
        "detected {detected}/{blinks} blinks; {} telemetry events recorded",
        snapshot.total_events
    );
    Ok(if detected == blinks {
        ExitCode::from(0)
    } else {
        ExitCode::from(2)
    })
}

fn noisy(rng: &mut StdRng, level: i16, count: usize) -> Vec<i16> {
    (0..count).map(|_| level + rng.gen_range(-3..=3)).collect()
}

async fn push(transport: &SimulatedTransport, clock_us: &mut u32, values: &[i16]) {
    *clock_us = transport.push_samples(*clock_us, SAMPLE_PERIOD_US, values);
    // Let the pump drain so the sample queue never reaches its high-water mark
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Baseline, then the configured number of upward and downward trials
async fn feed_calibration(
    transport: &SimulatedTransport,
    config: &CalibrationConfig,
    rng: &mut StdRng,
    clock_us: &mut u32,
) {
    let samples_for = |duration_us: u64| (duration_us / SAMPLE_PERIOD_US as u64).max(1) as usize;
    let baseline_samples = samples_for(config.baseline_duration_us());
    let trial_samples = samples_for(config.trial_window_us());
    tracing::debug!(baseline_samples, trial_samples, "feeding calibration signal");

    push(transport, clock_us, &noisy(rng, RESTING_LEVEL, baseline_samples)).await;
    for excursion in [BLINK_AMPLITUDE, -BLINK_AMPLITUDE] {
        for _ in 0..config.trials.max(1) {
            let mut trial = noisy(rng, RESTING_LEVEL, trial_samples);
            let peak = trial_samples / 2;
            trial[peak] = RESTING_LEVEL + excursion;
            push(transport, clock_us, &trial).await;
        }
    }
    // Closes the last trial window
    push(transport, clock_us, &[RESTING_LEVEL]).await;
}

async fn feed_blinks(transport: &SimulatedTransport, blinks: u32, rng: &mut StdRng, clock_us: &mut u32) {
    for index in 0..blinks {
        let excursion = if index % 2 == 0 {
            BLINK_AMPLITUDE
        } else {
            -BLINK_AMPLITUDE
        };
        push(transport, clock_us, &noisy(rng, RESTING_LEVEL, 20)).await;
        push(transport, clock_us, &[RESTING_LEVEL + excursion; 6]).await;
    }
    push(transport, clock_us, &noisy(rng, RESTING_LEVEL, 20)).await;
}

async fn count_blinks(rx: &mut broadcast::Receiver<CoreEvent>, expected: u32) -> u32 {
    let mut detected = 0;
    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);

    while detected < expected {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => match event {
                Ok(CoreEvent::BlinkDetected(_)) => detected += 1,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[CLI] Missed {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    detected
}
