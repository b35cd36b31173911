//! Reverbmeter - room reverberation time measurement
//!
//! Command line entry point: list devices, run live sweep measurements and
//! re-analyze stored recordings.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reverbmeter::analysis::rir::ExtractionMethod;
use reverbmeter::audio::engine::{CpalDevice, DuplexDevice};
use reverbmeter::audio::signal::SweepLaw;
use reverbmeter::config::AppConfig;
use reverbmeter::pipeline::{analyze_recording, AnalysisOutcome, MeasurementRig, RECORDING_PREFIX};
use reverbmeter::report;
use reverbmeter::store::DirectoryStore;
use reverbmeter::LoopbackDevice;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// Exit code when the run completed but no decay fit was valid
const EXIT_NO_VALID_FIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "reverbmeter",
    version,
    about = "Measure room reverberation time (T20/T25/T30) with a sine sweep"
)]
struct Cli {
    /// Config file (defaults to <data_dir>/reverbmeter/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of the persisted configuration
#[derive(Args, Debug)]
struct Overrides {
    /// Sample rate in Hz
    #[arg(long, short = 'r', global = true)]
    sample_rate: Option<u32>,
    /// Sweep length in seconds
    #[arg(long, global = true)]
    duration: Option<f64>,
    /// Extra capture after the sweep, in seconds
    #[arg(long, global = true)]
    tail: Option<f64>,
    #[arg(long, global = true)]
    start_freq: Option<f64>,
    #[arg(long, global = true)]
    end_freq: Option<f64>,
    #[arg(long, value_enum, global = true)]
    sweep: Option<SweepArg>,
    #[arg(long, value_enum, global = true)]
    method: Option<MethodArg>,
    /// Directory for recordings, responses and reports
    #[arg(long, short = 'o', global = true)]
    output_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SweepArg {
    Log,
    Linear,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    Correlation,
    Inverse,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List audio devices
    Devices,
    /// Play the sweep, record the room and report T60
    Measure {
        /// Free-form label stored in the recording name
        #[arg(long, short = 'l', default_value = "session")]
        label: String,
        /// Capture device name
        #[arg(long)]
        input: Option<String>,
        /// Playback device name
        #[arg(long)]
        output: Option<String>,
        /// Skip the calibration burst and play at full scale
        #[arg(long)]
        no_calibration: bool,
        /// Measure a simulated room instead of audio hardware
        #[arg(long)]
        simulate: bool,
        /// Reverberation time of the simulated room in seconds
        #[arg(long, default_value_t = 0.5)]
        room_t60: f64,
        /// Direct sound delay of the simulated room in milliseconds
        #[arg(long, default_value_t = 5.0)]
        room_delay_ms: f64,
    },
    /// Extract and analyze stored recordings
    Analyze {
        /// Recording key (defaults to the newest RIR_*.wav)
        key: Option<String>,
        /// Analyze every stored recording
        #[arg(long, conflicts_with = "key")]
        all: bool,
    },
    /// Show or persist the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
    /// Print the config file location
    Path,
    /// Write the effective configuration to the config file
    Save,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(duration) = self.duration {
            config.sweep_seconds = duration;
        }
        if let Some(tail) = self.tail {
            config.tail_seconds = tail;
        }
        if let Some(f) = self.start_freq {
            config.start_freq = f;
        }
        if let Some(f) = self.end_freq {
            config.end_freq = f;
        }
        if let Some(sweep) = self.sweep {
            config.sweep_law = match sweep {
                SweepArg::Log => SweepLaw::Logarithmic,
                SweepArg::Linear => SweepLaw::Linear,
            };
        }
        if let Some(method) = self.method {
            config.extraction_method = match method {
                MethodArg::Correlation => ExtractionMethod::CrossCorrelation,
                MethodArg::Inverse => ExtractionMethod::InverseFilter,
            };
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "reverbmeter=info".parse() {
        filter = filter.add_directive(directive);
    }
    if let Ok(directive) = "reverbmeter_core=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    info!(
        version = reverbmeter::VERSION,
        build = reverbmeter::BUILD_DATE,
        "reverbmeter starting"
    );
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::path);
    let mut config = AppConfig::load_from(&config_path);
    cli.overrides.apply(&mut config);

    match cli.command {
        Commands::Devices => run_devices(),
        Commands::Measure {
            label,
            input,
            output,
            no_calibration,
            simulate,
            room_t60,
            room_delay_ms,
        } => {
            if input.is_some() {
                config.input_device = input;
            }
            if output.is_some() {
                config.output_device = output;
            }
            if no_calibration {
                config.calibration_seconds = 0.0;
            }
            if simulate {
                let delay = (room_delay_ms.max(0.0) / 1000.0 * config.sample_rate as f64) as usize;
                info!(t60 = room_t60, delay, "Using simulated room");
                let device = LoopbackDevice::new(config.sample_rate)
                    .with_exponential_decay(room_t60, delay)
                    .with_noise(2.0);
                run_measure(device, &config, &label)
            } else {
                let device = CpalDevice::open(
                    config.input_device.as_deref(),
                    config.output_device.as_deref(),
                    config.sample_rate,
                )?;
                run_measure(device, &config, &label)
            }
        }
        Commands::Analyze { key, all } => run_analyze(&config, key, all),
        Commands::Config { action } => run_config(&config, &config_path, action),
    }
}

fn run_devices() -> Result<ExitCode> {
    let devices = CpalDevice::list_devices()?;
    if devices.is_empty() {
        println!("No audio devices found.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Found {} device(s):", devices.len());
    println!();
    for (i, device) in devices.iter().enumerate() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}. {}{}", i + 1, device.name, default_marker);
        println!(
            "     Channels: {} in, {} out",
            device.input_channels, device.output_channels
        );
        if !device.sample_rates.is_empty() {
            println!("     Sample rates: {:?}", device.sample_rates);
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

fn run_measure<D: DuplexDevice>(device: D, config: &AppConfig, label: &str) -> Result<ExitCode> {
    let store = DirectoryStore::open(&config.output_dir)
        .with_context(|| format!("opening output directory {}", config.output_dir.display()))?;
    let device_name = device.name();
    let rig = MeasurementRig::new(device, store, config.to_settings())
        .with_report_dir(config.output_dir.clone());

    let cancel = rig.cancel_handle();
    if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::Release)) {
        warn!(error = %e, "Ctrl+C handler not installed");
    }

    println!(
        "Measuring on {device_name}: {:.1} s sweep {:.0}-{:.0} Hz at {} Hz",
        config.sweep_seconds, config.start_freq, config.end_freq, config.sample_rate
    );
    let measured = rig.measure(label)?;

    match measured.level {
        Some(level) => println!(
            "Calibration: peak {} rms {:.1}, playback scale {:.3}",
            level.peak,
            level.rms,
            measured.scale.value()
        ),
        None => println!("Calibration: skipped, playback scale {:.3}", measured.scale.value()),
    }
    if print_outcome(&measured.outcome) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_NO_VALID_FIT))
    }
}

fn run_analyze(config: &AppConfig, key: Option<String>, all: bool) -> Result<ExitCode> {
    let mut store = DirectoryStore::open(&config.output_dir)
        .with_context(|| format!("opening output directory {}", config.output_dir.display()))?;

    let keys = if all {
        store.raw_keys(RECORDING_PREFIX)?
    } else if let Some(key) = key {
        vec![key]
    } else {
        match store.newest_raw_key(RECORDING_PREFIX)? {
            Some(key) => vec![key],
            None => bail!(
                "no {RECORDING_PREFIX}*.wav recordings in {}",
                config.output_dir.display()
            ),
        }
    };

    let settings = config.to_settings();
    let mut failures = 0usize;
    let mut code = ExitCode::SUCCESS;
    for key in &keys {
        match analyze_recording(&mut store, key, &settings, Some(&config.output_dir)) {
            Ok(outcome) => {
                if !print_outcome(&outcome) {
                    code = ExitCode::from(EXIT_NO_VALID_FIT);
                }
            }
            Err(e) => {
                error!(key = %key, error = %e, "Analysis failed");
                println!("{key}: FAILED ({e})");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        println!("{failures} of {} recording(s) failed", keys.len());
        return Ok(ExitCode::from(1));
    }
    Ok(code)
}

fn run_config(
    config: &AppConfig,
    path: &std::path::Path,
    action: ConfigAction,
) -> Result<ExitCode> {
    match action {
        ConfigAction::Show => println!("{}", serde_json::to_string_pretty(config)?),
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Save => {
            config.save(path)?;
            println!("Saved {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Print the estimator table; false when no fit was valid
fn print_outcome(outcome: &AnalysisOutcome) -> bool {
    println!();
    println!("{}", outcome.key);
    println!(
        "| direct sound at {:.2} ms, {} RIR samples",
        outcome.rir.peak_delay_secs() * 1000.0,
        outcome.rir.len()
    );
    print!("{}", report::format_estimates(&outcome.analysis));
    for file in &outcome.report_files {
        println!("| wrote {}", file.display());
    }

    match outcome.analysis.preferred() {
        Some(estimate) => {
            if let Some(t60) = estimate.t60_seconds {
                println!("T60 ({}) = {t60:.3} s", estimate.method);
            }
            true
        }
        None => {
            println!("No valid T60 estimate");
            false
        }
    }
}
