//! # lorasim-runner
//!
//! CLI runner for lorasim.
//!
//! This is the main entry point for running single-gateway LoRa uplink
//! collision simulations.

use clap::{Parser, Subcommand, ValueEnum};
use lorasim_agents::TrafficKind;
use lorasim_common::Bandwidth;
use lorasim_lora::{CollisionMode, ExperimentMode};
use lorasim_model::{build_simulation, load_scenarios, MacKind, ScenarioConfig};
use lorasim_runner::{
    append_result_row, format_duration, results_path, EventLoop, ProgressInfo, RunReport, RunnerError, SimTime,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Supported formats:
/// - Plain number: `60` (interpreted as seconds)
/// - With unit suffix: `250ms`, `60s`, `10m`, `2h`, `1d`
/// - Combined units: `1h30m`, `2d12h`, `1m30s500ms`
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();

    // If it's just a number, treat as seconds
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }

        if number.is_empty() {
            return Err(format!("Invalid duration format: expected a number in '{}'", s));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", number, s))?;

        let multiplier = match unit.as_str() {
            "" | "s" => 1.0,
            "ms" => 0.001,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use ms, s, m, h, or d.", unit, s)),
        };

        total_seconds += value * multiplier;
    }

    if total_seconds == 0.0 && !s.is_empty() {
        return Err(format!("Invalid duration format: '{}'", s));
    }

    Ok(total_seconds)
}

fn parse_experiment(s: &str) -> Result<ExperimentMode, String> {
    s.parse()
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Channel access policy selector.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MacArg {
    /// Pure ALOHA.
    Pure,
    /// Slotted ALOHA.
    Slotted,
}

/// Uplink traffic selector.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum TrafficArg {
    /// No acknowledgments.
    Unconfirmed,
    /// Acknowledged in the first receive window.
    ConfirmedRx1,
    /// Acknowledged in the second receive window.
    ConfirmedRx2,
}

impl From<TrafficArg> for TrafficKind {
    fn from(arg: TrafficArg) -> Self {
        match arg {
            TrafficArg::Unconfirmed => TrafficKind::Unconfirmed,
            TrafficArg::ConfirmedRx1 => TrafficKind::ConfirmedRx1,
            TrafficArg::ConfirmedRx2 => TrafficKind::ConfirmedRx2,
        }
    }
}

/// lorasim - LoRa single-gateway uplink collision simulator
#[derive(Parser, Debug)]
#[command(name = "lorasim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from YAML scenario files and command line overrides
    Run(RunnerConfig),
    /// Print the airtime of a packet
    Airtime(AirtimeConfig),
    /// List the experiment modes
    Experiments,
}

/// Configuration for running a simulation
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Path(s) to YAML scenario file(s). Multiple files are merged in order (later overrides earlier).
    pub scenarios: Vec<PathBuf>,

    /// Number of randomly placed nodes
    #[arg(short, long)]
    pub nodes: Option<usize>,

    /// Mean interval between transmissions of one node.
    /// Accepts plain seconds or units: 250ms, 60s, 10m, 2h, 1d, 1h30m
    #[arg(long, value_parser = parse_duration)]
    pub period: Option<f64>,

    /// Experiment mode: name or id 0-5 (see `lorasim experiments`)
    #[arg(short, long, value_parser = parse_experiment)]
    pub experiment: Option<ExperimentMode>,

    /// Simulation duration.
    /// Accepts plain seconds or units: 60, 60s, 10m, 2h, 1d, 1h30m
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Use the full collision check (timing and capture effect)
    #[arg(long)]
    pub full_collision: bool,

    /// Channel access policy
    #[arg(long, value_enum)]
    pub mac: Option<MacArg>,

    /// Slot length for slotted ALOHA
    #[arg(long, value_parser = parse_duration)]
    pub slot: Option<f64>,

    /// Uplink traffic type
    #[arg(long, value_enum)]
    pub traffic: Option<TrafficArg>,

    /// Payload length in bytes
    #[arg(long)]
    pub payload_len: Option<u16>,

    /// Receive chains of the gateway
    #[arg(long)]
    pub max_receives: Option<usize>,

    /// Output trace file path (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory to append a result row to
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Directory to write nodes.txt and basestation.txt to
    #[arg(long)]
    pub write_placement: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Configuration for the airtime calculator
#[derive(Parser, Debug)]
pub struct AirtimeConfig {
    /// Spreading factor (6-12)
    #[arg(long, default_value = "12")]
    pub sf: u8,

    /// Bandwidth in kHz (125, 250, 500)
    #[arg(long, default_value = "125")]
    pub bw: u32,

    /// Coding rate index (1-4 for 4/5 to 4/8)
    #[arg(long, default_value = "4")]
    pub cr: u8,

    /// Payload length in bytes
    #[arg(long, default_value = "20")]
    pub payload: u16,
}

impl RunnerConfig {
    /// Apply the command line overrides to a loaded scenario.
    fn apply_overrides(&self, scenario: &mut ScenarioConfig) {
        let sim = &mut scenario.simulation;
        if let Some(nodes) = self.nodes {
            sim.nodes = nodes;
        }
        if let Some(period) = self.period {
            sim.mean_period_s = period;
        }
        if let Some(experiment) = self.experiment {
            sim.experiment = experiment;
        }
        if let Some(duration) = self.duration {
            sim.duration_s = duration;
        }
        if let Some(seed) = self.seed {
            sim.seed = seed;
        }
        if self.full_collision {
            sim.collision.mode = CollisionMode::Full;
        }
        if let Some(mac) = self.mac {
            sim.mac = match mac {
                MacArg::Pure => MacKind::PureAloha,
                MacArg::Slotted => MacKind::SlottedAloha,
            };
        }
        if let Some(slot) = self.slot {
            sim.slot_ms = (slot * 1000.0).round() as u64;
        }
        if let Some(traffic) = self.traffic {
            sim.traffic = traffic.into();
        }
        if let Some(payload_len) = self.payload_len {
            sim.payload_len = payload_len;
        }
        if let Some(max_receives) = self.max_receives {
            sim.max_concurrent_receives = max_receives;
        }
    }
}

// ============================================================================
// Display
// ============================================================================

/// Print the node table at the start of the simulation.
fn print_initial_table(event_loop: &EventLoop) {
    eprintln!();
    eprintln!(
        "┌{}┬{}┬{}┬{}┬{}┬{}┐",
        "─".repeat(12),
        "─".repeat(12),
        "─".repeat(6),
        "─".repeat(8),
        "─".repeat(13),
        "─".repeat(10)
    );
    eprintln!(
        "│ {:^10} │ {:^10} │ {:^4} │ {:^6} │ {:^11} │ {:^8} │",
        "Node", "Dist (m)", "SF", "BW", "Freq (Hz)", "TX dBm"
    );
    eprintln!(
        "├{}┼{}┼{}┼{}┼{}┼{}┤",
        "─".repeat(12),
        "─".repeat(12),
        "─".repeat(6),
        "─".repeat(8),
        "─".repeat(13),
        "─".repeat(10)
    );

    for node_info in event_loop.node_infos() {
        let p = &node_info.profile;
        eprintln!(
            "│ {:10} │ {:>10.1} │ {:>4} │ {:>6} │ {:>11} │ {:>8} │",
            &node_info.name,
            node_info.distance_m,
            p.spreading_factor,
            p.bandwidth.khz(),
            p.frequency_hz,
            p.tx_power_dbm
        );
    }

    eprintln!(
        "└{}┴{}┴{}┴{}┴{}┴{}┘",
        "─".repeat(12),
        "─".repeat(12),
        "─".repeat(6),
        "─".repeat(8),
        "─".repeat(13),
        "─".repeat(10)
    );
    eprintln!();
    let _ = std::io::stderr().flush();
}

/// Print the final summary table with per-node statistics.
fn print_summary_table(event_loop: &EventLoop) {
    eprintln!();
    eprintln!(
        "┌{}┬{}┬{}┬{}┬{}┬{}┐",
        "─".repeat(12),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10)
    );
    eprintln!(
        "│ {:^10} │ {:^8} │ {:^8} │ {:^8} │ {:^8} │ {:^8} │",
        "Node", "Sent", "Lost", "Collided", "Received", "Acked"
    );
    eprintln!(
        "├{}┼{}┼{}┼{}┼{}┼{}┤",
        "─".repeat(12),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10)
    );

    for node_info in event_loop.node_infos() {
        let stats = event_loop
            .node_stats()
            .get(&node_info.node_id)
            .cloned()
            .unwrap_or_default();

        eprintln!(
            "│ {:10} │ {:>8} │ {:>8} │ {:>8} │ {:>8} │ {:>8} │",
            &node_info.name, stats.sent, stats.lost, stats.collided, stats.received, stats.ack_received
        );
    }

    eprintln!(
        "└{}┴{}┴{}┴{}┴{}┴{}┘",
        "─".repeat(12),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10),
        "─".repeat(10)
    );
    let _ = std::io::stderr().flush();
}

fn print_progress(progress: &ProgressInfo) {
    eprintln!(
        "[{:5.1}%] sim {} / {} | wall {} | {} events | {:.0}x | ETA {}",
        progress.progress_percent,
        format_duration(std::time::Duration::from_micros(progress.sim_time.as_micros())),
        format_duration(std::time::Duration::from_micros(progress.target_time.as_micros())),
        format_duration(progress.wall_elapsed),
        progress.events_processed,
        progress.time_multiplier,
        format_duration(progress.estimated_remaining)
    );
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Run a simulation with the given configuration.
pub fn run_simulation(config: RunnerConfig) -> Result<RunReport, RunnerError> {
    // Load and merge scenario(s); no file means built-in defaults
    let mut scenario = if config.scenarios.is_empty() {
        ScenarioConfig::default()
    } else {
        let paths: Vec<&Path> = config.scenarios.iter().map(|p| p.as_path()).collect();
        load_scenarios(&paths)?
    };
    config.apply_overrides(&mut scenario);
    let seed = scenario.simulation.seed;

    if config.verbose {
        eprintln!(
            "Loaded scenario from {} file(s): experiment {} ({}), {} collision check",
            config.scenarios.len(),
            scenario.simulation.experiment.index(),
            scenario.simulation.experiment.description(),
            match scenario.simulation.collision.mode {
                CollisionMode::Simplified => "simplified",
                CollisionMode::Full => "full",
            }
        );
        eprintln!("Using seed: {}", seed);
    }

    let simulation = build_simulation(&scenario, seed)?;

    if config.verbose {
        eprintln!(
            "Built simulation with {} entities, gateway at ({:.1}, {:.1}), placement radius {:.1} m",
            simulation.entities.len(),
            simulation.gateway_position.x,
            simulation.gateway_position.y,
            simulation.max_distance_m
        );
    }

    if let Some(ref dir) = config.write_placement {
        std::fs::create_dir_all(dir)?;
        let positions: Vec<_> = simulation.node_infos.iter().map(|n| n.position).collect();
        lorasim_model::write_positions(&dir.join("nodes.txt"), &positions)?;
        lorasim_model::write_gateway_position(&dir.join("basestation.txt"), simulation.gateway_position)?;
    }

    // Set up trace output
    let trace_output: Option<Box<dyn Write>> = if let Some(ref path) = config.output {
        Some(Box::new(std::io::BufWriter::new(std::fs::File::create(path)?)))
    } else {
        None
    };

    let mut event_loop = EventLoop::new(simulation, trace_output);

    if config.verbose {
        print_initial_table(&event_loop);
    }

    let duration = scenario.simulation.duration();
    let verbose = config.verbose;
    event_loop.run_with_progress(duration, |_, progress, is_final| {
        if verbose && !is_final {
            print_progress(&progress);
        }
    })?;

    if config.verbose {
        print_summary_table(&event_loop);
    }

    let report = RunReport::collect(&event_loop, &scenario, seed)?;

    if let Some(ref dir) = config.results_dir {
        let path = results_path(
            dir,
            scenario.simulation.experiment,
            scenario.simulation.mac_policy(),
            scenario.simulation.traffic,
        );
        append_result_row(&path, &report.result_row(&scenario))?;
        if config.verbose {
            eprintln!("Appended results to {}", path.display());
        }
    }

    Ok(report)
}

fn airtime_command(config: AirtimeConfig) -> Result<(), RunnerError> {
    let bandwidth = Bandwidth::try_from(config.bw).map_err(RunnerError::ConfigError)?;
    lorasim_lora::validate_parameters(config.sf, config.cr)
        .map_err(|e| RunnerError::ConfigError(e.to_string()))?;

    let airtime = lorasim_lora::airtime(config.sf, config.cr, config.payload, bandwidth);
    let preamble = lorasim_lora::preamble_duration(config.sf, bandwidth);
    let output = serde_json::json!({
        "spreading_factor": config.sf,
        "bandwidth_khz": bandwidth.khz(),
        "coding_rate": config.cr,
        "payload_len": config.payload,
        "airtime_ms": airtime.as_millis_f64(),
        "preamble_ms": preamble.as_millis_f64(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_experiments() {
    println!("lorasim Experiment Modes");
    println!("========================\n");
    for mode in ExperimentMode::ALL {
        println!("  {}  {:<26} {}", mode.index(), mode.name(), mode.description());
    }
}

fn main() -> Result<(), RunnerError> {
    // Initialize tracing subscriber with RUST_LOG env filter
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => {
            let report = run_simulation(config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Airtime(config) => {
            airtime_command(config)?;
        }
        Commands::Experiments => {
            print_experiments();
        }
    }

    Ok(())
}
