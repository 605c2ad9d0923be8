//! Appending run summaries to whitespace-separated result files.

use crate::{EnergyReport, RunnerError, SimulationStats};
use lorasim_agents::{MacPolicy, TrafficKind};
use lorasim_lora::ExperimentMode;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Column header written when a result file is created.
pub const RESULTS_HEADER: &str = "#simtime avgSendTime nrNodes nrCollisions nrReceived nrProcessed nrLost \
nrTransmissions OverallEnergy1 OverallEnergyT der1 der2";

/// One row of a result file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    /// Simulation horizon in milliseconds.
    pub simtime_ms: u64,
    /// Mean transmission period in milliseconds.
    pub period_ms: u64,
    /// Number of nodes.
    pub nodes: usize,
    /// Collided transmissions.
    pub collided: u64,
    /// Transmissions neither lost nor collided.
    pub received: u64,
    /// Transmissions given a receive chain.
    pub processed: u64,
    /// Transmissions below sensitivity.
    pub lost: u64,
    /// Completed transmissions.
    pub sent: u64,
    /// Uplink transmit energy in joules.
    pub transmit_energy_j: f64,
    /// Total energy in joules.
    pub total_energy_j: f64,
    /// `(sent - collided) / sent`.
    pub der1: f64,
    /// `received / sent`.
    pub der2: f64,
}

impl ResultRow {
    /// Assemble a row from run outputs.
    pub fn new(stats: &SimulationStats, energy: &EnergyReport, simtime_ms: u64, period_ms: u64) -> Self {
        ResultRow {
            simtime_ms,
            period_ms,
            nodes: stats.nodes,
            collided: stats.collided,
            received: stats.received,
            processed: stats.processed,
            lost: stats.lost,
            sent: stats.sent,
            transmit_energy_j: energy.transmit_j,
            total_energy_j: energy.total_j,
            der1: stats.der1,
            der2: stats.der2,
        }
    }

    /// Render as one space-separated line without a line terminator.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {}",
            self.simtime_ms,
            self.period_ms,
            self.nodes,
            self.collided,
            self.received,
            self.processed,
            self.lost,
            self.sent,
            self.transmit_energy_j,
            self.total_energy_j,
            self.der1,
            self.der2
        )
    }
}

/// Result file for an experiment, MAC policy and traffic kind.
pub fn results_path(dir: &Path, experiment: ExperimentMode, mac: MacPolicy, traffic: TrafficKind) -> PathBuf {
    dir.join(format!(
        "sim_results_exp{}_mac{}_scenario{}.dat",
        experiment.index(),
        mac.index(),
        traffic.index()
    ))
}

/// Append `row` to `path`, writing the header first if the file is new.
pub fn append_result_row(path: &Path, row: &ResultRow) -> Result<(), RunnerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let exists = path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !exists {
        writeln!(file, "{RESULTS_HEADER}")?;
    }
    writeln!(file, "{}", row.to_line())?;
    Ok(())
}
