//! Radio parameter assignment.
//!
//! Each experiment mode is a policy that turns a node's distance to the
//! gateway into a [`RadioProfile`]. Assignment happens once per node when
//! the simulation is built.

use crate::{airtime, preamble_duration, validate_parameters, PathLossModel, PhyError, SensitivityTable};
use lorasim_common::{Bandwidth, RadioProfile};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Placement reference sensitivity for the fixed-fast mode (dBm).
///
/// SF6 has no measured row, so the datasheet figure is used instead.
pub const FIXED_FAST_REFERENCE_SENSITIVITY_DBM: f64 = -112.0;

/// Radio parameter assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentMode {
    /// SF12, CR4/8, 125 kHz, single frequency.
    #[default]
    FixedSlow,
    /// As [`ExperimentMode::FixedSlow`], frequency drawn from the channel set.
    FixedSlowMultiChannel,
    /// SF6, CR4/5, 500 kHz.
    FixedFast,
    /// Shortest-airtime SF/BW that reaches the gateway, CR4/5.
    DistanceOptimized,
    /// SF12, CR4/5, 125 kHz.
    LorawanDefault,
    /// As [`ExperimentMode::DistanceOptimized`], then lowest sufficient power.
    DistancePowerOptimized,
}

impl ExperimentMode {
    /// All modes in numeric order.
    pub const ALL: [ExperimentMode; 6] = [
        ExperimentMode::FixedSlow,
        ExperimentMode::FixedSlowMultiChannel,
        ExperimentMode::FixedFast,
        ExperimentMode::DistanceOptimized,
        ExperimentMode::LorawanDefault,
        ExperimentMode::DistancePowerOptimized,
    ];

    /// Numeric experiment id (0-5).
    pub fn index(&self) -> u8 {
        match self {
            ExperimentMode::FixedSlow => 0,
            ExperimentMode::FixedSlowMultiChannel => 1,
            ExperimentMode::FixedFast => 2,
            ExperimentMode::DistanceOptimized => 3,
            ExperimentMode::LorawanDefault => 4,
            ExperimentMode::DistancePowerOptimized => 5,
        }
    }

    /// Mode for a numeric experiment id.
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Configuration name, as used in scenario files.
    pub fn name(&self) -> &'static str {
        match self {
            ExperimentMode::FixedSlow => "fixed_slow",
            ExperimentMode::FixedSlowMultiChannel => "fixed_slow_multi_channel",
            ExperimentMode::FixedFast => "fixed_fast",
            ExperimentMode::DistanceOptimized => "distance_optimized",
            ExperimentMode::LorawanDefault => "lorawan_default",
            ExperimentMode::DistancePowerOptimized => "distance_power_optimized",
        }
    }

    /// One-line description.
    pub fn description(&self) -> &'static str {
        match self {
            ExperimentMode::FixedSlow => "SF12, CR4/8, BW125, single frequency",
            ExperimentMode::FixedSlowMultiChannel => "SF12, CR4/8, BW125, random channel out of the channel set",
            ExperimentMode::FixedFast => "SF6, CR4/5, BW500",
            ExperimentMode::DistanceOptimized => "shortest airtime SF/BW that reaches the gateway, CR4/5",
            ExperimentMode::LorawanDefault => "SF12, CR4/5, BW125",
            ExperimentMode::DistancePowerOptimized => "distance optimized, then lowest sufficient transmit power",
        }
    }

    /// Whether the mode searches SF/BW by distance.
    pub fn is_distance_optimized(&self) -> bool {
        matches!(
            self,
            ExperimentMode::DistanceOptimized | ExperimentMode::DistancePowerOptimized
        )
    }

    /// Sensitivity used to size the placement disc.
    pub fn reference_sensitivity(&self, table: &SensitivityTable) -> f64 {
        match self {
            ExperimentMode::FixedSlow | ExperimentMode::FixedSlowMultiChannel | ExperimentMode::LorawanDefault => table
                .threshold(12, Bandwidth::Khz125)
                .unwrap_or(FIXED_FAST_REFERENCE_SENSITIVITY_DBM),
            ExperimentMode::FixedFast => FIXED_FAST_REFERENCE_SENSITIVITY_DBM,
            ExperimentMode::DistanceOptimized | ExperimentMode::DistancePowerOptimized => table.minimum(),
        }
    }
}

impl fmt::Display for ExperimentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExperimentMode {
    type Err = String;

    /// Accepts a mode name or its numeric id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(index) = s.parse::<u8>() {
            return Self::from_index(index).ok_or_else(|| format!("unknown experiment {index} (expected 0-5)"));
        }
        let normalized = s.replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|mode| mode.name() == normalized)
            .ok_or_else(|| format!("unknown experiment '{s}'"))
    }
}

/// Inputs shared by every node's assignment.
#[derive(Debug, Clone)]
pub struct AssignmentConfig {
    /// Nominal transmit power in dBm.
    pub tx_power_dbm: i8,
    /// Floor for power optimization in dBm.
    pub min_tx_power_dbm: i8,
    /// Payload length in bytes.
    pub payload_len: u16,
    /// Frequency used by single-channel modes.
    pub base_frequency_hz: u32,
    /// Channel set for the multi-channel mode.
    pub channels_hz: Vec<u32>,
    /// Path loss model.
    pub path_loss: PathLossModel,
    /// Receiver sensitivity thresholds.
    pub sensitivity: SensitivityTable,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        AssignmentConfig {
            tx_power_dbm: 14,
            min_tx_power_dbm: 2,
            payload_len: 20,
            base_frequency_hz: 860_000_000,
            channels_hz: vec![860_000_000, 864_000_000, 868_000_000],
            path_loss: PathLossModel::default(),
            sensitivity: SensitivityTable::default(),
        }
    }
}

/// Feasible SF/BW combination with the shortest airtime.
struct BestLink {
    spreading_factor: u8,
    bandwidth: Bandwidth,
    sensitivity_dbm: f64,
    airtime: lorasim_common::SimTime,
}

/// Search all SF/BW pairs whose threshold is strictly below `rssi_dbm`;
/// the first pair with the shortest CR4/5 airtime wins.
fn shortest_feasible(rssi_dbm: f64, config: &AssignmentConfig) -> Result<Option<BestLink>, PhyError> {
    let mut best: Option<BestLink> = None;
    for sf in config.sensitivity.spreading_factors() {
        validate_parameters(sf, 1)?;
        for bw in Bandwidth::ALL {
            let Some(sensitivity_dbm) = config.sensitivity.threshold(sf, bw) else {
                continue;
            };
            if sensitivity_dbm >= rssi_dbm {
                continue;
            }
            let at = airtime(sf, 1, config.payload_len, bw);
            if best.as_ref().map_or(true, |b| at < b.airtime) {
                best = Some(BestLink {
                    spreading_factor: sf,
                    bandwidth: bw,
                    sensitivity_dbm,
                    airtime: at,
                });
            }
        }
    }
    Ok(best)
}

/// Produce the radio profile of a node at `distance_m` from the gateway.
///
/// Fails with [`PhyError::Unreachable`] when a distance-optimized mode finds
/// no SF/BW combination above sensitivity, and with
/// [`PhyError::InvalidSpreadingFactor`] when the sensitivity table carries a
/// row outside SF6-12.
pub fn assign_profile<R: Rng + ?Sized>(
    distance_m: f64,
    mode: ExperimentMode,
    config: &AssignmentConfig,
    rng: &mut R,
) -> Result<RadioProfile, PhyError> {
    let mut tx_power_dbm = config.tx_power_dbm;
    let mut rssi_dbm = config
        .path_loss
        .received_power_dbm(f64::from(tx_power_dbm), distance_m);

    let (spreading_factor, bandwidth, coding_rate) = match mode {
        ExperimentMode::FixedSlow | ExperimentMode::FixedSlowMultiChannel => (12, Bandwidth::Khz125, 4),
        ExperimentMode::FixedFast => (6, Bandwidth::Khz500, 1),
        ExperimentMode::LorawanDefault => (12, Bandwidth::Khz125, 1),
        ExperimentMode::DistanceOptimized | ExperimentMode::DistancePowerOptimized => {
            let best = shortest_feasible(rssi_dbm, config)?.ok_or(PhyError::Unreachable { distance_m, rssi_dbm })?;
            debug!(
                distance_m,
                sf = best.spreading_factor,
                bw = best.bandwidth.khz(),
                airtime_ms = best.airtime.as_millis_f64(),
                "best feasible link"
            );

            if mode == ExperimentMode::DistancePowerOptimized {
                let margin = (rssi_dbm - best.sensitivity_dbm).floor();
                let reduced = (f64::from(tx_power_dbm) - margin).max(f64::from(config.min_tx_power_dbm));
                tx_power_dbm = reduced as i8;
                rssi_dbm = config
                    .path_loss
                    .received_power_dbm(f64::from(tx_power_dbm), distance_m);
                debug!(tx_power_dbm, rssi_dbm, "reduced transmit power");
            }
            (best.spreading_factor, best.bandwidth, 1)
        }
    };
    validate_parameters(spreading_factor, coding_rate)?;

    let frequency_hz = match mode {
        ExperimentMode::FixedSlowMultiChannel => config
            .channels_hz
            .choose(rng)
            .copied()
            .unwrap_or(config.base_frequency_hz),
        _ => config.base_frequency_hz,
    };

    let sensitivity_dbm = config
        .sensitivity
        .threshold(spreading_factor, bandwidth)
        .ok_or(PhyError::InvalidSpreadingFactor(spreading_factor))?;

    Ok(RadioProfile {
        spreading_factor,
        bandwidth,
        coding_rate,
        frequency_hz,
        tx_power_dbm,
        payload_len: config.payload_len,
        rssi_dbm,
        sensitivity_dbm,
        airtime: airtime(spreading_factor, coding_rate, config.payload_len, bandwidth),
        preamble: preamble_duration(spreading_factor, bandwidth),
    })
}
