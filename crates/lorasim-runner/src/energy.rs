//! Node energy consumption estimate.
//!
//! Every completed uplink is charged its transmit energy plus the radio
//! activity that follows it until the next attempt: idle time waiting for
//! receive windows, standby, optional acknowledgment reception and sleep for
//! the rest of the mean period. Times are in milliseconds and currents in mA,
//! so each product is in microjoules before conversion to joules.

use crate::{NodeStats, RunnerError};
use lorasim_agents::TrafficKind;
use lorasim_common::{Bandwidth, SimTime};
use lorasim_model::{EnergyConfig, NodeInfo};
use serde::Serialize;

/// Spreading factor of the acknowledgment downlink.
const ACK_SPREADING_FACTOR: u8 = 12;
/// Coding rate of the acknowledgment downlink.
const ACK_CODING_RATE: u8 = 4;

/// Inputs for one node.
#[derive(Debug, Clone)]
pub struct NodeEnergyInput {
    /// Airtime of one uplink.
    pub airtime: SimTime,
    /// Preamble duration of one uplink.
    pub preamble: SimTime,
    /// Transmit power in dBm.
    pub tx_power_dbm: i8,
    /// Completed uplinks.
    pub sent: u64,
    /// Acknowledged uplinks.
    pub ack_received: u64,
    /// Unacknowledged uplinks.
    pub nack_received: u64,
}

impl NodeEnergyInput {
    /// Combine a node's static profile with its run counters.
    pub fn from_node(info: &NodeInfo, stats: &NodeStats) -> Self {
        NodeEnergyInput {
            airtime: info.profile.airtime,
            preamble: info.profile.preamble,
            tx_power_dbm: info.profile.tx_power_dbm,
            sent: stats.sent,
            ack_received: stats.ack_received,
            nack_received: stats.nack_received,
        }
    }
}

/// Energy totals over all nodes, in joules.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnergyReport {
    /// Uplink transmission only.
    pub transmit_j: f64,
    /// Idle waiting for receive windows.
    pub idle_j: f64,
    /// Standby around missed receive windows.
    pub standby_j: f64,
    /// Acknowledgment reception.
    pub receive_j: f64,
    /// Sleep for the remainder of the period.
    pub sleep_j: f64,
    /// Sum of all components.
    pub total_j: f64,
}

/// Accumulates per-node contributions in microjoules.
#[derive(Default)]
struct Tally {
    transmit: f64,
    idle: f64,
    standby: f64,
    receive: f64,
    sleep: f64,
}

impl Tally {
    fn into_report(self) -> EnergyReport {
        let to_j = |uj: f64| uj / 1e6;
        EnergyReport {
            transmit_j: to_j(self.transmit),
            idle_j: to_j(self.idle),
            standby_j: to_j(self.standby),
            receive_j: to_j(self.receive),
            sleep_j: to_j(self.sleep),
            total_j: to_j(self.transmit + self.idle + self.standby + self.receive + self.sleep),
        }
    }
}

/// Airtime of the acknowledgment downlink.
pub fn ack_airtime(config: &EnergyConfig) -> SimTime {
    lorasim_lora::airtime(
        ACK_SPREADING_FACTOR,
        ACK_CODING_RATE,
        config.ack_payload_len,
        Bandwidth::Khz125,
    )
}

/// Estimate the energy spent by all nodes.
///
/// `period` is the mean transmission period. Sleep time that would come out
/// negative, when airtime and receive windows exceed the period, counts as
/// zero.
pub fn compute_energy(
    nodes: &[NodeEnergyInput],
    traffic: TrafficKind,
    period: SimTime,
    config: &EnergyConfig,
) -> Result<EnergyReport, RunnerError> {
    let v = config.voltage_v;
    let period_ms = period.as_millis_f64();
    let t_ack = ack_airtime(config).as_millis_f64();
    let idle_ms = config.idle_time_ms;
    let mut tally = Tally::default();

    for node in nodes {
        let tx_current = config.tx_current(node.tx_power_dbm).ok_or_else(|| {
            RunnerError::ConfigError(format!(
                "no transmit current for {} dBm in the energy table",
                node.tx_power_dbm
            ))
        })?;
        let airtime = node.airtime.as_millis_f64();
        let preamble = node.preamble.as_millis_f64();
        let sent = node.sent as f64;
        let ack = node.ack_received as f64;
        let nack = node.nack_received as f64;
        let sleep = |busy_ms: f64, count: f64| (period_ms - busy_ms).max(0.0) * config.sleep_current_ma * v * count;

        tally.transmit += airtime * tx_current * v * sent;

        match traffic {
            TrafficKind::Unconfirmed => {
                tally.idle += idle_ms * config.idle_current_ma * v * sent;
                tally.standby += preamble * 2.0 * config.standby_current_ma * v * sent;
                tally.sleep += sleep(airtime + idle_ms + 2.0 * preamble, sent);
            }
            TrafficKind::ConfirmedRx1 => {
                let rx1_idle_ms = config.rx1_idle_time_ms;
                tally.idle += rx1_idle_ms * config.idle_current_ma * v * ack;
                tally.idle += idle_ms * config.idle_current_ma * v * nack;
                tally.receive += t_ack * config.receive_current_ma * v * ack;
                tally.standby += preamble * 2.0 * config.standby_current_ma * v * nack;
                tally.sleep += sleep(airtime + rx1_idle_ms + t_ack, ack);
                tally.sleep += sleep(airtime + idle_ms + 2.0 * preamble, nack);
            }
            TrafficKind::ConfirmedRx2 => {
                tally.idle += idle_ms * config.idle_current_ma * v * (ack + nack);
                tally.receive += t_ack * config.receive_current_ma * v * ack;
                tally.standby += preamble * config.standby_current_ma * v * ack;
                tally.standby += preamble * 2.0 * config.standby_current_ma * v * nack;
                tally.sleep += sleep(airtime + preamble + idle_ms + t_ack, ack);
                tally.sleep += sleep(airtime + idle_ms + 2.0 * preamble, nack);
            }
        }
    }

    Ok(tally.into_report())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(sent: u64, ack: u64, nack: u64) -> NodeEnergyInput {
        NodeEnergyInput {
            airtime: SimTime::from_millis(100),
            preamble: SimTime::from_millis(10),
            tx_power_dbm: 14,
            sent,
            ack_received: ack,
            nack_received: nack,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_ack_airtime() {
        // SF12/BW125, CR4/8, 13 bytes: 12.25 + 32 symbols of 32.768 ms.
        let config = EnergyConfig::default();
        assert_eq!(ack_airtime(&config), SimTime::from_micros(1_449_984));
    }

    #[test]
    fn test_unconfirmed_energy() {
        let config = EnergyConfig::default();
        let report = compute_energy(
            &[node(10, 0, 0)],
            TrafficKind::Unconfirmed,
            SimTime::from_secs(1000.0),
            &config,
        )
        .unwrap();

        // 100 ms * 44 mA * 3 V * 10 = 132000 uJ.
        assert!(close(report.transmit_j, 0.132));
        // 2000 ms * 1.5 mA * 3 V * 10.
        assert!(close(report.idle_j, 0.09));
        // 10 ms * 2 * 1.6 mA * 3 V * 10.
        assert!(close(report.standby_j, 0.00096));
        // (1_000_000 - 100 - 2000 - 20) ms * 0.0002 mA * 3 V * 10.
        assert!(close(report.sleep_j, 997_880.0 * 0.0002 * 3.0 * 10.0 / 1e6));
        assert_eq!(report.receive_j, 0.0);
        assert!(close(
            report.total_j,
            report.transmit_j + report.idle_j + report.standby_j + report.sleep_j
        ));
    }

    #[test]
    fn test_confirmed_rx1_energy() {
        let config = EnergyConfig::default();
        let t_ack = ack_airtime(&config).as_millis_f64();
        let report = compute_energy(
            &[node(4, 3, 1)],
            TrafficKind::ConfirmedRx1,
            SimTime::from_secs(1000.0),
            &config,
        )
        .unwrap();

        assert!(close(report.transmit_j, 100.0 * 44.0 * 3.0 * 4.0 / 1e6));
        assert!(close(report.idle_j, (1000.0 * 1.5 * 3.0 * 3.0 + 2000.0 * 1.5 * 3.0) / 1e6));
        assert!(close(report.receive_j, t_ack * 11.5 * 3.0 * 3.0 / 1e6));
        assert!(close(report.standby_j, 10.0 * 2.0 * 1.6 * 3.0 / 1e6));
        let sleep = ((1_000_000.0 - 100.0 - 1000.0 - t_ack) * 3.0 + (1_000_000.0 - 100.0 - 2000.0 - 20.0))
            * 0.0002
            * 3.0;
        assert!(close(report.sleep_j, sleep / 1e6));
    }

    #[test]
    fn test_confirmed_rx2_energy() {
        let config = EnergyConfig::default();
        let t_ack = ack_airtime(&config).as_millis_f64();
        let report = compute_energy(
            &[node(2, 1, 1)],
            TrafficKind::ConfirmedRx2,
            SimTime::from_secs(1000.0),
            &config,
        )
        .unwrap();

        assert!(close(report.idle_j, 2.0 * 2000.0 * 1.5 * 3.0 / 1e6));
        assert!(close(report.standby_j, (10.0 * 1.6 * 3.0 + 20.0 * 1.6 * 3.0) / 1e6));
        assert!(close(report.receive_j, t_ack * 11.5 * 3.0 / 1e6));
    }

    #[test]
    fn test_sleep_never_negative() {
        let config = EnergyConfig::default();
        let report = compute_energy(
            &[node(5, 0, 0)],
            TrafficKind::Unconfirmed,
            SimTime::from_millis(500),
            &config,
        )
        .unwrap();
        assert_eq!(report.sleep_j, 0.0);
    }

    #[test]
    fn test_tx_power_outside_table() {
        let config = EnergyConfig::default();
        let mut n = node(1, 0, 0);
        n.tx_power_dbm = 30;
        let err = compute_energy(&[n], TrafficKind::Unconfirmed, SimTime::from_secs(1.0), &config);
        assert!(matches!(err, Err(RunnerError::ConfigError(_))));
    }

    #[test]
    fn test_no_traffic_no_energy() {
        let config = EnergyConfig::default();
        let report = compute_energy(
            &[node(0, 0, 0)],
            TrafficKind::ConfirmedRx2,
            SimTime::from_secs(100.0),
            &config,
        )
        .unwrap();
        assert_eq!(report, EnergyReport::default());
    }
}
