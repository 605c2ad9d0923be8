//! # lorasim-model
//!
//! YAML scenario loading and simulation building for lorasim.
//!
//! This crate provides:
//! - The scenario schema (`simulation`, `radio`, `path_loss`, `sensitivity`,
//!   `placement`, `energy` sections)
//! - Scenario loading from files and strings, with deep merging of several
//!   documents
//! - Node placement around the gateway
//! - Simulation building: gateway and node entities plus initial events

pub mod placement;

pub use placement::{
    load_positions, parse_positions, write_gateway_position, write_positions, DiscPlacement,
};

use lorasim_agents::{MacPolicy, NodeAgent, NodeConfig, TrafficKind, TIMER_ARM};
use lorasim_common::{
    EntityId, EntityRegistry, Event, EventId, EventPayload, NodeId, Position, RadioProfile, SimError, SimTime,
};
use lorasim_lora::{
    assign_profile, AssignmentConfig, CollisionConfig, ExperimentMode, Gateway, GatewayConfig, PathLossModel,
    PhyError, SensitivityTable,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading a scenario or building a simulation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Random placement could not satisfy the minimum separation.
    #[error("Placement failed for node {node}: no free spot after {rounds} rounds")]
    PlacementFailed {
        /// Index of the node being placed.
        node: usize,
        /// Number of rejected candidates.
        rounds: u32,
    },

    /// Malformed positions input.
    #[error("Invalid positions at line {line}: {message}")]
    InvalidPositions {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// Radio parameter assignment failed.
    #[error("Radio assignment error: {0}")]
    Phy(#[from] PhyError),

    /// Entity construction failed.
    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),
}

// ============================================================================
// Scenario Schema
// ============================================================================

/// A complete scenario description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Run parameters.
    pub simulation: SimulationSection,
    /// Transmitter parameters shared by all nodes.
    pub radio: RadioSection,
    /// Path loss calibration.
    pub path_loss: PathLossModel,
    /// Receiver sensitivity thresholds.
    pub sensitivity: SensitivityTable,
    /// Node placement.
    pub placement: PlacementSection,
    /// Energy model constants.
    pub energy: EnergyConfig,
}

/// Channel access selector as written in scenario files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacKind {
    /// Pure ALOHA.
    #[default]
    PureAloha,
    /// Slotted ALOHA with `slot_ms` slots.
    SlottedAloha,
}

/// `simulation` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSection {
    /// Number of nodes for random placement.
    pub nodes: usize,
    /// Mean interval between transmissions of one node, in seconds.
    pub mean_period_s: f64,
    /// Simulation horizon in seconds.
    pub duration_s: f64,
    /// Random seed.
    pub seed: u64,
    /// Radio parameter assignment strategy.
    pub experiment: ExperimentMode,
    /// Collision engine settings.
    pub collision: CollisionConfig,
    /// Channel access policy.
    pub mac: MacKind,
    /// Slot length for slotted ALOHA, in milliseconds.
    pub slot_ms: u64,
    /// Uplink traffic type.
    pub traffic: TrafficKind,
    /// Payload length in bytes.
    pub payload_len: u16,
    /// Receive chains of the gateway.
    pub max_concurrent_receives: usize,
}

impl Default for SimulationSection {
    fn default() -> Self {
        SimulationSection {
            nodes: 100,
            mean_period_s: 1000.0,
            duration_s: 86_400.0,
            seed: 42,
            experiment: ExperimentMode::default(),
            collision: CollisionConfig::default(),
            mac: MacKind::default(),
            slot_ms: 100,
            traffic: TrafficKind::default(),
            payload_len: 20,
            max_concurrent_receives: 8,
        }
    }
}

impl SimulationSection {
    /// Mean period as simulation time.
    pub fn period(&self) -> SimTime {
        SimTime::from_secs(self.mean_period_s)
    }

    /// Horizon as simulation time.
    pub fn duration(&self) -> SimTime {
        SimTime::from_secs(self.duration_s)
    }

    /// Resolved MAC policy.
    pub fn mac_policy(&self) -> MacPolicy {
        match self.mac {
            MacKind::PureAloha => MacPolicy::PureAloha,
            MacKind::SlottedAloha => MacPolicy::SlottedAloha {
                slot: SimTime::from_millis(self.slot_ms),
            },
        }
    }
}

/// `radio` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RadioSection {
    /// Nominal transmit power in dBm.
    pub tx_power_dbm: i8,
    /// Floor for transmit power optimization in dBm.
    pub min_tx_power_dbm: i8,
    /// Carrier used by single-channel modes.
    pub base_frequency_hz: u32,
    /// Channel set for the multi-channel mode.
    pub channels_hz: Vec<u32>,
}

impl Default for RadioSection {
    fn default() -> Self {
        RadioSection {
            tx_power_dbm: 14,
            min_tx_power_dbm: 2,
            base_frequency_hz: 860_000_000,
            channels_hz: vec![860_000_000, 864_000_000, 868_000_000],
        }
    }
}

/// `placement` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlacementSection {
    /// Minimum distance between nodes in meters.
    pub min_separation_m: f64,
    /// Rejected candidates allowed per node.
    pub max_rounds: u32,
    /// Explicit node coordinates; overrides the node count.
    pub positions: Vec<[f64; 2]>,
    /// Text file with node coordinates; overrides the node count.
    pub positions_file: Option<PathBuf>,
}

impl Default for PlacementSection {
    fn default() -> Self {
        PlacementSection {
            min_separation_m: 10.0,
            max_rounds: 100,
            positions: Vec::new(),
            positions_file: None,
        }
    }
}

/// `energy` section: supply currents and timings of the node radio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnergyConfig {
    /// Supply voltage.
    pub voltage_v: f64,
    /// Transmit current in mA for each power level from -2 dBm upward.
    pub tx_current_ma: Vec<f64>,
    /// Idle current in mA.
    pub idle_current_ma: f64,
    /// Standby current in mA.
    pub standby_current_ma: f64,
    /// Receive current in mA.
    pub receive_current_ma: f64,
    /// Sleep current in mA.
    pub sleep_current_ma: f64,
    /// Idle time after an uplink, in ms.
    pub idle_time_ms: f64,
    /// Idle time before the first receive window, in ms.
    pub rx1_idle_time_ms: f64,
    /// Payload length of an acknowledgment downlink.
    pub ack_payload_len: u16,
}

/// Lowest power level of the transmit current table.
pub const TX_CURRENT_MIN_DBM: i8 = -2;

impl EnergyConfig {
    /// Transmit current at `tx_power_dbm`, if the table covers it.
    pub fn tx_current(&self, tx_power_dbm: i8) -> Option<f64> {
        let idx = usize::try_from(i16::from(tx_power_dbm) - i16::from(TX_CURRENT_MIN_DBM)).ok()?;
        self.tx_current_ma.get(idx).copied()
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        EnergyConfig {
            voltage_v: 3.0,
            tx_current_ma: vec![
                22.0, 22.0, 22.0, 23.0, // -2..1
                24.0, 24.0, 24.0, 25.0, 25.0, 25.0, 25.0, 26.0, 31.0, 32.0, 34.0, 35.0, 44.0, // 2..14
                82.0, 85.0, 90.0, // 15..17
                105.0, 115.0, 125.0, // 18..20
            ],
            idle_current_ma: 1.5,
            standby_current_ma: 1.6,
            receive_current_ma: 11.5,
            sleep_current_ma: 0.0002,
            idle_time_ms: 2000.0,
            rx1_idle_time_ms: 1000.0,
            ack_payload_len: 13,
        }
    }
}

impl ScenarioConfig {
    /// Assignment inputs derived from the scenario.
    pub fn assignment_config(&self) -> AssignmentConfig {
        AssignmentConfig {
            tx_power_dbm: self.radio.tx_power_dbm,
            min_tx_power_dbm: self.radio.min_tx_power_dbm,
            payload_len: self.simulation.payload_len,
            base_frequency_hz: self.radio.base_frequency_hz,
            channels_hz: self.radio.channels_hz.clone(),
            path_loss: self.path_loss.clone(),
            sensitivity: self.sensitivity.clone(),
        }
    }

    /// Gateway settings derived from the scenario.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_concurrent_receives: self.simulation.max_concurrent_receives,
            collision: self.simulation.collision,
        }
    }

    /// Radius of the deployment disc for the configured experiment.
    pub fn max_distance_m(&self) -> f64 {
        let reference = self.simulation.experiment.reference_sensitivity(&self.sensitivity);
        self.path_loss
            .reference_range_m(f64::from(self.radio.tx_power_dbm), reference)
    }

    /// Gateway position: offset from the origin by the disc radius plus 10 m.
    pub fn gateway_position(&self) -> Position {
        let offset = self.max_distance_m() + 10.0;
        Position::new(offset, offset)
    }

    /// Check values that cannot be expressed in the schema types.
    pub fn validate(&self) -> Result<(), ModelError> {
        let sim = &self.simulation;
        if !sim.mean_period_s.is_finite() || sim.mean_period_s <= 0.0 || sim.period() == SimTime::ZERO {
            return Err(ModelError::InvalidConfig(format!(
                "mean_period_s must be positive, got {}",
                sim.mean_period_s
            )));
        }
        if !sim.duration_s.is_finite() || sim.duration_s <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "duration_s must be positive, got {}",
                sim.duration_s
            )));
        }
        if sim.mac == MacKind::SlottedAloha && sim.slot_ms == 0 {
            return Err(ModelError::InvalidConfig("slot_ms must be positive".to_string()));
        }
        if sim.max_concurrent_receives == 0 {
            return Err(ModelError::InvalidConfig(
                "max_concurrent_receives must be at least 1".to_string(),
            ));
        }
        if self.sensitivity.spreading_factors().next().is_none() {
            return Err(ModelError::InvalidConfig("sensitivity table is empty".to_string()));
        }
        if let Some(sf) = self.sensitivity.spreading_factors().find(|sf| !(6..=12).contains(sf)) {
            return Err(ModelError::InvalidConfig(format!(
                "sensitivity row for spreading factor {sf} is outside 6-12"
            )));
        }
        if self.radio.min_tx_power_dbm > self.radio.tx_power_dbm {
            return Err(ModelError::InvalidConfig(format!(
                "min_tx_power_dbm {} exceeds tx_power_dbm {}",
                self.radio.min_tx_power_dbm, self.radio.tx_power_dbm
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Scenario Loading
// ============================================================================

/// Load a scenario from a file.
pub fn load_scenario(path: &Path) -> Result<ScenarioConfig, ModelError> {
    load_scenarios(&[path])
}

/// Parse a scenario from a YAML string.
pub fn load_scenario_from_str(yaml_str: &str) -> Result<ScenarioConfig, ModelError> {
    load_scenarios_from_str(&[yaml_str])
}

/// Load and merge several scenario files; later files override earlier ones.
pub fn load_scenarios(paths: &[&Path]) -> Result<ScenarioConfig, ModelError> {
    if paths.is_empty() {
        return Err(ModelError::InvalidConfig("No scenario files provided".to_string()));
    }

    let yaml_strings: Result<Vec<String>, std::io::Error> =
        paths.iter().map(|path| std::fs::read_to_string(path)).collect();
    let yaml_strings = yaml_strings?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_scenarios_from_str(&yaml_strs)
}

/// Load and merge several YAML documents.
///
/// Mappings are merged key by key, recursively; any other value in a later
/// document replaces the earlier one. The merged document is deserialized
/// once, so unknown keys are reported against the final result.
pub fn load_scenarios_from_str(yaml_strs: &[&str]) -> Result<ScenarioConfig, ModelError> {
    if yaml_strs.is_empty() {
        return Err(ModelError::InvalidConfig("No scenario strings provided".to_string()));
    }

    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    for yaml in yaml_strs {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        merge_yaml(&mut merged, doc);
    }

    let config: ScenarioConfig = serde_yaml::from_value(merged)?;
    Ok(config)
}

fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    use serde_yaml::Value;

    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// ============================================================================
// Simulation Building
// ============================================================================

/// Information about a node for display and reporting.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Display name.
    pub name: String,
    /// Node number.
    pub node_id: NodeId,
    /// Entity ID of the node agent.
    pub entity_id: EntityId,
    /// Node position.
    pub position: Position,
    /// Distance to the gateway in meters.
    pub distance_m: f64,
    /// Assigned radio parameters.
    pub profile: RadioProfile,
    /// Mean transmission period.
    pub period: SimTime,
}

/// Result of building a simulation from a scenario.
pub struct BuiltSimulation {
    /// Entity registry with the gateway and all nodes.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each node, ordered by node id.
    pub node_infos: Vec<NodeInfo>,
    /// Entity ID of the gateway.
    pub gateway_entity_id: EntityId,
    /// Gateway position.
    pub gateway_position: Position,
    /// Radius used for random placement.
    pub max_distance_m: f64,
    /// Generator used for placement and assignment, positioned after the
    /// last draw; the event loop continues from it.
    pub rng: ChaCha8Rng,
}

/// Entity ID of the gateway in every built simulation.
pub const GATEWAY_ENTITY_ID: EntityId = EntityId(0);

/// Resolve node positions: explicit list, then positions file, then random.
pub fn resolve_positions<R: rand::Rng + ?Sized>(
    config: &ScenarioConfig,
    rng: &mut R,
) -> Result<Vec<Position>, ModelError> {
    if !config.placement.positions.is_empty() {
        return Ok(config
            .placement
            .positions
            .iter()
            .map(|[x, y]| Position::new(*x, *y))
            .collect());
    }
    if let Some(path) = &config.placement.positions_file {
        return load_positions(path);
    }

    let disc = DiscPlacement {
        center: config.gateway_position(),
        radius_m: config.max_distance_m(),
        min_separation_m: config.placement.min_separation_m,
        max_rounds: config.placement.max_rounds,
    };
    disc.place(config.simulation.nodes, rng)
}

/// Build a simulation from a scenario.
///
/// All randomness of a run comes from one generator seeded with `seed`.
/// Placement and radio assignment draw from it first; it is then handed over
/// in [`BuiltSimulation::rng`] for the event loop. Fails before any event
/// exists if a node cannot reach the gateway in a distance-optimized
/// experiment.
pub fn build_simulation(config: &ScenarioConfig, seed: u64) -> Result<BuiltSimulation, ModelError> {
    config.validate()?;

    let mut entities = EntityRegistry::new();
    let mut initial_events = Vec::new();
    let mut node_infos = Vec::new();
    let mut event_id_counter: u64 = 0;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let gateway_position = config.gateway_position();
    let max_distance_m = config.max_distance_m();
    let positions = resolve_positions(config, &mut rng)?;
    if positions.is_empty() {
        return Err(ModelError::InvalidConfig("scenario has no nodes".to_string()));
    }
    let node_count = u32::try_from(positions.len())
        .map_err(|_| ModelError::InvalidConfig(format!("too many nodes: {}", positions.len())))?;
    log::debug!(
        "placing {} nodes, gateway at ({:.1}, {:.1}), radius {:.1} m",
        node_count,
        gateway_position.x,
        gateway_position.y,
        max_distance_m
    );

    entities.register(Box::new(Gateway::new(GATEWAY_ENTITY_ID, config.gateway_config())));

    let assignment = config.assignment_config();
    let mode = config.simulation.experiment;
    let period = config.simulation.period();
    let mac = config.simulation.mac_policy();

    for (idx, position) in (0..node_count).zip(positions) {
        let node_id = NodeId(idx);
        let entity_id = EntityId::new(u64::from(idx) + 1);
        let distance_m = position.distance_to(&gateway_position);

        let profile = assign_profile(distance_m, mode, &assignment, &mut rng)?;
        log::debug!(
            "node {}: distance {:.1} m, SF{} BW{} CR4/{} {} Hz, {} dBm, rssi {:.2} dBm",
            idx,
            distance_m,
            profile.spreading_factor,
            profile.bandwidth.khz(),
            profile.coding_rate + 4,
            profile.frequency_hz,
            profile.tx_power_dbm,
            profile.rssi_dbm
        );

        let agent = NodeAgent::new(
            entity_id,
            NodeConfig {
                node_id,
                profile: profile.clone(),
                period,
                mac,
                traffic: config.simulation.traffic,
                gateway: GATEWAY_ENTITY_ID,
            },
        )?;
        entities.register(Box::new(agent));

        initial_events.push(Event {
            id: EventId(event_id_counter),
            time: SimTime::ZERO,
            source: entity_id,
            targets: vec![entity_id],
            payload: EventPayload::Timer { timer_id: TIMER_ARM },
        });
        event_id_counter += 1;

        node_infos.push(NodeInfo {
            name: format!("node-{idx}"),
            node_id,
            entity_id,
            position,
            distance_m,
            profile,
            period,
        });
    }

    Ok(BuiltSimulation {
        entities,
        initial_events,
        node_infos,
        gateway_entity_id: GATEWAY_ENTITY_ID,
        gateway_position,
        max_distance_m,
        rng,
    })
}
