//! # lorasim-common
//!
//! Common types and traits for the lorasim uplink collision simulator.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Planar positions ([`Position`])
//! - Entity identification ([`EntityId`], [`NodeId`])
//! - The transmission data model ([`RadioProfile`], [`Transmission`], [`Disposition`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`])

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// A node tried to put a second transmission on the air.
    #[error("Node {0} already has a transmission in flight")]
    DuplicateTransmission(NodeId),

    /// A parameter could not be used to build an entity.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in microseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds (float).
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0) as u64)
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as milliseconds (float), keeping the sub-millisecond part.
    pub fn as_millis_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// True when this time is an exact multiple of `step`.
    pub fn is_multiple_of(&self, step: SimTime) -> bool {
        step.0 == 0 || self.0 % step.0 == 0
    }

    /// Round up to the next multiple of `step`; exact multiples are unchanged.
    pub fn round_up_to(&self, step: SimTime) -> SimTime {
        if self.is_multiple_of(step) {
            *self
        } else {
            SimTime(self.0 + (step.0 - self.0 % step.0))
        }
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Mul<u64> for SimTime {
    type Output = SimTime;

    fn mul(self, rhs: u64) -> Self::Output {
        SimTime(self.0 * rhs)
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// A point on the simulation plane, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// East-west coordinate in meters.
    pub x: f64,
    /// North-south coordinate in meters.
    pub y: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    /// Euclidean distance to another position in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

/// Identifier of an end node, numbered from zero in placement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Transmission Model
// ============================================================================

/// LoRa channel bandwidth. Serialized as its width in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Bandwidth {
    /// 125 kHz.
    Khz125,
    /// 250 kHz.
    Khz250,
    /// 500 kHz.
    Khz500,
}

impl Bandwidth {
    /// All bandwidths, narrowest first.
    pub const ALL: [Bandwidth; 3] = [Bandwidth::Khz125, Bandwidth::Khz250, Bandwidth::Khz500];

    /// Bandwidth in kHz.
    pub fn khz(&self) -> u32 {
        match self {
            Bandwidth::Khz125 => 125,
            Bandwidth::Khz250 => 250,
            Bandwidth::Khz500 => 500,
        }
    }

    /// Bandwidth in Hz.
    pub fn hz(&self) -> u32 {
        self.khz() * 1000
    }

    /// Parse a bandwidth given in kHz.
    pub fn from_khz(khz: u32) -> Option<Self> {
        match khz {
            125 => Some(Bandwidth::Khz125),
            250 => Some(Bandwidth::Khz250),
            500 => Some(Bandwidth::Khz500),
            _ => None,
        }
    }
}

impl TryFrom<u32> for Bandwidth {
    type Error = String;

    fn try_from(khz: u32) -> Result<Self, Self::Error> {
        Bandwidth::from_khz(khz).ok_or_else(|| format!("unsupported bandwidth {khz} kHz"))
    }
}

impl From<Bandwidth> for u32 {
    fn from(bw: Bandwidth) -> u32 {
        bw.khz()
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}kHz", self.khz())
    }
}

/// Static radio parameters of a node, fixed when the simulation is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioProfile {
    /// Spreading factor (6-12).
    pub spreading_factor: u8,
    /// Channel bandwidth.
    pub bandwidth: Bandwidth,
    /// Coding rate index (1-4, representing 4/5 to 4/8).
    pub coding_rate: u8,
    /// Carrier frequency in Hz.
    pub frequency_hz: u32,
    /// Transmit power in dBm.
    pub tx_power_dbm: i8,
    /// Payload length in bytes.
    pub payload_len: u16,
    /// Received power at the gateway in dBm.
    pub rssi_dbm: f64,
    /// Sensitivity threshold for this SF/BW in dBm.
    pub sensitivity_dbm: f64,
    /// Total on-air duration.
    pub airtime: SimTime,
    /// Preamble part of the airtime.
    pub preamble: SimTime,
}

impl RadioProfile {
    /// True when the signal arrives below the receiver's sensitivity.
    pub fn below_sensitivity(&self) -> bool {
        self.rssi_dbm < self.sensitivity_dbm
    }
}

/// Outcome state of a single transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Disposition {
    /// Created, not yet sensed or admitted.
    #[default]
    Pending,
    /// Below sensitivity; never reached the gateway.
    Lost,
    /// Admitted to the gateway reception set.
    Admitted {
        /// A receive chain was allocated to it.
        processed: bool,
        /// Destroyed by another transmission.
        collided: bool,
    },
}

/// One transmission attempt of a node.
///
/// A node owns at most one of these at a time. The value moves to the
/// gateway on admission and comes back when its airtime has elapsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transmission {
    /// Owning node.
    pub node_id: NodeId,
    /// Radio parameters used for this attempt.
    pub profile: RadioProfile,
    /// Time the transmission started.
    pub start_time: SimTime,
    /// Time the gateway admitted it; unset for lost transmissions.
    pub arrival_time: Option<SimTime>,
    /// Current outcome.
    pub disposition: Disposition,
}

impl Transmission {
    /// Start a new attempt.
    pub fn new(node_id: NodeId, profile: RadioProfile, start_time: SimTime) -> Self {
        Transmission {
            node_id,
            profile,
            start_time,
            arrival_time: None,
            disposition: Disposition::Pending,
        }
    }

    /// Time at which the last symbol leaves the air.
    pub fn end_time(&self) -> SimTime {
        self.arrival_time.unwrap_or(self.start_time) + self.profile.airtime
    }

    /// Flag as lost to sensitivity. Only pending transmissions can be lost.
    pub fn mark_lost(&mut self) {
        if self.disposition == Disposition::Pending {
            self.disposition = Disposition::Lost;
        }
    }

    /// Record admission at the gateway.
    pub fn mark_admitted(&mut self, arrival_time: SimTime, processed: bool) {
        self.arrival_time = Some(arrival_time);
        self.disposition = Disposition::Admitted {
            processed,
            collided: false,
        };
    }

    /// Flag as collided. Idempotent; has no effect unless admitted.
    pub fn mark_collided(&mut self) {
        if let Disposition::Admitted { collided, .. } = &mut self.disposition {
            *collided = true;
        }
    }

    /// Lost to sensitivity.
    pub fn is_lost(&self) -> bool {
        self.disposition == Disposition::Lost
    }

    /// Destroyed by a collision.
    pub fn is_collided(&self) -> bool {
        matches!(self.disposition, Disposition::Admitted { collided: true, .. })
    }

    /// A receive chain was allocated to it.
    pub fn is_processed(&self) -> bool {
        matches!(self.disposition, Disposition::Admitted { processed: true, .. })
    }

    /// Neither lost nor collided.
    pub fn is_received(&self) -> bool {
        matches!(self.disposition, Disposition::Admitted { collided: false, .. })
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first, then insertion order)
        other.time.cmp(&self.time).then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// A node puts a transmission on the air. Node → Gateway.
#[derive(Debug, Clone)]
pub struct TransmitAirEvent {
    /// Node entity that is transmitting.
    pub radio_id: EntityId,
    /// The transmission, handed over to the gateway until it completes.
    pub transmission: Transmission,
}

/// The airtime of an admitted transmission elapsed. Gateway → Node.
#[derive(Debug, Clone)]
pub struct TransmissionCompleteEvent {
    /// The transmission with its final disposition.
    pub transmission: Transmission,
}

/// Final outcome of one attempt, flushed by the node that sent it.
#[derive(Debug, Clone)]
pub struct TransmissionReport {
    /// The completed transmission.
    pub transmission: Transmission,
    /// When the airtime ended.
    pub end_time: SimTime,
    /// Acknowledgment result for confirmed traffic; `None` for unconfirmed.
    pub acked: Option<bool>,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Radio Layer Events ===========
    /// A node started transmitting (directed to the gateway).
    TransmitAir(TransmitAirEvent),
    /// An admitted transmission left the air (gateway to its node).
    TransmissionComplete(TransmissionCompleteEvent),

    // =========== Accounting ===========
    /// A finished attempt; observed by the event loop, no targets.
    TransmissionReport(TransmissionReport),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
///
/// Holds the clock, the single random number generator of the run and the
/// events posted during the current dispatch.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    /// Create a context that continues drawing from an existing generator.
    pub fn with_rng(rng: ChaCha8Rng) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng,
            pending_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) {
        let event = Event {
            id: EventId(self.next_event_id),
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
    }

    /// Post an event to occur immediately (at current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) {
        self.post_event(SimTime::ZERO, targets, payload);
    }

    /// Take all pending events (used by event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Get the next event ID (used by event loop for external event creation).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// Make sure future event IDs start at `next` or later.
    pub fn reserve_event_ids(&mut self, next: u64) {
        self.next_event_id = self.next_event_id.max(next);
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                tracing::error!(target_entity = target.0, "entity not found while dispatching");
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
