//! Gateway reception state and the gateway entity.

use crate::collision::{check_collisions, CollisionConfig, CollisionVerdict};
use lorasim_common::{
    Entity, EntityId, Event, EventPayload, NodeId, SimContext, SimError, SimTime, Transmission,
    TransmissionCompleteEvent, TransmitAirEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Timer ID base for reception completion; the node number is added to it.
pub const TIMER_RX_COMPLETE_BASE: u64 = 0x1000;

// ============================================================================
// Reception Set
// ============================================================================

/// Outcome of admitting a transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// A receive chain was allocated.
    pub processed: bool,
    /// Collisions caused by the admission.
    pub verdict: CollisionVerdict,
}

/// Transmissions between admission and completion, in arrival order.
///
/// At most one entry per node. At most `max_concurrent_receives` entries
/// are processed at any time; the rest occupy the air undecoded.
#[derive(Debug, Clone)]
pub struct ReceptionSet {
    in_flight: Vec<Transmission>,
    max_concurrent_receives: usize,
}

impl ReceptionSet {
    /// Create an empty set.
    pub fn new(max_concurrent_receives: usize) -> Self {
        ReceptionSet {
            in_flight: Vec::new(),
            max_concurrent_receives,
        }
    }

    /// Admit a transmission arriving at `now`.
    ///
    /// Decides `processed` from the current load, runs collision detection
    /// against the members already present, applies the verdict to both
    /// sides and inserts the newcomer.
    pub fn admit(
        &mut self,
        mut transmission: Transmission,
        now: SimTime,
        collision: &CollisionConfig,
    ) -> Result<Admission, SimError> {
        if self.contains(transmission.node_id) {
            return Err(SimError::DuplicateTransmission(transmission.node_id));
        }

        let processed = self.processing_count() < self.max_concurrent_receives;
        transmission.mark_admitted(now, processed);

        let verdict = check_collisions(&transmission, &self.in_flight, now, collision);
        if verdict.newcomer_collided {
            transmission.mark_collided();
        }
        for member in self
            .in_flight
            .iter_mut()
            .filter(|t| verdict.destroyed.contains(&t.node_id))
        {
            member.mark_collided();
        }

        trace!(
            node = %transmission.node_id,
            processed,
            collided = verdict.newcomer_collided,
            in_flight = self.in_flight.len(),
            "admitted"
        );
        self.in_flight.push(transmission);
        Ok(Admission { processed, verdict })
    }

    /// Remove a node's transmission when its airtime has elapsed.
    pub fn complete(&mut self, node_id: NodeId) -> Option<Transmission> {
        let idx = self.in_flight.iter().position(|t| t.node_id == node_id)?;
        Some(self.in_flight.remove(idx))
    }

    /// Whether the node has a transmission in flight.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.in_flight.iter().any(|t| t.node_id == node_id)
    }

    /// A node's transmission in flight.
    pub fn get(&self, node_id: NodeId) -> Option<&Transmission> {
        self.in_flight.iter().find(|t| t.node_id == node_id)
    }

    /// Members with a receive chain allocated.
    pub fn processing_count(&self) -> usize {
        self.in_flight.iter().filter(|t| t.is_processed()).count()
    }

    /// Members in arrival order.
    pub fn in_flight(&self) -> &[Transmission] {
        &self.in_flight
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// No transmission in flight.
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

// ============================================================================
// Gateway Entity
// ============================================================================

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Number of receive chains.
    pub max_concurrent_receives: usize,
    /// Collision engine settings.
    pub collision: CollisionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            max_concurrent_receives: 8,
            collision: CollisionConfig::default(),
        }
    }
}

/// The single receiver all nodes transmit to.
///
/// Receives TransmitAir events, keeps the reception set and hands every
/// transmission back to its node once the airtime has elapsed.
pub struct Gateway {
    id: EntityId,
    config: GatewayConfig,
    reception: ReceptionSet,
    senders: BTreeMap<NodeId, EntityId>,
}

impl Gateway {
    /// Create a new gateway entity.
    pub fn new(id: EntityId, config: GatewayConfig) -> Self {
        Gateway {
            id,
            reception: ReceptionSet::new(config.max_concurrent_receives),
            config,
            senders: BTreeMap::new(),
        }
    }

    /// Current reception set.
    pub fn reception(&self) -> &ReceptionSet {
        &self.reception
    }

    fn handle_transmit_air(&mut self, tx_event: &TransmitAirEvent, ctx: &mut SimContext) -> Result<(), SimError> {
        let transmission = tx_event.transmission.clone();
        let node_id = transmission.node_id;
        let airtime = transmission.profile.airtime;

        let admission = self
            .reception
            .admit(transmission, ctx.time(), &self.config.collision)?;
        if !admission.verdict.is_clear() {
            debug!(
                node = %node_id,
                newcomer_collided = admission.verdict.newcomer_collided,
                destroyed = admission.verdict.destroyed.len(),
                "collision at gateway"
            );
        }
        self.senders.insert(node_id, tx_event.radio_id);

        ctx.post_event(
            airtime,
            vec![self.id],
            EventPayload::Timer {
                timer_id: TIMER_RX_COMPLETE_BASE + u64::from(node_id.0),
            },
        );
        Ok(())
    }

    fn handle_rx_complete(&mut self, node_id: NodeId, ctx: &mut SimContext) -> Result<(), SimError> {
        let transmission = self.reception.complete(node_id).ok_or_else(|| SimError::HandlerError {
            entity: self.id,
            message: format!("no transmission in flight for node {node_id}"),
        })?;
        let sender = self.senders.remove(&node_id).ok_or_else(|| SimError::HandlerError {
            entity: self.id,
            message: format!("unknown sender for node {node_id}"),
        })?;

        ctx.post_immediate(
            vec![sender],
            EventPayload::TransmissionComplete(TransmissionCompleteEvent { transmission }),
        );
        Ok(())
    }
}

impl Entity for Gateway {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::TransmitAir(tx_event) => self.handle_transmit_air(tx_event, ctx),
            EventPayload::Timer { timer_id } if *timer_id >= TIMER_RX_COMPLETE_BASE => {
                let node_id = NodeId((*timer_id - TIMER_RX_COMPLETE_BASE) as u32);
                self.handle_rx_complete(node_id, ctx)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collision::{CollisionMode, FrequencyRule};
    use crate::{airtime, preamble_duration};
    use lorasim_common::{Bandwidth, EventId, RadioProfile};

    fn transmission(node: u32, frequency_hz: u32, rssi_dbm: f64) -> Transmission {
        let profile = RadioProfile {
            spreading_factor: 12,
            bandwidth: Bandwidth::Khz125,
            coding_rate: 4,
            frequency_hz,
            tx_power_dbm: 14,
            payload_len: 20,
            rssi_dbm,
            sensitivity_dbm: -132.25,
            airtime: airtime(12, 4, 20, Bandwidth::Khz125),
            preamble: preamble_duration(12, Bandwidth::Khz125),
        };
        Transmission::new(NodeId(node), profile, SimTime::ZERO)
    }

    fn full() -> CollisionConfig {
        CollisionConfig {
            mode: CollisionMode::Full,
            frequency_rule: FrequencyRule::Legacy,
        }
    }

    #[test]
    fn test_simplified_pair_both_collided() {
        let mut set = ReceptionSet::new(8);
        let config = CollisionConfig::default();
        set.admit(transmission(0, 860_000_000, -100.0), SimTime::ZERO, &config).unwrap();
        set.admit(transmission(1, 860_000_000, -100.0), SimTime::ZERO, &config).unwrap();

        assert!(set.get(NodeId(0)).unwrap().is_collided());
        assert!(set.get(NodeId(1)).unwrap().is_collided());
    }

    #[test]
    fn test_full_pair_only_weaker_collided() {
        let mut set = ReceptionSet::new(8);
        set.admit(transmission(0, 860_000_000, -100.0), SimTime::ZERO, &full()).unwrap();
        set.admit(transmission(1, 860_000_000, -110.0), SimTime::ZERO, &full()).unwrap();

        assert!(!set.get(NodeId(0)).unwrap().is_collided());
        assert!(set.get(NodeId(1)).unwrap().is_collided());
    }

    #[test]
    fn test_saturation_marks_unprocessed_without_collision() {
        let mut set = ReceptionSet::new(1);
        let config = CollisionConfig::default();
        let first = set.admit(transmission(0, 860_000_000, -100.0), SimTime::ZERO, &config).unwrap();
        let second = set.admit(transmission(1, 868_000_000, -100.0), SimTime::ZERO, &config).unwrap();

        assert!(first.processed);
        assert!(!second.processed);
        let second_tx = set.get(NodeId(1)).unwrap();
        assert!(!second_tx.is_processed());
        assert!(!second_tx.is_collided());
        assert!(second_tx.is_received());
        assert_eq!(set.processing_count(), 1);
    }

    #[test]
    fn test_processing_frees_up_on_completion() {
        let mut set = ReceptionSet::new(1);
        let config = CollisionConfig::default();
        set.admit(transmission(0, 860_000_000, -100.0), SimTime::ZERO, &config).unwrap();
        let done = set.complete(NodeId(0)).unwrap();
        assert!(done.is_processed());
        assert!(set.is_empty());

        let next = set.admit(transmission(1, 860_000_000, -100.0), SimTime::from_millis(5), &config).unwrap();
        assert!(next.processed);
        assert_eq!(set.get(NodeId(1)).unwrap().arrival_time, Some(SimTime::from_millis(5)));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut set = ReceptionSet::new(8);
        let config = CollisionConfig::default();
        set.admit(transmission(3, 860_000_000, -100.0), SimTime::ZERO, &config).unwrap();
        let err = set
            .admit(transmission(3, 860_000_000, -100.0), SimTime::from_millis(1), &config)
            .unwrap_err();
        assert!(matches!(err, SimError::DuplicateTransmission(NodeId(3))));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_gateway_entity_round_trip() {
        let gateway_id = EntityId::new(1);
        let node_entity = EntityId::new(2);
        let mut gateway = Gateway::new(gateway_id, GatewayConfig::default());
        let mut ctx = SimContext::new(42);

        let tx = transmission(0, 860_000_000, -100.0);
        let airtime = tx.profile.airtime;
        let event = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: node_entity,
            targets: vec![gateway_id],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                radio_id: node_entity,
                transmission: tx,
            }),
        };
        gateway.handle_event(&event, &mut ctx).unwrap();
        assert_eq!(gateway.reception().len(), 1);

        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        let timer = pending.into_iter().next().unwrap();
        assert_eq!(timer.time, airtime);
        assert!(matches!(timer.payload, EventPayload::Timer { timer_id } if timer_id == TIMER_RX_COMPLETE_BASE));

        ctx.set_time(timer.time);
        gateway.handle_event(&timer, &mut ctx).unwrap();
        assert!(gateway.reception().is_empty());

        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].targets, vec![node_entity]);
        match &pending[0].payload {
            EventPayload::TransmissionComplete(done) => {
                assert_eq!(done.transmission.node_id, NodeId(0));
                assert!(done.transmission.is_received());
                assert!(done.transmission.is_processed());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_gateway_unknown_completion_is_error() {
        let mut gateway = Gateway::new(EntityId::new(1), GatewayConfig::default());
        let mut ctx = SimContext::new(1);
        let event = Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: EntityId::new(1),
            targets: vec![EntityId::new(1)],
            payload: EventPayload::Timer {
                timer_id: TIMER_RX_COMPLETE_BASE + 9,
            },
        };
        assert!(gateway.handle_event(&event, &mut ctx).is_err());
    }
}
