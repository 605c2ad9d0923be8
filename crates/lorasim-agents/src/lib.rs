//! # lorasim-agents
//!
//! End node simulation for lorasim.
//!
//! This crate provides [`NodeAgent`], the per-node transmission process:
//! wait a random interval, transmit, stay on the air for the airtime, report
//! the outcome and start over. The wait interval follows a [`MacPolicy`];
//! the reported outcome depends on the node's [`TrafficKind`].

use lorasim_common::{
    Entity, EntityId, Event, EventPayload, NodeId, RadioProfile, SimContext, SimError, SimTime, Transmission,
    TransmissionReport, TransmitAirEvent,
};
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ============================================================================
// Configuration Types
// ============================================================================

/// Channel access policy for picking the next transmission instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum MacPolicy {
    /// Transmit as soon as the exponential wait elapses.
    #[default]
    PureAloha,
    /// Snap the exponential wait forward to the next slot boundary.
    SlottedAloha {
        /// Slot length.
        slot: SimTime,
    },
}

impl MacPolicy {
    /// Numeric id used in result file names (0 pure, 1 slotted).
    pub fn index(&self) -> u8 {
        match self {
            MacPolicy::PureAloha => 0,
            MacPolicy::SlottedAloha { .. } => 1,
        }
    }
}

/// Uplink traffic type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficKind {
    /// No acknowledgment.
    #[default]
    Unconfirmed,
    /// Confirmed, acknowledgment expected in the first receive window.
    ConfirmedRx1,
    /// Confirmed, acknowledgment expected in the second receive window.
    ConfirmedRx2,
}

impl TrafficKind {
    /// Whether the node counts acknowledgments.
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, TrafficKind::Unconfirmed)
    }

    /// Numeric id used in result file names.
    pub fn index(&self) -> u8 {
        match self {
            TrafficKind::Unconfirmed => 0,
            TrafficKind::ConfirmedRx1 => 1,
            TrafficKind::ConfirmedRx2 => 2,
        }
    }
}

/// Configuration of one end node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node number.
    pub node_id: NodeId,
    /// Radio parameters used for every attempt.
    pub profile: RadioProfile,
    /// Mean interval between transmissions.
    pub period: SimTime,
    /// Channel access policy.
    pub mac: MacPolicy,
    /// Traffic type.
    pub traffic: TrafficKind,
    /// Gateway entity to transmit to.
    pub gateway: EntityId,
}

// ============================================================================
// Node State
// ============================================================================

/// Timer IDs for the node entity.
pub const TIMER_ARM: u64 = 0;
const TIMER_TRANSMIT: u64 = 1;
const TIMER_LOSS_COMPLETE: u64 = 2;

/// Transmission process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not yet started.
    Idle,
    /// Waiting for the next transmission instant.
    Waiting,
    /// On the air below sensitivity; the gateway never sees it.
    SensedLoss,
    /// On the air, held by the gateway.
    Admitted,
}

// ============================================================================
// Node Entity
// ============================================================================

/// End node entity.
pub struct NodeAgent {
    id: EntityId,
    config: NodeConfig,
    wait: Exp<f64>,
    state: NodeState,
    /// Transmission held by the node while it is lost on the air.
    current: Option<Transmission>,
    sent: u64,
    ack_received: u64,
    nack_received: u64,
}

impl NodeAgent {
    /// Create a new node entity.
    pub fn new(id: EntityId, config: NodeConfig) -> Result<Self, SimError> {
        let period_us = config.period.as_micros() as f64;
        if period_us <= 0.0 {
            return Err(SimError::InvalidParameter(format!(
                "node {} needs a positive transmission period",
                config.node_id
            )));
        }
        if let MacPolicy::SlottedAloha { slot } = config.mac {
            if slot == SimTime::ZERO {
                return Err(SimError::InvalidParameter("slot length must be positive".to_string()));
            }
        }
        let wait = Exp::new(1.0 / period_us).map_err(|e| SimError::InvalidParameter(e.to_string()))?;

        Ok(NodeAgent {
            id,
            config,
            wait,
            state: NodeState::Idle,
            current: None,
            sent: 0,
            ack_received: 0,
            nack_received: 0,
        })
    }

    /// Node number.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Current process state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Completed transmissions.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Acknowledged transmissions (confirmed traffic only).
    pub fn ack_received(&self) -> u64 {
        self.ack_received
    }

    /// Unacknowledged transmissions (confirmed traffic only).
    pub fn nack_received(&self) -> u64 {
        self.nack_received
    }

    /// Draw the next wait interval.
    pub fn draw_wait<R: Rng + ?Sized>(&self, rng: &mut R) -> SimTime {
        let raw = SimTime::from_micros(self.wait.sample(rng).round() as u64);
        match self.config.mac {
            MacPolicy::PureAloha => raw,
            MacPolicy::SlottedAloha { slot } => raw.round_up_to(slot),
        }
    }

    /// Start waiting for the next transmission.
    fn arm(&mut self, ctx: &mut SimContext) {
        let delay = self.draw_wait(ctx.rng());
        trace!(node = %self.config.node_id, delay_us = delay.as_micros(), "armed");
        self.state = NodeState::Waiting;
        ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id: TIMER_TRANSMIT });
    }

    /// Put a new transmission on the air.
    fn transmit(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        if self.state != NodeState::Waiting || self.current.is_some() {
            return Err(SimError::DuplicateTransmission(self.config.node_id));
        }

        let mut transmission = Transmission::new(self.config.node_id, self.config.profile.clone(), ctx.time());
        if self.config.profile.below_sensitivity() {
            transmission.mark_lost();
            self.current = Some(transmission);
            self.state = NodeState::SensedLoss;
            ctx.post_event(
                self.config.profile.airtime,
                vec![self.id],
                EventPayload::Timer {
                    timer_id: TIMER_LOSS_COMPLETE,
                },
            );
        } else {
            self.state = NodeState::Admitted;
            ctx.post_immediate(
                vec![self.config.gateway],
                EventPayload::TransmitAir(TransmitAirEvent {
                    radio_id: self.id,
                    transmission,
                }),
            );
        }
        Ok(())
    }

    /// Flush a finished transmission and re-arm.
    fn complete(&mut self, transmission: Transmission, ctx: &mut SimContext) {
        self.sent += 1;

        let acked = self.config.traffic.is_confirmed().then(|| transmission.is_received());
        match acked {
            Some(true) => self.ack_received += 1,
            Some(false) => self.nack_received += 1,
            None => {}
        }

        debug!(
            node = %self.config.node_id,
            disposition = ?transmission.disposition,
            sent = self.sent,
            "transmission complete"
        );
        ctx.post_immediate(
            vec![],
            EventPayload::TransmissionReport(TransmissionReport {
                transmission,
                end_time: ctx.time(),
                acked,
            }),
        );

        self.state = NodeState::Idle;
        self.arm(ctx);
    }
}

impl Entity for NodeAgent {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_ARM => {
                    if self.state == NodeState::Idle {
                        self.arm(ctx);
                    }
                }
                TIMER_TRANSMIT => self.transmit(ctx)?,
                TIMER_LOSS_COMPLETE => {
                    if let Some(transmission) = self.current.take() {
                        self.complete(transmission, ctx);
                    }
                }
                _ => {}
            },
            EventPayload::TransmissionComplete(done) => {
                if self.state == NodeState::Admitted && done.transmission.node_id == self.config.node_id {
                    self.complete(done.transmission.clone(), ctx);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::{Bandwidth, EventId, TransmissionCompleteEvent};
    use lorasim_lora::{airtime, preamble_duration};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const GATEWAY: EntityId = EntityId(0);
    const NODE: EntityId = EntityId(1);

    fn profile(rssi_dbm: f64) -> RadioProfile {
        RadioProfile {
            spreading_factor: 12,
            bandwidth: Bandwidth::Khz125,
            coding_rate: 4,
            frequency_hz: 860_000_000,
            tx_power_dbm: 14,
            payload_len: 20,
            rssi_dbm,
            sensitivity_dbm: -132.25,
            airtime: airtime(12, 4, 20, Bandwidth::Khz125),
            preamble: preamble_duration(12, Bandwidth::Khz125),
        }
    }

    fn node(rssi_dbm: f64, mac: MacPolicy, traffic: TrafficKind) -> NodeAgent {
        NodeAgent::new(
            NODE,
            NodeConfig {
                node_id: NodeId(0),
                profile: profile(rssi_dbm),
                period: SimTime::from_secs(10.0),
                mac,
                traffic,
                gateway: GATEWAY,
            },
        )
        .unwrap()
    }

    fn event(time: SimTime, payload: EventPayload) -> Event {
        Event {
            id: EventId(0),
            time,
            source: NODE,
            targets: vec![NODE],
            payload,
        }
    }

    /// Deliver the single pending event posted by the node.
    fn fire_next(agent: &mut NodeAgent, ctx: &mut SimContext) -> Event {
        let mut pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1, "expected one pending event, got {pending:?}");
        let next = pending.remove(0);
        ctx.set_time(next.time);
        if next.targets.contains(&NODE) {
            agent.handle_event(&next, ctx).unwrap();
        }
        next
    }

    #[test]
    fn test_arm_schedules_transmit_timer() {
        let mut agent = node(-100.0, MacPolicy::PureAloha, TrafficKind::Unconfirmed);
        let mut ctx = SimContext::new(42);
        agent
            .handle_event(&event(SimTime::ZERO, EventPayload::Timer { timer_id: TIMER_ARM }), &mut ctx)
            .unwrap();
        assert_eq!(agent.state(), NodeState::Waiting);

        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].targets, vec![NODE]);
        assert!(matches!(pending[0].payload, EventPayload::Timer { timer_id: TIMER_TRANSMIT }));
    }

    #[test]
    fn test_lost_transmission_stays_on_node() {
        let mut agent = node(-140.0, MacPolicy::PureAloha, TrafficKind::Unconfirmed);
        let mut ctx = SimContext::new(42);
        agent
            .handle_event(&event(SimTime::ZERO, EventPayload::Timer { timer_id: TIMER_ARM }), &mut ctx)
            .unwrap();

        // Transmit timer fires: no TransmitAir, loss timer after airtime
        let transmit = fire_next(&mut agent, &mut ctx);
        assert_eq!(agent.state(), NodeState::SensedLoss);
        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].targets, vec![NODE]);
        assert_eq!(pending[0].time, transmit.time + agent.config.profile.airtime);

        // Loss timer fires: report and re-arm
        ctx.set_time(pending[0].time);
        agent.handle_event(&pending[0], &mut ctx).unwrap();
        assert_eq!(agent.sent(), 1);
        assert_eq!(agent.state(), NodeState::Waiting);

        let pending = ctx.take_pending_events();
        let report = pending
            .iter()
            .find_map(|e| match &e.payload {
                EventPayload::TransmissionReport(r) => Some(r),
                _ => None,
            })
            .unwrap();
        assert!(report.transmission.is_lost());
        assert_eq!(report.acked, None);
        assert!(pending
            .iter()
            .any(|e| matches!(e.payload, EventPayload::Timer { timer_id: TIMER_TRANSMIT })));
        assert!(!pending.iter().any(|e| matches!(e.payload, EventPayload::TransmitAir(_))));
    }

    #[test]
    fn test_admitted_transmission_goes_to_gateway() {
        let mut agent = node(-100.0, MacPolicy::PureAloha, TrafficKind::ConfirmedRx1);
        let mut ctx = SimContext::new(7);
        agent
            .handle_event(&event(SimTime::ZERO, EventPayload::Timer { timer_id: TIMER_ARM }), &mut ctx)
            .unwrap();

        let transmit = fire_next(&mut agent, &mut ctx);
        assert_eq!(agent.state(), NodeState::Admitted);

        let pending = ctx.take_pending_events();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].targets, vec![GATEWAY]);
        let mut transmission = match &pending[0].payload {
            EventPayload::TransmitAir(air) => {
                assert_eq!(air.radio_id, NODE);
                air.transmission.clone()
            }
            other => panic!("unexpected payload {other:?}"),
        };
        assert_eq!(transmission.start_time, transmit.time);

        // Gateway hands it back undamaged
        transmission.mark_admitted(transmit.time, true);
        let end = transmit.time + transmission.profile.airtime;
        ctx.set_time(end);
        agent
            .handle_event(
                &event(
                    end,
                    EventPayload::TransmissionComplete(TransmissionCompleteEvent { transmission }),
                ),
                &mut ctx,
            )
            .unwrap();

        assert_eq!(agent.sent(), 1);
        assert_eq!(agent.ack_received(), 1);
        assert_eq!(agent.nack_received(), 0);
    }

    #[test]
    fn test_collided_confirmed_counts_nack() {
        let mut agent = node(-100.0, MacPolicy::PureAloha, TrafficKind::ConfirmedRx2);
        let mut ctx = SimContext::new(7);
        agent
            .handle_event(&event(SimTime::ZERO, EventPayload::Timer { timer_id: TIMER_ARM }), &mut ctx)
            .unwrap();
        fire_next(&mut agent, &mut ctx);
        let air = ctx.take_pending_events().remove(0);
        let mut transmission = match air.payload {
            EventPayload::TransmitAir(air) => air.transmission,
            other => panic!("unexpected payload {other:?}"),
        };
        transmission.mark_admitted(air.time, true);
        transmission.mark_collided();

        agent
            .handle_event(
                &event(
                    air.time,
                    EventPayload::TransmissionComplete(TransmissionCompleteEvent { transmission }),
                ),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(agent.ack_received(), 0);
        assert_eq!(agent.nack_received(), 1);
    }

    #[test]
    fn test_transmit_while_on_air_is_rejected() {
        let mut agent = node(-100.0, MacPolicy::PureAloha, TrafficKind::Unconfirmed);
        let mut ctx = SimContext::new(7);
        agent
            .handle_event(&event(SimTime::ZERO, EventPayload::Timer { timer_id: TIMER_ARM }), &mut ctx)
            .unwrap();
        let transmit = fire_next(&mut agent, &mut ctx);
        let err = agent.handle_event(&transmit, &mut ctx).unwrap_err();
        assert!(matches!(err, SimError::DuplicateTransmission(NodeId(0))));
    }

    #[test]
    fn test_exponential_wait_mean() {
        let agent = node(-100.0, MacPolicy::PureAloha, TrafficKind::Unconfirmed);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 20_000;
        let total: f64 = (0..n).map(|_| agent.draw_wait(&mut rng).as_secs_f64()).sum();
        let mean = total / n as f64;
        assert!((mean - 10.0).abs() < 0.5, "mean wait {mean} should be close to 10 s");
    }

    #[test]
    fn test_slotted_wait_lands_on_slot_boundary() {
        let slot = SimTime::from_millis(100);
        let agent = node(-100.0, MacPolicy::SlottedAloha { slot }, TrafficKind::Unconfirmed);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..1000 {
            let wait = agent.draw_wait(&mut rng);
            assert!(wait.is_multiple_of(slot));
        }
    }

    #[test]
    fn test_invalid_period_rejected() {
        let result = NodeAgent::new(
            NODE,
            NodeConfig {
                node_id: NodeId(0),
                profile: profile(-100.0),
                period: SimTime::ZERO,
                mac: MacPolicy::PureAloha,
                traffic: TrafficKind::Unconfirmed,
                gateway: GATEWAY,
            },
        );
        assert!(matches!(result, Err(SimError::InvalidParameter(_))));
    }
}
