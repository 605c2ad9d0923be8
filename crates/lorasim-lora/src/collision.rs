//! Collision detection between a newly arriving transmission and the
//! transmissions already in flight at the gateway.
//!
//! A pair conflicts when the frequency and spreading-factor predicates both
//! hold. In [`CollisionMode::Simplified`] a conflict destroys both sides. In
//! [`CollisionMode::Full`] the pair must also overlap in time, and then the
//! capture effect decides which side survives.

use crate::{symbol_time, CAPTURE_EFFECT_THRESHOLD_DB, PREAMBLE_SYMBOLS};
use lorasim_common::{Bandwidth, NodeId, SimTime, Transmission};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Preamble symbols the receiver can lose and still lock on.
const RECOVERABLE_PREAMBLE_SYMBOLS: u64 = 5;

/// How a frequency/SF conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionMode {
    /// Every conflicting pair destroys both transmissions.
    #[default]
    Simplified,
    /// Conflicts also need timing overlap; capture effect picks the survivor.
    Full,
}

/// Frequency overlap predicate variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyRule {
    /// The wide-channel branches test the newcomer's bandwidth or the
    /// incumbent's *frequency* against 500/250. Asymmetric: a BW500
    /// newcomer widens the window, a BW500 incumbent does not.
    #[default]
    Legacy,
    /// The wide-channel branches test the bandwidth of either side.
    Symmetric,
}

/// Collision engine settings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollisionConfig {
    /// Resolution mode.
    pub mode: CollisionMode,
    /// Frequency overlap predicate.
    pub frequency_rule: FrequencyRule,
}

/// Side destroyed by the power capture rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Signals too close; neither is decodable.
    Both,
    /// The newcomer is at least 6 dB weaker.
    Newcomer,
    /// The incumbent is at least 6 dB weaker.
    Incumbent,
}

/// Result of checking one newcomer against the in-flight set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollisionVerdict {
    /// The newcomer was destroyed by at least one pair.
    pub newcomer_collided: bool,
    /// In-flight transmissions destroyed by the newcomer, in set order.
    pub destroyed: Vec<NodeId>,
}

impl CollisionVerdict {
    /// Nothing was destroyed.
    pub fn is_clear(&self) -> bool {
        !self.newcomer_collided && self.destroyed.is_empty()
    }
}

/// Frequency overlap between newcomer `a` and incumbent `b`.
pub fn frequency_collision(a: &Transmission, b: &Transmission, rule: FrequencyRule) -> bool {
    let separation = a.profile.frequency_hz.abs_diff(b.profile.frequency_hz);
    let (wide_500, wide_250) = match rule {
        FrequencyRule::Legacy => (
            a.profile.bandwidth == Bandwidth::Khz500 || b.profile.frequency_hz == 500,
            a.profile.bandwidth == Bandwidth::Khz250 || b.profile.frequency_hz == 250,
        ),
        FrequencyRule::Symmetric => (
            a.profile.bandwidth == Bandwidth::Khz500 || b.profile.bandwidth == Bandwidth::Khz500,
            a.profile.bandwidth == Bandwidth::Khz250 || b.profile.bandwidth == Bandwidth::Khz250,
        ),
    };

    if separation <= 120_000 && wide_500 {
        trace!(separation, "frequency collision (500 kHz)");
        true
    } else if separation <= 60_000 && wide_250 {
        trace!(separation, "frequency collision (250 kHz)");
        true
    } else {
        separation <= 30_000
    }
}

/// Same spreading factor on both sides.
pub fn sf_collision(a: &Transmission, b: &Transmission) -> bool {
    a.profile.spreading_factor == b.profile.spreading_factor
}

/// Timing overlap for a newcomer arriving at `now`.
///
/// The newcomer's preamble tolerates losing its first five symbols, so its
/// critical section starts `(8 - 5) * Tsym` after arrival. The pair collides
/// when the incumbent is still on the air at that point.
pub fn timing_collision(newcomer: &Transmission, incumbent: &Transmission, now: SimTime) -> bool {
    let t_sym = symbol_time(newcomer.profile.spreading_factor, newcomer.profile.bandwidth);
    let critical_start = now + t_sym * (PREAMBLE_SYMBOLS - RECOVERABLE_PREAMBLE_SYMBOLS);
    let incumbent_end = incumbent.end_time();
    trace!(
        critical_start_us = critical_start.as_micros(),
        incumbent_end_us = incumbent_end.as_micros(),
        "timing check"
    );
    critical_start < incumbent_end
}

/// Capture effect between two overlapping transmissions.
pub fn power_collision(newcomer: &Transmission, incumbent: &Transmission) -> Capture {
    let delta = newcomer.profile.rssi_dbm - incumbent.profile.rssi_dbm;
    if delta.abs() < CAPTURE_EFFECT_THRESHOLD_DB {
        Capture::Both
    } else if delta < CAPTURE_EFFECT_THRESHOLD_DB {
        Capture::Newcomer
    } else {
        Capture::Incumbent
    }
}

/// Check a newcomer against every in-flight transmission of another node.
///
/// Flags are not touched; the caller applies the verdict.
pub fn check_collisions(
    newcomer: &Transmission,
    in_flight: &[Transmission],
    now: SimTime,
    config: &CollisionConfig,
) -> CollisionVerdict {
    let mut verdict = CollisionVerdict::default();

    for other in in_flight.iter().filter(|t| t.node_id != newcomer.node_id) {
        if !(frequency_collision(newcomer, other, config.frequency_rule) && sf_collision(newcomer, other)) {
            continue;
        }

        let (newcomer_hit, incumbent_hit) = match config.mode {
            CollisionMode::Simplified => (true, true),
            CollisionMode::Full => {
                if !timing_collision(newcomer, other, now) {
                    continue;
                }
                match power_collision(newcomer, other) {
                    Capture::Both => (true, true),
                    Capture::Newcomer => (true, false),
                    Capture::Incumbent => (false, true),
                }
            }
        };

        trace!(
            newcomer = %newcomer.node_id,
            incumbent = %other.node_id,
            newcomer_hit,
            incumbent_hit,
            "collision"
        );
        verdict.newcomer_collided |= newcomer_hit;
        if incumbent_hit && !verdict.destroyed.contains(&other.node_id) {
            verdict.destroyed.push(other.node_id);
        }
    }

    verdict
}
