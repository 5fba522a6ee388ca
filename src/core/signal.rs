//! Decaying coordination signals.
//!
//! Signals are weighted markers agents and the critique gate leave behind
//! (success, warning, failure). They only feed heuristics such as context
//! priming and surfaced warnings; nothing in scheduling correctness depends
//! on them. Strength decays exponentially and expired signals are pruned.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Default half-life of a signal's strength.
pub const DEFAULT_HALF_LIFE_SECS: u64 = 600;
/// Default lifetime before a signal expires outright.
pub const DEFAULT_TTL_SECS: u64 = 3600;
/// Signals decayed below this strength are pruned early.
const NEGLIGIBLE_STRENGTH: f64 = 0.01;

/// What a signal reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Success,
    Warning,
    Failure,
}

/// One weighted, decaying marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub kind: SignalKind,
    /// Initial strength, clamped to 0.0..=1.0.
    pub strength: f64,
    /// Free-form context tag, usually `<task>/<step>`.
    pub context: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(kind: SignalKind, strength: f64, context: &str) -> Self {
        Self::with_ttl(kind, strength, context, Duration::from_secs(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(kind: SignalKind, strength: f64, context: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            strength: strength.clamp(0.0, 1.0),
            context: context.to_string(),
            metadata: BTreeMap::new(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(ttl.as_secs() as i64),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Strength after exponential half-life decay at `now`.
    pub fn decayed_strength(&self, now: DateTime<Utc>, half_life: Duration) -> f64 {
        if self.is_expired(now) {
            return 0.0;
        }
        let age = (now - self.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        let half_life_secs = half_life.as_secs_f64().max(f64::EPSILON);
        self.strength * 0.5_f64.powf(age / half_life_secs)
    }
}

/// The live set of signals for a run.
pub struct SignalField {
    signals: Vec<Signal>,
    half_life: Duration,
}

impl SignalField {
    pub fn new() -> Self {
        Self::with_half_life(Duration::from_secs(DEFAULT_HALF_LIFE_SECS))
    }

    pub fn with_half_life(half_life: Duration) -> Self {
        Self {
            signals: Vec::new(),
            half_life,
        }
    }

    pub fn deposit(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    /// Drop expired and negligible signals; returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.signals.len();
        let half_life = self.half_life;
        self.signals.retain(|signal| {
            !signal.is_expired(now)
                && signal.decayed_strength(now, half_life) >= NEGLIGIBLE_STRENGTH
        });
        before - self.signals.len()
    }

    /// Live signals whose context starts with the given tag prefix, with
    /// their decayed strength, strongest first.
    pub fn read(&self, context_prefix: &str, now: DateTime<Utc>) -> Vec<(&Signal, f64)> {
        let mut found: Vec<(&Signal, f64)> = self
            .signals
            .iter()
            .filter(|signal| !signal.is_expired(now))
            .filter(|signal| signal.context.starts_with(context_prefix))
            .map(|signal| (signal, signal.decayed_strength(now, self.half_life)))
            .collect();
        found.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        found
    }

    /// Aggregate decayed strength per kind, for statistics.
    pub fn totals(&self, now: DateTime<Utc>) -> BTreeMap<&'static str, f64> {
        let mut totals = BTreeMap::new();
        for signal in &self.signals {
            let key = match signal.kind {
                SignalKind::Success => "success",
                SignalKind::Warning => "warning",
                SignalKind::Failure => "failure",
            };
            *totals.entry(key).or_insert(0.0) += signal.decayed_strength(now, self.half_life);
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }
}

impl Default for SignalField {
    fn default() -> Self {
        Self::new()
    }
}
