use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::store::{EventRecord, MagnitudeRecord, OriginRecord, PickRecord};

/// Magnitude types that are scored with a likelihood comment and therefore
/// alert from annotation resolution rather than directly from ingest.
pub const PRIMARY_MAG_TYPES: [&str; 2] = ["MVS", "Mfd"];

pub fn is_primary_mag_type(mag_type: &str) -> bool {
    PRIMARY_MAG_TYPES.contains(&mag_type)
}

/// One row of an event's update timeline: a single magnitude revision joined
/// with its origin, keyed by the revision's modification (else creation) time.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub key: DateTime<Utc>,
    pub magnitude_id: String,
    pub origin_id: String,
    pub mag_type: String,
    pub magnitude: f64,
    pub author: String,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub arrival_count: u32,
    pub station_count: Option<u32>,
    pub origin_time: DateTime<Utc>,
    pub reference_time: DateTime<Utc>,
    /// Seconds from origin time to the revision's reference time.
    pub origin_diff: f64,
    pub likelihood: Option<f64>,
    pub rupture_strike: Option<f64>,
    pub rupture_length: Option<f64>,
    pub alerted: bool,
}

#[derive(Debug, Clone)]
pub struct LogicalEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub published: bool,
    pub last_alerted: Option<usize>,
    pub alert_seq: u32,
    pub updates: Vec<UpdateRecord>,
    pub armed_at: Option<DateTime<Utc>>,
}

impl LogicalEvent {
    pub fn new(id: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            timestamp,
            published: false,
            last_alerted: None,
            alert_seq: 0,
            updates: Vec::new(),
            armed_at: None,
        }
    }

    pub fn has_update_key(&self, key: DateTime<Utc>) -> bool {
        self.updates.iter().any(|update| update.key == key)
    }

    /// Index of the update for a magnitude id, preferring the latest key when
    /// a magnitude produced more than one timeline row.
    pub fn latest_update_for_magnitude(&self, magnitude_id: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, update) in self.updates.iter().enumerate() {
            if update.magnitude_id != magnitude_id {
                continue;
            }
            match best {
                None => best = Some(idx),
                Some(prev) if self.updates[prev].key < update.key => best = Some(idx),
                Some(_) => {}
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Likelihood,
    RuptureStrike,
    RuptureLength,
}

impl AnnotationKind {
    pub fn parse(id: &str) -> Option<Self> {
        match id {
            "likelihood" => Some(Self::Likelihood),
            "rupture-strike" => Some(Self::RuptureStrike),
            "rupture-length" => Some(Self::RuptureLength),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Likelihood => "likelihood",
            Self::RuptureStrike => "rupture-strike",
            Self::RuptureLength => "rupture-length",
        }
    }
}

/// A magnitude comment waiting for its parent chain to resolve.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub magnitude_id: String,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}

/// Everything a downstream consumer needs about a dispatched alert. Built
/// from the correlation store at decision time; missing referents are logged
/// by the engine and left as None.
#[derive(Debug, Clone, Serialize)]
pub struct AlertContext {
    pub event_id: String,
    pub magnitude_id: String,
    pub alert_seq: u32,
    pub likelihood: Option<f64>,
    pub event: Option<EventRecord>,
    pub origin: Option<OriginRecord>,
    pub magnitude: Option<MagnitudeRecord>,
    pub picks: Vec<PickRecord>,
}

/// Side effects the engine asks the dispatch layer to perform. The engine
/// never talks to a transport directly.
#[derive(Debug, Clone)]
pub enum Action {
    PublishAlert(Box<AlertContext>),
    Email {
        event_id: String,
        mag_type: String,
        magnitude: f64,
        min_diff: f64,
        body: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub events_tracked: usize,
    pub updates_accepted: u64,
    pub duplicate_updates: u64,
    pub late_updates: u64,
    pub unresolved_updates: u64,
    pub alerts_sent: u64,
    pub reports_generated: u64,
    pub pending_annotations: usize,
    pub events_evicted: u64,
}
