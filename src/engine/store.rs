use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Raw inbound objects as the feed delivers them. These double as the wire
/// model: the feed deserializes straight into them and the bus payload
/// serializes straight out of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickRecord {
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub station: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginRecord {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub pick_ids: Vec<String>,
    #[serde(default)]
    pub arrival_count: Option<u32>,
}

impl OriginRecord {
    pub fn effective_arrival_count(&self) -> u32 {
        self.arrival_count.unwrap_or(self.pick_ids.len() as u32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnitudeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub mag_type: String,
    pub value: f64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub station_count: Option<u32>,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub modification_time: Option<DateTime<Utc>>,
    /// Parent origin; the feed fills this from the envelope when the object
    /// itself does not carry it.
    #[serde(default)]
    pub origin_id: Option<String>,
}

impl MagnitudeRecord {
    /// Timeline key: modification time when present, creation time otherwise.
    pub fn update_key(&self) -> DateTime<Utc> {
        self.modification_time.unwrap_or(self.creation_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(default)]
    pub origin_ids: Vec<String>,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub modification_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preferred_magnitude_id: Option<String>,
}

impl EventRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.modification_time.unwrap_or(self.creation_time)
    }
}

#[derive(Debug, Clone)]
struct Entry<T> {
    fed_at: DateTime<Utc>,
    record: T,
}

/// Owning cache for raw inbound objects, keyed by public id. Entries older
/// than the retention window are unreachable through the getters; physical
/// removal happens when `prune` runs from the garbage collector.
#[derive(Debug)]
pub struct CorrelationStore {
    ttl: Duration,
    picks: HashMap<String, Entry<PickRecord>>,
    origins: HashMap<String, Entry<OriginRecord>>,
    magnitudes: HashMap<String, Entry<MagnitudeRecord>>,
    events: HashMap<String, Entry<EventRecord>>,
}

impl CorrelationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            picks: HashMap::new(),
            origins: HashMap::new(),
            magnitudes: HashMap::new(),
            events: HashMap::new(),
        }
    }

    pub fn feed_pick(&mut self, record: PickRecord, now: DateTime<Utc>) {
        self.picks.insert(record.id.clone(), Entry { fed_at: now, record });
    }

    pub fn feed_origin(&mut self, record: OriginRecord, now: DateTime<Utc>) {
        self.origins.insert(record.id.clone(), Entry { fed_at: now, record });
    }

    pub fn feed_magnitude(&mut self, record: MagnitudeRecord, now: DateTime<Utc>) {
        self.magnitudes.insert(record.id.clone(), Entry { fed_at: now, record });
    }

    pub fn feed_event(&mut self, record: EventRecord, now: DateTime<Utc>) {
        self.events.insert(record.id.clone(), Entry { fed_at: now, record });
    }

    pub fn pick(&self, id: &str, now: DateTime<Utc>) -> Option<&PickRecord> {
        self.fresh(&self.picks, id, now)
    }

    pub fn origin(&self, id: &str, now: DateTime<Utc>) -> Option<&OriginRecord> {
        self.fresh(&self.origins, id, now)
    }

    pub fn magnitude(&self, id: &str, now: DateTime<Utc>) -> Option<&MagnitudeRecord> {
        self.fresh(&self.magnitudes, id, now)
    }

    pub fn event(&self, id: &str, now: DateTime<Utc>) -> Option<&EventRecord> {
        self.fresh(&self.events, id, now)
    }

    pub fn set_preferred_magnitude(&mut self, event_id: &str, magnitude_id: &str) -> bool {
        match self.events.get_mut(event_id) {
            Some(entry) => {
                entry.record.preferred_magnitude_id = Some(magnitude_id.to_string());
                true
            }
            None => false,
        }
    }

    fn fresh<'a, T>(
        &self,
        map: &'a HashMap<String, Entry<T>>,
        id: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a T> {
        map.get(id)
            .filter(|entry| now - entry.fed_at <= self.ttl)
            .map(|entry| &entry.record)
    }

    /// Drop entries past the retention window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.picks.retain(|_, entry| now - entry.fed_at <= ttl);
        self.origins.retain(|_, entry| now - entry.fed_at <= ttl);
        self.magnitudes.retain(|_, entry| now - entry.fed_at <= ttl);
        self.events.retain(|_, entry| now - entry.fed_at <= ttl);
    }
}

/// Two chained id maps: magnitude -> origin and origin -> event. All
/// cross-references in the engine go through here; nothing holds pointers.
#[derive(Debug, Default)]
pub struct LookupIndex {
    origin_by_magnitude: HashMap<String, String>,
    event_by_origin: HashMap<String, String>,
}

impl LookupIndex {
    pub fn record_magnitude(&mut self, magnitude_id: &str, origin_id: &str) {
        self.origin_by_magnitude
            .insert(magnitude_id.to_string(), origin_id.to_string());
    }

    pub fn record_event(&mut self, event_id: &str, origin_ids: &[String]) {
        for origin_id in origin_ids {
            self.event_by_origin
                .insert(origin_id.clone(), event_id.to_string());
        }
    }

    pub fn origin_of(&self, magnitude_id: &str) -> Option<&str> {
        self.origin_by_magnitude.get(magnitude_id).map(String::as_str)
    }

    pub fn event_of_origin(&self, origin_id: &str) -> Option<&str> {
        self.event_by_origin.get(origin_id).map(String::as_str)
    }

    pub fn resolve_event(&self, magnitude_id: &str) -> Option<&str> {
        self.event_of_origin(self.origin_of(magnitude_id)?)
    }

    /// Magnitude ids currently associated with an event, via both maps.
    pub fn magnitudes_for_event(&self, event_id: &str) -> Vec<String> {
        let origins: HashSet<&str> = self
            .event_by_origin
            .iter()
            .filter(|(_, ev)| ev.as_str() == event_id)
            .map(|(origin, _)| origin.as_str())
            .collect();
        self.origin_by_magnitude
            .iter()
            .filter(|(_, origin)| origins.contains(origin.as_str()))
            .map(|(magnitude, _)| magnitude.clone())
            .collect()
    }

    /// Cascade removal for evicted events: origin entries first, then the
    /// magnitude entries that pointed at those origins. Returns the removed
    /// magnitude ids so pending annotations can be dropped with them.
    pub fn remove_events(&mut self, event_ids: &HashSet<String>) -> Vec<String> {
        if event_ids.is_empty() {
            return Vec::new();
        }
        let mut removed_origins: HashSet<String> = HashSet::new();
        self.event_by_origin.retain(|origin_id, event_id| {
            if event_ids.contains(event_id) {
                removed_origins.insert(origin_id.clone());
                false
            } else {
                true
            }
        });

        let mut removed_magnitudes = Vec::new();
        self.origin_by_magnitude.retain(|magnitude_id, origin_id| {
            if removed_origins.contains(origin_id) {
                removed_magnitudes.push(magnitude_id.clone());
                false
            } else {
                true
            }
        });
        removed_magnitudes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs as i64)
    }

    fn origin(id: &str) -> OriginRecord {
        OriginRecord {
            id: id.to_string(),
            latitude: 46.2,
            longitude: 7.5,
            depth_km: 8.0,
            time: at(0),
            pick_ids: vec!["pk1".to_string(), "pk2".to_string()],
            arrival_count: None,
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut store = CorrelationStore::new(Duration::seconds(60));
        store.feed_origin(origin("org1"), at(0));

        assert!(store.origin("org1", at(30)).is_some());
        assert!(store.origin("org1", at(61)).is_none());

        // Still physically present until pruned.
        store.prune(at(61));
        assert!(store.origin("org1", at(30)).is_none());
    }

    #[test]
    fn arrival_count_falls_back_to_pick_list() {
        let mut record = origin("org1");
        assert_eq!(record.effective_arrival_count(), 2);
        record.arrival_count = Some(7);
        assert_eq!(record.effective_arrival_count(), 7);
    }

    #[test]
    fn resolve_event_chains_both_maps() {
        let mut index = LookupIndex::default();
        index.record_magnitude("mag1", "org1");
        assert_eq!(index.resolve_event("mag1"), None);

        index.record_event("ev1", &["org1".to_string()]);
        assert_eq!(index.resolve_event("mag1"), Some("ev1"));
        assert_eq!(index.magnitudes_for_event("ev1"), vec!["mag1".to_string()]);
    }

    #[test]
    fn remove_events_cascades_origins_then_magnitudes() {
        let mut index = LookupIndex::default();
        index.record_magnitude("mag1", "org1");
        index.record_magnitude("mag2", "org2");
        index.record_event("ev1", &["org1".to_string()]);
        index.record_event("ev2", &["org2".to_string()]);

        let removed: HashSet<String> = ["ev1".to_string()].into_iter().collect();
        let magnitudes = index.remove_events(&removed);
        assert_eq!(magnitudes, vec!["mag1".to_string()]);
        assert_eq!(index.resolve_event("mag1"), None);
        assert_eq!(index.resolve_event("mag2"), Some("ev2"));
    }
}
