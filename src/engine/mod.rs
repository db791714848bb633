use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

pub mod alert;
pub mod report;
pub mod store;
pub mod types;

use alert::AlertRules;
use store::{CorrelationStore, EventRecord, LookupIndex, MagnitudeRecord, OriginRecord, PickRecord};
use types::{
    is_primary_mag_type, Action, AlertContext, Annotation, AnnotationKind, EngineStats,
    LogicalEvent, UpdateRecord,
};

use crate::geo::PolygonSet;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Magnitude types processed at all; everything else is ignored at ingest.
    pub mag_types: Vec<String>,
    /// Quiescence window before a burst of updates is reported.
    pub report_timeout: Duration,
    /// Rolling retention window, anchored at the most recent event timestamp.
    pub event_buffer: Duration,
    pub report_enabled: bool,
    pub report_dir: PathBuf,
    /// Reports whose burst exceeds this magnitude are also emailed. None
    /// means the email channel is off.
    pub email_mag_thresh: Option<f64>,
    pub alert_channels_active: bool,
    pub rules: AlertRules,
    pub polygons: PolygonSet,
}

/// One message from the inbound feed, already decoded.
#[derive(Debug, Clone)]
pub enum Inbound {
    Pick(PickRecord),
    Origin(OriginRecord),
    Magnitude(MagnitudeRecord),
    Event(EventRecord),
    Comment {
        kind: String,
        parent_id: String,
        text: String,
    },
}

/// The correlation engine. Owns all state; mutated from exactly one task.
/// Handlers return the side effects for the dispatch layer instead of
/// performing any network I/O themselves.
pub struct Engine {
    config: EngineConfig,
    store: CorrelationStore,
    index: LookupIndex,
    events: HashMap<String, LogicalEvent>,
    pending_annotations: Vec<Annotation>,
    latest_event_time: Option<DateTime<Utc>>,
    stats: EngineStats,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let store = CorrelationStore::new(config.event_buffer);
        Self {
            config,
            store,
            index: LookupIndex::default(),
            events: HashMap::new(),
            pending_annotations: Vec::new(),
            latest_event_time: None,
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.events_tracked = self.events.len();
        stats.pending_annotations = self.pending_annotations.len();
        stats
    }

    pub fn handle(&mut self, inbound: Inbound, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = Vec::new();
        match inbound {
            Inbound::Pick(pick) => self.on_pick(pick, now),
            Inbound::Origin(origin) => self.on_origin(origin, now),
            Inbound::Magnitude(magnitude) => self.on_magnitude(magnitude, now, &mut actions),
            Inbound::Event(event) => self.on_event(event, now, &mut actions),
            Inbound::Comment {
                kind,
                parent_id,
                text,
            } => self.on_comment(&kind, parent_id, &text, now, &mut actions),
        }
        actions
    }

    /// Periodic tick from the worker loop: fire debounce timers that have
    /// been quiet past the report timeout.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = Vec::new();
        let due: Vec<String> = self
            .events
            .iter()
            .filter(|(_, event)| {
                event
                    .armed_at
                    .map(|armed| now - armed >= self.config.report_timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for event_id in due {
            self.fire_report(&event_id, &mut actions);
        }
        actions
    }

    /// Picks and origins are only cached; they become relevant once a
    /// magnitude or alert references them.
    fn on_pick(&mut self, pick: PickRecord, now: DateTime<Utc>) {
        tracing::debug!(pick = %pick.id, "received pick");
        self.store.feed_pick(pick, now);
    }

    fn on_origin(&mut self, origin: OriginRecord, now: DateTime<Utc>) {
        tracing::debug!(origin = %origin.id, "received origin");
        self.store.feed_origin(origin, now);
    }

    fn on_magnitude(
        &mut self,
        magnitude: MagnitudeRecord,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        if !self.config.mag_types.iter().any(|t| *t == magnitude.mag_type) {
            tracing::debug!(
                magnitude = %magnitude.id,
                mag_type = %magnitude.mag_type,
                "ignoring magnitude of unsubscribed type"
            );
            return;
        }
        let Some(origin_id) = magnitude.origin_id.clone() else {
            tracing::warn!(magnitude = %magnitude.id, "magnitude without parent origin; dropping");
            return;
        };
        tracing::debug!(
            magnitude = %magnitude.id,
            origin = %origin_id,
            mag_type = %magnitude.mag_type,
            "received magnitude"
        );
        self.index.record_magnitude(&magnitude.id, &origin_id);
        let magnitude_id = magnitude.id.clone();
        self.store.feed_magnitude(magnitude, now);
        self.ingest_update(&magnitude_id, now, false, actions);
    }

    fn on_event(&mut self, event: EventRecord, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        tracing::debug!(event = %event.id, origins = event.origin_ids.len(), "received event");
        let event_id = event.id.clone();
        let timestamp = event.timestamp();
        let has_origins = !event.origin_ids.is_empty();
        self.index.record_event(&event_id, &event.origin_ids);
        self.store.feed_event(event, now);

        if has_origins && !self.events.contains_key(&event_id) {
            self.events
                .insert(event_id.clone(), LogicalEvent::new(event_id.clone(), timestamp));
            if self.latest_event_time.map(|t| timestamp > t).unwrap_or(true) {
                self.latest_event_time = Some(timestamp);
            }
        }

        // Magnitudes can outrun their event; re-scan the index so anything
        // already received for this event gets its timeline row now.
        for magnitude_id in self.index.magnitudes_for_event(&event_id) {
            self.ingest_update(&magnitude_id, now, true, actions);
        }

        self.collect_garbage(now);
    }

    fn on_comment(
        &mut self,
        kind: &str,
        parent_id: String,
        text: &str,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let Some(kind) = AnnotationKind::parse(kind) else {
            tracing::debug!(kind, magnitude = %parent_id, "ignoring comment of unknown kind");
            return;
        };
        let value: f64 = match text.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    kind = kind.as_str(),
                    magnitude = %parent_id,
                    text,
                    "comment value is not numeric; dropping"
                );
                return;
            }
        };
        tracing::debug!(kind = kind.as_str(), magnitude = %parent_id, value, "received comment");
        self.pending_annotations.push(Annotation {
            kind,
            magnitude_id: parent_id,
            value,
            received_at: now,
        });
        self.drain_annotations(now, actions);
    }

    /// Add a timeline row for a magnitude revision. `rescan` marks the
    /// event-arrival replay path, where an already-ingested revision is
    /// expected rather than a duplicate worth warning about.
    fn ingest_update(
        &mut self,
        magnitude_id: &str,
        now: DateTime<Utc>,
        rescan: bool,
        actions: &mut Vec<Action>,
    ) {
        let Some(origin_id) = self.index.origin_of(magnitude_id).map(str::to_string) else {
            tracing::debug!(magnitude = %magnitude_id, "no origin recorded for magnitude yet");
            return;
        };
        let Some(event_id) = self.index.event_of_origin(&origin_id).map(str::to_string) else {
            tracing::debug!(
                magnitude = %magnitude_id,
                origin = %origin_id,
                "event not received yet; update will be retried on event arrival"
            );
            if !rescan {
                self.stats.unresolved_updates += 1;
            }
            return;
        };
        let Some(origin) = self.store.origin(&origin_id, now).cloned() else {
            tracing::warn!(
                origin = %origin_id,
                "origin not found in cache; is the retention window long enough?"
            );
            return;
        };
        let Some(magnitude) = self.store.magnitude(magnitude_id, now).cloned() else {
            tracing::warn!(
                magnitude = %magnitude_id,
                "magnitude not found in cache; is the retention window long enough?"
            );
            return;
        };

        let key = magnitude.update_key();
        let Some(event) = self.events.get_mut(&event_id) else {
            tracing::warn!(event = %event_id, "event record missing for indexed id");
            return;
        };
        if event.has_update_key(key) {
            if rescan {
                tracing::trace!(magnitude = %magnitude_id, "revision already ingested");
            } else {
                tracing::warn!(
                    magnitude = %magnitude_id,
                    event = %event_id,
                    key = %key,
                    "revision key collides with an already received magnitude; ignoring it"
                );
                self.stats.duplicate_updates += 1;
            }
            return;
        }
        if event.published {
            tracing::error!(
                magnitude = %magnitude_id,
                event = %event_id,
                "report already generated for this event; the report timer expired before \
                 this magnitude arrived"
            );
            self.stats.late_updates += 1;
            return;
        }

        // Re-arm the debounce timer; any pending firing is cancelled.
        event.armed_at = Some(now);

        let origin_diff = (key - origin.time).num_milliseconds() as f64 / 1000.0;
        event.updates.push(UpdateRecord {
            key,
            magnitude_id: magnitude_id.to_string(),
            origin_id: origin_id.clone(),
            mag_type: magnitude.mag_type.clone(),
            magnitude: magnitude.value,
            author: magnitude.author.clone(),
            latitude: origin.latitude,
            longitude: origin.longitude,
            depth_km: origin.depth_km,
            arrival_count: origin.effective_arrival_count(),
            station_count: magnitude.station_count,
            origin_time: origin.time,
            reference_time: key,
            origin_diff,
            likelihood: None,
            rupture_strike: None,
            rupture_length: None,
            alerted: false,
        });
        let update_count = event.updates.len();
        self.stats.updates_accepted += 1;
        tracing::info!(
            event = %event_id,
            magnitude = %magnitude_id,
            mag = magnitude.value,
            lat = origin.latitude,
            lon = origin.longitude,
            updates = update_count,
            "update accepted"
        );

        self.drain_annotations(now, actions);

        // Non-primary types carry no likelihood comment, so they are judged
        // right away instead of waiting for annotation resolution.
        if !is_primary_mag_type(&magnitude.mag_type) && self.config.alert_channels_active {
            if let Some(idx) = self
                .events
                .get(&event_id)
                .and_then(|event| event.latest_update_for_magnitude(magnitude_id))
            {
                self.evaluate_alert(&event_id, idx, now, actions);
            }
        }
    }

    /// Single pass over the pending queue; anything whose magnitude -> origin
    /// -> event chain is still incomplete stays queued for the next arrival.
    fn drain_annotations(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let pending = std::mem::take(&mut self.pending_annotations);
        for annotation in pending {
            if !self.try_attach(&annotation, now, actions) {
                self.pending_annotations.push(annotation);
            }
        }
    }

    fn try_attach(
        &mut self,
        annotation: &Annotation,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) -> bool {
        let Some(origin_id) = self.index.origin_of(&annotation.magnitude_id) else {
            return false;
        };
        let Some(event_id) = self.index.event_of_origin(origin_id).map(str::to_string) else {
            tracing::debug!(
                magnitude = %annotation.magnitude_id,
                "event not received yet for annotated magnitude"
            );
            return false;
        };
        let Some(event) = self.events.get_mut(&event_id) else {
            return false;
        };

        let candidates = event
            .updates
            .iter()
            .filter(|update| update.magnitude_id == annotation.magnitude_id)
            .count();
        if candidates > 1 {
            tracing::warn!(
                magnitude = %annotation.magnitude_id,
                kind = annotation.kind.as_str(),
                candidates,
                "multiple updates share this magnitude id; attaching to the most recent one"
            );
        }
        let Some(idx) = event.latest_update_for_magnitude(&annotation.magnitude_id) else {
            tracing::debug!(
                magnitude = %annotation.magnitude_id,
                event = %event_id,
                kind = annotation.kind.as_str(),
                "no timeline row yet for annotated magnitude"
            );
            return false;
        };

        match annotation.kind {
            AnnotationKind::Likelihood => {
                event.updates[idx].likelihood = Some(annotation.value);
                if !self
                    .store
                    .set_preferred_magnitude(&event_id, &annotation.magnitude_id)
                {
                    tracing::debug!(event = %event_id, "cannot find event in cache");
                }
                if self.config.alert_channels_active {
                    self.evaluate_alert(&event_id, idx, now, actions);
                }
            }
            AnnotationKind::RuptureStrike => {
                event.updates[idx].rupture_strike = Some(annotation.value);
            }
            AnnotationKind::RuptureLength => {
                event.updates[idx].rupture_length = Some(annotation.value);
            }
        }
        true
    }

    fn evaluate_alert(
        &mut self,
        event_id: &str,
        update_idx: usize,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let Some(event) = self.events.get(event_id) else {
            return;
        };
        let update = &event.updates[update_idx];
        if update.alerted {
            return;
        }
        let magnitude_id = update.magnitude_id.clone();
        match alert::check_alert(event, update_idx, &self.config.rules, &self.config.polygons) {
            Ok(profile) => {
                let Some(event) = self.events.get_mut(event_id) else {
                    return;
                };
                event.updates[update_idx].alerted = true;
                event.last_alerted = Some(update_idx);
                event.alert_seq += 1;
                let alert_seq = event.alert_seq;
                let update = event.updates[update_idx].clone();
                self.stats.alerts_sent += 1;
                tracing::info!(
                    event = %event_id,
                    magnitude = %magnitude_id,
                    mag = update.magnitude,
                    profile = profile.unwrap_or("unconditional"),
                    alert_seq,
                    "alert dispatched"
                );
                let context = self.build_alert_context(event_id, &update, alert_seq, now);
                actions.push(Action::PublishAlert(Box::new(context)));
            }
            Err(reason) => {
                tracing::debug!(
                    event = %event_id,
                    magnitude = %magnitude_id,
                    reason,
                    "alert suppressed"
                );
            }
        }
    }

    fn build_alert_context(
        &self,
        event_id: &str,
        update: &UpdateRecord,
        alert_seq: u32,
        now: DateTime<Utc>,
    ) -> AlertContext {
        let event = self.store.event(event_id, now).cloned();
        if event.is_none() {
            tracing::debug!(event = %event_id, "cannot find event in cache");
        }
        let origin = self.store.origin(&update.origin_id, now).cloned();
        if origin.is_none() {
            tracing::debug!(origin = %update.origin_id, "cannot find origin in cache");
        }
        let magnitude = self.store.magnitude(&update.magnitude_id, now).cloned();
        let mut picks = Vec::new();
        if let Some(origin) = &origin {
            for pick_id in &origin.pick_ids {
                match self.store.pick(pick_id, now) {
                    Some(pick) => picks.push(pick.clone()),
                    None => tracing::debug!(pick = %pick_id, "cannot find pick in cache"),
                }
            }
        }
        AlertContext {
            event_id: event_id.to_string(),
            magnitude_id: update.magnitude_id.clone(),
            alert_seq,
            likelihood: update.likelihood,
            event,
            origin,
            magnitude,
            picks,
        }
    }

    fn fire_report(&mut self, event_id: &str, actions: &mut Vec<Action>) {
        let Some(event) = self.events.get_mut(event_id) else {
            return;
        };
        // Disarm before anything else so a firing can never repeat without a
        // fresh update re-arming the timer.
        event.armed_at = None;
        let Some(rendered) = report::render(event) else {
            event.published = true;
            return;
        };
        event.published = true;
        let update_count = event.updates.len();
        self.stats.reports_generated += 1;
        tracing::info!(
            event = %event_id,
            updates = update_count,
            "report generated:\n{}",
            rendered.text
        );

        if self.config.report_enabled {
            match report::write_report(&self.config.report_dir, event_id, &rendered.text) {
                Ok(path) => tracing::debug!(path = %path.display(), "report written"),
                Err(err) => {
                    tracing::error!(error = %err, event = %event_id, "failed to persist report")
                }
            }
        }

        if let Some(thresh) = self.config.email_mag_thresh {
            if rendered.max_magnitude > thresh {
                actions.push(Action::Email {
                    event_id: event_id.to_string(),
                    mag_type: rendered.last_type,
                    magnitude: rendered.last_magnitude,
                    min_diff: rendered.min_diff,
                    body: rendered.text,
                });
            }
        }
    }

    /// Evict events older than the rolling window, cascading through the
    /// index: events first, then their origins, then their magnitudes.
    fn collect_garbage(&mut self, now: DateTime<Utc>) {
        let Some(latest) = self.latest_event_time else {
            return;
        };
        let cutoff = latest - self.config.event_buffer;
        let mut removed: HashSet<String> = HashSet::new();
        self.events.retain(|event_id, event| {
            if event.timestamp < cutoff {
                tracing::debug!(event = %event_id, "expired event");
                removed.insert(event_id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.stats.events_evicted += removed.len() as u64;
            let removed_magnitudes = self.index.remove_events(&removed);
            if !removed_magnitudes.is_empty() {
                let gone: HashSet<&str> =
                    removed_magnitudes.iter().map(String::as_str).collect();
                self.pending_annotations
                    .retain(|annotation| !gone.contains(annotation.magnitude_id.as_str()));
            }
        }
        // Annotations whose magnitude never arrived cannot be tied to an
        // event; age them out on the same window, anchored at arrival time.
        let stale_cutoff = now - self.config.event_buffer;
        self.pending_annotations
            .retain(|annotation| annotation.received_at >= stale_cutoff);
        self.store.prune(now);
    }
}
