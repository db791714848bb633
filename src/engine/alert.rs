use serde::Deserialize;
use std::collections::HashMap;

use crate::engine::types::{is_primary_mag_type, LogicalEvent, UpdateRecord};
use crate::geo::PolygonSet;

/// Minimum change relative to the last-alerted update for a revision to be
/// worth a second alert.
const MIN_DELTA_LAT_DEG: f64 = 0.5;
const MIN_DELTA_LON_DEG: f64 = 0.5;
const MIN_DELTA_DEPTH_KM: f64 = 20.0;
const MIN_DELTA_MAG: f64 = 0.2;

/// Alert gating configuration, loaded from a JSON side file. Immutable after
/// startup validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertRules {
    #[serde(default)]
    pub association: Option<AssociationRules>,
    #[serde(default)]
    pub profiles: Vec<AlertProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssociationRules {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub priorities: Vec<Criterion>,
    #[serde(default)]
    pub mag_thresholds: HashMap<String, f64>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub station_minimums: HashMap<String, u32>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Criterion {
    #[serde(rename = "magThresh")]
    MagThresh,
    #[serde(rename = "likelihood")]
    Likelihood,
    #[serde(rename = "authors")]
    Authors,
    #[serde(rename = "stationMagNumber")]
    StationMagNumber,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertProfile {
    pub name: String,
    pub mag_thresh: f64,
    #[serde(default)]
    pub likelihood_thresh: f64,
    #[serde(default)]
    pub min_depth_km: f64,
    #[serde(default = "default_max_depth")]
    pub max_depth_km: f64,
    #[serde(default)]
    pub max_time_seconds: Option<f64>,
    #[serde(default)]
    pub polygon: Option<String>,
}

fn default_max_depth() -> f64 {
    700.0
}

pub fn validate_rules(rules: &AlertRules, polygons: &PolygonSet) -> Result<(), String> {
    if let Some(association) = &rules.association {
        if association.priorities.is_empty() {
            return Err("association.priorities must not be empty".to_string());
        }
        if association.priorities.contains(&Criterion::Authors) && association.authors.is_empty() {
            return Err("authors criterion configured without an author list".to_string());
        }
        for (mag_type, thresh) in &association.mag_thresholds {
            if !thresh.is_finite() {
                return Err(format!("mag_thresholds.{mag_type} must be finite"));
            }
        }
    }
    for profile in &rules.profiles {
        if profile.name.trim().is_empty() {
            return Err("profile name must not be empty".to_string());
        }
        if !profile.mag_thresh.is_finite() {
            return Err(format!("profile {}: mag_thresh must be finite", profile.name));
        }
        if !(0.0..=1.0).contains(&profile.likelihood_thresh) {
            return Err(format!(
                "profile {}: likelihood_thresh must be within 0.0..=1.0",
                profile.name
            ));
        }
        if profile.min_depth_km >= profile.max_depth_km {
            return Err(format!(
                "profile {}: min_depth_km must be < max_depth_km",
                profile.name
            ));
        }
        if let Some(max_time) = profile.max_time_seconds {
            if !max_time.is_finite() || max_time < 0.0 {
                return Err(format!(
                    "profile {}: max_time_seconds must be >= 0",
                    profile.name
                ));
            }
        }
        if let Some(polygon) = &profile.polygon {
            if polygons.get(polygon).is_none() {
                return Err(format!(
                    "profile {}: polygon '{polygon}' not found in polygon file",
                    profile.name
                ));
            }
        }
    }
    Ok(())
}

/// Decide whether the candidate update earns an alert. `Ok` names the profile
/// that matched (`None` when no profiles are configured); `Err` carries the
/// suppression reason for the log line. No state is mutated here.
pub fn check_alert<'r>(
    event: &LogicalEvent,
    candidate: usize,
    rules: &'r AlertRules,
    polygons: &PolygonSet,
) -> Result<Option<&'r str>, String> {
    let update = &event.updates[candidate];
    let prior = event.last_alerted.map(|idx| &event.updates[idx]);

    if let Some(association) = rules.association.as_ref().filter(|a| a.enabled) {
        for criterion in &association.priorities {
            check_criterion(*criterion, update, prior, association)?;
        }
        if let Some(prior) = prior {
            check_significance(update, prior)?;
        }
    }

    if rules.profiles.is_empty() {
        return Ok(None);
    }
    for profile in &rules.profiles {
        if profile_matches(profile, update, polygons) {
            // First match wins; later profiles are not consulted.
            return Ok(Some(&profile.name));
        }
    }
    Err("no profile matched".to_string())
}

fn check_criterion(
    criterion: Criterion,
    update: &UpdateRecord,
    prior: Option<&UpdateRecord>,
    association: &AssociationRules,
) -> Result<(), String> {
    match criterion {
        Criterion::MagThresh => {
            let thresh = association
                .mag_thresholds
                .get(&update.mag_type)
                .copied()
                .unwrap_or(0.0);
            if update.magnitude < thresh {
                return Err(format!(
                    "magnitude {:.2} below {} threshold {:.2}",
                    update.magnitude, update.mag_type, thresh
                ));
            }
        }
        Criterion::Likelihood => {
            if !is_primary_mag_type(&update.mag_type) {
                return Ok(());
            }
            match prior {
                None => {
                    if update.likelihood.is_none() {
                        return Err("first update carries no likelihood".to_string());
                    }
                }
                Some(prior) => {
                    // A prior alert without likelihood imposes no floor.
                    if let Some(floor) = prior.likelihood {
                        match update.likelihood {
                            Some(likelihood) if likelihood >= floor => {}
                            Some(likelihood) => {
                                return Err(format!(
                                    "likelihood {likelihood:.2} below last alerted {floor:.2}"
                                ));
                            }
                            None => {
                                return Err("candidate carries no likelihood".to_string());
                            }
                        }
                    }
                }
            }
        }
        Criterion::Authors => {
            let rank = |author: &str| {
                association
                    .authors
                    .iter()
                    .position(|listed| listed == author)
                    .map(|idx| association.authors.len() - idx)
            };
            let Some(candidate_rank) = rank(&update.author) else {
                return Err(format!("author {} not in allow-list", update.author));
            };
            if let Some(prior) = prior {
                let prior_rank = rank(&prior.author).unwrap_or(0);
                if candidate_rank < prior_rank {
                    return Err(format!(
                        "author {} ranks below last alerted {}",
                        update.author, prior.author
                    ));
                }
            }
        }
        Criterion::StationMagNumber => {
            let minimum = association
                .station_minimums
                .get(&update.mag_type)
                .copied()
                .unwrap_or(0);
            let count = update.station_count.unwrap_or(0);
            if count < minimum {
                return Err(format!(
                    "station count {count} below {} minimum {minimum}",
                    update.mag_type
                ));
            }
            if let Some(prior) = prior {
                let prior_count = prior.station_count.unwrap_or(0);
                if count <= prior_count {
                    return Err(format!(
                        "station count {count} not above last alerted {prior_count}"
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_significance(update: &UpdateRecord, prior: &UpdateRecord) -> Result<(), String> {
    let significant = (update.latitude - prior.latitude).abs() >= MIN_DELTA_LAT_DEG
        || (update.longitude - prior.longitude).abs() >= MIN_DELTA_LON_DEG
        || (update.depth_km - prior.depth_km).abs() >= MIN_DELTA_DEPTH_KM
        || (update.magnitude - prior.magnitude).abs() >= MIN_DELTA_MAG;
    if significant {
        Ok(())
    } else {
        Err("revision not significant vs last alerted update".to_string())
    }
}

fn profile_matches(profile: &AlertProfile, update: &UpdateRecord, polygons: &PolygonSet) -> bool {
    if update.magnitude < profile.mag_thresh {
        return false;
    }
    if update.depth_km < profile.min_depth_km || update.depth_km > profile.max_depth_km {
        return false;
    }
    if let Some(likelihood) = update.likelihood {
        if likelihood < profile.likelihood_thresh {
            return false;
        }
    }
    if let Some(max_time) = profile.max_time_seconds {
        if update.origin_diff > max_time {
            return false;
        }
    }
    if let Some(polygon) = &profile.polygon {
        if !polygons.contains(polygon, update.latitude, update.longitude) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Polygon;
    use chrono::{Duration, TimeZone, Utc};

    fn base_update(magnitude: f64) -> UpdateRecord {
        let origin_time = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        UpdateRecord {
            key: origin_time + Duration::seconds(12),
            magnitude_id: "mag1".to_string(),
            origin_id: "org1".to_string(),
            mag_type: "MVS".to_string(),
            magnitude,
            author: "scvsmag@proc".to_string(),
            latitude: 46.2,
            longitude: 7.5,
            depth_km: 8.0,
            arrival_count: 12,
            station_count: Some(6),
            origin_time,
            reference_time: origin_time + Duration::seconds(12),
            origin_diff: 12.0,
            likelihood: Some(0.8),
            rupture_strike: None,
            rupture_length: None,
            alerted: false,
        }
    }

    fn event_with(updates: Vec<UpdateRecord>, last_alerted: Option<usize>) -> LogicalEvent {
        let mut event = LogicalEvent::new(
            "ev1".to_string(),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        );
        event.updates = updates;
        event.last_alerted = last_alerted;
        event
    }

    fn association(priorities: Vec<Criterion>) -> AssociationRules {
        AssociationRules {
            enabled: true,
            priorities,
            mag_thresholds: [("MVS".to_string(), 3.5)].into_iter().collect(),
            authors: vec!["scvsmag@proc".to_string(), "scfinder@proc".to_string()],
            station_minimums: [("MVS".to_string(), 4)].into_iter().collect(),
        }
    }

    #[test]
    fn no_rules_dispatches_unconditionally() {
        let event = event_with(vec![base_update(4.2)], None);
        let rules = AlertRules::default();
        let polygons = PolygonSet::default();
        let verdict = check_alert(&event, 0, &rules, &polygons);
        assert_eq!(verdict, Ok(None));
    }

    #[test]
    fn profile_below_threshold_suppresses() {
        let rules = AlertRules {
            association: None,
            profiles: vec![AlertProfile {
                name: "national".to_string(),
                mag_thresh: 5.0,
                likelihood_thresh: 0.0,
                min_depth_km: 0.0,
                max_depth_km: 700.0,
                max_time_seconds: None,
                polygon: None,
            }],
        };
        let event = event_with(vec![base_update(4.2)], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_err());
    }

    #[test]
    fn first_matching_profile_wins() {
        let make = |name: &str, thresh: f64| AlertProfile {
            name: name.to_string(),
            mag_thresh: thresh,
            likelihood_thresh: 0.0,
            min_depth_km: 0.0,
            max_depth_km: 700.0,
            max_time_seconds: None,
            polygon: None,
        };
        let rules = AlertRules {
            association: None,
            profiles: vec![make("a", 3.0), make("b", 3.0)],
        };
        let event = event_with(vec![base_update(4.2)], None);
        // Both match; the dispatch is attributed to the first.
        assert_eq!(
            check_alert(&event, 0, &rules, &PolygonSet::default()),
            Ok(Some("a"))
        );
    }

    #[test]
    fn polygon_gates_profile() {
        let mut polygons = PolygonSet::default();
        polygons.insert(Polygon {
            name: "box".to_string(),
            points: vec![(45.0, 5.0), (45.0, 10.0), (48.0, 10.0), (48.0, 5.0)],
        });
        let mut profile = AlertProfile {
            name: "fenced".to_string(),
            mag_thresh: 3.0,
            likelihood_thresh: 0.0,
            min_depth_km: 0.0,
            max_depth_km: 700.0,
            max_time_seconds: None,
            polygon: Some("box".to_string()),
        };
        let inside = base_update(4.2);
        assert!(profile_matches(&profile, &inside, &polygons));

        let mut outside = base_update(4.2);
        outside.latitude = 50.0;
        assert!(!profile_matches(&profile, &outside, &polygons));

        profile.polygon = Some("missing".to_string());
        assert!(!profile_matches(&profile, &inside, &polygons));
    }

    #[test]
    fn mag_thresh_criterion_aborts_below_table() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::MagThresh])),
            profiles: Vec::new(),
        };
        let event = event_with(vec![base_update(3.0)], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_err());

        let event = event_with(vec![base_update(3.6)], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn first_update_requires_likelihood() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::Likelihood])),
            profiles: Vec::new(),
        };
        let mut unscored = base_update(4.2);
        unscored.likelihood = None;
        let event = event_with(vec![unscored], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_err());

        let event = event_with(vec![base_update(4.2)], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn likelihood_must_not_regress() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::Likelihood])),
            profiles: Vec::new(),
        };
        let mut first = base_update(4.2);
        first.likelihood = Some(0.8);
        first.alerted = true;
        let mut second = base_update(4.6);
        second.likelihood = Some(0.6);
        // Large magnitude jump so only the likelihood criterion is under test.
        second.magnitude = 4.6;
        let event = event_with(vec![first, second], Some(0));
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_err());
    }

    #[test]
    fn prior_alert_without_likelihood_passes() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::Likelihood])),
            profiles: Vec::new(),
        };
        let mut first = base_update(4.2);
        first.likelihood = None;
        first.alerted = true;
        let mut second = base_update(4.6);
        second.likelihood = None;
        second.magnitude = 4.6;
        let event = event_with(vec![first, second], Some(0));
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn non_primary_type_bypasses_likelihood() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::Likelihood])),
            profiles: Vec::new(),
        };
        let mut update = base_update(4.2);
        update.mag_type = "Mlv".to_string();
        update.likelihood = None;
        let event = event_with(vec![update], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn unlisted_author_aborts() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::Authors])),
            profiles: Vec::new(),
        };
        let mut update = base_update(4.2);
        update.author = "stranger@proc".to_string();
        let event = event_with(vec![update], None);
        assert!(check_alert(&event, 0, &rules, &PolygonSet::default()).is_err());
    }

    #[test]
    fn author_rank_must_not_drop() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::Authors])),
            profiles: Vec::new(),
        };
        let mut first = base_update(4.2);
        first.author = "scvsmag@proc".to_string();
        first.alerted = true;
        let mut second = base_update(4.6);
        second.author = "scfinder@proc".to_string();
        let event = event_with(vec![first, second], Some(0));
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_err());
    }

    #[test]
    fn station_count_must_strictly_grow_after_alert() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::StationMagNumber])),
            profiles: Vec::new(),
        };
        let mut first = base_update(4.2);
        first.station_count = Some(6);
        first.alerted = true;
        let mut second = base_update(4.6);
        second.station_count = Some(6);
        let event = event_with(vec![first, second], Some(0));
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_err());

        let mut third = base_update(4.6);
        third.station_count = Some(7);
        let event = event_with(
            vec![event.updates[0].clone(), third],
            Some(0),
        );
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn insignificant_revision_is_suppressed() {
        let rules = AlertRules {
            association: Some(association(vec![Criterion::MagThresh])),
            profiles: Vec::new(),
        };
        let mut first = base_update(4.2);
        first.alerted = true;
        let mut second = base_update(4.2);
        second.magnitude += 0.1;
        second.latitude += 0.2;
        second.longitude += 0.3;
        second.depth_km += 5.0;
        let event = event_with(vec![first, second], Some(0));
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_err());

        let mut significant = event.updates[1].clone();
        significant.magnitude = event.updates[0].magnitude + 0.2;
        let event = event_with(vec![event.updates[0].clone(), significant], Some(0));
        assert!(check_alert(&event, 1, &rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_polygon() {
        let rules = AlertRules {
            association: None,
            profiles: vec![AlertProfile {
                name: "fenced".to_string(),
                mag_thresh: 4.0,
                likelihood_thresh: 0.5,
                min_depth_km: 0.0,
                max_depth_km: 700.0,
                max_time_seconds: None,
                polygon: Some("nowhere".to_string()),
            }],
        };
        assert!(validate_rules(&rules, &PolygonSet::default()).is_err());
    }

    #[test]
    fn validate_rejects_authors_criterion_without_list() {
        let mut association = association(vec![Criterion::Authors]);
        association.authors.clear();
        let rules = AlertRules {
            association: Some(association),
            profiles: Vec::new(),
        };
        assert!(validate_rules(&rules, &PolygonSet::default()).is_err());
    }
}
