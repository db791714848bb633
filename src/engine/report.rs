use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::types::LogicalEvent;

const HEAD_UPPER: &str = "                                                                   |#St.   |                                                              ";
const HEAD_COLUMNS: &str = "Tdiff |Type|Mag.|Lat.  |Lon.   |Depth |origin time (UTC)      |Lik.|Or.|Ma.|Str.|Len. |Author   |Creation t.            |Tdiff(current o.)";

#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub text: String,
    /// Smallest elapsed-to-reference value: origin-to-first-report latency.
    pub min_diff: f64,
    pub max_magnitude: f64,
    pub last_type: String,
    pub last_magnitude: f64,
}

/// Timestamps render with two fractional digits, matching the report column
/// widths.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    format!(
        "{}.{:02}Z",
        ts.format("%Y-%m-%dT%H:%M:%S"),
        ts.timestamp_subsec_millis() / 10
    )
}

/// Render an event's update timeline as the fixed-width report. Every line is
/// timed relative to the latest-received update (the last one in insertion
/// order), whose own origin latency is folded in. Returns None for an event
/// with no updates.
pub fn render(event: &LogicalEvent) -> Option<RenderedReport> {
    let reference = event.updates.last()?;

    let mut text = String::new();
    text.push_str(HEAD_UPPER);
    text.push('\n');
    text.push_str(HEAD_COLUMNS);
    text.push('\n');
    text.push_str(&"-".repeat(HEAD_COLUMNS.len()));
    text.push('\n');

    let mut min_diff = f64::MAX;
    let mut max_magnitude = f64::MIN;

    for update in &event.updates {
        let elapsed = (update.reference_time - reference.reference_time).num_milliseconds() as f64
            / 1000.0
            + reference.origin_diff;
        if elapsed < min_diff {
            min_diff = elapsed;
        }
        if update.magnitude > max_magnitude {
            max_magnitude = update.magnitude;
        }

        text.push_str(&format!("{elapsed:6.2}|"));
        text.push_str(&format!("{:>4}|", update.mag_type));
        text.push_str(&format!("{:4.2}|", update.magnitude));
        text.push_str(&format!("{:6.2}|", update.latitude));
        text.push_str(&format!("{:7.2}|", update.longitude));
        text.push_str(&format!("{:6.2}|", update.depth_km));
        text.push_str(&format!("{}|", fmt_ts(update.origin_time)));
        match update.likelihood {
            Some(likelihood) => text.push_str(&format!("{likelihood:4.2}|")),
            None => text.push_str("    |"),
        }
        text.push_str(&format!("{:3}|", update.arrival_count));
        let station_count = update
            .station_count
            .map(|count| count.to_string())
            .unwrap_or_default();
        text.push_str(&format!("{station_count:>3}|"));
        match update.rupture_strike {
            Some(strike) => text.push_str(&format!("{:4}|", strike as i64)),
            None => text.push_str("    |"),
        }
        match update.rupture_length {
            Some(length) => text.push_str(&format!("{length:5.2}|")),
            None => text.push_str("     |"),
        }
        let author: String = update.author.chars().take(9).collect();
        text.push_str(&format!("{author:>9}|"));
        text.push_str(&format!("{}|", fmt_ts(update.reference_time)));
        text.push_str(&format!("{:6.2}\n", update.origin_diff));
    }

    Some(RenderedReport {
        text,
        min_diff,
        max_magnitude,
        last_type: reference.mag_type.clone(),
        last_magnitude: reference.magnitude,
    })
}

/// Report file path for an event, with path separators in the id flattened so
/// ids like "smi:ch.ethz.sed/sc3a/2026abcd" stay inside the report directory.
pub fn report_path(dir: &Path, event_id: &str) -> PathBuf {
    let sanitized: String = event_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    dir.join(format!("{sanitized}_report.txt"))
}

pub fn write_report(dir: &Path, event_id: &str, text: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create report dir {}", dir.display()))?;
    let path = report_path(dir, event_id);
    fs::write(&path, text).with_context(|| format!("write report {}", path.display()))?;
    Ok(path)
}
