use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Config, PayloadFormat};
use crate::engine::types::AlertContext;

#[derive(Debug)]
pub struct BusPublisher {
    client: AsyncClient,
    instance_id: Uuid,
    alert_topic: String,
    counter_topic: String,
    heartbeat_topic: String,
    format: PayloadFormat,
}

impl BusPublisher {
    pub fn new(config: &Config) -> Result<(Self, JoinHandle<()>)> {
        let client_id = format!("{}-out", config.mqtt_client_id);
        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(10));
        if let (Some(username), Some(password)) = (
            config.mqtt_username.as_deref(),
            config.mqtt_password.as_deref(),
        ) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "alert bus event loop error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        Ok((
            Self {
                client,
                instance_id: config.instance_id,
                alert_topic: config.alert_topic.clone(),
                counter_topic: format!("{}/count", config.alert_topic),
                heartbeat_topic: config.heartbeat_topic.clone(),
                format: config.payload_format,
            },
            handle,
        ))
    }

    pub async fn publish_alert(&self, context: &AlertContext) -> Result<()> {
        let payload = encode_alert(self.format, context)?;
        self.client
            .publish(self.alert_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Per-event alert counter for downstream bookkeeping. Best effort.
    pub async fn publish_alert_count(&self, context: &AlertContext) -> Result<()> {
        let payload = serde_json::to_vec(&json!({
            "event_id": context.event_id,
            "magnitude_id": context.magnitude_id,
            "alert_seq": context.alert_seq,
        }))?;
        self.client
            .publish(self.counter_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    pub async fn publish_heartbeat(&self) -> Result<()> {
        let payload = serde_json::to_vec(&json!({
            "alive": Utc::now().to_rfc3339(),
            "instance": self.instance_id,
        }))?;
        self.client
            .publish(self.heartbeat_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

pub fn encode_alert(format: PayloadFormat, context: &AlertContext) -> Result<Vec<u8>> {
    match format {
        PayloadFormat::Json => Ok(serde_json::to_vec(context)?),
        PayloadFormat::Text => {
            let mut out = String::new();
            writeln!(out, "event: {}", context.event_id)?;
            writeln!(out, "alert: {}", context.alert_seq)?;
            if let Some(magnitude) = &context.magnitude {
                writeln!(
                    out,
                    "magnitude: {} {:.2} by {}",
                    magnitude.mag_type, magnitude.value, magnitude.author
                )?;
            }
            if let Some(likelihood) = context.likelihood {
                writeln!(out, "likelihood: {likelihood:.2}")?;
            }
            if let Some(origin) = &context.origin {
                writeln!(
                    out,
                    "origin: {:.4} {:.4} {:.1}km at {}",
                    origin.latitude,
                    origin.longitude,
                    origin.depth_km,
                    origin.time.to_rfc3339()
                )?;
            }
            writeln!(out, "picks: {}", context.picks.len())?;
            Ok(out.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::{MagnitudeRecord, OriginRecord};
    use chrono::TimeZone;

    fn context() -> AlertContext {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        AlertContext {
            event_id: "ev1".to_string(),
            magnitude_id: "mag1".to_string(),
            alert_seq: 2,
            likelihood: Some(0.85),
            event: None,
            origin: Some(OriginRecord {
                id: "org1".to_string(),
                latitude: 46.2,
                longitude: 7.5,
                depth_km: 8.0,
                time: t0,
                pick_ids: Vec::new(),
                arrival_count: Some(12),
            }),
            magnitude: Some(MagnitudeRecord {
                id: "mag1".to_string(),
                mag_type: "MVS".to_string(),
                value: 4.2,
                author: "scvsmag@proc".to_string(),
                station_count: Some(6),
                creation_time: t0,
                modification_time: None,
                origin_id: Some("org1".to_string()),
            }),
            picks: Vec::new(),
        }
    }

    #[test]
    fn json_payload_is_self_describing() {
        let payload = encode_alert(PayloadFormat::Json, &context()).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded["event_id"], "ev1");
        assert_eq!(decoded["alert_seq"], 2);
        assert_eq!(decoded["magnitude"]["type"], "MVS");
    }

    #[test]
    fn text_payload_lists_core_fields() {
        let payload = encode_alert(PayloadFormat::Text, &context()).unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.contains("event: ev1"));
        assert!(text.contains("magnitude: MVS 4.20 by scvsmag@proc"));
        assert!(text.contains("likelihood: 0.85"));
        assert!(text.contains("picks: 0"));
    }
}
