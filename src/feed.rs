use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::store::{EventRecord, MagnitudeRecord, OriginRecord, PickRecord};
use crate::engine::Inbound;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FeedAction {
    #[default]
    Added,
    Updated,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    action: FeedAction,
    #[serde(default)]
    parent_id: Option<String>,
    object: T,
}

enum FeedExit {
    Cancelled,
    Lost { connected: bool, error: anyhow::Error },
}

/// Consume the inbound feed until cancelled. One reconnect attempt per lost
/// connection; a failure before the retry ever connects is fatal.
pub async fn run(
    config: Config,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut retried = false;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match run_once(&config, &tx, &cancel).await {
            FeedExit::Cancelled => return Ok(()),
            FeedExit::Lost { connected, error } => {
                if connected {
                    retried = false;
                }
                if retried {
                    return Err(error).context("feed reconnect failed");
                }
                retried = true;
                tracing::warn!(error = %error, "feed connection lost; retrying once");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn run_once(config: &Config, tx: &mpsc::Sender<Inbound>, cancel: &CancellationToken) -> FeedExit {
    let client_id = format!("{}-feed", config.mqtt_client_id);
    let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(10));
    if let (Some(username), Some(password)) = (
        config.mqtt_username.as_deref(),
        config.mqtt_password.as_deref(),
    ) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let filter = format!("{}/feed/#", config.topic_prefix);
    if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
        return FeedExit::Lost {
            connected: false,
            error: err.into(),
        };
    }

    let mut connected = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return FeedExit::Cancelled,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected = true;
                    tracing::info!(filter = %filter, "feed connected");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let Some(inbound) = decode(&publish.topic, &publish.payload) else {
                        continue;
                    };
                    // The engine applies backpressure through this channel.
                    if tx.send(inbound).await.is_err() {
                        return FeedExit::Cancelled;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    return FeedExit::Lost {
                        connected,
                        error: anyhow!("feed disconnected by broker"),
                    };
                }
                Ok(_) => {}
                Err(err) => {
                    return FeedExit::Lost {
                        connected,
                        error: err.into(),
                    };
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentObject {
    id: String,
    text: String,
}

fn decode(topic: &str, payload: &[u8]) -> Option<Inbound> {
    let kind = topic.rsplit('/').next()?;
    match kind {
        "pick" => decode_envelope::<PickRecord>(topic, payload)
            .map(|(object, _)| Inbound::Pick(object)),
        "origin" => decode_envelope::<OriginRecord>(topic, payload)
            .map(|(object, _)| Inbound::Origin(object)),
        "magnitude" => {
            let (mut object, parent_id) = decode_envelope::<MagnitudeRecord>(topic, payload)?;
            if object.origin_id.is_none() {
                object.origin_id = parent_id;
            }
            if object.origin_id.is_none() {
                tracing::warn!(magnitude = %object.id, "magnitude message without parent origin id");
                return None;
            }
            Some(Inbound::Magnitude(object))
        }
        "event" => decode_envelope::<EventRecord>(topic, payload)
            .map(|(object, _)| Inbound::Event(object)),
        "comment" => {
            let (object, parent_id) = decode_envelope::<CommentObject>(topic, payload)?;
            let Some(parent_id) = parent_id else {
                tracing::warn!(kind = %object.id, "comment message without parent magnitude id");
                return None;
            };
            Some(Inbound::Comment {
                kind: object.id,
                parent_id,
                text: object.text,
            })
        }
        other => {
            tracing::debug!(topic, kind = other, "ignoring message on unknown feed topic");
            None
        }
    }
}

fn decode_envelope<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Option<(T, Option<String>)> {
    match serde_json::from_slice::<Envelope<T>>(payload) {
        Ok(envelope) => {
            tracing::trace!(topic, action = ?envelope.action, "feed message decoded");
            Some((envelope.object, envelope.parent_id))
        }
        Err(err) => {
            tracing::debug!(topic, error = %err, "invalid feed payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnitude_takes_origin_from_envelope_parent() {
        let payload = br#"{
            "action": "added",
            "parent_id": "org1",
            "object": {
                "id": "mag1",
                "type": "MVS",
                "value": 4.2,
                "author": "scvsmag@proc",
                "creation_time": "2026-03-01T10:00:01Z"
            }
        }"#;
        let Some(Inbound::Magnitude(magnitude)) = decode("eew/feed/magnitude", payload) else {
            panic!("expected a magnitude");
        };
        assert_eq!(magnitude.origin_id.as_deref(), Some("org1"));
        assert_eq!(magnitude.mag_type, "MVS");
    }

    #[test]
    fn magnitude_without_any_origin_is_dropped() {
        let payload = br#"{
            "object": {
                "id": "mag1",
                "type": "MVS",
                "value": 4.2,
                "creation_time": "2026-03-01T10:00:01Z"
            }
        }"#;
        assert!(decode("eew/feed/magnitude", payload).is_none());
    }

    #[test]
    fn comment_requires_a_parent() {
        let payload = br#"{
            "parent_id": "mag1",
            "object": {"id": "likelihood", "text": "0.9"}
        }"#;
        let Some(Inbound::Comment { kind, parent_id, text }) = decode("eew/feed/comment", payload)
        else {
            panic!("expected a comment");
        };
        assert_eq!(kind, "likelihood");
        assert_eq!(parent_id, "mag1");
        assert_eq!(text, "0.9");

        let orphan = br#"{"object": {"id": "likelihood", "text": "0.9"}}"#;
        assert!(decode("eew/feed/comment", orphan).is_none());
    }

    #[test]
    fn event_message_decodes_origin_references() {
        let payload = br#"{
            "action": "updated",
            "object": {
                "id": "ev1",
                "origin_ids": ["org1", "org2"],
                "creation_time": "2026-03-01T10:00:00Z"
            }
        }"#;
        let Some(Inbound::Event(event)) = decode("eew/feed/event", payload) else {
            panic!("expected an event");
        };
        assert_eq!(event.origin_ids.len(), 2);
    }

    #[test]
    fn unknown_kind_and_malformed_json_are_skipped() {
        assert!(decode("eew/feed/amplitude", b"{}").is_none());
        assert!(decode("eew/feed/origin", b"not json").is_none());
    }
}
