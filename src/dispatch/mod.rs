use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod bus;
pub mod mailer;

use crate::config::Config;
use crate::engine::types::Action;
use bus::BusPublisher;
use mailer::Mailer;

/// Fan-out for engine side effects. Runs on its own task so a slow or
/// unreachable channel can never stall ingestion; every failure is logged and
/// forgotten.
#[derive(Debug)]
pub struct DispatchService {
    config: Config,
}

impl DispatchService {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn start(self, rx: mpsc::Receiver<Action>, cancel: CancellationToken) -> Result<()> {
        let (bus, bus_task) = if self.config.playback {
            (None, None)
        } else {
            let (bus, task) = BusPublisher::new(&self.config)?;
            (Some(bus), Some(task))
        };
        let mailer = match (&self.config.email, self.config.playback) {
            (Some(email), false) => Some(Mailer::new(email.clone())?),
            _ => None,
        };

        let heartbeat_interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut rx = rx;
            if let Some(mailer) = &mailer {
                if let Err(err) = mailer.send_liveness().await {
                    tracing::warn!(error = %err, "startup email could not be sent");
                }
            }

            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = rx.recv() => {
                        let Some(action) = maybe else { break };
                        handle_action(action, bus.as_ref(), mailer.as_ref()).await;
                    }
                    _ = heartbeat.tick() => {
                        if let Some(bus) = &bus {
                            if let Err(err) = bus.publish_heartbeat().await {
                                tracing::warn!(error = %err, "heartbeat publish failed");
                            }
                        }
                    }
                }
            }
            if let Some(task) = bus_task {
                task.abort();
            }
        });
        Ok(())
    }
}

async fn handle_action(action: Action, bus: Option<&BusPublisher>, mailer: Option<&Mailer>) {
    match action {
        Action::PublishAlert(context) => {
            let Some(bus) = bus else {
                return;
            };
            if let Err(err) = bus.publish_alert(&context).await {
                tracing::error!(
                    error = %err,
                    event = %context.event_id,
                    magnitude = %context.magnitude_id,
                    "alert publish failed"
                );
                return;
            }
            if let Err(err) = bus.publish_alert_count(&context).await {
                tracing::warn!(error = %err, event = %context.event_id, "alert counter publish failed");
            }
        }
        Action::Email {
            event_id,
            mag_type,
            magnitude,
            min_diff,
            body,
        } => {
            let Some(mailer) = mailer else {
                return;
            };
            if let Err(err) = mailer
                .send_report(&event_id, &mag_type, magnitude, min_diff, &body)
                .await
            {
                tracing::error!(error = %err, event = %event_id, "report email could not be sent");
            }
        }
    }
}
