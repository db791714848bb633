use anyhow::{Context, Result};
use serde_json::json;
use std::time::Duration;

use crate::config::EmailConfig;

/// Email collaborator. The SMTP hop lives behind a webhook service; this side
/// only assembles the message and posts it.
#[derive(Debug)]
pub struct Mailer {
    client: reqwest::Client,
    config: EmailConfig,
}

impl Mailer {
    pub fn new(config: EmailConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build mail webhook client")?;
        Ok(Self { client, config })
    }

    pub async fn send_report(
        &self,
        event_id: &str,
        mag_type: &str,
        magnitude: f64,
        min_diff: f64,
        body: &str,
    ) -> Result<()> {
        let subject = subject_line(&self.config, event_id, mag_type, magnitude, min_diff);
        self.post(&subject, body).await
    }

    /// One-time startup message so operators notice a restarted instance.
    pub async fn send_liveness(&self) -> Result<()> {
        self.post("eew-correlator startup message", "eew-correlator was started.")
            .await
    }

    async fn post(&self, subject: &str, body: &str) -> Result<()> {
        let payload = json!({
            "from": self.config.sender,
            "to": self.config.recipients,
            "subject": subject,
            "body": body,
        });
        self.client
            .post(self.config.webhook_url.clone())
            .json(&payload)
            .send()
            .await
            .context("post mail webhook")?
            .error_for_status()
            .context("mail webhook rejected message")?;
        Ok(())
    }
}

fn subject_line(
    config: &EmailConfig,
    event_id: &str,
    mag_type: &str,
    magnitude: f64,
    min_diff: f64,
) -> String {
    format!(
        "{} / {mag_type}{magnitude:.2} / {min_diff:.2}s / {} / {event_id}",
        config.subject, config.hostname
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn subject_carries_type_magnitude_latency_host_and_event() {
        let config = EmailConfig {
            webhook_url: Url::parse("http://127.0.0.1:9999/mail").unwrap(),
            sender: "eew@example.org".to_string(),
            recipients: vec!["duty@example.org".to_string()],
            subject: "EEW report".to_string(),
            hostname: "proc-a".to_string(),
            mag_thresh: 3.0,
        };
        assert_eq!(
            subject_line(&config, "ev1", "MVS", 4.2, 12.25),
            "EEW report / MVS4.20 / 12.25s / proc-a / ev1"
        );
    }
}
