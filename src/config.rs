use anyhow::{anyhow, Context, Result};
use chrono::Duration as ChronoDuration;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::cli::Args;
use crate::engine::alert::{validate_rules, AlertRules};
use crate::engine::EngineConfig;
use crate::geo::PolygonSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Text,
}

impl PayloadFormat {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(anyhow!("invalid EEW_PAYLOAD_FORMAT '{other}' (json|text)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub webhook_url: Url,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub hostname: String,
    pub mag_thresh: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Distinguishes restarted instances in heartbeats and client ids.
    pub instance_id: Uuid,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    /// Inbound feed topics live under `<prefix>/feed/<kind>`.
    pub topic_prefix: String,
    pub alert_topic: String,
    pub heartbeat_topic: String,
    pub heartbeat_interval: Duration,
    pub payload_format: PayloadFormat,

    pub http_bind: String,

    pub mag_types: Vec<String>,
    pub report_timeout: Duration,
    pub event_buffer: Duration,
    pub report_enabled: bool,
    pub report_dir: PathBuf,

    pub email: Option<EmailConfig>,
    pub playback: bool,

    pub rules: AlertRules,
    pub polygons: PolygonSet,
}

impl Config {
    pub fn from_env(args: &Args) -> Result<Self> {
        let mqtt_url = env_string("EEW_MQTT_URL", Some("mqtt://127.0.0.1:1883".to_string()))?;
        let url = Url::parse(&mqtt_url).context("invalid EEW_MQTT_URL")?;
        let mqtt_host = url
            .host_str()
            .ok_or_else(|| anyhow!("EEW_MQTT_URL missing host"))?
            .to_string();
        let mqtt_port = url.port().unwrap_or(1883);
        let mqtt_username = env_optional("EEW_MQTT_USERNAME");
        let mqtt_password = env_optional("EEW_MQTT_PASSWORD");
        let mqtt_client_id = env_string("EEW_MQTT_CLIENT_ID", Some("eew-correlator".to_string()))?;

        let topic_prefix = env_string("EEW_MQTT_TOPIC_PREFIX", Some("eew".to_string()))?;
        let alert_topic =
            env_string("EEW_ALERT_TOPIC", Some(format!("{topic_prefix}/alerts")))?;
        let heartbeat_topic =
            env_string("EEW_HEARTBEAT_TOPIC", Some(format!("{topic_prefix}/heartbeat")))?;
        let heartbeat_interval =
            Duration::from_secs(env_u64("EEW_HEARTBEAT_SECONDS", Some(5))?.max(1));
        let payload_format =
            PayloadFormat::parse(&env_string("EEW_PAYLOAD_FORMAT", Some("json".to_string()))?)?;

        let http_bind = env_string("EEW_HTTP_BIND", Some("127.0.0.1:9321".to_string()))?;

        let mag_types = parse_list(&env_string("EEW_MAG_TYPES", Some("MVS,Mfd".to_string()))?);
        if mag_types.is_empty() {
            anyhow::bail!("EEW_MAG_TYPES must list at least one magnitude type");
        }
        let report_timeout =
            Duration::from_secs(env_u64("EEW_REPORT_TIMEOUT_SECONDS", Some(5))?.max(1));
        let event_buffer =
            Duration::from_secs(env_u64("EEW_EVENT_BUFFER_SECONDS", Some(3600))?.max(1));
        let report_enabled = env_bool("EEW_REPORT_ENABLED", Some(true))?;
        let report_dir = match &args.savedir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(env_string("EEW_REPORT_DIR", Some("EEW_reports".to_string()))?),
        };

        let email = if env_bool("EEW_EMAIL_ENABLED", Some(false))? {
            let webhook_url = Url::parse(&env_string("EEW_EMAIL_WEBHOOK_URL", None)?)
                .context("invalid EEW_EMAIL_WEBHOOK_URL")?;
            let recipients = parse_list(&env_string("EEW_EMAIL_RECIPIENTS", None)?);
            if recipients.is_empty() {
                anyhow::bail!("EEW_EMAIL_RECIPIENTS must list at least one address");
            }
            Some(EmailConfig {
                webhook_url,
                sender: env_string("EEW_EMAIL_SENDER", None)?,
                recipients,
                subject: env_string("EEW_EMAIL_SUBJECT", Some("EEW report".to_string()))?,
                hostname: env_string("EEW_EMAIL_HOST", Some("localhost".to_string()))?,
                mag_thresh: env_f64("EEW_EMAIL_MAG_THRESH", Some(0.0))?,
            })
        } else {
            None
        };

        let polygons = match env_optional("EEW_POLYGONS_PATH") {
            Some(path) => PolygonSet::load(Path::new(&path))?,
            None => PolygonSet::default(),
        };
        let rules = match env_optional("EEW_ALERT_RULES_PATH") {
            Some(path) => load_alert_rules(Path::new(&path))?,
            None => AlertRules::default(),
        };
        validate_rules(&rules, &polygons).map_err(|err| anyhow!("invalid alert rules: {err}"))?;

        Ok(Self {
            instance_id: Uuid::new_v4(),
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            topic_prefix,
            alert_topic,
            heartbeat_topic,
            heartbeat_interval,
            payload_format,
            http_bind,
            mag_types,
            report_timeout,
            event_buffer,
            report_enabled,
            report_dir,
            email,
            playback: args.playback,
            rules,
            polygons,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            mag_types: self.mag_types.clone(),
            report_timeout: ChronoDuration::from_std(self.report_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(5)),
            event_buffer: ChronoDuration::from_std(self.event_buffer)
                .unwrap_or_else(|_| ChronoDuration::seconds(3600)),
            report_enabled: self.report_enabled,
            report_dir: self.report_dir.clone(),
            email_mag_thresh: if self.playback {
                None
            } else {
                self.email.as_ref().map(|email| email.mag_thresh)
            },
            alert_channels_active: !self.playback,
            rules: self.rules.clone(),
            polygons: self.polygons.clone(),
        }
    }
}

pub fn load_alert_rules(path: &Path) -> Result<AlertRules> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read alert rules {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: Option<bool>) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow!("invalid {key}: '{other}'")),
        },
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn payload_format_parses_known_values() {
        assert_eq!(PayloadFormat::parse("json").unwrap(), PayloadFormat::Json);
        assert_eq!(PayloadFormat::parse(" Text ").unwrap(), PayloadFormat::Text);
        assert!(PayloadFormat::parse("xml").is_err());
    }

    #[test]
    fn parse_list_trims_and_drops_empties() {
        assert_eq!(
            parse_list("MVS, Mfd ,,Mlv"),
            vec!["MVS".to_string(), "Mfd".to_string(), "Mlv".to_string()]
        );
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn alert_rules_file_round_trips() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "association": {{
                    "priorities": ["magThresh", "likelihood"],
                    "mag_thresholds": {{"MVS": 3.5}}
                }},
                "profiles": [
                    {{"name": "national", "mag_thresh": 4.5, "likelihood_thresh": 0.5}}
                ]
            }}"#
        )
        .unwrap();
        let rules = load_alert_rules(file.path()).unwrap();
        let association = rules.association.as_ref().unwrap();
        assert!(association.enabled);
        assert_eq!(association.priorities.len(), 2);
        assert_eq!(rules.profiles.len(), 1);
        assert_eq!(rules.profiles[0].max_depth_km, 700.0);
        assert!(validate_rules(&rules, &PolygonSet::default()).is_ok());
    }

    #[test]
    fn malformed_rules_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"profiles": [{{"name": "x"}}]}}"#).unwrap();
        // mag_thresh is required.
        assert!(load_alert_rules(file.path()).is_err());
    }
}
