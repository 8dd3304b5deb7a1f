use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "event-ingester failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "event-ingester failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub enum DatabaseTarget {
    Url(String),
    Params {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_channel_capacity: usize,
    pub events_topic: String,
    pub ack_template: String,
    pub dead_letter_topic: String,
    pub database: DatabaseTarget,
    pub db_pool_size: u32,
    pub timezone: Tz,
    pub supported_schema: i64,
    pub max_queue: usize,
    pub health_bind: Option<String>,
    pub storage_check_interval_ms: u64,
    pub stall_threshold_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let overrides = env::var("INGESTER_SETUP_CONFIG_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .and_then(|path| load_setup_config_overrides(Path::new(&path)));

        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        if let Some(overrides) = overrides.as_ref() {
            config.apply_setup_overrides(overrides, |key| env::var(key).ok())?;
        }
        Ok(config)
    }

    /// Builds a config from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let parse_u64 = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(raw) => raw.parse::<u64>().with_context(|| format!("invalid {key}")),
                None => Ok(default),
            }
        };

        let mqtt_host = get("MQTT_HOST").unwrap_or_else(|| "mosquitto".to_string());
        let mqtt_port = match get("MQTT_PORT") {
            Some(raw) => raw.parse::<u16>().context("invalid MQTT_PORT")?,
            None => 1883,
        };
        let mqtt_username = get("MQTT_USERNAME");
        let mqtt_password = get("MQTT_PASSWORD");
        let mqtt_client_id = get("MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("event-ingester-{}", std::process::id()));
        let mqtt_keepalive_secs = parse_u64("MQTT_KEEPALIVE_SECS", 30)?;
        let mqtt_channel_capacity = parse_u64("MQTT_CHANNEL_CAPACITY", 256)? as usize;

        let events_topic = get("MQTT_EVENTS_TOPIC").unwrap_or_else(|| "qs/v1/+/events".to_string());
        let ack_template =
            get("ACK_TEMPLATE").unwrap_or_else(|| format!("qs/v1/{DEVICE_ID_PLACEHOLDER}/acks"));
        if !ack_template.contains(DEVICE_ID_PLACEHOLDER) {
            return Err(anyhow!(
                "ACK_TEMPLATE must contain {DEVICE_ID_PLACEHOLDER}, got {ack_template}"
            ));
        }
        let dead_letter_topic =
            get("MQTT_DEADLETTER_TOPIC").unwrap_or_else(|| "qs/v1/deadletter".to_string());

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseTarget::Url(normalize_database_url(url)),
            None => DatabaseTarget::Params {
                host: get("PGHOST").unwrap_or_else(|| "postgres".to_string()),
                port: match get("PGPORT") {
                    Some(raw) => raw.parse::<u16>().context("invalid PGPORT")?,
                    None => 5432,
                },
                database: get("PGDATABASE").unwrap_or_else(|| "qs".to_string()),
                user: get("PGUSER").unwrap_or_else(|| "qs".to_string()),
                password: lookup("PGPASSWORD").unwrap_or_default(),
            },
        };
        let db_pool_size = parse_u64("INGESTER_DB_POOL_SIZE", 4)?.max(1) as u32;

        let timezone = parse_timezone(
            get("INGESTER_TIMEZONE")
                .as_deref()
                .unwrap_or(DEFAULT_TIMEZONE),
        )?;
        let supported_schema = match get("INGESTER_SUPPORTED_SCHEMA") {
            Some(raw) => raw
                .parse::<i64>()
                .context("invalid INGESTER_SUPPORTED_SCHEMA")?,
            None => 1,
        };

        let max_queue = parse_u64("INGESTER_MAX_QUEUE", 1024)?.max(1) as usize;
        let health_bind = match lookup("INGESTER_HEALTH_BIND") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().to_string()),
            None => Some("0.0.0.0:9102".to_string()),
        };
        let storage_check_interval_ms = parse_u64("INGESTER_STORAGE_CHECK_INTERVAL_MS", 5000)?;
        let stall_threshold_secs = parse_u64("INGESTER_STALL_THRESHOLD_SECS", 60)?;
        let otlp_endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            mqtt_channel_capacity,
            events_topic,
            ack_template,
            dead_letter_topic,
            database,
            db_pool_size,
            timezone,
            supported_schema,
            max_queue,
            health_bind,
            storage_check_interval_ms,
            stall_threshold_secs,
            otlp_endpoint,
        })
    }

    fn apply_setup_overrides<F>(&mut self, overrides: &SetupConfigOverrides, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_allows = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .is_none()
        };
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        if env_allows("DATABASE_URL") {
            if let Some(url) = non_empty(&overrides.database_url) {
                self.database = DatabaseTarget::Url(normalize_database_url(url));
            }
        }
        if env_allows("MQTT_HOST") {
            if let Some(host) = non_empty(&overrides.mqtt_host) {
                self.mqtt_host = host;
            }
        }
        if env_allows("MQTT_PORT") {
            if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
                self.mqtt_port = port;
            }
        }
        if env_allows("MQTT_USERNAME") {
            if let Some(username) = non_empty(&overrides.mqtt_username) {
                self.mqtt_username = Some(username);
            }
        }
        if env_allows("MQTT_PASSWORD") {
            if let Some(password) = non_empty(&overrides.mqtt_password) {
                self.mqtt_password = Some(password);
            }
        }
        if env_allows("INGESTER_TIMEZONE") {
            if let Some(zone) = non_empty(&overrides.timezone) {
                self.timezone = parse_timezone(&zone)?;
            }
        }
        Ok(())
    }

    pub fn pg_connect_options(&self) -> Result<PgConnectOptions> {
        match &self.database {
            DatabaseTarget::Url(url) => {
                PgConnectOptions::from_str(url).context("invalid DATABASE_URL")
            }
            DatabaseTarget::Params {
                host,
                port,
                database,
                user,
                password,
            } => Ok(PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(user)
                .password(password)),
        }
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn storage_check_interval(&self) -> Duration {
        Duration::from_millis(self.storage_check_interval_ms.max(100))
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|err| anyhow!("invalid timezone {raw}: {err}"))
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
