//! Runtime settings of the webcam sentinel.
//!
//! - `Settings`: the JSON payload exchanged with the dashboard (camelCase).
//! - `SentinelConfig`: the normalized, validated form the capture loop runs on.
//! - `SettingsStore`: where the last accepted payload is kept between runs.

use anyhow::{anyhow, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::error::SentinelError;

pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_THRESHOLD: u64 = 4000;
pub const DEFAULT_CLOUD_BASE: &str = "/";
pub const DEFAULT_UTC_OFFSET: &str = "+00:00";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    /// Camera `host[:port]`.
    pub host: String,
    pub user: String,
    pub pass: String,
    #[serde(with = "interval_format")]
    pub interval: Duration,
    /// Changed-pixel count above which a frame counts as motion.
    pub threshold: u64,
    pub disk_base: String,
    pub disk_force: bool,
    pub cloud_token: String,
    pub cloud_base: String,
    pub utc_offset: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            user: String::new(),
            pass: String::new(),
            interval: DEFAULT_INTERVAL,
            threshold: DEFAULT_THRESHOLD,
            disk_base: String::new(),
            disk_force: false,
            cloud_token: String::new(),
            cloud_base: DEFAULT_CLOUD_BASE.to_string(),
            utc_offset: DEFAULT_UTC_OFFSET.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskTarget {
    pub base: PathBuf,
    pub force: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct CloudTarget {
    pub token: String,
    pub base: String,
}

impl std::fmt::Debug for CloudTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudTarget")
            .field("token", &"<redacted>")
            .field("base", &self.base)
            .finish()
    }
}

/// Validated settings. Replaced whole on every update, never mutated.
#[derive(Clone, Debug)]
pub struct SentinelConfig {
    pub settings: Settings,
    /// `http://<host>/`, absent when no host is configured.
    pub origin: Option<Url>,
    pub interval: Duration,
    pub threshold: u64,
    pub disk: Option<DiskTarget>,
    pub cloud: Option<CloudTarget>,
    pub offset: FixedOffset,
}

impl SentinelConfig {
    pub fn is_capturing(&self) -> bool {
        self.settings.enabled && self.origin.is_some()
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            origin: None,
            interval: DEFAULT_INTERVAL,
            threshold: DEFAULT_THRESHOLD,
            disk: None,
            cloud: None,
            offset: utc(),
        }
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl Settings {
    /// Overlay `payload` on top of `self`. Keys missing from the payload keep
    /// their current values; `null` (or no payload) means defaults.
    pub fn merge(&self, payload: Option<&Value>) -> Result<Settings, SentinelError> {
        let overlay = match payload {
            None | Some(Value::Null) => return Ok(Settings::default()),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(SentinelError::InvalidSettings(format!(
                    "expected a JSON object, got {}",
                    json_kind(other)
                )))
            }
        };
        let mut merged = serde_json::to_value(self)
            .map_err(|e| SentinelError::InvalidSettings(e.to_string()))?;
        if let Value::Object(current) = &mut merged {
            for (key, value) in overlay {
                current.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(merged).map_err(|e| SentinelError::InvalidSettings(e.to_string()))
    }

    /// Validate and normalize into a runnable config.
    ///
    /// Floors the interval, defaults a zero threshold, builds the camera
    /// origin, checks the disk base is an existing directory and parses the
    /// UTC offset. Does not contact the cloud service.
    pub fn normalize(&self) -> Result<SentinelConfig, SentinelError> {
        let mut settings = self.clone();
        settings.host = settings.host.trim().to_string();
        settings.disk_base = settings.disk_base.trim().to_string();
        settings.cloud_token = settings.cloud_token.trim().to_string();

        // Whole milliseconds, so the interval survives a save and reload.
        settings.interval = round_to_millis(settings.interval);
        if settings.interval < MIN_INTERVAL {
            settings.interval = MIN_INTERVAL;
        }
        if settings.threshold == 0 {
            settings.threshold = DEFAULT_THRESHOLD;
        }
        if settings.cloud_base.trim().is_empty() {
            settings.cloud_base = DEFAULT_CLOUD_BASE.to_string();
        }

        let origin = if settings.host.is_empty() {
            settings.enabled = false;
            None
        } else {
            Some(parse_origin(&settings.host)?)
        };

        let disk = if settings.disk_base.is_empty() {
            None
        } else {
            let base = PathBuf::from(&settings.disk_base);
            match fs::metadata(&base) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(SentinelError::InvalidSettings(format!(
                        "diskBase {} is not a directory",
                        base.display()
                    )))
                }
                Err(err) => {
                    return Err(SentinelError::InvalidSettings(format!(
                        "diskBase {}: {}",
                        base.display(),
                        err
                    )))
                }
            }
            Some(DiskTarget {
                base,
                force: settings.disk_force,
            })
        };

        let cloud = if settings.cloud_token.is_empty() {
            None
        } else {
            Some(CloudTarget {
                token: settings.cloud_token.clone(),
                base: settings.cloud_base.clone(),
            })
        };

        let offset = parse_utc_offset(&settings.utc_offset)?;

        Ok(SentinelConfig {
            origin,
            interval: settings.interval,
            threshold: settings.threshold,
            disk,
            cloud,
            offset,
            settings,
        })
    }
}

fn round_to_millis(interval: Duration) -> Duration {
    let millis = (interval.as_nanos() + 500_000) / 1_000_000;
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

fn parse_origin(host: &str) -> Result<Url, SentinelError> {
    let candidate = if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}/")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| SentinelError::InvalidSettings(format!("host {host:?}: {e}")))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SentinelError::InvalidSettings(format!(
            "host {host:?}: missing host name"
        )));
    }
    Ok(url)
}

/// `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, SentinelError> {
    let value = value.trim();
    let invalid = || SentinelError::InvalidSettings(format!("utcOffset {value:?}"));
    if value.is_empty() || value.eq_ignore_ascii_case("z") {
        return Ok(utc());
    }
    let (sign, rest) = match value.as_bytes()[0] {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if minutes >= 60 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Intervals travel as duration strings (`"1s"`, `"250ms"`, `"1m30s"`); a
/// bare number is read as seconds.
mod interval_format {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = value.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{millis}ms"))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(IntervalVisitor)
    }

    struct IntervalVisitor;

    impl<'de> Visitor<'de> for IntervalVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string like \"1s\" or a number of seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("interval must not be negative"))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(|e| E::custom(e.to_string()))
        }
    }
}

/// Parse a duration made of `<number><unit>` terms: `ms`, `s`, `m`, `h`.
/// A plain number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow!("duration {value:?}: missing unit"))?;
        let (number, tail) = rest.split_at(split);
        let amount: f64 = number
            .parse()
            .with_context(|| format!("duration {value:?}: bad number {number:?}"))?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let unit_nanos = match unit {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => return Err(anyhow!("duration {value:?}: unknown unit {other:?}")),
        };
        let nanos = (amount * unit_nanos).round();
        if !nanos.is_finite() || nanos > u64::MAX as f64 {
            return Err(anyhow!("duration {value:?} out of range"));
        }
        total = total
            .checked_add(Duration::from_nanos(nanos as u64))
            .ok_or_else(|| anyhow!("duration {value:?} out of range"))?;
        rest = next;
    }
    Ok(total)
}

// ----------------------------------------------------------------------------
// Settings store
// ----------------------------------------------------------------------------

/// Persistent home of a module's last accepted settings payload.
pub trait SettingsStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Value>>;
    fn set(&self, id: &str, value: &Value) -> Result<()>;
}

/// One pretty-printed JSON document per module id: `<dir>/<id>.json`.
#[derive(Clone, Debug)]
pub struct JsonFileSettingsStore {
    dir: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create settings dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        crate::validate_module_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn get(&self, id: &str) -> Result<Option<Value>> {
        let path = self.path_for(id)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let value = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid settings file {}: {}", path.display(), e))?;
        Ok(Some(value))
    }

    fn set(&self, id: &str, value: &Value) -> Result<()> {
        let path = self.path_for(id)?;
        let data = serde_json::to_vec_pretty(value)?;
        write_atomic(&path, &data).with_context(|| format!("write {}", path.display()))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, id: &str) -> Result<Option<Value>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))?;
        Ok(values.get(id).cloned())
    }

    fn set(&self, id: &str, value: &Value) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("settings store lock poisoned"))?;
        values.insert(id.to_string(), value.clone());
        Ok(())
    }
}
