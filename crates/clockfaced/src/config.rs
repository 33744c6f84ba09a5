use anyhow::{bail, Context, Result};
use clockface_core::{
    Coordinate, Geofence, LivenessPolicy, PipelineConfig, QualityConfig,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// --- Named constants ---

const DEFAULT_DETECTOR_COMMAND: &str = "/usr/libexec/clockface/detect";
const DEFAULT_CACHE_TTL_SECS: u64 = 30 * 60;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEFAULT_PROGRESS_BUFFER: usize = 64;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    System,
    Session,
}

impl Bus {
    pub fn builder(self) -> zbus::Result<zbus::connection::Builder<'static>> {
        match self {
            Bus::System => zbus::connection::Builder::system(),
            Bus::Session => zbus::connection::Builder::session(),
        }
    }
}

/// Optional on-disk overrides. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    detector_command: Option<String>,
    detector_args: Option<Vec<String>>,
    session_bus: Option<bool>,
    max_concurrent: Option<usize>,
    match_threshold: Option<f32>,
    min_confidence: Option<f32>,
    cache_ttl_secs: Option<u64>,
    cache_sweep_secs: Option<u64>,
    office_latitude: Option<f64>,
    office_longitude: Option<f64>,
    geofence_radius_m: Option<f64>,
    strict_liveness: Option<bool>,
    progress_buffer: Option<usize>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Daemon configuration: an optional TOML file named by `CLOCKFACE_CONFIG`,
/// overridden key by key from `CLOCKFACE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Executable that turns one encoded image into a detection.
    pub detector_command: String,
    pub detector_args: Vec<String>,
    pub bus: Bus,
    pub max_concurrent: usize,
    pub match_threshold: f32,
    pub min_confidence: f32,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    /// Office anchor. Only ever read from server-side configuration.
    pub office: Coordinate,
    pub geofence_radius_m: f64,
    pub strict_liveness: bool,
    pub progress_buffer: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        let file = match std::env::var("CLOCKFACE_CONFIG") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_path = env("CLOCKFACE_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("identities.db"));

        let detector_args = match env("CLOCKFACE_DETECTOR_ARGS") {
            Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
            None => file.detector_args.unwrap_or_default(),
        };

        let latitude = env_parse(&env, "CLOCKFACE_OFFICE_LATITUDE")?.or(file.office_latitude);
        let longitude = env_parse(&env, "CLOCKFACE_OFFICE_LONGITUDE")?.or(file.office_longitude);
        let office = match (latitude, longitude) {
            (Some(lat), Some(lon)) => Coordinate::new(lat, lon),
            _ => bail!(
                "office location is not configured \
                 (set CLOCKFACE_OFFICE_LATITUDE and CLOCKFACE_OFFICE_LONGITUDE)"
            ),
        };
        office.validate().context("invalid office location")?;

        let geofence_radius_m = env_parse(&env, "CLOCKFACE_GEOFENCE_RADIUS_M")?
            .or(file.geofence_radius_m)
            .unwrap_or(clockface_core::geo::DEFAULT_GEOFENCE_RADIUS_M);
        if !(geofence_radius_m.is_finite() && geofence_radius_m > 0.0) {
            bail!("geofence radius must be a positive number of meters, got {geofence_radius_m}");
        }

        let match_threshold = env_parse(&env, "CLOCKFACE_MATCH_THRESHOLD")?
            .or(file.match_threshold)
            .unwrap_or(clockface_core::matcher::DEFAULT_MATCH_THRESHOLD);
        if !(match_threshold.is_finite() && match_threshold > 0.0) {
            bail!("match threshold must be positive, got {match_threshold}");
        }

        let session_bus = env_bool(&env, "CLOCKFACE_SESSION_BUS")
            .or(file.session_bus)
            .unwrap_or(false);

        Ok(Self {
            db_path,
            detector_command: env("CLOCKFACE_DETECTOR_COMMAND")
                .or(file.detector_command)
                .unwrap_or_else(|| DEFAULT_DETECTOR_COMMAND.to_string()),
            detector_args,
            bus: if session_bus { Bus::Session } else { Bus::System },
            max_concurrent: env_parse(&env, "CLOCKFACE_MAX_CONCURRENT")?
                .or(file.max_concurrent)
                .unwrap_or(clockface_core::admission::DEFAULT_MAX_CONCURRENT),
            match_threshold,
            min_confidence: env_parse(&env, "CLOCKFACE_MIN_CONFIDENCE")?
                .or(file.min_confidence)
                .unwrap_or(clockface_core::quality::DEFAULT_MIN_CONFIDENCE),
            cache_ttl: Duration::from_secs(
                env_parse(&env, "CLOCKFACE_CACHE_TTL_SECS")?
                    .or(file.cache_ttl_secs)
                    .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
            // tokio::time::interval panics on a zero period.
            cache_sweep_interval: Duration::from_secs(
                env_parse(&env, "CLOCKFACE_CACHE_SWEEP_SECS")?
                    .or(file.cache_sweep_secs)
                    .unwrap_or(DEFAULT_CACHE_SWEEP_SECS)
                    .max(1),
            ),
            office,
            geofence_radius_m,
            strict_liveness: env_bool(&env, "CLOCKFACE_STRICT_LIVENESS")
                .or(file.strict_liveness)
                .unwrap_or(false),
            progress_buffer: env_parse(&env, "CLOCKFACE_PROGRESS_BUFFER")?
                .or(file.progress_buffer)
                .unwrap_or(DEFAULT_PROGRESS_BUFFER),
        })
    }

    pub fn geofence(&self) -> Geofence {
        Geofence::new(self.office, self.geofence_radius_m)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.geofence());
        config.match_threshold = self.match_threshold;
        config.quality = QualityConfig {
            min_confidence: self.min_confidence,
            ..QualityConfig::default()
        };
        config.liveness = LivenessPolicy {
            strict: self.strict_liveness,
            ..LivenessPolicy::default()
        };
        config
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("clockface")
}

/// A set-but-unparseable variable is an error rather than a silent default.
fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
        None => Ok(None),
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env(key).map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
}
