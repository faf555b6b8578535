use std::path::PathBuf;
use std::{env, io};

use tracing::debug;

const DEFAULT_COUNTRIES_ENDPOINT: &str =
    "https://raw.githubusercontent.com/johan/world.geo.json/master/countries.geo.json";
const DEFAULT_CACHE_EXPIRY_HOURS: u64 = 24;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BACKOFF_MS: u64 = 1_000;
const DEFAULT_LOCATION_WAIT_SECS: u64 = 15;
const DEFAULT_POSITION_QUERY_SECS: u64 = 10;
const DEFAULT_TOAST_DURATION_MS: u64 = 3_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub countries_endpoint: String,
    pub geo_cache_expiry_hours: u64,
    pub geo_fetch_timeout_secs: u64,
    pub geo_fetch_max_attempts: u32,
    pub geo_fetch_backoff_ms: u64,
    pub location_wait_timeout_secs: u64,
    pub position_query_timeout_secs: u64,
    pub toast_duration_ms: u64,
    pub export_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "my-world-atlas.db".to_string()),
            countries_endpoint: env::var("COUNTRIES_GEOJSON_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_COUNTRIES_ENDPOINT.to_string()),
            geo_cache_expiry_hours: parse_u64("GEO_CACHE_EXPIRY_HOURS", DEFAULT_CACHE_EXPIRY_HOURS),
            geo_fetch_timeout_secs: parse_u64("GEO_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS),
            geo_fetch_max_attempts: parse_u32("GEO_FETCH_MAX_ATTEMPTS", DEFAULT_FETCH_MAX_ATTEMPTS)
                .max(1),
            geo_fetch_backoff_ms: parse_u64("GEO_FETCH_BACKOFF_MS", DEFAULT_FETCH_BACKOFF_MS),
            location_wait_timeout_secs: parse_u64(
                "LOCATION_WAIT_TIMEOUT_SECS",
                DEFAULT_LOCATION_WAIT_SECS,
            ),
            position_query_timeout_secs: parse_u64(
                "POSITION_QUERY_TIMEOUT_SECS",
                DEFAULT_POSITION_QUERY_SECS,
            ),
            toast_duration_ms: parse_u64("TOAST_DURATION_MS", DEFAULT_TOAST_DURATION_MS),
            export_dir: env::var("EXPORT_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
