use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, LocationDenial};

pub const COUNTRIES_CACHE_KEY: &str = "countries-geojson";

/// Minimal validated shape of the boundary payload. Deserialization fails
/// when `features` is absent or not an array, which is the gate that keeps
/// malformed responses out of the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountryCollection {
    #[serde(rename = "type", default)]
    pub collection_type: String,
    pub features: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Platform position query. The budget is the per-query allowance; the
/// service wraps calls in its own, longer wait.
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self, budget: Duration) -> AppResult<Coordinates>;
}

/// Default source for builds without a platform geolocation bridge.
pub struct UnsupportedPositionSource;

#[async_trait]
impl PositionSource for UnsupportedPositionSource {
    async fn current_position(&self, _budget: Duration) -> AppResult<Coordinates> {
        Err(AppError::Location(LocationDenial::Unavailable))
    }
}

struct CacheEntry {
    payload: CountryCollection,
    fetched_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_fetch_at: Option<Instant>,
}

/// Fetches and caches remote country-boundary reference data. A fresh cache
/// entry is served without touching the network; a miss fetches with a
/// bounded timeout and linear backoff retries.
#[derive(Clone)]
pub struct GeoReferenceService {
    http: Client,
    endpoint: String,
    cache_expiry: Duration,
    fetch_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    location_wait: Duration,
    position_budget: Duration,
    cache: Arc<Mutex<CacheState>>,
    position_source: Arc<dyn PositionSource>,
}

impl GeoReferenceService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_position_source(config, Arc::new(UnsupportedPositionSource))
    }

    pub fn with_position_source(
        config: &AppConfig,
        position_source: Arc<dyn PositionSource>,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("my-world-atlas/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.countries_endpoint.clone(),
            cache_expiry: Duration::from_secs(config.geo_cache_expiry_hours * 3600),
            fetch_timeout: Duration::from_secs(config.geo_fetch_timeout_secs),
            max_attempts: config.geo_fetch_max_attempts.max(1),
            backoff_base: Duration::from_millis(config.geo_fetch_backoff_ms),
            location_wait: Duration::from_secs(config.location_wait_timeout_secs),
            position_budget: Duration::from_secs(config.position_query_timeout_secs),
            cache: Arc::new(Mutex::new(CacheState::default())),
            position_source,
        })
    }

    /// True only while an entry exists and is younger than the expiry.
    pub fn is_cache_valid(&self, key: &str) -> bool {
        let state = self.cache.lock();
        state
            .entries
            .get(key)
            .map(|entry| entry.fetched_at.elapsed() < self.cache_expiry)
            .unwrap_or(false)
    }

    /// Serves the cached collection when fresh (at most one network fetch per
    /// expiry window); otherwise fetches, retrying with `base * attempt`
    /// backoff. Exhaustion surfaces an error naming the attempt count and
    /// leaves the cache untouched.
    pub async fn countries_geo_json(&self) -> AppResult<CountryCollection> {
        if let Some(payload) = self.fresh_payload(COUNTRIES_CACHE_KEY) {
            debug!(target: "geo_cache", key = COUNTRIES_CACHE_KEY, "serving cached boundaries");
            return Ok(payload);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_countries().await {
                Ok(payload) => {
                    let mut state = self.cache.lock();
                    state.entries.insert(
                        COUNTRIES_CACHE_KEY.to_string(),
                        CacheEntry {
                            payload: payload.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                    state.last_fetch_at = Some(Instant::now());
                    debug!(
                        target: "geo_cache",
                        attempt,
                        features = payload.features.len(),
                        "country boundaries fetched"
                    );
                    return Ok(payload);
                }
                Err(err) if attempt < self.max_attempts => {
                    let delay = self.backoff_base * attempt;
                    warn!(
                        target: "geo_cache",
                        %err,
                        attempt,
                        "boundary fetch failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(AppError::FetchExhausted {
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    /// Clears one entry or all of them; the shared fetch timestamp resets
    /// either way.
    pub fn clear_cache(&self, key: Option<&str>) {
        let mut state = self.cache.lock();
        match key {
            Some(key) => {
                state.entries.remove(key);
            }
            None => state.entries.clear(),
        }
        state.last_fetch_at = None;
    }

    /// Resolves the device position, classifying every failure into one of
    /// the three denial reasons. Callers supply their own fallback
    /// coordinate; this method never invents one.
    pub async fn current_location(&self) -> AppResult<Coordinates> {
        let query = self.position_source.current_position(self.position_budget);
        match timeout(self.location_wait, query).await {
            Ok(Ok(coordinates)) => Ok(coordinates),
            Ok(Err(AppError::Location(denial))) => Err(AppError::Location(denial)),
            Ok(Err(err)) => {
                warn!(target: "geo_cache", %err, "position query failed");
                Err(AppError::Location(LocationDenial::Unavailable))
            }
            Err(_) => Err(AppError::Location(LocationDenial::TimedOut)),
        }
    }

    fn fresh_payload(&self, key: &str) -> Option<CountryCollection> {
        let state = self.cache.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.cache_expiry)
            .map(|entry| entry.payload.clone())
    }

    async fn fetch_countries(&self) -> AppResult<CountryCollection> {
        let request = async {
            let response = self
                .http
                .get(&self.endpoint)
                .send()
                .await?
                .error_for_status()?;
            let payload = response.json::<CountryCollection>().await?;
            Ok::<_, AppError>(payload)
        };
        timeout(self.fetch_timeout, request)
            .await
            .map_err(|_| AppError::Timeout(self.fetch_timeout.as_secs()))?
    }
}
