mod config;
mod csv_transfer;
mod db;
mod errors;
mod geo;
mod places;
mod secrets;
mod store;
mod visits;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use csv_transfer::{
    CsvTransfer, CsvVisitRow, DirectoryExportSink, ExportField, ExportSink, ParseMeta,
    ParseOutcome, DEFAULT_EXPORT_FIELDS, REQUIRED_FIELDS,
};
pub use db::{bootstrap, StoreBootstrap, StoreContext, DB_KEY_ALIAS};
pub use errors::{classify, log_error, AppError, AppResult, LocationDenial};
pub use geo::{
    Coordinates, CountryCollection, GeoReferenceService, PositionSource,
    UnsupportedPositionSource, COUNTRIES_CACHE_KEY,
};
pub use places::{derive_country_code, now_timestamp, AdminLevel, PlaceDraft, VisitedPlace};
pub use secrets::{KeyLifecycle, KeyVault};
pub use store::{
    AtlasState, AtlasStore, ImportSummary, Toast, ToastKind, DEFAULT_MAP_CENTER,
};
pub use visits::{BulkOutcome, VisitStore};

const VAULT_SERVICE_NAME: &str = "MyWorldAtlas";

/// Fully wired application core: every service is constructed here and
/// passed by reference into the state store, so tests can swap any
/// collaborator for a fake.
pub struct Atlas {
    pub store: AtlasStore,
    pub geo: GeoReferenceService,
    visits: VisitStore,
    vault: KeyVault,
    db_path: PathBuf,
    recovered: bool,
    key_lifecycle: KeyLifecycle,
}

#[derive(Debug, Serialize)]
pub struct FoundationHealth {
    pub db_path: String,
    pub visited_count: usize,
    pub boundaries_cached: bool,
    pub has_encryption_key: bool,
    pub db_bootstrap_recovered: bool,
    pub db_key_lifecycle: String,
}

impl Atlas {
    pub fn initialize(data_dir: impl AsRef<Path>, config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let vault = KeyVault::new(VAULT_SERVICE_NAME);
        Self::initialize_with(
            data_dir,
            config,
            vault,
            Arc::new(UnsupportedPositionSource),
        )
    }

    /// Assembly seam for tests: inject the vault and the position source.
    pub fn initialize_with(
        data_dir: impl AsRef<Path>,
        config: AppConfig,
        vault: KeyVault,
        position_source: Arc<dyn PositionSource>,
    ) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        let StoreBootstrap {
            context: StoreContext { connection, path },
            key_lifecycle,
            recovered,
        } = bootstrap(data_dir, &config.database_file_name, &vault)?;

        let visits = VisitStore::new(Arc::new(Mutex::new(connection)));
        let export_dir = config
            .export_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("exports"));
        let transfer = CsvTransfer::new(Arc::new(DirectoryExportSink::new(export_dir)));
        let geo = GeoReferenceService::with_position_source(&config, position_source)?;
        let store = AtlasStore::new(visits.clone(), transfer, geo.clone(), &config);

        Ok(Self {
            store,
            geo,
            visits,
            vault,
            db_path: path,
            recovered,
            key_lifecycle,
        })
    }

    pub fn health(&self) -> AppResult<FoundationHealth> {
        Ok(FoundationHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            visited_count: self.visits.count()?,
            boundaries_cached: self.geo.is_cache_valid(COUNTRIES_CACHE_KEY),
            has_encryption_key: self.vault.has(DB_KEY_ALIAS)?,
            db_bootstrap_recovered: self.recovered,
            db_key_lifecycle: self.key_lifecycle.as_str().to_string(),
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,my_world_atlas=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
