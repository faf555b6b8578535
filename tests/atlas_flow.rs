use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use httptest::matchers::request;
use httptest::responders::{cycle, json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use my_world_atlas::{
    AdminLevel, AppConfig, AppResult, Atlas, Coordinates, KeyVault, PlaceDraft, PositionSource,
    ToastKind, COUNTRIES_CACHE_KEY, DEFAULT_MAP_CENTER,
};

struct FixedPosition(Coordinates);

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current_position(&self, _budget: Duration) -> AppResult<Coordinates> {
        Ok(self.0)
    }
}

fn test_config(countries_endpoint: String, export_dir: PathBuf) -> AppConfig {
    AppConfig {
        database_file_name: "atlas.db".into(),
        countries_endpoint,
        geo_cache_expiry_hours: 24,
        geo_fetch_timeout_secs: 5,
        geo_fetch_max_attempts: 3,
        geo_fetch_backoff_ms: 1,
        location_wait_timeout_secs: 1,
        position_query_timeout_secs: 1,
        toast_duration_ms: 3_000,
        export_dir: Some(export_dir),
    }
}

fn draft(unique_id: &str, name: &str, level: AdminLevel) -> PlaceDraft {
    PlaceDraft {
        unique_id: unique_id.into(),
        place_name: name.into(),
        admin_level: Some(level),
        country_code: None,
        region_code: None,
    }
}

#[tokio::test]
async fn visit_lifecycle_export_and_reimport() {
    let dir = tempdir().unwrap();
    let export_dir = dir.path().join("exports");
    let config = test_config("http://127.0.0.1:9/unused".into(), export_dir.clone());

    let atlas = Atlas::initialize_with(
        dir.path(),
        config,
        KeyVault::in_memory(),
        Arc::new(FixedPosition(Coordinates {
            latitude: 35.68,
            longitude: 139.69,
        })),
    )
    .expect("atlas init");
    let store = &atlas.store;

    assert_eq!(store.initialize().await, Some(0));

    store
        .mark_place_as_visited(draft("JP", "Japan", AdminLevel::Country))
        .await
        .expect("mark japan");
    store
        .mark_place_as_visited(draft("US-CA", "California", AdminLevel::State))
        .await
        .expect("mark california");

    let health = atlas.health().expect("health");
    assert_eq!(health.visited_count, 2);
    assert!(health.has_encryption_key);
    assert!(!health.db_bootstrap_recovered);

    // export writes a BOM-prefixed CSV into the configured directory
    let exported = store.export_to_csv().await.expect("export path");
    let bytes = std::fs::read(&exported).expect("exported file");
    assert_eq!(&bytes[..3], [0xEF, 0xBB, 0xBF]);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("\"US-CA\""));
    assert!(text.contains("\r\n"));
    assert!(exported.starts_with(&export_dir));

    // wipe one record, then re-import the export; the store is reloaded from
    // disk and ends up with both records again
    store.remove_place_visit("JP").await.expect("remove");
    assert_eq!(store.snapshot().visited_places.len(), 1);

    let summary = store.import_from_csv(&exported).await.expect("import");
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.skipped, 0);

    let state = store.snapshot();
    assert_eq!(state.visited_places.len(), 2);
    assert!(state
        .visited_places
        .iter()
        .any(|place| place.unique_id == "JP"));
    assert_eq!(state.toast.as_ref().unwrap().kind, ToastKind::Success);

    // injected position source feeds the map center
    let center = store.map_center().await;
    assert_eq!(center.latitude, 35.68);
}

#[tokio::test]
async fn boundary_fetch_retries_then_caches() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/countries.geo.json"))
            .times(3)
            .respond_with(cycle![
                status_code(500),
                status_code(502),
                json_encoded(json!({
                    "type": "FeatureCollection",
                    "features": [
                        { "type": "Feature", "id": "JPN", "properties": { "name": "Japan" } }
                    ]
                })),
            ]),
    );

    let dir = tempdir().unwrap();
    let config = test_config(
        server.url("/countries.geo.json").to_string(),
        dir.path().join("exports"),
    );
    let atlas = Atlas::initialize_with(
        dir.path(),
        config,
        KeyVault::in_memory(),
        Arc::new(my_world_atlas::UnsupportedPositionSource),
    )
    .expect("atlas init");

    assert!(!atlas.geo.is_cache_valid(COUNTRIES_CACHE_KEY));
    let payload = atlas.geo.countries_geo_json().await.expect("boundaries");
    assert_eq!(payload.features.len(), 1);
    assert!(atlas.geo.is_cache_valid(COUNTRIES_CACHE_KEY));

    // a second call is served from cache; httptest would fail the times(3)
    // expectation if it reached the server again
    atlas.geo.countries_geo_json().await.expect("cached");

    atlas.geo.clear_cache(Some(COUNTRIES_CACHE_KEY));
    assert!(!atlas.geo.is_cache_valid(COUNTRIES_CACHE_KEY));

    // with the stub position source the fallback coordinate takes over
    let center = atlas.store.map_center().await;
    assert_eq!(center, DEFAULT_MAP_CENTER);
}

#[tokio::test]
async fn reopening_with_lost_key_recovers_the_store() {
    let dir = tempdir().unwrap();
    let vault = KeyVault::in_memory();
    let config = test_config("http://127.0.0.1:9/unused".into(), dir.path().join("exports"));

    {
        let atlas = Atlas::initialize_with(
            dir.path(),
            config.clone(),
            vault.clone(),
            Arc::new(my_world_atlas::UnsupportedPositionSource),
        )
        .expect("first init");
        atlas
            .store
            .mark_place_as_visited(draft("FR", "France", AdminLevel::Country))
            .await
            .expect("mark");
    }

    vault.delete(my_world_atlas::DB_KEY_ALIAS).expect("drop key");

    let reopened = Atlas::initialize_with(
        dir.path(),
        config,
        vault,
        Arc::new(my_world_atlas::UnsupportedPositionSource),
    )
    .expect("recovery init");
    let health = reopened.health().expect("health");
    assert!(health.db_bootstrap_recovered);
    assert_eq!(health.visited_count, 0);
}
