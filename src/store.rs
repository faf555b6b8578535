use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::csv_transfer::CsvTransfer;
use crate::errors::{classify, log_error, AppError, AppResult};
use crate::geo::{Coordinates, GeoReferenceService};
use crate::places::{PlaceDraft, VisitedPlace};
use crate::visits::VisitStore;

/// Fallback map center when no device position is available: a mid-Atlantic
/// equatorial view that frames the whole world.
pub const DEFAULT_MAP_CENTER: Coordinates = Coordinates {
    latitude: 20.0,
    longitude: 0.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Toast {
    pub message: String,
    pub kind: ToastKind,
}

/// The canonical in-memory view consumed by subscribers. The list is
/// replaced wholesale on every successful mutation; readers never observe a
/// half-updated state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AtlasState {
    pub visited_places: Vec<VisitedPlace>,
    pub selected_place: Option<VisitedPlace>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub toast: Option<Toast>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Orchestration core: the only surface views talk to. Holds the in-memory
/// state, coordinates the visit store, the CSV transfer service, and the geo
/// reference cache, and owns the transient UI state (loading flag, error,
/// toast).
#[derive(Clone)]
pub struct AtlasStore {
    visits: VisitStore,
    transfer: CsvTransfer,
    geo: GeoReferenceService,
    state_tx: Arc<watch::Sender<AtlasState>>,
    toast_seq: Arc<AtomicU64>,
    toast_duration: Duration,
}

impl AtlasStore {
    pub fn new(
        visits: VisitStore,
        transfer: CsvTransfer,
        geo: GeoReferenceService,
        config: &AppConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(AtlasState::default());
        Self {
            visits,
            transfer,
            geo,
            state_tx: Arc::new(state_tx),
            toast_seq: Arc::new(AtomicU64::new(0)),
            toast_duration: Duration::from_millis(config.toast_duration_ms),
        }
    }

    /// Read-only state subscription. Every committed mutation is visible to
    /// the receiver before the triggering action resolves.
    pub fn subscribe(&self) -> watch::Receiver<AtlasState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> AtlasState {
        self.state_tx.borrow().clone()
    }

    pub fn geo(&self) -> &GeoReferenceService {
        &self.geo
    }

    /// Loads every stored record into state, most recently marked first.
    pub async fn initialize(&self) -> Option<usize> {
        self.run("initialize_store", async {
            let places = self.load_sorted()?;
            let count = places.len();
            self.commit(move |state| state.visited_places = places);
            debug!(target: "atlas_store", count, "store initialized");
            Ok(count)
        })
        .await
    }

    /// Validates, persists, and commits a new visit. The stored record wins
    /// over any previous one with the same id.
    pub async fn mark_place_as_visited(&self, draft: PlaceDraft) -> Option<VisitedPlace> {
        self.run("mark_place_as_visited", async {
            let place = draft.into_place()?;
            self.visits.put(&place)?;
            let committed = place.clone();
            self.commit(move |state| {
                let mut list = state.visited_places.clone();
                list.retain(|existing| existing.unique_id != committed.unique_id);
                list.insert(0, committed.clone());
                state.visited_places = list;
                state.selected_place = Some(committed);
            });
            self.show_toast(
                format!("{} marked as visited", place.place_name),
                ToastKind::Success,
            );
            Ok(place)
        })
        .await
    }

    pub async fn remove_place_visit(&self, unique_id: &str) -> Option<()> {
        self.run("remove_place_visit", async {
            self.visits.delete(unique_id)?;
            let removed_id = unique_id.to_string();
            self.commit(move |state| {
                let mut list = state.visited_places.clone();
                list.retain(|place| place.unique_id != removed_id);
                state.visited_places = list;
                let selected_was_removed = state
                    .selected_place
                    .as_ref()
                    .map(|place| place.unique_id == removed_id)
                    .unwrap_or(false);
                if selected_was_removed {
                    state.selected_place = None;
                }
            });
            self.show_toast("Visit removed", ToastKind::Info);
            Ok(())
        })
        .await
    }

    /// Parses the file, bulk-upserts the valid rows, then reloads the whole
    /// list from the adapter: after a bulk write the durable store is the
    /// source of truth, not a local merge.
    pub async fn import_from_csv(&self, path: &Path) -> Option<ImportSummary> {
        self.run("import_from_csv", async {
            let contents = std::fs::read_to_string(path)?;
            let outcome = self.transfer.parse_csv(&contents)?;

            let mut records = Vec::with_capacity(outcome.rows.len());
            let mut rejected = outcome.invalid_rows;
            for row in outcome.rows {
                match VisitedPlace::try_from(row) {
                    Ok(place) => records.push(place),
                    Err(err) => {
                        warn!(target: "atlas_store", %err, "dropping unimportable row");
                        rejected += 1;
                    }
                }
            }
            if records.is_empty() {
                return Err(AppError::NoValidData);
            }

            let bulk = self.visits.bulk_put(&records)?;
            let places = self.load_sorted()?;
            self.commit(move |state| state.visited_places = places);

            let summary = ImportSummary {
                imported: bulk.success,
                skipped: bulk.skipped + rejected,
            };
            self.show_toast(
                format!(
                    "Imported {} places ({} skipped)",
                    summary.imported, summary.skipped
                ),
                ToastKind::Success,
            );
            Ok(summary)
        })
        .await
    }

    /// No-ops with a warning toast when there is nothing to export.
    pub async fn export_to_csv(&self) -> Option<PathBuf> {
        let places = self.snapshot().visited_places;
        if places.is_empty() {
            self.show_toast(
                "There are no visited places to export yet",
                ToastKind::Warning,
            );
            return None;
        }
        self.run("export_to_csv", async {
            let path = self.transfer.export(&places)?;
            self.show_toast(
                format!("Exported {} places", places.len()),
                ToastKind::Success,
            );
            Ok(path)
        })
        .await
    }

    /// Device position with the hardcoded fallback: the map always gets a
    /// center point.
    pub async fn map_center(&self) -> Coordinates {
        match self.geo.current_location().await {
            Ok(coordinates) => coordinates,
            Err(err) => {
                log_error(&err, "map_center");
                DEFAULT_MAP_CENTER
            }
        }
    }

    pub fn set_selected_place(&self, place: Option<VisitedPlace>) {
        self.commit(move |state| state.selected_place = place);
    }

    pub fn clear_error(&self) {
        self.commit(|state| state.error = None);
    }

    /// Shows a toast and schedules its dismissal. A newer toast supersedes
    /// the pending dismissal of an older one, so a stale timer never clears
    /// fresh state.
    pub fn show_toast(&self, message: impl Into<String>, kind: ToastKind) {
        let toast = Toast {
            message: message.into(),
            kind,
        };
        let seq = self.toast_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.commit(move |state| state.toast = Some(toast));

        let store = self.clone();
        tokio::spawn(async move {
            sleep(store.toast_duration).await;
            if store.toast_seq.load(Ordering::SeqCst) == seq {
                store.commit(|state| state.toast = None);
            }
        });
    }

    fn load_sorted(&self) -> AppResult<Vec<VisitedPlace>> {
        let mut places = self.visits.get_all()?;
        places.sort_by(|a, b| b.date_marked.cmp(&a.date_marked));
        Ok(places)
    }

    fn commit<F: FnOnce(&mut AtlasState)>(&self, mutate: F) {
        self.state_tx.send_modify(mutate);
    }

    /// Policy boundary between "fails and is reported" and "fails and
    /// crashes the caller": logs with call-site context, classifies into user
    /// copy, updates `error` and the toast, resets the loading flag, and
    /// swallows the failure.
    async fn run<T>(
        &self,
        context: &'static str,
        op: impl Future<Output = AppResult<T>>,
    ) -> Option<T> {
        self.commit(|state| {
            state.is_loading = true;
            state.error = None;
        });
        match op.await {
            Ok(value) => {
                self.commit(|state| state.is_loading = false);
                Some(value)
            }
            Err(err) => {
                log_error(&err, context);
                let message = classify(&err);
                let committed = message.clone();
                self.commit(move |state| {
                    state.is_loading = false;
                    state.error = Some(committed);
                });
                self.show_toast(message, ToastKind::Error);
                None
            }
        }
    }
}
