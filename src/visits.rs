use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{trace, warn};

use crate::errors::{AppError, AppResult};
use crate::places::{AdminLevel, VisitedPlace};

/// Durable storage of visited places keyed by `unique_id`. One logical write
/// is one transaction; readers never observe a partial batch.
#[derive(Clone)]
pub struct VisitStore {
    db: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BulkOutcome {
    pub success: usize,
    pub skipped: usize,
}

impl VisitStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Every stored record, in unspecified order. Callers sort.
    pub fn get_all(&self) -> AppResult<Vec<VisitedPlace>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT unique_id, place_name, admin_level, date_marked, country_code, region_code
            FROM visited_places",
        )?;
        let rows = stmt
            .query_map([], parse_place_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get(&self, unique_id: &str) -> AppResult<Option<VisitedPlace>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT unique_id, place_name, admin_level, date_marked, country_code, region_code
            FROM visited_places
            WHERE unique_id = ?1",
            [unique_id],
            parse_place_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Upsert: an existing `unique_id` is overwritten, never duplicated.
    pub fn put(&self, place: &VisitedPlace) -> AppResult<()> {
        place.validate()?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO visited_places
                (unique_id, place_name, admin_level, date_marked, country_code, region_code)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(unique_id) DO UPDATE SET
                place_name = excluded.place_name,
                admin_level = excluded.admin_level,
                date_marked = excluded.date_marked,
                country_code = excluded.country_code,
                region_code = excluded.region_code",
            (
                place.unique_id.as_str(),
                place.place_name.as_str(),
                place.admin_level.as_str(),
                place.date_marked.as_str(),
                place.country_code.as_str(),
                place.region_code.as_str(),
            ),
        )?;
        trace!(target: "visit_store", unique_id = %place.unique_id, "visit upserted");
        Ok(())
    }

    /// Idempotent: deleting an id that was never stored is not an error.
    pub fn delete(&self, unique_id: &str) -> AppResult<()> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM visited_places WHERE unique_id = ?1", [unique_id])?;
        trace!(target: "visit_store", unique_id, removed, "visit delete");
        Ok(())
    }

    /// Attempts each record independently inside one transaction. A bad
    /// record is logged and counted as skipped; it never aborts the batch.
    pub fn bulk_put(&self, places: &[VisitedPlace]) -> AppResult<BulkOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut outcome = BulkOutcome::default();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO visited_places
                    (unique_id, place_name, admin_level, date_marked, country_code, region_code)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(unique_id) DO UPDATE SET
                    place_name = excluded.place_name,
                    admin_level = excluded.admin_level,
                    date_marked = excluded.date_marked,
                    country_code = excluded.country_code,
                    region_code = excluded.region_code",
            )?;
            for place in places {
                if let Err(err) = place.validate() {
                    warn!(target: "visit_store", unique_id = %place.unique_id, %err, "skipping invalid record");
                    outcome.skipped += 1;
                    continue;
                }
                let written = stmt.execute((
                    place.unique_id.as_str(),
                    place.place_name.as_str(),
                    place.admin_level.as_str(),
                    place.date_marked.as_str(),
                    place.country_code.as_str(),
                    place.region_code.as_str(),
                ));
                match written {
                    Ok(_) => outcome.success += 1,
                    Err(err) => {
                        warn!(target: "visit_store", unique_id = %place.unique_id, %err, "skipping failed write");
                        outcome.skipped += 1;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    pub fn find_by_admin_level(&self, level: AdminLevel) -> AppResult<Vec<VisitedPlace>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT unique_id, place_name, admin_level, date_marked, country_code, region_code
            FROM visited_places
            WHERE admin_level = ?1",
        )?;
        let rows = stmt
            .query_map([level.as_str()], parse_place_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Inclusive bounds; ISO-8601 strings compare lexicographically.
    pub fn find_by_date_range(&self, start: &str, end: &str) -> AppResult<Vec<VisitedPlace>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT unique_id, place_name, admin_level, date_marked, country_code, region_code
            FROM visited_places
            WHERE date_marked BETWEEN ?1 AND ?2",
        )?;
        let rows = stmt
            .query_map([start, end], parse_place_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM visited_places", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|value| value as usize)
        .map_err(AppError::from)
    }
}

fn parse_place_row(row: &Row<'_>) -> rusqlite::Result<VisitedPlace> {
    let level: String = row.get(2)?;
    Ok(VisitedPlace {
        unique_id: row.get(0)?,
        place_name: row.get(1)?,
        admin_level: if level == "Country" {
            AdminLevel::Country
        } else {
            AdminLevel::State
        },
        date_marked: row.get(3)?,
        country_code: row.get(4)?,
        region_code: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::bootstrap;
    use crate::places::PlaceDraft;
    use crate::secrets::KeyVault;

    fn open_store(dir: &std::path::Path) -> VisitStore {
        let vault = KeyVault::in_memory();
        let bootstrap = bootstrap(dir, "visits.db", &vault).unwrap();
        VisitStore::new(Arc::new(Mutex::new(bootstrap.context.connection)))
    }

    fn place(unique_id: &str, name: &str, level: AdminLevel) -> VisitedPlace {
        PlaceDraft {
            unique_id: unique_id.into(),
            place_name: name.into(),
            admin_level: Some(level),
            country_code: None,
            region_code: None,
        }
        .into_place()
        .unwrap()
    }

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let japan = place("JP", "Japan", AdminLevel::Country);
        store.put(&japan).unwrap();

        let loaded = store.get("JP").unwrap().unwrap();
        assert_eq!(loaded.place_name, "Japan");
        assert_eq!(loaded.admin_level, AdminLevel::Country);
        assert!(store.get("XX").unwrap().is_none());
    }

    #[test]
    fn put_same_id_overwrites_instead_of_duplicating() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put(&place("JP", "Japan", AdminLevel::Country)).unwrap();
        let remarked = place("JP", "Japan (again)", AdminLevel::Country);
        store.put(&remarked).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].place_name, "Japan (again)");
        assert_eq!(all[0].date_marked, remarked.date_marked);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put(&place("FR", "France", AdminLevel::Country)).unwrap();
        store.delete("FR").unwrap();
        store.delete("FR").unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn bulk_put_isolates_bad_records() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let mut broken = place("BR", "Brazil", AdminLevel::Country);
        broken.date_marked = "not-a-date".into();
        let batch = vec![
            place("AR", "Argentina", AdminLevel::Country),
            broken,
            place("CL", "Chile", AdminLevel::Country),
        ];

        let outcome = store.bulk_put(&batch).unwrap();
        assert_eq!(outcome.success, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn finds_by_admin_level() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.put(&place("JP", "Japan", AdminLevel::Country)).unwrap();
        store.put(&place("US-CA", "California", AdminLevel::State)).unwrap();
        store.put(&place("US-OR", "Oregon", AdminLevel::State)).unwrap();

        let states = store.find_by_admin_level(AdminLevel::State).unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|p| p.admin_level == AdminLevel::State));
    }

    #[test]
    fn date_range_bounds_are_inclusive() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        for (id, stamp) in [
            ("A", "2023-01-01T00:00:00.000Z"),
            ("B", "2023-06-15T12:00:00.000Z"),
            ("C", "2024-01-01T00:00:00.000Z"),
        ] {
            let mut p = place(id, id, AdminLevel::Country);
            p.date_marked = stamp.into();
            store.put(&p).unwrap();
        }

        let hits = store
            .find_by_date_range("2023-01-01T00:00:00.000Z", "2023-12-31T23:59:59.999Z")
            .unwrap();
        let mut ids: Vec<_> = hits.iter().map(|p| p.unique_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["A", "B"]);
    }
}
