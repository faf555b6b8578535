use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::secrets::{KeyLifecycle, KeyVault};

pub const DB_KEY_ALIAS: &str = "sqlcipher-db-key";

pub struct StoreContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct StoreBootstrap {
    pub context: StoreContext,
    pub key_lifecycle: KeyLifecycle,
    pub recovered: bool,
}

/// Opens (creating if needed) the encrypted visited-places database. When the
/// existing file can no longer be decrypted with the vaulted key, the store is
/// rebuilt from scratch: visits are re-importable from CSV exports, so a
/// readable store wins over an unreadable one.
pub fn bootstrap<P: AsRef<Path>>(
    data_dir: P,
    database_file: &str,
    vault: &KeyVault,
) -> AppResult<StoreBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)
        .map_err(|err| AppError::Storage(format!("cannot create data dir: {err}")))?;
    let db_path = data_dir.join(database_file);
    let mut key_material = vault.ensure(DB_KEY_ALIAS)?;

    match establish_context(&db_path, key_material.secret()) {
        Ok(context) => {
            info!(
                target: "store_bootstrap",
                path = %db_path.display(),
                lifecycle = key_material.lifecycle().as_str(),
                "SQLCipher context established"
            );
            Ok(StoreBootstrap {
                context,
                key_lifecycle: key_material.lifecycle(),
                recovered: false,
            })
        }
        Err(AppError::Database(err)) if should_attempt_recovery(&err, &db_path) => {
            warn!(
                target: "store_bootstrap",
                path = %db_path.display(),
                error = %err,
                "encrypted store failed to open, rebuilding"
            );
            discard_encrypted_store(&db_path)?;
            if key_material.lifecycle() == KeyLifecycle::Retrieved {
                key_material = vault.rotate(DB_KEY_ALIAS)?;
            }
            let context = establish_context(&db_path, key_material.secret())?;
            Ok(StoreBootstrap {
                context,
                key_lifecycle: key_material.lifecycle(),
                recovered: true,
            })
        }
        Err(err) => Err(err),
    }
}

fn establish_context(db_path: &Path, passphrase: &SecretString) -> AppResult<StoreContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    apply_cipher_pragmas(&connection, passphrase)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    run_migrations(&connection)?;
    assert_encrypted(db_path)?;

    Ok(StoreContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn apply_cipher_pragmas(connection: &Connection, passphrase: &SecretString) -> AppResult<()> {
    connection
        .pragma_update(None, "cipher_default_page_size", 4096_i64)
        .map_err(AppError::from)?;
    connection
        .pragma_update(None, "cipher_default_kdf_iter", 64000_i64)
        .map_err(AppError::from)?;
    connection
        .pragma_update(None, "cipher_default_hmac_algorithm", "HMAC_SHA512")
        .map_err(AppError::from)?;
    connection
        .pragma_update(None, "cipher_default_kdf_algorithm", "PBKDF2_HMAC_SHA512")
        .map_err(AppError::from)?;
    connection
        .pragma_update(None, "key", passphrase.expose_secret())
        .map_err(AppError::from)
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS visited_places (
            unique_id TEXT PRIMARY KEY,
            place_name TEXT NOT NULL,
            admin_level TEXT NOT NULL CHECK (admin_level IN ('Country', 'State')),
            date_marked TEXT NOT NULL,
            country_code TEXT NOT NULL,
            region_code TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_visited_places_admin_level
            ON visited_places(admin_level);
        CREATE INDEX IF NOT EXISTS idx_visited_places_date_marked
            ON visited_places(date_marked);
        "#,
    )?;
    Ok(())
}

fn assert_encrypted(db_path: &Path) -> AppResult<()> {
    if !db_path.exists() {
        return Err(AppError::Storage(format!(
            "expected encrypted database at {}",
            db_path.display()
        )));
    }
    let mut file = File::open(db_path)?;
    let mut header = [0_u8; 16];
    let read = file.read(&mut header)?;
    const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
    if read == SQLITE_MAGIC.len() && &header == SQLITE_MAGIC {
        return Err(AppError::Storage(
            "database header is plaintext; SQLCipher key not applied".into(),
        ));
    }
    Ok(())
}

fn should_attempt_recovery(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }

    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(
                code.code,
                ErrorCode::NotADatabase | ErrorCode::SystemIoFailure
            ) || message
                .as_deref()
                .map(|msg| {
                    msg.contains("encrypted") || msg.contains("database disk image is malformed")
                })
                .unwrap_or(false)
        }
        _ => false,
    }
}

fn discard_encrypted_store(db_path: &Path) -> AppResult<()> {
    remove_if_exists(db_path)?;
    remove_if_exists(&sidecar_path(db_path, "wal"))?;
    remove_if_exists(&sidecar_path(db_path, "shm"))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut buf = db_path.to_path_buf();
    let appended = format!(
        "{}-{suffix}",
        db_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    buf.set_file_name(appended);
    buf
}
