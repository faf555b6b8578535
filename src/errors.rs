use std::fmt;
use std::io;

use thiserror::Error;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("request timed out after {0} seconds")]
    Timeout(u64),
    #[error("the selected file is empty")]
    EmptyFile,
    #[error("missing required columns: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("could not read the file: {0}")]
    Parse(String),
    #[error("no valid rows found in the file")]
    NoValidData,
    #[error("country boundary fetch failed after {attempts} attempts: {reason}")]
    FetchExhausted { attempts: u32, reason: String },
    #[error("{0}")]
    Location(LocationDenial),
    #[error("{0}")]
    Config(String),
}

/// Why a position query was rejected. Every platform failure collapses into
/// one of these three before it reaches a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationDenial {
    PermissionDenied,
    Unavailable,
    TimedOut,
}

impl fmt::Display for LocationDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LocationDenial::PermissionDenied => "location permission was denied",
            LocationDenial::Unavailable => "location is unavailable on this device",
            LocationDenial::TimedOut => "location request timed out",
        };
        f.write_str(text)
    }
}

const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

/// Maps any error to the copy a view may show. Total and deterministic:
/// unknown shapes fall back to the error's own rendering, then to a generic
/// default.
pub fn classify(err: &AppError) -> String {
    match err {
        AppError::Validation(message) => message.clone(),
        AppError::Storage(_) | AppError::Database(_) => {
            "Could not access your saved places. Please try again.".into()
        }
        AppError::Io(_) => "Could not read or write a local file.".into(),
        AppError::Keychain(_) => "Could not access the system keychain.".into(),
        AppError::Network(_) => {
            "Network problem while loading map data. Check your connection.".into()
        }
        AppError::Timeout(_) => "The request took too long. Please try again.".into(),
        AppError::EmptyFile => "The selected file is empty.".into(),
        AppError::MissingFields(fields) => format!(
            "The CSV file is missing required columns: {}",
            fields.join(", ")
        ),
        AppError::Parse(_) => "The file could not be read as CSV.".into(),
        AppError::NoValidData => "No valid rows were found in the file.".into(),
        AppError::FetchExhausted { .. } => {
            "Could not load country boundaries. Please try again later.".into()
        }
        AppError::Location(denial) => match denial {
            LocationDenial::PermissionDenied => "Location access was denied.".into(),
            LocationDenial::Unavailable => "Location is not available.".into(),
            LocationDenial::TimedOut => "Finding your location took too long.".into(),
        },
        other => {
            let rendered = other.to_string();
            if rendered.trim().is_empty() {
                GENERIC_FAILURE.into()
            } else {
                rendered
            }
        }
    }
}

/// Records diagnostic detail without touching program state. Release builds
/// log the display form only; debug detail stays out of production output.
pub fn log_error(err: &AppError, context: &str) {
    if cfg!(debug_assertions) {
        error!(target: "atlas_errors", context, error = ?err, "operation failed");
    } else {
        error!(target: "atlas_errors", context, error = %err, "operation failed");
    }
}
