use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Granularity of a visited place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminLevel {
    Country,
    State,
}

impl AdminLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminLevel::Country => "Country",
            AdminLevel::State => "State",
        }
    }

    /// Tolerant of the sub-national labels bulk imports actually contain.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "country" | "nation" => Ok(AdminLevel::Country),
            "state" | "province" | "region" | "prefecture" | "territory" => Ok(AdminLevel::State),
            other => Err(AppError::Validation(format!(
                "unrecognized admin level: {other}"
            ))),
        }
    }
}

/// One user-recorded visit. `unique_id` is the primary key; writing the same
/// id again overwrites the stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitedPlace {
    pub unique_id: String,
    pub place_name: String,
    pub admin_level: AdminLevel,
    pub date_marked: String,
    #[serde(rename = "countryCodeISO")]
    pub country_code: String,
    #[serde(rename = "regionCodeISO")]
    pub region_code: String,
}

impl VisitedPlace {
    pub fn validate(&self) -> AppResult<()> {
        if self.unique_id.trim().is_empty() {
            return Err(AppError::Validation("uniqueId is required".into()));
        }
        if self.place_name.trim().is_empty() {
            return Err(AppError::Validation("placeName is required".into()));
        }
        if DateTime::parse_from_rfc3339(&self.date_marked).is_err() {
            return Err(AppError::Validation(format!(
                "dateMarked is not an ISO-8601 timestamp: {}",
                self.date_marked
            )));
        }
        Ok(())
    }
}

/// Payload a map interaction hands to `mark_place_as_visited`. Codes may be
/// omitted; they are derived from `unique_id` on conversion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceDraft {
    pub unique_id: String,
    pub place_name: String,
    pub admin_level: Option<AdminLevel>,
    #[serde(rename = "countryCodeISO")]
    pub country_code: Option<String>,
    #[serde(rename = "regionCodeISO")]
    pub region_code: Option<String>,
}

impl PlaceDraft {
    /// Validates required fields, derives the ISO codes, and stamps the mark
    /// time with the current instant.
    pub fn into_place(self) -> AppResult<VisitedPlace> {
        let unique_id = self.unique_id.trim().to_string();
        if unique_id.is_empty() {
            return Err(AppError::Validation("uniqueId is required".into()));
        }
        let place_name = self.place_name.trim().to_string();
        if place_name.is_empty() {
            return Err(AppError::Validation("placeName is required".into()));
        }
        let admin_level = self
            .admin_level
            .ok_or_else(|| AppError::Validation("adminLevel is required".into()))?;

        let country_code = normalize_code(self.country_code)
            .unwrap_or_else(|| derive_country_code(&unique_id).to_string());
        let region_code =
            normalize_code(self.region_code).unwrap_or_else(|| unique_id.clone());

        Ok(VisitedPlace {
            unique_id,
            place_name,
            admin_level,
            date_marked: now_timestamp(),
            country_code,
            region_code,
        })
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix, e.g.
/// `2023-10-01T00:00:00.000Z`. Lexicographic order equals chronological order
/// for this shape, which the date-range index relies on.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The ISO country code is the `unique_id` prefix before the separator, or
/// the whole id for country-level entries ("US-CA" -> "US", "JP" -> "JP").
pub fn derive_country_code(unique_id: &str) -> &str {
    unique_id.split('-').next().unwrap_or(unique_id)
}

fn normalize_code(value: Option<String>) -> Option<String> {
    value
        .map(|code| code.trim().to_string())
        .filter(|code| !code.is_empty())
}
