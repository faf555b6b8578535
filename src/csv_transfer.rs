use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use csv::{ErrorKind, QuoteStyle, ReaderBuilder, Terminator, Trim, WriterBuilder};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::places::{derive_country_code, now_timestamp, AdminLevel, VisitedPlace};

pub const REQUIRED_FIELDS: [&str; 3] = ["uniqueId", "placeName", "adminLevel"];

const UTF8_BOM: char = '\u{feff}';
const EXPORT_FILE_PREFIX: &str = "MyWorldAtlas_Export";

/// Transfer-layer row shape. Everything stays a string so that
/// parse -> generate reproduces the input verbatim; admin levels are only
/// narrowed to the enum when a row crosses into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvVisitRow {
    pub unique_id: String,
    pub place_name: String,
    pub admin_level: String,
    pub date_marked: String,
    pub country_code: String,
    pub region_code: String,
}

impl From<&VisitedPlace> for CsvVisitRow {
    fn from(place: &VisitedPlace) -> Self {
        Self {
            unique_id: place.unique_id.clone(),
            place_name: place.place_name.clone(),
            admin_level: place.admin_level.as_str().to_string(),
            date_marked: place.date_marked.clone(),
            country_code: place.country_code.clone(),
            region_code: place.region_code.clone(),
        }
    }
}

impl TryFrom<CsvVisitRow> for VisitedPlace {
    type Error = AppError;

    fn try_from(row: CsvVisitRow) -> AppResult<Self> {
        let admin_level = AdminLevel::parse(&row.admin_level)?;
        let country_code = if row.country_code.is_empty() {
            derive_country_code(&row.unique_id).to_string()
        } else {
            row.country_code
        };
        let region_code = if row.region_code.is_empty() {
            row.unique_id.clone()
        } else {
            row.region_code
        };
        let place = VisitedPlace {
            unique_id: row.unique_id,
            place_name: row.place_name,
            admin_level,
            date_marked: row.date_marked,
            country_code,
            region_code,
        };
        place.validate()?;
        Ok(place)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportField {
    UniqueId,
    PlaceName,
    AdminLevel,
    DateMarked,
    CountryCode,
    RegionCode,
}

pub const DEFAULT_EXPORT_FIELDS: [ExportField; 6] = [
    ExportField::UniqueId,
    ExportField::PlaceName,
    ExportField::AdminLevel,
    ExportField::DateMarked,
    ExportField::CountryCode,
    ExportField::RegionCode,
];

impl ExportField {
    pub fn header(&self) -> &'static str {
        match self {
            ExportField::UniqueId => "uniqueId",
            ExportField::PlaceName => "placeName",
            ExportField::AdminLevel => "adminLevel",
            ExportField::DateMarked => "dateMarked",
            ExportField::CountryCode => "countryCodeISO",
            ExportField::RegionCode => "regionCodeISO",
        }
    }
}

impl CsvVisitRow {
    fn value(&self, field: ExportField) -> &str {
        match field {
            ExportField::UniqueId => &self.unique_id,
            ExportField::PlaceName => &self.place_name,
            ExportField::AdminLevel => &self.admin_level,
            ExportField::DateMarked => &self.date_marked,
            ExportField::CountryCode => &self.country_code,
            ExportField::RegionCode => &self.region_code,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParseMeta {
    pub fields: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct ParseOutcome {
    pub rows: Vec<CsvVisitRow>,
    pub meta: ParseMeta,
    pub invalid_rows: usize,
}

/// Where export bytes end up. Production writes into a directory; tests
/// inject a capturing sink.
pub trait ExportSink: Send + Sync {
    fn deliver(&self, file_name: &str, bytes: &[u8]) -> AppResult<PathBuf>;
}

pub struct DirectoryExportSink {
    dir: PathBuf,
}

impl DirectoryExportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ExportSink for DirectoryExportSink {
    fn deliver(&self, file_name: &str, bytes: &[u8]) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name);
        fs::write(&path, bytes)?;
        Ok(path)
    }
}

#[derive(Clone)]
pub struct CsvTransfer {
    sink: Arc<dyn ExportSink>,
}

impl CsvTransfer {
    pub fn new(sink: Arc<dyn ExportSink>) -> Self {
        Self { sink }
    }

    /// Parses CSV text into transfer rows. Failure ladder: empty file,
    /// missing required header columns, structural parse errors. Rows that
    /// lack a required value are dropped and counted, never fatal; a file
    /// where nothing survives is.
    pub fn parse_csv(&self, contents: &str) -> AppResult<ParseOutcome> {
        let contents = contents.strip_prefix(UTF8_BOM).unwrap_or(contents);
        if contents.trim().is_empty() {
            return Err(AppError::EmptyFile);
        }

        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(contents.as_bytes());

        let headers = reader
            .headers()
            .map_err(|err| AppError::Parse(err.to_string()))?
            .clone();
        let header_names: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();

        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|required| !header_names.iter().any(|h| h == *required))
            .map(|required| required.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::MissingFields(missing));
        }

        let column = |name: &str| header_names.iter().position(|h| h == name);
        let unique_id_col = column("uniqueId").expect("checked above");
        let place_name_col = column("placeName").expect("checked above");
        let admin_level_col = column("adminLevel").expect("checked above");
        let date_marked_col = column("dateMarked");
        let country_code_col = column("countryCodeISO");
        let region_code_col = column("regionCodeISO");

        let mut rows = Vec::new();
        let mut warnings = Vec::new();
        let mut invalid_rows = 0;

        for (index, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(err) => match err.kind() {
                    ErrorKind::UnequalLengths { .. } => {
                        warnings.push(format!("row {}: field count mismatch", index + 1));
                        invalid_rows += 1;
                        continue;
                    }
                    _ => return Err(AppError::Parse(err.to_string())),
                },
            };

            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            if record.len() != headers.len() {
                warnings.push(format!(
                    "row {}: expected {} fields, found {}",
                    index + 1,
                    headers.len(),
                    record.len()
                ));
            }

            let field = |col: usize| record.get(col).map(str::trim).unwrap_or_default();
            let unique_id = field(unique_id_col).to_string();
            let place_name = field(place_name_col).to_string();
            let admin_level = field(admin_level_col).to_string();
            if unique_id.is_empty() || place_name.is_empty() || admin_level.is_empty() {
                invalid_rows += 1;
                continue;
            }

            let date_marked = date_marked_col
                .map(field)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .unwrap_or_else(now_timestamp);

            rows.push(CsvVisitRow {
                unique_id,
                place_name,
                admin_level,
                date_marked,
                country_code: country_code_col.map(field).unwrap_or_default().to_string(),
                region_code: region_code_col.map(field).unwrap_or_default().to_string(),
            });
        }

        if rows.is_empty() {
            return Err(AppError::NoValidData);
        }

        debug!(
            target: "csv_transfer",
            rows = rows.len(),
            invalid_rows,
            warnings = warnings.len(),
            "CSV parsed"
        );
        Ok(ParseOutcome {
            rows,
            meta: ParseMeta {
                fields: header_names,
                warnings,
            },
            invalid_rows,
        })
    }

    /// Serializes rows: all fields quoted, comma-delimited, CRLF-terminated.
    /// Missing values render as empty strings.
    pub fn generate_csv(
        &self,
        rows: &[CsvVisitRow],
        fields: Option<&[ExportField]>,
    ) -> AppResult<String> {
        if rows.is_empty() {
            return Err(AppError::Validation("there are no records to export".into()));
        }
        let fields = fields.unwrap_or(&DEFAULT_EXPORT_FIELDS);

        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .terminator(Terminator::CRLF)
            .from_writer(Vec::new());
        writer
            .write_record(fields.iter().map(|f| f.header()))
            .map_err(|err| AppError::Parse(err.to_string()))?;
        for row in rows {
            writer
                .write_record(fields.iter().map(|f| row.value(*f)))
                .map_err(|err| AppError::Parse(err.to_string()))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|err| AppError::Parse(err.to_string()))?;
        String::from_utf8(bytes).map_err(|err| AppError::Parse(err.to_string()))
    }

    /// Generates the export file (BOM-prefixed so spreadsheet tools read
    /// UTF-8) and hands it to the sink. The only side-effecting path in this
    /// service.
    pub fn export(&self, places: &[VisitedPlace]) -> AppResult<PathBuf> {
        let rows: Vec<CsvVisitRow> = places.iter().map(CsvVisitRow::from).collect();
        let text = self.generate_csv(&rows, None)?;

        let mut bytes = Vec::with_capacity(text.len() + 3);
        bytes.extend_from_slice("\u{feff}".as_bytes());
        bytes.extend_from_slice(text.as_bytes());

        let file_name = format!(
            "{EXPORT_FILE_PREFIX}_{}.csv",
            Utc::now().format("%Y%m%d_%H%M")
        );
        let path = self.sink.deliver(&file_name, &bytes)?;
        debug!(target: "csv_transfer", path = %path.display(), rows = places.len(), "export delivered");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::places::PlaceDraft;

    #[derive(Default)]
    struct CaptureSink {
        delivered: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ExportSink for CaptureSink {
        fn deliver(&self, file_name: &str, bytes: &[u8]) -> AppResult<PathBuf> {
            self.delivered
                .lock()
                .unwrap()
                .push((file_name.to_string(), bytes.to_vec()));
            Ok(PathBuf::from(file_name))
        }
    }

    fn transfer() -> (CsvTransfer, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::default());
        (CsvTransfer::new(sink.clone()), sink)
    }

    #[test]
    fn empty_and_whitespace_files_are_rejected() {
        let (transfer, _) = transfer();
        assert!(matches!(transfer.parse_csv(""), Err(AppError::EmptyFile)));
        assert!(matches!(
            transfer.parse_csv("  \n \n"),
            Err(AppError::EmptyFile)
        ));
    }

    #[test]
    fn missing_header_columns_are_all_named() {
        let (transfer, _) = transfer();
        let err = transfer.parse_csv("id,name\n1,Tokyo").unwrap_err();
        match err {
            AppError::MissingFields(fields) => {
                assert!(fields.contains(&"uniqueId".to_string()));
                assert!(fields.contains(&"placeName".to_string()));
                assert!(fields.contains(&"adminLevel".to_string()));
            }
            other => panic!("expected MissingFields, got {other:?}"),
        }
    }

    #[test]
    fn parses_a_minimal_valid_file() {
        let (transfer, _) = transfer();
        let outcome = transfer
            .parse_csv("uniqueId,placeName,adminLevel,dateMarked\n1,Tokyo,Prefecture,2023-10-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.invalid_rows, 0);
        assert_eq!(outcome.rows[0].unique_id, "1");
        assert_eq!(outcome.rows[0].admin_level, "Prefecture");
        assert_eq!(outcome.rows[0].date_marked, "2023-10-01T00:00:00.000Z");
    }

    #[test]
    fn strips_byte_order_marker_before_parsing() {
        let (transfer, _) = transfer();
        let outcome = transfer
            .parse_csv("\u{feff}uniqueId,placeName,adminLevel\nJP,Japan,Country")
            .unwrap();
        assert_eq!(outcome.rows[0].unique_id, "JP");
    }

    #[test]
    fn drops_rows_missing_required_values() {
        let (transfer, _) = transfer();
        let outcome = transfer
            .parse_csv("uniqueId,placeName,adminLevel\nJP,Japan,Country\n,Nowhere,Country\nFR,,Country")
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.invalid_rows, 2);
    }

    #[test]
    fn skips_blank_lines_without_counting_them() {
        let (transfer, _) = transfer();
        let outcome = transfer
            .parse_csv("uniqueId,placeName,adminLevel\nJP,Japan,Country\n\nFR,France,Country\n")
            .unwrap();
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.invalid_rows, 0);
    }

    #[test]
    fn all_rows_invalid_is_an_error() {
        let (transfer, _) = transfer();
        let err = transfer
            .parse_csv("uniqueId,placeName,adminLevel\n,Nowhere,Country")
            .unwrap_err();
        assert!(matches!(err, AppError::NoValidData));
    }

    #[test]
    fn short_rows_warn_but_still_parse_when_required_fields_present() {
        let (transfer, _) = transfer();
        let outcome = transfer
            .parse_csv("uniqueId,placeName,adminLevel,dateMarked\nJP,Japan,Country")
            .unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert!(!outcome.meta.warnings.is_empty());
        // dateMarked was absent, so it was defaulted to a real timestamp
        assert!(outcome.rows[0].date_marked.ends_with('Z'));
    }

    #[test]
    fn generated_csv_is_quoted_and_crlf_terminated() {
        let (transfer, _) = transfer();
        let rows = vec![CsvVisitRow {
            unique_id: "US-CA".into(),
            place_name: "California".into(),
            admin_level: "State".into(),
            date_marked: "2023-10-01T00:00:00.000Z".into(),
            country_code: "US".into(),
            region_code: String::new(),
        }];
        let text = transfer.generate_csv(&rows, None).unwrap();
        let mut lines = text.split("\r\n");
        assert_eq!(
            lines.next().unwrap(),
            "\"uniqueId\",\"placeName\",\"adminLevel\",\"dateMarked\",\"countryCodeISO\",\"regionCodeISO\""
        );
        // missing region code renders as an empty quoted string, never "null"
        assert!(lines.next().unwrap().ends_with("\"US\",\"\""));
    }

    #[test]
    fn generate_refuses_empty_input() {
        let (transfer, _) = transfer();
        assert!(transfer.generate_csv(&[], None).is_err());
    }

    #[test]
    fn parse_generate_roundtrip_preserves_required_values() {
        let (transfer, _) = transfer();
        let original = "uniqueId,placeName,adminLevel\nJP,Japan,Country\n1,Tokyo,Prefecture\nUS-CA,California,State";
        let first = transfer.parse_csv(original).unwrap();
        let regenerated = transfer.generate_csv(&first.rows, None).unwrap();
        let second = transfer.parse_csv(&regenerated).unwrap();

        let key = |row: &CsvVisitRow| {
            (
                row.unique_id.clone(),
                row.place_name.clone(),
                row.admin_level.clone(),
            )
        };
        let mut before: Vec<_> = first.rows.iter().map(key).collect();
        let mut after: Vec<_> = second.rows.iter().map(key).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn export_prefixes_bom_and_stamps_file_name() {
        let (transfer, sink) = transfer();
        let place = PlaceDraft {
            unique_id: "JP".into(),
            place_name: "Japan".into(),
            admin_level: Some(AdminLevel::Country),
            country_code: None,
            region_code: None,
        }
        .into_place()
        .unwrap();

        transfer.export(&[place]).unwrap();

        let delivered = sink.delivered.lock().unwrap();
        let (name, bytes) = &delivered[0];
        assert!(name.starts_with("MyWorldAtlas_Export_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(&bytes[..3], [0xEF, 0xBB, 0xBF]);
    }

    #[test]
    fn transfer_row_narrows_into_a_store_record() {
        let row = CsvVisitRow {
            unique_id: "US-CA".into(),
            place_name: "California".into(),
            admin_level: "Prefecture".into(),
            date_marked: "2023-10-01T00:00:00.000Z".into(),
            country_code: String::new(),
            region_code: String::new(),
        };
        let place = VisitedPlace::try_from(row).unwrap();
        assert_eq!(place.admin_level, AdminLevel::State);
        assert_eq!(place.country_code, "US");
        assert_eq!(place.region_code, "US-CA");

        let unknown = CsvVisitRow {
            unique_id: "X".into(),
            place_name: "X".into(),
            admin_level: "galaxy".into(),
            date_marked: "2023-10-01T00:00:00.000Z".into(),
            country_code: String::new(),
            region_code: String::new(),
        };
        assert!(VisitedPlace::try_from(unknown).is_err());
    }
}
