pub mod extractions;
pub mod worklist;

use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::config::AppConfig;
use crate::record::FieldValue;
use extractions::ScanError;

#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Catalogue read error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Catalogue has no column named \"{0}\"")]
    MissingColumn(String),
    #[error("No objects found. Check the supplied directories, or rescan.")]
    EmptyWorklist,
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
}

pub type Result<T> = std::result::Result<T, CatalogueError>;

/// Which catalogue columns carry the identifiers and coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMap {
    pub id: String,
    pub seg_id: String,
    pub ra: String,
    pub dec: String,
}

impl ColumnMap {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            id: config.cat.id.clone(),
            seg_id: config.seg_id_column().to_string(),
            ra: config.cat.ra.clone(),
            dec: config.cat.dec.clone(),
        }
    }
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One catalogue source with its identifiers resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogueRow {
    pub id: String,
    pub segmentation_id: i64,
    /// Degrees.
    pub ra: f64,
    /// Degrees.
    pub dec: f64,
    /// Every other column, typed by inference.
    pub extra: Vec<(String, FieldValue)>,
}

impl CatalogueRow {
    pub fn extra(&self, column: &str) -> Option<&FieldValue> {
        self.extra.iter().find(|(k, _)| k == column).map(|(_, v)| v)
    }
}

/// A delimited-text source catalogue held in memory.
#[derive(Debug)]
pub struct Catalogue {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl Catalogue {
    /// Read a CSV catalogue (tab-separated when the extension is `.tsv`).
    /// Lines starting with `#` are comments.
    pub fn read(path: &Path) -> Result<Self> {
        let delimiter = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
            _ => b',',
        };
        let file = std::fs::File::open(path)?;
        let catalogue = Self::from_reader(file, delimiter)?;
        log::info!(
            "Read {} catalogue rows from {}",
            catalogue.len(),
            path.display()
        );
        Ok(catalogue)
    }

    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { headers, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| CatalogueError::MissingColumn(name.to_string()))
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Resolve every row through `columns`, in catalogue order.
    ///
    /// Rows whose segmentation id or coordinates cannot be read are dropped
    /// and counted; a missing column is an error.
    pub fn resolve(&self, columns: &ColumnMap) -> Result<(Vec<CatalogueRow>, usize)> {
        let id_col = self.column_index(&columns.id)?;
        let seg_col = self.column_index(&columns.seg_id)?;
        let ra_col = self.column_index(&columns.ra)?;
        let dec_col = self.column_index(&columns.dec)?;
        let reserved = [id_col, seg_col, ra_col, dec_col];

        let mut resolved = Vec::with_capacity(self.rows.len());
        let mut malformed = 0;
        for (i, record) in self.rows.iter().enumerate() {
            let id = record.get(id_col).unwrap_or_default().to_string();
            let segmentation_id = record.get(seg_col).and_then(parse_seg_id);
            let ra = record
                .get(ra_col)
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|ra| ra.is_finite());
            let dec = record
                .get(dec_col)
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|dec| dec.is_finite() && (-90.0..=90.0).contains(dec));

            let (Some(segmentation_id), Some(ra), Some(dec)) = (segmentation_id, ra, dec) else {
                log::warn!("Catalogue row {} ({:?}) is malformed, skipping", i + 1, id);
                malformed += 1;
                continue;
            };
            if id.is_empty() {
                log::warn!("Catalogue row {} has an empty id, skipping", i + 1);
                malformed += 1;
                continue;
            }

            let extra = self
                .headers
                .iter()
                .enumerate()
                .filter(|(c, _)| !reserved.contains(c))
                .filter_map(|(c, name)| record.get(c).map(|v| (name.clone(), FieldValue::infer(v))))
                .collect();

            resolved.push(CatalogueRow {
                id,
                segmentation_id,
                ra,
                dec,
                extra,
            });
        }
        Ok((resolved, malformed))
    }
}

/// Segmentation ids are integers, but catalogues often store them as floats.
fn parse_seg_id(raw: &str) -> Option<i64> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(i);
    }
    let f = raw.parse::<f64>().ok()?;
    (f.fract() == 0.0 && f.is_finite()).then_some(f as i64)
}
