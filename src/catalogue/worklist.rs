//! The ordered, deduplicated list of objects a session pages through.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use super::extractions::{CancelToken, ExtractionIndex, ExtractionPaths, ScanOptions};
use super::{Catalogue, CatalogueError, CatalogueRow, ColumnMap, Result};
use crate::config::AppConfig;
use crate::search::sky::{SkyCoord, SkyIndex};

/// How the worklist ended up ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Every id parsed as a number.
    Numeric,
    /// At least one id is not numeric; catalogue order kept for all rows.
    Catalogue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorklistEntry {
    pub row: CatalogueRow,
    pub paths: ExtractionPaths,
}

/// Diagnostics from one build. Every count is a row count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub catalogue_rows: usize,
    pub malformed_rows: usize,
    pub duplicates_dropped: usize,
    pub skipped_existing: usize,
    pub missing_extractions: usize,
    pub kept: usize,
    pub order: Option<SortOrder>,
}

impl std::fmt::Display for BuildReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} catalogue rows: {} kept, {} malformed, {} duplicate seg ids, {} already classified, {} without extractions",
            self.catalogue_rows,
            self.kept,
            self.malformed_rows,
            self.duplicates_dropped,
            self.skipped_existing,
            self.missing_extractions,
        )?;
        match self.order {
            Some(SortOrder::Numeric) => write!(f, " (sorted by id)"),
            Some(SortOrder::Catalogue) => write!(f, " (catalogue order)"),
            None => Ok(()),
        }
    }
}

/// Everything a build reads. Owned so it can be sent to a worker thread.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub catalogue_path: PathBuf,
    pub extractions_dir: PathBuf,
    pub columns: ColumnMap,
    pub skip_ids: HashSet<i64>,
    pub pad: usize,
    pub timeout: Option<Duration>,
    pub progress: bool,
}

impl BuildRequest {
    pub fn from_config(config: &AppConfig, skip_ids: HashSet<i64>) -> Self {
        Self {
            catalogue_path: config.catalogue_path(),
            extractions_dir: config.extractions_dir(),
            columns: ColumnMap::from_config(config),
            skip_ids,
            pad: config.catalogue.seg_id_length,
            timeout: Some(config.scan_timeout()),
            progress: false,
        }
    }
}

/// Read the catalogue, walk the extraction tree, and build the worklist.
pub fn build(request: &BuildRequest, cancel: &CancelToken) -> Result<(Worklist, BuildReport)> {
    let catalogue = Catalogue::read(&request.catalogue_path)?;
    let options = ScanOptions {
        pad: request.pad,
        timeout: request.timeout,
        progress: request.progress,
    };
    let index = ExtractionIndex::scan(&request.extractions_dir, &options, cancel)?;
    build_from(&catalogue, &index, &request.columns, &request.skip_ids)
}

/// Build from an already-read catalogue and extraction index.
pub fn build_from(
    catalogue: &Catalogue,
    index: &ExtractionIndex,
    columns: &ColumnMap,
    skip_ids: &HashSet<i64>,
) -> Result<(Worklist, BuildReport)> {
    let (rows, malformed) = catalogue.resolve(columns)?;
    let mut report = BuildReport {
        catalogue_rows: catalogue.len(),
        malformed_rows: malformed,
        ..BuildReport::default()
    };

    let mut seen = HashSet::with_capacity(rows.len());
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        if !seen.insert(row.segmentation_id) {
            log::warn!(
                "Duplicate segmentation id {} (id {}), keeping the first occurrence",
                row.segmentation_id,
                row.id
            );
            report.duplicates_dropped += 1;
            continue;
        }
        if skip_ids.contains(&row.segmentation_id) {
            report.skipped_existing += 1;
            continue;
        }
        match index.paths(row.segmentation_id) {
            Some(paths) => entries.push(WorklistEntry { row, paths }),
            None => {
                log::debug!("No 1D/stack extraction for seg id {}", row.segmentation_id);
                report.missing_extractions += 1;
            }
        }
    }

    if report.duplicates_dropped > 0 {
        log::warn!(
            "Catalogue has {} duplicate segmentation ids",
            report.duplicates_dropped
        );
    }

    let order = sort_entries(&mut entries);
    report.kept = entries.len();
    report.order = Some(order);

    let worklist = Worklist::from_entries(entries)?;
    log::info!("{}", report);
    Ok((worklist, report))
}

/// Sort numerically by id; one unparsable id means catalogue order for all.
fn sort_entries(entries: &mut [WorklistEntry]) -> SortOrder {
    let keys: Option<Vec<f64>> = entries
        .iter()
        .map(|e| e.row.id.trim().parse::<f64>().ok().filter(|k| !k.is_nan()))
        .collect();
    let Some(keys) = keys else {
        return SortOrder::Catalogue;
    };
    let mut keyed: Vec<(f64, WorklistEntry)> = keys
        .into_iter()
        .zip(entries.iter().cloned())
        .collect();
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (slot, (_, entry)) in entries.iter_mut().zip(keyed) {
        *slot = entry;
    }
    SortOrder::Numeric
}

/// Index-addressable, never mutated after construction. A rescan builds a
/// new one.
#[derive(Debug, Clone)]
pub struct Worklist {
    entries: Vec<WorklistEntry>,
    by_id: HashMap<String, usize>,
    sky: SkyIndex,
}

impl Worklist {
    pub fn from_entries(entries: Vec<WorklistEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(CatalogueError::EmptyWorklist);
        }
        let mut by_id = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            by_id.entry(entry.row.id.clone()).or_insert(i);
        }
        let sky = SkyIndex::new(
            entries
                .iter()
                .map(|e| SkyCoord::new(e.row.ra, e.row.dec))
                .collect(),
        );
        Ok(Self { entries, by_id, sky })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a constructed worklist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WorklistEntry> {
        self.entries.get(index)
    }

    /// Position of `id` (exact string match).
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.row.id.as_str())
    }

    pub fn entries(&self) -> &[WorklistEntry] {
        &self.entries
    }

    pub fn sky_index(&self) -> &SkyIndex {
        &self.sky
    }
}
