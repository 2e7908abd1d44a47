//! Index of grizli extraction products on disk, keyed by segmentation id.
//!
//! The tree is walked once per build. Every later lookup (worklist
//! filtering, file paths for the current object) goes through the index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Extractions directory not found: {0}")]
    NotADirectory(PathBuf),
    #[error("Scan cancelled")]
    Cancelled,
    #[error("Scan exceeded the {0:?} time limit")]
    TimedOut(Duration),
}

// Trailing digits before the product suffix: `uncover_00123.1D.fits`
static PRODUCT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<seg>\d+)\.(?P<kind>1D|stack|full|row)\.fits$").unwrap()
});

/// Cooperative cancellation flag shared between a scan and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Minimum number of digits in the segmentation id part of a filename.
    pub pad: usize,
    pub timeout: Option<Duration>,
    pub progress: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pad: crate::DEFAULT_SEG_ID_PAD,
            timeout: None,
            progress: false,
        }
    }
}

/// Resolved products of one object. The 1D spectrum and the stacked
/// beams are what makes an object classifiable; the rest are optional.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPaths {
    pub spec_1d: PathBuf,
    pub stack: PathBuf,
    /// Full fit, holds the chi-squared redshift grid.
    pub full: Option<PathBuf>,
    /// Row table, holds the pipeline redshift.
    pub row: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Products {
    spec_1d: Option<PathBuf>,
    stack: Option<PathBuf>,
    full: Option<PathBuf>,
    row: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ExtractionIndex {
    products: HashMap<i64, Products>,
    files_seen: usize,
}

impl ExtractionIndex {
    /// Walk `dir` recursively and index every extraction product found.
    /// When several files claim the same object and kind, the first in
    /// file-name order wins.
    pub fn scan(dir: &Path, options: &ScanOptions, cancel: &CancelToken) -> Result<Self, ScanError> {
        if !dir.is_dir() {
            return Err(ScanError::NotADirectory(dir.to_path_buf()));
        }

        let started = Instant::now();
        let pb = if options.progress {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner:.green} {pos} files ({per_sec}) {msg}")
                    .unwrap(),
            );
            pb.set_message("Scanning extractions...");
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut index = Self::default();
        let entries = WalkDir::new(dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    log::debug!("Skipping unreadable entry: {}", err);
                    None
                }
            });

        for entry in entries {
            if cancel.is_cancelled() {
                pb.abandon_with_message("cancelled");
                return Err(ScanError::Cancelled);
            }
            if let Some(limit) = options.timeout {
                if started.elapsed() > limit {
                    pb.abandon_with_message("timed out");
                    return Err(ScanError::TimedOut(limit));
                }
            }
            if !entry.file_type().is_file() {
                continue;
            }
            pb.inc(1);
            index.files_seen += 1;

            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if let Some((seg_id, kind)) = parse_product_name(name, options.pad) {
                index.insert(seg_id, kind, entry.path());
            }
        }

        pb.finish_with_message(format!("{} objects", index.products.len()));
        log::debug!(
            "Indexed {} files under {} ({} objects) in {:.1?}",
            index.files_seen,
            dir.display(),
            index.products.len(),
            started.elapsed()
        );
        Ok(index)
    }

    fn insert(&mut self, seg_id: i64, kind: ProductKind, path: &Path) {
        let products = self.products.entry(seg_id).or_default();
        let slot = match kind {
            ProductKind::Spec1D => &mut products.spec_1d,
            ProductKind::Stack => &mut products.stack,
            ProductKind::Full => &mut products.full,
            ProductKind::Row => &mut products.row,
        };
        if slot.is_none() {
            *slot = Some(path.to_path_buf());
        } else {
            log::debug!("Ignoring duplicate product {}", path.display());
        }
    }

    /// Paths for `seg_id`, if both required products exist.
    pub fn paths(&self, seg_id: i64) -> Option<ExtractionPaths> {
        let products = self.products.get(&seg_id)?;
        Some(ExtractionPaths {
            spec_1d: products.spec_1d.clone()?,
            stack: products.stack.clone()?,
            full: products.full.clone(),
            row: products.row.clone(),
        })
    }

    /// Number of objects with at least one product.
    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn files_seen(&self) -> usize {
        self.files_seen
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProductKind {
    Spec1D,
    Stack,
    Full,
    Row,
}

fn parse_product_name(name: &str, pad: usize) -> Option<(i64, ProductKind)> {
    let caps = PRODUCT_RE.captures(name)?;
    let digits = caps.name("seg")?.as_str();
    if digits.len() < pad {
        return None;
    }
    let seg_id = digits.parse().ok()?;
    let kind = match caps.name("kind")?.as_str() {
        "1D" => ProductKind::Spec1D,
        "stack" => ProductKind::Stack,
        "full" => ProductKind::Full,
        "row" => ProductKind::Row,
        _ => return None,
    };
    Some((seg_id, kind))
}
