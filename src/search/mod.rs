pub mod coords;
pub mod sky;

use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::catalogue::worklist::Worklist;
pub use coords::parse_sky_coordinate;
use sky::SkyCoord;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchError {
    #[error("{0}")]
    Parse(String),
    #[error("Batch mixes {first}-token and {other}-token lines (line {line})")]
    MixedTokenCounts {
        first: usize,
        other: usize,
        line: usize,
    },
    #[error("Coordinate out of range: {0}")]
    OutOfRange(String),
    #[error("No objects to match against")]
    NoCandidates,
}

pub type Result<T> = std::result::Result<T, SearchError>;

static BATCH_SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,;\s]+").unwrap());

/// Closest worklist object to a queried position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkyMatch {
    pub index: usize,
    pub id: String,
    pub separation_arcsec: f64,
}

/// One line of a batch query and its match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMatch {
    /// Present when the line carried an id column.
    pub input_id: Option<String>,
    pub coord: SkyCoord,
    pub matched_id: String,
    pub separation_arcsec: f64,
}

/// Resolves operator queries against the positions of a worklist.
pub struct SearchResolver<'w> {
    worklist: &'w Worklist,
}

impl<'w> SearchResolver<'w> {
    pub fn new(worklist: &'w Worklist) -> Self {
        Self { worklist }
    }

    /// Parse `text` and return the nearest object. Any parsable position
    /// matches something; the separation is reported for the operator to judge.
    pub fn resolve_sky_coordinate(&self, text: &str) -> Result<SkyMatch> {
        let coord = parse_sky_coordinate(text)?;
        self.resolve_coord(coord)
    }

    pub fn resolve_coord(&self, coord: SkyCoord) -> Result<SkyMatch> {
        let (index, separation) = self
            .worklist
            .sky_index()
            .nearest(coord)
            .ok_or(SearchError::NoCandidates)?;
        let entry = self.worklist.get(index).ok_or(SearchError::NoCandidates)?;
        Ok(SkyMatch {
            index,
            id: entry.row.id.clone(),
            separation_arcsec: separation * 3600.0,
        })
    }

    /// Match every line of `text` (`id, ra, dec` or `ra, dec`).
    ///
    /// The whole batch is parsed before anything is matched: one bad line,
    /// or a mix of 2- and 3-token lines, fails the batch. Blank lines and
    /// lines starting with `#` are ignored. Results keep input order.
    pub fn resolve_batch(&self, text: &str) -> Result<Vec<BatchMatch>> {
        let queries = parse_batch(text)?;
        queries
            .into_par_iter()
            .map(|(input_id, coord)| {
                let m = self.resolve_coord(coord)?;
                Ok(BatchMatch {
                    input_id,
                    coord,
                    matched_id: m.id,
                    separation_arcsec: m.separation_arcsec,
                })
            })
            .collect()
    }
}

fn parse_batch(text: &str) -> Result<Vec<(Option<String>, SkyCoord)>> {
    let mut token_count = None;
    let mut queries = Vec::new();

    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = n + 1;
        let tokens: Vec<&str> = BATCH_SEPARATOR_RE
            .split(line)
            .filter(|t| !t.is_empty())
            .collect();

        match token_count {
            None => token_count = Some(tokens.len()),
            Some(first) if first != tokens.len() && matches!(tokens.len(), 2 | 3) => {
                return Err(SearchError::MixedTokenCounts {
                    first,
                    other: tokens.len(),
                    line: line_no,
                });
            }
            Some(_) => {}
        }

        let (input_id, ra, dec) = match tokens.as_slice() {
            [ra, dec] => (None, *ra, *dec),
            [id, ra, dec] => (Some(id.to_string()), *ra, *dec),
            _ => {
                return Err(SearchError::Parse(format!(
                    "Line {line_no}: expected 2 or 3 values, found {}",
                    tokens.len()
                )));
            }
        };
        let with_line = |e: SearchError| match e {
            SearchError::Parse(msg) => SearchError::Parse(format!("Line {line_no}: {msg}")),
            SearchError::OutOfRange(msg) => {
                SearchError::OutOfRange(format!("line {line_no}: {msg}"))
            }
            other => other,
        };
        let coord = parse_sky_coordinate(&format!("{ra} {dec}")).map_err(with_line)?;
        queries.push((input_id, coord));
    }

    if queries.is_empty() {
        return Err(SearchError::Parse("No coordinates in batch".into()));
    }
    Ok(queries)
}
