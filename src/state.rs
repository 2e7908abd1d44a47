//! The current object and its in-progress classification.
//!
//! All mutation goes through [`ObjectState::select`] and
//! [`ObjectState::record_field`]. Selecting an object rebuilds the record
//! from the catalogue row before any listener hears about the change.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::catalogue::CatalogueRow;
use crate::catalogue::extractions::ExtractionPaths;
use crate::catalogue::worklist::Worklist;
use crate::config::{BeamKey, format_pa};
use crate::record::{FieldValue, FlatRecord, RecordNode, flatten};
use crate::search::sky::SkyCoord;
use crate::store::schema::{self, BeamField, OutputSchema};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Unknown object id: {0}")]
    UnknownId(String),
    #[error("Worklist index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("Unknown classification field: {0}")]
    UnknownField(String),
    #[error("{0} is set from the catalogue and cannot be edited")]
    ReservedField(String),
    #[error("{column} expects a {expected} value")]
    TypeMismatch {
        column: String,
        expected: &'static str,
    },
    #[error("No object selected")]
    NoCurrentObject,
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Identifiers derived from the selected worklist entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentObject {
    /// Position in the worklist.
    pub index: usize,
    pub id: String,
    pub seg_id: i64,
    pub coord: SkyCoord,
    pub row: CatalogueRow,
    pub paths: ExtractionPaths,
}

impl CurrentObject {
    pub fn coord_string(&self) -> String {
        self.coord.to_decimal_string()
    }
}

/// A classification field that operator-facing components may write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordField {
    GrizliRedshift,
    EstimatedRedshift,
    UnreliableRedshift,
    BadSegMap,
    Comments,
    Beam { beam: BeamKey, field: BeamField },
}

impl RecordField {
    pub fn beam(beam: BeamKey, field: BeamField) -> Self {
        RecordField::Beam { beam, field }
    }

    fn path(&self) -> Vec<String> {
        let scalar = |s: &str| vec![s.to_lowercase()];
        match self {
            RecordField::GrizliRedshift => scalar(schema::GRIZLI_REDSHIFT),
            RecordField::EstimatedRedshift => scalar(schema::ESTIMATED_REDSHIFT),
            RecordField::UnreliableRedshift => scalar(schema::UNRELIABLE_REDSHIFT),
            RecordField::BadSegMap => scalar(schema::BAD_SEG_MAP),
            RecordField::Comments => scalar(schema::COMMENTS),
            RecordField::Beam { beam, field } => vec![beam.to_string(), field.key().to_string()],
        }
    }

    /// The output column this field is stored in.
    pub fn column(&self) -> String {
        self.path().join("_").to_uppercase()
    }
}

impl std::fmt::Display for RecordField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path().join("_"))
    }
}

impl FromStr for RecordField {
    type Err = StateError;

    /// Field names as written in output columns, case-insensitive:
    /// `estimated_redshift`, `f115w,72.0_quality`, `F200W,341_contamination`.
    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_uppercase();
        let field = match key.as_str() {
            schema::GRIZLI_REDSHIFT => RecordField::GrizliRedshift,
            schema::ESTIMATED_REDSHIFT => RecordField::EstimatedRedshift,
            schema::UNRELIABLE_REDSHIFT => RecordField::UnreliableRedshift,
            schema::BAD_SEG_MAP => RecordField::BadSegMap,
            schema::COMMENTS => RecordField::Comments,
            schema::ID | schema::SEG_ID | schema::RA | schema::DEC => {
                return Err(StateError::ReservedField(key));
            }
            _ => {
                let unknown = || StateError::UnknownField(s.trim().to_string());
                let (beam, suffix) = key.rsplit_once('_').ok_or_else(unknown)?;
                let field = match suffix {
                    "QUALITY" => BeamField::Quality,
                    "COVERAGE" => BeamField::Coverage,
                    "CONTAMINATION" => BeamField::Contamination,
                    _ => return Err(unknown()),
                };
                let (filter, pa) = beam.split_once(',').ok_or_else(unknown)?;
                let pa = match pa.trim().parse::<f64>() {
                    Ok(angle) => format_pa(angle),
                    Err(_) => return Err(unknown()),
                };
                RecordField::beam(BeamKey::new(filter.trim(), pa), field)
            }
        };
        Ok(field)
    }
}

/// The nested record being assembled for the current object.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRecord {
    root: RecordNode,
}

impl ClassificationRecord {
    /// A record holding only the catalogue identifiers of `object`.
    fn seeded(object: &CurrentObject) -> Self {
        let mut root = RecordNode::empty_map();
        root.set_path(&["id"], object.id.clone().into());
        root.set_path(&["seg_id"], object.seg_id.into());
        root.set_path(&["ra"], object.coord.ra.into());
        root.set_path(&["dec"], object.coord.dec.into());
        Self { root }
    }

    fn empty() -> Self {
        Self {
            root: RecordNode::empty_map(),
        }
    }

    pub fn get(&self, field: &RecordField) -> Option<&FieldValue> {
        let path = field.path();
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        self.root.get_path(&path)
    }

    pub fn node(&self) -> &RecordNode {
        &self.root
    }

    pub fn flatten(&self) -> FlatRecord {
        flatten(&self.root)
    }
}

/// Notified after every change of current object.
pub trait ObjectListener {
    fn object_selected(&mut self, object: &CurrentObject, record: &ClassificationRecord);
}

pub struct ObjectState {
    worklist: Arc<Worklist>,
    schema: OutputSchema,
    current: Option<CurrentObject>,
    record: ClassificationRecord,
    listeners: Vec<Box<dyn ObjectListener>>,
}

impl ObjectState {
    /// No object is selected until the first `select`.
    pub fn new(worklist: Arc<Worklist>, schema: OutputSchema) -> Self {
        Self {
            worklist,
            schema,
            current: None,
            record: ClassificationRecord::empty(),
            listeners: Vec::new(),
        }
    }

    /// Make `id` current. On failure nothing changes.
    pub fn select(&mut self, id: &str) -> Result<&CurrentObject> {
        let Some(index) = self.worklist.index_of(id) else {
            log::warn!("Ignoring unknown object id {:?}", id);
            return Err(StateError::UnknownId(id.to_string()));
        };
        self.select_index(index)
    }

    pub fn select_index(&mut self, index: usize) -> Result<&CurrentObject> {
        let entry = self
            .worklist
            .get(index)
            .ok_or(StateError::IndexOutOfRange(index))?;
        let object = CurrentObject {
            index,
            id: entry.row.id.clone(),
            seg_id: entry.row.segmentation_id,
            coord: SkyCoord::new(entry.row.ra, entry.row.dec),
            row: entry.row.clone(),
            paths: entry.paths.clone(),
        };
        log::debug!("Selected {} (seg id {})", object.id, object.seg_id);

        self.record = ClassificationRecord::seeded(&object);
        let object = &*self.current.insert(object);
        for listener in &mut self.listeners {
            listener.object_selected(object, &self.record);
        }
        Ok(object)
    }

    /// Stash an operator judgement for the current object. Last write wins.
    pub fn record_field(&mut self, field: &RecordField, value: FieldValue) -> Result<()> {
        if self.current.is_none() {
            return Err(StateError::NoCurrentObject);
        }
        let column_name = field.column();
        let column = self
            .schema
            .column(&column_name)
            .ok_or_else(|| StateError::UnknownField(field.to_string()))?;
        let value = value
            .coerce(column.kind)
            .ok_or_else(|| StateError::TypeMismatch {
                column: column_name.clone(),
                expected: column.kind.label(),
            })?;

        let path = field.path();
        let path: Vec<&str> = path.iter().map(String::as_str).collect();
        self.record.root.set_path(&path, value);
        Ok(())
    }

    /// The record in its persisted shape.
    pub fn flatten_record(&self) -> FlatRecord {
        self.record.flatten()
    }

    /// Every required column is populated.
    pub fn is_complete(&self) -> bool {
        self.current.is_some() && self.schema.missing(&self.flatten_record()).is_empty()
    }

    pub fn missing_fields(&self) -> Vec<String> {
        self.schema
            .missing(&self.flatten_record())
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn current(&self) -> Option<&CurrentObject> {
        self.current.as_ref()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current.as_ref().map(|c| c.index)
    }

    pub fn record(&self) -> &ClassificationRecord {
        &self.record
    }

    pub fn worklist(&self) -> &Arc<Worklist> {
        &self.worklist
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Swap in a rebuilt worklist. When the current id survived the rebuild
    /// it stays selected with its record untouched; only its position and
    /// paths are refreshed. Otherwise the first object is selected.
    pub fn replace_worklist(&mut self, worklist: Arc<Worklist>) -> Result<&CurrentObject> {
        let keep = self
            .current
            .as_ref()
            .and_then(|c| worklist.index_of(&c.id));
        self.worklist = worklist;

        let Some(index) = keep else {
            return self.select_index(0);
        };
        let entry = self
            .worklist
            .get(index)
            .ok_or(StateError::IndexOutOfRange(index))?;
        let current = self.current.as_mut().ok_or(StateError::NoCurrentObject)?;
        current.index = index;
        current.row = entry.row.clone();
        current.paths = entry.paths.clone();
        log::debug!("Kept {} at position {} after rescan", current.id, index);
        Ok(&*current)
    }

    pub fn subscribe(&mut self, listener: Box<dyn ObjectListener>) {
        self.listeners.push(listener);
    }
}
