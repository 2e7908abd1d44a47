use std::collections::HashMap;

use crate::config::{AppConfig, BeamKey};
use crate::record::{ColumnKind, FlatRecord};

pub const ID: &str = "ID";
pub const SEG_ID: &str = "SEG_ID";
pub const RA: &str = "RA";
pub const DEC: &str = "DEC";
pub const GRIZLI_REDSHIFT: &str = "GRIZLI_REDSHIFT";
pub const ESTIMATED_REDSHIFT: &str = "ESTIMATED_REDSHIFT";
pub const UNRELIABLE_REDSHIFT: &str = "UNRELIABLE_REDSHIFT";
pub const BAD_SEG_MAP: &str = "BAD_SEG_MAP";
pub const COMMENTS: &str = "COMMENTS";

/// Per-beam fields, as they appear after the `"{filter},{pa}_"` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeamField {
    Quality,
    Coverage,
    Contamination,
}

impl BeamField {
    /// Key under the beam's node in the nested record.
    pub fn key(self) -> &'static str {
        match self {
            BeamField::Quality => "quality",
            BeamField::Coverage => "coverage",
            BeamField::Contamination => "contamination",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            BeamField::Coverage => ColumnKind::Float,
            BeamField::Quality | BeamField::Contamination => ColumnKind::Text,
        }
    }

    pub fn column(self, beam: &BeamKey) -> String {
        format!("{}_{}", beam, self.key()).to_uppercase()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Must be populated before a record may be committed.
    pub required: bool,
}

/// The fixed column set of the output table, derived from the configured
/// grisms and position angles.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
    beams: Vec<BeamKey>,
}

impl OutputSchema {
    pub fn new(beams: Vec<BeamKey>) -> Self {
        let mut columns = Vec::new();
        let mut push = |name: String, kind: ColumnKind, required: bool| {
            columns.push(Column {
                name,
                kind,
                required,
            })
        };

        push(ID.into(), ColumnKind::Text, true);
        push(SEG_ID.into(), ColumnKind::Int, true);
        push(RA.into(), ColumnKind::Float, true);
        push(DEC.into(), ColumnKind::Float, true);
        for beam in &beams {
            for field in [BeamField::Quality, BeamField::Coverage] {
                push(field.column(beam), field.kind(), true);
            }
        }
        push(GRIZLI_REDSHIFT.into(), ColumnKind::Float, true);
        push(ESTIMATED_REDSHIFT.into(), ColumnKind::Float, true);

        push(UNRELIABLE_REDSHIFT.into(), ColumnKind::Bool, false);
        push(BAD_SEG_MAP.into(), ColumnKind::Bool, false);
        push(COMMENTS.into(), ColumnKind::Text, false);
        for beam in &beams {
            let field = BeamField::Contamination;
            push(field.column(beam), field.kind(), false);
        }

        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Self {
            columns,
            by_name,
            beams,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.beam_keys())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn beams(&self) -> &[BeamKey] {
        &self.beams
    }

    pub fn has_beam(&self, beam: &BeamKey) -> bool {
        self.beams.contains(beam)
    }

    /// Number of fields a record needs before it may be committed.
    pub fn required_count(&self) -> usize {
        self.columns.iter().filter(|c| c.required).count()
    }

    /// Required columns absent from `record`, in schema order.
    pub fn missing(&self, record: &FlatRecord) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.required && !record.contains_key(&c.name))
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Keys of `record` the table has no column for.
    pub fn unknown<'r>(&self, record: &'r FlatRecord) -> Vec<&'r str> {
        record
            .keys()
            .filter(|k| !self.by_name.contains_key(k.as_str()))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_has_eighteen_required_columns() {
        let schema = OutputSchema::from_config(&AppConfig::default());
        assert_eq!(schema.required_count(), 18);
        let names: Vec<&str> = schema
            .columns()
            .iter()
            .filter(|c| c.required)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(&names[..6], &["ID", "SEG_ID", "RA", "DEC", "F115W,72.0_QUALITY", "F115W,72.0_COVERAGE"]);
        assert_eq!(names[16], "GRIZLI_REDSHIFT");
        assert_eq!(names[17], "ESTIMATED_REDSHIFT");
    }

    #[test]
    fn test_required_count_tracks_beam_count() {
        let schema = OutputSchema::new(vec![BeamKey::new("F200W", "10.0")]);
        assert_eq!(schema.required_count(), 8);
        assert!(schema.column("F200W,10.0_CONTAMINATION").is_some_and(|c| !c.required));
    }

    #[test]
    fn test_missing_and_unknown() {
        let schema = OutputSchema::new(vec![]);
        let mut record = FlatRecord::new();
        record.insert("ID".into(), "1".into());
        record.insert("BOGUS".into(), 1i64.into());
        assert_eq!(
            schema.missing(&record),
            vec!["SEG_ID", "RA", "DEC", "GRIZLI_REDSHIFT", "ESTIMATED_REDSHIFT"]
        );
        assert_eq!(schema.unknown(&record), vec!["BOGUS"]);
    }
}
