//! A classification session: worklist, current object, navigation and the
//! output table wired together on one thread.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::cache::SpectrumCache;
use crate::catalogue::CatalogueError;
use crate::catalogue::extractions::CancelToken;
use crate::catalogue::worklist::{self, BuildReport, BuildRequest, Worklist};
use crate::config::{AppConfig, ConfigError};
use crate::navigation::{
    CommitStatus, Direction, Focus, NavigationController, PaView, Persist, Transition, View,
};
use crate::record::FieldValue;
use crate::rescan::{BuildOutcome, Rescanner};
use crate::search::{SearchError, SearchResolver, SkyMatch};
use crate::state::{CurrentObject, ObjectState, RecordField, StateError};
use crate::store::schema::OutputSchema;
use crate::store::{OutputStore, StoreError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error("Output table error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Search(#[from] SearchError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Whether leaving an object writes its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    ReadOnly,
    WriteOutput,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::ReadOnly => write!(f, "Read-only"),
            WriteMode::WriteOutput => write!(f, "Write output"),
        }
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "read-only" | "ro" => Ok(WriteMode::ReadOnly),
            "write" | "write-output" | "rw" => Ok(WriteMode::WriteOutput),
            other => Err(format!("Unknown mode {other:?} (expected read or write)")),
        }
    }
}

/// Asks the operator before an earlier classification is replaced.
pub trait OverwritePrompt {
    /// `true` to overwrite, `false` to keep the stored row.
    fn confirm_overwrite(&mut self, id: &str, seg_id: i64) -> bool;
}

/// Never overwrites.
#[derive(Debug, Default)]
pub struct KeepExisting;

impl OverwritePrompt for KeepExisting {
    fn confirm_overwrite(&mut self, _id: &str, _seg_id: i64) -> bool {
        false
    }
}

/// Writes the current record to the output table, asking before replacing
/// an existing row.
pub struct OutputPersister<'a> {
    store: &'a mut OutputStore,
    mode: WriteMode,
    prompt: &'a mut dyn OverwritePrompt,
}

impl<'a> OutputPersister<'a> {
    pub fn new(
        store: &'a mut OutputStore,
        mode: WriteMode,
        prompt: &'a mut dyn OverwritePrompt,
    ) -> Self {
        Self {
            store,
            mode,
            prompt,
        }
    }
}

impl Persist for OutputPersister<'_> {
    fn persist(&mut self, state: &ObjectState) -> CommitStatus {
        let Some(current) = state.current() else {
            return CommitStatus::NoObject;
        };
        if self.mode == WriteMode::ReadOnly {
            return CommitStatus::ReadOnly;
        }
        if !state.is_complete() {
            return CommitStatus::NotReady {
                missing: state.missing_fields(),
            };
        }

        let record = state.flatten_record();
        let outcome = match self.store.commit(&record, false) {
            Err(StoreError::Conflict { seg_id }) => {
                log::warn!("Object {} (seg id {}) is already classified", current.id, seg_id);
                if !self.prompt.confirm_overwrite(&current.id, seg_id) {
                    return CommitStatus::Declined;
                }
                self.store.commit(&record, true)
            }
            other => other,
        };
        match outcome {
            Ok(outcome) => CommitStatus::Written(outcome),
            Err(StoreError::Incomplete { missing }) => CommitStatus::NotReady { missing },
            Err(e) => CommitStatus::Failed(e.to_string()),
        }
    }
}

pub struct Session {
    config: AppConfig,
    state: ObjectState,
    nav: NavigationController,
    store: OutputStore,
    mode: WriteMode,
    prompt: Box<dyn OverwritePrompt>,
    rescanner: Rescanner,
    cache: SpectrumCache,
    report: BuildReport,
}

impl Session {
    /// Load the output table, build the worklist and select its first
    /// object. An empty worklist is `CatalogueError::EmptyWorklist`.
    pub fn open(config: AppConfig, prompt: Box<dyn OverwritePrompt>) -> Result<Self> {
        config.validate_paths()?;
        let store = OutputStore::load(&config.output_path(), OutputSchema::from_config(&config))?;
        let mut request = BuildRequest::from_config(&config, skip_ids(&config, &store)?);
        request.progress = true;
        let (worklist, report) = worklist::build(&request, &CancelToken::new())?;
        let mut session = Self::from_parts(config, worklist, store, prompt)?;
        session.report = report;
        Ok(session)
    }

    pub fn from_parts(
        config: AppConfig,
        worklist: Worklist,
        store: OutputStore,
        prompt: Box<dyn OverwritePrompt>,
    ) -> Result<Self> {
        let mut state = ObjectState::new(Arc::new(worklist), store.schema().clone());
        state.select_index(0)?;
        Ok(Self {
            cache: SpectrumCache::from_config(&config),
            config,
            state,
            nav: NavigationController::new(),
            store,
            mode: WriteMode::default(),
            prompt,
            rescanner: Rescanner::new(),
            report: BuildReport::default(),
        })
    }

    fn navigate(
        &mut self,
        step: impl FnOnce(&mut NavigationController, &mut ObjectState, &mut dyn Persist) -> Transition,
    ) -> Transition {
        let mut persister = OutputPersister::new(&mut self.store, self.mode, self.prompt.as_mut());
        step(&mut self.nav, &mut self.state, &mut persister)
    }

    pub fn next(&mut self) -> Transition {
        self.navigate(|nav, state, persist| nav.next(state, persist))
    }

    pub fn previous(&mut self) -> Transition {
        self.navigate(|nav, state, persist| nav.previous(state, persist))
    }

    pub fn key(&mut self, direction: Direction, focus: Focus) -> Option<Transition> {
        let mut persister = OutputPersister::new(&mut self.store, self.mode, self.prompt.as_mut());
        self.nav
            .handle_key(direction, focus, &mut self.state, &mut persister)
    }

    pub fn jump_to(&mut self, id: &str) -> Transition {
        self.navigate(|nav, state, persist| nav.jump_to(id, state, persist))
    }

    /// Resolve a typed coordinate and jump to the nearest object.
    pub fn search_sky(&mut self, text: &str) -> Result<(SkyMatch, Transition)> {
        let found = SearchResolver::new(self.state.worklist()).resolve_sky_coordinate(text)?;
        let transition = self.jump_to(&found.id);
        Ok((found, transition))
    }

    pub fn set_view(&mut self, view: View) {
        self.nav.set_view(view);
    }

    /// Persist the current record without leaving the object.
    pub fn save(&mut self) -> CommitStatus {
        let mut persister = OutputPersister::new(&mut self.store, self.mode, self.prompt.as_mut());
        persister.persist(&self.state)
    }

    pub fn record(&mut self, field: &RecordField, value: FieldValue) -> Result<()> {
        Ok(self.state.record_field(field, value)?)
    }

    /// Record operator text for the field named `name`, parsed by the
    /// field's column type.
    pub fn record_str(&mut self, name: &str, raw: &str) -> Result<()> {
        let field: RecordField = name.parse()?;
        let column = field.column();
        let kind = self
            .store
            .schema()
            .column(&column)
            .map(|c| c.kind)
            .ok_or_else(|| StateError::UnknownField(name.to_string()))?;
        let value = FieldValue::parse_as(raw, kind).ok_or(StateError::TypeMismatch {
            column,
            expected: kind.label(),
        })?;
        self.record(&field, value)
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: WriteMode) {
        log::info!("Output mode: {}", mode);
        self.mode = mode;
    }

    /// Start rebuilding the worklist in the background.
    pub fn rescan(&mut self) -> Result<u64> {
        let request = BuildRequest::from_config(&self.config, skip_ids(&self.config, &self.store)?);
        Ok(self.rescanner.start(request))
    }

    pub fn rescan_running(&self) -> bool {
        self.rescanner.is_running()
    }

    /// Apply a finished rescan, if there is one.
    pub fn poll_rescan(&mut self) -> Option<Result<BuildReport>> {
        let outcome = self.rescanner.try_recv()?;
        Some(self.apply_rescan(outcome))
    }

    pub fn wait_rescan(&mut self, timeout: Duration) -> Option<Result<BuildReport>> {
        let outcome = self.rescanner.wait(timeout)?;
        Some(self.apply_rescan(outcome))
    }

    /// Swap in a rebuilt worklist. The current record is persisted first
    /// and kept in progress when its object survives the rebuild. A failed
    /// build leaves the current worklist in place.
    pub fn apply_rescan(&mut self, outcome: BuildOutcome) -> Result<BuildReport> {
        let (worklist, report) = outcome?;
        let status = self.save();
        log::debug!("Before rescan: {:?}", status);
        self.state.replace_worklist(Arc::new(worklist))?;
        self.report = report.clone();
        Ok(report)
    }

    pub fn current(&self) -> Option<&CurrentObject> {
        self.state.current()
    }

    pub fn state(&self) -> &ObjectState {
        &self.state
    }

    pub fn view(&self) -> View {
        self.nav.view()
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn spectrum_cache(&mut self) -> &mut SpectrumCache {
        &mut self.cache
    }
}

fn skip_ids(config: &AppConfig, store: &OutputStore) -> Result<HashSet<i64>> {
    if config.files.skip_existing {
        Ok(store.seg_ids()?)
    } else {
        Ok(HashSet::new())
    }
}

/// A line of operator input in the terminal session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Next,
    Previous,
    Jump(String),
    Sky(String),
    View(View),
    Mode(WriteMode),
    Set { field: String, value: String },
    Save,
    Show,
    Rescan,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let need = |what: &str| -> std::result::Result<String, String> {
            if rest.is_empty() {
                Err(format!("{word} needs {what}"))
            } else {
                Ok(rest.to_string())
            }
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "n" | "next" | "right" => Command::Next,
            "p" | "prev" | "previous" | "left" => Command::Previous,
            "j" | "jump" | "id" => Command::Jump(need("an object id")?),
            "sky" | "coord" => Command::Sky(need("a coordinate")?),
            "view" => Command::View(match rest.to_ascii_lowercase().as_str() {
                "beam" | "beam1" | "pa1" => View::Beam(PaView::First),
                "beam2" | "pa2" => View::Beam(PaView::Second),
                "all" | "beams" => View::Beam(PaView::All),
                "spec" => View::Spec,
                other => return Err(format!("Unknown view {other:?} (beam1, beam2, all, spec)")),
            }),
            "mode" => Command::Mode(need("read or write")?.parse()?),
            "set" => {
                let args = need("a field and a value")?;
                let (field, value) = args
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| format!("set {args} needs a value"))?;
                Command::Set {
                    field: field.to_string(),
                    value: value.trim().to_string(),
                }
            }
            "save" | "w" => Command::Save,
            "show" | "s" | "" => Command::Show,
            "rescan" => Command::Rescan,
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            other => return Err(format!("Unknown command {other:?}, try help")),
        };
        Ok(command)
    }
}

pub const HELP: &str = "\
next | n            next view, or next object from Spec view
prev | p            previous view, or previous object from the first beam view
jump <id>           go to an object id
sky <coordinate>    go to the object nearest a sky position
view beam1|beam2|all|spec
set <field> <value> e.g. set estimated_redshift 1.52, set F115W,72.0_quality Good
mode read|write     toggle writing classifications
save                write the current record now
show                print the current object and record
rescan              rebuild the worklist in the background
quit";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::worklist::tests::sample_worklist;
    use crate::store::CommitOutcome;
    use crate::store::schema::BeamField;

    struct Scripted(Vec<bool>);

    impl OverwritePrompt for Scripted {
        fn confirm_overwrite(&mut self, _id: &str, _seg_id: i64) -> bool {
            self.0.remove(0)
        }
    }

    fn session(prompt: Box<dyn OverwritePrompt>) -> Session {
        let config = AppConfig::default();
        let store = OutputStore::open_in_memory(OutputSchema::from_config(&config)).unwrap();
        Session::from_parts(config, sample_worklist(), store, prompt).unwrap()
    }

    fn classify(session: &mut Session, z: f64) {
        for beam in session.state().schema().beams().to_vec() {
            session
                .record(&RecordField::beam(beam.clone(), BeamField::Quality), "Good".into())
                .unwrap();
            session
                .record(&RecordField::beam(beam, BeamField::Coverage), 0.8.into())
                .unwrap();
        }
        session.record(&RecordField::GrizliRedshift, 1.1.into()).unwrap();
        session.record(&RecordField::EstimatedRedshift, z.into()).unwrap();
    }

    #[test]
    fn test_starts_read_only_on_first_object() {
        let mut s = session(Box::new(KeepExisting));
        assert_eq!(s.mode(), WriteMode::ReadOnly);
        assert_eq!(s.current().unwrap().id, "00010");
        classify(&mut s, 1.2);
        assert_eq!(s.save(), CommitStatus::ReadOnly);
        assert!(s.store().is_empty().unwrap());
    }

    #[test]
    fn test_end_to_end_next_commits() {
        let mut s = session(Box::new(KeepExisting));
        s.set_mode(WriteMode::WriteOutput);
        s.jump_to("00011");
        assert_eq!(s.view(), View::Spec);
        classify(&mut s, 1.3);

        let t = s.next();
        assert_eq!(t.commit, Some(CommitStatus::Written(CommitOutcome::Inserted)));
        assert_eq!(s.current().unwrap().id, "00012");
        assert_eq!(s.view(), View::Beam(PaView::First));
        let row = s.store().get(11).unwrap().unwrap();
        assert_eq!(row["ESTIMATED_REDSHIFT"], FieldValue::Float(1.3));
    }

    #[test]
    fn test_incomplete_record_is_not_ready() {
        let mut s = session(Box::new(KeepExisting));
        s.set_mode(WriteMode::WriteOutput);
        s.record(&RecordField::EstimatedRedshift, 2.0.into()).unwrap();
        match s.save() {
            CommitStatus::NotReady { missing } => assert_eq!(missing.len(), 13),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_conflict_prompts_before_overwrite() {
        let mut s = session(Box::new(Scripted(vec![false, true])));
        s.set_mode(WriteMode::WriteOutput);
        classify(&mut s, 1.0);
        assert_eq!(s.save(), CommitStatus::Written(CommitOutcome::Inserted));

        classify(&mut s, 2.0);
        assert_eq!(s.save(), CommitStatus::Declined);
        let row = s.store().get(10).unwrap().unwrap();
        assert_eq!(row["ESTIMATED_REDSHIFT"], FieldValue::Float(1.0));

        assert_eq!(s.save(), CommitStatus::Written(CommitOutcome::Replaced));
        let row = s.store().get(10).unwrap().unwrap();
        assert_eq!(row["ESTIMATED_REDSHIFT"], FieldValue::Float(2.0));
    }

    #[test]
    fn test_search_sky_jumps() {
        let mut s = session(Box::new(KeepExisting));
        let (found, t) = s.search_sky("10.002 -30.001").unwrap();
        assert_eq!(found.id, "00012");
        assert!(t.refocus);
        assert_eq!(s.current().unwrap().id, "00012");
        assert!(matches!(
            s.search_sky("not a place"),
            Err(SessionError::Search(SearchError::Parse(_)))
        ));
        assert_eq!(s.current().unwrap().id, "00012");
    }

    #[test]
    fn test_record_str() {
        let mut s = session(Box::new(KeepExisting));
        s.record_str("unreliable_redshift", "yes").unwrap();
        s.record_str("f150w,341_contamination", "Strong").unwrap();
        let flat = s.state().flatten_record();
        assert_eq!(flat["UNRELIABLE_REDSHIFT"], FieldValue::Bool(true));
        assert_eq!(flat["F150W,341.0_CONTAMINATION"], FieldValue::Text("Strong".into()));
        assert!(matches!(
            s.record_str("estimated_redshift", "soon"),
            Err(SessionError::State(StateError::TypeMismatch { .. }))
        ));
        assert!(matches!(
            s.record_str("ra", "1.0"),
            Err(SessionError::State(StateError::ReservedField(_)))
        ));
    }

    #[test]
    fn test_rescan_keeps_partial_record_of_surviving_object() {
        let mut s = session(Box::new(KeepExisting));
        s.record(&RecordField::Comments, "faint tail".into()).unwrap();
        s.record(&RecordField::EstimatedRedshift, 1.7.into()).unwrap();
        let before = s.state().flatten_record();
        assert_eq!(before.len(), 6);

        let report = s
            .apply_rescan(Ok((sample_worklist(), BuildReport::default())))
            .unwrap();
        assert_eq!(report, BuildReport::default());
        assert_eq!(s.current().unwrap().id, "00010");
        assert_eq!(s.state().flatten_record(), before);
        assert!(s.store().is_empty().unwrap());
    }

    #[test]
    fn test_apply_failed_rescan_keeps_worklist() {
        let mut s = session(Box::new(KeepExisting));
        let err = s.apply_rescan(Err(CatalogueError::EmptyWorklist)).unwrap_err();
        assert!(matches!(err, SessionError::Catalogue(CatalogueError::EmptyWorklist)));
        assert_eq!(s.state().worklist().len(), 3);
        assert_eq!(s.current().unwrap().id, "00010");
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("n".parse::<Command>(), Ok(Command::Next));
        assert_eq!("jump 00012".parse::<Command>(), Ok(Command::Jump("00012".into())));
        assert_eq!(
            "sky 10.0 -30.0".parse::<Command>(),
            Ok(Command::Sky("10.0 -30.0".into()))
        );
        assert_eq!(
            "view all".parse::<Command>(),
            Ok(Command::View(View::Beam(PaView::All)))
        );
        assert_eq!(
            "mode write".parse::<Command>(),
            Ok(Command::Mode(WriteMode::WriteOutput))
        );
        assert_eq!(
            "set comments tidal tail, maybe".parse::<Command>(),
            Ok(Command::Set {
                field: "comments".into(),
                value: "tidal tail, maybe".into()
            })
        );
        assert!("jump".parse::<Command>().is_err());
        assert!("set comments".parse::<Command>().is_err());
        assert!("view sideways".parse::<Command>().is_err());
        assert!("dance".parse::<Command>().is_err());
    }
}
