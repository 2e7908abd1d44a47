//! Beam view / Spec view state machine.
//!
//! Paging order for one object is Beam(PA 1) → Beam(PA 2) → Spec, then on to
//! the next object. The composite "all PAs" beam view sits beside PA 2.
//! Leaving an object is the only moment its record is persisted.

use thiserror::Error;

use crate::state::ObjectState;
use crate::store::CommitOutcome;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavError {
    #[error("Already at the first object")]
    OutOfRange,
    #[error("Unknown object id: {0}")]
    UnknownId(String),
    #[error("No object selected")]
    NoCurrentObject,
}

/// Which beams the Beam view shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaView {
    First,
    Second,
    /// Both position angles side by side.
    All,
}

impl PaView {
    pub fn index(self) -> usize {
        match self {
            PaView::First => 0,
            PaView::Second => 1,
            PaView::All => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Beam(PaView),
    Spec,
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            View::Beam(PaView::All) => write!(f, "Beam view (all PAs)"),
            View::Beam(pa) => write!(f, "Beam view (PA {})", pa.index() + 1),
            View::Spec => write!(f, "Spec view"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Previous,
    Next,
}

/// Where keyboard input is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Main,
    /// A text box owns the arrow keys.
    TextEntry,
}

/// Result of trying to persist the record of the object being left.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitStatus {
    Written(CommitOutcome),
    /// The record still lacks required fields.
    NotReady { missing: Vec<String> },
    /// Session is not writing output.
    ReadOnly,
    /// The operator chose not to overwrite an earlier classification.
    Declined,
    Failed(String),
    NoObject,
}

/// Persists the current record. Failures are reported in the status, never
/// raised: a lost write must not stop navigation.
pub trait Persist {
    fn persist(&mut self, state: &ObjectState) -> CommitStatus;
}

/// What a navigation request did.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: View,
    pub to: View,
    pub object_changed: bool,
    /// Present when the transition crossed an object boundary.
    pub commit: Option<CommitStatus>,
    pub error: Option<NavError>,
    /// Input focus should return to the main window.
    pub refocus: bool,
}

impl Transition {
    fn stay(view: View) -> Self {
        Self {
            from: view,
            to: view,
            object_changed: false,
            commit: None,
            error: None,
            refocus: false,
        }
    }

    fn view_change(from: View, to: View) -> Self {
        Self {
            to,
            ..Self::stay(from)
        }
    }

    fn rejected(view: View, error: NavError) -> Self {
        log::warn!("Navigation ignored: {}", error);
        Self {
            error: Some(error),
            ..Self::stay(view)
        }
    }
}

#[derive(Debug)]
pub struct NavigationController {
    view: View,
}

impl Default for NavigationController {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationController {
    pub fn new() -> Self {
        Self {
            view: View::Beam(PaView::First),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Direct view selection (tab or PA menu). Never touches the object.
    pub fn set_view(&mut self, view: View) {
        self.view = view;
    }

    pub fn previous(&mut self, state: &mut ObjectState, persist: &mut dyn Persist) -> Transition {
        let from = self.view;
        let to = match from {
            View::Beam(PaView::First) => {
                let Some(index) = state.current_index() else {
                    return Transition::rejected(from, NavError::NoCurrentObject);
                };
                if index == 0 {
                    return Transition::rejected(from, NavError::OutOfRange);
                }
                return self.change_object(state, persist, index - 1, View::Spec);
            }
            View::Beam(PaView::Second) => View::Beam(PaView::First),
            View::Beam(PaView::All) => View::Beam(PaView::Second),
            View::Spec => View::Beam(PaView::Second),
        };
        self.view = to;
        Transition::view_change(from, to)
    }

    pub fn next(&mut self, state: &mut ObjectState, persist: &mut dyn Persist) -> Transition {
        let from = self.view;
        let to = match from {
            View::Beam(PaView::First) => View::Beam(PaView::Second),
            View::Beam(PaView::Second) | View::Beam(PaView::All) => View::Spec,
            View::Spec => {
                let Some(index) = state.current_index() else {
                    return Transition::rejected(from, NavError::NoCurrentObject);
                };
                let target = (index + 1) % state.worklist().len();
                return self.change_object(state, persist, target, View::Beam(PaView::First));
            }
        };
        self.view = to;
        Transition::view_change(from, to)
    }

    /// Arrow-key dispatch. Ignored while a text box has focus.
    pub fn handle_key(
        &mut self,
        direction: Direction,
        focus: Focus,
        state: &mut ObjectState,
        persist: &mut dyn Persist,
    ) -> Option<Transition> {
        if focus == Focus::TextEntry {
            return None;
        }
        Some(match direction {
            Direction::Previous => self.previous(state, persist),
            Direction::Next => self.next(state, persist),
        })
    }

    /// Go straight to `id` (typed id or search result) in Spec view.
    /// An unknown id changes nothing and persists nothing.
    pub fn jump_to(&mut self, id: &str, state: &mut ObjectState, persist: &mut dyn Persist) -> Transition {
        let Some(index) = state.worklist().index_of(id) else {
            return Transition::rejected(self.view, NavError::UnknownId(id.to_string()));
        };
        let mut transition = self.change_object(state, persist, index, View::Spec);
        transition.refocus = true;
        transition
    }

    fn change_object(
        &mut self,
        state: &mut ObjectState,
        persist: &mut dyn Persist,
        index: usize,
        to: View,
    ) -> Transition {
        let from = self.view;
        let commit = persist.persist(state);
        match &commit {
            CommitStatus::Written(outcome) => log::info!("Saved classification ({:?})", outcome),
            CommitStatus::Failed(e) => log::warn!("Classification not saved: {}", e),
            other => log::debug!("Classification not saved: {:?}", other),
        }

        let error = match state.select_index(index) {
            Ok(_) => None,
            Err(e) => {
                log::warn!("Could not select worklist index {}: {}", index, e);
                Some(NavError::OutOfRange)
            }
        };
        if error.is_none() {
            self.view = to;
        }
        Transition {
            from,
            to: self.view,
            object_changed: error.is_none(),
            commit: Some(commit),
            error,
            refocus: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::worklist::tests::sample_worklist;
    use crate::config::AppConfig;
    use crate::record::FlatRecord;
    use crate::store::schema::OutputSchema;
    use std::sync::Arc;

    /// Captures what would have been written.
    #[derive(Default)]
    struct Capture {
        records: Vec<FlatRecord>,
    }

    impl Persist for Capture {
        fn persist(&mut self, state: &ObjectState) -> CommitStatus {
            self.records.push(state.flatten_record());
            CommitStatus::Written(CommitOutcome::Inserted)
        }
    }

    struct Failing;

    impl Persist for Failing {
        fn persist(&mut self, _state: &ObjectState) -> CommitStatus {
            CommitStatus::Failed("disk full".into())
        }
    }

    fn setup(start: &str) -> (NavigationController, ObjectState) {
        let mut state = ObjectState::new(
            Arc::new(sample_worklist()),
            OutputSchema::from_config(&AppConfig::default()),
        );
        state.select(start).unwrap();
        (NavigationController::new(), state)
    }

    fn seg_id(record: &FlatRecord) -> i64 {
        record["SEG_ID"].as_i64().unwrap()
    }

    #[test]
    fn test_next_from_spec_commits_and_advances() {
        let (mut nav, mut state) = setup("00011");
        nav.set_view(View::Spec);
        let mut capture = Capture::default();

        let t = nav.next(&mut state, &mut capture);
        assert_eq!(capture.records.len(), 1);
        assert_eq!(seg_id(&capture.records[0]), 11);
        assert_eq!(state.current().unwrap().id, "00012");
        assert_eq!(nav.view(), View::Beam(PaView::First));
        assert!(t.object_changed);
        assert_eq!(t.commit, Some(CommitStatus::Written(CommitOutcome::Inserted)));
    }

    #[test]
    fn test_full_forward_cycle() {
        let (mut nav, mut state) = setup("00010");
        let mut capture = Capture::default();

        nav.next(&mut state, &mut capture);
        assert_eq!(nav.view(), View::Beam(PaView::Second));
        nav.next(&mut state, &mut capture);
        assert_eq!(nav.view(), View::Spec);
        assert!(capture.records.is_empty());
        assert_eq!(state.current().unwrap().id, "00010");

        nav.set_view(View::Beam(PaView::All));
        nav.next(&mut state, &mut capture);
        assert_eq!(nav.view(), View::Spec);
    }

    #[test]
    fn test_next_wraps_to_first() {
        let (mut nav, mut state) = setup("00012");
        nav.set_view(View::Spec);
        let t = nav.next(&mut state, &mut Capture::default());
        assert_eq!(state.current_index(), Some(0));
        assert_eq!(state.current().unwrap().id, "00010");
        assert!(t.error.is_none());
    }

    #[test]
    fn test_previous_at_first_object_is_noop() {
        let (mut nav, mut state) = setup("00010");
        let mut capture = Capture::default();
        let t = nav.previous(&mut state, &mut capture);
        assert_eq!(t.error, Some(NavError::OutOfRange));
        assert!(t.commit.is_none());
        assert!(capture.records.is_empty());
        assert_eq!(state.current().unwrap().id, "00010");
        assert_eq!(nav.view(), View::Beam(PaView::First));
    }

    #[test]
    fn test_previous_transitions() {
        let (mut nav, mut state) = setup("00011");
        let mut capture = Capture::default();

        nav.set_view(View::Spec);
        nav.previous(&mut state, &mut capture);
        assert_eq!(nav.view(), View::Beam(PaView::Second));
        nav.set_view(View::Beam(PaView::All));
        nav.previous(&mut state, &mut capture);
        assert_eq!(nav.view(), View::Beam(PaView::Second));
        nav.previous(&mut state, &mut capture);
        assert_eq!(nav.view(), View::Beam(PaView::First));
        assert!(capture.records.is_empty());

        let t = nav.previous(&mut state, &mut capture);
        assert!(t.object_changed);
        assert_eq!(seg_id(&capture.records[0]), 11);
        assert_eq!(state.current().unwrap().id, "00010");
        assert_eq!(nav.view(), View::Spec);
    }

    #[test]
    fn test_failed_commit_does_not_block() {
        let (mut nav, mut state) = setup("00010");
        nav.set_view(View::Spec);
        let t = nav.next(&mut state, &mut Failing);
        assert_eq!(t.commit, Some(CommitStatus::Failed("disk full".into())));
        assert!(t.object_changed);
        assert_eq!(state.current().unwrap().id, "00011");
    }

    #[test]
    fn test_keys_ignored_in_text_entry() {
        let (mut nav, mut state) = setup("00010");
        let mut capture = Capture::default();
        assert!(
            nav.handle_key(Direction::Next, Focus::TextEntry, &mut state, &mut capture)
                .is_none()
        );
        assert_eq!(nav.view(), View::Beam(PaView::First));
        let t = nav
            .handle_key(Direction::Next, Focus::Main, &mut state, &mut capture)
            .unwrap();
        assert_eq!(t.to, View::Beam(PaView::Second));
    }

    #[test]
    fn test_jump_to() {
        let (mut nav, mut state) = setup("00010");
        let mut capture = Capture::default();

        let t = nav.jump_to("00042", &mut state, &mut capture);
        assert_eq!(t.error, Some(NavError::UnknownId("00042".into())));
        assert!(capture.records.is_empty());
        assert_eq!(state.current().unwrap().id, "00010");

        let t = nav.jump_to("00012", &mut state, &mut capture);
        assert!(t.refocus);
        assert_eq!(seg_id(&capture.records[0]), 10);
        assert_eq!(state.current().unwrap().id, "00012");
        assert_eq!(nav.view(), View::Spec);
    }
}
