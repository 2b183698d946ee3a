//! Change sources
//!
//! Anything that reports tree changes to the engine: the primary watcher,
//! the root-level backup watcher and the per-scope nested watchers. The
//! engine connects, polls and disconnects them; it never owns the tree
//! they watch.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use fco_dom::{MutationRecord, NodeId};
use serde::Serialize;

use crate::error::SourceError;
use crate::event::ChangeEvent;

/// Where a change event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Fine-grained watcher over the whole document
    Primary,
    /// Root-level watcher for direct structural changes only
    Backup,
    /// Watcher attached to an encapsulated sub-tree
    Nested,
    /// Periodic, forced or polling re-scan
    Rescan,
    /// Off-screen candidate that approached the viewport
    Lazy,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Primary,
        SourceKind::Backup,
        SourceKind::Nested,
        SourceKind::Rescan,
        SourceKind::Lazy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Backup => "backup",
            SourceKind::Nested => "nested",
            SourceKind::Rescan => "rescan",
            SourceKind::Lazy => "lazy",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live change-notification mechanism
pub trait ChangeSource {
    /// What this source reports as
    fn kind(&self) -> SourceKind;

    /// Start watching `scope`
    fn connect(&mut self, scope: NodeId) -> Result<(), SourceError>;

    /// Stop watching and drop anything buffered
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Records gathered since the last call
    fn take_records(&mut self) -> Result<Vec<ChangeEvent>, SourceError>;
}

/// Builds sources on demand (initial setup, nested scopes, reconnects)
pub trait SourceFactory {
    fn create(&mut self, kind: SourceKind) -> Result<Box<dyn ChangeSource>, SourceError>;
}

#[derive(Debug, Default)]
struct FeedState {
    connected: bool,
    scope: Option<NodeId>,
    records: VecDeque<ChangeEvent>,
    connects: usize,
    disconnects: usize,
    refuse_connect: bool,
    pending_failure: Option<SourceError>,
}

/// Source fed by the host through a [`FeedHandle`]
#[derive(Debug)]
pub struct FeedSource {
    kind: SourceKind,
    state: Rc<RefCell<FeedState>>,
}

/// Host side of a [`FeedSource`]
#[derive(Debug, Clone)]
pub struct FeedHandle {
    kind: SourceKind,
    state: Rc<RefCell<FeedState>>,
}

impl FeedSource {
    pub fn new(kind: SourceKind) -> (FeedSource, FeedHandle) {
        let state = Rc::new(RefCell::new(FeedState::default()));
        (
            FeedSource {
                kind,
                state: Rc::clone(&state),
            },
            FeedHandle { kind, state },
        )
    }
}

impl ChangeSource for FeedSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn connect(&mut self, scope: NodeId) -> Result<(), SourceError> {
        let mut state = self.state.borrow_mut();
        if state.refuse_connect {
            return Err(SourceError::ConnectFailed {
                kind: self.kind,
                reason: "feed refused connection".into(),
            });
        }
        state.connected = true;
        state.scope = Some(scope);
        state.connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
        }
        state.records.clear();
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn take_records(&mut self) -> Result<Vec<ChangeEvent>, SourceError> {
        let mut state = self.state.borrow_mut();
        if let Some(err) = state.pending_failure.take() {
            return Err(err);
        }
        Ok(state.records.drain(..).collect())
    }
}

impl FeedHandle {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Queue an event; dropped when the source is disconnected
    pub fn push(&self, event: ChangeEvent) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            return false;
        }
        state.records.push_back(event.with_source(self.kind));
        true
    }

    /// Queue every event derived from DOM mutation records
    pub fn push_records(&self, records: Vec<MutationRecord>) -> usize {
        records
            .into_iter()
            .flat_map(|record| ChangeEvent::from_record(record, self.kind))
            .filter(|event| self.push(event.clone()))
            .count()
    }

    /// Make the next `take_records` fail
    pub fn fail_next(&self, error: SourceError) {
        self.state.borrow_mut().pending_failure = Some(error);
    }

    /// Refuse future connection attempts
    pub fn refuse_connect(&self, refuse: bool) {
        self.state.borrow_mut().refuse_connect = refuse;
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn scope(&self) -> Option<NodeId> {
        self.state.borrow().scope
    }

    pub fn connect_count(&self) -> usize {
        self.state.borrow().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.borrow().disconnects
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    created: Vec<FeedHandle>,
    unavailable: Vec<SourceKind>,
}

/// Factory producing [`FeedSource`]s and keeping their handles for the host
#[derive(Debug, Clone, Default)]
pub struct FeedFactory {
    state: Rc<RefCell<FactoryState>>,
}

impl FeedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail for `kind` until re-enabled
    pub fn set_unavailable(&self, kind: SourceKind, unavailable: bool) {
        let mut state = self.state.borrow_mut();
        state.unavailable.retain(|&k| k != kind);
        if unavailable {
            state.unavailable.push(kind);
        }
    }

    /// Most recently created handle of `kind`
    pub fn latest(&self, kind: SourceKind) -> Option<FeedHandle> {
        self.state
            .borrow()
            .created
            .iter()
            .rev()
            .find(|h| h.kind == kind)
            .cloned()
    }

    /// Every handle ever created, in creation order
    pub fn handles(&self) -> Vec<FeedHandle> {
        self.state.borrow().created.clone()
    }

    /// Handle whose source is connected to `scope`
    pub fn for_scope(&self, kind: SourceKind, scope: NodeId) -> Option<FeedHandle> {
        self.state
            .borrow()
            .created
            .iter()
            .rev()
            .find(|h| h.kind == kind && h.scope() == Some(scope))
            .cloned()
    }

    /// Sources currently connected
    pub fn open_connections(&self) -> usize {
        self.state
            .borrow()
            .created
            .iter()
            .filter(|h| h.is_connected())
            .count()
    }
}

impl SourceFactory for FeedFactory {
    fn create(&mut self, kind: SourceKind) -> Result<Box<dyn ChangeSource>, SourceError> {
        let mut state = self.state.borrow_mut();
        if state.unavailable.contains(&kind) {
            return Err(SourceError::Unavailable {
                kind,
                reason: "source disabled by host".into(),
            });
        }
        let (source, handle) = FeedSource::new(kind);
        state.created.push(handle);
        Ok(Box::new(source))
    }
}
