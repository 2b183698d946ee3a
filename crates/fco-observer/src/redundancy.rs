//! Redundancy Manager
//!
//! Supplementary change sources running beside the primary watcher: a
//! root-level backup watcher, one watcher per nested scope, periodic
//! catalogue re-scans and the lazy-visibility watcher. Everything they
//! report is tagged with its [`SourceKind`] and goes through the same filter
//! and queue as primary changes.

use std::collections::{BTreeMap, HashSet};

use fco_dom::{NodeId, Selector, TreeAccess, Viewport, descendants, find_scopes};

use crate::error::SourceError;
use crate::event::ChangeEvent;
use crate::source::{ChangeSource, SourceFactory, SourceKind};

/// Depth bound for full-document scans
pub const SCAN_DEPTH: usize = 64;

/// Nesting bound for scope discovery
const MAX_SCOPE_NESTING: usize = 8;

/// Connected change sources
#[derive(Default)]
pub(crate) struct Redundancy {
    primary: Option<Box<dyn ChangeSource>>,
    backup: Option<Box<dyn ChangeSource>>,
    nested: BTreeMap<NodeId, Box<dyn ChangeSource>>,
}

impl Redundancy {
    fn open(
        factory: &mut dyn SourceFactory,
        kind: SourceKind,
        scope: NodeId,
    ) -> Result<Box<dyn ChangeSource>, SourceError> {
        let mut source = factory.create(kind)?;
        source.connect(scope)?;
        tracing::debug!(%kind, %scope, "change source connected");
        Ok(source)
    }

    pub fn connect_primary(
        &mut self,
        factory: &mut dyn SourceFactory,
        root: NodeId,
    ) -> Result<(), SourceError> {
        self.disconnect_primary();
        self.primary = Some(Self::open(factory, SourceKind::Primary, root)?);
        Ok(())
    }

    pub fn connect_backup(
        &mut self,
        factory: &mut dyn SourceFactory,
        root: NodeId,
    ) -> Result<(), SourceError> {
        if let Some(mut old) = self.backup.take() {
            old.disconnect();
        }
        self.backup = Some(Self::open(factory, SourceKind::Backup, root)?);
        Ok(())
    }

    /// Attach a watcher to `scope`; `Ok(false)` when one is already there
    pub fn attach_nested(
        &mut self,
        factory: &mut dyn SourceFactory,
        scope: NodeId,
    ) -> Result<bool, SourceError> {
        if self.nested.contains_key(&scope) {
            return Ok(false);
        }
        let source = Self::open(factory, SourceKind::Nested, scope)?;
        self.nested.insert(scope, source);
        Ok(true)
    }

    /// Drop watchers whose scope left the tree
    pub fn prune_nested<T: TreeAccess + ?Sized>(&mut self, tree: &T) -> usize {
        let stale: Vec<NodeId> = self
            .nested
            .keys()
            .copied()
            .filter(|&scope| !tree.contains(scope))
            .collect();
        for scope in &stale {
            if let Some(mut source) = self.nested.remove(scope) {
                source.disconnect();
                tracing::debug!(%scope, "nested watcher detached");
            }
        }
        stale.len()
    }

    pub fn primary_connected(&self) -> bool {
        self.primary.as_ref().is_some_and(|s| s.is_connected())
    }

    /// Take pending events from every connected source
    pub fn collect(&mut self) -> (Vec<ChangeEvent>, Vec<SourceError>) {
        let mut events = Vec::new();
        let mut errors = Vec::new();
        let sources = self
            .primary
            .iter_mut()
            .chain(self.backup.iter_mut())
            .chain(self.nested.values_mut());
        for source in sources {
            if !source.is_connected() {
                continue;
            }
            match source.take_records() {
                Ok(mut batch) => events.append(&mut batch),
                Err(err) => errors.push(err),
            }
        }
        (events, errors)
    }

    pub fn disconnect_primary(&mut self) {
        if let Some(mut source) = self.primary.take() {
            source.disconnect();
            tracing::debug!("primary change source disconnected");
        }
    }

    /// Disconnect and drop every source
    pub fn disconnect_all(&mut self) {
        self.disconnect_primary();
        if let Some(mut source) = self.backup.take() {
            source.disconnect();
        }
        for (_, mut source) in std::mem::take(&mut self.nested) {
            source.disconnect();
        }
    }

    pub fn connected(&self) -> usize {
        self.primary
            .iter()
            .chain(self.backup.iter())
            .chain(self.nested.values())
            .filter(|s| s.is_connected())
            .count()
    }

    pub fn nested_scopes(&self) -> Vec<NodeId> {
        self.nested.keys().copied().collect()
    }
}

/// Every scope below `root`, nested scopes included, `root` first
pub(crate) fn discover_scopes<T: TreeAccess + ?Sized>(tree: &T, root: NodeId) -> Vec<NodeId> {
    let mut scopes = vec![root];
    let mut frontier = vec![root];
    for _ in 0..MAX_SCOPE_NESTING {
        let next: Vec<NodeId> = frontier
            .iter()
            .flat_map(|&scope| find_scopes(tree, scope, SCAN_DEPTH))
            .collect();
        if next.is_empty() {
            break;
        }
        scopes.extend(&next);
        frontier = next;
    }
    scopes
}

/// Elements in `scopes` matching any selector, in document order per scope
pub(crate) fn scan_targets<T: TreeAccess + ?Sized>(
    tree: &T,
    scopes: &[NodeId],
    selectors: &[Selector],
) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for &scope in scopes {
        for node in descendants(tree, scope, SCAN_DEPTH) {
            if selectors.iter().any(|sel| sel.matches(tree, node)) && seen.insert(node) {
                found.push(node);
            }
        }
    }
    found
}

/// Defers off-screen media until it nears the viewport
#[derive(Debug)]
pub(crate) struct LazyWatcher {
    active: bool,
    selector: Selector,
    margin_px: f32,
    parked: Vec<NodeId>,
}

impl LazyWatcher {
    pub fn new(selector: Selector, margin_px: f32) -> Self {
        Self {
            active: false,
            selector,
            margin_px,
            parked: Vec::new(),
        }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        if !active {
            self.parked.clear();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Candidate with a known box that is not yet near the viewport
    pub fn should_defer<T: TreeAccess + ?Sized>(
        &self,
        tree: &T,
        node: NodeId,
        viewport: &Viewport,
    ) -> bool {
        if !self.active || !self.selector.matches(tree, node) {
            return false;
        }
        match tree.visibility(node) {
            Some(layout) => {
                !layout.intrinsic_state().is_invisible()
                    && !layout.approaches(viewport, self.margin_px)
            }
            None => false,
        }
    }

    pub fn park(&mut self, node: NodeId) -> bool {
        if self.parked.contains(&node) {
            return false;
        }
        self.parked.push(node);
        true
    }

    /// Parked candidates now within the margin, removed from the park
    pub fn release<T: TreeAccess + ?Sized>(
        &mut self,
        tree: &T,
        viewport: &Viewport,
    ) -> Vec<NodeId> {
        let margin = self.margin_px;
        let mut released = Vec::new();
        self.parked.retain(|&node| {
            if !tree.contains(node) {
                return false;
            }
            let near = tree
                .visibility(node)
                .is_none_or(|layout| layout.approaches(viewport, margin));
            if near {
                released.push(node);
            }
            !near
        });
        released
    }

    pub fn purge_detached<T: TreeAccess + ?Sized>(&mut self, tree: &T) {
        self.parked.retain(|&node| tree.contains(node));
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn clear(&mut self) {
        self.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FeedFactory;
    use fco_dom::{DomTree, ElementVisibility};

    #[test]
    fn test_sources_connect_and_disconnect_in_pairs() {
        let mut factory = FeedFactory::new();
        let mut tree = DomTree::new();
        let root = tree.root();
        let host = tree.append_element(root, "div", &[]).unwrap();
        let scope = tree.attach_scope(host).unwrap();

        let mut redundancy = Redundancy::default();
        redundancy.connect_primary(&mut factory, root).unwrap();
        redundancy.connect_backup(&mut factory, root).unwrap();
        assert!(redundancy.attach_nested(&mut factory, scope).unwrap());
        assert!(!redundancy.attach_nested(&mut factory, scope).unwrap());
        assert_eq!(redundancy.connected(), 3);

        tree.remove(host).unwrap();
        assert_eq!(redundancy.prune_nested(&tree), 1);
        redundancy.disconnect_all();
        assert_eq!(redundancy.connected(), 0);
        for handle in factory.handles() {
            assert_eq!(handle.connect_count(), handle.disconnect_count());
        }
    }

    #[test]
    fn test_collect_reports_errors_per_source() {
        let mut factory = FeedFactory::new();
        let tree = DomTree::new();
        let mut redundancy = Redundancy::default();
        redundancy.connect_primary(&mut factory, tree.root()).unwrap();
        redundancy.connect_backup(&mut factory, tree.root()).unwrap();

        let primary = factory.latest(SourceKind::Primary).unwrap();
        let backup = factory.latest(SourceKind::Backup).unwrap();
        primary.push(ChangeEvent::insertion(tree.root()));
        backup.fail_next(SourceError::Disconnected {
            kind: SourceKind::Backup,
        });

        let (events, errors) = redundancy.collect();
        assert_eq!(events.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_scan_crosses_nested_scopes() {
        let mut tree = DomTree::new();
        let root = tree.root();
        let outer = tree.append_element(root, "div", &[("class", "post")]).unwrap();
        let host = tree.append_element(root, "div", &[]).unwrap();
        let scope = tree.attach_scope(host).unwrap();
        let inner_host = tree.append_element(scope, "div", &[]).unwrap();
        let inner_scope = tree.attach_scope(inner_host).unwrap();
        let inner = tree.append_element(inner_scope, "div", &[("class", "post")]).unwrap();

        let scopes = discover_scopes(&tree, root);
        assert_eq!(scopes, vec![root, scope, inner_scope]);
        let posts = scan_targets(&tree, &scopes, &[Selector::parse(".post").unwrap()]);
        assert_eq!(posts, vec![outer, inner]);
    }

    #[test]
    fn test_lazy_park_and_release() {
        let mut tree = DomTree::new();
        let root = tree.root();
        let img = tree.append_element(root, "img", &[]).unwrap();
        tree.set_layout(img, ElementVisibility::boxed(0.0, 3000.0, 100.0, 100.0))
            .unwrap();
        let div = tree.append_element(root, "div", &[]).unwrap();
        tree.set_layout(div, ElementVisibility::boxed(0.0, 3000.0, 100.0, 100.0))
            .unwrap();

        let mut lazy = LazyWatcher::new(Selector::parse("img, iframe").unwrap(), 200.0);
        let viewport = Viewport::new(0.0, 0.0, 1280.0, 800.0);
        assert!(!lazy.should_defer(&tree, img, &viewport));
        lazy.set_active(true);
        assert!(lazy.should_defer(&tree, img, &viewport));
        assert!(!lazy.should_defer(&tree, div, &viewport));

        assert!(lazy.park(img));
        assert!(!lazy.park(img));
        assert!(lazy.release(&tree, &viewport).is_empty());

        // scrolled to within the margin
        let scrolled = Viewport::new(0.0, 2050.0, 1280.0, 800.0);
        assert_eq!(lazy.release(&tree, &scrolled), vec![img]);
        assert_eq!(lazy.parked(), 0);
    }
}
