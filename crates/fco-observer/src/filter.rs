//! Change Filter
//!
//! Pure predicate chain run over every reported change before it may enter
//! the dispatch queue. A rejection is not an error; it is only counted.

use std::collections::BTreeMap;
use std::fmt;

use fco_dom::{NodeId, TreeAccess};

use crate::config::ObserverConfig;
use crate::dedup::DedupCache;
use crate::event::{ChangeEvent, ChangeKind};
use crate::source::SourceKind;

/// Ancestor hops checked against the dedup cache
const DEDUP_ANCESTOR_HOPS: usize = 64;

/// Why a change was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterReason {
    /// Removals only purge state, they are never dispatched
    Removal,
    /// Target no longer attached to the tree
    Detached,
    /// Attribute or text change reported by the root-level backup watcher
    NonStructural,
    /// Produced by one of our own subscribers
    SelfOriginated,
    /// Target or an ancestor already processed
    AlreadyProcessed,
    Invisible,
    WhitespaceOnly,
    NonLayoutStyle,
}

impl FilterReason {
    pub const ALL: [FilterReason; 8] = [
        FilterReason::Removal,
        FilterReason::Detached,
        FilterReason::NonStructural,
        FilterReason::SelfOriginated,
        FilterReason::AlreadyProcessed,
        FilterReason::Invisible,
        FilterReason::WhitespaceOnly,
        FilterReason::NonLayoutStyle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterReason::Removal => "removal",
            FilterReason::Detached => "detached",
            FilterReason::NonStructural => "non_structural",
            FilterReason::SelfOriginated => "self_originated",
            FilterReason::AlreadyProcessed => "already_processed",
            FilterReason::Invisible => "invisible",
            FilterReason::WhitespaceOnly => "whitespace_only",
            FilterReason::NonLayoutStyle => "non_layout_style",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the dedup check applies to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupCheck {
    /// Reject when the target or any ancestor was processed
    SelfOrAncestor,
    /// Forced scans and lazy releases
    Skip,
}

/// Relevance predicate chain
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    marker_attribute: String,
    layout_properties: Vec<String>,
}

impl ChangeFilter {
    pub fn new(config: &ObserverConfig) -> Self {
        Self {
            marker_attribute: config.marker_attribute.to_ascii_lowercase(),
            layout_properties: config
                .layout_properties
                .iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn marker_attribute(&self) -> &str {
        &self.marker_attribute
    }

    /// `Ok(())` when the change is relevant
    pub fn check<T: TreeAccess + ?Sized>(
        &self,
        event: &ChangeEvent,
        tree: &T,
        dedup: &DedupCache,
        now: u64,
        dedup_check: DedupCheck,
    ) -> Result<(), FilterReason> {
        if event.kind() == ChangeKind::Removal {
            return Err(FilterReason::Removal);
        }
        let target = event.target();
        if !tree.contains(target) {
            return Err(FilterReason::Detached);
        }
        if event.source() == SourceKind::Backup && event.kind() != ChangeKind::Insertion {
            return Err(FilterReason::NonStructural);
        }

        let element = owning_element(tree, target).ok_or(FilterReason::Detached)?;

        if tree.has_attribute(element, &self.marker_attribute)
            || event.attribute_name() == Some(self.marker_attribute.as_str())
        {
            return Err(FilterReason::SelfOriginated);
        }

        if dedup_check == DedupCheck::SelfOrAncestor
            && dedup.contains_self_or_ancestor(tree, element, now, DEDUP_ANCESTOR_HOPS)
        {
            return Err(FilterReason::AlreadyProcessed);
        }

        if !is_visible(tree, element) {
            return Err(FilterReason::Invisible);
        }

        match event.kind() {
            ChangeKind::TextChange => {
                let old = event.old_value().unwrap_or("");
                let new = event.new_value().unwrap_or("");
                if same_ignoring_whitespace(old, new) {
                    return Err(FilterReason::WhitespaceOnly);
                }
            }
            ChangeKind::AttributeChange if event.attribute_name() == Some("style") => {
                if !self.layout_changed(event.old_value(), event.new_value()) {
                    return Err(FilterReason::NonLayoutStyle);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Did any layout-affecting property change between two style values?
    fn layout_changed(&self, old: Option<&str>, new: Option<&str>) -> bool {
        let before = self.layout_declarations(old.unwrap_or(""));
        let after = self.layout_declarations(new.unwrap_or(""));
        before != after
    }

    fn layout_declarations(&self, style: &str) -> BTreeMap<String, String> {
        style
            .split(';')
            .filter_map(|decl| decl.split_once(':'))
            .map(|(prop, value)| {
                (
                    prop.trim().to_ascii_lowercase(),
                    value.trim().to_ascii_lowercase(),
                )
            })
            .filter(|(prop, _)| self.layout_properties.iter().any(|p| p == prop))
            .collect()
    }
}

/// Element the change belongs to; text nodes map to their parent
pub(crate) fn owning_element<T: TreeAccess + ?Sized>(tree: &T, node: NodeId) -> Option<NodeId> {
    if tree.is_element(node) {
        Some(node)
    } else {
        tree.parent(node).filter(|&parent| tree.is_element(parent))
    }
}

/// Equal once every whitespace character is dropped
fn same_ignoring_whitespace(old: &str, new: &str) -> bool {
    let significant = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<Vec<_>>();
    significant(old) == significant(new)
}

/// Cheap visibility heuristic; nodes without layout information count as
/// visible
fn is_visible<T: TreeAccess + ?Sized>(tree: &T, element: NodeId) -> bool {
    if tree.has_attribute(element, "hidden") {
        return false;
    }
    match tree.visibility(element) {
        Some(layout) => !layout.intrinsic_state().is_invisible(),
        None => true,
    }
}
