//! Change events
//!
//! One reported mutation of the observed tree, tagged with the source that
//! reported it. Events are immutable once built.

use fco_dom::{MutationRecord, MutationType, NodeId};

use crate::source::SourceKind;

/// What happened to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insertion,
    Removal,
    AttributeChange,
    TextChange,
}

/// A reported change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    target: NodeId,
    kind: ChangeKind,
    attribute_name: Option<String>,
    old_value: Option<String>,
    new_value: Option<String>,
    source: SourceKind,
}

impl ChangeEvent {
    fn new(target: NodeId, kind: ChangeKind) -> Self {
        Self {
            target,
            kind,
            attribute_name: None,
            old_value: None,
            new_value: None,
            source: SourceKind::Primary,
        }
    }

    /// Node inserted into the tree
    pub fn insertion(target: NodeId) -> Self {
        Self::new(target, ChangeKind::Insertion)
    }

    /// Node removed from the tree
    pub fn removal(target: NodeId) -> Self {
        Self::new(target, ChangeKind::Removal)
    }

    /// Attribute changed on an element
    pub fn attribute(
        target: NodeId,
        name: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> Self {
        Self {
            attribute_name: Some(name.to_ascii_lowercase()),
            old_value: old_value.map(str::to_string),
            new_value: new_value.map(str::to_string),
            ..Self::new(target, ChangeKind::AttributeChange)
        }
    }

    /// Text node content changed
    pub fn text(target: NodeId, old_value: &str, new_value: &str) -> Self {
        Self {
            old_value: Some(old_value.to_string()),
            new_value: Some(new_value.to_string()),
            ..Self::new(target, ChangeKind::TextChange)
        }
    }

    /// Same event, reported by `source`
    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.source = source;
        self
    }

    /// Split a DOM mutation record into change events
    pub fn from_record(record: MutationRecord, source: SourceKind) -> Vec<ChangeEvent> {
        match record.mutation_type {
            MutationType::ChildList => record
                .added_nodes
                .iter()
                .map(|&node| ChangeEvent::insertion(node))
                .chain(record.removed_nodes.iter().map(|&node| ChangeEvent::removal(node)))
                .map(|event| event.with_source(source))
                .collect(),
            MutationType::Attributes => vec![
                ChangeEvent {
                    attribute_name: record.attribute_name.map(|n| n.to_ascii_lowercase()),
                    old_value: record.old_value,
                    new_value: record.new_value,
                    ..ChangeEvent::new(record.target, ChangeKind::AttributeChange)
                }
                .with_source(source),
            ],
            MutationType::CharacterData => vec![
                ChangeEvent {
                    old_value: record.old_value,
                    new_value: record.new_value,
                    ..ChangeEvent::new(record.target, ChangeKind::TextChange)
                }
                .with_source(source),
            ],
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn attribute_name(&self) -> Option<&str> {
        self.attribute_name.as_deref()
    }

    pub fn old_value(&self) -> Option<&str> {
        self.old_value.as_deref()
    }

    pub fn new_value(&self) -> Option<&str> {
        self.new_value.as_deref()
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_list_record_splits_per_node() {
        let parent = NodeId::from_raw_parts(1, 0);
        let a = NodeId::from_raw_parts(2, 0);
        let b = NodeId::from_raw_parts(3, 0);
        let gone = NodeId::from_raw_parts(4, 1);

        let record = MutationRecord::child_list(parent, vec![a, b], vec![gone]);
        let events = ChangeEvent::from_record(record, SourceKind::Nested);

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ChangeEvent::insertion(a).with_source(SourceKind::Nested));
        assert_eq!(events[1].target(), b);
        assert_eq!(events[2].kind(), ChangeKind::Removal);
        assert!(events.iter().all(|e| e.source() == SourceKind::Nested));
    }

    #[test]
    fn test_attribute_record_keeps_values() {
        let node = NodeId::from_raw_parts(7, 0);
        let record = MutationRecord::attribute(node, "Style", Some("width: 1px".into()), None);
        let events = ChangeEvent::from_record(record, SourceKind::Primary);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attribute_name(), Some("style"));
        assert_eq!(events[0].old_value(), Some("width: 1px"));
        assert_eq!(events[0].new_value(), None);
    }
}
