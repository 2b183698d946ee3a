//! fOS Forum Core Observer - DOM
//!
//! The tree the observer reacts to. The engine never owns the live tree;
//! it sees it through the read-only [`TreeAccess`] capability. [`DomTree`]
//! is an arena implementation used by hosts without a tree of their own
//! and by the test suites.

mod access;
mod mutation;
mod node;
mod selector;
mod tree;
mod visibility;

pub use access::{TreeAccess, descendants, find_scopes, has_matching_descendant, select_all};
pub use mutation::{MutationRecord, MutationType};
pub use node::{ElementData, Node, NodeData};
pub use selector::{Selector, SelectorError};
pub use tree::{DomError, DomTree};
pub use visibility::{DisplayValue, ElementVisibility, Viewport, VisibilityState, VisibilityValue};

/// Node identifier: arena slot plus the generation the slot had when the
/// node was created. A removed node's id never resolves again, even after
/// the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    /// Build an id from raw parts (hosts mapping their own node handles).
    #[inline]
    pub const fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}
