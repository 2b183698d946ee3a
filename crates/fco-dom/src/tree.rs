//! DOM Tree (generational arena)
//!
//! Removed nodes free their slot and bump its generation, so ids held by
//! observers go stale instead of aliasing a newer node.

use crate::{ElementVisibility, MutationRecord, Node, NodeData, NodeId, TreeAccess};

/// DOM error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),

    #[error("cannot insert {child} under {parent}")]
    HierarchyRequest { parent: NodeId, child: NodeId },

    #[error("node {0} is not an element")]
    NotAnElement(NodeId),

    #[error("node {0} is not a text node")]
    NotText(NodeId),
}

#[derive(Debug)]
struct Slot {
    node: Option<Node>,
    generation: u32,
}

/// Arena-based DOM tree that records its own mutations.
#[derive(Debug)]
pub struct DomTree {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    root: NodeId,
    records: Vec<MutationRecord>,
}

impl Default for DomTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DomTree {
    /// Create a tree holding only the document node
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            root: NodeId::from_raw_parts(0, 0),
            records: Vec::new(),
        };
        tree.root = tree.alloc(Node::document());
        tree
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId::from_raw_parts(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                node: Some(node),
                generation: 0,
            });
            NodeId::from_raw_parts(index, 0)
        }
    }

    /// Get a node by ID
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    /// Get a mutable node by ID
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// Only the document node is left
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Create a detached element
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc(Node::element(tag))
    }

    /// Create a detached text node
    pub fn create_text(&mut self, content: &str) -> NodeId {
        self.alloc(Node::text(content))
    }

    /// Append `child` under `parent`, detaching it from any previous parent.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let parent_node = self.get(parent).ok_or(DomError::NodeNotFound(parent))?;
        if matches!(parent_node.data, NodeData::Text(_) | NodeData::Comment(_)) {
            return Err(DomError::HierarchyRequest { parent, child });
        }
        if self.get(child).is_none() {
            return Err(DomError::NodeNotFound(child));
        }
        // Refuse cycles: child may not be an ancestor of parent
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node == child {
                return Err(DomError::HierarchyRequest { parent, child });
            }
            cursor = self.get(node).and_then(|n| n.parent);
        }

        self.detach(child);
        if let Some(n) = self.get_mut(child) {
            n.parent = Some(parent);
        }
        if let Some(p) = self.get_mut(parent) {
            p.children.push(child);
        }
        self.records.push(MutationRecord::child_list(parent, vec![child], Vec::new()));
        Ok(())
    }

    fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.get(node).and_then(|n| n.parent) else {
            return;
        };
        if let Some(p) = self.get_mut(parent) {
            p.children.retain(|&c| c != node);
        }
        if let Some(n) = self.get_mut(node) {
            n.parent = None;
        }
        self.records.push(MutationRecord::child_list(parent, Vec::new(), vec![node]));
    }

    /// Create an element with attributes and append it
    pub fn append_element(
        &mut self,
        parent: NodeId,
        tag: &str,
        attrs: &[(&str, &str)],
    ) -> Result<NodeId, DomError> {
        let id = self.create_element(tag);
        if let Some(el) = self.get_mut(id).and_then(Node::as_element_mut) {
            for (name, value) in attrs {
                el.set_attr(name, value);
            }
        }
        self.append_child(parent, id)?;
        Ok(id)
    }

    /// Create a text node and append it
    pub fn append_text(&mut self, parent: NodeId, content: &str) -> Result<NodeId, DomError> {
        let id = self.create_text(content);
        self.append_child(parent, id)?;
        Ok(id)
    }

    /// Attach an encapsulated scope root under `host`
    pub fn attach_scope(&mut self, host: NodeId) -> Result<NodeId, DomError> {
        if !self.get(host).is_some_and(Node::is_element) {
            return Err(DomError::NotAnElement(host));
        }
        let scope = self.alloc(Node::fragment());
        self.append_child(host, scope)?;
        Ok(scope)
    }

    /// Remove a node and its whole subtree. The ids become stale.
    pub fn remove(&mut self, node: NodeId) -> Result<(), DomError> {
        if self.get(node).is_none() {
            return Err(DomError::NodeNotFound(node));
        }
        self.detach(node);

        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let slot = &mut self.slots[id.index() as usize];
            if let Some(n) = slot.node.take() {
                stack.extend(n.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(id.index());
            }
        }
        Ok(())
    }

    /// Set an attribute, recording the old and new values
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let el = self
            .get_mut(node)
            .ok_or(DomError::NodeNotFound(node))?
            .as_element_mut()
            .ok_or(DomError::NotAnElement(node))?;
        let old = el.set_attr(name, value);
        self.records.push(MutationRecord::attribute(
            node,
            name,
            old,
            Some(value.to_string()),
        ));
        Ok(())
    }

    /// Remove an attribute
    pub fn remove_attribute(&mut self, node: NodeId, name: &str) -> Result<(), DomError> {
        let el = self
            .get_mut(node)
            .ok_or(DomError::NodeNotFound(node))?
            .as_element_mut()
            .ok_or(DomError::NotAnElement(node))?;
        if let Some(old) = el.remove_attr(name) {
            self.records.push(MutationRecord::attribute(node, name, Some(old), None));
        }
        Ok(())
    }

    /// Replace the content of a text node
    pub fn set_text(&mut self, node: NodeId, content: &str) -> Result<(), DomError> {
        let n = self.get_mut(node).ok_or(DomError::NodeNotFound(node))?;
        let NodeData::Text(text) = &mut n.data else {
            return Err(DomError::NotText(node));
        };
        let old = std::mem::replace(text, content.to_string());
        self.records.push(MutationRecord::character_data(node, old, content.to_string()));
        Ok(())
    }

    /// Record the host's layout for an element. Not a DOM mutation.
    pub fn set_layout(&mut self, node: NodeId, layout: ElementVisibility) -> Result<(), DomError> {
        let el = self
            .get_mut(node)
            .ok_or(DomError::NodeNotFound(node))?
            .as_element_mut()
            .ok_or(DomError::NotAnElement(node))?;
        el.layout = Some(layout);
        Ok(())
    }

    /// Drain recorded mutations
    pub fn take_records(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }

    /// Is the node reachable from the document root?
    fn is_attached(&self, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == self.root {
                return true;
            }
            cursor = self.get(id).and_then(|n| n.parent);
        }
        false
    }
}

impl TreeAccess for DomTree {
    fn root(&self) -> NodeId {
        self.root
    }

    fn contains(&self, node: NodeId) -> bool {
        self.get(node).is_some() && self.is_attached(node)
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.get(node).and_then(|n| n.parent)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.get(node).map(|n| n.children.clone()).unwrap_or_default()
    }

    fn tag_name(&self, node: NodeId) -> Option<&str> {
        self.get(node)?.as_element().map(|e| e.tag.as_str())
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.get(node)?.as_element()?.get_attr(name)
    }

    fn text(&self, node: NodeId) -> Option<&str> {
        self.get(node)?.as_text()
    }

    fn visibility(&self, node: NodeId) -> Option<ElementVisibility> {
        self.get(node)?.as_element()?.layout
    }

    fn is_scope_root(&self, node: NodeId) -> bool {
        self.get(node)
            .is_some_and(|n| matches!(n.data, NodeData::Fragment))
    }
}
