//! Tree access capability
//!
//! The observer treats the live tree as an opaque, read-only capability.
//! Every walk here is depth bounded so a misbehaving host tree cannot keep
//! the engine spinning.

use crate::{ElementVisibility, NodeId, Selector};

/// Read-only view of an externally owned tree.
pub trait TreeAccess {
    /// Document root
    fn root(&self) -> NodeId;

    /// Is the node still attached to the live tree?
    fn contains(&self, node: NodeId) -> bool;

    /// Parent node, if any
    fn parent(&self, node: NodeId) -> Option<NodeId>;

    /// Children in document order (empty for unknown nodes)
    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Lowercased tag name; `None` for anything that is not an element
    fn tag_name(&self, node: NodeId) -> Option<&str>;

    /// Attribute value
    fn attribute(&self, node: NodeId, name: &str) -> Option<&str>;

    /// Text content of a text node
    fn text(&self, node: NodeId) -> Option<&str>;

    /// Box and computed style, when the host knows them
    fn visibility(&self, node: NodeId) -> Option<ElementVisibility>;

    /// Root of an encapsulated sub-tree (shadow root, same-origin frame)
    fn is_scope_root(&self, node: NodeId) -> bool;

    #[inline]
    fn is_element(&self, node: NodeId) -> bool {
        self.tag_name(node).is_some()
    }

    #[inline]
    fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.attribute(node, name).is_some()
    }

    #[inline]
    fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        selector.matches(self, node)
    }
}

/// Pre-order walk below `scope` (exclusive) that does not cross into nested
/// scope roots. `visit` returns `false` to stop the walk.
fn walk<T, F>(tree: &T, scope: NodeId, max_depth: usize, mut visit: F)
where
    T: TreeAccess + ?Sized,
    F: FnMut(NodeId) -> bool,
{
    let mut stack: Vec<(NodeId, usize)> = tree
        .children(scope)
        .into_iter()
        .rev()
        .map(|child| (child, 1))
        .collect();

    while let Some((node, depth)) = stack.pop() {
        if depth > max_depth || tree.is_scope_root(node) {
            continue;
        }
        if !visit(node) {
            return;
        }
        stack.extend(
            tree.children(node)
                .into_iter()
                .rev()
                .map(|child| (child, depth + 1)),
        );
    }
}

/// Element descendants of `node` up to `max_depth` levels down.
pub fn descendants<T: TreeAccess + ?Sized>(
    tree: &T,
    node: NodeId,
    max_depth: usize,
) -> Vec<NodeId> {
    let mut found = Vec::new();
    walk(tree, node, max_depth, |n| {
        if tree.is_element(n) {
            found.push(n);
        }
        true
    });
    found
}

/// Elements below `scope` matching `selector`, in document order.
pub fn select_all<T: TreeAccess + ?Sized>(
    tree: &T,
    scope: NodeId,
    selector: &Selector,
    max_depth: usize,
) -> Vec<NodeId> {
    let mut found = Vec::new();
    walk(tree, scope, max_depth, |n| {
        if selector.matches(tree, n) {
            found.push(n);
        }
        true
    });
    found
}

/// Does any element below `node` match `selector`?
pub fn has_matching_descendant<T: TreeAccess + ?Sized>(
    tree: &T,
    node: NodeId,
    selector: &Selector,
    max_depth: usize,
) -> bool {
    let mut hit = false;
    walk(tree, node, max_depth, |n| {
        hit = selector.matches(tree, n);
        !hit
    });
    hit
}

/// Nested scope roots directly reachable below `scope` (not nested twice).
pub fn find_scopes<T: TreeAccess + ?Sized>(
    tree: &T,
    scope: NodeId,
    max_depth: usize,
) -> Vec<NodeId> {
    let mut found = Vec::new();
    let mut stack = vec![(scope, 0usize)];
    while let Some((node, depth)) = stack.pop() {
        if depth >= max_depth {
            continue;
        }
        for child in tree.children(node).into_iter().rev() {
            if tree.is_scope_root(child) {
                found.push(child);
            } else {
                stack.push((child, depth + 1));
            }
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomTree;

    #[test]
    fn test_walks_are_depth_bounded() {
        let mut tree = DomTree::new();
        let mut parent = tree.root();
        for _ in 0..20 {
            parent = tree.append_element(parent, "div", &[]).unwrap();
        }
        assert_eq!(descendants(&tree, tree.root(), 5).len(), 5);
        assert_eq!(descendants(&tree, tree.root(), 100).len(), 20);
    }

    #[test]
    fn test_scopes_are_not_crossed() {
        let mut tree = DomTree::new();
        let root = tree.root();
        let host = tree.append_element(root, "div", &[("class", "embed")]).unwrap();
        let scope = tree.attach_scope(host).unwrap();
        let inner = tree.append_element(scope, "span", &[("class", "post")]).unwrap();
        let outer = tree.append_element(root, "span", &[("class", "post")]).unwrap();

        let sel = Selector::parse(".post").unwrap();
        assert_eq!(select_all(&tree, root, &sel, 10), vec![outer]);
        assert_eq!(select_all(&tree, scope, &sel, 10), vec![inner]);
        assert_eq!(find_scopes(&tree, root, 10), vec![scope]);
        assert!(has_matching_descendant(&tree, scope, &sel, 10));
        assert!(!has_matching_descendant(&tree, host, &sel, 10));
    }
}
