//! Subscription Registry
//!
//! Subscriber descriptors are validated once, at registration, into
//! [`Subscription`]s. Matching is re-evaluated for every target on every
//! pass; nothing is cached across passes.

use std::fmt;

use fco_dom::{NodeId, Selector, TreeAccess, has_matching_descendant};
use serde::{Deserialize, Serialize};

use crate::error::{CallbackError, ObserverError};
use crate::executor::CallbackContext;
use crate::page_state::{PageState, PageType};
use crate::scheduler::TaskHandle;
use crate::source::SourceKind;

/// Depth searched when a selector dependency probes the whole document
const DEPENDENCY_PROBE_DEPTH: usize = 64;

/// Subscriber callback
pub type Callback = Box<dyn FnMut(&mut CallbackContext<'_>) -> Result<(), CallbackError>>;

/// Stable subscription identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriptionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&SubscriptionId> for SubscriptionId {
    fn from(id: &SubscriptionId) -> Self {
        id.clone()
    }
}

/// Priority lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Idle,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Idle,
    ];
}

/// Gate that must hold before a subscription runs at all
pub enum Dependency {
    /// Something in the document matches
    Selector(Selector),
    /// Host-supplied guard
    Guard(Box<dyn Fn() -> bool>),
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Selector(sel) => f.debug_tuple("Selector").field(&sel.text()).finish(),
            Dependency::Guard(_) => f.write_str("Guard(..)"),
        }
    }
}

impl Dependency {
    fn holds<T: TreeAccess + ?Sized>(&self, tree: &T) -> bool {
        match self {
            Dependency::Selector(sel) => {
                let root = tree.root();
                sel.matches(tree, root)
                    || has_matching_descendant(tree, root, sel, DEPENDENCY_PROBE_DEPTH)
            }
            Dependency::Guard(guard) => guard(),
        }
    }
}

/// Retry policy for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `retried + 1` of one target
    pub fn backoff_ms(&self, retried: u32) -> u64 {
        self.backoff_base_ms
            .saturating_mul(1u64.checked_shl(retried).unwrap_or(u64::MAX))
    }
}

/// Trailing-edge debounce state
#[derive(Debug, Default)]
pub(crate) struct Debounce {
    pub(crate) interval_ms: u64,
    pub(crate) last_run_at: Option<u64>,
    /// Distinct targets matched inside the current window
    pub(crate) pending: Vec<(NodeId, SourceKind)>,
    pub(crate) timer: Option<TaskHandle>,
}

/// What a subscriber module hands to `register`
pub struct SubscriptionDescriptor {
    id: Option<String>,
    callback: Callback,
    selector: Option<String>,
    priority: Priority,
    page_types: Vec<PageType>,
    dependencies: Vec<DependencyDecl>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
}

enum DependencyDecl {
    Selector(String),
    Guard(Box<dyn Fn() -> bool>),
}

impl SubscriptionDescriptor {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&mut CallbackContext<'_>) -> Result<(), CallbackError> + 'static,
    {
        Self {
            id: None,
            callback: Box::new(callback),
            selector: None,
            priority: Priority::default(),
            page_types: Vec::new(),
            dependencies: Vec::new(),
            max_retries: None,
            backoff_base_ms: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn page_types(mut self, page_types: &[PageType]) -> Self {
        self.page_types = page_types.to_vec();
        self
    }

    /// Require something matching `selector` to exist in the document
    pub fn depends_on_selector(mut self, selector: impl Into<String>) -> Self {
        self.dependencies.push(DependencyDecl::Selector(selector.into()));
        self
    }

    /// Require `guard` to hold
    pub fn depends_on(mut self, guard: impl Fn() -> bool + 'static) -> Self {
        self.dependencies.push(DependencyDecl::Guard(Box::new(guard)));
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = Some(ms);
        self
    }

    pub(crate) fn take_id(&mut self) -> Option<String> {
        self.id.take()
    }
}

/// A registered subscriber
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) callback: Callback,
    pub(crate) selector: Option<Selector>,
    pub(crate) priority: Priority,
    pub(crate) page_types: Vec<PageType>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) debounce: Option<Debounce>,
    pub(crate) retry: RetryPolicy,
    pub(crate) error_count: u32,
    pub(crate) last_success_at: Option<u64>,
    pub(crate) last_error_at: Option<u64>,
    pub(crate) last_error: Option<CallbackError>,
    pub(crate) runs: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("selector", &self.selector.as_ref().map(Selector::text))
            .field("priority", &self.priority)
            .field("page_types", &self.page_types)
            .field("dependencies", &self.dependencies)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Validate a descriptor
    pub(crate) fn from_descriptor(
        descriptor: SubscriptionDescriptor,
        id: SubscriptionId,
        default_retry: RetryPolicy,
        debounce_ms: Option<u64>,
    ) -> Result<Self, ObserverError> {
        let invalid = |reason: &str| ObserverError::InvalidDescriptor {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.as_str().trim().is_empty() {
            return Err(invalid("id is empty"));
        }
        if debounce_ms == Some(0) {
            return Err(invalid("debounce delay must be positive"));
        }

        let selector = descriptor
            .selector
            .as_deref()
            .map(Selector::parse)
            .transpose()?;

        let mut dependencies = Vec::with_capacity(descriptor.dependencies.len());
        for decl in descriptor.dependencies {
            dependencies.push(match decl {
                DependencyDecl::Selector(text) => Dependency::Selector(Selector::parse(&text)?),
                DependencyDecl::Guard(guard) => Dependency::Guard(guard),
            });
        }

        Ok(Self {
            id,
            callback: descriptor.callback,
            selector,
            priority: descriptor.priority,
            page_types: descriptor.page_types,
            dependencies,
            debounce: debounce_ms.map(|interval_ms| Debounce {
                interval_ms,
                ..Debounce::default()
            }),
            retry: RetryPolicy {
                max_retries: descriptor.max_retries.unwrap_or(default_retry.max_retries),
                backoff_base_ms: descriptor
                    .backoff_base_ms
                    .unwrap_or(default_retry.backoff_base_ms),
            },
            error_count: 0,
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            runs: 0,
        })
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    /// Failures since the last success, across all targets
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_success_at(&self) -> Option<u64> {
        self.last_success_at
    }

    pub fn last_error_at(&self) -> Option<u64> {
        self.last_error_at
    }

    pub fn last_error(&self) -> Option<&CallbackError> {
        self.last_error.as_ref()
    }

    /// Successful callback invocations
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn is_debounced(&self) -> bool {
        self.debounce.is_some()
    }

    /// When the debounce window last closed
    pub fn last_debounce_at(&self) -> Option<u64> {
        self.debounce.as_ref().and_then(|d| d.last_run_at)
    }

    /// Page gate, dependency gate and selector, in that order
    pub fn matches<T: TreeAccess + ?Sized>(
        &self,
        tree: &T,
        target: NodeId,
        page: &PageState,
        max_depth: usize,
    ) -> bool {
        if !page.satisfies(&self.page_types) {
            return false;
        }
        if !self.dependencies.iter().all(|dep| dep.holds(tree)) {
            return false;
        }
        match &self.selector {
            None => true,
            Some(sel) => {
                sel.matches(tree, target) || has_matching_descendant(tree, target, sel, max_depth)
            }
        }
    }
}

/// Registered subscriptions in registration order
#[derive(Debug, Default)]
pub struct Registry {
    subscriptions: Vec<Subscription>,
    next_auto_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh id for descriptors that did not bring one
    pub(crate) fn next_id(&mut self) -> SubscriptionId {
        loop {
            self.next_auto_id += 1;
            let id = SubscriptionId(format!("sub-{}", self.next_auto_id));
            if self.get(&id).is_none() {
                return id;
            }
        }
    }

    /// Add or replace; returns the replaced subscription
    pub(crate) fn insert(&mut self, subscription: Subscription) -> Option<Subscription> {
        match self.subscriptions.iter_mut().find(|s| s.id == subscription.id) {
            Some(slot) => Some(std::mem::replace(slot, subscription)),
            None => {
                self.subscriptions.push(subscription);
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        let pos = self.subscriptions.iter().position(|s| &s.id == id)?;
        Some(self.subscriptions.remove(pos))
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| &s.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &SubscriptionId) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| &s.id == id)
    }

    /// Subscriptions matching `target` right now, in registration order
    pub fn matching<T: TreeAccess + ?Sized>(
        &self,
        tree: &T,
        target: NodeId,
        page: &PageState,
        max_depth: usize,
    ) -> Vec<(SubscriptionId, Priority)> {
        self.subscriptions
            .iter()
            .filter(|s| s.matches(tree, target, page, max_depth))
            .map(|s| (s.id.clone(), s.priority))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscription> {
        self.subscriptions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub(crate) fn clear(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fco_dom::DomTree;
    use std::cell::Cell;
    use std::rc::Rc;

    const RETRY: RetryPolicy = RetryPolicy {
        max_retries: 3,
        backoff_base_ms: 100,
    };

    fn subscription(descriptor: SubscriptionDescriptor, id: &str) -> Subscription {
        Subscription::from_descriptor(descriptor, SubscriptionId::new(id), RETRY, None).unwrap()
    }

    fn noop() -> SubscriptionDescriptor {
        SubscriptionDescriptor::new(|_| Ok(()))
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(RETRY.backoff_ms(0), 100);
        assert_eq!(RETRY.backoff_ms(1), 200);
        assert_eq!(RETRY.backoff_ms(3), 800);
        assert_eq!(RETRY.backoff_ms(200), u64::MAX);
    }

    #[test]
    fn test_descriptor_validation() {
        let err = Subscription::from_descriptor(
            noop().selector("div:hover"),
            SubscriptionId::new("bad"),
            RETRY,
            None,
        );
        assert!(matches!(err, Err(ObserverError::InvalidSelector(_))));

        let err = Subscription::from_descriptor(noop(), SubscriptionId::new("d"), RETRY, Some(0));
        assert!(matches!(err, Err(ObserverError::InvalidDescriptor { .. })));

        let sub = subscription(noop().max_retries(7), "ok");
        assert_eq!(sub.retry.max_retries, 7);
        assert_eq!(sub.retry.backoff_base_ms, 100);
    }

    #[test]
    fn test_matching_rules() {
        let mut tree = DomTree::new();
        let root = tree.root();
        let post = tree.append_element(root, "div", &[("class", "post")]).unwrap();
        let quote = tree.append_element(post, "div", &[("class", "quote")]).unwrap();
        let page = PageState {
            thread: true,
            ..PageState::default()
        };

        // selector on the target itself or a descendant
        let quotes = subscription(noop().selector(".quote"), "quotes");
        assert!(quotes.matches(&tree, quote, &page, 10));
        assert!(quotes.matches(&tree, post, &page, 10));
        assert!(!quotes.matches(&tree, post, &page, 0));

        // page gate
        let profile_only = subscription(noop().page_types(&[PageType::Profile]), "profile");
        assert!(!profile_only.matches(&tree, post, &page, 10));

        // dependency gates
        let flag = Rc::new(Cell::new(false));
        let guard = Rc::clone(&flag);
        let gated = subscription(
            noop()
                .depends_on_selector(".post")
                .depends_on(move || guard.get()),
            "gated",
        );
        assert!(!gated.matches(&tree, post, &page, 10));
        flag.set(true);
        assert!(gated.matches(&tree, post, &page, 10));

        let missing = subscription(noop().depends_on_selector("#editor"), "missing");
        assert!(!missing.matches(&tree, post, &page, 10));
    }

    #[test]
    fn test_registry_replace_and_order() {
        let mut registry = Registry::new();
        registry.insert(subscription(noop(), "a"));
        registry.insert(subscription(noop().priority(Priority::Critical), "b"));
        let replaced = registry.insert(subscription(noop().priority(Priority::Low), "a"));
        assert!(replaced.is_some());

        let ids: Vec<_> = registry.iter().map(|s| s.id().as_str().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.get(&"a".into()).unwrap().priority(), Priority::Low);

        let auto = registry.next_id();
        assert_eq!(auto.as_str(), "sub-1");
        assert!(registry.remove(&"b".into()).is_some());
        assert!(registry.remove(&"b".into()).is_none());
        assert_eq!(registry.len(), 1);
    }
}
