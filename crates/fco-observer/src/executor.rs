//! Priority Executor
//!
//! Lane policies:
//! - Critical: inline, sequential, before the next target
//! - High: fanned out at the end of the current concurrency chunk, all
//!   settled before the next chunk starts
//! - Normal: short timer task
//! - Low / Idle: idle callback with a timeout
//!
//! A failing callback is retried alone with exponential backoff, then
//! abandoned for that target. Failures never leave the lane.

use std::collections::{BTreeMap, HashMap};

use fco_dom::{NodeId, Selector, SelectorError, TreeAccess};

use crate::config::ObserverConfig;
use crate::page_state::PageState;
use crate::registry::{Priority, Subscription, SubscriptionId};
use crate::scheduler::{Deferral, TaskHandle};
use crate::source::SourceKind;

/// Engine command queued by a callback, applied when it returns
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Unregister(SubscriptionId),
    ForceScan(Option<Selector>),
}

/// What a callback gets to see
pub struct CallbackContext<'a> {
    subscription: SubscriptionId,
    target: NodeId,
    tree: &'a dyn TreeAccess,
    page: &'a PageState,
    attempt: u32,
    source: SourceKind,
    now_ms: u64,
    commands: Vec<Command>,
}

impl<'a> CallbackContext<'a> {
    pub(crate) fn new(
        dispatch: &Dispatch,
        tree: &'a dyn TreeAccess,
        page: &'a PageState,
        now_ms: u64,
    ) -> Self {
        Self {
            subscription: dispatch.id.clone(),
            target: dispatch.target,
            tree,
            page,
            attempt: dispatch.attempt,
            source: dispatch.source,
            now_ms,
            commands: Vec::new(),
        }
    }

    /// Node the callback runs for
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn tree(&self) -> &dyn TreeAccess {
        self.tree
    }

    pub fn page_state(&self) -> &PageState {
        self.page
    }

    pub fn subscription_id(&self) -> &SubscriptionId {
        &self.subscription
    }

    /// 1 on the first invocation, +1 per retry
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Source of the change that led here
    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Remove a subscription once this callback returns
    pub fn unregister(&mut self, id: impl Into<SubscriptionId>) {
        self.commands.push(Command::Unregister(id.into()));
    }

    pub fn unregister_self(&mut self) {
        self.commands.push(Command::Unregister(self.subscription.clone()));
    }

    /// Full forced rescan once this callback returns
    pub fn force_scan(&mut self) {
        self.commands.push(Command::ForceScan(None));
    }

    /// Forced rescan restricted to `selector`
    pub fn force_scan_matching(&mut self, selector: &str) -> Result<(), SelectorError> {
        let selector = Selector::parse(selector)?;
        self.commands.push(Command::ForceScan(Some(selector)));
        Ok(())
    }

    fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// One callback invocation waiting to happen
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dispatch {
    pub id: SubscriptionId,
    pub target: NodeId,
    pub source: SourceKind,
    pub attempt: u32,
}

/// Result of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Retry { delay_ms: u64 },
    Abandoned,
}

/// Invoke a subscription's callback and update its counters
pub(crate) fn invoke(
    subscription: &mut Subscription,
    dispatch: &Dispatch,
    tree: &dyn TreeAccess,
    page: &PageState,
    now_ms: u64,
) -> (Outcome, Vec<Command>) {
    let mut ctx = CallbackContext::new(dispatch, tree, page, now_ms);
    let result = (subscription.callback)(&mut ctx);
    let commands = ctx.into_commands();

    let outcome = match result {
        Ok(()) => {
            subscription.error_count = 0;
            subscription.last_success_at = Some(now_ms);
            subscription.runs += 1;
            Outcome::Success
        }
        Err(err) => {
            subscription.error_count += 1;
            subscription.last_error_at = Some(now_ms);
            // retries already spent on this target
            let retried = dispatch.attempt.saturating_sub(1);
            let outcome = if retried < subscription.retry.max_retries {
                let delay_ms = subscription.retry.backoff_ms(retried);
                tracing::debug!(
                    id = %subscription.id,
                    node = %dispatch.target,
                    attempt = dispatch.attempt,
                    delay_ms,
                    %err,
                    "callback failed, retrying"
                );
                Outcome::Retry { delay_ms }
            } else {
                tracing::warn!(
                    id = %subscription.id,
                    node = %dispatch.target,
                    attempts = dispatch.attempt,
                    %err,
                    "callback abandoned for target"
                );
                Outcome::Abandoned
            };
            subscription.last_error = Some(err);
            outcome
        }
    };
    (outcome, commands)
}

/// How a lane is deferred; `None` runs inline
pub fn lane_deferral(priority: Priority, config: &ObserverConfig) -> Option<Deferral> {
    match priority {
        Priority::Critical => None,
        Priority::High => Some(Deferral::Immediate),
        Priority::Normal => Some(Deferral::Delayed {
            ms: config.normal_delay_ms,
        }),
        Priority::Low => Some(Deferral::Idle {
            timeout_ms: config.low_idle_timeout_ms,
        }),
        Priority::Idle => Some(Deferral::Idle {
            timeout_ms: config.idle_timeout_ms,
        }),
    }
}

/// Dispatches collected over one concurrency chunk
#[derive(Debug, Default)]
pub(crate) struct LaneBuffer {
    pub high: Vec<Dispatch>,
    pub deferred: BTreeMap<Priority, Vec<Dispatch>>,
}

impl LaneBuffer {
    pub fn push(&mut self, priority: Priority, dispatch: Dispatch) {
        match priority {
            Priority::High => self.high.push(dispatch),
            other => self.deferred.entry(other).or_default().push(dispatch),
        }
    }
}

#[derive(Debug)]
struct ParkedRetry {
    dispatch: Dispatch,
    handle: Option<TaskHandle>,
}

/// Payloads of scheduled lane and retry jobs
#[derive(Debug, Default)]
pub(crate) struct Executor {
    next_key: u64,
    lanes: HashMap<u64, (Priority, Vec<Dispatch>)>,
    retries: HashMap<u64, ParkedRetry>,
}

impl Executor {
    fn key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    pub fn park_lane(&mut self, priority: Priority, dispatches: Vec<Dispatch>) -> u64 {
        let key = self.key();
        self.lanes.insert(key, (priority, dispatches));
        key
    }

    pub fn take_lane(&mut self, key: u64) -> Option<(Priority, Vec<Dispatch>)> {
        self.lanes.remove(&key)
    }

    pub fn park_retry(&mut self, dispatch: Dispatch) -> u64 {
        let key = self.key();
        self.retries.insert(
            key,
            ParkedRetry {
                dispatch,
                handle: None,
            },
        );
        key
    }

    pub fn bind_retry(&mut self, key: u64, handle: TaskHandle) {
        if let Some(parked) = self.retries.get_mut(&key) {
            parked.handle = Some(handle);
        }
    }

    pub fn take_retry(&mut self, key: u64) -> Option<Dispatch> {
        self.retries.remove(&key).map(|parked| parked.dispatch)
    }

    /// Forget everything queued for `id`; returns retry timers to cancel
    pub fn drop_subscription(&mut self, id: &SubscriptionId) -> Vec<TaskHandle> {
        for (_, dispatches) in self.lanes.values_mut() {
            dispatches.retain(|d| &d.id != id);
        }
        let keys: Vec<u64> = self
            .retries
            .iter()
            .filter(|(_, parked)| &parked.dispatch.id == id)
            .map(|(&key, _)| key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.retries.remove(&key))
            .filter_map(|parked| parked.handle)
            .collect()
    }

    /// Callbacks waiting in deferred lanes or for a retry
    pub fn pending(&self) -> usize {
        self.lanes.values().map(|(_, d)| d.len()).sum::<usize>() + self.retries.len()
    }

    pub fn clear(&mut self) {
        self.lanes.clear();
        self.retries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use crate::registry::{RetryPolicy, SubscriptionDescriptor};
    use fco_dom::DomTree;

    fn failing(max_retries: u32) -> Subscription {
        Subscription::from_descriptor(
            SubscriptionDescriptor::new(|_| Err(CallbackError::new("boom")))
                .max_retries(max_retries),
            SubscriptionId::new("f"),
            RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 100,
            },
            None,
        )
        .unwrap()
    }

    fn dispatch(target: NodeId) -> Dispatch {
        Dispatch {
            id: SubscriptionId::new("f"),
            target,
            source: SourceKind::Primary,
            attempt: 1,
        }
    }

    #[test]
    fn test_retry_then_abandon() {
        let tree = DomTree::new();
        let page = PageState::default();
        let mut sub = failing(2);
        let d = dispatch(tree.root());

        let (first, _) = invoke(&mut sub, &d, &tree, &page, 0);
        assert_eq!(first, Outcome::Retry { delay_ms: 100 });
        let d = Dispatch { attempt: 2, ..d };
        let (second, _) = invoke(&mut sub, &d, &tree, &page, 100);
        assert_eq!(second, Outcome::Retry { delay_ms: 200 });
        let d = Dispatch { attempt: 3, ..d };
        let (third, _) = invoke(&mut sub, &d, &tree, &page, 300);
        assert_eq!(third, Outcome::Abandoned);
        assert_eq!(sub.error_count(), 3);
        assert_eq!(sub.last_error_at(), Some(300));
        assert_eq!(sub.last_error().map(CallbackError::message), Some("boom"));
    }

    #[test]
    fn test_retry_budget_is_per_target() {
        let mut tree = DomTree::new();
        let root = tree.root();
        let a = tree.append_element(root, "div", &[]).unwrap();
        let b = tree.append_element(root, "div", &[]).unwrap();
        let page = PageState::default();
        let mut sub = failing(1);

        // failures on one target leave the other's budget untouched
        let (first_a, _) = invoke(&mut sub, &dispatch(a), &tree, &page, 0);
        let (first_b, _) = invoke(&mut sub, &dispatch(b), &tree, &page, 0);
        assert_eq!(first_a, Outcome::Retry { delay_ms: 100 });
        assert_eq!(first_b, Outcome::Retry { delay_ms: 100 });

        let retry_a = Dispatch { attempt: 2, ..dispatch(a) };
        let (second_a, _) = invoke(&mut sub, &retry_a, &tree, &page, 100);
        assert_eq!(second_a, Outcome::Abandoned);
        assert_eq!(sub.error_count(), 3);
    }

    #[test]
    fn test_success_resets_errors_and_collects_commands() {
        let tree = DomTree::new();
        let page = PageState::default();
        let mut sub = Subscription::from_descriptor(
            SubscriptionDescriptor::new(|ctx| {
                assert_eq!(ctx.attempt(), 2);
                ctx.unregister_self();
                ctx.force_scan_matching(".post").map_err(|e| CallbackError::new(e.to_string()))
            }),
            SubscriptionId::new("s"),
            RetryPolicy {
                max_retries: 3,
                backoff_base_ms: 100,
            },
            None,
        )
        .unwrap();
        sub.error_count = 2;

        let d = Dispatch {
            id: SubscriptionId::new("s"),
            attempt: 2,
            ..dispatch(tree.root())
        };
        let (outcome, commands) = invoke(&mut sub, &d, &tree, &page, 42);
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(sub.error_count(), 0);
        assert_eq!(sub.last_success_at(), Some(42));
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], Command::Unregister(SubscriptionId::new("s")));
    }

    #[test]
    fn test_drop_subscription_cancels_retries() {
        let tree = DomTree::new();
        let mut executor = Executor::default();
        let lane = executor.park_lane(
            Priority::Normal,
            vec![dispatch(tree.root()), Dispatch {
                id: SubscriptionId::new("other"),
                ..dispatch(tree.root())
            }],
        );
        let retry = executor.park_retry(dispatch(tree.root()));
        assert_eq!(executor.pending(), 3);

        let handles = executor.drop_subscription(&SubscriptionId::new("f"));
        // never bound to a scheduler handle
        assert!(handles.is_empty());
        assert!(executor.take_retry(retry).is_none());
        let (_, remaining) = executor.take_lane(lane).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id.as_str(), "other");
    }
}
