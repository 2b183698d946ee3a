//! Engine integration tests
//!
//! Every test drives the engine over a `DomTree` with a virtual clock and
//! feed sources, so time and change delivery are fully deterministic.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fco_dom::{DomTree, ElementVisibility, NodeId, TreeAccess, Viewport};
use fco_observer::{
    CallbackError, EngineMode, FeedFactory, FeedHandle, FilterReason, Location, Observer,
    ObserverConfig, ObserverError, OverflowPolicy, PageType, Priority, Scheduler, SourceError,
    SourceKind, SubscriptionDescriptor, SubscriptionId, VirtualClock, VirtualScheduler,
};

type Log = Rc<RefCell<Vec<String>>>;

struct Harness {
    observer: Observer<DomTree, VirtualScheduler>,
    factory: FeedFactory,
    clock: VirtualClock,
}

impl Harness {
    fn new(config: ObserverConfig) -> Self {
        let factory = FeedFactory::new();
        let scheduler = VirtualScheduler::new();
        let clock = scheduler.clock();
        let observer = Observer::new(DomTree::new(), scheduler, factory.clone(), config).unwrap();
        Self {
            observer,
            factory,
            clock,
        }
    }

    fn root(&self) -> NodeId {
        self.observer.tree().root()
    }

    fn append(&mut self, parent: NodeId, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        self.observer
            .tree_mut()
            .append_element(parent, tag, attrs)
            .unwrap()
    }

    fn start(&mut self) -> EngineMode {
        // markup built before start is found by the initial scan
        self.observer.tree_mut().take_records();
        self.observer.start().unwrap()
    }

    fn feed_to(&mut self, handle: &FeedHandle) -> usize {
        let records = self.observer.tree_mut().take_records();
        handle.push_records(records)
    }

    /// Deliver tree mutations through the primary source and run ready work
    fn flush(&mut self) -> usize {
        if let Some(primary) = self.factory.latest(SourceKind::Primary) {
            self.feed_to(&primary);
        } else {
            self.observer.tree_mut().take_records();
        }
        self.observer.run_pending()
    }
}

fn logging(log: &Log, label: &str) -> SubscriptionDescriptor {
    let log = Rc::clone(log);
    let label = label.to_string();
    SubscriptionDescriptor::new(move |_| {
        log.borrow_mut().push(label.clone());
        Ok(())
    })
}

fn counting(count: &Rc<Cell<u32>>) -> SubscriptionDescriptor {
    let count = Rc::clone(count);
    SubscriptionDescriptor::new(move |_| {
        count.set(count.get() + 1);
        Ok(())
    })
}

fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

// ============================================================================
// Priority lanes
// ============================================================================

#[test]
fn test_critical_runs_within_the_pass() {
    let mut h = Harness::new(ObserverConfig::default());
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".foo").priority(Priority::Critical))
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo")]);
    h.flush();
    assert_eq!(count.get(), 1);
}

#[test]
fn test_lane_order_within_a_pass() {
    let mut h = Harness::new(ObserverConfig::default());
    let log = Log::default();
    // registered in reverse so the order comes from the lanes
    for (label, priority) in [
        ("idle", Priority::Idle),
        ("low", Priority::Low),
        ("normal", Priority::Normal),
        ("high", Priority::High),
        ("critical", Priority::Critical),
    ] {
        h.observer
            .register(logging(&log, label).selector(".foo").priority(priority))
            .unwrap();
    }
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo")]);
    h.flush();

    let first = entries(&log);
    assert_eq!(first[..2].to_vec(), vec!["critical", "high"]);
    assert!(!first.contains(&"normal".to_string()));

    h.observer.run_for(16);
    let all = entries(&log);
    assert_eq!(all.len(), 5);
    assert!(all.contains(&"normal".to_string()));
}

#[test]
fn test_failing_callback_does_not_affect_siblings() {
    let mut h = Harness::new(ObserverConfig::default());
    let failures = Rc::new(Cell::new(0u32));
    let healthy = Rc::new(Cell::new(0u32));

    let seen = Rc::clone(&failures);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |_| {
                seen.set(seen.get() + 1);
                Err(CallbackError::new("markup not recognised"))
            })
            .id("broken")
            .selector(".foo")
            .priority(Priority::High)
            .max_retries(2),
        )
        .unwrap();
    h.observer
        .register(counting(&healthy).selector(".foo").priority(Priority::High))
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo")]);
    h.flush();
    assert_eq!(failures.get(), 1);
    assert_eq!(healthy.get(), 1);

    // retries after 100ms and a further 200ms, then abandoned
    h.observer.run_for(100);
    assert_eq!(failures.get(), 2);
    h.observer.run_for(200);
    assert_eq!(failures.get(), 3);
    h.observer.run_for(10_000);
    assert_eq!(failures.get(), 3);
    assert_eq!(healthy.get(), 1);

    let stats = h.observer.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.abandoned_callbacks, 1);
    assert_eq!(stats.callback_errors, 3);

    // still registered for future targets
    let broken = h.observer.subscription(&"broken".into()).unwrap();
    assert_eq!(broken.error_count(), 3);
    assert!(broken.last_error().is_some());
}

/// Records the `id` attribute of every target, failing on `fail_id`
/// (or on every target when `None`)
fn failing_on(log: &Log, fail_id: Option<&'static str>) -> SubscriptionDescriptor {
    let log = Rc::clone(log);
    SubscriptionDescriptor::new(move |ctx| {
        let id = ctx.tree().attribute(ctx.target(), "id").unwrap_or("").to_string();
        log.borrow_mut().push(id.clone());
        match fail_id {
            Some(bad) if bad != id => Ok(()),
            _ => Err(CallbackError::new("cannot handle")),
        }
    })
}

#[test]
fn test_sibling_successes_do_not_refill_the_retry_budget() {
    let mut h = Harness::new(ObserverConfig::default());
    let log = Log::default();
    h.observer
        .register(
            failing_on(&log, Some("bad"))
                .id("picky")
                .selector(".foo")
                .priority(Priority::Critical)
                .max_retries(2),
        )
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo"), ("id", "bad")]);
    h.flush();
    for n in 0..20 {
        let id = format!("ok{n}");
        h.append(root, "div", &[("class", "foo"), ("id", id.as_str())]);
        h.flush();
        h.observer.run_for(50);
    }
    h.observer.run_for(10_000);

    let bad_attempts = entries(&log).iter().filter(|id| *id == "bad").count();
    assert_eq!(bad_attempts, 3);
    assert_eq!(h.observer.stats().abandoned_callbacks, 1);
}

#[test]
fn test_concurrent_failures_keep_separate_budgets() {
    let mut h = Harness::new(ObserverConfig::default());
    let log = Log::default();
    h.observer
        .register(
            failing_on(&log, None)
                .selector(".foo")
                .priority(Priority::Critical)
                .max_retries(2),
        )
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo"), ("id", "a")]);
    h.append(root, "div", &[("class", "foo"), ("id", "b")]);
    h.flush();
    h.observer.run_for(10_000);

    let log = entries(&log);
    assert_eq!(log.iter().filter(|id| *id == "a").count(), 3);
    assert_eq!(log.iter().filter(|id| *id == "b").count(), 3);
    assert_eq!(h.observer.stats().abandoned_callbacks, 2);
}

#[test]
fn test_retry_succeeds_on_a_later_attempt() {
    let mut h = Harness::new(ObserverConfig::default());
    let attempts = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&attempts);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |ctx| {
                seen.borrow_mut().push(ctx.attempt());
                if ctx.attempt() < 2 {
                    Err("not yet".into())
                } else {
                    Ok(())
                }
            })
            .id("flaky")
            .selector(".foo")
            .priority(Priority::Critical)
            .backoff_base_ms(10),
        )
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo")]);
    h.flush();
    h.observer.run_for(10);

    assert_eq!(*attempts.borrow(), vec![1, 2]);
    let flaky = h.observer.subscription(&"flaky".into()).unwrap();
    assert_eq!(flaky.error_count(), 0);
    assert_eq!(flaky.last_success_at(), Some(10));
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_unregister_during_drain() {
    let mut h = Harness::new(ObserverConfig::default());
    let log = Log::default();
    let first = Rc::clone(&log);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |ctx| {
                first.borrow_mut().push("a".into());
                ctx.unregister("b");
                Ok(())
            })
            .id("a")
            .selector(".foo")
            .priority(Priority::Critical),
        )
        .unwrap();
    h.observer
        .register(logging(&log, "b").id("b").selector(".foo").priority(Priority::Critical))
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "foo")]);
    h.append(root, "div", &[("class", "foo")]);
    h.flush();

    assert_eq!(entries(&log), vec!["a", "a"]);
    assert!(h.observer.subscription(&"b".into()).is_none());
    assert!(!h.observer.unregister(&"b".into()));
}

#[test]
fn test_late_registration_sees_existing_content() {
    let mut h = Harness::new(ObserverConfig::default());
    h.start();
    let root = h.root();
    let post = h.append(root, "div", &[("class", "post")]);
    h.flush();
    assert!(h.observer.is_processed(post));

    let targets = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&targets);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |ctx| {
                seen.borrow_mut().push(ctx.target());
                Ok(())
            })
            .selector(".post")
            .priority(Priority::Critical),
        )
        .unwrap();
    assert_eq!(*targets.borrow(), vec![post]);
}

#[test]
fn test_late_registration_sees_unprocessed_content() {
    let mut h = Harness::new(ObserverConfig::default());
    let root = h.root();
    let post = h.append(root, "div", &[("class", "postbit")]);
    let info = h.append(post, "div", &[("class", "userinfo")]);
    let loose = h.append(root, "div", &[("class", "userinfo")]);
    h.start();
    h.flush();
    // outside the content catalogue, so never handled by the pipeline
    assert!(!h.observer.is_processed(loose));

    let targets = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&targets);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |ctx| {
                seen.borrow_mut().push(ctx.target());
                Ok(())
            })
            .selector(".userinfo")
            .priority(Priority::Critical),
        )
        .unwrap();

    let mut found = targets.borrow().clone();
    found.sort();
    let mut expected = vec![info, loose];
    expected.sort();
    assert_eq!(found, expected);

    h.observer.run_for(1_000);
    assert_eq!(targets.borrow().len(), 2);
}

#[test]
fn test_page_type_gate_and_navigation() {
    let mut h = Harness::new(ObserverConfig::default());
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(
            counting(&count)
                .selector(".postbit")
                .priority(Priority::Critical)
                .page_types(&[PageType::Thread]),
        )
        .unwrap();
    h.start();
    assert!(h.observer.page_state().home);

    let root = h.root();
    h.append(root, "div", &[("class", "postbit")]);
    h.flush();
    assert_eq!(count.get(), 0);

    h.observer
        .navigate(Location::parse("https://forum.example/showthread.php?t=42"))
        .unwrap();
    h.observer.run_pending();
    assert!(h.observer.page_state().thread);
    assert_eq!(count.get(), 1);
}

#[test]
fn test_debounced_matches_collapse() {
    let mut h = Harness::new(ObserverConfig::default());
    let runs = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&runs);
    h.observer
        .register_debounced(
            SubscriptionDescriptor::new(move |ctx| {
                seen.borrow_mut().push(ctx.now_ms());
                Ok(())
            })
            .id("collapsed")
            .selector(".foo"),
            50,
        )
        .unwrap();
    h.start();

    let root = h.root();
    for _ in 0..3 {
        h.append(root, "div", &[("class", "foo")]);
        h.flush();
        h.clock.advance(10);
    }
    // last match at t=20, window closes at t=70
    h.observer.run_for(39);
    assert!(runs.borrow().is_empty());
    h.observer.run_for(1);
    assert_eq!(*runs.borrow(), vec![70, 70, 70]);
    let sub = h.observer.subscription(&"collapsed".into()).unwrap();
    assert_eq!(sub.last_debounce_at(), Some(70));
}

#[test]
fn test_invalid_descriptors_are_rejected() {
    let mut h = Harness::new(ObserverConfig::default());
    let err = h
        .observer
        .register(SubscriptionDescriptor::new(|_| Ok(())).selector("div:hover"))
        .unwrap_err();
    assert!(matches!(err, ObserverError::InvalidSelector(_)));

    let err = h
        .observer
        .register_debounced(SubscriptionDescriptor::new(|_| Ok(())), 0)
        .unwrap_err();
    assert!(matches!(err, ObserverError::InvalidDescriptor { .. }));
}

// ============================================================================
// Filter, dedup and queue
// ============================================================================

#[test]
fn test_processed_targets_are_not_dispatched_again() {
    let mut h = Harness::new(ObserverConfig::default());
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".foo").priority(Priority::Critical))
        .unwrap();
    h.start();

    let root = h.root();
    let foo = h.append(root, "div", &[("class", "foo")]);
    h.flush();
    assert_eq!(count.get(), 1);

    h.observer
        .tree_mut()
        .set_attribute(foo, "class", "foo bar")
        .unwrap();
    h.flush();
    assert_eq!(count.get(), 1);
    assert_eq!(h.observer.filtered(FilterReason::AlreadyProcessed), 1);

    // periodic re-scans only feed unprocessed matches
    h.observer.run_for(30_000);
    assert_eq!(count.get(), 1);

    h.observer.force_scan(Some(".foo")).unwrap();
    h.observer.run_pending();
    assert_eq!(count.get(), 2);
}

#[test]
fn test_self_originated_changes_are_ignored() {
    let mut h = Harness::new(ObserverConfig::default());
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".post").priority(Priority::Critical))
        .unwrap();
    h.start();

    let root = h.root();
    h.append(root, "div", &[("class", "post"), ("data-fco-processed", "1")]);
    h.flush();
    assert_eq!(count.get(), 0);
    assert_eq!(h.observer.filtered(FilterReason::SelfOriginated), 1);
}

#[test]
fn test_removed_nodes_leave_the_dedup_cache() {
    let mut h = Harness::new(ObserverConfig::default());
    h.start();
    let root = h.root();
    let post = h.append(root, "div", &[("class", "post")]);
    h.flush();
    let before = h.observer.stats().dedup_size;
    assert!(before >= 1);

    h.observer.tree_mut().remove(post).unwrap();
    h.flush();
    assert!(!h.observer.is_processed(post));
    assert!(h.observer.stats().dedup_size < before);
    assert_eq!(h.observer.filtered(FilterReason::Removal), 1);
}

#[test]
fn test_overflow_keeps_the_queue_bounded() {
    let config = ObserverConfig {
        max_queue_size: 4,
        overflow_policy: OverflowPolicy::Sample,
        ..ObserverConfig::default()
    };
    let mut h = Harness::new(config);
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".foo").priority(Priority::Critical))
        .unwrap();
    h.start();

    let root = h.root();
    for _ in 0..10 {
        h.append(root, "div", &[("class", "foo")]);
    }
    let primary = h.factory.latest(SourceKind::Primary).unwrap();
    h.feed_to(&primary);
    assert_eq!(h.observer.pump(), 10);

    let stats = h.observer.stats();
    assert_eq!(stats.queue_length, 4);
    assert_eq!(stats.dropped, 6);
    assert_eq!(stats.overflows, 1);

    h.observer.run_pending();
    assert_eq!(count.get(), 4);
    assert_eq!(h.observer.stats().queue_length, 0);
}

#[test]
fn test_drain_yields_when_over_budget() {
    let config = ObserverConfig {
        concurrency_limit: 1,
        max_processing_time_ms: 16,
        ..ObserverConfig::default()
    };
    let mut h = Harness::new(config);
    let clock = h.clock.clone();
    let count = Rc::new(Cell::new(0));
    let seen = Rc::clone(&count);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |_| {
                // slow subscriber
                clock.advance(10);
                seen.set(seen.get() + 1);
                Ok(())
            })
            .selector(".foo")
            .priority(Priority::Critical),
        )
        .unwrap();
    h.start();

    let root = h.root();
    for _ in 0..5 {
        h.append(root, "div", &[("class", "foo")]);
    }
    h.flush();

    assert_eq!(count.get(), 5);
    let stats = h.observer.stats();
    assert!(stats.yields >= 2);
    assert!(stats.batch_timings.samples >= 3);
    assert!(!h.observer.is_processing());
}

// ============================================================================
// Lifecycle and recovery
// ============================================================================

#[test]
fn test_destroy_releases_everything() {
    let mut h = Harness::new(ObserverConfig::default());
    let root = h.root();
    let host = h.append(root, "div", &[("class", "embed")]);
    h.observer.tree_mut().attach_scope(host).unwrap();

    h.observer
        .register_debounced(SubscriptionDescriptor::new(|_| Ok(())).selector(".foo"), 50)
        .unwrap();
    h.observer
        .register(
            SubscriptionDescriptor::new(|_| Err("always".into()))
                .selector(".foo")
                .priority(Priority::Normal),
        )
        .unwrap();
    h.start();
    h.append(root, "div", &[("class", "foo")]);
    h.flush();
    assert!(h.observer.scheduler().pending() > 0);
    assert!(h.factory.open_connections() >= 3);

    h.observer.destroy();

    assert_eq!(h.observer.scheduler().pending(), 0);
    assert_eq!(h.observer.connected_sources(), 0);
    assert_eq!(h.factory.open_connections(), 0);
    for handle in h.factory.handles() {
        assert_eq!(handle.connect_count(), handle.disconnect_count());
    }
    assert!(matches!(
        h.observer.register(SubscriptionDescriptor::new(|_| Ok(()))),
        Err(ObserverError::Destroyed)
    ));
    assert_eq!(h.observer.run_pending(), 0);
    assert_eq!(h.observer.stats().subscriptions, 0);
}

#[test]
fn test_pause_and_resume() {
    let mut h = Harness::new(ObserverConfig::default());
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".foo").priority(Priority::Critical))
        .unwrap();
    h.start();
    let root = h.root();
    h.append(root, "div", &[("class", "foo")]);
    h.flush();
    assert_eq!(count.get(), 1);

    h.observer.set_page_visible(false);
    assert_eq!(h.observer.mode(), EngineMode::Paused);
    assert_eq!(h.factory.open_connections(), 0);
    assert_eq!(h.observer.scheduler().pending(), 0);
    assert_eq!(h.observer.stats().dedup_size, 0);

    // changes while hidden go nowhere
    h.append(root, "div", &[("class", "foo")]);
    h.flush();
    assert_eq!(count.get(), 1);

    h.observer.set_page_visible(true);
    assert_eq!(h.observer.mode(), EngineMode::Active);
    h.observer.run_pending();
    // forced rescan after the dedup cache was cleared
    assert_eq!(count.get(), 3);
    assert!(h.factory.latest(SourceKind::Primary).unwrap().is_connected());
}

#[test]
fn test_recovery_entered_once_per_breach() {
    let config = ObserverConfig {
        error_threshold: 3,
        ..ObserverConfig::default()
    };
    let mut h = Harness::new(config);
    assert_eq!(h.start(), EngineMode::Active);
    let transitions = h.observer.stats().mode_transitions;

    for i in 0..10 {
        h.observer
            .report_systemic_error(format!("queue processing failed ({i})"))
            .unwrap();
    }
    assert_eq!(h.observer.mode(), EngineMode::RecoveryMode);
    let stats = h.observer.stats();
    assert_eq!(stats.mode_transitions, transitions + 1);
    assert_eq!(stats.systemic_errors, 10);
    assert!(!h.factory.latest(SourceKind::Primary).unwrap().is_connected());

    h.observer.run_for(1000);
    assert_eq!(h.observer.mode(), EngineMode::Active);
    assert!(h.factory.latest(SourceKind::Primary).unwrap().is_connected());
    assert_eq!(h.observer.stats().recovery_attempts, 1);
}

#[test]
fn test_exhausted_recovery_falls_back_to_polling() {
    let config = ObserverConfig {
        error_threshold: 1,
        ..ObserverConfig::default()
    };
    let mut h = Harness::new(config);
    h.start();
    h.factory.set_unavailable(SourceKind::Primary, true);
    h.observer.report_systemic_error("first").unwrap();
    h.observer.report_systemic_error("second").unwrap();
    assert_eq!(h.observer.mode(), EngineMode::RecoveryMode);

    // attempts at 1s, 3s and 7s
    h.observer.run_for(7000);
    assert_eq!(h.observer.mode(), EngineMode::FallbackMode);
    assert_eq!(h.observer.stats().recovery_attempts, 3);
    assert_eq!(h.factory.open_connections(), 0);

    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".post").priority(Priority::Critical))
        .unwrap();
    let root = h.root();
    h.append(root, "div", &[("class", "post")]);
    h.flush();
    assert_eq!(count.get(), 0);

    h.observer.run_for(2000);
    assert_eq!(count.get(), 1);
    assert_eq!(h.observer.mode(), EngineMode::FallbackMode);
}

#[test]
fn test_initialization_failure_goes_straight_to_fallback() {
    let mut h = Harness::new(ObserverConfig::default());
    h.factory.set_unavailable(SourceKind::Primary, true);
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".post").priority(Priority::Critical))
        .unwrap();
    let root = h.root();
    h.append(root, "div", &[("class", "post")]);

    assert_eq!(h.start(), EngineMode::FallbackMode);
    assert_eq!(h.observer.stats().mode_transitions, 1);
    h.observer.run_pending();
    assert_eq!(count.get(), 1);

    h.append(root, "div", &[("class", "post")]);
    h.observer.run_for(2000);
    assert_eq!(count.get(), 2);
}

#[test]
fn test_source_failure_counts_as_systemic() {
    let mut h = Harness::new(ObserverConfig::default());
    h.start();
    let primary = h.factory.latest(SourceKind::Primary).unwrap();
    primary.fail_next(SourceError::Disconnected {
        kind: SourceKind::Primary,
    });
    h.observer.run_pending();

    assert_eq!(h.observer.stats().systemic_errors, 1);
    assert_eq!(h.observer.mode(), EngineMode::Active);
    assert!(matches!(
        h.observer.last_systemic_error(),
        Some(ObserverError::Source(_))
    ));
}

// ============================================================================
// Redundant sources
// ============================================================================

#[test]
fn test_nested_scope_watchers() {
    let mut h = Harness::new(ObserverConfig::default());
    let root = h.root();
    let host = h.append(root, "div", &[("class", "embed")]);
    let scope = h.observer.tree_mut().attach_scope(host).unwrap();
    let existing = h.append(scope, "div", &[("class", "post")]);

    let sources = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&sources);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |ctx| {
                seen.borrow_mut().push((ctx.target(), ctx.source()));
                Ok(())
            })
            .selector(".post")
            .priority(Priority::Critical),
        )
        .unwrap();
    h.start();
    h.observer.run_pending();
    assert!(sources.borrow().iter().any(|&(node, _)| node == existing));

    let nested = h.factory.for_scope(SourceKind::Nested, scope).unwrap();
    assert!(nested.is_connected());

    let added = h.append(scope, "div", &[("class", "post")]);
    h.feed_to(&nested);
    h.observer.run_pending();
    assert!(sources.borrow().contains(&(added, SourceKind::Nested)));
    assert_eq!(h.observer.stats().nested_scopes, 1);

    // the watcher goes away with its scope
    h.observer.tree_mut().remove(host).unwrap();
    h.flush();
    assert!(!nested.is_connected());
    assert_eq!(nested.connect_count(), nested.disconnect_count());
}

#[test]
fn test_backup_watcher_catches_missed_insertions() {
    let mut h = Harness::new(ObserverConfig::default());
    let count = Rc::new(Cell::new(0));
    h.observer
        .register(counting(&count).selector(".foo").priority(Priority::Critical))
        .unwrap();
    h.start();

    let root = h.root();
    let foo = h.append(root, "div", &[("class", "foo")]);
    h.observer.tree_mut().set_attribute(foo, "title", "x").unwrap();
    let backup = h.factory.latest(SourceKind::Backup).unwrap();
    h.feed_to(&backup);
    h.observer.run_pending();

    assert_eq!(count.get(), 1);
    let stats = h.observer.stats();
    assert_eq!(stats.received_from(SourceKind::Backup), 2);
    assert_eq!(stats.filtered_for(FilterReason::NonStructural), 1);
}

#[test]
fn test_lazy_candidates_wait_for_the_viewport() {
    let mut h = Harness::new(ObserverConfig::default());
    let sources = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&sources);
    h.observer
        .register(
            SubscriptionDescriptor::new(move |ctx| {
                seen.borrow_mut().push(ctx.source());
                Ok(())
            })
            .selector("img")
            .priority(Priority::Critical),
        )
        .unwrap();
    h.start();

    let root = h.root();
    let img = h.append(root, "img", &[("src", "/attachments/1.png")]);
    h.observer
        .tree_mut()
        .set_layout(img, ElementVisibility::boxed(0.0, 3000.0, 400.0, 300.0))
        .unwrap();
    h.flush();
    assert!(sources.borrow().is_empty());
    assert_eq!(h.observer.stats().parked_lazy, 1);

    // still far away
    assert_eq!(h.observer.set_viewport(Viewport::new(0.0, 1000.0, 1280.0, 800.0)).unwrap(), 0);

    assert_eq!(h.observer.set_viewport(Viewport::new(0.0, 2100.0, 1280.0, 800.0)).unwrap(), 1);
    h.observer.run_pending();
    assert_eq!(*sources.borrow(), vec![SourceKind::Lazy]);
    assert_eq!(h.observer.stats().parked_lazy, 0);
}

#[test]
fn test_stats_serialize() {
    let mut h = Harness::new(ObserverConfig::default());
    h.start();
    let json = serde_json::to_value(h.observer.stats()).unwrap();
    assert_eq!(json["mode"], "active");
    assert_eq!(json["received"]["primary"], 0);
    assert!(json["batch_timings"]["counts"].is_array());
    assert_eq!(
        h.observer.subscription(&SubscriptionId::new("missing")).map(|s| s.runs()),
        None
    );
}
