//! Observer engine
//!
//! Wires the pipeline together:
//!
//! ```text
//! sources ─▶ ChangeFilter ─▶ DispatchQueue ─▶ drain (batch, expand)
//!        ─▶ Registry::matching ─▶ lanes ─▶ callbacks
//! ```
//!
//! The engine is single-threaded and host driven. Sources are polled by
//! [`Observer::pump`]; deferred work sits in the host [`Scheduler`] until
//! [`Observer::run_pending`] runs it.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use fco_dom::{NodeId, Selector, TreeAccess, Viewport, descendants};

use crate::config::ObserverConfig;
use crate::dedup::DedupCache;
use crate::error::ObserverError;
use crate::event::{ChangeEvent, ChangeKind};
use crate::executor::{self, Command, Dispatch, Executor, LaneBuffer, Outcome};
use crate::filter::{ChangeFilter, DedupCheck, FilterReason, owning_element};
use crate::page_state::{Location, PageState};
use crate::queue::DispatchQueue;
use crate::recovery::{EngineMode, RecoveryManager};
use crate::redundancy::{LazyWatcher, Redundancy, discover_scopes, scan_targets};
use crate::registry::{
    Priority, Registry, RetryPolicy, Subscription, SubscriptionDescriptor, SubscriptionId,
};
use crate::scheduler::{
    Deferral, Job, JobKind, Scheduler, TaskHandle, VirtualScheduler, WallClockScheduler,
};
use crate::source::{SourceFactory, SourceKind};
use crate::stats::{Counters, ObserverStats};

/// Change-dispatch engine over a host tree `T`, scheduled by `S`
pub struct Observer<T: TreeAccess, S: Scheduler> {
    tree: T,
    scheduler: S,
    factory: Box<dyn SourceFactory>,
    config: ObserverConfig,

    filter: ChangeFilter,
    catalogue: Vec<Selector>,
    recovery: RecoveryManager,
    registry: Registry,
    dedup: DedupCache,
    queue: DispatchQueue,
    executor: Executor,
    redundancy: Redundancy,
    lazy: LazyWatcher,

    location: Location,
    viewport: Viewport,
    page: PageState,
    page_visible: bool,

    /// Expanded targets not yet processed
    carry: VecDeque<(NodeId, SourceKind)>,
    /// Single-flight guard of the drain loop
    processing: bool,
    drain_task: Option<TaskHandle>,
    rescan_task: Option<TaskHandle>,
    poll_task: Option<TaskHandle>,
    /// Every job this engine has scheduled and not yet run
    tasks: HashSet<TaskHandle>,

    initial_scan_done: bool,
    destroyed: bool,
    last_systemic_error: Option<ObserverError>,
    counters: Counters,
}

impl<T: TreeAccess, S: Scheduler> Observer<T, S> {
    /// Build an engine; nothing is connected until [`start`](Self::start)
    pub fn new(
        tree: T,
        scheduler: S,
        factory: impl SourceFactory + 'static,
        config: ObserverConfig,
    ) -> Result<Self, ObserverError> {
        config.validate()?;
        let lazy_selector = Selector::parse(&config.lazy_selector)?;
        let location = Location::parse("/");
        let viewport = Viewport::default();
        let page = PageState::snapshot(&location, &tree, viewport, &config.page_rules);

        Ok(Self {
            filter: ChangeFilter::new(&config),
            catalogue: config.catalogue(),
            recovery: RecoveryManager::new(
                config.error_threshold,
                config.error_window_ms,
                config.max_recovery_attempts,
                config.recovery_backoff_base_ms,
            ),
            registry: Registry::new(),
            dedup: DedupCache::new(config.dedup_max_entries, config.dedup_ttl_ms),
            queue: DispatchQueue::new(config.max_queue_size, config.overflow_policy),
            executor: Executor::default(),
            redundancy: Redundancy::default(),
            lazy: LazyWatcher::new(lazy_selector, config.lazy_margin_px),
            location,
            viewport,
            page,
            page_visible: true,
            carry: VecDeque::new(),
            processing: false,
            drain_task: None,
            rescan_task: None,
            poll_task: None,
            tasks: HashSet::new(),
            initial_scan_done: false,
            destroyed: false,
            last_systemic_error: None,
            counters: Counters::default(),
            tree,
            scheduler,
            factory: Box::new(factory),
            config,
        })
    }

    fn ensure_alive(&self) -> Result<(), ObserverError> {
        if self.destroyed {
            Err(ObserverError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn now(&self) -> u64 {
        self.scheduler.now_ms()
    }

    /// Does the engine currently react to changes?
    fn is_running(&self) -> bool {
        !self.destroyed
            && matches!(
                self.recovery.mode(),
                EngineMode::Active | EngineMode::RecoveryMode | EngineMode::FallbackMode
            )
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect the primary source and run the first full scan.
    ///
    /// A primary source that cannot be set up sends the engine straight to
    /// [`EngineMode::FallbackMode`].
    pub fn start(&mut self) -> Result<EngineMode, ObserverError> {
        self.ensure_alive()?;
        if self.recovery.mode() != EngineMode::Uninitialized {
            return Ok(self.recovery.mode());
        }
        let root = self.tree.root();

        if let Err(err) = self.redundancy.connect_primary(self.factory.as_mut(), root) {
            tracing::warn!(%err, "primary change source unavailable, polling instead");
            self.record_systemic(err.into());
            self.recovery.transition(EngineMode::FallbackMode);
            self.lazy.set_active(self.config.enable_lazy_watcher);
            self.scan(None, false);
            self.initial_scan_done = true;
            self.schedule_poll();
            return Ok(self.recovery.mode());
        }

        if self.config.enable_backup_watcher {
            if let Err(err) = self.redundancy.connect_backup(self.factory.as_mut(), root) {
                tracing::warn!(%err, "backup watcher unavailable");
                self.record_systemic(err.into());
            }
        }
        self.lazy.set_active(self.config.enable_lazy_watcher);

        let found = self.scan(None, false);
        self.initial_scan_done = true;
        self.recovery.transition(EngineMode::Active);
        self.schedule_rescan();
        tracing::info!(
            subscriptions = self.registry.len(),
            found,
            sources = self.connected_sources(),
            "observer started"
        );
        Ok(self.recovery.mode())
    }

    /// Disconnect everything and drop all state. The engine stays inert.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.redundancy.disconnect_all();
        self.lazy.set_active(false);
        self.cancel_all_tasks();
        self.clear_pipeline();
        self.registry.clear();
        self.recovery.reset();
        self.initial_scan_done = false;
        self.destroyed = true;
        tracing::info!("observer destroyed");
    }

    /// Page visibility changed
    pub fn set_page_visible(&mut self, visible: bool) {
        if self.destroyed || self.page_visible == visible {
            return;
        }
        self.page_visible = visible;
        match (visible, self.recovery.mode()) {
            (false, EngineMode::Active) => self.pause(),
            (true, EngineMode::Paused) => self.resume(),
            (_, mode) => tracing::debug!(visible, %mode, "visibility change ignored"),
        }
    }

    fn pause(&mut self) {
        if !self.recovery.transition(EngineMode::Paused) {
            return;
        }
        self.redundancy.disconnect_all();
        self.lazy.set_active(false);
        self.cancel_all_tasks();
        self.clear_pipeline();
    }

    fn resume(&mut self) {
        if !self.recovery.transition(EngineMode::Active) {
            return;
        }
        let root = self.tree.root();
        if let Err(err) = self.redundancy.connect_primary(self.factory.as_mut(), root) {
            tracing::warn!(%err, "primary change source failed to reconnect");
            self.record_systemic(err.into());
            self.enter_recovery();
        } else if self.config.enable_backup_watcher {
            if let Err(err) = self.redundancy.connect_backup(self.factory.as_mut(), root) {
                tracing::warn!(%err, "backup watcher failed to reconnect");
                self.record_systemic(err.into());
            }
        }
        self.lazy.set_active(self.config.enable_lazy_watcher);
        if self.recovery.mode() == EngineMode::Active {
            self.schedule_rescan();
        }
        self.scan(None, true);
    }

    /// Queue, carry, caches and parked work
    fn clear_pipeline(&mut self) {
        let queued = self.queue.clear();
        let carried = self.carry.len();
        self.carry.clear();
        self.dedup.clear();
        self.executor.clear();
        self.lazy.clear();
        for sub in self.registry.iter_mut() {
            if let Some(debounce) = sub.debounce.as_mut() {
                debounce.pending.clear();
                debounce.timer = None;
            }
        }
        self.processing = false;
        tracing::debug!(queued, carried, "pipeline cleared");
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a subscriber; returns its id
    pub fn register(
        &mut self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<SubscriptionId, ObserverError> {
        self.register_with(descriptor, None)
    }

    /// Register a subscriber whose matches are collapsed over `delay_ms`
    pub fn register_debounced(
        &mut self,
        descriptor: SubscriptionDescriptor,
        delay_ms: u64,
    ) -> Result<SubscriptionId, ObserverError> {
        self.register_with(descriptor, Some(delay_ms))
    }

    fn register_with(
        &mut self,
        mut descriptor: SubscriptionDescriptor,
        debounce_ms: Option<u64>,
    ) -> Result<SubscriptionId, ObserverError> {
        self.ensure_alive()?;
        let id = match descriptor.take_id() {
            Some(id) => SubscriptionId::new(id),
            None => self.registry.next_id(),
        };
        let default_retry = RetryPolicy {
            max_retries: self.config.default_max_retries,
            backoff_base_ms: self.config.default_backoff_base_ms,
        };
        let subscription =
            Subscription::from_descriptor(descriptor, id.clone(), default_retry, debounce_ms)?;
        let has_selector = subscription.selector().is_some();
        let priority = subscription.priority();

        if let Some(previous) = self.registry.insert(subscription) {
            tracing::debug!(%id, "subscription replaced");
            self.release(previous);
        }
        tracing::info!(%id, ?priority, debounce_ms, "subscription registered");

        if self.initial_scan_done && has_selector && self.is_running() {
            self.late_scan(&id);
        }
        Ok(id)
    }

    /// Remove a subscription and cancel its timers
    pub fn unregister(&mut self, id: &SubscriptionId) -> bool {
        if self.destroyed {
            return false;
        }
        match self.registry.remove(id) {
            Some(subscription) => {
                self.release(subscription);
                tracing::info!(%id, "subscription removed");
                true
            }
            None => false,
        }
    }

    fn release(&mut self, subscription: Subscription) {
        if let Some(handle) = subscription.debounce.and_then(|d| d.timer) {
            self.cancel_task(handle);
        }
        for handle in self.executor.drop_subscription(&subscription.id) {
            self.cancel_task(handle);
        }
    }

    /// Hand every current match to a subscription registered late, whether
    /// or not the pipeline has processed it. The dedup cache is left alone.
    fn late_scan(&mut self, id: &SubscriptionId) {
        let Some((selector, priority)) = self
            .registry
            .get(id)
            .and_then(|s| s.selector().cloned().map(|sel| (sel, s.priority())))
        else {
            return;
        };
        let scopes = discover_scopes(&self.tree, self.tree.root());
        let targets = scan_targets(&self.tree, &scopes, &[selector]);
        let depth = self.config.max_traversal_depth;

        let mut lanes = LaneBuffer::default();
        let mut dispatched = 0usize;
        for target in targets {
            let matches = self
                .registry
                .get(id)
                .is_some_and(|s| s.matches(&self.tree, target, &self.page, depth));
            if !matches {
                continue;
            }
            dispatched += 1;
            self.route(
                Dispatch {
                    id: id.clone(),
                    target,
                    source: SourceKind::Rescan,
                    attempt: 1,
                },
                priority,
                &mut lanes,
            );
        }
        self.flush_lanes(lanes);
        tracing::debug!(%id, dispatched, "late registration scan");
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Re-walk the tree. Without a selector the content catalogue plus every
    /// subscription selector is used. A forced scan takes the matches out of
    /// the dedup cache first.
    pub fn force_scan(&mut self, selector: Option<&str>) -> Result<usize, ObserverError> {
        self.ensure_alive()?;
        let selector = selector.map(Selector::parse).transpose()?;
        if !self.is_running() {
            return Ok(0);
        }
        Ok(self.scan(selector, true))
    }

    fn scan(&mut self, only: Option<Selector>, forced: bool) -> usize {
        let root = self.tree.root();
        let scopes = discover_scopes(&self.tree, root);
        if self.config.enable_nested_watchers && self.redundancy.primary_connected() {
            for &scope in scopes.iter().skip(1) {
                self.attach_nested(scope);
            }
        }

        let selectors: Vec<Selector> = match only {
            Some(selector) => vec![selector],
            None => self
                .catalogue
                .iter()
                .cloned()
                .chain(self.registry.iter().filter_map(|s| s.selector().cloned()))
                .collect(),
        };
        let targets = scan_targets(&self.tree, &scopes, &selectors);
        if forced {
            for &target in &targets {
                self.dedup.remove(target);
            }
        }

        let found = targets.len();
        let events = targets
            .into_iter()
            .map(|target| ChangeEvent::insertion(target).with_source(SourceKind::Rescan))
            .collect();
        let check = if forced {
            DedupCheck::Skip
        } else {
            DedupCheck::SelfOrAncestor
        };
        let accepted = self.admit(events, check);
        tracing::debug!(found, accepted, forced, "tree scanned");
        found
    }

    fn attach_nested(&mut self, scope: NodeId) {
        match self.redundancy.attach_nested(self.factory.as_mut(), scope) {
            Ok(true) => {
                tracing::debug!(%scope, "nested watcher attached");
                // content that was already there when the watcher arrived
                let events = self
                    .tree
                    .children(scope)
                    .into_iter()
                    .map(|child| ChangeEvent::insertion(child).with_source(SourceKind::Nested))
                    .collect();
                self.admit(events, DedupCheck::SelfOrAncestor);
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(%scope, %err, "nested watcher failed");
                self.on_systemic_error(err.into());
            }
        }
    }

    // ========================================================================
    // Intake
    // ========================================================================

    /// Collect pending changes from every connected source, filter them and
    /// enqueue the relevant ones. Returns the number of events collected.
    pub fn pump(&mut self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let (events, errors) = self.redundancy.collect();
        for err in errors {
            tracing::warn!(%err, "change source failed");
            self.on_systemic_error(err.into());
        }
        let collected = events.len();
        if collected > 0 {
            self.admit(events, DedupCheck::SelfOrAncestor);
        }
        collected
    }

    /// Filter and enqueue; returns the number of events accepted
    fn admit(&mut self, events: Vec<ChangeEvent>, check: DedupCheck) -> usize {
        let now = self.now();
        let mut accepted = Vec::with_capacity(events.len());
        let mut removals = false;

        for event in events {
            self.counters.received(event.source());
            if event.kind() == ChangeKind::Removal {
                removals = true;
            }
            match self.filter.check(&event, &self.tree, &self.dedup, now, check) {
                Ok(()) => accepted.push(event),
                Err(reason) => {
                    tracing::trace!(node = %event.target(), %reason, "change filtered");
                    self.counters.filtered(reason);
                }
            }
        }

        if removals {
            let purged = self.dedup.purge_detached(&self.tree);
            let pruned = self.redundancy.prune_nested(&self.tree);
            self.lazy.purge_detached(&self.tree);
            tracing::trace!(purged, pruned, "removed nodes forgotten");
        }

        if accepted.is_empty() {
            return 0;
        }
        let outcome = self.queue.enqueue(accepted);
        self.counters.enqueued += outcome.accepted as u64;
        self.kick_drain();
        outcome.accepted
    }

    // ========================================================================
    // Drain
    // ========================================================================

    fn kick_drain(&mut self) {
        if !self.processing && self.drain_task.is_none() {
            self.drain_task = Some(self.schedule(Deferral::Immediate, JobKind::Drain));
        }
    }

    /// Single-flight drain loop; yields once the time budget is spent
    fn drain(&mut self) {
        if self.processing {
            return;
        }
        self.processing = true;
        let started = self.now();
        let mut yielded = false;

        loop {
            if self.destroyed || !self.is_running() {
                break;
            }
            if self.carry.is_empty() {
                if self.queue.is_empty() {
                    break;
                }
                let batch = self.queue.dequeue_batch(self.config.mutation_batch_size);
                self.expand(batch);
                continue;
            }

            let take = self.config.concurrency_limit.min(self.carry.len());
            let chunk: Vec<(NodeId, SourceKind)> = self.carry.drain(..take).collect();
            self.process_chunk(chunk);

            let elapsed = self.now().saturating_sub(started);
            let more = !self.carry.is_empty() || !self.queue.is_empty();
            if more && elapsed > self.config.max_processing_time_ms {
                yielded = true;
                break;
            }
        }

        self.processing = false;
        let elapsed = self.now().saturating_sub(started);
        self.counters.batches.record(elapsed);
        if yielded && !self.destroyed {
            self.counters.yields += 1;
            tracing::debug!(
                elapsed_ms = elapsed,
                carried = self.carry.len(),
                queued = self.queue.len(),
                "drain yielded"
            );
            self.drain_task = Some(self.schedule(Deferral::Delayed { ms: 0 }, JobKind::Drain));
        }
    }

    /// Turn a batch of events into a deduplicated list of affected targets
    fn expand(&mut self, batch: Vec<ChangeEvent>) {
        let depth = self.config.max_traversal_depth;
        let nested = self.config.enable_nested_watchers && self.redundancy.primary_connected();
        let mut seen: HashSet<NodeId> = self.carry.iter().map(|&(node, _)| node).collect();
        let mut scopes = Vec::new();
        let before = self.carry.len();

        for event in batch {
            let target = event.target();
            if !self.tree.contains(target) {
                continue;
            }
            let Some(element) = owning_element(&self.tree, target) else {
                continue;
            };
            let mut affected = vec![element];
            if event.kind() == ChangeKind::Insertion && element == target {
                affected.extend(descendants(&self.tree, element, depth));
                if nested {
                    scopes.extend(
                        discover_scopes(&self.tree, element)
                            .into_iter()
                            .skip(1),
                    );
                }
            }

            for node in affected {
                if !seen.insert(node) {
                    continue;
                }
                if self.lazy.should_defer(&self.tree, node, &self.viewport) {
                    if self.lazy.park(node) {
                        self.counters.lazy_parked += 1;
                        tracing::trace!(%node, "off-screen candidate parked");
                    }
                    continue;
                }
                self.carry.push_back((node, event.source()));
            }
        }

        for scope in scopes {
            self.attach_nested(scope);
        }
        tracing::trace!(targets = self.carry.len() - before, "batch expanded");
    }

    /// Process one concurrency chunk; High dispatches settle at its end
    fn process_chunk(&mut self, chunk: Vec<(NodeId, SourceKind)>) {
        let depth = self.config.max_traversal_depth;
        let mut lanes = LaneBuffer::default();

        for (target, source) in chunk {
            if !self.tree.contains(target) {
                continue;
            }
            let now = self.now();
            if self.dedup.contains(target, now) {
                continue;
            }
            self.dedup.insert(target, now);
            self.counters.processed_targets += 1;

            let matched = self.registry.matching(&self.tree, target, &self.page, depth);
            for (id, priority) in matched {
                self.route(
                    Dispatch {
                        id,
                        target,
                        source,
                        attempt: 1,
                    },
                    priority,
                    &mut lanes,
                );
            }
        }
        self.flush_lanes(lanes);
    }

    // ========================================================================
    // Lanes
    // ========================================================================

    fn route(&mut self, dispatch: Dispatch, priority: Priority, lanes: &mut LaneBuffer) {
        let debounced = self
            .registry
            .get(&dispatch.id)
            .is_some_and(Subscription::is_debounced);
        if debounced {
            self.debounce(dispatch);
            return;
        }
        match priority {
            Priority::Critical => self.dispatch_now(dispatch),
            other => lanes.push(other, dispatch),
        }
    }

    fn flush_lanes(&mut self, lanes: LaneBuffer) {
        for dispatch in lanes.high {
            self.dispatch_now(dispatch);
        }
        for (priority, dispatches) in lanes.deferred {
            if dispatches.is_empty() {
                continue;
            }
            let Some(deferral) = executor::lane_deferral(priority, &self.config) else {
                for dispatch in dispatches {
                    self.dispatch_now(dispatch);
                }
                continue;
            };
            let key = self.executor.park_lane(priority, dispatches);
            self.schedule(deferral, JobKind::Lane(key));
        }
    }

    fn run_lane(&mut self, key: u64) {
        let Some((priority, dispatches)) = self.executor.take_lane(key) else {
            return;
        };
        tracing::trace!(?priority, count = dispatches.len(), "lane running");
        for dispatch in dispatches {
            self.dispatch_now(dispatch);
        }
    }

    fn run_retry(&mut self, key: u64) {
        if let Some(dispatch) = self.executor.take_retry(key) {
            self.dispatch_now(dispatch);
        }
    }

    /// Invoke one callback; its failure stays here
    fn dispatch_now(&mut self, dispatch: Dispatch) {
        if self.destroyed || !self.tree.contains(dispatch.target) {
            return;
        }
        let now = self.now();
        let Some(subscription) = self.registry.get_mut(&dispatch.id) else {
            return;
        };
        let (outcome, commands) =
            executor::invoke(subscription, &dispatch, &self.tree, &self.page, now);
        self.counters.callbacks_run += 1;

        match outcome {
            Outcome::Success => {}
            Outcome::Retry { delay_ms } => {
                self.counters.callback_errors += 1;
                self.counters.retries += 1;
                let key = self.executor.park_retry(Dispatch {
                    attempt: dispatch.attempt + 1,
                    ..dispatch
                });
                let handle = self.schedule(Deferral::Delayed { ms: delay_ms }, JobKind::Retry(key));
                self.executor.bind_retry(key, handle);
            }
            Outcome::Abandoned => {
                self.counters.callback_errors += 1;
                self.counters.abandoned += 1;
            }
        }
        self.apply(commands);
    }

    fn apply(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Unregister(id) => {
                    self.unregister(&id);
                }
                Command::ForceScan(selector) => {
                    if self.is_running() {
                        self.scan(selector, true);
                    }
                }
            }
        }
    }

    /// Restart the debounce window of a subscription and remember the target
    fn debounce(&mut self, dispatch: Dispatch) {
        let Some(debounce) = self
            .registry
            .get_mut(&dispatch.id)
            .and_then(|s| s.debounce.as_mut())
        else {
            return;
        };
        if !debounce.pending.iter().any(|&(node, _)| node == dispatch.target) {
            debounce.pending.push((dispatch.target, dispatch.source));
        }
        let interval = debounce.interval_ms;
        let previous = debounce.timer.take();

        if let Some(handle) = previous {
            self.cancel_task(handle);
        }
        let handle = self.schedule(
            Deferral::Delayed { ms: interval },
            JobKind::Debounce(dispatch.id.clone()),
        );
        if let Some(debounce) = self
            .registry
            .get_mut(&dispatch.id)
            .and_then(|s| s.debounce.as_mut())
        {
            debounce.timer = Some(handle);
        }
    }

    fn flush_debounce(&mut self, id: &SubscriptionId) {
        let now = self.now();
        let Some(debounce) = self.registry.get_mut(id).and_then(|s| s.debounce.as_mut()) else {
            return;
        };
        debounce.timer = None;
        debounce.last_run_at = Some(now);
        let pending = std::mem::take(&mut debounce.pending);
        tracing::trace!(%id, targets = pending.len(), "debounce window closed");
        for (target, source) in pending {
            self.dispatch_now(Dispatch {
                id: id.clone(),
                target,
                source,
                attempt: 1,
            });
        }
    }

    // ========================================================================
    // Errors & recovery
    // ========================================================================

    /// Report a pipeline failure that happened outside the engine
    pub fn report_systemic_error(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), ObserverError> {
        self.ensure_alive()?;
        self.on_systemic_error(ObserverError::Systemic(reason.into()));
        Ok(())
    }

    fn record_systemic(&mut self, err: ObserverError) -> bool {
        let breached = self.recovery.record_error(self.now());
        self.last_systemic_error = Some(err);
        breached
    }

    fn on_systemic_error(&mut self, err: ObserverError) {
        tracing::warn!(%err, mode = %self.recovery.mode(), "systemic error");
        if self.record_systemic(err) {
            self.enter_recovery();
        }
    }

    fn enter_recovery(&mut self) {
        if !self.recovery.transition(EngineMode::RecoveryMode) {
            return;
        }
        self.redundancy.disconnect_primary();
        self.schedule_recover();
    }

    fn schedule_recover(&mut self) {
        let ms = self.recovery.next_backoff_ms();
        self.schedule(Deferral::Delayed { ms }, JobKind::Recover);
    }

    fn run_recover(&mut self) {
        if self.recovery.mode() != EngineMode::RecoveryMode {
            return;
        }
        let attempt = self.recovery.begin_attempt();
        let root = self.tree.root();
        match self.redundancy.connect_primary(self.factory.as_mut(), root) {
            Ok(()) => {
                tracing::info!(attempt, "primary change source reconnected");
                self.recovery.transition(EngineMode::Active);
                self.scan(None, false);
            }
            Err(err) => {
                tracing::warn!(attempt, %err, "reconnect attempt failed");
                self.last_systemic_error = Some(err.into());
                if self.recovery.attempts_exhausted() {
                    self.enter_fallback();
                } else {
                    self.schedule_recover();
                }
            }
        }
    }

    fn enter_fallback(&mut self) {
        if !self.recovery.transition(EngineMode::FallbackMode) {
            return;
        }
        self.redundancy.disconnect_all();
        if let Some(handle) = self.rescan_task.take() {
            self.cancel_task(handle);
        }
        self.schedule_poll();
    }

    // ========================================================================
    // Periodic work
    // ========================================================================

    fn schedule_rescan(&mut self) {
        if let Some(handle) = self.rescan_task.take() {
            self.cancel_task(handle);
        }
        let ms = self.config.rescan_interval_ms;
        if ms > 0 {
            self.rescan_task = Some(self.schedule(Deferral::Delayed { ms }, JobKind::Rescan));
        }
    }

    fn run_rescan(&mut self) {
        self.rescan_task = None;
        if !matches!(
            self.recovery.mode(),
            EngineMode::Active | EngineMode::RecoveryMode
        ) {
            return;
        }
        self.redundancy.prune_nested(&self.tree);
        self.dedup.evict_expired(self.now());
        self.scan(None, false);
        self.schedule_rescan();
    }

    fn schedule_poll(&mut self) {
        let ms = self.config.polling_interval_ms;
        self.poll_task = Some(self.schedule(Deferral::Delayed { ms }, JobKind::Poll));
    }

    fn run_poll(&mut self) {
        self.poll_task = None;
        if self.recovery.mode() != EngineMode::FallbackMode {
            return;
        }
        self.dedup.evict_expired(self.now());
        self.scan(None, false);
        self.schedule_poll();
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn schedule(&mut self, deferral: Deferral, kind: JobKind) -> TaskHandle {
        let handle = self.scheduler.schedule(deferral, Job(kind));
        self.tasks.insert(handle);
        handle
    }

    fn cancel_task(&mut self, handle: TaskHandle) {
        if self.tasks.remove(&handle) {
            self.scheduler.cancel(handle);
        }
    }

    fn cancel_all_tasks(&mut self) {
        for handle in self.tasks.drain() {
            self.scheduler.cancel(handle);
        }
        self.drain_task = None;
        self.rescan_task = None;
        self.poll_task = None;
    }

    /// Pump the sources, then run every job that is ready. Returns the
    /// number of jobs run.
    pub fn run_pending(&mut self) -> usize {
        if self.destroyed {
            return 0;
        }
        self.pump();
        let mut ran = 0;
        while let Some((handle, job)) = self.scheduler.next_ready() {
            if !self.tasks.remove(&handle) {
                continue;
            }
            self.run_job(job.0);
            ran += 1;
            if self.destroyed {
                break;
            }
        }
        ran
    }

    fn run_job(&mut self, kind: JobKind) {
        match kind {
            JobKind::Drain => {
                self.drain_task = None;
                self.drain();
            }
            JobKind::Lane(key) => self.run_lane(key),
            JobKind::Retry(key) => self.run_retry(key),
            JobKind::Debounce(id) => self.flush_debounce(&id),
            JobKind::Rescan => self.run_rescan(),
            JobKind::Poll => self.run_poll(),
            JobKind::Recover => self.run_recover(),
        }
    }

    // ========================================================================
    // Host inputs
    // ========================================================================

    /// The page navigated; recompute page state and rescan
    pub fn navigate(&mut self, location: Location) -> Result<(), ObserverError> {
        self.ensure_alive()?;
        self.location = location;
        self.refresh_page_state();
        if self.is_running() {
            self.scan(None, true);
        }
        Ok(())
    }

    /// The viewport moved or resized; releases lazy candidates that came
    /// within the margin
    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<usize, ObserverError> {
        self.ensure_alive()?;
        self.viewport = viewport;
        self.page.mobile = viewport.width < self.config.page_rules.mobile_breakpoint;
        if !self.is_running() || !self.lazy.is_active() {
            return Ok(0);
        }
        let released = self.lazy.release(&self.tree, &viewport);
        let count = released.len();
        if count > 0 {
            self.counters.lazy_released += count as u64;
            let events = released
                .into_iter()
                .map(|node| ChangeEvent::insertion(node).with_source(SourceKind::Lazy))
                .collect();
            self.admit(events, DedupCheck::Skip);
            tracing::debug!(count, "lazy candidates released");
        }
        Ok(count)
    }

    /// Recompute page classification from the current location and tree
    pub fn refresh_page_state(&mut self) -> PageState {
        self.page = PageState::snapshot(
            &self.location,
            &self.tree,
            self.viewport,
            &self.config.page_rules,
        );
        self.page
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn mode(&self) -> EngineMode {
        self.recovery.mode()
    }

    pub fn page_state(&self) -> &PageState {
        &self.page
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn tree(&self) -> &T {
        &self.tree
    }

    /// Mutable tree for the host; changes are only seen through sources
    pub fn tree_mut(&mut self) -> &mut T {
        &mut self.tree
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.scheduler
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<&Subscription> {
        self.registry.get(id)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn last_systemic_error(&self) -> Option<&ObserverError> {
        self.last_systemic_error.as_ref()
    }

    /// Change sources currently connected, the lazy watcher included
    pub fn connected_sources(&self) -> usize {
        self.redundancy.connected() + usize::from(self.lazy.is_active())
    }

    /// Was `node` processed and not yet evicted?
    pub fn is_processed(&self, node: NodeId) -> bool {
        self.dedup.contains(node, self.now())
    }

    /// Diagnostics snapshot
    pub fn stats(&self) -> ObserverStats {
        ObserverStats {
            mode: self.recovery.mode(),
            destroyed: self.destroyed,
            queue_length: self.queue.len(),
            received: ObserverStats::received_map(&self.counters),
            filtered: ObserverStats::filtered_map(&self.counters),
            enqueued: self.counters.enqueued,
            dropped: self.queue.dropped_total(),
            overflows: self.queue.overflow_count(),
            processed_targets: self.counters.processed_targets,
            callbacks_run: self.counters.callbacks_run,
            callback_errors: self.counters.callback_errors,
            retries: self.counters.retries,
            abandoned_callbacks: self.counters.abandoned,
            systemic_errors: self.recovery.systemic_errors(),
            mode_transitions: self.recovery.transitions(),
            recovery_attempts: self.recovery.recovery_attempts(),
            dedup_size: self.dedup.len(),
            dedup_evictions: self.dedup.evictions(),
            subscriptions: self.registry.len(),
            connected_sources: self.connected_sources(),
            nested_scopes: self.redundancy.nested_scopes().len(),
            pending_tasks: self.scheduler.pending(),
            pending_callbacks: self.executor.pending(),
            parked_lazy: self.lazy.parked(),
            lazy_parked: self.counters.lazy_parked,
            lazy_released: self.counters.lazy_released,
            yields: self.counters.yields,
            batch_timings: self.counters.batches.clone(),
        }
    }

    /// Events dropped by the filter for `reason`
    pub fn filtered(&self, reason: FilterReason) -> u64 {
        self.counters.filtered.get(&reason).copied().unwrap_or(0)
    }
}

impl<T: TreeAccess> Observer<T, VirtualScheduler> {
    /// Move virtual time forward by `ms`, running every job that falls due
    /// on the way. Returns the number of jobs run.
    pub fn run_for(&mut self, ms: u64) -> usize {
        let clock = self.scheduler.clock();
        let until = clock.now().saturating_add(ms);
        let mut ran = self.run_pending();
        while let Some(due) = self.scheduler.next_deadline_ms() {
            if due > until || due <= clock.now() || self.destroyed {
                break;
            }
            clock.set(due);
            ran += self.run_pending();
        }
        if clock.now() < until {
            clock.set(until);
            ran += self.run_pending();
        }
        ran
    }
}

/// Drive an observer on the wall clock until `until`, or until nothing is
/// scheduled and no source is connected. Sources are pumped at least every
/// `poll_every`.
pub async fn drive<T: TreeAccess>(
    observer: &mut Observer<T, WallClockScheduler>,
    until: Instant,
    poll_every: Duration,
) -> usize {
    let mut ran = 0;
    loop {
        ran += observer.run_pending();
        let now = Instant::now();
        if now >= until || observer.is_destroyed() {
            break;
        }
        if observer.scheduler().pending() == 0 && observer.connected_sources() == 0 {
            break;
        }
        let mut wake = (now + poll_every).min(until);
        if let Some(deadline) = observer.scheduler().next_deadline() {
            wake = wake.min(deadline);
        }
        smol::Timer::at(wake).await;
    }
    ran
}
