//! fOS Forum Core Observer
//!
//! Change-dispatch engine for forum pages: watches a live, externally
//! mutated tree, decides which changes matter, batches them under a time
//! budget and fans matching targets out to registered subscribers across
//! five priority lanes. Falls back to re-scans and polling when change
//! notification is unreliable.
//!
//! # Example
//! ```rust,ignore
//! use fco_dom::DomTree;
//! use fco_observer::{FeedFactory, Observer, ObserverConfig, Priority,
//!     SubscriptionDescriptor, VirtualScheduler};
//!
//! let factory = FeedFactory::new();
//! let mut observer = Observer::new(DomTree::new(), VirtualScheduler::new(),
//!     factory.clone(), ObserverConfig::default())?;
//! observer.register(
//!     SubscriptionDescriptor::new(|ctx| { /* rewrite ctx.target() */ Ok(()) })
//!         .selector(".postbit")
//!         .priority(Priority::High),
//! )?;
//! observer.start()?;
//! observer.run_pending();
//! ```

mod config;
mod dedup;
mod error;
mod event;
mod executor;
mod filter;
mod observer;
mod page_state;
mod queue;
mod recovery;
mod redundancy;
mod registry;
mod scheduler;
mod source;
mod stats;

pub use config::ObserverConfig;
pub use dedup::DedupCache;
pub use error::{CallbackError, ObserverError, SourceError};
pub use event::{ChangeEvent, ChangeKind};
pub use executor::{CallbackContext, Command, lane_deferral};
pub use filter::{ChangeFilter, DedupCheck, FilterReason};
pub use observer::{Observer, drive};
pub use page_state::{Location, PageRules, PageState, PageType};
pub use queue::{DispatchQueue, EnqueueOutcome, OverflowPolicy};
pub use recovery::{EngineMode, RecoveryManager};
pub use redundancy::SCAN_DEPTH;
pub use registry::{
    Callback, Dependency, Priority, Registry, RetryPolicy, Subscription, SubscriptionDescriptor,
    SubscriptionId,
};
pub use scheduler::{
    Deferral, Job, Scheduler, TaskHandle, VirtualClock, VirtualScheduler, WallClockScheduler,
};
pub use source::{ChangeSource, FeedFactory, FeedHandle, FeedSource, SourceFactory, SourceKind};
pub use stats::{ObserverStats, TimingHistogram};

pub use fco_dom::NodeId;
