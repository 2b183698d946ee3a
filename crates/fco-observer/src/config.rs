//! Observer Configuration
//!
//! Every tuned constant of the engine is a parameter here. Defaults match
//! what the forum scripts ran with.

use fco_dom::Selector;
use serde::Deserialize;

use crate::error::ObserverError;
use crate::page_state::PageRules;
use crate::queue::OverflowPolicy;

/// Engine configuration options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Dispatch queue bound
    pub max_queue_size: usize,
    /// What to do when an enqueue would exceed the bound
    pub overflow_policy: OverflowPolicy,
    /// Events pulled from the queue per batch
    pub mutation_batch_size: usize,
    /// Time budget per drain turn before yielding to the host (ms)
    pub max_processing_time_ms: u64,
    /// Targets per concurrency chunk
    pub concurrency_limit: usize,
    /// Levels below an inserted node that are expanded into targets
    pub max_traversal_depth: usize,

    /// Dedup cache bound
    pub dedup_max_entries: usize,
    /// Dedup entry lifetime (ms)
    pub dedup_ttl_ms: u64,

    /// Delay applied to the Normal lane (ms)
    pub normal_delay_ms: u64,
    /// Idle-callback timeout for the Low lane (ms)
    pub low_idle_timeout_ms: u64,
    /// Idle-callback timeout for the Idle lane (ms)
    pub idle_timeout_ms: u64,

    /// Retries per callback when the descriptor does not say
    pub default_max_retries: u32,
    /// Base of the exponential retry backoff (ms)
    pub default_backoff_base_ms: u64,

    /// Systemic errors tolerated inside the window
    pub error_threshold: usize,
    /// Sliding window for systemic errors (ms)
    pub error_window_ms: u64,
    /// Reconnect attempts before falling back to polling
    pub max_recovery_attempts: u32,
    /// Base of the exponential reconnect backoff (ms)
    pub recovery_backoff_base_ms: u64,
    /// Full re-scan period once in fallback mode (ms)
    pub polling_interval_ms: u64,

    /// Periodic re-scan period while active (ms); 0 disables
    pub rescan_interval_ms: u64,
    /// Watch the document root for direct structural changes
    pub enable_backup_watcher: bool,
    /// Attach watchers to encapsulated sub-trees found while scanning
    pub enable_nested_watchers: bool,
    /// Defer off-screen media until it nears the viewport
    pub enable_lazy_watcher: bool,
    /// Distance from the viewport at which parked candidates are released (px)
    pub lazy_margin_px: f32,
    /// Elements handled lazily
    pub lazy_selector: String,

    /// Attribute subscribers put on nodes they produce
    pub marker_attribute: String,
    /// Content catalogue walked by re-scans
    pub content_selectors: Vec<String>,
    /// Style properties whose change is worth reprocessing
    pub layout_properties: Vec<String>,
    /// Page classification rules
    pub page_rules: PageRules,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        let strings = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            max_queue_size: 1000,
            overflow_policy: OverflowPolicy::Throttle,
            mutation_batch_size: 50,
            max_processing_time_ms: 16,
            concurrency_limit: 5,
            max_traversal_depth: 10,
            dedup_max_entries: 5000,
            dedup_ttl_ms: 300_000,
            normal_delay_ms: 16,
            low_idle_timeout_ms: 1000,
            idle_timeout_ms: 2000,
            default_max_retries: 3,
            default_backoff_base_ms: 100,
            error_threshold: 10,
            error_window_ms: 60_000,
            max_recovery_attempts: 3,
            recovery_backoff_base_ms: 1000,
            polling_interval_ms: 2000,
            rescan_interval_ms: 30_000,
            enable_backup_watcher: true,
            enable_nested_watchers: true,
            enable_lazy_watcher: true,
            lazy_margin_px: 200.0,
            lazy_selector: "img, iframe, video".into(),
            marker_attribute: "data-fco-processed".into(),
            content_selectors: strings(&[
                ".postbit",
                ".postcontainer",
                ".post",
                ".quote",
                ".bbcode_quote",
                ".spoiler",
                ".signature",
                "blockquote",
                "img",
                "iframe",
                "video",
            ]),
            layout_properties: strings(&[
                "display",
                "visibility",
                "opacity",
                "width",
                "height",
                "max-width",
                "max-height",
                "position",
                "overflow",
            ]),
            page_rules: PageRules::default(),
        }
    }
}

impl ObserverConfig {
    /// Parse from JSON; missing keys keep their defaults
    pub fn from_json(text: &str) -> Result<Self, ObserverError> {
        let config: ObserverConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ObserverError> {
        let positive = [
            ("max_queue_size", self.max_queue_size),
            ("mutation_batch_size", self.mutation_batch_size),
            ("concurrency_limit", self.concurrency_limit),
            ("dedup_max_entries", self.dedup_max_entries),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ObserverError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.polling_interval_ms == 0 {
            return Err(ObserverError::InvalidConfig(
                "polling_interval_ms must be positive".into(),
            ));
        }
        if self.error_threshold == 0 {
            return Err(ObserverError::InvalidConfig("error_threshold must be positive".into()));
        }
        if self.marker_attribute.trim().is_empty() {
            return Err(ObserverError::InvalidConfig("marker_attribute is empty".into()));
        }

        Selector::parse(&self.lazy_selector)?;
        for selector in &self.content_selectors {
            Selector::parse(selector)?;
        }
        Ok(())
    }

    /// Content catalogue as parsed selectors
    pub(crate) fn catalogue(&self) -> Vec<Selector> {
        self.content_selectors
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .collect()
    }
}
