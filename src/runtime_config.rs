// =============================================================================
// Runtime Configuration — every tunable constant in one place
// =============================================================================
//
// The scoring, suspicion, and blending parameters that shape system behaviour
// all live here; nothing else in the codebase hard-codes them. Persistence
// uses an atomic tmp + rename pattern to prevent corruption on crash. All
// fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_tau_hours() -> f64 {
    48.0
}

fn default_delta_cap() -> f64 {
    20.0
}

fn default_suspicious_delta() -> f64 {
    15.0
}

fn default_ewma_alpha() -> f64 {
    0.25
}

fn default_neutral_score() -> f64 {
    50.0
}

fn default_max_single_source_influence_24h() -> f64 {
    0.35
}

fn default_rolling_window_hours() -> i64 {
    24
}

fn default_min_price() -> f64 {
    0.0
}

fn default_max_price() -> f64 {
    100.0
}

fn default_similarity_duplicate() -> f64 {
    0.88
}

fn default_similarity_group() -> f64 {
    0.78
}

fn default_llm_quick_threshold() -> f64 {
    0.45
}

fn default_scrape_poll_interval_secs() -> u64 {
    300
}

fn default_market_fetch_timeout_secs() -> u64 {
    5
}

fn default_max_summary_chars() -> usize {
    2000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Reality scoring ----------------------------------------------------

    /// Exponential decay time constant toward neutral, in hours.
    #[serde(default = "default_tau_hours")]
    pub tau_hours: f64,

    /// Maximum absolute score change a single event may contribute.
    #[serde(default = "default_delta_cap")]
    pub delta_cap: f64,

    /// EWMA smoothing factor applied to score and final-price commits.
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    /// The score every instrument decays toward.
    #[serde(default = "default_neutral_score")]
    pub neutral_score: f64,

    // --- Anti-manipulation --------------------------------------------------

    /// Absolute impact beyond which an event is quarantined for review.
    #[serde(default = "default_suspicious_delta")]
    pub suspicious_delta: f64,

    /// Maximum share of a symbol's 24h impact a single source may carry.
    #[serde(default = "default_max_single_source_influence_24h")]
    pub max_single_source_influence_24h: f64,

    /// Width of the rolling source-influence window, in hours.
    #[serde(default = "default_rolling_window_hours")]
    pub rolling_window_hours: i64,

    // --- Price bounds -------------------------------------------------------

    /// Global floor for scores and prices.
    #[serde(default = "default_min_price")]
    pub min_price: f64,

    /// Global ceiling for scores and prices.
    #[serde(default = "default_max_price")]
    pub max_price: f64,

    // --- Event-producer contract --------------------------------------------
    // These govern the external producer (scraper / scorer); they are pinned
    // here so that both sides read the same numbers.

    /// Cosine similarity above which two articles are the same story.
    #[serde(default = "default_similarity_duplicate")]
    pub similarity_duplicate: f64,

    /// Cosine similarity above which articles are grouped into one event.
    #[serde(default = "default_similarity_group")]
    pub similarity_group: f64,

    /// Quick-score magnitude below which the producer skips the LLM.
    #[serde(default = "default_llm_quick_threshold")]
    pub llm_quick_threshold: f64,

    /// How often the producer polls its feeds, in seconds.
    #[serde(default = "default_scrape_poll_interval_secs")]
    pub scrape_poll_interval_secs: u64,

    // --- Service plumbing ---------------------------------------------------

    /// Timeout for fetching market pressure from the matching service.
    #[serde(default = "default_market_fetch_timeout_secs")]
    pub market_fetch_timeout_secs: u64,

    /// Maximum accepted event summary length.
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tau_hours: default_tau_hours(),
            delta_cap: default_delta_cap(),
            ewma_alpha: default_ewma_alpha(),
            neutral_score: default_neutral_score(),
            suspicious_delta: default_suspicious_delta(),
            max_single_source_influence_24h: default_max_single_source_influence_24h(),
            rolling_window_hours: default_rolling_window_hours(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            similarity_duplicate: default_similarity_duplicate(),
            similarity_group: default_similarity_group(),
            llm_quick_threshold: default_llm_quick_threshold(),
            scrape_poll_interval_secs: default_scrape_poll_interval_secs(),
            market_fetch_timeout_secs: default_market_fetch_timeout_secs(),
            max_summary_chars: default_max_summary_chars(),
        }
    }
}

impl RuntimeConfig {
    /// Decay time constant in seconds.
    pub fn tau_seconds(&self) -> f64 {
        self.tau_hours * 3600.0
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            tau_hours = config.tau_hours,
            delta_cap = config.delta_cap,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
