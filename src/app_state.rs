// =============================================================================
// Central Application State — Meridian reality market
// =============================================================================
//
// The single source of truth for the process. All subsystems hold Arc
// references to their collaborators; AppState ties them together for the API
// layer.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the runtime config.
//   - One async mutex per symbol (the "critical region"): every score
//     mutation for a symbol happens under its lock, and the only await held
//     inside it is the persistence step that finalises the region.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::audit::AuditDesk;
use crate::blender::{BlendScheduler, Blender, MarketFeed};
use crate::broadcast::Broadcaster;
use crate::ingest::gateway::IngestGateway;
use crate::matching::MatchingEngine;
use crate::runtime_config::RuntimeConfig;
use crate::scoring::RealityEngine;
use crate::store::Db;

// =============================================================================
// Per-symbol serialization points
// =============================================================================

/// One async mutex per symbol. No critical region ever spans two symbols;
/// multi-symbol events take each symbol's region in turn.
pub struct SymbolLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the lock for `symbol`.
    pub fn for_symbol(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for SymbolLocks {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared application state, wrapped in `Arc` at startup.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation; the health endpoint exposes it.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub db: Arc<Db>,
    pub broadcaster: Broadcaster,

    pub reality: Arc<RealityEngine>,
    pub matching: Arc<MatchingEngine>,
    pub blender: Arc<Blender>,
    pub gateway: Arc<IngestGateway>,
    pub audit: Arc<AuditDesk>,
    pub blend_scheduler: Arc<BlendScheduler>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire up every subsystem. Returns the state and the blend-trigger
    /// receiver the caller hands to [`crate::blender::run_blend_worker`].
    ///
    /// When `orderbook_url` is set the blender fetches market pressure from
    /// that service over HTTP; otherwise it reads the in-process engine.
    pub fn new(
        config: RuntimeConfig,
        db: Arc<Db>,
        ingest_secret: String,
        orderbook_url: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let market_timeout =
            std::time::Duration::from_secs(config.market_fetch_timeout_secs);
        let runtime_config = Arc::new(RwLock::new(config));
        let broadcaster = Broadcaster::new();
        let locks = Arc::new(SymbolLocks::new());

        let (scheduler, blend_rx) = BlendScheduler::new();
        let blend_scheduler = Arc::new(scheduler);

        let matching = Arc::new(MatchingEngine::new(
            db.clone(),
            runtime_config.clone(),
            broadcaster.clone(),
            blend_scheduler.clone(),
        ));

        let feed = match orderbook_url {
            Some(url) => MarketFeed::remote(url, market_timeout),
            None => MarketFeed::Local(matching.clone()),
        };
        let blender = Arc::new(Blender::new(
            db.clone(),
            feed,
            broadcaster.clone(),
            runtime_config.clone(),
            locks.clone(),
        ));

        let reality = Arc::new(RealityEngine::new(db.clone(), runtime_config.clone()));

        let gateway = Arc::new(IngestGateway::new(
            db.clone(),
            locks,
            blender.clone(),
            broadcaster.clone(),
            runtime_config.clone(),
            ingest_secret,
        ));

        let audit = Arc::new(AuditDesk::new(
            db.clone(),
            gateway.clone(),
            broadcaster.clone(),
        ));

        let state = Arc::new(Self {
            state_version: AtomicU64::new(1),
            runtime_config,
            db,
            broadcaster,
            reality,
            matching,
            blender,
            gateway,
            audit,
            blend_scheduler,
            start_time: std::time::Instant::now(),
        });

        (state, blend_rx)
    }

    /// Atomically increment the state version.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Read the current state version without modifying it.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }
}
