//! Top-level transport orchestration.
//!
//! [`TransportOrchestrator`] turns a transport kind into a connected
//! session: it loads the catalog for that transport, races candidates
//! through a [`ConnectionPool`], then hands the winner to a background
//! keeper that rotates it before its server drops it.

mod keeper;

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{CancellationReason, CancellationScope, CancellationSignal};
use crate::catalog::{
    CatalogStore, ReachabilityReorder, ServerCatalog, ServerEntry, SqliteStore,
};
use crate::config::Config;
use crate::error::{Error, ErrorContext, Result};
use crate::pool::{ConnectionPool, PoolStats, RaceOutcome, RemoteListRefresher};
use crate::process::ProcessLauncher;
use crate::task::{ExitBarrier, SupervisedTask};
use crate::transport::{CandidateTask, TransportKind};
use crate::types::{ConnectionState, SessionId};

use keeper::SessionKeeper;

/// Details of an established session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub transport: TransportKind,
    /// Address of the server currently carrying the session.
    pub server: String,
    pub region: Option<String>,
    /// Local SOCKS port exposed by the helper.
    pub local_socks_port: u16,
    /// When the current server connected.
    pub connected_at: SystemTime,
}

impl SessionInfo {
    fn new(session_id: SessionId, transport: TransportKind, candidate: &CandidateTask, port: u16) -> Self {
        let entry = candidate.body().entry();
        Self {
            session_id,
            transport,
            server: entry.address.clone(),
            region: entry.region.clone(),
            local_socks_port: port,
            connected_at: SystemTime::now(),
        }
    }
}

/// Orchestrator events.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// A session was established.
    Connected(SessionInfo),
    /// The session moved to another candidate without interruption.
    Rotated { from: String, to: String },
    /// The active candidate died or reached its kill era.
    CandidateFailed { server: String },
    /// The session was torn down.
    Disconnected,
}

type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// State shared with session keepers.
struct Shared {
    config: Config,
    store: Arc<dyn CatalogStore>,
    embedded: Vec<ServerEntry>,
    launcher: Arc<dyn ProcessLauncher>,
    refresher: RwLock<Option<Arc<dyn RemoteListRefresher>>>,
    catalogs: DashMap<TransportKind, Arc<ServerCatalog>>,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<SessionInfo>>,
    session_signal: Mutex<Option<CancellationSignal>>,
    callbacks: RwLock<Vec<StateCallback>>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl Shared {
    fn catalog(&self, kind: TransportKind) -> Arc<ServerCatalog> {
        self.catalogs
            .entry(kind)
            .or_insert_with(|| {
                let embedded = self
                    .embedded
                    .iter()
                    .filter(|e| e.supports(kind))
                    .cloned()
                    .collect();
                Arc::new(ServerCatalog::new(
                    kind.capability().as_str(),
                    Arc::clone(&self.store),
                    embedded,
                ))
            })
            .clone()
    }

    fn pool(&self, kind: TransportKind, catalog: Arc<ServerCatalog>) -> ConnectionPool {
        let pool = ConnectionPool::new(
            kind,
            catalog,
            Arc::clone(&self.launcher),
            self.config.helper.clone(),
            self.config.pool.clone(),
        )
        .with_era_config(self.config.era.clone())
        .with_task_config(self.config.task.clone());

        match self.refresher.read().as_ref() {
            Some(refresher) => pool.with_refresher(Arc::clone(refresher)),
            None => pool,
        }
    }

    fn request_refresh(&self, kind: TransportKind) {
        if let Some(refresher) = self.refresher.read().as_ref() {
            refresher.request_refresh(kind);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!(%state, "connection state changed");

        let callbacks: Vec<StateCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(state);
        }
        self.emit(OrchestratorEvent::StateChanged(state));
    }

    fn set_session(&self, info: Option<SessionInfo>) {
        *self.session.write() = info;
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

struct ActiveSession {
    signal: CancellationSignal,
    keeper: JoinHandle<()>,
    reorder: Option<SupervisedTask<ReachabilityReorder>>,
}

/// Produces and maintains a connected session over a chosen transport.
pub struct TransportOrchestrator {
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl TransportOrchestrator {
    /// Create an orchestrator persisting catalogs in `store`.
    pub fn new(config: Config, store: Arc<dyn CatalogStore>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let embedded = config.storage.embedded_entries();

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                embedded,
                launcher,
                refresher: RwLock::new(None),
                catalogs: DashMap::new(),
                state: RwLock::new(ConnectionState::Stopped),
                session: RwLock::new(None),
                session_signal: Mutex::new(None),
                callbacks: RwLock::new(Vec::new()),
                event_tx,
            }),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Create an orchestrator with the SQLite catalog store from `config`.
    pub fn open(config: Config, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        config.validate()?;
        let path = config.storage.database_path();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Storage(format!("Failed to create {}: {e}", dir.display())))?;
        }
        let store: Arc<dyn CatalogStore> = Arc::new(SqliteStore::new(&path)?);
        Ok(Self::new(config, store, launcher))
    }

    /// Attach a remote server list refresher. Applies to later races.
    pub fn with_refresher(self, refresher: Arc<dyn RemoteListRefresher>) -> Self {
        *self.shared.refresher.write() = Some(refresher);
        self
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Catalog for `kind`, created on first use.
    pub fn catalog(&self, kind: TransportKind) -> Arc<ServerCatalog> {
        self.shared.catalog(kind)
    }

    /// Merge discovered servers into the catalog of every transport they support.
    pub fn add_discovered(&self, entries: &[ServerEntry]) -> Result<()> {
        for kind in TransportKind::ALL {
            let supported: Vec<ServerEntry> = entries.iter().filter(|e| e.supports(kind)).cloned().collect();
            if !supported.is_empty() {
                self.shared.catalog(kind).add_discovered(&supported)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Current session, if connected.
    pub fn session(&self) -> Option<SessionInfo> {
        self.shared.session.read().clone()
    }

    /// Register a callback invoked on every state change.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().push(Arc::new(callback));
    }

    /// Subscribe to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Connect over `kind`. Any existing session is torn down first.
    ///
    /// `scope` stays attached to the session: raising it later tears the
    /// session down as well.
    pub async fn connect(&self, kind: TransportKind, scope: &CancellationScope) -> Result<SessionInfo> {
        let signal = CancellationSignal::new();
        let previous = self.shared.session_signal.lock().replace(signal.clone());
        if let Some(previous) = previous {
            previous.raise(CancellationReason::USER_DISCONNECT);
        }

        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            Self::teardown(session).await;
            self.shared.set_session(None);
        }

        let context = ErrorContext::new("connect").with_transport(kind.to_string());
        let session_scope = scope.clone().with(signal.clone());
        self.shared.set_state(ConnectionState::Connecting);

        let catalog = self.shared.catalog(kind);
        let servers = match catalog.candidates(kind) {
            Ok(servers) => servers,
            Err(e) => return Err(self.fail(&context, e)),
        };

        let reorder = self.start_reorder(&catalog, &session_scope).await;

        if servers.is_empty() {
            self.shared.request_refresh(kind);
            stop_reorder(reorder).await;
            return Err(self.fail(&context, Error::NoReachableServer));
        }

        let pool = Arc::new(self.shared.pool(kind, catalog));
        let barrier = ExitBarrier::new();
        let report = pool.race(servers, &session_scope, Some(&barrier)).await;

        match report.outcome {
            RaceOutcome::Won(candidate) => {
                let info = SessionInfo::new(
                    SessionId::new(),
                    kind,
                    &candidate,
                    self.shared.config.helper.local_socks_port,
                );
                self.shared.set_session(Some(info.clone()));
                self.shared.set_state(ConnectionState::Connected);
                self.shared.emit(OrchestratorEvent::Connected(info.clone()));
                info!(
                    session = %info.session_id,
                    transport = %kind,
                    server = %info.server,
                    "session established"
                );

                let keeper = SessionKeeper::new(
                    Arc::clone(&self.shared),
                    pool,
                    candidate,
                    session_scope,
                    barrier,
                );
                *active = Some(ActiveSession {
                    signal,
                    keeper: tokio::spawn(keeper.run()),
                    reorder,
                });
                Ok(info)
            }
            RaceOutcome::Cancelled(reason) => {
                stop_reorder(reorder).await;
                self.shared.set_state(ConnectionState::Stopped);
                debug!(%context, %reason, "connect cancelled");
                Err(Error::Cancelled(reason))
            }
            RaceOutcome::Exhausted => {
                stop_reorder(reorder).await;
                self.shared.request_refresh(kind);
                Err(self.fail(&context, exhausted_error(&report.stats)))
            }
        }
    }

    /// Tear down the current session or abort a connect in progress.
    pub async fn disconnect(&self) {
        let signal = self.shared.session_signal.lock().take();
        if let Some(signal) = signal {
            signal.raise(CancellationReason::USER_DISCONNECT);
        }

        let session = self.active.lock().await.take();
        if let Some(session) = session {
            Self::teardown(session).await;
            self.shared.emit(OrchestratorEvent::Disconnected);
            info!("session disconnected");
        }
        self.shared.set_session(None);
        self.shared.set_state(ConnectionState::Stopped);
    }

    async fn start_reorder(
        &self,
        catalog: &Arc<ServerCatalog>,
        scope: &CancellationScope,
    ) -> Option<SupervisedTask<ReachabilityReorder>> {
        let config = &self.shared.config;
        if !config.reachability.enabled {
            return None;
        }
        let body = ReachabilityReorder::new(Arc::clone(catalog), config.reachability.clone(), scope.clone());
        let task = SupervisedTask::new(Arc::new(body), config.task.clone());
        task.start(scope, None).await.then_some(task)
    }

    fn fail(&self, context: &ErrorContext, error: Error) -> Error {
        if error.is_cancelled() {
            self.shared.set_state(ConnectionState::Stopped);
        } else {
            warn!(%context, error = %error, "connect failed");
            self.shared.set_state(ConnectionState::Failed);
        }
        error
    }

    async fn teardown(session: ActiveSession) {
        session.signal.raise(CancellationReason::USER_DISCONNECT);
        if let Err(e) = session.keeper.await {
            warn!(error = %e, "session keeper aborted");
        }
        stop_reorder(session.reorder).await;
    }
}

impl Drop for TransportOrchestrator {
    fn drop(&mut self) {
        // Keeper tasks observe this and stop their candidates.
        if let Some(signal) = self.shared.session_signal.lock().take() {
            signal.raise(CancellationReason::CANCEL);
        }
    }
}

impl std::fmt::Debug for TransportOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOrchestrator")
            .field("state", &self.state())
            .field("session", &self.session())
            .finish()
    }
}

async fn stop_reorder(reorder: Option<SupervisedTask<ReachabilityReorder>>) {
    if let Some(task) = reorder {
        task.stop().await;
    }
}

/// Exhaustion caused only by unusable server records is a local setup
/// problem, not a reachability one.
fn exhausted_error(stats: &PoolStats) -> Error {
    if stats.attempted > 0 && stats.misconfigured == stats.attempted {
        Error::ConfigurationFailed(format!(
            "no launch command could be built for any of {} servers",
            stats.attempted
        ))
    } else {
        Error::NoReachableServer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_error_classification() {
        let mut stats = PoolStats {
            attempted: 3,
            misconfigured: 3,
            ..Default::default()
        };
        assert!(matches!(exhausted_error(&stats), Error::ConfigurationFailed(_)));

        stats.misconfigured = 2;
        assert!(matches!(exhausted_error(&stats), Error::NoReachableServer));

        assert!(matches!(exhausted_error(&PoolStats::default()), Error::NoReachableServer));
    }
}
