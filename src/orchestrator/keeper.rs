//! Background upkeep of an established session.
//!
//! The keeper watches the active candidate. When it retires, a replacement
//! race starts while the old candidate keeps serving; the winner is swapped
//! in and the old candidate stopped. When the active candidate dies or hits
//! its kill era without a replacement, the keeper reconnects from scratch.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{OrchestratorEvent, SessionInfo, Shared};
use crate::cancel::{CancellationReason, CancellationScope};
use crate::pool::{ConnectionPool, RaceOutcome, RaceReport};
use crate::task::ExitBarrier;
use crate::transport::CandidateTask;
use crate::types::ConnectionState;

pub(super) struct SessionKeeper {
    shared: Arc<Shared>,
    pool: Arc<ConnectionPool>,
    active: Arc<CandidateTask>,
    scope: CancellationScope,
    barrier: ExitBarrier,
    replacement: Option<JoinHandle<RaceReport>>,
    retry_at: Option<Instant>,
}

impl SessionKeeper {
    pub(super) fn new(
        shared: Arc<Shared>,
        pool: Arc<ConnectionPool>,
        active: Arc<CandidateTask>,
        scope: CancellationScope,
        barrier: ExitBarrier,
    ) -> Self {
        Self {
            shared,
            pool,
            active,
            scope,
            barrier,
            replacement: None,
            retry_at: None,
        }
    }

    pub(super) async fn run(mut self) {
        let poll = self.shared.config.task.poll_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.scope.raised(CancellationReason::ALL) => {}
            }
            if self.scope.is_raised(CancellationReason::ALL) {
                break;
            }

            if !self.active.is_running() && !self.recover().await {
                break;
            }
            self.rotate().await;
        }

        self.shutdown().await;
    }

    /// Replace a candidate that stopped. Returns false when the session is over.
    async fn recover(&mut self) -> bool {
        let lost = self.active.body().entry().address.clone();
        warn!(server = %lost, transport = %self.pool.kind(), "active candidate lost");
        // Reaching the kill era is the normal end of a session, not a failure.
        if !self.active.body().in_kill_era() {
            if let Err(e) = self.pool.catalog().mark_failed(self.active.body().entry()) {
                warn!(server = %lost, error = %e, "catalog update failed");
            }
        }
        self.shared.emit(OrchestratorEvent::CandidateFailed { server: lost });
        self.shared.set_state(ConnectionState::Connecting);

        let mut report = match self.replacement.take() {
            Some(handle) => match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "replacement race aborted");
                    None
                }
            },
            None => None,
        };
        if !report.as_ref().is_some_and(|r| r.outcome.is_won()) {
            if self.scope.is_raised(CancellationReason::ALL) {
                return false;
            }
            report = Some(self.race().await);
        }

        match report.map(|r| r.outcome) {
            Some(RaceOutcome::Won(candidate)) => {
                self.install(candidate);
                self.shared.set_state(ConnectionState::Connected);
                true
            }
            Some(RaceOutcome::Cancelled(_)) => false,
            Some(RaceOutcome::Exhausted) | None => {
                warn!(transport = %self.pool.kind(), "reconnect found no reachable server");
                self.shared.request_refresh(self.pool.kind());
                self.shared.set_session(None);
                self.shared.set_state(ConnectionState::Failed);
                false
            }
        }
    }

    /// Start or complete a make-before-break rotation.
    async fn rotate(&mut self) {
        if self.replacement.as_ref().is_some_and(JoinHandle::is_finished) {
            let Some(handle) = self.replacement.take() else {
                return;
            };
            match handle.await.map(|r| r.outcome) {
                Ok(RaceOutcome::Won(candidate)) => {
                    let old = self.install(candidate);
                    // Explicit stop: the old candidate leaves the barrier without waiting.
                    tokio::spawn(async move { old.stop().await });
                }
                Ok(RaceOutcome::Cancelled(_)) => {}
                Ok(RaceOutcome::Exhausted) => {
                    debug!("replacement race exhausted, will retry");
                    self.retry_at = Some(Instant::now() + self.shared.config.era.replacement_retry);
                }
                Err(e) => {
                    warn!(error = %e, "replacement race aborted");
                    self.retry_at = Some(Instant::now() + self.shared.config.era.replacement_retry);
                }
            }
            return;
        }

        let due = self.retry_at.map_or(true, |at| Instant::now() >= at);
        if self.replacement.is_none() && due && self.active.body().in_retired_era() {
            info!(
                server = %self.active.body().entry(),
                transport = %self.pool.kind(),
                "session retired, racing replacement"
            );
            let pool = Arc::clone(&self.pool);
            let scope = self.scope.clone();
            let barrier = self.barrier.clone();
            let mut servers = match pool.catalog().candidates(pool.kind()) {
                Ok(servers) => servers,
                Err(e) => {
                    warn!(error = %e, "cannot load catalog for replacement");
                    self.retry_at = Some(Instant::now() + self.shared.config.era.replacement_retry);
                    return;
                }
            };
            // The active helper still holds its server; a replacement goes elsewhere.
            let active = self.active.body().entry();
            servers.retain(|entry| entry != active);
            self.replacement = Some(tokio::spawn(async move {
                pool.race(servers, &scope, Some(&barrier)).await
            }));
        }
    }

    async fn race(&self) -> RaceReport {
        let servers = match self.pool.catalog().candidates(self.pool.kind()) {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "cannot load catalog for reconnect");
                Vec::new()
            }
        };
        self.pool.race(servers, &self.scope, Some(&self.barrier)).await
    }

    /// Make `candidate` the active one and return the previous candidate.
    fn install(&mut self, candidate: Arc<CandidateTask>) -> Arc<CandidateTask> {
        let old = std::mem::replace(&mut self.active, candidate);
        self.retry_at = None;

        let from = old.body().entry().address.clone();
        let to = self.active.body().entry().address.clone();

        let info = {
            let mut session = self.shared.session.write();
            if let Some(ref mut info) = *session {
                info.server = to.clone();
                info.region = self.active.body().entry().region.clone();
                info.connected_at = SystemTime::now();
            }
            session.clone()
        };

        info!(from = %from, to = %to, transport = %self.pool.kind(), "session rotated");
        self.shared.emit(OrchestratorEvent::Rotated { from, to });
        if let Some(info) = info {
            self.shared.emit(OrchestratorEvent::Connected(info));
        }
        old
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.replacement.take() {
            // The race observes the same scope and returns promptly.
            if let Ok(RaceReport {
                outcome: RaceOutcome::Won(candidate),
                ..
            }) = handle.await
            {
                candidate.stop().await;
            }
        }
        self.active.stop().await;

        if self.scope.is_raised(CancellationReason::ALL) {
            self.shared.set_session(None::<SessionInfo>);
            self.shared.set_state(ConnectionState::Stopped);
        }
        debug!(transport = %self.pool.kind(), "session keeper finished");
    }
}
