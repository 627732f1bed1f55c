//! # relayrace
//!
//! Transport connection orchestration for censorship-circumvention clients.
//!
//! relayrace races relay helper processes against many candidate servers at
//! once, prefers the server that worked last time, keeps a persisted and
//! continuously reordered server catalog, and rotates sessions before the
//! server drops them so the user never sees a gap.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     TransportOrchestrator                       │
//! │           connect / disconnect / state events / keeper          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        ConnectionPool                           │
//! │   ┌─────────────┐ ┌─────────────┐ ┌─────────────┐               │
//! │   │ Candidate 1 │ │ Candidate 2 │ │ Candidate N │  (≤ limit)    │
//! │   │ fresh/ret/… │ │             │ │             │               │
//! │   └─────────────┘ └─────────────┘ └─────────────┘               │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │  ServerCatalog (SQLite)      │  ReachabilityReorder (TCP probes)│
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │      SupervisedTask  ·  ExitBarrier  ·  CancellationSignal      │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // Port and millisecond conversions are range-checked
#![allow(clippy::cast_possible_wrap)]        // Timestamps fit in i64
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::cognitive_complexity)]      // Race loop is a state machine
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod task;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancel::{CancellationReason, CancellationScope, CancellationSignal};
    pub use crate::catalog::{Capability, CatalogStore, ServerCatalog, ServerEntry, SqliteStore};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::orchestrator::{OrchestratorEvent, SessionInfo, TransportOrchestrator};
    pub use crate::pool::{ConnectionPool, RaceOutcome, RemoteListRefresher};
    pub use crate::process::{ProcessLauncher, TokioProcessLauncher};
    pub use crate::task::{ExitBarrier, SupervisedTask, TaskBody};
    pub use crate::transport::{ConnectionCandidate, TransportKind};
    pub use crate::types::*;
}
