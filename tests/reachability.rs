//! Reachability reorder tests against loopback listeners.
//!
//! Scenarios:
//! - responders move to the front, everything else keeps its order
//! - rounds are idempotent under stable conditions
//! - a cancelled round leaves the catalog untouched
//! - the supervised pass runs one round and stops itself

#![cfg(target_os = "linux")]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use common::{addresses, seeded_catalog, server, task_config};
use relayrace::cancel::{CancellationReason, CancellationSignal};
use relayrace::catalog::{ReachabilityConfig, ReachabilityReorder, ServerCatalog, ServerEntry};
use relayrace::task::{SupervisedTask, TaskState};

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Loopback servers: some accept, some refuse, some have no probe port.
struct ProbeNetwork {
    _listeners: Vec<TcpListener>,
    entries: Vec<ServerEntry>,
    responders: BTreeSet<String>,
}

impl ProbeNetwork {
    async fn new(responding: usize, refusing: usize, unprobed: usize) -> Self {
        let mut listeners = Vec::new();
        let mut entries = Vec::new();
        let mut responders = BTreeSet::new();
        let mut octet = 2u8;

        for _ in 0..refusing {
            let address = format!("127.0.0.{octet}");
            octet += 1;
            let closed = TcpListener::bind((address.as_str(), 0)).await.unwrap();
            let port = closed.local_addr().unwrap().port();
            drop(closed);
            entries.push(relay(&address, Some(port)));
        }
        for _ in 0..unprobed {
            let address = format!("127.0.0.{octet}");
            octet += 1;
            entries.push(relay(&address, None));
        }
        for _ in 0..responding {
            let address = format!("127.0.0.{octet}");
            octet += 1;
            let listener = TcpListener::bind((address.as_str(), 0)).await.unwrap();
            let port = listener.local_addr().unwrap().port();
            listeners.push(listener);
            responders.insert(address.clone());
            entries.push(relay(&address, Some(port)));
        }

        Self {
            _listeners: listeners,
            entries,
            responders,
        }
    }

    fn catalog(&self) -> Arc<ServerCatalog> {
        seeded_catalog(&self.entries)
    }
}

fn relay(address: &str, port: Option<u16>) -> ServerEntry {
    let mut entry = server(0);
    entry.address = address.to_string();
    entry.reachability_port = port;
    entry
}

/// Loopback timings vary by microseconds; a wide threshold keeps every
/// responder in the promoted set.
fn config() -> ReachabilityConfig {
    ReachabilityConfig {
        max_check_time: Duration::from_secs(2),
        threshold_factor: 1_000_000.0,
        ..Default::default()
    }
}

// ============================================================================
// Rounds
// ============================================================================

#[tokio::test]
async fn test_responders_promoted_others_keep_order() {
    let network = ProbeNetwork::new(4, 3, 2).await;
    let catalog = network.catalog();
    let signal = CancellationSignal::new();
    let reorder = ReachabilityReorder::new(Arc::clone(&catalog), config(), signal.scope());

    let report = reorder.run_round().await.unwrap();

    assert_eq!(report.probed, 7);
    assert_eq!(report.responded, 4);
    let promoted: BTreeSet<String> = report.promoted.iter().cloned().collect();
    assert_eq!(promoted, network.responders);

    let order = addresses(&catalog.entries().unwrap());
    assert_eq!(order.len(), 9);
    assert_eq!(order[..4], report.promoted[..]);
    let rest: Vec<String> = addresses(&network.entries)
        .into_iter()
        .filter(|a| !network.responders.contains(a))
        .collect();
    assert_eq!(order[4..], rest[..]);
}

#[tokio::test]
async fn test_rounds_are_idempotent() {
    let network = ProbeNetwork::new(5, 2, 1).await;
    let catalog = network.catalog();
    let signal = CancellationSignal::new();
    let reorder = ReachabilityReorder::new(Arc::clone(&catalog), config(), signal.scope());

    let first = reorder.run_round().await.unwrap();
    let after_first: BTreeSet<String> = addresses(&catalog.entries().unwrap())[..5].iter().cloned().collect();
    let second = reorder.run_round().await.unwrap();
    let after_second: BTreeSet<String> = addresses(&catalog.entries().unwrap())[..5].iter().cloned().collect();

    let first: BTreeSet<String> = first.promoted.into_iter().collect();
    let second: BTreeSet<String> = second.promoted.into_iter().collect();
    assert_eq!(first, second);
    assert_eq!(after_first, after_second);
    assert_eq!(after_second, network.responders);
}

#[tokio::test]
async fn test_cancelled_round_does_not_reorder() {
    let network = ProbeNetwork::new(3, 2, 0).await;
    let catalog = network.catalog();
    let signal = CancellationSignal::new();
    signal.raise(CancellationReason::USER_DISCONNECT);
    let reorder = ReachabilityReorder::new(Arc::clone(&catalog), config(), signal.scope());

    let err = reorder.run_round().await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(addresses(&catalog.entries().unwrap()), addresses(&network.entries));
}

#[tokio::test]
async fn test_catalog_without_probe_ports_is_untouched() {
    let network = ProbeNetwork::new(0, 0, 4).await;
    let catalog = network.catalog();
    let signal = CancellationSignal::new();
    let reorder = ReachabilityReorder::new(Arc::clone(&catalog), config(), signal.scope());

    let report = reorder.run_round().await.unwrap();

    assert_eq!(report.probed, 0);
    assert!(report.promoted.is_empty());
    assert_eq!(addresses(&catalog.entries().unwrap()), addresses(&network.entries));
}

// ============================================================================
// Supervised pass
// ============================================================================

#[tokio::test]
async fn test_supervised_pass_runs_once_and_stops() {
    let network = ProbeNetwork::new(2, 1, 0).await;
    let catalog = network.catalog();
    let signal = CancellationSignal::new();
    let scope = signal.scope();
    let body = Arc::new(ReachabilityReorder::new(Arc::clone(&catalog), config(), scope.clone()));
    let task = SupervisedTask::new(Arc::clone(&body), task_config());

    assert!(task.start(&scope, None).await);
    assert!(common::eventually(Duration::from_secs(3), || task.state() == TaskState::Stopped).await);

    let report = body.report().unwrap();
    assert_eq!(report.responded, 2);
    let front: BTreeSet<String> = addresses(&catalog.entries().unwrap())[..2].iter().cloned().collect();
    assert_eq!(front, network.responders);
}
