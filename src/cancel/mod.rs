//! Cooperative cancellation.
//!
//! A [`CancellationSignal`] holds a set of raised [`CancellationReason`]s.
//! One signal is created per process ("global") and one per isolated
//! sub-operation ("scoped"); a [`CancellationScope`] is the union view of
//! several signals handed to the code that has to observe them.
//!
//! Signals are never looked up ambiently: they are constructed by the owner
//! and threaded explicitly into every task, race and catalog pass.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Set of cancellation reasons.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CancellationReason(u8);

impl CancellationReason {
    /// Empty mask. Never raised.
    pub const NONE: Self = Self(0);

    /// The user asked to disconnect.
    pub const USER_DISCONNECT: Self = Self(1 << 0);

    /// The application is exiting.
    pub const PROCESS_EXIT: Self = Self(1 << 1);

    /// The established session dropped on its own.
    pub const UNEXPECTED_DISCONNECT: Self = Self(1 << 2);

    /// Generic stop request (used for a task's own stop).
    pub const CANCEL: Self = Self(1 << 3);

    /// Every reason. Never raised.
    pub const ALL: Self = Self(0b1111);

    const NAMED: [(Self, &'static str); 4] = [
        (Self::USER_DISCONNECT, "user-disconnect"),
        (Self::PROCESS_EXIT, "process-exit"),
        (Self::UNEXPECTED_DISCONNECT, "unexpected-disconnect"),
        (Self::CANCEL, "cancel"),
    ];

    /// Build from raw bits, dropping unknown bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// No reason set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All reasons of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one reason of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The lowest-numbered single reason in this set.
    pub fn first(self) -> Option<Self> {
        Self::NAMED
            .iter()
            .map(|(reason, _)| *reason)
            .find(|reason| self.intersects(*reason))
    }
}

impl BitOr for CancellationReason {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CancellationReason {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CancellationReason {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for CancellationReason {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (reason, name) in Self::NAMED {
            if self.intersects(reason) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancellationReason({self})")
    }
}

struct SignalInner {
    raised: AtomicU8,
    /// Cancelled on every raise and replaced, so waiters can re-arm after a
    /// masked-out reason or a clear.
    wakeup: Mutex<CancellationToken>,
}

/// Thread-safe set of raised cancellation reasons.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

impl CancellationSignal {
    /// Create a signal with nothing raised.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                raised: AtomicU8::new(0),
                wakeup: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Raise `reason`. Idempotent.
    pub fn raise(&self, reason: CancellationReason) {
        let reason = reason & CancellationReason::ALL;
        if reason.is_empty() {
            return;
        }
        self.inner.raised.fetch_or(reason.bits(), Ordering::SeqCst);
        let fired = std::mem::replace(&mut *self.inner.wakeup.lock(), CancellationToken::new());
        fired.cancel();
    }

    /// Lower every reason in `mask`.
    pub fn clear(&self, mask: CancellationReason) {
        self.inner.raised.fetch_and(!mask.bits(), Ordering::SeqCst);
    }

    /// Reasons in `mask` that are currently raised.
    pub fn check(&self, mask: CancellationReason) -> CancellationReason {
        CancellationReason::from_bits(self.inner.raised.load(Ordering::SeqCst)) & mask
    }

    /// Like [`check`](Self::check), but fails with [`Error::Cancelled`]
    /// carrying the first matching reason.
    pub fn check_or_err(&self, mask: CancellationReason) -> Result<()> {
        cancelled_error(self.check(mask))
    }

    /// Any reason in `mask` is raised.
    pub fn is_raised(&self, mask: CancellationReason) -> bool {
        !self.check(mask).is_empty()
    }

    /// Wait until a reason in `mask` is raised and return the raised subset.
    pub async fn raised(&self, mask: CancellationReason) -> CancellationReason {
        loop {
            // Take the token before checking so a raise in between still wakes us.
            let wakeup = self.inner.wakeup.lock().clone();

            let raised = self.check(mask);
            if !raised.is_empty() {
                return raised;
            }
            wakeup.cancelled().await;
        }
    }

    /// A scope observing only this signal.
    pub fn scope(&self) -> CancellationScope {
        CancellationScope::new(self.clone())
    }

    /// Both handles refer to the same signal.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("raised", &self.check(CancellationReason::ALL))
            .finish()
    }
}

/// Union view over several signals: a reason counts as raised if any
/// member signal has it raised.
#[derive(Clone, Debug)]
pub struct CancellationScope {
    signals: Vec<CancellationSignal>,
}

impl CancellationScope {
    /// Scope over a single signal.
    pub fn new(signal: CancellationSignal) -> Self {
        Self {
            signals: vec![signal],
        }
    }

    /// Extend the scope with another signal.
    pub fn with(mut self, signal: CancellationSignal) -> Self {
        if !self.signals.iter().any(|s| s.same_as(&signal)) {
            self.signals.push(signal);
        }
        self
    }

    /// Union of two scopes.
    pub fn union(mut self, other: &Self) -> Self {
        for signal in &other.signals {
            self = self.with(signal.clone());
        }
        self
    }

    /// Reasons in `mask` raised on any member signal.
    pub fn check(&self, mask: CancellationReason) -> CancellationReason {
        self.signals
            .iter()
            .fold(CancellationReason::NONE, |acc, s| acc | s.check(mask))
    }

    /// Fail with [`Error::Cancelled`] if a reason in `mask` is raised.
    pub fn check_or_err(&self, mask: CancellationReason) -> Result<()> {
        cancelled_error(self.check(mask))
    }

    /// Any reason in `mask` is raised.
    pub fn is_raised(&self, mask: CancellationReason) -> bool {
        !self.check(mask).is_empty()
    }

    /// Wait until any member raises a reason in `mask`.
    pub async fn raised(&self, mask: CancellationReason) -> CancellationReason {
        let waits = self
            .signals
            .iter()
            .map(|s| s.raised(mask).boxed())
            .collect::<Vec<_>>();
        if waits.is_empty() {
            return future::pending().await;
        }
        let (first, _, _) = future::select_all(waits).await;
        // Report everything raised by now, not just the member that woke us.
        first | self.check(mask)
    }

    /// Member signals.
    pub fn signals(&self) -> &[CancellationSignal] {
        &self.signals
    }
}

impl From<CancellationSignal> for CancellationScope {
    fn from(signal: CancellationSignal) -> Self {
        Self::new(signal)
    }
}

fn cancelled_error(raised: CancellationReason) -> Result<()> {
    match raised.first() {
        Some(reason) => Err(Error::Cancelled(reason)),
        None => Ok(()),
    }
}
