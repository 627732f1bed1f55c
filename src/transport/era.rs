//! Connection eras for pre-emptive reconnection.
//!
//! A connected candidate is `Fresh` until its fresh limit, `Retired` until
//! its retired limit and `Kill` after that. A retired candidate keeps
//! serving while a replacement connects.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ServerEntry;

/// Lifecycle phase of a connected candidate. Ordered by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Era {
    Fresh,
    Retired,
    Kill,
}

impl fmt::Display for Era {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Era::Fresh => write!(f, "fresh"),
            Era::Retired => write!(f, "retired"),
            Era::Kill => write!(f, "kill"),
        }
    }
}

/// Era configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EraConfig {
    /// Rotate sessions on servers that advertise a lifetime.
    #[serde(default = "default_preemptive")]
    pub preemptive_reconnect: bool,

    /// How long before the advertised lifetime a session retires.
    #[serde(default = "default_retire_lead", with = "humantime_serde")]
    pub retire_lead: Duration,

    /// Kill the session once the advertised lifetime is reached.
    #[serde(default = "default_kill_at_lifetime")]
    pub kill_at_lifetime: bool,

    /// Wait before retrying a replacement race that found no server.
    #[serde(default = "default_replacement_retry", with = "humantime_serde")]
    pub replacement_retry: Duration,
}

fn default_preemptive() -> bool {
    true
}
fn default_retire_lead() -> Duration {
    Duration::from_secs(60)
}
fn default_kill_at_lifetime() -> bool {
    true
}
fn default_replacement_retry() -> Duration {
    Duration::from_secs(10)
}

impl Default for EraConfig {
    fn default() -> Self {
        Self {
            preemptive_reconnect: default_preemptive(),
            retire_lead: default_retire_lead(),
            kill_at_lifetime: default_kill_at_lifetime(),
            replacement_retry: default_replacement_retry(),
        }
    }
}

/// Era thresholds measured from the moment a candidate connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraLimits {
    fresh: Option<Duration>,
    retired: Option<Duration>,
}

impl EraLimits {
    /// Permanently fresh.
    pub const DISABLED: Self = Self {
        fresh: None,
        retired: None,
    };

    /// A zero `fresh` disables eras. `retired` never precedes `fresh`.
    pub fn new(fresh: Duration, retired: Option<Duration>) -> Self {
        if fresh.is_zero() {
            return Self::DISABLED;
        }
        Self {
            fresh: Some(fresh),
            retired: retired.map(|r| r.max(fresh)),
        }
    }

    /// Limits for a session on `entry`.
    ///
    /// Servers that do not advertise a reconnect lifetime stay fresh. When the
    /// retire lead covers the whole lifetime, the session retires halfway.
    pub fn for_server(entry: &ServerEntry, config: &EraConfig) -> Self {
        if !config.preemptive_reconnect {
            return Self::DISABLED;
        }
        let Some(lifetime) = entry.preemptive_reconnect_lifetime.filter(|l| !l.is_zero()) else {
            return Self::DISABLED;
        };

        let mut fresh = lifetime.saturating_sub(config.retire_lead);
        if fresh.is_zero() {
            fresh = lifetime / 2;
        }
        Self::new(fresh, config.kill_at_lifetime.then_some(lifetime))
    }

    pub fn fresh(&self) -> Option<Duration> {
        self.fresh
    }

    pub fn retired(&self) -> Option<Duration> {
        self.retired
    }

    pub fn is_enabled(&self) -> bool {
        self.fresh.is_some()
    }

    /// Era after `elapsed` connected time. Monotonic in `elapsed`.
    pub fn era_at(&self, elapsed: Duration) -> Era {
        match self.fresh {
            None => Era::Fresh,
            Some(fresh) if elapsed < fresh => Era::Fresh,
            Some(_) => match self.retired {
                Some(retired) if elapsed >= retired => Era::Kill,
                _ => Era::Retired,
            },
        }
    }
}
