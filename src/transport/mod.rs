//! Transport variants and connection candidates.
//!
//! Each [`TransportKind`] is a closed tagged variant. Everything that
//! differs between variants (required capability, success marker, helper
//! arguments) is dispatched from here rather than through per-variant types.

mod candidate;
mod era;

pub use candidate::{CandidateTask, ConnectionAttemptResult, ConnectionCandidate};
pub use era::{Era, EraConfig, EraLimits};

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::{Capability, ServerEntry};
use crate::error::{Error, Result};
use crate::process::LaunchCommand;

/// Transport used to reach a relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Plain SSH relay.
    Ssh,
    /// Obfuscated SSH relay.
    #[serde(rename = "ossh")]
    ObfuscatedSsh,
    /// SSH over meek, direct to the server.
    UnfrontedMeek,
    /// SSH over meek through a fronting CDN.
    FrontedMeek,
}

impl TransportKind {
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Ssh,
        TransportKind::ObfuscatedSsh,
        TransportKind::UnfrontedMeek,
        TransportKind::FrontedMeek,
    ];

    /// Capability a server must advertise to be usable with this transport.
    pub fn capability(self) -> Capability {
        match self {
            Self::Ssh => Capability::Ssh,
            Self::ObfuscatedSsh => Capability::ObfuscatedSsh,
            Self::UnfrontedMeek => Capability::UnfrontedMeek,
            Self::FrontedMeek => Capability::FrontedMeek,
        }
    }

    /// Default helper output line announcing an established tunnel.
    pub fn success_marker(self) -> &'static str {
        match self {
            Self::Ssh => "SSH tunnel established",
            Self::ObfuscatedSsh => "OSSH tunnel established",
            Self::UnfrontedMeek => "meek tunnel established",
            Self::FrontedMeek => "fronted meek tunnel established",
        }
    }

    /// Short lowercase name used on helper command lines and in config.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::ObfuscatedSsh => "ossh",
            Self::UnfrontedMeek => "unfronted-meek",
            Self::FrontedMeek => "fronted-meek",
        }
    }

    /// Whether the transport tunnels through meek.
    pub fn is_meek(self) -> bool {
        matches!(self, Self::UnfrontedMeek | Self::FrontedMeek)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower || kind.capability().as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidConfig(format!("Unknown transport: {s}")))
    }
}

/// Relay helper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Helper executable.
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Local SOCKS port the helper listens on.
    ///
    /// Every racing helper and a rotation's replacement get the same port, so
    /// the helper must only bind it once it has connected and must tolerate a
    /// predecessor still holding it (for example with `SO_REUSEPORT`).
    #[serde(default = "default_socks_port")]
    pub local_socks_port: u16,

    /// Arguments appended to every launch.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Fronting domain used when a server does not name one.
    #[serde(default)]
    pub fronting_domain: Option<String>,

    /// Fronting host header used when a server does not name one.
    #[serde(default)]
    pub fronting_host: Option<String>,

    /// Per-transport success marker overrides.
    #[serde(default)]
    pub success_markers: HashMap<TransportKind, String>,
}

fn default_program() -> PathBuf {
    PathBuf::from("relay-helper")
}
fn default_socks_port() -> u16 {
    1080
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            local_socks_port: default_socks_port(),
            extra_args: Vec::new(),
            fronting_domain: None,
            fronting_host: None,
            success_markers: HashMap::new(),
        }
    }
}

impl HelperConfig {
    /// Success marker for `kind`, honouring overrides.
    pub fn success_marker(&self, kind: TransportKind) -> String {
        self.success_markers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.success_marker().to_string())
    }
}

/// Build the helper command line for connecting to `entry` over `kind`.
///
/// Fails with `ConfigurationFailed` when the entry lacks a field the
/// transport needs.
pub fn build_launch_command(
    kind: TransportKind,
    entry: &ServerEntry,
    helper: &HelperConfig,
) -> Result<LaunchCommand> {
    if !entry.supports(kind) {
        return Err(missing(kind, entry, "capability"));
    }

    let mut args = vec![
        "--transport".to_string(),
        kind.as_str().to_string(),
        "--server".to_string(),
        entry.address.clone(),
        "--local-socks-port".to_string(),
        helper.local_socks_port.to_string(),
    ];
    push_ssh_credentials(&mut args, kind, entry)?;

    match kind {
        TransportKind::Ssh => {
            let port = require(kind, entry, "ssh_port", entry.ssh_port)?;
            push(&mut args, "--ssh-port", port.to_string());
        }
        TransportKind::ObfuscatedSsh => {
            let port = require(kind, entry, "ossh_port", entry.ossh_port)?;
            let key = require(kind, entry, "ossh_key", entry.ossh_key.as_ref())?;
            push(&mut args, "--ossh-port", port.to_string());
            push(&mut args, "--ossh-key", key.clone());
        }
        TransportKind::UnfrontedMeek => {
            let port = require(kind, entry, "meek_port", entry.meek_port)?;
            push(&mut args, "--meek-port", port.to_string());
            push_meek_keys(&mut args, kind, entry)?;
        }
        TransportKind::FrontedMeek => {
            let domain = entry
                .front_domain
                .as_ref()
                .or(helper.fronting_domain.as_ref());
            let domain = require(kind, entry, "front_domain", domain)?;
            let host = entry
                .front_host
                .as_ref()
                .or(helper.fronting_host.as_ref())
                .unwrap_or(domain);
            push(&mut args, "--front-domain", domain.clone());
            push(&mut args, "--front-host", host.clone());
            push_meek_keys(&mut args, kind, entry)?;
        }
    }

    args.extend(helper.extra_args.iter().cloned());

    Ok(LaunchCommand {
        program: helper.program.clone(),
        args,
        env: Vec::new(),
        server: entry.address.clone(),
        success_marker: helper.success_marker(kind),
    })
}

fn push_ssh_credentials(args: &mut Vec<String>, kind: TransportKind, entry: &ServerEntry) -> Result<()> {
    let username = require(kind, entry, "ssh_username", entry.ssh_username.as_ref())?;
    let password = require(kind, entry, "ssh_password", entry.ssh_password.as_ref())?;
    let host_key = require(kind, entry, "ssh_host_key", entry.ssh_host_key.as_ref())?;
    push(args, "--ssh-username", username.clone());
    push(args, "--ssh-password", password.clone());
    push(args, "--ssh-host-key", host_key.clone());
    Ok(())
}

fn push_meek_keys(args: &mut Vec<String>, kind: TransportKind, entry: &ServerEntry) -> Result<()> {
    let cookie = require(kind, entry, "meek_cookie_key", entry.meek_cookie_key.as_ref())?;
    let obfuscated = require(kind, entry, "meek_obfuscated_key", entry.meek_obfuscated_key.as_ref())?;
    push(args, "--meek-cookie-key", cookie.clone());
    push(args, "--meek-obfuscated-key", obfuscated.clone());
    Ok(())
}

fn push(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

fn require<T>(kind: TransportKind, entry: &ServerEntry, field: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| missing(kind, entry, field))
}

fn missing(kind: TransportKind, entry: &ServerEntry, field: &str) -> Error {
    Error::ConfigurationFailed(format!("{kind} launch for {}: missing {field}", entry.address))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_entry() -> ServerEntry {
        ServerEntry::new("203.0.113.10")
            .with_ssh(22, "user", "secret", "AAAAhostkey")
            .with_capabilities([Capability::Ssh, Capability::ObfuscatedSsh, Capability::FrontedMeek])
    }

    fn flag<'a>(command: &'a LaunchCommand, name: &str) -> Option<&'a str> {
        command
            .args
            .iter()
            .position(|a| a == name)
            .and_then(|i| command.args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
            assert_eq!(kind.capability().as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::FrontedMeek.capability().as_str(), "FRONTED-MEEK");
    }

    #[test]
    fn test_ssh_command() {
        let helper = HelperConfig {
            extra_args: vec!["--verbose".into()],
            ..Default::default()
        };
        let command = build_launch_command(TransportKind::Ssh, &ssh_entry(), &helper).unwrap();

        assert_eq!(command.program, PathBuf::from("relay-helper"));
        assert_eq!(command.server, "203.0.113.10");
        assert_eq!(flag(&command, "--transport"), Some("ssh"));
        assert_eq!(flag(&command, "--ssh-port"), Some("22"));
        assert_eq!(flag(&command, "--local-socks-port"), Some("1080"));
        assert_eq!(command.args.last().map(String::as_str), Some("--verbose"));
        assert_eq!(command.success_marker, "SSH tunnel established");
    }

    #[test]
    fn test_missing_fields_fail_configuration() {
        let err = build_launch_command(TransportKind::ObfuscatedSsh, &ssh_entry(), &HelperConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationFailed(ref m) if m.contains("ossh_port")));
        assert!(err.requires_attention());

        let err = build_launch_command(TransportKind::UnfrontedMeek, &ssh_entry(), &HelperConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationFailed(ref m) if m.contains("capability")));
    }

    #[test]
    fn test_fronted_meek_falls_back_to_helper_fronting() {
        let entry = ssh_entry().with_meek(443, "cookie", "obfs");
        let mut helper = HelperConfig::default();

        assert!(build_launch_command(TransportKind::FrontedMeek, &entry, &helper).is_err());

        helper.fronting_domain = Some("cdn.example.net".into());
        helper
            .success_markers
            .insert(TransportKind::FrontedMeek, "READY".into());
        let command = build_launch_command(TransportKind::FrontedMeek, &entry, &helper).unwrap();
        assert_eq!(flag(&command, "--front-domain"), Some("cdn.example.net"));
        assert_eq!(flag(&command, "--front-host"), Some("cdn.example.net"));
        assert_eq!(flag(&command, "--meek-cookie-key"), Some("cookie"));
        assert_eq!(command.success_marker, "READY");

        let entry = entry.with_fronting("front.example.org", "inner.example.org");
        let command = build_launch_command(TransportKind::FrontedMeek, &entry, &helper).unwrap();
        assert_eq!(flag(&command, "--front-host"), Some("inner.example.org"));
    }
}
