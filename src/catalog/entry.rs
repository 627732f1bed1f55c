//! Server entries and their persisted encoding.
//!
//! A catalog is stored as newline-delimited records. Each record is the hex
//! encoding of a space-delimited field list in a fixed order:
//!
//! ```text
//! address ssh_port ssh_username ssh_password ssh_host_key ossh_port ossh_key
//! meek_port meek_cookie_key meek_obfuscated_key front_domain front_host
//! capabilities region reachability_port preemptive_reconnect_ms
//! ```
//!
//! Absent values are written as `-`. Missing trailing fields decode to
//! absent and extra trailing fields are ignored, so records written by an
//! older or newer format still load.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::transport::TransportKind;

const ABSENT: &str = "-";

/// Capability advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Ssh,
    ObfuscatedSsh,
    UnfrontedMeek,
    FrontedMeek,
    /// Capability this build does not know about. Kept so it round-trips.
    Other(String),
}

impl Capability {
    /// Parse a capability name. Unknown names become [`Capability::Other`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "SSH" => Capability::Ssh,
            "OSSH" => Capability::ObfuscatedSsh,
            "UNFRONTED-MEEK" => Capability::UnfrontedMeek,
            "FRONTED-MEEK" => Capability::FrontedMeek,
            other => Capability::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Capability::Ssh => "SSH",
            Capability::ObfuscatedSsh => "OSSH",
            Capability::UnfrontedMeek => "UNFRONTED-MEEK",
            Capability::FrontedMeek => "FRONTED-MEEK",
            Capability::Other(name) => name,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

/// One known relay server.
///
/// Identity is the address: two entries with the same address are equal
/// even if their credentials differ. Use [`same_record`](Self::same_record)
/// for full field comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    pub ssh_port: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_host_key: Option<String>,
    pub ossh_port: Option<u16>,
    pub ossh_key: Option<String>,
    pub meek_port: Option<u16>,
    pub meek_cookie_key: Option<String>,
    pub meek_obfuscated_key: Option<String>,
    pub front_domain: Option<String>,
    pub front_host: Option<String>,
    pub capabilities: Vec<Capability>,
    pub region: Option<String>,
    /// Port for plain TCP reachability probes. `None` excludes the entry from probing.
    pub reachability_port: Option<u16>,
    /// Session lifetime after which the server drops the connection.
    /// `None` means the server does not support pre-emptive reconnection.
    pub preemptive_reconnect_lifetime: Option<Duration>,
}

impl ServerEntry {
    /// Create an entry with only an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set plain SSH parameters.
    pub fn with_ssh(
        mut self,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        host_key: impl Into<String>,
    ) -> Self {
        self.ssh_port = Some(port);
        self.ssh_username = Some(username.into());
        self.ssh_password = Some(password.into());
        self.ssh_host_key = Some(host_key.into());
        self
    }

    /// Set obfuscated SSH parameters.
    pub fn with_obfuscated_ssh(mut self, port: u16, key: impl Into<String>) -> Self {
        self.ossh_port = Some(port);
        self.ossh_key = Some(key.into());
        self
    }

    /// Set meek parameters.
    pub fn with_meek(
        mut self,
        port: u16,
        cookie_key: impl Into<String>,
        obfuscated_key: impl Into<String>,
    ) -> Self {
        self.meek_port = Some(port);
        self.meek_cookie_key = Some(cookie_key.into());
        self.meek_obfuscated_key = Some(obfuscated_key.into());
        self
    }

    /// Set domain fronting parameters.
    pub fn with_fronting(mut self, domain: impl Into<String>, host: impl Into<String>) -> Self {
        self.front_domain = Some(domain.into());
        self.front_host = Some(host.into());
        self
    }

    /// Set advertised capabilities.
    pub fn with_capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Set the region code.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the reachability probe port.
    pub fn with_reachability_port(mut self, port: u16) -> Self {
        self.reachability_port = Some(port);
        self
    }

    /// Set the pre-emptive reconnect lifetime.
    pub fn with_preemptive_reconnect_lifetime(mut self, lifetime: Duration) -> Self {
        self.preemptive_reconnect_lifetime = Some(lifetime);
        self
    }

    /// Whether the entry advertises `capability`.
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether the entry can be used with `kind`.
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.has_capability(&kind.capability())
    }

    /// Full field equality, unlike `==` which compares addresses only.
    pub fn same_record(&self, other: &Self) -> bool {
        self.fields() == other.fields()
    }

    /// Check that every field survives encoding unchanged.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::InvalidServerEntry("empty address".into()));
        }
        check_token("address", &self.address)?;

        let strings = [
            ("ssh_username", &self.ssh_username),
            ("ssh_password", &self.ssh_password),
            ("ssh_host_key", &self.ssh_host_key),
            ("ossh_key", &self.ossh_key),
            ("meek_cookie_key", &self.meek_cookie_key),
            ("meek_obfuscated_key", &self.meek_obfuscated_key),
            ("front_domain", &self.front_domain),
            ("front_host", &self.front_host),
            ("region", &self.region),
        ];
        for (name, value) in strings {
            if let Some(value) = value {
                check_token(name, value)?;
            }
        }

        for capability in &self.capabilities {
            let name = capability.as_str();
            check_token("capability", name)?;
            if name.contains(',') {
                return Err(Error::InvalidServerEntry(format!(
                    "capability {name:?} contains a comma"
                )));
            }
        }

        if let Some(lifetime) = self.preemptive_reconnect_lifetime {
            // Stored as whole milliseconds.
            let whole = lifetime.subsec_nanos() % 1_000_000 == 0;
            if !whole || u64::try_from(lifetime.as_millis()).is_err() {
                return Err(Error::InvalidServerEntry(format!(
                    "preemptive reconnect lifetime {lifetime:?} is not a whole number of milliseconds"
                )));
            }
        }
        Ok(())
    }

    /// Encode as one hex record.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        Ok(hex::encode(self.fields().join(" ")))
    }

    /// Decode one hex record.
    pub fn decode(record: &str) -> Result<Self> {
        let bytes = hex::decode(record.trim())
            .map_err(|e| Error::InvalidServerEntry(format!("bad hex: {e}")))?;
        let line = String::from_utf8(bytes)
            .map_err(|e| Error::InvalidServerEntry(format!("bad utf-8: {e}")))?;

        let mut fields = line.split_ascii_whitespace();
        let address = fields
            .next()
            .filter(|a| *a != ABSENT)
            .ok_or_else(|| Error::InvalidServerEntry("missing address".into()))?;

        let mut next = || fields.next().filter(|f| *f != ABSENT);

        Ok(Self {
            address: address.to_string(),
            ssh_port: parse_port("ssh_port", next())?,
            ssh_username: next().map(str::to_string),
            ssh_password: next().map(str::to_string),
            ssh_host_key: next().map(str::to_string),
            ossh_port: parse_port("ossh_port", next())?,
            ossh_key: next().map(str::to_string),
            meek_port: parse_port("meek_port", next())?,
            meek_cookie_key: next().map(str::to_string),
            meek_obfuscated_key: next().map(str::to_string),
            front_domain: next().map(str::to_string),
            front_host: next().map(str::to_string),
            capabilities: next()
                .map(|caps| {
                    caps.split(',')
                        .filter(|c| !c.is_empty())
                        .map(Capability::from_name)
                        .collect()
                })
                .unwrap_or_default(),
            region: next().map(str::to_string),
            reachability_port: parse_port("reachability_port", next())?,
            preemptive_reconnect_lifetime: next()
                .map(|ms| {
                    ms.parse::<u64>().map(Duration::from_millis).map_err(|e| {
                        Error::InvalidServerEntry(format!("preemptive_reconnect_ms: {e}"))
                    })
                })
                .transpose()?,
        })
    }

    fn fields(&self) -> Vec<String> {
        fn opt<T: ToString>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map_or_else(|| ABSENT.to_string(), ToString::to_string)
        }

        let capabilities = if self.capabilities.is_empty() {
            ABSENT.to_string()
        } else {
            self.capabilities
                .iter()
                .map(Capability::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };

        vec![
            self.address.clone(),
            opt(&self.ssh_port),
            opt(&self.ssh_username),
            opt(&self.ssh_password),
            opt(&self.ssh_host_key),
            opt(&self.ossh_port),
            opt(&self.ossh_key),
            opt(&self.meek_port),
            opt(&self.meek_cookie_key),
            opt(&self.meek_obfuscated_key),
            opt(&self.front_domain),
            opt(&self.front_host),
            capabilities,
            opt(&self.region),
            opt(&self.reachability_port),
            opt(&self.preemptive_reconnect_lifetime.map(|d| d.as_millis())),
        ]
    }
}

impl PartialEq for ServerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for ServerEntry {}

impl Hash for ServerEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Encode a list of entries, one record per line, preserving order.
pub fn encode_entries(entries: &[ServerEntry]) -> Result<String> {
    let records = entries
        .iter()
        .map(ServerEntry::encode)
        .collect::<Result<Vec<_>>>()?;
    Ok(records.join("\n"))
}

/// Decode a list of entries. Blank lines are skipped; corrupt records are
/// logged and skipped so one bad record does not lose the catalog.
pub fn decode_entries(blob: &str) -> Vec<ServerEntry> {
    blob.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|record| match ServerEntry::decode(record) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping corrupt server entry");
                None
            }
        })
        .collect()
}

fn check_token(name: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == ABSENT || value.chars().any(char::is_whitespace) {
        return Err(Error::InvalidServerEntry(format!(
            "{name} {value:?} cannot be encoded"
        )));
    }
    Ok(())
}

fn parse_port(name: &str, field: Option<&str>) -> Result<Option<u16>> {
    field
        .map(|p| {
            p.parse::<u16>()
                .map_err(|e| Error::InvalidServerEntry(format!("{name}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_entry() -> ServerEntry {
        ServerEntry::new("192.0.2.10")
            .with_ssh(22, "user", "secret", "AAAAB3NzaC1yc2E")
            .with_obfuscated_ssh(995, "okey")
            .with_meek(443, "cookiekey", "meekobf")
            .with_fronting("cdn.example.com", "origin.example.com")
            .with_capabilities([
                Capability::Ssh,
                Capability::ObfuscatedSsh,
                Capability::FrontedMeek,
                Capability::Other("handshake".into()),
            ])
            .with_region("CA")
            .with_reachability_port(8080)
            .with_preemptive_reconnect_lifetime(Duration::from_secs(1800))
    }

    #[test]
    fn test_entry_decodes_what_it_encodes() {
        let entries = vec![
            full_entry(),
            ServerEntry::new("198.51.100.7").with_capabilities([Capability::Ssh]),
            ServerEntry::new("relay.example.net"),
        ];

        let blob = encode_entries(&entries).unwrap();
        assert_eq!(blob.lines().count(), 3);

        let decoded = decode_entries(&blob);
        assert_eq!(decoded.len(), entries.len());
        for (a, b) in entries.iter().zip(&decoded) {
            assert!(a.same_record(b), "{a:?} != {b:?}");
        }
        assert_eq!(encode_entries(&decoded).unwrap(), blob);
    }

    #[test]
    fn test_missing_trailing_fields_default() {
        let record = hex::encode("203.0.113.5 22 user pass hostkey");
        let entry = ServerEntry::decode(&record).unwrap();

        assert_eq!(entry.address, "203.0.113.5");
        assert_eq!(entry.ssh_port, Some(22));
        assert_eq!(entry.ssh_host_key.as_deref(), Some("hostkey"));
        assert_eq!(entry.ossh_port, None);
        assert!(entry.capabilities.is_empty());
        assert_eq!(entry.reachability_port, None);
        assert_eq!(entry.preemptive_reconnect_lifetime, None);
    }

    #[test]
    fn test_extra_trailing_fields_ignored() {
        let mut line = full_entry().fields().join(" ");
        line.push_str(" future-field another");
        let entry = ServerEntry::decode(&hex::encode(line)).unwrap();
        assert!(entry.same_record(&full_entry()));
    }

    #[test]
    fn test_unknown_capability_round_trips() {
        let entry = ServerEntry::decode(&hex::encode(
            "203.0.113.5 - - - - - - - - - - - SSH,QUIC-OSSH",
        ))
        .unwrap();
        assert_eq!(
            entry.capabilities,
            vec![Capability::Ssh, Capability::Other("QUIC-OSSH".into())]
        );
        assert!(entry.supports(TransportKind::Ssh));
        assert!(!entry.supports(TransportKind::ObfuscatedSsh));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ServerEntry::decode("not hex").is_err());
        assert!(ServerEntry::decode(&hex::encode("")).is_err());
        assert!(ServerEntry::decode(&hex::encode("1.2.3.4 notaport")).is_err());
    }

    #[test]
    fn test_corrupt_records_are_skipped() {
        let good = ServerEntry::new("192.0.2.1").encode().unwrap();
        let blob = format!("{good}\nzz-not-hex\n\n{good}\n");
        let decoded = decode_entries(&blob);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_validate_rejects_unencodable_values() {
        assert!(ServerEntry::new("").validate().is_err());
        assert!(ServerEntry::new("a b").validate().is_err());
        assert!(ServerEntry::new("1.2.3.4").with_region("-").validate().is_err());
        assert!(ServerEntry::new("1.2.3.4")
            .with_capabilities([Capability::Other("A,B".into())])
            .validate()
            .is_err());
        assert!(full_entry().validate().is_ok());
    }

    #[test]
    fn test_sub_millisecond_lifetime_is_rejected() {
        let entry = ServerEntry::new("1.2.3.4")
            .with_preemptive_reconnect_lifetime(Duration::from_micros(1_500));
        assert!(matches!(entry.validate(), Err(Error::InvalidServerEntry(_))));
        assert!(entry.encode().is_err());

        let whole = ServerEntry::new("1.2.3.4")
            .with_preemptive_reconnect_lifetime(Duration::from_millis(1_500));
        let decoded = ServerEntry::decode(&whole.encode().unwrap()).unwrap();
        assert!(decoded.same_record(&whole));
    }

    #[test]
    fn test_equality_is_by_address() {
        let a = ServerEntry::new("192.0.2.1").with_region("US");
        let b = ServerEntry::new("192.0.2.1").with_region("DE");
        assert_eq!(a, b);
        assert!(!a.same_record(&b));
        assert_ne!(a, ServerEntry::new("192.0.2.2"));
    }
}
