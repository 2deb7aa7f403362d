use serde::Serialize;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

/// Service a target speaks before TLS starts.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ftp,
    Https,
    Imap,
    Pop3,
    Smtp,
}

impl Mode {
    pub const ALL: [Mode; 5] = [Mode::Ftp, Mode::Https, Mode::Imap, Mode::Pop3, Mode::Smtp];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Ftp => "ftp",
            Mode::Https => "https",
            Mode::Imap => "imap",
            Mode::Pop3 => "pop3",
            Mode::Smtp => "smtp",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    /// Only the exact lowercase names are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// One unit of scan work: a host and port to check in a given mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub mode: Mode,
    pub host: String,
    pub port: String,
}

impl Target {
    pub fn new(mode: Mode, host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            mode,
            host: host.into(),
            port: port.into(),
        }
    }

    /// `host:port`, with IPv6 literals bracketed so the result can be connected to.
    pub fn address(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Verdict attached to a result. Serializes as its one-letter code.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    #[serde(rename = "Y")]
    Vulnerable,
    #[serde(rename = "N")]
    NotVulnerable,
    #[serde(rename = "U")]
    Unknown,
    #[serde(rename = "E")]
    Error,
}

/// Outcome for one target. Field order is the output record order.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub classification: Classification,
    pub mode: Mode,
    pub host: String,
    pub port: String,
    pub reason: String,
}

impl ScanResult {
    pub fn new(target: Target, classification: Classification, reason: impl Into<String>) -> Self {
        Self {
            classification,
            mode: target.mode,
            host: target.host,
            port: target.port,
            reason: reason.into(),
        }
    }
}

/// Per-classification counters accumulated by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub vulnerable: u64,
    pub not_vulnerable: u64,
    pub unknown: u64,
    pub errors: u64,
}

impl ScanSummary {
    pub fn record(&mut self, classification: Classification) {
        match classification {
            Classification::Vulnerable => self.vulnerable += 1,
            Classification::NotVulnerable => self.not_vulnerable += 1,
            Classification::Unknown => self.unknown += 1,
            Classification::Error => self.errors += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.vulnerable + self.not_vulnerable + self.unknown + self.errors
    }
}
