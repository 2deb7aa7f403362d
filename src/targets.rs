//! Turns input lines into scan targets, expanding subnets into their usable hosts.
use ipnet::{IpAddrRange, IpNet};
use thiserror::Error;

use crate::types::{Mode, Target};

/// Why an input line produced no targets.
#[derive(Debug, Error)]
pub enum LineError {
    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("expected 3 comma-separated fields, found {0}")]
    FieldCount(usize),
    #[error("invalid mode {0:?}")]
    InvalidMode(String),
    #[error("invalid subnet {spec:?}: {source}")]
    InvalidSubnet {
        spec: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

/// Parse a `mode,address-or-subnet,port` line.
///
/// The mode is checked before the address, so a bad mode rejects the line even when the
/// subnet would not parse. A trailing `\r` is ignored; other whitespace is kept as-is.
pub fn parse_line(line: &str) -> Result<Targets, LineError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let fields: Vec<&str> = line.split(',').collect();
    let &[mode, spec, port] = fields.as_slice() else {
        return Err(LineError::FieldCount(fields.len()));
    };
    let mode = mode.parse::<Mode>().map_err(LineError::InvalidMode)?;
    expand(mode, spec, port)
}

/// [`parse_line`] over raw input bytes. Bytes that are not UTF-8 reject the line.
pub fn parse_bytes(line: &[u8]) -> Result<Targets, LineError> {
    parse_line(std::str::from_utf8(line)?)
}

/// Expand one host or subnet specification into targets.
///
/// A specification containing `/` must parse as a subnet, or the whole line is rejected.
/// Anything else is taken as a single host and left for the probe to resolve.
pub fn expand(mode: Mode, spec: &str, port: &str) -> Result<Targets, LineError> {
    let hosts = if spec.contains('/') {
        let net = spec
            .parse::<IpNet>()
            .map_err(|source| LineError::InvalidSubnet {
                spec: spec.to_string(),
                source,
            })?;
        Hosts::Subnet(net.hosts())
    } else {
        Hosts::Single(Some(spec.to_string()))
    };
    Ok(Targets {
        mode,
        port: port.to_string(),
        hosts,
    })
}

#[derive(Debug)]
enum Hosts {
    Single(Option<String>),
    Subnet(IpAddrRange),
}

/// Lazy, one-shot sequence of targets from a single input line.
///
/// Subnets yield usable hosts in ascending order: IPv4 blocks up to /30 skip the network and
/// broadcast addresses, /31 and /32 yield every address, IPv6 blocks yield every address.
#[derive(Debug)]
pub struct Targets {
    mode: Mode,
    port: String,
    hosts: Hosts,
}

impl Iterator for Targets {
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        let host = match &mut self.hosts {
            Hosts::Single(host) => host.take()?,
            Hosts::Subnet(range) => range.next()?.to_string(),
        };
        Some(Target::new(self.mode, host, self.port.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn hosts(line: &str) -> Vec<String> {
        parse_line(line).unwrap().map(|t| t.host).collect()
    }

    #[test]
    fn single_host_yields_one_target() {
        let targets: Vec<_> = parse_line("smtp,example.org,25").unwrap().collect();
        assert_eq!(targets, vec![Target::new(Mode::Smtp, "example.org", "25")]);
    }

    #[test]
    fn slash_30_excludes_network_and_broadcast() {
        assert_eq!(hosts("https,10.0.0.0/30,443"), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn host_bits_are_ignored() {
        assert_eq!(hosts("https,10.0.0.3/30,443"), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn slash_31_and_32_keep_all_addresses() {
        assert_eq!(hosts("ftp,192.0.2.4/31,21"), vec!["192.0.2.4", "192.0.2.5"]);
        assert_eq!(hosts("ftp,192.0.2.9/32,21"), vec!["192.0.2.9"]);
    }

    #[test]
    fn slash_24_is_exhaustive_and_unique() {
        let list = hosts("imap,172.16.5.0/24,993");
        assert_eq!(list.len(), 254);
        let unique: HashSet<_> = list.iter().collect();
        assert_eq!(unique.len(), 254);
        assert_eq!(list.first().map(String::as_str), Some("172.16.5.1"));
        assert_eq!(list.last().map(String::as_str), Some("172.16.5.254"));
        assert!(!list.iter().any(|h| h == "172.16.5.0" || h == "172.16.5.255"));
    }

    #[test]
    fn ipv6_subnet_expands() {
        assert_eq!(hosts("https,2001:db8::/126,443").len(), 4);
    }

    #[test]
    fn bad_mode_rejected_before_subnet() {
        assert!(matches!(
            parse_line("bogus,1.2.3.4,80"),
            Err(LineError::InvalidMode(m)) if m == "bogus"
        ));
        assert!(matches!(
            parse_line("bogus,not/a/subnet,80"),
            Err(LineError::InvalidMode(_))
        ));
    }

    #[test]
    fn wrong_field_count_rejected() {
        assert!(matches!(parse_line("https,1.2.3.4"), Err(LineError::FieldCount(2))));
        assert!(matches!(
            parse_line("https,1.2.3.4,443,extra"),
            Err(LineError::FieldCount(4))
        ));
        assert!(matches!(parse_line(""), Err(LineError::FieldCount(1))));
    }

    #[test]
    fn unparsable_subnet_rejected_whole() {
        assert!(matches!(
            parse_line("pop3,10.0.0.0/33,995"),
            Err(LineError::InvalidSubnet { .. })
        ));
        assert!(matches!(
            parse_line("pop3,example.org/24,995"),
            Err(LineError::InvalidSubnet { .. })
        ));
    }

    #[test]
    fn invalid_utf8_rejects_the_line() {
        assert!(matches!(
            parse_bytes(b"https,ex\xffample.org,443"),
            Err(LineError::InvalidUtf8(_))
        ));
        let hosts: Vec<_> = parse_bytes(b"https,192.0.2.1,443\r")
            .unwrap()
            .map(|t| t.host)
            .collect();
        assert_eq!(hosts, vec!["192.0.2.1"]);
    }

    #[test]
    fn crlf_is_tolerated() {
        let targets: Vec<_> = parse_line("https,192.0.2.1,443\r").unwrap().collect();
        assert_eq!(targets[0].port, "443");
    }
}
