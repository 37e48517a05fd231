//! Target and port specification parsing for scan jobs.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

use crate::common::ValidationError;

/// A parsed scan target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Address(IpAddr),
    Network(IpNetwork),
    Hostname(String),
}

impl ScanTarget {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::new("scan target must not be empty"));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(ScanTarget::Address(ip));
        }
        if raw.contains('/') {
            let network: IpNetwork = raw
                .parse()
                .map_err(|e| ValidationError::new(format!("invalid CIDR target '{}': {}", raw, e)))?;
            if let IpNetwork::V4(v4) = network {
                if v4.prefix() < 16 {
                    return Err(ValidationError::new(format!(
                        "CIDR target '{}' is wider than /16",
                        raw
                    )));
                }
            }
            return Ok(ScanTarget::Network(network));
        }
        if is_valid_hostname(raw) {
            return Ok(ScanTarget::Hostname(raw.to_ascii_lowercase()));
        }
        Err(ValidationError::new(format!(
            "target '{}' is not an IP address, CIDR, or hostname",
            raw
        )))
    }
}

fn is_valid_hostname(name: &str) -> bool {
    if name.len() > 253 {
        return false;
    }
    let name = name.strip_suffix('.').unwrap_or(name);
    !name.is_empty()
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

pub fn validate_targets(targets: &[String]) -> Result<Vec<ScanTarget>, ValidationError> {
    if targets.is_empty() {
        return Err(ValidationError::new("scan job needs at least one target"));
    }
    targets.iter().map(|t| ScanTarget::parse(t)).collect()
}

/// Parses `"22,80,443"` / `"1-1024,8080"` into a sorted, deduplicated list.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>, ValidationError> {
    let invalid = |part: &str| ValidationError::new(format!("invalid port specification '{}'", part));

    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start.trim().parse().map_err(|_| invalid(part))?;
            let end: u16 = end.trim().parse().map_err(|_| invalid(part))?;
            if start == 0 || start > end {
                return Err(invalid(part));
            }
            ports.extend(start..=end);
        } else {
            let port: u16 = part.parse().map_err(|_| invalid(part))?;
            if port == 0 {
                return Err(invalid(part));
            }
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(ValidationError::new("port specification selects no ports"));
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists_and_ranges() {
        assert_eq!(parse_ports("22,80,443").unwrap(), vec![22, 80, 443]);
        assert_eq!(parse_ports("1-3, 5,3").unwrap(), vec![1, 2, 3, 5]);
        assert_eq!(parse_ports("65535").unwrap(), vec![65535]);
    }

    #[test]
    fn rejects_bad_ports() {
        for spec in ["0", "10-5", "70000", "abc", "", "1-", " , "] {
            assert!(parse_ports(spec).is_err(), "{spec:?}");
        }
    }

    #[test]
    fn classifies_targets() {
        assert_eq!(
            ScanTarget::parse("10.0.0.5").unwrap(),
            ScanTarget::Address("10.0.0.5".parse().unwrap())
        );
        assert!(matches!(
            ScanTarget::parse("192.168.1.0/24").unwrap(),
            ScanTarget::Network(_)
        ));
        assert_eq!(
            ScanTarget::parse("Web-01.Example.com").unwrap(),
            ScanTarget::Hostname("web-01.example.com".into())
        );
    }

    #[test]
    fn rejects_bad_targets() {
        for raw in ["", "-bad.example", "under_score.lan", "10.0.0.0/8", "300.1.1.1/24"] {
            assert!(ScanTarget::parse(raw).is_err(), "{raw:?}");
        }
        assert!(validate_targets(&[]).is_err());
    }
}
