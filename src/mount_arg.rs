//! Parsing a `host[:path]` mount source, e.g. `10.0.0.2` or `10.0.0.2:/exports/data`.
//!
//! Validates the IPv4 address character-by-character (digits and dots only, exactly
//! three dots, no two consecutive dots) the same way the original command-line parser
//! did, rather than delegating straight to `std::net::Ipv4Addr::from_str` and losing
//! the distinction between "not an IP at all" and "malformed IP".

use std::net::Ipv4Addr;

use crate::error::NetfsError;

/// A parsed mount source: a server address and the root label to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    pub ip: Ipv4Addr,
    pub url: String,
}

pub fn parse_source(arg: &str) -> Result<MountSource, NetfsError> {
    let (ip_part, url_part) = match arg.split_once(':') {
        Some((ip, url)) => (ip, Some(url)),
        None => (arg, None),
    };

    let ip = parse_ipv4(ip_part)
        .ok_or_else(|| NetfsError::InvalidSource(arg.to_string(), "invalid or incomplete IP address"))?;

    let url = match url_part {
        None => "/".to_string(),
        Some(u) if u.starts_with('/') => u.to_string(),
        Some(u) => format!("/{u}"),
    };

    Ok(MountSource { ip, url })
}

fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    let mut dot_count = 0;
    let mut last_was_dot = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            last_was_dot = false;
        } else if c == '.' {
            if last_was_dot {
                return None;
            }
            last_was_dot = true;
            dot_count += 1;
            if dot_count > 3 {
                return None;
            }
        } else {
            return None;
        }
    }
    if dot_count != 3 || last_was_dot {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_ip_with_default_root() {
        let source = parse_source("10.0.0.2").unwrap();
        assert_eq!(source.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(source.url, "/");
    }

    #[test]
    fn parses_ip_with_explicit_leading_slash_url() {
        let source = parse_source("10.0.0.2:/exports/data").unwrap();
        assert_eq!(source.url, "/exports/data");
    }

    #[test]
    fn parses_ip_with_url_missing_leading_slash() {
        let source = parse_source("10.0.0.2:exports/data").unwrap();
        assert_eq!(source.url, "/exports/data");
    }

    #[test]
    fn rejects_incomplete_ip() {
        assert!(parse_source("10.0.2:/x").is_err());
    }

    #[test]
    fn rejects_consecutive_dots() {
        assert!(parse_source("10..0.2:/x").is_err());
    }

    #[test]
    fn rejects_non_numeric_octet() {
        assert!(parse_source("10.0.a.2:/x").is_err());
    }
}
