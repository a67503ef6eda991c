use std::net::IpAddr;

use {thiserror::Error, tracing::warn, url::Url};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OriginRejection {
    #[error("malformed Origin header: '{origin}'")]
    Malformed { origin: String },
    #[error("origin '{origin}' is not in the allowlist")]
    NotAllowed { origin: String },
}

/// Checks the `Origin` header of a WebSocket handshake.
///
/// - A missing `Origin` is allowed (CLI and native clients do not send one).
/// - When the server binds loopback only, loopback peers are allowed as-is.
/// - Otherwise the origin must match an allowlist entry exactly on
///   scheme, host and port (default ports are normalized).
#[derive(Debug, Clone, Default)]
pub struct OriginValidator {
    allowlist: Vec<String>,
    loopback_only: bool,
}

impl OriginValidator {
    pub fn new(allowlist: &[String], loopback_only: bool) -> Self {
        let allowlist = allowlist
            .iter()
            .filter_map(|entry| {
                let normalized = normalize_origin(entry);
                if normalized.is_none() {
                    warn!(entry = %entry, "ignoring invalid allowed origin");
                }
                normalized
            })
            .collect();
        Self {
            allowlist,
            loopback_only,
        }
    }

    pub fn loopback_only(&self) -> bool {
        self.loopback_only
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }

    pub fn validate(&self, origin: Option<&str>, remote: IpAddr) -> Result<(), OriginRejection> {
        let Some(origin) = origin else {
            return Ok(());
        };
        if self.loopback_only && remote.is_loopback() {
            return Ok(());
        }
        let Some(normalized) = normalize_origin(origin) else {
            return Err(OriginRejection::Malformed {
                origin: origin.to_string(),
            });
        };
        if self.allowlist.iter().any(|allowed| *allowed == normalized) {
            Ok(())
        } else {
            Err(OriginRejection::NotAllowed {
                origin: origin.to_string(),
            })
        }
    }
}

/// `scheme://host[:port]` with the default port elided, or `None` for opaque
/// or unparsable origins.
fn normalize_origin(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" {
        return None;
    }
    let origin = Url::parse(raw).ok()?.origin();
    origin
        .is_tuple()
        .then(|| origin.ascii_serialization())
}

/// True when a bind address only accepts loopback traffic.
pub fn is_loopback_bind(bind: &str) -> bool {
    if bind.eq_ignore_ascii_case("localhost") {
        return true;
    }
    bind.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::net::{Ipv4Addr, Ipv6Addr},
    };

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn validator(loopback_only: bool) -> OriginValidator {
        OriginValidator::new(&["https://app.example.com".to_string()], loopback_only)
    }

    #[test]
    fn missing_origin_allowed() {
        assert!(validator(false).validate(None, REMOTE).is_ok());
    }

    #[test]
    fn exact_match_allowed() {
        assert!(
            validator(false)
                .validate(Some("https://app.example.com"), REMOTE)
                .is_ok()
        );
        // Explicit default port normalizes to the same origin.
        assert!(
            validator(false)
                .validate(Some("https://app.example.com:443"), REMOTE)
                .is_ok()
        );
    }

    #[test]
    fn scheme_or_port_mismatch_rejected() {
        let v = validator(false);
        assert!(matches!(
            v.validate(Some("http://app.example.com"), REMOTE),
            Err(OriginRejection::NotAllowed { .. })
        ));
        assert!(matches!(
            v.validate(Some("https://app.example.com:8443"), REMOTE),
            Err(OriginRejection::NotAllowed { .. })
        ));
    }

    #[test]
    fn foreign_origin_rejected_even_from_loopback_when_not_loopback_only() {
        assert!(matches!(
            validator(false).validate(Some("https://evil.example"), LOOPBACK),
            Err(OriginRejection::NotAllowed { .. })
        ));
    }

    #[test]
    fn loopback_bypass_when_bound_to_loopback() {
        let v = validator(true);
        assert!(v.validate(Some("https://evil.example"), LOOPBACK).is_ok());
        assert!(
            v.validate(Some("https://evil.example"), IpAddr::V6(Ipv6Addr::LOCALHOST))
                .is_ok()
        );
        assert!(v.validate(Some("https://evil.example"), REMOTE).is_err());
    }

    #[test]
    fn malformed_origin_rejected() {
        assert!(matches!(
            validator(false).validate(Some("not a url"), REMOTE),
            Err(OriginRejection::Malformed { .. })
        ));
        assert!(matches!(
            validator(false).validate(Some(""), REMOTE),
            Err(OriginRejection::Malformed { .. })
        ));
    }

    #[test]
    fn loopback_bind_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind("localhost"));
        assert!(is_loopback_bind("::1"));
        assert!(is_loopback_bind("[::1]"));
        assert!(!is_loopback_bind("0.0.0.0"));
        assert!(!is_loopback_bind("192.168.1.2"));
    }
}
