use std::net::IpAddr;

use {
    secrecy::{ExposeSecret, Secret},
    subtle::ConstantTimeEq,
    thiserror::Error,
};

use pincer_config::{AuthConfig, AuthMode};

// ── Types ────────────────────────────────────────────────────────────────────

/// Resolved gateway auth configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<Secret<String>>,
    pub password: Option<Secret<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Token,
    Password,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Token => "token",
            Self::Password => "password",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("gateway has no {0} configured")]
    NotConfigured(&'static str),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid {0}")]
    Mismatch(&'static str),
}

impl AuthError {
    /// Stable reason tag for audit records.
    pub fn reason(&self) -> String {
        match self {
            Self::NotConfigured(what) => format!("{what}_missing_config"),
            Self::Missing(what) => format!("{what}_missing"),
            Self::Mismatch(what) => format!("{what}_mismatch"),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

// ── Auth logic ───────────────────────────────────────────────────────────────

impl ResolvedAuth {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            mode: config.resolved_mode(),
            token: config.token.clone(),
            password: config.password.clone(),
        }
    }

    pub fn none() -> Self {
        Self {
            mode: AuthMode::None,
            token: None,
            password: None,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token,
            token: Some(Secret::new(token.into())),
            password: None,
        }
    }

    /// Authenticate a `connect` request (or a legacy `auth` message).
    pub fn authorize_connect(
        &self,
        provided_token: Option<&str>,
        provided_password: Option<&str>,
    ) -> Result<AuthMethod, AuthError> {
        match self.mode {
            AuthMode::None => Ok(AuthMethod::None),
            AuthMode::Token => {
                check_secret("token", self.token.as_ref(), provided_token)?;
                Ok(AuthMethod::Token)
            },
            AuthMode::Password => {
                check_secret("password", self.password.as_ref(), provided_password)?;
                Ok(AuthMethod::Password)
            },
        }
    }

    /// Check a bare credential (`?token=` query parameter, HTTP bearer)
    /// against whichever secret the current mode uses.
    pub fn authorize_bearer(&self, provided: Option<&str>) -> Result<AuthMethod, AuthError> {
        match self.mode {
            AuthMode::None => Ok(AuthMethod::None),
            AuthMode::Token => self.authorize_connect(provided, None),
            AuthMode::Password => self.authorize_connect(None, provided),
        }
    }
}

fn check_secret(
    what: &'static str,
    expected: Option<&Secret<String>>,
    provided: Option<&str>,
) -> Result<(), AuthError> {
    let Some(expected) = expected else {
        return Err(AuthError::NotConfigured(what));
    };
    let Some(given) = provided.filter(|s| !s.is_empty()) else {
        return Err(AuthError::Missing(what));
    };
    if !safe_equal(given, expected.expose_secret()) {
        return Err(AuthError::Mismatch(what));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn token_mode() {
        let auth = ResolvedAuth::with_token("secret");
        assert_eq!(auth.authorize_connect(Some("secret"), None), Ok(AuthMethod::Token));
        assert_eq!(
            auth.authorize_connect(Some("nope"), None),
            Err(AuthError::Mismatch("token"))
        );
        assert_eq!(auth.authorize_connect(None, None), Err(AuthError::Missing("token")));
        assert_eq!(
            auth.authorize_connect(None, Some("secret")),
            Err(AuthError::Missing("token"))
        );
    }

    #[test]
    fn password_mode_and_bearer() {
        let auth = ResolvedAuth {
            mode: AuthMode::Password,
            token: None,
            password: Some(Secret::new("hunter2".into())),
        };
        assert_eq!(
            auth.authorize_connect(None, Some("hunter2")),
            Ok(AuthMethod::Password)
        );
        assert_eq!(auth.authorize_bearer(Some("hunter2")), Ok(AuthMethod::Password));
        assert!(auth.authorize_bearer(Some("hunter")).is_err());
    }

    #[test]
    fn none_mode_accepts_anything() {
        let auth = ResolvedAuth::none();
        assert_eq!(auth.authorize_connect(None, None), Ok(AuthMethod::None));
        assert_eq!(auth.authorize_bearer(Some("whatever")), Ok(AuthMethod::None));
    }

    #[test]
    fn token_mode_without_token_configured() {
        let auth = ResolvedAuth {
            mode: AuthMode::Token,
            token: None,
            password: None,
        };
        let err = auth.authorize_connect(Some("x"), None).unwrap_err();
        assert_eq!(err.reason(), "token_missing_config");
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("127.8.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback("10.0.0.1".parse().unwrap()));
    }
}
