//! Admission control for the gateway.
//!
//! Every inbound connection passes the [`OriginValidator`] and the per-IP
//! [`RateLimiter`]; every inbound message passes the raw length cap, the
//! per-client rate limiter and the structural checks of [`InputValidator`].
//! Rejections are recorded in the [`AuditLogger`].

pub mod audit;
pub mod input;
pub mod origin;
pub mod rate_limit;

pub use {
    audit::{AuditEvent, AuditEventKind, AuditLogger},
    input::{InputValidator, ValidationError},
    origin::{OriginRejection, OriginValidator, is_loopback_bind},
    rate_limit::{RateLimitError, RateLimiter},
};
