use crate::config::{CsrfConfig, CsrfMode};
use crate::metrics_defs::CSRF_FAILURES;
use http::header::{COOKIE, HeaderMap, HeaderName};
use shared::counter;
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub static CSRF_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");

/// Decides whether a request carries a valid CSRF token.
pub trait CsrfValidator: Send + Sync {
    fn is_valid(&self, headers: &HeaderMap) -> bool;
}

/// Double-submit cookie check: the `X-CSRF-Token` header must be non-empty
/// and equal to the value of the configured cookie.
pub struct DoubleSubmitCookie {
    cookie_name: String,
}

impl DoubleSubmitCookie {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        DoubleSubmitCookie {
            cookie_name: cookie_name.into(),
        }
    }

    fn cookie_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, value)| value.trim())
    }
}

impl CsrfValidator for DoubleSubmitCookie {
    fn is_valid(&self, headers: &HeaderMap) -> bool {
        let Some(token) = headers
            .get(&CSRF_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
        else {
            return false;
        };
        let Some(cookie) = self.cookie_value(headers) else {
            return false;
        };

        token.as_bytes().ct_eq(cookie.as_bytes()).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfDecision {
    Allow,
    Reject,
}

/// Applies the configured [`CsrfMode`] to the outcome of a validator.
#[derive(Clone)]
pub struct CsrfGuard {
    mode: CsrfMode,
    validator: Arc<dyn CsrfValidator>,
}

impl CsrfGuard {
    pub fn new(mode: CsrfMode, validator: Arc<dyn CsrfValidator>) -> Self {
        CsrfGuard { mode, validator }
    }

    pub fn from_config(config: &CsrfConfig) -> Self {
        Self::new(
            config.mode,
            Arc::new(DoubleSubmitCookie::new(config.cookie_name.clone())),
        )
    }

    pub fn check(&self, headers: &HeaderMap) -> CsrfDecision {
        if self.mode == CsrfMode::Off || self.validator.is_valid(headers) {
            return CsrfDecision::Allow;
        }

        counter!(CSRF_FAILURES, "mode" => self.mode.as_str()).increment(1);
        match self.mode {
            CsrfMode::Enforce => CsrfDecision::Reject,
            CsrfMode::Report | CsrfMode::Off => {
                tracing::warn!(mode = self.mode.as_str(), "Invalid CSRF token, allowing request");
                CsrfDecision::Allow
            }
        }
    }
}
