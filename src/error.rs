// =============================================================================
// Exchange error taxonomy
// =============================================================================
//
// Four kinds, matching the error-handling design: transient errors are
// retried by the caller, rejections fail fast, malformed stream payloads are
// logged and skipped, and invariant violations are logged and ignored (the
// core never trusts itself enough to crash on self-inconsistency).
// =============================================================================

use thiserror::Error;

/// Error surfaced by the exchange client and its transport layer.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Transport or exchange-reported transient failure. Retryable.
    #[error("transient exchange error (code={code:?}): {message}")]
    Transient {
        code: Option<i64>,
        message: String,
    },

    /// Non-retryable exchange rejection: bad parameter, auth, signature.
    #[error("exchange rejected request (code={code:?}): {message}")]
    Rejected {
        code: Option<i64>,
        message: String,
    },

    /// Malformed payload from a streaming channel. Never fatal to the stream.
    #[error("malformed stream payload: {0}")]
    Malformed(String),

    /// A self-inconsistency detected inside the core (unknown order id on a
    /// terminal event, a negative computed quantity, and so on).
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExchangeError {
    /// Whether this error should be retried by the caller (spec.md §4.A).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient { .. } | ExchangeError::Transport(_) | ExchangeError::WebSocket(_)
        )
    }

    /// Construct a `Transient`/`Rejected` variant from an exchange-reported
    /// return code, classifying it per the venue's documented code ranges.
    ///
    /// Parameter and authentication codes (10001-10004, signature errors)
    /// are non-retryable; rate-limit and internal system codes (10006,
    /// 10016, 30034 and similar "system busy" codes) are transient.
    pub fn from_exchange_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_non_retryable_code(code) {
            ExchangeError::Rejected {
                code: Some(code),
                message,
            }
        } else {
            ExchangeError::Transient {
                code: Some(code),
                message,
            }
        }
    }
}

fn is_non_retryable_code(code: i64) -> bool {
    matches!(code, 10001 | 10002 | 10003 | 10004 | 10005 | 33004 | 110001 | 110012)
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_retryable() {
        let e = ExchangeError::from_exchange_code(10006, "rate limited");
        assert!(e.is_retryable());
    }

    #[test]
    fn parameter_and_auth_codes_are_not_retryable() {
        for code in [10001, 10002, 10003, 10004] {
            let e = ExchangeError::from_exchange_code(code, "bad request");
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn malformed_payloads_are_not_retryable() {
        let e = ExchangeError::Malformed("bad json".into());
        assert!(!e.is_retryable());
    }
}
