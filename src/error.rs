use thiserror::Error;

use crate::execution::PositionState;

/// Errors returned by the position engine
///
/// Exchange failures are terminal for the current position; the engine
/// never retries a monetary operation on its own.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("a position is already active ({0})")]
    AlreadyActive(PositionState),

    #[error("no open position to close (state: {0})")]
    NotOpen(PositionState),

    #[error("exchange rejected the order: {0}")]
    ExchangeRejected(String),

    #[error("exchange did not answer within {0}ms, order outcome unknown")]
    ExchangeTimeout(u64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("position engine is not running")]
    EngineStopped,
}

/// Errors from exchange clients
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("order {0} not filled")]
    NotFilled(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

impl ExchangeError {
    /// Bybit retCodes that mean the account cannot cover the order
    const INSUFFICIENT_BALANCE_CODES: &'static [i64] = &[170131, 170033, 110007];

    pub fn from_ret_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if Self::INSUFFICIENT_BALANCE_CODES.contains(&code) {
            ExchangeError::InsufficientBalance(message)
        } else {
            ExchangeError::Rejected { code, message }
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExchangeError::Parse(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Parse(err.to_string())
    }
}

impl From<ExchangeError> for EngineError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::InsufficientBalance(msg) => {
                EngineError::ExchangeRejected(format!("insufficient balance: {}", msg))
            }
            other => EngineError::ExchangeRejected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ret_code_mapping() {
        let err = ExchangeError::from_ret_code(170131, "Insufficient balance.");
        assert!(matches!(err, ExchangeError::InsufficientBalance(_)));

        let err = ExchangeError::from_ret_code(10001, "params error");
        assert!(matches!(err, ExchangeError::Rejected { code: 10001, .. }));
    }

    #[test]
    fn test_exchange_error_becomes_rejection() {
        let err: EngineError = ExchangeError::InsufficientBalance("USDT".to_string()).into();
        assert_eq!(
            err,
            EngineError::ExchangeRejected("insufficient balance: USDT".to_string())
        );
    }

    #[test]
    fn test_timeout_message_keeps_sub_second_deadline() {
        let err = EngineError::ExchangeTimeout(250);
        assert!(err.to_string().contains("within 250ms"));
    }
}
