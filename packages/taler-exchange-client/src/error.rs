/// Errors from talking to an exchange
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Network-level failure: connect, timeout, TLS
    #[error("transport error talking to exchange: {0}")]
    Transport(#[from] reqwest::Error),

    /// The exchange replied with an error status and (usually) an error body
    #[error("exchange returned HTTP {status}: {hint}")]
    Status {
        status: u16,
        code: Option<u32>,
        hint: String,
    },

    /// HTTP 403 on deposit: the coin's transaction history proves a
    /// double-spend. The raw proof is kept for upstream forwarding.
    #[error("coin already spent at the exchange")]
    DoubleSpend { proof: serde_json::Value },

    /// The exchange replied 2xx but the body did not parse
    #[error("malformed reply from exchange: {0}")]
    MalformedReply(String),

    /// The advertised master key does not match the configured one
    #[error("exchange master key mismatch")]
    MasterKeyMismatch,
}

impl ExchangeError {
    /// Whether a retry against the same exchange could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
