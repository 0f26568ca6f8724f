use thiserror::Error;

/// Errors surfaced by the delivery engine to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// A quota or limit rejected the enqueue/dequeue. Nothing was mutated;
    /// the caller may retry later.
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("client closed the request")]
    ClientCancelled,

    /// The admission service could not be reached.
    #[error("admission service unavailable: {0}")]
    TransportFault(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// The channel was closed between lookup and use. Callers re-resolve
    /// the channel through the directory.
    #[error("channel is being destroyed")]
    ChannelDestroying,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors returned by an [`AdmissionService`](crate::core::admission::AdmissionService).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("limit reached for rule '{rule}' (limit {limit})")]
    LimitReached { rule: String, limit: i64 },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Precondition violations on a heartbeat timer or its owning item.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("heartbeat timer already attached")]
    AlreadyAttached,

    #[error("heartbeat timer requires a timeout callback")]
    MissingTimeoutCallback,
}

impl From<AdmissionError> for BrokerError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::LimitReached { .. } => BrokerError::AdmissionRejected(err.to_string()),
            AdmissionError::Transport(msg) => BrokerError::TransportFault(msg),
        }
    }
}

impl From<HeartbeatError> for BrokerError {
    fn from(err: HeartbeatError) -> Self {
        BrokerError::Internal(err.to_string())
    }
}

impl BrokerError {
    /// True for errors a caller can reasonably retry without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::AdmissionRejected(_) | BrokerError::TransportFault(_)
        )
    }
}
