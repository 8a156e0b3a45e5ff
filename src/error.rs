use thiserror::Error;

use crate::IotHubStatusCode;

/// Classifies a failure raised by a wire-protocol adapter or by the engine's
/// own bookkeeping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportErrorKind {
    /// Connectivity loss or socket-level I/O failure
    Network,
    /// The wire session violated the protocol or reached an unexpected state
    Protocol,
    /// The hub rejected an operation with an explicit status
    Service(IotHubStatusCode),
    /// The pub/sub session was refused as unauthorized
    MqttUnauthorized,
    /// The queue link was refused with unauthorized-access
    AmqpUnauthorizedAccess,
    /// The credential was rejected without a protocol-specific cause
    Unauthorized,
    /// A wall-clock operation budget was exceeded
    OperationTimeout,
}

impl TransportErrorKind {
    /// Whether errors of this kind are worth retrying absent other context.
    ///
    /// Unauthorized kinds start out terminal; the engine re-labels them as
    /// retryable while the saved credential is still valid, since some brokers
    /// report transient conditions as unauthorized.
    fn default_retryable(self) -> bool {
        match self {
            Self::Network => true,
            Self::Service(status) => status.is_retryable_status(),
            Self::Protocol
            | Self::MqttUnauthorized
            | Self::AmqpUnauthorizedAccess
            | Self::Unauthorized
            | Self::OperationTimeout => false,
        }
    }
}

/// A network, protocol, or service failure observed below the engine.
///
/// Carries whether the condition is worth retrying and, for hub rejections,
/// the service status that should be surfaced to the packet's callback.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    retryable: bool,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    /// A rejection carrying the hub's status code
    pub fn service(status: IotHubStatusCode) -> Self {
        Self::new(
            TransportErrorKind::Service(status),
            format!("the hub responded to the operation with {status:?}"),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unauthorized, message)
    }

    pub fn operation_timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::OperationTimeout, message)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Overrides the retry classification.
    ///
    /// The engine calls this in exactly one place, when an unauthorized error
    /// arrives while the credential has not expired.
    pub fn set_retryable(&mut self, retryable: bool) {
        self.retryable = retryable;
    }

    /// The service status to report to the packet callback, if the hub
    /// supplied one
    pub fn service_status(&self) -> Option<IotHubStatusCode> {
        match self.kind {
            TransportErrorKind::Service(status) => Some(status),
            _ => None,
        }
    }

    pub(crate) fn is_unauthorized(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::MqttUnauthorized
                | TransportErrorKind::AmqpUnauthorizedAccess
                | TransportErrorKind::Unauthorized
        )
    }
}

/// Errors raised synchronously by the transport facade.
///
/// Failures inside the send path and the reconnect loop never surface here;
/// they are reported through packet statuses and the status-change callback.
#[derive(Debug, Clone, Error)]
pub enum IotHubClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The credential was rejected or has expired
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// A required argument was empty or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation is not valid in the transport's current status
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("operation timed out: {0}")]
    OperationTimeout(&'static str),
}
