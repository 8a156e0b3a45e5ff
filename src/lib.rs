//! Device-side transport state machine and delivery engine for IoT Hub
//! telemetry.
//!
//! The crate is built around [`IotHubTransport`]: a passive, concurrent state
//! machine that owns the lifecycle of the active connection, queues outgoing
//! packets, tracks in-flight acknowledgements, dispatches inbound messages to
//! application callbacks, and reconnects on failure under a pluggable
//! [`RetryPolicy`]. It runs no event loop of its own; a set of external pumps
//! (see [`TransportPumps`]) drives it by calling [`IotHubTransport::send_messages`],
//! [`IotHubTransport::handle_message`] and [`IotHubTransport::invoke_callbacks`]
//! periodically, while the underlying connection reports completions upward
//! through a [`ConnectionListener`] handle.
//!
//! The wire protocols themselves are out of scope; adapters implement
//! [`TransportConnection`] and are produced by a [`ConnectionFactory`] chosen
//! by the caller.

use std::time::{SystemTime, UNIX_EPOCH};

mod callback;
pub use crate::callback::{
    CallbackContext, ConnectionStateCallback, ConnectionStatusChangeCallback, EventCallback,
    IotHubConnectionState, MessageCallback,
};

mod config;
pub use crate::config::{
    AuthType, ClientConfiguration, SasTokenAuthentication, TransportProtocol,
    RECEIVE_PERIOD_MILLIS_AMQPS, RECEIVE_PERIOD_MILLIS_HTTPS, RECEIVE_PERIOD_MILLIS_MQTT,
    SEND_PERIOD_MILLIS,
};

mod connection;
pub use crate::connection::{ConnectionFactory, TransportConnection};

mod error;
pub use crate::error::{IotHubClientError, TransportError, TransportErrorKind};

mod message;
pub use crate::message::{Message, MessageProperty, MessageType};

mod packet;
pub use crate::packet::TransportPacket;

mod retry;
pub use crate::retry::{ExponentialBackoffWithJitter, NoRetry, RetryDecision, RetryPolicy};

mod scheduler;

mod transport;
pub use crate::transport::{ConnectionListener, IotHubTransport, MAX_MESSAGES_TO_SEND_PER_THREAD};

mod pumps;
pub use crate::pumps::TransportPumps;

/// Connectivity of the transport as observed by the application.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IotHubConnectionStatus {
    /// The connection is established and messages flow in both directions
    Connected = 0,
    /// The connection was lost and the transport is attempting to restore it
    DisconnectedRetrying = 1,
    /// No connection exists, and none is being attempted
    Disconnected = 2,
}

impl IotHubConnectionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::DisconnectedRetrying,
            _ => Self::Disconnected,
        }
    }
}

/// Why the transport transitioned to its current [`IotHubConnectionStatus`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IotHubConnectionStatusChangeReason {
    ConnectionOk,
    NoNetwork,
    ExpiredSasToken,
    BadCredential,
    RetryExpired,
    CommunicationError,
    ClientClose,
}

/// Outcome of an operation against the hub, surfaced to per-message callbacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IotHubStatusCode {
    Ok,
    OkEmpty,
    BadFormat,
    Unauthorized,
    TooManyDevices,
    HubOrDeviceIdNotFound,
    PreconditionFailed,
    RequestEntityTooLarge,
    Throttled,
    InternalServerError,
    ServerBusy,
    Error,
    MessageExpired,
    MessageCancelledOnClose,
}

impl IotHubStatusCode {
    /// Whether the status reports a completed operation
    pub fn is_successful(self) -> bool {
        matches!(self, Self::Ok | Self::OkEmpty)
    }

    /// Service statuses that describe a transient hub-side condition
    pub(crate) fn is_retryable_status(self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::ServerBusy | Self::InternalServerError
        )
    }
}

/// Disposition of an inbound message, returned by the application's
/// [`MessageCallback`] and relayed to the broker as the wire-level
/// acknowledgement.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IotHubMessageResult {
    /// Accept the message; the broker removes it from the device queue
    Complete,
    /// Release the message back to the broker for redelivery
    Abandon,
    /// Refuse the message; the broker dead-letters it
    Reject,
}

/// Milliseconds since the Unix epoch.
///
/// Message expiry and operation timeouts are absolute wall-clock instants so
/// they survive comparison against timestamps stamped by other hosts.
pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
