//! The boundary toward the wire-protocol adapters.

use std::sync::Arc;

use crate::config::{ClientConfiguration, TransportProtocol};
use crate::error::TransportError;
use crate::message::Message;
use crate::transport::ConnectionListener;
use crate::{IotHubMessageResult, IotHubStatusCode};

/// Uniform facade over the wire protocols.
///
/// Adapters take `&self` and manage their own interior state; the engine
/// shares a handle across its pumps and never serializes calls on a lock of
/// its own. Calls may block on the network. Completion, inbound traffic, and
/// connection loss are reported upward through the [`ConnectionListener`]
/// installed with [`set_listener`](Self::set_listener).
pub trait TransportConnection: Send + Sync {
    /// Establishes the session for the given device configurations.
    ///
    /// Returns once the connection is usable; afterwards the adapter reports
    /// [`ConnectionListener::on_connection_established`] carrying its
    /// connection id.
    fn open(&self, configs: &[ClientConfiguration]) -> Result<(), TransportError>;

    /// Installs the engine's listener handle. Must be called before `open`.
    fn set_listener(&self, listener: ConnectionListener);

    fn close(&self) -> Result<(), TransportError>;

    /// Sends one message, returning the synchronous wire status.
    ///
    /// Protocols that acknowledge out of band return a success here and
    /// deliver the broker's verdict later via
    /// [`ConnectionListener::on_message_sent`].
    fn send_message(&self, message: &Message) -> Result<IotHubStatusCode, TransportError>;

    /// Relays the application's disposition of an inbound message back to
    /// the broker
    fn send_message_result(
        &self,
        message: &Message,
        result: IotHubMessageResult,
    ) -> Result<(), TransportError>;

    /// Polls for one inbound message.
    ///
    /// Only the request/response variant returns `Some`; the push-based
    /// protocols deliver through the listener instead.
    fn receive_message(&self) -> Result<Option<Message>, TransportError>;

    /// Identity of this connection instance, used to ignore events raised by
    /// listeners of connections that have since been replaced
    fn connection_id(&self) -> String;

    fn protocol(&self) -> TransportProtocol;
}

/// Produces the protocol adapter for a connection attempt.
///
/// The engine calls this every time it opens or reopens; a fresh adapter per
/// attempt keeps stale session state out of the new connection.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        protocol: TransportProtocol,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}
