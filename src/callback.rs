//! Application-facing callback surface.
//!
//! All callbacks are object-safe traits with blanket implementations for
//! plain closures, so callers can pass either a capturing closure or a type
//! of their own. Each callback receives the opaque context it was registered
//! with, if any.

use std::any::Any;
use std::sync::Arc;

use crate::error::TransportError;
use crate::message::Message;
use crate::{IotHubConnectionStatus, IotHubConnectionStatusChangeReason, IotHubMessageResult,
            IotHubStatusCode};

/// Opaque state handed back to a callback on every invocation
pub type CallbackContext = Arc<dyn Any + Send + Sync>;

/// Completion callback for a single submitted message.
///
/// Invoked exactly once per packet, with the terminal status of the send.
pub trait EventCallback: Send + Sync {
    fn execute(&self, status: IotHubStatusCode, context: Option<&CallbackContext>);
}

impl<F> EventCallback for F
where
    F: Fn(IotHubStatusCode, Option<&CallbackContext>) + Send + Sync,
{
    fn execute(&self, status: IotHubStatusCode, context: Option<&CallbackContext>) {
        self(status, context)
    }
}

/// Handler for inbound cloud-to-device messages.
///
/// The returned disposition is relayed to the broker as the wire-level
/// acknowledgement.
pub trait MessageCallback: Send + Sync {
    fn execute(&self, message: &Message, context: Option<&CallbackContext>) -> IotHubMessageResult;
}

impl<F> MessageCallback for F
where
    F: Fn(&Message, Option<&CallbackContext>) -> IotHubMessageResult + Send + Sync,
{
    fn execute(&self, message: &Message, context: Option<&CallbackContext>) -> IotHubMessageResult {
        self(message, context)
    }
}

/// Observer for connection status transitions.
///
/// Invoked synchronously on the thread performing the transition; it should
/// return promptly.
pub trait ConnectionStatusChangeCallback: Send + Sync {
    fn execute(
        &self,
        status: IotHubConnectionStatus,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<&TransportError>,
        context: Option<&CallbackContext>,
    );
}

impl<F> ConnectionStatusChangeCallback for F
where
    F: Fn(
            IotHubConnectionStatus,
            IotHubConnectionStatusChangeReason,
            Option<&TransportError>,
            Option<&CallbackContext>,
        ) + Send
        + Sync,
{
    fn execute(
        &self,
        status: IotHubConnectionStatus,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<&TransportError>,
        context: Option<&CallbackContext>,
    ) {
        self(status, reason, cause, context)
    }
}

/// Coarse connection states reported through the legacy state callback
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IotHubConnectionState {
    ConnectionSuccess,
    ConnectionDrop,
    SasTokenExpired,
}

/// Legacy connection-state observer, kept alongside the richer
/// [`ConnectionStatusChangeCallback`]
pub trait ConnectionStateCallback: Send + Sync {
    fn execute(&self, state: IotHubConnectionState, context: Option<&CallbackContext>);
}

impl<F> ConnectionStateCallback for F
where
    F: Fn(IotHubConnectionState, Option<&CallbackContext>) + Send + Sync,
{
    fn execute(&self, state: IotHubConnectionState, context: Option<&CallbackContext>) {
        self(state, context)
    }
}
