use std::fmt;
use std::sync::Arc;

use crate::callback::{CallbackContext, EventCallback};
use crate::message::Message;
use crate::IotHubStatusCode;

/// A queued message and its delivery bookkeeping.
///
/// Created when the application submits a message and destroyed when the
/// callback queue hands it to [`invoke_callbacks`]; at any instant a packet
/// lives in exactly one of the engine's containers or is owned by the routine
/// currently processing it.
///
/// [`invoke_callbacks`]: crate::IotHubTransport::invoke_callbacks
pub struct TransportPacket {
    message: Message,
    callback: Option<Arc<dyn EventCallback>>,
    context: Option<CallbackContext>,
    status: Option<IotHubStatusCode>,
    retry_count: u32,
    /// Wall clock at first enqueue, from which the operation timeout is
    /// measured across retries
    start_time_millis: u64,
}

impl TransportPacket {
    pub fn new(
        message: Message,
        callback: Option<Arc<dyn EventCallback>>,
        context: Option<CallbackContext>,
        start_time_millis: u64,
    ) -> Self {
        Self {
            message,
            callback,
            context,
            status: None,
            retry_count: 0,
            start_time_millis,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn status(&self) -> Option<IotHubStatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: IotHubStatusCode) {
        self.status = Some(status);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn increment_retry_attempt(&mut self) {
        self.retry_count += 1;
    }

    pub fn start_time_millis(&self) -> u64 {
        self.start_time_millis
    }

    pub fn callback(&self) -> Option<&Arc<dyn EventCallback>> {
        self.callback.as_ref()
    }

    pub fn context(&self) -> Option<&CallbackContext> {
        self.context.as_ref()
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl fmt::Debug for TransportPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPacket")
            .field("message_id", &self.message.message_id())
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("start_time_millis", &self.start_time_millis)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
