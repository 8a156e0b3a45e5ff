use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::callback::{CallbackContext, MessageCallback};
use crate::retry::{ExponentialBackoffWithJitter, RetryPolicy};
use crate::IotHubClientError;

/// Send pump cadence in milliseconds
pub const SEND_PERIOD_MILLIS: u64 = 10;
/// Receive pump cadence for the pub/sub protocol
pub const RECEIVE_PERIOD_MILLIS_MQTT: u64 = 10;
/// Receive pump cadence for the queue protocol
pub const RECEIVE_PERIOD_MILLIS_AMQPS: u64 = 10;
/// Receive pump cadence for the request/response protocol, which polls
pub const RECEIVE_PERIOD_MILLIS_HTTPS: u64 = 25;

const DEFAULT_OPERATION_TIMEOUT_MILLIS: u64 = 4 * 60 * 1000;

/// Wire protocol an engine connects with.
///
/// The concrete adapters live outside this crate; the engine only selects a
/// variant and hands the rest to a [`ConnectionFactory`].
///
/// [`ConnectionFactory`]: crate::ConnectionFactory
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportProtocol {
    /// Request/response over HTTPS; receives by polling
    Https,
    /// Message queue protocol
    Amqps,
    /// Message queue protocol tunnelled over websockets
    AmqpsWs,
    /// Publish/subscribe protocol
    Mqtt,
    /// Publish/subscribe protocol tunnelled over websockets
    MqttWs,
}

impl TransportProtocol {
    /// How often the receive pump should tick for this protocol
    pub fn receive_period(self) -> Duration {
        let millis = match self {
            Self::Https => RECEIVE_PERIOD_MILLIS_HTTPS,
            Self::Amqps | Self::AmqpsWs => RECEIVE_PERIOD_MILLIS_AMQPS,
            Self::Mqtt | Self::MqttWs => RECEIVE_PERIOD_MILLIS_MQTT,
        };
        Duration::from_millis(millis)
    }
}

/// How the device authenticates to the hub
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AuthType {
    SasToken,
    X509Certificate,
}

/// View of a shared-access-signature credential, consulted when
/// [`AuthType::SasToken`] is in use.
///
/// The credential itself (signing, renewal) lives outside this crate.
pub trait SasTokenAuthentication: Send + Sync {
    /// Whether the current token has aged past its validity window
    fn is_renewal_necessary(&self) -> bool;
}

struct MessageCallbackEntry {
    callback: Arc<dyn MessageCallback>,
    context: Option<CallbackContext>,
}

/// Per-device configuration consumed by the transport engine.
pub struct ClientConfiguration {
    device_id: String,
    module_id: Option<String>,
    protocol: TransportProtocol,
    auth_type: AuthType,
    iot_hub_connection_string: Option<String>,
    operation_timeout_millis: u64,
    retry_policy: Arc<dyn RetryPolicy>,
    sas_token_authentication: Option<Arc<dyn SasTokenAuthentication>>,
    default_message_callback: Option<MessageCallbackEntry>,
    input_message_callbacks: FxHashMap<String, MessageCallbackEntry>,
}

impl ClientConfiguration {
    /// Builds a configuration with the default operation timeout and retry
    /// policy. Fails when `device_id` is empty.
    pub fn new(
        device_id: impl Into<String>,
        protocol: TransportProtocol,
    ) -> Result<Self, IotHubClientError> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(IotHubClientError::InvalidArgument(
                "device id may not be empty",
            ));
        }
        Ok(Self {
            device_id,
            module_id: None,
            protocol,
            auth_type: AuthType::SasToken,
            iot_hub_connection_string: None,
            operation_timeout_millis: DEFAULT_OPERATION_TIMEOUT_MILLIS,
            retry_policy: Arc::new(ExponentialBackoffWithJitter::default()),
            sas_token_authentication: None,
            default_message_callback: None,
            input_message_callbacks: FxHashMap::default(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    pub fn set_module_id(&mut self, module_id: impl Into<String>) {
        self.module_id = Some(module_id.into());
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn set_auth_type(&mut self, auth_type: AuthType) {
        self.auth_type = auth_type;
    }

    /// The raw connection string; parsing it is the credential layer's
    /// concern
    pub fn iot_hub_connection_string(&self) -> Option<&str> {
        self.iot_hub_connection_string.as_deref()
    }

    pub fn set_iot_hub_connection_string(&mut self, connection_string: impl Into<String>) {
        self.iot_hub_connection_string = Some(connection_string.into());
    }

    /// Wall-clock budget for each message and for a reconnection effort,
    /// measured from first enqueue and from the first reconnect attempt
    pub fn operation_timeout_millis(&self) -> u64 {
        self.operation_timeout_millis
    }

    pub fn set_operation_timeout_millis(&mut self, timeout_millis: u64) {
        self.operation_timeout_millis = timeout_millis;
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    pub fn set_retry_policy(&mut self, retry_policy: Arc<dyn RetryPolicy>) {
        self.retry_policy = retry_policy;
    }

    pub fn sas_token_authentication(&self) -> Option<&Arc<dyn SasTokenAuthentication>> {
        self.sas_token_authentication.as_ref()
    }

    pub fn set_sas_token_authentication(&mut self, auth: Arc<dyn SasTokenAuthentication>) {
        self.sas_token_authentication = Some(auth);
    }

    /// Registers the callback for inbound messages that carry no input name,
    /// or whose input has no dedicated callback
    pub fn set_message_callback(
        &mut self,
        callback: Arc<dyn MessageCallback>,
        context: Option<CallbackContext>,
    ) {
        self.default_message_callback = Some(MessageCallbackEntry { callback, context });
    }

    /// Registers a callback for inbound messages routed to a named input
    pub fn set_input_message_callback(
        &mut self,
        input_name: impl Into<String>,
        callback: Arc<dyn MessageCallback>,
        context: Option<CallbackContext>,
    ) {
        self.input_message_callbacks
            .insert(input_name.into(), MessageCallbackEntry { callback, context });
    }

    /// Resolves the callback for an inbound message: the input's dedicated
    /// callback when one is registered, the default otherwise
    pub(crate) fn message_callback_for(
        &self,
        input_name: Option<&str>,
    ) -> Option<(Arc<dyn MessageCallback>, Option<CallbackContext>)> {
        let entry = input_name
            .and_then(|name| self.input_message_callbacks.get(name))
            .or(self.default_message_callback.as_ref())?;
        Some((entry.callback.clone(), entry.context.clone()))
    }
}

impl Clone for ClientConfiguration {
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            module_id: self.module_id.clone(),
            protocol: self.protocol,
            auth_type: self.auth_type,
            iot_hub_connection_string: self.iot_hub_connection_string.clone(),
            operation_timeout_millis: self.operation_timeout_millis,
            retry_policy: self.retry_policy.clone(),
            sas_token_authentication: self.sas_token_authentication.clone(),
            default_message_callback: self.default_message_callback.as_ref().map(|e| {
                MessageCallbackEntry {
                    callback: e.callback.clone(),
                    context: e.context.clone(),
                }
            }),
            input_message_callbacks: self
                .input_message_callbacks
                .iter()
                .map(|(k, e)| {
                    (
                        k.clone(),
                        MessageCallbackEntry {
                            callback: e.callback.clone(),
                            context: e.context.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("protocol", &self.protocol)
            .field("auth_type", &self.auth_type)
            .field("operation_timeout_millis", &self.operation_timeout_millis)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}
