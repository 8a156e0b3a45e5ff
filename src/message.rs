use bytes::Bytes;
use uuid::Uuid;

use crate::config::TransportProtocol;
use crate::{current_time_millis, IotHubClientError};

/// Longest permitted message id, correlation id, lock token, or property
/// name/value
const MAX_FIELD_LENGTH: usize = 128;

/// Non-alphanumeric ASCII permitted in identifiers and property strings,
/// from the URN RFC
const URN_SAFE_PUNCTUATION: &[u8] = br"-:/\.+%_#*?!(),=@;$'";

fn is_urn_safe(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_FIELD_LENGTH
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || URN_SAFE_PUNCTUATION.contains(&b))
}

/// Category of traffic a message belongs to.
///
/// Only telemetry flows through the delivery engine; the twin and method
/// variants exist so adapters can tag traffic they multiplex on the same
/// session.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum MessageType {
    DeviceTelemetry,
    DeviceTwin,
    DeviceMethods,
    #[default]
    Unknown,
}

/// A named user property attached to a [`Message`].
///
/// Property names are compared case-insensitively, matching how the hub
/// treats the HTTPS and AMQP renditions of the same property.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageProperty {
    name: String,
    value: String,
}

impl MessageProperty {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, IotHubClientError> {
        let name = name.into();
        let value = value.into();
        if !is_urn_safe(&name) {
            return Err(IotHubClientError::InvalidArgument(
                "property name must be a URN-safe ASCII string of 1 to 128 characters",
            ));
        }
        if !is_urn_safe(&value) {
            return Err(IotHubClientError::InvalidArgument(
                "property value must be a URN-safe ASCII string of 1 to 128 characters",
            ));
        }
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn has_same_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A telemetry or cloud-to-device message.
///
/// The body is an immutable byte sequence; system fields identify and route
/// the message, and an insertion-ordered list of user properties rides along.
/// A message id, correlation id, and lock token are generated at construction
/// so every message can be correlated even when the caller sets none.
#[derive(Debug, Clone)]
pub struct Message {
    body: Bytes,
    message_id: String,
    correlation_id: String,
    /// Used by the receiving side to complete, abandon, or reject the message
    lock_token: String,
    /// Absolute expiry in milliseconds since the epoch; 0 means never
    expiry_time_millis: u64,
    message_type: MessageType,
    user_id: Option<String>,
    to: Option<String>,
    input_name: Option<String>,
    output_name: Option<String>,
    connection_device_id: Option<String>,
    connection_module_id: Option<String>,
    delivery_acknowledgement: Option<String>,
    properties: Vec<MessageProperty>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            lock_token: Uuid::new_v4().to_string(),
            expiry_time_millis: 0,
            message_type: MessageType::default(),
            user_id: None,
            to: None,
            input_name: None,
            output_name: None,
            connection_device_id: None,
            connection_module_id: None,
            delivery_acknowledgement: None,
            properties: Vec::new(),
        }
    }

    /// Builds a message whose body is the UTF-8 encoding of `text`
    pub fn from_text(text: &str) -> Self {
        Self::new(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn set_message_id(&mut self, message_id: impl Into<String>) -> Result<(), IotHubClientError> {
        let message_id = message_id.into();
        if !is_urn_safe(&message_id) {
            return Err(IotHubClientError::InvalidArgument(
                "message id must be a URN-safe ASCII string of 1 to 128 characters",
            ));
        }
        self.message_id = message_id;
        Ok(())
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn set_correlation_id(
        &mut self,
        correlation_id: impl Into<String>,
    ) -> Result<(), IotHubClientError> {
        let correlation_id = correlation_id.into();
        if !is_urn_safe(&correlation_id) {
            return Err(IotHubClientError::InvalidArgument(
                "correlation id must be a URN-safe ASCII string of 1 to 128 characters",
            ));
        }
        self.correlation_id = correlation_id;
        Ok(())
    }

    pub fn lock_token(&self) -> &str {
        &self.lock_token
    }

    pub fn set_lock_token(&mut self, lock_token: impl Into<String>) -> Result<(), IotHubClientError> {
        let lock_token = lock_token.into();
        if !is_urn_safe(&lock_token) {
            return Err(IotHubClientError::InvalidArgument(
                "lock token must be a URN-safe ASCII string of 1 to 128 characters",
            ));
        }
        self.lock_token = lock_token;
        Ok(())
    }

    /// Absolute expiry in milliseconds since the epoch; 0 means the message
    /// never expires
    pub fn expiry_time_millis(&self) -> u64 {
        self.expiry_time_millis
    }

    /// Sets the expiry relative to the current wall clock
    pub fn set_expiry_time(&mut self, timeout_millis: u64) {
        self.expiry_time_millis = current_time_millis().saturating_add(timeout_millis);
    }

    /// Sets the expiry as an absolute wall-clock instant
    pub fn set_absolute_expiry_time(&mut self, expiry_time_millis: u64) {
        self.expiry_time_millis = expiry_time_millis;
    }

    /// True once the wall clock has moved strictly past the expiry instant
    pub fn is_expired(&self) -> bool {
        self.expiry_time_millis != 0 && current_time_millis() > self.expiry_time_millis
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    /// Whether a broker-level acknowledgement follows a successful wire send.
    ///
    /// The request/response protocol completes synchronously, so its sends
    /// carry their own result; every other protocol acknowledges out of band.
    pub fn ack_expected(&self, protocol: TransportProtocol) -> bool {
        protocol != TransportProtocol::Https
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn set_to(&mut self, to: impl Into<String>) {
        self.to = Some(to.into());
    }

    pub fn input_name(&self) -> Option<&str> {
        self.input_name.as_deref()
    }

    pub fn set_input_name(&mut self, input_name: impl Into<String>) {
        self.input_name = Some(input_name.into());
    }

    pub fn output_name(&self) -> Option<&str> {
        self.output_name.as_deref()
    }

    pub fn set_output_name(&mut self, output_name: impl Into<String>) {
        self.output_name = Some(output_name.into());
    }

    pub fn connection_device_id(&self) -> Option<&str> {
        self.connection_device_id.as_deref()
    }

    pub fn set_connection_device_id(&mut self, device_id: impl Into<String>) {
        self.connection_device_id = Some(device_id.into());
    }

    pub fn connection_module_id(&self) -> Option<&str> {
        self.connection_module_id.as_deref()
    }

    pub fn set_connection_module_id(&mut self, module_id: impl Into<String>) {
        self.connection_module_id = Some(module_id.into());
    }

    pub fn delivery_acknowledgement(&self) -> Option<&str> {
        self.delivery_acknowledgement.as_deref()
    }

    pub fn set_delivery_acknowledgement(&mut self, ack: impl Into<String>) {
        self.delivery_acknowledgement = Some(ack.into());
    }

    /// Value of the user property with the given name, compared
    /// case-insensitively
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.has_same_name(name))
            .map(MessageProperty::value)
    }

    /// Adds or replaces a user property.
    ///
    /// Replacing moves the property to the end of the insertion order, as the
    /// hub serializes properties in the order they were last set.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), IotHubClientError> {
        let property = MessageProperty::new(name, value)?;
        self.properties.retain(|p| !p.has_same_name(property.name()));
        self.properties.push(property);
        Ok(())
    }

    /// User properties in insertion order
    pub fn properties(&self) -> &[MessageProperty] {
        &self.properties
    }
}
