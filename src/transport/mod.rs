//! The transport state machine and delivery engine.
//!
//! [`IotHubTransport`] owns three packet containers and one inbound queue:
//!
//! ```text
//! add_message -> waiting -> send_messages -> in_flight -> (ack) -> callbacks
//!                                                                     |
//!                                            invoke_callbacks <-------+
//! inbound:  listener -> received -> handle_message -> app callback -> ack
//! ```
//!
//! A packet lives in exactly one container at any instant, or is owned
//! transiently by the routine processing it. The engine is passive: external
//! pumps call [`send_messages`](IotHubTransport::send_messages),
//! [`handle_message`](IotHubTransport::handle_message) and
//! [`invoke_callbacks`](IotHubTransport::invoke_callbacks) periodically, and
//! the active connection raises completions through [`ConnectionListener`].
//! No lock is held across a blocking network call, with one deliberate
//! exception: the reconnect loop holds a dedicated guard so only one
//! reconnection effort runs at a time.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use crate::callback::{
    CallbackContext, ConnectionStateCallback, ConnectionStatusChangeCallback, EventCallback,
    IotHubConnectionState,
};
use crate::config::{AuthType, ClientConfiguration, TransportProtocol};
use crate::connection::{ConnectionFactory, TransportConnection};
use crate::error::{IotHubClientError, TransportError};
use crate::message::Message;
use crate::packet::TransportPacket;
use crate::scheduler::TaskScheduler;
use crate::{
    current_time_millis, IotHubConnectionStatus, IotHubConnectionStatusChangeReason,
    IotHubStatusCode,
};


/// Upper bound on packets dispatched per [`send_messages`] tick.
///
/// Bounding the batch keeps one hot send path from starving the receive and
/// callback pumps that share the engine.
///
/// [`send_messages`]: IotHubTransport::send_messages
pub const MAX_MESSAGES_TO_SEND_PER_THREAD: usize = 10;

type StatusChangeEntry = (Arc<dyn ConnectionStatusChangeCallback>, Option<CallbackContext>);
type StateEntry = (Arc<dyn ConnectionStateCallback>, Option<CallbackContext>);

/// Reconnection bookkeeping, mutated together with status transitions under
/// the state lock
struct ReconnectState {
    current_attempt: u32,
    /// Wall clock at the first attempt of the current effort; 0 when no
    /// effort is under way
    started_millis: u64,
}

/// The transport engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct IotHubTransport {
    inner: Arc<TransportInner>,
}

pub(crate) struct TransportInner {
    /// Back-edge to this value's own `Arc`, the source of the weak handles
    /// handed to listeners and scheduled retries
    weak_self: Weak<TransportInner>,
    default_config: ClientConfiguration,
    factory: Arc<dyn ConnectionFactory>,
    configs: Mutex<Vec<ClientConfiguration>>,

    /// Admission queue: packets accepted but not yet dispatched
    waiting: Mutex<VecDeque<TransportPacket>>,
    /// Dispatched packets awaiting a broker acknowledgement, keyed by
    /// message id
    in_flight: Mutex<FxHashMap<String, TransportPacket>>,
    /// Retired packets awaiting their user callback
    callbacks: Mutex<VecDeque<TransportPacket>>,
    /// Inbound messages not yet delivered to the application
    received: Mutex<VecDeque<Message>>,

    /// Mirror of the status for lock-free readers; transitions happen under
    /// `state`
    status: AtomicU8,
    state: Mutex<ReconnectState>,
    /// Serializes reconnection efforts; the only lock held across blocking
    /// calls
    reconnect_guard: Mutex<()>,

    connection: RwLock<Option<Arc<dyn TransportConnection>>>,

    status_change_callback: Mutex<Option<StatusChangeEntry>>,
    state_callback: Mutex<Option<StateEntry>>,

    scheduler: TaskScheduler,
}

/// Capability handle a connection uses to report events into its engine.
///
/// Carries only the four upward operations and holds a weak back-edge, so an
/// adapter outliving its engine cannot keep the engine alive or reach the
/// rest of its surface.
#[derive(Clone)]
pub struct ConnectionListener {
    inner: Weak<TransportInner>,
}

impl IotHubTransport {
    /// Builds an engine for `default_config`, initially disconnected.
    ///
    /// `factory` produces the protocol adapter each time a connection is
    /// opened; the variant is selected from the default config's protocol.
    pub fn new(default_config: ClientConfiguration, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak_self| TransportInner {
                weak_self: weak_self.clone(),
                default_config,
                factory,
                configs: Mutex::new(Vec::new()),
                waiting: Mutex::new(VecDeque::new()),
                in_flight: Mutex::new(FxHashMap::default()),
                callbacks: Mutex::new(VecDeque::new()),
                received: Mutex::new(VecDeque::new()),
                status: AtomicU8::new(IotHubConnectionStatus::Disconnected as u8),
                state: Mutex::new(ReconnectState {
                    current_attempt: 0,
                    started_millis: 0,
                }),
                reconnect_guard: Mutex::new(()),
                connection: RwLock::new(None),
                status_change_callback: Mutex::new(None),
                state_callback: Mutex::new(None),
                scheduler: TaskScheduler::new(),
            }),
        }
    }

    /// Opens a connection for the given device configurations.
    ///
    /// Idempotent while connected. Fails while a reconnection effort is in
    /// progress, and fails with an authentication error when the saved SAS
    /// token has already expired.
    pub fn open(&self, configs: Vec<ClientConfiguration>) -> Result<(), IotHubClientError> {
        self.inner.open(configs)
    }

    /// Closes the connection, surfacing every pending packet to its callback
    /// with [`IotHubStatusCode::MessageCancelledOnClose`].
    ///
    /// No-op when already disconnected.
    pub fn close(
        &self,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<TransportError>,
    ) -> Result<(), IotHubClientError> {
        self.inner.close(reason, cause)
    }

    /// Accepts a message for delivery.
    ///
    /// The callback, when supplied, fires exactly once with the terminal
    /// status of the send. Fails when the transport is closed.
    pub fn add_message(
        &self,
        message: Message,
        callback: Option<Arc<dyn EventCallback>>,
        context: Option<CallbackContext>,
    ) -> Result<(), IotHubClientError> {
        self.inner.add_message(message, callback, context)
    }

    /// Send pump tick: dispatches up to [`MAX_MESSAGES_TO_SEND_PER_THREAD`]
    /// waiting packets. No-op unless connected.
    pub fn send_messages(&self) {
        self.inner.send_messages();
    }

    /// Receive pump tick: delivers one inbound message to the application
    /// and acknowledges it to the broker. No-op unless connected.
    ///
    /// An acknowledgement failure re-queues the message and surfaces the
    /// error to the pump, which logs it and moves on.
    pub fn handle_message(&self) -> Result<(), IotHubClientError> {
        self.inner.handle_message()
    }

    /// Callback pump tick: drains the callback queue, invoking each packet's
    /// saved callback. A panicking callback is logged and skipped.
    pub fn invoke_callbacks(&self) {
        self.inner.invoke_callbacks();
    }

    /// True when no packet sits in the waiting, in-flight, or callback
    /// containers
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn connection_status(&self) -> IotHubConnectionStatus {
        self.inner.status()
    }

    pub(crate) fn protocol(&self) -> TransportProtocol {
        self.inner.default_config.protocol()
    }

    pub fn register_connection_state_callback(
        &self,
        callback: Arc<dyn ConnectionStateCallback>,
        context: Option<CallbackContext>,
    ) {
        *self.inner.state_callback.lock() = Some((callback, context));
    }

    pub fn register_connection_status_change_callback(
        &self,
        callback: Arc<dyn ConnectionStatusChangeCallback>,
        context: Option<CallbackContext>,
    ) {
        *self.inner.status_change_callback.lock() = Some((callback, context));
    }
}

impl TransportInner {
    fn status(&self) -> IotHubConnectionStatus {
        IotHubConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn connection(&self) -> Option<Arc<dyn TransportConnection>> {
        self.connection.read().clone()
    }

    fn open(&self, configs: Vec<ClientConfiguration>) -> Result<(), IotHubClientError> {
        if configs.is_empty() {
            return Err(IotHubClientError::InvalidArgument(
                "the list of device configurations may not be empty",
            ));
        }
        match self.status() {
            IotHubConnectionStatus::Connected => Ok(()),
            IotHubConnectionStatus::DisconnectedRetrying => Err(TransportError::protocol(
                "open may not be called while the transport is reconnecting",
            )
            .into()),
            IotHubConnectionStatus::Disconnected => {
                if self.is_sas_token_expired() {
                    return Err(IotHubClientError::Authentication(
                        "the saved SAS token has expired".into(),
                    ));
                }
                *self.configs.lock() = configs;
                self.open_connection()?;
                info!(device_id = %self.default_config.device_id(), "transport opened");
                Ok(())
            }
        }
    }

    /// Creates a fresh adapter, wires the listener, opens it, and reports
    /// connected
    fn open_connection(&self) -> Result<(), TransportError> {
        let connection = self.factory.create(self.default_config.protocol())?;
        connection.set_listener(ConnectionListener {
            inner: self.weak_self.clone(),
        });
        *self.connection.write() = Some(connection.clone());
        let configs = self.configs.lock().clone();
        connection.open(&configs)?;
        debug!(
            connection_id = %connection.connection_id(),
            protocol = ?connection.protocol(),
            "connection opened"
        );
        self.update_status(
            IotHubConnectionStatus::Connected,
            IotHubConnectionStatusChangeReason::ConnectionOk,
            None,
        );
        Ok(())
    }

    fn close(
        &self,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<TransportError>,
    ) -> Result<(), IotHubClientError> {
        if self.status() == IotHubConnectionStatus::Disconnected {
            return Ok(());
        }

        self.cancel_pending_packets();
        self.invoke_callbacks();

        if let Some(connection) = self.connection() {
            connection.close()?;
        }

        self.update_status(IotHubConnectionStatus::Disconnected, reason, cause.as_ref());
        info!(?reason, "transport closed");
        Ok(())
    }

    /// Moves every waiting and in-flight packet to the callback queue with
    /// the cancelled-on-close status
    fn cancel_pending_packets(&self) {
        let waiting: Vec<TransportPacket> = self.waiting.lock().drain(..).collect();
        for mut packet in waiting {
            packet.set_status(IotHubStatusCode::MessageCancelledOnClose);
            self.add_to_callback_queue(packet);
        }

        let in_flight: Vec<TransportPacket> =
            self.in_flight.lock().drain().map(|(_, packet)| packet).collect();
        for mut packet in in_flight {
            packet.set_status(IotHubStatusCode::MessageCancelledOnClose);
            self.add_to_callback_queue(packet);
        }
    }

    fn add_message(
        &self,
        message: Message,
        callback: Option<Arc<dyn EventCallback>>,
        context: Option<CallbackContext>,
    ) -> Result<(), IotHubClientError> {
        if self.status() == IotHubConnectionStatus::Disconnected {
            return Err(IotHubClientError::IllegalState(
                "cannot add a message when the transport is closed",
            ));
        }
        let packet = TransportPacket::new(message, callback, context, current_time_millis());
        trace!(
            message_id = %packet.message().message_id(),
            "message accepted onto the waiting queue"
        );
        self.waiting.lock().push_back(packet);
        Ok(())
    }

    fn send_messages(&self) {
        if self.status() != IotHubConnectionStatus::Connected {
            return;
        }
        for _ in 0..MAX_MESSAGES_TO_SEND_PER_THREAD {
            let packet = self.waiting.lock().pop_front();
            match packet {
                Some(packet) => self.send_packet(packet),
                None => break,
            }
        }
    }

    /// Dispatches one packet over the active connection.
    ///
    /// Packets expecting a broker acknowledgement enter the in-flight map
    /// before the wire send so the listener's completion can always find
    /// them, even when the ack races the send's return.
    fn send_packet(&self, packet: TransportPacket) {
        let Some(mut packet) = self.validate_packet(packet) else {
            return;
        };

        let Some(connection) = self.connection() else {
            self.handle_message_exception(
                packet,
                TransportError::network("no connection is open"),
            );
            return;
        };

        let message = packet.message().clone();
        let message_id = message.message_id().to_owned();
        let ack_expected = message.ack_expected(connection.protocol());
        trace!(%message_id, ack_expected, "sending message");

        if ack_expected {
            self.in_flight.lock().insert(message_id.clone(), packet);
            match connection.send_message(&message) {
                Ok(status) if status.is_successful() => {}
                Ok(status) => {
                    if let Some(packet) = self.in_flight.lock().remove(&message_id) {
                        self.handle_message_exception(packet, TransportError::service(status));
                    }
                }
                Err(err) => {
                    if let Some(packet) = self.in_flight.lock().remove(&message_id) {
                        self.handle_message_exception(packet, err);
                    }
                }
            }
        } else {
            match connection.send_message(&message) {
                Ok(status) if status.is_successful() => {
                    packet.set_status(status);
                    self.add_to_callback_queue(packet);
                }
                Ok(status) => {
                    self.handle_message_exception(packet, TransportError::service(status));
                }
                Err(err) => self.handle_message_exception(packet, err),
            }
        }
    }

    /// Screens a packet before dispatch.
    ///
    /// Consumes the packet when it cannot be sent: an expired message is
    /// retired as such, and an expired SAS token retires the packet as
    /// unauthorized and takes the whole transport down.
    fn validate_packet(&self, mut packet: TransportPacket) -> Option<TransportPacket> {
        if packet.message().is_expired() {
            debug!(
                message_id = %packet.message().message_id(),
                "message expired before it could be sent"
            );
            packet.set_status(IotHubStatusCode::MessageExpired);
            self.add_to_callback_queue(packet);
            return None;
        }
        if self.is_sas_token_expired() {
            warn!("SAS token has expired; retiring the message as unauthorized");
            packet.set_status(IotHubStatusCode::Unauthorized);
            self.add_to_callback_queue(packet);
            self.update_status(
                IotHubConnectionStatus::Disconnected,
                IotHubConnectionStatusChangeReason::ExpiredSasToken,
                None,
            );
            return None;
        }
        Some(packet)
    }

    /// Decides the fate of a packet whose send failed: re-queue after a
    /// policy-chosen delay, or retire it to its callback.
    fn handle_message_exception(&self, mut packet: TransportPacket, err: TransportError) {
        warn!(
            message_id = %packet.message().message_id(),
            error = %err,
            "failed to send message"
        );
        packet.increment_retry_attempt();

        if err.is_retryable() && !self.has_operation_timed_out(packet.start_time_millis()) {
            let decision = self
                .default_config
                .retry_policy()
                .retry_decision(packet.retry_count(), &err);
            if decision.should_retry {
                debug!(
                    message_id = %packet.message().message_id(),
                    retry = packet.retry_count(),
                    delay = ?decision.delay,
                    "scheduling message retry"
                );
                let inner = self.weak_self.clone();
                self.scheduler.schedule(
                    decision.delay,
                    Box::new(move || {
                        if let Some(inner) = inner.upgrade() {
                            inner.waiting.lock().push_back(packet);
                        }
                    }),
                );
                return;
            }
        }

        let status = err.service_status().unwrap_or(IotHubStatusCode::Error);
        packet.set_status(status);
        self.add_to_callback_queue(packet);
    }

    /// False when `start_millis` is 0 (nothing in progress); otherwise true
    /// once the configured operation timeout has elapsed since `start_millis`
    fn has_operation_timed_out(&self, start_millis: u64) -> bool {
        if start_millis == 0 {
            return false;
        }
        current_time_millis().saturating_sub(start_millis)
            > self.default_config.operation_timeout_millis()
    }

    /// Packets without a callback have nothing left to report and are
    /// retired in place
    fn add_to_callback_queue(&self, packet: TransportPacket) {
        if packet.has_callback() {
            self.callbacks.lock().push_back(packet);
        }
    }

    fn invoke_callbacks(&self) {
        loop {
            let packet = self.callbacks.lock().pop_front();
            let Some(packet) = packet else { break };
            let Some(status) = packet.status() else {
                error!(
                    message_id = %packet.message().message_id(),
                    "packet reached the callback queue without a status"
                );
                continue;
            };
            let Some(callback) = packet.callback() else {
                continue;
            };
            trace!(
                message_id = %packet.message().message_id(),
                ?status,
                "invoking message callback"
            );
            let context = packet.context();
            if catch_unwind(AssertUnwindSafe(|| callback.execute(status, context))).is_err() {
                error!(
                    message_id = %packet.message().message_id(),
                    "message callback panicked"
                );
            }
        }
    }

    fn handle_message(&self) -> Result<(), IotHubClientError> {
        if self.status() != IotHubConnectionStatus::Connected {
            return Ok(());
        }
        let Some(connection) = self.connection() else {
            return Ok(());
        };

        // The request/response protocol has no push channel; poll it once
        // per tick
        if connection.protocol() == TransportProtocol::Https {
            self.drain_inbound_http(connection.as_ref())?;
        }

        let message = self.received.lock().pop_front();
        if let Some(message) = message {
            self.acknowledge_received_message(message, connection.as_ref())?;
        }
        Ok(())
    }

    fn drain_inbound_http(&self, connection: &dyn TransportConnection) -> Result<(), TransportError> {
        if let Some(message) = connection.receive_message()? {
            debug!(
                message_id = %message.message_id(),
                "message received over the request/response poll"
            );
            self.received.lock().push_back(message);
        }
        Ok(())
    }

    /// Runs the application callback for one inbound message and relays the
    /// disposition to the broker.
    ///
    /// When the relay fails the message returns to the tail of the received
    /// queue, so a transient acknowledgement failure never loses inbound
    /// traffic.
    fn acknowledge_received_message(
        &self,
        message: Message,
        connection: &dyn TransportConnection,
    ) -> Result<(), IotHubClientError> {
        let Some((callback, context)) =
            self.default_config.message_callback_for(message.input_name())
        else {
            warn!(
                message_id = %message.message_id(),
                input_name = ?message.input_name(),
                "received a message but no message callback is registered; dropping it"
            );
            return Ok(());
        };

        let result =
            match catch_unwind(AssertUnwindSafe(|| callback.execute(&message, context.as_ref()))) {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        message_id = %message.message_id(),
                        "message callback panicked; dropping the message"
                    );
                    return Ok(());
                }
            };

        debug!(
            message_id = %message.message_id(),
            ?result,
            "acknowledging received message"
        );
        if let Err(err) = connection.send_message_result(&message, result) {
            warn!(
                message_id = %message.message_id(),
                error = %err,
                "failed to acknowledge received message; re-queueing it"
            );
            self.received.lock().push_back(message);
            return Err(err.into());
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.waiting.lock().is_empty()
            && self.in_flight.lock().is_empty()
            && self.callbacks.lock().is_empty()
    }

    fn is_sas_token_expired(&self) -> bool {
        self.default_config.auth_type() == AuthType::SasToken
            && self
                .default_config
                .sas_token_authentication()
                .is_some_and(|auth| auth.is_renewal_necessary())
    }

    /// Applies a status transition and notifies the registered observers.
    ///
    /// Entering the connected state resets the reconnection bookkeeping, so
    /// the next effort starts its attempt count and timeout budget afresh.
    fn update_status(
        &self,
        new_status: IotHubConnectionStatus,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<&TransportError>,
    ) {
        let changed = {
            let mut state = self.state.lock();
            if self.status() == new_status {
                false
            } else {
                self.status.store(new_status as u8, Ordering::Release);
                if new_status == IotHubConnectionStatus::Connected {
                    state.current_attempt = 0;
                    state.started_millis = 0;
                }
                true
            }
        };
        if !changed {
            return;
        }

        debug!(status = ?new_status, ?reason, "connection status updated");
        self.invoke_status_change_callback(new_status, reason, cause);
        self.invoke_state_callback(new_status, reason);
    }

    fn invoke_status_change_callback(
        &self,
        status: IotHubConnectionStatus,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<&TransportError>,
    ) {
        let entry = self.status_change_callback.lock().clone();
        if let Some((callback, context)) = entry {
            if catch_unwind(AssertUnwindSafe(|| {
                callback.execute(status, reason, cause, context.as_ref())
            }))
            .is_err()
            {
                error!("connection status change callback panicked");
            }
        }
    }

    fn invoke_state_callback(
        &self,
        status: IotHubConnectionStatus,
        reason: IotHubConnectionStatusChangeReason,
    ) {
        let state = match (status, reason) {
            (IotHubConnectionStatus::Connected, _) => IotHubConnectionState::ConnectionSuccess,
            (_, IotHubConnectionStatusChangeReason::ExpiredSasToken) => {
                IotHubConnectionState::SasTokenExpired
            }
            (IotHubConnectionStatus::Disconnected, _) => IotHubConnectionState::ConnectionDrop,
            (IotHubConnectionStatus::DisconnectedRetrying, _) => return,
        };
        let entry = self.state_callback.lock().clone();
        if let Some((callback, context)) = entry {
            if catch_unwind(AssertUnwindSafe(|| callback.execute(state, context.as_ref())))
                .is_err()
            {
                error!("connection state callback panicked");
            }
        }
    }

    /// Classifies an error into the reason reported alongside a status
    /// transition
    fn exception_to_reason(&self, err: &TransportError) -> IotHubConnectionStatusChangeReason {
        if err.is_retryable() {
            IotHubConnectionStatusChangeReason::NoNetwork
        } else if self.is_sas_token_expired() {
            IotHubConnectionStatusChangeReason::ExpiredSasToken
        } else {
            IotHubConnectionStatusChangeReason::BadCredential
        }
    }

    /// Some brokers report transient conditions as unauthorized (a topic not
    /// yet provisioned, a race with credential propagation). While the saved
    /// credential has not expired, such errors are re-labelled retryable.
    /// This is the only place retryability is mutated.
    fn check_for_unauthorized_exception(&self, err: &mut TransportError) {
        if err.is_unauthorized() && !self.is_sas_token_expired() {
            debug!(error = %err, "unauthorized error re-labelled as retryable");
            err.set_retryable(true);
        }
    }

    /// Reacts to a lost connection: in-flight packets move to the head of
    /// the waiting queue so they are retried ahead of fresh submissions,
    /// then a reconnection effort starts.
    fn handle_disconnection(&self, mut err: TransportError) {
        warn!(error = %err, "connection lost");
        {
            let mut in_flight = self.in_flight.lock();
            let mut waiting = self.waiting.lock();
            for (_, packet) in in_flight.drain() {
                waiting.push_front(packet);
            }
        }

        let reason = self.exception_to_reason(&err);
        self.update_status(IotHubConnectionStatus::DisconnectedRetrying, reason, Some(&err));
        self.check_for_unauthorized_exception(&mut err);
        self.reconnect(err);
    }

    /// Closes the current connection and opens a fresh one, returning the
    /// error on failure
    fn single_reconnect_attempt(&self) -> Option<TransportError> {
        if let Some(connection) = self.connection() {
            if let Err(mut err) = connection.close() {
                self.check_for_unauthorized_exception(&mut err);
                return Some(err);
            }
        }
        match self.open_connection() {
            Ok(()) => None,
            Err(mut err) => {
                self.check_for_unauthorized_exception(&mut err);
                Some(err)
            }
        }
    }

    /// The reconnection loop.
    ///
    /// Attempts continue while the transport stays in the retrying state,
    /// the latest error is retryable, the retry policy consents, and the
    /// operation timeout (measured from the first attempt of this effort)
    /// has not elapsed. Every terminal outcome closes the transport with a
    /// reason describing why the effort ended.
    fn reconnect(&self, err: TransportError) {
        let _guard = self.reconnect_guard.lock();
        {
            let mut state = self.state.lock();
            if state.started_millis == 0 {
                state.started_millis = current_time_millis();
            }
        }
        info!(error = %err, "starting reconnection effort");

        let mut last_error = err;
        let mut policy_exhausted = false;
        loop {
            if self.status() != IotHubConnectionStatus::DisconnectedRetrying
                || !last_error.is_retryable()
            {
                break;
            }
            let started = self.state.lock().started_millis;
            if self.has_operation_timed_out(started) {
                break;
            }

            let attempt = self.state.lock().current_attempt;
            let decision = self
                .default_config
                .retry_policy()
                .retry_decision(attempt, &last_error);
            if !decision.should_retry {
                policy_exhausted = true;
                break;
            }

            thread::sleep(decision.delay);
            self.state.lock().current_attempt += 1;
            debug!(attempt = attempt + 1, "reconnection attempt");
            if let Some(err) = self.single_reconnect_attempt() {
                last_error = err;
            }
        }

        if self.status() != IotHubConnectionStatus::DisconnectedRetrying {
            // Reconnected, or closed by another path
            return;
        }

        let started = self.state.lock().started_millis;
        let close_result = if self.has_operation_timed_out(started) {
            warn!("reconnection effort exceeded the operation timeout");
            self.close(
                IotHubConnectionStatusChangeReason::RetryExpired,
                Some(TransportError::operation_timeout(
                    "the reconnection effort exceeded the operation timeout",
                )),
            )
        } else if !last_error.is_retryable() {
            warn!(error = %last_error, "terminal error ended the reconnection effort");
            let reason = self.exception_to_reason(&last_error);
            self.close(reason, Some(last_error.clone()))
        } else {
            debug_assert!(policy_exhausted);
            warn!("retry policy ended the reconnection effort");
            self.close(
                IotHubConnectionStatusChangeReason::RetryExpired,
                Some(last_error.clone()),
            )
        };

        if let Err(close_err) = close_result {
            error!(error = %close_err, "failed to close after an abandoned reconnection effort");
            self.update_status(
                IotHubConnectionStatus::Disconnected,
                IotHubConnectionStatusChangeReason::CommunicationError,
                Some(&last_error),
            );
        }
    }
}

impl ConnectionListener {
    /// Completion of a previously sent message.
    ///
    /// Looks the message up in the in-flight map; completions for unknown
    /// messages are ignored, as the packet may already have been retired by
    /// a close or a disconnection.
    pub fn on_message_sent(&self, message: &Message, error: Option<TransportError>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let message_id = message.message_id();
        let packet = inner.in_flight.lock().remove(message_id);
        match (packet, error) {
            (None, _) => {
                trace!(%message_id, "acknowledgement for a message no longer in flight");
            }
            (Some(mut packet), None) => {
                trace!(%message_id, "message acknowledged");
                packet.set_status(IotHubStatusCode::OkEmpty);
                inner.add_to_callback_queue(packet);
            }
            (Some(packet), Some(err)) => inner.handle_message_exception(packet, err),
        }
    }

    /// Arrival of an inbound message, or an error observed while receiving
    pub fn on_message_received(&self, message: Option<Message>, error: Option<TransportError>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match (message, error) {
            (Some(message), None) => {
                trace!(message_id = %message.message_id(), "message received");
                inner.received.lock().push_back(message);
            }
            (Some(message), Some(err)) => {
                error!(
                    message_id = %message.message_id(),
                    error = %err,
                    "listener reported both a message and an error; dropping the message"
                );
            }
            (None, Some(err)) => {
                error!(error = %err, "error encountered while receiving messages");
            }
            (None, None) => {
                error!("listener reported neither a message nor an error");
            }
        }
    }

    /// Loss of the connection identified by `connection_id`.
    ///
    /// Ignored when the transport is already disconnected and when the id
    /// belongs to a connection that has since been replaced.
    pub fn on_connection_lost(&self, error: TransportError, connection_id: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.status() == IotHubConnectionStatus::Disconnected {
            debug!("connection loss reported while already disconnected");
            return;
        }
        let current_id = inner.connection().map(|c| c.connection_id());
        if current_id.as_deref() != Some(connection_id) {
            debug!(
                connection_id,
                "connection loss reported by a stale connection"
            );
            return;
        }
        inner.handle_disconnection(error);
    }

    /// Establishment of the connection identified by `connection_id`
    pub fn on_connection_established(&self, connection_id: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let current_id = inner.connection().map(|c| c.connection_id());
        if current_id.as_deref() == Some(connection_id) {
            info!(connection_id, "connection established");
            inner.update_status(
                IotHubConnectionStatus::Connected,
                IotHubConnectionStatusChangeReason::ConnectionOk,
                None,
            );
        }
    }
}
