//! End-to-end scenarios driving the engine through its public surface with a
//! scripted mock connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use iothub_transport::{
    CallbackContext, ClientConfiguration, ConnectionFactory, ConnectionListener, EventCallback,
    IotHubConnectionStatus, IotHubConnectionStatusChangeReason, IotHubMessageResult,
    IotHubStatusCode, IotHubTransport, Message, NoRetry, RetryDecision, RetryPolicy,
    SasTokenAuthentication, TransportConnection, TransportError, TransportProtocol, TransportPumps,
};

#[derive(Default)]
struct MockState {
    listener: Option<ConnectionListener>,
    sent: Vec<Message>,
    send_failures: VecDeque<TransportError>,
    acks: Vec<(String, IotHubMessageResult)>,
}

struct MockConnection {
    id: String,
    protocol: TransportProtocol,
    /// Report the broker acknowledgement from inside `send_message`, as a
    /// fast broker would
    auto_ack: bool,
    state: Mutex<MockState>,
}

impl MockConnection {
    fn with_auto_ack(protocol: TransportProtocol, auto_ack: bool) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            protocol,
            auto_ack,
            state: Mutex::new(MockState::default()),
        })
    }

    fn listener(&self) -> ConnectionListener {
        self.state
            .lock()
            .listener
            .clone()
            .expect("listener was not installed")
    }

    fn sent(&self) -> Vec<Message> {
        self.state.lock().sent.clone()
    }

    fn acks(&self) -> Vec<(String, IotHubMessageResult)> {
        self.state.lock().acks.clone()
    }

    fn fail_next_send(&self, err: TransportError) {
        self.state.lock().send_failures.push_back(err);
    }
}

impl TransportConnection for MockConnection {
    fn open(&self, _configs: &[ClientConfiguration]) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_listener(&self, listener: ConnectionListener) {
        self.state.lock().listener = Some(listener);
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_message(&self, message: &Message) -> Result<IotHubStatusCode, TransportError> {
        let listener = {
            let mut state = self.state.lock();
            state.sent.push(message.clone());
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }
            state.listener.clone()
        };
        if self.auto_ack {
            if let Some(listener) = listener {
                listener.on_message_sent(message, None);
            }
        }
        Ok(IotHubStatusCode::OkEmpty)
    }

    fn send_message_result(
        &self,
        message: &Message,
        result: IotHubMessageResult,
    ) -> Result<(), TransportError> {
        self.state
            .lock()
            .acks
            .push((message.message_id().to_owned(), result));
        Ok(())
    }

    fn receive_message(&self) -> Result<Option<Message>, TransportError> {
        Ok(None)
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }

    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }
}

struct MockFactory {
    connection: Arc<MockConnection>,
}

impl ConnectionFactory for MockFactory {
    fn create(
        &self,
        _protocol: TransportProtocol,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        Ok(self.connection.clone())
    }
}

#[derive(Debug)]
struct RetryAfter(Duration);

impl RetryPolicy for RetryAfter {
    fn retry_decision(&self, _count: u32, _err: &TransportError) -> RetryDecision {
        RetryDecision::retry(self.0)
    }
}

struct ExpiringToken(std::sync::atomic::AtomicBool);

impl SasTokenAuthentication for ExpiringToken {
    fn is_renewal_necessary(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn config(protocol: TransportProtocol) -> ClientConfiguration {
    ClientConfiguration::new("e2e-device", protocol).unwrap()
}

fn connect(
    config: ClientConfiguration,
) -> (IotHubTransport, Arc<MockConnection>) {
    connect_with(config, false)
}

fn connect_with(
    config: ClientConfiguration,
    auto_ack: bool,
) -> (IotHubTransport, Arc<MockConnection>) {
    let connection = MockConnection::with_auto_ack(config.protocol(), auto_ack);
    let factory = Arc::new(MockFactory {
        connection: connection.clone(),
    });
    let transport = IotHubTransport::new(config.clone(), factory);
    transport.open(vec![config]).unwrap();
    (transport, connection)
}

fn recording_callback() -> (Arc<dyn EventCallback>, Arc<Mutex<Vec<IotHubStatusCode>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: Arc<dyn EventCallback> =
        Arc::new(move |status: IotHubStatusCode, _: Option<&CallbackContext>| {
            sink.lock().push(status);
        });
    (callback, seen)
}

fn record_status_changes(
    transport: &IotHubTransport,
) -> Arc<Mutex<Vec<(IotHubConnectionStatus, IotHubConnectionStatusChangeReason)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    transport.register_connection_status_change_callback(
        Arc::new(
            move |status: IotHubConnectionStatus,
                  reason: IotHubConnectionStatusChangeReason,
                  _cause: Option<&TransportError>,
                  _context: Option<&CallbackContext>| {
                sink.lock().push((status, reason));
            },
        ),
        None,
    );
    seen
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn happy_send_retires_the_packet_through_the_ack() {
    let (transport, connection) = connect(config(TransportProtocol::Mqtt));
    let (callback, seen) = recording_callback();

    transport
        .add_message(Message::from_text("temperature=21"), Some(callback), None)
        .unwrap();
    assert!(!transport.is_empty());

    transport.send_messages();
    let sent = connection.sent();
    assert_eq!(sent.len(), 1);
    assert!(seen.lock().is_empty());

    connection.listener().on_message_sent(&sent[0], None);
    transport.invoke_callbacks();

    assert_eq!(*seen.lock(), vec![IotHubStatusCode::OkEmpty]);
    assert!(transport.is_empty());
}

#[test]
fn transient_send_failure_is_retried_after_the_policy_delay() {
    let mut config = config(TransportProtocol::Mqtt);
    config.set_retry_policy(Arc::new(RetryAfter(Duration::from_millis(50))));
    let (transport, connection) = connect(config);
    connection.fail_next_send(TransportError::network("connection reset"));
    let (callback, seen) = recording_callback();

    transport
        .add_message(Message::from_text("x"), Some(callback), None)
        .unwrap();
    transport.send_messages();

    // The failed packet is parked with the scheduler, not yet retired
    assert_eq!(connection.sent().len(), 1);
    assert!(seen.lock().is_empty());

    assert!(wait_until(Duration::from_secs(2), || {
        transport.send_messages();
        connection.sent().len() == 2
    }));

    let sent = connection.sent();
    connection.listener().on_message_sent(&sent[1], None);
    transport.invoke_callbacks();

    assert_eq!(*seen.lock(), vec![IotHubStatusCode::OkEmpty]);
    assert!(transport.is_empty());
}

#[test]
fn an_expired_message_never_touches_the_wire() {
    let (transport, connection) = connect(config(TransportProtocol::Mqtt));
    let (callback, seen) = recording_callback();

    let mut message = Message::from_text("stale");
    message.set_expiry_time(10);
    transport
        .add_message(message, Some(callback), None)
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    transport.send_messages();
    transport.invoke_callbacks();

    assert!(connection.sent().is_empty());
    assert_eq!(*seen.lock(), vec![IotHubStatusCode::MessageExpired]);
}

#[test]
fn a_disconnect_reconnect_cycle_delivers_every_packet_exactly_once() {
    let (transport, connection) = connect(config(TransportProtocol::Mqtt));
    let changes = record_status_changes(&transport);
    let (callback, seen) = recording_callback();

    // Two packets make it in flight before the connection drops
    for _ in 0..2 {
        transport
            .add_message(Message::from_text("early"), Some(callback.clone()), None)
            .unwrap();
    }
    transport.send_messages();
    assert_eq!(connection.sent().len(), 2);

    // Three more are still waiting when it does
    for _ in 0..3 {
        transport
            .add_message(Message::from_text("late"), Some(callback.clone()), None)
            .unwrap();
    }

    connection
        .listener()
        .on_connection_lost(TransportError::network("gone"), &connection.connection_id());
    assert_eq!(
        transport.connection_status(),
        IotHubConnectionStatus::Connected,
        "the default policy's immediate first attempt should reconnect"
    );
    assert!(changes
        .lock()
        .iter()
        .any(|(status, _)| *status == IotHubConnectionStatus::DisconnectedRetrying));

    // All five go out on the restored connection
    transport.send_messages();
    let sent = connection.sent();
    assert_eq!(sent.len(), 7, "two pre-disconnect sends plus five replays");

    for message in &sent[2..] {
        connection.listener().on_message_sent(message, None);
    }
    transport.invoke_callbacks();

    assert_eq!(*seen.lock(), vec![IotHubStatusCode::OkEmpty; 5]);
    assert!(transport.is_empty());
}

#[test]
fn an_exhausted_retry_policy_closes_and_cancels_pending_work() {
    let mut config = config(TransportProtocol::Mqtt);
    config.set_retry_policy(Arc::new(NoRetry));
    let (transport, connection) = connect(config);
    let changes = record_status_changes(&transport);
    let (callback, seen) = recording_callback();

    transport
        .add_message(Message::from_text("pending"), Some(callback), None)
        .unwrap();

    connection
        .listener()
        .on_connection_lost(TransportError::network("gone"), &connection.connection_id());

    assert_eq!(
        transport.connection_status(),
        IotHubConnectionStatus::Disconnected
    );
    assert_eq!(*seen.lock(), vec![IotHubStatusCode::MessageCancelledOnClose]);
    assert_eq!(
        changes.lock().as_slice(),
        &[
            (
                IotHubConnectionStatus::DisconnectedRetrying,
                IotHubConnectionStatusChangeReason::NoNetwork
            ),
            (
                IotHubConnectionStatus::Disconnected,
                IotHubConnectionStatusChangeReason::RetryExpired
            ),
        ]
    );
}

#[test]
fn an_expired_sas_token_surfaces_unauthorized_and_disconnects() {
    let mut config = config(TransportProtocol::Mqtt);
    let token = Arc::new(ExpiringToken(std::sync::atomic::AtomicBool::new(false)));
    config.set_sas_token_authentication(token.clone());
    let (transport, connection) = connect(config);
    let changes = record_status_changes(&transport);
    let (callback, seen) = recording_callback();

    transport
        .add_message(Message::from_text("x"), Some(callback), None)
        .unwrap();
    token.0.store(true, std::sync::atomic::Ordering::SeqCst);
    transport.send_messages();
    transport.invoke_callbacks();

    assert!(connection.sent().is_empty());
    assert_eq!(*seen.lock(), vec![IotHubStatusCode::Unauthorized]);
    assert_eq!(
        changes.lock().as_slice(),
        &[(
            IotHubConnectionStatus::Disconnected,
            IotHubConnectionStatusChangeReason::ExpiredSasToken
        )]
    );
}

#[test]
fn adding_then_closing_cancels_the_message() {
    let (transport, _connection) = connect(config(TransportProtocol::Mqtt));
    let (callback, seen) = recording_callback();

    transport
        .add_message(Message::from_text("x"), Some(callback), None)
        .unwrap();
    transport
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .unwrap();

    assert_eq!(*seen.lock(), vec![IotHubStatusCode::MessageCancelledOnClose]);
    assert!(transport.is_empty());
}

#[test]
fn the_pumps_carry_a_message_from_submission_to_callback() {
    let mut config = config(TransportProtocol::Mqtt);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    config.set_message_callback(
        Arc::new(move |message: &Message, _: Option<&CallbackContext>| {
            sink.lock().push(message.message_id().to_owned());
            IotHubMessageResult::Complete
        }),
        None,
    );
    let (transport, connection) = connect_with(config, true);
    let (callback, seen) = recording_callback();
    let pumps = TransportPumps::start(&transport);

    transport
        .add_message(Message::from_text("pumped"), Some(callback), None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        *seen.lock() == [IotHubStatusCode::OkEmpty]
    }));

    // Inbound traffic flows the other way through the same pumps
    let inbound = Message::from_text("cloud-to-device");
    let inbound_id = inbound.message_id().to_owned();
    connection.listener().on_message_received(Some(inbound), None);
    assert!(wait_until(Duration::from_secs(2), || {
        connection.acks() == [(inbound_id.clone(), IotHubMessageResult::Complete)]
    }));
    assert_eq!(*delivered.lock(), vec![inbound_id]);

    pumps.stop();
    assert!(transport.is_empty());
}
