//! Pump threads that drive a transport engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SEND_PERIOD_MILLIS;
use crate::transport::IotHubTransport;

/// The send, receive, and callback pumps that drive an [`IotHubTransport`].
///
/// The engine is passive; these threads supply the periodic ticks it is
/// specified against. The send and callback pumps tick every
/// [`SEND_PERIOD_MILLIS`]; the receive pump ticks at the cadence of the
/// engine's protocol, since the request/response variant polls while the
/// push-based protocols only drain. Dropping the value stops and joins all
/// three.
pub struct TransportPumps {
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl TransportPumps {
    pub fn start(transport: &IotHubTransport) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let send_period = Duration::from_millis(SEND_PERIOD_MILLIS);
        let receive_period = transport.protocol().receive_period();

        let workers = vec![
            spawn_pump("transport-send", shutdown.clone(), send_period, {
                let transport = transport.clone();
                move || transport.send_messages()
            }),
            spawn_pump("transport-receive", shutdown.clone(), receive_period, {
                let transport = transport.clone();
                move || {
                    // Acknowledgement failures re-queue the message; the pump
                    // just records them and tries again next tick
                    if let Err(err) = transport.handle_message() {
                        warn!(error = %err, "receive pump tick failed");
                    }
                }
            }),
            spawn_pump("transport-callback", shutdown.clone(), send_period, {
                let transport = transport.clone();
                move || transport.invoke_callbacks()
            }),
        ];
        debug!(?receive_period, "transport pumps started");
        Self { shutdown, workers }
    }

    /// Stops the pumps and joins their threads
    pub fn stop(self) {
        // Drop does the work
    }
}

impl Drop for TransportPumps {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("transport pumps stopped");
    }
}

fn spawn_pump(
    name: &str,
    shutdown: Arc<AtomicBool>,
    period: Duration,
    mut tick: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                tick();
                thread::sleep(period);
            }
        })
        .expect("failed to spawn a pump thread")
}
