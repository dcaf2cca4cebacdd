//! Operational event emission.
//!
//! Events are lists of strings; a session prepends its `Client:<channel>`
//! tag before handing them off. The sink task logs every event and, when an
//! event logger address is configured, forwards it as a string-packed
//! datagram over UDP, fire-and-forget.

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gate_wire::Datagram;

/// Cheap-to-clone handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

impl EventSender {
    /// Emits one event. Never blocks; events are dropped only if the sink
    /// task has already shut down.
    pub fn send(&self, event: Vec<String>) {
        let _ = self.tx.send(event);
    }
}

/// Spawns the event sink task and returns a sender handle.
pub fn spawn_event_sink(
    logger_addr: Option<String>,
    cancel: CancellationToken,
) -> EventSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();

    tokio::spawn(async move {
        let socket = match &logger_addr {
            Some(addr) => match UdpSocket::bind("0.0.0.0:0").await {
                Ok(sock) => {
                    info!(eventlogger = %addr, "Forwarding events over UDP");
                    Some(sock)
                }
                Err(e) => {
                    warn!(error = %e, "Could not open event socket; logging only");
                    None
                }
            },
            None => None,
        };

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            info!(event = ?event, "event");

            if let (Some(socket), Some(addr)) = (&socket, &logger_addr) {
                match encode_event(&event) {
                    Ok(dg) => {
                        if let Err(e) = socket.send_to(dg.as_bytes(), addr.as_str()).await {
                            debug!(error = %e, "Event forward failed");
                        }
                    }
                    Err(e) => debug!(error = %e, "Event too large to forward"),
                }
            }
        }

        debug!("Event sink stopped");
    });

    EventSender { tx }
}

/// Packs an event for the logger: a timestamp followed by each entry, all
/// as u16-length-prefixed strings.
fn encode_event(event: &[String]) -> Result<Datagram, gate_wire::WireError> {
    let mut dg = Datagram::new();
    dg.add_string(&chrono::Utc::now().to_rfc3339())?;
    for part in event {
        dg.add_string(part)?;
    }
    Ok(dg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_wire::DatagramIter;

    #[tokio::test]
    async fn test_events_forwarded_over_udp() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let cancel = CancellationToken::new();
        let events = spawn_event_sink(Some(addr), cancel.clone());

        events.send(vec![
            "Client:1000".to_string(),
            "client-connected".to_string(),
            "1.2.3.4:5".to_string(),
            "0.0.0.0:7198".to_string(),
        ]);

        let mut buf = vec![0u8; 2048];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        let mut iter = DatagramIter::new(bytes::Bytes::copy_from_slice(&buf[..len]));

        let _timestamp = iter.read_string().unwrap();
        assert_eq!(iter.read_string().unwrap(), "Client:1000");
        assert_eq!(iter.read_string().unwrap(), "client-connected");
        assert_eq!(iter.read_string().unwrap(), "1.2.3.4:5");
        assert_eq!(iter.read_string().unwrap(), "0.0.0.0:7198");
        assert_eq!(iter.remaining(), 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_without_logger_does_not_block() {
        let cancel = CancellationToken::new();
        let events = spawn_event_sink(None, cancel.clone());
        events.send(vec!["Client:0".to_string(), "client-eject".to_string()]);
        cancel.cancel();
    }
}
