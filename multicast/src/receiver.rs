//! Delivery path
//!
//! Decode, account in the matrix clock, buffer, then hand the content to the
//! application. Delivery is eager and unordered; stability is tracked lazily
//! by the sweep.

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::UdpSocket, sync::watch};
use tracing::{debug, info, warn};

use crate::{
    error::{MulticastError, MulticastResult},
    message::Message,
    metrics,
    state::GroupState,
};

/// Application callback invoked once per physical receipt.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn deliver(&self, content: &str);
}

impl<F> DeliveryHandler for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn deliver(&self, content: &str) {
        self(content)
    }
}

/// Process one inbound datagram.
pub fn handle_datagram(
    state: &GroupState,
    handler: &dyn DeliveryHandler,
    bytes: &[u8],
) -> MulticastResult<()> {
    let message = Message::decode(bytes, state.max_members())?;
    debug!("Received: {}", message);

    let content = message.content().to_string();
    state.accept(message)?;

    handler.deliver(&content);
    metrics::record_delivered();
    Ok(())
}

/// Long-lived unicast receive loop, stopped by `shutdown_rx`.
pub async fn run_receive_loop(
    socket: Arc<UdpSocket>,
    state: Arc<GroupState>,
    handler: Arc<dyn DeliveryHandler>,
    max_datagram_size: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; max_datagram_size];
    info!("Unicast receiver started");

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    // ICMP errors from earlier sends surface here on some platforms.
                    warn!("Error receiving unicast message: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = handle_datagram(&state, handler.as_ref(), &buf[..len]) {
            log_dropped(from, &e);
        }
    }

    info!("Unicast receiver stopped");
}

fn log_dropped(from: SocketAddr, err: &MulticastError) {
    if matches!(err, MulticastError::Decode(_)) {
        metrics::record_decode_failure("data");
    }
    warn!("Dropping datagram from {}: {}", from, err);
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::membership::GroupMember;

    fn state(port: u16, peers: &[u16]) -> GroupState {
        let member = |p: u16| GroupMember::from(SocketAddr::from(([127, 0, 0, 1], p)));
        let state = GroupState::new(member(port), 16);
        state
            .apply_presence(peers.iter().map(|p| member(*p)))
            .unwrap();
        state
    }

    #[test]
    fn test_valid_datagram_is_delivered() {
        let state = state(5000, &[5001]);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let handler = move |content: &str| sink.lock().push(content.to_string());

        let bytes = Message::new("hello".to_string(), 1, vec![0, 1])
            .encode()
            .unwrap();
        handle_datagram(&state, &handler, &bytes).unwrap();

        assert_eq!(*delivered.lock(), vec!["hello".to_string()]);
        assert_eq!(state.buffered_len(), 1);
        assert_eq!(state.matrix().get(0, 1), Some(1));
    }

    #[test]
    fn test_malformed_datagram_is_not_delivered() {
        let state = state(5000, &[5001]);
        let delivered = Arc::new(Mutex::new(0usize));
        let sink = delivered.clone();
        let handler = move |_: &str| *sink.lock() += 1;

        let err = handle_datagram(&state, &handler, b"not a message").unwrap_err();
        assert!(matches!(err, MulticastError::Decode(_)));
        assert_eq!(*delivered.lock(), 0);
        assert_eq!(state.buffered_len(), 0);
        assert_eq!(state.matrix().to_rows(), vec![vec![0, 0], vec![0, 0]]);
    }

    #[test]
    fn test_self_sent_message_is_buffered_without_counting() {
        let state = state(5000, &[5001]);
        state.clock.stamp_send(0);
        let handler = |_: &str| {};

        let bytes = Message::new("me".to_string(), 0, vec![1, 0])
            .encode()
            .unwrap();
        handle_datagram(&state, &handler, &bytes).unwrap();

        assert_eq!(state.matrix().row(0), Some(vec![1, 0]));
        assert_eq!(state.buffered_len(), 1);
    }

    #[tokio::test]
    async fn test_receive_loop_survives_garbage_and_stops() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(state(addr.port(), &[addr.port() + 1]));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let handler: Arc<dyn DeliveryHandler> =
            Arc::new(move |content: &str| sink.lock().push(content.to_string()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(run_receive_loop(
            socket,
            state.clone(),
            handler,
            1024,
            shutdown_rx,
        ));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"\x01\x02garbage", addr).await.unwrap();
        let sender_id = state.local_id().map(|id| 1 - id).unwrap();
        let mut vc = vec![0, 0];
        vc[sender_id] = 1;
        let bytes = Message::new("after".to_string(), sender_id, vc)
            .encode()
            .unwrap();
        sender.send_to(&bytes, addr).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while delivered.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*delivered.lock(), vec!["after".to_string()]);

        shutdown_tx.send(true).unwrap();
        let res = tokio::time::timeout(std::time::Duration::from_secs(1), receiver).await;
        assert!(res.is_ok(), "receive loop did not shut down in time");
    }
}
