//! Send path
//!
//! The clock is stamped synchronously; transmission happens on one task per
//! destination so a slow or failing peer never holds up the others or the
//! caller. Transmit failures are logged and never roll back the stamp.

use std::{fmt, net::SocketAddr, sync::Arc};

use tokio::{net::UdpSocket, runtime::Handle, sync::watch};
use tracing::{debug, warn};

use crate::{
    error::{MulticastError, MulticastResult},
    membership::GroupMember,
    message::Message,
    metrics,
    state::GroupState,
};

/// Who a message goes to.
#[derive(Clone, Default)]
pub enum Destinations {
    /// Every known member except the local one.
    #[default]
    AllPeers,
    /// Exactly these endpoints, known members or not.
    Explicit(Vec<SocketAddr>),
    /// Known peers accepted by the predicate.
    Select(Arc<dyn Fn(&GroupMember) -> bool + Send + Sync>),
}

impl Destinations {
    pub fn explicit<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        Destinations::Explicit(addrs.into_iter().collect())
    }

    pub fn select<F>(predicate: F) -> Self
    where
        F: Fn(&GroupMember) -> bool + Send + Sync + 'static,
    {
        Destinations::Select(Arc::new(predicate))
    }
}

impl fmt::Debug for Destinations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destinations::AllPeers => f.write_str("AllPeers"),
            Destinations::Explicit(addrs) => f.debug_tuple("Explicit").field(addrs).finish(),
            Destinations::Select(_) => f.write_str("Select(<predicate>)"),
        }
    }
}

/// A message stamped and ready to hand to the transport.
#[derive(Debug, Clone)]
pub struct PreparedSend {
    pub message: Message,
    pub payload: Arc<[u8]>,
    pub targets: Vec<SocketAddr>,
}

/// Accepted send as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Send number of this message at the local process.
    pub sequence: u64,
    pub vector: Vec<u64>,
    pub destinations: Vec<SocketAddr>,
}

impl From<&PreparedSend> for SendReceipt {
    fn from(prepared: &PreparedSend) -> Self {
        Self {
            sequence: prepared.message.sequence(),
            vector: prepared.message.sender_vc().to_vec(),
            destinations: prepared.targets.clone(),
        }
    }
}

/// Check readiness, pick destinations and stamp the clock.
///
/// Nothing is mutated when the send is rejected.
pub fn prepare_send(
    state: &GroupState,
    content: String,
    destinations: &Destinations,
    max_datagram_size: usize,
) -> MulticastResult<PreparedSend> {
    let (local_id, targets) = {
        let membership = state.membership.read();
        let local_id = membership.local_id().ok_or(MulticastError::NotReady)?;
        let targets: Vec<SocketAddr> = match destinations {
            Destinations::Explicit(addrs) => addrs.clone(),
            Destinations::AllPeers | Destinations::Select(_) => {
                let peers = membership.peers();
                if peers.is_empty() {
                    return Err(MulticastError::NoPeers);
                }
                peers
                    .into_iter()
                    .filter(|peer| match destinations {
                        Destinations::Select(predicate) => predicate(peer),
                        _ => true,
                    })
                    .map(|peer| peer.socket_addr())
                    .collect()
            }
        };
        (local_id, targets)
    };

    let size = Message::encoded_len(content.len(), state.clock.dimension());
    if size > max_datagram_size {
        return Err(MulticastError::Oversize {
            size,
            limit: max_datagram_size,
        });
    }

    let vector = state
        .clock
        .stamp_send(local_id)
        .ok_or(MulticastError::NotReady)?;
    let message = Message::new(content, local_id, vector);
    let payload: Arc<[u8]> = message.encode()?.into();

    Ok(PreparedSend {
        message,
        payload,
        targets,
    })
}

/// Spawns one transmit task per destination. Transmit tasks only hold the
/// socket while a send is in flight.
#[derive(Debug, Clone)]
pub struct Messenger {
    socket: Arc<UdpSocket>,
    runtime: Handle,
    shutdown_rx: watch::Receiver<bool>,
}

impl Messenger {
    pub fn new(socket: Arc<UdpSocket>, runtime: Handle, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            socket,
            runtime,
            shutdown_rx,
        }
    }

    pub fn dispatch(&self, prepared: &PreparedSend) {
        metrics::record_sent(prepared.targets.len());

        for destination in prepared.targets.iter().copied() {
            let socket = Arc::downgrade(&self.socket);
            let payload = prepared.payload.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            let content_len = prepared.message.content().len();

            self.runtime.spawn(async move {
                if *shutdown_rx.borrow() {
                    return;
                }
                // The endpoint owns the socket; a released socket means shutdown.
                let Some(socket) = socket.upgrade() else {
                    return;
                };
                let result = tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    sent = socket.send_to(&payload, destination) => sent,
                };
                match result {
                    Ok(_) => debug!(
                        "Sent unicast message to {} ({} content bytes)",
                        destination, content_len
                    ),
                    Err(source) => {
                        metrics::record_transmit_failure();
                        let err = MulticastError::Transmit {
                            destination,
                            source,
                        };
                        warn!("{}", err);
                    }
                }
            });
        }
    }
}
