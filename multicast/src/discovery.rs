//! Presence-based discovery
//!
//! Each tick announces the local data endpoint as plain `"address:port"`
//! text, waits a bounded listen window while the presence listener collects
//! announcements from others, then folds everything heard into the group.
//! Lost announcements only delay convergence.

use std::{
    collections::BTreeSet,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::watch, time::interval};
use tracing::{debug, info, trace, warn};

use crate::{
    config::DiscoveryConfig,
    error::{MulticastError, MulticastResult},
    membership::{GroupMember, MembershipChange},
    metrics,
    state::GroupState,
};

const MAX_PRESENCE_SIZE: usize = 256;

// ============================================================================
// Presence Codec
// ============================================================================

pub fn encode_presence(member: &GroupMember) -> Vec<u8> {
    member.to_string().into_bytes()
}

pub fn decode_presence(bytes: &[u8]) -> MulticastResult<GroupMember> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| MulticastError::Decode(format!("presence is not UTF-8: {}", e)))?;
    let addr: SocketAddr = text
        .trim()
        .parse()
        .map_err(|e| MulticastError::Decode(format!("invalid presence '{}': {}", text, e)))?;
    Ok(GroupMember::from(addr))
}

// ============================================================================
// Presence Channel
// ============================================================================

/// The presence socket plus the destinations announcements go to.
#[derive(Debug)]
pub struct PresenceChannel {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    joined: Option<(std::net::Ipv4Addr, std::net::Ipv4Addr)>,
}

impl PresenceChannel {
    /// Bind the presence socket with address reuse and join the multicast
    /// group if one is configured. Must run inside a tokio runtime.
    pub fn open(config: &DiscoveryConfig) -> MulticastResult<Self> {
        let bind_addr = config.bind_addr();
        let socket = Self::bind_reuse(bind_addr)
            .map_err(|e| MulticastError::Discovery(format!("bind {}: {}", bind_addr, e)))?;

        let mut joined = None;
        if let Some(group) = config.group {
            socket
                .join_multicast_v4(&group, &config.interface)
                .map_err(|e| MulticastError::Discovery(format!("join group {}: {}", group, e)))?;
            socket
                .set_multicast_loop_v4(config.multicast_loop)
                .map_err(|e| MulticastError::Discovery(format!("multicast loop: {}", e)))?;
            socket
                .set_multicast_ttl_v4(config.multicast_ttl)
                .map_err(|e| MulticastError::Discovery(format!("multicast ttl: {}", e)))?;
            joined = Some((group, config.interface));
        }

        let targets = config.targets();
        if targets.iter().any(is_broadcast) {
            socket
                .set_broadcast(true)
                .map_err(|e| MulticastError::Discovery(format!("broadcast: {}", e)))?;
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| MulticastError::Discovery(format!("tokio wrap: {}", e)))?;

        Ok(Self {
            socket,
            targets,
            joined,
        })
    }

    fn bind_reuse(addr: SocketAddr) -> io::Result<Socket> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(socket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send `payload` to every target. Succeeds if at least one send did.
    pub async fn announce(&self, payload: &[u8]) -> io::Result<usize> {
        let mut delivered = 0;
        let mut last_err = None;
        for target in &self.targets {
            match self.socket.send_to(payload, target).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    debug!("Presence announce to {} failed: {}", target, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Leave the multicast group, if joined.
    pub fn leave(&self) {
        if let Some((group, interface)) = self.joined {
            if let Err(e) = self.socket.leave_multicast_v4(group, interface) {
                warn!("Error leaving multicast group {}: {}", group, e);
            }
        }
    }
}

fn is_broadcast(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_broadcast() || ip.octets()[3] == 255,
        IpAddr::V6(_) => false,
    }
}

// ============================================================================
// Presence Listener
// ============================================================================

/// Presence heard since the last discovery tick.
pub type PresenceInbox = Arc<Mutex<BTreeSet<GroupMember>>>;

/// Long-lived loop that collects presence announcements into `inbox`.
pub async fn run_presence_listener(
    channel: Arc<PresenceChannel>,
    inbox: PresenceInbox,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAX_PRESENCE_SIZE];
    info!("Presence listener started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = channel.recv(&mut buf) => match received {
                Ok((len, from)) => match decode_presence(&buf[..len]) {
                    Ok(member) => {
                        trace!("Presence {} from {}", member, from);
                        inbox.lock().insert(member);
                    }
                    Err(e) => {
                        metrics::record_decode_failure("presence");
                        debug!("Dropping presence datagram from {}: {}", from, e);
                    }
                },
                Err(e) => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    warn!("Presence receive error: {}", e);
                }
            },
        }
    }

    info!("Presence listener stopped");
}

// ============================================================================
// Discovery Service
// ============================================================================

pub struct DiscoveryService {
    channel: Arc<PresenceChannel>,
    state: Arc<GroupState>,
    inbox: PresenceInbox,
    period: Duration,
    listen_window: Duration,
}

impl DiscoveryService {
    pub fn new(
        channel: Arc<PresenceChannel>,
        state: Arc<GroupState>,
        inbox: PresenceInbox,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            channel,
            state,
            inbox,
            period: config.interval(),
            listen_window: config.listen_window(),
        }
    }

    /// Run discovery ticks until shutdown. The first tick fires immediately.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_timer = interval(self.period);
        info!(
            "Starting discovery with {:?} interval and {:?} listen window",
            self.period, self.listen_window
        );

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {}
                _ = shutdown_rx.changed() => break,
            }

            if let Err(e) = self.announce().await {
                warn!("Discovery service error: {}", e);
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.listen_window) => {}
                _ = shutdown_rx.changed() => break,
            }

            if let Err(e) = self.collect() {
                warn!("Discovery service error: {}", e);
            }
        }

        info!("Discovery service stopped");
    }

    async fn announce(&self) -> MulticastResult<()> {
        let payload = encode_presence(&self.state.local());
        self.channel.announce(&payload).await?;
        Ok(())
    }

    /// Drain the inbox and fold it into the group.
    pub fn collect(&self) -> MulticastResult<Option<MembershipChange>> {
        let observed = std::mem::take(&mut *self.inbox.lock());
        self.state.apply_presence(observed)
    }
}
