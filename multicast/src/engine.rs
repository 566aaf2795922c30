//! Stable multicast endpoint
//!
//! One `StableMulticast` owns a data socket, a presence channel and the four
//! background tasks working on its group state: unicast receiver, presence
//! listener, discovery and stability sweep. Instances are fully independent,
//! so several of them can share one process. Both sockets are released by
//! `shutdown`, after the tasks holding them have been joined.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{net::UdpSocket, runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, info, instrument, warn, Instrument};

use crate::{
    clock::{MatrixClock, ProcessId},
    config::MulticastConfig,
    discovery::{run_presence_listener, DiscoveryService, PresenceChannel, PresenceInbox},
    error::{MulticastError, MulticastResult},
    membership::GroupMember,
    message::Message,
    messenger::{prepare_send, Destinations, Messenger, SendReceipt},
    receiver::{run_receive_loop, DeliveryHandler},
    stability::run_stability_task,
    state::GroupState,
};

pub struct StableMulticast {
    state: Arc<GroupState>,
    local_addr: SocketAddr,
    max_datagram_size: usize,
    shutdown_timeout: Duration,
    presence_addr: SocketAddr,
    messenger: Mutex<Option<Messenger>>,
    presence: Mutex<Option<Arc<PresenceChannel>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StableMulticast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StableMulticast")
            .field("local_addr", &self.local_addr)
            .field("local_id", &self.current_id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl StableMulticast {
    /// Open the data endpoint and presence channel and start the background
    /// tasks. Must be called from within a tokio runtime.
    #[instrument(skip(config, handler), fields(bind = %config.bind))]
    pub async fn open<H>(config: MulticastConfig, handler: H) -> MulticastResult<Self>
    where
        H: DeliveryHandler,
    {
        config.validate()?;

        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|source| MulticastError::Bind {
                addr: config.bind,
                source,
            })?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let presence = Arc::new(PresenceChannel::open(&config.discovery)?);
        let presence_addr = presence.local_addr()?;
        let local = GroupMember::from(local_addr);
        let state = Arc::new(GroupState::new(local, config.max_members));
        let inbox = PresenceInbox::default();
        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runtime = Handle::current();
        let mut tasks = Vec::with_capacity(4);

        let span = tracing::info_span!("unicast_receiver", endpoint = %local_addr);
        tasks.push((
            "unicast receiver",
            runtime.spawn(
                run_receive_loop(
                    socket.clone(),
                    state.clone(),
                    handler,
                    config.max_datagram_size,
                    shutdown_rx.clone(),
                )
                .instrument(span),
            ),
        ));

        let span = tracing::info_span!("presence_listener", endpoint = %local_addr);
        tasks.push((
            "presence listener",
            runtime.spawn(
                run_presence_listener(presence.clone(), inbox.clone(), shutdown_rx.clone())
                    .instrument(span),
            ),
        ));

        let span = tracing::info_span!("discovery", endpoint = %local_addr);
        let discovery =
            DiscoveryService::new(presence.clone(), state.clone(), inbox, &config.discovery);
        tasks.push((
            "discovery",
            runtime.spawn(discovery.run(shutdown_rx.clone()).instrument(span)),
        ));

        let span = tracing::info_span!("stability", endpoint = %local_addr);
        tasks.push((
            "stability sweep",
            runtime.spawn(
                run_stability_task(
                    state.clone(),
                    config.stability_interval(),
                    shutdown_rx.clone(),
                )
                .instrument(span),
            ),
        ));

        info!(
            "Stable multicast endpoint {} started, presence on {}",
            local_addr, presence_addr
        );

        Ok(Self {
            state,
            local_addr,
            max_datagram_size: config.max_datagram_size,
            shutdown_timeout: config.shutdown_timeout(),
            presence_addr,
            messenger: Mutex::new(Some(Messenger::new(socket, runtime, shutdown_rx))),
            presence: Mutex::new(Some(presence)),
            shutdown_tx,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    /// `open` with default settings on `bind`.
    pub async fn bind<H>(bind: SocketAddr, handler: H) -> MulticastResult<Self>
    where
        H: DeliveryHandler,
    {
        Self::open(MulticastConfig::new(bind), handler).await
    }

    /// Stamp `content` and hand it to the transport.
    ///
    /// Returns once the message is stamped; transmission to each destination
    /// completes in the background.
    pub fn send(
        &self,
        content: impl Into<String>,
        destinations: Destinations,
    ) -> MulticastResult<SendReceipt> {
        let messenger = self.messenger.lock();
        let messenger = match messenger.as_ref() {
            Some(messenger) if !self.closed.load(Ordering::Acquire) => messenger,
            _ => return Err(MulticastError::Closed),
        };

        let prepared = prepare_send(
            &self.state,
            content.into(),
            &destinations,
            self.max_datagram_size,
        )?;
        debug!(
            "Sending message #{} to {} destination(s)",
            prepared.message.sequence(),
            prepared.targets.len()
        );
        messenger.dispatch(&prepared);

        Ok(SendReceipt::from(&prepared))
    }

    /// Send to every known peer.
    pub fn multicast(&self, content: impl Into<String>) -> MulticastResult<SendReceipt> {
        self.send(content, Destinations::AllPeers)
    }

    pub fn current_id(&self) -> Option<ProcessId> {
        self.state.local_id()
    }

    pub fn members(&self) -> Vec<GroupMember> {
        self.state.members()
    }

    pub fn matrix_snapshot(&self) -> MatrixClock {
        self.state.matrix()
    }

    pub fn buffered(&self) -> Vec<Message> {
        self.state.buffered()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Address of the presence socket.
    pub fn presence_addr(&self) -> SocketAddr {
        self.presence_addr
    }

    pub(crate) fn running_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Stop all tasks and release both sockets. Calling it again is a no-op.
    pub async fn shutdown(&self) -> MulticastResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Shutting down stable multicast endpoint {}", self.local_addr);
        let _ = self.shutdown_tx.send(true);

        // Taken under the lock so no send can reach the data socket from here on.
        let messenger = self.messenger.lock().take();
        let presence = self.presence.lock().take();
        if let Some(presence) = &presence {
            presence.leave();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, mut handle) in tasks {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("{} stopped", name),
                Ok(Err(e)) => warn!("{} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!(
                        "{} did not stop within {:?}, aborting",
                        name, self.shutdown_timeout
                    );
                    handle.abort();
                    // Wait for the cancelled future to drop its socket handles.
                    let _ = handle.await;
                }
            }
        }

        // Every task is gone, so these are the last owners of the sockets.
        drop(messenger);
        drop(presence);

        info!("Stable multicast endpoint {} stopped", self.local_addr);
        Ok(())
    }
}

impl Drop for StableMulticast {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(presence) = self.presence.get_mut().take() {
            presence.leave();
        }
        for (_, handle) in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
