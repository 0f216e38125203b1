use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use hickory_proto::op::Message;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use shared::protocol::{service_address, DEFAULT_DOMAIN, MDNS_IPV4_GROUP, MDNS_PORT};
use crate::error::{ClientError, Result};
use super::aggregator::{Aggregator, ServiceRecord};
use super::wire;

const RECV_BUFFER_SIZE: usize = 65536;

/// Decoded messages waiting for the consuming task
const MESSAGE_QUEUE_CAPACITY: usize = 32;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// How a lookup is performed
#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Service to look up, e.g. "_http._tcp"
    pub service: String,
    /// Lookup domain, "local" when empty
    pub domain: String,
    /// Listening window, 1 second when zero
    pub timeout: Duration,
    /// Multicast interface address, system default when unset
    pub interface: Option<Ipv4Addr>,
    /// Set the unicast-response bit on the question (RFC 6762, section 5.4)
    pub want_unicast_response: bool,
}

impl QueryParams {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            domain: DEFAULT_DOMAIN.to_string(),
            timeout: DEFAULT_TIMEOUT,
            interface: None,
            want_unicast_response: false,
        }
    }

    fn domain(&self) -> &str {
        if self.domain.is_empty() {
            DEFAULT_DOMAIN
        } else {
            &self.domain
        }
    }

    fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Address families the client can query over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub ipv4: bool,
    /// AAAA answers are still aggregated, but no IPv6 socket is opened
    pub ipv6: bool,
}

/// What happened to the completed records of one round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub delivered: usize,
    /// Completed records dropped because the result channel was full or gone
    pub dropped: usize,
}

#[derive(Clone)]
struct Sockets {
    unicast: Arc<UdpSocket>,
    multicast: Arc<UdpSocket>,
}

enum Lifecycle {
    Open(Sockets),
    Closing,
    Closed,
}

pub struct MdnsClient {
    lifecycle: Mutex<Lifecycle>,
    destination: SocketAddr,
    /// Parent of every round token
    shutdown: CancellationToken,
    workers: TaskTracker,
}

impl MdnsClient {
    /// Bind an ephemeral unicast socket and a socket joined to the mDNS
    /// multicast group. Both are required. Must be called within a tokio
    /// runtime.
    pub fn open() -> Result<Self> {
        let unicast = bind_unicast().map_err(|source| {
            tracing::error!("mdns: failed to bind to udp4 port: {}", source);
            ClientError::Bind {
                socket: "unicast",
                source,
            }
        })?;

        let multicast = bind_multicast().map_err(|source| {
            tracing::error!("mdns: failed to bind to udp4 multicast port: {}", source);
            ClientError::Bind {
                socket: "multicast",
                source,
            }
        })?;

        let destination = SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4_GROUP, MDNS_PORT));
        tracing::info!("mdns client bound, querying {}", destination);
        Ok(Self::from_sockets(unicast, multicast, destination))
    }

    /// Build a client on already bound sockets. Queries go to `destination`.
    pub fn from_sockets(unicast: UdpSocket, multicast: UdpSocket, destination: SocketAddr) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Open(Sockets {
                unicast: Arc::new(unicast),
                multicast: Arc::new(multicast),
            })),
            destination,
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            ipv4: true,
            ipv6: false,
        }
    }

    /// Send and receive multicast traffic through the interface owning `addr`
    pub fn set_interface(&self, addr: Ipv4Addr) -> Result<()> {
        let sockets = self.sockets()?;

        SockRef::from(sockets.unicast.as_ref())
            .set_multicast_if_v4(&addr)
            .map_err(ClientError::Interface)?;

        let multicast = SockRef::from(sockets.multicast.as_ref());
        multicast
            .set_multicast_if_v4(&addr)
            .map_err(ClientError::Interface)?;
        // the group may already be joined on this interface through the default route
        if let Err(e) = multicast.join_multicast_v4(&MDNS_IPV4_GROUP, &addr) {
            tracing::debug!("mdns: join {} on {}: {}", MDNS_IPV4_GROUP, addr, e);
        }

        tracing::info!("mdns: using multicast interface {}", addr);
        Ok(())
    }

    /// Run one query round. Completed records go to `entries` without
    /// blocking; a full channel drops the record. Returns once the round
    /// timer fires or the client is closed, with every reader stopped.
    pub async fn query(
        &self,
        params: &QueryParams,
        entries: &mpsc::Sender<ServiceRecord>,
    ) -> Result<RoundReport> {
        let sockets = self.sockets()?;
        let service_addr = service_address(&params.service, params.domain());

        let round = self.shutdown.child_token();
        let _cancel_on_exit = round.clone().drop_guard();

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let readers = [
            self.spawn_reader("unicast", sockets.unicast.clone(), message_tx.clone(), round.clone()),
            self.spawn_reader("multicast", sockets.multicast.clone(), message_tx, round.clone()),
        ];

        tracing::debug!("mdns: querying {}", service_addr);
        let outcome = match self
            .send_query(&sockets.unicast, &service_addr, params.want_unicast_response)
            .await
        {
            Ok(()) => Ok(self
                .collect(&sockets.unicast, message_rx, params.timeout(), entries, &round)
                .await),
            Err(e) => Err(e),
        };

        round.cancel();
        for reader in readers {
            if let Err(e) = reader.await {
                tracing::warn!("mdns: reader task failed: {}", e);
            }
        }

        if let Ok(report) = &outcome {
            tracing::debug!(
                delivered = report.delivered,
                dropped = report.dropped,
                "mdns: query round for {} finished",
                service_addr
            );
        }
        outcome
    }

    /// Stop every reader and release both sockets. Only the first call does
    /// any work.
    pub async fn close(&self) {
        let sockets = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Closing) {
                Lifecycle::Open(sockets) => sockets,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        tracing::debug!("mdns: closing client");
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;
        drop(sockets);

        *self.lifecycle() = Lifecycle::Closed;
    }

    pub fn is_closed(&self) -> bool {
        !matches!(*self.lifecycle(), Lifecycle::Open(_))
    }

    /// Reader tasks currently alive
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sockets(&self) -> Result<Sockets> {
        match &*self.lifecycle() {
            Lifecycle::Open(sockets) => Ok(sockets.clone()),
            Lifecycle::Closing | Lifecycle::Closed => Err(ClientError::Closed),
        }
    }

    fn spawn_reader(
        &self,
        label: &'static str,
        socket: Arc<UdpSocket>,
        messages: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.workers.spawn(read_packets(label, socket, messages, cancel))
    }

    async fn send_query(&self, socket: &UdpSocket, name: &str, unicast_response: bool) -> Result<()> {
        let packet = wire::build_query(name, unicast_response)?;
        socket
            .send_to(&packet, self.destination)
            .await
            .map_err(ClientError::Send)?;
        Ok(())
    }

    async fn collect(
        &self,
        socket: &UdpSocket,
        mut messages: mpsc::Receiver<Message>,
        timeout: Duration,
        entries: &mpsc::Sender<ServiceRecord>,
        round: &CancellationToken,
    ) -> RoundReport {
        let mut aggregator = Aggregator::new();
        let mut queried = HashSet::new();
        let mut report = RoundReport::default();

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::debug!("mdns: query round timed out");
                    break;
                }
                _ = round.cancelled() => {
                    tracing::debug!("mdns: query round cancelled");
                    break;
                }
                Some(message) = messages.recv() => {
                    let mut touched = Vec::new();
                    for record in wire::records(&message) {
                        let Some((owner, payload)) = wire::payload(record) else {
                            continue;
                        };
                        let Some(merge) = aggregator.merge(&owner, &payload, record.ttl()) else {
                            continue;
                        };
                        if merge.newly_complete {
                            deliver(aggregator.record(merge.key), entries, &mut report);
                        }
                        if !touched.contains(&merge.key) {
                            touched.push(merge.key);
                        }
                    }

                    // one targeted follow-up per incomplete name and round
                    for key in touched {
                        let record = aggregator.record(key);
                        if record.is_complete() || !queried.insert(record.name.clone()) {
                            continue;
                        }
                        tracing::debug!("mdns: {} incomplete, querying instance", record.name);
                        if let Err(e) = self.send_query(socket, &record.name, false).await {
                            tracing::error!("mdns: failed to query instance {}: {}", record.name, e);
                        }
                    }
                }
            }
        }

        report
    }
}

impl Drop for MdnsClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Open a client, run one round and close it again
pub async fn lookup(
    params: &QueryParams,
    entries: &mpsc::Sender<ServiceRecord>,
) -> Result<RoundReport> {
    let client = MdnsClient::open()?;

    if let Some(interface) = params.interface {
        if let Err(e) = client.set_interface(interface) {
            client.close().await;
            return Err(e);
        }
    }

    let outcome = client.query(params, entries).await;
    client.close().await;
    outcome
}

fn deliver(record: &ServiceRecord, entries: &mpsc::Sender<ServiceRecord>, report: &mut RoundReport) {
    match entries.try_send(record.clone()) {
        Ok(()) => {
            report.delivered += 1;
            tracing::debug!("mdns: completed {}", record.name);
        }
        Err(TrySendError::Full(record)) => {
            report.dropped += 1;
            tracing::warn!("mdns: result channel full, dropping {}", record.name);
        }
        Err(TrySendError::Closed(record)) => {
            report.dropped += 1;
            tracing::debug!("mdns: result channel closed, dropping {}", record.name);
        }
    }
}

/// Reader loop for one socket. Ends on cancellation or on the first read
/// error; undecodable packets are skipped.
async fn read_packets(
    label: &'static str,
    socket: Arc<UdpSocket>,
    messages: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::error!("mdns: failed to read packet on {} socket: {}", label, e);
                return;
            }
        };

        let message = match wire::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("mdns: failed to unpack packet from {}: {}", from, e);
                tracing::debug!(packet = %String::from_utf8_lossy(&buf[..len]), "mdns: undecodable packet");
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = messages.send(message) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

fn bind_unicast() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    UdpSocket::from_std(socket.into())
}

fn bind_multicast() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v4(&MDNS_IPV4_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket.into())
}
