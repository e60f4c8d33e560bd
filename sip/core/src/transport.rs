//! Transport abstraction.
//!
//! The wire transports themselves are mostly provided by the embedding
//! platform; the core only needs their identity, reliability and a way to
//! send. A plain UDP transport is included since every deployment has one.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::TransportProtocol;
use crate::serializer::ShutdownGroup;
use crate::{Error, Result};

/// Abstraction over a signaling transport.
#[async_trait]
pub trait Transport: fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Configuration name of the transport.
    fn name(&self) -> &str;

    fn protocol(&self) -> TransportProtocol;

    /// Reliable transports get a shutdown monitor; datagram transports do
    /// not break.
    fn reliable(&self) -> bool {
        self.protocol().reliable()
    }

    /// Local bound address.
    fn bound(&self) -> SocketAddr;

    /// The address peers can reach this endpoint on, used when building
    /// Via and Contact headers.
    fn sent_by(&self) -> SocketAddr;

    async fn send(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()>;
}

/// Identity of a transport inside the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TpKey {
    pub name: String,
    pub protocol: TransportProtocol,
    pub bound: SocketAddr,
}

/// Cheaply clonable handle over a [`Transport`].
#[derive(Clone)]
pub struct TpHandle(Arc<dyn Transport>);

impl TpHandle {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self(Arc::new(transport))
    }

    pub fn key(&self) -> TpKey {
        TpKey {
            name: self.0.name().to_string(),
            protocol: self.0.protocol(),
            bound: self.0.bound(),
        }
    }
}

impl Deref for TpHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for TpHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Debug for TpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for TpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport related info of a received message.
#[derive(Debug, Clone)]
pub struct MessageTpInfo {
    pub timestamp: SystemTime,
    pub source: SocketAddr,
    pub transport: TpHandle,
}

/// A message delivered by the parsing layer.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub tp_info: MessageTpInfo,
    pub message: rsip::SipMessage,
}

/// Registry of the currently active transports.
///
/// Lookups take the lock per call; no lock is held across awaits.
#[derive(Default)]
pub struct TransportRegistry {
    map: Mutex<HashMap<String, TpHandle>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `transport`, replacing any previous registration of the same
    /// name.
    pub fn register(&self, transport: TpHandle) -> Option<TpHandle> {
        self.map
            .lock()
            .insert(transport.name().to_string(), transport)
    }

    pub fn unregister(&self, name: &str) -> Option<TpHandle> {
        self.map.lock().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<TpHandle> {
        self.map.lock().get(name).cloned()
    }

    /// Resolve `name` or fall back to any UDP transport.
    pub fn select(&self, name: Option<&str>) -> Result<TpHandle> {
        let map = self.map.lock();

        match name {
            Some(name) => map
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NoTransport(name.to_string())),
            None => map
                .values()
                .find(|t| t.protocol() == TransportProtocol::Udp)
                .or_else(|| map.values().next())
                .cloned()
                .ok_or_else(|| Error::NoTransport("<any>".to_string())),
        }
    }

    pub fn all(&self) -> Vec<TpHandle> {
        self.map.lock().values().cloned().collect()
    }
}

/// Datagram transport over a UDP socket.
pub struct Udp {
    name: String,
    socket: Arc<UdpSocket>,
    bound: SocketAddr,
    sent_by: SocketAddr,
}

impl Udp {
    /// Bind `addr` and spawn the receive loop. Parsed messages are pushed
    /// into `sink`; unparsable datagrams are logged and dropped.
    pub async fn spawn(
        name: impl Into<String>,
        addr: impl tokio::net::ToSocketAddrs,
        sink: mpsc::Sender<ReceivedMessage>,
        group: &ShutdownGroup,
    ) -> io::Result<TpHandle> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let bound = socket.local_addr()?;

        let transport = TpHandle::new(Udp {
            name: name.into(),
            socket: socket.clone(),
            bound,
            sent_by: bound,
        });

        group.spawn(receive_loop(socket, transport.clone(), sink, group.token().clone()));

        Ok(transport)
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    transport: TpHandle,
    sink: mpsc::Sender<ReceivedMessage>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut buffer = vec![0u8; 65535];

    loop {
        let (len, source) = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(ok) => ok,
                Err(e) => {
                    log::warn!("udp {} receive error: {e}", transport.name());
                    continue;
                }
            },
        };

        // Keep-alive padding
        if buffer[..len].iter().all(|&b| b == b'\r' || b == b'\n') {
            continue;
        }

        let message = match rsip::SipMessage::try_from(&buffer[..len]) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("dropping unparsable datagram from {source}: {e}");
                continue;
            }
        };

        let received = ReceivedMessage {
            tp_info: MessageTpInfo {
                timestamp: SystemTime::now(),
                source,
                transport: transport.clone(),
            },
            message,
        };

        if sink.send(received).await.is_err() {
            // Distributor is gone, stop reading
            return;
        }
    }
}

#[async_trait]
impl Transport for Udp {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn bound(&self) -> SocketAddr {
        self.bound
    }

    fn sent_by(&self) -> SocketAddr {
        self.sent_by
    }

    async fn send(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, target).await.map(|_| ())
    }
}

impl fmt::Debug for Udp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Udp")
            .field("name", &self.name)
            .field("bound", &self.bound)
            .finish()
    }
}

impl fmt::Display for Udp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UDP:{}", self.bound)
    }
}
