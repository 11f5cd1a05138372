use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod interface;

const READ_BUFFER_LEN: usize = 64 * 1024;
const INBOUND_QUEUE: usize = 16;

/// Which local address a session may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bind {
    /// First up, non-cellular wireless interface
    Wireless,
    /// A named interface
    Interface(String),
    /// An explicit local address
    Address(IpAddr),
}

/// Invoked once the OS has accepted a queued buffer, or with the error that
/// prevented it. Dropped without being called if the connection goes away
/// first.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Outbound half of a connection as seen by the engines
pub trait Outbound: Send + Sync {
    /// Queue `data` for transmission; never waits for the write itself
    fn send(&self, data: Bytes, on_complete: Completion) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Inbound transport events
#[derive(Debug)]
pub enum Inbound {
    /// Next chunk of bytes, not aligned to frames
    Data(Bytes),
    /// Peer closed its side
    Closed,
    Failed(TransportError),
}

enum Outgoing {
    Data(Bytes, Completion),
    Shutdown,
}

/// Cloneable handle that queues writes onto a connection's writer task
#[derive(Clone)]
pub struct Writer {
    queue: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl Outbound for Writer {
    fn send(&self, data: Bytes, on_complete: Completion) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.queue
            .send(Outgoing::Data(data, on_complete))
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// One established TCP connection
pub struct Connection {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Writer,
    inbound: mpsc::Receiver<Inbound>,
    reader_task: JoinHandle<()>,
    rejector: Option<JoinHandle<()>>,
}

impl Connection {
    fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (events, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (queue, outgoing) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(read_half, events.clone()));
        tokio::spawn(write_loop(write_half, outgoing, events, open.clone()));

        Ok(Self {
            peer_addr,
            local_addr,
            writer: Writer { queue, open },
            inbound,
            reader_task,
            rejector: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for queueing outbound data
    pub fn writer(&self) -> Writer {
        self.writer.clone()
    }

    /// Next inbound event. Returns `Closed` forever once the reader is done.
    pub async fn receive(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Closed)
    }

    /// Stop accepting writes and shut the stream down after queued data
    pub fn close(&self, reason: &str) {
        tracing::debug!(peer = %self.peer_addr, reason, "closing connection");
        self.writer.open.store(false, Ordering::Release);
        let _ = self.writer.queue.send(Outgoing::Shutdown);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(rejector) = self.rejector.take() {
            rejector.abort();
        }
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, events: mpsc::Sender<Inbound>) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_LEN);
    loop {
        buffer.reserve(READ_BUFFER_LEN);
        let event = match read_half.read_buf(&mut buffer).await {
            Ok(0) => Inbound::Closed,
            Ok(_) => Inbound::Data(buffer.split().freeze()),
            Err(e) => Inbound::Failed(e.into()),
        };
        let done = !matches!(event, Inbound::Data(_));
        if events.send(event).await.is_err() || done {
            return;
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::Sender<Inbound>,
    open: Arc<AtomicBool>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Data(data, on_complete) => {
                let result = write_half.write_all(&data).await.map_err(TransportError::from);
                let failure = result.as_ref().err().cloned();
                on_complete(result);
                if let Some(e) = failure {
                    tracing::warn!(error = %e, "write failed");
                    open.store(false, Ordering::Release);
                    let _ = events.send(Inbound::Failed(e)).await;
                    break;
                }
            }
            Outgoing::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
    open.store(false, Ordering::Release);
}

/// Listening socket on an ephemeral port
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind port 0 on the address chosen by `bind`
    pub async fn bind(bind: &Bind) -> Result<Self, TransportError> {
        let ip = interface::resolve(bind)?;
        let inner = TcpListener::bind(SocketAddr::new(ip, 0))
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        tracing::info!(%local_addr, "listening");
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the session's peer.
    ///
    /// The listener stays open for the life of the connection, turning away
    /// any later connection attempt.
    pub async fn accept(self) -> Result<Connection, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::info!(%peer, "peer connected");
        let mut connection = Connection::new(stream)?;

        let listener = self.inner;
        connection.rejector = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::warn!(%peer, "rejected additional inbound connection");
                        drop(stream);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "listener stopped");
                        return;
                    }
                }
            }
        }));
        Ok(connection)
    }
}

/// Client socket bound to a local address, not yet connected
pub struct Dialer {
    socket: TcpSocket,
    remote: SocketAddr,
}

impl Dialer {
    pub fn prepare(bind: &Bind, remote: SocketAddr) -> Result<Self, TransportError> {
        let ip = interface::resolve(bind)?;
        let socket = match ip {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| TransportError::Bind(e.to_string()))?;
        socket
            .bind(SocketAddr::new(ip, 0))
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        Ok(Self { socket, remote })
    }

    pub async fn connect(self) -> Result<Connection, TransportError> {
        let remote = self.remote;
        let stream = self
            .socket
            .connect(remote)
            .await
            .map_err(|e| TransportError::Connect {
                addr: remote,
                message: e.to_string(),
            })?;
        tracing::info!(peer = %remote, "connected");
        Connection::new(stream)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no usable wireless interface")]
    NoWirelessInterface,

    #[error("interface {0} has no usable IPv4 address")]
    InterfaceUnavailable(String),

    #[error("failed to bind: {0}")]
    Bind(String),

    #[error("failed to connect to {addr}: {message}")]
    Connect { addr: SocketAddr, message: String },

    #[error("connection reset by peer")]
    Reset,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("connection closed")]
    Closed,
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::Reset,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn loopback() -> Bind {
        Bind::Address("127.0.0.1".parse().unwrap())
    }

    async fn pair() -> (Connection, Connection) {
        let listener = Listener::bind(&loopback()).await.unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(listener.accept());
        let client = Dialer::prepare(&loopback(), addr)
            .unwrap()
            .connect()
            .await
            .unwrap();
        (server.await.unwrap().unwrap(), client)
    }

    async fn read_exactly(conn: &mut Connection, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < len {
            match conn.receive().await {
                Inbound::Data(bytes) => received.extend_from_slice(&bytes),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        received
    }

    #[tokio::test]
    async fn test_send_with_completion() {
        let (mut server, client) = pair().await;
        assert_ne!(server.local_addr().port(), 0);

        let (done_tx, done_rx) = oneshot::channel();
        client
            .writer()
            .send(
                Bytes::from_static(b"test"),
                Box::new(move |result| {
                    let _ = done_tx.send(result);
                }),
            )
            .unwrap();

        assert_eq!(done_rx.await.unwrap(), Ok(()));
        assert_eq!(read_exactly(&mut server, 4).await, b"test");
    }

    #[tokio::test]
    async fn test_close_delivers_queued_data_then_eof() {
        let (mut server, client) = pair().await;
        let writer = client.writer();
        writer
            .send(Bytes::from_static(b"last words"), Box::new(|_| {}))
            .unwrap();
        client.close("done");

        assert!(!writer.is_open());
        assert!(matches!(
            writer.send(Bytes::from_static(b"late"), Box::new(|_| {})),
            Err(TransportError::Closed)
        ));
        assert_eq!(read_exactly(&mut server, 10).await, b"last words");
        assert!(matches!(server.receive().await, Inbound::Closed));
    }

    #[tokio::test]
    async fn test_second_inbound_connection_rejected() {
        let listener = Listener::bind(&loopback()).await.unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(listener.accept());
        let _first = TcpStream::connect(addr).await.unwrap();
        let _server = server.await.unwrap().unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        // Either an orderly EOF or a reset, never data
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = Listener::bind(&loopback()).await.unwrap();
        let addr = listener.local_addr();
        drop(listener);

        let result = Dialer::prepare(&loopback(), addr).unwrap().connect().await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
