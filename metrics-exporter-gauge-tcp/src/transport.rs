use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs as _},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, trace};

use crate::{
    ack::{AckOutcome, Acknowledgment, ExpiryTimer},
    connection::{ConnectionId, Driver},
};

const CONNECT_TIMED_OUT: &str = "timed out connecting to collector";

/// Address of the collector, resolved once at configuration time.
#[derive(Clone, Debug)]
pub(crate) struct RemoteAddr(Vec<SocketAddr>);

impl RemoteAddr {
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.0
    }
}

impl From<SocketAddr> for RemoteAddr {
    fn from(addr: SocketAddr) -> Self {
        RemoteAddr(vec![addr])
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        match addr.to_socket_addrs() {
            Ok(addrs) => {
                let addrs = addrs.collect::<Vec<_>>();
                if addrs.is_empty() {
                    Err(format!("'{}' did not resolve to any address", addr))
                } else {
                    Ok(RemoteAddr(addrs))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [addr] => write!(f, "{}", addr),
            addrs => write!(f, "{:?}", addrs),
        }
    }
}

/// Completion of asynchronous I/O, delivered back to the event loop.
#[derive(Debug)]
pub(crate) enum Event {
    /// A connection attempt succeeded.
    Connected { connection: ConnectionId, stream: TcpStream },

    /// A connection attempt failed or timed out.
    ConnectFailed { connection: ConnectionId, error: io::Error },

    /// A write completed, one way or another.
    Acknowledged(Acknowledgment),

    /// The acknowledgment timer of a write fired.
    Expired { connection: ConnectionId, sequence: u64 },

    /// The collector closed the connection, or reading from it failed.
    Disconnected { connection: ConnectionId, error: Option<io::Error> },
}

struct Session {
    connection: ConnectionId,
    lines: mpsc::UnboundedSender<(u64, Bytes)>,
    writer: AbortHandle,
    reader: AbortHandle,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// Drives a single TCP connection to the collector using Tokio.
///
/// Connecting, writing and watching the connection for closure each happen on their own task, and every outcome is
/// sent back to the event loop as an [`Event`]. Must be used from within a Tokio runtime.
pub(crate) struct TcpDriver {
    remote_addr: RemoteAddr,
    ack_timeout: Duration,
    events: mpsc::UnboundedSender<Event>,
    connecting: Option<(ConnectionId, AbortHandle)>,
    session: Option<Session>,
}

impl TcpDriver {
    /// Creates a new `TcpDriver`.
    ///
    /// The acknowledgment timeout bounds both a single write and a single connection attempt.
    pub fn new(
        remote_addr: RemoteAddr,
        ack_timeout: Duration,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self { remote_addr, ack_timeout, events, connecting: None, session: None }
    }

    /// Takes ownership of a freshly connected stream.
    ///
    /// If the connection attempt was abandoned in the meantime, the stream is closed immediately.
    pub fn attach(&mut self, connection: ConnectionId, stream: TcpStream) {
        match self.connecting.take() {
            Some((expected, _)) if expected == connection => {}
            other => {
                self.connecting = other;
                trace!(%connection, "Dropping stream for abandoned connection attempt.");
                return;
            }
        }

        let (read_half, write_half) = stream.into_split();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();

        let writer = write_lines(connection, write_half, lines_rx, self.events.clone());
        let reader = watch_for_close(connection, read_half, self.events.clone());
        let writer = tokio::spawn(writer).abort_handle();
        let reader = tokio::spawn(reader).abort_handle();

        self.session = Some(Session { connection, lines: lines_tx, writer, reader });
    }

    fn send_event(&self, event: Event) {
        // The event loop owns both ends of the channel, so this only fails once it has stopped.
        let _ = self.events.send(event);
    }
}

impl Driver for TcpDriver {
    type Timer = ExpiryTimer;

    fn connect(&mut self, connection: ConnectionId) {
        let addrs = self.remote_addr.addrs().to_vec();
        let connect_timeout = self.ack_timeout;
        let events = self.events.clone();

        debug!(%connection, remote_addr = %self.remote_addr, "Opening connection.");
        let task = tokio::spawn(async move {
            let event = match tokio::time::timeout(connect_timeout, open_stream(&addrs)).await {
                Ok(Ok(stream)) => Event::Connected { connection, stream },
                Ok(Err(error)) => Event::ConnectFailed { connection, error },
                Err(_) => {
                    let error = io::Error::new(io::ErrorKind::TimedOut, CONNECT_TIMED_OUT);
                    Event::ConnectFailed { connection, error }
                }
            };
            let _ = events.send(event);
        })
        .abort_handle();

        if let Some((_, previous)) = self.connecting.replace((connection, task)) {
            previous.abort();
        }
    }

    fn write(&mut self, connection: ConnectionId, sequence: u64, line: Bytes) -> ExpiryTimer {
        let events = self.events.clone();
        let expiry = ExpiryTimer::start(self.ack_timeout, move || {
            let _ = events.send(Event::Expired { connection, sequence });
        });

        let queued = match &self.session {
            Some(session) if session.connection == connection => {
                session.lines.send((sequence, line)).is_ok()
            }
            _ => false,
        };

        if !queued {
            let error = io::Error::new(io::ErrorKind::NotConnected, "connection is not open");
            self.send_event(Event::Acknowledged(Acknowledgment {
                connection,
                sequence,
                outcome: AckOutcome::Failed(error),
            }));
        }

        expiry
    }

    fn close(&mut self, connection: ConnectionId) {
        if let Some((expected, task)) = self.connecting.take() {
            if expected == connection {
                task.abort();
            } else {
                self.connecting = Some((expected, task));
            }
        }

        if self.session.as_ref().is_some_and(|session| session.connection == connection) {
            debug!(%connection, "Closing connection.");
            self.session = None;
        }
    }
}

async fn open_stream(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addrs).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn write_lines(
    connection: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut lines: mpsc::UnboundedReceiver<(u64, Bytes)>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some((sequence, line)) = lines.recv().await {
        let outcome = match writer.write_all(&line).await {
            Ok(()) => AckOutcome::Delivered,
            Err(e) => AckOutcome::Failed(e),
        };
        let failed = matches!(outcome, AckOutcome::Failed(_));

        let ack = Acknowledgment { connection, sequence, outcome };
        if events.send(Event::Acknowledged(ack)).is_err() || failed {
            break;
        }
    }
}

async fn watch_for_close(
    connection: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
) {
    // Nothing the collector sends is meaningful. Reading only serves to notice when the connection goes away.
    let mut buf = [0u8; 512];
    let error = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => trace!(%connection, bytes = n, "Discarding data sent by collector."),
            Err(e) => break Some(e),
        }
    };

    let _ = events.send(Event::Disconnected { connection, error });
}
