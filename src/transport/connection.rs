//! A single live duplex link to one remote node.
//!
//! A [`Connection`] owns the write half of a TCP socket, its liveness
//! heartbeat and the chat history exchanged over it. The read half is handed
//! out separately as an [`Inbound`] so the node's dispatch task can own it.
//!
//! Liveness is one-directional: each side pings on a fixed interval and never
//! expects an answer. A dead peer is noticed by the *receiving* side, when its
//! read deadline lapses because not even heartbeats arrive any more.

use crate::transport::protocol::{Envelope, MessageKind, MAX_MESSAGE_SIZE};
use crate::utils::{
    read_lock as read, signalled, write_lock as write, NetworkError, OverlayError, ProtocolError,
    Result,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead, FramedWrite, LinesCodec,
};

/// Deadlines and intervals governing a link's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Interval between heartbeats
    pub ping_interval: Duration,
    /// Write deadline for every send, heartbeats included
    pub ping_deadline: Duration,
    /// Maximum idle time on the inbound side before the link is dropped
    pub read_deadline: Duration,
    /// Fixed pause between failed dial attempts
    pub redial_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            ping_interval: crate::defaults::PING_INTERVAL,
            ping_deadline: crate::defaults::PING_DEADLINE,
            read_deadline: crate::defaults::READ_DEADLINE,
            redial_backoff: crate::defaults::REDIAL_BACKOFF,
        }
    }
}

impl Timings {
    /// Whether every duration is non-zero and the write deadline outlasts
    /// the ping interval
    pub fn is_consistent(&self) -> bool {
        !self.ping_interval.is_zero()
            && !self.read_deadline.is_zero()
            && !self.redial_backoff.is_zero()
            && self.ping_interval < self.ping_deadline
    }
}

/// Point-in-time view of a connection for connection tables
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Registry address
    pub address: String,
    /// Name announced by the remote `info` envelope
    pub display_name: String,
    /// Socket address of the remote end, if it was known at open time
    pub remote_addr: Option<SocketAddr>,
    /// Time of the last successful send
    pub last_active: DateTime<Utc>,
    /// Number of chat messages exchanged on this link
    pub messages: usize,
    /// Whether the link has been torn down
    pub closed: bool,
}

type LineSink = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// One live link to a remote node
#[derive(Debug)]
pub struct Connection {
    address: String,
    remote_addr: Option<SocketAddr>,
    local_name: String,
    display_name: RwLock<String>,
    last_active: RwLock<DateTime<Utc>>,
    history: RwLock<Vec<Envelope>>,
    save_history: bool,
    write_deadline: Duration,
    // Single write path shared by heartbeats and application sends.
    writer: Mutex<Option<LineSink>>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

/// Read half of a connection, owned by the inbound dispatch task
#[derive(Debug)]
pub struct Inbound {
    peer: String,
    // Framed on raw bytes so a non-UTF-8 line is a decode failure, not a read failure.
    frames: FramedRead<OwnedReadHalf, AnyDelimiterCodec>,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Wrap an established socket and announce ourselves with `info`.
    ///
    /// The `info` envelope is written before this returns. When that write
    /// fails the connection comes back already closed and no heartbeat task
    /// is started; callers must check [`Connection::is_closed`] before
    /// registering it.
    pub async fn open(
        address: impl Into<String>,
        stream: TcpStream,
        info: Envelope,
        timings: Timings,
    ) -> (Arc<Self>, Inbound) {
        let address = address.into();
        let remote_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("{}: could not set TCP_NODELAY: {}", address, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (close_signal, closed) = watch::channel(false);

        let connection = Arc::new(Self {
            display_name: RwLock::new(address.clone()),
            address: address.clone(),
            remote_addr,
            local_name: info.sender().to_string(),
            last_active: RwLock::new(Utc::now()),
            history: RwLock::new(Vec::new()),
            save_history: true,
            write_deadline: timings.ping_deadline,
            writer: Mutex::new(Some(FramedWrite::new(write_half, LinesCodec::new()))),
            closed: AtomicBool::new(false),
            close_signal,
        });

        let inbound = Inbound {
            peer: address,
            frames: FramedRead::new(
                read_half,
                AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_MESSAGE_SIZE),
            ),
            closed,
        };

        match connection.send(&info).await {
            Ok(()) => {
                tokio::spawn(heartbeat(Arc::clone(&connection), timings.ping_interval));
            }
            Err(e) => {
                log::warn!("{}: failed to send connection info: {}", connection.address, e);
                connection.close().await;
            }
        }

        (connection, inbound)
    }

    /// Write one envelope as a line.
    ///
    /// A failed or timed-out write closes the link; there is no retry.
    /// Successful `text` sends are appended to the history.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let line = envelope.encode()?;
        self.write_line(line).await?;

        self.touch();
        if self.save_history && envelope.kind() == MessageKind::Text {
            self.record(envelope.clone());
        }
        Ok(())
    }

    async fn write_line(&self, line: String) -> Result<()> {
        if self.is_closed() {
            return Err(self.send_failure("connection closed"));
        }

        let mut closed = self.close_signal.subscribe();
        let outcome = {
            let mut writer = self.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                return Err(self.send_failure("connection closed"));
            };

            tokio::select! {
                written = timeout(self.write_deadline, sink.send(line)) => match written {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("write deadline of {:?} elapsed", self.write_deadline)),
                },
                _ = signalled(&mut closed) => {
                    return Err(self.send_failure("connection closed"));
                }
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(reason) => {
                log::warn!("{}: send failed: {}", self.address, reason);
                self.close().await;
                Err(self.send_failure(reason))
            }
        }
    }

    /// Tear the link down.
    ///
    /// Safe to call any number of times from any task; only the first call
    /// does the work and returns `true`. Closing stops the heartbeat, wakes
    /// the pending inbound read and shuts down the write half of the socket.
    pub async fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        log::info!("Closing connection to {}", self.address);
        self.close_signal.send_replace(true);
        // Dropping the write half shuts the socket down for writing.
        drop(self.writer.lock().await.take());
        true
    }

    /// Whether the link has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registry address of the remote node
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Socket address of the remote end
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Name the remote node announced, or its address until it does
    pub fn display_name(&self) -> String {
        read(&self.display_name).clone()
    }

    /// Replace the remote display name
    pub fn set_display_name(&self, name: impl Into<String>) {
        *write(&self.display_name) = name.into();
    }

    /// Time of the last successful send
    pub fn last_active(&self) -> DateTime<Utc> {
        *read(&self.last_active)
    }

    /// Chat history of this link, oldest first
    pub fn history(&self) -> Vec<Envelope> {
        read(&self.history).clone()
    }

    /// Append a chat envelope to the history
    pub fn record(&self, envelope: Envelope) {
        write(&self.history).push(envelope);
    }

    /// Snapshot for connection tables
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.address.clone(),
            display_name: self.display_name(),
            remote_addr: self.remote_addr,
            last_active: self.last_active(),
            messages: read(&self.history).len(),
            closed: self.is_closed(),
        }
    }

    fn touch(&self) {
        *write(&self.last_active) = Utc::now();
    }

    fn send_failure(&self, reason: impl Into<String>) -> OverlayError {
        NetworkError::SendFailure {
            peer: self.address.clone(),
            reason: reason.into(),
        }
        .into()
    }
}

impl Inbound {
    /// Read the next newline-terminated frame, waiting at most `deadline`.
    ///
    /// The frame is returned as raw bytes without its delimiter; decoding is
    /// left to the caller. Returns `Ok(None)` on end of stream or once the
    /// connection has been closed locally.
    pub async fn next_frame(&mut self, deadline: Duration) -> Result<Option<Vec<u8>>> {
        tokio::select! {
            biased;
            _ = signalled(&mut self.closed) => Ok(None),
            read = timeout(deadline, self.frames.next()) => match read {
                Err(_) => Err(NetworkError::Timeout {
                    operation: format!("read from {} after {:?} idle", self.peer, deadline),
                }
                .into()),
                Ok(None) => Ok(None),
                Ok(Some(Ok(frame))) => Ok(Some(frame.to_vec())),
                Ok(Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded))) => {
                    Err(ProtocolError::MessageTooLarge {
                        size: MAX_MESSAGE_SIZE + 1,
                        max: MAX_MESSAGE_SIZE,
                    }
                    .into())
                }
                Ok(Some(Err(AnyDelimiterCodecError::Io(e)))) => Err(e.into()),
            }
        }
    }
}

async fn heartbeat(connection: Arc<Connection>, period: Duration) {
    let mut closed = connection.close_signal.subscribe();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ping = Envelope::heartbeat(connection.local_name.clone());
                if let Err(e) = connection.send(&ping).await {
                    log::warn!("Heartbeat to {} failed: {}", connection.address, e);
                    connection.close().await;
                    return;
                }
                log::trace!("Heartbeat sent to {}", connection.address);
            }
            _ = signalled(&mut closed) => {
                log::debug!("Heartbeat stopped for {}", connection.address);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn fast_timings() -> Timings {
        Timings {
            ping_interval: Duration::from_millis(50),
            ping_deadline: Duration::from_millis(500),
            read_deadline: Duration::from_secs(2),
            redial_backoff: Duration::from_millis(50),
        }
    }

    fn quiet_timings() -> Timings {
        Timings {
            ping_interval: Duration::from_secs(60),
            ping_deadline: Duration::from_secs(90),
            ..fast_timings()
        }
    }

    async fn read_envelope(reader: &mut BufReader<TcpStream>) -> Envelope {
        let mut line = String::new();
        let read = timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert!(read > 0, "unexpected end of stream");
        Envelope::decode(&line).unwrap()
    }

    #[tokio::test]
    async fn test_open_sends_info_first() {
        let (local, remote) = socket_pair().await;
        let (connection, _inbound) =
            Connection::open("127.0.0.1:1", local, Envelope::info("alice"), quiet_timings()).await;
        assert!(!connection.is_closed());
        assert_eq!(connection.display_name(), "127.0.0.1:1");

        let mut reader = BufReader::new(remote);
        let first = read_envelope(&mut reader).await;
        assert_eq!(first.kind(), MessageKind::Info);
        assert_eq!(first.sender(), "alice");
    }

    #[tokio::test]
    async fn test_open_on_dead_socket_returns_closed() {
        let (mut local, _remote) = socket_pair().await;
        local.shutdown().await.unwrap();

        let (connection, _inbound) =
            Connection::open("127.0.0.1:1", local, Envelope::info("alice"), quiet_timings()).await;
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_send_records_only_text() {
        let (local, remote) = socket_pair().await;
        let (connection, _inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        connection.send(&Envelope::text("me", "hello")).await.unwrap();
        connection.send(&Envelope::log("me", "diag")).await.unwrap();
        connection.send(&Envelope::heartbeat("me")).await.unwrap();

        let history = connection.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content(), "hello");
        assert_eq!(connection.info().messages, 1);

        let mut reader = BufReader::new(remote);
        assert_eq!(read_envelope(&mut reader).await.kind(), MessageKind::Info);
        assert_eq!(read_envelope(&mut reader).await.kind(), MessageKind::Text);
        assert_eq!(read_envelope(&mut reader).await.kind(), MessageKind::Log);
        assert_eq!(read_envelope(&mut reader).await.kind(), MessageKind::Heartbeat);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, remote) = socket_pair().await;
        let (connection, _inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        assert!(connection.close().await);
        assert!(connection.is_closed());
        assert!(!connection.close().await);
        assert!(connection.is_closed());

        let result = connection.send(&Envelope::text("me", "late")).await;
        assert!(matches!(
            result,
            Err(OverlayError::Network(NetworkError::SendFailure { .. }))
        ));

        // The remote side sees the info line, then end of stream.
        let mut reader = BufReader::new(remote);
        let _ = read_envelope(&mut reader).await;
        let mut rest = String::new();
        let read = timeout(Duration::from_secs(2), reader.read_line(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_concurrent_close_tears_down_once() {
        let (local, _remote) = socket_pair().await;
        let (connection, _inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { connection.close().await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_heartbeat_advances_last_active() {
        let (local, remote) = socket_pair().await;
        let (connection, _inbound) =
            Connection::open("peer", local, Envelope::info("alice"), fast_timings()).await;
        let opened_at = connection.last_active();

        let mut reader = BufReader::new(remote);
        assert_eq!(read_envelope(&mut reader).await.kind(), MessageKind::Info);
        let ping = read_envelope(&mut reader).await;
        assert_eq!(ping.kind(), MessageKind::Heartbeat);
        assert_eq!(ping.sender(), "alice");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(connection.last_active() > opened_at);
        assert!(connection.history().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let (local, remote) = socket_pair().await;
        let (connection, _inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;
        drop(remote);

        let mut failed = false;
        for _ in 0..100 {
            if connection.send(&Envelope::text("me", "anyone?")).await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(failed, "writes to a dropped peer never failed");
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_inbound_read_deadline() {
        let (local, _remote) = socket_pair().await;
        let (_connection, mut inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        let result = inbound.next_frame(Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(OverlayError::Network(NetworkError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (local, _remote) = socket_pair().await;
        let (connection, mut inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        let reader = tokio::spawn(async move { inbound.next_frame(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.close().await;

        let result = timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_inbound_reads_lines() {
        let (local, mut remote) = socket_pair().await;
        let (_connection, mut inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        let line = Envelope::text("bob", "hi").encode().unwrap();
        remote.write_all(format!("{line}\n").as_bytes()).await.unwrap();

        let received = inbound.next_frame(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(Envelope::decode_bytes(&received).unwrap().content(), "hi");
    }

    #[tokio::test]
    async fn test_inbound_survives_invalid_utf8() {
        let (local, mut remote) = socket_pair().await;
        let (_connection, mut inbound) =
            Connection::open("peer", local, Envelope::info("alice"), quiet_timings()).await;

        let line = Envelope::text("bob", "still here").encode().unwrap();
        remote.write_all(b"\xff\xfe garbage\n").await.unwrap();
        remote.write_all(format!("{line}\n").as_bytes()).await.unwrap();

        let garbage = inbound.next_frame(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(garbage, b"\xff\xfe garbage");
        assert!(Envelope::decode_bytes(&garbage).is_err());

        let next = inbound.next_frame(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(Envelope::decode_bytes(&next).unwrap().content(), "still here");
    }

    #[test]
    fn test_default_timings_are_consistent() {
        let timings = Timings::default();
        assert!(timings.is_consistent());
        assert!(timings.ping_interval < timings.ping_deadline);

        let broken = Timings {
            ping_deadline: timings.ping_interval,
            ..timings
        };
        assert!(!broken.is_consistent());
    }
}
