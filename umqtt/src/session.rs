//! Session manager.
//!
//! Owns one transport at a time and runs it with three tasks:
//! - a writer draining encoded frames, in enqueue order, to the write half
//! - a reader driving the [`StreamFramer`] and codec, broadcasting every
//!   decoded frame to observers
//! - an optional keep-alive sending PINGREQ at `keep_alive / 2`
//!
//! A supervisor task, one per session, re-runs the handshake when an
//! established link faults, following the configured [`ReconnectPolicy`].
//!
//! Frames sent before the handshake completes are encoded and queued; the
//! queue is flushed right after CONNACK under the same lock that marks the
//! session established, so it precedes anything sent later.
//!
//! [`ReconnectPolicy`]: crate::config::ReconnectPolicy

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::frame::{Frame, Publish};
use crate::framer::StreamFramer;
use crate::transport::{BoxedStream, Connector, TcpConnector};

/// Read buffer size for the inbound stream.
const READ_BUFFER_SIZE: usize = 4096;

/// Why the session stopped delivering frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Disconnected,
    ReconnectExhausted { attempts: u32 },
}

impl From<Termination> for Error {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Disconnected => Error::ConnectionClosed,
            Termination::ReconnectExhausted { attempts } => Error::ReconnectExhausted { attempts },
        }
    }
}

/// Item on the observer broadcast channel.
#[derive(Debug, Clone)]
enum Delivery {
    Frame(Frame),
    Closed(Termination),
}

enum Phase {
    /// Not connected yet, or recovering. Outbound frames wait in `queue`.
    Handshaking { queue: VecDeque<Bytes> },
    /// CONNACK accepted; frames go straight to the writer of link `epoch`.
    /// Frames sent after that writer stopped wait in `stranded` and move to
    /// the queue of the next handshake.
    Established {
        outbound: mpsc::UnboundedSender<Bytes>,
        epoch: u64,
        stranded: VecDeque<Bytes>,
    },
    Closed(Termination),
}

impl Phase {
    fn handshaking() -> Self {
        Phase::Handshaking { queue: VecDeque::new() }
    }
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    connect_packet: Bytes,
    ping_packet: Bytes,
    disconnect_packet: Bytes,
    phase: Mutex<Phase>,
    frames_tx: broadcast::Sender<Delivery>,
    next_packet_id: AtomicU16,
    epoch: AtomicU64,
    /// Serializes `connect()` and recovery.
    connect_lock: tokio::sync::Mutex<()>,
    /// Shutdown token of the current link.
    link: Mutex<Option<CancellationToken>>,
    fault_tx: mpsc::UnboundedSender<u64>,
    fault_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

/// MQTT session over a single broker connection.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a session that connects over TCP.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::with_connector(config, TcpConnector)
    }

    /// Create a session that opens its transport through `connector`.
    pub fn with_connector(config: ConnectionConfig, connector: impl Connector + 'static) -> Result<Self> {
        config.validate()?;

        let connect_packet = codec::encode(&Frame::Connect(config.connect_frame()?))?;
        let ping_packet = codec::encode(&Frame::Pingreq)?;
        let disconnect_packet = codec::encode(&Frame::Disconnect)?;
        let (frames_tx, _) = broadcast::channel(config.channel_capacity);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector: Arc::new(connector),
                connect_packet,
                ping_packet,
                disconnect_packet,
                phase: Mutex::new(Phase::handshaking()),
                frames_tx,
                next_packet_id: AtomicU16::new(1),
                epoch: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                link: Mutex::new(None),
                fault_tx,
                fault_rx: Mutex::new(Some(fault_rx)),
            }),
        })
    }

    /// The configuration this session connects with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Open the transport and run the CONNECT/CONNACK handshake.
    ///
    /// Returns once the broker accepted the connection and queued frames
    /// were handed to the writer. Calling it on an established session is a
    /// no-op; calling it after [`close`](Self::close) starts a fresh link.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        {
            let mut phase = self.inner.phase.lock();
            match &*phase {
                Phase::Established { .. } => return Ok(()),
                Phase::Closed(_) => *phase = Phase::handshaking(),
                Phase::Handshaking { .. } => {}
            }
        }

        if let Some(faults) = self.inner.fault_rx.lock().take() {
            tokio::spawn(supervise(Arc::downgrade(&self.inner), faults));
        }

        self.inner.establish().await
    }

    /// Queue a frame for the broker. Never blocks.
    ///
    /// Before the handshake completes the frame waits in the pending queue.
    pub fn send(&self, frame: Frame) -> Result<()> {
        let packet = codec::encode(&frame)?;
        let packet_type = frame.packet_type();

        let mut phase = self.inner.phase.lock();
        match &mut *phase {
            Phase::Handshaking { queue } => {
                trace!(?packet_type, queued = queue.len() + 1, "frame queued until handshake completes");
                queue.push_back(packet);
                Ok(())
            }
            Phase::Established { outbound, epoch, stranded } => {
                trace!(?packet_type, "frame queued for writer");
                if let Err(mpsc::error::SendError(packet)) = outbound.send(packet) {
                    debug!(?packet_type, epoch = *epoch, "writer closed, frame held for reconnect");
                    stranded.push_back(packet);
                }
                Ok(())
            }
            Phase::Closed(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Subscribe to every decoded inbound frame.
    pub fn frames(&self) -> Frames {
        let rx = self.inner.frames_tx.subscribe();
        let terminated = match &*self.inner.phase.lock() {
            Phase::Closed(termination) => Some(*termination),
            _ => None,
        };
        Frames { rx, terminated }
    }

    /// Subscribe to inbound PUBLISH frames only.
    pub fn publishes(&self) -> Publishes {
        Publishes { frames: self.frames() }
    }

    /// Allocate the next packet identifier. Never returns 0.
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Whether the handshake completed and the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.phase.lock(), Phase::Established { .. })
    }

    /// Send DISCONNECT if the link is up, then close.
    pub fn disconnect(&self) {
        if let Phase::Established { outbound, .. } = &*self.inner.phase.lock() {
            debug!("sending disconnect");
            let _ = outbound.send(self.inner.disconnect_packet.clone());
        }
        self.close();
    }

    /// Tear down the link. Observers see [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.shutdown(Termination::Disconnected);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("client_id", &self.inner.config.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Inner {
    async fn establish(&self) -> Result<()> {
        let config = &self.config;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(host = %config.host, port = config.port, client_id = %config.client_id, epoch, "connecting");

        let stream = match tokio::time::timeout(
            config.connect_timeout,
            self.connector.connect(&config.host, config.port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed(format!("{}:{}: {}", config.host, config.port, e)));
            }
            Err(_) => {
                return Err(Error::ConnectionFailed(format!(
                    "{}:{}: timed out opening transport",
                    config.host, config.port
                )));
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = oneshot::channel();

        // CONNECT goes out ahead of the pending queue.
        let _ = outbound.send(self.connect_packet.clone());

        tokio::spawn(write_loop(write_half, outbound_rx, shutdown.clone(), self.fault_tx.clone(), epoch));
        tokio::spawn(
            ReadLoop {
                reader: read_half,
                framer: StreamFramer::with_max_packet_size(config.max_packet_size),
                frames: self.frames_tx.clone(),
                first: Some(first_tx),
                shutdown: shutdown.clone(),
                faults: self.fault_tx.clone(),
                epoch,
            }
            .run(),
        );

        if let Some(previous) = self.link.lock().replace(shutdown.clone()) {
            previous.cancel();
        }

        let first = tokio::select! {
            first = first_rx => first.ok(),
            _ = shutdown.cancelled() => None,
            _ = tokio::time::sleep(config.connect_timeout) => {
                shutdown.cancel();
                return Err(Error::ConnectionFailed("timed out waiting for CONNACK".to_string()));
            }
        };

        let reason = match first {
            Some(Frame::Connack(ack)) if ack.is_accepted() => {
                debug!(epoch, session_present = ack.session_present, "connection accepted");
                None
            }
            Some(Frame::Connack(ack)) => Some(format!(
                "connection refused: {} (code {})",
                ack.reason(),
                ack.return_code
            )),
            Some(other) => Some(format!("expected CONNACK, got {:?}", other.packet_type())),
            None => Some("connection lost during handshake".to_string()),
        };
        if let Some(reason) = reason {
            shutdown.cancel();
            warn!(epoch, %reason, "handshake failed");
            return Err(Error::ConnectionFailed(reason));
        }

        {
            let mut phase = self.phase.lock();
            let established = Phase::Established {
                outbound: outbound.clone(),
                epoch,
                stranded: VecDeque::new(),
            };
            match std::mem::replace(&mut *phase, established) {
                Phase::Handshaking { queue } => {
                    if !queue.is_empty() {
                        debug!(epoch, count = queue.len(), "flushing pending frames");
                    }
                    for packet in queue {
                        let _ = outbound.send(packet);
                    }
                }
                Phase::Established { .. } => {}
                closed @ Phase::Closed(_) => {
                    *phase = closed;
                    shutdown.cancel();
                    return Err(Error::ConnectionClosed);
                }
            }
        }

        if config.auto_keepalive && config.keep_alive > 0 {
            let period = Duration::from_secs(u64::from((config.keep_alive / 2).max(1)));
            debug!(epoch, interval_secs = period.as_secs(), "starting keepalive");
            tokio::spawn(keepalive(outbound, self.ping_packet.clone(), period, shutdown));
        }

        info!(host = %config.host, port = config.port, epoch, "connected");
        Ok(())
    }

    /// Re-run the handshake after link `epoch` faulted.
    async fn recover(&self, epoch: u64) {
        let _guard = self.connect_lock.lock().await;

        if !self.begin_recovery(epoch) {
            return;
        }

        let policy = &self.config.reconnect;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !policy.allows(attempt) {
                break;
            }

            let delay = policy.delay_for(attempt);
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::time::sleep(delay).await;
            }

            if matches!(*self.phase.lock(), Phase::Closed(_)) {
                return;
            }

            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return;
                }
                Err(Error::ConnectionClosed) => return,
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }

        let attempts = attempt - 1;
        warn!(attempts, "giving up on reconnect");
        self.shutdown(Termination::ReconnectExhausted { attempts });
    }

    /// Move link `epoch` back to handshaking, keeping frames that never
    /// reached its writer. False when that link is no longer current.
    fn begin_recovery(&self, epoch: u64) -> bool {
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Established { epoch: current, stranded, .. } if *current == epoch => {
                let queue = std::mem::take(stranded);
                if !queue.is_empty() {
                    debug!(epoch, count = queue.len(), "requeueing frames for reconnect");
                }
                *phase = Phase::Handshaking { queue };
                true
            }
            _ => false,
        }
    }

    fn shutdown(&self, termination: Termination) {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, Phase::Closed(_)) {
                return;
            }
            *phase = Phase::Closed(termination);
        }

        if let Some(link) = self.link.lock().take() {
            link.cancel();
        }

        debug!(?termination, "session closed");
        let _ = self.frames_tx.send(Delivery::Closed(termination));
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.cancel();
        }
    }
}

/// Handles link faults for as long as the session exists.
async fn supervise(inner: Weak<Inner>, mut faults: mpsc::UnboundedReceiver<u64>) {
    while let Some(epoch) = faults.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.recover(epoch).await;
    }
    trace!("supervisor stopped");
}

struct ReadLoop {
    reader: ReadHalf<BoxedStream>,
    framer: StreamFramer,
    frames: broadcast::Sender<Delivery>,
    /// Receives the first decoded frame for the handshake.
    first: Option<oneshot::Sender<Frame>>,
    shutdown: CancellationToken,
    faults: mpsc::UnboundedSender<u64>,
    epoch: u64,
}

impl ReadLoop {
    async fn run(mut self) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    trace!(epoch = self.epoch, "reader stopped");
                    return;
                }
                read = self.reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break "connection closed by peer".to_string(),
                Ok(n) => match self.framer.feed(&buf[..n]) {
                    Ok(packets) => {
                        for packet in packets {
                            self.dispatch(&packet);
                        }
                    }
                    Err(e) => break e.to_string(),
                },
                Err(e) => break e.to_string(),
            }
        };

        warn!(epoch = self.epoch, %reason, "connection lost");
        self.shutdown.cancel();
        let _ = self.faults.send(self.epoch);
    }

    fn dispatch(&mut self, packet: &[u8]) {
        match codec::decode(packet) {
            Ok(frame) => {
                trace!(packet_type = ?frame.packet_type(), len = packet.len(), "frame received");
                if let Some(first) = self.first.take() {
                    let _ = first.send(frame.clone());
                }
                let _ = self.frames.send(Delivery::Frame(frame));
            }
            Err(e) => warn!(epoch = self.epoch, error = %e, "dropping inbound frame"),
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: CancellationToken,
    faults: mpsc::UnboundedSender<u64>,
    epoch: u64,
) {
    while let Some(packet) = outbound.recv().await {
        let written = async {
            writer.write_all(&packet).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(epoch, error = %e, "write failed");
            shutdown.cancel();
            let _ = faults.send(epoch);
            return;
        }
    }

    let _ = writer.shutdown().await;
    trace!(epoch, "writer stopped");
}

async fn keepalive(
    outbound: mpsc::UnboundedSender<Bytes>,
    ping: Bytes,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                trace!("sending pingreq");
                if outbound.send(ping.clone()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Observer of every decoded inbound frame.
///
/// Each observer has its own cursor; a slow one gets [`Error::Lagged`] and
/// then continues with the oldest frame still buffered.
#[derive(Debug)]
pub struct Frames {
    rx: broadcast::Receiver<Delivery>,
    terminated: Option<Termination>,
}

impl Frames {
    /// Next frame, or the error that ended the stream.
    pub async fn recv(&mut self) -> Result<Frame> {
        if let Some(termination) = self.terminated {
            return Err(termination.into());
        }

        match self.rx.recv().await {
            Ok(Delivery::Frame(frame)) => Ok(frame),
            Ok(Delivery::Closed(termination)) => {
                self.terminated = Some(termination);
                Err(termination.into())
            }
            Err(RecvError::Lagged(skipped)) => Err(Error::Lagged(skipped)),
            Err(RecvError::Closed) => {
                self.terminated = Some(Termination::Disconnected);
                Err(Error::ConnectionClosed)
            }
        }
    }
}

/// Observer of inbound PUBLISH frames.
#[derive(Debug)]
pub struct Publishes {
    frames: Frames,
}

impl Publishes {
    /// Next publish, or the error that ended the stream.
    pub async fn recv(&mut self) -> Result<Publish> {
        loop {
            if let Frame::Publish(publish) = self.frames.recv().await? {
                return Ok(publish);
            }
        }
    }
}
