//! Acquisition orchestrator.
//!
//! Brings a device from closed links to streaming and back:
//!
//! 1. open the shell link and spawn its reader
//! 2. WHO, CONNECT (retried), one INIT per selected module in table order
//! 3. open the data link, spawn the data reader and the consumer
//! 4. START
//!
//! The data reader feeds a [`FrameAssembler`] and pushes every packet into a
//! bounded queue. A full queue blocks the reader; packets are never dropped.
//! The consumer decodes each packet, stamps it with continuity information and
//! hands a [`DecodedBlock`] to the caller's [`FrameSink`].
//!
//! [`Acquisition::reset_continuity`] restarts sample numbering without
//! touching the device, e.g. when a new recording begins.
//!
//! [`Acquisition::shutdown`] runs on every exit path, including a failed start.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::assembler::{AssemblerStats, FrameAssembler, RawPacket};
use crate::channels::ChannelRegistry;
use crate::codec::SampleFrame;
use crate::continuity::ContinuityMonitor;
use crate::errors::{DriverError, Result};
use crate::handshake::{
    is_idle_read, spawn_shell_reader, Handshake, HandshakeConfig, LinkStatus, Phase, ReaderHandle,
    ShellEvents, ShellProtocol,
};

/// Packets buffered between the data reader and the consumer.
pub const QUEUE_CAPACITY: usize = 1000;

/// How long the consumer waits for a packet before re-checking for shutdown.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a blocked enqueue waits before re-checking for shutdown.
const ENQUEUE_POLL: Duration = Duration::from_millis(100);

const DATA_READ_CHUNK: usize = 4096;

// ============================================================================
// Boundaries
// ============================================================================

/// Opens the two device links. Readers must time out periodically.
pub trait DeviceLinks {
    /// Text command link: a reader for device lines and a writer for commands.
    fn open_shell(&mut self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>;
    /// Binary sample link.
    fn open_data(&mut self) -> Result<Box<dyn Read + Send>>;
}

/// One decoded packet, ready for plotting, storage or detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub channel: String,
    pub variant: String,
    pub labels: Vec<String>,
    pub rate: u16,
    /// Device timestamp of the packet in ms (wrapping).
    pub timestamp: u16,
    pub eof: bool,
    pub frames: Vec<SampleFrame>,
    /// Index of `frames[0]` since acquisition started.
    pub first_sample: u64,
    /// Samples estimated lost just before this block.
    pub lost_samples: i64,
}

impl DecodedBlock {
    fn from_packet(packet: RawPacket, monitor: &mut ContinuityMonitor) -> Self {
        let frames = packet.decode();
        let descriptor = packet.descriptor;
        let report = monitor.observe(&descriptor.name, packet.timestamp, frames.len(), descriptor.rate);
        Self {
            channel: descriptor.name.clone(),
            variant: descriptor.variant.clone(),
            labels: descriptor.labels.clone(),
            rate: descriptor.rate,
            timestamp: packet.timestamp,
            eof: packet.eof,
            frames,
            first_sample: report.first_sample,
            lost_samples: report.lost_samples,
        }
    }

    /// Seconds since acquisition start of the first frame.
    pub fn elapsed_s(&self) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        self.first_sample as f64 / f64::from(self.rate)
    }
}

/// Continuity history to drop, applied by the consumer before its next block.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ContinuityReset {
    All,
    Channel(String),
}

fn apply_resets(resets: &Receiver<ContinuityReset>, monitor: &mut ContinuityMonitor) {
    for reset in resets.try_iter() {
        match reset {
            ContinuityReset::All => {
                info!("continuity reset for all channels");
                monitor.reset();
            }
            ContinuityReset::Channel(channel) => {
                info!("continuity reset for {channel} after {} samples", monitor.emitted(&channel));
                monitor.reset_channel(&channel);
            }
        }
    }
}

/// Receives decoded blocks on the consumer thread.
pub trait FrameSink: Send {
    fn on_block(&mut self, block: DecodedBlock);
}

impl<F> FrameSink for F
where
    F: FnMut(DecodedBlock) + Send,
{
    fn on_block(&mut self, block: DecodedBlock) {
        self(block)
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake: HandshakeConfig,
    pub queue_capacity: usize,
    pub dequeue_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            queue_capacity: QUEUE_CAPACITY,
            dequeue_timeout: DEQUEUE_TIMEOUT,
        }
    }
}

// ============================================================================
// Acquisition
// ============================================================================

/// A running acquisition. Dropping it shuts the device down.
pub struct Acquisition {
    registry: Arc<ChannelRegistry>,
    config: SessionConfig,
    handshake: Option<Handshake>,
    shell_reader: Option<ReaderHandle>,
    data_reader: Option<ReaderHandle>,
    consumer: Option<ReaderHandle>,
    resets: Option<Sender<ContinuityReset>>,
    status: Arc<LinkStatus>,
    stats: Arc<Mutex<AssemblerStats>>,
    delivered: Arc<AtomicU64>,
    closed: bool,
}

impl Acquisition {
    /// Run the full startup sequence for the registry's selected channels.
    ///
    /// On failure every link opened so far is shut down before the error is
    /// returned.
    pub fn start<L, S>(
        links: &mut L,
        registry: Arc<ChannelRegistry>,
        config: SessionConfig,
        events: Arc<dyn ShellEvents>,
        sink: S,
    ) -> Result<Self>
    where
        L: DeviceLinks + ?Sized,
        S: FrameSink + 'static,
    {
        let mut session = Self {
            registry,
            config,
            handshake: None,
            shell_reader: None,
            data_reader: None,
            consumer: None,
            resets: None,
            status: Arc::new(LinkStatus::default()),
            stats: Arc::new(Mutex::new(AssemblerStats::default())),
            delivered: Arc::new(AtomicU64::new(0)),
            closed: false,
        };

        match session.startup(links, events, sink) {
            Ok(()) => Ok(session),
            Err(e) => {
                error!("acquisition start failed: {e}");
                if let Err(cleanup) = session.shutdown() {
                    warn!("cleanup after failed start: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn startup<L, S>(&mut self, links: &mut L, events: Arc<dyn ShellEvents>, sink: S) -> Result<()>
    where
        L: DeviceLinks + ?Sized,
        S: FrameSink + 'static,
    {
        let wanted = self.registry.selected_channels();
        if wanted.is_empty() {
            return Err(DriverError::Config("no channels selected".into()));
        }
        let order = self.registry.table().init_order(&wanted)?;
        info!("acquiring {} (init order {:?})", wanted.join(", "), order);

        let (shell_rx, shell_tx) = links.open_shell()?;
        let protocol = Arc::new(ShellProtocol::new(
            &self.config.handshake.identity_marker,
            events.clone(),
        ));
        self.status = protocol.status();
        self.shell_reader = Some(spawn_shell_reader(shell_rx, protocol.clone())?);
        let handshake = self.handshake.insert(Handshake::new(
            shell_tx,
            protocol,
            events.clone(),
            self.config.handshake.clone(),
        ));

        handshake.validate()?;
        handshake.connect()?;
        for module in &order {
            let args = self.registry.init_args(module).unwrap_or_default();
            if args.is_empty() {
                debug!("{module}: no init command, streams with its dependency");
                continue;
            }
            handshake.init_module(module, &args)?;
        }

        let data = links.open_data()?;
        let (tx, rx) = bounded(self.config.queue_capacity.max(1));
        let (reset_tx, reset_rx) = unbounded();
        self.resets = Some(reset_tx);
        self.consumer = Some(spawn_consumer(
            rx,
            reset_rx,
            sink,
            self.config.dequeue_timeout,
            self.delivered.clone(),
        )?);
        self.data_reader = Some(spawn_data_reader(
            data,
            self.registry.clone(),
            tx,
            self.stats.clone(),
            events,
        )?);

        handshake.start()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        self.status.clone()
    }

    pub fn connected(&self) -> bool {
        self.status.device_connected()
    }

    pub fn acquiring(&self) -> bool {
        self.status.acquiring()
    }

    pub fn phase(&self) -> Phase {
        self.handshake.as_ref().map_or(Phase::Idle, Handshake::phase)
    }

    /// Assembler counters as of the last chunk read from the data link.
    pub fn assembler_stats(&self) -> AssemblerStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Blocks handed to the sink so far.
    pub fn blocks_delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Restart sample numbering and lost-sample tracking for one channel, or
    /// for every channel when `channel` is `None`. Takes effect before the
    /// next block the consumer decodes.
    pub fn reset_continuity(&self, channel: Option<&str>) -> Result<()> {
        let reset = match channel {
            Some(name) if self.registry.table().channel(name).is_none() => {
                return Err(DriverError::UnknownChannel(name.to_string()));
            }
            Some(name) => ContinuityReset::Channel(name.to_string()),
            None => ContinuityReset::All,
        };
        let resets = self
            .resets
            .as_ref()
            .filter(|_| !self.closed)
            .ok_or_else(|| DriverError::LinkClosed("acquisition is not running".into()))?;
        resets
            .send(reset)
            .map_err(|_| DriverError::LinkClosed("consumer has exited".into()))
    }

    /// Stop streaming, close the data link, disconnect and close the shell
    /// link. Every step runs even if an earlier one failed; the first failure
    /// is returned. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("shutting down acquisition");

        let mut first_error: Option<DriverError> = None;

        if let Some(handshake) = self.handshake.as_mut() {
            if handshake.phase() == Phase::Streaming {
                if let Err(e) = handshake.stop() {
                    warn!("STOP during shutdown: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(mut reader) = self.data_reader.take() {
            reader.close();
        }
        // the data reader owned the queue sender; the consumer drains and exits
        if let Some(mut consumer) = self.consumer.take() {
            consumer.close();
        }

        if let Some(handshake) = self.handshake.as_mut() {
            if handshake.phase() != Phase::Disconnected {
                if let Err(e) = handshake.disconnect() {
                    warn!("DISCONNECT during shutdown: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(mut reader) = self.shell_reader.take() {
            reader.close();
        }

        let stats = self.assembler_stats();
        info!(
            "acquisition closed: {} packets, {} blocks delivered, {} bytes discarded",
            stats.packets,
            self.blocks_delivered(),
            stats.discarded_bytes
        );

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("shutdown on drop: {e}");
        }
    }
}

// ============================================================================
// Worker threads
// ============================================================================

fn spawn_data_reader(
    mut reader: Box<dyn Read + Send>,
    registry: Arc<ChannelRegistry>,
    tx: Sender<RawPacket>,
    stats: Arc<Mutex<AssemblerStats>>,
    events: Arc<dyn ShellEvents>,
) -> Result<ReaderHandle> {
    ReaderHandle::spawn("data-reader", move |stop| {
        let mut assembler = FrameAssembler::new(registry);
        let mut buf = vec![0u8; DATA_READ_CHUNK];
        'read: while !stop.load(Ordering::SeqCst) {
            match reader.read(&mut buf) {
                Ok(0) => {
                    if !stop.load(Ordering::SeqCst) {
                        let err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "data link closed");
                        error!("data link failure: {err}");
                        events.on_link_error(&err);
                    }
                    break;
                }
                Ok(n) => {
                    let packets = assembler.push(&buf[..n]);
                    *stats.lock().unwrap_or_else(PoisonError::into_inner) = assembler.stats();
                    for packet in packets {
                        if !enqueue(&tx, packet, &stop) {
                            break 'read;
                        }
                    }
                }
                Err(e) if is_idle_read(&e) => {}
                Err(e) => {
                    error!("data link failure: {e}");
                    events.on_link_error(&e);
                    break;
                }
            }
        }
        debug!("data reader exiting, {} bytes left unassembled", assembler.buffered());
    })
}

/// Blocking enqueue. Returns false only when shutting down.
fn enqueue(tx: &Sender<RawPacket>, mut packet: RawPacket, stop: &AtomicBool) -> bool {
    let mut stalled = false;
    loop {
        match tx.send_timeout(packet, ENQUEUE_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                if !stalled {
                    warn!("packet queue full, data reader stalled");
                    stalled = true;
                }
                packet = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn spawn_consumer<S>(
    rx: Receiver<RawPacket>,
    resets: Receiver<ContinuityReset>,
    mut sink: S,
    timeout: Duration,
    delivered: Arc<AtomicU64>,
) -> Result<ReaderHandle>
where
    S: FrameSink + 'static,
{
    ReaderHandle::spawn("frame-consumer", move |stop| {
        let mut monitor = ContinuityMonitor::new();
        loop {
            match rx.recv_timeout(timeout) {
                Ok(packet) => {
                    apply_resets(&resets, &mut monitor);
                    let block = DecodedBlock::from_packet(packet, &mut monitor);
                    delivered.fetch_add(1, Ordering::SeqCst);
                    sink.on_block(block);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("consumer exiting");
    })
}
