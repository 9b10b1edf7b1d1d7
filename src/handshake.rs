//! Shell link protocol: device validation, connection, module init and
//! acquisition start/stop over line-oriented text.
//!
//! The protocol is strictly sequential. [`Handshake`] arms exactly one
//! expected acknowledgement, writes a command and blocks on a single-slot
//! rendezvous channel until the shell reader thread, running
//! [`ShellProtocol::handle_line`], recognises the reply or the step times out.
//!
//! A device-initiated `>DISCONNECTED` is handled by the reader regardless of
//! what is armed: the shared [`LinkStatus`] flips immediately.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

pub const CMD_WHO: &str = "who\r";
pub const CMD_CONNECT: &str = "connect 0\r";
pub const CMD_START: &str = "rem start\r";
pub const CMD_STOP: &str = "rem stop\r";
pub const CMD_DISCONNECT: &str = "disconnect\r";

const CONNECTED_LINE: &str = ">CONNECTED";
const DISCONNECTED_LINE: &str = ">DISCONNECTED";
const INIT_ACK: &str = "OK";
const STOP_ACK: &str = "DONE";

/// Substring (case-insensitive) of the shell banner that identifies the device.
pub const IDENTITY_MARKER: &str = "shell";

/// Longest line kept before it is force-split.
const MAX_LINE_LEN: usize = 1024;

/// Build the init command for one module, e.g. `rem ecg 1 250 3 01\r`.
pub fn init_command(module: &str, args: &[String]) -> String {
    format!("rem {} {}\r", module.to_lowercase(), args.join(" "))
}

/// Token the device echoes for an initialised module once started.
pub fn start_token(module: &str) -> String {
    format!("{} OK", module.to_uppercase())
}

// ============================================================================
// Configuration
// ============================================================================

/// Per-step timeouts and the CONNECT retry policy.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub identity_marker: String,
    pub validate_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    pub init_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            identity_marker: IDENTITY_MARKER.to_string(),
            validate_timeout: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(7000),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(800),
            retry_backoff: 1.6,
            init_timeout: Duration::from_millis(1800),
            start_timeout: Duration::from_millis(5500),
            stop_timeout: Duration::from_millis(3000),
            disconnect_timeout: Duration::from_millis(1000),
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// Where the session stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Validated,
    Connecting,
    Connected,
    Initializing(String),
    Initialized,
    Starting,
    Streaming,
    Stopping,
    Stopped,
    Disconnecting,
    Disconnected,
}

impl Phase {
    /// True while the device side of the link is (or is becoming) live.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Phase::Connected
                | Phase::Initializing(_)
                | Phase::Initialized
                | Phase::Starting
                | Phase::Streaming
                | Phase::Stopping
                | Phase::Stopped
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing(module) => write!(f, "Initializing({module})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Externally observable connection and acquisition flags.
#[derive(Debug, Default)]
pub struct LinkStatus {
    device_connected: AtomicBool,
    acquiring: AtomicBool,
}

impl LinkStatus {
    pub fn device_connected(&self) -> bool {
        self.device_connected.load(Ordering::SeqCst)
    }

    pub fn acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    fn set_device_connected(&self, value: bool) -> bool {
        self.device_connected.swap(value, Ordering::SeqCst) != value
    }

    fn set_acquiring(&self, value: bool) -> bool {
        self.acquiring.swap(value, Ordering::SeqCst) != value
    }
}

/// Callbacks from the shell link. All methods default to no-ops.
///
/// Called from the shell reader thread (line, validation, disconnect, link
/// errors) or from the orchestrating thread (status changes).
pub trait ShellEvents: Send + Sync {
    fn on_line(&self, _line: &str) {}
    fn on_validated(&self) {}
    /// The device reported `>DISCONNECTED`.
    fn on_device_disconnected(&self) {}
    /// The transport failed; the session cannot continue.
    fn on_link_error(&self, _error: &io::Error) {}
    fn on_connection_changed(&self, _connected: bool) {}
    fn on_acquisition_changed(&self, _acquiring: bool) {}
}

/// Event sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl ShellEvents for NoEvents {}

/// The acknowledgement currently armed. At most one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    Identity,
    Connected,
    InitOk,
    StartTokens,
    Done,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Ack,
    LinkLost,
    DeviceDisconnected,
}

#[derive(Debug)]
struct ShellState {
    phase: Phase,
    awaiting: Awaiting,
    validated: bool,
    connected: bool,
    link_failed: bool,
    /// Tokens still expected before START completes.
    pending: Vec<String>,
}

/// Line handler shared by the shell reader thread and [`Handshake`].
pub struct ShellProtocol {
    state: Mutex<ShellState>,
    ack_tx: Sender<Signal>,
    ack_rx: Receiver<Signal>,
    status: Arc<LinkStatus>,
    events: Arc<dyn ShellEvents>,
    identity_marker: String,
}

impl ShellProtocol {
    pub fn new(identity_marker: &str, events: Arc<dyn ShellEvents>) -> Self {
        let (ack_tx, ack_rx) = bounded(1);
        Self {
            state: Mutex::new(ShellState {
                phase: Phase::Idle,
                awaiting: Awaiting::Nothing,
                validated: false,
                connected: false,
                link_failed: false,
                pending: Vec::new(),
            }),
            ack_tx,
            ack_rx,
            status: Arc::new(LinkStatus::default()),
            events,
            identity_marker: identity_marker.to_lowercase(),
        }
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        self.status.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    pub fn pending_tokens(&self) -> Vec<String> {
        self.lock().pending.clone()
    }

    pub fn is_validated(&self) -> bool {
        self.lock().validated
    }

    /// Whether the shell last reported `>CONNECTED`.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Process one text line from the device.
    pub fn handle_line(&self, raw: &str) {
        let line = raw.trim();
        self.events.on_line(line);
        if line.is_empty() {
            return;
        }
        debug!("shell <- {line}");

        let mut validated = false;
        let mut connection_changed = None;
        let mut acquisition_dropped = false;
        let mut disconnected = false;
        let mut interrupted = false;
        let ack = {
            let mut st = self.lock();
            if !st.validated && line.to_lowercase().contains(&self.identity_marker) {
                st.validated = true;
                validated = true;
                Self::settle_if(&mut st, Awaiting::Identity)
            } else if !st.connected && line == CONNECTED_LINE {
                st.connected = true;
                if self.status.set_device_connected(true) {
                    connection_changed = Some(true);
                }
                Self::settle_if(&mut st, Awaiting::Connected)
            } else if st.connected && line == DISCONNECTED_LINE {
                // wins over whatever phase is current
                st.connected = false;
                st.phase = Phase::Disconnected;
                disconnected = true;
                acquisition_dropped = self.status.set_acquiring(false);
                if self.status.set_device_connected(false) {
                    connection_changed = Some(false);
                }
                let awaiting = st.awaiting;
                match awaiting {
                    Awaiting::Disconnected => Self::settle(&mut st),
                    Awaiting::Nothing => false,
                    _ => {
                        st.awaiting = Awaiting::Nothing;
                        interrupted = true;
                        false
                    }
                }
            } else if st.connected {
                let awaiting = st.awaiting;
                match awaiting {
                    Awaiting::InitOk if line.contains(INIT_ACK) => Self::settle(&mut st),
                    Awaiting::StartTokens => {
                        st.pending.retain(|token| !line.contains(token.as_str()));
                        st.pending.is_empty() && Self::settle(&mut st)
                    }
                    Awaiting::Done if line.contains(STOP_ACK) => Self::settle(&mut st),
                    _ => false,
                }
            } else {
                false
            }
        };

        if validated {
            info!("shell validated: {line}");
            self.events.on_validated();
        }
        if disconnected {
            warn!("device disconnected");
        } else if connection_changed == Some(true) {
            info!("device connected");
        }
        if acquisition_dropped {
            self.events.on_acquisition_changed(false);
        }
        if let Some(connected) = connection_changed {
            self.events.on_connection_changed(connected);
        }
        if disconnected {
            self.events.on_device_disconnected();
        }

        // released last so the waiter observes every flag set above
        if ack {
            let _ = self.ack_tx.try_send(Signal::Ack);
        } else if interrupted {
            let _ = self.ack_tx.try_send(Signal::DeviceDisconnected);
        }
    }

    /// The shell transport failed. Any armed wait ends immediately.
    pub fn handle_link_error(&self, err: &io::Error) {
        error!("shell link failure: {err}");
        self.events.on_link_error(err);
        let mut st = self.lock();
        st.link_failed = true;
        if st.awaiting != Awaiting::Nothing {
            st.awaiting = Awaiting::Nothing;
            let _ = self.ack_tx.try_send(Signal::LinkLost);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle_if(st: &mut ShellState, expected: Awaiting) -> bool {
        st.awaiting == expected && Self::settle(st)
    }

    fn settle(st: &mut ShellState) -> bool {
        st.awaiting = Awaiting::Nothing;
        true
    }

    /// Arm a wait and enter `during` in one step.
    fn arm(&self, awaiting: Awaiting, during: Phase) -> Result<()> {
        let mut st = self.lock();
        if st.link_failed {
            return Err(DriverError::LinkClosed("shell link failed".into()));
        }
        if st.awaiting != Awaiting::Nothing {
            return Err(DriverError::Protocol(format!(
                "cannot wait for {awaiting:?} while {:?} is outstanding",
                st.awaiting
            )));
        }
        while self.ack_rx.try_recv().is_ok() {}
        st.awaiting = awaiting;
        debug!("phase -> {during}");
        st.phase = during;
        Ok(())
    }

    fn disarm(&self) {
        self.lock().awaiting = Awaiting::Nothing;
    }

    fn wait(&self, step: &str, timeout: Duration) -> Result<()> {
        match self.ack_rx.recv_timeout(timeout) {
            Ok(Signal::Ack) => Ok(()),
            Ok(Signal::LinkLost) => Err(DriverError::LinkClosed(format!("shell link lost during {step}"))),
            Ok(Signal::DeviceDisconnected) => {
                Err(DriverError::LinkClosed(format!("device disconnected during {step}")))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.disarm();
                Err(DriverError::timeout(step, timeout))
            }
        }
    }

    /// Enter `after` once a step is acknowledged, unless the device dropped
    /// the connection in the meantime. Returns whether `acquiring` changed.
    fn finish(&self, step: &str, after: Phase, acquiring: Option<bool>) -> Result<bool> {
        let mut st = self.lock();
        if st.phase == Phase::Disconnected && after != Phase::Disconnected {
            return Err(DriverError::LinkClosed(format!("device disconnected during {step}")));
        }
        debug!("phase -> {after}");
        st.phase = after;
        Ok(acquiring.is_some_and(|value| self.status.set_acquiring(value)))
    }

    /// Go back to `previous` after a failed step, unless the device has
    /// disconnected since.
    fn revert(&self, previous: Phase) {
        let mut st = self.lock();
        if st.phase != Phase::Disconnected {
            debug!("phase -> {previous}");
            st.phase = previous;
        }
    }

    fn set_phase(&self, phase: Phase) {
        debug!("phase -> {phase}");
        self.lock().phase = phase;
    }

    fn add_pending(&self, token: String) {
        self.lock().pending.push(token);
    }
}

// ============================================================================
// Shell reader
// ============================================================================

/// Splits a byte stream into text lines on `\r`, `\n` or NUL.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' || byte == b'\r' || byte == 0 {
                if !self.partial.is_empty() {
                    lines.push(self.take());
                }
                continue;
            }
            self.partial.push(byte);
            if self.partial.len() >= MAX_LINE_LEN {
                lines.push(self.take());
            }
        }
        lines
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        line
    }
}

/// A background link reader that can be stopped and joined.
pub struct ReaderHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the reader to stop and wait for it. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} thread panicked", self.name);
            } else {
                debug!("{} closed", self.name);
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns true for read errors that only mean "no data yet".
pub(crate) fn is_idle_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Spawn the thread feeding shell lines into `protocol`.
///
/// The reader must time out periodically so the thread can observe `close`.
pub fn spawn_shell_reader(
    mut reader: Box<dyn Read + Send>,
    protocol: Arc<ShellProtocol>,
) -> Result<ReaderHandle> {
    ReaderHandle::spawn("shell-reader", move |stop| {
        let mut lines = LineBuffer::default();
        let mut buf = [0u8; 256];
        while !stop.load(Ordering::SeqCst) {
            match reader.read(&mut buf) {
                Ok(0) => {
                    if !stop.load(Ordering::SeqCst) {
                        protocol.handle_link_error(&io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "shell link closed",
                        ));
                    }
                    break;
                }
                Ok(n) => {
                    for line in lines.push(&buf[..n]) {
                        protocol.handle_line(&line);
                    }
                }
                Err(e) if is_idle_read(&e) => {}
                Err(e) => {
                    protocol.handle_link_error(&e);
                    break;
                }
            }
        }
    })
}

// ============================================================================
// Handshake driver
// ============================================================================

/// Drives the device session from the orchestrating thread.
pub struct Handshake {
    writer: Box<dyn Write + Send>,
    protocol: Arc<ShellProtocol>,
    events: Arc<dyn ShellEvents>,
    config: HandshakeConfig,
}

impl Handshake {
    pub fn new(
        writer: Box<dyn Write + Send>,
        protocol: Arc<ShellProtocol>,
        events: Arc<dyn ShellEvents>,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            writer,
            protocol,
            events,
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.protocol.phase()
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        self.protocol.status()
    }

    pub fn protocol(&self) -> &Arc<ShellProtocol> {
        &self.protocol
    }

    /// Send WHO and wait for the identity banner.
    pub fn validate(&mut self) -> Result<()> {
        if self.protocol.is_validated() {
            self.protocol.set_phase(Phase::Validated);
            return Ok(());
        }
        let timeout = self.config.validate_timeout;
        self.step(
            Phase::Validating,
            Phase::Validated,
            CMD_WHO,
            Awaiting::Identity,
            timeout,
            "WHO",
            None,
        )
    }

    /// Send CONNECT, retrying timed-out attempts with exponential backoff.
    pub fn connect(&mut self) -> Result<()> {
        self.require("CONNECT", |p| matches!(p, Phase::Validated | Phase::Disconnected))?;

        let attempts = self.config.connect_attempts.max(1);
        let mut delay = self.config.retry_delay;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connect_once() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => {
                    warn!("CONNECT attempt {attempt}/{attempts} failed: {e}");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                thread::sleep(delay);
                delay = delay.mul_f64(self.config.retry_backoff);
            }
        }

        Err(last_error.unwrap_or_else(|| DriverError::Protocol("CONNECT not attempted".into())))
    }

    fn connect_once(&mut self) -> Result<()> {
        if self.protocol.is_connected() {
            // acknowledged after the previous attempt had already timed out
            self.protocol.set_phase(Phase::Connected);
            return Ok(());
        }
        let timeout = self.config.connect_timeout;
        self.step(
            Phase::Connecting,
            Phase::Connected,
            CMD_CONNECT,
            Awaiting::Connected,
            timeout,
            "CONNECT",
            None,
        )
    }

    /// Initialise one module. No retry: a timeout aborts the sequence.
    ///
    /// On success the module's start token is queued for [`Handshake::start`].
    pub fn init_module(&mut self, module: &str, args: &[String]) -> Result<()> {
        self.require("INIT", |p| matches!(p, Phase::Connected | Phase::Initialized))?;

        let command = init_command(module, args);
        let timeout = self.config.init_timeout;
        self.step(
            Phase::Initializing(module.to_string()),
            Phase::Initialized,
            &command,
            Awaiting::InitOk,
            timeout,
            &format!("INIT {module}"),
            None,
        )?;
        self.protocol.add_pending(start_token(module));
        Ok(())
    }

    /// Send START and wait until every queued module token has been echoed.
    pub fn start(&mut self) -> Result<()> {
        self.require("START", |p| {
            matches!(p, Phase::Connected | Phase::Initialized | Phase::Stopped)
        })?;

        let timeout = self.config.start_timeout;
        self.step(
            Phase::Starting,
            Phase::Streaming,
            CMD_START,
            Awaiting::StartTokens,
            timeout,
            "START",
            Some(true),
        )
    }

    /// Send STOP and wait for `DONE`.
    pub fn stop(&mut self) -> Result<()> {
        self.require("STOP", |p| matches!(p, Phase::Streaming))?;

        let timeout = self.config.stop_timeout;
        self.step(
            Phase::Stopping,
            Phase::Stopped,
            CMD_STOP,
            Awaiting::Done,
            timeout,
            "STOP",
            Some(false),
        )
    }

    /// Send DISCONNECT. Waits for `>DISCONNECTED` only if the shell reported
    /// a connection.
    pub fn disconnect(&mut self) -> Result<()> {
        let was_connected = self.protocol.is_connected();
        let previous = self.protocol.phase();

        if !was_connected {
            self.protocol.set_phase(Phase::Disconnecting);
            let sent = self.send(CMD_DISCONNECT);
            self.protocol.set_phase(Phase::Disconnected);
            self.set_acquiring(false);
            return sent;
        }

        let timeout = self.config.disconnect_timeout;
        let result = self.step(
            Phase::Disconnecting,
            Phase::Disconnected,
            CMD_DISCONNECT,
            Awaiting::Disconnected,
            timeout,
            "DISCONNECT",
            None,
        );
        if result.is_err() {
            warn!("no disconnect acknowledgement (was {previous})");
        }
        self.set_acquiring(false);
        result
    }

    fn require(&self, step: &str, allowed: impl Fn(&Phase) -> bool) -> Result<()> {
        let phase = self.protocol.phase();
        if allowed(&phase) {
            Ok(())
        } else {
            Err(DriverError::Protocol(format!("cannot {step} while {phase}")))
        }
    }

    /// Arm, send, wait. On failure the phase reverts to where it was.
    ///
    /// A `>DISCONNECTED` seen before the phase advances turns success into
    /// [`DriverError::LinkClosed`]; `acquiring` is only applied on success.
    #[allow(clippy::too_many_arguments)]
    fn step(
        &mut self,
        during: Phase,
        after: Phase,
        command: &str,
        awaiting: Awaiting,
        timeout: Duration,
        label: &str,
        acquiring: Option<bool>,
    ) -> Result<()> {
        let previous = self.protocol.phase();
        self.protocol.arm(awaiting, during)?;

        let outcome = match self.send(command) {
            Ok(()) => self.protocol.wait(label, timeout),
            Err(e) => {
                self.protocol.disarm();
                Err(e)
            }
        };

        let outcome = outcome.and_then(|()| self.protocol.finish(label, after, acquiring));
        match outcome {
            Ok(changed) => {
                info!("[ACK] {label}");
                if changed {
                    self.announce_acquisition(acquiring == Some(true));
                }
                Ok(())
            }
            Err(e) => {
                warn!("{label} failed: {e}");
                self.protocol.revert(previous);
                Err(e)
            }
        }
    }

    fn send(&mut self, command: &str) -> Result<()> {
        debug!("shell -> {}", command.trim_end());
        self.writer.write_all(command.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn set_acquiring(&self, acquiring: bool) {
        if self.protocol.status.set_acquiring(acquiring) {
            self.announce_acquisition(acquiring);
        }
    }

    fn announce_acquisition(&self, acquiring: bool) {
        info!("acquisition {}", if acquiring { "started" } else { "stopped" });
        self.events.on_acquisition_changed(acquiring);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{happy_device, mock_shell, sent, MockShell};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        validated: AtomicUsize,
        device_disconnects: AtomicUsize,
        link_errors: AtomicUsize,
        connection: Mutex<Vec<bool>>,
        acquisition: Mutex<Vec<bool>>,
    }

    impl ShellEvents for Recorder {
        fn on_validated(&self) {
            self.validated.fetch_add(1, Ordering::SeqCst);
        }
        fn on_device_disconnected(&self) {
            self.device_disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn on_link_error(&self, _error: &io::Error) {
            self.link_errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_connection_changed(&self, connected: bool) {
            self.connection.lock().unwrap().push(connected);
        }
        fn on_acquisition_changed(&self, acquiring: bool) {
            self.acquisition.lock().unwrap().push(acquiring);
        }
    }

    fn fast_config() -> HandshakeConfig {
        HandshakeConfig {
            validate_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(150),
            retry_delay: Duration::from_millis(10),
            init_timeout: Duration::from_millis(300),
            start_timeout: Duration::from_millis(300),
            stop_timeout: Duration::from_millis(300),
            disconnect_timeout: Duration::from_millis(300),
            ..HandshakeConfig::default()
        }
    }

    struct Rig {
        handshake: Handshake,
        events: Arc<Recorder>,
        reader: ReaderHandle,
        shell: MockShellParts,
    }

    struct MockShellParts {
        device: crate::test_support::DeviceHandle,
        sent: Arc<Mutex<Vec<String>>>,
    }

    fn rig(shell: MockShell) -> Rig {
        let events = Arc::new(Recorder::default());
        let protocol = Arc::new(ShellProtocol::new(IDENTITY_MARKER, events.clone()));
        let reader = spawn_shell_reader(Box::new(shell.reader), protocol.clone()).unwrap();
        let handshake = Handshake::new(Box::new(shell.writer), protocol, events.clone(), fast_config());
        Rig {
            handshake,
            events,
            reader,
            shell: MockShellParts {
                device: shell.device,
                sent: shell.sent,
            },
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn full_session_without_timeouts() {
        let mut rig = rig(mock_shell(happy_device(&["ECG"])));
        let hs = &mut rig.handshake;
        assert_eq!(hs.phase(), Phase::Idle);

        hs.validate().unwrap();
        assert_eq!(hs.phase(), Phase::Validated);

        hs.connect().unwrap();
        assert_eq!(hs.phase(), Phase::Connected);
        assert!(hs.status().device_connected());

        hs.init_module("ECG", &args(&["1", "250", "3", "01"])).unwrap();
        assert_eq!(hs.phase(), Phase::Initialized);
        assert_eq!(hs.protocol().pending_tokens(), vec!["ECG OK"]);

        hs.start().unwrap();
        assert_eq!(hs.phase(), Phase::Streaming);
        assert!(hs.status().acquiring());
        assert!(hs.protocol().pending_tokens().is_empty());

        hs.stop().unwrap();
        assert_eq!(hs.phase(), Phase::Stopped);
        assert!(!hs.status().acquiring());

        hs.disconnect().unwrap();
        assert_eq!(hs.phase(), Phase::Disconnected);
        assert!(!hs.status().device_connected());

        assert_eq!(
            sent(&rig.shell.sent),
            vec![
                "who",
                "connect 0",
                "rem ecg 1 250 3 01",
                "rem start",
                "rem stop",
                "disconnect"
            ]
        );
        assert_eq!(rig.events.validated.load(Ordering::SeqCst), 1);
        assert_eq!(*rig.events.connection.lock().unwrap(), vec![true, false]);
        assert_eq!(*rig.events.acquisition.lock().unwrap(), vec![true, false]);
        rig.reader.close();
    }

    #[test]
    fn start_waits_for_every_module_token() {
        // the device echoes module tokens one at a time, ECG last
        let script = {
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd == "rem start" {
                    vec!["PPG OK".into(), "started".into(), "ECG OK".into()]
                } else {
                    inner(cmd)
                }
            }
        };
        let mut rig = rig(mock_shell(script));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        hs.connect().unwrap();
        hs.init_module("PPG", &args(&["1"])).unwrap();
        hs.init_module("ECG", &args(&["1"])).unwrap();
        assert_eq!(hs.protocol().pending_tokens(), vec!["PPG OK", "ECG OK"]);
        hs.start().unwrap();
        assert_eq!(hs.phase(), Phase::Streaming);
    }

    #[test]
    fn start_times_out_while_tokens_are_missing() {
        let script = {
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd == "rem start" {
                    vec!["PPG OK".into()]
                } else {
                    inner(cmd)
                }
            }
        };
        let mut rig = rig(mock_shell(script));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        hs.connect().unwrap();
        hs.init_module("PPG", &args(&["1"])).unwrap();
        hs.init_module("ECG", &args(&["1"])).unwrap();
        let err = hs.start().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(hs.phase(), Phase::Initialized);
        assert_eq!(hs.protocol().pending_tokens(), vec!["ECG OK"]);
        assert!(!hs.status().acquiring());
    }

    #[test]
    fn connect_succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let script = {
            let attempts = attempts.clone();
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd == "connect 0" {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        return Vec::new();
                    }
                }
                inner(cmd)
            }
        };
        let mut rig = rig(mock_shell(script));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();

        let started = Instant::now();
        hs.connect().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(hs.phase(), Phase::Connected);
        // two timeouts plus the 10 ms and 16 ms backoff sleeps
        assert!(started.elapsed() >= Duration::from_millis(300 + 26));
    }

    #[test]
    fn connect_gives_up_after_attempt_budget() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let script = {
            let attempts = attempts.clone();
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd == "connect 0" {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    return Vec::new();
                }
                inner(cmd)
            }
        };
        let mut rig = rig(mock_shell(script));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();

        let err = hs.connect().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(hs.phase(), Phase::Validated);
        assert!(!hs.status().device_connected());
    }

    #[test]
    fn validation_times_out_without_banner() {
        let mut rig = rig(mock_shell(|_cmd: &str| vec!["garbage".to_string()]));
        let err = rig.handshake.validate().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(rig.handshake.phase(), Phase::Idle);
    }

    #[test]
    fn validation_marker_is_case_insensitive() {
        let mut rig = rig(mock_shell(|_cmd: &str| vec!["Zephyr SHELL v3".to_string()]));
        rig.handshake.validate().unwrap();
        assert_eq!(rig.handshake.phase(), Phase::Validated);
    }

    #[test]
    fn init_timeout_is_not_retried() {
        let script = {
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd.starts_with("rem temp") {
                    Vec::new()
                } else {
                    inner(cmd)
                }
            }
        };
        let mut rig = rig(mock_shell(script));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        hs.connect().unwrap();
        let err = hs.init_module("TEMP", &args(&["1"])).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(hs.phase(), Phase::Connected);
        assert!(hs.protocol().pending_tokens().is_empty());
        let inits = sent(&rig.shell.sent)
            .into_iter()
            .filter(|c| c.starts_with("rem temp"))
            .count();
        assert_eq!(inits, 1);
    }

    #[test]
    fn steps_out_of_order_are_rejected() {
        let mut rig = rig(mock_shell(happy_device(&[])));
        let hs = &mut rig.handshake;
        assert!(matches!(hs.connect(), Err(DriverError::Protocol(_))));
        assert!(matches!(hs.start(), Err(DriverError::Protocol(_))));
        assert!(matches!(hs.stop(), Err(DriverError::Protocol(_))));
        assert!(sent(&rig.shell.sent).is_empty());
    }

    #[test]
    fn device_initiated_disconnect_flips_status() {
        let mut rig = rig(mock_shell(happy_device(&["ECG"])));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        hs.connect().unwrap();
        hs.init_module("ECG", &args(&["1"])).unwrap();
        hs.start().unwrap();
        let status = hs.status();

        rig.shell.device.send_line(">DISCONNECTED");
        let deadline = Instant::now() + Duration::from_secs(2);
        while rig.events.device_disconnects.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!status.device_connected());
        assert!(!status.acquiring());
        assert_eq!(rig.handshake.phase(), Phase::Disconnected);
        assert_eq!(rig.events.device_disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(rig.handshake.stop(), Err(DriverError::Protocol(_))));
    }

    fn wait_for_device_disconnect(events: &Recorder) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while events.device_disconnects.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(events.device_disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_right_after_start_ack_is_not_overwritten() {
        // the ack and the disconnect race the waiting thread; repeat to hit both orders
        for _ in 0..20 {
            let script = {
                let mut inner = happy_device(&["ECG"]);
                move |cmd: &str| {
                    if cmd == "rem start" {
                        vec!["ECG OK".into(), ">DISCONNECTED".into()]
                    } else {
                        inner(cmd)
                    }
                }
            };
            let mut rig = rig(mock_shell(script));
            let hs = &mut rig.handshake;
            hs.validate().unwrap();
            hs.connect().unwrap();
            hs.init_module("ECG", &args(&["1"])).unwrap();
            match hs.start() {
                Ok(()) | Err(DriverError::LinkClosed(_)) => {}
                Err(e) => panic!("unexpected START outcome: {e}"),
            }

            wait_for_device_disconnect(&rig.events);
            let status = rig.handshake.status();
            assert_eq!(rig.handshake.phase(), Phase::Disconnected);
            assert!(!status.acquiring());
            assert!(!status.device_connected());
            assert!(matches!(rig.handshake.stop(), Err(DriverError::Protocol(_))));
            rig.reader.close();
        }
    }

    #[test]
    fn device_disconnect_interrupts_a_pending_start() {
        let script = {
            let mut inner = happy_device(&["ECG"]);
            move |cmd: &str| {
                if cmd == "rem start" {
                    vec![">DISCONNECTED".into()]
                } else {
                    inner(cmd)
                }
            }
        };
        let mut rig = rig(mock_shell(script));
        rig.handshake.config.start_timeout = Duration::from_secs(5);
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        hs.connect().unwrap();
        hs.init_module("ECG", &args(&["1"])).unwrap();

        let started = Instant::now();
        let err = hs.start().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!err.is_timeout());
        assert!(matches!(err, DriverError::LinkClosed(_)));
        assert_eq!(hs.phase(), Phase::Disconnected);
        assert!(!hs.status().acquiring());
        assert!(!hs.status().device_connected());
        assert!(rig.events.acquisition.lock().unwrap().is_empty());
    }

    #[test]
    fn disconnect_right_after_connect_ack_ends_disconnected() {
        let script = {
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd == "connect 0" {
                    vec![">CONNECTED".into(), ">DISCONNECTED".into()]
                } else {
                    inner(cmd)
                }
            }
        };
        let mut rig = rig(mock_shell(script));
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        match hs.connect() {
            Ok(()) | Err(DriverError::LinkClosed(_)) => {}
            Err(e) => panic!("unexpected CONNECT outcome: {e}"),
        }

        wait_for_device_disconnect(&rig.events);
        assert_eq!(rig.handshake.phase(), Phase::Disconnected);
        assert!(!rig.handshake.status().device_connected());
        assert!(matches!(
            rig.handshake.init_module("ECG", &args(&["1"])),
            Err(DriverError::Protocol(_))
        ));
    }

    #[test]
    fn link_error_ends_the_wait_early() {
        let script = {
            let mut inner = happy_device(&[]);
            move |cmd: &str| {
                if cmd.starts_with("rem ecg") {
                    Vec::new()
                } else {
                    inner(cmd)
                }
            }
        };
        let mut rig = rig(mock_shell(script));
        rig.handshake.config.init_timeout = Duration::from_secs(5);
        let hs = &mut rig.handshake;
        hs.validate().unwrap();
        hs.connect().unwrap();

        let device = rig.shell.device.clone();
        let failer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            device.fail();
        });

        let started = Instant::now();
        let err = hs.init_module("ECG", &args(&["1"])).unwrap_err();
        assert!(matches!(err, DriverError::LinkClosed(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        failer.join().unwrap();
        assert_eq!(rig.events.link_errors.load(Ordering::SeqCst), 1);
        let deadline = Instant::now() + Duration::from_secs(2);
        while rig.reader.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!rig.reader.is_running());
        assert!(matches!(hs.start(), Err(DriverError::LinkClosed(_))));
    }

    #[test]
    fn disconnect_without_connection_does_not_wait() {
        let mut rig = rig(mock_shell(|_cmd: &str| Vec::new()));
        let started = Instant::now();
        rig.handshake.disconnect().unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(rig.handshake.phase(), Phase::Disconnected);
        assert_eq!(sent(&rig.shell.sent), vec!["disconnect"]);
    }

    #[test]
    fn line_buffer_splits_on_any_terminator() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b">CONN").is_empty());
        assert_eq!(lines.push(b"ECTED\r\nECG OK\n\nDONE\0"), vec![">CONNECTED", "ECG OK", "DONE"]);
        assert!(lines.push(b"\r\n").is_empty());
    }

    #[test]
    fn commands_are_formatted_for_the_shell() {
        assert_eq!(init_command("PPG", &args(&["1", "250", "1", "02", "-1"])), "rem ppg 1 250 1 02 -1\r");
        assert_eq!(start_token("temp"), "TEMP OK");
    }
}
