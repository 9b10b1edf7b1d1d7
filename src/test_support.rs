//! In-memory serial links for driving the handshake and session in tests.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

const POLL: Duration = Duration::from_millis(5);

type Chunk = std::result::Result<Vec<u8>, io::ErrorKind>;

/// Host side of a link: reads what the fake device sends.
///
/// Behaves like a serial port with a short read timeout: no data yields
/// `TimedOut`, a closed device yields EOF.
pub struct MockReader {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(POLL) {
                Ok(Ok(bytes)) => self.pending = bytes,
                Ok(Err(kind)) => return Err(io::Error::new(kind, "injected link failure")),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Device side handle: push bytes or lines to the host, or fail the link.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: Sender<Chunk>,
}

impl DeviceHandle {
    pub fn send_bytes(&self, bytes: &[u8]) {
        let _ = self.tx.send(Ok(bytes.to_vec()));
    }

    pub fn send_line(&self, line: &str) {
        self.send_bytes(format!("{line}\r\n").as_bytes());
    }

    pub fn fail(&self) {
        let _ = self.tx.send(Err(io::ErrorKind::BrokenPipe));
    }
}

pub fn mock_link() -> (MockReader, DeviceHandle) {
    let (tx, rx) = unbounded();
    (
        MockReader {
            rx,
            pending: Vec::new(),
        },
        DeviceHandle { tx },
    )
}

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// Host side writer that answers every command through a script.
pub struct ScriptedWriter {
    respond: Responder,
    device: DeviceHandle,
    sent: Arc<Mutex<Vec<String>>>,
}

impl Write for ScriptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let command = String::from_utf8_lossy(buf).trim_end().to_string();
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.clone());
        }
        for line in (self.respond)(&command) {
            self.device.send_line(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A scripted shell link: reader, writer, device handle and command log.
pub struct MockShell {
    pub reader: MockReader,
    pub writer: ScriptedWriter,
    pub device: DeviceHandle,
    pub sent: Arc<Mutex<Vec<String>>>,
}

pub fn mock_shell<F>(respond: F) -> MockShell
where
    F: FnMut(&str) -> Vec<String> + Send + 'static,
{
    let (reader, device) = mock_link();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let writer = ScriptedWriter {
        respond: Box::new(respond),
        device: device.clone(),
        sent: sent.clone(),
    };
    MockShell {
        reader,
        writer,
        device,
        sent,
    }
}

/// Replies of a well-behaved device with the given modules initialised.
pub fn happy_device(modules: &'static [&'static str]) -> impl FnMut(&str) -> Vec<String> + Send {
    move |command: &str| {
        let lines: Vec<String> = match command {
            "who" => vec!["uart:~$ shell ready".into()],
            "connect 0" => vec![">CONNECTED".into()],
            "rem start" => modules.iter().map(|m| format!("{m} OK")).collect(),
            "rem stop" => vec!["DONE".into()],
            "disconnect" => vec![">DISCONNECTED".into()],
            other if other.starts_with("rem ") => {
                let module = other[4..].split_whitespace().next().unwrap_or("");
                vec![format!("{} OK", module.to_uppercase())]
            }
            _ => Vec::new(),
        };
        lines
    }
}

pub fn sent(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().map(|v| v.clone()).unwrap_or_default()
}
