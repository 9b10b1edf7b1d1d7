//! Python bindings (`iitdaq._core`).

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::channels::{ChannelRegistry, ChannelTable};
use crate::codec;
use crate::errors::DriverError;
use crate::handshake::NoEvents;
use crate::logging;
use crate::serial::{self, PortConfig, SerialLinks, PORT_CONFIG_FILE};
use crate::session::{Acquisition, DecodedBlock, SessionConfig};

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> Self {
        let msg = e.to_string();
        match e {
            DriverError::Timeout { .. } => PyTimeoutError::new_err(msg),
            DriverError::Io(_) | DriverError::Serial(_) | DriverError::LinkClosed(_) => PyIOError::new_err(msg),
            DriverError::Protocol(_) => PyRuntimeError::new_err(msg),
            DriverError::Json(_)
            | DriverError::Config(_)
            | DriverError::UnknownChannel(_)
            | DriverError::UnknownVariant { .. }
            | DriverError::HeaderConflict { .. } => PyValueError::new_err(msg),
        }
    }
}

// ============================================================================
// Codec functions
// ============================================================================

/// Number of 16-bit words per row for `channels` samples of `bits` width.
#[pyfunction]
#[pyo3(name = "wire_columns")]
fn py_wire_columns(channels: usize, bits: u8) -> usize {
    codec::wire_columns(channels, bits)
}

/// The unique bit width producing `columns` words for `channels`, or None.
#[pyfunction]
#[pyo3(name = "infer_bit_width")]
fn py_infer_bit_width(channels: usize, columns: usize) -> Option<u8> {
    codec::infer_bit_width(channels, columns)
}

/// Decode a packet payload into rows of integer samples.
///
/// Args:
///     payload: Little-endian 16-bit words, `rows * wire_columns * 2` bytes.
///     channels: Samples per row.
///     bits: 16, 20, 24 or 32. Other values decode as signed 16-bit.
///     signed: Sign-extend samples (default True).
#[pyfunction]
#[pyo3(name = "decode_payload", signature = (payload, channels, bits=16, signed=true))]
fn py_decode_payload(payload: &[u8], channels: usize, bits: u8, signed: bool) -> Vec<Vec<i32>> {
    codec::decode_payload(payload, channels, bits, signed)
}

/// List serial ports as dicts with `device`, `description` and `hwid`.
#[pyfunction]
#[pyo3(name = "available_ports")]
fn py_available_ports(py: Python<'_>) -> PyResult<Vec<Bound<'_, PyDict>>> {
    serial::available_ports()?
        .into_iter()
        .map(|port| {
            let dict = PyDict::new(py);
            dict.set_item("device", port.device)?;
            dict.set_item("description", port.description)?;
            dict.set_item("hwid", port.hwid)?;
            Ok(dict)
        })
        .collect()
}

/// Route Rust logs into Python `logging` at `level` (default: from IITDAQ_LOG).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

/// Drop cached Python loggers after reconfiguring `logging`.
#[pyfunction]
fn reset_log_cache() {
    logging::reset_python_logging_cache();
}

// ============================================================================
// Decoded blocks
// ============================================================================

/// One decoded packet.
///
/// Attributes:
///     channel: Channel name, e.g. "ECG".
///     variant: Selected variant at decode time.
///     labels: One label per sample column.
///     rate: Nominal sample rate in Hz.
///     timestamp: Device timestamp in ms (wraps at 65536).
///     eof: End-of-stream flag.
///     frames: Rows of samples.
///     first_sample: Index of the first row since acquisition start.
///     lost_samples: Estimated samples lost just before this block.
#[pyclass(name = "DecodedBlock", frozen)]
#[derive(Clone)]
struct PyDecodedBlock {
    #[pyo3(get)]
    channel: String,
    #[pyo3(get)]
    variant: String,
    #[pyo3(get)]
    labels: Vec<String>,
    #[pyo3(get)]
    rate: u16,
    #[pyo3(get)]
    timestamp: u16,
    #[pyo3(get)]
    eof: bool,
    #[pyo3(get)]
    frames: Vec<Vec<i32>>,
    #[pyo3(get)]
    first_sample: u64,
    #[pyo3(get)]
    lost_samples: i64,
    #[pyo3(get)]
    elapsed_s: f64,
}

#[pymethods]
impl PyDecodedBlock {
    fn __repr__(&self) -> String {
        format!(
            "DecodedBlock(channel={:?}, rows={}, timestamp={}, lost_samples={})",
            self.channel,
            self.frames.len(),
            self.timestamp,
            self.lost_samples
        )
    }

    fn __len__(&self) -> usize {
        self.frames.len()
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("channel", &self.channel)?;
        dict.set_item("variant", &self.variant)?;
        dict.set_item("labels", self.labels.clone())?;
        dict.set_item("rate", self.rate)?;
        dict.set_item("timestamp", self.timestamp)?;
        dict.set_item("eof", self.eof)?;
        dict.set_item("frames", self.frames.clone())?;
        dict.set_item("first_sample", self.first_sample)?;
        dict.set_item("lost_samples", self.lost_samples)?;
        dict.set_item("elapsed_s", self.elapsed_s)?;
        Ok(dict)
    }
}

impl From<DecodedBlock> for PyDecodedBlock {
    fn from(b: DecodedBlock) -> Self {
        let elapsed_s = b.elapsed_s();
        Self {
            channel: b.channel,
            variant: b.variant,
            labels: b.labels,
            rate: b.rate,
            timestamp: b.timestamp,
            eof: b.eof,
            frames: b.frames,
            first_sample: b.first_sample,
            lost_samples: b.lost_samples,
            elapsed_s,
        }
    }
}

// ============================================================================
// Channel registry
// ============================================================================

/// Channel variants, bit widths and selection.
///
/// Example:
///     >>> reg = ChannelRegistry()
///     >>> reg.update("ADC", "2 CH")
///     >>> reg.set_bit_width("ECG", 24)
///     >>> reg.select("ECG")
#[pyclass(name = "ChannelRegistry", frozen)]
struct PyChannelRegistry {
    inner: Arc<ChannelRegistry>,
}

#[pymethods]
impl PyChannelRegistry {
    /// Build from the built-in table or from a JSON channel table.
    #[new]
    #[pyo3(signature = (table_json=None))]
    fn new(table_json: Option<&str>) -> PyResult<Self> {
        let table = match table_json {
            Some(json) => ChannelTable::from_json_str(json)?,
            None => ChannelTable::builtin(),
        };
        Ok(Self {
            inner: Arc::new(ChannelRegistry::new(table)?),
        })
    }

    #[getter]
    fn channels(&self) -> Vec<String> {
        self.inner
            .table()
            .channels
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    fn variants(&self, channel: &str) -> PyResult<Vec<String>> {
        self.inner
            .variants(channel)
            .ok_or_else(|| DriverError::UnknownChannel(channel.to_string()).into())
    }

    fn selected_variant(&self, channel: &str) -> Option<String> {
        self.inner.selected_variant(channel)
    }

    /// Switch `channel` to `variant`. Raises ValueError on unknown names or a
    /// header-id clash.
    fn update(&self, channel: &str, variant: &str) -> PyResult<()> {
        self.inner.update(channel, variant)?;
        Ok(())
    }

    /// Returns False (and changes nothing) for unsupported widths.
    fn set_bit_width(&self, channel: &str, bits: u8) -> bool {
        self.inner.set_bit_width(channel, bits)
    }

    fn bit_width(&self, channel: &str) -> Option<u8> {
        self.inner.bit_width(channel)
    }

    fn select(&self, channel: &str) -> bool {
        self.inner.select(channel)
    }

    fn unselect(&self, channel: &str) -> bool {
        self.inner.unselect(channel)
    }

    fn is_selected(&self, channel: &str) -> bool {
        self.inner.is_selected(channel)
    }

    fn selected_channels(&self) -> Vec<String> {
        self.inner.selected_channels()
    }

    fn __repr__(&self) -> String {
        format!("ChannelRegistry(selected={:?})", self.inner.selected_channels())
    }
}

// ============================================================================
// Acquisition
// ============================================================================

/// A device session over the shell and data serial ports.
///
/// Ports come from the arguments when both are given, otherwise from
/// `config_file` (created with defaults when missing).
///
/// Example:
///     >>> reg = ChannelRegistry(); reg.select("ECG")
///     >>> acq = Acquisition(reg)
///     >>> acq.start()
///     >>> blocks = acq.read(timeout=1.0)
///     >>> acq.stop()
#[pyclass(name = "Acquisition", unsendable)]
struct PyAcquisition {
    registry: Arc<ChannelRegistry>,
    links: SerialLinks,
    session: Option<Acquisition>,
    blocks: Option<Receiver<DecodedBlock>>,
}

#[pymethods]
impl PyAcquisition {
    #[new]
    #[pyo3(signature = (registry, shell_port=None, data_port=None, config_file=None))]
    fn new(
        registry: &PyChannelRegistry,
        shell_port: Option<String>,
        data_port: Option<String>,
        config_file: Option<String>,
    ) -> Self {
        let ports = match (shell_port, data_port) {
            (Some(shell), Some(data)) => PortConfig::new(shell, data),
            _ => PortConfig::load_or_create(config_file.as_deref().unwrap_or(PORT_CONFIG_FILE)),
        };
        Self {
            registry: registry.inner.clone(),
            links: SerialLinks::new(ports),
            session: None,
            blocks: None,
        }
    }

    /// Validate, connect, initialise the selected channels and start streaming.
    ///
    /// Raises:
    ///     TimeoutError: If a handshake step is not acknowledged in time.
    ///     IOError: If a port cannot be opened or the link fails.
    fn start(&mut self, py: Python<'_>) -> PyResult<()> {
        if self.session.is_some() {
            return Err(PyRuntimeError::new_err("acquisition already running"));
        }
        let (tx, rx) = unbounded();
        let sink = move |block: DecodedBlock| {
            let _ = tx.send(block);
        };
        let links = &mut self.links;
        let registry = self.registry.clone();
        // reader threads forward logs into Python and need the GIL
        let session = py.detach(|| {
            Acquisition::start(links, registry, SessionConfig::default(), Arc::new(NoEvents), sink)
        })?;
        self.session = Some(session);
        self.blocks = Some(rx);
        Ok(())
    }

    /// Return decoded blocks received so far, waiting up to `timeout`
    /// seconds for the first one.
    #[pyo3(signature = (max_blocks=None, timeout=0.5))]
    fn read(&self, py: Python<'_>, max_blocks: Option<usize>, timeout: f64) -> PyResult<Vec<PyDecodedBlock>> {
        let Some(rx) = self.blocks.as_ref() else {
            return Ok(Vec::new());
        };
        let limit = max_blocks.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let wait = Duration::try_from_secs_f64(timeout.max(0.0))
            .map_err(|e| PyValueError::new_err(e.to_string()))?;

        let first = py.detach(|| rx.recv_timeout(wait));
        let mut out = match first {
            Ok(block) => vec![PyDecodedBlock::from(block)],
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return Ok(Vec::new()),
        };
        out.extend(rx.try_iter().take(limit - 1).map(PyDecodedBlock::from));
        Ok(out)
    }

    /// Restart sample numbering and loss tracking, for one channel or all.
    ///
    /// Raises:
    ///     ValueError: If `channel` is not in the channel table.
    ///     OSError: If the acquisition is not running.
    #[pyo3(signature = (channel=None))]
    fn reset_continuity(&self, channel: Option<&str>) -> PyResult<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| DriverError::LinkClosed("acquisition is not running".into()))?;
        session.reset_continuity(channel)?;
        Ok(())
    }

    /// Stop streaming and disconnect. Safe to call more than once.
    fn stop(&mut self, py: Python<'_>) -> PyResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let result = py.detach(move || session.shutdown());
        result?;
        Ok(())
    }

    #[getter]
    fn connected(&self) -> bool {
        self.session.as_ref().is_some_and(Acquisition::connected)
    }

    #[getter]
    fn acquiring(&self) -> bool {
        self.session.as_ref().is_some_and(Acquisition::acquiring)
    }

    #[getter]
    fn phase(&self) -> String {
        self.session
            .as_ref()
            .map_or_else(|| "Idle".to_string(), |s| s.phase().to_string())
    }

    /// Frame assembler counters.
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self
            .session
            .as_ref()
            .map(Acquisition::assembler_stats)
            .unwrap_or_default();
        let dict = PyDict::new(py);
        dict.set_item("packets", stats.packets)?;
        dict.set_item("discarded_bytes", stats.discarded_bytes)?;
        dict.set_item("length_mismatches", stats.length_mismatches)?;
        dict.set_item("unknown_headers", stats.unknown_headers)?;
        dict.set_item("width_mismatches", stats.width_mismatches)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "Acquisition(shell={}, data={}, phase={})",
            self.links.ports.shell_port,
            self.links.ports.data_port,
            self.phase()
        )
    }
}

/// The Python module definition
#[pymodule]
#[pyo3(name = "_core")]
fn iitdaq_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;

    m.add_function(wrap_pyfunction!(py_wire_columns, m)?)?;
    m.add_function(wrap_pyfunction!(py_infer_bit_width, m)?)?;
    m.add_function(wrap_pyfunction!(py_decode_payload, m)?)?;
    m.add_function(wrap_pyfunction!(py_available_ports, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(reset_log_cache, m)?)?;
    m.add_class::<PyChannelRegistry>()?;
    m.add_class::<PyAcquisition>()?;
    m.add_class::<PyDecodedBlock>()?;

    m.add("SUPPORTED_BIT_WIDTHS", codec::SUPPORTED_BIT_WIDTHS.to_vec())?;
    m.add("DEFAULT_BIT_WIDTH", codec::DEFAULT_BIT_WIDTH)?;
    m.add("BAUD_RATE", serial::BAUD_RATE)?;

    Ok(())
}
