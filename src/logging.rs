//! Log initialisation.
//!
//! Binaries install `env_logger` on stderr. The Python extension instead
//! forwards every `log` record into Python's `logging` module so records from
//! the reader threads show up under `iitdaq.*` loggers.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

/// Crate-specific level override, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "IITDAQ_LOG";

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

/// Parse `off`, `error` .. `trace` (any case).
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Install the stderr logger for the CLI, levelled by `IITDAQ_LOG`/`RUST_LOG`.
/// Later calls are no-ops.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_name(level));
        let installed = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
        if installed.is_err() {
            log::debug!("a logger was already installed");
        }
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level_str};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, Once, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static BRIDGE: OnceCell<&'static PythonLogBridge> = OnceCell::new();

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    struct CachedLogger {
        enabled_up_to: LevelFilter,
        logger: Py<PyAny>,
    }

    struct PythonLogBridge {
        ceiling: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        /// Python logger per Rust target (`iitdaq::session` -> `iitdaq.session`).
        loggers: Mutex<HashMap<String, CachedLogger>>,
    }

    impl PythonLogBridge {
        fn new(py: Python<'_>, ceiling: LevelFilter) -> PyResult<Self> {
            Ok(Self {
                ceiling: Mutex::new(ceiling),
                logging: py.import("logging")?.unbind(),
                loggers: Mutex::new(HashMap::new()),
            })
        }

        fn python_level(level: Level) -> u32 {
            match level {
                Level::Error => 40,
                Level::Warn => 30,
                Level::Info => 20,
                Level::Debug => 10,
                Level::Trace => 5,
            }
        }

        fn enabled_up_to(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (Self::python_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            let mut loggers = lock(&self.loggers);
            if let Some(cached) = loggers.get(target) {
                return Ok((cached.enabled_up_to, cached.logger.clone_ref(py)));
            }
            let logger = self.logging.bind(py).call_method1("getLogger", (target,))?;
            let enabled_up_to = Self::enabled_up_to(&logger)?;
            let logger = logger.unbind();
            loggers.insert(
                target.to_string(),
                CachedLogger {
                    enabled_up_to,
                    logger: logger.clone_ref(py),
                },
            );
            Ok((enabled_up_to, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (enabled_up_to, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > enabled_up_to || level > *lock(&self.ceiling) {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    Self::python_level(record.level()),
                    record.file().unwrap_or("<rust>"),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }
    }

    impl Log for PythonLogBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= *lock(&self.ceiling)
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn install(py: Python<'_>, level: LevelFilter) {
        PY_LOG_ONCE.call_once(|| match PythonLogBridge::new(py, level) {
            Ok(bridge) => {
                let bridge: &'static PythonLogBridge = Box::leak(Box::new(bridge));
                if log::set_logger(bridge).is_ok() {
                    log::set_max_level(level);
                    let _ = BRIDGE.set(bridge);
                }
            }
            Err(e) => e.restore(py),
        });
    }

    /// Route Rust log records into Python `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        install(py, env_level());
        Ok(())
    }

    /// Forget cached Python loggers, e.g. after `logging.basicConfig`.
    pub fn reset_python_logging_cache() {
        if let Some(bridge) = BRIDGE.get() {
            lock(&bridge.loggers).clear();
        }
    }

    /// Set the forwarding ceiling from a level name, or from the environment
    /// when `level` is `None` or unparseable.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        install(py, level);
        if let Some(bridge) = BRIDGE.get() {
            *lock(&bridge.ceiling) = level;
        }
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}
