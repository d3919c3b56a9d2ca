// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide logging setup.
//!
//! Code logs through the `log` facade (re-exported from this crate as `base::error!` and friends).
//! Every macro is a no-op until `syslog::init()` installs the backend, which is an `env_logger`
//! instance writing to stderr or to a caller-supplied pipe.
//!
//! # Examples
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! if let Err(e) = syslog::init() {
//!     println!("failed to initialize logging: {}", e);
//!     return;
//! }
//! warn!("this is your {} warning", "final");
//! ```

use std::env;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Once;

use remain::sorted;
use sync::Mutex;
use thiserror::Error as ThisError;

/// The severity of a log message, named the way syslog names them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Priority {
    Error = 3,
    Warning = 4,
    Info = 6,
    Debug = 7,
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Priority::*;

        let string = match self {
            Error => "ERROR",
            Warning => "WARNING",
            Info => "INFO",
            Debug => "DEBUG",
        };

        write!(f, "{}", string)
    }
}

impl From<log::Level> for Priority {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Priority::Error,
            log::Level::Warn => Priority::Warning,
            log::Level::Info => Priority::Info,
            log::Level::Debug => Priority::Debug,
            log::Level::Trace => Priority::Debug,
        }
    }
}

/// Errors returned by `syslog::init()`.
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// Initialization has previously failed and can not be retried.
    #[error("initialization previously failed and cannot be retried")]
    Poisoned,
    /// Another logger was installed before this one.
    #[error("failed to install the logger: {0}")]
    SetLogger(log::SetLoggerError),
}

/// Logger configuration.
pub struct LogConfig {
    /// An `env_logger` filter string such as `info,hypervisor=debug`. `RUST_LOG` is used when
    /// this is `None`, and `info` when neither is set.
    pub filter: Option<String>,
    /// Name prefixed to every line. Defaults to the executable name.
    pub proc_name: Option<String>,
    /// Destination other than stderr.
    pub pipe: Option<Box<dyn Write + Send>>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: None,
            proc_name: None,
            pipe: None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initialized,
    Failed,
}

static INIT_ONCE: Once = Once::new();
static STATE: Mutex<State> = Mutex::new(State::Uninitialized);

fn get_proc_name() -> Option<String> {
    env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|s| s.file_name().map(OsStr::to_os_string))
        .map(OsString::into_string)
        .and_then(Result::ok)
}

/// Initialize logging with the default configuration.
pub fn init() -> Result<(), Error> {
    init_with(LogConfig::default())
}

/// Initialize logging.
///
/// Only the first call has an effect; later calls report whether that first call succeeded.
pub fn init_with(cfg: LogConfig) -> Result<(), Error> {
    let mut first_err = None;
    INIT_ONCE.call_once(|| {
        let filter = cfg
            .filter
            .or_else(|| env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info".to_string());
        let proc_name = cfg
            .proc_name
            .or_else(get_proc_name)
            .unwrap_or_else(|| "accelvm".to_string());

        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&filter);
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "[{} {}:{} {}:{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.9fZ"),
                proc_name,
                Priority::from(record.level()),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        });
        if let Some(pipe) = cfg.pipe {
            builder.target(env_logger::Target::Pipe(pipe));
        }

        *STATE.lock() = match builder.try_init() {
            Ok(()) => State::Initialized,
            Err(e) => {
                first_err = Some(Error::SetLogger(e));
                State::Failed
            }
        };
    });

    if let Some(e) = first_err {
        return Err(e);
    }
    match *STATE.lock() {
        State::Initialized => Ok(()),
        State::Uninitialized | State::Failed => Err(Error::Poisoned),
    }
}

/// Makes sure logging is initialized for tests. Safe to call from every test.
pub fn test_only_ensure_inited() -> Result<(), Error> {
    init_with(LogConfig {
        filter: Some("debug".to_string()),
        proc_name: Some("test".to_string()),
        pipe: None,
    })
}
