//! Process-wide debug level and log destination
//!
//! The level and the optional log file are process globals shared by every
//! store. `init_logging` installs a `tracing` fmt subscriber whose writer
//! consults them on every event, so level and destination changes apply
//! without reinstalling anything.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

use crate::error::{StoreError, StoreResult};

pub const ENV_DEBUG_LEVEL: &str = "KEYHIVE_DEBUG_LEVEL";
pub const ENV_DEBUG_FILE: &str = "KEYHIVE_DEBUG_FILE";

/// Verbosity of the engine's diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DebugLevel {
    Silent = 0,
    Error = 1,
    Warning = 2,
    Message = 3,
    Dump = 4,
}

impl DebugLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DebugLevel::Error,
            2 => DebugLevel::Warning,
            3 => DebugLevel::Message,
            4 => DebugLevel::Dump,
            _ => DebugLevel::Silent,
        }
    }

    /// Next level in the cycle Silent, Error, Warning, Message, Dump, Silent.
    pub fn next(self) -> Self {
        DebugLevel::from_u8((self as u8 + 1) % 5)
    }

    /// Whether events of `level` pass at this verbosity.
    pub fn allows(self, level: &Level) -> bool {
        let needed = if *level == Level::ERROR {
            DebugLevel::Error
        } else if *level == Level::WARN {
            DebugLevel::Warning
        } else if *level == Level::INFO {
            DebugLevel::Message
        } else {
            DebugLevel::Dump
        };
        self != DebugLevel::Silent && self >= needed
    }
}

impl std::str::FromStr for DebugLevel {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" | "slt" | "off" => Ok(DebugLevel::Silent),
            "error" | "err" => Ok(DebugLevel::Error),
            "warning" | "wan" | "warn" => Ok(DebugLevel::Warning),
            "message" | "msg" | "info" => Ok(DebugLevel::Message),
            "dump" | "debug" => Ok(DebugLevel::Dump),
            other => Err(StoreError::Config(format!("unknown debug level '{}'", other))),
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(DebugLevel::Error as u8);
static DEBUG_FILE: Mutex<Option<File>> = parking_lot::const_mutex(None);
static INSTALLED: OnceLock<bool> = OnceLock::new();

pub fn set_debug_level(level: DebugLevel) {
    LEVEL.store(level as u8, Ordering::Release);
}

pub fn debug_level() -> DebugLevel {
    DebugLevel::from_u8(LEVEL.load(Ordering::Acquire))
}

/// Advance the level one step and return the new level.
pub fn bump_debug_level() -> DebugLevel {
    let previous = LEVEL
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(DebugLevel::from_u8(v).next() as u8))
        .unwrap_or_else(|v| v);
    DebugLevel::from_u8(previous).next()
}

/// Send diagnostics to `path` (appending) instead of stderr.
pub fn set_debug_file(path: &Path) -> StoreResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io_at(path, &e, "failed to open debug file"))?;
    let previous = DEBUG_FILE.lock().replace(file);
    if let Some(mut f) = previous {
        let _ = f.flush();
    }
    Ok(())
}

/// Send diagnostics back to stderr.
pub fn unset_debug_file() {
    if let Some(mut f) = DEBUG_FILE.lock().take() {
        let _ = f.flush();
    }
}

/// Apply `KEYHIVE_DEBUG_LEVEL` and `KEYHIVE_DEBUG_FILE` when set.
pub fn load_debug_env() -> StoreResult<()> {
    if let Ok(raw) = std::env::var(ENV_DEBUG_LEVEL) {
        set_debug_level(raw.parse()?);
    }
    if let Some(path) = std::env::var_os(ENV_DEBUG_FILE).filter(|p| !p.is_empty()) {
        set_debug_file(Path::new(&path))?;
    }
    Ok(())
}

/// Install the global subscriber. Returns false when a subscriber was
/// already installed, by this function or by the application.
pub fn init_logging() -> bool {
    *INSTALLED.get_or_init(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_writer(DebugWriter)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    })
}

/// Silence diagnostics and close the debug file.
pub fn shutdown_logging() {
    set_debug_level(DebugLevel::Silent);
    unset_debug_file();
}

/// Bump the level on every SIGUSR1.
#[cfg(unix)]
pub fn install_bump_signal() -> StoreResult<()> {
    extern "C" fn on_signal(_: libc::c_int) {
        // atomics only; anything else is unsafe in a signal handler
        let _ = LEVEL.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(DebugLevel::from_u8(v).next() as u8)
        });
    }

    let handler = on_signal as extern "C" fn(libc::c_int);
    let previous = unsafe { libc::signal(libc::SIGUSR1, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        let e = io::Error::last_os_error();
        return Err(StoreError::Io {
            path: None,
            kind: e.kind(),
            message: format!("failed to install SIGUSR1 handler: {}", e),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_bump_signal() -> StoreResult<()> {
    Err(StoreError::Config("level bump signal needs a unix platform".into()))
}

/// Routes each event to the debug file or stderr, dropping it when the
/// current level filters it out.
struct DebugWriter;

enum DebugSink<'a> {
    Discard,
    Stderr(io::Stderr),
    File(MutexGuard<'a, Option<File>>),
}

impl Write for DebugSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DebugSink::Discard => Ok(buf.len()),
            DebugSink::Stderr(s) => s.write(buf),
            DebugSink::File(guard) => match guard.as_mut() {
                Some(f) => f.write(buf),
                None => io::stderr().write(buf),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            DebugSink::Discard => Ok(()),
            DebugSink::Stderr(s) => s.flush(),
            DebugSink::File(guard) => guard.as_mut().map_or(Ok(()), |f| f.flush()),
        }
    }
}

impl<'a> MakeWriter<'a> for DebugWriter {
    type Writer = DebugSink<'static>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = DEBUG_FILE.lock();
        if guard.is_some() {
            DebugSink::File(guard)
        } else {
            DebugSink::Stderr(io::stderr())
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        if !debug_level().allows(meta.level()) {
            return DebugSink::Discard;
        }
        self.make_writer()
    }
}
