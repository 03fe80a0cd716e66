//! Log destination that can be reopened in place.
//!
//! The subscriber writes through a cloneable [`LogDestination`] handle. On
//! SIGHUP the agent calls [`LogDestination::reopen`], which swaps in a fresh
//! file handle for the same path, so external log rotation works without a
//! restart.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

enum Target {
    Stderr,
    File { path: PathBuf, file: File },
}

#[derive(Clone)]
pub struct LogDestination {
    inner: Arc<Mutex<Target>>,
}

impl LogDestination {
    pub fn stderr() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Target::Stderr)),
        }
    }

    /// Append to `path`, creating it if needed.
    pub fn file(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Target::File { path, file })),
        })
    }

    pub fn path(&self) -> Option<PathBuf> {
        match &*self.lock().ok()? {
            Target::Stderr => None,
            Target::File { path, .. } => Some(path.clone()),
        }
    }

    /// Reopen the log file at its configured path. A no-op for stderr.
    pub fn reopen(&self) -> io::Result<()> {
        let mut target = self.lock()?;
        if let Target::File { path, file } = &mut *target {
            *file = open_append(path)?;
        }
        Ok(())
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Target>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("log destination lock poisoned"))
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for LogDestination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.lock()? {
            Target::Stderr => io::stderr().write(buf),
            Target::File { file, .. } => file.write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut *self.lock()? {
            Target::Stderr => io::stderr().write_all(buf),
            Target::File { file, .. } => file.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.lock()? {
            Target::Stderr => io::stderr().flush(),
            Target::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogDestination {
    type Writer = LogDestination;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str, destination: LogDestination) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));
    let ansi = destination.path().is_none();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(destination)
        .init();
}
