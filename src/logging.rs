use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

// ── DeferredFileWriter ───────────────────────────────────

type Slot = Arc<Mutex<Option<File>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<File>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A `MakeWriter` that discards writes until a file is attached through its
/// [`DeferredFileHandle`].
///
/// The subscriber is installed before the config is loaded, so the daemon
/// log path under the run root is only known later. Client commands never
/// attach a file.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Slot,
}

#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Slot,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Open `path` in append mode and start writing to it.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

pub struct DeferredWriter {
    inner: Slot,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn discards_until_activated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run").join("flotilla.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!handle.is_active());
        assert!(!path.exists());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();
        writer.make_writer().flush().unwrap();

        assert!(handle.is_active());
        assert_eq!(fs::read_to_string(&path).unwrap(), "kept\n");
    }
}
