//! Process log file that can be moved into a run directory between jobs.
//!
//! The handle is cheap to clone; every clone writes into whichever file is
//! currently open at `path`. `rotate_into` swaps the open file under the same
//! lock the writers use, so no line is split across the old and new files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves everything logged so far to `dest` and starts a fresh file.
    pub fn rotate_into(&self, dest: &Path) -> io::Result<()> {
        let mut guard = self.lock();
        guard.flush()?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&self.path, dest).is_err() {
            // rename fails across filesystems
            fs::copy(&self.path, dest)?;
            fs::remove_file(&self.path)?;
        }
        *guard = open_append(&self.path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_moves_history_and_keeps_writing() {
        let root = std::env::temp_dir().join(format!(
            "bench_logfile_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let path = root.join("proc").join("stdout.log");
        let mut log = LogFile::open(&path).expect("open");
        writeln!(log, "before rotation").expect("write");

        let dest = root.join("run").join("stdout.log");
        log.clone().rotate_into(&dest).expect("rotate");
        writeln!(log, "after rotation").expect("write");
        log.flush().expect("flush");

        let moved = fs::read_to_string(&dest).expect("moved file");
        let fresh = fs::read_to_string(&path).expect("fresh file");
        assert_eq!(moved, "before rotation\n");
        assert_eq!(fresh, "after rotation\n");
        let _ = fs::remove_dir_all(root);
    }
}
