//! Result files, one per day a run finished on.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::NaiveDate;
use tracing::debug;

use super::{ResultEntry, ResultLogger};
use crate::{AppError, Result};

/// `results-YYYY-MM-DD.jsonl` inside `dir`.
fn results_file(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("results-{date}.jsonl"))
}

/// The file currently appended to, and the finish date it holds.
struct DayFile {
    date: NaiveDate,
    out: BufWriter<File>,
}

impl DayFile {
    fn open(dir: &Path, date: NaiveDate) -> Result<Self> {
        let path = results_file(dir, date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
        debug!(path = %path.display(), "results file opened");
        Ok(Self {
            date,
            out: BufWriter::new(file),
        })
    }

    /// One entry, one line, flushed before returning.
    fn append(&mut self, entry: &ResultEntry) -> Result<()> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Appends finished runs to `<dir>/results-YYYY-MM-DD.jsonl`.
///
/// The file is chosen by the entry's own finish timestamp, so a run that
/// ends just after midnight lands in the new day's file even if the writer
/// was last used the day before.
pub struct JsonlResultWriter {
    dir: PathBuf,
    current: Mutex<Option<DayFile>>,
}

impl JsonlResultWriter {
    /// Writer storing files in `dir`, which is created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Config(format!(
                "failed to create results directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Path of the file holding runs that finished on `date`.
    #[must_use]
    pub fn file_for_date(&self, date: NaiveDate) -> PathBuf {
        results_file(&self.dir, date)
    }
}

impl ResultLogger for JsonlResultWriter {
    fn log_result(&self, entry: &ResultEntry) -> Result<()> {
        let date = entry.timestamp.date_naive();
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let file = match current.take() {
            Some(file) if file.date == date => file,
            _ => DayFile::open(&self.dir, date)?,
        };
        current.insert(file).append(entry)
    }
}
