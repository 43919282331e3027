//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Date-rotated append-only measurement files."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::Result;

/// Opens the file at a path for appending and reports whether it was empty.
pub type Opener<W> = Box<dyn Fn(&Path) -> io::Result<(W, bool)> + Send + Sync>;

/// Appender on `<directory>/<prefix>-YYYYMMDD.<extension>` that switches files
/// when the date changes.
///
/// Every record is rendered completely before it is handed to the file in a
/// single write, so nothing is held back between calls. A failed write closes
/// the file; the next call reopens it.
pub struct DailyFile<W = File> {
    directory: PathBuf,
    prefix: String,
    extension: String,
    open: Opener<W>,
    current: Option<OpenFile<W>>,
}

struct OpenFile<W> {
    date: NaiveDate,
    path: PathBuf,
    writer: W,
}

impl<W> std::fmt::Debug for DailyFile<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyFile")
            .field("directory", &self.directory)
            .field("prefix", &self.prefix)
            .field("extension", &self.extension)
            .field("current", &self.current.as_ref().map(|open| &open.path))
            .finish_non_exhaustive()
    }
}

fn open_append(path: &Path) -> io::Result<(File, bool)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let fresh = file.metadata()?.len() == 0;
    Ok((file, fresh))
}

impl DailyFile<File> {
    /// Rotating file set; the directory is created on first write.
    pub fn new(
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self::with_opener(directory, prefix, extension, Box::new(open_append))
    }
}

impl<W: Write> DailyFile<W> {
    /// Rotating set whose files are opened by `open`.
    pub fn with_opener(
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
        open: Opener<W>,
    ) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            extension: extension.into(),
            open,
            current: None,
        }
    }

    /// Path of the file holding records dated `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory.join(format!(
            "{}-{}.{}",
            self.prefix,
            date.format("%Y%m%d"),
            self.extension
        ))
    }

    /// Path of the currently open file, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|open| open.path.as_path())
    }

    /// Append one record dated `date`. `render` receives `true` when the file
    /// was empty when this call opened it and returns the complete record.
    pub fn append<F>(&mut self, date: NaiveDate, render: F) -> Result<usize>
    where
        F: FnOnce(bool) -> Result<Vec<u8>>,
    {
        let fresh = self.rotate(date)?;
        let record = match render(fresh) {
            Ok(record) => record,
            Err(err) => {
                // keep `fresh` meaningful for the next attempt
                if fresh {
                    self.current = None;
                }
                return Err(err);
            }
        };

        let Some(open) = self.current.as_mut() else {
            return Err(io::Error::other("daily file not open").into());
        };
        if let Err(err) = open.writer.write_all(&record).and_then(|()| open.writer.flush()) {
            warn!(path = %open.path.display(), error = %err, "append failed; file will be reopened");
            self.current = None;
            return Err(err.into());
        }
        Ok(record.len())
    }

    /// Make sure the open file is the one for `date`. Returns whether a newly
    /// opened file was empty. On error the previously open file stays current.
    fn rotate(&mut self, date: NaiveDate) -> Result<bool> {
        if let Some(open) = self.current.as_mut() {
            if open.date == date {
                return Ok(false);
            }
            open.writer.flush()?;
        }
        let path = self.path_for(date);
        let (writer, fresh) = (self.open)(&path)?;
        if let Some(previous) = self.current.replace(OpenFile { date, path, writer }) {
            info!(path = %previous.path.display(), "measurement file rotated");
        }
        Ok(fresh)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FlakyDisk;
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn line(text: &'static str) -> impl FnOnce(bool) -> Result<Vec<u8>> {
        move |_fresh| Ok(format!("{text}\n").into_bytes())
    }

    #[test]
    fn rotates_on_date_change() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut files = DailyFile::new(dir.path().join("out"), "p1", "jsonl");
        let mut fresh = Vec::new();

        for (day, text) in [(1, "a"), (1, "b"), (2, "c")] {
            files.append(date(day), |is_fresh| {
                fresh.push(is_fresh);
                Ok(format!("{text}\n").into_bytes())
            })?;
        }

        assert_eq!(fresh, vec![true, false, true]);
        assert_eq!(fs::read_to_string(files.path_for(date(1)))?, "a\nb\n");
        assert_eq!(fs::read_to_string(files.path_for(date(2)))?, "c\n");
        assert_eq!(
            files.current_path().map(Path::to_path_buf),
            Some(dir.path().join("out").join("p1-20240302.jsonl"))
        );
        Ok(())
    }

    #[test]
    fn reopening_existing_file_is_not_fresh() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = DailyFile::new(dir.path(), "p1", "csv").path_for(date(5));
        fs::write(&path, "header\n")?;

        let mut files = DailyFile::new(dir.path(), "p1", "csv");
        files.append(date(5), |fresh| {
            assert!(!fresh);
            Ok(b"row\n".to_vec())
        })?;
        assert_eq!(fs::read_to_string(&path)?, "header\nrow\n");
        Ok(())
    }

    #[test]
    fn failed_flush_is_not_replayed_by_the_next_append() {
        let disk = FlakyDisk::default();
        let mut files = disk.daily("p1", "jsonl");

        disk.fail_next_flushes(1);
        assert!(files.append(date(1), line("first")).is_err());
        assert!(files.current_path().is_none());
        files.append(date(1), line("first")).unwrap();
        files.append(date(1), line("second")).unwrap();

        assert_eq!(disk.contents(&files.path_for(date(1))), "first\nsecond\n");
    }

    #[test]
    fn rotation_keeps_current_file_when_flush_fails() {
        let disk = FlakyDisk::default();
        let mut files = disk.daily("p1", "jsonl");
        files.append(date(1), line("a")).unwrap();

        disk.fail_next_flushes(1);
        assert!(files.append(date(2), line("b")).is_err());
        assert_eq!(files.current_path(), Some(files.path_for(date(1)).as_path()));

        files.append(date(2), line("b")).unwrap();
        assert_eq!(disk.contents(&files.path_for(date(1))), "a\n");
        assert_eq!(disk.contents(&files.path_for(date(2))), "b\n");
    }

    #[test]
    fn failed_render_of_fresh_file_keeps_header_decision() {
        let disk = FlakyDisk::default();
        let mut files = disk.daily("p1", "csv");

        let err = files.append(date(1), |_fresh| {
            Err(io::Error::other("serializer broke").into())
        });
        assert!(err.is_err());
        files
            .append(date(1), |fresh| {
                assert!(fresh);
                Ok(b"header\nrow\n".to_vec())
            })
            .unwrap();
        assert_eq!(disk.contents(&files.path_for(date(1))), "header\nrow\n");
    }
}
