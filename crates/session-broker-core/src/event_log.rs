//! Append-only JSON Lines log.
//!
//! Holds a session's events and, with a different record type, its
//! diagnostic logs. One record per line, append order is the total order. Each line is written
//! with a single `write_all` followed by `sync_data`, so a crash can at worst
//! leave one torn record at the end of the file. A torn record is sealed with
//! a newline before the next append, which keeps it from merging into the
//! following record; readers report it as a parse error and replay skips it.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::Event;

/// Event log error.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse record at {path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize record for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EventLogError {
    fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Handle to one append-only log file of `T` records.
#[derive(Debug)]
pub struct EventLog<T = Event> {
    path: PathBuf,
    record: PhantomData<fn() -> T>,
}

impl<T> Clone for EventLog<T> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<T> EventLog<T> {
    /// Create a handle for the log at `path`. The file is created lazily.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            record: PhantomData,
        }
    }
}

impl<T: Serialize> EventLog<T> {
    /// Append one record.
    ///
    /// # Errors
    /// Returns error if serialization or the durable write fails.
    pub fn append(&self, record: &T) -> Result<(), EventLogError> {
        let mut line = serde_json::to_vec(record).map_err(|source| EventLogError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .map_err(|e| EventLogError::io("opening log", &self.path, e))?;

        if has_torn_tail(&mut file)
            .map_err(|e| EventLogError::io("inspecting log tail", &self.path, e))?
        {
            tracing::warn!(path = %self.path.display(), "Sealing torn record at end of log");
            file.write_all(b"\n")
                .map_err(|e| EventLogError::io("sealing torn record", &self.path, e))?;
        }

        file.write_all(&line)
            .map_err(|e| EventLogError::io("appending record", &self.path, e))?;
        file.sync_data()
            .map_err(|e| EventLogError::io("syncing log", &self.path, e))?;
        Ok(())
    }
}

impl<T: DeserializeOwned> EventLog<T> {
    /// Lazily iterate the log from the beginning.
    ///
    /// A missing file is an empty log.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be opened.
    pub fn iter(&self) -> Result<EventIter<T>, EventLogError> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(EventLogError::io("opening log", &self.path, e)),
        };
        Ok(EventIter {
            path: self.path.clone(),
            reader,
            line: 0,
            buffer: String::new(),
            record: PhantomData,
        })
    }

    /// Read every parseable record, skipping torn or corrupt ones.
    ///
    /// # Errors
    /// Returns error only on I/O failure.
    pub fn replay(&self) -> Result<Vec<T>, EventLogError> {
        let mut records = Vec::new();
        for item in self.iter()? {
            match item {
                Ok(record) => records.push(record),
                Err(EventLogError::Parse { path, line, source }) => {
                    tracing::warn!(path = %path.display(), line, %source, "Skipping unreadable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

fn has_torn_tail(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Forward-only iterator over the records of a log.
pub struct EventIter<T = Event> {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    line: usize,
    buffer: String,
    record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Iterator for EventIter<T> {
    type Item = Result<T, EventLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            self.buffer.clear();
            self.line += 1;
            match reader.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    let record = self.buffer.trim();
                    if record.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(record).map_err(|source| {
                        EventLogError::Parse {
                            path: self.path.clone(),
                            line: self.line,
                            source,
                        }
                    }));
                }
                Err(e) => {
                    self.reader = None;
                    return Some(Err(EventLogError::io("reading log", &self.path, e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{EventKind, OperationContext};

    fn event(n: u64) -> Event {
        Event::new(
            EventKind::Run,
            OperationContext::new(format!("step {n}")),
            json!({ "command": format!("echo {n}") }),
            json!({ "success": true }),
        )
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::<Event>::new(dir.path().join("events.jsonl"));
        assert_eq!(log.iter().unwrap().count(), 0);
    }

    #[test]
    fn events_replay_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        for n in 0..5 {
            log.append(&event(n)).unwrap();
        }

        let tasks: Vec<String> = log
            .replay()
            .unwrap()
            .into_iter()
            .map(|e| e.context.current_task.unwrap())
            .collect();
        assert_eq!(tasks, ["step 0", "step 1", "step 2", "step 3", "step 4"]);
    }

    #[test]
    fn torn_record_does_not_corrupt_later_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(&path);
        log.append(&event(1)).unwrap();

        // Simulate a crash halfway through writing a record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"timestamp":1.0,"type":"ru"#).unwrap();
        drop(file);

        log.append(&event(2)).unwrap();

        let results: Vec<_> = log.iter().unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EventLogError::Parse { line: 2, .. })));
        assert!(results[2].is_ok());

        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1].context.current_task.as_deref(), Some("step 2"));
    }
}
