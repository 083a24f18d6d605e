//! Forward-only JSON-lines reader.

use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Lazily decodes one JSON record per line.
///
/// Blank lines are skipped. The first line that fails to decode yields
/// [`Error::StreamCorrupt`] and ends the sequence. Re-scanning needs a new
/// reader.
pub struct JsonlReader<T> {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
    done: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonlReader<T> {
    /// Opens the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            line: 0,
            done: false,
            _record: PhantomData,
        })
    }

    /// Source path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&mut self, reason: String) -> Error {
        self.done = true;
        Error::StreamCorrupt {
            path: self.path.clone(),
            line: self.line,
            reason,
        }
    }
}

impl<T: DeserializeOwned> Iterator for JsonlReader<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.line += 1;
                    return Some(Err(self.corrupt(e.to_string())));
                }
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line).map_err(|e| self.corrupt(e.to_string())),
            );
        }
    }
}
