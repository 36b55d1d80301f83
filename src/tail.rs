use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Returns the bytes appended to `path` since `offset`, and the new offset.
///
/// A missing file and a file shorter than `offset` both read as "nothing
/// new" with the offset unchanged.
pub fn read_new(path: &Path, offset: u64) -> io::Result<(Vec<u8>, u64)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(error) => return Err(error),
    };
    let len = file.metadata()?.len();
    if len <= offset {
        return Ok((Vec::new(), offset));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut bytes)?;
    let next = offset + bytes.len() as u64;
    Ok((bytes, next))
}

/// Incremental line reader over one append-only file.
#[derive(Debug, Clone)]
pub struct LineTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LineTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Complete lines appended since the last call. A trailing fragment
    /// without a newline is held back until it is completed.
    pub fn poll_lines(&mut self) -> io::Result<Vec<String>> {
        let (bytes, next) = read_new(&self.path, self.offset)?;
        self.offset = next;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        self.partial.extend_from_slice(&bytes);
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        // `complete` ends in '\n', so the final split segment is empty.
        let mut lines = complete
            .split(|byte| *byte == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect::<Vec<String>>();
        lines.pop();
        Ok(lines)
    }

    /// Releases a trailing fragment once the producer is known to be done.
    pub fn flush_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.partial);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
#[path = "tests/tail_tests.rs"]
mod tests;
