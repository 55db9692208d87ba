//! One watched log file and the read position inside it.
//!
//! Rotation is detected by comparing the inode/device pair and a SHA-256 of
//! the first line with what was seen on the previous open. Any change, or a
//! file that shrank below the stored offset, restarts reading at zero.

use encoding_rs::{Encoding, UTF_8};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{WardenError, WardenResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    dev: u64,
    ino: u64,
    first_line: [u8; 32],
}

#[derive(Debug)]
pub struct FileContainer {
    path: PathBuf,
    tail: bool,
    pos: u64,
    identity: Identity,
    encoding: &'static Encoding,
    warned_encoding: bool,
}

fn open_cloexec(path: &Path) -> WardenResult<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| WardenError::FileSystem(format!("unable to open {}: {}", path.display(), e)))
}

fn identify(file: &mut File, path: &Path) -> WardenResult<(Identity, u64)> {
    let meta = file
        .metadata()
        .map_err(|e| WardenError::FileSystem(format!("unable to stat {}: {}", path.display(), e)))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| WardenError::FileSystem(format!("unable to seek {}: {}", path.display(), e)))?;
    let mut first = Vec::new();
    BufReader::new(&mut *file)
        .read_until(b'\n', &mut first)
        .map_err(|e| WardenError::FileSystem(format!("unable to read {}: {}", path.display(), e)))?;
    let digest = Sha256::digest(&first);
    let mut first_line = [0u8; 32];
    first_line.copy_from_slice(&digest);
    Ok((
        Identity {
            dev: meta.dev(),
            ino: meta.ino(),
            first_line,
        },
        meta.len(),
    ))
}

impl FileContainer {
    /// Open `path` and remember its identity. With `tail`, reading starts at
    /// the current end of file instead of the beginning.
    pub fn new(path: impl Into<PathBuf>, tail: bool) -> WardenResult<Self> {
        let path = path.into();
        let mut file = open_cloexec(&path)?;
        let (identity, len) = identify(&mut file, &path)?;
        Ok(Self {
            pos: if tail { len } else { 0 },
            path,
            tail,
            identity,
            encoding: UTF_8,
            warned_encoding: false,
        })
    }

    /// Decode lines with `encoding` from now on.
    pub fn set_encoding(&mut self, encoding: &'static Encoding) {
        self.encoding = encoding;
        self.warned_encoding = false;
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_tail(&self) -> bool {
        self.tail
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Read every complete line appended since the last call.
    pub fn read_new_lines(&mut self) -> WardenResult<Vec<String>> {
        let mut file = open_cloexec(&self.path)?;
        let (identity, len) = identify(&mut file, &self.path)?;

        if identity != self.identity || len < self.pos {
            info!("Log rotation detected for {}", self.path.display());
            self.identity = identity;
            self.pos = 0;
        }
        if len == self.pos {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.pos)).map_err(|e| {
            WardenError::FileSystem(format!("unable to seek {}: {}", self.path.display(), e))
        })?;
        let mut buf = Vec::with_capacity((len - self.pos) as usize);
        file.read_to_end(&mut buf).map_err(|e| {
            WardenError::FileSystem(format!("unable to read {}: {}", self.path.display(), e))
        })?;

        // a trailing partial line stays unread until its newline arrives
        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(i) => i + 1,
            None => return Ok(Vec::new()),
        };
        self.pos += complete as u64;

        let lines = buf[..complete]
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|raw| self.decode(raw))
            .collect::<Vec<_>>();
        debug!("Read {} new line(s) from {}", lines.len(), self.path.display());
        Ok(lines)
    }

    fn decode(&mut self, raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let (text, had_errors) = self.encoding.decode_without_bom_handling(raw);
        if had_errors && !self.warned_encoding {
            warn!(
                "Error decoding line from {} as {}; invalid bytes were replaced",
                self.path.display(),
                self.encoding.name()
            );
            self.warned_encoding = true;
        }
        text.into_owned()
    }
}
