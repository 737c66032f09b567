use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// A length prefix above this is garbage, not a frame.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encode one committed transaction as `[len][bincode Vec<Event>][crc32]`.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact commit record, or `None` at end of log / first damaged frame.
fn read_commit(reader: &mut impl Read) -> io::Result<Option<(Vec<Event>, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let frame_len = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Vec<Event>>(&payload)
        .ok()
        .map(|events| (events, frame_len)))
}

/// What the log writes to. `File` in production.
pub trait LogFile: Write + Send {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append-only write-ahead log of committed ledger transactions.
///
/// Each frame holds every event of one transaction, so a torn write loses
/// the whole transaction rather than half of it. Frames are staged in
/// `pending` until `flush_sync`; a failed flush cuts the file back to the
/// last synced length, so the log only ever holds acknowledged commits.
pub struct Wal<F: LogFile = File> {
    file: F,
    pending: Vec<u8>,
    pending_appends: u64,
    synced_len: u64,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self::with_file(file, path.to_path_buf(), synced_len))
    }
}

impl<F: LogFile> Wal<F> {
    /// Log over an already open file whose first `synced_len` bytes are durable.
    pub fn with_file(file: F, path: PathBuf, synced_len: u64) -> Self {
        Self {
            file,
            pending: Vec::new(),
            pending_appends: 0,
            synced_len,
            path,
            appends_since_compact: 0,
        }
    }

    /// Append and fsync a single commit. Production goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        let mark = self.pending.len();
        if let Err(e) = encode_commit(&mut self.pending, events) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_appends += 1;
        Ok(())
    }

    /// Write and fsync everything staged. On failure nothing staged
    /// survives, on disk or in memory.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let result = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        match result {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_appends;
                self.pending.clear();
                self.pending_appends = 0;
                Ok(())
            }
            Err(e) => {
                self.discard_pending();
                Err(e)
            }
        }
    }

    /// Drop staged frames and cut any partial write off the file.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_appends = 0;
        if let Err(e) = self.file.truncate(self.synced_len) {
            tracing::error!("failed to truncate {} after a bad write: {e}", self.path.display());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    #[cfg(test)]
    pub fn file(&self) -> &F {
        &self.file
    }

    #[cfg(test)]
    pub fn file_mut(&mut self) -> &mut F {
        &mut self.file
    }
}

impl Wal {
    /// Write a snapshot of the ledger to a temp file next to the log and fsync.
    pub fn write_compact_file(path: &Path, snapshot: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        // One frame per event keeps frames small on big ledgers.
        for event in snapshot {
            encode_commit(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp snapshot over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.file = file;
        self.pending.clear();
        self.pending_appends = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    /// Replay every intact commit in order. A missing file is an empty log;
    /// anything after the first damaged frame is cut off so later appends
    /// stay reachable.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some((commit, frame_len)) = read_commit(&mut reader)? {
            events.extend(commit);
            valid_len += frame_len;
        }
        if valid_len < file_len {
            tracing::warn!(
                "discarding {} damaged bytes at the end of {}",
                file_len - valid_len,
                path.display()
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(events)
    }
}
