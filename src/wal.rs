use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_RECORD_LEN;
use crate::model::WalRecord;

/// Frame overhead: u32 length prefix + u32 crc32 suffix.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single record as `[len][bincode][crc32]`.
fn encode_record(writer: &mut impl Write, record: &WalRecord) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record of {} bytes exceeds {MAX_RECORD_LEN}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` means clean EOF, a torn tail, an impossible
/// length, or a bad checksum.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Append-only write-ahead log of commit records.
///
/// One commit is one frame, so a crash mid-write loses the whole commit and
/// never half of it. On open the torn tail (if any) is cut off so that new
/// appends are not hidden behind a corrupt frame.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful fsync.
    synced_len: u64,
    /// Records buffered or written since then.
    unsynced: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path` and open it for appending. Missing file = empty log.
    pub fn recover(path: &Path) -> io::Result<(Vec<WalRecord>, Wal)> {
        let (records, valid_len) = Self::read_valid(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "truncating torn WAL tail at byte {valid_len} in {}",
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: valid_len,
            unsynced: 0,
            appends_since_compact: records.len() as u64,
        };
        Ok((records, wal))
    }

    /// All valid records, stopping at the first truncated or corrupt frame.
    pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
        Self::read_valid(path).map(|(records, _)| records)
    }

    fn read_valid(path: &Path) -> io::Result<(Vec<WalRecord>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;

        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<WalRecord>(&payload) {
                Ok(record) => {
                    valid_len += payload.len() as u64 + FRAME_OVERHEAD;
                    records.push(record);
                }
                Err(_) => break,
            }
        }
        Ok((records, valid_len))
    }

    /// Append without flushing. Call `flush_sync()` once per batch.
    pub fn append_buffered(&mut self, record: &WalRecord) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.unsynced += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.appends_since_compact += self.unsynced;
        self.unsynced = 0;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`:
    /// bytes still buffered and bytes written but not synced. A failed
    /// batch must not surface in the log later.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // into_parts hands back the buffer without flushing it
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (stale, _unwritten) = stale.into_parts();
        drop(stale);
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.unsynced = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &WalRecord) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write `records` to a sibling temp file and fsync it. Slow; the live log is untouched.
    pub fn write_compact_file(path: &Path, records: &[WalRecord]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.unsynced = 0;
        self.appends_since_compact = 0;
        Ok(())
    }
}
