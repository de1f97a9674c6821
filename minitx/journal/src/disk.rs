// disk.rs
// Double-file transaction journal.
//
// Two files alternate between the active and the backup role. Records are
// appended to the active file; once it would grow past the size limit, every
// still-open transaction is copied to the backup file and the roles swap.
//
// File layout:
// ┌──────────────────┬──────────────────────────────┐
// │ header (16)      │ frames… (see record.rs)      │
// └──────────────────┴──────────────────────────────┘
// Header (little-endian):
// ┌───────────┬─────────────┬──────────┬─────────────┬────────────────┐
// │ magic (4) │ version u16 │ state u8 │ reserved u8 │ generation u64 │
// └───────────┴─────────────┴──────────┴─────────────┴────────────────┘
// - `state`      : clean, unclean (open for writing) or rotating
// - `generation` : bumped on every role swap; the higher one is active
//
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use minitx_common::{GlobalTransactionId, RecordStatus};
use parking_lot::Mutex;
use strum::Display;
use tracing::{debug, info, trace, warn};

use crate::dangling::collect_dangling;
use crate::error::{JournalError, JournalResult};
use crate::record::{JournalRecord, scan_frames};
use crate::{JournalConfig, TransactionJournal};

const MAGIC: &[u8; 4] = b"MTXJ";
const VERSION: u16 = 1;
pub const FILE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FileState {
    /// Closed by a clean shutdown, or an empty backup.
    Clean,
    /// Open for writing. Seen at startup it means the previous run crashed.
    Unclean,
    /// A rotation into this file has not finished. Never chosen as active.
    Rotating,
}

impl FileState {
    fn as_byte(self) -> u8 {
        match self {
            FileState::Clean => 0,
            FileState::Unclean => 1,
            FileState::Rotating => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FileState::Clean),
            1 => Some(FileState::Unclean),
            2 => Some(FileState::Rotating),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
    state: FileState,
    generation: u64,
}

impl FileHeader {
    const FRESH: Self = Self {
        state: FileState::Clean,
        generation: 0,
    };

    fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(MAGIC);
        bytes[4..6].copy_from_slice(&VERSION.to_le_bytes());
        bytes[6] = self.state.as_byte();
        bytes[8..16].copy_from_slice(&self.generation.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8], path: &Path) -> JournalResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::FRESH);
        }
        if bytes.len() < FILE_HEADER_SIZE {
            // Headers are only written into files that hold nothing we need.
            warn!(path = ?path, len = bytes.len(), "incomplete journal header, treating file as empty");
            return Ok(Self::FRESH);
        }
        let invalid = |reason: String| JournalError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };
        if &bytes[0..4] != MAGIC {
            return Err(invalid("bad magic".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(invalid(format!("unsupported version {version}")));
        }
        let state = FileState::from_byte(bytes[6])
            .ok_or_else(|| invalid(format!("unknown state {}", bytes[6])))?;
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            state,
            generation: u64::from_le_bytes(generation),
        })
    }
}

/// Picks the active file: the non-rotating one with the higher generation,
/// the first on a tie.
fn select_active(headers: [FileHeader; 2]) -> Option<usize> {
    let eligible = |header: &FileHeader| header.state != FileState::Rotating;
    match (eligible(&headers[0]), eligible(&headers[1])) {
        (true, true) if headers[1].generation > headers[0].generation => Some(1),
        (true, true) | (true, false) => Some(0),
        (false, true) => Some(1),
        (false, false) => None,
    }
}

fn records_start(contents: &[u8]) -> usize {
    FILE_HEADER_SIZE.min(contents.len())
}

struct JournalFile {
    path: PathBuf,
    writer: BufWriter<File>,
    header: FileHeader,
    /// Logical length, buffered bytes included.
    len: u64,
}

impl JournalFile {
    fn open(path: &Path) -> JournalResult<(Self, Vec<u8>)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let header = FileHeader::decode(&contents, path)?;

        let journal_file = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            header,
            len: contents.len() as u64,
        };
        Ok((journal_file, contents))
    }

    /// Overwrites the header in place and syncs it.
    fn write_header(&mut self, header: FileHeader) -> JournalResult<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_data()?;
        self.len = file.seek(SeekFrom::End(0))?;
        self.header = header;
        Ok(())
    }

    /// Writes `header` and drops every frame behind it.
    fn reset(&mut self, header: FileHeader) -> JournalResult<()> {
        self.write_header(header)?;
        self.truncate(FILE_HEADER_SIZE as u64)
    }

    fn truncate(&mut self, len: u64) -> JournalResult<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(len)?;
        file.seek(SeekFrom::End(0))?;
        file.sync_data()?;
        self.len = len;
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> JournalResult<()> {
        match self.writer.write_all(frame) {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut back whatever part of the frame reached the file.
                let original = self.len;
                if let Err(undo) = self.truncate(original) {
                    warn!(path = ?self.path, error = %undo, "failed to undo partial journal write");
                }
                Err(e.into())
            }
        }
    }

    fn flush(&mut self, sync: bool) -> JournalResult<()> {
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    fn read_records(&mut self) -> JournalResult<Vec<JournalRecord>> {
        self.writer.flush()?;
        let contents = fs::read(&self.path)?;
        let scan = scan_frames(&contents, records_start(&contents), &self.path)?;
        Ok(scan.records)
    }
}

struct Inner {
    files: [JournalFile; 2],
    active: usize,
    next_sequence: u64,
    closed: bool,
}

impl Inner {
    fn active(&mut self) -> &mut JournalFile {
        &mut self.files[self.active]
    }

    fn backup(&mut self) -> &mut JournalFile {
        &mut self.files[1 - self.active]
    }

    /// Copies every open transaction into the backup file and swaps roles.
    ///
    /// The backup carries the `Rotating` state until all frames are synced, so
    /// a crash in between leaves the old active file in charge.
    fn rotate(&mut self) -> JournalResult<()> {
        let records = self.active().read_records()?;
        let total = records.len();
        let mut carried: Vec<JournalRecord> = collect_dangling(records)
            .into_values()
            .flat_map(|tx| tx.records)
            .collect();
        carried.sort_by_key(|record| record.sequence);

        let old_generation = self.active().header.generation;
        let generation = old_generation + 1;

        let backup = self.backup();
        backup.reset(FileHeader {
            state: FileState::Rotating,
            generation,
        })?;
        for record in &carried {
            backup.append(&record.encode_frame()?)?;
        }
        backup.flush(true)?;
        backup.write_header(FileHeader {
            state: FileState::Unclean,
            generation,
        })?;

        self.active().reset(FileHeader {
            state: FileState::Clean,
            generation: old_generation,
        })?;
        self.active = 1 - self.active;

        info!(
            path = ?self.files[self.active].path,
            generation,
            carried = carried.len(),
            dropped = total - carried.len(),
            "journal rotated"
        );
        Ok(())
    }
}

/// Snapshot of a journal pair, read without opening it for writing.
#[derive(Debug, Clone)]
pub struct JournalImage {
    pub active_path: PathBuf,
    pub state: FileState,
    pub generation: u64,
    pub records: Vec<JournalRecord>,
    /// True if the active file ends with an incomplete record.
    pub torn_tail: bool,
}

pub struct DiskJournal {
    config: JournalConfig,
    inner: Mutex<Inner>,
}

impl DiskJournal {
    /// Opens the journal pair, creating both files if needed.
    ///
    /// The backup file is emptied, an incomplete record at the end of the active
    /// file is cut away, and the active file is marked as open until
    /// [`TransactionJournal::close`] is called.
    pub fn open(config: &JournalConfig) -> JournalResult<Self> {
        let (part1, contents1) = JournalFile::open(&config.part1_path)?;
        let (part2, contents2) = JournalFile::open(&config.part2_path)?;
        let active = select_active([part1.header, part2.header]).ok_or_else(|| {
            JournalError::InvalidHeader {
                path: config.part1_path.clone(),
                reason: "both journal files are mid-rotation".into(),
            }
        })?;
        let contents = if active == 0 { contents1 } else { contents2 };
        let mut files = [part1, part2];
        let backup = 1 - active;

        let scan = scan_frames(&contents, records_start(&contents), &files[active].path)?;
        if scan.torn_tail {
            warn!(
                path = ?files[active].path,
                valid_len = scan.valid_len,
                file_len = contents.len(),
                "truncating incomplete record at journal tail"
            );
            files[active].truncate(scan.valid_len)?;
        }
        if files[active].header.state == FileState::Unclean {
            warn!(path = ?files[active].path, "journal was not shut down cleanly");
        }

        // Raise the active generation before touching the backup, so a crash
        // in between cannot promote the emptied file.
        let generation = files[active]
            .header
            .generation
            .max(files[backup].header.generation + 1);
        files[active].write_header(FileHeader {
            state: FileState::Unclean,
            generation,
        })?;
        let backup_generation = files[backup].header.generation;
        files[backup].reset(FileHeader {
            state: FileState::Clean,
            generation: backup_generation,
        })?;

        let next_sequence = scan
            .records
            .iter()
            .map(|record| record.sequence)
            .max()
            .map_or(1, |sequence| sequence + 1);
        info!(
            path = ?files[active].path,
            generation,
            records = scan.records.len(),
            "journal opened"
        );

        Ok(Self {
            config: config.clone(),
            inner: Mutex::new(Inner {
                files,
                active,
                next_sequence,
                closed: false,
            }),
        })
    }

    /// Reads the journal pair as it is on disk without modifying it.
    pub fn inspect(part1: &Path, part2: &Path) -> JournalResult<JournalImage> {
        let contents = [fs::read(part1)?, fs::read(part2)?];
        let headers = [
            FileHeader::decode(&contents[0], part1)?,
            FileHeader::decode(&contents[1], part2)?,
        ];
        let active = select_active(headers).ok_or_else(|| JournalError::InvalidHeader {
            path: part1.to_path_buf(),
            reason: "both journal files are mid-rotation".into(),
        })?;
        let path = if active == 0 { part1 } else { part2 };
        let scan = scan_frames(&contents[active], records_start(&contents[active]), path)?;
        Ok(JournalImage {
            active_path: path.to_path_buf(),
            state: headers[active].state,
            generation: headers[active].generation,
            records: scan.records,
            torn_tail: scan.torn_tail,
        })
    }

    pub fn active_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.files[inner.active].path.clone()
    }

    pub fn generation(&self) -> u64 {
        let inner = self.inner.lock();
        inner.files[inner.active].header.generation
    }
}

impl TransactionJournal for DiskJournal {
    fn log(
        &self,
        status: RecordStatus,
        gtrid: &GlobalTransactionId,
        unique_names: &BTreeSet<String>,
    ) -> JournalResult<()> {
        if self.config.filter_log_status && !status.is_recovery_relevant() {
            trace!(%gtrid, %status, "journal record filtered");
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(JournalError::Closed);
        }
        let record = JournalRecord {
            status,
            gtrid: gtrid.clone(),
            unique_names: unique_names.clone(),
            sequence: inner.next_sequence,
            time: Utc::now().timestamp_millis(),
        };
        let frame = record.encode_frame()?;
        let frame_len = frame.len() as u64;

        let max = self.config.max_log_size_bytes;
        if inner.active().len > FILE_HEADER_SIZE as u64 && inner.active().len + frame_len > max {
            inner.rotate()?;
            let len = inner.active().len;
            if len + frame_len > max {
                warn!(len, max, "open transactions alone exceed the journal size limit");
            }
        }

        inner.active().append(&frame)?;
        inner.next_sequence += 1;
        if status.requires_force() {
            inner.active().flush(self.config.forced_write_enabled)?;
        }
        debug!(%gtrid, %status, sequence = record.sequence, "journal record written");
        Ok(())
    }

    fn force(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(JournalError::Closed);
        }
        inner.active().flush(self.config.forced_write_enabled)
    }

    fn read_all(&self) -> JournalResult<Vec<JournalRecord>> {
        let mut records = self.inner.lock().active().read_records()?;
        records.sort_by_key(|record| record.sequence);
        Ok(records)
    }

    fn close(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let active = inner.active();
        active.flush(true)?;
        let generation = active.header.generation;
        active.write_header(FileHeader {
            state: FileState::Clean,
            generation,
        })?;
        inner.closed = true;
        info!("journal closed");
        Ok(())
    }
}
