//! Journal segment files with CRC32-framed records
//!
//! Layout: a 16-byte header `[magic u32][version u32][entry count u64]`
//! followed by records framed as `[len u32][crc u32][data]`. The entry count
//! is only rewritten on a clean close, so readers trust the frames, not the
//! header count.

use crate::error::{ChartError, ChartResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: u64 = 16;

/// Size of a record frame header in bytes
pub const FRAME_HEADER_SIZE: u64 = 8;

/// Magic number for segment files
const SEGMENT_MAGIC: u32 = 0x4348_4A4C; // "CHJL"

/// Version of segment format
const SEGMENT_VERSION: u32 = 1;

const IO_BUFFER_SIZE: usize = 64 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn read_header<R: Read>(reader: &mut R, path: &Path) -> ChartResult<u64> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != SEGMENT_MAGIC {
        return Err(ChartError::Corrupt(format!(
            "{}: invalid segment magic {magic:#x}",
            path.display()
        )));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != SEGMENT_VERSION {
        return Err(ChartError::Corrupt(format!(
            "{}: unsupported segment version {version}",
            path.display()
        )));
    }
    Ok(reader.read_u64::<LittleEndian>()?)
}

/// Append handle for one segment
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    max_size: u64,
    entries: u64,
}

impl Segment {
    /// Create a new, empty segment file
    pub fn create(path: &Path, max_size: u64) -> ChartResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
        writer.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        writer.write_u64::<LittleEndian>(0)?;
        writer.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: writer,
            size: SEGMENT_HEADER_SIZE,
            max_size,
            entries: 0,
        })
    }

    /// Reopen a replayed segment for appending
    ///
    /// Anything past `valid_len` (a torn tail) is truncated first.
    pub fn open_for_append(
        path: &Path,
        max_size: u64,
        valid_len: u64,
        entries: u64,
    ) -> ChartResult<Self> {
        let mut file = OpenOptions::new().write(true).read(true).open(path)?;
        read_header(&mut BufReader::new(&file), path)?;

        if file.metadata()?.len() > valid_len {
            debug!(path = %path.display(), valid_len, "Truncating torn segment tail");
            file.set_len(valid_len)?;
        }
        let size = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::with_capacity(IO_BUFFER_SIZE, file),
            size,
            max_size,
            entries,
        })
    }

    /// Append one framed record
    pub fn append(&mut self, data: &[u8]) -> ChartResult<()> {
        if self.is_full(data.len()) {
            return Err(ChartError::Logic(format!(
                "append to full segment {}",
                self.path.display()
            )));
        }
        let data_len = u32::try_from(data.len())
            .map_err(|_| ChartError::InvalidRequest("record exceeds u32 length".into()))?;

        self.file.write_u32::<LittleEndian>(data_len)?;
        self.file.write_u32::<LittleEndian>(checksum(data))?;
        self.file.write_all(data)?;

        self.size += FRAME_HEADER_SIZE + u64::from(data_len);
        self.entries += 1;
        trace!(entries = self.entries, bytes = data.len(), "Appended journal record");
        Ok(())
    }

    /// True if a record of `next_entry_size` bytes would overflow the segment
    #[must_use]
    pub const fn is_full(&self, next_entry_size: usize) -> bool {
        // SAFETY: usize to u64 widening conversion is always safe
        self.size
            .saturating_add(FRAME_HEADER_SIZE)
            .saturating_add(next_entry_size as u64)
            > self.max_size
    }

    /// Flush buffered records and fsync the file
    pub fn sync(&mut self) -> ChartResult<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    /// Close the segment, recording the final entry count in the header
    pub fn close(mut self) -> ChartResult<()> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_u64::<LittleEndian>(self.entries)?;
        self.sync()?;
        debug!(
            path = %self.path.display(),
            entries = self.entries,
            "Closed journal segment"
        );
        Ok(())
    }

    /// Records in the segment
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Bytes written, header included
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Sequential reader over the records of one segment
#[derive(Debug)]
pub struct SegmentReader {
    reader: BufReader<File>,
    file_len: u64,
    position: u64,
    records: u64,
    torn: bool,
}

impl SegmentReader {
    /// Open a segment and verify its header
    pub fn open(path: &Path) -> ChartResult<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);
        read_header(&mut reader, path)?;

        Ok(Self {
            reader,
            file_len,
            position: SEGMENT_HEADER_SIZE,
            records: 0,
            torn: false,
        })
    }

    /// Next record, or `None` at the end of valid data
    ///
    /// A frame cut short by end of file is a torn tail from an interrupted
    /// write: reading stops there. A complete frame whose checksum does not
    /// match is corruption.
    pub fn read_next(&mut self) -> ChartResult<Option<Vec<u8>>> {
        let remaining = self.file_len.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < FRAME_HEADER_SIZE {
            self.torn = true;
            return Ok(None);
        }

        let length = self.reader.read_u32::<LittleEndian>()?;
        let expected_crc = self.reader.read_u32::<LittleEndian>()?;
        if u64::from(length) > remaining - FRAME_HEADER_SIZE {
            self.torn = true;
            return Ok(None);
        }

        // SAFETY: u32 to usize widening on 64-bit targets
        let mut data = vec![0u8; length as usize];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.torn = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let actual_crc = checksum(&data);
        if actual_crc != expected_crc {
            return Err(ChartError::Corrupt(format!(
                "CRC mismatch at offset {}: expected {expected_crc:#x}, got {actual_crc:#x}",
                self.position
            )));
        }

        self.position += FRAME_HEADER_SIZE + u64::from(length);
        self.records += 1;
        Ok(Some(data))
    }

    /// Byte offset just past the last valid record
    #[must_use]
    pub const fn valid_len(&self) -> u64 {
        self.position
    }

    /// Valid records read so far
    #[must_use]
    pub const fn records_read(&self) -> u64 {
        self.records
    }

    /// True if reading stopped at a partial record
    #[must_use]
    pub const fn has_torn_tail(&self) -> bool {
        self.torn
    }
}
