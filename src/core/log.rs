// Term log file creation/opening with header validation, mmap, and rotation locking.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;

use crate::core::appender::TermAppender;
use crate::core::buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame;
use crate::core::header::HeaderWriter;
use crate::core::tail::{self, TailCounter};
use crate::core::validate::{self, FrameSummary, TermReport};

const MAGIC: [u8; 4] = *b"TLOG";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 4096;
const TAIL_COUNTER_OFFSET: usize = 128;

pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogHeader {
    pub term_length: u64,
    pub initial_term_id: i32,
    pub session_id: i32,
    pub stream_id: i32,
}

impl LogHeader {
    fn new(options: &TermLogOptions) -> Result<Self, Error> {
        check_term_length(options.term_length)?;
        Ok(Self {
            term_length: options.term_length as u64,
            initial_term_id: options.initial_term_id,
            session_id: options.session_id,
            stream_id: options.stream_id,
        })
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;

        write_u64(&mut buf, 16, self.term_length);
        write_i32(&mut buf, 24, self.initial_term_id);
        write_i32(&mut buf, 28, self.session_id);
        write_i32(&mut buf, 32, self.stream_id);
        write_u64(&mut buf, TAIL_COUNTER_OFFSET, tail::pack(self.initial_term_id, 0) as u64);

        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        Ok(Self {
            term_length: read_u64(buf, 16),
            initial_term_id: i32::from_le_bytes(read_4(buf, 24)),
            session_id: i32::from_le_bytes(read_4(buf, 28)),
            stream_id: i32::from_le_bytes(read_4(buf, 32)),
        })
    }

    fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        check_term_length(self.term_length as usize)
            .map_err(|err| Error::new(ErrorKind::Corrupt).with_source(err))?;
        if HEADER_SIZE as u64 + self.term_length != actual_file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("term bounds mismatch"));
        }
        Ok(())
    }

    pub fn file_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.term_length
    }
}

fn check_term_length(term_length: usize) -> Result<(), Error> {
    if !term_length.is_power_of_two() {
        return Err(Error::new(ErrorKind::Usage).with_message("term length must be a power of two"));
    }
    if !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&term_length) {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "term length must be within {TERM_MIN_LENGTH}..={TERM_MAX_LENGTH}"
        )));
    }
    Ok(())
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[derive(Clone, Copy, Debug)]
pub struct TermLogOptions {
    pub term_length: usize,
    pub initial_term_id: i32,
    pub session_id: i32,
    pub stream_id: i32,
}

impl TermLogOptions {
    pub fn new(term_length: usize) -> Self {
        Self {
            term_length,
            initial_term_id: 0,
            session_id: 0,
            stream_id: 0,
        }
    }

    pub fn with_ids(mut self, session_id: i32, stream_id: i32) -> Self {
        self.session_id = session_id;
        self.stream_id = stream_id;
        self
    }

    pub fn with_initial_term_id(mut self, initial_term_id: i32) -> Self {
        self.initial_term_id = initial_term_id;
        self
    }
}

/// A memory-mapped file holding one term buffer and its tail counter.
///
/// Any number of processes may map the same file and append concurrently;
/// rotation is serialized through an exclusive advisory lock.
pub struct TermLog {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    base: NonNull<u8>,
    header: LogHeader,
}

// All shared access to the mapping goes through `AtomicBuffer` views.
unsafe impl Send for TermLog {}
unsafe impl Sync for TermLog {}

impl TermLog {
    pub fn create(path: impl AsRef<Path>, options: TermLogOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let header = LogHeader::new(&options)?;
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(&path).with_source(err))?;

        file.set_len(header.file_size())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
        write_header(&mut file, &header, &path)?;

        let (mmap, base) = map(&file, &path)?;
        tracing::debug!(path = %path.display(), term_length = header.term_length, "created term log");

        Ok(Self {
            path,
            file,
            mmap,
            base,
            header,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(&path).with_source(err))?;

        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;

        let header = read_header(&mut file, &path)?;
        header
            .validate(actual_size)
            .map_err(|err| err.with_path(&path))?;

        let (mmap, base) = map(&file, &path)?;
        tracing::debug!(path = %path.display(), "opened term log");

        Ok(Self {
            path,
            file,
            mmap,
            base,
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> LogHeader {
        self.header
    }

    pub fn header_writer(&self) -> HeaderWriter {
        HeaderWriter::new(self.header.session_id, self.header.stream_id)
    }

    /// Largest message the log accepts from one append: an eighth of the term,
    /// capped at the frame layer's message limit.
    pub fn max_message_length(&self) -> usize {
        frame::max_message_length(self.header.term_length as usize)
    }

    fn metadata_buffer(&self) -> Result<AtomicBuffer<'_>, Error> {
        // The mapping lives as long as `self`.
        unsafe { AtomicBuffer::from_raw_parts(self.base.as_ptr(), HEADER_SIZE) }
    }

    pub fn term_buffer(&self) -> Result<AtomicBuffer<'_>, Error> {
        let term_length = self.header.term_length as usize;
        if self.mmap.len() < HEADER_SIZE + term_length {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("mapping shorter than term")
                .with_path(&self.path));
        }
        unsafe {
            AtomicBuffer::from_raw_parts(self.base.as_ptr().add(HEADER_SIZE), term_length)
        }
    }

    pub fn tail_counter(&self) -> Result<TailCounter<'_>, Error> {
        TailCounter::new(self.metadata_buffer()?, TAIL_COUNTER_OFFSET)
    }

    pub fn appender(&self) -> Result<TermAppender<'_>, Error> {
        TermAppender::new(self.term_buffer()?, self.tail_counter()?)
    }

    pub fn raw_tail(&self) -> Result<i64, Error> {
        self.tail_counter()?.raw_tail_volatile()
    }

    pub fn frames(&self) -> Result<Vec<FrameSummary>, Error> {
        let term = self.term_buffer()?;
        let limit = tail::clamped_term_offset(self.raw_tail()?, term.capacity());
        validate::scan_term(&term, limit)
    }

    pub fn validate(&self) -> Result<TermReport, Error> {
        validate::validate_term(&self.term_buffer()?, self.raw_tail()?)
            .map_err(|err| err.with_path(&self.path))
    }

    /// Recycles the term for `next_term_id`. Callers must have observed the
    /// term as exhausted and stopped producers first.
    pub fn rotate(&self, next_term_id: i32) -> Result<(), Error> {
        let _lock = self.rotation_lock()?;
        let term = self.term_buffer()?;
        term.set_memory(0, term.capacity(), 0)?;
        self.tail_counter()?.reset(next_term_id)?;
        tracing::info!(path = %self.path.display(), next_term_id, "rotated term");
        Ok(())
    }

    pub fn rotation_lock(&self) -> Result<RotationLock<'_>, Error> {
        self.file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("rotation already in progress")
                .with_path(&self.path)
                .with_source(err)
        })?;
        Ok(RotationLock { file: &self.file })
    }
}

pub struct RotationLock<'a> {
    file: &'a File,
}

impl Drop for RotationLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn map(file: &File, path: &Path) -> Result<(MmapMut, NonNull<u8>), Error> {
    let mut mmap = unsafe {
        MmapMut::map_mut(file)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
    };
    let base = NonNull::new(mmap.as_mut_ptr())
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("null mapping"))?;
    Ok((mmap, base))
}

fn open_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn read_header(file: &mut File, path: &Path) -> Result<LogHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::new(ErrorKind::Corrupt).with_path(path).with_source(err))?;
    LogHeader::decode(&buf).map_err(|err| err.with_path(path))
}

fn write_header(file: &mut File, header: &LogHeader, path: &Path) -> Result<(), Error> {
    let buf = header.encode();
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.write_all(&buf)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.flush()
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    Ok(())
}
