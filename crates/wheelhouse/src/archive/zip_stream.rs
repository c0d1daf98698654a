use std::io::{self, Read};

use flate2::{Crc, Decompress, FlushDecompress, Status};
use thiserror::Error;

const LOCAL_FILE_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_DIR_SIGNATURE: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0605_4b50;
const ZIP64_END_OF_CENTRAL_DIR_SIGNATURE: u32 = 0x0606_4b50;
const ZIP64_END_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

const FLAG_ENCRYPTED: u16 = 1 << 0;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

const IN_BUF_SIZE: usize = 64 * 1024;

/// Errors raised while streaming a ZIP archive.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ZipStreamError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("not a ZIP local file header (signature {0:#010x})")]
    BadSignature(u32),

    #[error("unsupported compression method {method} for '{name}'")]
    UnsupportedMethod { name: String, method: u16 },

    #[error("encrypted entry '{0}' is not supported")]
    Encrypted(String),

    #[error("stored entry '{0}' declares no size; refusing to scan for a data descriptor")]
    StoredWithDescriptor(String),

    #[error("crc32 mismatch for '{0}'")]
    CrcMismatch(String),

    #[error("corrupt deflate stream in '{name}': {message}")]
    Deflate { name: String, message: String },

    #[error("entry '{name}' does not match its declared sizes")]
    SizeMismatch { name: String },

    #[error("archive ended unexpectedly")]
    Truncated,
}

impl From<ZipStreamError> for io::Error {
    fn from(err: ZipStreamError) -> Self {
        match err {
            ZipStreamError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// A single-pass reader over the entries of a ZIP archive.
///
/// Unlike `zip::ZipArchive` this never seeks: entries are surfaced in the
/// order their local headers appear, which is what makes it possible to
/// convert a wheel while it is still being downloaded. Deflate entries that
/// defer their sizes to a trailing data descriptor are supported; their
/// [`ZipEntry::declared_size`] is `None` and the end of the entry is detected
/// from the deflate stream itself.
pub struct ZipStreamReader<R> {
    input: R,
    /// Bytes read past the end of a deflate stream, to be consumed before
    /// `input`.
    pushback: Vec<u8>,
    pushback_pos: usize,
    current: Option<EntryState>,
    done: bool,
}

struct EntryState {
    name: String,
    method: u16,
    has_descriptor: bool,
    /// Compressed bytes not yet consumed (meaningless with a descriptor).
    compressed_remaining: u64,
    /// Compressed bytes consumed so far.
    compressed_consumed: u64,
    crc_expected: u32,
    decompressor: Option<Decompress>,
    in_buf: Vec<u8>,
    in_start: usize,
    in_end: usize,
    crc: Crc,
    produced: u64,
    finished: bool,
}

/// One entry of the archive. Implements [`Read`] over the *decompressed*
/// contents. Dropping an entry without draining it is allowed; the remainder
/// is skipped when the next entry is requested.
pub struct ZipEntry<'a, R: Read> {
    archive: &'a mut ZipStreamReader<R>,
    name: String,
    declared_size: Option<u64>,
}

impl<R: Read> ZipEntry<'_, R> {
    /// The entry name, decoded as UTF-8 (lossily, matching what installers
    /// tolerate).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The uncompressed size from the local header, or `None` when the entry
    /// uses a data descriptor.
    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    /// True for directory placeholder entries.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

impl<R: Read> Read for ZipEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.archive.read_entry(buf).map_err(Into::into)
    }
}

impl<R: Read> ZipStreamReader<R> {
    /// Wraps a byte stream positioned at the start of a ZIP archive.
    pub fn new(input: R) -> Self {
        Self {
            input,
            pushback: Vec::new(),
            pushback_pos: 0,
            current: None,
            done: false,
        }
    }

    /// Advances to the next entry. Returns `None` once the central directory
    /// is reached (everything from there on is index data we do not need).
    pub fn next_entry(&mut self) -> Result<Option<ZipEntry<'_, R>>, ZipStreamError> {
        if self.done {
            return Ok(None);
        }

        // Skip whatever is left of an entry the caller abandoned.
        if self.current.is_some() {
            let mut scratch = [0u8; 8192];
            while self.read_entry(&mut scratch)? > 0 {}
            self.current = None;
        }

        let mut signature = [0u8; 4];
        if !self.read_exact_or_eof(&mut signature)? {
            self.done = true;
            return Ok(None);
        }
        let signature = u32::from_le_bytes(signature);
        match signature {
            LOCAL_FILE_SIGNATURE => {}
            CENTRAL_DIR_SIGNATURE
            | END_OF_CENTRAL_DIR_SIGNATURE
            | ZIP64_END_OF_CENTRAL_DIR_SIGNATURE
            | ZIP64_END_LOCATOR_SIGNATURE => {
                self.done = true;
                return Ok(None);
            }
            other => return Err(ZipStreamError::BadSignature(other)),
        }

        let mut fixed = [0u8; 26];
        self.read_exact(&mut fixed)?;
        let flags = u16::from_le_bytes([fixed[2], fixed[3]]);
        let method = u16::from_le_bytes([fixed[4], fixed[5]]);
        let crc_expected = u32::from_le_bytes([fixed[10], fixed[11], fixed[12], fixed[13]]);
        let mut compressed_size =
            u32::from_le_bytes([fixed[14], fixed[15], fixed[16], fixed[17]]) as u64;
        let mut uncompressed_size =
            u32::from_le_bytes([fixed[18], fixed[19], fixed[20], fixed[21]]) as u64;
        let name_len = u16::from_le_bytes([fixed[22], fixed[23]]) as usize;
        let extra_len = u16::from_le_bytes([fixed[24], fixed[25]]) as usize;

        let mut name_bytes = vec![0u8; name_len];
        self.read_exact(&mut name_bytes)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        let mut extra = vec![0u8; extra_len];
        self.read_exact(&mut extra)?;
        if compressed_size == u32::MAX as u64 || uncompressed_size == u32::MAX as u64 {
            (uncompressed_size, compressed_size) =
                parse_zip64_sizes(&extra, uncompressed_size, compressed_size);
        }

        if flags & FLAG_ENCRYPTED != 0 {
            return Err(ZipStreamError::Encrypted(name));
        }
        if method != METHOD_STORED && method != METHOD_DEFLATED {
            return Err(ZipStreamError::UnsupportedMethod { name, method });
        }
        let has_descriptor = flags & FLAG_DATA_DESCRIPTOR != 0;
        if has_descriptor && method == METHOD_STORED {
            return Err(ZipStreamError::StoredWithDescriptor(name));
        }

        let declared_size = (!has_descriptor).then_some(uncompressed_size);
        self.current = Some(EntryState {
            name: name.clone(),
            method,
            has_descriptor,
            compressed_remaining: compressed_size,
            compressed_consumed: 0,
            crc_expected,
            decompressor: (method == METHOD_DEFLATED).then(|| Decompress::new(false)),
            in_buf: vec![0u8; IN_BUF_SIZE],
            in_start: 0,
            in_end: 0,
            crc: Crc::new(),
            produced: 0,
            finished: false,
        });

        Ok(Some(ZipEntry {
            archive: self,
            name,
            declared_size,
        }))
    }

    /// Reads decompressed entry bytes into `out`. Returns 0 once the entry is
    /// exhausted (after consuming its trailing data descriptor, if any).
    fn read_entry(&mut self, out: &mut [u8]) -> Result<usize, ZipStreamError> {
        let Some(mut state) = self.current.take() else {
            return Ok(0);
        };
        let result = self.read_entry_inner(&mut state, out);
        self.current = Some(state);
        result
    }

    fn read_entry_inner(
        &mut self,
        state: &mut EntryState,
        out: &mut [u8],
    ) -> Result<usize, ZipStreamError> {
        if state.finished || out.is_empty() {
            return Ok(0);
        }

        if state.method == METHOD_STORED {
            return self.read_stored(state, out);
        }
        self.read_deflated(state, out)
    }

    fn read_stored(
        &mut self,
        state: &mut EntryState,
        out: &mut [u8],
    ) -> Result<usize, ZipStreamError> {
        if state.compressed_remaining == 0 {
            self.finish_entry(state)?;
            return Ok(0);
        }
        let want = out.len().min(state.compressed_remaining as usize);
        let n = self.read_some(&mut out[..want])?;
        if n == 0 {
            return Err(ZipStreamError::Truncated);
        }
        state.crc.update(&out[..n]);
        state.produced += n as u64;
        state.compressed_remaining -= n as u64;
        state.compressed_consumed += n as u64;
        if state.compressed_remaining == 0 {
            self.finish_entry(state)?;
        }
        Ok(n)
    }

    fn read_deflated(
        &mut self,
        state: &mut EntryState,
        out: &mut [u8],
    ) -> Result<usize, ZipStreamError> {
        loop {
            if state.in_start == state.in_end {
                let limit = if state.has_descriptor {
                    state.in_buf.len()
                } else {
                    state.in_buf.len().min(state.compressed_remaining as usize)
                };
                if limit > 0 {
                    let buf = &mut state.in_buf[..limit];
                    let n = read_some_raw(
                        &mut self.input,
                        &self.pushback,
                        &mut self.pushback_pos,
                        buf,
                    )?;
                    if n == 0 {
                        // More compressed bytes were expected.
                        return Err(ZipStreamError::Truncated);
                    }
                    state.in_start = 0;
                    state.in_end = n;
                }
            }

            let decompressor = state
                .decompressor
                .as_mut()
                .expect("deflated entries always carry a decompressor");
            let before_in = decompressor.total_in();
            let before_out = decompressor.total_out();
            let flush = if state.in_start == state.in_end {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let status = decompressor
                .decompress(&state.in_buf[state.in_start..state.in_end], out, flush)
                .map_err(|err| ZipStreamError::Deflate {
                    name: state.name.clone(),
                    message: err.to_string(),
                })?;
            let consumed = (decompressor.total_in() - before_in) as usize;
            let produced = (decompressor.total_out() - before_out) as usize;

            state.in_start += consumed;
            state.compressed_consumed += consumed as u64;
            if !state.has_descriptor {
                state.compressed_remaining -= consumed as u64;
            }
            state.crc.update(&out[..produced]);
            state.produced += produced as u64;

            match status {
                Status::StreamEnd => {
                    // Anything past the deflate stream belongs to the next
                    // header (or the data descriptor); give it back.
                    if state.in_start < state.in_end {
                        let leftover = state.in_buf[state.in_start..state.in_end].to_vec();
                        self.push_back(leftover);
                        state.in_start = state.in_end;
                    }
                    self.finish_entry(state)?;
                    return Ok(produced);
                }
                Status::Ok | Status::BufError => {
                    if produced > 0 {
                        return Ok(produced);
                    }
                    if state.in_start == state.in_end
                        && !state.has_descriptor
                        && state.compressed_remaining == 0
                    {
                        // All declared bytes consumed but the stream never
                        // terminated.
                        return Err(ZipStreamError::SizeMismatch {
                            name: state.name.clone(),
                        });
                    }
                    if status == Status::BufError && state.in_start != state.in_end {
                        return Err(ZipStreamError::Deflate {
                            name: state.name.clone(),
                            message: "decompressor stalled".into(),
                        });
                    }
                }
            }
        }
    }

    /// Validates the entry checksum, consuming the trailing data descriptor
    /// first when the entry has one.
    fn finish_entry(&mut self, state: &mut EntryState) -> Result<(), ZipStreamError> {
        if state.finished {
            return Ok(());
        }
        state.finished = true;

        if state.has_descriptor {
            let mut first = [0u8; 4];
            self.read_exact(&mut first)?;
            let mut crc = u32::from_le_bytes(first);
            if crc == DATA_DESCRIPTOR_SIGNATURE {
                self.read_exact(&mut first)?;
                crc = u32::from_le_bytes(first);
            }
            // ZIP64 descriptors carry 8-byte sizes; which form was written is
            // implied by the actual entry size.
            let wide = state.compressed_consumed > u32::MAX as u64
                || state.produced > u32::MAX as u64;
            let (compressed_size, uncompressed_size) = if wide {
                let mut sizes = [0u8; 16];
                self.read_exact(&mut sizes)?;
                (
                    u64::from_le_bytes(sizes[..8].try_into().unwrap()),
                    u64::from_le_bytes(sizes[8..].try_into().unwrap()),
                )
            } else {
                let mut sizes = [0u8; 8];
                self.read_exact(&mut sizes)?;
                (
                    u32::from_le_bytes(sizes[..4].try_into().unwrap()) as u64,
                    u32::from_le_bytes(sizes[4..].try_into().unwrap()) as u64,
                )
            };
            if compressed_size != state.compressed_consumed
                || uncompressed_size != state.produced
            {
                return Err(ZipStreamError::SizeMismatch {
                    name: state.name.clone(),
                });
            }
            state.crc_expected = crc;
        }

        if state.crc.sum() != state.crc_expected {
            return Err(ZipStreamError::CrcMismatch(state.name.clone()));
        }
        Ok(())
    }

    fn push_back(&mut self, bytes: Vec<u8>) {
        if self.pushback_pos >= self.pushback.len() {
            self.pushback = bytes;
            self.pushback_pos = 0;
        } else {
            let mut merged = bytes;
            merged.extend_from_slice(&self.pushback[self.pushback_pos..]);
            self.pushback = merged;
            self.pushback_pos = 0;
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_some_raw(&mut self.input, &self.pushback, &mut self.pushback_pos, buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ZipStreamError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..])?;
            if n == 0 {
                return Err(ZipStreamError::Truncated);
            }
            filled += n;
        }
        Ok(())
    }

    /// Like [`Self::read_exact`] but a clean EOF before the first byte
    /// returns `false`.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, ZipStreamError> {
        let n = self.read_some(buf)?;
        if n == 0 {
            return Ok(false);
        }
        let mut filled = n;
        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..])?;
            if n == 0 {
                return Err(ZipStreamError::Truncated);
            }
            filled += n;
        }
        Ok(true)
    }
}

fn read_some_raw<R: Read>(
    input: &mut R,
    pushback: &[u8],
    pushback_pos: &mut usize,
    buf: &mut [u8],
) -> io::Result<usize> {
    let pending = &pushback[(*pushback_pos).min(pushback.len())..];
    if !pending.is_empty() {
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        *pushback_pos += n;
        return Ok(n);
    }
    loop {
        match input.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Pulls 64-bit sizes out of a ZIP64 extended-information extra field. Fields
/// are only present for values that overflowed in the fixed header, in the
/// order uncompressed then compressed.
fn parse_zip64_sizes(extra: &[u8], mut uncompressed: u64, mut compressed: u64) -> (u64, u64) {
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        let Some(data) = rest.get(4..4 + len) else {
            break;
        };
        if id == 0x0001 {
            let mut data = data;
            if uncompressed == u32::MAX as u64 && data.len() >= 8 {
                uncompressed = u64::from_le_bytes(data[..8].try_into().unwrap());
                data = &data[8..];
            }
            if compressed == u32::MAX as u64 && data.len() >= 8 {
                compressed = u64::from_le_bytes(data[..8].try_into().unwrap());
            }
            break;
        }
        rest = &rest[4 + len..];
    }
    (uncompressed, compressed)
}
