//! Seekable, indexed gzip decompression.
//!
//! [`GzipReader`] decompresses a gzip stream while recording restore points
//! ([`IndexPoint`]) every `index_interval` uncompressed bytes. A restore
//! point carries the full inflater state, so a later [`GzipReader::seek`] can
//! resume decompression near the target instead of re-reading from the start.
//! The [`Index`] serializes to a portable binary form and can be loaded into
//! a new reader over the same file in a later process.
//!
//! Reads verify the gzip trailer (CRC32 + uncompressed size) the first time
//! the contiguous read frontier reaches end-of-stream. Restoring at an index
//! point skips frontier bytes, making the checksum unverifiable for that
//! stretch; verification then resumes from the next member boundary the
//! frontier crosses. Concatenated multi-member streams read as one logical
//! uncompressed stream, with the trailer check applied at end-of-stream only.
//!
//! Any IO or corruption error is sticky: subsequent calls keep returning an
//! equivalent error.

mod dict;
mod huffman;
mod index;
mod inflate;
mod state;
mod tell;

pub use index::{Index, IndexPoint};

use std::io::{Read, Seek, SeekFrom};

use crate::error::{MigrateError, Result};
use inflate::Inflater;
use tell::TellReader;

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_DEFLATE: u8 = 8;

const FLAG_HDR_CRC: u8 = 1 << 1;
const FLAG_EXTRA: u8 = 1 << 2;
const FLAG_NAME: u8 = 1 << 3;
const FLAG_COMMENT: u8 = 1 << 4;

/// How often the reader captures decompressor state by default.
pub const DEFAULT_INDEX_INTERVAL: u64 = 1024 * 1024;

/// Metadata from the first gzip member's header.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Original file name, if recorded.
    pub name: Option<String>,
    /// Free-form comment, if recorded.
    pub comment: Option<String>,
    /// Extra field bytes, if recorded.
    pub extra: Option<Vec<u8>>,
    /// Modification time as seconds since the Unix epoch; 0 means unset.
    pub mtime: u32,
    /// Operating system byte from the header.
    pub os: u8,
}

/// A seekable reader over the uncompressed contents of a gzip stream.
#[derive(Debug)]
pub struct GzipReader<R: Read + Seek> {
    tell: TellReader<R>,
    inflater: Inflater,
    index: Index,
    index_interval: u64,
    header: Header,

    /// Uncompressed position already delivered to the caller.
    pos: u64,
    /// Largest contiguous uncompressed position observed this run.
    furthest_read: u64,
    at_eof: bool,

    crc: crc32fast::Hasher,
    size: u32,
    digest_valid: bool,
    checked_digest: bool,

    err: Option<MigrateError>,
}

/// Rebuild an equivalent error for sticky-error replay.
fn replicate(e: &MigrateError) -> MigrateError {
    match e {
        MigrateError::Header(s) => MigrateError::Header(s.clone()),
        MigrateError::Checksum(s) => MigrateError::Checksum(s.clone()),
        MigrateError::InvalidSeek(o) => MigrateError::InvalidSeek(*o),
        MigrateError::UnsupportedSeek => MigrateError::UnsupportedSeek,
        MigrateError::UnsupportedState(v) => MigrateError::UnsupportedState(*v),
        MigrateError::Io(e) => {
            MigrateError::Io(std::io::Error::new(e.kind(), e.to_string()))
        }
        other => MigrateError::Io(std::io::Error::other(other.to_string())),
    }
}

/// Parse one gzip member header, returning its metadata.
fn read_header<R: Read + Seek>(tell: &mut TellReader<R>) -> Result<Header> {
    let mut buf = [0u8; 10];
    tell.read_exact(&mut buf)?;
    if buf[0] != GZIP_ID1 || buf[1] != GZIP_ID2 || buf[2] != GZIP_DEFLATE {
        return Err(MigrateError::Header("bad magic or compression method".into()));
    }
    let flags = buf[3];
    let mtime = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let os = buf[9];

    let mut hdr_crc = crc32fast::Hasher::new();
    hdr_crc.update(&buf);

    let mut header = Header {
        mtime,
        os,
        ..Default::default()
    };

    if flags & FLAG_EXTRA != 0 {
        let mut len_buf = [0u8; 2];
        tell.read_exact(&mut len_buf)?;
        hdr_crc.update(&len_buf);
        let mut extra = vec![0u8; u16::from_le_bytes(len_buf) as usize];
        tell.read_exact(&mut extra)?;
        hdr_crc.update(&extra);
        header.extra = Some(extra);
    }

    // Strings are NUL-terminated ISO 8859-1 (RFC 1952 §2.3.1).
    let mut read_string = |tell: &mut TellReader<R>| -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = tell.read_byte()?;
            hdr_crc.update(&[b]);
            if b == 0 {
                break;
            }
            if bytes.len() >= 512 {
                return Err(MigrateError::Header("unterminated header string".into()));
            }
            bytes.push(b);
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    };

    if flags & FLAG_NAME != 0 {
        header.name = Some(read_string(tell)?);
    }
    if flags & FLAG_COMMENT != 0 {
        header.comment = Some(read_string(tell)?);
    }

    if flags & FLAG_HDR_CRC != 0 {
        let mut crc_buf = [0u8; 2];
        tell.read_exact(&mut crc_buf)?;
        let expected = u16::from_le_bytes(crc_buf);
        let actual = hdr_crc.finalize() as u16;
        if expected != actual {
            return Err(MigrateError::Header("header checksum mismatch".into()));
        }
    }

    Ok(header)
}

impl<R: Read + Seek> GzipReader<R> {
    /// Open a gzip stream with the default index interval.
    pub fn new(source: R) -> Result<Self> {
        Self::with_interval(source, DEFAULT_INDEX_INTERVAL)
    }

    /// Open a gzip stream, capturing restore points every `index_interval`
    /// uncompressed bytes. The header is parsed eagerly.
    pub fn with_interval(source: R, index_interval: u64) -> Result<Self> {
        let mut tell = TellReader::new(source)?;
        let header = read_header(&mut tell)?;
        let index = Index::starting_at(tell.offset());

        Ok(Self {
            tell,
            inflater: Inflater::new(),
            index,
            index_interval,
            header,
            pos: 0,
            furthest_read: 0,
            at_eof: false,
            crc: crc32fast::Hasher::new(),
            size: 0,
            digest_valid: true,
            checked_digest: false,
            err: None,
        })
    }

    /// Replace the reader's index with a previously saved one.
    ///
    /// The index is trusted without reverification; it must describe the
    /// same compressed stream.
    pub fn with_index(mut self, index: Index) -> Self {
        self.index = index;
        self
    }

    /// First member's header metadata.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The index built (or loaded) so far.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Consume the reader, keeping its index.
    pub fn into_index(self) -> Index {
        self.index
    }

    /// Uncompressed position already delivered to the caller.
    pub fn current_offset(&self) -> u64 {
        self.pos
    }

    fn stick(&mut self, e: MigrateError) -> MigrateError {
        self.err = Some(replicate(&e));
        e
    }

    /// Pull uncompressed bytes; `Ok(0)` only at end of stream.
    pub fn read_uncompressed(&mut self, out: &mut [u8]) -> Result<usize> {
        if let Some(e) = &self.err {
            return Err(replicate(e));
        }
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.at_eof {
                return Ok(0);
            }

            let n = match self.inflater.read(&mut self.tell, out) {
                Ok(n) => n,
                Err(e) => return Err(self.stick(e)),
            };

            if n > 0 {
                self.pos += n as u64;
                if self.pos > self.furthest_read {
                    if self.digest_valid {
                        // Only the not-previously-seen suffix of this read
                        // extends the frontier.
                        let start = (self.furthest_read - (self.pos - n as u64)) as usize;
                        let new = &out[start..n];
                        self.crc.update(new);
                        self.size = self.size.wrapping_add(new.len() as u32);
                    }
                    self.furthest_read = self.pos;
                }
                if self.pos >= self.index.last_uncompressed_offset() + self.index_interval {
                    self.add_point_to_index();
                }
                return Ok(n);
            }

            // The current member's deflate stream is done.
            if let Err(e) = self.member_end() {
                return Err(self.stick(e));
            }
        }
    }

    /// Capture inflater state before the next symbol is consumed, so that
    /// replay from this point reproduces the same bytes.
    fn add_point_to_index(&mut self) {
        let state = state::encode(&self.inflater);
        self.index.push(IndexPoint {
            compressed_offset: self.tell.offset(),
            uncompressed_offset: self.pos,
            state,
        });
    }

    /// Consume a member trailer; verify at end-of-stream, or start the next
    /// member of a concatenated stream.
    fn member_end(&mut self) -> Result<()> {
        let mut trailer = [0u8; 8];
        self.tell.read_exact(&mut trailer)?;
        let digest = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let expected_size = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

        let at_frontier = self.pos == self.furthest_read;

        if self.tell.peek()?.is_none() {
            // End of the compressed stream: verify the final member against
            // the bytes this run actually produced, exactly once.
            if !self.checked_digest && self.digest_valid && at_frontier {
                let actual = self.crc.clone().finalize();
                if actual != digest {
                    return Err(MigrateError::Checksum(format!(
                        "crc32 mismatch: stream has {:08x}, data is {:08x}",
                        digest, actual
                    )));
                }
                if self.size != expected_size {
                    return Err(MigrateError::Checksum(format!(
                        "length mismatch: stream has {}, data is {}",
                        expected_size, self.size
                    )));
                }
                self.checked_digest = true;
            }
            self.at_eof = true;
            return Ok(());
        }

        // Another member follows; its predecessor's trailer is not verified
        // (end-of-stream check only). The running digest restarts here when
        // the frontier crosses the boundary, making the final member
        // verifiable even after an earlier state restore.
        read_header(&mut self.tell)?;
        self.inflater = Inflater::new();
        if at_frontier {
            self.crc = crc32fast::Hasher::new();
            self.size = 0;
            self.digest_valid = true;
        }
        Ok(())
    }

    /// Seek within the uncompressed stream.
    ///
    /// Forward seeks decompress (and index) the skipped data, restoring at
    /// an index point first when one is far enough ahead to pay off.
    /// Backward seeks always restore at the closest point before the target.
    /// Seeking from the end is not supported.
    pub fn seek_uncompressed(&mut self, pos: SeekFrom) -> Result<u64> {
        if let Some(e) = &self.err {
            return Err(replicate(e));
        }

        let target = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(o) => self.pos as i64 + o,
            SeekFrom::End(_) => return Err(MigrateError::UnsupportedSeek),
        };
        if target < 0 {
            return Err(MigrateError::InvalidSeek(target));
        }
        let target = target as u64;

        if target == self.pos {
            return Ok(self.pos);
        }

        if target > self.pos {
            // Only restore when the closest point skips more than one
            // interval of sequential decompression.
            let point = self
                .index
                .closest_point_before(target)
                .filter(|p| p.uncompressed_offset > self.pos + self.index_interval)
                .cloned();
            if let Some(p) = point {
                self.restore_at_point(&p)?;
            }
        } else {
            let point = self.index.closest_point_before(target).cloned();
            match point {
                Some(p) => self.restore_at_point(&p)?,
                None => {
                    return Err(self.stick(MigrateError::Io(std::io::Error::other(
                        "index has no restore point before target",
                    ))))
                }
            }
        }

        self.discard(target - self.pos)?;
        Ok(self.pos)
    }

    fn restore_at_point(&mut self, p: &IndexPoint) -> Result<()> {
        self.tell.seek_reset(p.compressed_offset)?;
        self.inflater = if p.state.is_empty() {
            Inflater::new()
        } else {
            match state::decode(&p.state) {
                Ok(inf) => inf,
                Err(e) => return Err(self.stick(e)),
            }
        };
        self.pos = p.uncompressed_offset;
        self.at_eof = false;
        if self.pos > self.furthest_read {
            // Frontier bytes were skipped; the running digest no longer
            // covers the stream up to here.
            self.digest_valid = false;
            self.furthest_read = self.pos;
        }
        Ok(())
    }

    /// Read and drop `n` uncompressed bytes; stops early at end of stream.
    fn discard(&mut self, mut n: u64) -> Result<()> {
        let mut buf = vec![0u8; 32 * 1024];
        while n > 0 {
            let want = (buf.len() as u64).min(n) as usize;
            let got = self.read_uncompressed(&mut buf[..want])?;
            if got == 0 {
                break;
            }
            n -= got as u64;
        }
        Ok(())
    }
}

impl<R: Read + Seek> Read for GzipReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_uncompressed(buf).map_err(std::io::Error::other)
    }
}

impl<R: Read + Seek> Seek for GzipReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.seek_uncompressed(pos).map_err(std::io::Error::other)
    }
}
