//! Serialization of captured inflater state.
//!
//! The blob is opaque to callers but self-describing: it starts with a
//! one-byte format version so that a future layout change fails loudly on
//! load instead of resuming with garbage. All integers are little-endian.
//!
//! Layout (version 1):
//! ```text
//! u8  version
//! u32 bit buffer        u8 bit count
//! u8  final-block       u8 finished
//! u8  step              u8 huff-state      u8 table-kind
//! u32 copy_len          u32 copy_dist
//! u16 nlit              u16 ndist
//! [nlit+ndist] u8       dynamic code lengths (only when table-kind = dynamic)
//! u32 wr_pos            u32 rd_pos         u8 full
//! [32768] u8            window history
//! u32 to_read start     u32 to_read end
//! ```

use crate::error::{MigrateError, Result};
use crate::gzindex::dict::{DictDecoder, WINDOW_SIZE};
use crate::gzindex::huffman::{MAX_NUM_DIST, MAX_NUM_LIT};
use crate::gzindex::inflate::{HuffState, Inflater, Step, TableKind};

pub(crate) const STATE_VERSION: u8 = 1;

fn invalid(msg: &str) -> MigrateError {
    MigrateError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("corrupt decompressor state: {}", msg),
    ))
}

pub(crate) fn encode(inf: &Inflater) -> Vec<u8> {
    let dynamic = inf.table == TableKind::Dynamic;
    let nlen = inf.nlit + inf.ndist;
    let mut out = Vec::with_capacity(64 + WINDOW_SIZE + if dynamic { nlen } else { 0 });

    out.push(STATE_VERSION);
    out.extend_from_slice(&inf.b.to_le_bytes());
    out.push(inf.nb as u8);
    out.push(inf.final_block as u8);
    out.push(inf.finished as u8);
    out.push(match inf.step {
        Step::NextBlock => 0,
        Step::HuffmanBlock => 1,
        Step::CopyData => 2,
    });
    out.push(match inf.huff_state {
        HuffState::ReadLiteral => 0,
        HuffState::CopyHistory => 1,
    });
    out.push(match inf.table {
        TableKind::None => 0,
        TableKind::Fixed => 1,
        TableKind::Dynamic => 2,
    });
    out.extend_from_slice(&(inf.copy_len as u32).to_le_bytes());
    out.extend_from_slice(&(inf.copy_dist as u32).to_le_bytes());
    out.extend_from_slice(&(inf.nlit as u16).to_le_bytes());
    out.extend_from_slice(&(inf.ndist as u16).to_le_bytes());
    if dynamic {
        for &len in inf.bits[..nlen].iter() {
            out.push(len as u8);
        }
    }
    out.extend_from_slice(&(inf.dict.wr_pos as u32).to_le_bytes());
    out.extend_from_slice(&(inf.dict.rd_pos as u32).to_le_bytes());
    out.push(inf.dict.full as u8);
    out.extend_from_slice(&inf.dict.hist);
    out.extend_from_slice(&(inf.to_read.start as u32).to_le_bytes());
    out.extend_from_slice(&(inf.to_read.end as u32).to_le_bytes());

    out
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(invalid("truncated"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

pub(crate) fn decode(blob: &[u8]) -> Result<Inflater> {
    let mut c = Cursor { data: blob, pos: 0 };

    let version = c.u8()?;
    if version != STATE_VERSION {
        return Err(MigrateError::UnsupportedState(version));
    }

    let mut inf = Inflater::new();
    inf.b = c.u32()?;
    inf.nb = c.u8()? as u32;
    inf.final_block = c.u8()? != 0;
    inf.finished = c.u8()? != 0;
    inf.step = match c.u8()? {
        0 => Step::NextBlock,
        1 => Step::HuffmanBlock,
        2 => Step::CopyData,
        _ => return Err(invalid("unknown step")),
    };
    inf.huff_state = match c.u8()? {
        0 => HuffState::ReadLiteral,
        1 => HuffState::CopyHistory,
        _ => return Err(invalid("unknown block sub-state")),
    };
    inf.table = match c.u8()? {
        0 => TableKind::None,
        1 => TableKind::Fixed,
        2 => TableKind::Dynamic,
        _ => return Err(invalid("unknown table kind")),
    };
    inf.copy_len = c.u32()? as usize;
    inf.copy_dist = c.u32()? as usize;
    inf.nlit = c.u16()? as usize;
    inf.ndist = c.u16()? as usize;

    if inf.table == TableKind::Dynamic {
        if inf.nlit > MAX_NUM_LIT || inf.ndist > MAX_NUM_DIST {
            return Err(invalid("code length counts out of range"));
        }
        let nlen = inf.nlit + inf.ndist;
        let lengths = c.take(nlen)?;
        for (i, &len) in lengths.iter().enumerate() {
            inf.bits[i] = len as u32;
        }
        // Rebuild the block's Huffman tables from the recorded lengths; the
        // tables themselves are derived data and never serialized.
        let bits = *inf.bits;
        if !inf.h1.init(&bits[..inf.nlit]) || !inf.h2.init(&bits[inf.nlit..nlen]) {
            return Err(invalid("code lengths do not form a valid code"));
        }
        if inf.h1.min < inf.bits[256] {
            inf.h1.min = inf.bits[256];
        }
    }

    let wr_pos = c.u32()? as usize;
    let rd_pos = c.u32()? as usize;
    let full = c.u8()? != 0;
    if rd_pos > wr_pos || wr_pos > WINDOW_SIZE {
        return Err(invalid("window positions out of range"));
    }
    let hist = c.take(WINDOW_SIZE)?;
    let mut dict = DictDecoder::new();
    dict.hist.copy_from_slice(hist);
    dict.wr_pos = wr_pos;
    dict.rd_pos = rd_pos;
    dict.full = full;
    inf.dict = dict;

    let start = c.u32()? as usize;
    let end = c.u32()? as usize;
    if start > end || end > WINDOW_SIZE {
        return Err(invalid("pending output range out of range"));
    }
    inf.to_read = start..end;

    if c.pos != blob.len() {
        return Err(invalid("trailing bytes"));
    }

    Ok(inf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_fresh() {
        let inf = Inflater::new();
        let blob = encode(&inf);
        let restored = decode(&blob).unwrap();
        assert_eq!(restored.b, 0);
        assert_eq!(restored.step, Step::NextBlock);
        assert_eq!(restored.table, TableKind::None);
        assert!(!restored.finished);
    }

    #[test]
    fn test_round_trip_mid_block() {
        let mut inf = Inflater::new();
        inf.b = 0xDEAD;
        inf.nb = 13;
        inf.step = Step::HuffmanBlock;
        inf.huff_state = HuffState::CopyHistory;
        inf.table = TableKind::Fixed;
        inf.copy_len = 42;
        inf.copy_dist = 7;
        inf.final_block = true;
        inf.dict.write_byte(b'x');
        inf.dict.write_byte(b'y');

        let blob = encode(&inf);
        let restored = decode(&blob).unwrap();
        assert_eq!(restored.b, 0xDEAD);
        assert_eq!(restored.nb, 13);
        assert_eq!(restored.step, Step::HuffmanBlock);
        assert_eq!(restored.huff_state, HuffState::CopyHistory);
        assert_eq!(restored.copy_len, 42);
        assert_eq!(restored.copy_dist, 7);
        assert!(restored.final_block);
        assert_eq!(restored.dict.wr_pos, 2);
        assert_eq!(&restored.dict.hist[..2], b"xy");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let inf = Inflater::new();
        let mut blob = encode(&inf);
        blob[0] = 99;
        match decode(&blob) {
            Err(MigrateError::UnsupportedState(99)) => {}
            other => panic!("expected UnsupportedState, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let inf = Inflater::new();
        let blob = encode(&inf);
        assert!(decode(&blob[..blob.len() / 2]).is_err());
    }

    #[test]
    fn test_dynamic_lengths_round_trip() {
        let mut inf = Inflater::new();
        inf.table = TableKind::Dynamic;
        // A minimal valid literal alphabet: 256 one-bit codes is not valid,
        // so use a realistic complete set: symbols 'a' and EOB.
        inf.nlit = 257;
        inf.ndist = 1;
        for i in 0..inf.nlit + inf.ndist {
            inf.bits[i] = 0;
        }
        inf.bits[b'a' as usize] = 1;
        inf.bits[256] = 1;
        inf.bits[257] = 1; // single distance code (degenerate, allowed)

        let blob = encode(&inf);
        let restored = decode(&blob).unwrap();
        assert_eq!(restored.nlit, 257);
        assert_eq!(restored.ndist, 1);
        assert_eq!(restored.bits[b'a' as usize], 1);
        assert!(restored.h1.min >= 1);
    }
}
