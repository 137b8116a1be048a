use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};
use crate::io::SnapshotField;

const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(SnapshotError::InvalidField("compression kind")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamWriteOptions {
    pub compression: Compression,
    /// Guest RAM is split into chunks of this many bytes, each compressed
    /// independently.
    pub chunk_size: u32,
}

impl Default for RamWriteOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Lz4,
            chunk_size: 1024 * 1024,
        }
    }
}

pub fn encode_ram_section<W: Write>(w: &mut W, ram: &[u8], opts: RamWriteOptions) -> Result<()> {
    if opts.chunk_size == 0 || opts.chunk_size > MAX_CHUNK_SIZE {
        return Err(SnapshotError::TooLarge("RAM chunk size"));
    }

    w.write_u64_le(ram.len() as u64)?;
    w.write_u8(opts.compression as u8)?;
    w.write_u8(0)?; // reserved
    w.write_u16_le(0)?; // reserved
    w.write_u32_le(opts.chunk_size)?;

    for chunk in ram.chunks(opts.chunk_size as usize) {
        let stored = compress(opts.compression, chunk);
        w.write_u32_le(chunk.len() as u32)?;
        w.write_count(stored.len(), "compressed RAM chunk")?;
        w.write_bytes(&stored)?;
    }
    Ok(())
}

/// Decode a RAM section into `ram`, which must already have the snapshot's length.
pub fn decode_ram_section_into<R: Read>(r: &mut R, ram: &mut [u8]) -> Result<()> {
    let total_len = r.read_u64_le()?;
    if total_len != ram.len() as u64 {
        return Err(SnapshotError::RamLenMismatch {
            expected: ram.len() as u64,
            found: total_len,
        });
    }
    let compression = Compression::from_u8(r.read_u8()?)?;
    let _reserved = r.read_u8()?;
    let _reserved = r.read_u16_le()?;
    let chunk_size = r.read_u32_le()?;
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(SnapshotError::InvalidField("RAM chunk size"));
    }

    for chunk in ram.chunks_mut(chunk_size as usize) {
        let uncompressed_len = r.read_u32_le()?;
        if uncompressed_len as usize != chunk.len() {
            return Err(SnapshotError::InvalidField("RAM chunk length"));
        }
        let stored_len = r.read_u32_le()?;
        validate_stored_len(compression, uncompressed_len, stored_len)?;
        let stored = r.read_exact_vec(stored_len as usize)?;
        match compression {
            Compression::None => chunk.copy_from_slice(&stored),
            Compression::Lz4 => {
                let written = lz4_flex::block::decompress_into(&stored, chunk)?;
                if written != chunk.len() {
                    return Err(SnapshotError::InvalidField("lz4 chunk decompressed length"));
                }
            }
        }
    }
    Ok(())
}

fn compress(kind: Compression, input: &[u8]) -> Vec<u8> {
    match kind {
        Compression::None => input.to_vec(),
        Compression::Lz4 => lz4_flex::block::compress(input),
    }
}

fn max_lz4_compressed_len(uncompressed_len: u32) -> u32 {
    // LZ4 worst case: uncompressed + uncompressed / 255 + 16
    uncompressed_len
        .saturating_add(uncompressed_len / 255)
        .saturating_add(16)
}

fn validate_stored_len(compression: Compression, uncompressed_len: u32, stored_len: u32) -> Result<()> {
    match compression {
        Compression::None if stored_len != uncompressed_len => {
            Err(SnapshotError::InvalidField("uncompressed chunk stored length"))
        }
        Compression::Lz4 if stored_len > max_lz4_compressed_len(uncompressed_len) => {
            Err(SnapshotError::InvalidField("lz4 chunk stored length"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn lz4_chunks_restore_exact_bytes() {
        let ram = patterned(10_000);
        let mut buf = Vec::new();
        let opts = RamWriteOptions {
            compression: Compression::Lz4,
            chunk_size: 4096,
        };
        encode_ram_section(&mut buf, &ram, opts).unwrap();

        let mut out = vec![0u8; ram.len()];
        decode_ram_section_into(&mut Cursor::new(&buf), &mut out).unwrap();
        assert_eq!(out, ram);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut buf = Vec::new();
        encode_ram_section(&mut buf, &[0u8; 64], RamWriteOptions::default()).unwrap();

        let mut out = vec![0u8; 128];
        let err = decode_ram_section_into(&mut Cursor::new(&buf), &mut out).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::RamLenMismatch {
                expected: 128,
                found: 64
            }
        ));
    }

    #[test]
    fn uncompressed_chunk_with_wrong_stored_len_is_rejected() {
        let mut buf = Vec::new();
        let opts = RamWriteOptions {
            compression: Compression::None,
            chunk_size: 16,
        };
        encode_ram_section(&mut buf, &[0xaa; 16], opts).unwrap();
        // Header is 16 bytes, then the chunk's uncompressed length; bump the stored length.
        buf[20] = 17;

        let mut out = vec![0u8; 16];
        let err = decode_ram_section_into(&mut Cursor::new(&buf), &mut out).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::InvalidField("uncompressed chunk stored length")
        ));
    }
}
