//! Little-endian field codecs shared by the section encoders.
//!
//! Reads never trust a length prefix: counts are checked against a
//! per-field ceiling and buffers are reserved fallibly, so a hostile file
//! turns into an error instead of an allocation abort.

use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};

macro_rules! le_field {
    ($write:ident, $read:ident, $ty:ty) => {
        fn $write(&mut self, v: $ty) -> Result<()>
        where
            Self: Write,
        {
            self.write_all(&v.to_le_bytes())?;
            Ok(())
        }

        fn $read(&mut self) -> Result<$ty>
        where
            Self: Read,
        {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            self.read_exact(&mut buf)?;
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

/// Field-level encoding on top of any byte stream.
pub trait SnapshotField {
    le_field!(write_u8, read_u8, u8);
    le_field!(write_u16_le, read_u16_le, u16);
    le_field!(write_u32_le, read_u32_le, u32);
    le_field!(write_u64_le, read_u64_le, u64);

    fn write_bool(&mut self, v: bool) -> Result<()>
    where
        Self: Write,
    {
        self.write_u8(u8::from(v))
    }

    fn read_bool(&mut self, what: &'static str) -> Result<bool>
    where
        Self: Read,
    {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::InvalidField(what)),
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>
    where
        Self: Write,
    {
        self.write_all(bytes)?;
        Ok(())
    }

    /// Length prefix for a variable-sized field.
    fn write_count(&mut self, len: usize, what: &'static str) -> Result<()>
    where
        Self: Write,
    {
        let len = u32::try_from(len).map_err(|_| SnapshotError::TooLarge(what))?;
        self.write_u32_le(len)
    }

    fn read_count(&mut self, max: u32, what: &'static str) -> Result<usize>
    where
        Self: Read,
    {
        let n = self.read_u32_le()?;
        if n > max {
            return Err(SnapshotError::InvalidField(what));
        }
        Ok(n as usize)
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>>
    where
        Self: Read,
    {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| SnapshotError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: ?Sized> SnapshotField for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn huge_buffer_reports_out_of_memory() {
        let mut cursor = Cursor::new(Vec::new());
        let err = cursor.read_exact_vec(usize::MAX).unwrap_err();
        assert!(matches!(err, SnapshotError::OutOfMemory { .. }));
    }

    #[test]
    fn bool_names_the_offending_field() {
        let mut cursor = Cursor::new(vec![2u8]);
        assert!(matches!(
            cursor.read_bool("halted"),
            Err(SnapshotError::InvalidField("halted"))
        ));
    }

    #[test]
    fn count_above_ceiling_is_rejected() {
        let mut buf = Vec::new();
        buf.write_count(17, "deadlines").unwrap();
        let mut cursor = Cursor::new(&buf);
        assert!(matches!(
            cursor.read_count(16, "deadlines"),
            Err(SnapshotError::InvalidField("deadlines"))
        ));
        assert_eq!(Cursor::new(&buf).read_count(17, "deadlines").unwrap(), 17);
    }
}
