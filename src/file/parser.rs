//! Cursor-based byte stream parser for payload blobs and method bodies.
//!
//! This module provides the [`crate::file::parser::Parser`] type, a bounds-checked cursor over
//! a byte slice. Decrypted payloads are mostly little-endian tables, .NET `BinaryReader`
//! strings and 7-bit encoded integers, so the parser offers exactly those primitives.
//!
//! # Key Components
//!
//! ## Navigation Methods
//! - [`crate::file::parser::Parser::seek`] - Move to specific position
//! - [`crate::file::parser::Parser::advance_by`] - Move forward by specified bytes
//! - [`crate::file::parser::Parser::pos`] - Get current position
//! - [`crate::file::parser::Parser::transactional`] - Restore the position when a read fails
//!
//! ## Data Access Methods
//! - [`crate::file::parser::Parser::read_le`] - Read primitive types (little-endian)
//! - [`crate::file::parser::Parser::read_bytes`] - Borrow a slice of the input
//! - [`crate::file::parser::Parser::read_7bit_encoded_int`] - Read 7-bit encoded integers
//! - [`crate::file::parser::Parser::read_prefixed_string_utf8`] - Read `BinaryReader` strings
//! - [`crate::file::parser::Parser::read_utf16_bytes`] - Read a fixed number of UTF-16 bytes
//!
//! # Usage Examples
//!
//! ```rust
//! use dotscope_deob::file::Parser;
//!
//! let data = [0x96, 0x01, 0x2A, 0x00, 0x00, 0x00];
//! let mut parser = Parser::new(&data);
//!
//! assert_eq!(parser.read_7bit_encoded_int()?, 150);
//! assert_eq!(parser.read_le::<i32>()?, 42);
//! assert!(!parser.has_more_data());
//! # Ok::<(), dotscope_deob::Error>(())
//! ```

use widestring::U16Str;

use crate::{
    file::io::{read_le_at, CilIO},
    Result,
};

/// A generic binary data parser for reading payload blobs and CIL method bodies.
///
/// The parser keeps a position inside the borrowed buffer. Every read validates the
/// remaining length first and either returns the full value or an error, so callers never
/// observe partially decoded values.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`crate::file::parser::Parser`] from a byte slice.
    ///
    /// # Arguments
    /// * `data` - The byte slice to read from
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the underlying buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if there is still data left to read.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Number of bytes left after the current position.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Move the position to a specific offset.
    ///
    /// Seeking to the very end of the buffer is allowed; any subsequent read fails.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by the specified number of bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if advancing by step would exceed the data length.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        self.calc_end_position(step)?;
        self.position += step;
        Ok(())
    }

    /// Get the current position of the parser within the data buffer.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Get access to the underlying data buffer.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Peek at the byte at the current position without advancing.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the position is at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data
            .get(self.position)
            .copied()
            .ok_or(out_of_bounds_error!())
    }

    /// Run `f`, restoring the position if it fails.
    ///
    /// # Errors
    /// Propagates the error returned by `f`.
    pub fn transactional<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let saved_position = self.position;
        let result = f(self);
        if result.is_err() {
            self.position = saved_position;
        }
        result
    }

    /// Read a type `T` from the current position in little-endian format and advance the position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read a 7-bit encoded unsigned integer.
    ///
    /// Each byte contributes its low 7 bits, least significant group first. A set high bit
    /// means another byte follows. This is the encoding used by `BinaryWriter.Write7BitEncodedInt`
    /// and by several obfuscators for string and array lengths.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the data ends inside the value or
    /// [`crate::Error::Malformed`] if the encoding does not terminate within 5 bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotscope_deob::file::Parser;
    ///
    /// let mut parser = Parser::new(&[0x96, 0x01]);
    /// assert_eq!(parser.read_7bit_encoded_int()?, 150);
    /// # Ok::<(), dotscope_deob::Error>(())
    /// ```
    pub fn read_7bit_encoded_int(&mut self) -> Result<u32> {
        let mut value = 0u32;
        let mut shift = 0;

        loop {
            let byte = self.peek_byte()?;
            self.position += 1;

            value |= u32::from(byte & 0x7F) << shift;
            shift += 7;

            if (byte & 0x80) == 0 {
                break;
            }

            if shift >= 35 {
                return Err(malformed_error!(
                    "7-bit encoded integer overflow: value exceeds u32 capacity after {} bits",
                    shift
                ));
            }
        }

        Ok(value)
    }

    /// Read a `BinaryReader.ReadString` value: a 7-bit encoded byte length followed by UTF-8.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the string is truncated or
    /// [`crate::Error::Malformed`] for invalid UTF-8.
    pub fn read_prefixed_string_utf8(&mut self) -> Result<String> {
        let length = self.read_7bit_encoded_int()? as usize;
        let bytes = self.read_bytes(length)?;

        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(malformed_error!("Invalid UTF-8 string of {} bytes", length)),
        }
    }

    /// Read exactly `length` bytes of UTF-16LE text.
    ///
    /// Unpaired surrogates are replaced rather than rejected, matching how the runtime
    /// decodes obfuscated string blobs.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes remain or
    /// [`crate::Error::Malformed`] if `length` is odd.
    pub fn read_utf16_bytes(&mut self, length: usize) -> Result<String> {
        if length % 2 != 0 {
            return Err(malformed_error!("Invalid UTF-16 length - {}", length));
        }

        let bytes = self.read_bytes(length)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(U16Str::from_slice(&units).to_string_lossy())
    }

    /// Calculate the end position of a read of `length` bytes, checking bounds.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the read would exceed the data length.
    pub fn calc_end_position(&self, length: usize) -> Result<usize> {
        match self.position.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(end),
            _ => Err(out_of_bounds_error!()),
        }
    }

    /// Read `length` bytes and advance past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if reading would exceed the data length.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.calc_end_position(length)?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_read_7bit_encoded_int_single_byte() {
        {
            let mut parser = Parser::new(&[0x00]);
            assert_eq!(parser.read_7bit_encoded_int().unwrap(), 0);
            assert_eq!(parser.pos(), 1);
        }

        {
            let mut parser = Parser::new(&[0x7F]);
            assert_eq!(parser.read_7bit_encoded_int().unwrap(), 127);
            assert_eq!(parser.pos(), 1);
        }
    }

    #[test]
    fn test_read_7bit_encoded_int_two_bytes() {
        {
            let mut parser = Parser::new(&[0x96, 0x01]);
            assert_eq!(parser.read_7bit_encoded_int().unwrap(), 150);
            assert_eq!(parser.pos(), 2);
        }

        {
            let mut parser = Parser::new(&[0xFF, 0x7F]);
            assert_eq!(parser.read_7bit_encoded_int().unwrap(), 16383);
        }
    }

    #[test]
    fn test_read_7bit_encoded_int_max() {
        let mut parser = Parser::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(parser.read_7bit_encoded_int().unwrap(), u32::MAX);
    }

    #[test]
    fn test_read_7bit_encoded_int_errors() {
        let mut parser = Parser::new(&[0x80]);
        assert!(matches!(
            parser.read_7bit_encoded_int(),
            Err(Error::OutOfBounds)
        ));

        let mut parser = Parser::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(matches!(
            parser.read_7bit_encoded_int(),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_read_prefixed_string_utf8() {
        let mut parser = Parser::new(b"\x05Hello\x00");
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), "Hello");
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), "");
        assert!(!parser.has_more_data());

        let mut parser = Parser::new(b"\x09short");
        assert!(parser.read_prefixed_string_utf8().is_err());
    }

    #[test]
    fn test_read_utf16_bytes() {
        let data = [0x48, 0x00, 0x69, 0x00, 0x21, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_utf16_bytes(4).unwrap(), "Hi");
        assert!(matches!(
            parser.read_utf16_bytes(1),
            Err(Error::Malformed { .. })
        ));
        assert!(parser.read_utf16_bytes(4).is_err());
    }

    #[test]
    fn test_transactional_restores_position() {
        let mut parser = Parser::new(&[0x01, 0x02]);
        let result: Result<u32> = parser.transactional(|p| {
            p.read_le::<u8>()?;
            p.read_le::<u32>()
        });
        assert!(result.is_err());
        assert_eq!(parser.pos(), 0);
    }

    #[test]
    fn test_seek_and_advance() {
        let mut parser = Parser::new(&[0x01, 0x02, 0x03]);
        parser.seek(3).unwrap();
        assert!(parser.peek_byte().is_err());
        assert!(parser.seek(4).is_err());
        parser.seek(0).unwrap();
        parser.advance_by(2).unwrap();
        assert_eq!(parser.remaining(), 1);
        assert!(parser.advance_by(2).is_err());
    }
}
