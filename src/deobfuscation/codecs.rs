//! Pure payload decoders shared by the family engines.
//!
//! Every function here maps bytes or strings to values without touching a module, so
//! decoding the same payload twice always yields the same table. Malformed input is a
//! [`crate::Error::Decode`] (or the bounds error of the underlying [`Parser`]) for the
//! item at hand; nothing panics on hostile data.
//!
//! | Decoder | Layout |
//! |---------|--------|
//! | [`read_typed_tables`] | four `int32 count` tables of i32, i64, f32, f64 |
//! | [`read_varint_utf16_string`] | 7-bit length (in bytes), then UTF-16LE |
//! | [`read_varint_array`] | 7-bit length (in bytes), then raw element bytes |
//! | [`read_value_at`] | one little-endian value at a byte offset |
//! | [`read_primitive_array_graph`] | a binary-formatter graph holding one primitive array |
//! | [`xenocode_decode`] | four letters per character, rotating additive key |
//! | [`skater_v2_decode`] | whitespace separated integer triples |
//!
//! # Example
//!
//! ```rust
//! use dotscope_deob::deobfuscation::codecs::{read_varint_utf16_string, xenocode_decode};
//!
//! assert_eq!(xenocode_decode("beaapdha", 0), "AB");
//!
//! let blob = [0x00, 0x04, b'h', 0x00, b'i', 0x00];
//! assert_eq!(read_varint_utf16_string(&blob, 1)?, "hi");
//! # Ok::<(), dotscope_deob::Error>(())
//! ```

use strum::{Display, EnumIter};

use crate::{
    file::{io::CilIO, Parser},
    Result,
};

/// Key increment of the Xenocode character cipher.
pub const XENOCODE_KEY_STEP: i32 = 1789;

/// The four numeric constant tables of a typed-table payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedTables {
    /// 32-bit integers
    pub ints: Vec<i32>,
    /// 64-bit integers
    pub longs: Vec<i64>,
    /// Single precision floats
    pub floats: Vec<f32>,
    /// Double precision floats
    pub doubles: Vec<f64>,
}

fn read_table<T: CilIO + Default>(parser: &mut Parser, reverse: bool) -> Result<Vec<T>> {
    let count = parser.read_le::<i32>()?;
    let count = usize::try_from(count)
        .map_err(|_| decode_error!("Invalid table length {}", count))?;
    let width = std::mem::size_of::<T>();
    if count.saturating_mul(width) > parser.remaining() {
        return Err(decode_error!(
            "Table of {} entries exceeds the {} remaining bytes",
            count,
            parser.remaining()
        ));
    }

    let mut values = vec![T::default(); count];
    if reverse {
        for slot in values.iter_mut().rev() {
            *slot = parser.read_le::<T>()?;
        }
    } else {
        for slot in &mut values {
            *slot = parser.read_le::<T>()?;
        }
    }
    Ok(values)
}

/// Decode four back-to-back `int32 count` tables (i32, i64, f32, f64).
///
/// With `reverse` set, the first value read lands at index `count - 1` and the last at
/// index 0, the way the Babel.NET constants reader fills its arrays.
///
/// # Errors
/// Returns [`crate::Error::Decode`] for a negative or oversized count and a bounds error
/// for truncated data.
pub fn read_typed_tables(data: &[u8], reverse: bool) -> Result<TypedTables> {
    let mut parser = Parser::new(data);
    Ok(TypedTables {
        ints: read_table(&mut parser, reverse)?,
        longs: read_table(&mut parser, reverse)?,
        floats: read_table(&mut parser, reverse)?,
        doubles: read_table(&mut parser, reverse)?,
    })
}

fn parser_at(data: &[u8], offset: usize) -> Result<Parser<'_>> {
    let mut parser = Parser::new(data);
    parser
        .seek(offset)
        .map_err(|_| decode_error!("Offset {} outside of {} byte payload", offset, data.len()))?;
    Ok(parser)
}

/// Read the string stored at byte `offset`: a 7-bit encoded byte length followed by that
/// many bytes of UTF-16LE.
///
/// # Errors
/// Returns a decode or bounds error for a bad offset, an odd length or truncated text.
pub fn read_varint_utf16_string(data: &[u8], offset: usize) -> Result<String> {
    let mut parser = parser_at(data, offset)?;
    let length = parser.read_7bit_encoded_int()? as usize;
    parser.read_utf16_bytes(length)
}

/// Read the array stored at byte `offset`: a 7-bit encoded byte length followed by the raw
/// element bytes, block-copied into a zeroed buffer of `size` bytes.
///
/// # Errors
/// Returns [`crate::Error::Decode`] if the stored length exceeds `size`, or a bounds error
/// for truncated data.
pub fn read_varint_array(data: &[u8], offset: usize, size: usize) -> Result<Vec<u8>> {
    let mut parser = parser_at(data, offset)?;
    let length = parser.read_7bit_encoded_int()? as usize;
    if length > size {
        return Err(decode_error!(
            "Stored array of {} bytes does not fit {} bytes",
            length,
            size
        ));
    }
    let mut array = vec![0u8; size];
    array[..length].copy_from_slice(parser.read_bytes(length)?);
    Ok(array)
}

/// Read one little-endian value at byte `offset`.
///
/// # Errors
/// Returns a decode or bounds error if the value does not fit inside `data`.
pub fn read_value_at<T: CilIO>(data: &[u8], offset: usize) -> Result<T> {
    parser_at(data, offset)?.read_le::<T>()
}

/// Element width of a primitive CLR type, or `None` for anything that cannot be
/// block-copied.
#[must_use]
pub fn primitive_size(type_name: &str) -> Option<usize> {
    match type_name {
        "System.Boolean" | "System.Byte" | "System.SByte" => Some(1),
        "System.Char" | "System.Int16" | "System.UInt16" => Some(2),
        "System.Int32" | "System.UInt32" | "System.Single" => Some(4),
        "System.Int64" | "System.UInt64" | "System.Double" => Some(8),
        _ => None,
    }
}

/// Element kinds of a binary-formatter `ArraySinglePrimitive` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum PrimitiveType {
    /// `System.Boolean`
    #[strum(to_string = "System.Boolean")]
    Boolean = 1,
    /// `System.Byte`
    #[strum(to_string = "System.Byte")]
    Byte = 2,
    /// `System.Char`, stored as UTF-8
    #[strum(to_string = "System.Char")]
    Char = 3,
    /// `System.Double`
    #[strum(to_string = "System.Double")]
    Double = 6,
    /// `System.Int16`
    #[strum(to_string = "System.Int16")]
    Int16 = 7,
    /// `System.Int32`
    #[strum(to_string = "System.Int32")]
    Int32 = 8,
    /// `System.Int64`
    #[strum(to_string = "System.Int64")]
    Int64 = 9,
    /// `System.SByte`
    #[strum(to_string = "System.SByte")]
    SByte = 10,
    /// `System.Single`
    #[strum(to_string = "System.Single")]
    Single = 11,
    /// `System.UInt16`
    #[strum(to_string = "System.UInt16")]
    UInt16 = 14,
    /// `System.UInt32`
    #[strum(to_string = "System.UInt32")]
    UInt32 = 15,
    /// `System.UInt64`
    #[strum(to_string = "System.UInt64")]
    UInt64 = 16,
}

impl PrimitiveType {
    fn from_code(code: u8) -> Result<Self> {
        use strum::IntoEnumIterator;
        PrimitiveType::iter()
            .find(|kind| *kind as u8 == code)
            .ok_or_else(|| decode_error!("Unsupported primitive array element type {}", code))
    }

    /// In-memory element width.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            PrimitiveType::Boolean | PrimitiveType::Byte | PrimitiveType::SByte => 1,
            PrimitiveType::Char | PrimitiveType::Int16 | PrimitiveType::UInt16 => 2,
            PrimitiveType::Int32 | PrimitiveType::UInt32 | PrimitiveType::Single => 4,
            PrimitiveType::Int64 | PrimitiveType::UInt64 | PrimitiveType::Double => 8,
        }
    }
}

/// A primitive array recovered from a serialized object graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveArray {
    /// Element kind
    pub element: PrimitiveType,
    /// Number of elements
    pub length: usize,
    /// Elements in their in-memory little-endian layout (`length * element.size()` bytes)
    pub data: Vec<u8>,
}

const RECORD_HEADER: u8 = 0;
const RECORD_MESSAGE_END: u8 = 11;
const RECORD_ARRAY_SINGLE_PRIMITIVE: u8 = 15;

fn read_utf8_char(parser: &mut Parser) -> Result<char> {
    let lead = parser.read_le::<u8>()?;
    let extra = match lead {
        0x00..=0x7F => 0,
        0xC0..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF7 => 3,
        _ => return Err(decode_error!("Invalid UTF-8 lead byte {:#04x}", lead)),
    };
    let mut bytes = vec![lead];
    bytes.extend_from_slice(parser.read_bytes(extra)?);
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| decode_error!("Invalid UTF-8 character"))
}

/// Decode a binary-formatter stream holding a single primitive array: a serialization
/// header record, one `ArraySinglePrimitive` record and the `MessageEnd` record.
///
/// `char` elements are stored as UTF-8 and come back as UTF-16 code units.
///
/// # Errors
/// Returns [`crate::Error::Decode`] for any other record layout or element type, and a
/// bounds error for truncated data.
pub fn read_primitive_array_graph(data: &[u8]) -> Result<PrimitiveArray> {
    let mut parser = Parser::new(data);

    if parser.read_le::<u8>()? != RECORD_HEADER {
        return Err(decode_error!("Missing serialization header record"));
    }
    let _root_id = parser.read_le::<i32>()?;
    let _header_id = parser.read_le::<i32>()?;
    let major = parser.read_le::<i32>()?;
    let minor = parser.read_le::<i32>()?;
    if (major, minor) != (1, 0) {
        return Err(decode_error!("Unsupported serialization format {}.{}", major, minor));
    }

    let record = parser.read_le::<u8>()?;
    if record != RECORD_ARRAY_SINGLE_PRIMITIVE {
        return Err(decode_error!("Expected a primitive array record, found {}", record));
    }
    let _object_id = parser.read_le::<i32>()?;
    let length = parser.read_le::<i32>()?;
    let length =
        usize::try_from(length).map_err(|_| decode_error!("Invalid array length {}", length))?;
    let element = PrimitiveType::from_code(parser.read_le::<u8>()?)?;

    let data = if element == PrimitiveType::Char {
        let mut units = Vec::with_capacity(length.min(parser.remaining()) * 2);
        let mut decoded = 0;
        while decoded < length {
            let c = read_utf8_char(&mut parser)?;
            let mut buffer = [0u16; 2];
            for unit in c.encode_utf16(&mut buffer) {
                units.extend_from_slice(&unit.to_le_bytes());
                decoded += 1;
            }
        }
        if decoded != length {
            return Err(decode_error!("Character array ends inside a surrogate pair"));
        }
        units
    } else {
        let size = length
            .checked_mul(element.size())
            .ok_or_else(|| decode_error!("Array of {} elements is too large", length))?;
        parser.read_bytes(size)?.to_vec()
    };

    if parser.read_le::<u8>()? != RECORD_MESSAGE_END {
        return Err(decode_error!("Missing message end record"));
    }

    Ok(PrimitiveArray {
        element,
        length,
        data,
    })
}

/// Decode a Xenocode string: every four letters `a`..`p` carry one UTF-16 code unit as
/// four nibbles (lowest first), minus a key that grows by [`XENOCODE_KEY_STEP`] per
/// character. Trailing letters that do not form a full group are ignored.
#[must_use]
pub fn xenocode_decode(encrypted: &str, magic: i32) -> String {
    let units: Vec<i32> = encrypted.encode_utf16().map(i32::from).collect();
    let mut magic = magic;
    let mut decoded = Vec::with_capacity(units.len() / 4);
    for group in units.chunks_exact(4) {
        let value = (group[0] - 0x61)
            .wrapping_add((group[1] - 0x61) << 4)
            .wrapping_add((group[2] - 0x61) << 8)
            .wrapping_add((group[3] - 0x61) << 12)
            .wrapping_sub(magic);
        // a char cast keeps the low 16 bits
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        decoded.push(value as u16);
        magic = magic.wrapping_add(XENOCODE_KEY_STEP);
    }
    String::from_utf16_lossy(&decoded)
}

/// Decode a Skater.NET V2 string: space separated integer triples, where the first value
/// of a triple is the character and is doubled when the second value is even.
///
/// # Errors
/// Returns [`crate::Error::Decode`] if the number of values is not a multiple of three or
/// a value is not an integer.
pub fn skater_v2_decode(encrypted: &str) -> Result<String> {
    let values: Vec<&str> = encrypted.split(' ').collect();
    if values.len() % 3 != 0 {
        return Err(decode_error!("Invalid encrypted string"));
    }

    let parse = |s: &str| {
        s.trim()
            .parse::<i32>()
            .map_err(|_| decode_error!("Not an integer: '{}'", s))
    };

    let mut units = Vec::with_capacity(values.len() / 3);
    for triple in values.chunks_exact(3) {
        let mut value = parse(triple[0])?;
        if parse(triple[1])? % 2 == 0 {
            value = value.wrapping_add(value);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        units.push(value as u16);
    }
    Ok(String::from_utf16_lossy(&units))
}

/// Encoders producing the payload layouts above, for building test fixtures.
#[cfg(test)]
pub(crate) mod encoders {
    use super::{PrimitiveType, TypedTables, RECORD_ARRAY_SINGLE_PRIMITIVE, XENOCODE_KEY_STEP};

    pub fn varint(mut value: u32, out: &mut Vec<u8>) {
        while value >= 0x80 {
            out.push((value as u8) | 0x80);
            value >>= 7;
        }
        out.push(value as u8);
    }

    pub fn typed_tables(tables: &TypedTables, reverse: bool) -> Vec<u8> {
        fn table<T: Copy, const N: usize>(
            values: &[T],
            reverse: bool,
            bytes: impl Fn(T) -> [u8; N],
            out: &mut Vec<u8>,
        ) {
            out.extend_from_slice(&(values.len() as i32).to_le_bytes());
            let ordered: Vec<T> = if reverse {
                values.iter().rev().copied().collect()
            } else {
                values.to_vec()
            };
            for value in ordered {
                out.extend_from_slice(&bytes(value));
            }
        }

        let mut out = Vec::new();
        table(&tables.ints, reverse, i32::to_le_bytes, &mut out);
        table(&tables.longs, reverse, i64::to_le_bytes, &mut out);
        table(&tables.floats, reverse, f32::to_le_bytes, &mut out);
        table(&tables.doubles, reverse, f64::to_le_bytes, &mut out);
        out
    }

    pub fn utf16_string(value: &str, out: &mut Vec<u8>) {
        let bytes: Vec<u8> = value.encode_utf16().flat_map(u16::to_le_bytes).collect();
        varint(bytes.len() as u32, out);
        out.extend_from_slice(&bytes);
    }

    pub fn primitive_array_graph(element: PrimitiveType, length: usize, data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8];
        for value in [1i32, -1, 1, 0] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.push(RECORD_ARRAY_SINGLE_PRIMITIVE);
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&(length as i32).to_le_bytes());
        out.push(element as u8);
        out.extend_from_slice(data);
        out.push(11);
        out
    }

    pub fn xenocode(plain: &str, magic: i32) -> String {
        let mut magic = magic;
        let mut out = String::new();
        for unit in plain.encode_utf16() {
            let value = (i32::from(unit) + magic) as u16;
            for shift in [0, 4, 8, 12] {
                out.push(char::from(b'a' + ((value >> shift) & 0xF) as u8));
            }
            magic += XENOCODE_KEY_STEP;
        }
        out
    }

    pub fn skater_v2(plain: &str) -> String {
        plain
            .chars()
            .map(|c| format!("{} 1 0", c as u32))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::{encoders, *};
    use crate::Error;

    #[test]
    fn typed_tables_reverse_fill() {
        let tables = TypedTables {
            ints: vec![1, -2, 3],
            longs: vec![i64::MAX],
            floats: vec![1.5, -0.25],
            doubles: vec![],
        };
        let forward = encoders::typed_tables(&tables, false);
        assert_eq!(read_typed_tables(&forward, false).unwrap(), tables);

        let reversed = encoders::typed_tables(&tables, true);
        assert_eq!(read_typed_tables(&reversed, true).unwrap(), tables);
        // the first int on disk is the last table entry
        assert_eq!(&reversed[4..8], &3i32.to_le_bytes());
        assert_eq!(
            read_typed_tables(&reversed, true).unwrap(),
            read_typed_tables(&reversed, true).unwrap()
        );
    }

    #[test]
    fn typed_tables_reject_bad_counts() {
        let mut data = (-1i32).to_le_bytes().to_vec();
        assert!(matches!(read_typed_tables(&data, false), Err(Error::Decode(_))));

        data = 1000i32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0; 16]);
        assert!(matches!(read_typed_tables(&data, false), Err(Error::Decode(_))));

        data = 0i32.to_le_bytes().to_vec();
        assert!(read_typed_tables(&data, false).is_err());
    }

    #[test]
    fn varint_strings_by_offset() {
        let mut blob = vec![0xAA];
        encoders::utf16_string("first", &mut blob);
        let second = blob.len();
        encoders::utf16_string(&"x".repeat(100), &mut blob);

        assert_eq!(read_varint_utf16_string(&blob, 1).unwrap(), "first");
        assert_eq!(read_varint_utf16_string(&blob, second).unwrap(), "x".repeat(100));
        // 200 bytes needs a two byte length
        assert_eq!(&blob[second..second + 2], &[0xC8, 0x01]);
        assert!(read_varint_utf16_string(&blob, blob.len() + 3).is_err());
        assert!(read_varint_utf16_string(&[0x03, b'a', 0, b'b'], 0).is_err());
    }

    #[test]
    fn varint_arrays_and_values() {
        let data = [0x00, 0x04, 1, 0, 2, 0, 0xFF];
        assert_eq!(read_varint_array(&data, 1, 6).unwrap(), vec![1, 0, 2, 0, 0, 0]);
        assert!(matches!(read_varint_array(&data, 1, 2), Err(Error::Decode(_))));

        assert_eq!(read_value_at::<u16>(&data, 2).unwrap(), 1);
        assert_eq!(read_value_at::<i32>(&data, 2).unwrap(), 0x0002_0001);
        assert!(read_value_at::<i64>(&data, 2).is_err());
    }

    #[test]
    fn primitive_graph_arrays() {
        let ints: Vec<u8> = [7i32, -1].iter().flat_map(|v| v.to_le_bytes()).collect();
        let graph = encoders::primitive_array_graph(PrimitiveType::Int32, 2, &ints);
        let array = read_primitive_array_graph(&graph).unwrap();
        assert_eq!(array.element, PrimitiveType::Int32);
        assert_eq!(array.length, 2);
        assert_eq!(array.data, ints);

        let chars = encoders::primitive_array_graph(PrimitiveType::Char, 2, "a\u{e9}".as_bytes());
        let array = read_primitive_array_graph(&chars).unwrap();
        assert_eq!(array.data, vec![b'a', 0, 0xE9, 0]);

        let mut truncated = graph.clone();
        truncated.truncate(graph.len() - 3);
        assert!(read_primitive_array_graph(&truncated).is_err());

        let mut wrong = graph;
        wrong[17] = 16;
        assert!(matches!(read_primitive_array_graph(&wrong), Err(Error::Decode(_))));
    }

    #[test]
    fn primitive_sizes() {
        assert_eq!(primitive_size("System.Double"), Some(8));
        assert_eq!(primitive_size("System.Char"), Some(2));
        assert_eq!(primitive_size("System.String"), None);
        assert_eq!(primitive_size("System.IntPtr"), None);
        assert_eq!(PrimitiveType::UInt16.to_string(), "System.UInt16");
    }

    #[test]
    fn xenocode_rotating_key() {
        assert_eq!(xenocode_decode("beaapdha", 0), "AB");
        let encrypted = encoders::xenocode("Hello, world", 0x1234);
        assert_eq!(xenocode_decode(&encrypted, 0x1234), "Hello, world");
        assert_eq!(xenocode_decode("bea", 0), "");
    }

    #[test]
    fn skater_triples() {
        assert_eq!(skater_v2_decode("33 2 9 66 1 0").unwrap(), "BB");
        assert_eq!(skater_v2_decode(&encoders::skater_v2("Skater")).unwrap(), "Skater");
        assert!(matches!(skater_v2_decode("1 2"), Err(Error::Decode(_))));
        assert!(matches!(skater_v2_decode("a 2 3"), Err(Error::Decode(_))));
    }
}
