use std::fmt;

/// A stable identity for an entry of the module arena.
///
/// Tokens follow the metadata encoding:
/// - The high byte (bits 24-31) indicates the table
/// - The low 24 bits (bits 0-23) indicate the 1-based row within that table
///
/// Everything a detector "finds and remembers" is stored as a token, never as a borrowed
/// reference, so a detection can be carried across a reload of the module and re-resolved.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl Token {
    /// Table id of type references.
    pub const TYPE_REF: u8 = 0x01;
    /// Table id of type definitions.
    pub const TYPE_DEF: u8 = 0x02;
    /// Table id of field definitions.
    pub const FIELD: u8 = 0x04;
    /// Table id of method definitions.
    pub const METHOD_DEF: u8 = 0x06;
    /// Table id of member references.
    pub const MEMBER_REF: u8 = 0x0A;
    /// Table id of stand-alone signatures (local variable signatures).
    pub const STANDALONE_SIG: u8 = 0x11;
    /// Table id of manifest resources.
    pub const MANIFEST_RESOURCE: u8 = 0x28;
    /// Pseudo table id of the user string heap.
    pub const USER_STRING: u8 = 0x70;

    /// Creates a new token from a raw 32-bit value
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Creates a token from a table id and a row index
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token((u32::from(table) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw token value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Extracts the table type from the token (high byte)
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Extracts the row index from the token (low 24 bits)
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns true if this is a null token (value 0)
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the token addresses `table` and has a non-zero row
    #[must_use]
    pub fn is_table(&self, table: u8) -> bool {
        self.table() == table && self.row() != 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
