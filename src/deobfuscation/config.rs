//! Configuration for a deobfuscation run.
//!
//! [`DeobConfig`] selects the families to try and the transformations to apply. Besides
//! setting fields directly, callers can apply command-line style options by name through
//! [`DeobConfig::set_option`]; every option has a typed [`OptionKind`] that fixes how its
//! value is parsed.
//!
//! [`NameRegexes`] is the filter type behind name-based options: a list of regexes joined
//! with `&`, each optionally inverted with a leading `!`.

use std::fmt;

use regex::Regex;
use strum::IntoEnumIterator;

use crate::{
    deobfuscation::{logger::LogLevel, obfuscators::Family},
    Error, Result,
};

/// How an option value is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// "false", "off" and "0" are false, anything else is true
    Bool,
    /// A signed 32-bit integer
    Int,
    /// Free text
    String,
    /// A [`NameRegexes`] expression
    NameRegex,
}

/// Description of one option accepted by [`DeobConfig::set_option`].
#[derive(Debug, Clone, Copy)]
pub struct OptionInfo {
    /// Long name, without the leading `--`
    pub name: &'static str,
    /// Value parser
    pub kind: OptionKind,
    /// One line help text
    pub description: &'static str,
}

const OPTIONS: &[OptionInfo] = &[
    OptionInfo {
        name: "families",
        kind: OptionKind::String,
        description: "Comma separated families to try, or 'all'",
    },
    OptionInfo {
        name: "strings",
        kind: OptionKind::Bool,
        description: "Decrypt strings",
    },
    OptionInfo {
        name: "constants",
        kind: OptionKind::Bool,
        description: "Decrypt constants and arrays",
    },
    OptionInfo {
        name: "methods",
        kind: OptionKind::Bool,
        description: "Restore encrypted method bodies",
    },
    OptionInfo {
        name: "resources",
        kind: OptionKind::Bool,
        description: "Decrypt and unpack resources",
    },
    OptionInfo {
        name: "remove-init-calls",
        kind: OptionKind::Bool,
        description: "Remove calls to obfuscator initialization methods",
    },
    OptionInfo {
        name: "log-level",
        kind: OptionKind::String,
        description: "error, warning, info, verbose or very-verbose",
    },
    OptionInfo {
        name: "dedup-messages",
        kind: OptionKind::Bool,
        description: "Suppress repeated errors and warnings",
    },
    OptionInfo {
        name: "decrypter-filter",
        kind: OptionKind::NameRegex,
        description: "Only inline calls to decrypters whose full name matches",
    },
    OptionInfo {
        name: "batch-size",
        kind: OptionKind::Int,
        description: "Maximum number of strings per dynamic decryption request",
    },
    OptionInfo {
        name: "fail-fast",
        kind: OptionKind::Bool,
        description: "Abort the run on the first family error",
    },
];

/// Parse a boolean option value.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    !["false", "off", "0"]
        .iter()
        .any(|v| v.eq_ignore_ascii_case(value.trim()))
}

/// Parse an integer option value.
///
/// # Errors
/// Returns [`crate::Error::Error`] with `Not an integer: '<v>'`.
pub fn parse_int(value: &str) -> Result<i32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Error(format!("Not an integer: '{value}'")))
}

fn parse_regex(value: &str) -> Result<Regex> {
    Regex::new(value).map_err(|_| Error::Error(format!("Could not parse regex '{value}'")))
}

/// One regex of a [`NameRegexes`] list.
#[derive(Debug, Clone)]
pub struct NameRegex {
    regex: Regex,
    match_value: bool,
}

impl NameRegex {
    /// Parse a single regex; a leading `!` inverts its match value.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the regex does not compile.
    pub fn new(source: &str) -> Result<Self> {
        let (pattern, match_value) = match source.strip_prefix('!') {
            Some(rest) => (rest, false),
            None => (source, true),
        };
        Ok(NameRegex {
            regex: parse_regex(pattern)?,
            match_value,
        })
    }

    /// Returns true if `name` matches the regex.
    #[must_use]
    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The value returned when this regex matches.
    #[must_use]
    pub fn match_value(&self) -> bool {
        self.match_value
    }
}

impl fmt::Display for NameRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.match_value {
            f.write_str("!")?;
        }
        f.write_str(self.regex.as_str())
    }
}

/// An ordered list of name filters.
///
/// The first regex that matches decides the result; when none does, the default value is
/// returned.
///
/// # Example
///
/// ```rust
/// use dotscope_deob::deobfuscation::config::NameRegexes;
///
/// let filter = NameRegexes::new("!Dummy&Decrypt", false)?;
/// assert!(filter.is_match("System.String A::Decrypt(System.Int32)"));
/// assert!(!filter.is_match("System.String DummyDecrypt::X()"));
/// assert!(!filter.is_match("System.Void A::Init()"));
/// # Ok::<(), dotscope_deob::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct NameRegexes {
    regexes: Vec<NameRegex>,
    default_value: bool,
}

impl NameRegexes {
    /// Parse `&` separated regexes. An empty string yields an empty list.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] naming the first regex that fails to compile.
    pub fn new(source: &str, default_value: bool) -> Result<Self> {
        let regexes = if source.is_empty() {
            Vec::new()
        } else {
            source
                .split('&')
                .map(NameRegex::new)
                .collect::<Result<Vec<_>>>()?
        };
        Ok(NameRegexes {
            regexes,
            default_value,
        })
    }

    /// A filter with no regexes that always returns `default_value`.
    #[must_use]
    pub fn accept_all() -> Self {
        NameRegexes {
            regexes: Vec::new(),
            default_value: true,
        }
    }

    /// The value returned when no regex matches.
    #[must_use]
    pub fn default_value(&self) -> bool {
        self.default_value
    }

    /// Returns true if no regexes are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }

    /// Evaluate the filter for `name`.
    #[must_use]
    pub fn is_match(&self, name: &str) -> bool {
        self.regexes
            .iter()
            .find(|r| r.is_match(name))
            .map_or(self.default_value, NameRegex::match_value)
    }
}

impl Default for NameRegexes {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl fmt::Display for NameRegexes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, regex) in self.regexes.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{regex}")?;
        }
        Ok(())
    }
}

/// Settings for one [`crate::deobfuscation::driver::Pipeline`] run.
#[derive(Debug, Clone)]
pub struct DeobConfig {
    /// Families to try, in order (default: all of them).
    pub families: Vec<Family>,

    /// Inline decrypted strings.
    pub decrypt_strings: bool,

    /// Inline decrypted constants and arrays.
    pub decrypt_constants: bool,

    /// Restore encrypted method bodies.
    pub decrypt_methods: bool,

    /// Decrypt embedded resources and assemblies.
    pub decrypt_resources: bool,

    /// Remove calls to obfuscator initialization methods once their payload is consumed.
    pub remove_init_calls: bool,

    /// Most detailed log level emitted (default: [`LogLevel::Info`]).
    pub max_log_level: LogLevel,

    /// Drop repeated errors and warnings with the same message template.
    pub suppress_duplicate_messages: bool,

    /// Restricts which decrypter methods the inliners touch, by method full name.
    pub decrypter_filter: NameRegexes,

    /// Maximum strings per dynamic `DECRYPT_STRINGS` request (default: 1000).
    pub dynamic_batch_size: usize,

    /// Propagate the first family error instead of recording it and continuing.
    pub fail_fast: bool,
}

impl Default for DeobConfig {
    fn default() -> Self {
        Self {
            families: Family::iter().collect(),
            decrypt_strings: true,
            decrypt_constants: true,
            decrypt_methods: true,
            decrypt_resources: true,
            remove_init_calls: true,
            max_log_level: LogLevel::Info,
            suppress_duplicate_messages: true,
            decrypter_filter: NameRegexes::accept_all(),
            dynamic_batch_size: 1000,
            fail_fast: false,
        }
    }
}

impl DeobConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration that only detects: no decryption, no rewriting.
    #[must_use]
    pub fn detect_only() -> Self {
        Self {
            decrypt_strings: false,
            decrypt_constants: false,
            decrypt_methods: false,
            decrypt_resources: false,
            remove_init_calls: false,
            ..Self::default()
        }
    }

    /// Restricts the run to `families`.
    #[must_use]
    pub fn with_families(mut self, families: &[Family]) -> Self {
        self.families = families.to_vec();
        self
    }

    /// Returns true if any transformation is enabled.
    #[must_use]
    pub fn any_transform_enabled(&self) -> bool {
        self.decrypt_strings
            || self.decrypt_constants
            || self.decrypt_methods
            || self.decrypt_resources
            || self.remove_init_calls
    }

    /// All options accepted by [`DeobConfig::set_option`].
    #[must_use]
    pub fn options() -> &'static [OptionInfo] {
        OPTIONS
    }

    /// Apply an option by name. The name may carry a leading `--` or `-`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] for unknown options, unknown family or level names,
    /// values that do not parse as the option's kind, or a non-positive batch size.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let key = name.trim_start_matches('-');
        let info = OPTIONS
            .iter()
            .find(|o| o.name == key)
            .ok_or_else(|| Error::Error(format!("Unknown option '{name}'")))?;

        match (info.name, info.kind) {
            ("families", _) => self.families = parse_families(value)?,
            ("log-level", _) => {
                self.max_log_level = LogLevel::parse(value.trim())
                    .ok_or_else(|| Error::Error(format!("Unknown log level '{value}'")))?;
            }
            ("decrypter-filter", _) => self.decrypter_filter = NameRegexes::new(value, false)?,
            ("batch-size", _) => {
                let size = parse_int(value)?;
                self.dynamic_batch_size = usize::try_from(size)
                    .ok()
                    .filter(|&s| s > 0)
                    .ok_or_else(|| Error::Error(format!("Batch size must be positive: {size}")))?;
            }
            (flag, OptionKind::Bool) => {
                let enabled = parse_bool(value);
                match flag {
                    "strings" => self.decrypt_strings = enabled,
                    "constants" => self.decrypt_constants = enabled,
                    "methods" => self.decrypt_methods = enabled,
                    "resources" => self.decrypt_resources = enabled,
                    "remove-init-calls" => self.remove_init_calls = enabled,
                    "dedup-messages" => self.suppress_duplicate_messages = enabled,
                    _ => self.fail_fast = enabled,
                }
            }
            (other, _) => return Err(Error::Error(format!("Unhandled option '{other}'"))),
        }
        Ok(())
    }
}

fn parse_families(value: &str) -> Result<Vec<Family>> {
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(Family::iter().collect());
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Family::from_name(s).ok_or_else(|| Error::Error(format!("Unknown family '{s}'"))))
        .collect()
}
