//! Structured record of what a deobfuscation run changed.
//!
//! Where the [`crate::deobfuscation::logger::Logger`] produces human-readable progress
//! lines, the [`EventLog`] keeps machine-readable [`Event`]s: which method was touched,
//! where, and what kind of transformation happened. Events are appended through
//! `&self` (the backing store is a `boxcar::Vec`), so the log can be shared by every
//! stage of the pipeline.
//!
//! # Example
//!
//! ```rust
//! use dotscope_deob::deobfuscation::events::{EventKind, EventLog};
//! use dotscope_deob::metadata::token::Token;
//!
//! let log = EventLog::new();
//! log.record(EventKind::StringDecrypted)
//!     .at(Token::new(0x0600_0002), 4)
//!     .message("\"hello\"");
//! log.info("Babel.NET detected");
//! assert_eq!(log.count_kind(EventKind::StringDecrypted), 1);
//! assert_eq!(log.methods_affected(), 1);
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use crate::{deobfuscation::obfuscators::Family, metadata::token::Token};

/// Categories of recorded events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A string decrypter call was replaced by a literal.
    StringDecrypted,
    /// A constant accessor call was replaced by a literal.
    ConstantDecrypted,
    /// An encrypted array initializer was replaced by a plain one.
    ArrayDecrypted,
    /// An encrypted method body was restored.
    MethodBodyDecrypted,
    /// A resource was decrypted or an embedded assembly unpacked.
    ResourceDecrypted,
    /// An obfuscator artifact (method, type, resource) was removed.
    ArtifactRemoved,
    /// An instruction was removed.
    InstructionRemoved,
    /// A method body changed and should be re-examined.
    MethodModified,

    /// A family finished detection.
    DetectionComplete,
    /// A method was identified as a decrypter.
    DecryptorIdentified,

    /// Informational message.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// Something failed.
    Error,
}

impl EventKind {
    /// Returns a human-readable description of this event kind.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::StringDecrypted => "string decrypted",
            Self::ConstantDecrypted => "constant decrypted",
            Self::ArrayDecrypted => "array decrypted",
            Self::MethodBodyDecrypted => "method body decrypted",
            Self::ResourceDecrypted => "resource decrypted",
            Self::ArtifactRemoved => "artifact removed",
            Self::InstructionRemoved => "instruction removed",
            Self::MethodModified => "method modified",
            Self::DetectionComplete => "detection complete",
            Self::DecryptorIdentified => "decryptor identified",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Returns true if this event represents a code or metadata change.
    #[must_use]
    pub fn is_transformation(&self) -> bool {
        matches!(
            self,
            Self::StringDecrypted
                | Self::ConstantDecrypted
                | Self::ArrayDecrypted
                | Self::MethodBodyDecrypted
                | Self::ResourceDecrypted
                | Self::ArtifactRemoved
                | Self::InstructionRemoved
        )
    }

    /// Returns true if this is a diagnostic event.
    #[must_use]
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Self::Info | Self::Warning | Self::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct Event {
    /// The type of event.
    pub kind: EventKind,
    /// The method where the event occurred (if applicable).
    pub method: Option<Token>,
    /// Instruction index within the method.
    pub location: Option<usize>,
    /// Human-readable description.
    pub message: String,
    /// Family whose processing produced the event.
    pub family: Option<Family>,
}

impl Event {
    fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            method: None,
            location: None,
            message: message.into(),
            family: None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.kind)?;
        if let Some(family) = self.family {
            write!(f, " {family}:")?;
        }
        write!(f, " {}", self.message)?;
        if let Some(method) = self.method {
            write!(f, " in {method}")?;
            if let Some(location) = self.location {
                write!(f, "@{location}")?;
            }
        }
        Ok(())
    }
}

/// Builder returned by [`EventLog::record`]. The event is added when the builder drops.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    event: Option<Event>,
}

impl EventBuilder<'_> {
    fn event(&mut self) -> &mut Event {
        self.event.get_or_insert_with(|| Event::new(EventKind::Info, ""))
    }

    /// Sets the method and instruction index.
    pub fn at(mut self, method: Token, location: usize) -> Self {
        let event = self.event();
        event.method = Some(method);
        event.location = Some(location);
        self
    }

    /// Sets only the method.
    pub fn method(mut self, method: Token) -> Self {
        self.event().method = Some(method);
        self
    }

    /// Sets a custom message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.event().message = msg.into();
        self
    }

    /// Attributes the event to a family.
    pub fn family(mut self, family: Family) -> Self {
        self.event().family = Some(family);
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        if let Some(mut event) = self.event.take() {
            if event.message.is_empty() {
                event.message = event.kind.description().to_string();
            }
            self.log.events.push(event);
        }
    }
}

/// Append-only collection of events.
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let new_log = Self::new();
        for (_, event) in &self.events {
            new_log.events.push(event.clone());
        }
        new_log
    }
}

impl EventLog {
    /// Creates an empty event log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }

    /// Returns true if no events have been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// Returns the total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts building a new event of the given kind.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            event: Some(Event::new(kind, "")),
        }
    }

    /// Records an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Info, message));
    }

    /// Records a warning message.
    pub fn warn(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Warning, message));
    }

    /// Records an error message.
    pub fn error(&self, message: impl Into<String>) {
        self.events.push(Event::new(EventKind::Error, message));
    }

    /// Appends copies of all events of `other`.
    pub fn merge(&self, other: &EventLog) {
        for (_, event) in &other.events {
            self.events.push(event.clone());
        }
    }

    /// Returns true if any event of the given kind exists.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.events.iter().any(|(_, e)| e.kind == kind)
    }

    /// Counts events of the given kind.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|(_, e)| e.kind == kind).count()
    }

    /// Returns an iterator over all events.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }

    /// Returns an iterator over events of a specific kind.
    pub fn filter_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |e| e.kind == kind)
    }

    /// Returns an iterator over events for a specific method.
    pub fn filter_method(&self, method: Token) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |e| e.method == Some(method))
    }

    /// Returns an iterator over error events.
    pub fn errors(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Error)
    }

    /// Returns the number of transformation events.
    #[must_use]
    pub fn transformation_count(&self) -> usize {
        self.iter().filter(|e| e.kind.is_transformation()).count()
    }

    /// Returns the number of distinct methods with events.
    #[must_use]
    pub fn methods_affected(&self) -> usize {
        self.iter()
            .filter_map(|e| e.method)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Counts events grouped by kind, in kind order.
    #[must_use]
    pub fn count_by_kind(&self) -> BTreeMap<EventKind, usize> {
        let mut counts = BTreeMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }

    /// One line summary such as `3 string decrypted, 1 method body decrypted`.
    #[must_use]
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .count_by_kind()
            .into_iter()
            .filter(|(kind, _)| kind.is_transformation())
            .map(|(kind, count)| format!("{count} {kind}"))
            .collect();
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_commits_on_drop() {
        let log = EventLog::new();
        log.record(EventKind::ConstantDecrypted)
            .at(Token::new(0x0600_0001), 2)
            .family(Family::BabelNet);
        log.record(EventKind::MethodModified).method(Token::new(0x0600_0003));
        assert_eq!(log.len(), 2);

        let event = log.iter().next().unwrap();
        assert_eq!(event.message, "constant decrypted");
        assert_eq!(event.family, Some(Family::BabelNet));
        assert_eq!(
            event.to_string(),
            "[constant decrypted] Babel.NET: constant decrypted in 0x06000001@2"
        );
    }

    #[test]
    fn queries_and_summary() {
        let log = EventLog::new();
        assert_eq!(log.summary(), "no changes");
        for _ in 0..3 {
            log.record(EventKind::StringDecrypted).method(Token::new(0x0600_0001));
        }
        log.record(EventKind::MethodBodyDecrypted).method(Token::new(0x0600_0002));
        log.error("boom");

        assert_eq!(log.count_kind(EventKind::StringDecrypted), 3);
        assert_eq!(log.errors().count(), 1);
        assert_eq!(log.transformation_count(), 4);
        assert_eq!(log.methods_affected(), 2);
        assert_eq!(log.filter_method(Token::new(0x0600_0002)).count(), 1);
        assert_eq!(log.summary(), "3 string decrypted, 1 method body decrypted");

        let copy = EventLog::new();
        copy.merge(&log);
        assert_eq!(copy.len(), log.len());
        assert!(copy.has(EventKind::Error));
    }
}
