//! Detection and removal of commercial .NET obfuscator protections.
//!
//! The framework is organized around obfuscator families. Each family fingerprints
//! the runtime classes its protector injects, locates and decrypts the payload those
//! classes carry, and rewrites the protected method bodies so the decrypted values sit
//! where the decrypter calls used to be.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Pipeline                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Input: Module                                                   │
//! │     │                                                            │
//! │     ▼   for each enabled family, in configured order             │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │ detect      fingerprint runtime classes (read only)        │  │
//! │  │ initialize  locate payload, decode tables, derive keys     │  │
//! │  │ apply       inline strings/constants, restore bodies,      │  │
//! │  │             merge resources, strip init calls              │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │     │                                                            │
//! │     ▼                                                            │
//! │  Output: DeobfuscationResult (per-family reports, events)        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`Pipeline`] - runs the families and collects their [`FamilyReport`]s
//! - [`Session`] - shared state of one run: configuration, logger, events, collaborators
//! - [`fingerprint`] - structural predicates over types, fields and method bodies
//! - [`payload`] - where encrypted data lives and how it is opened
//! - [`codecs`] - byte level readers for the payload formats
//! - [`inliner`] - replaces decrypter call sites with literals
//! - [`rewriter`] - call site windows and stack-neutral body edits
//! - [`rpc`] - the message protocol of the dynamic decryption worker
//!
//! Families that cannot be decrypted statically need a collaborator: a
//! [`DynamicClient`] that executes decrypters in a worker, or a [`ResourceDecrypter`]
//! that opens resource payloads. Without one, the family is reported as
//! [`FamilyState::DetectedButUndecryptable`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use dotscope_deob::deobfuscation::{DeobConfig, EventLog, Logger, Pipeline};
//!
//! let config = DeobConfig::default();
//! let (logger, events) = (Logger::new(), EventLog::new());
//! let result = Pipeline::new(&config, &logger, &events).run(&mut module)?;
//!
//! println!("{}", result.summary());
//! ```

#[macro_use]
pub mod logger;

pub mod codecs;
pub mod config;
pub mod context;
pub mod detection;
pub mod driver;
pub mod events;
pub mod fingerprint;
pub mod inliner;
pub mod obfuscators;
pub mod payload;
pub mod rewriter;
pub mod rpc;

pub use config::DeobConfig;
pub use context::{Reporter, Session};
pub use detection::{FamilyReport, FamilyState};
pub use driver::{DeobfuscationResult, Pipeline};
pub use events::{Event, EventKind, EventLog};
pub use logger::{LogLevel, Logger};
pub use obfuscators::{Detection, Family};
pub use payload::{PayloadSource, ResourceDecrypter};
pub use rpc::{DynamicClient, Value};
