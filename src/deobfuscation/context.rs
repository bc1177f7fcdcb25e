//! Per-run context handed to every family.
//!
//! A [`Session`] bundles what the detection, initialization and rewriting steps share:
//! the configuration, the logging sink, the event log and the optional collaborators
//! (the dynamic decryption worker and the resource decrypter). It is created by the
//! pipeline driver for one run and borrowed by each step; nothing in it is global.

use crate::{
    deobfuscation::{
        config::DeobConfig,
        events::{EventBuilder, EventKind, EventLog},
        logger::Logger,
        obfuscators::Family,
        payload::ResourceDecrypter,
        rpc::DynamicClient,
    },
    metadata::{module::Module, token::Token},
};

/// Logging and event recording for the family currently being processed.
///
/// A `Reporter` is `Copy`, so it can be used while the [`Session`] it came from is
/// mutably borrowed for the dynamic client.
#[derive(Clone, Copy)]
pub struct Reporter<'a> {
    /// The logging sink
    pub logger: &'a Logger,
    /// The structured event log
    pub events: &'a EventLog,
    /// Family events are attributed to
    pub family: Option<Family>,
}

impl<'a> Reporter<'a> {
    /// Start an event attributed to the current family.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'a> {
        let builder = self.events.record(kind);
        match self.family {
            Some(family) => builder.family(family),
            None => builder,
        }
    }
}

/// Everything one run shares across families.
pub struct Session<'a> {
    /// Run configuration
    pub config: &'a DeobConfig,
    /// The logging sink
    pub logger: &'a Logger,
    /// The structured event log
    pub events: &'a EventLog,
    /// Family currently being processed, used to attribute events
    pub family: Option<Family>,
    dynamic: Option<&'a mut dyn DynamicClient>,
    resource_decrypter: Option<&'a dyn ResourceDecrypter>,
}

impl<'a> Session<'a> {
    /// A session without collaborators.
    #[must_use]
    pub fn new(config: &'a DeobConfig, logger: &'a Logger, events: &'a EventLog) -> Self {
        Session {
            config,
            logger,
            events,
            family: None,
            dynamic: None,
            resource_decrypter: None,
        }
    }

    /// Attach the dynamic decryption worker.
    #[must_use]
    pub fn with_dynamic(mut self, client: &'a mut dyn DynamicClient) -> Self {
        self.dynamic = Some(client);
        self
    }

    /// Attach the resource decrypter collaborator.
    #[must_use]
    pub fn with_resource_decrypter(mut self, decrypter: &'a dyn ResourceDecrypter) -> Self {
        self.resource_decrypter = Some(decrypter);
        self
    }

    /// The dynamic decryption worker, if one is attached.
    pub fn dynamic(&mut self) -> Option<&mut (dyn DynamicClient + 'a)> {
        self.dynamic.as_deref_mut()
    }

    /// The resource decrypter, if one is attached.
    #[must_use]
    pub fn resource_decrypter(&self) -> Option<&'a dyn ResourceDecrypter> {
        self.resource_decrypter
    }

    /// A copyable handle for logging and events.
    #[must_use]
    pub fn reporter(&self) -> Reporter<'a> {
        Reporter {
            logger: self.logger,
            events: self.events,
            family: self.family,
        }
    }

    /// Returns true if the configured decrypter filter lets the inliners touch `method`.
    #[must_use]
    pub fn decrypter_allowed(&self, module: &Module, method: Token) -> bool {
        module
            .method_full_name(method)
            .is_some_and(|name| self.config.decrypter_filter.is_match(&name))
    }
}
