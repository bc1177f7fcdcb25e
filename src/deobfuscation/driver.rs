//! The pipeline driver.
//!
//! A [`Pipeline`] runs every enabled family over a module, in the configured order, and
//! walks each through detect, initialize and apply. A family that fails is recorded in
//! its [`FamilyReport`] and skipped; the other families still run. With
//! [`DeobConfig::fail_fast`] set, the first failure is returned instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use dotscope_deob::prelude::*;
//!
//! let config = DeobConfig::default();
//! let (logger, events) = (Logger::new(), EventLog::new());
//! let mut pipeline = Pipeline::new(&config, &logger, &events);
//! let result = pipeline.run(&mut module)?;
//! println!("{}", result.summary());
//! ```

use std::time::{Duration, Instant};

use crate::{
    deobfuscation::{
        config::DeobConfig,
        context::Session,
        detection::{FamilyReport, FamilyState},
        events::{EventKind, EventLog},
        logger::Logger,
        obfuscators::{Detection, Family},
        payload::ResourceDecrypter,
        rpc::DynamicClient,
    },
    metadata::module::Module,
    Error, Result,
};

/// Outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct DeobfuscationResult {
    /// One report per family tried, in run order
    pub reports: Vec<FamilyReport>,
    /// Detections of the families that matched, in run order
    pub detections: Vec<Detection>,
    /// Events recorded during the run
    pub events: EventLog,
    /// Wall time of the run
    pub total_time: Duration,
}

impl DeobfuscationResult {
    /// The report of `family`, if it was tried.
    #[must_use]
    pub fn report(&self, family: Family) -> Option<&FamilyReport> {
        self.reports.iter().find(|r| r.family == family)
    }

    /// The state `family` ended in, [`FamilyState::Unscanned`] if it was not tried.
    #[must_use]
    pub fn state(&self, family: Family) -> FamilyState {
        self.report(family).map(|r| r.state.clone()).unwrap_or_default()
    }

    /// Families whose fingerprint matched.
    #[must_use]
    pub fn detected(&self) -> Vec<Family> {
        self.detections.iter().map(Detection::family).collect()
    }

    /// Returns true if no family failed with an error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.reports.iter().all(FamilyReport::succeeded)
    }

    /// One line: detected families and the transformation counts.
    #[must_use]
    pub fn summary(&self) -> String {
        let detected: Vec<String> = self
            .detections
            .iter()
            .map(|d| match d.version() {
                Some(version) => format!("{} {version}", d.family()),
                None => d.family().to_string(),
            })
            .collect();
        format!(
            "{} ({}) in {:.2?}",
            if detected.is_empty() {
                "no obfuscator detected".to_string()
            } else {
                detected.join(", ")
            },
            self.events.summary(),
            self.total_time
        )
    }

    /// [`DeobfuscationResult::summary`] followed by one line per detected family.
    #[must_use]
    pub fn detailed_summary(&self) -> String {
        let mut out = self.summary();
        for report in self.reports.iter().filter(|r| r.state.is_detected() || r.error.is_some()) {
            out.push('\n');
            out.push_str(&report.to_string());
        }
        out
    }
}

/// Runs the families over a module.
pub struct Pipeline<'a> {
    config: &'a DeobConfig,
    logger: &'a Logger,
    events: &'a EventLog,
    dynamic: Option<&'a mut dyn DynamicClient>,
    resource_decrypter: Option<&'a dyn ResourceDecrypter>,
}

impl<'a> Pipeline<'a> {
    /// A pipeline without collaborators.
    #[must_use]
    pub fn new(config: &'a DeobConfig, logger: &'a Logger, events: &'a EventLog) -> Self {
        Pipeline {
            config,
            logger,
            events,
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

    /// Run every enabled family over `module`.
    ///
    /// # Errors
    /// Only with [`DeobConfig::fail_fast`]: the first family error. Otherwise errors are
    /// recorded in the reports and the run continues.
    pub fn run(&mut self, module: &mut Module) -> Result<DeobfuscationResult> {
        let start = Instant::now();
        let config = self.config;
        let logger = self.logger;

        let mut session = Session::new(config, logger, self.events);
        if let Some(client) = self.dynamic.as_deref_mut() {
            session = session.with_dynamic(client);
        }
        if let Some(decrypter) = self.resource_decrypter {
            session = session.with_resource_decrypter(decrypter);
        }

        let mut reports = Vec::with_capacity(config.families.len());
        let mut detections = Vec::new();
        for &family in &config.families {
            session.family = Some(family);
            let mut report = FamilyReport::new(family);

            logger.indent();
            let outcome = run_family(family, module, &mut session, &mut report, &mut detections);
            logger.deindent();

            if let Err(error) = outcome {
                deob_error!(logger, "{}: {}", family, error);
                session
                    .reporter()
                    .record(EventKind::Error)
                    .message(format!("{family}: {error}"));
                report.error = Some(error.to_string());
                if config.fail_fast {
                    return Err(error);
                }
            }
            reports.push(report);
        }

        Ok(DeobfuscationResult {
            reports,
            detections,
            events: self.events.clone(),
            total_time: start.elapsed(),
        })
    }

    /// Re-resolve every detection against `new`, a reload of `old`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Rebind`] for the first member that no longer resolves.
    pub fn rebind(detections: &[Detection], old: &Module, new: &Module) -> Result<Vec<Detection>> {
        detections.iter().map(|d| d.rebind(old, new)).collect()
    }
}

fn run_family(
    family: Family,
    module: &mut Module,
    session: &mut Session,
    report: &mut FamilyReport,
    detections: &mut Vec<Detection>,
) -> Result<()> {
    let logger = session.logger;
    let Some(mut detection) = family.detect(module, session)? else {
        deob_verbose!(logger, "{} not detected", family);
        return report.state.advance(FamilyState::NotDetected);
    };

    let version = detection.version();
    match &version {
        Some(version) => deob_info!(logger, "Detected {} {}", family, version),
        None => deob_info!(logger, "Detected {}", family),
    }
    session
        .reporter()
        .record(EventKind::DetectionComplete)
        .message(match &version {
            Some(version) => format!("{family} {version}"),
            None => family.to_string(),
        });
    report.state.advance(FamilyState::Detected(version))?;

    if !session.config.any_transform_enabled() {
        detections.push(detection);
        return Ok(());
    }

    let initialized = detection.initialize(module, session);
    detections.push(detection.clone());
    if let Some(reason) = undecryptable(report, initialized)? {
        deob_warn!(logger, "{}: payload unavailable ({})", family, reason);
        return Ok(());
    }

    let applied = detection.apply(module, session);
    let changes = match applied {
        Ok(changes) => changes,
        Err(error) => {
            if let Some(reason) = undecryptable(report, Err(error))? {
                deob_warn!(logger, "{}: payload unavailable ({})", family, reason);
            }
            return Ok(());
        }
    };
    deob_verbose!(logger, "{}: {} changes", family, changes);
    report.state.advance(FamilyState::Applied)
}

/// Advance past `outcome`: `Initialized` on success, `DetectedButUndecryptable` (with
/// the reason returned) when the payload is unavailable, the error otherwise.
fn undecryptable(report: &mut FamilyReport, outcome: Result<()>) -> Result<Option<String>> {
    match outcome {
        Ok(()) => {
            report.state.advance(FamilyState::Initialized)?;
            Ok(None)
        }
        Err(Error::PayloadUnavailable(reason)) => {
            report
                .state
                .advance(FamilyState::DetectedButUndecryptable(reason.clone()))?;
            Ok(Some(reason))
        }
        Err(error) => Err(error),
    }
}
