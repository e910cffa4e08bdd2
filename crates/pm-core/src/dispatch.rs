//! Concurrent detector dispatch with per-source timeouts.
//!
//! Every detector registered for an incident runs on its own thread, at
//! most `max_concurrent_sources` at a time. Results are joined before the
//! incident moves on to span collection, so arbitration always sees the
//! complete set of answers.
//!
//! - A detector that exceeds its timeout is cancelled and abandoned. Its
//!   source contributes zero votes and is reported as degraded.
//! - A detector that returns an error (or panics) is treated the same way.
//! - If the failed source is mandatory under the policy, the incident is
//!   aborted with [`RedactionError::MandatoryDetectorFailure`].
//!
//! Abandoned threads keep running until they observe their
//! [`CancellationToken`]; they no longer count against the concurrency
//! limit.

use crate::config::DetectorSettings;
use pm_redact::{PolicyStore, RedactionError, Source, Span};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a detector may report.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The detector observed its cancellation token.
    #[error("detector cancelled")]
    Cancelled,

    /// The detector failed. The message must not quote incident text.
    #[error("detector failed: {0}")]
    DetectorFailed(String),

    /// The detector thread panicked.
    #[error("detector thread panicked")]
    Panicked,

    /// The detector thread could not be started.
    #[error("failed to spawn detector thread: {0}")]
    SpawnFailed(String),
}

/// The incident as seen by detectors.
#[derive(Debug, Clone)]
pub struct IncidentDocument {
    pub id: String,
    pub text: String,
}

impl IncidentDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Cooperative cancellation flag shared with a detector thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A PII detector consulted for each incident.
///
/// Implementations should check `cancel` between units of work and return
/// [`DispatchError::Cancelled`] once it is set.
pub trait DetectorSource: Send + Sync {
    /// Source whose vote weight this detector's spans carry.
    fn source(&self) -> Source;

    /// Human-readable name for logs and reports.
    fn name(&self) -> &str;

    /// Candidate spans for the incident, in character offsets.
    fn detect(&self, doc: &IncidentDocument, cancel: &CancellationToken) -> Result<Vec<Span>, DispatchError>;
}

/// How one detector ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    Answered,
    TimedOut,
    Failed,
}

/// Per-detector line in the incident report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorReport {
    pub name: String,
    pub source: Source,
    pub status: DetectorStatus,
    pub spans: usize,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Joined result of all detectors for one incident.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Spans from every detector that answered, in registration order.
    pub spans: Vec<Span>,
    /// Sources with at least one detector that timed out or failed.
    pub degraded_sources: Vec<Source>,
    pub detectors: Vec<DetectorReport>,
}

/// An incident whose dispatch was aborted, with the detector reports
/// settled before the abort.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DispatchFailure {
    pub error: RedactionError,
    pub detectors: Vec<DetectorReport>,
}

type Settled = Vec<Option<(DetectorReport, Vec<Span>)>>;

/// Dispatches detectors for one incident at a time.
pub struct Dispatcher<'p> {
    policy: &'p PolicyStore,
    settings: DetectorSettings,
}

struct InFlight {
    index: usize,
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
}

type Message = (usize, Result<Vec<Span>, DispatchError>);

impl<'p> Dispatcher<'p> {
    pub fn new(policy: &'p PolicyStore, settings: DetectorSettings) -> Self {
        Self { policy, settings }
    }

    /// Run all detectors against `doc` and join their results.
    ///
    /// Fails with `MandatoryDetectorFailure` if a detector of a mandatory
    /// source times out or fails; the remaining detectors are cancelled.
    pub fn dispatch(
        &self,
        doc: &Arc<IncidentDocument>,
        detectors: &[Arc<dyn DetectorSource>],
    ) -> Result<DispatchOutcome, DispatchFailure> {
        let mut results: Settled = vec![None; detectors.len()];
        match self.run(doc, detectors, &mut results) {
            Ok(()) => Ok(assemble(results)),
            Err(error) => Err(DispatchFailure {
                error,
                detectors: assemble(results).detectors,
            }),
        }
    }

    fn run(
        &self,
        doc: &Arc<IncidentDocument>,
        detectors: &[Arc<dyn DetectorSource>],
        results: &mut Settled,
    ) -> pm_redact::Result<()> {
        let limit = self.settings.max_concurrent_sources.max(1);
        let (tx, rx) = mpsc::channel::<Message>();

        let mut queue: VecDeque<usize> = (0..detectors.len()).collect();
        let mut in_flight: Vec<InFlight> = Vec::new();

        loop {
            while in_flight.len() < limit {
                let Some(index) = queue.pop_front() else { break };
                let detector = &detectors[index];
                let cancel = CancellationToken::new();
                let started = Instant::now();
                let deadline = started + self.settings.timeout_for(detector.source());
                if let Err(e) = spawn_detector(index, Arc::clone(detector), Arc::clone(doc), cancel.clone(), tx.clone()) {
                    let report = failed_report(detector.as_ref(), started, DetectorStatus::Failed, &e);
                    let settled = self.settle_failure(detector.as_ref(), &report, &in_flight);
                    results[index] = Some((report, Vec::new()));
                    settled?;
                    continue;
                }
                in_flight.push(InFlight {
                    index,
                    started,
                    deadline,
                    cancel,
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let now = Instant::now();
            let next_deadline = in_flight.iter().map(|f| f.deadline).min().unwrap_or(now);
            let wait = next_deadline.saturating_duration_since(now);

            match rx.recv_timeout(wait) {
                Ok((index, outcome)) => {
                    // A late answer from an abandoned thread is ignored.
                    let Some(pos) = in_flight.iter().position(|f| f.index == index) else {
                        continue;
                    };
                    let flight = in_flight.swap_remove(pos);
                    let detector = detectors[index].as_ref();
                    match outcome {
                        Ok(mut spans) => {
                            for span in &mut spans {
                                span.source = detector.source();
                            }
                            let report = DetectorReport {
                                name: detector.name().to_string(),
                                source: detector.source(),
                                status: DetectorStatus::Answered,
                                spans: spans.len(),
                                elapsed_ms: elapsed_ms(flight.started),
                                error: None,
                            };
                            debug!(detector = detector.name(), spans = spans.len(), "detector answered");
                            results[index] = Some((report, spans));
                        }
                        Err(e) => {
                            let report = failed_report(detector, flight.started, DetectorStatus::Failed, &e);
                            let settled = self.settle_failure(detector, &report, &in_flight);
                            results[index] = Some((report, Vec::new()));
                            settled?;
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let mut i = 0;
                    while i < in_flight.len() {
                        if in_flight[i].deadline > now {
                            i += 1;
                            continue;
                        }
                        let flight = in_flight.swap_remove(i);
                        flight.cancel.cancel();
                        let detector = detectors[flight.index].as_ref();
                        let timeout = RedactionError::DetectorTimeout {
                            detector: detector.source(),
                            elapsed: flight.started.elapsed(),
                        };
                        let report = failed_report(detector, flight.started, DetectorStatus::TimedOut, &timeout);
                        let settled = self.settle_failure(detector, &report, &in_flight);
                        results[flight.index] = Some((report, Vec::new()));
                        settled?;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Every sender lives in a running thread; treat as internal.
                    for flight in &in_flight {
                        flight.cancel.cancel();
                    }
                    return Err(RedactionError::internal());
                }
            }
        }

        Ok(())
    }

    /// Log a failed detector and abort the incident if its source is mandatory.
    fn settle_failure(
        &self,
        detector: &dyn DetectorSource,
        report: &DetectorReport,
        in_flight: &[InFlight],
    ) -> pm_redact::Result<()> {
        let reason = report.error.clone().unwrap_or_default();
        if self.policy.is_mandatory(detector.source()) {
            for flight in in_flight {
                flight.cancel.cancel();
            }
            warn!(
                detector = detector.name(),
                source = %detector.source(),
                status = ?report.status,
                "mandatory detector failed; aborting incident"
            );
            return Err(RedactionError::MandatoryDetectorFailure {
                detector: detector.source(),
                reason,
            });
        }
        warn!(
            detector = detector.name(),
            source = %detector.source(),
            status = ?report.status,
            elapsed_ms = report.elapsed_ms,
            "detector degraded; contributing zero votes"
        );
        Ok(())
    }
}

fn spawn_detector(
    index: usize,
    detector: Arc<dyn DetectorSource>,
    doc: Arc<IncidentDocument>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Message>,
) -> Result<(), DispatchError> {
    let name = format!("detector-{}", detector.source());
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| detector.detect(&doc, &cancel)))
                .unwrap_or(Err(DispatchError::Panicked));
            // The receiver is gone once the incident has moved on.
            let _ = tx.send((index, outcome));
        })
        .map(|_| ())
        .map_err(|e| DispatchError::SpawnFailed(e.to_string()))
}

fn failed_report(
    detector: &dyn DetectorSource,
    started: Instant,
    status: DetectorStatus,
    error: &dyn std::fmt::Display,
) -> DetectorReport {
    DetectorReport {
        name: detector.name().to_string(),
        source: detector.source(),
        status,
        spans: 0,
        elapsed_ms: elapsed_ms(started),
        error: Some(error.to_string()),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn assemble(results: Settled) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    for (report, spans) in results.into_iter().flatten() {
        if report.status != DetectorStatus::Answered && !outcome.degraded_sources.contains(&report.source) {
            outcome.degraded_sources.push(report.source);
        }
        outcome.spans.extend(spans);
        outcome.detectors.push(report);
    }
    outcome.degraded_sources.sort();
    outcome
}

/// Sleep in small steps until `total` has passed or `cancel` is set.
pub fn sleep_cancellable(total: Duration, cancel: &CancellationToken) -> Result<(), DispatchError> {
    let step = Duration::from_millis(5);
    let start = Instant::now();
    while start.elapsed() < total {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        thread::sleep(step.min(total.saturating_sub(start.elapsed())));
    }
    Ok(())
}
