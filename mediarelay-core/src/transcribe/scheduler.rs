use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::TranscriptionSection;
use crate::error::panic_message;
use crate::media::WorkUnit;

use super::error::{SchedulerError, TranscribeResult};
use super::{RawLine, Transcriber, TranscriptLine, TranscriptionRequest};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub concurrency_limit: usize,
    pub submit_interval: Duration,
    pub retry_limit: u32,
    pub backoff_base: Duration,
    pub batch_timeout: Duration,
    pub min_line_duration_ms: u64,
    pub api_keys: Vec<String>,
}

impl From<&TranscriptionSection> for SchedulerSettings {
    fn from(section: &TranscriptionSection) -> Self {
        let submit_interval = if section.requests_per_minute > 0.0 {
            Duration::from_secs_f64(60.0 / section.requests_per_minute)
        } else {
            Duration::ZERO
        };
        Self {
            batch_size: section.batch_size.max(1),
            concurrency_limit: section.concurrency_limit.max(1),
            submit_interval,
            retry_limit: section.retry_limit.max(1),
            backoff_base: Duration::from_millis(section.backoff_base_ms),
            batch_timeout: Duration::from_secs(section.batch_timeout_seconds),
            min_line_duration_ms: section.min_line_duration_ms,
            api_keys: section.api_keys.clone(),
        }
    }
}

impl SchedulerSettings {
    pub fn batch_count(&self, units: usize) -> usize {
        units.div_ceil(self.batch_size.max(1))
    }

    fn api_key_for(&self, batch_index: usize) -> Option<String> {
        if self.api_keys.is_empty() {
            None
        } else {
            Some(self.api_keys[batch_index % self.api_keys.len()].clone())
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Lines that survived plus per-batch accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptOutcome {
    pub lines: Vec<TranscriptLine>,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub failed_batches: Vec<usize>,
}

impl TranscriptOutcome {
    pub fn all_batches_failed(&self) -> bool {
        self.batches_total > 0 && self.batches_succeeded == 0
    }
}

/// Drives batched transcription calls through a bounded, throttled pool.
#[derive(Clone)]
pub struct BatchScheduler {
    transcriber: Arc<dyn Transcriber>,
    settings: SchedulerSettings,
}

impl BatchScheduler {
    pub fn new(transcriber: Arc<dyn Transcriber>, settings: SchedulerSettings) -> Self {
        Self {
            transcriber,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Transcribes every unit; `on_batch_done(completed, total)` fires as
    /// each batch resolves, successfully or not.
    pub async fn run<F>(&self, units: Vec<WorkUnit>, mut on_batch_done: F) -> TranscriptOutcome
    where
        F: FnMut(usize, usize) + Send,
    {
        let batches: Vec<Vec<WorkUnit>> = units
            .chunks(self.settings.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let total = batches.len();
        let mut outcome = TranscriptOutcome {
            batches_total: total,
            ..TranscriptOutcome::default()
        };
        if total == 0 {
            return outcome;
        }
        self.transcriber.prepare().await;
        info!(
            batches = total,
            units = units.len(),
            concurrency = self.settings.concurrency_limit,
            "submitting transcription batches"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency_limit.max(1)));
        let mut join_set = JoinSet::new();
        let mut pending: BTreeSet<usize> = (0..total).collect();
        for (index, units) in batches.into_iter().enumerate() {
            let request = TranscriptionRequest {
                batch_index: index,
                units,
                api_key: self.settings.api_key_for(index),
            };
            let delay = self.settings.submit_interval.saturating_mul(index as u32);
            let semaphore = semaphore.clone();
            let transcriber = self.transcriber.clone();
            let settings = self.settings.clone();
            join_set.spawn(async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                let result =
                    AssertUnwindSafe(run_batch(transcriber, settings, semaphore, request))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Err(SchedulerError::Panicked {
                                index,
                                message: panic_message(payload.as_ref()),
                            })
                        });
                (index, result)
            });
        }

        let mut completed = 0;
        while let Some(joined) = join_set.join_next().await {
            completed += 1;
            match joined {
                Ok((index, Ok(lines))) => {
                    pending.remove(&index);
                    debug!(batch = index, lines = lines.len(), "batch transcribed");
                    outcome.batches_succeeded += 1;
                    outcome.lines.extend(lines);
                }
                Ok((index, Err(err))) => {
                    pending.remove(&index);
                    warn!(batch = index, error = %err, "batch dropped from transcript");
                    outcome.failed_batches.push(index);
                }
                Err(err) => {
                    let err = SchedulerError::Join(err.to_string());
                    warn!(error = %err, "batch dropped from transcript");
                }
            }
            on_batch_done(completed, total);
        }
        // Batches whose task was torn down never reported an index.
        outcome.failed_batches.extend(pending);

        outcome.failed_batches.sort_unstable();
        outcome.lines.sort_by_key(|line| line.start_ms);
        info!(
            batches = total,
            succeeded = outcome.batches_succeeded,
            failed = total - outcome.batches_succeeded,
            lines = outcome.lines.len(),
            "transcription batches resolved"
        );
        outcome
    }
}

async fn run_batch(
    transcriber: Arc<dyn Transcriber>,
    settings: SchedulerSettings,
    semaphore: Arc<Semaphore>,
    request: TranscriptionRequest,
) -> Result<Vec<TranscriptLine>, SchedulerError> {
    let index = request.batch_index;
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|err| SchedulerError::Join(err.to_string()))?;
    match timeout(
        settings.batch_timeout,
        transcribe_with_retry(transcriber.as_ref(), &settings, &request),
    )
    .await
    {
        Ok(Ok(raw)) => Ok(resolve_lines(
            raw,
            &request.units,
            settings.min_line_duration_ms,
        )),
        Ok(Err(source)) => Err(SchedulerError::Batch { index, source }),
        Err(_) => {
            warn!(batch = index, after = ?settings.batch_timeout, "batch timed out");
            Err(SchedulerError::TimedOut {
                index,
                after: settings.batch_timeout,
            })
        }
    }
}

async fn transcribe_with_retry(
    transcriber: &dyn Transcriber,
    settings: &SchedulerSettings,
    request: &TranscriptionRequest,
) -> TranscribeResult<Vec<RawLine>> {
    let attempts = settings.retry_limit.max(1);
    let mut attempt = 0;
    loop {
        match transcriber.transcribe(request).await {
            Ok(lines) => return Ok(lines),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt + 1 >= attempts => {
                warn!(batch = request.batch_index, attempts, error = %err, "batch retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let wait = settings.backoff(attempt);
                warn!(
                    batch = request.batch_index,
                    attempt = attempt + 1,
                    wait = ?wait,
                    error = %err,
                    "retrying transcription batch"
                );
                if !wait.is_zero() {
                    sleep(wait).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Closes open-ended lines and clamps inverted ranges.
fn resolve_lines(raw: Vec<RawLine>, units: &[WorkUnit], min_line_ms: u64) -> Vec<TranscriptLine> {
    let batch_end = units.last().map(|unit| unit.end_offset_ms).unwrap_or(0);
    let next_starts: Vec<Option<u64>> = raw
        .iter()
        .skip(1)
        .map(|line| Some(line.start_ms))
        .chain(std::iter::once(None))
        .collect();
    raw.into_iter()
        .zip(next_starts)
        .map(|(line, next_start)| {
            let mut end_ms = line
                .end_ms
                .or(next_start)
                .unwrap_or(batch_end);
            if end_ms < line.start_ms {
                end_ms = line.start_ms.saturating_add(min_line_ms);
            }
            TranscriptLine {
                start_ms: line.start_ms,
                end_ms,
                text: line.text.trim().to_string(),
            }
        })
        .collect()
}
