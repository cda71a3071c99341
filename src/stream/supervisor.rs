//! The per-connection stream supervisor.
//!
//! Consumes SSE lines from the current upstream attempt, classifies each
//! record as forwardable, terminal, or an interruption, and on interruption
//! synthesizes a continuation request carrying the delivered text as prior
//! context. The client observes one uninterrupted stream.

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::error::error_body_with_details;
use crate::stream::frame::{self, DataFrame};
use crate::stream::rewrite::{self, RewriteError};
use crate::stream::sse;
use crate::stream::InterruptionReason;

/// Output cap fallback when the client does not specify `maxOutputTokens`.
const DEFAULT_MAX_OUTPUT_CHARS: usize = 65_535;

/// Consecutive punctuation-terminated resume attempts that count as success.
const PUNCTUATION_STREAK_TARGET: u32 = 3;

/// Sentence-terminating glyphs recognized by the resume heuristic.
const SENTENCE_PUNCTUATION: [char; 14] = [
    '.', '!', '?', '…', '\'', '"', '》', '>', '。', '？', '！', '}', ']', ')',
];

/// Tunables for one supervised session.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub swallow_thoughts_after_retry: bool,
    pub punctuation_heuristic: bool,
}

/// Outcome of a continuation request that did not yield a new stream.
#[derive(Debug)]
pub enum ContinuationFailure {
    /// Non-retryable upstream status; `body` is forwarded to the client.
    Fatal { status: u16, body: Bytes },
    /// Transient failure: other non-200 statuses and network errors.
    Retryable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("client disconnected")]
    ClientGone,
    #[error("retry limit exceeded, last interruption: {reason}")]
    RetryBudgetExhausted { reason: InterruptionReason },
    #[error("continuation rejected by upstream with status {status}")]
    UpstreamFatal { status: u16 },
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

/// Write side of the client connection. Sends are flushed immediately by the
/// channel-backed response body; a failed send means the client went away.
#[derive(Clone)]
pub struct ClientSink {
    tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
}

impl ClientSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>) -> Self {
        Self { tx }
    }

    /// # Errors
    ///
    /// Returns [`SupervisorError::ClientGone`] when the client disconnected.
    pub async fn send(&self, bytes: Bytes) -> Result<(), SupervisorError> {
        self.tx
            .send(Ok(bytes))
            .await
            .map_err(|_| SupervisorError::ClientGone)
    }
}

/// True when the fragment ends in sentence punctuation, closing
/// quote/bracket glyphs included, or in a raw newline.
fn ends_with_sentence_punctuation(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if text.ends_with('\n') {
        return true;
    }
    trimmed
        .chars()
        .next_back()
        .is_some_and(|last| SENTENCE_PUNCTUATION.contains(&last))
}

/// State carried for the lifetime of one client connection.
struct Session {
    accumulated_text: String,
    retry_count: u32,
    outputting_formal: bool,
    swallow_mode: bool,
    resume_punct_streak: u32,
    max_output_chars: usize,
}

/// State reset at the start of every upstream attempt.
#[derive(Default)]
struct Attempt {
    interruption: Option<InterruptionReason>,
    clean_exit: bool,
    last_formal_text: String,
    last_formal_line: String,
    last_formal_flushed: bool,
    lines_processed: u64,
}

/// Supervise one client connection across upstream attempts.
///
/// `open_continuation` issues a continuation POST with the given body and
/// resolves to the new attempt's line feed, or to a [`ContinuationFailure`].
///
/// # Errors
///
/// Returns [`SupervisorError`] when the session ends in failure; recoverable
/// interruptions are handled internally.
pub async fn process_stream<F, Fut>(
    settings: &SupervisorSettings,
    original_body: &Map<String, Value>,
    initial_lines: mpsc::Receiver<String>,
    sink: &ClientSink,
    mut open_continuation: F,
) -> Result<(), SupervisorError>
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = Result<mpsc::Receiver<String>, ContinuationFailure>>,
{
    let mut session = Session {
        accumulated_text: String::new(),
        retry_count: 0,
        outputting_formal: false,
        swallow_mode: false,
        resume_punct_streak: 0,
        max_output_chars: max_output_chars(original_body),
    };
    let mut lines = initial_lines;
    let session_started = Instant::now();

    tracing::debug!(
        max_retries = settings.max_retries,
        max_output_chars = session.max_output_chars,
        "starting stream session"
    );

    loop {
        let attempt_started = Instant::now();
        let mut attempt = run_attempt(&mut session, &mut lines, sink).await?;

        tracing::debug!(
            attempt = session.retry_count + 1,
            lines = attempt.lines_processed,
            duration_ms = attempt_started.elapsed().as_millis() as u64,
            accumulated_chars = session.accumulated_text.len(),
            "stream attempt finished"
        );

        apply_punctuation_heuristic(settings, &mut session, &mut attempt, sink).await;

        if attempt.clean_exit {
            tracing::info!(
                retries = session.retry_count,
                total_chars = session.accumulated_text.len(),
                duration_ms = session_started.elapsed().as_millis() as u64,
                "stream completed"
            );
            return Ok(());
        }

        let reason = attempt.interruption.unwrap_or(InterruptionReason::Drop);
        tracing::warn!(
            reason = reason.as_str(),
            retry_count = session.retry_count,
            accumulated_chars = session.accumulated_text.len(),
            "stream interrupted"
        );

        if settings.swallow_thoughts_after_retry && session.outputting_formal {
            session.swallow_mode = true;
        }

        lines = open_next_attempt(
            settings,
            &mut session,
            original_body,
            sink,
            reason,
            &mut open_continuation,
        )
        .await?;
    }
}

/// Consume one upstream line feed until clean exit, interruption, or EOF.
async fn run_attempt(
    session: &mut Session,
    lines: &mut mpsc::Receiver<String>,
    sink: &ClientSink,
) -> Result<Attempt, SupervisorError> {
    let mut attempt = Attempt::default();

    while let Some(line) = lines.recv().await {
        attempt.lines_processed += 1;

        let is_data = frame::is_data_line(&line);
        let parsed = DataFrame::parse(&line);
        let view = parsed.view();
        let finish = parsed.finish_reason().map(str::to_owned);

        if session.swallow_mode {
            if view.is_thought {
                if finish.is_some() {
                    attempt.interruption = Some(InterruptionReason::FinishDuringThought);
                    break;
                }
                tracing::debug!("swallowing thought chunk after retry");
                continue;
            }
            if is_data {
                tracing::debug!("formal chunk received, leaving swallow mode");
                session.swallow_mode = false;
            }
        }

        // Record the last formal chunk before the interruption tests, so a
        // record that itself triggers a retry still feeds the cross-attempt
        // punctuation heuristic.
        if !view.text.is_empty() && !view.is_thought {
            attempt.last_formal_text.clone_from(&view.text);
            attempt.last_formal_line.clone_from(&line);
            attempt.last_formal_flushed = false;
        }

        attempt.interruption = classify(session, &parsed, &view, finish.as_deref(), is_data);
        if attempt.interruption.is_some() {
            break;
        }

        let at_end = matches!(finish.as_deref(), Some("STOP" | "MAX_TOKENS"));
        let processed = frame::remove_done_marker(&line, at_end);
        sink.send(sse::data_frame(processed.as_ref())).await?;

        if !view.text.is_empty() && !view.is_thought {
            session.outputting_formal = true;
            session.accumulated_text.push_str(&view.text);
            attempt.last_formal_flushed = true;
        }

        if session.max_output_chars > 0
            && session.accumulated_text.len() >= session.max_output_chars
        {
            tracing::info!(
                limit = session.max_output_chars,
                "output character limit reached, treating as clean exit"
            );
            attempt.clean_exit = true;
            break;
        }

        if at_end {
            attempt.clean_exit = true;
            break;
        }
    }

    if !attempt.clean_exit && attempt.interruption.is_none() {
        // EOF without a finish reason: the upstream silently dropped us.
        attempt.interruption = Some(InterruptionReason::Drop);
    }
    Ok(attempt)
}

/// Per-record interruption tests, in priority order.
fn classify(
    session: &Session,
    parsed: &DataFrame,
    view: &frame::FrameView,
    finish: Option<&str>,
    is_data: bool,
) -> Option<InterruptionReason> {
    if finish.is_some() && view.is_thought {
        return Some(InterruptionReason::FinishDuringThought);
    }
    if parsed.is_blocked() {
        return Some(InterruptionReason::Block);
    }
    if is_data && !parsed.valid_structure() {
        return Some(InterruptionReason::InvalidCandidates);
    }
    match finish {
        Some("STOP") => {
            let combined = format!("{}{}", session.accumulated_text, view.text);
            let trimmed = combined.trim();
            if trimmed.is_empty() {
                Some(InterruptionReason::FinishEmptyResponse)
            } else if !trimmed.ends_with(frame::DONE_MARKER) {
                Some(InterruptionReason::FinishIncomplete)
            } else {
                None
            }
        }
        Some("MAX_TOKENS") | None => None,
        Some(_) => Some(InterruptionReason::FinishAbnormal),
    }
}

/// Cross-attempt success heuristic: three consecutive resumed attempts whose
/// last formal fragment ends in sentence punctuation count as completion.
async fn apply_punctuation_heuristic(
    settings: &SupervisorSettings,
    session: &mut Session,
    attempt: &mut Attempt,
    sink: &ClientSink,
) {
    if !settings.punctuation_heuristic || attempt.clean_exit || session.retry_count == 0 {
        return;
    }

    if !attempt.last_formal_text.is_empty()
        && ends_with_sentence_punctuation(&attempt.last_formal_text)
    {
        session.resume_punct_streak += 1;
        tracing::info!(
            streak = session.resume_punct_streak,
            "resume attempt ended with sentence punctuation"
        );
    } else {
        session.resume_punct_streak = 0;
    }

    if session.resume_punct_streak < PUNCTUATION_STREAK_TARGET {
        return;
    }

    tracing::info!("treating stream as complete after consecutive punctuation-terminated resumes");
    if !attempt.last_formal_flushed && !attempt.last_formal_line.is_empty() {
        // The trailing record was withheld by the interruption that ended
        // this attempt; deliver it exactly once to keep the client's text in
        // step with the accumulated text.
        let finish = DataFrame::parse(&attempt.last_formal_line)
            .finish_reason()
            .map(str::to_owned);
        let at_end = matches!(finish.as_deref(), Some("STOP" | "MAX_TOKENS"));
        let processed = frame::remove_done_marker(&attempt.last_formal_line, at_end);
        if sink.send(sse::data_frame(processed.as_ref())).await.is_ok() {
            session.accumulated_text.push_str(&attempt.last_formal_text);
            session.outputting_formal = true;
        }
    }
    attempt.clean_exit = true;
}

/// The retry gate: enforce the budget, synthesize the continuation request,
/// and keep issuing it until a stream opens or the session fails.
async fn open_next_attempt<F, Fut>(
    settings: &SupervisorSettings,
    session: &mut Session,
    original_body: &Map<String, Value>,
    sink: &ClientSink,
    reason: InterruptionReason,
    open_continuation: &mut F,
) -> Result<mpsc::Receiver<String>, SupervisorError>
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = Result<mpsc::Receiver<String>, ContinuationFailure>>,
{
    loop {
        if session.retry_count >= settings.max_retries {
            let message = format!(
                "Retry limit ({}) exceeded after stream interruption. Last reason: {reason}.",
                settings.max_retries
            );
            let payload = error_body_with_details(
                504,
                &message,
                json!([{
                    "@type": "proxy.debug",
                    "accumulated_text_chars": session.accumulated_text.len(),
                }]),
            );
            let _ = sink.send(sse::error_event_frame(&payload)).await;
            return Err(SupervisorError::RetryBudgetExhausted { reason });
        }
        session.retry_count += 1;
        tracing::info!(
            attempt = session.retry_count,
            max = settings.max_retries,
            "issuing continuation request"
        );

        let body = match rewrite::build_continuation_body(original_body, &session.accumulated_text)
        {
            Ok(body) => body,
            Err(err) => {
                let payload = json!({
                    "error": {
                        "code": 400,
                        "status": "INVALID_ARGUMENT",
                        "message": format!("Failed to build continuation request: {err}"),
                    }
                });
                let _ = sink.send(sse::error_event_frame(&payload)).await;
                return Err(err.into());
            }
        };

        let body_bytes = match serde_json::to_vec(&Value::Object(body)) {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize continuation body");
                tokio::time::sleep(settings.retry_delay).await;
                continue;
            }
        };

        match open_continuation(body_bytes).await {
            Ok(lines) => {
                tracing::info!(
                    retry = session.retry_count,
                    accumulated_chars = session.accumulated_text.len(),
                    "continuation stream opened"
                );
                return Ok(lines);
            }
            Err(ContinuationFailure::Fatal { status, body }) => {
                tracing::error!(status, "non-retryable status during continuation");
                let _ = sink.send(sse::error_event_frame_raw(&body)).await;
                return Err(SupervisorError::UpstreamFatal { status });
            }
            Err(ContinuationFailure::Retryable(message)) => {
                tracing::warn!(
                    error = %message,
                    delay_ms = settings.retry_delay.as_millis() as u64,
                    "continuation attempt failed, backing off"
                );
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}

fn max_output_chars(body: &Map<String, Value>) -> usize {
    body.get("generationConfig")
        .and_then(|config| config.get("maxOutputTokens"))
        .and_then(Value::as_u64)
        .filter(|&tokens| tokens > 0)
        .map_or(DEFAULT_MAX_OUTPUT_CHARS, |tokens| tokens as usize)
}
