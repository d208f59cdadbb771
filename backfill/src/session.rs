//! Chunked, resumable historical downloads with durable per-chunk progress.
//!
//! A session splits `[start, end)` into consecutive chunks and works through
//! them in ascending order. Every chunk-level mutation is written to the
//! session file before the next step, so a restarted process picks up exactly
//! where the previous one stopped.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use backfill_core::{
    AtomicJsonFile, BackfillError, Bar, Clock, SessionConfig, SystemClock, Timeframe,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::validator::normalize_symbol;

/// Lifecycle of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Not attempted yet.
    Pending,
    /// Fetch dispatched.
    InProgress,
    /// Bars received; never touched again.
    Completed,
    /// Last attempt returned nothing or errored.
    Failed,
}

/// Lifecycle of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Work remains and attempts are left.
    Pending,
    /// A resume pass is running.
    InProgress,
    /// Every chunk completed.
    Completed,
    /// Some chunk exhausted its attempts.
    Failed,
    /// Stopped by the caller.
    Cancelled,
}

/// One bounded sub-range of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadChunk {
    /// Symbol being downloaded.
    pub symbol: String,
    /// Bar timeframe.
    pub timeframe: Timeframe,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Current state.
    pub status: ChunkStatus,
    /// Fetch attempts made so far.
    pub attempt_count: u32,
    /// When the last attempt started.
    pub last_attempt_time: Option<DateTime<Utc>>,
    /// Why the last attempt failed.
    pub error_message: Option<String>,
    /// Bars received by the completing attempt.
    pub bars_fetched: usize,
}

impl DownloadChunk {
    fn is_eligible(&self, max_retries: u32) -> bool {
        matches!(self.status, ChunkStatus::Pending | ChunkStatus::Failed)
            && self.attempt_count < max_retries
    }
}

/// A persisted multi-chunk download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSession {
    /// Stable identifier.
    pub session_id: String,
    /// Normalized symbol.
    pub symbol: String,
    /// Bar timeframe.
    pub timeframe: Timeframe,
    /// Start of the whole range.
    pub full_start: DateTime<Utc>,
    /// End of the whole range (exclusive).
    pub full_end: DateTime<Utc>,
    /// Chunks in ascending date order.
    pub chunks: Vec<DownloadChunk>,
    /// Current state.
    pub status: SessionStatus,
    /// Bars received across completed chunks.
    pub total_bars: usize,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl DownloadSession {
    /// Counts-only view of the session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let count = |s: ChunkStatus| self.chunks.iter().filter(|c| c.status == s).count();
        let completed = count(ChunkStatus::Completed);
        let total = self.chunks.len();
        SessionSummary {
            session_id: self.session_id.clone(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            status: self.status,
            total_chunks: total,
            completed_chunks: completed,
            failed_chunks: count(ChunkStatus::Failed),
            pending_chunks: count(ChunkStatus::Pending) + count(ChunkStatus::InProgress),
            total_bars: self.total_bars,
            progress_pct: if total == 0 {
                100.0
            } else {
                completed as f64 * 100.0 / total as f64
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn final_status(&self, max_retries: u32) -> SessionStatus {
        if self.status == SessionStatus::Cancelled {
            return SessionStatus::Cancelled;
        }
        let mut remaining = self
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .peekable();
        if remaining.peek().is_none() {
            SessionStatus::Completed
        } else if remaining.any(|c| c.attempt_count >= max_retries) {
            SessionStatus::Failed
        } else {
            SessionStatus::Pending
        }
    }
}

/// Progress snapshot of one session, as returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Symbol.
    pub symbol: String,
    /// Timeframe.
    pub timeframe: Timeframe,
    /// Session state.
    pub status: SessionStatus,
    /// Number of chunks.
    pub total_chunks: usize,
    /// Chunks completed.
    pub completed_chunks: usize,
    /// Chunks whose last attempt failed.
    pub failed_chunks: usize,
    /// Chunks not attempted yet.
    pub pending_chunks: usize,
    /// Bars received so far.
    pub total_bars: usize,
    /// Completed chunks as a percentage.
    pub progress_pct: f64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

/// Passed to the progress callback after every chunk attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Session identifier.
    pub session_id: String,
    /// Index of the chunk just attempted.
    pub chunk_index: usize,
    /// Number of chunks in the session.
    pub total_chunks: usize,
    /// Outcome of the attempt.
    pub status: ChunkStatus,
    /// Attempts made on this chunk so far.
    pub attempt_count: u32,
    /// Bars received by this attempt.
    pub bars_fetched: usize,
    /// Chunks completed so far.
    pub completed_chunks: usize,
    /// Failure message, if the attempt failed.
    pub error_message: Option<String>,
}

/// The fetch capability a session manager drives.
pub trait BarFetcher: Send + Sync {
    /// Bars for `symbol` in `[start, end)`.
    ///
    /// # Errors
    /// Any failure; the session records it on the chunk.
    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError>;
}

impl<F> BarFetcher for F
where
    F: Fn(&str, Timeframe, DateTime<Utc>, DateTime<Utc>) -> Result<Vec<Bar>, BackfillError>
        + Send
        + Sync,
{
    fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BackfillError> {
        self(symbol, timeframe, start, end)
    }
}

/// Split `[start, end)` into consecutive spans of `chunk_days` days; the last
/// span may be shorter. Empty when `start >= end` or `chunk_days == 0`.
#[must_use]
pub fn split_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk_days: u32,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut out = Vec::new();
    if chunk_days == 0 {
        return out;
    }
    let step = Duration::days(i64::from(chunk_days));
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        out.push((cursor, next));
        cursor = next;
    }
    out
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default)]
    sessions: Vec<DownloadSession>,
    last_updated: Option<DateTime<Utc>>,
}

struct Attempt {
    symbol: String,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

enum Step {
    Run(Attempt),
    Skip,
    Cancelled,
}

/// Creates, persists and resumes download sessions.
pub struct SessionManager {
    fetcher: Arc<dyn BarFetcher>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    file: Option<AtomicJsonFile<SessionFile>>,
    sessions: Mutex<BTreeMap<String, DownloadSession>>,
}

impl SessionManager {
    /// Manager driving `fetcher`; loads every persisted session first.
    ///
    /// Chunks and sessions left `in_progress` by a previous process are reset
    /// to `pending`. An unreadable session file is logged and treated as empty.
    #[must_use]
    pub fn new(fetcher: Arc<dyn BarFetcher>, config: SessionConfig) -> Self {
        let file = config
            .state_path
            .as_deref()
            .map(AtomicJsonFile::<SessionFile>::new);
        let mut sessions = BTreeMap::new();
        if let Some(f) = &file {
            match f.load() {
                Ok(Some(saved)) => {
                    for mut s in saved.sessions {
                        for c in &mut s.chunks {
                            if c.status == ChunkStatus::InProgress {
                                c.status = ChunkStatus::Pending;
                            }
                        }
                        if s.status == SessionStatus::InProgress {
                            s.status = SessionStatus::Pending;
                        }
                        sessions.insert(s.session_id.clone(), s);
                    }
                    #[cfg(feature = "tracing")]
                    tracing::info!(count = sessions.len(), "loaded download sessions");
                }
                Ok(None) => {}
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(path = %f.path().display(), error = %_e, "ignoring unreadable session file");
                }
            }
        }
        Self {
            fetcher,
            config,
            clock: Arc::new(SystemClock),
            file,
            sessions: Mutex::new(sessions),
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in effect.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create and persist a session covering `[start, end)`.
    ///
    /// # Errors
    /// `Validation` for an empty symbol, `start >= end` or a zero chunk size;
    /// `Persistence` when the session file cannot be written.
    pub fn create_session(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        chunk_size_days: u32,
    ) -> Result<String, BackfillError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(BackfillError::validation("symbol must not be empty"));
        }
        if start >= end {
            return Err(BackfillError::validation(format!(
                "start {start} must be before end {end}"
            )));
        }
        if chunk_size_days == 0 {
            return Err(BackfillError::validation("chunk_size_days must be positive"));
        }

        let now = self.clock.now();
        let chunks = split_range(start, end, chunk_size_days)
            .into_iter()
            .map(|(s, e)| DownloadChunk {
                symbol: symbol.clone(),
                timeframe,
                start: s,
                end: e,
                status: ChunkStatus::Pending,
                attempt_count: 0,
                last_attempt_time: None,
                error_message: None,
                bars_fetched: 0,
            })
            .collect::<Vec<_>>();

        let mut sessions = self.lock();
        let base = format!(
            "{symbol}_{}_{}_{}_{}",
            timeframe.as_str(),
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
            now.timestamp_millis()
        );
        let mut session_id = base.clone();
        let mut n = 1;
        while sessions.contains_key(&session_id) {
            session_id = format!("{base}_{n}");
            n += 1;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(session_id = %session_id, chunks = chunks.len(), "download session created");
        sessions.insert(
            session_id.clone(),
            DownloadSession {
                session_id: session_id.clone(),
                symbol,
                timeframe,
                full_start: start,
                full_end: end,
                chunks,
                status: SessionStatus::Pending,
                total_bars: 0,
                created_at: now,
                updated_at: now,
            },
        );
        self.persist(&sessions)?;
        Ok(session_id)
    }

    /// Attempt every eligible chunk once; `true` when the session is complete.
    ///
    /// # Errors
    /// `Validation` for an unknown session or `max_retries == 0`.
    pub fn resume(&self, session_id: &str, max_retries: u32) -> Result<bool, BackfillError> {
        self.resume_with_progress(session_id, max_retries, &mut |_| {})
    }

    /// Like [`resume`](Self::resume), reporting every chunk attempt.
    ///
    /// One pass in ascending order: every pending or failed chunk below
    /// `max_retries` attempts gets exactly one attempt. Afterwards the session
    /// is `completed` when nothing remains, `failed` when a remaining chunk is
    /// exhausted, and `pending` otherwise, so a later call picks up the rest.
    /// Cancellation is observed before each attempt. Panics in `progress` are
    /// caught and logged.
    ///
    /// # Errors
    /// `Validation` for an unknown session or `max_retries == 0`.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(name = "backfill::session::resume", skip(self, progress))
    )]
    pub fn resume_with_progress(
        &self,
        session_id: &str,
        max_retries: u32,
        progress: &mut dyn FnMut(&ChunkProgress),
    ) -> Result<bool, BackfillError> {
        if max_retries == 0 {
            return Err(BackfillError::validation("max_retries must be positive"));
        }

        let total = {
            let mut sessions = self.lock();
            let session = Self::get_mut(&mut sessions, session_id)?;
            match session.status {
                SessionStatus::Completed => return Ok(true),
                SessionStatus::Cancelled => return Ok(false),
                _ => {}
            }
            session.status = SessionStatus::InProgress;
            session.updated_at = self.clock.now();
            let total = session.chunks.len();
            self.persist_logged(&sessions);
            total
        };

        let mut attempted = false;
        for idx in 0..total {
            match self.peek(session_id, idx, max_retries)? {
                Step::Run(_) => {}
                Step::Skip => continue,
                Step::Cancelled => break,
            }
            if attempted && !self.config.chunk_delay.is_zero() {
                std::thread::sleep(self.config.chunk_delay);
            }
            let attempt = match self.begin_attempt(session_id, idx, max_retries)? {
                Step::Run(a) => a,
                Step::Skip => continue,
                Step::Cancelled => break,
            };
            attempted = true;

            let result = self
                .fetcher
                .fetch(&attempt.symbol, attempt.timeframe, attempt.start, attempt.end);
            let report = self.finish_attempt(session_id, idx, total, result)?;

            if catch_unwind(AssertUnwindSafe(|| progress(&report))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(session_id, chunk = idx, "progress callback panicked");
            }
        }

        let mut sessions = self.lock();
        let session = Self::get_mut(&mut sessions, session_id)?;
        session.status = session.final_status(max_retries);
        session.updated_at = self.clock.now();
        let done = session.status == SessionStatus::Completed;
        #[cfg(feature = "tracing")]
        tracing::info!(session_id, status = ?session.status, total_bars = session.total_bars, "resume pass finished");
        self.persist_logged(&sessions);
        Ok(done)
    }

    /// Summary of one session.
    #[must_use]
    pub fn status(&self, session_id: &str) -> Option<SessionSummary> {
        self.lock().get(session_id).map(DownloadSession::summary)
    }

    /// Full record of one session, chunks included.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<DownloadSession> {
        self.lock().get(session_id).cloned()
    }

    /// Mark a session cancelled. Completed and unknown sessions are left alone.
    ///
    /// A fetch already dispatched is not interrupted; the resume loop stops
    /// before its next attempt.
    pub fn cancel(&self, session_id: &str) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if session.status == SessionStatus::Completed {
            return false;
        }
        session.status = SessionStatus::Cancelled;
        session.updated_at = self.clock.now();
        self.persist_logged(&sessions);
        true
    }

    /// Drop completed sessions last updated more than `older_than_days` ago.
    pub fn cleanup_completed(&self, older_than_days: u32) -> usize {
        let cutoff = self.clock.now() - Duration::days(i64::from(older_than_days));
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !(s.status == SessionStatus::Completed && s.updated_at < cutoff));
        let removed = before - sessions.len();
        if removed > 0 {
            self.persist_logged(&sessions);
        }
        removed
    }

    /// Every session, oldest first.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut all: Vec<_> = self.lock().values().map(DownloadSession::summary).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.session_id.cmp(&b.session_id)));
        all
    }

    /// Sessions a resume call could still make progress on.
    #[must_use]
    pub fn resumable_sessions(&self) -> Vec<SessionSummary> {
        self.list_sessions()
            .into_iter()
            .filter(|s| matches!(s.status, SessionStatus::Pending | SessionStatus::Failed))
            .collect()
    }

    fn peek(&self, session_id: &str, idx: usize, max_retries: u32) -> Result<Step, BackfillError> {
        let mut sessions = self.lock();
        let session = Self::get_mut(&mut sessions, session_id)?;
        if session.status == SessionStatus::Cancelled {
            return Ok(Step::Cancelled);
        }
        Ok(match session.chunks.get(idx) {
            Some(c) if c.is_eligible(max_retries) => Step::Run(Attempt {
                symbol: c.symbol.clone(),
                timeframe: c.timeframe,
                start: c.start,
                end: c.end,
            }),
            _ => Step::Skip,
        })
    }

    fn begin_attempt(&self, session_id: &str, idx: usize, max_retries: u32) -> Result<Step, BackfillError> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let session = Self::get_mut(&mut sessions, session_id)?;
        if session.status == SessionStatus::Cancelled {
            #[cfg(feature = "tracing")]
            tracing::info!(session_id, "session cancelled; stopping");
            return Ok(Step::Cancelled);
        }
        let Some(chunk) = session.chunks.get_mut(idx).filter(|c| c.is_eligible(max_retries)) else {
            return Ok(Step::Skip);
        };
        chunk.status = ChunkStatus::InProgress;
        chunk.attempt_count += 1;
        chunk.last_attempt_time = Some(now);
        chunk.error_message = None;
        let attempt = Attempt {
            symbol: chunk.symbol.clone(),
            timeframe: chunk.timeframe,
            start: chunk.start,
            end: chunk.end,
        };
        session.updated_at = now;
        self.persist_logged(&sessions);
        Ok(Step::Run(attempt))
    }

    fn finish_attempt(
        &self,
        session_id: &str,
        idx: usize,
        total: usize,
        result: Result<Vec<Bar>, BackfillError>,
    ) -> Result<ChunkProgress, BackfillError> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let session = Self::get_mut(&mut sessions, session_id)?;
        let Some(chunk) = session.chunks.get_mut(idx) else {
            return Err(BackfillError::Other(format!("chunk {idx} vanished from {session_id}")));
        };

        let mut added = 0;
        match result {
            Ok(bars) if !bars.is_empty() => {
                chunk.status = ChunkStatus::Completed;
                chunk.bars_fetched = bars.len();
                chunk.error_message = None;
                added = bars.len();
            }
            Ok(_) => {
                chunk.status = ChunkStatus::Failed;
                chunk.error_message = Some("no data returned".to_string());
            }
            Err(e) => {
                chunk.status = ChunkStatus::Failed;
                chunk.error_message = Some(e.to_string());
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            session_id,
            chunk = idx,
            attempt = chunk.attempt_count,
            status = ?chunk.status,
            bars = chunk.bars_fetched,
            "chunk attempt finished"
        );

        let mut report = ChunkProgress {
            session_id: session_id.to_string(),
            chunk_index: idx,
            total_chunks: total,
            status: chunk.status,
            attempt_count: chunk.attempt_count,
            bars_fetched: added,
            completed_chunks: 0,
            error_message: chunk.error_message.clone(),
        };
        session.total_bars += added;
        session.updated_at = now;
        report.completed_chunks = session
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count();
        self.persist_logged(&sessions);
        Ok(report)
    }

    fn get_mut<'a>(
        sessions: &'a mut BTreeMap<String, DownloadSession>,
        session_id: &str,
    ) -> Result<&'a mut DownloadSession, BackfillError> {
        sessions
            .get_mut(session_id)
            .ok_or_else(|| BackfillError::validation(format!("unknown session {session_id}")))
    }

    fn persist(&self, sessions: &BTreeMap<String, DownloadSession>) -> Result<(), BackfillError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let snapshot = SessionFile {
            sessions: sessions.values().cloned().collect(),
            last_updated: Some(self.clock.now()),
        };
        file.save(&snapshot)
    }

    fn persist_logged(&self, sessions: &BTreeMap<String, DownloadSession>) {
        if let Err(_e) = self.persist(sessions) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "failed to persist download sessions");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DownloadSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
