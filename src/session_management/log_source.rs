//! Log source capability and the file-backed implementation.

use crate::alerting::types::Severity;
use crate::error_handling::types::{ExternalError, TailError};
use crate::session_management::types::{LogBatch, LogCursor, LogLine};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Upper bound on bytes read from a file per query.
const MAX_READ_BYTES: u64 = 1024 * 1024;

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Lines of `source` matching `filter` strictly after `since`, at most `limit` of them.
    ///
    /// When `since` no longer exists in the source the batch starts over from the
    /// beginning and is flagged `reset`.
    async fn query(
        &self,
        source: &str,
        filter: &str,
        since: LogCursor,
        limit: usize,
    ) -> Result<LogBatch, ExternalError>;

    /// Position of the end of `source`; tailing starts from here.
    async fn current_cursor(&self, source: &str) -> Result<LogCursor, ExternalError>;
}

/// Parsed filter expression.
///
/// `level=<LEVEL>` keeps lines at or above the level, anything else non-empty is a
/// regular expression over the message, empty keeps everything.
#[derive(Debug, Clone)]
pub enum LogFilter {
    All,
    MinLevel(Severity),
    Pattern(Regex),
}

impl LogFilter {
    pub fn parse(expression: &str) -> Result<LogFilter, TailError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(LogFilter::All);
        }
        if let Some(level) = expression.strip_prefix("level=") {
            return level
                .parse::<Severity>()
                .map(LogFilter::MinLevel)
                .map_err(TailError::Validation);
        }
        Regex::new(expression)
            .map(LogFilter::Pattern)
            .map_err(|e| TailError::Validation(format!("bad filter pattern: {}", e)))
    }

    pub fn matches(&self, level: Severity, message: &str) -> bool {
        match self {
            LogFilter::All => true,
            LogFilter::MinLevel(min) => level >= *min,
            LogFilter::Pattern(re) => re.is_match(message),
        }
    }
}

/// Reads plain-text log files named in `[tailing.sources]`.
///
/// The cursor is the byte offset just past the last consumed line. A file shorter than
/// the cursor has been rotated or truncated and is read again from the start.
pub struct FileLogSource {
    sources: BTreeMap<String, PathBuf>,
}

impl FileLogSource {
    pub fn new(sources: BTreeMap<String, PathBuf>) -> Self {
        Self { sources }
    }

    fn path(&self, source: &str) -> Result<&PathBuf, ExternalError> {
        self.sources
            .get(source)
            .ok_or_else(|| ExternalError::Fatal(format!("unknown log source '{}'", source)))
    }
}

#[async_trait]
impl LogSource for FileLogSource {
    async fn query(
        &self,
        source: &str,
        filter: &str,
        since: LogCursor,
        limit: usize,
    ) -> Result<LogBatch, ExternalError> {
        let filter = LogFilter::parse(filter).map_err(|e| ExternalError::Fatal(e.to_string()))?;
        let path = self.path(source)?;
        let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let len = file.metadata().await.map_err(io_error)?.len();

        let mut offset = since.0;
        let reset = len < offset;
        if reset {
            debug!("{} shrank below cursor {}, reading from start", path.display(), offset);
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).await.map_err(io_error)?;
        let mut buffer = Vec::new();
        file.take(MAX_READ_BYTES)
            .read_to_end(&mut buffer)
            .await
            .map_err(io_error)?;

        let mut batch = LogBatch {
            lines: Vec::new(),
            next_cursor: LogCursor(offset),
            reset,
        };
        let mut consumed = 0usize;
        while batch.lines.len() < limit {
            let rest = &buffer[consumed..];
            let line_len = match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => pos + 1,
                // a line longer than one read is taken as is
                None if rest.len() as u64 == MAX_READ_BYTES => rest.len(),
                None => break,
            };
            let raw = String::from_utf8_lossy(&rest[..line_len]);
            consumed += line_len;
            let cursor = LogCursor(offset + consumed as u64);
            batch.next_cursor = cursor;

            let message = raw.trim_end_matches(['\r', '\n']);
            if message.is_empty() {
                continue;
            }
            let level = Severity::detect(message);
            if filter.matches(level, message) {
                batch.lines.push(LogLine {
                    cursor,
                    timestamp: leading_timestamp(message),
                    level,
                    message: message.to_string(),
                });
            }
        }
        Ok(batch)
    }

    async fn current_cursor(&self, source: &str) -> Result<LogCursor, ExternalError> {
        let path = self.path(source)?;
        let metadata = tokio::fs::metadata(path).await.map_err(io_error)?;
        Ok(LogCursor(metadata.len()))
    }
}

fn io_error(e: std::io::Error) -> ExternalError {
    match e.kind() {
        ErrorKind::PermissionDenied => ExternalError::Fatal(e.to_string()),
        // missing files are usually mid-rotation
        _ => ExternalError::Transient(e.to_string()),
    }
}

fn leading_timestamp(message: &str) -> Option<DateTime<Utc>> {
    let token = message.split_whitespace().next()?;
    let token = token.trim_start_matches('[').trim_end_matches(']');
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
