//! Worker stderr forwarding.
//!
//! The worker logs to stderr as `<time> [LEVEL] <logger>: <message>`. Each
//! line is re-emitted under the `ragbridge::worker` target at its own level;
//! lines in any other shape are emitted at info.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::Level;

use crate::supervisor::WorkerOutput;

/// A parsed worker log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerLogLine<'a> {
    pub level: Level,
    pub logger: Option<&'a str>,
    pub message: &'a str,
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "critical" | "fatal" | "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

pub(crate) fn parse_line(line: &str) -> WorkerLogLine<'_> {
    let unstructured = WorkerLogLine {
        level: Level::INFO,
        logger: None,
        message: line,
    };
    let Some(open) = line.find('[') else {
        return unstructured;
    };
    let Some(close) = line[open..].find(']').map(|i| open + i) else {
        return unstructured;
    };
    let Some(level) = parse_level(&line[open + 1..close]) else {
        return unstructured;
    };
    let rest = line[close + 1..].trim_start();
    match rest.split_once(": ") {
        Some((logger, message)) if !logger.contains(' ') => WorkerLogLine {
            level,
            logger: Some(logger),
            message,
        },
        _ => WorkerLogLine {
            level,
            logger: None,
            message: rest,
        },
    }
}

pub(crate) fn emit(line: &str) {
    let parsed = parse_line(line);
    let logger = parsed.logger.unwrap_or("");
    let message = parsed.message;
    match parsed.level {
        Level::ERROR => tracing::error!(target: "ragbridge::worker", logger, "{}", message),
        Level::WARN => tracing::warn!(target: "ragbridge::worker", logger, "{}", message),
        Level::INFO => tracing::info!(target: "ragbridge::worker", logger, "{}", message),
        Level::DEBUG => tracing::debug!(target: "ragbridge::worker", logger, "{}", message),
        _ => tracing::trace!(target: "ragbridge::worker", logger, "{}", message),
    }
}

/// Forward every stderr line until the stream ends.
pub(crate) fn forward_stderr(stderr: WorkerOutput, max_line_length: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(max_line_length));
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => emit(line.trim_end()),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!(target: "ragbridge::worker", "Discarded oversized stderr line");
                }
                Err(LinesCodecError::Io(e)) => {
                    tracing::debug!(error = %e, "Worker stderr read failed");
                    break;
                }
            }
        }
        tracing::trace!("Worker stderr closed");
    })
}
