//! Ingestion progress reporting.
//!
//! Reports what `repo-guide ingest` is doing (fetching, selecting files,
//! embedding n of m chunks) so a long ingestion is observable. Progress is
//! emitted on **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for an ingestion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestEvent {
    /// Cloning or updating the working copy.
    Loading { url: String },
    /// Walking the working copy at `commit`.
    Selecting { commit: String },
    /// `n` of `total` chunks embedded and written.
    Embedding { n: u64, total: u64 },
}

/// Reports ingestion progress. Implementations write to stderr.
pub trait IngestProgress: Send + Sync {
    fn report(&self, event: IngestEvent);
}

/// Human-friendly progress on stderr: "ingest  embedding  1,234 / 5,000 chunks".
pub struct StderrProgress;

impl IngestProgress for StderrProgress {
    fn report(&self, event: IngestEvent) {
        let line = match &event {
            IngestEvent::Loading { url } => format!("ingest  loading {}...\n", url),
            IngestEvent::Selecting { commit } => {
                format!("ingest  selecting files at {}\n", short_commit(commit))
            }
            IngestEvent::Embedding { n, total } => format!(
                "ingest  embedding  {} / {} chunks\n",
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgress for JsonProgress {
    fn report(&self, event: IngestEvent) {
        let obj = match &event {
            IngestEvent::Loading { url } => serde_json::json!({
                "event": "progress",
                "phase": "loading",
                "url": url
            }),
            IngestEvent::Selecting { commit } => serde_json::json!({
                "event": "progress",
                "phase": "selecting",
                "commit": commit
            }),
            IngestEvent::Embedding { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgress for NoProgress {
    fn report(&self, _event: IngestEvent) {}
}

fn short_commit(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit(&"a".repeat(40)), "aaaaaaaaaaaa");
        assert_eq!(short_commit("abc"), "abc");
    }
}
