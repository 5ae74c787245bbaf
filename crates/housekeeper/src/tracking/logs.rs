use regex::RegexSet;

use crate::Set;
use crate::common::config::LogConfig;
use crate::common::utils::str::truncate_with_ellipsis;

/// Built-in error patterns, matched case-insensitively.
pub const DEFAULT_ERROR_PATTERNS: &[&str] = &[
    r"\berror\b",
    r"\bexception\b",
    r"\bfailed\b",
    r"\bfailure\b",
    r"\bsegmentation fault\b",
    r"\bcore dumped\b",
    r"\bkilled\b",
    r"\btraceback\b",
    r"\bsevere\b",
];

/// Result of scanning log streams for error lines.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogScan {
    /// Matching lines that were not whitelisted (bounded and truncated).
    pub error_lines: Vec<String>,
    /// All lines matching an error pattern, including suppressed ones.
    pub total_matches: usize,
    /// Matching lines suppressed by the whitelist.
    pub suppressed: usize,
}

impl LogScan {
    /// Number of matching lines that were not whitelisted.
    pub fn error_count(&self) -> usize {
        self.total_matches - self.suppressed
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }
}

/// Lowercase set of whitespace separated words.
pub fn tokenize(text: &str) -> Set<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

/// A line is whitelisted when it shares at least `threshold` words with any of the phrases.
/// Word order and punctuation attached to words are not normalized.
pub fn is_whitelisted(line: &str, whitelist: &[String], threshold: usize) -> bool {
    let words = tokenize(line);
    whitelist
        .iter()
        .any(|phrase| shares_words(&words, &tokenize(phrase), threshold))
}

fn shares_words(line: &Set<String>, phrase: &Set<String>, threshold: usize) -> bool {
    line.intersection(phrase).count() >= threshold
}

/// Finds error lines in job logs while ignoring known benign messages.
pub struct LogClassifier {
    patterns: RegexSet,
    whitelist: Vec<Set<String>>,
    threshold: usize,
    max_lines: usize,
    max_kept_lines: usize,
    max_line_length: usize,
}

impl LogClassifier {
    pub fn new(config: &LogConfig) -> anyhow::Result<Self> {
        let patterns = DEFAULT_ERROR_PATTERNS
            .iter()
            .copied()
            .chain(config.patterns.iter().map(|p| p.as_str()))
            .map(|pattern| format!("(?i){pattern}"));
        let patterns = RegexSet::new(patterns)
            .map_err(|error| anyhow::anyhow!("Invalid log error pattern: {error}"))?;

        Ok(Self {
            patterns,
            whitelist: config.whitelist.iter().map(|p| tokenize(p)).collect(),
            threshold: config.whitelist_threshold,
            max_lines: config.max_lines,
            max_kept_lines: config.max_kept_lines,
            max_line_length: config.max_line_length,
        })
    }

    pub fn is_error_line(&self, line: &str) -> bool {
        self.patterns.is_match(line)
    }

    pub fn is_whitelisted(&self, line: &str) -> bool {
        let words = tokenize(line);
        self.whitelist
            .iter()
            .any(|phrase| shares_words(&words, phrase, self.threshold))
    }

    /// Scans the last `max_lines` lines of every stream.
    pub fn scan<'a>(&self, streams: impl IntoIterator<Item = &'a str>) -> LogScan {
        let mut scan = LogScan::default();
        for stream in streams {
            let line_count = stream.lines().count();
            let skip = line_count.saturating_sub(self.max_lines);
            for line in stream.lines().skip(skip) {
                if !self.is_error_line(line) {
                    continue;
                }
                scan.total_matches += 1;
                if self.is_whitelisted(line) {
                    scan.suppressed += 1;
                } else if scan.error_lines.len() < self.max_kept_lines {
                    scan.error_lines
                        .push(truncate_with_ellipsis(line.trim(), self.max_line_length));
                }
            }
        }
        scan
    }
}
