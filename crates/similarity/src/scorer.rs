use std::collections::HashSet;

use crate::types::{SimilarityError, SimilarityResult};

const COMMENT_MARKERS: [&str; 3] = ["//", "/*", "*"];

/// Trimmed, non-blank, non-comment lines of `text`, in order.
pub fn normalize_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !COMMENT_MARKERS.iter().any(|marker| line.starts_with(marker)))
        .collect()
}

/// The reference contract, normalized once and scored against every candidate.
#[derive(Debug, Clone)]
pub struct ReferenceTemplate {
    lines: Vec<String>,
}

impl ReferenceTemplate {
    pub fn new(text: &str) -> Result<Self, SimilarityError> {
        let lines: Vec<String> = normalize_lines(text)
            .into_iter()
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            return Err(SimilarityError::EmptyReference);
        }
        Ok(Self { lines })
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn score(&self, candidate: &str) -> SimilarityResult {
        let candidate_lines: HashSet<&str> = normalize_lines(candidate).into_iter().collect();
        let matched = self
            .lines
            .iter()
            .filter(|line| candidate_lines.contains(line.as_str()))
            .count();
        let total = self.lines.len();
        SimilarityResult {
            percent: round2(matched as f64 / total as f64 * 100.0),
            matched,
            total,
        }
    }
}

pub fn score(reference: &str, candidate: &str) -> Result<SimilarityResult, SimilarityError> {
    Ok(ReferenceTemplate::new(reference)?.score(candidate))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
