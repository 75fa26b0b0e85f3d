use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityResult {
    /// Share of reference lines found in the candidate, rounded to 2 decimals.
    pub percent: f64,
    pub matched: usize,
    pub total: usize,
}

impl SimilarityResult {
    pub fn meets(&self, threshold: f64) -> bool {
        self.percent >= threshold
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("reference contract has no comparable lines")]
    EmptyReference,
}
