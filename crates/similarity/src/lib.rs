pub mod scorer;
pub mod types;

pub use scorer::{normalize_lines, score, ReferenceTemplate};
pub use types::{SimilarityError, SimilarityResult};
