pub mod normalizer;

pub use normalizer::{normalize_text, ContentNormalizer, NormalizeError};
