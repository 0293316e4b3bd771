//! Re-ID - Short-Horizon Person Re-Identification
//!
//! ## Responsibilities
//!
//! - Compute a compact appearance embedding for a person patch
//! - Match embeddings against a bounded, LRU-evicted gallery
//! - Remember which directions each person has already been counted in
//! - Snapshot the gallery to disk and reload it on startup
//!
//! This is a deduplication aid over minutes, not biometric identification:
//! the embedding is an appearance heuristic (clothing color, coarse shape)
//! and the similarity threshold is an operator tunable.

mod embedding;
mod gallery;

pub use embedding::{cosine_similarity, EmbeddingExtractor, HistogramEmbedder};
pub use gallery::{GalleryConfig, PersonGallery, PersonRecord, PersonSummary};
