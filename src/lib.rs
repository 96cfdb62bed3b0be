//! Multi-source related-paper discovery.
//!
//! Given a source paper, [`layers::coordinator::DiscoveryCoordinator`] queries the
//! bibliographic index, academic graph and realtime research providers in
//! parallel, then hands the combined candidates to
//! [`layers::synthesis::SynthesisEngine`] for deduplication, optional language
//! model re-scoring, filtering and ranking.

pub mod config;
pub mod error;
pub mod layers;

pub use config::Settings;
pub use error::{DiscoveryError, LlmError, SourceError};
pub use layers::coordinator::DiscoveryCoordinator;
pub use layers::result::RelatedPaperDiscoveryResult;
pub use layers::synthesis::SynthesisEngine;
pub use layers::{DiscoveredPaper, DiscoveryConfiguration, DiscoverySource, RelationshipType, SourcePaper};
