pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod store;

pub use dedup::{jaccard, DedupEngine, DedupVerdict};
pub use error::{IngestError, Result};
pub use fingerprint::{fingerprint, Fingerprint, SimilaritySignature};
pub use pipeline::IngestPipeline;
pub use store::ArticleStore;
