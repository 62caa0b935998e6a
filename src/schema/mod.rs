pub mod envelope;
pub mod registry;
pub mod summary;

pub use envelope::{ChunkEnvelope, RunMetadata};
pub use registry::{SchemaRegistry, SchemaValidator, TypedSchema};
pub use summary::{Judgement, Summary, SummaryV0};
