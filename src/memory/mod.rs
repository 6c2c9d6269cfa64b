pub mod blob;
pub mod notes;
pub mod vector;
pub mod working;

pub use blob::{BlobEvent, BlobStore};
pub use notes::NotePad;
pub use vector::{MemoryEntry, ScoredMemory, VectorStore};
pub use working::{ContextBuilder, WorkingContext};
