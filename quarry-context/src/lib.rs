pub mod text;

// Re-export the chunking entry points for external use
pub use text::{
    Chunk, ChunkError, Chunker, ChunkingConfig, Chunks, DEFAULT_BOUNDARY_DELIMITERS, chunk,
    reconstruct,
};
