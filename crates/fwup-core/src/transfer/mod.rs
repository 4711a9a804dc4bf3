//! Chunk transfer engine.

pub mod chunk;
pub mod engine;

pub use chunk::{Chunk, ChunkLayout, Chunks};
pub use engine::{ChunkTransfer, TransferEvent, TransferStats};
