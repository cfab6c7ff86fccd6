pub mod reassembler;
pub mod sse;

pub use reassembler::{ReassemblerState, StreamReassembler};
pub use sse::{upstream_chunk_stream, SseEvent, SseParser};
