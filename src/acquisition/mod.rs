// src/acquisition/mod.rs
//! Transfer buffers, frame assembly, measurements and timestamps

pub mod frames;
pub mod measurement;
pub mod timestamps;
pub mod transfer_buffer;

pub use frames::{deinterleave, FrameAssembler};
pub use measurement::{ChannelScaling, Measurement};
pub use timestamps::Timestamper;
pub use transfer_buffer::{BufferSpec, TransferBuffer, TransferMetrics};
