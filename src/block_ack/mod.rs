//! Recipient-side Block-Ack: agreements, reorder buffers and bitmaps.

pub mod agreement;
pub mod cache;
pub mod reorder;
pub mod seq;

pub use agreement::{AddBaResponse, BlockAckAgreement};
pub use cache::BlockAckCache;
pub use reorder::ReorderBuffer;
