//! # Encoding Module
//!
//! Integer encodings used by the on-disk format:
//!
//! - [`varint`]: self-describing variable-length integers, used for record
//!   sizes inside B-tree leaf cells and blob headers
//! - [`compact`]: minimal little-endian integers whose byte count is stored
//!   externally, used by the persisted page-manager state chain

pub mod compact;
pub mod varint;

pub use compact::{decode_compact_u64, encode_compact_u64};
pub use varint::{decode_varint, encode_varint, varint_len};
