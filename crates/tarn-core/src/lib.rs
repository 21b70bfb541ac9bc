//! Shared vocabulary of the tarn bytecode.
//!
//! Everything the compiler and the virtual machine must agree on lives here:
//! the executable image layout, the 16-bit type tags with their storage
//! classes, the runtime value representation, the opcode table and word
//! encoding, and the host-embed signature format with its table checksum.

pub mod embed;
pub mod image;
pub mod opcode;
pub mod types;
pub mod value;

pub use embed::{table_checksum, EmbedSig};
pub use image::{CodePos, Image, ImageBuilder, StructDescriptor};
pub use opcode::Opcode;
pub use types::Storage;
pub use value::{ErrInfo, Value};
