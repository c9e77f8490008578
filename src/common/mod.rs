//! Small shared types.
mod bytestr;
mod secret;

pub use bytestr::ByteStr;
pub use secret::Secret;
