//! Schema Translator (C7), spec.md §4.7, plus the cache fingerprint
//! function it shares with the Response Cache (C9).

pub mod fingerprint;
pub mod translate;

pub use fingerprint::fingerprint;
pub use translate::{decode_message, encode_message};
