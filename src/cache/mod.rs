//! Local chunk caching: sparse source files and per-file chunk state.

pub mod chunk;
pub mod source;
