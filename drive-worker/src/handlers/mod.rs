//! Provider handlers.

pub mod drive;
