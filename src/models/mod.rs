//! Domain model module declarations.

pub mod client;
pub mod evaluation;
pub mod progress;
