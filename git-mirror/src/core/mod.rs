//! Pure data types for the mirror engine.
//!
//! Nothing here touches the filesystem or spawns processes.

pub mod entry;
pub mod report;
