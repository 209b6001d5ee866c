//! CLI commands.

pub mod bench;
pub mod info;
pub mod validate;
pub mod verify;
