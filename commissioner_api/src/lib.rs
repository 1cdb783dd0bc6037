pub mod config;
pub mod constants;
pub mod error;
pub mod status;

/// Identifier of an object on the virtualization platform.
pub type ObjectId = String;
