//! Core status and type enums shared by every engine component.

mod status;

pub use status::{ExecutionStatus, ExecutionType};
