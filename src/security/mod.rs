//! Textual safety checks that run before anything touches the interpreter
//! or the file system.

pub mod path;
pub mod policy;
