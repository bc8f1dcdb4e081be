#![allow(clippy::new_without_default)]

//! Shared support plumbing for the `railnet` transport: the logging facade,
//! environment parameter parsing and time helpers.

pub mod logging;
pub mod param;
pub mod time;
