//! Process-global tracing setup for cyclerun binaries.

mod common;

pub use self::common::*;

#[cfg_attr(feature = "trace", path = "chrome.rs")]
#[cfg_attr(not(feature = "trace"), path = "plain.rs")]
mod r#impl;

pub use self::r#impl::*;
