#![doc = include_str!("../README.md")]

mod config;
mod error;
mod memory;
mod pool;
mod provider;
mod stats;
mod task;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::memory::*;
pub use crate::pool::*;
pub use crate::provider::*;
pub use crate::stats::*;
pub use crate::task::*;
