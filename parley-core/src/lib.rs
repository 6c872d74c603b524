// src/lib.rs

pub mod accounts;
pub mod bots;
pub mod config;
pub mod conversations;
pub mod dispatch;
pub mod eventbus;
pub mod platforms;
pub mod runtime;

pub use config::RuntimeConfig;
pub use parley_common::error::Error;
pub use runtime::{EventLoop, RunSummary, StopHandle, StopReason};
