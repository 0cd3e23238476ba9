//! Host-side simulator for the `ostinato-core` motion stack.

pub mod config;
pub mod job;
pub mod sim;
