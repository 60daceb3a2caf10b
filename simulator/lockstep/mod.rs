// Lockstep Simulator Module

pub mod config;
pub mod runner;

pub use config::LockstepConfig;
pub use runner::{LockstepResult, LockstepRunner};
