// Library exports for the warden process supervisor

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod logs;
pub mod process;
