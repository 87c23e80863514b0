#![forbid(unsafe_code)]
#![allow(clippy::needless_return)]
#![warn(clippy::await_holding_lock, clippy::inefficient_to_string)]

pub mod api;
pub mod cache;
pub mod config;
pub mod data_dir;
pub mod hook;
pub mod ipc;
pub mod job;
pub mod queue;
pub mod schedule;
pub mod scheduler;
pub mod statd;

mod proc;

pub use cache::Cache;
pub use config::{Config, ConfigError};
pub use data_dir::{BaseDir, DirError};
pub use hook::Hook;
pub use ipc::IpcSurface;
pub use job::Job;
pub use schedule::{Schedule, ScheduleParseError};
pub use scheduler::{ScheduleStatus, Scheduler};
pub use statd::StatService;
