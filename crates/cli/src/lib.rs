#![forbid(unsafe_code)]
#![allow(clippy::needless_return)]

mod args;

pub use args::{DefaultCommandLineArgs, RunArgs, SubCommands};
