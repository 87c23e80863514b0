use clap::{Args, Parser, Subcommand};

/// Command line arguments for the bsrv daemon.
///
/// Everything that varies per deployment but not per job lives in the config
/// file; the command line only picks the config file, the subcommand, and
/// the IPC listener address.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct DefaultCommandLineArgs {
  /// Path to the TOML configuration file.
  #[arg(short = 'c', long, env = "BSRVD_CONFIG", default_value = "/etc/bsrvd.toml")]
  pub config: std::path::PathBuf,

  #[command(subcommand)]
  pub cmd: Option<SubCommands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommands {
  /// Starts the backup supervisor daemon.
  Run(RunArgs),
  /// Starts the companion stat service auditing archive freshness.
  Statd,
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
  /// Authority (<host>:<port>) the IPC server binds to.
  #[arg(short, long, env = "BSRVD_ADDRESS", default_value = "localhost:7141")]
  pub address: String,
}
