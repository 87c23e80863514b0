#![allow(clippy::needless_return)]

use clap::{CommandFactory, Parser};
use log::*;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;

use bsrv::{BaseDir, Cache, Config, IpcSurface, Job, Scheduler, StatService};
use bsrv_cli::{DefaultCommandLineArgs, RunArgs, SubCommands};

const EXIT_CONFIG_PARSE: u8 = 42;
const EXIT_DIR_PERMISSION: u8 = 33;
const EXIT_STAT_NO_SCHEDULE: u8 = 1;
const EXIT_STAT_BAD_SCHEDULE: u8 = 2;

fn init_logger(default_filter: &str) {
  env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));
}

/// Loads the config and prepares the working directories; shared between the
/// daemon and the stat service.
async fn startup(config_path: &Path) -> Result<(Config, BaseDir), ExitCode> {
  let config = match Config::load(config_path).await {
    Ok(config) => config,
    Err(err) => {
      // The logger is configured from the config file; this failure can only
      // go to stderr directly.
      eprintln!("{err}");
      return Err(ExitCode::from(EXIT_CONFIG_PARSE));
    }
  };

  init_logger(&config.log.level);

  let dirs = BaseDir::new(&config.borg.base_dir, &config.borg.mount_dir);
  if let Err(err) = dirs.ensure_directory_structure().await {
    error!("{err}");
    return Err(ExitCode::from(EXIT_DIR_PERMISSION));
  }

  return Ok((config, dirs));
}

async fn run_daemon(config_path: &Path, args: RunArgs) -> ExitCode {
  let (config, dirs) = match startup(config_path).await {
    Ok(startup) => startup,
    Err(code) => return code,
  };

  let cache = Arc::new(Cache::open(dirs.cache_path("bsrvd.cache")).await);
  let scheduler = Arc::new(Scheduler::new(cache.clone()));

  for (name, job_cfg) in &config.jobs {
    match Job::from_config(name, job_cfg, &config, &dirs, &cache) {
      Ok(job) if job.runnable() => {
        scheduler.register(Arc::new(job)).await;
      }
      Ok(_) => {
        info!("Job '{name}' has no create/prune arguments, left to the stat service");
      }
      Err(err) => {
        error!("Error in config file: {err} for job '{name}'");
      }
    }
  }
  scheduler.start();

  let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
  let surface = IpcSurface::new(scheduler.clone(), shutdown_tx);
  let router = bsrv::api::router(surface);

  let listener = match tokio::net::TcpListener::bind(&args.address).await {
    Ok(listener) => listener,
    Err(err) => {
      error!("Could not bind IPC listener to '{}': {err}", args.address);
      scheduler.stop().await;
      return ExitCode::FAILURE;
    }
  };
  info!("IPC listening on {}", args.address);

  let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
    tokio::select! {
      _ = shutdown_signal() => {}
      _ = shutdown_rx.recv() => {}
    }
  });
  if let Err(err) = serve.await {
    error!("IPC server error: {err}");
  }

  scheduler.stop().await;
  info!("Clean exit");
  return ExitCode::SUCCESS;
}

async fn run_statd(config_path: &Path) -> ExitCode {
  let (config, dirs) = match startup(config_path).await {
    Ok(startup) => startup,
    Err(code) => return code,
  };

  let cache = Arc::new(Cache::open(dirs.cache_path("bsrvstatd.cache")).await);

  let mut stat_jobs = Vec::new();
  for (name, job_cfg) in &config.jobs {
    match Job::from_config(name, job_cfg, &config, &dirs, &cache) {
      Ok(job) if job.stat_maxage().is_some() => {
        debug!("Registered job '{name}'");
        stat_jobs.push(Arc::new(job));
      }
      Ok(_) => {}
      Err(err) => {
        error!("Error in config file: {err} for job '{name}'");
      }
    }
  }
  if stat_jobs.is_empty() {
    warn!("No jobs registered!");
  }

  let Some(ref schedule_text) = config.stat.schedule else {
    error!("No schedule defined in config file [stat] section");
    return ExitCode::from(EXIT_STAT_NO_SCHEDULE);
  };
  let schedule = match schedule_text.parse() {
    Ok(schedule) => schedule,
    Err(err) => {
      error!("Error in stat schedule definition: {err}");
      return ExitCode::from(EXIT_STAT_BAD_SCHEDULE);
    }
  };

  let service = StatService::new(stat_jobs, schedule, cache, &config.stat);

  let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
  tokio::spawn(async move {
    shutdown_signal().await;
    let _ = shutdown_tx.send(());
  });

  service.run(&mut shutdown_rx).await;
  info!("Clean exit");
  return ExitCode::SUCCESS;
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("failed to install Ctrl+C handler");
  };

  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("failed to install signal handler")
      .recv()
      .await;
  };

  tokio::select! {
    _ = ctrl_c => { info!("Received Ctrl+C") }
    _ = terminate => { info!("Received SIGTERM") }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  let args = DefaultCommandLineArgs::parse();

  return match args.cmd {
    Some(SubCommands::Run(run_args)) => run_daemon(&args.config, run_args).await,
    Some(SubCommands::Statd) => run_statd(&args.config).await,
    None => {
      let _ = DefaultCommandLineArgs::command().print_help();
      ExitCode::SUCCESS
    }
  };
}
