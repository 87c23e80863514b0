use log::*;
use std::collections::HashMap;
use std::os::unix::process::CommandExt as _;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::proc;

pub const HOOK_NAME_ENV: &str = "BSRV_HOOK_NAME";

/// Resolved uid/gid pair hook subprocesses are dropped to.
#[derive(Debug, Clone, Copy)]
struct Demotion {
  uid: u32,
  gid: u32,
}

impl Demotion {
  /// Resolves `username` and verifies the demotion actually takes effect by
  /// running a probe as that user. Any failure logs a warning and disables
  /// demotion, so the hook still runs as the daemon's own user.
  fn resolve(username: &str, parent: &str) -> Option<Demotion> {
    let Some(uid) = probe_id(&["-u", username]) else {
      warn!("Hooks for '{parent}': unknown user '{username}', not demoting");
      return None;
    };
    let Some(gid) = probe_id(&["-g", username]) else {
      warn!("Hooks for '{parent}': unknown group for user '{username}', not demoting");
      return None;
    };

    let confirmed = std::process::Command::new("id")
      .arg("-un")
      .uid(uid)
      .gid(gid)
      .output()
      .ok()
      .filter(|out| out.status.success())
      .map(|out| String::from_utf8_lossy(&out.stdout).trim() == username)
      .unwrap_or(false);

    if !confirmed {
      warn!(
        "Hooks for '{parent}': setuid to '{username}' (uid={uid}, gid={gid}) not possible, \
         subprocesses will run with the daemon's own uid/gid"
      );
      return None;
    }

    return Some(Demotion { uid, gid });
  }
}

fn probe_id(args: &[&str]) -> Option<u32> {
  let output = std::process::Command::new("id").args(args).output().ok()?;
  if !output.status.success() {
    return None;
  }
  return String::from_utf8_lossy(&output.stdout).trim().parse().ok();
}

/// One operator-supplied lifecycle command for one parent (a job or the stat
/// service). Fired in the background or awaited, with a timeout and an
/// environment overlay describing the triggering event.
#[derive(Debug, Clone)]
pub struct Hook {
  name: String,
  parent: String,
  argv: Vec<String>,
  timeout: Duration,
  demote: Option<Demotion>,
}

impl Hook {
  pub fn new(
    name: &str,
    parent: &str,
    command: &str,
    timeout_s: u64,
    run_as: Option<&str>,
  ) -> Hook {
    let argv = match shlex::split(command) {
      Some(argv) => argv,
      None => {
        warn!("Unparseable command for hook '{name}' of '{parent}', disabling it");
        vec![]
      }
    };

    let demote = match (argv.is_empty(), run_as) {
      (false, Some(username)) => Demotion::resolve(username, parent),
      _ => None,
    };

    return Hook {
      name: name.to_string(),
      parent: parent.to_string(),
      argv,
      timeout: Duration::from_secs(timeout_s),
      demote,
    };
  }

  /// Fire-and-forget: spawns a background task running the command. A hook
  /// with an empty command is a no-op.
  pub fn trigger(&self, env: HashMap<String, String>) {
    if self.argv.is_empty() {
      return;
    }
    let hook = self.clone();
    tokio::spawn(async move {
      hook.execute(env).await;
    });
  }

  /// Like [`Hook::trigger`] but blocks the caller until the command finished
  /// or timed out.
  pub async fn trigger_wait(&self, env: HashMap<String, String>) {
    if self.argv.is_empty() {
      return;
    }
    self.execute(env).await;
  }

  async fn execute(&self, env: HashMap<String, String>) {
    info!("Triggered hook '{}' for '{}'", self.name, self.parent);

    let mut command = Command::new(&self.argv[0]);
    command
      .args(&self.argv[1..])
      .env(HOOK_NAME_ENV, &self.name)
      .envs(env)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(demotion) = self.demote {
      command.uid(demotion.uid).gid(demotion.gid);
    }

    let child = match command.spawn() {
      Ok(child) => child,
      Err(err) => {
        error!(
          "Could not spawn hook '{}' for '{}': {err}",
          self.name, self.parent
        );
        return;
      }
    };

    // Dropping the timed-out future kills the child via kill_on_drop.
    match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
      Err(_) => {
        error!(
          "Hook '{}' for '{}' timed out after {} s",
          self.name,
          self.parent,
          self.timeout.as_secs()
        );
      }
      Ok(Err(err)) => {
        error!(
          "Failed waiting for hook '{}' for '{}': {err}",
          self.name, self.parent
        );
      }
      Ok(Ok(output)) => {
        let success = output.status.success();
        if success {
          info!("Hook '{}' for '{}' succeeded", self.name, self.parent);
        } else {
          error!(
            "Hook '{}' for '{}' failed with {}: {}",
            self.name,
            self.parent,
            output.status,
            proc::render_command(&self.argv)
          );
        }
        proc::log_output_lines("[HOOK]", &proc::combined_output(&output), success);
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn argv(&self) -> &[String] {
    return &self.argv;
  }
}
