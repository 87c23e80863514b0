//! Shared helpers for supervised subprocess execution.

use std::borrow::Cow;
use std::process::Output;

/// Renders an argv shell-quoted for log lines.
pub(crate) fn render_command(argv: &[String]) -> String {
  return argv
    .iter()
    .map(|token| {
      return shlex::try_quote(token)
        .unwrap_or(Cow::Borrowed("<non-printable>"))
        .into_owned();
    })
    .collect::<Vec<_>>()
    .join(" ");
}

/// Captured stdout followed by stderr, lossily decoded.
pub(crate) fn combined_output(output: &Output) -> String {
  let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
  combined.push_str(&String::from_utf8_lossy(&output.stderr));
  return combined;
}

/// Logs every non-empty captured line with the given prefix, at info for
/// successful runs and error otherwise.
pub(crate) fn log_output_lines(prefix: &str, combined: &str, success: bool) {
  for line in combined.lines() {
    if line.is_empty() {
      continue;
    }
    if success {
      log::info!("{prefix} {line}");
    } else {
      log::error!("{prefix} {line}");
    }
  }
}

/// Newline-encoded single-line rendition, as passed to hooks via BSRV_ERROR.
pub(crate) fn encode_newlines(text: &str) -> String {
  return text.replace('\n', "\\n");
}
