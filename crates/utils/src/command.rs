//! Helpers intended for [`std::process::Command`].

use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

/// How many bytes of stderr we keep when a child process fails.
const STDERR_TAIL: usize = 4096;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process with stdout discarded and stderr captured.
    /// On failure the error contains the tail of stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process with inherited stdio. On failure the
    /// error contains the command line.
    fn run_inherited_with_cmd_context(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process and parse its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;

    /// The command line in a form suitable for copy and paste into a shell.
    fn to_string_pretty(&self) -> String;
}

fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

fn check_output(cmd: &Command, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = stderr_tail(&output.stderr);
    if stderr.is_empty() {
        anyhow::bail!("{}: {}", cmd.to_string_pretty(), output.status)
    }
    anyhow::bail!("{}: {}: {stderr}", cmd.to_string_pretty(), output.status)
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        check_output(self, &output)
    }

    fn run_inherited_with_cmd_context(&mut self) -> Result<()> {
        let status = self
            .status()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        if !status.success() {
            anyhow::bail!("{}: {status}", self.to_string_pretty());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        check_output(self, &output)?;
        String::from_utf8(output.stdout)
            .with_context(|| format!("Decoding output of {}", self.to_string_pretty()))
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf)
            .with_context(|| format!("Parsing JSON from {}", self.to_string_pretty()))
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| {
                let a = a.to_string_lossy();
                shlex::try_quote(&a)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| a.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
