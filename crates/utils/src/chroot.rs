//! Run commands inside a freshly deployed root tree using bubblewrap.
use std::ffi::OsStr;
use std::process::Command;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::CommandRunExt;

/// Builder for running commands with a deployed tree as `/`.
///
/// API filesystems (`/proc`, `/dev`, `/sys`) are always provided.
#[derive(Debug, Clone)]
pub struct ChrootCmd {
    root: Utf8PathBuf,
    /// Bind mounts in format (source on the host, target inside the tree)
    binds: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    env: Vec<(String, String)>,
}

impl ChrootCmd {
    /// Create a new builder rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            binds: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Bind mount the host path `source` at `target` inside the tree.
    pub fn bind(mut self, source: impl AsRef<Utf8Path>, target: impl AsRef<Utf8Path>) -> Self {
        self.binds
            .push((source.as_ref().to_owned(), target.as_ref().to_owned()));
        self
    }

    /// Set an environment variable for the command.
    pub fn setenv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The root of the tree.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Build the `bwrap` invocation for `args` without running it.
    pub fn command<S: AsRef<OsStr>>(&self, args: impl IntoIterator<Item = S>) -> Command {
        let mut cmd = Command::new("bwrap");
        cmd.args(["--bind", self.root.as_str(), "/"]);

        // See https://systemd.io/API_FILE_SYSTEMS/
        cmd.args(["--proc", "/proc"]);
        cmd.args(["--dev", "/dev"]);
        cmd.args(["--bind", "/sys", "/sys"]);

        for (source, target) in &self.binds {
            cmd.args(["--bind", source.as_str(), target.as_str()]);
        }
        for (key, value) in &self.env {
            cmd.args(["--setenv", key, value]);
        }

        cmd.arg("--");
        cmd.args(args);
        cmd
    }

    /// Run the specified command inside the tree.
    pub fn run<S: AsRef<OsStr>>(&self, args: impl IntoIterator<Item = S>) -> Result<()> {
        self.command(args)
            .log_debug()
            .run_inherited_with_cmd_context()
    }
}
