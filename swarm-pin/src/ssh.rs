// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, trace};
use std::process::Command;

/// Runs shell commands on cluster nodes over ssh.
#[derive(Debug, Clone)]
pub struct Ssh {
    pub key: Option<String>,
    pub timeout: u64,
}

impl Ssh {
    pub fn new(key: Option<String>, timeout: u64) -> Self {
        Self { key, timeout }
    }

    pub fn args(&self, host: &str, cmd: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.timeout),
        ];
        if let Some(key) = self.key.as_ref() {
            args.push("-i".into());
            args.push(key.clone());
        }
        args.push(host.into());
        args.push(cmd.into());
        args
    }

    /// Runs `cmd` on `host` and returns its trimmed stdout.
    pub fn run(&self, host: &str, cmd: &str) -> Result<String> {
        let mut command = Command::new("ssh");
        command.args(&self.args(host, cmd));
        debug!("ssh: {}: {}", host, cmd);

        let out = match command.output() {
            Ok(v) => v,
            Err(e) => bail!("{:?} ({:?}): failed to run ssh", &command, &e),
        };
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() {
            bail!("{}: {:?} ({}): {}", host, cmd, &out.status, stderr.trim());
        }
        if !stderr.trim().is_empty() {
            trace!("ssh: {}: stderr: {}", host, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}
