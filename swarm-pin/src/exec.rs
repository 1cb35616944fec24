// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::info;

use super::ssh::Ssh;
use swarm_pin_intf::Assignment;

pub fn docker_update_cmd(asgn: &Assignment) -> String {
    format!(
        "sudo docker update --cpuset-cpus={} {}",
        asgn.cpu_list(),
        &asgn.container_id
    )
}

/// Applies an assignment as the container's cpuset on its node.
pub trait PinExecutor: Sync {
    fn apply(&self, host: &str, asgn: &Assignment) -> Result<()>;
}

pub struct SshPinExecutor {
    ssh: Ssh,
}

impl SshPinExecutor {
    pub fn new(ssh: Ssh) -> Self {
        Self { ssh }
    }
}

impl PinExecutor for SshPinExecutor {
    fn apply(&self, host: &str, asgn: &Assignment) -> Result<()> {
        self.ssh.run(host, &docker_update_cmd(asgn))?;
        Ok(())
    }
}

pub struct DryRunExecutor;

impl PinExecutor for DryRunExecutor {
    fn apply(&self, host: &str, asgn: &Assignment) -> Result<()> {
        info!("pin: dry-run: {}: {}", host, &docker_update_cmd(asgn));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::docker_update_cmd;
    use swarm_pin_intf::Assignment;

    #[test]
    fn test_docker_update_cmd() {
        let asgn = Assignment {
            row: 0,
            service: "home-timeline-service".into(),
            node: 2,
            socket: 1,
            container_id: "0e1f2a3b".into(),
            threads: vec![14, 42, 15],
        };
        assert_eq!(
            docker_update_cmd(&asgn),
            "sudo docker update --cpuset-cpus=14,42,15 0e1f2a3b"
        );
    }
}
