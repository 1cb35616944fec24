// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::locator::{
    parse_ps_output, parse_service_ls, parse_service_nodes, parse_service_ps_node,
    RunningContainer, PS_FORMAT, SERVICE_LS_FORMAT, SERVICE_PS_FORMAT,
};
use super::ssh::Ssh;
use super::topology::{parse_topology_table, HwThread};

pub const TOPOLOGY_CMD: &str = "sudo likwid-topology -O";

/// Reads an ssh command file, one node per line. The host is the last word
/// of each line so that full "ssh -p 22 user@host" lines work as is.
pub fn parse_nodes(input: &str) -> Vec<String> {
    input
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(|host| host.to_string())
        .collect()
}

pub fn load_nodes<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let nodes = parse_nodes(&buf);
    if nodes.is_empty() {
        bail!("no nodes listed in {:?}", path);
    }
    Ok(nodes)
}

/// Where topology, running containers and service placement come from.
pub trait ClusterSource: Sync {
    fn topology(&self, node: usize) -> Result<Vec<HwThread>>;
    fn containers(&self, node: usize) -> Result<Vec<RunningContainer>>;
    /// Full swarm service name -> node index.
    fn service_nodes(&self) -> Result<BTreeMap<String, usize>>;
}

/// Probes the live nodes over ssh. Node 0 is the swarm manager.
pub struct RemoteCluster {
    hosts: Vec<String>,
    ssh: Ssh,
}

impl RemoteCluster {
    pub fn new(hosts: Vec<String>, ssh: Ssh) -> Self {
        Self { hosts, ssh }
    }

    fn host(&self, node: usize) -> Result<&str> {
        match self.hosts.get(node) {
            Some(v) => Ok(v.as_str()),
            None => bail!("node {} not in the node list ({} nodes)", node, self.hosts.len()),
        }
    }
}

impl ClusterSource for RemoteCluster {
    fn topology(&self, node: usize) -> Result<Vec<HwThread>> {
        let out = self.ssh.run(self.host(node)?, TOPOLOGY_CMD)?;
        parse_topology_table(node, &out)
    }

    fn containers(&self, node: usize) -> Result<Vec<RunningContainer>> {
        let cmd = format!("sudo docker ps --format '{}'", PS_FORMAT);
        parse_ps_output(&self.ssh.run(self.host(node)?, &cmd)?)
    }

    fn service_nodes(&self) -> Result<BTreeMap<String, usize>> {
        let manager = self.host(0)?;
        let ls = self.ssh.run(
            manager,
            &format!("sudo docker service ls --format '{}'", SERVICE_LS_FORMAT),
        )?;

        let mut map = BTreeMap::new();
        for (id, name) in parse_service_ls(&ls)? {
            let ps = self.ssh.run(
                manager,
                &format!(
                    "sudo docker service ps --format '{}' --filter 'desired-state=Running' {}",
                    SERVICE_PS_FORMAT, &id
                ),
            )?;
            match parse_service_ps_node(&ps)? {
                Some(node) => {
                    debug!("probe: {} runs on node {}", &name, node);
                    map.insert(name, node);
                }
                None => warn!("probe: {} has no running task", &name),
            }
        }
        Ok(map)
    }
}

/// Saved probe outputs, laid out as
///
///   DIR/service-nodes.txt   SERVICE_NAME,HOSTNAME lines
///   DIR/nodeN/topology.txt  likwid-topology -O output
///   DIR/nodeN/ps.txt        docker ps --format PS_FORMAT output
pub struct SnapshotCluster {
    dir: PathBuf,
}

impl SnapshotCluster {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn read(&self, rel: PathBuf) -> Result<String> {
        let path = self.dir.join(rel);
        fs::read_to_string(&path).with_context(|| format!("reading {:?}", &path))
    }

    fn node_file(node: usize, name: &str) -> PathBuf {
        Path::new(&format!("node{}", node)).join(name)
    }
}

impl ClusterSource for SnapshotCluster {
    fn topology(&self, node: usize) -> Result<Vec<HwThread>> {
        parse_topology_table(node, &self.read(Self::node_file(node, "topology.txt"))?)
    }

    fn containers(&self, node: usize) -> Result<Vec<RunningContainer>> {
        parse_ps_output(&self.read(Self::node_file(node, "ps.txt"))?)
    }

    fn service_nodes(&self) -> Result<BTreeMap<String, usize>> {
        parse_service_nodes(&self.read(PathBuf::from("service-nodes.txt"))?)
    }
}
