// Copyright (c) Facebook, Inc. and its affiliates.
use log::{debug, info, warn};
use std::collections::HashSet;
use thiserror::Error;

use super::locator::{find_container, RunningContainer};
use super::placement::PlacementRequest;
use super::topology::{AllocState, SocketState, Topology};
use swarm_pin_intf::{Assignment, PackMode};

/// Upper bound of threads a single row may ask for, repeats included.
pub const MAX_NR_CPUS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("socket {socket} not available on node {node} ({nr_sockets} sockets)")]
    InvalidTopologyRequest {
        node: usize,
        socket: usize,
        nr_sockets: usize,
    },
    #[error("socket {socket} on node {node} has no hardware threads")]
    EmptySocket { node: usize, socket: usize },
    #[error("{nr_cpus} cpus requested on socket {socket} of node {node}, at most {max} allowed")]
    InvalidCpuCount {
        node: usize,
        socket: usize,
        nr_cpus: usize,
        max: usize,
    },
    #[error("no running container for {service:?} on node {node}")]
    NoMatchingContainer { service: String, node: usize },
    #[error("can't determine the node {service:?} runs on ({reason})")]
    UnplacedService { service: String, reason: String },
    #[error("node {node} unavailable ({reason})")]
    NodeUnavailable { node: usize, reason: String },
    #[error("failed to pin {container} on node {node} ({reason})")]
    PinApplyFailure {
        node: usize,
        container: String,
        reason: String,
    },
}

/// Outcome of a placement row which didn't fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Skipped,
    NoContainer,
    Pinned(Assignment),
}

/// Takes one thread from every core nobody has touched yet, ascending core.
fn take_spread(cores: &[Vec<usize>], ss: &mut SocketState, want: usize, out: &mut Vec<usize>) {
    for (core, sibs) in cores.iter().enumerate() {
        if out.len() >= want {
            break;
        }
        if ss.core_occupied[core] {
            continue;
        }
        if let Some(&first) = sibs.first() {
            out.push(first);
            ss.core_occupied[core] = true;
            ss.next_sibling[core] = 1;
        }
    }
}

/// Hands out unused siblings, one per core per pass, until satisfied or
/// every thread has been claimed.
fn take_siblings(cores: &[Vec<usize>], ss: &mut SocketState, want: usize, out: &mut Vec<usize>) {
    loop {
        let mut progress = false;
        for (core, sibs) in cores.iter().enumerate() {
            if out.len() >= want {
                return;
            }
            let next = ss.next_sibling[core];
            if next < sibs.len() {
                out.push(sibs[next]);
                ss.next_sibling[core] += 1;
                progress = true;
            }
        }
        if !progress {
            return;
        }
    }
}

fn take_cyclic(threads: &[usize], ss: &mut SocketState, want: usize, out: &mut Vec<usize>) {
    while out.len() < want {
        out.push(threads[ss.cursor]);
        ss.cursor = (ss.cursor + 1) % threads.len();
    }
}

/// Picks `count` hardware threads on `socket` and commits the bookkeeping to
/// `state`. `None` or zero pins to the whole socket without touching the
/// bookkeeping. State is only written back once the selection succeeded.
pub fn select_threads(
    topo: &Topology,
    state: &mut AllocState,
    socket: usize,
    count: Option<usize>,
    mode: PackMode,
) -> Result<Vec<usize>, PinError> {
    let node = topo.node;
    if socket >= topo.nr_sockets() {
        return Err(PinError::InvalidTopologyRequest {
            node,
            socket,
            nr_sockets: topo.nr_sockets(),
        });
    }

    let all = topo.socket_threads(socket);
    if all.is_empty() {
        return Err(PinError::EmptySocket { node, socket });
    }

    let want = match count {
        None | Some(0) => return Ok(all),
        Some(v) if v > MAX_NR_CPUS => {
            return Err(PinError::InvalidCpuCount {
                node,
                socket,
                nr_cpus: v,
                max: MAX_NR_CPUS,
            })
        }
        Some(v) => v,
    };

    let mut ss = state.sockets[socket].clone();
    let mut picked = vec![];

    match mode {
        PackMode::Spread => {
            let cores = topo.cores(socket);
            take_spread(cores, &mut ss, want, &mut picked);
            if picked.len() < want {
                info!(
                    "alloc: not enough cpus on socket {} of node {} without physical core colocation",
                    socket, node
                );
                take_siblings(cores, &mut ss, want, &mut picked);
            }
            if picked.len() < want {
                info!(
                    "alloc: not enough cpus on socket {} of node {} without SMT colocation",
                    socket, node
                );
                take_cyclic(&all, &mut ss, want, &mut picked);
            }
        }
        PackMode::Sorted => {
            let mut sorted = all;
            sorted.sort_unstable();
            take_cyclic(&sorted, &mut ss, want, &mut picked);
        }
    }

    state.sockets[socket] = ss;
    Ok(picked)
}

/// Allocation context of one node for one pass over the placement rows.
pub struct NodeAllocator {
    pub topo: Topology,
    pub state: AllocState,
    pub containers: Vec<RunningContainer>,
    pub mode: PackMode,
    pub require_containers: bool,
    /// Containers already pinned in this pass.
    pub taken: HashSet<String>,
}

impl NodeAllocator {
    pub fn new(
        topo: Topology,
        state: AllocState,
        containers: Vec<RunningContainer>,
        mode: PackMode,
    ) -> Self {
        Self {
            topo,
            state,
            containers,
            mode,
            require_containers: false,
            taken: HashSet::new(),
        }
    }

    pub fn node(&self) -> usize {
        self.topo.node
    }

    /// Places one row. `prefix` is the container name prefix of the
    /// service. Rows must be fed in table order as each one observes the
    /// occupancy left by the previous ones. Each container is pinned at most
    /// once per pass, so repeating a row reaches the service's next
    /// container on the node.
    pub fn allocate(&mut self, req: &PlacementRequest, prefix: &str) -> Result<Placement, PinError> {
        let node = self.node();

        let socket = match req.socket {
            Some(v) => v,
            None => {
                info!("alloc: skipping pinning for {}", &req.service);
                return Ok(Placement::Skipped);
            }
        };

        if socket >= self.topo.nr_sockets() {
            return Err(PinError::InvalidTopologyRequest {
                node,
                socket,
                nr_sockets: self.topo.nr_sockets(),
            });
        }

        let container = match find_container(&self.containers, prefix, &self.taken) {
            Some(v) => v.clone(),
            None => {
                if self.require_containers {
                    return Err(PinError::NoMatchingContainer {
                        service: req.service.clone(),
                        node,
                    });
                }
                warn!(
                    "alloc: no running container matching {:?} on node {}, not pinning",
                    prefix, node
                );
                return Ok(Placement::NoContainer);
            }
        };

        let threads = select_threads(&self.topo, &mut self.state, socket, req.nr_cpus, self.mode)?;
        self.taken.insert(container.id.clone());
        debug!(
            "alloc: row {} {} -> {:?} on socket {} of node {}",
            req.row, &req.service, &threads, socket, node
        );

        Ok(Placement::Pinned(Assignment {
            row: req.row,
            service: req.service.clone(),
            node,
            socket,
            container_id: container.id,
            threads,
        }))
    }
}
