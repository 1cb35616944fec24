// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, trace};
use std::collections::HashSet;

/// One logical CPU as reported by the topology probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwThread {
    pub node: usize,
    pub socket: usize,
    pub core: usize,
    pub thread: usize,
}

fn split_fields(line: &str) -> Vec<&str> {
    line.trim().trim_matches(',').split(',').map(str::trim).collect()
}

fn parse_field(fields: &[&str], idx: usize, name: &str, row: usize) -> Result<usize> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| anyhow!("topo: row {} is missing the {:?} field", row, name))?;
    raw.parse::<usize>()
        .with_context(|| format!("topo: row {} has invalid {:?} value {:?}", row, name, raw))
}

/// Parses the first TABLE section of `likwid-topology -O` output. The
/// section is a header line followed by comma separated rows and ends at the
/// next STRUCT or TABLE line. Columns are looked up by header name and only
/// HWThread, Core and Socket are used.
pub fn parse_topology_table(node: usize, output: &str) -> Result<Vec<HwThread>> {
    let mut lines = output.lines().map(str::trim);

    if !lines.by_ref().any(|line| line.starts_with("TABLE")) {
        bail!("topo: node {} probe output has no TABLE section", node);
    }

    let header = match lines.next() {
        Some(line) => split_fields(line),
        None => bail!("topo: node {} probe output ends before the table header", node),
    };
    let col = |name: &str| -> Result<usize> {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or_else(|| anyhow!("topo: node {} topology table has no {:?} column", node, name))
    };
    let (hw_col, core_col, socket_col) = (col("HWThread")?, col("Core")?, col("Socket")?);

    let mut rows = vec![];
    for (row, line) in lines.enumerate() {
        if line.is_empty() || line.starts_with("STRUCT") || line.starts_with("TABLE") {
            break;
        }
        let fields = split_fields(line);
        rows.push(HwThread {
            node,
            socket: parse_field(&fields, socket_col, "Socket", row)?,
            core: parse_field(&fields, core_col, "Core", row)?,
            thread: parse_field(&fields, hw_col, "HWThread", row)?,
        });
    }

    trace!("topo: node {} parsed {} hardware threads", node, rows.len());
    Ok(rows)
}

/// Socket -> core -> SMT sibling index of one node. Socket and core ids are
/// used directly as indices, so gaps in the observed ids leave empty slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub node: usize,
    threads_of: Vec<Vec<Vec<usize>>>,
}

/// Occupancy bookkeeping of one socket for a single allocation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketState {
    pub core_occupied: Vec<bool>,
    pub next_sibling: Vec<usize>,
    pub cursor: usize,
}

impl SocketState {
    fn new(nr_cores: usize) -> Self {
        Self {
            core_occupied: vec![false; nr_cores],
            next_sibling: vec![0; nr_cores],
            cursor: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocState {
    pub sockets: Vec<SocketState>,
}

impl Topology {
    /// Builds the index and a fresh allocation state from probe rows. Row
    /// order only affects the order of siblings within a core.
    pub fn build(node: usize, rows: &[HwThread]) -> Result<(Self, AllocState)> {
        let nr_sockets = rows.iter().map(|r| r.socket + 1).max().unwrap_or(0);
        let nr_cores = rows.iter().map(|r| r.core + 1).max().unwrap_or(0);

        let mut threads_of = vec![vec![vec![]; nr_cores]; nr_sockets];
        let mut seen = HashSet::new();
        for r in rows.iter() {
            if r.node != node {
                bail!(
                    "topo: thread {} belongs to node {}, not {}",
                    r.thread,
                    r.node,
                    node
                );
            }
            if !seen.insert(r.thread) {
                bail!("topo: duplicate hardware thread {} on node {}", r.thread, node);
            }
            threads_of[r.socket][r.core].push(r.thread);
        }

        debug!(
            "topo: node {} has {} sockets, {} core slots per socket, {} threads",
            node,
            nr_sockets,
            nr_cores,
            rows.len()
        );

        let state = AllocState {
            sockets: (0..nr_sockets).map(|_| SocketState::new(nr_cores)).collect(),
        };
        Ok((Self { node, threads_of }, state))
    }

    pub fn nr_sockets(&self) -> usize {
        self.threads_of.len()
    }

    pub fn nr_cores(&self) -> usize {
        self.threads_of.first().map(|s| s.len()).unwrap_or(0)
    }

    /// Sibling lists of every core slot on `socket`, ascending core id.
    pub fn cores(&self, socket: usize) -> &[Vec<usize>] {
        &self.threads_of[socket]
    }

    pub fn siblings(&self, socket: usize, core: usize) -> &[usize] {
        &self.threads_of[socket][core]
    }

    /// All threads of `socket`, ascending core then sibling order.
    pub fn socket_threads(&self, socket: usize) -> Vec<usize> {
        self.threads_of[socket].iter().flatten().copied().collect()
    }

    pub fn nr_threads(&self, socket: usize) -> usize {
        self.threads_of[socket].iter().map(|c| c.len()).sum()
    }
}
