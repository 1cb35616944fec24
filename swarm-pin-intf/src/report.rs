// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PackMode;
use pin_util::*;

const REPORT_DOC: &str = "\
//
// swarm-pin run report
//
//  started_at/ended_at: Run period
//  mode: Spread (tiered) or Sorted packing
//  strict: Whether the run stops at the first failure
//  aborted: Stopped at a failure in strict mode or interrupted
//  skipped[]: Services with Socket -1
//  unplaced[]: Rows whose service could not be mapped to a node
//  nodes.NODE.host: ssh host of the node
//  nodes.NODE.assignments[]: Applied pins in row order
//  nodes.NODE.unmatched[]: Services without a running container
//  nodes.NODE.errors[]: Failed rows
//
";

/// Result of pinning one placement row: the container and the hardware
/// threads it was bound to, in policy order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub row: usize,
    pub service: String,
    pub node: usize,
    pub socket: usize,
    pub container_id: String,
    pub threads: Vec<usize>,
}

impl Assignment {
    pub fn cpu_list(&self) -> String {
        format_cpu_list(&self.threads)
    }
}

impl std::fmt::Display for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] socket {} node {} ({})",
            &self.service,
            self.cpu_list(),
            self.socket,
            self.node,
            &self.container_id
        )
    }
}

pub fn format_cpu_list(threads: &[usize]) -> String {
    threads
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub service: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeReport {
    pub host: String,
    pub assignments: Vec<Assignment>,
    pub unmatched: Vec<String>,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinReport {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub mode: PackMode,
    pub strict: bool,
    pub aborted: bool,
    pub skipped: Vec<String>,
    pub unplaced: Vec<RowError>,
    pub nodes: BTreeMap<usize, NodeReport>,
}

impl Default for PinReport {
    fn default() -> Self {
        Self {
            started_at: DateTime::from(std::time::UNIX_EPOCH),
            ended_at: DateTime::from(std::time::UNIX_EPOCH),
            mode: Default::default(),
            strict: true,
            aborted: false,
            skipped: vec![],
            unplaced: vec![],
            nodes: Default::default(),
        }
    }
}

impl PinReport {
    pub fn nr_pinned(&self) -> usize {
        self.nodes.values().map(|n| n.assignments.len()).sum()
    }

    pub fn nr_errors(&self) -> usize {
        self.unplaced.len() + self.nodes.values().map(|n| n.errors.len()).sum::<usize>()
    }

    pub fn nr_unmatched(&self) -> usize {
        self.nodes.values().map(|n| n.unmatched.len()).sum()
    }

    /// All row errors ordered by row.
    pub fn errors(&self) -> Vec<&RowError> {
        let mut errs: Vec<&RowError> = self
            .unplaced
            .iter()
            .chain(self.nodes.values().flat_map(|n| n.errors.iter()))
            .collect();
        errs.sort_by_key(|e| e.row);
        errs
    }
}

impl JsonLoad for PinReport {}
impl JsonSave for PinReport {
    fn preamble() -> Option<String> {
        Some(REPORT_DOC.to_string())
    }
}
