// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::debug;
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::Path;

use super::alloc::MAX_NR_CPUS;

/// One row of the placement table. Rows are kept in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub row: usize,
    pub service: String,
    /// `None` for Socket -1, the service is left unpinned.
    pub socket: Option<usize>,
    /// `None` or zero pins to the whole socket.
    pub nr_cpus: Option<usize>,
    /// Optional Node column, overrides the swarm's placement.
    pub node: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "ServiceName")]
    service: String,
    #[serde(rename = "Socket")]
    socket: i64,
    #[serde(rename = "NCPUs", default)]
    nr_cpus: Option<usize>,
    #[serde(rename = "Node", default)]
    node: Option<usize>,
}

pub fn parse_requests<R: Read>(rdr: R, delimiter: u8) -> Result<Vec<PlacementRequest>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_reader(rdr);

    let mut reqs = vec![];
    for (row, rec) in reader.deserialize::<RawRow>().enumerate() {
        let raw = rec.with_context(|| format!("placement row {}", row))?;
        let socket = match raw.socket {
            -1 => None,
            v if v >= 0 => Some(v as usize),
            v => bail!("placement row {} ({}): invalid socket {}", row, &raw.service, v),
        };
        if let Some(n) = raw.nr_cpus {
            if n > MAX_NR_CPUS {
                bail!(
                    "placement row {} ({}): NCPUs {} is above the limit of {}",
                    row,
                    &raw.service,
                    n,
                    MAX_NR_CPUS
                );
            }
        }
        reqs.push(PlacementRequest {
            row,
            service: raw.service,
            socket,
            nr_cpus: raw.nr_cpus,
            node: raw.node,
        });
    }
    Ok(reqs)
}

pub fn load_requests<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Vec<PlacementRequest>> {
    let path = path.as_ref();
    let f = fs::File::open(path).with_context(|| format!("opening {:?}", path))?;
    let reqs = parse_requests(f, delimiter).with_context(|| format!("loading {:?}", path))?;
    debug!("placement: loaded {} rows from {:?}", reqs.len(), path);
    Ok(reqs)
}
