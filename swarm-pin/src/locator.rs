// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use scan_fmt::scan_fmt;
use std::collections::{BTreeMap, HashSet};

pub const PS_FORMAT: &str = "{{.ID}},{{.Names}}";
pub const SERVICE_LS_FORMAT: &str = "{{.ID}},{{.Name}}";
pub const SERVICE_PS_FORMAT: &str = "{{.ID}},{{.Node}},{{.CurrentState}}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
}

fn two_fields<'a>(line: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    let mut fields = line.split(',').map(str::trim);
    match (fields.next(), fields.next()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Ok((a, b)),
        _ => bail!("malformed {} line {:?}", what, line),
    }
}

/// Parses `docker ps --format PS_FORMAT` output.
pub fn parse_ps_output(output: &str) -> Result<Vec<RunningContainer>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (id, name) = two_fields(line, "docker ps")?;
            Ok(RunningContainer {
                id: id.into(),
                name: name.into(),
            })
        })
        .collect()
}

/// First container whose name starts with `prefix` and whose id isn't in
/// `taken`.
pub fn find_container<'a>(
    containers: &'a [RunningContainer],
    prefix: &str,
    taken: &HashSet<String>,
) -> Option<&'a RunningContainer> {
    containers
        .iter()
        .find(|c| c.name.starts_with(prefix) && !taken.contains(&c.id))
}

/// Parses `docker service ls --format SERVICE_LS_FORMAT` into (id, name).
pub fn parse_service_ls(output: &str) -> Result<Vec<(String, String)>> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (id, name) = two_fields(line, "docker service ls")?;
            Ok((id.to_string(), name.to_string()))
        })
        .collect()
}

/// Swarm nodes are named nodeN, optionally followed by a domain.
pub fn node_from_hostname(host: &str) -> Result<usize> {
    let short = host.trim().split('.').next().unwrap_or("");
    scan_fmt!(short, "node{d}", usize)
        .map_err(|_| anyhow!("can't derive node index from hostname {:?}", host))
}

/// Node index of the first running task in `docker service ps --format
/// SERVICE_PS_FORMAT` output.
pub fn parse_service_ps_node(output: &str) -> Result<Option<usize>> {
    match output.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => {
            let (_, host) = two_fields(line, "docker service ps")?;
            Ok(Some(node_from_hostname(host)?))
        }
        None => Ok(None),
    }
}

/// Parses "SERVICE_NAME,HOSTNAME" lines into a service -> node map.
pub fn parse_service_nodes(output: &str) -> Result<BTreeMap<String, usize>> {
    let mut map = BTreeMap::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (name, host) = two_fields(line, "service node")?;
        map.insert(name.to_string(), node_from_hostname(host)?);
    }
    Ok(map)
}
