// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use log::{debug, error, info};
use std::process::exit;

use pin_util::*;
use swarm_pin_intf::{Args, PinReport, FULL_VERSION};

mod alloc;
mod cluster;
mod exec;
mod locator;
mod placement;
mod run;
mod ssh;
mod topology;

use cluster::{ClusterSource, RemoteCluster, SnapshotCluster};
use exec::{DryRunExecutor, PinExecutor, SshPinExecutor};
use ssh::Ssh;

const CSV_DIRS: &[&str] = &["env_csvs"];

/// Returns whether every row went through without errors.
fn pin_cluster(args: &Args) -> Result<bool> {
    let nodes_path = args
        .nodes
        .as_ref()
        .ok_or_else(|| anyhow!("--nodes is required"))?;
    let hosts = cluster::load_nodes(nodes_path)?;
    info!("run: {} nodes listed in {:?}", hosts.len(), nodes_path);

    let csv_path = find_file(&args.csv_file, CSV_DIRS)?;
    let delimiter = args
        .delimiter_byte()
        .ok_or_else(|| anyhow!("invalid delimiter {:?}", &args.delimiter))?;
    let reqs = placement::load_requests(&csv_path, delimiter)?;
    info!("run: {} placement rows from {:?}", reqs.len(), &csv_path);

    let ssh = Ssh::new(args.ssh_key.clone(), args.ssh_timeout);
    let source: Box<dyn ClusterSource> = match args.snapshot.as_ref() {
        Some(dir) => {
            info!("run: probing from snapshot {:?}", dir);
            Box::new(SnapshotCluster::new(dir))
        }
        None => Box::new(RemoteCluster::new(hosts.clone(), ssh.clone())),
    };
    let exec: Box<dyn PinExecutor> = if args.dry_run {
        Box::new(DryRunExecutor)
    } else {
        Box::new(SshPinExecutor::new(ssh))
    };

    let mut report = JsonReportFile::<PinReport>::new(args.result.as_ref());
    report.data = run::run_batch(args, &hosts, &reqs, source.as_ref(), exec.as_ref())?;
    report.commit()?;
    if let Some(path) = report.path.as_ref() {
        info!("run: report written to {:?}", path);
    }
    Ok(report.data.nr_errors() == 0 && !report.data.aborted)
}

fn main() {
    setup_prog_state();

    let args_file = Args::init_args_and_logging().unwrap_or_else(|e| {
        error!("Failed to process args file ({})", &e);
        exit(1);
    });
    debug!("swarm-pin {}", &*FULL_VERSION);

    match pin_cluster(&args_file.data) {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            error!("{:#}", &e);
            exit(1);
        }
    }
}
