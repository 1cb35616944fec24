// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use chrono::prelude::*;
use log::{debug, error, info};
use std::collections::BTreeMap;

use super::alloc::{NodeAllocator, PinError, Placement};
use super::cluster::ClusterSource;
use super::exec::PinExecutor;
use super::placement::PlacementRequest;
use super::topology::Topology;
use pin_util::prog_exiting;
use swarm_pin_intf::{Args, NodeReport, PinReport, RowError};

fn row_error(req: &PlacementRequest, err: &PinError) -> RowError {
    RowError {
        row: req.row,
        service: req.service.clone(),
        error: format!("{}", err),
    }
}

fn log_row_error(req: &PlacementRequest, err: &PinError) {
    error!("run: row {} ({}): {}", req.row, &req.service, err);
}

/// A node's allocator once probed, its rows in table order and its report.
struct NodeJob<'a> {
    node: usize,
    host: &'a str,
    alloc: Result<NodeAllocator, PinError>,
    rows: Vec<&'a PlacementRequest>,
    rep: NodeReport,
}

impl<'a> NodeJob<'a> {
    fn new(node: usize, host: &'a str) -> Self {
        Self {
            node,
            host,
            alloc: Err(PinError::NodeUnavailable {
                node,
                reason: "not probed".into(),
            }),
            rows: vec![],
            rep: NodeReport {
                host: host.to_string(),
                ..Default::default()
            },
        }
    }
}

struct Pinner<'a> {
    args: &'a Args,
    source: &'a dyn ClusterSource,
    exec: &'a dyn PinExecutor,
}

impl<'a> Pinner<'a> {
    fn probe(&self, node: usize) -> Result<NodeAllocator> {
        let hw_threads = self.source.topology(node)?;
        let (topo, state) = Topology::build(node, &hw_threads)?;
        let containers = self.source.containers(node)?;
        debug!(
            "probe: node {} has {} sockets of {} core slots and {} running containers",
            node,
            topo.nr_sockets(),
            topo.nr_cores(),
            containers.len()
        );

        let mut na = NodeAllocator::new(topo, state, containers, self.args.mode);
        na.require_containers = self.args.require_containers;
        Ok(na)
    }

    fn probe_node(&self, node: usize) -> Result<NodeAllocator, PinError> {
        if prog_exiting() {
            return Err(PinError::NodeUnavailable {
                node,
                reason: "interrupted".into(),
            });
        }
        self.probe(node).map_err(|e| {
            error!("probe: node {} failed ({:#})", node, &e);
            PinError::NodeUnavailable {
                node,
                reason: format!("{:#}", &e),
            }
        })
    }

    /// Probes every node on its own thread.
    fn probe_nodes(&self, jobs: &mut BTreeMap<usize, NodeJob>) -> Result<()> {
        crossbeam::scope(|s| {
            let handles: Vec<_> = jobs
                .values_mut()
                .map(|job| {
                    let node = job.node;
                    (node, s.spawn(move |_| job.alloc = self.probe_node(node)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(node, h)| h.join().map_err(|_| anyhow!("node {} probe panicked", node)))
                .collect::<Result<Vec<_>>>()
        })
        .map_err(|_| anyhow!("node probes panicked"))??;
        Ok(())
    }

    fn fail(&self, rep: &mut NodeReport, req: &PlacementRequest, err: &PinError) {
        log_row_error(req, err);
        rep.errors.push(row_error(req, err));
    }

    /// Places and applies one row on its node. Returns false if the row
    /// failed.
    fn pin_row(&self, job: &mut NodeJob, req: &PlacementRequest) -> bool {
        let na = match job.alloc.as_mut() {
            Ok(v) => v,
            Err(e) => {
                let err = e.clone();
                self.fail(&mut job.rep, req, &err);
                return false;
            }
        };

        let prefix = self.args.service_prefix(&req.service);
        match na.allocate(req, &prefix) {
            Ok(Placement::Pinned(asgn)) => {
                info!(
                    "pin: pinning {} to cpus [{}], socket {}, node {}",
                    &req.service,
                    asgn.cpu_list(),
                    asgn.socket,
                    job.node
                );
                match self.exec.apply(job.host, &asgn) {
                    Ok(()) => {
                        job.rep.assignments.push(asgn);
                        true
                    }
                    Err(e) => {
                        let err = PinError::PinApplyFailure {
                            node: job.node,
                            container: asgn.container_id.clone(),
                            reason: format!("{:#}", &e),
                        };
                        self.fail(&mut job.rep, req, &err);
                        false
                    }
                }
            }
            Ok(Placement::NoContainer) => {
                job.rep.unmatched.push(req.service.clone());
                true
            }
            Ok(Placement::Skipped) => true,
            Err(e) => {
                self.fail(&mut job.rep, req, &e);
                false
            }
        }
    }

    /// Runs the rows of one node in order. Returns whether rows were left
    /// unattempted.
    fn run_node(&self, job: &mut NodeJob) -> bool {
        let rows = job.rows.clone();
        for (idx, req) in rows.iter().enumerate() {
            if prog_exiting() {
                info!(
                    "run: node {} stopping with {} rows left",
                    job.node,
                    rows.len() - idx
                );
                return true;
            }
            self.pin_row(job, req);
        }
        false
    }

    /// Every node works through its own rows independently.
    fn run_parallel(&self, jobs: &mut BTreeMap<usize, NodeJob>) -> Result<bool> {
        let left = crossbeam::scope(|s| {
            let handles: Vec<_> = jobs
                .values_mut()
                .map(|job| (job.node, s.spawn(move |_| self.run_node(job))))
                .collect();
            handles
                .into_iter()
                .map(|(node, h)| h.join().map_err(|_| anyhow!("node {} worker panicked", node)))
                .collect::<Result<Vec<_>>>()
        })
        .map_err(|_| anyhow!("node workers panicked"))??;
        Ok(left.into_iter().any(|v| v))
    }

    /// Walks the rows in table order across all nodes and stops at the
    /// first failure. Returns whether the run stopped early.
    fn run_strict(
        &self,
        resolved: &[(&PlacementRequest, Result<usize, PinError>)],
        jobs: &mut BTreeMap<usize, NodeJob>,
        report: &mut PinReport,
    ) -> bool {
        for (idx, (req, target)) in resolved.iter().enumerate() {
            if prog_exiting() {
                info!("run: interrupted with {} rows left", resolved.len() - idx);
                return true;
            }
            let ok = match target {
                Ok(node) => jobs
                    .get_mut(node)
                    .map(|job| self.pin_row(job, req))
                    .unwrap_or(false),
                Err(e) => {
                    log_row_error(req, e);
                    report.unplaced.push(row_error(req, e));
                    false
                }
            };
            if !ok {
                info!(
                    "run: stopping at row {}, {} rows left",
                    req.row,
                    resolved.len() - idx - 1
                );
                return true;
            }
        }
        false
    }
}

/// Maps every pinned row to its node, in table order.
fn resolve_nodes<'a>(
    args: &Args,
    hosts: &[String],
    rows: &[&'a PlacementRequest],
    source: &dyn ClusterSource,
) -> Vec<(&'a PlacementRequest, Result<usize, PinError>)> {
    let mut lookup_err = None;
    let service_nodes = if rows.iter().any(|r| r.node.is_none()) {
        match source.service_nodes() {
            Ok(v) => v,
            Err(e) => {
                error!("probe: failed to read swarm service placement ({:#})", &e);
                lookup_err = Some(format!("swarm service lookup failed: {:#}", &e));
                BTreeMap::new()
            }
        }
    } else {
        BTreeMap::new()
    };

    rows.iter()
        .map(|req| {
            let node = req
                .node
                .or_else(|| service_nodes.get(&args.service_prefix(&req.service)).copied());
            let target = match node {
                Some(node) if node < hosts.len() => Ok(node),
                Some(node) => Err(PinError::NodeUnavailable {
                    node,
                    reason: format!("not in the node list ({} nodes)", hosts.len()),
                }),
                None => Err(PinError::UnplacedService {
                    service: req.service.clone(),
                    reason: lookup_err
                        .clone()
                        .unwrap_or_else(|| "no running task in the swarm".into()),
                }),
            };
            (*req, target)
        })
        .collect()
}

/// Pins every row of the placement table. Nodes are probed in parallel.
/// In strict mode the rows are then allocated and applied in table order
/// and the run stops at the first failing row. Otherwise each node works
/// through its rows on its own thread and failures are collected. Either
/// way the rows of a node are handled in table order.
pub fn run_batch(
    args: &Args,
    hosts: &[String],
    reqs: &[PlacementRequest],
    source: &dyn ClusterSource,
    exec: &dyn PinExecutor,
) -> Result<PinReport> {
    let mut report = PinReport {
        started_at: Local::now(),
        mode: args.mode,
        strict: args.strict,
        ..Default::default()
    };

    let mut pinned = vec![];
    for req in reqs.iter() {
        match req.socket {
            Some(_) => pinned.push(req),
            None => {
                info!("run: skipping pinning for {}", &req.service);
                report.skipped.push(req.service.clone());
            }
        }
    }

    let resolved = resolve_nodes(args, hosts, &pinned, source);
    let mut jobs = BTreeMap::<usize, NodeJob>::new();
    for (req, target) in resolved.iter() {
        if let Ok(node) = target {
            jobs.entry(*node)
                .or_insert_with(|| NodeJob::new(*node, &hosts[*node]))
                .rows
                .push(*req);
        }
    }

    let pinner = Pinner { args, source, exec };
    pinner.probe_nodes(&mut jobs)?;

    if args.strict {
        let aborted = pinner.run_strict(&resolved, &mut jobs, &mut report);
        report.aborted = aborted;
    } else {
        for (req, target) in resolved.iter() {
            if let Err(e) = target {
                log_row_error(req, e);
                report.unplaced.push(row_error(req, e));
            }
        }
        report.aborted = pinner.run_parallel(&mut jobs)?;
    }

    for (node, job) in jobs.into_iter() {
        report.nodes.insert(node, job.rep);
    }
    report.ended_at = Local::now();

    info!(
        "run: pinned {} services, skipped {}, {} without containers, {} errors{}",
        report.nr_pinned(),
        report.skipped.len(),
        report.nr_unmatched(),
        report.nr_errors(),
        if report.aborted { " (aborted)" } else { "" }
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::run_batch;
    use crate::cluster::tests::write_snapshot;
    use crate::cluster::{ClusterSource, SnapshotCluster};
    use crate::exec::PinExecutor;
    use crate::locator::RunningContainer;
    use crate::placement::{parse_requests, PlacementRequest};
    use crate::topology::tests::{make_rows, LIKWID_OUTPUT};
    use crate::topology::HwThread;
    use anyhow::{bail, Result};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::thread::sleep;
    use std::time::Duration;
    use swarm_pin_intf::{Args, Assignment, PackMode};

    struct FakeCluster {
        topos: Vec<Option<Vec<HwThread>>>,
        containers: Vec<Vec<RunningContainer>>,
        service_nodes: Option<BTreeMap<String, usize>>,
        slow_node: Option<(usize, Duration)>,
    }

    impl ClusterSource for FakeCluster {
        fn topology(&self, node: usize) -> Result<Vec<HwThread>> {
            if let Some((slow, delay)) = self.slow_node {
                if slow == node {
                    sleep(delay);
                }
            }
            match &self.topos[node] {
                Some(v) => Ok(v.clone()),
                None => bail!("likwid-topology not installed"),
            }
        }

        fn containers(&self, node: usize) -> Result<Vec<RunningContainer>> {
            Ok(self.containers[node].clone())
        }

        fn service_nodes(&self) -> Result<BTreeMap<String, usize>> {
            match &self.service_nodes {
                Some(v) => Ok(v.clone()),
                None => bail!("node0: ssh: connect to host node0 port 22: Connection refused"),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(String, Assignment)>>,
        fail_on: Option<String>,
    }

    impl PinExecutor for Recorder {
        fn apply(&self, host: &str, asgn: &Assignment) -> Result<()> {
            if self.fail_on.as_deref() == Some(asgn.container_id.as_str()) {
                bail!("Error response from daemon: No such container");
            }
            self.applied
                .lock()
                .unwrap()
                .push((host.to_string(), asgn.clone()));
            Ok(())
        }
    }

    fn cluster(services: &[(&str, usize)]) -> FakeCluster {
        let mut containers = vec![vec![], vec![]];
        let mut service_nodes = BTreeMap::new();
        for (i, (svc, node)) in services.iter().enumerate() {
            containers[*node].push(RunningContainer {
                id: format!("id-{}", svc),
                name: format!("sn_{}.1.task{}", svc, i),
            });
            service_nodes.insert(format!("sn_{}", svc), *node);
        }
        FakeCluster {
            // 2 sockets x 2 cores x 2 SMT per node
            topos: vec![Some(make_rows(0, 2, 2, 2)), Some(make_rows(1, 2, 2, 2))],
            containers,
            service_nodes: Some(service_nodes),
            slow_node: None,
        }
    }

    fn args(strict: bool) -> Args {
        Args {
            stack: "sn".into(),
            strict,
            ..Default::default()
        }
    }

    fn hosts() -> Vec<String> {
        vec!["node0".into(), "node1".into()]
    }

    fn reqs(table: &str) -> Vec<PlacementRequest> {
        parse_requests(table.as_bytes(), b',').unwrap()
    }

    fn threads_of(rep: &swarm_pin_intf::PinReport, node: usize) -> Vec<(String, Vec<usize>)> {
        rep.nodes[&node]
            .assignments
            .iter()
            .map(|a| (a.service.clone(), a.threads.clone()))
            .collect()
    }

    #[test]
    fn test_batch() {
        let _ = ::env_logger::try_init();
        let fc = cluster(&[("a", 0), ("b", 0), ("c", 0), ("d", 0), ("e", 1), ("f", 1)]);
        let table = "\
ServiceName,Socket,NCPUs
a,0,2
e,1,1
b,0,2
jaeger,-1,4
c,0,1
f,0,
d,0,1
";
        let rec = Recorder::default();
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &fc, &rec).unwrap();

        assert!(!rep.aborted);
        assert_eq!(rep.nr_errors(), 0);
        assert_eq!(rep.skipped, vec!["jaeger"]);
        // node socket0: core0 = [0, 4], core1 = [1, 5]
        assert_eq!(
            threads_of(&rep, 0),
            vec![
                ("a".to_string(), vec![0, 1]),
                ("b".to_string(), vec![4, 5]),
                ("c".to_string(), vec![0]),
                ("d".to_string(), vec![4]),
            ]
        );
        // node1 socket1: core0 = [2, 6]; whole socket0 for f
        assert_eq!(
            threads_of(&rep, 1),
            vec![
                ("e".to_string(), vec![2]),
                ("f".to_string(), vec![0, 4, 1, 5]),
            ]
        );
        let applied = rec.applied.lock().unwrap();
        assert_eq!(applied.len(), 6);
        assert!(applied
            .iter()
            .all(|(host, a)| host == &format!("node{}", a.node)));
    }

    #[test]
    fn test_strict_stops_node_at_first_error() {
        let fc = cluster(&[("a", 0), ("b", 0), ("c", 0)]);
        let table = "ServiceName,Socket,NCPUs\na,0,1\nb,4,1\nc,0,1\n";
        let rec = Recorder::default();
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &fc, &rec).unwrap();

        assert!(rep.aborted);
        assert_eq!(threads_of(&rep, 0), vec![("a".to_string(), vec![0])]);
        assert_eq!(rep.nodes[&0].errors.len(), 1);
        assert_eq!(rep.nodes[&0].errors[0].row, 1);
        assert!(rep.nodes[&0].errors[0].error.contains("socket 4"));
    }

    #[test]
    fn test_keep_going_isolates_failures() {
        let fc = cluster(&[("a", 0), ("b", 0), ("c", 0)]);
        let table = "ServiceName,Socket,NCPUs\na,0,1\nb,5,1\nc,0,1\n";
        let rec = Recorder::default();
        let rep = run_batch(&args(false), &hosts(), &reqs(table), &fc, &rec).unwrap();

        assert!(!rep.aborted);
        assert_eq!(rep.nr_errors(), 1);
        // The failed row leaves socket 0 alone, c gets the next free core.
        assert_eq!(
            threads_of(&rep, 0),
            vec![("a".to_string(), vec![0]), ("c".to_string(), vec![1])]
        );
    }

    #[test]
    fn test_probe_failure_and_apply_failure() {
        let mut fc = cluster(&[("a", 0), ("b", 1), ("c", 1)]);
        fc.topos[0] = None;
        let rec = Recorder {
            fail_on: Some("id-b".into()),
            ..Default::default()
        };
        let table = "ServiceName,Socket,NCPUs\na,0,1\nb,0,1\nc,0,1\n";
        let rep = run_batch(&args(false), &hosts(), &reqs(table), &fc, &rec).unwrap();

        assert!(rep.nodes[&0].errors[0].error.contains("node 0 unavailable"));
        assert!(rep.nodes[&1].errors[0].error.contains("failed to pin id-b"));
        // b's threads stay claimed even though the pin failed.
        assert_eq!(threads_of(&rep, 1), vec![("c".to_string(), vec![1])]);
    }

    #[test]
    fn test_unmatched_and_unplaced() {
        let fc = cluster(&[("a", 0)]);
        let table = "ServiceName,Socket,NCPUs,Node\na,0,1,\nnowhere,0,1,\nghost,0,1,1\nfar,0,1,7\n";

        let rep = run_batch(&args(false), &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert_eq!(rep.nodes[&1].unmatched, vec!["ghost"]);
        assert_eq!(rep.unplaced.len(), 2);
        assert_eq!(rep.unplaced[0].service, "nowhere");
        assert_eq!(rep.nr_pinned(), 1);

        let mut strict = args(false);
        strict.require_containers = true;
        let rep = run_batch(&strict, &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert_eq!(rep.nodes[&1].errors.len(), 1);

        // Strict mode pins the rows before the first unplaced one only.
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert!(rep.aborted);
        assert_eq!(rep.nr_pinned(), 1);
        assert_eq!(rep.unplaced.len(), 1);
        assert!(rep.unplaced[0].error.contains("no running task"));
        assert!(rep.nodes[&1].unmatched.is_empty());
    }

    #[test]
    fn test_strict_cutoff_follows_table_order() {
        let mut fc = cluster(&[("a", 0), ("b", 1), ("c", 1), ("d", 1)]);
        fc.slow_node = Some((0, Duration::from_millis(300)));
        let table = "ServiceName,Socket,NCPUs,Node\na,5,1,0\nb,0,1,1\nc,0,1,1\nd,0,1,1\n";

        let rec = Recorder::default();
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &fc, &rec).unwrap();
        assert!(rep.strict);
        assert!(rep.aborted);
        let rows: Vec<usize> = rep.errors().iter().map(|e| e.row).collect();
        assert_eq!(rows, vec![0]);
        assert!(rep.nodes[&1].assignments.is_empty());
        assert!(rec.applied.lock().unwrap().is_empty());

        // A failure on the last row still marks a strict run aborted.
        let table = "ServiceName,Socket,NCPUs,Node\nb,0,1,1\na,5,1,0\n";
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert!(rep.aborted);
        assert_eq!(threads_of(&rep, 1), vec![("b".to_string(), vec![0])]);

        // Without strict, node 1 doesn't care about node 0's failure.
        let table = "ServiceName,Socket,NCPUs,Node\na,5,1,0\nb,0,1,1\nc,0,1,1\nd,0,1,1\n";
        let rep = run_batch(&args(false), &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert!(!rep.aborted);
        assert_eq!(rep.nr_errors(), 1);
        assert_eq!(
            threads_of(&rep, 1),
            vec![
                ("b".to_string(), vec![0]),
                ("c".to_string(), vec![1]),
                ("d".to_string(), vec![4]),
            ]
        );
    }

    #[test]
    fn test_service_lookup_failure_reported() {
        let mut fc = cluster(&[("a", 0), ("b", 1)]);
        fc.service_nodes = None;
        let table = "ServiceName,Socket,NCPUs,Node\na,0,1,\nb,0,1,1\n";

        let rep = run_batch(&args(false), &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert_eq!(rep.unplaced.len(), 1);
        assert_eq!(rep.unplaced[0].service, "a");
        assert!(rep.unplaced[0].error.contains("Connection refused"));
        // Rows with an explicit node don't need the lookup.
        assert_eq!(threads_of(&rep, 1), vec![("b".to_string(), vec![0])]);
    }

    #[test]
    fn test_repeated_rows_reach_each_replica() {
        let mut fc = cluster(&[("user", 0)]);
        fc.containers[0].push(RunningContainer {
            id: "id-user-2".into(),
            name: "sn_user.2.task9".into(),
        });
        let table = "ServiceName,Socket,NCPUs\nuser,0,2\nuser,0,2\nuser,0,2\n";
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();

        let pinned: Vec<(&str, &[usize])> = rep.nodes[&0]
            .assignments
            .iter()
            .map(|a| (a.container_id.as_str(), a.threads.as_slice()))
            .collect();
        assert_eq!(pinned, vec![("id-user", &[0, 1][..]), ("id-user-2", &[4, 5][..])]);
        assert_eq!(rep.nodes[&0].unmatched, vec!["user"]);
        assert!(!rep.aborted);
    }

    #[test]
    fn test_sorted_mode() {
        let fc = cluster(&[("a", 0), ("b", 0)]);
        let mut a = args(true);
        a.mode = PackMode::Sorted;
        let table = "ServiceName,Socket,NCPUs\na,0,3\nb,0,2\n";
        let rep = run_batch(&a, &hosts(), &reqs(table), &fc, &Recorder::default()).unwrap();
        assert_eq!(
            threads_of(&rep, 0),
            vec![("a".to_string(), vec![0, 1, 4]), ("b".to_string(), vec![5, 0])]
        );
    }

    #[test]
    fn test_snapshot_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(
            dir.path(),
            &[
                (LIKWID_OUTPUT, "c0,sn_post.1.x\nc1,sn_text.1.y\n"),
                (LIKWID_OUTPUT, "c2,sn_media.1.z\n"),
            ],
            "sn_post,node0.dsb\nsn_text,node0.dsb\nsn_media,node1.dsb\n",
        );
        let snap = SnapshotCluster::new(dir.path());
        let table = "ServiceName,Socket,NCPUs\npost,1,2\ntext,1,2\nmedia,0,3\n";
        let rep = run_batch(&args(true), &hosts(), &reqs(table), &snap, &Recorder::default()).unwrap();

        // socket1: core0 = [2, 6], core1 = [3, 7]
        assert_eq!(
            threads_of(&rep, 0),
            vec![("post".to_string(), vec![2, 3]), ("text".to_string(), vec![6, 7])]
        );
        // socket0: core0 = [0, 4], core1 = [1, 5]
        assert_eq!(threads_of(&rep, 1), vec![("media".to_string(), vec![0, 1, 4])]);
    }
}
