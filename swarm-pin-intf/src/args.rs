// Copyright (c) Facebook, Inc. and its affiliates.
use lazy_static::lazy_static;
use log::error;
use serde::{Deserialize, Serialize};
use std::process::exit;

use pin_util::*;

const HELP_BODY: &str = "\
Topology-aware CPU pinning for docker swarm services.

swarm-pin reads a placement table (ServiceName, Socket and optional NCPUs
columns) and pins the running container of each listed service to hardware
threads on the requested socket of the node the service runs on.

Rows are processed in file order and each row sees the occupancy left behind
by the rows before it. Unless --sorted is given, threads are handed out in
three tiers: one thread per untouched physical core first, then the remaining
SMT siblings of touched cores, and finally a per-socket round-robin once every
thread on the socket has been claimed. With --sorted, threads are taken
round-robin in ascending hardware thread order from the start.

Socket -1 skips a service. A missing or zero NCPUs pins the container to the
whole socket.
";

lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-n, --nodes=[FILE]        'Node list, one ssh command per line, last word is the host'
             -c, --csv-file=[FILE]     'Placement table (default: {dfl_csv}, also looked up in env_csvs/)'
                 --delimiter=[CHAR]    'Placement table delimiter (default: \"{dfl_delim}\")'
             -S, --stack=[NAME]        'Swarm stack name, services are named STACK_SERVICE'
             -s, --sorted              'Hand out threads in ascending id order, skipping the SMT-avoiding tiers'
                 --spread              'Use the SMT-avoiding tiers (default)'
                 --snapshot=[DIR]      'Read probe outputs from DIR instead of the nodes'
                 --ssh-key=[FILE]      'Identity file for ssh'
                 --ssh-timeout=[SECS]  'ssh connection timeout (default: {dfl_timeout})'
             -r, --result=[FILE]       'Write the run report to FILE'
             -a, --args=[FILE]         'Load base command line arguments from FILE'
                 --keep-going          'Record failures and continue instead of stopping at the first one'
                 --require-containers  'Treat a service without a running container as an error'
                 --dry-run             'Compute and log the pins without applying them'
             -v...                     'Sets the level of verbosity'",
            dfl_csv = dfl.csv_file,
            dfl_delim = dfl.delimiter,
            dfl_timeout = dfl.ssh_timeout,
        )
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackMode {
    /// Tiered: one thread per free core, then siblings, then round-robin.
    Spread,
    /// Round-robin over the socket's threads in ascending id order.
    Sorted,
}

impl Default for PackMode {
    fn default() -> Self {
        Self::Spread
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub nodes: Option<String>,
    pub csv_file: String,
    pub delimiter: String,
    pub stack: String,
    pub mode: PackMode,
    pub snapshot: Option<String>,
    pub ssh_key: Option<String>,
    pub ssh_timeout: u64,

    #[serde(skip)]
    pub result: Option<String>,
    #[serde(skip)]
    pub strict: bool,
    #[serde(skip)]
    pub require_containers: bool,
    #[serde(skip)]
    pub dry_run: bool,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            nodes: None,
            csv_file: "env.csv".into(),
            delimiter: ",".into(),
            stack: "".into(),
            mode: PackMode::Spread,
            snapshot: None,
            ssh_key: None,
            ssh_timeout: 10,
            result: None,
            strict: true,
            require_containers: false,
            dry_run: false,
            verbosity: 0,
        }
    }
}

impl Args {
    fn app() -> clap::App<'static, 'static> {
        clap::App::new("swarm-pin")
            .version((*super::FULL_VERSION).as_str())
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
    }

    /// Name prefix shared by the service's containers, "STACK_SERVICE".
    pub fn service_prefix(&self, service: &str) -> String {
        if self.stack.is_empty() {
            service.to_string()
        } else {
            format!("{}_{}", &self.stack, service)
        }
    }

    pub fn delimiter_byte(&self) -> Option<u8> {
        match self.delimiter.as_bytes() {
            [b] => Some(*b),
            _ => None,
        }
    }
}

impl JsonLoad for Args {}
impl JsonSave for Args {}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        Self::app().get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> bool {
        let dfl = Args::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("nodes") {
            self.nodes = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("csv-file") {
            self.csv_file = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.csv_file.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("delimiter") {
            self.delimiter = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.delimiter.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("stack") {
            self.stack = v.to_string();
            updated_base = true;
        }
        if matches.is_present("sorted") {
            self.mode = PackMode::Sorted;
            updated_base = true;
        } else if matches.is_present("spread") {
            self.mode = PackMode::Spread;
            updated_base = true;
        }
        if let Some(v) = matches.value_of("snapshot") {
            self.snapshot = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("ssh-key") {
            self.ssh_key = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("ssh-timeout") {
            self.ssh_timeout = if v.len() > 0 {
                match v.parse::<u64>() {
                    Ok(secs) => secs,
                    Err(e) => {
                        error!("invalid --ssh-timeout {:?} ({})", v, &e);
                        exit(1);
                    }
                }
            } else {
                dfl.ssh_timeout
            };
            updated_base = true;
        }

        if self.delimiter_byte().is_none() {
            error!("delimiter must be a single byte, got {:?}", &self.delimiter);
            exit(1);
        }

        self.result = matches.value_of("result").map(|x| x.to_string());
        self.strict = !matches.is_present("keep-going");
        self.require_containers = matches.is_present("require-containers");
        self.dry_run = matches.is_present("dry-run");
        self.verbosity = Self::verbosity(matches);

        updated_base
    }
}
