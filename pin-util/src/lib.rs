// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::info;
use simplelog as sl;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub mod json_file;

pub use json_file::{
    JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave,
};

static PROG_EXITING: AtomicBool = AtomicBool::new(false);

pub fn full_version(semver: &str) -> String {
    let mut ver = semver.to_string();
    if let Some(sha) = option_env!("VERGEN_GIT_SHA") {
        if sha.len() >= 7 && sha != "VERGEN_IDEMPOTENT_OUTPUT" {
            ver += &format!(" {}", &sha[0..7]);
            if option_env!("VERGEN_GIT_DIRTY") == Some("true") {
                ver += "-dirty";
            }
        }
    }
    if let Some(triple) = option_env!("VERGEN_CARGO_TARGET_TRIPLE") {
        ver += &format!(" {}", triple);
    }
    ver
}

/// Look for `file` as given first and then under each of `fallback_dirs`.
pub fn find_file<P: AsRef<Path>>(file: P, fallback_dirs: &[&str]) -> Result<PathBuf> {
    let file = file.as_ref();
    if file.exists() {
        return Ok(file.to_path_buf());
    }
    if file.is_relative() {
        for dir in fallback_dirs {
            let path = Path::new(dir).join(file);
            if path.exists() {
                return Ok(path);
            }
        }
    }
    bail!("file {:?} not found", file);
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    PROG_EXITING.store(true, Ordering::Relaxed);
}

pub fn prog_exiting() -> bool {
    PROG_EXITING.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use std::fs;

    #[test]
    fn test_find_file() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("env_csvs");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("env.csv"), "ServiceName,Socket\n").unwrap();

        let fallback = sub.parent().unwrap().join("env_csvs");
        let fallback = fallback.to_str().unwrap();

        let found = super::find_file("env.csv", &[fallback]).unwrap();
        assert_eq!(found, sub.join("env.csv"));

        let direct = super::find_file(sub.join("env.csv"), &[]).unwrap();
        assert_eq!(direct, sub.join("env.csv"));

        assert!(super::find_file("missing.csv", &[fallback]).is_err());
    }

    #[test]
    fn test_full_version() {
        let ver = super::full_version("1.2.3");
        assert!(ver.starts_with("1.2.3"));
    }
}
