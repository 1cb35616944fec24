// Copyright (c) Facebook, Inc. and its affiliates.
use pin_util::*;

pub mod args;
pub mod report;

pub use args::{Args, PackMode};
pub use report::{format_cpu_list, Assignment, NodeReport, PinReport, RowError};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String = full_version(*VERSION);
}
