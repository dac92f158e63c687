// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("parent directory does not exist: {0}")]
    ParentDirMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch subscription failed: {0}")]
    Watch(String),

    #[error("discarded {0} buffered bytes with no line delimiter")]
    FragmentOverflow(usize),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
