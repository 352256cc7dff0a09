//! Reference worker for treelet: Java parsing via tree-sitter plus a small
//! set of built-in recipes, served over the treelet wire protocol.

pub mod error;
pub mod handler;
pub mod manifest;
pub mod recipes;
pub mod syntax;

use treelet::install::MANIFEST_FILE;
use treelet::{WorkerBundle, WorkerInfo};

pub use handler::JavaWorker;

pub const WORKER_NAME: &str = "treelet-worker";

/// The installable bundle shipped inside this binary.
pub fn bundle() -> WorkerBundle {
    WorkerBundle::embedded(
        WORKER_NAME,
        &[
            (MANIFEST_FILE, &include_bytes!("../bundle/worker.json")[..]),
            (
                manifest::CATALOG_FILE,
                &include_bytes!("../bundle/recipes.json")[..],
            ),
        ],
    )
}

pub fn worker_info() -> WorkerInfo {
    WorkerInfo::new(WORKER_NAME, env!("CARGO_PKG_VERSION"))
}
