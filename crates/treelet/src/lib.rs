//! treelet: host-side engine for an out-of-process parser/refactoring worker.
//!
//! The worker owns parsing, type attribution, and recipe execution. The host
//! installs it, keeps it running, and exchanges lossless trees with it over
//! a framed loopback connection.
//!
//! - [`supervisor`]: install, start, and close the worker process
//! - [`bridge`]: frames, commands, and sessions
//! - [`identity`]: one canonical wrapper per worker handle
//! - [`dispatcher`]: install recipes, load and run them, parse sources
//! - [`worker`]: the serving side, for worker binaries built on this crate

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod identity;
pub mod install;
pub mod logging;
pub mod supervisor;
pub mod tree;
pub mod version;
pub mod worker;

pub use bridge::protocol::{RecipeDescriptor, RecipePackage, WorkerInfo};
pub use bridge::session::Session;
pub use config::{EngineConfig, PortSelection};
pub use dispatcher::{
    Dispatcher, ExecutionContext, InputFailure, ParseStream, ParsedSource, RecipeHandle,
    RecipeRun, SourceInput,
};
pub use engine::{Engine, with_engine};
pub use error::{Error, RemoteFailure, Result};
pub use identity::{IdentityCache, SessionCache};
pub use install::WorkerBundle;
pub use supervisor::{WorkerState, WorkerSupervisor};
pub use tree::{NativeRef, Node, NodeId, Tree, TypeInfo};
pub use version::{PROTOCOL_VERSION, TREELET_VERSION, VersionInfo};
pub use worker::{WorkerHandler, run_worker};
