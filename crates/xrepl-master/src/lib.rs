#![warn(missing_docs)]

//! xrepl master subsystem: CDC stream and xCluster replication metadata.
//!
//! [`XreplCatalogManager`] owns the in-memory maps of streams, replication
//! groups and bootstrap pipelines, persists them through the sys catalog and
//! drives the asynchronous workflows. [`ReplicationService`] is the RPC
//! surface in front of it.

pub mod bg_tasks;
pub mod catalog;
pub mod cdc_state;
pub mod config;
pub mod cow;
pub mod dynamic_tables;
pub mod error;
pub mod fanout;
pub mod loader;
pub mod manager;
pub mod maps;
pub mod metadata;
pub mod producer;
pub mod rpc;
pub mod service;
pub mod split;
pub mod stream_manager;
pub mod sys_catalog;
pub mod types;
pub mod universe;

pub use bg_tasks::{spawn_background_loop, BackgroundTaskStats};
pub use config::{LogFormat, MasterConfig};
pub use error::{MasterError, MasterErrorCode, Result};
pub use manager::{XreplCatalogManager, XreplCollaborators};
pub use service::ReplicationService;
