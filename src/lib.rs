//! Aleph Core Channel Node
//!
//! One replica of the content-addressed message network: chain indexers and
//! the P2P firehose feed durable pending queues, the processing pipeline
//! validates and orders signed messages, per-type handlers fold them into
//! the relational store, and the content-addressed storage keeps the bytes.

pub mod chains;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod p2p;
pub mod permissions;
pub mod signing;
pub mod storage;
pub mod types;

pub use config::Config;
pub use context::NodeContext;
pub use db::Db;
pub use error::{NodeError, ProcessingError};
pub use storage::{IpfsClient, ObjectStore, StorageService};
