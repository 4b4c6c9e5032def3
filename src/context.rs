//! Shared node context
//!
//! Everything a worker needs is handed to it explicitly through this struct;
//! there are no globals.

use std::sync::Arc;

use crate::config::Config;
use crate::db::Db;
use crate::handlers::ContentHandlers;
use crate::p2p::Publisher;
use crate::storage::StorageService;

pub struct NodeContext {
    pub config: Config,
    pub db: Arc<Db>,
    pub storage: Arc<StorageService>,
    pub handlers: ContentHandlers,
    /// P2P outbound, absent when the daemon connection is disabled
    pub publisher: Option<Arc<Publisher>>,
}

impl NodeContext {
    pub fn new(
        config: Config,
        db: Arc<Db>,
        storage: Arc<StorageService>,
        publisher: Option<Arc<Publisher>>,
    ) -> Self {
        let handlers = ContentHandlers::new(&config);
        Self {
            config,
            db,
            storage,
            handlers,
            publisher,
        }
    }
}
