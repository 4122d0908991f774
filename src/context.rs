//! Shared service context.
//!
//! One instance is built at startup and handed by reference to the
//! scheduler, the RPC server, and every worker thread they spawn. There are
//! no process-wide singletons beyond this: every mutation point is a field
//! here, guarded by its own mutex so a slow RPC reader never blocks a
//! mailbox poll and vice versa.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Configuration;
use crate::errors::AppResult;
use crate::logs::LogSinks;
use crate::retry::RetryQueue;

#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<Mutex<Configuration>>,
    pub config_path: PathBuf,
    pub retry_queue: Arc<Mutex<RetryQueue>>,
    pub retry_queue_path: PathBuf,
    pub logs: Arc<LogSinks>,
}

impl ServiceContext {
    pub fn load(data_dir: &std::path::Path) -> AppResult<Self> {
        let config_path = data_dir.join("config.json");
        let retry_queue_path = data_dir.join("retry_queue.json");

        let config = Configuration::load_or_default(&config_path)?;
        let retry_queue = RetryQueue::load_or_default(&retry_queue_path)?;
        let logs = LogSinks::open(data_dir)?;

        Ok(Self {
            config: Arc::new(Mutex::new(config)),
            config_path,
            retry_queue: Arc::new(Mutex::new(retry_queue)),
            retry_queue_path,
            logs: Arc::new(logs),
        })
    }

    /// Persist the in-memory configuration document back to disk.
    pub fn save_config(&self) -> AppResult<()> {
        let config = self.config.lock()?;
        config.save(&self.config_path)
    }

    /// Persist the in-memory retry queue back to disk.
    pub fn save_retry_queue(&self) -> AppResult<()> {
        let queue = self.retry_queue.lock()?;
        queue.save(&self.retry_queue_path)
    }
}
