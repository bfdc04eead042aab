//! Storage engine adapter
//!
//! The layer never speaks a wire protocol itself. Each node connection is
//! reached through a [`StorageAdapter`] that can run a finished query and
//! apply DDL. Connection pooling is the adapter's concern.

use crate::error::Result;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use query_core::NodeInfo;

/// Per-node query execution provided by the external storage engine
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Run a query on `node` and return its rows
    async fn query(&self, node: &NodeInfo, sql: &str) -> Result<Vec<RecordBatch>>;

    /// Apply a DDL statement on `node`
    async fn exec(&self, node: &NodeInfo, ddl: &str) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted adapter for unit tests

    use super::*;
    use crate::error::DistributedError;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum Behavior {
        Rows(Vec<RecordBatch>),
        Fail(String),
        Delay(Duration, Vec<RecordBatch>),
        Hang,
    }

    /// Records every call and answers according to per-host behavior
    #[derive(Default)]
    pub struct ScriptedAdapter {
        behaviors: Mutex<HashMap<String, Behavior>>,
        failing_ddl: Mutex<HashSet<String>>,
        pub queries: Mutex<Vec<(String, String)>>,
        pub ddl: Mutex<Vec<(String, String)>>,
        pub finished: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set(&self, host: &str, behavior: Behavior) {
            self.behaviors.lock().insert(host.to_string(), behavior);
        }

        pub fn fail_ddl_on(&self, host: &str) {
            self.failing_ddl.lock().insert(host.to_string());
        }

        pub fn heal_ddl_on(&self, host: &str) {
            self.failing_ddl.lock().remove(host);
        }

        pub fn query_hosts(&self) -> Vec<String> {
            self.queries.lock().iter().map(|(h, _)| h.clone()).collect()
        }

        pub fn ddl_statements(&self) -> Vec<(String, String)> {
            self.ddl.lock().clone()
        }
    }

    #[async_trait]
    impl StorageAdapter for ScriptedAdapter {
        async fn query(&self, node: &NodeInfo, sql: &str) -> Result<Vec<RecordBatch>> {
            self.queries
                .lock()
                .push((node.host.clone(), sql.to_string()));
            let behavior = self
                .behaviors
                .lock()
                .get(&node.host)
                .cloned()
                .unwrap_or(Behavior::Rows(Vec::new()));
            let outcome = match behavior {
                Behavior::Rows(rows) => Ok(rows),
                Behavior::Fail(message) => Err(DistributedError::AdapterError(message)),
                Behavior::Delay(delay, rows) => {
                    tokio::time::sleep(delay).await;
                    Ok(rows)
                }
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(Vec::new())
                }
            };
            self.finished.lock().push(node.host.clone());
            outcome
        }

        async fn exec(&self, node: &NodeInfo, ddl: &str) -> Result<()> {
            self.ddl.lock().push((node.host.clone(), ddl.to_string()));
            if self.failing_ddl.lock().contains(&node.host) {
                return Err(DistributedError::AdapterError(format!(
                    "connection refused by {}",
                    node.host
                )));
            }
            Ok(())
        }
    }
}
