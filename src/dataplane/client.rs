//! Versioned transaction client.
//!
//! # Responsibilities
//! - Open transactions against the store's current version
//! - Stage ordered create/replace/delete operations inside a transaction
//! - Commit, bumping the tracked version exactly once on success
//!
//! # Design Decisions
//! - One async mutex serializes every request made through the client and
//!   guards the version counter
//! - Not reentrant across transactions; callers open one at a time

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tokio::sync::Mutex;

use crate::dataplane::models::{
    Backend, Bind, Filter, Frontend, LogTarget, Server, TcpRequestRule, TransactionInfo,
};
use crate::dataplane::transport::Transport;
use crate::dataplane::types::{DataplaneError, DataplaneResult, ParentType};

const TRANSACTIONS: &str = "/v1/services/haproxy/transactions";
const CONFIGURATION: &str = "/v1/services/haproxy/configuration";

/// Client for the proxy's versioned configuration store.
pub struct DataplaneClient<T> {
    transport: T,
    version: Mutex<u64>,
}

impl<T: Transport> DataplaneClient<T> {
    /// Create a client that assumes the store is at `version`.
    pub fn new(transport: T, version: u64) -> Self {
        Self {
            transport,
            version: Mutex::new(version),
        }
    }

    /// Version the next transaction will be opened against.
    pub async fn version(&self) -> u64 {
        *self.version.lock().await
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn call<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> DataplaneResult<Value> {
        let body = body.map(serde_json::to_value).transpose()?;
        let _guard = self.version.lock().await;
        self.transport.send(method, path, body).await
    }

    /// Check the API is reachable.
    pub async fn ping(&self) -> DataplaneResult<()> {
        self.call::<()>(Method::GET, "/v1/specification", None).await?;
        Ok(())
    }

    /// Process and API information.
    pub async fn info(&self) -> DataplaneResult<Value> {
        self.call::<()>(Method::GET, "/v1/info", None).await
    }

    /// Re-read the store's current version and track it.
    pub async fn refresh_version(&self) -> DataplaneResult<u64> {
        let mut version = self.version.lock().await;
        let res = self
            .transport
            .send(Method::GET, &format!("{}/frontends", CONFIGURATION), None)
            .await?;
        let current = res
            .get("_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| DataplaneError::Decode("frontend listing carries no _version".to_string()))?;
        if current != *version {
            tracing::info!(from = *version, to = current, "Dataplane version resynchronized");
        }
        *version = current;
        Ok(current)
    }

    /// Names of the committed objects in a top-level collection such as
    /// `frontends` or `backends`.
    pub async fn list_names(&self, collection: &str) -> DataplaneResult<BTreeSet<String>> {
        let res = self
            .call::<()>(Method::GET, &format!("{}/{}", CONFIGURATION, collection), None)
            .await?;
        let data = res
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| DataplaneError::Decode(format!("{} listing carries no data", collection)))?;
        Ok(data
            .iter()
            .filter_map(|obj| obj.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Open a transaction against the tracked version.
    pub async fn begin(&self) -> DataplaneResult<Transaction<'_, T>> {
        let version = self.version.lock().await;
        let res = self
            .transport
            .send(
                Method::POST,
                &format!("{}?version={}", TRANSACTIONS, *version),
                None,
            )
            .await?;
        let info: TransactionInfo = serde_json::from_value(res)?;
        tracing::debug!(transaction_id = %info.id, version = *version, "Transaction opened");

        Ok(Transaction {
            id: info.id,
            version: *version,
            client: self,
        })
    }
}

/// Operations staged server-side until `commit`.
pub struct Transaction<'a, T> {
    id: String,
    version: u64,
    client: &'a DataplaneClient<T>,
}

impl<'a, T: Transport> Transaction<'a, T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version this transaction was opened against.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Make every staged operation visible at once.
    ///
    /// Fails without touching the tracked version if it moved since `begin`.
    pub async fn commit(self) -> DataplaneResult<()> {
        let mut version = self.client.version.lock().await;
        if *version != self.version {
            return Err(DataplaneError::VersionConflict {
                expected: self.version,
                actual: *version,
            });
        }
        self.client
            .transport
            .send(Method::PUT, &format!("{}/{}", TRANSACTIONS, self.id), None)
            .await?;
        *version += 1;
        tracing::debug!(transaction_id = %self.id, version = *version, "Transaction committed");
        Ok(())
    }

    /// Discard every staged operation.
    pub async fn abort(self) -> DataplaneResult<()> {
        let path = format!("{}/{}", TRANSACTIONS, self.id);
        self.client.call::<()>(Method::DELETE, &path, None).await?;
        tracing::debug!(transaction_id = %self.id, "Transaction aborted");
        Ok(())
    }

    async fn post<B: Serialize>(&self, collection: &str, query: &str, body: &B) -> DataplaneResult<()> {
        let path = format!(
            "{}/{}?{}transaction_id={}",
            CONFIGURATION, collection, query, self.id
        );
        self.client.call(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, name: &str, query: &str) -> DataplaneResult<()> {
        let path = format!(
            "{}/{}/{}?{}transaction_id={}",
            CONFIGURATION, collection, name, query, self.id
        );
        self.client.call::<()>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn create_frontend(&self, fe: &Frontend) -> DataplaneResult<()> {
        self.post("frontends", "", fe).await
    }

    pub async fn delete_frontend(&self, name: &str) -> DataplaneResult<()> {
        self.delete("frontends", name, "").await
    }

    pub async fn create_bind(&self, frontend: &str, bind: &Bind) -> DataplaneResult<()> {
        self.post("binds", &format!("frontend={}&", frontend), bind).await
    }

    pub async fn create_backend(&self, be: &Backend) -> DataplaneResult<()> {
        self.post("backends", "", be).await
    }

    pub async fn delete_backend(&self, name: &str) -> DataplaneResult<()> {
        self.delete("backends", name, "").await
    }

    pub async fn create_server(&self, backend: &str, srv: &Server) -> DataplaneResult<()> {
        self.post("servers", &format!("backend={}&", backend), srv).await
    }

    pub async fn replace_server(&self, backend: &str, srv: &Server) -> DataplaneResult<()> {
        let path = format!(
            "{}/servers/{}?backend={}&transaction_id={}",
            CONFIGURATION, srv.name, backend, self.id
        );
        self.client.call(Method::PUT, &path, Some(srv)).await?;
        Ok(())
    }

    pub async fn delete_server(&self, backend: &str, name: &str) -> DataplaneResult<()> {
        self.delete("servers", name, &format!("backend={}&", backend)).await
    }

    pub async fn create_log_target(
        &self,
        parent_type: ParentType,
        parent_name: &str,
        target: &LogTarget,
    ) -> DataplaneResult<()> {
        self.post("log_targets", &parent_query(parent_type, parent_name), target)
            .await
    }

    pub async fn create_filter(
        &self,
        parent_type: ParentType,
        parent_name: &str,
        filter: &Filter,
    ) -> DataplaneResult<()> {
        self.post("filters", &parent_query(parent_type, parent_name), filter)
            .await
    }

    pub async fn create_tcp_request_rule(
        &self,
        parent_type: ParentType,
        parent_name: &str,
        rule: &TcpRequestRule,
    ) -> DataplaneResult<()> {
        self.post("tcp_request_rules", &parent_query(parent_type, parent_name), rule)
            .await
    }
}

fn parent_query(parent_type: ParentType, parent_name: &str) -> String {
    format!("parent_type={}&parent_name={}&", parent_type, parent_name)
}

impl<T> std::fmt::Debug for DataplaneClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataplaneClient").finish_non_exhaustive()
    }
}
