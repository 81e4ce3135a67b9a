//! In-memory configuration store.
//!
//! Speaks the same paths as the Data Plane API: transactions are opened
//! against the current version, writes are staged per transaction, and a
//! commit applies them all or nothing. Used for dry runs and tests.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dataplane::transport::Transport;
use crate::dataplane::types::{DataplaneError, DataplaneResult};

const TRANSACTIONS: &str = "/v1/services/haproxy/transactions";
const CONFIGURATION: &str = "/v1/services/haproxy/configuration/";

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Collection, e.g. `frontends` or `log_targets`.
    pub kind: String,
    /// Owning object as `<collection>/<name>`, for child objects.
    pub parent: Option<String>,
    pub name: String,
}

/// A request seen by the store.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
enum StagedOp {
    Create(ObjectKey, Value),
    Replace(ObjectKey, Value),
    Delete(ObjectKey),
}

#[derive(Debug)]
struct StagedTransaction {
    version: u64,
    ops: Vec<StagedOp>,
}

#[derive(Debug, Default)]
struct StoreState {
    version: u64,
    objects: BTreeMap<ObjectKey, Value>,
    transactions: HashMap<String, StagedTransaction>,
    calls: Vec<RecordedCall>,
    failures: Vec<String>,
}

/// Shared handle to an in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Create an empty store at `version`.
    pub fn new(version: u64) -> Self {
        let store = Self::default();
        store.lock().version = version;
        store
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Simulate a commit made by another writer.
    pub fn bump_version(&self) {
        self.lock().version += 1;
    }

    /// Fail the next request whose path contains `fragment`.
    pub fn fail_next(&self, fragment: &str) {
        self.lock().failures.push(fragment.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Requests that would change the store (anything but GET).
    pub fn mutations(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != Method::GET)
            .collect()
    }

    pub fn object(&self, kind: &str, parent: Option<&str>, name: &str) -> Option<Value> {
        let key = ObjectKey {
            kind: kind.to_string(),
            parent: parent.map(str::to_string),
            name: name.to_string(),
        };
        self.lock().objects.get(&key).cloned()
    }

    pub fn contains(&self, kind: &str, parent: Option<&str>, name: &str) -> bool {
        self.object(kind, parent, name).is_some()
    }

    /// Committed objects of one collection.
    pub fn objects_of(&self, kind: &str) -> Vec<(ObjectKey, Value)> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn handle(
        state: &mut StoreState,
        method: &Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, (u16, String)> {
        let url = url::Url::parse(&format!("memory://store{}", path))
            .map_err(|e| (400, format!("bad path: {}", e)))?;
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let route = url.path();

        if route == TRANSACTIONS && *method == Method::POST {
            let requested: u64 = query
                .get("version")
                .and_then(|v| v.parse().ok())
                .ok_or((400, "missing version".to_string()))?;
            if requested != state.version {
                return Err((409, format!("version mismatch: store at {}", state.version)));
            }
            let id = uuid::Uuid::new_v4().to_string();
            state.transactions.insert(
                id.clone(),
                StagedTransaction {
                    version: requested,
                    ops: Vec::new(),
                },
            );
            return Ok(json!({"id": id, "_version": requested, "status": "in_progress"}));
        }

        if let Some(id) = route.strip_prefix(TRANSACTIONS).and_then(|r| r.strip_prefix('/')) {
            if *method == Method::PUT {
                return Self::commit(state, id);
            }
            if *method == Method::DELETE {
                return state
                    .transactions
                    .remove(id)
                    .map(|_| Value::Null)
                    .ok_or((404, format!("transaction {} not found", id)));
            }
            return Err((405, "method not allowed".to_string()));
        }

        if *method == Method::GET {
            return match route {
                "/v1/specification" => Ok(json!({})),
                "/v1/info" => Ok(json!({"api": {"version": "memory"}})),
                _ => {
                    let kind = route
                        .strip_prefix(CONFIGURATION)
                        .ok_or((404, "not found".to_string()))?;
                    let data: Vec<Value> = state
                        .objects
                        .iter()
                        .filter(|(k, _)| k.kind == kind)
                        .map(|(_, v)| v.clone())
                        .collect();
                    Ok(json!({"_version": state.version, "data": data}))
                }
            };
        }

        let rest = route
            .strip_prefix(CONFIGURATION)
            .ok_or((404, "not found".to_string()))?;
        let tx_id = query
            .get("transaction_id")
            .ok_or((400, "only transactional writes are supported".to_string()))?;
        let parent = parent_of(&query);

        let op = match (method, rest.split_once('/')) {
            (m, None) if *m == Method::POST => {
                let body = body.ok_or((400, "missing body".to_string()))?;
                let name = object_name(&body).ok_or((400, "object has no name or id".to_string()))?;
                StagedOp::Create(key(rest, parent, &name), body)
            }
            (m, Some((kind, name))) if *m == Method::PUT => {
                let body = body.ok_or((400, "missing body".to_string()))?;
                StagedOp::Replace(key(kind, parent, name), body)
            }
            (m, Some((kind, name))) if *m == Method::DELETE => StagedOp::Delete(key(kind, parent, name)),
            _ => return Err((405, "method not allowed".to_string())),
        };

        let tx = state
            .transactions
            .get_mut(tx_id)
            .ok_or((404, format!("transaction {} not found", tx_id)))?;
        tx.ops.push(op);
        Ok(Value::Null)
    }

    fn commit(state: &mut StoreState, id: &str) -> Result<Value, (u16, String)> {
        let tx = state
            .transactions
            .remove(id)
            .ok_or((404, format!("transaction {} not found", id)))?;
        if tx.version != state.version {
            return Err((
                409,
                format!(
                    "transaction opened at version {}, store at {}",
                    tx.version, state.version
                ),
            ));
        }

        let mut objects = state.objects.clone();
        for op in tx.ops {
            match op {
                StagedOp::Create(key, value) => {
                    if objects.contains_key(&key) {
                        return Err((409, format!("{} {} already exists", key.kind, key.name)));
                    }
                    objects.insert(key, value);
                }
                StagedOp::Replace(key, value) => {
                    if !objects.contains_key(&key) {
                        return Err((404, format!("{} {} not found", key.kind, key.name)));
                    }
                    objects.insert(key, value);
                }
                StagedOp::Delete(key) => {
                    if objects.remove(&key).is_none() {
                        return Err((404, format!("{} {} not found", key.kind, key.name)));
                    }
                    // children go with their owner
                    let owner = format!("{}/{}", key.kind, key.name);
                    objects.retain(|k, _| k.parent.as_deref() != Some(owner.as_str()));
                }
            }
        }

        state.objects = objects;
        state.version += 1;
        Ok(json!({"id": id, "status": "success", "_version": state.version}))
    }
}

fn key(kind: &str, parent: Option<String>, name: &str) -> ObjectKey {
    ObjectKey {
        kind: kind.to_string(),
        parent,
        name: name.to_string(),
    }
}

fn parent_of(query: &HashMap<String, String>) -> Option<String> {
    if let Some(fe) = query.get("frontend") {
        return Some(format!("frontends/{}", fe));
    }
    if let Some(be) = query.get("backend") {
        return Some(format!("backends/{}", be));
    }
    match (query.get("parent_type"), query.get("parent_name")) {
        (Some(t), Some(n)) => Some(format!("{}s/{}", t, n)),
        _ => None,
    }
}

fn object_name(body: &Value) -> Option<String> {
    match (body.get("name"), body.get("id")) {
        (Some(Value::String(name)), _) => Some(name.clone()),
        (_, Some(Value::Number(id))) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Transport for MemoryStore {
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> DataplaneResult<Value> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            method: method.clone(),
            path: path.to_string(),
            body: body.clone(),
        });

        if let Some(pos) = state.failures.iter().position(|f| path.contains(f.as_str())) {
            state.failures.remove(pos);
            return Err(DataplaneError::Status {
                method: method.to_string(),
                path: path.to_string(),
                status: 500,
                body: "injected failure".to_string(),
            });
        }

        Self::handle(&mut state, &method, path, body).map_err(|(status, body)| DataplaneError::Status {
            method: method.to_string(),
            path: path.to_string(),
            status,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(store: &MemoryStore) -> String {
        let res = store
            .send(Method::POST, &format!("{}?version={}", TRANSACTIONS, store.version()), None)
            .await
            .unwrap();
        res["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_delete_cascades_to_children() {
        let store = MemoryStore::new(1);
        let id = open(&store).await;
        store
            .send(
                Method::POST,
                &format!("{}frontends?transaction_id={}", CONFIGURATION, id),
                Some(json!({"name": "fe"})),
            )
            .await
            .unwrap();
        store
            .send(
                Method::POST,
                &format!("{}binds?frontend=fe&transaction_id={}", CONFIGURATION, id),
                Some(json!({"name": "fe_bind"})),
            )
            .await
            .unwrap();
        store
            .send(Method::PUT, &format!("{}/{}", TRANSACTIONS, id), None)
            .await
            .unwrap();
        assert!(store.contains("binds", Some("frontends/fe"), "fe_bind"));

        let id = open(&store).await;
        store
            .send(
                Method::DELETE,
                &format!("{}frontends/fe?transaction_id={}", CONFIGURATION, id),
                None,
            )
            .await
            .unwrap();
        store
            .send(Method::PUT, &format!("{}/{}", TRANSACTIONS, id), None)
            .await
            .unwrap();

        assert!(!store.contains("frontends", None, "fe"));
        assert!(!store.contains("binds", Some("frontends/fe"), "fe_bind"));
        assert_eq!(store.version(), 3);
    }

    #[tokio::test]
    async fn test_failed_commit_is_all_or_nothing() {
        let store = MemoryStore::new(1);
        let id = open(&store).await;
        store
            .send(
                Method::POST,
                &format!("{}frontends?transaction_id={}", CONFIGURATION, id),
                Some(json!({"name": "fe"})),
            )
            .await
            .unwrap();
        store
            .send(
                Method::DELETE,
                &format!("{}backends/missing?transaction_id={}", CONFIGURATION, id),
                None,
            )
            .await
            .unwrap();

        let err = store
            .send(Method::PUT, &format!("{}/{}", TRANSACTIONS, id), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(!store.contains("frontends", None, "fe"));
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let store = MemoryStore::new(1);
        store.fail_next("/v1/specification");
        assert!(store.send(Method::GET, "/v1/specification", None).await.is_err());
        assert!(store.send(Method::GET, "/v1/specification", None).await.is_ok());
    }
}
