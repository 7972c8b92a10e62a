//! The geometry-kernel collaborator.
//!
//! Scripts reach the external geometry engine only through
//! `geometry.invoke(operation, params)`, and only when their policy grants
//! `allow_geometry_api`. The backend itself is out of scope; the engine
//! talks to it through [`GeometryBackend`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// The capability object the sandbox proxies geometry calls to.
#[async_trait]
pub trait GeometryBackend: Send + Sync {
    /// Invoke one named geometry operation with a JSON parameter map.
    async fn invoke(&self, operation: &str, params: Value) -> anyhow::Result<Value>;
}

/// Backend used when no geometry kernel is wired up. Every call fails.
pub struct NullGeometry;

#[async_trait]
impl GeometryBackend for NullGeometry {
    async fn invoke(&self, operation: &str, _params: Value) -> anyhow::Result<Value> {
        anyhow::bail!("no geometry backend configured (operation '{operation}')")
    }
}

/// A test double that records every call and returns a canned value.
///
/// Useful in unit and integration tests where the real geometry kernel is
/// unavailable or irrelevant.
pub struct MockGeometry {
    /// Value returned from every `invoke`.
    pub response: Value,
    /// All `(operation, params)` pairs seen, in call order.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockGeometry {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(response: Value) -> Self {
        Self {
            response,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times `invoke` has been called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl GeometryBackend for MockGeometry {
    async fn invoke(&self, operation: &str, params: Value) -> anyhow::Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), params));
        Ok(self.response.clone())
    }
}
