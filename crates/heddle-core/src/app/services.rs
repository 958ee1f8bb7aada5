//! ServiceRegistry - サービス名 → ServiceAdapter
//!
//! task_type がそのままサービス名になる。呼び出しには登録時の
//! タイムアウトを掛け、超えたら `ErrorKind::Timeout` を返す。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::ports::{ErrorKind, ServiceAdapter, ServiceError, ServiceRequest};
use serde_json::Value;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),
}

struct Registered {
    adapter: Arc<dyn ServiceAdapter>,
    timeout: Duration,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Registered>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ServiceAdapter>,
        timeout: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.services.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        debug!(service = %name, ?timeout, "service registered");
        self.services.insert(name, Registered { adapter, timeout });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn timeout(&self, name: &str) -> Option<Duration> {
        self.services.get(name).map(|s| s.timeout)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Calls the named service under its timeout. No retries.
    pub async fn call(&self, name: &str, request: ServiceRequest) -> Result<Value, ServiceError> {
        let Some(service) = self.services.get(name) else {
            return Err(ServiceError::new(
                ErrorKind::Unavailable,
                format!("no service registered as '{name}'"),
            ));
        };

        match tokio::time::timeout(service.timeout, service.adapter.call(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(service = name, timeout = ?service.timeout, "service call timed out");
                Err(ServiceError::new(
                    ErrorKind::Timeout,
                    format!("'{name}' did not answer within {:?}", service.timeout),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{EchoAdapter, FnAdapter};
    use serde_json::json;

    #[tokio::test]
    async fn call_routes_by_name() {
        let mut registry = ServiceRegistry::new();
        registry.register("llm", Arc::new(EchoAdapter::new("llm")), None).unwrap();

        let answer = registry
            .call("llm", ServiceRequest::new("summarize").param("n", json!(3)))
            .await
            .unwrap();
        assert_eq!(answer["action"], "summarize");
        assert_eq!(answer["parameters"]["n"], 3);
        assert_eq!(registry.timeout("llm"), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register("llm", Arc::new(EchoAdapter::new("llm")), None).unwrap();
        let result = registry.register("llm", Arc::new(EchoAdapter::new("llm")), None);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(name)) if name == "llm"));
    }

    #[tokio::test]
    async fn unknown_service_is_unavailable() {
        let registry = ServiceRegistry::new();
        let err = registry.call("search", ServiceRequest::new("find")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_times_out() {
        let mut registry = ServiceRegistry::new();
        let slow = FnAdapter::new(|_req: ServiceRequest| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ServiceError>(json!(null))
        });
        registry
            .register("engine", Arc::new(slow), Some(Duration::from_millis(50)))
            .unwrap();

        let err = registry.call("engine", ServiceRequest::new("run")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
