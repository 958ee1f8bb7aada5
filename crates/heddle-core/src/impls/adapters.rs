//! ServiceAdapter の実装（開発用・テスト用）

use std::future::Future;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::ports::{ServiceAdapter, ServiceError, ServiceRequest};

/// Wraps an async closure as an adapter.
///
/// ```ignore
/// let adapter = FnAdapter::new(|req: ServiceRequest| async move {
///     Ok(json!({"action": req.action}))
/// });
/// ```
pub struct FnAdapter<F> {
    f: F,
}

impl<F> FnAdapter<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ServiceAdapter for FnAdapter<F>
where
    F: Fn(ServiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ServiceError>> + Send,
{
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError> {
        (self.f)(request).await
    }
}

/// Logs the request and answers with it.
#[derive(Debug, Clone, Default)]
pub struct EchoAdapter {
    name: String,
}

impl EchoAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ServiceAdapter for EchoAdapter {
    async fn call(&self, request: ServiceRequest) -> Result<Value, ServiceError> {
        info!(service = %self.name, action = %request.action, "service call");
        Ok(json!({
            "service": self.name,
            "action": request.action,
            "parameters": request.parameters,
        }))
    }
}
