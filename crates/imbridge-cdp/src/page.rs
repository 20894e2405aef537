//! Evaluation seam over an attached target.

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use crate::error::CdpError;

/// One attached page. `CdpSession` is the real implementation; tests inject
/// in-memory fakes.
pub trait PageEvaluator: Send + Sync {
    /// Send one protocol command and return its `result` object.
    fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value, CdpError>>;

    /// False once the underlying transport has closed.
    fn is_alive(&self) -> bool;

    /// Evaluate a script in the page and return its value.
    fn evaluate<'a>(
        &'a self,
        expression: &'a str,
        await_promise: bool,
    ) -> BoxFuture<'a, Result<Value, CdpError>> {
        Box::pin(async move {
            let params = json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": await_promise,
            });
            let result = self.call("Runtime.evaluate", params).await?;
            evaluation_value(result)
        })
    }
}

/// Unwrap a `Runtime.evaluate` result, surfacing thrown exceptions.
pub fn evaluation_value(mut result: Value) -> Result<Value, CdpError> {
    if let Some(details) = result.get("exceptionDetails") {
        let description = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("uncaught exception");
        return Err(CdpError::Script(description.to_string()));
    }
    Ok(result
        .get_mut("result")
        .and_then(|r| r.get_mut("value"))
        .map(Value::take)
        .unwrap_or(Value::Null))
}
