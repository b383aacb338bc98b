//! Tool contract.
//!
//! A [`Tool`] is a named, asynchronous capability with a declared parameter
//! schema.  Callers never invoke [`Tool::call`] directly; they go through
//! [`invoke_tool`], which validates the parameters against the schema,
//! applies defaults, enforces the tool's timeout, and converts every outcome
//! into a [`ToolOutput`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

/// Named tool arguments.
pub type Params = Map<String, Value>;

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

/// JSON type tag a parameter must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    /// Whether `value` carries this type tag.  Integers are also numbers.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra predicate a parameter value must satisfy.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Declaration of one tool parameter.
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
    pub validator: Option<Validator>,
}

impl ParamSpec {
    /// A parameter the caller must supply.
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: String::new(),
            validator: None,
        }
    }

    /// A parameter the caller may omit.
    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    /// Value used when the caller omits the parameter.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Schema entry as JSON, e.g. for listing tools.
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "type": self.kind.as_str(),
            "required": self.required,
            "default": self.default,
            "description": self.description,
        })
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Check `params` against `specs` and fill in defaults.
///
/// Parameters not named in the schema pass through untouched.
pub fn validate_params(
    specs: &[ParamSpec],
    mut params: Params,
) -> std::result::Result<Params, String> {
    for spec in specs {
        match params.get(&spec.name) {
            None => {
                if let Some(default) = &spec.default {
                    params.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(format!("missing required parameter `{}`", spec.name));
                }
            }
            Some(value) => {
                if !spec.kind.matches(value) {
                    return Err(format!(
                        "parameter `{}` must be of type {}",
                        spec.name, spec.kind
                    ));
                }
                if let Some(validator) = &spec.validator {
                    if !validator(value) {
                        return Err(format!("parameter `{}` failed validation", spec.name));
                    }
                }
            }
        }
    }
    Ok(params)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Whether a tool call succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Structured result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub status: ToolStatus,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolOutput {
    pub fn success(value: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            value,
            message: None,
            metadata: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            value: Value::Null,
            message: Some(message.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Wall-clock seconds recorded by [`invoke_tool`].
    pub fn execution_time(&self) -> Option<f64> {
        self.metadata.get("execution_time").and_then(Value::as_f64)
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A capability an agent can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within an agent.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Parameter schema checked before every call.
    fn parameters(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Upper bound on a single call; `None` waits indefinitely.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the tool with already-validated parameters.
    async fn call(&self, params: Params) -> Result<Value>;
}

/// Validate, run and time a tool call.
///
/// Never fails: schema violations, errors, panics and timeouts all become
/// an error [`ToolOutput`].  The tool body is not entered when validation
/// fails.
pub async fn invoke_tool(tool: &dyn Tool, params: Params) -> ToolOutput {
    let started = Instant::now();
    let name = tool.name().to_owned();

    let params = match validate_params(&tool.parameters(), params) {
        Ok(params) => params,
        Err(reason) => {
            tracing::warn!(tool = %name, reason = %reason, "tool parameter validation failed");
            let err = AgentError::ParameterValidation {
                tool_name: name,
                reason,
            };
            return timed(ToolOutput::error(err.to_string()), started);
        }
    };

    let call = AssertUnwindSafe(tool.call(params)).catch_unwind();
    let result = match tool.timeout() {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Ok(Err(AgentError::Timeout {
                operation: name.clone(),
                timeout: limit,
            })),
        },
        None => call.await,
    };

    let output = match result {
        Ok(Ok(value)) => ToolOutput::success(value),
        Ok(Err(e)) => {
            tracing::warn!(tool = %name, error = %e, "tool call failed");
            ToolOutput::error(e.to_string())
        }
        Err(_) => {
            tracing::error!(tool = %name, "tool panicked");
            ToolOutput::error(format!("tool `{name}` panicked"))
        }
    };
    timed(output, started)
}

fn timed(output: ToolOutput, started: Instant) -> ToolOutput {
    output.with_metadata(
        "execution_time",
        Value::from(started.elapsed().as_secs_f64()),
    )
}

// ---------------------------------------------------------------------------
// Closure-backed tool
// ---------------------------------------------------------------------------

type ToolFn = Arc<dyn Fn(Params) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A [`Tool`] built from an async closure.
///
/// ```ignore
/// let echo = FnTool::new("echo", "Echo the text back", |params| async move {
///     Ok(params.get("text").cloned().unwrap_or_default())
/// })
/// .with_param(ParamSpec::required("text", ParamType::String));
/// ```
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    params: Vec<ParamSpec>,
    timeout: Option<Duration>,
    func: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            timeout: None,
            func: Arc::new(move |params| Box::pin(func(params))),
        }
    }

    pub fn with_param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        self.params.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn call(&self, params: Params) -> Result<Value> {
        (self.func)(params).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn counting_tool(calls: Arc<AtomicUsize>) -> FnTool {
        FnTool::new("count", "counts calls", move |p| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Object(p))
            }
        })
        .with_param(ParamSpec::required("text", ParamType::String))
        .with_param(ParamSpec::optional("times", ParamType::Integer).with_default(json!(1)))
    }

    #[test]
    fn type_tags() {
        assert!(ParamType::Integer.matches(&json!(3)));
        assert!(!ParamType::Integer.matches(&json!(3.5)));
        assert!(ParamType::Number.matches(&json!(3)));
        assert!(ParamType::Any.matches(&Value::Null));
        assert!(!ParamType::String.matches(&json!(1)));
    }

    #[tokio::test]
    async fn missing_required_parameter_skips_body() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = counting_tool(Arc::clone(&calls));

        let out = invoke_tool(&tool, Params::new()).await;
        assert!(out.is_error());
        assert!(out.message.as_deref().unwrap().contains("text"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_type_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = counting_tool(Arc::clone(&calls));

        let out = invoke_tool(&tool, params(json!({"text": 5}))).await;
        assert!(out.is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validator_is_applied() {
        let tool = FnTool::new("pos", "", |_| async { Ok(json!(true)) }).with_param(
            ParamSpec::required("n", ParamType::Integer)
                .with_validator(|v| v.as_i64().is_some_and(|n| n > 0)),
        );

        assert!(invoke_tool(&tool, params(json!({"n": -1}))).await.is_error());
        assert!(invoke_tool(&tool, params(json!({"n": 2}))).await.is_success());
    }

    #[tokio::test]
    async fn defaults_are_applied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = counting_tool(calls);

        let out = invoke_tool(&tool, params(json!({"text": "hi"}))).await;
        assert!(out.is_success());
        assert_eq!(out.value, json!({"text": "hi", "times": 1}));
        assert!(out.execution_time().is_some());
    }

    #[tokio::test]
    async fn tool_error_becomes_output() {
        let tool = FnTool::new("boom", "", |_| async {
            Err(AgentError::Internal("kaput".into()))
        });
        let out = invoke_tool(&tool, Params::new()).await;
        assert_eq!(out.status, ToolStatus::Error);
        assert!(out.message.unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let tool = FnTool::new("slow", "", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        })
        .with_timeout(Duration::from_millis(20));

        let out = invoke_tool(&tool, Params::new()).await;
        assert!(out.is_error());
        assert!(out.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panic_becomes_output() {
        let tool = FnTool::new("panics", "", |p: Params| async move {
            if p.is_empty() {
                panic!("tool bug");
            }
            Ok(Value::Null)
        });
        let out = invoke_tool(&tool, Params::new()).await;
        assert!(out.is_error());
    }

    #[test]
    fn output_serializes_status_tag() {
        let out = ToolOutput::error("nope");
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["message"], "nope");
    }
}
