//! Method dispatch for hosts that speak JSON
//!
//! A host sends `{"id": .., "method": "login", "args": {..}}` and gets back
//! `{"id": .., "result": ..}` or `{"id": .., "error": {errorKind, message}}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BridgeFacade, BridgeOutcome, ErrorPayload};
use crate::auth::ConfigureRequest;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl RpcResponse {
    fn new(id: Value, outcome: BridgeOutcome<Value>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Self {
                id,
                result: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct AcquireTokenArgs {
    scopes: Vec<String>,
}

fn bad_args(method: &str, err: serde_json::Error) -> ErrorPayload {
    let message = format!("invalid arguments for {}: {}", method, err);
    ErrorPayload::new(ErrorKind::ConfigError, message)
}

/// Like `serde_json::from_value`, but a missing argument object means defaults.
fn parse_args<T: DeserializeOwned + Default>(method: &str, args: Value) -> BridgeOutcome<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args).map_err(|e| bad_args(method, e))
}

fn to_json<T: Serialize>(value: T) -> BridgeOutcome<Value> {
    serde_json::to_value(value).map_err(|e| {
        ErrorPayload::new(ErrorKind::InternalError, format!("failed to encode result: {}", e))
    })
}

impl BridgeFacade {
    /// Dispatch one host call by its camelCase method name.
    pub async fn invoke(&self, method: &str, args: Value) -> BridgeOutcome<Value> {
        tracing::debug!("invoke {}", method);
        match method {
            "configure" => {
                let request: ConfigureRequest = parse_args(method, args)?;
                self.configure(request)?;
                Ok(Value::Null)
            }
            "login" => to_json(self.login().await?),
            "acquireToken" => {
                let args: AcquireTokenArgs =
                    serde_json::from_value(args).map_err(|e| bad_args(method, e))?;
                to_json(self.acquire_token(args.scopes).await?)
            }
            "logout" => {
                self.logout().await?;
                Ok(Value::Null)
            }
            "isAuthenticated" => Ok(Value::Bool(self.is_authenticated())),
            "currentAccount" => to_json(self.current_account()),
            "userRoles" => to_json(self.user_roles()),
            "state" => to_json(self.state()),
            "cancel" => Ok(Value::Bool(self.cancel())),
            other => Err(ErrorPayload::new(
                ErrorKind::InternalError,
                format!("unknown method '{}'", other),
            )),
        }
    }

    /// Handle one line-delimited request frame.
    pub async fn handle_frame(&self, frame: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(frame) {
            Ok(request) => {
                let outcome = self.invoke(&request.method, request.args).await;
                RpcResponse::new(request.id, outcome)
            }
            Err(e) => RpcResponse::new(
                Value::Null,
                Err(ErrorPayload::new(
                    ErrorKind::InternalError,
                    format!("malformed request: {}", e),
                )),
            ),
        }
    }
}
