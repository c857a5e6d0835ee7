//! Device-plugin messages exchanged with the cluster node agent.
//!
//! The shapes follow the orchestrator's `v1beta1` device-plugin API: the
//! agent calls the plugin's service (options, list-and-watch, allocate,
//! pre-start) and the plugin calls the agent's registration service once at
//! startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Device-plugin API version this service implements.
pub const API_VERSION: &str = "v1beta1";

/// Default registration socket of the node agent.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Directory where device-plugin sockets live.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub health: Health,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePluginOptions {
    pub pre_start_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAndWatchResponse {
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAllocateRequest {
    #[serde(default)]
    pub devices_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRequest {
    #[serde(default)]
    pub container_requests: Vec<ContainerAllocateRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAllocateResponse {
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerAllocateResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreStartContainerRequest {
    #[serde(default)]
    pub devices_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreStartContainerResponse {}

/// Calls served by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PluginRequest {
    GetDevicePluginOptions,
    ListAndWatch,
    Allocate(AllocateRequest),
    PreStartContainer(PreStartContainerRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub version: String,
    /// File name of the plugin socket, relative to [`DEVICE_PLUGIN_PATH`].
    pub endpoint: String,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<DevicePluginOptions>,
}

/// Calls served by the node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RegistrationRequest {
    Register(RegisterRequest),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Envelope for every answer: `{"status":"ok","data":..}` or
/// `{"status":"error","message":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    Ok { data: T },
    Error { message: String },
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Reply::Ok { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Reply::Ok { data } => Ok(data),
            Reply::Error { message } => Err(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_request_wire_shape() {
        let raw = r#"{"method":"allocate","container_requests":[{"devices_ids":["pts3"]}]}"#;
        let request: PluginRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            request,
            PluginRequest::Allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["pts3".to_string()],
                }],
            })
        );
    }

    #[test]
    fn test_unit_requests() {
        let request: PluginRequest =
            serde_json::from_str(r#"{"method":"list_and_watch"}"#).unwrap();
        assert_eq!(request, PluginRequest::ListAndWatch);
        let request: PluginRequest =
            serde_json::from_str(r#"{"method":"get_device_plugin_options"}"#).unwrap();
        assert_eq!(request, PluginRequest::GetDevicePluginOptions);
    }

    #[test]
    fn test_reply_envelope() {
        let ok = serde_json::to_value(Reply::ok(DevicePluginOptions::default())).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({"status": "ok", "data": {"pre_start_required": false}})
        );

        let err: Reply<Empty> =
            serde_json::from_str(r#"{"status":"error","message":"no dev id provided"}"#).unwrap();
        assert_eq!(err.into_result(), Err("no dev id provided".to_string()));
    }

    #[test]
    fn test_register_request_wire_shape() {
        let request = RegistrationRequest::Register(RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: "hostpty.sock".to_string(),
            resource_name: "hostpty.dev/pty".to_string(),
            options: None,
        });
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            serde_json::json!({
                "method": "register",
                "version": "v1beta1",
                "endpoint": "hostpty.sock",
                "resource_name": "hostpty.dev/pty",
            })
        );
    }
}
