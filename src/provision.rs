//! Device provisioning against the ThingsBoard REST API.

use crate::error::{ProvisionError, StoreError};
use crate::store::{Device, DeviceStore};
use crate::utils::{device_name, device_seq_no};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const LOGIN_PATH: &str = "/api/auth/login";
const DEVICE_PATH: &str = "/api/device";
const TENANT_DEVICES_PATH: &str = "/api/tenant/devices";
const AUTH_HEADER: &str = "X-Authorization";

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
struct SaveDeviceRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    device_type: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityId {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TbDevice {
    #[serde(default)]
    additional_info: Value,
    #[serde(default)]
    id: EntityId,
    #[serde(default)]
    label: Option<String>,
    #[serde(rename = "type", default)]
    device_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Credentials {
    #[serde(default)]
    credentials_id: String,
}

/// Tenant session on a ThingsBoard server
pub struct TenantClient {
    base_url: String,
    username: String,
    password: String,
    jwt: Option<String>,
    http: reqwest::Client,
}

impl TenantClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            jwt: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange the tenant credentials for a JWT.
    pub async fn login(&mut self) -> Result<(), ProvisionError> {
        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisionError::LoginRejected(self.username.clone()));
        }
        let token: TokenResponse = response.json().await?;
        self.jwt = Some(format!("Bearer {}", token.token));
        info!("logged in to {} as {}", self.base_url, self.username);
        Ok(())
    }

    /// Look a device up by name; `None` when the tenant has no such device.
    pub async fn find_device(&self, name: &str) -> Result<Option<Device>, ProvisionError> {
        let url = format!("{}{}", self.base_url, TENANT_DEVICES_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[("deviceName", name)])
            .header(AUTH_HEADER, self.jwt()?)
            .send()
            .await?;

        let found: TbDevice = match handle_response(response).await {
            Ok(found) => found,
            Err(ProvisionError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        if found.id.id.is_empty() {
            return Ok(None);
        }
        Ok(Some(to_device(name, found)?))
    }

    /// Create `device` on the server and fill in the id it was given.
    pub async fn create_device(&self, device: &mut Device) -> Result<(), ProvisionError> {
        let url = format!("{}{}", self.base_url, DEVICE_PATH);
        let response = self
            .http
            .post(&url)
            .header(AUTH_HEADER, self.jwt()?)
            .json(&SaveDeviceRequest {
                name: &device.name,
                device_type: &device.device_type,
            })
            .send()
            .await?;

        let body = response.text().await?;
        let created = serde_json::from_str::<TbDevice>(&body)
            .ok()
            .filter(|d| !d.id.id.is_empty())
            .ok_or_else(|| ProvisionError::CreateFailed {
                name: device.name.clone(),
                body: body.clone(),
            })?;

        device.id = created.id.id;
        device.additional_info = created.additional_info;
        device.label = created.label.unwrap_or_default();
        debug!("created device[{}] with id {}", device.name, device.id);
        Ok(())
    }

    /// Access token the device authenticates with over MQTT
    pub async fn device_token(&self, device_id: &str) -> Result<String, ProvisionError> {
        let url = format!("{}{}/{}/credentials", self.base_url, DEVICE_PATH, device_id);
        let response = self
            .http
            .get(&url)
            .header(AUTH_HEADER, self.jwt()?)
            .send()
            .await?;

        let credentials: Credentials = handle_response(response).await?;
        if credentials.credentials_id.is_empty() {
            return Err(ProvisionError::EmptyAuthToken(device_id.to_string()));
        }
        Ok(credentials.credentials_id)
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<(), ProvisionError> {
        let url = format!("{}{}/{}", self.base_url, DEVICE_PATH, device_id);
        let response = self
            .http
            .delete(&url)
            .header(AUTH_HEADER, self.jwt()?)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProvisionError::NotFound);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProvisionError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn jwt(&self) -> Result<&str, ProvisionError> {
        self.jwt.as_deref().ok_or(ProvisionError::NotLoggedIn)
    }
}

async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ProvisionError> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(ProvisionError::NotFound);
    }

    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ProvisionError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let body = response.json().await?;
    Ok(body)
}

fn to_device(name: &str, found: TbDevice) -> Result<Device, ProvisionError> {
    let seq_no =
        device_seq_no(name).ok_or_else(|| ProvisionError::BadDeviceName(name.to_string()))?;
    Ok(Device {
        id: found.id.id,
        name: name.to_string(),
        device_type: found.device_type,
        additional_info: found.additional_info,
        label: found.label.unwrap_or_default(),
        auth_token: String::new(),
        seq_no,
    })
}

/// Make sure devices `0..device_num` exist on the server and in the store.
///
/// Devices that already exist are reused, so a partial `init` can be repeated.
///
/// ## Returns
/// Number of devices saved to the store
pub async fn provision_devices(
    client: &TenantClient,
    store: &mut DeviceStore,
    device_num: usize,
) -> Result<usize, ProvisionError> {
    for index in 0..device_num {
        let name = device_name(index);
        let mut device = match client.find_device(&name).await? {
            Some(existing) => {
                debug!("device[{}] already exists", name);
                existing
            }
            None => {
                let mut device = Device::new(&name, index);
                client.create_device(&mut device).await?;
                info!("created device[{}]", name);
                device
            }
        };
        device.auth_token = client.device_token(&device.id).await?;
        store.save_device(&device)?;
    }
    Ok(device_num)
}

/// Delete every device recorded by the last `init`, then remove the store.
///
/// ## Returns
/// Number of devices deleted on the server
pub async fn clean_devices(
    client: &TenantClient,
    store: DeviceStore,
) -> Result<usize, ProvisionError> {
    let device_num = store.init_info()?.device_num;
    let mut deleted = 0;

    for index in 0..device_num {
        let name = device_name(index);
        let device = match store.get_device(&name) {
            Ok(device) => device,
            Err(StoreError::DeviceNotFound(_)) => {
                warn!("device[{}] not in store, skipping", name);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match client.delete_device(&device.id).await {
            Ok(()) => {
                deleted += 1;
                info!("deleted device[{}]", name);
            }
            Err(ProvisionError::NotFound) => warn!("device[{}] already gone from server", name),
            Err(e) => return Err(e),
        }
    }

    store.drop_store()?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_is_trimmed() {
        let client = TenantClient::new("http://localhost:8080/", "u", "p");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert!(matches!(client.jwt(), Err(ProvisionError::NotLoggedIn)));
    }

    #[test]
    fn test_tb_device_conversion() {
        let found: TbDevice = serde_json::from_value(json!({
            "id": {"id": "784f394c-42b6-435a-983c-b7beff2784f9", "entityType": "DEVICE"},
            "createdTime": 1609459200000i64,
            "additionalInfo": null,
            "label": null,
            "name": "_tbload_device_5",
            "type": "default"
        }))
        .unwrap();

        let device = to_device("_tbload_device_5", found).unwrap();
        assert_eq!(device.id, "784f394c-42b6-435a-983c-b7beff2784f9");
        assert_eq!(device.seq_no, 5);
        assert_eq!(device.device_type, "default");
        assert_eq!(device.label, "");
        assert!(device.auth_token.is_empty());
    }

    #[test]
    fn test_bad_device_name() {
        let found: TbDevice = serde_json::from_value(json!({"id": {"id": "x"}})).unwrap();
        assert!(matches!(
            to_device("thermostat", found),
            Err(ProvisionError::BadDeviceName(_))
        ));
    }
}
