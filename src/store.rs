//! Local device store.
//!
//! A JSON object on disk mapping keys to values: provisioned devices under
//! their names, plus the init parameters and the last run summary under
//! reserved keys. The load run reads credentials from it through
//! [`CredentialProvider`].

use crate::error::StoreError;
use crate::results::Summary;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key holding the parameters of the last `init`
pub const KEY_INIT_INFO: &str = "_tbload_init_cmd_info";

/// Key holding the summary of the last run
pub const KEY_SUMMARY: &str = "_tbload_summary";

/// A device provisioned on the ThingsBoard server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub additional_info: Value,
    #[serde(default)]
    pub label: String,
    pub auth_token: String,
    pub seq_no: usize,
}

impl Device {
    /// Device not yet created on the server
    pub fn new(name: impl Into<String>, seq_no: usize) -> Self {
        Self {
            name: name.into(),
            device_type: "default".to_string(),
            seq_no,
            ..Default::default()
        }
    }
}

/// Parameters of the last `init`, reused by `clean`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitInfo {
    pub server_host: String,
    pub username: String,
    pub password: String,
    pub device_num: usize,
}

/// What a load run needs to impersonate one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub client_id: String,
    pub auth_token: String,
    pub seq_no: usize,
}

/// Source of device credentials for a load run
pub trait CredentialProvider {
    /// Number of devices provisioned, i.e. the valid sequence numbers
    fn provisioned_count(&self) -> Result<usize, StoreError>;

    fn credentials(&self, device_name: &str) -> Result<DeviceCredentials, StoreError>;
}

pub struct DeviceStore {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl DeviceStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_error(&path, e)),
        };
        debug!("opened store {} with {} entries", path.display(), entries.len());
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `value` under `key` and write the file.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.entries.insert(key.to_string(), value);
        self.persist()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.entries.get(key) {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// All keys and raw values in key order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn save_device(&mut self, device: &Device) -> Result<(), StoreError> {
        self.put(&device.name, device)
    }

    /// Load a device, rejecting records without a name, id or token
    pub fn get_device(&self, name: &str) -> Result<Device, StoreError> {
        let device: Device = self
            .get(name)?
            .ok_or_else(|| StoreError::DeviceNotFound(name.to_string()))?;

        let missing = if device.name.is_empty() {
            Some("name")
        } else if device.id.is_empty() {
            Some("id")
        } else if device.auth_token.is_empty() {
            Some("authToken")
        } else {
            None
        };
        match missing {
            Some(field) => Err(StoreError::IncompleteDevice {
                name: name.to_string(),
                field,
            }),
            None => Ok(device),
        }
    }

    pub fn save_init_info(&mut self, info: &InitInfo) -> Result<(), StoreError> {
        self.put(KEY_INIT_INFO, info)
    }

    pub fn init_info(&self) -> Result<InitInfo, StoreError> {
        self.get(KEY_INIT_INFO)?
            .ok_or(StoreError::MissingKey(KEY_INIT_INFO))
    }

    pub fn save_summary(&mut self, summary: &Summary) -> Result<(), StoreError> {
        self.put(KEY_SUMMARY, summary)
    }

    pub fn summary(&self) -> Result<Option<Summary>, StoreError> {
        self.get(KEY_SUMMARY)
    }

    /// Delete the store file.
    pub fn drop_store(self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, bytes).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}

impl CredentialProvider for DeviceStore {
    fn provisioned_count(&self) -> Result<usize, StoreError> {
        Ok(self.init_info()?.device_num)
    }

    fn credentials(&self, device_name: &str) -> Result<DeviceCredentials, StoreError> {
        let device = self.get_device(device_name)?;
        Ok(DeviceCredentials {
            client_id: device.name,
            auth_token: device.auth_token,
            seq_no: device.seq_no,
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(seq_no: usize) -> Device {
        Device {
            id: format!("id-{}", seq_no),
            auth_token: format!("token-{}", seq_no),
            ..Device::new(crate::utils::device_name(seq_no), seq_no)
        }
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = DeviceStore::open(dir.path().join("store.json")).unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.init_info(),
            Err(StoreError::MissingKey(KEY_INIT_INFO))
        ));
        assert!(store.summary().unwrap().is_none());
    }

    #[test]
    fn test_devices_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let mut store = DeviceStore::open(&path).unwrap();
        store.save_device(&device(0)).unwrap();
        store.save_device(&device(1)).unwrap();
        store
            .save_init_info(&InitInfo {
                server_host: "http://localhost:8080".to_string(),
                username: "tenant@thingsboard.org".to_string(),
                password: "tenant".to_string(),
                device_num: 2,
            })
            .unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let store = DeviceStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.get_device("_tbload_device_1").unwrap(), device(1));
        assert_eq!(store.provisioned_count().unwrap(), 2);

        let creds = store.credentials("_tbload_device_0").unwrap();
        assert_eq!(creds.client_id, "_tbload_device_0");
        assert_eq!(creds.auth_token, "token-0");
        assert_eq!(creds.seq_no, 0);

        let keys: Vec<&str> = store.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["_tbload_device_0", "_tbload_device_1", KEY_INIT_INFO]);
    }

    #[test]
    fn test_incomplete_device_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = DeviceStore::open(dir.path().join("store.json")).unwrap();
        let mut tokenless = device(3);
        tokenless.auth_token.clear();
        store.save_device(&tokenless).unwrap();

        match store.get_device("_tbload_device_3") {
            Err(StoreError::IncompleteDevice { field, .. }) => assert_eq!(field, "authToken"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            store.credentials("_tbload_device_9"),
            Err(StoreError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(DeviceStore::open(&path), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_drop_store_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        let mut store = DeviceStore::open(&path).unwrap();
        store.save_device(&device(0)).unwrap();
        assert!(path.exists());

        store.drop_store().unwrap();
        assert!(!path.exists());
        // dropping a store that was never written is fine
        DeviceStore::open(&path).unwrap().drop_store().unwrap();
    }
}
