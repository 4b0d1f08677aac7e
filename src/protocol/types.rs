//! Request and response bodies

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// File name → contents. Contents travel base64 encoded.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Successful signing response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateResponse {
    /// Authenticated username
    pub username: String,
    /// Granted role
    pub role: String,
    /// Files for the first context (`ca.pem`, `<user>.pem`)
    #[serde(default, with = "base64_files")]
    pub files: FileMap,
    /// API server URLs of the first context, sorted
    #[serde(default, deserialize_with = "null_as_default")]
    pub addresses: Vec<String>,
    /// Customer segment of the role
    pub customer: String,
    /// Environment segment of the role
    pub environment: String,
    /// Namespace segment of the role
    pub namespace: String,
    /// One entry per signing context of the environment
    #[serde(default, deserialize_with = "null_as_default")]
    pub contexts: Vec<Context>,
}

/// Credentials and clusters for one signing context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// `ca.pem` and `<user>.pem`
    #[serde(default, with = "base64_files")]
    pub files: FileMap,
    /// Cluster name → API server URL
    #[serde(default, deserialize_with = "null_as_default")]
    pub clusters: BTreeMap<String, String>,
}

/// Role enumeration response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolesResponse {
    /// Authenticated username
    pub user: String,
    /// Role group names the user is a (possibly nested) member of
    #[serde(default, deserialize_with = "null_as_default")]
    pub roles: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_files {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error, ser::SerializeMap};

    use super::FileMap;

    pub fn serialize<S: Serializer>(files: &FileMap, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(files.len()))?;
        for (name, contents) in files {
            map.serialize_entry(name, &STANDARD.encode(contents))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FileMap, D::Error> {
        let encoded = Option::<std::collections::BTreeMap<String, String>>::deserialize(deserializer)?
            .unwrap_or_default();
        encoded
            .into_iter()
            .map(|(name, value)| {
                STANDARD
                    .decode(value.as_bytes())
                    .map(|contents| (name.clone(), contents))
                    .map_err(|e| D::Error::custom(format!("file {name:?}: {e}")))
            })
            .collect()
    }
}
