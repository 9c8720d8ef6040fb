//! Transport files: how a client finds the kernel serving an input file.
//!
//! The kernel writes `{"port": .., "secret": ..}` (or `{"path": ..,
//! "secret": ..}` for a local socket) to a file in the runtime directory
//! named after a hash of the input path. The file doubles as a coarse lock:
//! at most one live kernel per input.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KernelError;

/// Length of the hex key used as transport file name.
pub const KEY_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportAddress {
    Tcp { port: u16 },
    Local { path: PathBuf },
}

/// Contents of a transport file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelTransport {
    #[serde(flatten)]
    pub address: TransportAddress,
    pub secret: String,
}

impl KernelTransport {
    pub fn tcp(port: u16, secret: impl Into<String>) -> Self {
        Self {
            address: TransportAddress::Tcp { port },
            secret: secret.into(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.secret.is_empty() {
            return Err("missing secret".to_string());
        }
        match &self.address {
            TransportAddress::Tcp { port: 0 } => Err("invalid port 0".to_string()),
            TransportAddress::Local { path } if path.as_os_str().is_empty() => {
                Err("empty socket path".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Key identifying the kernel for `input`: the first 20 hex chars of the
/// SHA-256 of its canonical path.
pub fn transport_key(input: &Path) -> String {
    let path = fs::canonicalize(input)
        .or_else(|_| std::path::absolute(input))
        .unwrap_or_else(|_| input.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let mut key = hex::encode(hasher.finalize());
    key.truncate(KEY_LEN);
    key
}

/// Path of the transport file for `input` under `runtime_dir`.
pub fn transport_file(runtime_dir: &Path, input: &Path) -> PathBuf {
    runtime_dir.join(transport_key(input))
}

/// Read a transport file.
///
/// Returns `Ok(None)` if there is none. A malformed file is removed and
/// treated as absent.
pub fn read_transport_file(path: &Path) -> Result<Option<KernelTransport>, KernelError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let parsed = serde_json::from_str::<KernelTransport>(&contents)
        .map_err(|e| e.to_string())
        .and_then(|transport| transport.validate().map(|()| transport));
    match parsed {
        Ok(transport) => Ok(Some(transport)),
        Err(e) => {
            warn!(
                "[kernel-client] Invalid transport file {}: {} (removing file)",
                path.display(),
                e
            );
            remove_transport_file(path)?;
            Ok(None)
        }
    }
}

/// Write a transport file, readable by the current user only.
pub fn write_transport_file(path: &Path, transport: &KernelTransport) -> Result<(), KernelError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string(transport)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Remove a transport file; a missing file is not an error.
pub fn remove_transport_file(path: &Path) -> Result<(), KernelError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("[kernel-client] Removed transport file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_is_stable_and_short() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("doc.qmd");
        fs::write(&input, "x").unwrap();

        let key = transport_key(&input);
        assert_eq!(key.len(), KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, transport_key(&temp.path().join(".").join("doc.qmd")));
        assert_ne!(key, transport_key(&temp.path().join("other.qmd")));
    }

    #[test]
    fn test_key_for_missing_file() {
        let key = transport_key(Path::new("does/not/exist.qmd"));
        assert_eq!(key.len(), KEY_LEN);
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("jt").join("abc");
        let transport = KernelTransport::tcp(4567, "s3cret");
        write_transport_file(&path, &transport).unwrap();

        assert_eq!(read_transport_file(&path).unwrap(), Some(transport));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"port": 4567, "secret": "s3cret"}));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_local_socket_transport() {
        let transport: KernelTransport =
            serde_json::from_str(r#"{"path": "/tmp/k.sock", "secret": "x"}"#).unwrap();
        assert_eq!(
            transport.address,
            TransportAddress::Local {
                path: PathBuf::from("/tmp/k.sock")
            }
        );
    }

    #[test]
    fn test_missing_file_is_none() {
        let temp = TempDir::new().unwrap();
        assert_eq!(read_transport_file(&temp.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_malformed_file_is_removed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad");
        fs::write(&path, r#"{"port": 1234}"#).unwrap();
        assert_eq!(read_transport_file(&path).unwrap(), None);
        assert!(!path.exists());

        fs::write(&path, r#"{"port": 1234, "secret": ""}"#).unwrap();
        assert_eq!(read_transport_file(&path).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let temp = TempDir::new().unwrap();
        remove_transport_file(&temp.path().join("gone")).unwrap();
    }
}
