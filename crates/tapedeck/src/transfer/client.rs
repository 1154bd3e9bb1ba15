//! SSH/SFTP delivery of a single file.
//!
//! `ssh2` is a blocking library, so each upload runs on the blocking pool.
//! Mid-upload cancellation is not supported; an upload completes or errors.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::destination::{Destination, DestinationError};

/// Key files tried, in order, inside the key directory.
pub const KEY_FILE_ORDER: [&str; 4] = ["id_ed25519", "ssh_key", "id_rsa", "id_ecdsa"];

const CHUNK_SIZE: usize = 64 * 1024;

/// Called with (bytes transferred, total bytes).
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Coarse failure class used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Bad input; retrying cannot help.
    Validation,
    AuthOrConnection,
    Protocol,
    Unexpected,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    InvalidDestination(#[from] DestinationError),

    #[error("local file {0} not found")]
    LocalFileMissing(PathBuf),

    #[error("no usable SSH key in {key_dir} and no password configured for {host}")]
    NoCredentials { host: String, key_dir: PathBuf },

    #[error("connection to {host}:{port} failed: {message}")]
    Connection {
        host: String,
        port: u16,
        message: String,
    },

    #[error("authentication as {user}@{host} failed: {message}")]
    Authentication {
        host: String,
        user: String,
        message: String,
    },

    #[error("SFTP error on {host}:{remote_path} after {bytes_transferred} bytes: {message}")]
    Protocol {
        host: String,
        remote_path: String,
        bytes_transferred: u64,
        message: String,
    },

    #[error("unexpected error sending to {host}:{remote_path} after {bytes_transferred} bytes: {message}")]
    Unexpected {
        host: String,
        remote_path: String,
        bytes_transferred: u64,
        message: String,
    },
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::InvalidDestination(_)
            | TransferError::LocalFileMissing(_)
            | TransferError::NoCredentials { .. } => FailureKind::Validation,
            TransferError::Connection { .. } | TransferError::Authentication { .. } => {
                FailureKind::AuthOrConnection
            }
            TransferError::Protocol { .. } => FailureKind::Protocol,
            TransferError::Unexpected { .. } => FailureKind::Unexpected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub remote_path: String,
    pub bytes: u64,
    pub removed_local: bool,
}

/// Delivers one local file to a remote destination.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn upload(
        &self,
        local: &Path,
        destination: &Destination,
        progress: Option<ProgressFn>,
    ) -> Result<UploadReport, TransferError>;

    /// Connect, authenticate and disconnect.
    async fn test_connection(&self, destination: &Destination) -> Result<(), TransferError>;
}

/// Where credentials come from.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub key_dir: PathBuf,
    pub password: Option<String>,
}

impl Credentials {
    /// Existing key files in [`KEY_FILE_ORDER`].
    pub fn available_keys(&self) -> Vec<PathBuf> {
        KEY_FILE_ORDER
            .iter()
            .map(|name| self.key_dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    fn check(&self, host: &str) -> Result<Vec<PathBuf>, TransferError> {
        let keys = self.available_keys();
        if keys.is_empty() && self.password.is_none() {
            return Err(TransferError::NoCredentials {
                host: host.to_string(),
                key_dir: self.key_dir.clone(),
            });
        }
        Ok(keys)
    }
}

pub struct SshTransferClient {
    credentials: Credentials,
    timeout: Duration,
    cleanup_after_transfer: bool,
}

impl SshTransferClient {
    pub fn new(credentials: Credentials, timeout: Duration, cleanup_after_transfer: bool) -> Self {
        Self {
            credentials,
            timeout,
            cleanup_after_transfer,
        }
    }

    pub fn from_config(config: &tapeconf::TapeConfig) -> Self {
        Self::new(
            Credentials {
                key_dir: config.infra.paths.ssh_key_dir.clone(),
                password: config.defaults.transfer.ssh_password.clone(),
            },
            config.defaults.transfer.connect_timeout(),
            config.defaults.transfer.cleanup_after_transfer,
        )
    }
}

#[async_trait]
impl TransferClient for SshTransferClient {
    async fn upload(
        &self,
        local: &Path,
        destination: &Destination,
        progress: Option<ProgressFn>,
    ) -> Result<UploadReport, TransferError> {
        if !tokio::fs::try_exists(local).await.unwrap_or(false) {
            return Err(TransferError::LocalFileMissing(local.to_path_buf()));
        }
        let keys = self.credentials.check(&destination.host)?;

        let job = UploadJob {
            local: local.to_path_buf(),
            destination: destination.clone(),
            remote_path: destination.remote_path_for(local),
            keys,
            password: self.credentials.password.clone(),
            timeout: self.timeout,
            progress,
        };
        let remote_path = job.remote_path.clone();
        let host = destination.host.clone();

        let bytes = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| TransferError::Unexpected {
                host,
                remote_path: remote_path.clone(),
                bytes_transferred: 0,
                message: format!("upload task panicked: {}", e),
            })??;

        let mut removed_local = false;
        if self.cleanup_after_transfer {
            match tokio::fs::remove_file(local).await {
                Ok(()) => removed_local = true,
                Err(e) => tracing::warn!(
                    local = %local.display(),
                    error = %e,
                    "Uploaded but could not remove local file"
                ),
            }
        }

        tracing::info!(
            local = %local.display(),
            destination = %destination,
            remote_path = %remote_path,
            bytes,
            removed_local,
            "Upload verified"
        );
        Ok(UploadReport {
            remote_path,
            bytes,
            removed_local,
        })
    }

    async fn test_connection(&self, destination: &Destination) -> Result<(), TransferError> {
        let keys = self.credentials.check(&destination.host)?;
        let destination = destination.clone();
        let password = self.credentials.password.clone();
        let timeout = self.timeout;
        let host = destination.host.clone();

        tokio::task::spawn_blocking(move || -> Result<(), TransferError> {
            let session = connect(&destination, &keys, password.as_deref(), timeout)?;
            let _ = session.disconnect(None, "connection test", None);
            Ok(())
        })
        .await
        .map_err(|e| TransferError::Unexpected {
            host,
            remote_path: String::new(),
            bytes_transferred: 0,
            message: format!("connection test panicked: {}", e),
        })?
    }
}

struct UploadJob {
    local: PathBuf,
    destination: Destination,
    remote_path: String,
    keys: Vec<PathBuf>,
    password: Option<String>,
    timeout: Duration,
    progress: Option<ProgressFn>,
}

impl UploadJob {
    fn run(self) -> Result<u64, TransferError> {
        let session = connect(&self.destination, &self.keys, self.password.as_deref(), self.timeout)?;
        let mut sent = 0u64;
        let result = self.send(&session, &mut sent);
        let _ = session.disconnect(None, "upload finished", None);
        result
    }

    fn send(&self, session: &ssh2::Session, sent: &mut u64) -> Result<u64, TransferError> {
        let protocol = |sent: u64, e: &dyn std::fmt::Display| TransferError::Protocol {
            host: self.destination.host.clone(),
            remote_path: self.remote_path.clone(),
            bytes_transferred: sent,
            message: e.to_string(),
        };
        let unexpected = |sent: u64, e: &dyn std::fmt::Display| TransferError::Unexpected {
            host: self.destination.host.clone(),
            remote_path: self.remote_path.clone(),
            bytes_transferred: sent,
            message: e.to_string(),
        };

        let sftp = session.sftp().map_err(|e| protocol(0, &e))?;
        let remote = Path::new(&self.remote_path);
        if let Some(parent) = remote.parent() {
            ensure_remote_dirs(&sftp, parent);
        }

        let mut file = std::fs::File::open(&self.local).map_err(|e| unexpected(0, &e))?;
        let total = file.metadata().map_err(|e| unexpected(0, &e))?.len();
        let mut remote_file = sftp.create(remote).map_err(|e| protocol(0, &e))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(|e| unexpected(*sent, &e))?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buf[..n])
                .map_err(|e| protocol(*sent, &e))?;
            *sent += n as u64;
            if let Some(progress) = &self.progress {
                progress(*sent, total);
            }
        }
        remote_file.flush().map_err(|e| protocol(*sent, &e))?;
        drop(remote_file);

        let remote_size = sftp
            .stat(remote)
            .map_err(|e| protocol(*sent, &e))?
            .size
            .unwrap_or(0);
        if remote_size != total {
            return Err(protocol(
                *sent,
                &format!("size mismatch after upload: remote {} vs local {}", remote_size, total),
            ));
        }
        Ok(total)
    }
}

/// Create missing parents, walking down from the root. Best effort: a
/// failure here shows up as a create error on the file itself.
fn ensure_remote_dirs(sftp: &ssh2::Sftp, dir: &Path) {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        if sftp.stat(&current).is_err() {
            if let Err(e) = sftp.mkdir(&current, 0o755) {
                tracing::debug!(dir = %current.display(), error = %e, "Remote mkdir failed");
            }
        }
    }
}

fn connect(
    destination: &Destination,
    keys: &[PathBuf],
    password: Option<&str>,
    timeout: Duration,
) -> Result<ssh2::Session, TransferError> {
    let connection = |message: String| TransferError::Connection {
        host: destination.host.clone(),
        port: destination.port,
        message,
    };

    let addr = (destination.host.as_str(), destination.port)
        .to_socket_addrs()
        .map_err(|e| connection(format!("resolve failed: {}", e)))?
        .next()
        .ok_or_else(|| connection("host resolved to no addresses".to_string()))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| connection(e.to_string()))?;
    let _ = tcp.set_read_timeout(Some(timeout));
    let _ = tcp.set_write_timeout(Some(timeout));

    let mut session = ssh2::Session::new().map_err(|e| connection(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| connection(format!("handshake: {}", e)))?;

    let mut last_error = String::from("no credentials tried");
    for key in keys {
        match session.userauth_pubkey_file(&destination.user, None, key, None) {
            Ok(()) if session.authenticated() => {
                tracing::debug!(host = %destination.host, key = %key.display(), "Authenticated with key");
                return Ok(session);
            }
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(key = %key.display(), error = %e, "Key rejected");
                last_error = format!("{}: {}", key.display(), e);
            }
        }
    }

    if let Some(password) = password {
        match session.userauth_password(&destination.user, password) {
            Ok(()) if session.authenticated() => return Ok(session),
            Ok(()) => last_error = "password not accepted".to_string(),
            Err(e) => last_error = format!("password: {}", e),
        }
    }

    Err(TransferError::Authentication {
        host: destination.host.clone(),
        user: destination.user.clone(),
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("id_rsa"), "k").unwrap();
        std::fs::write(dir.path().join("id_ed25519"), "k").unwrap();
        std::fs::write(dir.path().join("unrelated"), "k").unwrap();

        let creds = Credentials {
            key_dir: dir.path().to_path_buf(),
            password: None,
        };
        let keys = creds.available_keys();
        assert_eq!(
            keys,
            vec![dir.path().join("id_ed25519"), dir.path().join("id_rsa")]
        );
    }

    #[tokio::test]
    async fn test_no_credentials_fails_before_connecting() {
        let keys = TempDir::new().unwrap();
        let files = TempDir::new().unwrap();
        let local = files.path().join("a.mp3");
        std::fs::write(&local, b"audio").unwrap();

        let client = SshTransferClient::new(
            Credentials {
                key_dir: keys.path().to_path_buf(),
                password: None,
            },
            Duration::from_secs(1),
            true,
        );
        // unroutable host: any connection attempt would time out, not fail fast
        let dest = Destination::parse("rec@203.0.113.1:/in/").unwrap();
        let err = client.upload(&local, &dest, None).await.unwrap_err();
        assert!(matches!(err, TransferError::NoCredentials { .. }));
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(local.exists());
    }

    #[tokio::test]
    async fn test_refused_connection_keeps_local_file() {
        let files = TempDir::new().unwrap();
        let local = files.path().join("a.mp3");
        std::fs::write(&local, b"audio").unwrap();

        // grab a free port, then close it so the connect is refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = SshTransferClient::new(
            Credentials {
                key_dir: files.path().join("nokeys"),
                password: Some("pw".to_string()),
            },
            Duration::from_secs(2),
            true,
        );
        let dest = Destination::parse(&format!("rec@127.0.0.1:{}:/in/", port)).unwrap();
        let err = client.upload(&local, &dest, None).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::AuthOrConnection);
        assert!(local.exists());
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let client = SshTransferClient::new(
            Credentials {
                key_dir: PathBuf::from("/nonexistent"),
                password: Some("pw".to_string()),
            },
            Duration::from_secs(1),
            true,
        );
        let dest = Destination::parse("rec@localhost:/in/").unwrap();
        let err = client
            .upload(Path::new("/nonexistent/a.mp3"), &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::LocalFileMissing(_)));
    }
}
