//! SSH/SFTP remote store.
//!
//! Opens one SSH session (`russh`), requests the `sftp` subsystem on a
//! session channel and drives it with `russh-sftp`. Remote paths are taken
//! relative to the target's base directory.
//!
//! Authentication: password if one is given, otherwise every identity offered
//! by the SSH agent (`SSH_AUTH_SOCK`) in turn.

use super::{
    Capacity, OpenMode, RemoteEntry, RemoteError, RemoteFile, RemoteKind, RemoteResult,
    RemoteStore,
};
use crate::path;
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PublicKey};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const DEFAULT_PORT: u16 = 22;
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;

/// Where to connect: parsed from `sftp://[user@]host[:port][/path]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Remote directory exported as the mount root.
    pub base: String,
}

impl SftpTarget {
    /// Parses an `sftp://` URL. The user defaults to the local login name.
    pub fn parse(url: &str) -> Result<Self, RemoteError> {
        let parsed =
            url::Url::parse(url).map_err(|e| RemoteError::Protocol(format!("{url}: {e}")))?;
        if parsed.scheme() != "sftp" {
            return Err(RemoteError::Protocol(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RemoteError::Protocol(format!("{url}: missing host")))?
            .to_string();
        let username = if parsed.username().is_empty() {
            whoami::username()
        } else {
            parsed.username().to_string()
        };
        Ok(Self {
            host,
            port: parsed.port().unwrap_or(DEFAULT_PORT),
            username,
            base: path::normalize(parsed.path()),
        })
    }
}

/// Credentials for the SSH session.
#[derive(Clone)]
pub enum SftpAuth {
    /// Wiped from memory when dropped.
    Password(Zeroizing<String>),
    Agent,
}

impl std::fmt::Debug for SftpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SftpAuth::Password(_) => f.write_str("Password(..)"),
            SftpAuth::Agent => f.write_str("Agent"),
        }
    }
}

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against ~/.ssh/known_hosts instead of trusting on first use.
        warn!(
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting server key without verification"
        );
        Ok(true)
    }
}

/// Remote store speaking SFTP over an SSH session.
pub struct SftpStore {
    target: SftpTarget,
    session: Handle<ClientHandler>,
    sftp: SftpSession,
}

fn connect_err(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        e.to_string(),
    ))
}

fn map_err(path: &str, e: SftpError) -> RemoteError {
    match e {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => RemoteError::NotFound(path.to_string()),
            StatusCode::OpUnsupported => RemoteError::Unsupported("sftp operation"),
            _ => RemoteError::Protocol(format!("{path}: {}", status.error_message)),
        },
        SftpError::IO(msg) => RemoteError::Io(io::Error::other(msg)),
        other => RemoteError::Protocol(format!("{path}: {other}")),
    }
}

fn kind_of(attrs: &FileAttributes) -> RemoteKind {
    if attrs.is_dir() {
        RemoteKind::Directory
    } else if attrs.is_symlink() {
        RemoteKind::Symlink
    } else {
        RemoteKind::File
    }
}

fn entry_from_attrs(name: String, attrs: &FileAttributes) -> RemoteEntry {
    let kind = kind_of(attrs);
    RemoteEntry {
        name,
        kind,
        size: if kind == RemoteKind::Directory {
            0
        } else {
            attrs.size.unwrap_or(0)
        },
        perm: attrs.permissions.map(|p| p & 0o7777),
        mtime: attrs.modified().ok(),
    }
}

impl SftpStore {
    /// Connects, authenticates and starts the SFTP subsystem.
    pub async fn connect(target: SftpTarget, auth: SftpAuth) -> RemoteResult<Self> {
        let config = Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..<_>::default()
        };
        let addr = (target.host.as_str(), target.port);
        let mut session = client::connect(Arc::new(config), addr, ClientHandler)
            .await
            .map_err(connect_err)?;
        info!(host = %target.host, port = target.port, "Connected, authenticating");

        let authenticated = match &auth {
            SftpAuth::Password(password) => session
                .authenticate_password(&target.username, password.as_str())
                .await
                .map_err(connect_err)?
                .success(),
            SftpAuth::Agent => authenticate_with_agent(&mut session, &target.username).await?,
        };
        if !authenticated {
            return Err(RemoteError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("authentication failed for {}", target.username),
            )));
        }

        let channel = session.channel_open_session().await.map_err(connect_err)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(connect_err)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_err("/", e))?;
        info!(user = %target.username, base = %target.base, "SFTP session ready");

        Ok(Self {
            target,
            session,
            sftp,
        })
    }

    fn remote(&self, p: &str) -> String {
        if path::is_root(p) {
            self.target.base.clone()
        } else {
            path::join(&self.target.base, path::normalize(p).trim_start_matches('/'))
        }
    }
}

async fn authenticate_with_agent(
    session: &mut Handle<ClientHandler>,
    username: &str,
) -> RemoteResult<bool> {
    let mut agent = AgentClient::connect_env().await.map_err(connect_err)?;
    let keys = agent.request_identities().await.map_err(connect_err)?;
    info!(count = keys.len(), "Found keys in SSH agent");
    for key in keys {
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        match session
            .authenticate_publickey_with(username, key.clone(), hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => debug!(key = %key.fingerprint(HashAlg::Sha256), "Key rejected"),
            Err(e) => warn!(error = %e, "Agent authentication error"),
        }
    }
    Ok(false)
}

#[async_trait]
impl RemoteStore for SftpStore {
    fn describe(&self) -> String {
        format!(
            "sftp://{}@{}:{}{}",
            self.target.username, self.target.host, self.target.port, self.target.base
        )
    }

    async fn stat(&self, p: &str) -> RemoteResult<RemoteEntry> {
        let attrs = self
            .sftp
            .symlink_metadata(self.remote(p))
            .await
            .map_err(|e| map_err(p, e))?;
        let name = path::split_last(p)
            .map(|(_, n)| n.to_string())
            .unwrap_or_default();
        Ok(entry_from_attrs(name, &attrs))
    }

    async fn list(&self, p: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let dir = self
            .sftp
            .read_dir(self.remote(p))
            .await
            .map_err(|e| map_err(p, e))?;
        Ok(dir
            .filter(|e| e.file_name() != "." && e.file_name() != "..")
            .map(|e| entry_from_attrs(e.file_name(), &e.metadata()))
            .collect())
    }

    async fn create_file(&self, p: &str) -> RemoteResult<()> {
        let flags = OpenFlags::CREATE | OpenFlags::EXCLUDE | OpenFlags::WRITE;
        let mut file = self
            .sftp
            .open_with_flags(self.remote(p), flags)
            .await
            .map_err(|e| map_err(p, e))?;
        file.shutdown().await?;
        Ok(())
    }

    async fn remove_file(&self, p: &str) -> RemoteResult<()> {
        self.sftp
            .remove_file(self.remote(p))
            .await
            .map_err(|e| map_err(p, e))
    }

    async fn create_dir(&self, p: &str) -> RemoteResult<()> {
        self.sftp
            .create_dir(self.remote(p))
            .await
            .map_err(|e| map_err(p, e))
    }

    async fn remove_dir(&self, p: &str) -> RemoteResult<()> {
        self.sftp
            .remove_dir(self.remote(p))
            .await
            .map_err(|e| map_err(p, e))
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        if self
            .sftp
            .try_exists(self.remote(to))
            .await
            .map_err(|e| map_err(to, e))?
        {
            return Err(RemoteError::AlreadyExists(to.to_string()));
        }
        self.sftp
            .rename(self.remote(from), self.remote(to))
            .await
            .map_err(|e| map_err(from, e))
    }

    async fn open(&self, p: &str, mode: OpenMode) -> RemoteResult<Box<dyn RemoteFile>> {
        let flags = match mode {
            OpenMode::Read => OpenFlags::READ,
            OpenMode::ReadWrite => OpenFlags::READ | OpenFlags::WRITE,
        };
        let file = self
            .sftp
            .open_with_flags(self.remote(p), flags)
            .await
            .map_err(|e| map_err(p, e))?;
        Ok(Box::new(SftpFile {
            file: Mutex::new(file),
        }))
    }

    async fn truncate(&self, p: &str, size: u64) -> RemoteResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.size = Some(size);
        self.sftp
            .set_metadata(self.remote(p), attrs)
            .await
            .map_err(|e| map_err(p, e))
    }

    async fn symlink(&self, target: &str, p: &str) -> RemoteResult<()> {
        self.sftp
            .symlink(self.remote(p), target)
            .await
            .map_err(|e| map_err(p, e))
    }

    async fn read_link(&self, p: &str) -> RemoteResult<String> {
        self.sftp
            .read_link(self.remote(p))
            .await
            .map_err(|e| map_err(p, e))
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn capacity(&self, p: &str) -> RemoteResult<Option<Capacity>> {
        // Servers without the statvfs extension report Ok(None).
        let info = match self.sftp.fs_info(self.remote(p)).await {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "statvfs extension failed");
                None
            }
        };
        Ok(info.map(|s| Capacity {
            block_size: s.block_size as u32,
            fragment_size: s.fragment_size as u32,
            blocks: s.blocks,
            blocks_free: s.blocks_free,
            blocks_available: s.blocks_avail,
            files: s.inodes,
            files_free: s.inodes_free,
            files_available: s.inodes_avail,
            name_max: s.name_max as u32,
        }))
    }

    async fn close(&self) -> RemoteResult<()> {
        if let Err(e) = self.sftp.close().await {
            debug!(error = %e, "SFTP close failed");
        }
        self.session
            .disconnect(russh::Disconnect::ByApplication, "unmount", "en")
            .await
            .map_err(connect_err)?;
        info!(host = %self.target.host, "SSH session closed");
        Ok(())
    }
}

struct SftpFile {
    file: Mutex<russh_sftp::client::fs::File>,
}

#[async_trait]
impl RemoteFile for SftpFile {
    async fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> RemoteResult<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    async fn close(&self) -> RemoteResult<()> {
        let mut file = self.file.lock().await;
        file.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let t = SftpTarget::parse("sftp://alice@example.com:2222/srv/data").unwrap();
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 2222);
        assert_eq!(t.username, "alice");
        assert_eq!(t.base, "/srv/data");
    }

    #[test]
    fn test_parse_defaults() {
        let t = SftpTarget::parse("sftp://example.com").unwrap();
        assert_eq!(t.port, DEFAULT_PORT);
        assert_eq!(t.base, "/");
        assert!(!t.username.is_empty());
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(SftpTarget::parse("ssh://example.com/").is_err());
        assert!(SftpTarget::parse("not a url").is_err());
    }

    #[test]
    fn test_auth_debug_hides_password() {
        let shown = format!("{:?}", SftpAuth::Password(Zeroizing::new("hunter2".into())));
        assert!(!shown.contains("hunter2"));
    }
}
