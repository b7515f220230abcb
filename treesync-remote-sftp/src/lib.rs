//! SFTP transport for treesync, built on russh / russh-sftp.

mod ssh_client;
mod utils;

use crate::utils::{create_dir_all, map_sftp, map_transfer, remove_dir_all};
use async_trait::async_trait;
use russh::client::AuthResult;
use russh::keys::PrivateKeyWithHashAlg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use ssh_client::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use treesync_core::{ConnectionCfg, RemoteClient, RemoteConnector, RemoteEntry, RemoteError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Opens a fresh SSH connection and SFTP subsystem per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SftpConnector;

#[async_trait]
impl RemoteConnector for SftpConnector {
    async fn connect(&self, conn: &ConnectionCfg) -> Result<Box<dyn RemoteClient>, RemoteError> {
        let remote = SftpRemote::connect(conn).await?;
        Ok(Box::new(remote))
    }
}

pub struct SftpRemote {
    sftp: SftpSession,
    session: russh::client::Handle<Client>,
    permissive: bool,
}

impl SftpRemote {
    pub async fn connect(conn: &ConnectionCfg) -> Result<Self, RemoteError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, Self::open(conn)).await {
            Ok(res) => res,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    async fn open(conn: &ConnectionCfg) -> Result<Self, RemoteError> {
        let config = russh::client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = Client {
            host: conn.host.clone(),
            allowed_fingerprints: conn.host_fingerprints.clone(),
        };
        let mut session =
            russh::client::connect(Arc::new(config), (conn.host.as_str(), conn.port), handler)
                .await
                .map_err(connect_error)?;

        let res = match (&conn.key_path, &conn.password) {
            (Some(key_path), _) => {
                let key = russh::keys::load_secret_key(key_path, None).map_err(|e| {
                    RemoteError::Auth(format!("cannot load key {}: {e}", key_path.display()))
                })?;
                let hash = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(session_error)?
                    .flatten();
                session
                    .authenticate_publickey(
                        conn.user.as_str(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
            }
            (None, Some(password)) => {
                session
                    .authenticate_password(conn.user.as_str(), password.as_str())
                    .await
            }
            (None, None) => {
                return Err(RemoteError::Auth(
                    "neither ssh_key_path nor ssh_password is configured".into(),
                ))
            }
        }
        .map_err(session_error)?;
        if let AuthResult::Failure {
            remaining_methods,
            partial_success,
        } = res
        {
            return Err(RemoteError::Auth(format!(
                "server rejected {}, remaining_methods: {:?}, partial_success: {}",
                conn.user, remaining_methods, partial_success
            )));
        }

        let channel = session.channel_open_session().await.map_err(session_error)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(session_error)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| map_sftp(e, "<session>"))?;
        info!(host = %conn.host, port = conn.port, user = %conn.user, "sftp session open");
        Ok(Self {
            sftp,
            session,
            permissive: conn.permissive,
        })
    }
}

fn connect_error(e: anyhow::Error) -> RemoteError {
    match e.downcast_ref::<russh::Error>() {
        Some(russh::Error::UnknownKey) => RemoteError::Auth("host key rejected".into()),
        _ => RemoteError::Connection(format!("{e:#}")),
    }
}

fn session_error(e: russh::Error) -> RemoteError {
    RemoteError::Connection(e.to_string())
}

fn entry(name: String, attrs: &FileAttributes) -> RemoteEntry {
    RemoteEntry {
        name,
        is_dir: attrs.is_dir(),
        size: attrs.size.unwrap_or(0),
        mtime: attrs.mtime.map(u64::from).unwrap_or(0),
    }
}

#[async_trait]
impl RemoteClient for SftpRemote {
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>, RemoteError> {
        match self.sftp.metadata(path).await {
            Ok(attrs) => {
                let name = path.rsplit('/').next().unwrap_or_default().to_string();
                Ok(Some(entry(name, &attrs)))
            }
            Err(e) => match map_sftp(e, path) {
                RemoteError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn ensure_dir(&self, path: &str) -> Result<(), RemoteError> {
        create_dir_all(&self.sftp, path, self.permissive).await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let meta = tokio::fs::metadata(local).await?;
        let mut reader = tokio::fs::File::open(local).await?;
        let mut remote_file = self
            .sftp
            .create(remote)
            .await
            .map_err(|e| map_sftp(e, remote))?;
        let bytes = tokio::io::copy(&mut reader, &mut remote_file)
            .await
            .map_err(|e| map_transfer(e, remote))?;
        remote_file
            .shutdown()
            .await
            .map_err(|e| map_transfer(e, remote))?;

        let mut attrs = FileAttributes::empty();
        if let Some(mtime) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        {
            let secs = u32::try_from(mtime.as_secs()).unwrap_or(u32::MAX);
            attrs.mtime = Some(secs);
            attrs.atime = Some(secs);
        }
        if self.permissive {
            attrs.permissions = Some(0o777);
        }
        self.sftp
            .set_metadata(remote, attrs)
            .await
            .map_err(|e| map_sftp(e, remote))?;
        debug!(remote, bytes, "uploaded");
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp(e, path))
    }

    async fn delete_dir(&self, path: &str) -> Result<(), RemoteError> {
        remove_dir_all(&self.sftp, path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp(e, from))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp(e, path))?;
        Ok(entries
            .filter(|e| {
                let name = e.file_name();
                name != "." && name != ".."
            })
            .map(|e| entry(e.file_name(), &e.metadata()))
            .collect())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "treesync closing", "en")
            .await
            .map_err(session_error)
    }
}
