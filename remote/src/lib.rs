//! Client side of the legacy scp protocol, run over an SSH remote-execution
//! channel.
//!
//! # Architecture
//!
//! ```text
//! Client ──(Backend)──> TransferSession ─┬─ ScpSession ──> session::{send,recv} ──> scp -rt / scp -rf
//!                                        └─ SftpSession ─> openssh-sftp-client ───> sftp subsystem
//!                                                  │
//!                                          ExecChannel (SshChannel)
//! ```
//!
//! Every [`Client`] call opens one session, runs one transfer and closes the
//! session again, whatever the outcome. The backend is fixed when the client
//! is constructed.
//!
//! # Wire format
//!
//! See [`protocol`]. Bytes on the wire match what OpenSSH `scp` exchanges in
//! its legacy (non-SFTP) mode.
//!
//! # Errors
//!
//! All calls return `anyhow::Result`. Protocol-level failures, including
//! warnings and errors reported by the remote side, can be recovered with
//! `error.downcast_ref::<ProtocolError>()`.

use std::future::Future;
use std::path::Path;

use common::Summary;
use tokio::io::AsyncWrite;
use tracing::instrument;

pub mod channel;
pub mod handler;
pub mod protocol;
pub mod scp;
pub mod session;
pub mod sftp;
pub mod streams;

#[cfg(test)]
mod testutils;

pub use channel::{ExecChannel, RemoteCommand, RemoteProcess, SshChannel, SshSession};
pub use handler::{FileHandler, FsHandler, WriterHandler};
pub use protocol::ProtocolError;

/// Default path of the scp binary on the remote host
pub const DEFAULT_REMOTE_BINARY: &str = "/usr/bin/scp";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Scp,
    Sftp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    /// Program started on the remote host for the scp backend
    pub remote_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Scp,
            remote_binary: DEFAULT_REMOTE_BINARY.to_string(),
        }
    }
}

/// One open transfer backend
pub trait Session {
    fn send(
        &mut self,
        local: &Path,
        remote: &Path,
    ) -> impl Future<Output = anyhow::Result<Summary>> + Send;

    fn recv<H: FileHandler>(
        &mut self,
        remote: &Path,
        local: &Path,
        handler: &mut H,
    ) -> impl Future<Output = anyhow::Result<Summary>> + Send;

    fn recv_stream<W: AsyncWrite + Unpin + Send>(
        &mut self,
        remote: &Path,
        writer: &mut W,
    ) -> impl Future<Output = anyhow::Result<Summary>> + Send;

    fn close(self) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub enum TransferSession<'a, C> {
    Scp(scp::ScpSession<'a, C>),
    Sftp(sftp::SftpSession<'a>),
}

impl<C: ExecChannel> Session for TransferSession<'_, C> {
    async fn send(&mut self, local: &Path, remote: &Path) -> anyhow::Result<Summary> {
        match self {
            TransferSession::Scp(session) => session.send(local, remote).await,
            TransferSession::Sftp(session) => session.send(local, remote).await,
        }
    }

    async fn recv<H: FileHandler>(
        &mut self,
        remote: &Path,
        local: &Path,
        handler: &mut H,
    ) -> anyhow::Result<Summary> {
        match self {
            TransferSession::Scp(session) => session.recv(remote, local, handler).await,
            TransferSession::Sftp(session) => session.recv(remote, local, handler).await,
        }
    }

    async fn recv_stream<W: AsyncWrite + Unpin + Send>(
        &mut self,
        remote: &Path,
        writer: &mut W,
    ) -> anyhow::Result<Summary> {
        match self {
            TransferSession::Scp(session) => session.recv_stream(remote, writer).await,
            TransferSession::Sftp(session) => session.recv_stream(remote, writer).await,
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        match self {
            TransferSession::Scp(_) => Ok(()),
            TransferSession::Sftp(session) => session.close().await,
        }
    }
}

/// Copies files and directory trees to and from one remote host.
#[derive(Debug)]
pub struct Client<C> {
    channel: C,
    config: Config,
}

impl<C: ExecChannel> Client<C> {
    pub fn new(channel: C, config: Config) -> Self {
        Self { channel, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub async fn open_session(&self) -> anyhow::Result<TransferSession<'_, C>> {
        match self.config.backend {
            Backend::Scp => Ok(TransferSession::Scp(scp::ScpSession::new(
                &self.channel,
                &self.config.remote_binary,
            ))),
            Backend::Sftp => Ok(TransferSession::Sftp(
                sftp::SftpSession::open(&self.channel).await?,
            )),
        }
    }

    /// Upload a local file or directory tree so that it ends up at `remote`
    #[instrument(skip(self))]
    pub async fn send(&self, local: &Path, remote: &Path) -> anyhow::Result<Summary> {
        let mut session = self.open_session().await?;
        let result = session.send(local, remote).await;
        finish(session, result).await
    }

    /// Download `remote` to the local filesystem.
    ///
    /// A remote directory is created at `local` itself, a remote file is
    /// written into the directory `local` under its remote name.
    #[instrument(skip(self))]
    pub async fn recv(&self, remote: &Path, local: &Path) -> anyhow::Result<Summary> {
        self.recv_with(remote, local, &mut FsHandler).await
    }

    /// Like [`Self::recv`], with file bodies handed to `handler`
    #[instrument(skip(self, handler))]
    pub async fn recv_with<H: FileHandler>(
        &self,
        remote: &Path,
        local: &Path,
        handler: &mut H,
    ) -> anyhow::Result<Summary> {
        let mut session = self.open_session().await?;
        let result = session.recv(remote, local, handler).await;
        finish(session, result).await
    }

    /// Stream the content of a single remote file into `writer`
    #[instrument(skip(self, writer))]
    pub async fn recv_stream<W: AsyncWrite + Unpin + Send>(
        &self,
        remote: &Path,
        writer: &mut W,
    ) -> anyhow::Result<Summary> {
        let mut session = self.open_session().await?;
        let result = session.recv_stream(remote, writer).await;
        finish(session, result).await
    }
}

async fn finish<S: Session>(session: S, result: anyhow::Result<Summary>) -> anyhow::Result<Summary> {
    let closed = session.close().await;
    let summary = result?;
    closed?;
    Ok(summary)
}
