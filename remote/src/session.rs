//! The scp transfer state machine.
//!
//! A transfer runs two flows side by side: the local flow drives the protocol
//! over the remote process's stdin/stdout, the other one waits for that
//! process to exit. The local flow always shuts down the outbound stream when
//! it finishes so the remote side sees end of input. If the local flow failed
//! its error is returned, otherwise the exit status decides.
//!
//! Every unit sent (a directory header, a file, a directory end) is answered
//! by one acknowledgement before the next unit goes out. Every `Ok` the
//! receive path owes is written before the function owing it returns.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{anyhow, Context};
use async_recursion::async_recursion;
use common::Summary;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::instrument;

use crate::handler::FileHandler;
use crate::protocol::{Message, ProtocolError, Tag};
use crate::streams::{drain_body, RecvStream, SendStream};

const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Upload `local` (a file or a directory tree) so that it lands at `remote`.
///
/// `outbound`/`inbound` must be connected to `scp -rt <parent of remote>`.
pub async fn send<W, R, F>(
    outbound: W,
    inbound: R,
    remote_exit: F,
    local: &Path,
    remote: &Path,
) -> anyhow::Result<Summary>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
    F: Future<Output = anyhow::Result<()>>,
{
    let local_flow = async {
        let mut transfer = Transfer::new(inbound, outbound);
        let result = transfer.upload(local, remote).await;
        transfer.finish(result).await
    };
    join_flows(local_flow, remote_exit).await
}

/// Download whatever a remote `scp -rf` (or `scp -f`) sends into `local`,
/// passing file bodies to `handler`.
pub async fn recv<W, R, F, H>(
    outbound: W,
    inbound: R,
    remote_exit: F,
    local: &Path,
    handler: &mut H,
) -> anyhow::Result<Summary>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
    F: Future<Output = anyhow::Result<()>>,
    H: FileHandler,
{
    let local_flow = async {
        let mut transfer = Transfer::new(inbound, outbound);
        let result = transfer.download(local, handler).await;
        transfer.finish(result).await
    };
    join_flows(local_flow, remote_exit).await
}

async fn join_flows<L, F>(local_flow: L, remote_exit: F) -> anyhow::Result<Summary>
where
    L: Future<Output = anyhow::Result<Summary>>,
    F: Future<Output = anyhow::Result<()>>,
{
    let (local_result, remote_result) = tokio::join!(local_flow, remote_exit);
    match local_result {
        Ok(summary) => {
            remote_result?;
            Ok(summary)
        }
        Err(error) => {
            if let Err(remote_error) = remote_result {
                tracing::debug!("remote command also failed: {:#}", &remote_error);
            }
            Err(error)
        }
    }
}

/// Name the top-level entry is sent under: the last component of `remote`.
pub fn remote_entry_name(remote: &Path) -> anyhow::Result<String> {
    remote
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("remote path {remote:?} does not end in a file name"))
}

/// Directory the remote sink has to run in for `remote` to be created.
#[must_use]
pub fn remote_parent(remote: &Path) -> &Path {
    match remote.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

enum Step {
    Entry,
    EndOfDirectory,
}

/// Local side of one scp exchange.
pub struct Transfer<R, W> {
    send: SendStream<W>,
    recv: RecvStream<R>,
    summary: Summary,
}

impl<R, W> Transfer<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inbound: R, outbound: W) -> Self {
        Self {
            send: SendStream::new(outbound),
            recv: RecvStream::new(inbound),
            summary: Summary::default(),
        }
    }

    /// Shut down the outbound stream and hand back the outcome of the exchange
    pub async fn finish(mut self, result: anyhow::Result<()>) -> anyhow::Result<Summary> {
        if let Err(error) = self.send.close().await {
            tracing::debug!("failed closing stream to remote: {:#}", &error);
        }
        result.map(|()| self.summary)
    }

    async fn expect_ack(&mut self) -> anyhow::Result<()> {
        self.recv.recv_message().await?.into_result()?;
        Ok(())
    }

    async fn send_ok(&mut self) -> anyhow::Result<()> {
        self.send.send_message(&Message::ok()).await
    }

    async fn notify_error(&mut self, error: &anyhow::Error) {
        let message = Message::error(&format!("{error:#}"));
        if let Err(send_error) = self.send.send_message(&message).await {
            tracing::debug!("failed reporting error to remote: {:#}", &send_error);
        }
    }

    #[instrument(skip(self))]
    pub async fn upload(&mut self, local: &Path, remote: &Path) -> anyhow::Result<()> {
        let metadata = tokio::fs::metadata(local)
            .await
            .with_context(|| format!("failed reading metadata from {local:?}"))?;
        let name = remote_entry_name(remote)?;
        self.expect_ack().await?;
        tracing::info!("sending {:?} as {:?}", local, name);
        if metadata.is_dir() {
            self.send_dir(local, &name).await
        } else if metadata.is_file() {
            self.send_file(local, &name).await
        } else {
            Err(anyhow!("{local:?} is neither a regular file nor a directory"))
        }
    }

    #[instrument(skip(self))]
    async fn send_file(&mut self, path: &Path, name: &str) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {path:?} for reading"))?;
        let metadata = file
            .metadata()
            .await
            .with_context(|| format!("failed reading metadata from {path:?}"))?;
        let size = metadata.len();
        let header = Message::file(metadata.permissions().mode(), size, name);
        tracing::debug!("sending file header {:?}", header.text());
        let mut reader = tokio::io::BufReader::with_capacity(READ_BUFFER_SIZE, file);
        self.send.send_file(&header, size, &mut reader).await?;
        self.expect_ack().await?;
        self.summary += Summary::file(size);
        Ok(())
    }

    #[instrument(skip(self))]
    #[async_recursion]
    async fn send_dir(&mut self, path: &Path, name: &str) -> anyhow::Result<()> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed reading metadata from {path:?}"))?;
        let header = Message::dir(metadata.permissions().mode(), name);
        tracing::debug!("sending directory header {:?}", header.text());
        self.send.send_message(&header).await?;
        self.expect_ack().await?;
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("cannot open directory {path:?} for reading"))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {path:?}"))?
        {
            let entry_path = entry.path();
            let file_name = entry.file_name();
            let Some(entry_name) = file_name.to_str() else {
                return Err(anyhow!("{entry_path:?} does not have a UTF-8 name"));
            };
            // follows symlinks
            let entry_metadata = tokio::fs::metadata(&entry_path)
                .await
                .with_context(|| format!("failed reading metadata from {entry_path:?}"))?;
            if entry_metadata.is_dir() {
                self.send_dir(&entry_path, entry_name).await?;
            } else if entry_metadata.is_file() {
                self.send_file(&entry_path, entry_name).await?;
            } else {
                tracing::warn!("skipping {:?}: not a regular file or directory", &entry_path);
            }
        }
        self.send.send_message(&Message::dir_end()).await?;
        self.expect_ack().await?;
        self.summary += Summary::directory();
        Ok(())
    }

    #[instrument(skip(self, handler))]
    pub async fn download<H: FileHandler>(
        &mut self,
        local: &Path,
        handler: &mut H,
    ) -> anyhow::Result<()> {
        // the remote source waits for this before sending anything
        self.send_ok().await?;
        match self.recv_command(local, true, handler).await? {
            Step::Entry => Ok(()),
            Step::EndOfDirectory => Err(ProtocolError::UnmatchedDirEnd.into()),
        }
    }

    #[async_recursion]
    async fn recv_command<H: FileHandler>(
        &mut self,
        local: &Path,
        top_level: bool,
        handler: &mut H,
    ) -> anyhow::Result<Step> {
        let message = self.recv.recv_message().await?.into_result()?;
        tracing::debug!("received {} {:?}", message.tag(), message.text());
        match message.tag() {
            Tag::DirHeader => {
                let header = message.entry_header()?;
                let path = if top_level {
                    local.to_path_buf()
                } else {
                    local.join(&header.name)
                };
                self.recv_dir(&path, header.mode, handler).await?;
                Ok(Step::Entry)
            }
            Tag::FileHeader => {
                let header = message.entry_header()?;
                let path = local.join(&header.name);
                self.recv_file(&path, header.mode, header.size, handler)
                    .await?;
                Ok(Step::Entry)
            }
            Tag::DirEnd => Ok(Step::EndOfDirectory),
            other => Err(ProtocolError::Unexpected(other).into()),
        }
    }

    #[instrument(skip(self, handler))]
    async fn recv_dir<H: FileHandler>(
        &mut self,
        path: &Path,
        mode: u32,
        handler: &mut H,
    ) -> anyhow::Result<()> {
        let created = tokio::fs::symlink_metadata(path).await.is_err();
        if let Err(error) = create_dir(path, mode).await {
            self.notify_error(&error).await;
            return Err(error);
        }
        self.send_ok().await?;
        while let Step::Entry = self.recv_command(path, false, handler).await? {}
        if created {
            if let Err(error) = set_mode(path, mode).await {
                self.notify_error(&error).await;
                return Err(error);
            }
        }
        self.send_ok().await?;
        self.summary += Summary::directory();
        Ok(())
    }

    #[instrument(skip(self, handler))]
    async fn recv_file<H: FileHandler>(
        &mut self,
        path: &Path,
        mode: u32,
        size: u64,
        handler: &mut H,
    ) -> anyhow::Result<()> {
        self.send_ok().await?;
        let stored = {
            let mut body = self.recv.body(size);
            match handler.handle(path, mode, &mut body).await {
                Ok(()) => drain_body(&mut body, size).await,
                Err(error) => Err(error),
            }
        };
        if let Err(error) = stored {
            self.notify_error(&error).await;
            return Err(error);
        }
        let status = match self.recv.recv_message().await {
            Ok(status) => status,
            Err(error) => {
                self.notify_error(&error).await;
                return Err(error);
            }
        };
        status.into_result()?;
        self.send_ok().await?;
        self.summary += Summary::file(size);
        Ok(())
    }
}

async fn create_dir(path: &Path, mode: u32) -> anyhow::Result<()> {
    // owner access is needed to fill the directory, the exact mode is set once it is closed
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode | 0o700)
        .create(path)
        .await
        .with_context(|| format!("cannot create directory {path:?}"))
}

async fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("cannot set permissions on {path:?}"))
}
