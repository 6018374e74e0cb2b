//! Destinations for received file bodies.
//!
//! The receive path hands every file body to a [`FileHandler`] together with
//! the local path and permission bits it would have on disk. Handlers may read
//! as little of the body as they like; the caller discards the rest.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub trait FileHandler: Send {
    fn handle<D>(
        &mut self,
        path: &Path,
        mode: u32,
        data: &mut D,
    ) -> impl Future<Output = anyhow::Result<()>> + Send
    where
        D: AsyncRead + Unpin + Send;
}

/// Writes each body to `path`, replacing any existing file, and leaves it
/// with exactly `mode` permissions.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsHandler;

impl FileHandler for FsHandler {
    async fn handle<D>(&mut self, path: &Path, mode: u32, data: &mut D) -> anyhow::Result<()>
    where
        D: AsyncRead + Unpin + Send,
    {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .await
            .with_context(|| format!("cannot open {path:?} for writing"))?;
        tokio::io::copy(data, &mut file)
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        file.flush()
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        // the umask applies at creation and an existing file keeps its old bits
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("cannot set permissions on {path:?}"))?;
        Ok(())
    }
}

/// Streams every body into a single writer, ignoring paths and modes.
#[derive(Debug)]
pub struct WriterHandler<W> {
    writer: W,
}

impl<W> WriterHandler<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: AsyncWrite + Unpin + Send> FileHandler for WriterHandler<W> {
    async fn handle<D>(&mut self, _path: &Path, _mode: u32, data: &mut D) -> anyhow::Result<()>
    where
        D: AsyncRead + Unpin + Send,
    {
        tokio::io::copy(data, &mut self.writer).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
