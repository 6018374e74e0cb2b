//! Transfers over the SFTP subsystem.
//!
//! Runs on the same [`ExecChannel`] as the scp backend: the `sftp` subsystem
//! is started as a remote process and `openssh-sftp-client` speaks to it over
//! that process's stdin/stdout. Unlike scp, symlinks are recreated as
//! symlinks; absolute link targets are rewritten relative to the directory
//! holding the link.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context};
use async_recursion::async_recursion;
use common::Summary;
use futures::future::BoxFuture;
use futures::TryStreamExt;
use openssh_sftp_client::file::TokioCompatFile;
use openssh_sftp_client::metadata::Permissions;
use openssh_sftp_client::{Sftp, SftpOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::channel::{ExecChannel, RemoteCommand};
use crate::handler::FileHandler;

pub struct SftpSession<'a> {
    sftp: Sftp,
    exit: BoxFuture<'a, anyhow::Result<()>>,
}

impl<'a> SftpSession<'a> {
    pub async fn open<C: ExecChannel>(channel: &'a C) -> anyhow::Result<Self> {
        let process = channel.spawn(&RemoteCommand::sftp()).await?;
        let sftp = Sftp::new(process.stdin, process.stdout, SftpOptions::default())
            .await
            .context("Failed to start sftp session")?;
        Ok(Self {
            sftp,
            exit: process.exit,
        })
    }

    /// Shut the subsystem down and wait for the remote process to exit
    pub async fn close(self) -> anyhow::Result<()> {
        self.sftp.close().await.context("Failed to close sftp session")?;
        self.exit.await
    }

    #[instrument(skip(self))]
    pub async fn send(&mut self, local: &Path, remote: &Path) -> anyhow::Result<Summary> {
        upload(&self.sftp, local, remote).await
    }

    #[instrument(skip(self, handler))]
    pub async fn recv<H: FileHandler>(
        &mut self,
        remote: &Path,
        local: &Path,
        handler: &mut H,
    ) -> anyhow::Result<Summary> {
        download(&self.sftp, remote, local, handler).await
    }

    /// Copy a single remote file into `writer`
    #[instrument(skip(self, writer))]
    pub async fn recv_stream<W: AsyncWrite + Unpin + Send>(
        &mut self,
        remote: &Path,
        writer: &mut W,
    ) -> anyhow::Result<Summary> {
        let file = self
            .sftp
            .open(remote)
            .await
            .with_context(|| format!("cannot open remote {remote:?} for reading"))?;
        let mut src = Box::pin(TokioCompatFile::new(file));
        let bytes = tokio::io::copy(&mut src, writer)
            .await
            .with_context(|| format!("failed reading remote {remote:?}"))?;
        writer.flush().await?;
        Ok(Summary::file(bytes))
    }
}

#[async_recursion]
async fn upload(sftp: &Sftp, local: &Path, remote: &Path) -> anyhow::Result<Summary> {
    let metadata = tokio::fs::symlink_metadata(local)
        .await
        .with_context(|| format!("failed reading metadata from {local:?}"))?;
    let mut fs = sftp.fs();
    if metadata.is_symlink() {
        let target = tokio::fs::read_link(local)
            .await
            .with_context(|| format!("failed reading symlink {local:?}"))?;
        let target = relative_link_target(&target, local);
        tracing::debug!("creating remote symlink {:?} -> {:?}", remote, target);
        if let Err(error) = fs.remove_file(remote).await {
            tracing::trace!("nothing to replace at {:?}: {}", remote, error);
        }
        fs.symlink(&target, remote)
            .await
            .with_context(|| format!("cannot create remote symlink {remote:?}"))?;
        return Ok(Summary::symlink());
    }
    let mode = metadata.permissions().mode();
    if metadata.is_dir() {
        let exists = fs
            .metadata(remote)
            .await
            .ok()
            .and_then(|existing| existing.file_type())
            .is_some_and(|file_type| file_type.is_dir());
        if !exists {
            fs.create_dir(remote)
                .await
                .with_context(|| format!("cannot create remote directory {remote:?}"))?;
        }
        let mut summary = Summary::directory();
        let mut entries = tokio::fs::read_dir(local)
            .await
            .with_context(|| format!("cannot open directory {local:?} for reading"))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {local:?}"))?
        {
            summary += upload(sftp, &entry.path(), &remote.join(entry.file_name())).await?;
        }
        fs.set_permissions(remote, sftp_permissions(mode))
            .await
            .with_context(|| format!("cannot set permissions on remote {remote:?}"))?;
        return Ok(summary);
    }
    let mut src = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("cannot open {local:?} for reading"))?;
    let file = sftp
        .create(remote)
        .await
        .with_context(|| format!("cannot open remote {remote:?} for writing"))?;
    let mut dst = Box::pin(TokioCompatFile::new(file));
    let bytes = tokio::io::copy(&mut src, &mut dst)
        .await
        .with_context(|| format!("failed writing remote {remote:?}"))?;
    dst.shutdown().await?;
    drop(dst);
    fs.set_permissions(remote, sftp_permissions(mode))
        .await
        .with_context(|| format!("cannot set permissions on remote {remote:?}"))?;
    Ok(Summary::file(bytes))
}

#[async_recursion]
async fn download<H: FileHandler>(
    sftp: &Sftp,
    remote: &Path,
    local: &Path,
    handler: &mut H,
) -> anyhow::Result<Summary> {
    let mut fs = sftp.fs();
    let metadata = fs
        .symlink_metadata(remote)
        .await
        .with_context(|| format!("failed reading metadata from remote {remote:?}"))?;
    let file_type = metadata
        .file_type()
        .ok_or_else(|| anyhow!("remote {remote:?} has no file type"))?;
    if file_type.is_symlink() {
        let target = fs
            .read_link(remote)
            .await
            .with_context(|| format!("failed reading remote symlink {remote:?}"))?;
        let target = relative_link_target(&target, remote);
        if let Err(error) = tokio::fs::symlink(&target, local).await {
            tracing::warn!("cannot create symlink {:?} -> {:?}: {}", local, target, error);
            return Ok(Summary::default());
        }
        return Ok(Summary::symlink());
    }
    let mode = metadata.permissions().map_or(0o644, local_mode);
    if file_type.is_dir() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode | 0o700)
            .create(local)
            .await
            .with_context(|| format!("cannot create directory {local:?}"))?;
        let entries: Vec<_> = fs
            .open_dir(remote)
            .await
            .with_context(|| format!("cannot open remote directory {remote:?}"))?
            .read_dir()
            .try_collect()
            .await
            .with_context(|| format!("failed listing remote directory {remote:?}"))?;
        let mut summary = Summary::directory();
        for entry in entries {
            let name = entry.filename().to_path_buf();
            if name == Path::new(".") || name == Path::new("..") {
                continue;
            }
            summary += download(sftp, &remote.join(&name), &local.join(&name), handler).await?;
        }
        tokio::fs::set_permissions(local, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("cannot set permissions on {local:?}"))?;
        return Ok(summary);
    }
    let file = sftp
        .open(remote)
        .await
        .with_context(|| format!("cannot open remote {remote:?} for reading"))?;
    let mut src = Box::pin(TokioCompatFile::new(file));
    let local = match tokio::fs::metadata(local).await {
        Ok(existing) if existing.is_dir() => match remote.file_name() {
            Some(name) => local.join(name),
            None => local.to_path_buf(),
        },
        _ => local.to_path_buf(),
    };
    handler.handle(&local, mode, &mut src).await?;
    Ok(Summary::file(metadata.len().unwrap_or(0)))
}

const PERMISSION_BITS: [(u32, fn(&Permissions) -> bool); 9] = [
    (0o400, Permissions::read_by_owner),
    (0o200, Permissions::write_by_owner),
    (0o100, Permissions::execute_by_owner),
    (0o040, Permissions::read_by_group),
    (0o020, Permissions::write_by_group),
    (0o010, Permissions::execute_by_group),
    (0o004, Permissions::read_by_other),
    (0o002, Permissions::write_by_other),
    (0o001, Permissions::execute_by_other),
];

fn sftp_permissions(mode: u32) -> Permissions {
    Permissions::from((mode & 0o7777) as u16)
}

fn local_mode(permissions: Permissions) -> u32 {
    PERMISSION_BITS
        .iter()
        .filter(|(_, is_set)| is_set(&permissions))
        .map(|(bit, _)| bit)
        .sum()
}

/// Absolute link targets become relative to the directory holding `link`
fn relative_link_target(target: &Path, link: &Path) -> PathBuf {
    if !target.is_absolute() {
        return target.to_path_buf();
    }
    let base = link.parent().unwrap_or(Path::new("/"));
    let target_components: Vec<Component> = target.components().collect();
    let base_components: Vec<Component> = base.components().collect();
    let common = target_components
        .iter()
        .zip(&base_components)
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}
