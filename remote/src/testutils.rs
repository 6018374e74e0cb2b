//! In-process stand-ins for a remote host.
//!
//! [`LoopbackChannel`] runs an emulated `scp -t`/`scp -f` on local paths and
//! connects it to the client through in-memory pipes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_recursion::async_recursion;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::channel::{ExecChannel, RemoteCommand, RemoteProcess};
use crate::protocol::{Message, ProtocolError, Tag};
use crate::streams::{drain_body, RecvStream, SendStream};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct ClientEnds {
    pub to_peer: DuplexStream,
    pub from_peer: DuplexStream,
}

pub struct PeerEnds {
    pub from_client: DuplexStream,
    pub to_client: DuplexStream,
}

/// Two in-memory pipes wired as a remote process's stdin and stdout
pub fn peer_pipes() -> (ClientEnds, PeerEnds) {
    let (to_peer, from_client) = tokio::io::duplex(PIPE_CAPACITY);
    let (to_client, from_peer) = tokio::io::duplex(PIPE_CAPACITY);
    (
        ClientEnds { to_peer, from_peer },
        PeerEnds {
            from_client,
            to_client,
        },
    )
}

/// Runs scp invocations against the local filesystem.
#[derive(Debug, Default)]
pub struct LoopbackChannel;

impl ExecChannel for LoopbackChannel {
    async fn spawn(&self, command: &RemoteCommand) -> anyhow::Result<RemoteProcess<'_>> {
        let RemoteCommand::Exec { args, .. } = command else {
            anyhow::bail!("`{command}` is not available over loopback");
        };
        let (client, peer) = peer_pipes();
        let peer_task = match args.as_slice() {
            [flag, dir] if flag == "-rt" => {
                tokio::spawn(run_sink(PathBuf::from(dir), peer.from_client, peer.to_client))
            }
            [flag, path] if flag == "-rf" || flag == "-f" => tokio::spawn(run_source(
                PathBuf::from(path),
                flag == "-rf",
                peer.from_client,
                peer.to_client,
            )),
            _ => anyhow::bail!("unsupported scp invocation `{command}`"),
        };
        let description = command.to_string();
        let exit = async move {
            if let Err(error) = peer_task.await? {
                return Err(ProtocolError::RemoteExit {
                    command: description,
                    status: "status code 1".to_string(),
                    stderr: format!("{error:#}"),
                }
                .into());
            }
            anyhow::Ok(())
        };
        Ok(RemoteProcess {
            stdin: Box::new(client.to_peer),
            stdout: Box::new(client.from_peer),
            exit: Box::pin(exit),
        })
    }
}

async fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("cannot set permissions on {path:?}"))
}

/// Behaves like `scp -rt dir`: one acknowledgement per received unit.
pub async fn run_sink<R, W>(dir: PathBuf, inbound: R, outbound: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut recv = RecvStream::new(inbound);
    let mut send = SendStream::new(outbound);
    send.send_message(&Message::ok()).await?;
    let mut open_dirs: Vec<(PathBuf, u32)> = Vec::new();
    loop {
        let current = open_dirs.last().map_or(dir.as_path(), |(path, _)| path.as_path());
        let message = recv.recv_message().await?;
        match message.tag() {
            // end of input
            Tag::Ok => return Ok(()),
            Tag::FileHeader => {
                let header = message.entry_header()?;
                let path = current.join(&header.name);
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("cannot create {path:?}"))?;
                {
                    let mut body = recv.body(header.size);
                    tokio::io::copy(&mut body, &mut file).await?;
                    drain_body(&mut body, header.size).await?;
                }
                file.flush().await?;
                set_mode(&path, header.mode).await?;
                recv.recv_message().await?.into_result()?;
                send.send_message(&Message::ok()).await?;
            }
            Tag::DirHeader => {
                let header = message.entry_header()?;
                let path = current.join(&header.name);
                if let Err(error) = tokio::fs::create_dir_all(&path).await {
                    let text = format!("scp: {}: {}", path.display(), error);
                    send.send_message(&Message::error(&text)).await?;
                    return Err(anyhow!(text));
                }
                open_dirs.push((path, header.mode));
                send.send_message(&Message::ok()).await?;
            }
            Tag::DirEnd => {
                let (path, mode) = open_dirs
                    .pop()
                    .ok_or(ProtocolError::UnmatchedDirEnd)?;
                set_mode(&path, mode).await?;
                send.send_message(&Message::ok()).await?;
            }
            Tag::Warning | Tag::Error => {
                return Err(ProtocolError::Peer(message.text().to_string()).into());
            }
        }
    }
}

/// Behaves like `scp -rf path` (or `scp -f path`): waits for the sink after
/// every header and after every body.
pub async fn run_source<R, W>(
    path: PathBuf,
    recursive: bool,
    inbound: R,
    outbound: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut peer = Source {
        recv: RecvStream::new(inbound),
        send: SendStream::new(outbound),
        recursive,
    };
    peer.ack().await?;
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(error) => {
            let text = format!("scp: {}: {}", path.display(), error);
            peer.send.send_message(&Message::error(&text)).await?;
            return Err(anyhow!(text));
        }
    };
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("source path has no name")?
        .to_string();
    if metadata.is_dir() {
        peer.send_dir(&path, &name).await
    } else {
        peer.send_file(&path, &name).await
    }
}

struct Source<R, W> {
    recv: RecvStream<R>,
    send: SendStream<W>,
    recursive: bool,
}

impl<R, W> Source<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ack(&mut self) -> anyhow::Result<()> {
        self.recv.recv_message().await?.into_result()?;
        Ok(())
    }

    async fn send_file(&mut self, path: &Path, name: &str) -> anyhow::Result<()> {
        let metadata = tokio::fs::metadata(path).await?;
        let header = Message::file(metadata.permissions().mode(), metadata.len(), name);
        self.send.send_message(&header).await?;
        self.ack().await?;
        let file = tokio::fs::File::open(path).await?;
        let mut reader = tokio::io::BufReader::new(file);
        self.send.send_body(metadata.len(), &mut reader).await?;
        self.ack().await
    }

    #[async_recursion]
    async fn send_dir(&mut self, path: &Path, name: &str) -> anyhow::Result<()> {
        if !self.recursive {
            let text = format!("scp: {}: not a regular file", path.display());
            self.send.send_message(&Message::error(&text)).await?;
            return Err(anyhow!(text));
        }
        let metadata = tokio::fs::metadata(path).await?;
        self.send
            .send_message(&Message::dir(metadata.permissions().mode(), name))
            .await?;
        self.ack().await?;
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            let file_name = entry.file_name();
            let entry_name = file_name.to_str().context("non UTF-8 name")?;
            if tokio::fs::metadata(&entry_path).await?.is_dir() {
                self.send_dir(&entry_path, entry_name).await?;
            } else {
                self.send_file(&entry_path, entry_name).await?;
            }
        }
        self.send.send_message(&Message::dir_end()).await?;
        self.ack().await
    }
}

/// Assert two trees hold the same names, contents and permission bits
#[async_recursion]
pub async fn check_dirs_identical(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let src_metadata = tokio::fs::metadata(src).await?;
    let dst_metadata = tokio::fs::metadata(dst).await?;
    assert_eq!(
        src_metadata.permissions().mode() & 0o7777,
        dst_metadata.permissions().mode() & 0o7777,
        "permissions differ between {src:?} and {dst:?}"
    );
    if src_metadata.is_file() {
        assert!(dst_metadata.is_file(), "{dst:?} is not a file");
        let src_content = tokio::fs::read(src).await?;
        let dst_content = tokio::fs::read(dst).await?;
        assert_eq!(src_content, dst_content, "content differs for {dst:?}");
        return Ok(());
    }
    assert!(dst_metadata.is_dir(), "{dst:?} is not a directory");
    let mut src_names = Vec::new();
    let mut src_entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = src_entries.next_entry().await? {
        src_names.push(entry.file_name());
    }
    let mut dst_names = Vec::new();
    let mut dst_entries = tokio::fs::read_dir(dst).await?;
    while let Some(entry) = dst_entries.next_entry().await? {
        dst_names.push(entry.file_name());
    }
    src_names.sort();
    dst_names.sort();
    assert_eq!(src_names, dst_names, "entries differ between {src:?} and {dst:?}");
    for name in src_names {
        check_dirs_identical(&src.join(&name), &dst.join(&name)).await?;
    }
    Ok(())
}

/// Build a small tree with nested directories, an empty file and odd modes:
///
/// ```text
/// tree/            0755
/// |- a.txt         0644  "alpha"
/// |- empty         0600  ""
/// |- bin/          0750
/// |  |- tool       0755  "#!/bin/sh"
/// |  |- deep/      0700
/// |     |- z.dat   0640  64 KiB + 3 bytes
/// |- hollow/       0755
/// ```
pub async fn setup_tree(root: &Path) -> anyhow::Result<PathBuf> {
    let tree = root.join("tree");
    let deep = tree.join("bin").join("deep");
    tokio::fs::create_dir_all(&deep).await?;
    tokio::fs::create_dir(tree.join("hollow")).await?;
    let large: Vec<u8> = (0..(64 * 1024 + 3)).map(|i| (i % 251) as u8).collect();
    for (path, content, mode) in [
        (tree.join("a.txt"), b"alpha".to_vec(), 0o644),
        (tree.join("empty"), Vec::new(), 0o600),
        (tree.join("bin").join("tool"), b"#!/bin/sh".to_vec(), 0o755),
        (deep.join("z.dat"), large, 0o640),
    ] {
        tokio::fs::write(&path, content).await?;
        set_mode(&path, mode).await?;
    }
    for (path, mode) in [
        (deep.clone(), 0o700),
        (tree.join("bin"), 0o750),
        (tree.join("hollow"), 0o755),
        (tree.clone(), 0o755),
    ] {
        set_mode(&path, mode).await?;
    }
    Ok(tree)
}
