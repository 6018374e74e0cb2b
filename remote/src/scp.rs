use std::path::Path;

use common::Summary;
use tokio::io::AsyncWrite;
use tracing::instrument;

use crate::channel::{ExecChannel, RemoteCommand};
use crate::handler::{FileHandler, WriterHandler};
use crate::session;

/// Runs every transfer as its own remote `scp` process.
#[derive(Debug)]
pub struct ScpSession<'a, C> {
    channel: &'a C,
    remote_binary: &'a str,
}

impl<'a, C: ExecChannel> ScpSession<'a, C> {
    pub fn new(channel: &'a C, remote_binary: &'a str) -> Self {
        Self {
            channel,
            remote_binary,
        }
    }

    #[instrument(skip(self))]
    pub async fn send(&mut self, local: &Path, remote: &Path) -> anyhow::Result<Summary> {
        let command = RemoteCommand::scp_sink(self.remote_binary, session::remote_parent(remote));
        let process = self.channel.spawn(&command).await?;
        session::send(process.stdin, process.stdout, process.exit, local, remote).await
    }

    #[instrument(skip(self, handler))]
    pub async fn recv<H: FileHandler>(
        &mut self,
        remote: &Path,
        local: &Path,
        handler: &mut H,
    ) -> anyhow::Result<Summary> {
        let command = RemoteCommand::scp_source(self.remote_binary, remote, true);
        let process = self.channel.spawn(&command).await?;
        session::recv(process.stdin, process.stdout, process.exit, local, handler).await
    }

    /// Non-recursive download, the remote side refuses anything but a regular file
    #[instrument(skip(self, writer))]
    pub async fn recv_stream<W: AsyncWrite + Unpin + Send>(
        &mut self,
        remote: &Path,
        writer: &mut W,
    ) -> anyhow::Result<Summary> {
        let command = RemoteCommand::scp_source(self.remote_binary, remote, false);
        let process = self.channel.spawn(&command).await?;
        let mut handler = WriterHandler::new(writer);
        session::recv(
            process.stdin,
            process.stdout,
            process.exit,
            Path::new("."),
            &mut handler,
        )
        .await
    }
}
