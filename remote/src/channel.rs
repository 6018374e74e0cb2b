//! Remote execution channel the transfer backends run on.
//!
//! A channel starts one remote process per transfer and hands back its
//! stdin/stdout together with a future that resolves once the process exits.
//! [`SshChannel`] is the production implementation on top of an OpenSSH
//! multiplexed master connection.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::protocol::ProtocolError;
use crate::streams::{BoxedRead, BoxedWrite};

/// What to run on the remote host
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    Exec { program: String, args: Vec<String> },
    Subsystem(String),
}

impl RemoteCommand {
    /// `scp -rt <dir>`: receive entries into `dir`
    #[must_use]
    pub fn scp_sink(remote_binary: &str, dir: &Path) -> Self {
        Self::Exec {
            program: remote_binary.to_string(),
            args: vec!["-rt".to_string(), dir.to_string_lossy().into_owned()],
        }
    }

    /// `scp -rf <path>`, or `scp -f <path>` when only a single file is acceptable
    #[must_use]
    pub fn scp_source(remote_binary: &str, path: &Path, recursive: bool) -> Self {
        let flag = if recursive { "-rf" } else { "-f" };
        Self::Exec {
            program: remote_binary.to_string(),
            args: vec![flag.to_string(), path.to_string_lossy().into_owned()],
        }
    }

    #[must_use]
    pub fn sftp() -> Self {
        Self::Subsystem("sftp".to_string())
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RemoteCommand::Exec { program, args } => {
                write!(f, "{program}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            RemoteCommand::Subsystem(name) => write!(f, "subsystem {name}"),
        }
    }
}

/// A running remote command.
///
/// `exit` resolves once the process has exited and fails if it did not exit
/// successfully. Dropping it without awaiting is allowed.
pub struct RemoteProcess<'a> {
    pub stdin: BoxedWrite,
    pub stdout: BoxedRead,
    pub exit: BoxFuture<'a, anyhow::Result<()>>,
}

pub trait ExecChannel: Send + Sync {
    fn spawn(
        &self,
        command: &RemoteCommand,
    ) -> impl Future<Output = anyhow::Result<RemoteProcess<'_>>> + Send;
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshSession {
    #[must_use]
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

/// [`ExecChannel`] over an OpenSSH master connection.
#[derive(Debug, Clone)]
pub struct SshChannel {
    session: Arc<openssh::Session>,
    host: String,
}

impl SshChannel {
    #[instrument]
    pub async fn connect(session: &SshSession) -> anyhow::Result<Self> {
        let destination = session.destination();
        tracing::debug!("Connecting to SSH destination: {}", destination);
        let ssh = openssh::Session::connect(&destination, openssh::KnownHosts::Accept)
            .await
            .with_context(|| format!("Failed to establish SSH connection to {destination}"))?;
        Ok(Self {
            session: Arc::new(ssh),
            host: session.host.clone(),
        })
    }

    /// Shut down the master connection once no process is using it anymore
    pub async fn close(self) -> anyhow::Result<()> {
        match Arc::try_unwrap(self.session) {
            Ok(session) => session
                .close()
                .await
                .context("Failed to close SSH connection"),
            Err(_) => {
                tracing::debug!("SSH connection to {} still in use, not closing", self.host);
                Ok(())
            }
        }
    }
}

impl ExecChannel for SshChannel {
    #[instrument(skip(self))]
    async fn spawn(&self, command: &RemoteCommand) -> anyhow::Result<RemoteProcess<'_>> {
        tracing::info!("Starting `{}` on {}", command, self.host);
        let mut cmd = match command {
            RemoteCommand::Exec { program, args } => {
                let mut cmd = self.session.clone().arc_command(program.as_str());
                cmd.args(args);
                cmd
            }
            RemoteCommand::Subsystem(name) => {
                openssh::Session::to_subsystem(self.session.clone(), name.as_str())
            }
        };
        let mut child = cmd
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .with_context(|| format!("Failed to spawn `{command}` on {}", self.host))?;
        let stdin = child
            .stdin()
            .take()
            .context("Failed to capture stdin of remote command")?;
        let stdout = child
            .stdout()
            .take()
            .context("Failed to capture stdout of remote command")?;
        let stderr = child
            .stderr()
            .take()
            .context("Failed to capture stderr of remote command")?;
        let exit = wait_for_remote_process(child, stderr, command.to_string());
        Ok(RemoteProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit: Box::pin(exit),
        })
    }
}

#[instrument(skip(process, stderr))]
async fn wait_for_remote_process(
    process: openssh::Child<Arc<openssh::Session>>,
    mut stderr: openssh::ChildStderr,
    command: String,
) -> anyhow::Result<()> {
    let mut captured = Vec::new();
    // stderr has to be read while waiting or the remote can block on a full pipe
    let (status, stderr_read) = tokio::join!(process.wait(), stderr.read_to_end(&mut captured));
    if let Err(error) = stderr_read {
        tracing::debug!("Failed reading stderr of `{}`: {:#}", command, &error);
    }
    let status = status.with_context(|| format!("Failed to wait for `{command}` completion"))?;
    tracing::debug!("`{}` exited with {:?}", command, status);
    if !status.success() {
        let status = match status.code() {
            Some(code) => format!("status code {code}"),
            None => "no status code".to_string(),
        };
        return Err(ProtocolError::RemoteExit {
            command,
            status,
            stderr: String::from_utf8_lossy(&captured).trim_end().to_string(),
        }
        .into());
    }
    Ok(())
}
