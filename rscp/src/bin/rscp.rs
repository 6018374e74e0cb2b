use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::instrument;

use rscp_tools_rscp::path;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rscp",
    version,
    about = "Copy files to and from remote hosts using the scp protocol over SSH",
    long_about = "`rscp` copies a file or a directory tree between the local machine and a remote host.

One of the two paths must be remote, written as `[user@]host[:port]:path`. Remote paths that are not absolute start at the login directory. The SSH connection uses the system `ssh` client and its configuration.

By default the transfer runs the scp protocol against a remote scp binary. With --sftp the sftp subsystem is used instead, which also recreates symlinks.

EXAMPLES:
    # Upload a directory tree into /srv/www
    rscp ./build deploy@web1:/srv/www/ --summary

    # Upload a file under a new name
    rscp report.pdf web1:/tmp/report-final.pdf

    # Download a remote directory to a local path
    rscp web1:/var/log/nginx ./nginx-logs

    # Print a remote file on stdout
    rscp web1:/etc/hostname -

    # Non-standard port and scp location
    rscp ./data user@host:2222:/data --remote-binary /opt/bin/scp"
)]
struct Args {
    // Transfer options
    /// Use the sftp subsystem instead of a remote scp binary
    #[arg(long, help_heading = "Transfer options")]
    sftp: bool,

    /// Path of the scp binary on the remote host
    #[arg(
        long,
        default_value = remote::DEFAULT_REMOTE_BINARY,
        value_name = "PATH",
        help_heading = "Transfer options"
    )]
    remote_binary: String,

    // Progress & output
    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    /// Source path, local or `[user@]host[:port]:path`
    #[arg(value_name = "SRC")]
    src: String,

    /// Destination path, local or `[user@]host[:port]:path`; `-` writes a remote file to stdout
    #[arg(value_name = "DST")]
    dst: String,
}

const STDOUT: &str = "-";

impl Args {
    fn output(&self) -> common::OutputConfig {
        common::OutputConfig {
            quiet: self.quiet,
            verbose: self.verbose,
            print_summary: self.summary,
        }
    }

    fn config(&self) -> remote::Config {
        remote::Config {
            backend: if self.sftp {
                remote::Backend::Sftp
            } else {
                remote::Backend::Scp
            },
            remote_binary: self.remote_binary.clone(),
        }
    }
}

#[instrument(skip(config))]
async fn upload(
    config: remote::Config,
    src: &std::path::Path,
    dst: &path::RemotePath,
) -> anyhow::Result<common::Summary> {
    let target = path::resolve_upload_destination(src, dst.path())?;
    let client = connect(dst.session(), config).await?;
    tracing::info!("uploading {:?} to {:?}", src, target);
    let result = client.send(src, &target).await;
    finish(client, result).await
}

#[instrument(skip(config))]
async fn download(
    config: remote::Config,
    src: &path::RemotePath,
    dst: &std::path::Path,
) -> anyhow::Result<common::Summary> {
    let client = connect(src.session(), config).await?;
    tracing::info!("downloading {:?} to {:?}", src.path(), dst);
    let result = client.recv(src.path(), dst).await;
    finish(client, result).await
}

#[instrument(skip(config))]
async fn download_to_stdout(
    config: remote::Config,
    src: &path::RemotePath,
) -> anyhow::Result<common::Summary> {
    let client = connect(src.session(), config).await?;
    let mut stdout = tokio::io::stdout();
    let result = client.recv_stream(src.path(), &mut stdout).await;
    finish(client, result).await
}

async fn connect(
    session: &remote::SshSession,
    config: remote::Config,
) -> anyhow::Result<remote::Client<remote::SshChannel>> {
    let channel = remote::SshChannel::connect(session).await?;
    let client = remote::Client::new(channel, config);
    tracing::debug!(
        "using {:?} backend on {}",
        client.config().backend,
        session.host
    );
    Ok(client)
}

async fn finish(
    client: remote::Client<remote::SshChannel>,
    result: anyhow::Result<common::Summary>,
) -> anyhow::Result<common::Summary> {
    let closed = client.into_channel().close().await;
    let summary = result?;
    if let Err(error) = closed {
        tracing::warn!("{:#}", error);
    }
    Ok(summary)
}

async fn async_main(args: Args) -> anyhow::Result<common::Summary> {
    let src = path::parse_path(&args.src).context("invalid source path")?;
    let to_stdout = args.dst == STDOUT;
    let dst = if to_stdout {
        path::PathType::Local(STDOUT.into())
    } else {
        path::parse_path(&args.dst).context("invalid destination path")?
    };
    match (src, dst) {
        (path::PathType::Remote(src), path::PathType::Local(_)) if to_stdout => {
            if args.output().wants_summary() {
                return Err(anyhow!(
                    "--summary and --verbose cannot be used when writing to stdout"
                ));
            }
            download_to_stdout(args.config(), &src).await
        }
        (path::PathType::Local(src), path::PathType::Remote(dst)) => {
            upload(args.config(), &src, &dst).await
        }
        (path::PathType::Remote(src), path::PathType::Local(dst)) => {
            download(args.config(), &src, &dst).await
        }
        (path::PathType::Local(_), path::PathType::Local(_)) => Err(anyhow!(
            "Neither {:?} nor {:?} is a remote path, use `[user@]host:path` for one of them",
            args.src,
            args.dst
        )),
        (path::PathType::Remote(_), path::PathType::Remote(_)) => Err(anyhow!(
            "Copying between two remote hosts is not supported: {:?} -> {:?}",
            args.src,
            args.dst
        )),
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let output = args.output();
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
