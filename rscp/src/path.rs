use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct RemotePath {
    session: remote::SshSession,
    path: PathBuf,
}

impl RemotePath {
    pub fn new(session: remote::SshSession, path: PathBuf) -> Self {
        Self { session, path }
    }

    pub fn session(&self) -> &remote::SshSession {
        &self.session
    }

    /// Path on the remote host; relative paths start at the login directory
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum PathType {
    Local(PathBuf),
    Remote(RemotePath),
}

/// Split `[user@]host[:port]:path` into its parts, anything else is a local path.
///
/// A `/` before the first `:` makes the argument local, so `./a:b` names a
/// local file. An empty remote path (`host:`) means the login directory.
pub fn parse_path(path: &str) -> anyhow::Result<PathType> {
    let re = regex::Regex::new(
        r"^(?:(?P<user>[^@/]+)@)?(?P<host>(?:\[[^\]]+\]|[^:\[\]/]+))(?::(?P<port>\d+))?:(?P<path>.*)$",
    )?;
    let Some(captures) = re.captures(path) else {
        return Ok(PathType::Local(path.into()));
    };
    let user = captures.name("user").map(|m| m.as_str().to_string());
    let host = captures
        .name("host")
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow::anyhow!("missing host in {path:?}"))?;
    let port = match captures.name("port") {
        Some(port) => Some(
            port.as_str()
                .parse::<u16>()
                .map_err(|err| anyhow::anyhow!("invalid port in {path:?}: {err}"))?,
        ),
        None => None,
    };
    let remote_path = captures.name("path").map_or("", |m| m.as_str());
    let remote_path = if remote_path.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(remote_path)
    };
    Ok(PathType::Remote(RemotePath::new(
        remote::SshSession { user, host, port },
        remote_path,
    )))
}

/// Where an upload of `src` lands when the destination is `dst`.
///
/// A destination naming a directory (`dir/`, `.`, `..` or the login
/// directory) receives the source under its own name; anything else is the
/// final name of the copy.
pub fn resolve_upload_destination(src: &Path, dst: &Path) -> anyhow::Result<PathBuf> {
    let raw = dst.as_os_str().to_string_lossy();
    let names_directory = raw.ends_with('/')
        || raw.ends_with("/.")
        || raw.ends_with("/..")
        || raw == "."
        || raw == "..";
    if !names_directory {
        return Ok(dst.to_path_buf());
    }
    let name = src
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Source path {:?} does not have a basename", src))?;
    Ok(dst.join(name))
}
