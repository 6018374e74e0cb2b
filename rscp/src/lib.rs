//! `rscp` - copy files to and from a remote host with the scp protocol
//!
//! Exactly one of the two paths names a remote location in the familiar
//! `[user@]host[:port]:path` form:
//!
//! ```bash
//! # upload a directory tree
//! rscp ./build deploy@web1:/srv/www/
//!
//! # download a file into the current directory
//! rscp web1:/var/log/syslog .
//!
//! # print a remote file
//! rscp web1:/etc/hostname -
//!
//! # use the sftp subsystem instead of a remote scp binary
//! rscp --sftp ./notes.txt web1:
//! ```
//!
//! The SSH connection is made with the system `ssh` client, so keys, agents
//! and `~/.ssh/config` apply as usual. Transfers themselves live in the
//! `remote` crate; this crate only turns command line arguments into calls.

pub mod path;
