//! Control messages of the legacy scp wire protocol.
//!
//! Every message starts with a single tag byte. `Ok` is the bare tag, every
//! other message carries one line of text terminated by `\n`. File bodies are
//! not messages: they follow a `C` header as raw bytes and end with a `0x00`
//! byte, which the receiving side reads back as an `Ok` status.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Permission bits carried in entry headers
pub const MODE_MASK: u32 = 0o7777;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Ok,
    Warning,
    Error,
    FileHeader,
    DirHeader,
    DirEnd,
}

impl Tag {
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Tag::Ok => 0x00,
            Tag::Warning => 0x01,
            Tag::Error => 0x02,
            Tag::FileHeader => b'C',
            Tag::DirHeader => b'D',
            Tag::DirEnd => b'E',
        }
    }

    /// Warnings and errors both abort the exchange they answer
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Tag::Warning | Tag::Error)
    }
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;
    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Tag::Ok),
            0x01 => Ok(Tag::Warning),
            0x02 => Ok(Tag::Error),
            b'C' => Ok(Tag::FileHeader),
            b'D' => Ok(Tag::DirHeader),
            b'E' => Ok(Tag::DirEnd),
            other => Err(ProtocolError::InvalidTag(other)),
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Tag::Ok => "ok",
            Tag::Warning => "warning",
            Tag::Error => "error",
            Tag::FileHeader => "file header",
            Tag::DirHeader => "directory header",
            Tag::DirEnd => "directory end",
        };
        f.write_str(name)
    }
}

/// Errors raised by the wire protocol itself, as opposed to I/O failures.
///
/// `Peer` displays the remote text verbatim so callers see exactly what the
/// remote side reported.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid protocol tag {0:#04x}")]
    InvalidTag(u8),
    #[error("malformed entry header {0:?}")]
    MalformedHeader(String),
    #[error("unexpected {0} message")]
    Unexpected(Tag),
    #[error("directory end without a matching directory header")]
    UnmatchedDirEnd,
    #[error("{0}")]
    Peer(String),
    #[error("unexpected end of stream: expected {expected} bytes, got {actual}")]
    ShortBody { expected: u64, actual: u64 },
    #[error("remote command `{command}` failed with {status}: {stderr}")]
    RemoteExit {
        command: String,
        status: String,
        stderr: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    tag: Tag,
    text: String,
}

impl Message {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            tag: Tag::Ok,
            text: String::new(),
        }
    }

    #[must_use]
    pub fn warning(text: &str) -> Self {
        Self::with_line(Tag::Warning, text)
    }

    #[must_use]
    pub fn error(text: &str) -> Self {
        Self::with_line(Tag::Error, text)
    }

    #[must_use]
    pub fn file(mode: u32, size: u64, name: &str) -> Self {
        Self {
            tag: Tag::FileHeader,
            text: format!("{:04o} {} {}", mode & MODE_MASK, size, name),
        }
    }

    #[must_use]
    pub fn dir(mode: u32, name: &str) -> Self {
        Self {
            tag: Tag::DirHeader,
            text: format!("{:04o} 0 {}", mode & MODE_MASK, name),
        }
    }

    #[must_use]
    pub fn dir_end() -> Self {
        Self {
            tag: Tag::DirEnd,
            text: String::new(),
        }
    }

    // the text travels as a single line, an embedded newline would end it early
    fn with_line(tag: Tag, text: &str) -> Self {
        Self {
            tag,
            text: text.replace('\n', " "),
        }
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.tag.is_failure()
    }

    /// Turn a warning or error into the matching [`ProtocolError::Peer`].
    ///
    /// An empty failure text is replaced by the tag name, e.g. `remote warning`.
    pub fn into_result(self) -> Result<Self, ProtocolError> {
        if !self.is_failure() {
            return Ok(self);
        }
        if self.text.is_empty() {
            return Err(ProtocolError::Peer(format!("remote {}", self.tag)));
        }
        Err(ProtocolError::Peer(self.text))
    }

    /// Parse the text of a `C` or `D` message
    pub fn entry_header(&self) -> Result<EntryHeader, ProtocolError> {
        match self.tag {
            Tag::FileHeader | Tag::DirHeader => self.text.parse(),
            other => Err(ProtocolError::Unexpected(other)),
        }
    }

    /// Wire encoding: the tag byte, then for everything but `Ok` the text and `\n`
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 2);
        bytes.push(self.tag.as_byte());
        if self.tag != Tag::Ok {
            bytes.extend_from_slice(self.text.as_bytes());
            bytes.push(b'\n');
        }
        bytes
    }
}

/// Payload of a `C` (file) or `D` (directory) message: `MMMM SIZE NAME`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

impl std::str::FromStr for EntryHeader {
    type Err = ProtocolError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedHeader(text.to_string());
        let fields: Vec<&str> = text.split_whitespace().collect();
        let [mode, size, name] = fields.as_slice() else {
            return Err(malformed());
        };
        let mode = u32::from_str_radix(mode, 8).map_err(|_| malformed())?;
        let size = size.parse::<u64>().map_err(|_| malformed())?;
        // a name must stay inside the directory it is received into
        if *name == "." || *name == ".." || name.contains('/') {
            return Err(malformed());
        }
        Ok(Self {
            mode: mode & MODE_MASK,
            size,
            name: name.to_string(),
        })
    }
}

/// Read one control message.
///
/// End of stream before the tag byte reads as `Ok`. End of stream in the
/// middle of a message line keeps a warning or error with whatever text
/// arrived and collapses any other tag to `Ok`. Only this function applies
/// that policy.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Message> {
    let mut tag = [0u8; 1];
    if reader.read(&mut tag).await? == 0 {
        return Ok(Message::ok());
    }
    let tag = Tag::try_from(tag[0])?;
    if tag == Tag::Ok {
        return Ok(Message::ok());
    }
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    if line.last() != Some(&b'\n') {
        if tag.is_failure() {
            return Ok(Message {
                tag,
                text: String::from_utf8_lossy(&line).into_owned(),
            });
        }
        return Ok(Message::ok());
    }
    line.pop();
    Ok(Message {
        tag,
        text: String::from_utf8_lossy(&line).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bare_ok() {
        assert_eq!(Message::ok().encode(), vec![0u8]);
    }

    #[test]
    fn encodes_failures_as_lines() {
        assert_eq!(Message::warning("careful").encode(), b"\x01careful\n".to_vec());
        assert_eq!(Message::error("bad\nthing").encode(), b"\x02bad thing\n".to_vec());
    }

    #[test]
    fn encodes_entry_headers() {
        assert_eq!(
            Message::file(0o100644, 5, "a.txt").encode(),
            b"C0644 5 a.txt\n".to_vec()
        );
        assert_eq!(Message::dir(0o40755, "d").encode(), b"D0755 0 d\n".to_vec());
        assert_eq!(Message::dir_end().encode(), b"E\n".to_vec());
        assert_eq!(Message::file(0o4755, 0, "suid").text(), "4755 0 suid");
    }

    #[test]
    fn parses_entry_header() -> anyhow::Result<()> {
        let header: EntryHeader = "0640 1234 report.pdf".parse()?;
        assert_eq!(
            header,
            EntryHeader {
                mode: 0o640,
                size: 1234,
                name: "report.pdf".to_string(),
            }
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed_headers() {
        for text in [
            "",
            "0644 5",
            "0644 5 two words",
            "0944 5 a.txt",
            "0644 -1 a.txt",
            "0644 five a.txt",
            "0644 5 ..",
            "0644 5 .",
            "0644 5 ../escape",
        ] {
            let result = text.parse::<EntryHeader>();
            assert!(
                matches!(result, Err(ProtocolError::MalformedHeader(_))),
                "{text:?} should be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn entry_header_requires_header_tag() {
        assert!(matches!(
            Message::dir_end().entry_header(),
            Err(ProtocolError::Unexpected(Tag::DirEnd))
        ));
    }

    #[test]
    fn failures_become_peer_errors() {
        let error = Message::error("scp: /nope: No such file or directory")
            .into_result()
            .unwrap_err();
        assert_eq!(error.to_string(), "scp: /nope: No such file or directory");
        assert!(Message::ok().into_result().is_ok());
    }

    #[tokio::test]
    async fn empty_failure_text_names_the_tag() -> anyhow::Result<()> {
        let mut input: &[u8] = b"\x01";
        let error = read_message(&mut input).await?.into_result().unwrap_err();
        assert_eq!(error.to_string(), "remote warning");
        let error = Message::error("").into_result().unwrap_err();
        assert_eq!(error.to_string(), "remote error");
        Ok(())
    }

    #[tokio::test]
    async fn clean_eof_reads_as_ok() -> anyhow::Result<()> {
        let mut input: &[u8] = b"";
        assert_eq!(read_message(&mut input).await?, Message::ok());
        Ok(())
    }

    #[tokio::test]
    async fn warning_cut_short_keeps_its_tag() -> anyhow::Result<()> {
        let mut input: &[u8] = b"\x01";
        let message = read_message(&mut input).await?;
        assert_eq!(message.tag(), Tag::Warning);
        assert_eq!(message.text(), "");
        let mut input: &[u8] = b"\x02disk fu";
        let message = read_message(&mut input).await?;
        assert_eq!(message.tag(), Tag::Error);
        assert_eq!(message.text(), "disk fu");
        Ok(())
    }

    #[tokio::test]
    async fn header_cut_short_reads_as_ok() -> anyhow::Result<()> {
        let mut input: &[u8] = b"C0644 5 a.t";
        assert_eq!(read_message(&mut input).await?, Message::ok());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_unknown_tag() {
        let mut input: &[u8] = b"X0644 5 a.txt\n";
        let error = read_message(&mut input).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::InvalidTag(b'X'))
        ));
    }

    #[tokio::test]
    async fn header_read_leaves_body_in_stream() -> anyhow::Result<()> {
        let mut input: &[u8] = b"C0644 5 a.txt\nhello\0E\n";
        let message = read_message(&mut input).await?;
        assert_eq!(message.tag(), Tag::FileHeader);
        assert_eq!(message.entry_header()?.size, 5);
        let mut body = [0u8; 5];
        input.read_exact(&mut body).await?;
        assert_eq!(&body, b"hello");
        assert_eq!(read_message(&mut input).await?, Message::ok());
        assert_eq!(read_message(&mut input).await?.tag(), Tag::DirEnd);
        Ok(())
    }
}
