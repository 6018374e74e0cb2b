/// Counters accumulated by a single transfer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub files_transferred: usize,
    pub directories_transferred: usize,
    pub symlinks_created: usize,
}

impl Summary {
    #[must_use]
    pub fn file(size: u64) -> Self {
        Self {
            bytes_transferred: size,
            files_transferred: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn directory() -> Self {
        Self {
            directories_transferred: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn symlink() -> Self {
        Self {
            symlinks_created: 1,
            ..Default::default()
        }
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            files_transferred: self.files_transferred + other.files_transferred,
            directories_transferred: self.directories_transferred
                + other.directories_transferred,
            symlinks_created: self.symlinks_created + other.symlinks_created,
        }
    }
}

impl std::ops::AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            files transferred: {}\n\
            directories transferred: {}\n\
            symlinks created: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.files_transferred,
            self.directories_transferred,
            self.symlinks_created,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summaries_add_up() {
        let mut total = Summary::directory();
        total += Summary::file(5);
        total += Summary::file(7);
        total = total + Summary::symlink();
        assert_eq!(
            total,
            Summary {
                bytes_transferred: 12,
                files_transferred: 2,
                directories_transferred: 1,
                symlinks_created: 1,
            }
        );
    }

    #[test]
    fn display_lists_every_counter() {
        let text = (Summary::file(1024) + Summary::directory()).to_string();
        assert!(text.contains("files transferred: 1"));
        assert!(text.contains("directories transferred: 1"));
        assert!(text.contains("symlinks created: 0"));
        assert!(text.starts_with("bytes transferred: "));
    }
}
