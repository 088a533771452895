//! TLS key log sink
//!
//! Secrets reported by the proxy are appended in NSS key log format (one line per
//! secret), so captures can be decrypted later by tools that read `SSLKEYLOGFILE`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct KeylogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    lines: u64,
}

impl KeylogWriter {
    /// Open (or create) the key log for appending
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Writing TLS secrets to {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            lines: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Secrets written so far
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Append one secret record; a missing trailing newline is added
    pub fn write_secret(&mut self, secret: &[u8]) -> io::Result<()> {
        if secret.is_empty() {
            return Ok(());
        }
        self.file.write_all(secret)?;
        if !secret.ends_with(b"\n") {
            self.file.write_all(b"\n")?;
        }
        self.file.flush()?;
        self.lines += 1;
        Ok(())
    }

    /// Flush and close the file
    pub fn close(mut self) -> io::Result<()> {
        self.file.flush()?;
        debug!("Closed key log {} after {} secrets", self.path.display(), self.lines);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("sslkeys.log");

        let mut writer = KeylogWriter::open(&path).unwrap();
        writer.write_secret(b"CLIENT_RANDOM aa bb").unwrap();
        writer.write_secret(b"CLIENT_RANDOM cc dd\n").unwrap();
        writer.write_secret(b"").unwrap();
        assert_eq!(writer.lines(), 2);
        writer.close().unwrap();

        let mut writer = KeylogWriter::open(&path).unwrap();
        writer.write_secret(b"CLIENT_RANDOM ee ff").unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "CLIENT_RANDOM aa bb\nCLIENT_RANDOM cc dd\nCLIENT_RANDOM ee ff\n"
        );
    }
}
