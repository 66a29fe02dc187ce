//! The remote session surface the rest of the crate is written against.
//!
//! The capability set is closed: navigation, tree transfer and the pool only
//! ever reach the server through these methods.

pub mod ftp;
pub mod memory;

use std::io::{ErrorKind, Read};

use crate::error::Result;

pub use ftp::FtpSession;
pub use memory::MemorySession;

/// Per-block hook invoked during binary transfers
pub type BlockCallback<'a> = &'a mut dyn FnMut(&[u8]);

/// The two directory primitives the navigator needs.
pub trait DirectoryOps {
    fn change_directory(&mut self, path: &str) -> Result<()>;
    fn make_directory(&mut self, path: &str) -> Result<()>;
}

/// A single remote file-transfer session.
///
/// Binary transfers take an FTP-style command: `"STOR <name>"` uploads into
/// the current directory, `"RETR <path>"` downloads.
pub trait Session: DirectoryOps + Send {
    fn remove_directory(&mut self, path: &str) -> Result<()>;
    fn delete(&mut self, path: &str) -> Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    fn size(&mut self, path: &str) -> Result<u64>;

    fn send_binary(
        &mut self,
        command: &str,
        reader: &mut dyn Read,
        on_block: Option<BlockCallback<'_>>,
    ) -> Result<()>;

    fn receive_binary(&mut self, command: &str, on_block: BlockCallback<'_>) -> Result<()>;

    fn list_names(&mut self, path: &str) -> Result<Vec<String>>;

    /// Invoke `on_line` once per raw `LIST` line.
    fn list_raw(&mut self, path: &str, on_line: &mut dyn FnMut(&str)) -> Result<()>;

    fn present_working_directory(&mut self) -> Result<String>;

    /// Polite disconnect
    fn quit(&mut self) -> Result<()>;

    /// Hard close, used when `quit` fails
    fn close(&mut self) -> Result<()>;
}

/// Split a transfer command into its verb and argument.
pub(crate) fn split_command(command: &str) -> Result<(&str, &str)> {
    command
        .split_once(' ')
        .map(|(verb, arg)| (verb, arg.trim()))
        .filter(|(_, arg)| !arg.is_empty())
        .ok_or_else(|| crate::Error::Validation(format!("Malformed transfer command: {command}")))
}

/// Wraps a reader and reports every chunk it yields.
pub(crate) struct CallbackReader<'r, 'c> {
    inner: &'r mut dyn Read,
    on_block: Option<BlockCallback<'c>>,
}

impl<'r, 'c> CallbackReader<'r, 'c> {
    pub(crate) fn new(inner: &'r mut dyn Read, on_block: Option<BlockCallback<'c>>) -> Self {
        Self { inner, on_block }
    }
}

impl Read for CallbackReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(cb) = self.on_block.as_mut() {
                cb(&buf[..n]);
            }
        }
        Ok(n)
    }
}

/// Read `reader` to the end in chunks of at most `block_size` bytes, handing
/// each chunk to `on_block` as soon as it arrives.
pub(crate) fn forward_blocks(
    reader: &mut dyn Read,
    block_size: usize,
    on_block: BlockCallback<'_>,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; block_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        on_block(&buf[..n]);
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("STOR a.txt").unwrap(), ("STOR", "a.txt"));
        assert_eq!(
            split_command("RETR dir/multi word.txt").unwrap(),
            ("RETR", "dir/multi word.txt")
        );
        assert!(split_command("STOR").is_err());
        assert!(split_command("STOR   ").is_err());
    }

    #[test]
    fn test_callback_reader_reports_blocks() {
        let data = vec![7u8; 100];
        let mut source = std::io::Cursor::new(data.clone());
        let mut seen = 0usize;
        let mut cb = |block: &[u8]| seen += block.len();
        let mut out = Vec::new();
        {
            let mut reader = CallbackReader::new(&mut source, Some(&mut cb));
            reader.read_to_end(&mut out).unwrap();
        }
        assert_eq!(out, data);
        assert_eq!(seen, 100);
    }

    #[test]
    fn test_forward_blocks_respects_block_size() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut sizes = Vec::new();
        let mut received = Vec::new();
        let total = forward_blocks(&mut &data[..], 300, &mut |block| {
            sizes.push(block.len());
            received.extend_from_slice(block);
        })
        .unwrap();

        assert_eq!(total, 1000);
        assert_eq!(sizes, vec![300, 300, 300, 100]);
        assert_eq!(received, data);
    }

    #[test]
    fn test_forward_blocks_surfaces_read_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset"))
            }
        }
        let mut calls = 0;
        let err = forward_blocks(&mut Broken, 16, &mut |_| calls += 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert_eq!(calls, 0);
    }
}
