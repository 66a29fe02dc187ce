//! [`Session`] backed by a live FTP control connection.

use std::cell::RefCell;
use std::io::Read;

use ftp::FtpStream;
use ftp::types::FileType;
use tracing::{debug, info};

use super::{BlockCallback, CallbackReader, DirectoryOps, Session, forward_blocks, split_command};
use crate::config::ServerProfile;
use crate::error::{Error, Result};
use crate::transfer::DEFAULT_BLOCK_SIZE;

fn remote_err(e: ftp::FtpError) -> Error {
    Error::Remote(e.to_string())
}

pub struct FtpSession {
    stream: Option<FtpStream>,
    block_size: usize,
}

impl FtpSession {
    /// Connect, log in and switch the session to binary mode.
    pub fn connect(profile: &ServerProfile) -> Result<Self> {
        profile.validate()?;
        info!(
            "Creating FTP session: {}@{}",
            profile.username,
            profile.host_port()
        );

        let mut stream = FtpStream::connect(profile.host_port()).map_err(remote_err)?;
        stream
            .login(&profile.username, &profile.password)
            .map_err(remote_err)?;
        stream.transfer_type(FileType::Binary).map_err(remote_err)?;

        Ok(Self {
            stream: Some(stream),
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    fn stream(&mut self) -> Result<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Remote("FTP session is closed".to_string()))
    }
}

impl DirectoryOps for FtpSession {
    fn change_directory(&mut self, path: &str) -> Result<()> {
        debug!("FTP CWD {}", path);
        self.stream()?.cwd(path).map_err(remote_err)
    }

    fn make_directory(&mut self, path: &str) -> Result<()> {
        debug!("FTP MKD {}", path);
        self.stream()?.mkdir(path).map_err(remote_err)
    }
}

impl Session for FtpSession {
    fn remove_directory(&mut self, path: &str) -> Result<()> {
        self.stream()?.rmdir(path).map_err(remote_err)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.stream()?.rm(path).map_err(remote_err)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.stream()?.rename(from, to).map_err(remote_err)
    }

    fn size(&mut self, path: &str) -> Result<u64> {
        self.stream()?
            .size(path)
            .map_err(remote_err)?
            .map(|size| size as u64)
            .ok_or_else(|| Error::Remote(format!("Server did not report a size for {path}")))
    }

    fn send_binary(
        &mut self,
        command: &str,
        reader: &mut dyn Read,
        on_block: Option<BlockCallback<'_>>,
    ) -> Result<()> {
        let (verb, name) = split_command(command)?;
        if verb != "STOR" {
            return Err(Error::Validation(format!("Unsupported upload command: {verb}")));
        }
        debug!("FTP STOR {}", name);
        let mut reader = CallbackReader::new(reader, on_block);
        self.stream()?.put(name, &mut reader).map_err(remote_err)
    }

    fn receive_binary(&mut self, command: &str, on_block: BlockCallback<'_>) -> Result<()> {
        let (verb, path) = split_command(command)?;
        if verb != "RETR" {
            return Err(Error::Validation(format!("Unsupported download command: {verb}")));
        }
        debug!("FTP RETR {}", path);
        let block_size = self.block_size;
        // `retr` wants an `Fn` reader, the callback is `FnMut`.
        let on_block = RefCell::new(on_block);
        let received = self
            .stream()?
            .retr(path, |reader| {
                let mut on_block = on_block.borrow_mut();
                forward_blocks(reader, block_size, &mut **on_block)
                    .map_err(ftp::FtpError::ConnectionError)
            })
            .map_err(remote_err)?;
        debug!("FTP RETR {} done ({} bytes)", path, received);
        Ok(())
    }

    fn list_names(&mut self, path: &str) -> Result<Vec<String>> {
        self.stream()?.nlst(Some(path)).map_err(remote_err)
    }

    fn list_raw(&mut self, path: &str, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        for line in self.stream()?.list(Some(path)).map_err(remote_err)? {
            on_line(&line);
        }
        Ok(())
    }

    fn present_working_directory(&mut self) -> Result<String> {
        self.stream()?.pwd().map_err(remote_err)
    }

    fn quit(&mut self) -> Result<()> {
        let result = self.stream()?.quit().map_err(remote_err);
        if result.is_ok() {
            self.stream = None;
        }
        result
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the stream shuts the control socket.
        self.stream.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a running ftp server"]
    fn test_connect_local_server() {
        let profile = ServerProfile::new(
            "local".to_string(),
            "127.0.0.1".to_string(),
            2121,
            "ftpuser".to_string(),
            "ftppass".to_string(),
        );
        let mut session = FtpSession::connect(&profile).unwrap();
        let mut lines = Vec::new();
        session
            .list_raw(".", &mut |line| lines.push(line.to_string()))
            .unwrap();
        println!("listing: {:?}", lines);
        session.quit().unwrap();
    }
}
