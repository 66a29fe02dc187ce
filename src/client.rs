use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::listing::{DirectoryEntry, is_relative_name, parse_listing};
use crate::navigator::Navigator;
use crate::session::{BlockCallback, Session};
use crate::transfer::{DEFAULT_BLOCK_SIZE, LogProgress, ProgressSink, TransferProgress};

/// What `put_*` does when the transfer itself fails
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Propagate,
    /// Log the failure and report zero bytes stored
    Suppress,
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub block_size: usize,
    pub upload_failures: FailurePolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            upload_failures: FailurePolicy::Propagate,
        }
    }
}

/// One remote session together with its own working-directory model.
pub struct Client<S: Session> {
    session: S,
    navigator: Navigator,
    options: ClientOptions,
    progress: Box<dyn ProgressSink>,
}

impl<S: Session> Client<S> {
    pub fn new(session: S) -> Self {
        Self::with_options(session, ClientOptions::default())
    }

    pub fn with_options(session: S, options: ClientOptions) -> Self {
        Self {
            session,
            navigator: Navigator::new(),
            options,
            progress: Box::new(LogProgress),
        }
    }

    pub fn set_progress_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress = sink;
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn cd(&mut self, path: &str) -> Result<String> {
        self.navigator.cd(&mut self.session, path)
    }

    pub fn descend(&mut self, path: &str, force: bool) -> Result<String> {
        self.navigator.descend(&mut self.session, path, force)
    }

    pub fn ascend(&mut self, levels: usize) -> Result<String> {
        self.navigator.ascend(&mut self.session, levels)
    }

    /// Working directory as tracked locally
    pub fn pwd(&self) -> String {
        self.navigator.pwd()
    }

    /// Working directory as reported by the server
    pub fn remote_pwd(&mut self) -> Result<String> {
        self.session.present_working_directory()
    }

    pub fn list_names(&mut self, path: &str, remove_relative: bool) -> Result<Vec<String>> {
        let mut names = self.session.list_names(path)?;
        if remove_relative {
            names.retain(|name| !is_relative_name(name));
        }
        Ok(names)
    }

    pub fn list_entries(&mut self, path: &str, remove_relative: bool) -> Result<Vec<DirectoryEntry>> {
        let mut lines = Vec::new();
        self.session
            .list_raw(path, &mut |line| lines.push(line.to_string()))?;
        let mut entries = parse_listing(&lines);
        if remove_relative {
            entries.retain(|entry| !entry.is_relative());
        }
        debug!("Listed {}: {} entries", path, entries.len());
        Ok(entries)
    }

    /// Download `remote` into `writer`, returning the number of bytes written.
    pub fn get(&mut self, remote: &str, writer: &mut dyn Write) -> Result<u64> {
        let total_size = self.session.size(remote)?;
        let mut progress = TransferProgress::new(base_name(remote), total_size, &mut *self.progress);
        let mut write_error: Option<std::io::Error> = None;

        self.session
            .receive_binary(&format!("RETR {remote}"), &mut |block| {
                if write_error.is_some() {
                    return;
                }
                match writer.write_all(block) {
                    Ok(()) => progress.record(block.len()),
                    Err(e) => write_error = Some(e),
                }
            })?;

        if let Some(e) = write_error {
            return Err(Error::Io(e));
        }
        debug!("Downloaded {} ({} bytes)", remote, progress.bytes_written());
        Ok(progress.bytes_written())
    }

    pub fn get_bytes(&mut self, remote: &str) -> Result<Vec<u8>> {
        let mut contents = Vec::new();
        self.get(remote, &mut contents)?;
        Ok(contents)
    }

    /// Download into a local file. On failure the partial file is removed.
    pub fn get_to_path(&mut self, remote: &str, local: &Path) -> Result<u64> {
        let file = File::create(local)?;
        let fetched = self.get_into_file(remote, file);
        if fetched.is_err() {
            if let Err(e) = fs::remove_file(local) {
                warn!("Could not remove partial download {}: {}", local.display(), e);
            }
        }
        fetched
    }

    fn get_into_file(&mut self, remote: &str, file: File) -> Result<u64> {
        let mut writer = BufWriter::new(file);
        let written = self.get(remote, &mut writer)?;
        writer.flush()?;
        Ok(written)
    }

    /// Upload a local file. A `remote` ending in `/` keeps the local file name.
    pub fn put_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let policy = self.options.upload_failures;
        self.put_file_with(local, remote, policy)
    }

    /// Like [`Client::put_file`], but a failed transfer is always an `Err`
    /// whatever the configured [`FailurePolicy`].
    pub(crate) fn upload_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        self.put_file_with(local, remote, FailurePolicy::Propagate)
    }

    fn put_file_with(&mut self, local: &Path, remote: &str, policy: FailurePolicy) -> Result<u64> {
        let local_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Validation(format!("Not a file: {}", local.display())))?;
        let (remote_dir, remote_file) = split_remote(remote, Some(&local_name))?;

        let file = File::open(local)?;
        let total_size = file.metadata()?.len();
        let mut reader = BufReader::with_capacity(self.options.block_size, file);
        self.put_reader(&mut reader, total_size, &remote_dir, &remote_file, policy)
    }

    pub fn put_bytes(&mut self, contents: &[u8], remote: &str) -> Result<u64> {
        let (remote_dir, remote_file) = split_remote(remote, None)?;
        let mut reader = contents;
        let policy = self.options.upload_failures;
        self.put_reader(&mut reader, contents.len() as u64, &remote_dir, &remote_file, policy)
    }

    fn put_reader(
        &mut self,
        reader: &mut dyn Read,
        total_size: u64,
        remote_dir: &str,
        remote_file: &str,
        policy: FailurePolicy,
    ) -> Result<u64> {
        let origin = self.session.present_working_directory()?;
        let snapshot = self.navigator.clone();

        let stored = self.store(reader, total_size, remote_dir, remote_file);
        let restored = self.return_to(&origin, snapshot);

        let size = match stored {
            Ok(size) => size,
            Err(e) if policy == FailurePolicy::Suppress => {
                warn!("Upload of {}/{} failed: {}", remote_dir, remote_file, e);
                0
            }
            Err(e) => return Err(e),
        };
        restored?;
        Ok(size)
    }

    fn store(
        &mut self,
        reader: &mut dyn Read,
        total_size: u64,
        remote_dir: &str,
        remote_file: &str,
    ) -> Result<u64> {
        if !remote_dir.is_empty() {
            self.navigator.descend(&mut self.session, remote_dir, true)?;
        }

        let mut progress = TransferProgress::new(remote_file, total_size, &mut *self.progress);
        let on_block: BlockCallback<'_> = &mut |block| progress.record(block.len());
        self.session
            .send_binary(&format!("STOR {remote_file}"), reader, Some(on_block))?;

        let size = self.session.size(remote_file)?;
        debug!("Uploaded {} ({} bytes)", remote_file, size);
        Ok(size)
    }

    fn return_to(&mut self, origin: &str, snapshot: Navigator) -> Result<()> {
        if let Err(e) = self.session.change_directory(origin) {
            warn!("Could not return to {}: {}", origin, e);
            return Err(Error::not_found(origin, e));
        }
        self.navigator.restore(snapshot);
        Ok(())
    }

    /// Delete a remote file, or an empty directory when `DELE` is refused.
    /// `false` when the server refused both.
    pub fn delete(&mut self, path: &str) -> bool {
        let Err(e) = self.session.delete(path) else {
            return true;
        };
        debug!("DELE {} failed, trying RMD: {}", path, e);
        match self.session.remove_directory(path) {
            Ok(()) => true,
            Err(e) => {
                debug!("Delete of {} failed: {}", path, e);
                false
            }
        }
    }

    /// Whether the server lets us change into `path`. The working directory
    /// is put back afterwards.
    pub fn is_folder(&mut self, path: &str) -> Result<bool> {
        let origin = self.session.present_working_directory()?;
        if let Err(e) = self.session.change_directory(path) {
            debug!("{} is not a folder: {}", path, e);
            return Ok(false);
        }
        self.session
            .change_directory(&origin)
            .map_err(|e| Error::not_found(origin.as_str(), e))?;
        Ok(true)
    }

    /// Anything that is not a folder, a missing path included.
    pub fn is_file(&mut self, path: &str) -> Result<bool> {
        Ok(!self.is_folder(path)?)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.session.rename(from, to)
    }

    pub fn remove_directory(&mut self, path: &str) -> Result<()> {
        self.session.remove_directory(path)
    }

    pub fn make_directory(&mut self, path: &str) -> Result<()> {
        self.session.make_directory(path)
    }

    /// Best-effort teardown: `quit`, falling back to a hard close. Never fails.
    pub fn close(&mut self) {
        if let Err(e) = self.session.quit() {
            warn!("QUIT failed, closing connection: {}", e);
            if let Err(e) = self.session.close() {
                warn!("Closing connection failed: {}", e);
            }
        }
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Split a remote target into `(directory, file name)`.
fn split_remote(remote: &str, local_name: Option<&str>) -> Result<(String, String)> {
    if let Some(dir) = remote.strip_suffix('/') {
        let name = local_name.ok_or_else(|| {
            Error::Validation(format!("Remote path {remote} needs a file name"))
        })?;
        return Ok((dir.to_string(), name.to_string()));
    }
    match remote.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() => Ok((
            if dir.is_empty() { "/".to_string() } else { dir.to_string() },
            name.to_string(),
        )),
        Some(_) => Err(Error::Validation(format!("Remote path {remote} needs a file name"))),
        None if remote.is_empty() => {
            Err(Error::Validation("Remote path cannot be empty".to_string()))
        }
        None => Ok((String::new(), remote.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use crate::transfer::{NoProgress, ProgressUpdate};
    use rand::RngCore;

    fn client(session: MemorySession) -> Client<MemorySession> {
        let mut client = Client::new(session);
        client.set_progress_sink(Box::new(NoProgress));
        client
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(
            split_remote("a/b/c.txt", None).unwrap(),
            ("a/b".to_string(), "c.txt".to_string())
        );
        assert_eq!(
            split_remote("c.txt", None).unwrap(),
            (String::new(), "c.txt".to_string())
        );
        assert_eq!(
            split_remote("/c.txt", None).unwrap(),
            ("/".to_string(), "c.txt".to_string())
        );
        assert_eq!(
            split_remote("up/", Some("local.bin")).unwrap(),
            ("up".to_string(), "local.bin".to_string())
        );
        assert!(split_remote("up/", None).is_err());
        assert!(split_remote("", None).is_err());
    }

    #[test]
    fn test_put_bytes_returns_remote_size() {
        let remote = MemorySession::new();
        let mut client = client(remote.attach());
        let contents = random_bytes(128);

        let size = client.put_bytes(&contents, "foobar.txt").unwrap();

        assert_eq!(size, 128);
        assert_eq!(remote.file("foobar.txt"), Some(contents));
    }

    #[test]
    fn test_put_creates_directories_and_restores_cwd() {
        let remote = MemorySession::new();
        remote.add_dir("start");
        let mut client = client(remote.attach());
        client.cd("start").unwrap();

        client.put_bytes(b"data", "photos/nature/pic.raw").unwrap();

        assert_eq!(remote.file("start/photos/nature/pic.raw"), Some(b"data".to_vec()));
        assert_eq!(client.pwd(), "start");
        assert_eq!(client.remote_pwd().unwrap(), "/start");
    }

    #[test]
    fn test_put_file_uses_local_name_for_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report.csv");
        std::fs::write(&local, b"a,b,c").unwrap();
        let remote = MemorySession::new();
        let mut client = client(remote.attach());

        let size = client.put_file(&local, "uploads/").unwrap();

        assert_eq!(size, 5);
        assert_eq!(remote.file("uploads/report.csv"), Some(b"a,b,c".to_vec()));
    }

    #[test]
    fn test_put_failure_propagates_and_restores_cwd() {
        let remote = MemorySession::new();
        remote.fail_transfers_of("bad.bin");
        let mut client = client(remote.attach());

        let err = client.put_bytes(b"x", "deep/bad.bin").unwrap_err();

        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(client.pwd(), "");
        assert_eq!(client.remote_pwd().unwrap(), "/");
    }

    #[test]
    fn test_put_failure_suppressed_when_configured() {
        let remote = MemorySession::new();
        remote.fail_transfers_of("bad.bin");
        let options = ClientOptions {
            upload_failures: FailurePolicy::Suppress,
            ..ClientOptions::default()
        };
        let mut client = Client::with_options(remote.attach(), options);
        client.set_progress_sink(Box::new(NoProgress));

        assert_eq!(client.put_bytes(b"x", "bad.bin").unwrap(), 0);
        assert_eq!(remote.file("bad.bin"), None);
    }

    #[test]
    fn test_upload_file_ignores_suppress_policy() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("bad.bin");
        std::fs::write(&local, b"payload").unwrap();
        let remote = MemorySession::new();
        remote.fail_transfers_of("bad.bin");
        let options = ClientOptions {
            upload_failures: FailurePolicy::Suppress,
            ..ClientOptions::default()
        };
        let mut client = Client::with_options(remote.attach(), options);
        client.set_progress_sink(Box::new(NoProgress));

        assert_eq!(client.put_file(&local, "up/").unwrap(), 0);
        let err = client.upload_file(&local, "up/").unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(client.remote_pwd().unwrap(), "/");
    }

    #[test]
    fn test_get_bytes_and_progress() {
        let remote = MemorySession::new();
        let contents = random_bytes(20_000);
        remote.add_file("dir/blob.bin", &contents);
        let mut client = Client::new(remote.attach());
        let (tx, rx) = std::sync::mpsc::channel();
        client.set_progress_sink(Box::new(move |u: &ProgressUpdate| {
            let _ = tx.send(u.percent);
        }));

        let fetched = client.get_bytes("dir/blob.bin").unwrap();

        assert_eq!(fetched, contents);
        // 8192-byte blocks over 20000 bytes
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![40, 81, 100]);
    }

    #[test]
    fn test_get_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemorySession::new();
        let contents = random_bytes(128);
        remote.add_file("remote_file.txt", &contents);
        let mut client = client(remote.attach());
        let local = dir.path().join("local_copy.txt");

        let written = client.get_to_path("remote_file.txt", &local).unwrap();

        assert_eq!(written, 128);
        assert_eq!(std::fs::read(&local).unwrap(), contents);
    }

    #[test]
    fn test_get_to_path_removes_partial_file_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemorySession::new();
        remote.add_file("broken.bin", &random_bytes(64));
        remote.fail_transfers_of("broken.bin");
        let mut client = client(remote.attach());
        let local = dir.path().join("broken.bin");

        assert!(client.get_to_path("broken.bin", &local).is_err());
        assert!(!local.exists());
    }

    #[test]
    fn test_list_names_and_entries_filter_relative() {
        let remote = MemorySession::new();
        remote.add_file("a.txt", b"1");
        remote.add_file("b.txt", b"22");
        let mut client = client(remote.attach());

        assert_eq!(client.list_names(".", false).unwrap().len(), 4);
        assert_eq!(client.list_names(".", true).unwrap(), vec!["a.txt", "b.txt"]);

        let entries = client.list_entries(".", true).unwrap();
        let sizes: Vec<(String, u64)> = entries.into_iter().map(|e| (e.name, e.size)).collect();
        assert_eq!(sizes, vec![("a.txt".to_string(), 1), ("b.txt".to_string(), 2)]);
    }

    #[test]
    fn test_delete_reports_outcome() {
        let remote = MemorySession::new();
        remote.add_file("delete_file.txt", b"x");
        let mut client = client(remote.attach());
        assert!(client.delete("delete_file.txt"));
        assert!(!client.delete("photos/nature/remote.txt"));
    }

    #[test]
    fn test_delete_falls_back_to_remove_directory() {
        let remote = MemorySession::new();
        remote.add_dir("empty");
        remote.add_file("full/keep.txt", b"x");
        let mut client = client(remote.attach());

        assert!(client.delete("empty"));
        assert!(!remote.is_dir("empty"));
        assert!(
            client
                .session()
                .history()
                .ends_with(&["DELE empty".to_string(), "RMD empty".to_string()])
        );

        assert!(!client.delete("full"));
        assert!(remote.is_dir("full"));
    }

    #[test]
    fn test_is_file_and_is_folder() {
        let remote = MemorySession::new();
        remote.add_file("photos/nature/pic.raw", b"raw");
        let mut client = client(remote.attach());
        client.cd("photos").unwrap();

        assert!(client.is_folder("nature").unwrap());
        assert!(!client.is_file("nature").unwrap());
        assert!(client.is_file("nature/pic.raw").unwrap());
        assert!(!client.is_folder("nature/pic.raw").unwrap());
        assert!(client.is_file("missing").unwrap());

        assert_eq!(client.remote_pwd().unwrap(), "/photos");
        assert_eq!(client.pwd(), "photos");
    }

    #[test]
    fn test_close_falls_back_to_hard_close() {
        let mut session = MemorySession::new();
        session.fail_quit();
        let mut client = client(session);
        client.close();
        assert!(client.session().is_closed());
    }

    #[test]
    fn test_close_never_raises_when_both_fail() {
        let mut session = MemorySession::new();
        session.fail_quit();
        session.fail_close();
        let mut client = client(session);
        client.close();
        assert!(!client.session().is_closed());
    }
}
