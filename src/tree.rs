//! Recursive mirroring of directory trees between the local disk and a
//! remote session.
//!
//! Both directions isolate failures per entry: a child that cannot be
//! transferred is recorded as a [`TransferError`] and its siblings are still
//! processed. Nothing is rolled back, so a returned error list describes
//! exactly what is missing on the destination side.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};

use glob::Pattern;
use serde::Serialize;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::listing::EntryKind;
use crate::session::Session;

/// A per-entry failure recorded during a tree transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferError {
    pub source: String,
    pub destination: String,
    pub message: String,
}

impl TransferError {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, message: impl ToString) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}: {}", self.source, self.destination, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOutcome {
    /// Destination root as given by the caller
    pub root: String,
    pub errors: Vec<TransferError>,
}

impl TreeOutcome {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Called once per local directory with its child names; returns the names
/// to skip at that level.
pub type IgnoreFn<'a> = &'a dyn Fn(&Path, &[String]) -> HashSet<String>;

/// Upload `local_root` into `remote_root`.
///
/// Symlinks are never followed. Failing to read `local_root` itself is the
/// only error returned as `Err`.
pub fn upload_tree<S: Session>(
    client: &mut Client<S>,
    local_root: &Path,
    remote_root: &str,
    ignore: Option<IgnoreFn<'_>>,
) -> Result<TreeOutcome> {
    let errors = upload_dir(client, local_root, remote_root, ignore)?;
    Ok(TreeOutcome {
        root: remote_root.to_string(),
        errors,
    })
}

fn upload_dir<S: Session>(
    client: &mut Client<S>,
    local_dir: &Path,
    remote_dir: &str,
    ignore: Option<IgnoreFn<'_>>,
) -> Result<Vec<TransferError>> {
    let mut names = fs::read_dir(local_dir)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<Vec<_>>>()?;
    names.sort();

    let ignored = ignore.map(|f| f(local_dir, &names)).unwrap_or_default();

    if let Err(e) = client.make_directory(remote_dir) {
        debug!("Remote directory {} not created (assumed to exist): {}", remote_dir, e);
    }

    let mut errors = Vec::new();
    for name in names.iter().filter(|name| !ignored.contains(*name)) {
        let local_path = local_dir.join(name);
        let remote_path = join_remote(remote_dir, name);
        let source = local_path.display().to_string();

        let file_type = match fs::symlink_metadata(&local_path) {
            Ok(meta) => meta.file_type(),
            Err(e) => {
                errors.push(TransferError::new(source, remote_path, e));
                continue;
            }
        };

        if file_type.is_symlink() {
            debug!("Skipping symlink {}", source);
        } else if file_type.is_dir() {
            match upload_dir(client, &local_path, &remote_path, ignore) {
                Ok(nested) => errors.extend(nested),
                Err(e) => errors.push(TransferError::new(source, remote_path, e)),
            }
        } else if let Err(e) = client.upload_file(&local_path, &remote_path) {
            errors.push(TransferError::new(source, remote_path, e));
        }
    }
    Ok(errors)
}

/// Mirror `remote_root` into `local_root`, creating local directories as
/// needed. Only regular files and directories are transferred.
pub fn download_tree<S: Session>(
    client: &mut Client<S>,
    remote_root: &str,
    local_root: &Path,
) -> Result<TreeOutcome> {
    fs::create_dir_all(local_root)?;
    let errors = download_dir(client, remote_root, local_root)?;
    Ok(TreeOutcome {
        root: local_root.display().to_string(),
        errors,
    })
}

fn download_dir<S: Session>(
    client: &mut Client<S>,
    remote_dir: &str,
    local_dir: &Path,
) -> Result<Vec<TransferError>> {
    let entries = client.list_entries(remote_dir, true)?;

    let mut errors = Vec::new();
    for entry in entries {
        let remote_path = join_remote(remote_dir, &entry.name);
        if !is_plain_name(&entry.name) {
            warn!("Refusing to mirror {}: not a plain file name", remote_path);
            errors.push(TransferError::new(
                remote_path,
                local_dir.display().to_string(),
                format!("unsafe entry name {:?}", entry.name),
            ));
            continue;
        }
        let local_path = local_dir.join(&entry.name);
        let destination = local_path.display().to_string();

        match entry.kind {
            EntryKind::Directory => {
                if let Err(e) = fs::create_dir_all(&local_path) {
                    errors.push(TransferError::new(remote_path, destination, e));
                    continue;
                }
                match download_dir(client, &remote_path, &local_path) {
                    Ok(nested) => errors.extend(nested),
                    Err(e) => errors.push(TransferError::new(remote_path, destination, e)),
                }
            }
            EntryKind::File => match client.get_to_path(&remote_path, &local_path) {
                Ok(written) if written == entry.size => {}
                Ok(written) => errors.push(TransferError::new(
                    remote_path,
                    destination,
                    format!("size mismatch: listed {} bytes, received {}", entry.size, written),
                )),
                Err(e) => errors.push(TransferError::new(remote_path, destination, e)),
            },
            other => debug!("Skipping {} ({:?})", remote_path, other),
        }
    }
    Ok(errors)
}

/// A listing name that stays inside the directory it is joined onto.
fn is_plain_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Build an ignore callback from glob patterns matched against child names.
pub fn ignore_patterns<P: AsRef<str>>(
    patterns: &[P],
) -> Result<impl Fn(&Path, &[String]) -> HashSet<String> + use<P>> {
    let patterns = patterns
        .iter()
        .map(|p| {
            Pattern::new(p.as_ref())
                .map_err(|e| Error::Validation(format!("Invalid ignore pattern {:?}: {}", p.as_ref(), e)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(move |_dir: &Path, names: &[String]| -> HashSet<String> {
        names
            .iter()
            .filter(|name| patterns.iter().any(|p| p.matches(name)))
            .cloned()
            .collect()
    })
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
