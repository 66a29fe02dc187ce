//! An in-memory remote server.
//!
//! Sessions created with [`MemorySession::attach`] share one directory tree
//! but keep their own working directory, just like separate connections to
//! the same FTP server. Listings are rendered in `ls -l` form so the parser
//! is exercised end to end.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveDateTime};

use super::{BlockCallback, DirectoryOps, Session, forward_blocks, split_command};
use crate::error::{Error, Result};
use crate::transfer::DEFAULT_BLOCK_SIZE;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(String),
}

#[derive(Debug, Default)]
struct Tree {
    // Keyed by absolute path without the leading slash; "" is the root.
    nodes: BTreeMap<String, Node>,
    failing: HashSet<String>,
    // File name -> bytes actually sent on RETR
    truncated: HashMap<String, usize>,
    broken_listings: HashSet<String>,
    extra_lines: HashMap<String, Vec<String>>,
    disconnects: usize,
}

#[derive(Debug, Default)]
struct Faults {
    quit: bool,
    close: bool,
}

pub struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    cwd: Vec<String>,
    modified: NaiveDateTime,
    history: Vec<String>,
    faults: Faults,
    closed: bool,
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySession {
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(String::new(), Node::Dir);
        Self::with_tree(Arc::new(Mutex::new(tree)))
    }

    fn with_tree(tree: Arc<Mutex<Tree>>) -> Self {
        let modified = NaiveDate::from_ymd_opt(2020, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        Self {
            tree,
            cwd: Vec::new(),
            modified,
            history: Vec::new(),
            faults: Faults::default(),
            closed: false,
        }
    }

    /// Open another session onto the same remote tree.
    pub fn attach(&self) -> Self {
        Self::with_tree(Arc::clone(&self.tree))
    }

    /// Create a directory and any missing parents.
    pub fn add_dir(&self, path: &str) {
        let mut tree = self.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_key(&current, segment);
            tree.nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    /// Create a file, creating parent directories as needed.
    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let key = normalize_key(path);
        if let Some((parent, _)) = key.rsplit_once('/') {
            self.add_dir(parent);
        }
        self.lock().nodes.insert(key, Node::File(contents.to_vec()));
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let key = normalize_key(path);
        if let Some((parent, _)) = key.rsplit_once('/') {
            self.add_dir(parent);
        }
        self.lock()
            .nodes
            .insert(key, Node::Symlink(target.to_string()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&normalize_key(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.lock().nodes.get(&normalize_key(path)), Some(Node::Dir))
    }

    /// Make every transfer touching a file with this name fail.
    pub fn fail_transfers_of(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Send only the first `keep` bytes when a file with this name is retrieved.
    pub fn truncate_transfers_of(&self, name: &str, keep: usize) {
        self.lock().truncated.insert(name.to_string(), keep);
    }

    /// Make `LIST` of this directory fail.
    pub fn fail_listing_of(&self, dir: &str) {
        self.lock().broken_listings.insert(normalize_key(dir));
    }

    /// Append a raw line to every `LIST` of `dir`.
    pub fn add_listing_line(&self, dir: &str, line: &str) {
        self.lock()
            .extra_lines
            .entry(normalize_key(dir))
            .or_default()
            .push(line.to_string());
    }

    pub fn fail_quit(&mut self) {
        self.faults.quit = true;
    }

    pub fn fail_close(&mut self) {
        self.faults.close = true;
    }

    /// Commands issued so far, e.g. `CWD photos` or `MKD nature`.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sessions on this tree that have been shut down so far.
    pub fn disconnected_sessions(&self) -> usize {
        self.lock().disconnects
    }

    fn disconnect(&mut self) {
        self.closed = true;
        self.lock().disconnects += 1;
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, path: &str) -> Vec<String> {
        let mut segments = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd.clone()
        };
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other.to_string()),
            }
        }
        segments
    }

    fn resolve_key(&self, path: &str) -> String {
        self.resolve(path).join("/")
    }

    fn check_failing(&self, key: &str) -> Result<()> {
        let name = key.rsplit('/').next().unwrap_or(key);
        if self.lock().failing.contains(name) {
            return Err(Error::Remote(format!("451 Transfer aborted: {name}")));
        }
        Ok(())
    }

    fn render(&self, name: &str, node: &Node) -> String {
        let stamp = self.modified.format("%b %d %Y");
        match node {
            Node::Dir => format!("drwxr-xr-x 2 ftp ftp 4096 {stamp} {name}"),
            Node::File(data) => format!("-rw-r--r-- 1 ftp ftp {} {stamp} {name}", data.len()),
            Node::Symlink(target) => {
                format!("lrwxrwxrwx 1 ftp ftp {} {stamp} {name} -> {target}", target.len())
            }
        }
    }

    fn children(&self, dir_key: &str) -> Vec<(String, Node)> {
        let tree = self.lock();
        tree.nodes
            .iter()
            .filter(|(key, _)| !key.is_empty() && parent_key(key) == dir_key)
            .map(|(key, node)| (key.rsplit('/').next().unwrap_or(key).to_string(), node.clone()))
            .collect()
    }
}

impl DirectoryOps for MemorySession {
    fn change_directory(&mut self, path: &str) -> Result<()> {
        self.history.push(format!("CWD {path}"));
        let segments = self.resolve(path);
        let key = segments.join("/");
        match self.lock().nodes.get(&key) {
            Some(Node::Dir) => {}
            _ => return Err(Error::Remote(format!("550 {path}: No such directory"))),
        }
        self.cwd = segments;
        Ok(())
    }

    fn make_directory(&mut self, path: &str) -> Result<()> {
        self.history.push(format!("MKD {path}"));
        let key = self.resolve_key(path);
        let mut tree = self.lock();
        if tree.nodes.contains_key(&key) {
            return Err(Error::Remote(format!("550 {path}: File exists")));
        }
        if !matches!(tree.nodes.get(parent_key(&key)), Some(Node::Dir)) {
            return Err(Error::Remote(format!("550 {path}: No such directory")));
        }
        tree.nodes.insert(key, Node::Dir);
        Ok(())
    }
}

impl Session for MemorySession {
    fn remove_directory(&mut self, path: &str) -> Result<()> {
        self.history.push(format!("RMD {path}"));
        let key = self.resolve_key(path);
        if !self.children(&key).is_empty() {
            return Err(Error::Remote(format!("550 {path}: Directory not empty")));
        }
        let mut tree = self.lock();
        match tree.nodes.get(&key) {
            Some(Node::Dir) if !key.is_empty() => {
                tree.nodes.remove(&key);
                Ok(())
            }
            _ => Err(Error::Remote(format!("550 {path}: No such directory"))),
        }
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        self.history.push(format!("DELE {path}"));
        let key = self.resolve_key(path);
        let mut tree = self.lock();
        match tree.nodes.get(&key) {
            Some(Node::File(_)) | Some(Node::Symlink(_)) => {
                tree.nodes.remove(&key);
                Ok(())
            }
            _ => Err(Error::Remote(format!("550 {path}: No such file"))),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.history.push(format!("RNFR {from}"));
        let from_key = self.resolve_key(from);
        let to_key = self.resolve_key(to);
        let mut tree = self.lock();
        if tree.nodes.contains_key(&to_key) {
            return Err(Error::Remote(format!("553 {to}: File exists")));
        }
        let moved: Vec<String> = tree
            .nodes
            .keys()
            .filter(|k| **k == from_key || k.starts_with(&format!("{from_key}/")))
            .cloned()
            .collect();
        if moved.is_empty() || from_key.is_empty() {
            return Err(Error::Remote(format!("550 {from}: No such file")));
        }
        for key in moved {
            if let Some(node) = tree.nodes.remove(&key) {
                let renamed = format!("{to_key}{}", &key[from_key.len()..]);
                tree.nodes.insert(renamed, node);
            }
        }
        Ok(())
    }

    fn size(&mut self, path: &str) -> Result<u64> {
        self.history.push(format!("SIZE {path}"));
        let key = self.resolve_key(path);
        match self.lock().nodes.get(&key) {
            Some(Node::File(data)) => Ok(data.len() as u64),
            _ => Err(Error::Remote(format!("550 {path}: No such file"))),
        }
    }

    fn send_binary(
        &mut self,
        command: &str,
        reader: &mut dyn Read,
        mut on_block: Option<BlockCallback<'_>>,
    ) -> Result<()> {
        self.history.push(command.to_string());
        let (verb, name) = split_command(command)?;
        if verb != "STOR" {
            return Err(Error::Remote(format!("502 {verb} not implemented")));
        }
        let key = self.resolve_key(name);
        self.check_failing(&key)?;

        let mut data = Vec::new();
        let mut buf = vec![0u8; DEFAULT_BLOCK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(cb) = on_block.as_mut() {
                cb(&buf[..n]);
            }
        }

        let mut tree = self.lock();
        if !matches!(tree.nodes.get(parent_key(&key)), Some(Node::Dir)) {
            return Err(Error::Remote(format!("553 {name}: No such directory")));
        }
        if matches!(tree.nodes.get(&key), Some(Node::Dir)) {
            return Err(Error::Remote(format!("553 {name}: Is a directory")));
        }
        tree.nodes.insert(key, Node::File(data));
        Ok(())
    }

    fn receive_binary(&mut self, command: &str, on_block: BlockCallback<'_>) -> Result<()> {
        self.history.push(command.to_string());
        let (verb, path) = split_command(command)?;
        if verb != "RETR" {
            return Err(Error::Remote(format!("502 {verb} not implemented")));
        }
        let key = self.resolve_key(path);
        self.check_failing(&key)?;

        let tree = self.lock();
        let mut data = match tree.nodes.get(&key) {
            Some(Node::File(data)) => data.clone(),
            _ => return Err(Error::Remote(format!("550 {path}: No such file"))),
        };
        let name = key.rsplit('/').next().unwrap_or(&key);
        if let Some(&keep) = tree.truncated.get(name) {
            data.truncate(keep);
        }
        drop(tree);

        forward_blocks(&mut &data[..], DEFAULT_BLOCK_SIZE, on_block)?;
        Ok(())
    }

    fn list_names(&mut self, path: &str) -> Result<Vec<String>> {
        self.history.push(format!("NLST {path}"));
        let key = self.resolve_key(path);
        if !matches!(self.lock().nodes.get(&key), Some(Node::Dir)) {
            return Err(Error::Remote(format!("550 {path}: No such directory")));
        }
        let mut names = vec![".".to_string(), "..".to_string()];
        names.extend(self.children(&key).into_iter().map(|(name, _)| name));
        Ok(names)
    }

    fn list_raw(&mut self, path: &str, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        self.history.push(format!("LIST {path}"));
        let key = self.resolve_key(path);
        let extra = {
            let tree = self.lock();
            if tree.broken_listings.contains(&key) {
                return Err(Error::Remote(format!("451 {path}: Listing aborted")));
            }
            if !matches!(tree.nodes.get(&key), Some(Node::Dir)) {
                return Err(Error::Remote(format!("550 {path}: No such directory")));
            }
            tree.extra_lines.get(&key).cloned().unwrap_or_default()
        };
        let children = self.children(&key);
        on_line(&format!("total {}", children.len() + extra.len()));
        on_line(&self.render(".", &Node::Dir));
        on_line(&self.render("..", &Node::Dir));
        for (name, node) in &children {
            on_line(&self.render(name, node));
        }
        for line in &extra {
            on_line(line);
        }
        Ok(())
    }

    fn present_working_directory(&mut self) -> Result<String> {
        Ok(format!("/{}", self.cwd.join("/")))
    }

    fn quit(&mut self) -> Result<()> {
        self.history.push("QUIT".to_string());
        if self.faults.quit {
            return Err(Error::Remote("421 Connection lost during QUIT".to_string()));
        }
        self.disconnect();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.faults.close {
            return Err(Error::Remote("Socket already closed".to_string()));
        }
        self.disconnect();
        Ok(())
    }
}

fn normalize_key(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn join_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_key(key: &str) -> &str {
    key.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}
