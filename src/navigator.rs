//! Client-side model of the remote working directory.
//!
//! The navigator keeps a stack of path segments relative to the session
//! root and only changes it after the server accepted the matching
//! directory change. [`Navigator::descend`] is not atomic:
//! segments entered before a failure stay on the stack, because the remote
//! side has already moved there.

use tracing::debug;

use crate::error::{Error, Result};
use crate::session::DirectoryOps;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Navigator {
    segments: Vec<String>,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change directory with a single remote call; the stack is untouched
    /// on failure.
    pub fn cd<D: DirectoryOps + ?Sized>(&mut self, ops: &mut D, path: &str) -> Result<String> {
        ops.change_directory(path)
            .map_err(|e| Error::not_found(path, e))?;
        self.apply(path);
        debug!("cd {} -> /{}", path, self.pwd());
        Ok(self.pwd())
    }

    /// Walk `path` one segment at a time, creating missing segments when
    /// `force` is set.
    pub fn descend<D: DirectoryOps + ?Sized>(
        &mut self,
        ops: &mut D,
        path: &str,
        force: bool,
    ) -> Result<String> {
        if path.starts_with('/') {
            ops.change_directory("/")
                .map_err(|e| Error::not_found("/", e))?;
            self.segments.clear();
        }

        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                if self.segments.is_empty() {
                    return Err(Error::InvalidAscend {
                        requested: 1,
                        depth: 0,
                    });
                }
                ops.change_directory(segment)
                    .map_err(|e| Error::not_found(segment, e))?;
                self.segments.pop();
                continue;
            }

            if let Err(e) = ops.change_directory(segment) {
                if !force {
                    return Err(Error::not_found(self.child_path(segment), e));
                }
                debug!("Creating missing remote directory: {}", self.child_path(segment));
                // Another session may have created it in the meantime.
                if let Err(e) = ops.make_directory(segment) {
                    debug!("MKD {} failed: {}", segment, e);
                }
                ops.change_directory(segment)
                    .map_err(|e| Error::not_found(self.child_path(segment), e))?;
            }
            self.segments.push(segment.to_string());
        }

        Ok(self.pwd())
    }

    /// Go up `levels` directories with one chained `..` call.
    pub fn ascend<D: DirectoryOps + ?Sized>(&mut self, ops: &mut D, levels: usize) -> Result<String> {
        if levels > self.segments.len() {
            return Err(Error::InvalidAscend {
                requested: levels,
                depth: self.segments.len(),
            });
        }
        if levels == 0 {
            return Ok(self.pwd());
        }

        let path = vec![".."; levels].join("/");
        ops.change_directory(&path)
            .map_err(|e| Error::not_found(path.as_str(), e))?;
        self.segments.truncate(self.segments.len() - levels);
        Ok(self.pwd())
    }

    pub fn pwd(&self) -> String {
        self.segments.join("/")
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn reset(&mut self) {
        self.segments.clear();
    }

    /// Replace the stack with a previously taken snapshot.
    pub fn restore(&mut self, snapshot: Navigator) {
        *self = snapshot;
    }

    fn apply(&mut self, path: &str) {
        if path.starts_with('/') {
            self.segments.clear();
        }
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    self.segments.pop();
                }
                other => self.segments.push(other.to_string()),
            }
        }
    }

    fn child_path(&self, segment: &str) -> String {
        if self.segments.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.pwd(), segment)
        }
    }
}
