//
// Copyright 2023 The Playground Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The abstract git surface.
//!
//! The engines never shell out to git themselves; the CI step (or a test
//! double) provides this capability. Serialization across concurrent runs is
//! the hosting platform's job, so the surface is deliberately small:
//! read a file at a ref, commit a batch of files, push a branch.

use std::collections::BTreeMap;

use crate::errors::Result;

pub trait GitSurface {
    /// Read `path` at `gitref`; `None` when the file does not exist there.
    fn read_file(&self, gitref: &str, path: &str) -> Result<Option<Vec<u8>>>;

    /// Record the given files as a single commit on the current branch.
    /// Atomicity of a publish step comes from batching here.
    fn commit(&mut self, files: &[(String, Vec<u8>)], message: &str) -> Result<()>;

    /// Push the current branch head to `branch` on the configured remote.
    fn push(&mut self, branch: &str) -> Result<()>;

    /// Whether `branch` already exists on the remote.
    fn branch_exists(&self, branch: &str) -> Result<bool>;
}

/// In-memory git double used by the test suites and by dry runs.
///
/// Tracks one "current branch" plus named branches, each a flat
/// path -> bytes map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryGit {
    head: BTreeMap<String, Vec<u8>>,
    branches: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    pub commit_messages: Vec<String>,
    pub pushed: Vec<String>,
}

impl InMemoryGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file on the current head, as if it had been committed earlier.
    pub fn seed(&mut self, path: &str, bytes: Vec<u8>) {
        self.head.insert(path.to_string(), bytes);
    }

    /// Snapshot the current head into a named branch (e.g. "main").
    pub fn tag_branch(&mut self, branch: &str) {
        self.branches.insert(branch.to_string(), self.head.clone());
    }

    pub fn branch(&self, branch: &str) -> Option<&BTreeMap<String, Vec<u8>>> {
        self.branches.get(branch)
    }
}

impl GitSurface for InMemoryGit {
    fn read_file(&self, gitref: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = if gitref == "HEAD" {
            &self.head
        } else {
            match self.branches.get(gitref) {
                Some(tree) => tree,
                None => return Ok(None),
            }
        };
        Ok(tree.get(path).cloned())
    }

    fn commit(&mut self, files: &[(String, Vec<u8>)], message: &str) -> Result<()> {
        for (path, bytes) in files {
            self.head.insert(path.clone(), bytes.clone());
        }
        self.commit_messages.push(message.to_string());
        Ok(())
    }

    fn push(&mut self, branch: &str) -> Result<()> {
        self.branches.insert(branch.to_string(), self.head.clone());
        self.pushed.push(branch.to_string());
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branches.contains_key(branch))
    }
}
