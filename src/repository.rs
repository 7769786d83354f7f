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

//! The repository working-tree surface.
//!
//! One [`Repository`] instance covers one engine invocation: it is opened
//! with the invocation's `now` and owns the tree for that duration. Reads
//! and writes go through role files under `metadata/`; the caller commits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{PlaygroundError, Result};
use crate::metadata::{
    verify_role, Metadata, RoleName, RoleSet, Signature, TargetFile, VerificationOutcome,
};

/// Name of the signer-written file mirroring open invites for CI.
pub const EVENT_STATE_FILE: &str = ".signing-event-state";

/// Whether a write must satisfy the delegating threshold.
///
/// On an event branch signatures accumulate over several pushes, so
/// under-threshold states are persisted there; `main` never accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRequirement {
    Enforced,
    PartialEvent,
}

/// Paths of one repository checkout: `metadata/`, `targets/` and the
/// versioned root history.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkingTree { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn targets_dir(&self) -> PathBuf {
        self.root.join("targets")
    }

    pub fn root_history_dir(&self) -> PathBuf {
        self.metadata_dir().join("root_history")
    }

    pub fn role_path(&self, role: &RoleName) -> PathBuf {
        self.metadata_dir().join(role.filename())
    }

    pub fn event_state_path(&self) -> PathBuf {
        self.root.join(EVENT_STATE_FILE)
    }
}

/// The repository surface over one working tree.
pub struct Repository {
    tree: WorkingTree,
    now: DateTime<Utc>,
}

impl Repository {
    /// Open a working tree. `now` is the single clock reading for this
    /// invocation; every expiry computed here derives from it.
    pub fn open(tree: WorkingTree, now: DateTime<Utc>) -> Self {
        Repository { tree, now }
    }

    pub fn tree(&self) -> &WorkingTree {
        &self.tree
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The roles present in the tree, in evaluation order.
    pub fn list_roles(&self) -> Result<Vec<RoleName>> {
        let set = self.role_set()?;
        Ok(set.role_names().cloned().collect())
    }

    /// Parse the whole tree into a [`RoleSet`].
    pub fn role_set(&self) -> Result<RoleSet> {
        RoleSet::load_dir(&self.tree.metadata_dir())
    }

    pub fn read_role(&self, role: &RoleName) -> Result<Metadata> {
        self.try_read_role(role)?.ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("{} does not exist", role.filename()))
        })
    }

    pub fn try_read_role(&self, role: &RoleName) -> Result<Option<Metadata>> {
        let path = self.tree.role_path(role);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(Metadata::from_bytes(&bytes).map_err(|e| {
            PlaygroundError::MalformedMetadata(format!("{}: {e}", path.display()))
        })?))
    }

    /// Persist a role file.
    ///
    /// Under [`SignatureRequirement::Enforced`] the role must satisfy its
    /// delegating threshold; root additionally gets a versioned copy under
    /// `root_history/`.
    pub fn write_role(
        &self,
        role: &RoleName,
        md: &Metadata,
        requirement: SignatureRequirement,
    ) -> Result<()> {
        if requirement == SignatureRequirement::Enforced {
            let set = self.role_set()?;
            // A fresh root delegates itself; everything else must already
            // have its delegator in the tree.
            let delegator_md;
            let delegator = if *role == RoleName::Root {
                md
            } else {
                delegator_md = set.get(&role.delegator()).cloned().ok_or_else(|| {
                    PlaygroundError::InvariantViolation(format!(
                        "cannot write {role}: no {} in tree",
                        role.delegator()
                    ))
                })?;
                &delegator_md
            };
            match verify_role(&delegator.signed, role, md)? {
                VerificationOutcome::Verified { .. } => {}
                VerificationOutcome::Insufficient { valid, threshold } => {
                    return Err(PlaygroundError::InvariantViolation(format!(
                        "refusing to persist {role} with {valid}/{threshold} signatures"
                    )))
                }
                VerificationOutcome::Invalid { keyids } => {
                    return Err(PlaygroundError::SignatureRejected(format!(
                        "{role} carries invalid signatures from {keyids:?}"
                    )))
                }
            }
        }

        fs::create_dir_all(self.tree.metadata_dir())?;
        let bytes = md.to_bytes()?;
        fs::write(self.tree.role_path(role), &bytes)?;

        if *role == RoleName::Root {
            fs::create_dir_all(self.tree.root_history_dir())?;
            let versioned = self
                .tree
                .root_history_dir()
                .join(format!("{}.root.json", md.signed.version()));
            fs::write(versioned, &bytes)?;
        }
        Ok(())
    }

    pub fn delete_role(&self, role: &RoleName) -> Result<()> {
        let path = self.tree.role_path(role);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Build the bumped successor of `role` in memory: version + 1, expiry
    /// reset from the role's expiry period, all other signed content
    /// preserved, signatures reset to placeholders for the current
    /// delegation.
    pub fn prepare_bump(&self, role: &RoleName) -> Result<Metadata> {
        let set = self.role_set()?;
        let mut md = self.read_role(role)?;
        let days = set.expiry_period_days(role)?;

        md.signed.set_version(md.signed.version() + 1);
        md.signed
            .set_expires(self.now + chrono::Duration::days(days));

        md.signatures.clear();
        if let Some(delegation) = set
            .delegator_of(role)
            .and_then(|d| d.signed.delegation(role))
        {
            for (keyid, _) in &delegation.keys {
                md.signatures.push(Signature::placeholder(keyid));
            }
        }
        Ok(md)
    }

    /// Bump and persist `role` unsigned (an event branch will collect the
    /// signatures). Returns the new version.
    pub fn bump_version(&self, role: &RoleName) -> Result<u32> {
        let md = self.prepare_bump(role)?;
        self.write_role(role, &md, SignatureRequirement::PartialEvent)?;
        debug!(role = %role, version = md.signed.version(), "bumped role version");
        Ok(md.signed.version())
    }

    /// True when `role` is inside its signing window:
    /// `now + signing_period >= expires`.
    pub fn needs_bump(&self, role: &RoleName) -> Result<bool> {
        let set = self.role_set()?;
        let md = self.read_role(role)?;
        let window = set.signing_window(role)?;
        let start = md.signed.expires() - window;
        debug!(role = %role, signing_period_starts = %start, "signing window");
        Ok(self.now + window >= md.signed.expires())
    }

    /// Current versions of targets and every delegated targets role, keyed
    /// by metadata file name (the shape snapshot records).
    pub fn targets_infos(&self) -> Result<BTreeMap<String, u32>> {
        let mut infos = BTreeMap::new();
        let targets = self.read_role(&RoleName::Targets)?;
        infos.insert(RoleName::Targets.filename(), targets.signed.version());
        for role in targets.signed.delegated_role_names() {
            let md = self.read_role(&role)?;
            infos.insert(role.filename(), md.signed.version());
        }
        Ok(infos)
    }

    pub fn snapshot_version(&self) -> Result<u32> {
        Ok(self.read_role(&RoleName::Snapshot)?.signed.version())
    }

    /// Hash every file under `targets/` into per-role target listings.
    /// Top-level files belong to the top-level targets role; files in a
    /// single-level subdirectory belong to the delegated role of that name,
    /// with the directory kept in the target path.
    pub fn scan_targets(&self) -> Result<BTreeMap<RoleName, BTreeMap<String, TargetFile>>> {
        let mut out: BTreeMap<RoleName, BTreeMap<String, TargetFile>> = BTreeMap::new();
        let dir = self.tree.targets_dir();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_file() {
                out.entry(RoleName::Targets)
                    .or_default()
                    .insert(name, TargetFile::from_path(&path)?);
            } else if path.is_dir() {
                for sub in fs::read_dir(&path)? {
                    let sub = sub?;
                    if !sub.path().is_file() {
                        continue;
                    }
                    let target_path =
                        format!("{name}/{}", sub.file_name().to_string_lossy());
                    out.entry(RoleName::Delegated(name.clone()))
                        .or_default()
                        .insert(target_path, TargetFile::from_path(&sub.path())?);
                }
            }
        }
        Ok(out)
    }

    /// Read the `.signing-event-state` mirror: open invites keyed by the
    /// invited handle.
    pub fn read_event_state(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let path = self.tree.event_state_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let invites = value.get("invites").cloned().unwrap_or_default();
        Ok(serde_json::from_value(invites)?)
    }

    /// Write (or remove, when empty) the `.signing-event-state` mirror.
    pub fn write_event_state(&self, invites: &BTreeMap<String, Vec<String>>) -> Result<()> {
        let path = self.tree.event_state_path();
        if invites.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }
        fs::create_dir_all(self.tree.root())?;
        let state = serde_json::json!({ "invites": invites });
        fs::write(path, serde_json::to_vec_pretty(&state)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetaFile, Signed, Snapshot, SPEC_VERSION};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn snapshot_md(version: u32, expires: DateTime<Utc>) -> Metadata {
        Metadata::new(Signed::Snapshot(Snapshot {
            expires,
            meta: [("targets.json".to_string(), MetaFile { version: 1 })]
                .into_iter()
                .collect(),
            spec_version: SPEC_VERSION.to_string(),
            version,
            custom: Default::default(),
        }))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn write_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::open(WorkingTree::new(dir.path()), now());
        let md = snapshot_md(1, now() + chrono::Duration::days(10));

        repo.write_role(&RoleName::Snapshot, &md, SignatureRequirement::PartialEvent)
            .unwrap();
        let loaded = repo.read_role(&RoleName::Snapshot).unwrap();
        assert_eq!(loaded, md);
        assert_eq!(repo.list_roles().unwrap(), vec![RoleName::Snapshot]);
    }

    #[test]
    fn missing_role_is_an_error() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::open(WorkingTree::new(dir.path()), now());
        assert!(repo.try_read_role(&RoleName::Root).unwrap().is_none());
        assert!(repo.read_role(&RoleName::Root).is_err());
    }

    #[test]
    fn enforced_write_rejects_unsigned_online_role() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::open(WorkingTree::new(dir.path()), now());
        let md = snapshot_md(1, now() + chrono::Duration::days(10));
        // No root in the tree, so the delegation cannot be satisfied.
        assert!(repo
            .write_role(&RoleName::Snapshot, &md, SignatureRequirement::Enforced)
            .is_err());
    }

    #[test]
    fn scan_targets_maps_subdirectories_to_delegated_roles() {
        let dir = TempDir::new().unwrap();
        let tree = WorkingTree::new(dir.path());
        fs::create_dir_all(tree.targets_dir().join("project")).unwrap();
        fs::write(tree.targets_dir().join("top.txt"), b"top").unwrap();
        fs::write(tree.targets_dir().join("project/a.txt"), b"aaa").unwrap();

        let repo = Repository::open(tree, now());
        let scanned = repo.scan_targets().unwrap();
        assert!(scanned[&RoleName::Targets].contains_key("top.txt"));
        let delegated = &scanned[&RoleName::Delegated("project".into())];
        assert_eq!(delegated["project/a.txt"].length, 3);
    }

    #[test]
    fn event_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::open(WorkingTree::new(dir.path()), now());
        let mut invites = BTreeMap::new();
        invites.insert("@user2".to_string(), vec!["targets".to_string()]);

        repo.write_event_state(&invites).unwrap();
        assert_eq!(repo.read_event_state().unwrap(), invites);

        repo.write_event_state(&BTreeMap::new()).unwrap();
        assert!(repo.read_event_state().unwrap().is_empty());
        assert!(!repo.tree().event_state_path().exists());
    }
}
