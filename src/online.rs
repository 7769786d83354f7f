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

//! The online-signing engine.
//!
//! Runs in CI against the committed state of `main`: produces fresh
//! snapshot/timestamp versions, expiry-driven bumps, and the publishable
//! tree downloader clients consume. Online-signing failures are fatal for
//! the run; the CI caller retries. A re-run with unchanged inputs is a
//! no-op.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::clock::CancellationToken;
use crate::errors::{PlaygroundError, Result};
use crate::git::GitSurface;
use crate::metadata::{
    truncate_expiry, MetaFile, Metadata, RoleName, Signed, Snapshot, Timestamp, SPEC_VERSION,
};
use crate::repository::{Repository, SignatureRequirement, WorkingTree};
use crate::signer::SignerRegistry;

/// What one `snapshot()` invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub snapshot_version: Option<u32>,
    pub timestamp_version: Option<u32>,
}

impl SnapshotOutcome {
    pub fn changed(&self) -> bool {
        self.snapshot_version.is_some() || self.timestamp_version.is_some()
    }
}

/// The online repository: one working tree, one clock reading, the signer
/// registry for the online keys.
pub struct OnlineRepository<'a> {
    repo: Repository,
    registry: &'a SignerRegistry,
    cancel: CancellationToken,
}

impl<'a> OnlineRepository<'a> {
    pub fn open(
        tree: WorkingTree,
        registry: &'a SignerRegistry,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        OnlineRepository {
            repo: Repository::open(tree, now),
            registry,
            cancel,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Produce a new snapshot if the recorded targets versions are stale,
    /// and a new timestamp if the snapshot moved or the timestamp entered
    /// its signing window.
    pub fn snapshot(&self) -> Result<SnapshotOutcome> {
        self.cancel.check()?;
        let mut outcome = SnapshotOutcome::default();
        let now = self.repo.now();

        // Targets are read once, before snapshot is signed.
        let targets_infos = self.repo.targets_infos()?;

        let snapshot_md = self.repo.try_read_role(&RoleName::Snapshot)?;
        let (current_version, current_meta) = match &snapshot_md {
            Some(md) => match &md.signed {
                Signed::Snapshot(s) => (s.version, s.meta.clone()),
                _ => {
                    return Err(PlaygroundError::MalformedMetadata(
                        "snapshot.json is not snapshot metadata".to_string(),
                    ))
                }
            },
            None => (0, BTreeMap::new()),
        };

        let new_meta: BTreeMap<String, MetaFile> = targets_infos
            .iter()
            .map(|(name, version)| (name.clone(), MetaFile { version: *version }))
            .collect();

        // Recorded targets versions only ever move forward.
        for (name, meta) in &current_meta {
            if let Some(new) = new_meta.get(name) {
                if new.version < meta.version {
                    return Err(PlaygroundError::VersionRegression {
                        role: name.trim_end_matches(".json").to_string(),
                        old: meta.version,
                        new: new.version,
                    });
                }
            }
        }

        if new_meta != current_meta {
            let days = self.repo.role_set()?.expiry_period_days(&RoleName::Snapshot)?;
            let snapshot = Snapshot {
                expires: truncate_expiry(now + Duration::days(days)),
                meta: new_meta,
                spec_version: SPEC_VERSION.to_string(),
                version: current_version + 1,
                custom: BTreeMap::new(),
            };
            let mut md = Metadata::new(Signed::Snapshot(snapshot));
            self.sign_online(&RoleName::Snapshot, &mut md)?;
            self.cancel.check()?;
            self.repo
                .write_role(&RoleName::Snapshot, &md, SignatureRequirement::Enforced)?;
            info!(version = current_version + 1, "snapshot updated");
            outcome.snapshot_version = Some(current_version + 1);
        } else {
            debug!("snapshot meta unchanged");
        }

        let timestamp_md = self.repo.try_read_role(&RoleName::Timestamp)?;
        let timestamp_due = match &timestamp_md {
            Some(_) => {
                outcome.snapshot_version.is_some() || self.repo.needs_bump(&RoleName::Timestamp)?
            }
            None => true,
        };
        if timestamp_due {
            outcome.timestamp_version = Some(self.write_new_timestamp(timestamp_md.as_ref())?);
        }
        Ok(outcome)
    }

    /// Expiry-driven bumps of the online roles: new versions identical in
    /// content save for version and expiry. Returns the bumped roles, all
    /// committed as one git commit.
    pub fn bump_online(&self, git: &mut dyn GitSurface, push: bool) -> Result<Vec<(RoleName, u32)>> {
        self.cancel.check()?;
        let mut bumped = Vec::new();

        if self.repo.try_read_role(&RoleName::Snapshot)?.is_some()
            && self.repo.needs_bump(&RoleName::Snapshot)?
        {
            let mut md = self.repo.prepare_bump(&RoleName::Snapshot)?;
            self.sign_online(&RoleName::Snapshot, &mut md)?;
            self.cancel.check()?;
            self.repo
                .write_role(&RoleName::Snapshot, &md, SignatureRequirement::Enforced)?;
            bumped.push((RoleName::Snapshot, md.signed.version()));
            // a moved snapshot forces new timestamp content
            let timestamp = self.repo.try_read_role(&RoleName::Timestamp)?;
            let version = self.write_new_timestamp(timestamp.as_ref())?;
            bumped.push((RoleName::Timestamp, version));
        } else if self.repo.try_read_role(&RoleName::Timestamp)?.is_some()
            && self.repo.needs_bump(&RoleName::Timestamp)?
        {
            let timestamp = self.repo.try_read_role(&RoleName::Timestamp)?;
            let version = self.write_new_timestamp(timestamp.as_ref())?;
            bumped.push((RoleName::Timestamp, version));
        }

        if bumped.is_empty() {
            debug!("no online version bumps needed");
            return Ok(bumped);
        }

        let summary: Vec<String> = bumped
            .iter()
            .map(|(role, version)| format!("{role} v{version}"))
            .collect();
        let message = format!("Periodic online role version bump: {}", summary.join(", "));
        let files = bumped
            .iter()
            .map(|(role, _)| self.commit_entry(role))
            .collect::<Result<Vec<_>>>()?;
        git.commit(&files, &message)
            .map_err(|e| PlaygroundError::GitSurface(e.to_string()))?;
        if push {
            git.push("main")
                .map_err(|e| PlaygroundError::GitSurface(e.to_string()))?;
        }
        Ok(bumped)
    }

    /// For every offline role inside its signing window, open an event
    /// branch `sign/<role>-bump-<version>` holding an unsigned
    /// version+expiry bump. The working tree is restored afterwards; the
    /// bump lives only on the event branch.
    pub fn bump_offline(&self, git: &mut dyn GitSurface, push: bool) -> Result<Vec<String>> {
        self.cancel.check()?;
        let mut events = Vec::new();
        for role in self.repo.list_roles()? {
            if role.is_online() {
                continue;
            }
            if !self.repo.needs_bump(&role)? {
                debug!(role = %role, "no version bump needed");
                continue;
            }
            let original = fs::read(self.repo.tree().role_path(&role))?;
            let version = self.repo.bump_version(&role)?;
            let branch = format!("sign/{role}-bump-{version}");
            let exists = git.branch_exists(&branch)?;
            if !exists {
                let entry = self.commit_entry(&role)?;
                let message = format!("Periodic version bump: {role} v{version}");
                git.commit(&[entry], &message)
                    .map_err(|e| PlaygroundError::GitSurface(e.to_string()))?;
                if push {
                    git.push(&branch)
                        .map_err(|e| PlaygroundError::GitSurface(e.to_string()))?;
                }
                events.push(branch);
            } else {
                debug!(branch = %branch, "signing event branch already exists");
            }
            // back to the committed state before the next role; the bump
            // lives only on the event branch
            fs::write(self.repo.tree().role_path(&role), &original)?;
            if role == RoleName::Root {
                let history = self
                    .repo
                    .tree()
                    .root_history_dir()
                    .join(format!("{version}.root.json"));
                if history.exists() {
                    fs::remove_file(history)?;
                }
            }
        }
        Ok(events)
    }

    /// Emit the publishable tree into `publish_dir`: versioned root and
    /// targets metadata, unversioned snapshot and timestamp, and a
    /// byte-identical mirror of `targets/`. Never publishes an expired
    /// timestamp.
    pub fn publish(&self, publish_dir: &Path) -> Result<()> {
        self.cancel.check()?;
        let now = self.repo.now();

        let timestamp = self.repo.read_role(&RoleName::Timestamp)?;
        if timestamp.signed.expires() <= now {
            return Err(PlaygroundError::ExpiryPolicyViolation {
                role: "timestamp".to_string(),
                reason: "refusing to publish an expired timestamp".to_string(),
            });
        }
        let snapshot = self.repo.read_role(&RoleName::Snapshot)?;
        let Signed::Snapshot(ref snapshot_signed) = snapshot.signed else {
            return Err(PlaygroundError::MalformedMetadata(
                "snapshot.json is not snapshot metadata".to_string(),
            ));
        };

        // Stage everything first so a failure mid-collection publishes
        // nothing.
        let mut staged: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        let metadata_out = PathBuf::from("metadata");

        let history = self.repo.tree().root_history_dir();
        if history.exists() {
            for entry in fs::read_dir(&history)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".root.json") {
                    staged.push((metadata_out.join(name), fs::read(entry.path())?));
                }
            }
        } else {
            let root = self.repo.read_role(&RoleName::Root)?;
            staged.push((
                metadata_out.join(format!("{}.root.json", root.signed.version())),
                fs::read(self.repo.tree().role_path(&RoleName::Root))?,
            ));
        }
        staged.push((
            metadata_out.join("timestamp.json"),
            fs::read(self.repo.tree().role_path(&RoleName::Timestamp))?,
        ));
        staged.push((
            metadata_out.join("snapshot.json"),
            fs::read(self.repo.tree().role_path(&RoleName::Snapshot))?,
        ));
        for (filename, meta) in &snapshot_signed.meta {
            let path = self.repo.tree().metadata_dir().join(filename);
            staged.push((
                metadata_out.join(format!("{}.{filename}", meta.version)),
                fs::read(&path)?,
            ));
        }
        for (path, bytes) in collect_tree(&self.repo.tree().targets_dir(), Path::new("targets"))? {
            staged.push((path, bytes));
        }

        self.cancel.check()?;
        for (rel, bytes) in staged {
            let dst = publish_dir.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dst, bytes)?;
        }
        info!(dir = %publish_dir.display(), "publishable tree written");
        Ok(())
    }

    fn write_new_timestamp(&self, current: Option<&Metadata>) -> Result<u32> {
        let now = self.repo.now();
        let current_version = current.map(|md| md.signed.version()).unwrap_or(0);
        let days = self.repo.role_set()?.expiry_period_days(&RoleName::Timestamp)?;
        let snapshot_version = self.repo.snapshot_version()?;
        let timestamp = Timestamp {
            expires: truncate_expiry(now + Duration::days(days)),
            meta: [(
                "snapshot.json".to_string(),
                MetaFile {
                    version: snapshot_version,
                },
            )]
            .into_iter()
            .collect(),
            spec_version: SPEC_VERSION.to_string(),
            version: current_version + 1,
            custom: BTreeMap::new(),
        };
        let mut md = Metadata::new(Signed::Timestamp(timestamp));
        self.sign_online(&RoleName::Timestamp, &mut md)?;
        self.cancel.check()?;
        self.repo
            .write_role(&RoleName::Timestamp, &md, SignatureRequirement::Enforced)?;
        info!(version = current_version + 1, "timestamp updated");
        Ok(current_version + 1)
    }

    /// Sign `md` with every online key delegated to `role`. Keys without an
    /// online URI must not appear on online roles; that is an invariant
    /// failure, not a signer failure.
    fn sign_online(&self, role: &RoleName, md: &mut Metadata) -> Result<()> {
        let set = self.repo.role_set()?;
        let root = set.get(&RoleName::Root).ok_or_else(|| {
            PlaygroundError::MalformedMetadata("no root.json in tree".to_string())
        })?;
        let delegation = root.signed.delegation(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("root does not delegate {role}"))
        })?;

        md.signatures.clear();
        let payload = md.canonical_bytes()?;
        for (keyid, key) in &delegation.keys {
            let uri = key.online_uri().ok_or_else(|| {
                PlaygroundError::InvariantViolation(format!(
                    "{role} key {keyid} has no online URI"
                ))
            })?;
            let backend = self.registry.signer_for(uri, key)?;
            let signature = backend.sign(keyid, &payload)?;
            // never write a signature the key does not actually verify
            key.verify(&signature, &payload)
                .map_err(|_| PlaygroundError::SignatureRejected(format!("key {keyid}")))?;
            md.set_signature(signature);
        }
        Ok(())
    }

    fn commit_entry(&self, role: &RoleName) -> Result<(String, Vec<u8>)> {
        let path = self.repo.tree().role_path(role);
        Ok((
            format!("metadata/{}", role.filename()),
            fs::read(&path)?,
        ))
    }
}

fn collect_tree(dir: &Path, prefix: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = prefix.join(entry.file_name());
        if path.is_dir() {
            out.extend(collect_tree(&path, &rel)?);
        } else {
            out.push((rel, fs::read(&path)?));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Engine behavior is exercised end to end in tests/online_signing.rs;
    // here only the pieces with no working-tree dependency.

    #[test]
    fn snapshot_outcome_changed() {
        assert!(!SnapshotOutcome::default().changed());
        assert!(SnapshotOutcome {
            snapshot_version: Some(2),
            timestamp_version: None,
        }
        .changed());
    }

    #[test]
    fn cancelled_run_is_rejected_before_any_write() {
        let registry = SignerRegistry::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dir = tempfile::TempDir::new().unwrap();
        let online = OnlineRepository::open(
            WorkingTree::new(dir.path()),
            &registry,
            Utc::now(),
            cancel,
        );
        assert!(matches!(
            online.snapshot(),
            Err(PlaygroundError::Cancelled)
        ));
        assert!(dir.path().read_dir().unwrap().next().is_none());
    }
}
