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

//! Shared fixtures: a playground with a "main" checkout, a signing-event
//! checkout, per-user signing keys resolved through a `local:` backend that
//! carries the private key in the URI, and helpers to merge events the way
//! the hosting platform would.

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use tuf_playground::clock::FixedClock;
use tuf_playground::commands;
use tuf_playground::errors::Result;
use tuf_playground::event::EventReport;
use tuf_playground::metadata::{Key, Metadata, RoleName, RoleSet};
use tuf_playground::repository::WorkingTree;
use tuf_playground::signer::{LocalSigner, SignerBackend, SignerRegistry};
use tuf_playground::workbench::{prompt::ScriptedPrompt, SignerConfig, Workbench};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()
}

pub fn days(n: i64) -> chrono::Duration {
    chrono::Duration::days(n)
}

/// A registry where `local:<hex>` URIs resolve to in-process ed25519
/// signers.
pub fn local_registry() -> SignerRegistry {
    let mut registry = SignerRegistry::new();
    registry.register("local", |uri, _key| {
        let hex_key = uri.strip_prefix("local:").unwrap_or_default();
        Ok(Box::new(LocalSigner::from_hex(hex_key)?))
    });
    registry
}

/// A human signer: a handle, a key pair, and the signer configuration that
/// routes the keyid to the local backend.
pub struct User {
    pub config: SignerConfig,
    pub signer: LocalSigner,
}

impl User {
    pub fn new(name: &str) -> Self {
        let signer = LocalSigner::generate();
        let mut config = SignerConfig::new(name);
        let keyid = signer.public_key().unwrap().key_id().unwrap();
        config
            .signing_key_uris
            .insert(keyid, format!("local:{}", signer.private_key_hex()));
        User { config, signer }
    }

    pub fn public_key(&self) -> Key {
        self.signer.public_key().unwrap()
    }
}

/// Two checkouts of the same repository: the committed `main` state and a
/// signing-event working tree.
pub struct Playground {
    pub main: TempDir,
    pub event: TempDir,
    pub registry: SignerRegistry,
    pub online_signer: LocalSigner,
}

impl Playground {
    pub fn new() -> Self {
        Playground {
            main: TempDir::new().unwrap(),
            event: TempDir::new().unwrap(),
            registry: local_registry(),
            online_signer: LocalSigner::generate(),
        }
    }

    /// The service key, marked online with a URI the registry resolves.
    pub fn online_key(&self) -> Key {
        let mut key = self.online_signer.public_key().unwrap();
        key.set_online_uri(&format!("local:{}", self.online_signer.private_key_hex()));
        key
    }

    pub fn main_tree(&self) -> WorkingTree {
        WorkingTree::new(self.main.path())
    }

    pub fn event_tree(&self) -> WorkingTree {
        WorkingTree::new(self.event.path())
    }

    pub fn base_set(&self) -> RoleSet {
        RoleSet::load_dir(&self.main_tree().metadata_dir()).unwrap()
    }

    pub fn event_set(&self) -> RoleSet {
        RoleSet::load_dir(&self.event_tree().metadata_dir()).unwrap()
    }

    /// A workbench session for `user` on the event checkout, with main as
    /// the baseline.
    pub fn workbench<'a>(&'a self, user: &'a User, now: DateTime<Utc>) -> Workbench<'a> {
        Workbench::new(
            self.event_tree(),
            self.base_set(),
            &user.config,
            &self.registry,
            now,
        )
    }

    /// The CI status check of the event checkout against main.
    pub fn status(&self, now: DateTime<Utc>) -> Result<EventReport> {
        commands::status(self.event.path(), self.main.path(), &FixedClock(now))
    }

    /// Merge the signing event: main takes the event's metadata and
    /// targets, as the merge queue would.
    pub fn merge(&self) {
        replace_dir(
            &self.event_tree().metadata_dir(),
            &self.main_tree().metadata_dir(),
        );
        replace_dir(
            &self.event_tree().targets_dir(),
            &self.main_tree().targets_dir(),
        );
    }

    /// Start a fresh signing event from the current main state.
    pub fn reset_event(&self) {
        replace_dir(
            &self.main_tree().metadata_dir(),
            &self.event_tree().metadata_dir(),
        );
        replace_dir(
            &self.main_tree().targets_dir(),
            &self.event_tree().targets_dir(),
        );
    }

    /// Initialize root/targets/online config as `user` with the menu
    /// defaults, on the event checkout.
    pub fn init_repository(&self, user: &User, now: DateTime<Utc>) {
        let bench = self.workbench(user, now);
        let mut prompt = ScriptedPrompt::new(["", "", ""]);
        bench
            .init_repository(&mut prompt, self.online_key(), Some(user.public_key()))
            .unwrap();
    }

    /// Rewrite a role file on the event checkout, bypassing the workbench
    /// (for crafting invalid events).
    pub fn tamper_event_role(&self, role: &RoleName, mutate: impl FnOnce(&mut Metadata)) {
        let path = self.event_tree().role_path(role);
        let mut md = Metadata::from_bytes(&fs::read(&path).unwrap()).unwrap();
        mutate(&mut md);
        fs::write(&path, md.to_bytes().unwrap()).unwrap();
    }
}

fn replace_dir(src: &Path, dst: &Path) {
    if dst.exists() {
        fs::remove_dir_all(dst).unwrap();
    }
    if src.exists() {
        copy_dir(src, dst);
    }
}

fn copy_dir(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}
