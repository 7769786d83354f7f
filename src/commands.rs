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

//! The CI-facing engine surface.
//!
//! These functions are the commands the workflow invokes, shaped for a thin
//! argument-parsing wrapper: each one reads the clock exactly once, runs one
//! engine invocation, and reports whether anything changed (the wrapper
//! turns that into the exit code).

use std::path::Path;

use tracing::info;

use crate::clock::{CancellationToken, Clock};
use crate::errors::Result;
use crate::event::{evaluate, EventReport};
use crate::git::GitSurface;
use crate::metadata::RoleSet;
use crate::online::OnlineRepository;
use crate::repository::{Repository, WorkingTree};
use crate::signer::SignerRegistry;

/// Render the verdict of the signing-event checkout at `event_root` against
/// the known-good checkout at `base_root`. Exit code 0 iff publishable.
pub fn status(event_root: &Path, base_root: &Path, clock: &dyn Clock) -> Result<EventReport> {
    let now = clock.now();
    let tree = WorkingTree::new(event_root);
    let base = RoleSet::load_dir(&base_root.join("metadata"))?;
    let event = RoleSet::load_dir(&tree.metadata_dir())?;
    let scanned = Repository::open(tree, now).scan_targets()?;
    evaluate(&base, &event, Some(&scanned), now)
}

/// Produce snapshot/timestamp for the committed tree; when `publish_dir` is
/// given and something changed, also emit the publishable tree. Returns
/// whether new versions were produced.
pub fn snapshot(
    repo_root: &Path,
    registry: &SignerRegistry,
    clock: &dyn Clock,
    cancel: CancellationToken,
    publish_dir: Option<&Path>,
) -> Result<bool> {
    let online = OnlineRepository::open(
        WorkingTree::new(repo_root),
        registry,
        clock.now(),
        cancel,
    );
    let outcome = online.snapshot()?;
    if outcome.changed() {
        if let Some(dir) = publish_dir {
            online.publish(dir)?;
        }
    } else {
        info!("no snapshot changes");
    }
    Ok(outcome.changed())
}

/// Expiry-driven bumps of the online roles. Returns whether anything was
/// bumped (and published, when `publish_dir` is given).
pub fn bump_online(
    repo_root: &Path,
    registry: &SignerRegistry,
    git: &mut dyn GitSurface,
    push: bool,
    clock: &dyn Clock,
    cancel: CancellationToken,
    publish_dir: Option<&Path>,
) -> Result<bool> {
    let online = OnlineRepository::open(
        WorkingTree::new(repo_root),
        registry,
        clock.now(),
        cancel,
    );
    let bumped = online.bump_online(git, push)?;
    if bumped.is_empty() {
        info!("no online version bumps needed");
        return Ok(false);
    }
    if let Some(dir) = publish_dir {
        online.publish(dir)?;
    }
    Ok(true)
}

/// Open signing-event branches for expiring offline roles; returns the
/// branch names, one per line for the workflow.
pub fn bump_offline(
    repo_root: &Path,
    registry: &SignerRegistry,
    git: &mut dyn GitSurface,
    push: bool,
    clock: &dyn Clock,
    cancel: CancellationToken,
) -> Result<Vec<String>> {
    let online = OnlineRepository::open(
        WorkingTree::new(repo_root),
        registry,
        clock.now(),
        cancel,
    );
    online.bump_offline(git, push)
}

/// Emit the publishable tree for the current committed state.
pub fn publish(
    repo_root: &Path,
    registry: &SignerRegistry,
    clock: &dyn Clock,
    cancel: CancellationToken,
    publish_dir: &Path,
) -> Result<()> {
    let online = OnlineRepository::open(
        WorkingTree::new(repo_root),
        registry,
        clock.now(),
        cancel,
    );
    online.publish(publish_dir)
}
