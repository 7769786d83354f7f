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

//! Structural diff between two repository states.
//!
//! The analyzer compares a baseline (known-good) [`RoleSet`] with a signing
//! event's [`RoleSet`] and produces a [`ChangeSet`]: per-role change
//! classification, new invitations, and the outstanding signature
//! obligations. It is a pure function; verdict policy lives in the
//! signing-event engine.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::Result;
use crate::metadata::{Metadata, RoleName, RoleSet, Signed};

/// Who is asking. Online-role edits and content-free version bumps are only
/// legitimate when the online-signing engine itself makes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    SigningEvent,
    OnlineEngine,
}

/// Changes to the delegations a role grants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationDiff {
    pub added_keys: Vec<String>,
    pub removed_keys: Vec<String>,
    /// delegated role name -> (old threshold, new threshold)
    pub threshold_changes: BTreeMap<String, (u32, u32)>,
    pub added_roles: Vec<String>,
    pub removed_roles: Vec<String>,
}

impl DelegationDiff {
    fn is_empty(&self) -> bool {
        self.added_keys.is_empty()
            && self.removed_keys.is_empty()
            && self.threshold_changes.is_empty()
            && self.added_roles.is_empty()
            && self.removed_roles.is_empty()
    }
}

/// Changes to a role's target-file listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetListDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl TargetListDiff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// What changed inside a role that exists on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDiff {
    pub delegation_changed: Option<DelegationDiff>,
    pub target_list_changed: Option<TargetListDiff>,
    pub expiry_bumped: bool,
    /// Version moved with no other signed content change (expiry included).
    pub version_bumped_only: bool,
    /// The signature set changed (possibly the only change).
    pub signatures_changed: bool,
    pub old_version: u32,
    pub new_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleDelta {
    Unchanged,
    Added,
    Removed,
    ContentChanged(ContentDiff),
}

/// The analyzer's output: everything the signing-event engine needs to
/// reach a verdict.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub roles: BTreeMap<RoleName, RoleDelta>,
    /// delegated role name -> handles invited in the event but not in base.
    pub new_invites: BTreeMap<String, Vec<String>>,
    /// changed offline role -> owner handles that have not signed the
    /// event's payload.
    pub obligations: BTreeMap<RoleName, BTreeSet<String>>,
    /// Removed roles whose delegating role still delegates to them.
    pub orphaned_removals: Vec<RoleName>,
    /// Online roles touched by something other than the online engine.
    pub illegal_online_changes: Vec<RoleName>,
    /// Offline roles whose version moved with no content change to
    /// justify it.
    pub unjustified_version_bumps: Vec<RoleName>,
}

impl ChangeSet {
    /// True when the event is metadata-identical to the baseline.
    pub fn is_empty(&self) -> bool {
        self.roles.values().all(|d| *d == RoleDelta::Unchanged)
    }

    pub fn changed_roles(&self) -> impl Iterator<Item = (&RoleName, &RoleDelta)> {
        self.roles.iter().filter(|(_, d)| **d != RoleDelta::Unchanged)
    }
}

/// Compare `base` and `event` into a [`ChangeSet`].
pub fn analyze(base: &RoleSet, event: &RoleSet, caller: Caller) -> Result<ChangeSet> {
    let mut set = ChangeSet::default();

    let mut all_roles: BTreeSet<RoleName> = base.role_names().cloned().collect();
    all_roles.extend(event.role_names().cloned());

    for role in &all_roles {
        let delta = match (base.get(role), event.get(role)) {
            (None, Some(_)) => RoleDelta::Added,
            (Some(_), None) => {
                if !removal_is_delegated(event, role) {
                    set.orphaned_removals.push(role.clone());
                }
                RoleDelta::Removed
            }
            (Some(b), Some(e)) if b == e => RoleDelta::Unchanged,
            (Some(b), Some(e)) => RoleDelta::ContentChanged(diff_content(b, e)),
            (None, None) => continue,
        };

        if role.is_online() && delta != RoleDelta::Unchanged && caller != Caller::OnlineEngine {
            set.illegal_online_changes.push(role.clone());
        }
        if let RoleDelta::ContentChanged(ref diff) = delta {
            if diff.version_bumped_only
                && !role.is_online()
                && caller != Caller::OnlineEngine
            {
                set.unjustified_version_bumps.push(role.clone());
            }
        }
        set.roles.insert(role.clone(), delta);
    }

    set.new_invites = invite_additions(base, event);
    set.obligations = open_obligations(base, event, &set)?;
    Ok(set)
}

/// A removed role is only accounted for when the delegating role's event
/// version no longer delegates to it.
fn removal_is_delegated(event: &RoleSet, role: &RoleName) -> bool {
    match event.delegator_of(role) {
        Some(delegator) => delegator.signed.delegation(role).is_none(),
        None => false,
    }
}

fn diff_content(base: &Metadata, event: &Metadata) -> ContentDiff {
    let mut diff = ContentDiff {
        old_version: base.signed.version(),
        new_version: event.signed.version(),
        signatures_changed: base.signatures != event.signatures,
        expiry_bumped: base.signed.expires() != event.signed.expires(),
        ..ContentDiff::default()
    };

    let delegation = diff_delegations(&base.signed, &event.signed);
    if !delegation.is_empty() {
        diff.delegation_changed = Some(delegation);
    }
    let targets = diff_target_lists(&base.signed, &event.signed);
    if !targets.is_empty() {
        diff.target_list_changed = Some(targets);
    }

    if base.signed.version() != event.signed.version() && !diff.expiry_bumped {
        let mut normalized = event.signed.clone();
        normalized.set_version(base.signed.version());
        diff.version_bumped_only = normalized == base.signed;
    }
    diff
}

fn diff_delegations(base: &Signed, event: &Signed) -> DelegationDiff {
    let mut diff = DelegationDiff::default();

    let base_keys = delegation_keyids(base);
    let event_keys = delegation_keyids(event);
    diff.added_keys = event_keys.difference(&base_keys).cloned().collect();
    diff.removed_keys = base_keys.difference(&event_keys).cloned().collect();

    let base_roles = delegation_thresholds(base);
    let event_roles = delegation_thresholds(event);
    for (name, new_threshold) in &event_roles {
        match base_roles.get(name) {
            None => diff.added_roles.push(name.clone()),
            Some(old) if old != new_threshold => {
                diff.threshold_changes
                    .insert(name.clone(), (*old, *new_threshold));
            }
            Some(_) => {}
        }
    }
    for name in base_roles.keys() {
        if !event_roles.contains_key(name) {
            diff.removed_roles.push(name.clone());
        }
    }

    // Per-delegation key assignments can change without the key map
    // changing; fold those into the threshold-bearing role entries check.
    let base_assignments = delegation_assignments(base);
    let event_assignments = delegation_assignments(event);
    for (name, keyids) in &event_assignments {
        if base_assignments.get(name).is_some_and(|old| old != keyids)
            && !diff.threshold_changes.contains_key(name)
            && !diff.added_roles.contains(name)
        {
            let threshold = event_roles.get(name).copied().unwrap_or(0);
            diff.threshold_changes
                .insert(name.clone(), (threshold, threshold));
        }
    }
    diff
}

fn delegation_keyids(signed: &Signed) -> BTreeSet<String> {
    match signed {
        Signed::Root(root) => root.keys.keys().cloned().collect(),
        Signed::Targets(targets) => targets
            .delegations
            .as_ref()
            .map(|d| d.keys.keys().cloned().collect())
            .unwrap_or_default(),
        _ => BTreeSet::new(),
    }
}

fn delegation_thresholds(signed: &Signed) -> BTreeMap<String, u32> {
    match signed {
        Signed::Root(root) => root
            .roles
            .iter()
            .map(|(name, entry)| (name.clone(), entry.threshold))
            .collect(),
        Signed::Targets(targets) => targets
            .delegations
            .as_ref()
            .map(|d| {
                d.roles
                    .iter()
                    .map(|r| (r.name.clone(), r.threshold))
                    .collect()
            })
            .unwrap_or_default(),
        _ => BTreeMap::new(),
    }
}

fn delegation_assignments(signed: &Signed) -> BTreeMap<String, Vec<String>> {
    match signed {
        Signed::Root(root) => root
            .roles
            .iter()
            .map(|(name, entry)| (name.clone(), entry.keyids.clone()))
            .collect(),
        Signed::Targets(targets) => targets
            .delegations
            .as_ref()
            .map(|d| {
                d.roles
                    .iter()
                    .map(|r| (r.name.clone(), r.keyids.clone()))
                    .collect()
            })
            .unwrap_or_default(),
        _ => BTreeMap::new(),
    }
}

fn diff_target_lists(base: &Signed, event: &Signed) -> TargetListDiff {
    let (Signed::Targets(base), Signed::Targets(event)) = (base, event) else {
        return TargetListDiff::default();
    };
    let mut diff = TargetListDiff::default();
    for (path, file) in &event.targets {
        match base.targets.get(path) {
            None => diff.added.push(path.clone()),
            Some(old) if old != file => diff.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in base.targets.keys() {
        if !event.targets.contains_key(path) {
            diff.removed.push(path.clone());
        }
    }
    diff
}

/// Handles invited in the event's delegating roles but not in the base.
fn invite_additions(base: &RoleSet, event: &RoleSet) -> BTreeMap<String, Vec<String>> {
    let mut additions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for delegating in [RoleName::Root, RoleName::Targets] {
        let event_invites = event
            .get(&delegating)
            .map(|md| md.signed.invites())
            .unwrap_or_default();
        let base_invites = base
            .get(&delegating)
            .map(|md| md.signed.invites())
            .unwrap_or_default();
        for (role, handles) in event_invites {
            let known: BTreeSet<_> = base_invites
                .get(&role)
                .map(|h| h.iter().collect())
                .unwrap_or_default();
            let fresh: Vec<_> = handles
                .into_iter()
                .filter(|h| !known.contains(h))
                .collect();
            if !fresh.is_empty() {
                additions.entry(role).or_default().extend(fresh);
            }
        }
    }
    additions
}

/// For every changed offline role, the delegating key-set owners that have
/// not produced a valid signature over the event payload. Root obligations
/// are the union of the baseline's and the event's requirements, since a
/// new root must satisfy both.
fn open_obligations(
    base: &RoleSet,
    event: &RoleSet,
    set: &ChangeSet,
) -> Result<BTreeMap<RoleName, BTreeSet<String>>> {
    let mut obligations = BTreeMap::new();
    for (role, delta) in set.changed_roles() {
        if role.is_online() || matches!(delta, RoleDelta::Removed) {
            continue;
        }
        let Some(md) = event.get(role) else { continue };

        let mut missing = BTreeSet::new();
        if let Some(delegator) = event.delegator_of(role) {
            missing.extend(unsigned_owners(&delegator.signed, role, md)?);
        }
        if *role == RoleName::Root {
            if let Some(prev) = base.get(&RoleName::Root) {
                missing.extend(unsigned_owners(&prev.signed, role, md)?);
            }
        }
        obligations.insert(role.clone(), missing);
    }
    Ok(obligations)
}

fn unsigned_owners(delegator: &Signed, role: &RoleName, md: &Metadata) -> Result<BTreeSet<String>> {
    let mut missing = BTreeSet::new();
    let Some(delegation) = delegator.delegation(role) else {
        return Ok(missing);
    };
    let payload = md.canonical_bytes()?;
    for (keyid, key) in &delegation.keys {
        let Some(owner) = key.owner() else { continue };
        let signed = md
            .signature_for(keyid)
            .map(|sig| key.verify(sig, &payload).is_ok())
            .unwrap_or(false);
        if !signed {
            missing.insert(owner.to_string());
        }
    }
    Ok(missing)
}
