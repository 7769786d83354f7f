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

//! The signing-event engine.
//!
//! Given a baseline state and an event state, decide whether the event is
//! empty, invalid, incomplete or publishable, and render the report posted
//! back to the signing event. The engine never mutates either tree; the
//! verdict is a pure function of `(base, event, now)` and re-running it is
//! free.
//!
//! Roles are evaluated root first, then targets, then delegated targets; a
//! root failure short-circuits everything else. When an event changes both
//! a delegating role and a delegated role, the delegating role's *new* key
//! set judges the delegated role's signatures. A changed root must satisfy
//! the baseline root's key set as well as its own.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::delta::{analyze, Caller, ChangeSet, RoleDelta};
use crate::errors::{PlaygroundError, Result};
use crate::metadata::{
    verify_role, Metadata, RoleName, RoleSet, Signed, TargetFile, VerificationOutcome,
};

/// Slack in days allowed on top of the expiry period when validating an
/// event's new expiry, covering signer/CI clock skew.
pub const EXPIRY_TOLERANCE_DAYS: i64 = 1;

const KNOWN_SCHEMES: &[&str] = &["ed25519", "ecdsa-sha2-nistp256", "ecdsa"];

/// The hard reasons an event can be rejected. Flat and closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidityReason {
    IllegalOnlineChange {
        role: RoleName,
    },
    UnmatchedTargets {
        role: RoleName,
        problems: Vec<String>,
    },
    ExpiryOutOfRange {
        role: RoleName,
        reason: String,
    },
    DelegationStructure {
        role: RoleName,
        problems: Vec<String>,
    },
    VersionRegression {
        role: RoleName,
        old: u32,
        new: u32,
    },
    OrphanedRemoval {
        role: RoleName,
    },
    BadSignature {
        role: RoleName,
        keyids: Vec<String>,
    },
}

impl InvalidityReason {
    pub fn role(&self) -> &RoleName {
        match self {
            InvalidityReason::IllegalOnlineChange { role }
            | InvalidityReason::UnmatchedTargets { role, .. }
            | InvalidityReason::ExpiryOutOfRange { role, .. }
            | InvalidityReason::DelegationStructure { role, .. }
            | InvalidityReason::VersionRegression { role, .. }
            | InvalidityReason::OrphanedRemoval { role }
            | InvalidityReason::BadSignature { role, .. } => role,
        }
    }
}

impl fmt::Display for InvalidityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidityReason::IllegalOnlineChange { role } => {
                write!(f, "{role}: online role modified outside the online engine")
            }
            InvalidityReason::UnmatchedTargets { role, problems } => {
                write!(f, "{role}: target files do not match ({})", problems.join("; "))
            }
            InvalidityReason::ExpiryOutOfRange { role, reason } => {
                write!(f, "{role}: {reason}")
            }
            InvalidityReason::DelegationStructure { role, problems } => {
                write!(f, "{role}: bad delegation ({})", problems.join("; "))
            }
            InvalidityReason::VersionRegression { role, old, new } => {
                write!(f, "{role}: version {new} does not follow {old}")
            }
            InvalidityReason::OrphanedRemoval { role } => {
                write!(f, "{role}: removed but still delegated to")
            }
            InvalidityReason::BadSignature { role, keyids } => {
                write!(f, "{role}: invalid signature from {}", keyids.join(", "))
            }
        }
    }
}

/// What still has to happen before the event becomes publishable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Obligations {
    /// changed role -> owner handles whose signature is outstanding.
    pub signatures: BTreeMap<RoleName, BTreeSet<String>>,
    /// delegated role name -> handles with an unaccepted invitation.
    pub invites: BTreeMap<String, Vec<String>>,
}

impl Obligations {
    pub fn is_empty(&self) -> bool {
        self.signatures.values().all(|s| s.is_empty()) && self.invites.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Branches are identical at the metadata level.
    Empty,
    Invalid(Vec<InvalidityReason>),
    Incomplete(Obligations),
    Publishable,
}

impl Verdict {
    pub fn is_publishable(&self) -> bool {
        *self == Verdict::Publishable
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Empty => write!(f, "empty"),
            Verdict::Invalid(_) => write!(f, "invalid"),
            Verdict::Incomplete(_) => write!(f, "incomplete"),
            Verdict::Publishable => write!(f, "publishable"),
        }
    }
}

/// One line of the rendered role table.
#[derive(Debug, Clone)]
pub struct RoleRow {
    pub role: RoleName,
    pub state: String,
    pub signed: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub threshold: u32,
}

/// The engine's output: verdict plus the report rows it was derived from.
#[derive(Debug, Clone)]
pub struct EventReport {
    pub verdict: Verdict,
    pub rows: Vec<RoleRow>,
    pub change_set: ChangeSet,
}

impl EventReport {
    /// Render the markdown report: a role-by-role table and a final verdict
    /// line, with the failure reasons above it when the event is invalid.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Verdict::Invalid(reasons) = &self.verdict {
            out.push_str("### Errors\n");
            for reason in reasons {
                out.push_str(&format!("- {reason}\n"));
            }
            out.push('\n');
        }
        if !self.rows.is_empty() {
            out.push_str("| role | status | signatures | missing |\n");
            out.push_str("|------|--------|------------|--------|\n");
            for row in &self.rows {
                let signed: Vec<_> = row.signed.iter().cloned().collect();
                let missing: Vec<_> = row.missing.iter().cloned().collect();
                out.push_str(&format!(
                    "| {} | {} | {}/{} ({}) | {} |\n",
                    row.role,
                    row.state,
                    row.signed.len(),
                    row.threshold,
                    signed.join(", "),
                    missing.join(", "),
                ));
            }
            out.push('\n');
        }
        if let Verdict::Incomplete(obligations) = &self.verdict {
            for (role, handles) in &obligations.invites {
                out.push_str(&format!(
                    "Waiting for {} to accept the {role} invitation.\n",
                    handles.join(", ")
                ));
            }
        }
        out.push_str(&format!("Verdict: {}\n", self.verdict));
        out
    }
}

/// Compute the verdict for one signing event.
///
/// `scanned_targets` is the hashed content of the event checkout's
/// `targets/` directory; pass `None` when no checkout is available and the
/// target-consistency check should be skipped.
pub fn evaluate(
    base: &RoleSet,
    event: &RoleSet,
    scanned_targets: Option<&BTreeMap<RoleName, BTreeMap<String, TargetFile>>>,
    now: DateTime<Utc>,
) -> Result<EventReport> {
    let change_set = analyze(base, event, Caller::SigningEvent)?;
    if change_set.is_empty() {
        return Ok(EventReport {
            verdict: Verdict::Empty,
            rows: Vec::new(),
            change_set,
        });
    }

    let mut reasons = Vec::new();
    for role in &change_set.illegal_online_changes {
        reasons.push(InvalidityReason::IllegalOnlineChange { role: role.clone() });
    }
    for role in &change_set.orphaned_removals {
        reasons.push(InvalidityReason::OrphanedRemoval { role: role.clone() });
    }

    // Root first; a root failure means nothing else is worth analyzing.
    let ordered: Vec<RoleName> = change_set
        .changed_roles()
        .map(|(role, _)| role.clone())
        .collect();
    for role in &ordered {
        if role.is_online() {
            continue;
        }
        let role_reasons = check_role(base, event, &change_set, role, now)?;
        let failed_root = *role == RoleName::Root && !role_reasons.is_empty();
        reasons.extend(role_reasons);
        if failed_root {
            debug!("root failed validation, short-circuiting");
            reasons.retain(|r| *r.role() == RoleName::Root);
            return Ok(EventReport {
                rows: build_rows(base, event, &change_set, &reasons),
                verdict: Verdict::Invalid(reasons),
                change_set,
            });
        }
    }

    if let Some(scanned) = scanned_targets {
        reasons.extend(check_targets_consistency(event, scanned, &change_set));
    }

    let verdict = if !reasons.is_empty() {
        Verdict::Invalid(reasons)
    } else {
        // an invited signer will have to sign once the key is bound, so the
        // invitation counts toward the role's outstanding signatures too
        let mut signatures = change_set.obligations.clone();
        let invites = open_invites(event);
        for (role_name, handles) in &invites {
            if let Ok(role) = role_name.parse::<RoleName>() {
                if let Some(missing) = signatures.get_mut(&role) {
                    missing.extend(handles.iter().cloned());
                }
            }
        }
        let obligations = Obligations { signatures, invites };
        if obligations.is_empty() {
            Verdict::Publishable
        } else {
            Verdict::Incomplete(obligations)
        }
    };

    let reasons_ref = match &verdict {
        Verdict::Invalid(reasons) => reasons.clone(),
        _ => Vec::new(),
    };
    Ok(EventReport {
        rows: build_rows(base, event, &change_set, &reasons_ref),
        verdict,
        change_set,
    })
}

fn check_role(
    base: &RoleSet,
    event: &RoleSet,
    change_set: &ChangeSet,
    role: &RoleName,
    now: DateTime<Utc>,
) -> Result<Vec<InvalidityReason>> {
    let mut reasons = Vec::new();
    let Some(delta) = change_set.roles.get(role) else {
        return Ok(reasons);
    };
    if matches!(delta, RoleDelta::Removed | RoleDelta::Unchanged) {
        return Ok(reasons);
    }
    let Some(md) = event.get(role) else {
        return Ok(reasons);
    };

    // A changed payload must move the version forward; accumulating
    // signatures over an unchanged payload is fine. A version that moved
    // with nothing re-derived is equally unjustified.
    let payload_changed = base.get(role).map(|m| &m.signed) != Some(&md.signed);
    let old_version = base.get(role).map(|m| m.signed.version()).unwrap_or(0);
    let new_version = md.signed.version();
    if (payload_changed && new_version <= old_version)
        || change_set.unjustified_version_bumps.contains(role)
    {
        reasons.push(InvalidityReason::VersionRegression {
            role: role.clone(),
            old: old_version,
            new: new_version,
        });
        if *role == RoleName::Root {
            // spec: no further analysis of a regressed root
            return Ok(reasons);
        }
    }

    reasons.extend(check_expiry(event, role, md, now));
    reasons.extend(check_delegation_structure(role, &md.signed));
    reasons.extend(check_signatures(base, event, role, md)?);
    Ok(reasons)
}

/// `now < expires <= now + expiry_period + tolerance`.
fn check_expiry(
    event: &RoleSet,
    role: &RoleName,
    md: &Metadata,
    now: DateTime<Utc>,
) -> Option<InvalidityReason> {
    let expires = md.signed.expires();
    if expires <= now {
        return Some(InvalidityReason::ExpiryOutOfRange {
            role: role.clone(),
            reason: format!("expiry {expires} is in the past"),
        });
    }
    let days = match event.expiry_period_days(role) {
        Ok(days) => days,
        Err(_) => {
            return Some(InvalidityReason::ExpiryOutOfRange {
                role: role.clone(),
                reason: "no expiry period configured".to_string(),
            })
        }
    };
    let limit = now + Duration::days(days + EXPIRY_TOLERANCE_DAYS);
    if expires > limit {
        return Some(InvalidityReason::ExpiryOutOfRange {
            role: role.clone(),
            reason: format!("expiry {expires} is further than the {days} day period allows"),
        });
    }
    None
}

/// Validate every delegation the changed payload grants: thresholds in
/// range, keys present and well formed, online/offline purity, known
/// schemes. An open invitation stands in for a key until its owner binds
/// one, so thresholds count pending invites; the invite itself keeps the
/// event from ever reaching `publishable` in that state.
fn check_delegation_structure(role: &RoleName, signed: &Signed) -> Option<InvalidityReason> {
    let mut problems = Vec::new();
    let invites = signed.invites();
    for delegated in signed.delegated_role_names() {
        let Some(delegation) = signed.delegation(&delegated) else {
            continue;
        };
        let pending = invites
            .get(&delegated.to_string())
            .map(|handles| handles.len())
            .unwrap_or(0);
        if delegation.threshold < 1 {
            problems.push(format!("{delegated}: threshold must be at least 1"));
        }
        if delegation.keys.is_empty() && pending == 0 {
            problems.push(format!("{delegated}: empty key set"));
        }
        if delegation.threshold as usize > delegation.keys.len() + pending {
            problems.push(format!(
                "{delegated}: threshold {} exceeds {} keys",
                delegation.threshold,
                delegation.keys.len()
            ));
        }
        for (keyid, key) in &delegation.keys {
            if key.validate().is_err() {
                problems.push(format!(
                    "{delegated}: key {keyid} must have exactly one of an online URI or an owner"
                ));
            }
            if !KNOWN_SCHEMES.contains(&key.scheme.as_str()) {
                problems.push(format!("{delegated}: key {keyid} has unknown scheme {}", key.scheme));
            }
            if delegated.is_online() && !key.is_online() {
                problems.push(format!("{delegated}: offline key {keyid} on an online role"));
            }
            if !delegated.is_online() && key.is_online() {
                problems.push(format!("{delegated}: online key {keyid} on an offline role"));
            }
        }
    }
    if problems.is_empty() {
        None
    } else {
        Some(InvalidityReason::DelegationStructure {
            role: role.clone(),
            problems,
        })
    }
}

/// Present-but-bad signatures are hard failures; missing ones are
/// obligations, not errors.
fn check_signatures(
    base: &RoleSet,
    event: &RoleSet,
    role: &RoleName,
    md: &Metadata,
) -> Result<Vec<InvalidityReason>> {
    let mut reasons = Vec::new();
    let mut delegators: Vec<&Metadata> = Vec::new();
    if let Some(delegator) = event.delegator_of(role) {
        delegators.push(delegator);
    }
    if *role == RoleName::Root {
        if let Some(prev) = base.get(&RoleName::Root) {
            delegators.push(prev);
        }
    }
    let mut bad: BTreeSet<String> = BTreeSet::new();
    for delegator in delegators {
        match verify_role(&delegator.signed, role, md) {
            Ok(VerificationOutcome::Invalid { keyids }) => bad.extend(keyids),
            Ok(_) => {}
            // Unknown schemes are reported by the structure check; missing
            // delegations by the orphan check.
            Err(PlaygroundError::UnknownScheme(_)) | Err(PlaygroundError::MalformedMetadata(_)) => {}
            Err(e) => return Err(e),
        }
    }
    if !bad.is_empty() {
        reasons.push(InvalidityReason::BadSignature {
            role: role.clone(),
            keyids: bad.into_iter().collect(),
        });
    }
    Ok(reasons)
}

/// Compare the event's target listings with the files actually on disk.
fn check_targets_consistency(
    event: &RoleSet,
    scanned: &BTreeMap<RoleName, BTreeMap<String, TargetFile>>,
    change_set: &ChangeSet,
) -> Vec<InvalidityReason> {
    let mut reasons = Vec::new();
    let mut roles: BTreeSet<RoleName> = scanned.keys().cloned().collect();
    roles.extend(
        event
            .role_names()
            .filter(|r| r.is_targets_kind())
            .cloned(),
    );

    for role in roles {
        // Removed roles have no listing left to check.
        if matches!(change_set.roles.get(&role), Some(RoleDelta::Removed)) {
            continue;
        }
        let mut problems = Vec::new();
        let empty = BTreeMap::new();
        let on_disk = scanned.get(&role).unwrap_or(&empty);
        let listed = match event.get(&role).map(|md| &md.signed) {
            Some(Signed::Targets(t)) => t.targets.clone(),
            Some(_) => BTreeMap::new(),
            None => {
                if !on_disk.is_empty() {
                    problems.push(format!("target files exist for unknown role {role}"));
                }
                BTreeMap::new()
            }
        };
        for (path, listed_file) in &listed {
            match on_disk.get(path) {
                None => problems.push(format!("{path} listed but missing on disk")),
                Some(actual) if actual.hashes != listed_file.hashes => {
                    problems.push(format!("{path} hash mismatch"))
                }
                Some(actual) if actual.length != listed_file.length => {
                    problems.push(format!("{path} length mismatch"))
                }
                Some(_) => {}
            }
        }
        for path in on_disk.keys() {
            if !listed.contains_key(path) {
                problems.push(format!("{path} on disk but not listed"));
            }
        }
        if !problems.is_empty() {
            reasons.push(InvalidityReason::UnmatchedTargets { role, problems });
        }
    }
    reasons
}

/// Invitations currently open in the event state (accepted ones are gone
/// from the delegating role's custom field).
fn open_invites(event: &RoleSet) -> BTreeMap<String, Vec<String>> {
    let mut invites = BTreeMap::new();
    for delegating in [RoleName::Root, RoleName::Targets] {
        if let Some(md) = event.get(&delegating) {
            for (role, handles) in md.signed.invites() {
                if !handles.is_empty() {
                    invites.insert(role, handles);
                }
            }
        }
    }
    invites
}

fn build_rows(
    base: &RoleSet,
    event: &RoleSet,
    change_set: &ChangeSet,
    reasons: &[InvalidityReason],
) -> Vec<RoleRow> {
    let mut rows = Vec::new();
    for (role, delta) in change_set.changed_roles() {
        let state = if reasons.iter().any(|r| r.role() == role) {
            "invalid".to_string()
        } else {
            match delta {
                RoleDelta::Added => "added".to_string(),
                RoleDelta::Removed => "removed".to_string(),
                _ => {
                    let missing = change_set
                        .obligations
                        .get(role)
                        .map(|m| !m.is_empty())
                        .unwrap_or(false);
                    if missing {
                        "unsigned".to_string()
                    } else {
                        "verified".to_string()
                    }
                }
            }
        };
        let missing = change_set
            .obligations
            .get(role)
            .cloned()
            .unwrap_or_default();
        let threshold = event
            .delegator_of(role)
            .or_else(|| base.delegator_of(role))
            .and_then(|d| d.signed.delegation(role))
            .map(|d| d.threshold)
            .unwrap_or(0);
        let all_owners: BTreeSet<String> = event
            .delegator_of(role)
            .and_then(|d| d.signed.delegation(role))
            .map(|d| d.owners().into_iter().collect())
            .unwrap_or_default();
        let signed = all_owners.difference(&missing).cloned().collect();
        rows.push(RoleRow {
            role: role.clone(),
            state,
            signed,
            missing,
            threshold,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        Key, MetaFile, Metadata, RoleKeys, Root, Signed, Snapshot, Targets, SPEC_VERSION,
    };
    use crate::signer::{LocalSigner, SignerBackend};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()
    }

    fn owned_key(signer: &LocalSigner, owner: &str) -> Key {
        let mut key = signer.public_key().unwrap();
        key.set_owner(owner);
        key
    }

    struct Fixture {
        signer: LocalSigner,
        base: RoleSet,
    }

    fn fixture() -> Fixture {
        let signer = LocalSigner::generate();
        let key = owned_key(&signer, "@user1");
        let mut custom = BTreeMap::new();
        custom.insert("x-playground-expiry-period".to_string(), 365.into());
        custom.insert("x-playground-signing-period".to_string(), 60.into());

        let mut root = Root {
            consistent_snapshot: true,
            expires: now() + Duration::days(365),
            keys: BTreeMap::new(),
            roles: ["root", "targets", "snapshot", "timestamp"]
                .iter()
                .map(|r| (r.to_string(), RoleKeys::new(Vec::new(), 1)))
                .collect(),
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            custom: custom.clone(),
        };
        root.add_key("root", key.clone()).unwrap();
        root.add_key("targets", key.clone()).unwrap();
        let online = LocalSigner::generate();
        let mut online_key = online.public_key().unwrap();
        online_key.set_online_uri("envvar:UNUSED");
        root.add_key("snapshot", online_key.clone()).unwrap();
        root.add_key("timestamp", online_key).unwrap();

        let targets = Targets {
            expires: now() + Duration::days(365),
            spec_version: SPEC_VERSION.to_string(),
            targets: BTreeMap::new(),
            version: 1,
            delegations: None,
            custom,
        };
        let snapshot = Snapshot {
            expires: now() + Duration::days(1),
            meta: [("targets.json".to_string(), MetaFile { version: 1 })]
                .into_iter()
                .collect(),
            spec_version: SPEC_VERSION.to_string(),
            version: 1,
            custom: BTreeMap::new(),
        };

        let mut base = RoleSet::new();
        let mut root_md = Metadata::new(Signed::Root(root));
        sign(&signer, &mut root_md);
        let mut targets_md = Metadata::new(Signed::Targets(targets));
        sign(&signer, &mut targets_md);
        base.insert(RoleName::Root, root_md);
        base.insert(RoleName::Targets, targets_md);
        base.insert(RoleName::Snapshot, Metadata::new(Signed::Snapshot(snapshot)));
        Fixture { signer, base }
    }

    fn sign(signer: &LocalSigner, md: &mut Metadata) {
        let payload = md.canonical_bytes().unwrap();
        let keyid = signer.public_key().unwrap().key_id().unwrap();
        md.set_signature(signer.sign(&keyid, &payload).unwrap());
    }

    #[test]
    fn identical_branches_are_empty() {
        let fx = fixture();
        let report = evaluate(&fx.base, &fx.base.clone(), None, now()).unwrap();
        assert_eq!(report.verdict, Verdict::Empty);
        assert!(report.render().contains("Verdict: empty"));
    }

    #[test]
    fn signed_edit_is_publishable() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        if let Signed::Targets(ref mut t) = targets.signed {
            t.targets
                .insert("file.txt".to_string(), crate::metadata::TargetFile::from_bytes(b"data"));
            t.version = 2;
            t.expires = now() + Duration::days(365);
        }
        sign(&fx.signer, &mut targets);
        event.insert(RoleName::Targets, targets);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        assert_eq!(report.verdict, Verdict::Publishable);
        assert!(report.render().contains("Verdict: publishable"));
    }

    #[test]
    fn unsigned_edit_is_incomplete() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        if let Signed::Targets(ref mut t) = targets.signed {
            t.version = 2;
            t.expires = now() + Duration::days(365);
            t.targets
                .insert("file.txt".to_string(), crate::metadata::TargetFile::from_bytes(b"data"));
        }
        targets.signatures.clear();
        event.insert(RoleName::Targets, targets);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        let Verdict::Incomplete(obligations) = &report.verdict else {
            panic!("expected incomplete, got {:?}", report.verdict);
        };
        assert_eq!(
            obligations.signatures[&RoleName::Targets],
            ["@user1".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn online_edit_is_invalid_regardless_of_signatures() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut snapshot = event.get(&RoleName::Snapshot).unwrap().clone();
        snapshot.signed.set_version(2);
        event.insert(RoleName::Snapshot, snapshot);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        let Verdict::Invalid(reasons) = &report.verdict else {
            panic!("expected invalid");
        };
        assert!(matches!(
            reasons[0],
            InvalidityReason::IllegalOnlineChange { .. }
        ));
    }

    #[test]
    fn root_version_regression_short_circuits() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut root = event.get(&RoleName::Root).unwrap().clone();
        root.signed.set_version(0);
        sign(&fx.signer, &mut root);
        event.insert(RoleName::Root, root);
        // also break targets; the root failure must suppress it
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        targets.signed.set_version(0);
        event.insert(RoleName::Targets, targets);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        let Verdict::Invalid(reasons) = &report.verdict else {
            panic!("expected invalid");
        };
        assert_eq!(reasons.len(), 1);
        assert!(matches!(
            reasons[0],
            InvalidityReason::VersionRegression { old: 1, new: 0, .. }
        ));
    }

    #[test]
    fn expiry_beyond_policy_is_invalid() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        if let Signed::Targets(ref mut t) = targets.signed {
            t.version = 2;
            t.expires = now() + Duration::days(400);
        }
        sign(&fx.signer, &mut targets);
        event.insert(RoleName::Targets, targets);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        let Verdict::Invalid(reasons) = &report.verdict else {
            panic!("expected invalid");
        };
        assert!(matches!(
            reasons[0],
            InvalidityReason::ExpiryOutOfRange { .. }
        ));
    }

    #[test]
    fn expiry_within_tolerance_is_accepted() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        if let Signed::Targets(ref mut t) = targets.signed {
            t.version = 2;
            t.expires = now() + Duration::days(365) + Duration::hours(12);
        }
        sign(&fx.signer, &mut targets);
        event.insert(RoleName::Targets, targets);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        assert_eq!(report.verdict, Verdict::Publishable);
    }

    #[test]
    fn threshold_above_key_count_is_structural() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut root = event.get(&RoleName::Root).unwrap().clone();
        if let Signed::Root(ref mut r) = root.signed {
            r.version = 2;
            r.roles.get_mut("targets").unwrap().threshold = 5;
        }
        sign(&fx.signer, &mut root);
        event.insert(RoleName::Root, root);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        let Verdict::Invalid(reasons) = &report.verdict else {
            panic!("expected invalid");
        };
        assert!(matches!(
            reasons[0],
            InvalidityReason::DelegationStructure { .. }
        ));
    }

    #[test]
    fn tampered_signature_is_bad() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        if let Signed::Targets(ref mut t) = targets.signed {
            t.version = 2;
            t.expires = now() + Duration::days(365);
        }
        sign(&fx.signer, &mut targets);
        // tamper after signing
        if let Signed::Targets(ref mut t) = targets.signed {
            t.targets
                .insert("sneaky.txt".to_string(), crate::metadata::TargetFile::from_bytes(b"x"));
        }
        event.insert(RoleName::Targets, targets);

        let report = evaluate(&fx.base, &event, None, now()).unwrap();
        let Verdict::Invalid(reasons) = &report.verdict else {
            panic!("expected invalid");
        };
        assert!(matches!(reasons[0], InvalidityReason::BadSignature { .. }));
    }

    #[test]
    fn verdict_is_deterministic() {
        let fx = fixture();
        let mut event = fx.base.clone();
        let mut targets = event.get(&RoleName::Targets).unwrap().clone();
        if let Signed::Targets(ref mut t) = targets.signed {
            t.version = 2;
            t.expires = now() + Duration::days(365);
        }
        targets.signatures.clear();
        event.insert(RoleName::Targets, targets);

        let first = evaluate(&fx.base, &event, None, now()).unwrap();
        let second = evaluate(&fx.base, &event, None, now()).unwrap();
        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.render(), second.render());
    }
}
