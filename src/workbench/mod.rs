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

//! The signer workbench.
//!
//! Translates interactive intent ("add a signer", "raise the threshold",
//! "sign the current event") into a minimal well-formed metadata delta
//! against the baseline. Every completed interaction leaves the event tree
//! holding role files that satisfy the repository invariants: the version is
//! bumped exactly once per signing event, the expiry follows the role's
//! expiry period, co-signers get placeholder signatures recording their
//! obligation, and the user's own signature is produced through the signer
//! registry.
//!
//! Invitations ride in the delegating role's `x-playground-invites` field,
//! so inviting someone (and accepting) is itself signed content; while a
//! role has open invites the user's signature is withheld, since the
//! payload is guaranteed to change again.

use std::collections::BTreeMap;

use chrono::Duration;
use tracing::debug;

use crate::errors::{PlaygroundError, Result};
use crate::metadata::{
    Key, Metadata, RoleKeys, RoleName, RoleSet, Root, Signed, Targets, FIELD_EXPIRY_PERIOD,
    FIELD_SIGNING_PERIOD, SPEC_VERSION,
};
use crate::repository::{Repository, SignatureRequirement, WorkingTree};
use crate::signer::SignerRegistry;

pub mod prompt;

use prompt::Prompt;

/// The parsed form of `.playground-sign.ini` (the file reader itself is an
/// external collaborator).
#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub user_name: String,
    pub pykcs11lib: Option<String>,
    pub pull_remote: String,
    pub push_remote: String,
    /// keyid -> signer URI overrides from the `signing-keys` section.
    pub signing_key_uris: BTreeMap<String, String>,
}

impl SignerConfig {
    pub fn new(user_name: impl Into<String>) -> Self {
        SignerConfig {
            user_name: user_name.into(),
            pykcs11lib: None,
            pull_remote: "origin".to_string(),
            push_remote: "origin".to_string(),
            signing_key_uris: BTreeMap::new(),
        }
    }
}

/// Delegation configuration for an offline role, as the menus present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineConfig {
    pub signers: Vec<String>,
    pub threshold: u32,
    pub expiry_period: i64,
    pub signing_period: i64,
}

impl OfflineConfig {
    /// The defaults offered when initializing a repository.
    pub fn initial(user: &str) -> Self {
        OfflineConfig {
            signers: vec![user.to_string()],
            threshold: 1,
            expiry_period: 365,
            signing_period: 60,
        }
    }
}

/// Configuration for the online roles: one service key signs both snapshot
/// and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineConfig {
    pub key: Key,
    pub timestamp_expiry: i64,
    pub snapshot_expiry: i64,
    pub timestamp_signing: Option<i64>,
    pub snapshot_signing: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetChange {
    pub path: String,
    pub kind: TargetChangeKind,
}

/// What the workbench should offer the user next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkbenchState {
    /// No root.json in the event tree.
    Uninitialized,
    /// The user has open invitations to these roles.
    Invited(Vec<String>),
    /// Local target files differ from the event metadata.
    TargetsChanged(BTreeMap<RoleName, Vec<TargetChange>>),
    /// Changed roles awaiting the user's signature.
    SignatureNeeded(Vec<RoleName>),
    NoAction,
}

/// One signing-event session for one user.
pub struct Workbench<'a> {
    repo: Repository,
    base: RoleSet,
    config: &'a SignerConfig,
    registry: &'a SignerRegistry,
}

impl<'a> Workbench<'a> {
    pub fn new(
        tree: WorkingTree,
        base: RoleSet,
        config: &'a SignerConfig,
        registry: &'a SignerRegistry,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Workbench {
            repo: Repository::open(tree, now),
            base,
            config,
            registry,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Determine the current state for this user.
    pub fn state(&self) -> Result<WorkbenchState> {
        let event = self.repo.role_set()?;
        if event.get(&RoleName::Root).is_none() {
            return Ok(WorkbenchState::Uninitialized);
        }
        let invites = self.user_invites(&event);
        if !invites.is_empty() {
            return Ok(WorkbenchState::Invited(invites));
        }
        let changes = self.target_changes()?;
        if !changes.is_empty() {
            return Ok(WorkbenchState::TargetsChanged(changes));
        }
        let unsigned = self.unsigned_roles(&event)?;
        if !unsigned.is_empty() {
            return Ok(WorkbenchState::SignatureNeeded(unsigned));
        }
        Ok(WorkbenchState::NoAction)
    }

    /// Roles the user holds an open invitation for.
    fn user_invites(&self, event: &RoleSet) -> Vec<String> {
        let mut roles = Vec::new();
        for delegating in [RoleName::Root, RoleName::Targets] {
            if let Some(md) = event.get(&delegating) {
                for (role, handles) in md.signed.invites() {
                    if handles.iter().any(|h| h == &self.config.user_name) {
                        roles.push(role);
                    }
                }
            }
        }
        roles.sort();
        roles.dedup();
        roles
    }

    /// Changed offline roles where a key owned by the user has not signed
    /// the event payload.
    fn unsigned_roles(&self, event: &RoleSet) -> Result<Vec<RoleName>> {
        let invited = self.user_invites(event);
        let mut unsigned = Vec::new();
        for (role, md) in event.iter() {
            if role.is_online() || invited.contains(&role.to_string()) {
                continue;
            }
            if self.base.get(role) == Some(md) {
                continue;
            }
            if self.user_signature_needed(event, role, md)? {
                unsigned.push(role.clone());
            }
        }
        Ok(unsigned)
    }

    fn user_signature_needed(
        &self,
        event: &RoleSet,
        role: &RoleName,
        md: &Metadata,
    ) -> Result<bool> {
        let Some(delegator) = event.delegator_of(role) else {
            return Ok(false);
        };
        let Some(delegation) = delegator.signed.delegation(role) else {
            return Ok(false);
        };
        let payload = md.canonical_bytes()?;
        for (keyid, key) in &delegation.keys {
            if key.owner() != Some(self.config.user_name.as_str()) {
                continue;
            }
            let signed = md
                .signature_for(keyid)
                .map(|sig| key.verify(sig, &payload).is_ok())
                .unwrap_or(false);
            if !signed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Compare target files on disk with the event metadata listings.
    pub fn target_changes(&self) -> Result<BTreeMap<RoleName, Vec<TargetChange>>> {
        let scanned = self.repo.scan_targets()?;
        let event = self.repo.role_set()?;
        let mut out: BTreeMap<RoleName, Vec<TargetChange>> = BTreeMap::new();

        let mut roles: Vec<RoleName> = scanned.keys().cloned().collect();
        roles.extend(event.role_names().filter(|r| r.is_targets_kind()).cloned());
        roles.sort();
        roles.dedup();

        for role in roles {
            let listed = match event.get(&role).map(|md| &md.signed) {
                Some(Signed::Targets(t)) => t.targets.clone(),
                Some(_) => BTreeMap::new(),
                None => {
                    return Err(PlaygroundError::InvariantViolation(format!(
                        "target files have been added for unknown role {role}"
                    )))
                }
            };
            let empty = BTreeMap::new();
            let on_disk = scanned.get(&role).unwrap_or(&empty);
            let mut changes = Vec::new();
            for (path, file) in on_disk {
                match listed.get(path) {
                    None => changes.push(TargetChange {
                        path: path.clone(),
                        kind: TargetChangeKind::Added,
                    }),
                    Some(entry) if entry.hashes != file.hashes || entry.length != file.length => {
                        changes.push(TargetChange {
                            path: path.clone(),
                            kind: TargetChangeKind::Modified,
                        })
                    }
                    Some(_) => {}
                }
            }
            for path in listed.keys() {
                if !on_disk.contains_key(path) {
                    changes.push(TargetChange {
                        path: path.clone(),
                        kind: TargetChangeKind::Removed,
                    });
                }
            }
            if !changes.is_empty() {
                out.insert(role, changes);
            }
        }
        Ok(out)
    }

    /// Sync target metadata to the files on disk and sign the result.
    pub fn update_targets(&self) -> Result<Vec<RoleName>> {
        let changes = self.target_changes()?;
        let scanned = self.repo.scan_targets()?;
        let mut updated = Vec::new();
        for (role, role_changes) in changes {
            let mut md = self.open_role(&role)?;
            let Signed::Targets(ref mut targets) = md.signed else {
                return Err(PlaygroundError::MalformedMetadata(format!(
                    "{role} is not targets metadata"
                )));
            };
            let empty = BTreeMap::new();
            let on_disk = scanned.get(&role).unwrap_or(&empty);
            for change in &role_changes {
                match change.kind {
                    TargetChangeKind::Removed => {
                        targets.targets.remove(&change.path);
                    }
                    TargetChangeKind::Added | TargetChangeKind::Modified => {
                        if let Some(file) = on_disk.get(&change.path) {
                            targets.targets.insert(change.path.clone(), file.clone());
                        }
                    }
                }
            }
            self.close_role(&role, md)?;
            updated.push(role);
        }
        Ok(updated)
    }

    /// Menu loop for an offline role: configure signers, configure expiry,
    /// continue.
    pub fn configure_offline(
        &self,
        prompt: &mut dyn Prompt,
        role: &RoleName,
        mut config: OfflineConfig,
    ) -> Result<OfflineConfig> {
        loop {
            let menu = format!(
                "Configuring role {role}\n \
                 1. Configure signers: [{}], requiring {} signatures\n \
                 2. Configure expiry: role expires in {} days, re-signing starts {} days before expiry\n\
                 Please choose an option or press enter to continue",
                config.signers.join(", "),
                config.threshold,
                config.expiry_period,
                config.signing_period,
            );
            match prompt.choose(&menu, 2, 0)? {
                0 => break,
                1 => {
                    let response = prompt.line(
                        &format!("Please enter list of {role} signers"),
                        &config.signers.join(", "),
                    )?;
                    config.signers = response
                        .split(',')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(|s| {
                            if s.starts_with('@') {
                                s.to_string()
                            } else {
                                format!("@{s}")
                            }
                        })
                        .collect();
                    config.threshold = if config.signers.len() == 1 {
                        1
                    } else {
                        parse_number(&prompt.line(
                            &format!("Please enter {role} threshold"),
                            &config.threshold.to_string(),
                        )?)? as u32
                    };
                }
                2 => {
                    config.expiry_period = parse_number(&prompt.line(
                        &format!("Please enter {role} expiry period in days"),
                        &config.expiry_period.to_string(),
                    )?)?;
                    config.signing_period = parse_number(&prompt.line(
                        &format!("Please enter {role} signing period in days"),
                        &config.signing_period.to_string(),
                    )?)?;
                }
                _ => unreachable!("choose() bounds the range"),
            }
        }
        if config.signers.is_empty()
            || config.threshold < 1
            || config.threshold as usize > config.signers.len()
        {
            return Err(PlaygroundError::InvariantViolation(format!(
                "threshold {} is not within 1..={} signers",
                config.threshold,
                config.signers.len()
            )));
        }
        Ok(config)
    }

    /// Menu loop for the online roles.
    pub fn configure_online(
        &self,
        prompt: &mut dyn Prompt,
        mut config: OnlineConfig,
    ) -> Result<OnlineConfig> {
        loop {
            let menu = format!(
                "Configuring online roles\n \
                 1. Configure timestamp: expires in {} days\n \
                 2. Configure snapshot: expires in {} days\n\
                 Please choose an option or press enter to continue",
                config.timestamp_expiry, config.snapshot_expiry,
            );
            match prompt.choose(&menu, 2, 0)? {
                0 => break,
                1 => {
                    config.timestamp_expiry = parse_number(&prompt.line(
                        "Please enter timestamp expiry in days",
                        &config.timestamp_expiry.to_string(),
                    )?)?;
                }
                2 => {
                    config.snapshot_expiry = parse_number(&prompt.line(
                        "Please enter snapshot expiry in days",
                        &config.snapshot_expiry.to_string(),
                    )?)?;
                }
                _ => unreachable!("choose() bounds the range"),
            }
        }
        Ok(config)
    }

    /// Create root, targets and the online configuration for a fresh
    /// repository, driven by the prompt.
    pub fn init_repository(
        &self,
        prompt: &mut dyn Prompt,
        online_key: Key,
        signing_key: Option<Key>,
    ) -> Result<()> {
        let user = &self.config.user_name;
        let root_config =
            self.configure_offline(prompt, &RoleName::Root, OfflineConfig::initial(user))?;
        let targets_config =
            self.configure_offline(prompt, &RoleName::Targets, root_config.clone())?;
        let online_config = self.configure_online(
            prompt,
            OnlineConfig {
                key: online_key,
                timestamp_expiry: 1,
                snapshot_expiry: root_config.expiry_period.min(365),
                timestamp_signing: None,
                snapshot_signing: None,
            },
        )?;

        self.set_role_config(&RoleName::Root, &root_config, signing_key.as_ref())?;
        self.set_role_config(&RoleName::Targets, &targets_config, signing_key.as_ref())?;
        self.set_online_config(&online_config)
    }

    /// The current delegation configuration of an offline role, invited
    /// signers included.
    pub fn role_config(&self, role: &RoleName) -> Result<Option<OfflineConfig>> {
        if role.is_online() {
            return Err(PlaygroundError::InvariantViolation(
                "online roles are not configured per role".to_string(),
            ));
        }
        let delegator = self.open_role(&role.delegator())?;
        let Some(delegation) = delegator.signed.delegation(role) else {
            return Ok(None);
        };
        let mut signers: Vec<String> = delegator
            .signed
            .invites()
            .get(&role.to_string())
            .cloned()
            .unwrap_or_default();
        signers.extend(delegation.owners());
        signers.sort();
        signers.dedup();

        let md = self.open_role(role)?;
        Ok(Some(OfflineConfig {
            signers,
            threshold: delegation.threshold,
            expiry_period: md.signed.expiry_period_days().unwrap_or(0),
            signing_period: md.signed.signing_period_days().unwrap_or(0),
        }))
    }

    /// Apply a delegation configuration: invite new signers, bind the
    /// user's own key when provided, revoke removed signers, set the
    /// threshold and the role's periods.
    pub fn set_role_config(
        &self,
        role: &RoleName,
        config: &OfflineConfig,
        signing_key: Option<&Key>,
    ) -> Result<()> {
        if role.is_online() {
            return Err(PlaygroundError::InvariantViolation(
                "online roles are configured through set_online_config".to_string(),
            ));
        }
        let user = &self.config.user_name;
        let delegator_role = role.delegator();
        let mut delegator = self.open_role(&delegator_role)?;
        let mut changed = self.repo.try_read_role(&delegator_role)?.is_none();

        // make sure the delegation entry exists
        if delegator.signed.delegation(role).is_none() {
            match delegator.signed {
                Signed::Targets(ref mut targets) => {
                    targets.ensure_delegation(&role.to_string(), config.threshold);
                    changed = true;
                }
                _ => {
                    return Err(PlaygroundError::MalformedMetadata(format!(
                        "no delegation entry for {role}"
                    )))
                }
            }
        }

        // invites for this role are rebuilt from the new signer list
        let mut invites = delegator.signed.invites();
        let before = invites.remove(&role.to_string()).unwrap_or_default();

        let delegation = delegator.signed.delegation(role).expect("ensured above");
        let current_owners: BTreeMap<String, String> = delegation
            .keys
            .iter()
            .filter_map(|(id, k)| k.owner().map(|o| (o.to_string(), id.clone())))
            .collect();

        // revoke signers that were removed from the configuration
        for (owner, keyid) in &current_owners {
            if !config.signers.contains(owner) {
                revoke_key(&mut delegator.signed, role, keyid)?;
                changed = true;
            }
        }

        // invite signers without keys; bind the user's own key directly
        for signer in &config.signers {
            if current_owners.contains_key(signer) {
                continue;
            }
            if signer == user {
                if let Some(key) = signing_key {
                    let mut key = key.clone();
                    key.set_owner(user);
                    add_key(&mut delegator.signed, role, key)?;
                    changed = true;
                    continue;
                }
            }
            invites.entry(role.to_string()).or_default().push(signer.clone());
        }
        if let Some(handles) = invites.get_mut(&role.to_string()) {
            handles.sort();
            handles.dedup();
        }
        if invites.get(&role.to_string()).cloned().unwrap_or_default() != before {
            changed = true;
        }
        delegator.signed.set_invites(&invites);

        if set_threshold(&mut delegator.signed, role, config.threshold)? {
            changed = true;
        }

        if *role == RoleName::Root {
            // root delegates itself: periods live on the same payload
            let periods_changed = delegator.signed.expiry_period_days()
                != Some(config.expiry_period)
                || delegator.signed.signing_period_days() != Some(config.signing_period);
            if !changed && !periods_changed {
                debug!("no changes to root");
                return self.sync_event_state();
            }
            let custom = delegator.signed.custom_mut().expect("root has custom");
            custom.insert(FIELD_EXPIRY_PERIOD.to_string(), config.expiry_period.into());
            custom.insert(FIELD_SIGNING_PERIOD.to_string(), config.signing_period.into());
            self.close_role(&RoleName::Root, delegator)?;
        } else {
            if changed {
                self.close_role(&delegator_role, delegator)?;
            } else {
                debug!(role = %role, "no changes to delegating role");
            }
            let mut md = self.open_role(role)?;
            let periods_changed = md.signed.expiry_period_days() != Some(config.expiry_period)
                || md.signed.signing_period_days() != Some(config.signing_period);
            if periods_changed || self.repo.try_read_role(role)?.is_none() {
                let custom = md.signed.custom_mut().expect("targets has custom");
                custom.insert(FIELD_EXPIRY_PERIOD.to_string(), config.expiry_period.into());
                custom.insert(FIELD_SIGNING_PERIOD.to_string(), config.signing_period.into());
                self.close_role(role, md)?;
            }
        }
        self.sync_event_state()
    }

    /// Store the online delegation configuration in root.
    pub fn set_online_config(&self, config: &OnlineConfig) -> Result<()> {
        let mut key = config.key.clone();
        if key.online_uri().is_none() {
            return Err(PlaygroundError::InvariantViolation(
                "online key must carry an online URI".to_string(),
            ));
        }
        key.custom.remove(crate::metadata::FIELD_KEYOWNER);

        let mut root_md = self.open_role(&RoleName::Root)?;
        {
            let Signed::Root(ref mut root) = root_md.signed else {
                return Err(PlaygroundError::MalformedMetadata(
                    "root.json is not root metadata".to_string(),
                ));
            };
            for (online_role, expiry, signing) in [
                (
                    "timestamp",
                    config.timestamp_expiry,
                    config.timestamp_signing,
                ),
                ("snapshot", config.snapshot_expiry, config.snapshot_signing),
            ] {
                let existing: Vec<String> = root
                    .roles
                    .get(online_role)
                    .map(|entry| entry.keyids.clone())
                    .unwrap_or_default();
                for keyid in existing {
                    root.revoke_key(online_role, &keyid)?;
                }
                root.add_key(online_role, key.clone())?;
                let entry = root.roles.get_mut(online_role).expect("entry exists");
                entry
                    .custom
                    .insert(FIELD_EXPIRY_PERIOD.to_string(), expiry.into());
                match signing {
                    Some(days) => {
                        entry
                            .custom
                            .insert(FIELD_SIGNING_PERIOD.to_string(), days.into());
                    }
                    None => {
                        entry.custom.remove(FIELD_SIGNING_PERIOD);
                    }
                }
            }
        }
        self.close_role(&RoleName::Root, root_md)
    }

    /// The online delegation configuration currently in root.
    pub fn online_config(&self) -> Result<OnlineConfig> {
        let root_md = self.open_role(&RoleName::Root)?;
        let Signed::Root(ref root) = root_md.signed else {
            return Err(PlaygroundError::MalformedMetadata(
                "root.json is not root metadata".to_string(),
            ));
        };
        let entry_days = |role: &str, field: &str| -> Option<i64> {
            root.roles.get(role)?.custom.get(field)?.as_i64()
        };
        let delegation = root_md
            .signed
            .delegation(&RoleName::Timestamp)
            .ok_or_else(|| {
                PlaygroundError::MalformedMetadata("root does not delegate timestamp".to_string())
            })?;
        let key = delegation
            .keys
            .first()
            .map(|(_, k)| k.clone())
            .ok_or_else(|| {
                PlaygroundError::InvariantViolation("no online key configured".to_string())
            })?;
        Ok(OnlineConfig {
            key,
            timestamp_expiry: entry_days("timestamp", FIELD_EXPIRY_PERIOD).unwrap_or(1),
            snapshot_expiry: entry_days("snapshot", FIELD_EXPIRY_PERIOD).unwrap_or(365),
            timestamp_signing: entry_days("timestamp", FIELD_SIGNING_PERIOD),
            snapshot_signing: entry_days("snapshot", FIELD_SIGNING_PERIOD),
        })
    }

    /// Accept every open invitation: bind the public key, clear the
    /// invites, sign the roles the user just became a signer for.
    pub fn accept_invitations(&self, signing_key: &Key) -> Result<Vec<String>> {
        let event = self.repo.role_set()?;
        let invited = self.user_invites(&event);
        for role_name in &invited {
            let role: RoleName = role_name.parse()?;
            let config = self.role_config(&role)?.ok_or_else(|| {
                PlaygroundError::MalformedMetadata(format!("no delegation found for {role}"))
            })?;
            self.set_role_config(&role, &config, Some(signing_key))?;
            // root was re-signed by set_role_config; everything else needs
            // an explicit signature on the delegated payload
            if role != RoleName::Root {
                self.sign(&role)?;
            }
        }
        Ok(invited)
    }

    /// Sign `role` as the user, without payload changes.
    pub fn sign(&self, role: &RoleName) -> Result<()> {
        let event = self.repo.role_set()?;
        let mut md = self.repo.read_role(role)?;
        let delegator = event.delegator_of(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("no delegating role for {role}"))
        })?;
        let delegation = delegator.signed.delegation(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("no delegation found for {role}"))
        })?;
        let payload = md.canonical_bytes()?;
        for (keyid, key) in &delegation.keys {
            if key.owner() != Some(self.config.user_name.as_str()) {
                continue;
            }
            let backend = self.signer_for_key(key)?;
            let signature = backend.sign(keyid, &payload)?;
            key.verify(&signature, &payload)
                .map_err(|_| PlaygroundError::SignatureRejected(format!("key {keyid}")))?;
            md.set_signature(signature);
            self.repo
                .write_role(role, &md, SignatureRequirement::PartialEvent)?;
            return Ok(());
        }
        Err(PlaygroundError::SignerUnavailable {
            uri: role.to_string(),
            reason: format!("{} holds no key for {role}", self.config.user_name),
        })
    }

    /// Read an event-tree role, or create the empty payload a first edit
    /// starts from.
    fn open_role(&self, role: &RoleName) -> Result<Metadata> {
        if let Some(md) = self.repo.try_read_role(role)? {
            return Ok(md);
        }
        let now = crate::metadata::truncate_expiry(self.repo.now());
        let signed = match role {
            RoleName::Root => Signed::Root(Root {
                consistent_snapshot: true,
                expires: now,
                keys: BTreeMap::new(),
                roles: ["root", "targets", "snapshot", "timestamp"]
                    .iter()
                    .map(|r| (r.to_string(), RoleKeys::new(Vec::new(), 1)))
                    .collect(),
                spec_version: SPEC_VERSION.to_string(),
                version: 0,
                custom: BTreeMap::new(),
            }),
            RoleName::Targets | RoleName::Delegated(_) => Signed::Targets(Targets {
                expires: now,
                spec_version: SPEC_VERSION.to_string(),
                targets: BTreeMap::new(),
                version: 0,
                delegations: None,
                custom: BTreeMap::new(),
            }),
            RoleName::Snapshot | RoleName::Timestamp => {
                return Err(PlaygroundError::InvariantViolation(format!(
                    "cannot create {role} in a signing event"
                )))
            }
        };
        Ok(Metadata::new(signed))
    }

    /// Finish an edit: bump the version once per event, reset the expiry
    /// from the role's period, lay down placeholder signatures and the
    /// user's own signature (withheld while invites are open).
    fn close_role(&self, role: &RoleName, mut md: Metadata) -> Result<()> {
        let base_version = self
            .base
            .get(role)
            .map(|m| m.signed.version())
            .unwrap_or(0);
        md.signed.set_version(base_version + 1);

        let days = md
            .signed
            .expiry_period_days()
            .ok_or_else(|| PlaygroundError::ExpiryPolicyViolation {
                role: role.to_string(),
                reason: format!("no {FIELD_EXPIRY_PERIOD} configured"),
            })?;
        md.signed.set_expires(self.repo.now() + Duration::days(days));

        md.signatures.clear();
        let open_invites = !md.signed.invites().is_empty();
        let delegation = if *role == RoleName::Root {
            md.signed.delegation(&RoleName::Root)
        } else {
            self.repo
                .try_read_role(&role.delegator())?
                .and_then(|d| d.signed.delegation(role))
        };
        let Some(delegation) = delegation else {
            return Err(PlaygroundError::MalformedMetadata(format!(
                "no delegation found for {role}"
            )));
        };
        let payload = crate::metadata::canonical::to_canonical_json(&md.signed)?;
        for (keyid, key) in &delegation.keys {
            if key.owner() == Some(self.config.user_name.as_str()) && !open_invites {
                let backend = self.signer_for_key(key)?;
                let signature = backend.sign(keyid, &payload)?;
                key.verify(&signature, &payload)
                    .map_err(|_| PlaygroundError::SignatureRejected(format!("key {keyid}")))?;
                md.set_signature(signature);
            } else {
                if open_invites && key.owner() == Some(self.config.user_name.as_str()) {
                    debug!(role = %role, "skipping signing: open invites");
                }
                md.set_signature(crate::metadata::Signature::placeholder(keyid));
            }
        }
        self.repo
            .write_role(role, &md, SignatureRequirement::PartialEvent)
    }

    /// Resolve the signer backend for one of the user's keys: an explicit
    /// URI from the configuration wins; sigstore keys get the keyless
    /// backend; anything else is assumed to sit on the hardware token.
    fn signer_for_key(&self, key: &Key) -> Result<Box<dyn crate::signer::SignerBackend>> {
        let keyid = key.key_id()?;
        let uri = match self.config.signing_key_uris.get(&keyid) {
            Some(uri) => uri.clone(),
            None if key.keytype == "sigstore-oidc" => "sigstore:?ambient=false".to_string(),
            None => "hsm:".to_string(),
        };
        self.registry.signer_for(&uri, key)
    }

    /// Mirror the metadata-carried invites into `.signing-event-state`,
    /// keyed by handle for the CI status job.
    fn sync_event_state(&self) -> Result<()> {
        let event = self.repo.role_set()?;
        let mut by_handle: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for delegating in [RoleName::Root, RoleName::Targets] {
            if let Some(md) = event.get(&delegating) {
                for (role, handles) in md.signed.invites() {
                    for handle in handles {
                        by_handle.entry(handle).or_default().push(role.clone());
                    }
                }
            }
        }
        for roles in by_handle.values_mut() {
            roles.sort();
            roles.dedup();
        }
        self.repo.write_event_state(&by_handle)
    }
}

fn parse_number(answer: &str) -> Result<i64> {
    answer.trim().parse().map_err(|_| {
        PlaygroundError::InvariantViolation(format!("{answer:?} is not a number"))
    })
}

fn add_key(signed: &mut Signed, role: &RoleName, key: Key) -> Result<()> {
    match signed {
        Signed::Root(root) => root.add_key(&role.to_string(), key),
        Signed::Targets(targets) => targets.add_delegated_key(&role.to_string(), key),
        _ => Err(PlaygroundError::MalformedMetadata(format!(
            "{role} cannot carry delegations"
        ))),
    }
}

fn revoke_key(signed: &mut Signed, role: &RoleName, keyid: &str) -> Result<()> {
    match signed {
        Signed::Root(root) => root.revoke_key(&role.to_string(), keyid),
        Signed::Targets(targets) => targets.revoke_delegated_key(&role.to_string(), keyid),
        _ => Err(PlaygroundError::MalformedMetadata(format!(
            "{role} cannot carry delegations"
        ))),
    }
}

fn set_threshold(signed: &mut Signed, role: &RoleName, threshold: u32) -> Result<bool> {
    match signed {
        Signed::Root(root) => {
            let entry = root.roles.get_mut(&role.to_string()).ok_or_else(|| {
                PlaygroundError::MalformedMetadata(format!("no role entry for {role}"))
            })?;
            let changed = entry.threshold != threshold;
            entry.threshold = threshold;
            Ok(changed)
        }
        Signed::Targets(targets) => {
            let delegations = targets.delegations.as_mut().ok_or_else(|| {
                PlaygroundError::MalformedMetadata(format!("no delegation for {role}"))
            })?;
            let entry = delegations.role_mut(&role.to_string()).ok_or_else(|| {
                PlaygroundError::MalformedMetadata(format!("no delegation for {role}"))
            })?;
            let changed = entry.threshold != threshold;
            entry.threshold = threshold;
            Ok(changed)
        }
        _ => Err(PlaygroundError::MalformedMetadata(format!(
            "{role} cannot carry delegations"
        ))),
    }
}
