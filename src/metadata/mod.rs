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

//! The in-memory TUF role graph.
//!
//! Role payloads are strongly typed; everything this repository does not
//! recognize is carried in flattened custom-field maps and preserved
//! verbatim through a load/save round-trip. Signature payloads are produced
//! by the canonical serializer in [`canonical`], so verification is stable
//! across implementations.
//!
//! The custom fields recognized by this repository:
//!
//! | field | carrier | meaning |
//! |---|---|---|
//! | `x-playground-online-uri` | key | online key, URI resolved by the signer registry |
//! | `x-playground-keyowner` | key | handle of the human owner |
//! | `x-playground-expiry-period` | role payload / online role entry | days added to `now` at each bump |
//! | `x-playground-signing-period` | role payload / online role entry | days before expiry that open the signing window |
//! | `x-playground-invites` | delegating role payload | delegated role name -> invited owner handles |

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{PlaygroundError, Result};
use crate::git::GitSurface;

pub mod canonical;

/// Custom field marking a key as online; the URI resolves through the
/// signer registry.
pub const FIELD_ONLINE_URI: &str = "x-playground-online-uri";
/// Custom field naming the human owner of a key.
pub const FIELD_KEYOWNER: &str = "x-playground-keyowner";
/// Custom field: days added to `now` when a role version is bumped.
pub const FIELD_EXPIRY_PERIOD: &str = "x-playground-expiry-period";
/// Custom field: days before expiry at which re-signing should start.
pub const FIELD_SIGNING_PERIOD: &str = "x-playground-signing-period";
/// Custom field on a delegating role: open invitations per delegated role.
pub const FIELD_INVITES: &str = "x-playground-invites";

/// TUF specification version written into new metadata.
pub const SPEC_VERSION: &str = "1.0.31";

/// `expires` timestamps use second granularity with a literal `Z` suffix.
pub(crate) mod expiry_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        let naive = NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)?;
        Ok(naive.and_utc())
    }
}

/// Truncate a timestamp to the second granularity used on the wire, so that
/// an in-memory value round-trips through serialization unchanged.
pub fn truncate_expiry(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).expect("timestamp in range")
}

/// A role name. Ordering follows the evaluation order of the signing-event
/// engine: root first, then the online roles, targets, and delegated targets
/// in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoleName {
    Root,
    Timestamp,
    Snapshot,
    Targets,
    Delegated(String),
}

impl RoleName {
    /// Roles signed automatically with service-held keys.
    pub fn is_online(&self) -> bool {
        matches!(self, RoleName::Timestamp | RoleName::Snapshot)
    }

    /// Roles that carry a target-file listing.
    pub fn is_targets_kind(&self) -> bool {
        matches!(self, RoleName::Targets | RoleName::Delegated(_))
    }

    /// The role whose key set authorizes this role's signatures. Root
    /// delegates to itself.
    pub fn delegator(&self) -> RoleName {
        match self {
            RoleName::Delegated(_) => RoleName::Targets,
            _ => RoleName::Root,
        }
    }

    /// File name inside the metadata directory.
    pub fn filename(&self) -> String {
        format!("{self}.json")
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleName::Root => write!(f, "root"),
            RoleName::Timestamp => write!(f, "timestamp"),
            RoleName::Snapshot => write!(f, "snapshot"),
            RoleName::Targets => write!(f, "targets"),
            RoleName::Delegated(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for RoleName {
    type Err = PlaygroundError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "root" => RoleName::Root,
            "timestamp" => RoleName::Timestamp,
            "snapshot" => RoleName::Snapshot,
            "targets" => RoleName::Targets,
            "" => {
                return Err(PlaygroundError::MalformedMetadata(
                    "empty role name".to_string(),
                ))
            }
            other => RoleName::Delegated(other.to_string()),
        })
    }
}

/// A single signature over a role's canonical payload. An empty `sig` is a
/// placeholder recording an outstanding obligation; it never verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub sig: String,
}

impl Signature {
    pub fn placeholder(keyid: &str) -> Self {
        Signature {
            keyid: keyid.to_string(),
            sig: String::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.sig.is_empty()
    }
}

/// Key material. ed25519 public keys are hex encoded; ecdsa keys are PEM
/// SPKI. Keyless (sigstore) keys carry identity/issuer pairs instead of a
/// public value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl KeyVal {
    pub fn public(public: impl Into<String>) -> Self {
        KeyVal {
            public: Some(public.into()),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub keytype: String,
    pub scheme: String,
    pub keyval: KeyVal,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Key {
    /// The key identifier: hex sha256 of the canonical form of the key's
    /// type, scheme and value. Custom fields are excluded so annotating a
    /// key (owner handle, online URI) does not change its identity.
    pub fn key_id(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Identity<'a> {
            keytype: &'a str,
            scheme: &'a str,
            keyval: &'a KeyVal,
        }
        let bytes = canonical::to_canonical_json(&Identity {
            keytype: &self.keytype,
            scheme: &self.scheme,
            keyval: &self.keyval,
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn online_uri(&self) -> Option<&str> {
        self.custom.get(FIELD_ONLINE_URI).and_then(|v| v.as_str())
    }

    pub fn owner(&self) -> Option<&str> {
        self.custom.get(FIELD_KEYOWNER).and_then(|v| v.as_str())
    }

    pub fn is_online(&self) -> bool {
        self.online_uri().is_some()
    }

    pub fn set_owner(&mut self, handle: &str) {
        self.custom
            .insert(FIELD_KEYOWNER.to_string(), handle.into());
    }

    pub fn set_online_uri(&mut self, uri: &str) {
        self.custom.insert(FIELD_ONLINE_URI.to_string(), uri.into());
    }

    /// Every key is either online or human-owned, never both, never neither.
    pub fn validate(&self) -> Result<()> {
        match (self.online_uri(), self.owner()) {
            (Some(_), Some(_)) => Err(PlaygroundError::InvariantViolation(format!(
                "key {} has both an online URI and a key owner",
                self.key_id().unwrap_or_default()
            ))),
            (None, None) => Err(PlaygroundError::InvariantViolation(format!(
                "key {} has neither an online URI nor a key owner",
                self.key_id().unwrap_or_default()
            ))),
            _ => Ok(()),
        }
    }

    /// Verify `sig` over `payload`. Placeholder signatures are rejected as
    /// `SignatureRejected`; schemes without a local verifier are
    /// `UnknownScheme`.
    pub fn verify(&self, sig: &Signature, payload: &[u8]) -> Result<()> {
        if sig.is_placeholder() {
            return Err(PlaygroundError::SignatureRejected(format!(
                "placeholder signature for key {}",
                sig.keyid
            )));
        }
        match self.scheme.as_str() {
            "ed25519" => self.verify_ed25519(sig, payload),
            "ecdsa-sha2-nistp256" | "ecdsa" => self.verify_ecdsa_p256(sig, payload),
            other => Err(PlaygroundError::UnknownScheme(other.to_string())),
        }
    }

    fn public_value(&self) -> Result<&str> {
        self.keyval.public.as_deref().ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!(
                "{} key has no public value",
                self.keytype
            ))
        })
    }

    fn verify_ed25519(&self, sig: &Signature, payload: &[u8]) -> Result<()> {
        use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

        let public = hex::decode(self.public_value()?).map_err(|e| {
            PlaygroundError::MalformedMetadata(format!("bad ed25519 public key encoding: {e}"))
        })?;
        let public: [u8; 32] = public.as_slice().try_into().map_err(|_| {
            PlaygroundError::MalformedMetadata("ed25519 public key must be 32 bytes".to_string())
        })?;
        let key = VerifyingKey::from_bytes(&public).map_err(|e| {
            PlaygroundError::MalformedMetadata(format!("bad ed25519 public key: {e}"))
        })?;
        let raw = hex::decode(&sig.sig).map_err(|e| {
            PlaygroundError::SignatureRejected(format!("bad signature encoding: {e}"))
        })?;
        let signature = DalekSignature::from_slice(&raw).map_err(|e| {
            PlaygroundError::SignatureRejected(format!("bad ed25519 signature: {e}"))
        })?;
        key.verify(payload, &signature)
            .map_err(|_| PlaygroundError::SignatureRejected(format!("key {}", sig.keyid)))
    }

    fn verify_ecdsa_p256(&self, sig: &Signature, payload: &[u8]) -> Result<()> {
        use p256::ecdsa::signature::Verifier;
        use p256::ecdsa::{Signature as P256Signature, VerifyingKey};
        use p256::pkcs8::DecodePublicKey;

        let key = VerifyingKey::from_public_key_pem(self.public_value()?).map_err(|e| {
            PlaygroundError::MalformedMetadata(format!("bad ecdsa public key: {e}"))
        })?;
        let raw = hex::decode(&sig.sig).map_err(|e| {
            PlaygroundError::SignatureRejected(format!("bad signature encoding: {e}"))
        })?;
        let signature = P256Signature::from_der(&raw).map_err(|e| {
            PlaygroundError::SignatureRejected(format!("bad ecdsa signature: {e}"))
        })?;
        key.verify(payload, &signature)
            .map_err(|_| PlaygroundError::SignatureRejected(format!("key {}", sig.keyid)))
    }
}

/// A top-level role entry inside root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<String>,
    pub threshold: u32,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl RoleKeys {
    pub fn new(keyids: Vec<String>, threshold: u32) -> Self {
        RoleKeys {
            keyids,
            threshold,
            custom: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedRole {
    pub name: String,
    pub keyids: Vec<String>,
    pub threshold: u32,
    pub terminating: bool,
    pub paths: Vec<String>,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegations {
    pub keys: BTreeMap<String, Key>,
    pub roles: Vec<DelegatedRole>,
}

impl Delegations {
    pub fn role(&self, name: &str) -> Option<&DelegatedRole> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn role_mut(&mut self, name: &str) -> Option<&mut DelegatedRole> {
        self.roles.iter_mut().find(|r| r.name == name)
    }
}

/// A target-file entry: length plus at least a sha256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFile {
    pub length: u64,
    pub hashes: BTreeMap<String, String>,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl TargetFile {
    /// Hash a file on disk into a target entry.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(&data))
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_string(), hex::encode(Sha256::digest(data)));
        TargetFile {
            length: data.len() as u64,
            hashes,
            custom: BTreeMap::new(),
        }
    }
}

/// Version pointer used in snapshot and timestamp meta maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub consistent_snapshot: bool,
    #[serde(with = "expiry_format")]
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, Key>,
    pub roles: BTreeMap<String, RoleKeys>,
    pub spec_version: String,
    pub version: u32,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Root {
    /// Add `key` to the named role entry (and the key map), keeping the
    /// keyid list free of duplicates.
    pub fn add_key(&mut self, role: &str, key: Key) -> Result<()> {
        let keyid = key.key_id()?;
        let entry = self.roles.get_mut(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("root has no role entry for {role}"))
        })?;
        if !entry.keyids.contains(&keyid) {
            entry.keyids.push(keyid.clone());
        }
        self.keys.insert(keyid, key);
        Ok(())
    }

    /// Remove `keyid` from the named role entry; the key itself is dropped
    /// from the key map once no role references it.
    pub fn revoke_key(&mut self, role: &str, keyid: &str) -> Result<()> {
        let entry = self.roles.get_mut(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("root has no role entry for {role}"))
        })?;
        entry.keyids.retain(|k| k != keyid);
        let still_used = self.roles.values().any(|r| r.keyids.iter().any(|k| k == keyid));
        if !still_used {
            self.keys.remove(keyid);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(with = "expiry_format")]
    pub expires: DateTime<Utc>,
    pub spec_version: String,
    pub targets: BTreeMap<String, TargetFile>,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Targets {
    /// Ensure a delegation entry for `role` exists, creating it with the
    /// conventional `<role>/*` path pattern.
    pub fn ensure_delegation(&mut self, role: &str, threshold: u32) -> &mut DelegatedRole {
        let delegations = self.delegations.get_or_insert_with(|| Delegations {
            keys: BTreeMap::new(),
            roles: Vec::new(),
        });
        if delegations.role(role).is_none() {
            delegations.roles.push(DelegatedRole {
                name: role.to_string(),
                keyids: Vec::new(),
                threshold,
                terminating: true,
                paths: vec![format!("{role}/*")],
                custom: BTreeMap::new(),
            });
        }
        delegations.role_mut(role).expect("just inserted")
    }

    /// Add `key` to the delegation for `role`.
    pub fn add_delegated_key(&mut self, role: &str, key: Key) -> Result<()> {
        let keyid = key.key_id()?;
        let delegations = self.delegations.as_mut().ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("targets does not delegate {role}"))
        })?;
        let entry = delegations.role_mut(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("targets does not delegate {role}"))
        })?;
        if !entry.keyids.contains(&keyid) {
            entry.keyids.push(keyid.clone());
        }
        delegations.keys.insert(keyid, key);
        Ok(())
    }

    /// Remove `keyid` from the delegation for `role`; the key is dropped
    /// from the key map once no delegation references it.
    pub fn revoke_delegated_key(&mut self, role: &str, keyid: &str) -> Result<()> {
        let delegations = self.delegations.as_mut().ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("targets does not delegate {role}"))
        })?;
        let entry = delegations.role_mut(role).ok_or_else(|| {
            PlaygroundError::MalformedMetadata(format!("targets does not delegate {role}"))
        })?;
        entry.keyids.retain(|k| k != keyid);
        let still_used = delegations
            .roles
            .iter()
            .any(|r| r.keyids.iter().any(|k| k == keyid));
        if !still_used {
            delegations.keys.remove(keyid);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "expiry_format")]
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
    pub spec_version: String,
    pub version: u32,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    #[serde(with = "expiry_format")]
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
    pub spec_version: String,
    pub version: u32,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Timestamp {
    pub fn snapshot_version(&self) -> u32 {
        self.meta.get("snapshot.json").map(|m| m.version).unwrap_or(0)
    }
}

/// A resolved delegation: the threshold and the concrete keys authorized to
/// sign the delegated role.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub threshold: u32,
    pub keys: Vec<(String, Key)>,
}

impl Delegation {
    pub fn owners(&self) -> Vec<String> {
        self.keys
            .iter()
            .filter_map(|(_, k)| k.owner().map(str::to_string))
            .collect()
    }
}

/// The signed payload of a role, tagged by `_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
pub enum Signed {
    Root(Root),
    Targets(Targets),
    Snapshot(Snapshot),
    Timestamp(Timestamp),
}

impl Signed {
    pub fn version(&self) -> u32 {
        match self {
            Signed::Root(r) => r.version,
            Signed::Targets(t) => t.version,
            Signed::Snapshot(s) => s.version,
            Signed::Timestamp(t) => t.version,
        }
    }

    pub fn set_version(&mut self, version: u32) {
        match self {
            Signed::Root(r) => r.version = version,
            Signed::Targets(t) => t.version = version,
            Signed::Snapshot(s) => s.version = version,
            Signed::Timestamp(t) => t.version = version,
        }
    }

    pub fn expires(&self) -> DateTime<Utc> {
        match self {
            Signed::Root(r) => r.expires,
            Signed::Targets(t) => t.expires,
            Signed::Snapshot(s) => s.expires,
            Signed::Timestamp(t) => t.expires,
        }
    }

    pub fn set_expires(&mut self, expires: DateTime<Utc>) {
        let expires = truncate_expiry(expires);
        match self {
            Signed::Root(r) => r.expires = expires,
            Signed::Targets(t) => t.expires = expires,
            Signed::Snapshot(s) => s.expires = expires,
            Signed::Timestamp(t) => t.expires = expires,
        }
    }

    pub fn custom(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
        match self {
            Signed::Root(r) => Some(&r.custom),
            Signed::Targets(t) => Some(&t.custom),
            Signed::Snapshot(s) => Some(&s.custom),
            Signed::Timestamp(t) => Some(&t.custom),
        }
    }

    pub fn custom_mut(&mut self) -> Option<&mut BTreeMap<String, serde_json::Value>> {
        match self {
            Signed::Root(r) => Some(&mut r.custom),
            Signed::Targets(t) => Some(&mut t.custom),
            Signed::Snapshot(s) => Some(&mut s.custom),
            Signed::Timestamp(t) => Some(&mut t.custom),
        }
    }

    fn custom_days(&self, field: &str) -> Option<i64> {
        self.custom()?.get(field)?.as_i64()
    }

    /// Days added to `now` at each bump, for roles that carry the policy in
    /// their own payload (offline roles).
    pub fn expiry_period_days(&self) -> Option<i64> {
        self.custom_days(FIELD_EXPIRY_PERIOD)
    }

    /// Days before expiry that open the signing window.
    pub fn signing_period_days(&self) -> Option<i64> {
        self.custom_days(FIELD_SIGNING_PERIOD)
    }

    /// Open invitations recorded on this (delegating) role.
    pub fn invites(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        if let Some(value) = self.custom().and_then(|c| c.get(FIELD_INVITES)) {
            if let Some(map) = value.as_object() {
                for (role, handles) in map {
                    let handles = handles
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|h| h.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    out.insert(role.clone(), handles);
                }
            }
        }
        out
    }

    /// Replace the invitation map; an empty map removes the field entirely.
    pub fn set_invites(&mut self, invites: &BTreeMap<String, Vec<String>>) {
        let custom = match self.custom_mut() {
            Some(c) => c,
            None => return,
        };
        let non_empty: BTreeMap<_, _> =
            invites.iter().filter(|(_, v)| !v.is_empty()).collect();
        if non_empty.is_empty() {
            custom.remove(FIELD_INVITES);
        } else {
            custom.insert(
                FIELD_INVITES.to_string(),
                serde_json::to_value(non_empty).expect("string map serializes"),
            );
        }
    }

    /// Resolve the delegation this payload grants to `role`, if any.
    pub fn delegation(&self, role: &RoleName) -> Option<Delegation> {
        match self {
            Signed::Root(root) => {
                let entry = root.roles.get(&role.to_string())?;
                let keys = entry
                    .keyids
                    .iter()
                    .filter_map(|id| root.keys.get(id).map(|k| (id.clone(), k.clone())))
                    .collect();
                Some(Delegation {
                    threshold: entry.threshold,
                    keys,
                })
            }
            Signed::Targets(targets) => {
                let delegations = targets.delegations.as_ref()?;
                let entry = delegations.role(&role.to_string())?;
                let keys = entry
                    .keyids
                    .iter()
                    .filter_map(|id| delegations.keys.get(id).map(|k| (id.clone(), k.clone())))
                    .collect();
                Some(Delegation {
                    threshold: entry.threshold,
                    keys,
                })
            }
            _ => None,
        }
    }

    /// Names of the roles this payload delegates to.
    pub fn delegated_role_names(&self) -> Vec<RoleName> {
        match self {
            Signed::Root(root) => root
                .roles
                .keys()
                .filter_map(|name| name.parse().ok())
                .collect(),
            Signed::Targets(targets) => targets
                .delegations
                .as_ref()
                .map(|d| {
                    d.roles
                        .iter()
                        .map(|r| RoleName::Delegated(r.name.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// A role file: signed payload plus accumulated signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub signatures: Vec<Signature>,
    pub signed: Signed,
}

impl Metadata {
    pub fn new(signed: Signed) -> Self {
        Metadata {
            signatures: Vec::new(),
            signed,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let md: Metadata = serde_json::from_slice(bytes)?;
        Ok(md)
    }

    /// Serialize for storage: stable pretty JSON with a trailing newline so
    /// files diff cleanly in version control.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// The canonical byte string signatures are computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical::to_canonical_json(&self.signed)
    }

    pub fn signature_for(&self, keyid: &str) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.keyid == keyid)
    }

    /// Insert or replace the signature for `keyid`.
    pub fn set_signature(&mut self, signature: Signature) {
        match self.signatures.iter_mut().find(|s| s.keyid == signature.keyid) {
            Some(slot) => *slot = signature,
            None => self.signatures.push(signature),
        }
    }
}

/// Outcome of checking a role's signatures against its delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Threshold reached; `valid` distinct keys verified.
    Verified { valid: usize },
    /// No bad signatures, but fewer than `threshold` valid ones.
    Insufficient { valid: usize, threshold: u32 },
    /// One or more present signatures failed to verify.
    Invalid { keyids: Vec<String> },
}

/// Verify `md`'s signatures against the delegation `delegator` grants to
/// `role`. Placeholder signatures count as missing; signatures from keys
/// outside the delegation are ignored.
pub fn verify_role(delegator: &Signed, role: &RoleName, md: &Metadata) -> Result<VerificationOutcome> {
    let delegation = delegator.delegation(role).ok_or_else(|| {
        PlaygroundError::MalformedMetadata(format!("no delegation found for {role}"))
    })?;
    let payload = md.canonical_bytes()?;

    let mut valid = 0usize;
    let mut invalid = Vec::new();
    for (keyid, key) in &delegation.keys {
        let Some(sig) = md.signature_for(keyid) else {
            continue;
        };
        if sig.is_placeholder() {
            continue;
        }
        match key.verify(sig, &payload) {
            Ok(()) => valid += 1,
            Err(PlaygroundError::SignatureRejected(_)) => invalid.push(keyid.clone()),
            Err(e) => return Err(e),
        }
    }

    if !invalid.is_empty() {
        Ok(VerificationOutcome::Invalid { keyids: invalid })
    } else if valid >= delegation.threshold as usize {
        Ok(VerificationOutcome::Verified { valid })
    } else {
        Ok(VerificationOutcome::Insufficient {
            valid,
            threshold: delegation.threshold,
        })
    }
}

/// A loaded set of role files: one repository state (a commit, a working
/// tree) parsed into memory. Borrowed by the engines for the duration of
/// one operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleSet {
    roles: BTreeMap<RoleName, Metadata>,
}

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` role file from a metadata directory. A missing
    /// directory yields an empty set (an uninitialized repository).
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = RoleSet::new();
        if !dir.exists() {
            return Ok(set);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // versioned copies under root_history etc. are not role files
            let name: RoleName = match stem.parse() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let bytes = fs::read(&path)?;
            let md = Metadata::from_bytes(&bytes).map_err(|e| {
                PlaygroundError::MalformedMetadata(format!("{}: {e}", path.display()))
            })?;
            set.roles.insert(name, md);
        }
        Ok(set)
    }

    /// Load a repository state through the git surface, discovering roles by
    /// walking delegations from root.
    pub fn load_ref(git: &dyn GitSurface, gitref: &str) -> Result<Self> {
        let mut set = RoleSet::new();
        let mut pending = vec![RoleName::Root];
        let mut seen = std::collections::BTreeSet::new();
        while let Some(role) = pending.pop() {
            if !seen.insert(role.clone()) {
                continue;
            }
            let path = format!("metadata/{}", role.filename());
            let Some(bytes) = git.read_file(gitref, &path)? else {
                continue;
            };
            let md = Metadata::from_bytes(&bytes)
                .map_err(|e| PlaygroundError::MalformedMetadata(format!("{path}: {e}")))?;
            pending.extend(md.signed.delegated_role_names());
            set.roles.insert(role, md);
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn get(&self, role: &RoleName) -> Option<&Metadata> {
        self.roles.get(role)
    }

    pub fn insert(&mut self, role: RoleName, md: Metadata) {
        self.roles.insert(role, md);
    }

    pub fn remove(&mut self, role: &RoleName) -> Option<Metadata> {
        self.roles.remove(role)
    }

    pub fn role_names(&self) -> impl Iterator<Item = &RoleName> {
        self.roles.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoleName, &Metadata)> {
        self.roles.iter()
    }

    /// The metadata whose key set authorizes `role`.
    pub fn delegator_of(&self, role: &RoleName) -> Option<&Metadata> {
        self.get(&role.delegator())
    }

    /// The expiry period policy for `role`, in days. Online roles carry it
    /// on their root role entry; offline roles in their own payload.
    pub fn expiry_period_days(&self, role: &RoleName) -> Result<i64> {
        self.role_entry_days(role, FIELD_EXPIRY_PERIOD)
            .ok_or_else(|| PlaygroundError::ExpiryPolicyViolation {
                role: role.to_string(),
                reason: format!("no {FIELD_EXPIRY_PERIOD} configured"),
            })
    }

    /// The signing window for `role`. Online roles without an explicit
    /// signing period default to half their expiry period.
    pub fn signing_window(&self, role: &RoleName) -> Result<Duration> {
        if let Some(days) = self.role_entry_days(role, FIELD_SIGNING_PERIOD) {
            return Ok(Duration::days(days));
        }
        if role.is_online() {
            let expiry = self.expiry_period_days(role)?;
            return Ok(Duration::hours(expiry * 12));
        }
        Err(PlaygroundError::ExpiryPolicyViolation {
            role: role.to_string(),
            reason: format!("no {FIELD_SIGNING_PERIOD} configured"),
        })
    }

    fn role_entry_days(&self, role: &RoleName, field: &str) -> Option<i64> {
        if role.is_online() {
            let root = match &self.get(&RoleName::Root)?.signed {
                Signed::Root(root) => root,
                _ => return None,
            };
            root.roles.get(&role.to_string())?.custom.get(field)?.as_i64()
        } else {
            self.get(role)?.signed.custom_days(field)
        }
    }
}
