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

//! Signer backends.
//!
//! Every signer, online or offline, is the same small capability: produce a
//! public key, sign a byte string. Backends are selected through a registry
//! keyed on the URI scheme of a key's `x-playground-online-uri` (or of the
//! locally configured key URI for offline signers), replacing per-backend
//! `if uri.startswith(...)` branching.
//!
//! Built in: the `envvar:` backend, the test-only online signer that reads a
//! hex ed25519 private key from the named environment variable (the
//! `LOCAL_TESTING_KEY` contract), and [`LocalSigner`] for in-process key
//! generation. Hardware token (`hsm:`), cloud KMS (`gcpkms:`, `azurekms:`)
//! and ambient keyless (`sigstore:`) backends are external adapters the
//! embedding binary registers with the same capability.

use std::collections::BTreeMap;

use ed25519_dalek::{Signer as _, SigningKey};

use crate::errors::{PlaygroundError, Result};
use crate::metadata::{Key, KeyVal, Signature};

/// The abstract signer capability.
pub trait SignerBackend {
    /// The public key this backend signs with, as repository metadata.
    fn public_key(&self) -> Result<Key>;

    /// Sign the canonical payload, returning a signature for `keyid`.
    fn sign(&self, keyid: &str, payload: &[u8]) -> Result<Signature>;
}

type SignerFactory = Box<dyn Fn(&str, &Key) -> Result<Box<dyn SignerBackend>>>;

/// Maps URI schemes to backend constructors.
pub struct SignerRegistry {
    factories: BTreeMap<String, SignerFactory>,
}

impl Default for SignerRegistry {
    fn default() -> Self {
        let mut registry = SignerRegistry {
            factories: BTreeMap::new(),
        };
        registry.register("envvar", |uri, key| {
            Ok(Box::new(EnvVarSigner::from_uri(uri, key)?))
        });
        registry
    }
}

impl SignerRegistry {
    /// A registry with the built-in backends registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend constructor for a URI scheme. Later registrations
    /// replace earlier ones, so embedders can override the defaults.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str, &Key) -> Result<Box<dyn SignerBackend>> + 'static,
    {
        self.factories.insert(scheme.to_string(), Box::new(factory));
    }

    /// Construct the backend for `uri`, signing as `key`.
    pub fn signer_for(&self, uri: &str, key: &Key) -> Result<Box<dyn SignerBackend>> {
        let scheme = uri.split(':').next().unwrap_or_default();
        let factory =
            self.factories
                .get(scheme)
                .ok_or_else(|| PlaygroundError::SignerUnavailable {
                    uri: uri.to_string(),
                    reason: format!("no backend registered for scheme {scheme:?}"),
                })?;
        factory(uri, key)
    }
}

/// An in-process ed25519 signer. Backs the `envvar:` scheme and the test
/// fixtures that need to generate fresh keys.
pub struct LocalSigner {
    signing_key: SigningKey,
}

impl LocalSigner {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        LocalSigner {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let raw = hex::decode(hex_key.trim()).map_err(|e| PlaygroundError::SignerUnavailable {
            uri: "local".to_string(),
            reason: format!("bad private key encoding: {e}"),
        })?;
        let raw: [u8; 32] =
            raw.as_slice()
                .try_into()
                .map_err(|_| PlaygroundError::SignerUnavailable {
                    uri: "local".to_string(),
                    reason: "ed25519 private key must be 32 bytes".to_string(),
                })?;
        Ok(LocalSigner {
            signing_key: SigningKey::from_bytes(&raw),
        })
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl SignerBackend for LocalSigner {
    fn public_key(&self) -> Result<Key> {
        Ok(Key {
            keytype: "ed25519".to_string(),
            scheme: "ed25519".to_string(),
            keyval: KeyVal::public(hex::encode(self.signing_key.verifying_key().to_bytes())),
            custom: BTreeMap::new(),
        })
    }

    fn sign(&self, keyid: &str, payload: &[u8]) -> Result<Signature> {
        let sig = self.signing_key.sign(payload);
        Ok(Signature {
            keyid: keyid.to_string(),
            sig: hex::encode(sig.to_bytes()),
        })
    }
}

/// Test-only online backend: `envvar:<NAME>` reads a hex ed25519 private
/// key from the environment, bypassing cloud KMS.
pub struct EnvVarSigner {
    inner: LocalSigner,
}

impl EnvVarSigner {
    pub fn from_uri(uri: &str, key: &Key) -> Result<Self> {
        let var = uri
            .strip_prefix("envvar:")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PlaygroundError::SignerUnavailable {
                uri: uri.to_string(),
                reason: "expected envvar:<VARIABLE>".to_string(),
            })?;
        let hex_key =
            std::env::var(var).map_err(|_| PlaygroundError::SignerUnavailable {
                uri: uri.to_string(),
                reason: format!("environment variable {var} not set"),
            })?;
        let inner = LocalSigner::from_hex(&hex_key)?;

        // The environment must hold the private half of the published key.
        let expected = key.keyval.public.as_deref().unwrap_or_default();
        let actual = inner.public_key()?.keyval.public.unwrap_or_default();
        if expected != actual {
            return Err(PlaygroundError::SignerUnavailable {
                uri: uri.to_string(),
                reason: format!("{var} does not match the published public key"),
            });
        }
        Ok(EnvVarSigner { inner })
    }
}

impl SignerBackend for EnvVarSigner {
    fn public_key(&self) -> Result<Key> {
        self.inner.public_key()
    }

    fn sign(&self, keyid: &str, payload: &[u8]) -> Result<Signature> {
        self.inner.sign(keyid, payload)
    }
}
