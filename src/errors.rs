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

//! The errors that can be raised by tuf-playground.
//!
//! The set is closed on purpose: engine callers (the CI workflow, the signer
//! tool) dispatch on the kind to decide between "render into the signing
//! event report" and "fail the run".

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlaygroundError>;

#[derive(Error, Debug)]
pub enum PlaygroundError {
    /// A metadata file is missing required fields or has them wrongly typed.
    /// User-surfaced: contributes to an `invalid` verdict.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    /// A key declares a signing scheme no configured backend implements.
    #[error("unknown signing scheme: {0}")]
    UnknownScheme(String),

    /// A signer backend could not be reached or constructed. Fatal for the
    /// current invocation.
    #[error("signer unavailable for {uri}: {reason}")]
    SignerUnavailable { uri: String, reason: String },

    /// A signature was rejected. During verification this feeds the
    /// `bad_signature` verdict; during signing it is fatal.
    #[error("signature rejected: {0}")]
    SignatureRejected(String),

    /// A repository invariant would be violated by the requested operation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A role version went backwards (or failed to move forwards).
    #[error("version regression for {role}: {new} does not follow {old}")]
    VersionRegression { role: String, old: u32, new: u32 },

    /// An expiry date is outside the window allowed by the role's
    /// expiry-period policy.
    #[error("expiry policy violation for {role}: {reason}")]
    ExpiryPolicyViolation { role: String, reason: String },

    /// The git surface failed. Fatal for the current invocation.
    #[error("git surface error: {0}")]
    GitSurface(String),

    /// The operation was cancelled; the working tree was left untouched.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PlaygroundError {
    fn from(e: serde_json::Error) -> Self {
        PlaygroundError::MalformedMetadata(e.to_string())
    }
}

impl PlaygroundError {
    /// True for kinds that are rendered into the signing event report and
    /// contribute to an `invalid` verdict instead of aborting the engine.
    pub fn is_user_surfaced(&self) -> bool {
        matches!(
            self,
            PlaygroundError::MalformedMetadata(_)
                | PlaygroundError::UnknownScheme(_)
                | PlaygroundError::InvariantViolation(_)
                | PlaygroundError::VersionRegression { .. }
                | PlaygroundError::ExpiryPolicyViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_surfaced_kinds() {
        assert!(PlaygroundError::MalformedMetadata("x".into()).is_user_surfaced());
        assert!(PlaygroundError::VersionRegression {
            role: "root".into(),
            old: 2,
            new: 2,
        }
        .is_user_surfaced());
        assert!(!PlaygroundError::Cancelled.is_user_surfaced());
        assert!(!PlaygroundError::GitSurface("push failed".into()).is_user_surfaced());
    }

    #[test]
    fn serde_errors_map_to_malformed_metadata() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: PlaygroundError = err.into();
        assert!(matches!(err, PlaygroundError::MalformedMetadata(_)));
    }
}
