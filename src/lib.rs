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

//! A CI-orchestrated TUF repository.
//!
//! The repository state lives in a git tree: human signers hold the offline
//! roles (root, targets, delegated targets) and push proposed changes as
//! *signing events* on branches, while the CI platform holds the online
//! roles (snapshot, timestamp) and publishes the downloader-facing tree.
//!
//! The crate provides:
//!
//! - [`metadata`]: the typed role graph with canonical serialization and
//!   the repository's custom fields,
//! - [`repository`]: the working-tree surface (reads, writes, version and
//!   expiry bumps),
//! - [`delta`]: the structural diff between a baseline and an event,
//! - [`event`]: the signing-event engine producing verdicts and reports,
//! - [`online`]: the online-signing engine (snapshot/timestamp, bumps,
//!   publishable tree),
//! - [`workbench`]: the interactive signer tool driving delta creation and
//!   signatures,
//! - [`signer`]: the signer backend capability and its URI-scheme registry,
//! - [`commands`]: the CI-facing command surface.
//!
//! Every engine invocation is a pure function of the input tree, an
//! injected clock and the signer backend; concurrency control is left to
//! the hosting platform (branch pushes and the merge queue).

pub mod clock;
pub mod commands;
pub mod delta;
pub mod errors;
pub mod event;
pub mod git;
pub mod metadata;
pub mod online;
pub mod repository;
pub mod signer;
pub mod workbench;

pub use clock::{CancellationToken, Clock, FixedClock, SystemClock};
pub use errors::{PlaygroundError, Result};
pub use event::{evaluate, EventReport, Verdict};
pub use metadata::{Metadata, RoleName, RoleSet};
pub use repository::{Repository, SignatureRequirement, WorkingTree};
pub use signer::{SignerBackend, SignerRegistry};
