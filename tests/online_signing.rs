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

//! End-to-end coverage of the online-signing engine: initialization,
//! snapshot/timestamp production, expiry-driven bumps, the publishable
//! tree.

mod common;

use common::{days, t0, Playground, User};
use tuf_playground::clock::CancellationToken;
use tuf_playground::event::Verdict;
use tuf_playground::git::{GitSurface, InMemoryGit};
use tuf_playground::metadata::{RoleName, Signed};
use tuf_playground::online::OnlineRepository;
use tuf_playground::workbench::{OnlineConfig, WorkbenchState};

fn online<'a>(pg: &'a Playground, now: chrono::DateTime<chrono::Utc>) -> OnlineRepository<'a> {
    OnlineRepository::open(pg.main_tree(), &pg.registry, now, CancellationToken::new())
}

/// A fresh repository initialized by one user is publishable, and the
/// first snapshot run produces the v1 online roles and the publishable
/// tree. A bump on the same day is a no-op.
#[test]
fn basic_initialization() {
    let pg = Playground::new();
    let user1 = User::new("@user1");

    let bench = pg.workbench(&user1, t0());
    assert_eq!(bench.state().unwrap(), WorkbenchState::Uninitialized);
    pg.init_repository(&user1, t0());

    let report = pg.status(t0()).unwrap();
    assert_eq!(report.verdict, Verdict::Publishable, "{}", report.render());

    pg.merge();
    let repo = online(&pg, t0());
    let outcome = repo.snapshot().unwrap();
    assert_eq!(outcome.snapshot_version, Some(1));
    assert_eq!(outcome.timestamp_version, Some(1));

    let publish = tempfile::TempDir::new().unwrap();
    repo.publish(publish.path()).unwrap();
    for file in [
        "metadata/1.root.json",
        "metadata/1.targets.json",
        "metadata/snapshot.json",
        "metadata/timestamp.json",
    ] {
        assert!(publish.path().join(file).exists(), "missing {file}");
    }

    // a second run with unchanged inputs writes nothing
    assert!(!repo.snapshot().unwrap().changed());

    // same-day bump is a no-op
    let mut git = InMemoryGit::new();
    assert!(repo.bump_online(&mut git, false).unwrap().is_empty());
    assert!(git.commit_messages.is_empty());
}

/// Expiry-driven bumps: snapshot expiry 10 days / signing period 4 days.
/// Nothing at day 0; snapshot v2 + timestamp v2 once the window opens;
/// timestamp alone afterwards.
#[test]
fn online_version_bumps() {
    let pg = Playground::new();
    let user1 = User::new("@user1");
    pg.init_repository(&user1, t0());

    // tighten the snapshot policy before merging
    let bench = pg.workbench(&user1, t0());
    bench
        .set_online_config(&OnlineConfig {
            key: pg.online_key(),
            timestamp_expiry: 1,
            snapshot_expiry: 10,
            timestamp_signing: None,
            snapshot_signing: Some(4),
        })
        .unwrap();
    assert_eq!(pg.status(t0()).unwrap().verdict, Verdict::Publishable);
    pg.merge();
    online(&pg, t0()).snapshot().unwrap();

    let mut git = InMemoryGit::new();
    assert!(online(&pg, t0()).bump_online(&mut git, false).unwrap().is_empty());

    let bumped = online(&pg, t0() + days(11))
        .bump_online(&mut git, true)
        .unwrap();
    assert_eq!(
        bumped,
        vec![(RoleName::Snapshot, 2), (RoleName::Timestamp, 2)]
    );
    assert_eq!(git.commit_messages.len(), 1);
    assert_eq!(git.pushed, vec!["main".to_string()]);

    let bumped = online(&pg, t0() + days(13))
        .bump_online(&mut git, false)
        .unwrap();
    assert_eq!(bumped, vec![(RoleName::Timestamp, 3)]);

    let repo = online(&pg, t0() + days(13));
    let snapshot = repo.repository().read_role(&RoleName::Snapshot).unwrap();
    assert_eq!(snapshot.signed.version(), 2);
}

/// Offline roles about to expire get a `sign/<role>-bump-<version>` event
/// branch with an unsigned version+expiry bump; the working tree itself is
/// left on the committed state.
#[test]
fn offline_bump_opens_event_branches() {
    let pg = Playground::new();
    let user1 = User::new("@user1");
    pg.init_repository(&user1, t0());
    pg.merge();
    online(&pg, t0()).snapshot().unwrap();

    // default policy: expiry 365, signing period 60 -> window opens at 305
    let mut git = InMemoryGit::new();
    assert!(online(&pg, t0() + days(100))
        .bump_offline(&mut git, true)
        .unwrap()
        .is_empty());

    let events = online(&pg, t0() + days(310))
        .bump_offline(&mut git, true)
        .unwrap();
    assert_eq!(
        events,
        vec![
            "sign/root-bump-2".to_string(),
            "sign/targets-bump-2".to_string()
        ]
    );
    assert!(git.branch_exists("sign/root-bump-2").unwrap());

    // the committed tree still holds version 1
    let repo = online(&pg, t0() + days(310));
    assert_eq!(
        repo.repository().read_role(&RoleName::Root).unwrap().signed.version(),
        1
    );

    // the branch holds the unsigned version 2
    let bytes = git
        .read_file("sign/root-bump-2", "metadata/root.json")
        .unwrap()
        .unwrap();
    let md = tuf_playground::metadata::Metadata::from_bytes(&bytes).unwrap();
    assert_eq!(md.signed.version(), 2);
    assert!(md.signatures.iter().all(|s| s.is_placeholder()));

    // a re-run does not reopen existing branches
    let events = online(&pg, t0() + days(310))
        .bump_offline(&mut git, true)
        .unwrap();
    assert!(events.is_empty());
}

/// The publishable tree mirrors target files byte for byte and records the
/// targets version the snapshot saw; an expired timestamp never publishes.
#[test]
fn publish_layout_and_expiry_guard() {
    let pg = Playground::new();
    let user1 = User::new("@user1");
    pg.init_repository(&user1, t0());

    // add a target through the workbench so snapshot sees version 2
    std::fs::create_dir_all(pg.event_tree().targets_dir()).unwrap();
    std::fs::write(pg.event_tree().targets_dir().join("app.bin"), b"payload").unwrap();
    let bench = pg.workbench(&user1, t0());
    assert!(matches!(
        bench.state().unwrap(),
        WorkbenchState::TargetsChanged(_)
    ));
    bench.update_targets().unwrap();
    assert_eq!(pg.status(t0()).unwrap().verdict, Verdict::Publishable);
    pg.merge();

    let repo = online(&pg, t0());
    repo.snapshot().unwrap();
    let snapshot = repo.repository().read_role(&RoleName::Snapshot).unwrap();
    let Signed::Snapshot(ref s) = snapshot.signed else {
        panic!("not snapshot metadata")
    };
    assert_eq!(s.meta["targets.json"].version, 1);

    let publish = tempfile::TempDir::new().unwrap();
    repo.publish(publish.path()).unwrap();
    assert_eq!(
        std::fs::read(publish.path().join("targets/app.bin")).unwrap(),
        b"payload"
    );
    assert!(publish.path().join("metadata/1.targets.json").exists());

    // timestamp expires after one day; publishing then must fail
    let stale = online(&pg, t0() + days(3));
    let err = stale.publish(publish.path()).unwrap_err();
    assert!(matches!(
        err,
        tuf_playground::errors::PlaygroundError::ExpiryPolicyViolation { .. }
    ));
}
