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

//! End-to-end signing-event scenarios: multi-user signing, invitations,
//! target changes, and the hard invalidity cases.

mod common;

use common::{days, t0, Playground, User};
use tuf_playground::event::{InvalidityReason, Verdict};
use tuf_playground::metadata::RoleName;
use tuf_playground::workbench::{OfflineConfig, WorkbenchState};

/// Initialize a single-user repository at `t0` and merge it to main.
fn initialized(user1: &User) -> Playground {
    let pg = Playground::new();
    pg.init_repository(user1, t0());
    pg.merge();
    pg.reset_event();
    pg
}

fn two_signer_config(expiry: i64, signing: i64) -> OfflineConfig {
    OfflineConfig {
        signers: vec!["@user1".to_string(), "@user2".to_string()],
        threshold: 2,
        expiry_period: expiry,
        signing_period: signing,
    }
}

/// S3: user1 raises root to two signers with an invitation; the event
/// stays incomplete through user2's acceptance and becomes publishable
/// only after user1's re-sign.
#[test]
fn multi_user_signing() {
    let user1 = User::new("@user1");
    let user2 = User::new("@user2");
    let pg = initialized(&user1);
    let now = t0() + days(1);

    let bench1 = pg.workbench(&user1, now);
    bench1
        .set_role_config(&RoleName::Root, &two_signer_config(365, 60), None)
        .unwrap();

    let report = pg.status(now).unwrap();
    let Verdict::Incomplete(obligations) = &report.verdict else {
        panic!("expected incomplete: {}", report.render());
    };
    assert_eq!(
        obligations.signatures[&RoleName::Root],
        ["@user1".to_string(), "@user2".to_string()]
            .into_iter()
            .collect()
    );
    assert_eq!(obligations.invites["root"], vec!["@user2".to_string()]);

    // user2 accepts: binds a key, clears the invite, signs root
    let bench2 = pg.workbench(&user2, now);
    assert_eq!(
        bench2.state().unwrap(),
        WorkbenchState::Invited(vec!["root".to_string()])
    );
    bench2.accept_invitations(&user2.public_key()).unwrap();

    let report = pg.status(now).unwrap();
    let Verdict::Incomplete(obligations) = &report.verdict else {
        panic!("expected incomplete: {}", report.render());
    };
    // the payload changed under user1, so the old obligation is back
    assert_eq!(
        obligations.signatures[&RoleName::Root],
        ["@user1".to_string()].into_iter().collect()
    );
    assert!(obligations.invites.is_empty());

    // user1 re-signs; thresholds of both old and new root are now met
    let bench1 = pg.workbench(&user1, now);
    assert_eq!(
        bench1.state().unwrap(),
        WorkbenchState::SignatureNeeded(vec![RoleName::Root])
    );
    bench1.sign(&RoleName::Root).unwrap();

    let report = pg.status(now).unwrap();
    assert_eq!(report.verdict, Verdict::Publishable, "{}", report.render());
}

/// S4: target file changes invalidate earlier signatures and stay
/// incomplete until every signer of the new content has signed.
#[test]
fn target_file_changes() {
    let user1 = User::new("@user1");
    let user2 = User::new("@user2");
    let pg = initialized(&user1);

    // grow both root and targets to two signers, merge that event first
    let setup = t0() + days(1);
    let bench1 = pg.workbench(&user1, setup);
    bench1
        .set_role_config(&RoleName::Root, &two_signer_config(365, 60), None)
        .unwrap();
    bench1
        .set_role_config(&RoleName::Targets, &two_signer_config(365, 60), None)
        .unwrap();
    let bench2 = pg.workbench(&user2, setup);
    bench2.accept_invitations(&user2.public_key()).unwrap();
    let bench1 = pg.workbench(&user1, setup);
    bench1.sign(&RoleName::Root).unwrap();
    assert_eq!(pg.status(setup).unwrap().verdict, Verdict::Publishable);
    pg.merge();
    pg.reset_event();

    // user1 pushes two new target files
    let now = t0() + days(2);
    let targets_dir = pg.event_tree().targets_dir();
    std::fs::create_dir_all(&targets_dir).unwrap();
    std::fs::write(targets_dir.join("one.txt"), b"one").unwrap();
    std::fs::write(targets_dir.join("two.txt"), b"two").unwrap();
    let bench1 = pg.workbench(&user1, now);
    assert!(matches!(
        bench1.state().unwrap(),
        WorkbenchState::TargetsChanged(_)
    ));
    bench1.update_targets().unwrap();

    let report = pg.status(now).unwrap();
    let Verdict::Incomplete(obligations) = &report.verdict else {
        panic!("expected incomplete: {}", report.render());
    };
    assert_eq!(
        obligations.signatures[&RoleName::Targets],
        ["@user2".to_string()].into_iter().collect()
    );

    // user2 modifies one file and removes the other; user1's signature no
    // longer covers the content
    std::fs::write(targets_dir.join("one.txt"), b"changed").unwrap();
    std::fs::remove_file(targets_dir.join("two.txt")).unwrap();
    let bench2 = pg.workbench(&user2, now);
    assert!(matches!(
        bench2.state().unwrap(),
        WorkbenchState::TargetsChanged(_)
    ));
    bench2.update_targets().unwrap();

    let report = pg.status(now).unwrap();
    let Verdict::Incomplete(obligations) = &report.verdict else {
        panic!("expected incomplete: {}", report.render());
    };
    assert_eq!(
        obligations.signatures[&RoleName::Targets],
        ["@user1".to_string()].into_iter().collect()
    );

    let bench1 = pg.workbench(&user1, now);
    bench1.sign(&RoleName::Targets).unwrap();
    let report = pg.status(now).unwrap();
    assert_eq!(report.verdict, Verdict::Publishable, "{}", report.render());

    // the published snapshot records the re-derived targets version
    pg.merge();
    let online = tuf_playground::online::OnlineRepository::open(
        pg.main_tree(),
        &pg.registry,
        now,
        tuf_playground::clock::CancellationToken::new(),
    );
    online.snapshot().unwrap();
    let snapshot = online
        .repository()
        .read_role(&RoleName::Snapshot)
        .unwrap();
    let tuf_playground::metadata::Signed::Snapshot(s) = snapshot.signed else {
        panic!("not snapshot metadata")
    };
    assert_eq!(s.meta["targets.json"].version, 2);
}

/// S5: a direct edit of an online role on an event branch is invalid no
/// matter what signatures it carries.
#[test]
fn illegal_online_edit() {
    let user1 = User::new("@user1");
    let pg = initialized(&user1);
    let now = t0() + days(1);
    // the online roles exist only after a snapshot run on main
    let online = tuf_playground::online::OnlineRepository::open(
        pg.main_tree(),
        &pg.registry,
        t0(),
        tuf_playground::clock::CancellationToken::new(),
    );
    online.snapshot().unwrap();
    pg.reset_event();

    pg.tamper_event_role(&RoleName::Snapshot, |md| {
        md.signed.set_version(md.signed.version() + 1);
    });

    let report = pg.status(now).unwrap();
    let Verdict::Invalid(reasons) = &report.verdict else {
        panic!("expected invalid: {}", report.render());
    };
    assert!(reasons
        .iter()
        .any(|r| matches!(r, InvalidityReason::IllegalOnlineChange { role } if *role == RoleName::Snapshot)));
}

/// S6: a root version regression is reported alone; nothing else about
/// root (or the other roles) is analyzed.
#[test]
fn root_version_regression() {
    let user1 = User::new("@user1");
    let pg = initialized(&user1);
    let now = t0() + days(1);

    pg.tamper_event_role(&RoleName::Root, |md| {
        md.signed.set_version(0);
    });

    let report = pg.status(now).unwrap();
    let Verdict::Invalid(reasons) = &report.verdict else {
        panic!("expected invalid: {}", report.render());
    };
    assert_eq!(reasons.len(), 1);
    assert!(matches!(
        reasons[0],
        InvalidityReason::VersionRegression {
            old: 1,
            new: 0,
            ..
        }
    ));
    assert!(report.render().contains("Verdict: invalid"));
}

/// An event that only tampers with target bytes on disk (metadata left
/// alone) fails the target consistency check.
#[test]
fn unmatched_target_files() {
    let user1 = User::new("@user1");
    let pg = Playground::new();
    pg.init_repository(&user1, t0());
    let targets_dir = pg.event_tree().targets_dir();
    std::fs::create_dir_all(&targets_dir).unwrap();
    std::fs::write(targets_dir.join("app.bin"), b"v1").unwrap();
    pg.workbench(&user1, t0()).update_targets().unwrap();
    pg.merge();
    pg.reset_event();

    let now = t0() + days(1);
    // metadata untouched, bytes changed: hash mismatch
    std::fs::write(pg.event_tree().targets_dir().join("app.bin"), b"v2").unwrap();
    // force a metadata change so the event is not empty
    let bench = pg.workbench(&user1, now);
    bench
        .set_role_config(
            &RoleName::Root,
            &OfflineConfig {
                signers: vec!["@user1".to_string()],
                threshold: 1,
                expiry_period: 300,
                signing_period: 60,
            },
            None,
        )
        .unwrap();

    let report = pg.status(now).unwrap();
    let Verdict::Invalid(reasons) = &report.verdict else {
        panic!("expected invalid: {}", report.render());
    };
    assert!(reasons
        .iter()
        .any(|r| matches!(r, InvalidityReason::UnmatchedTargets { .. })));
}
