use gitdepot::artifacts::bundle::{BundleWriter, PushBundle};
use gitdepot::artifacts::commit::{Commit, FileChange};
use gitdepot::artifacts::translate::DescInfo;
use gitdepot::errors::GatewayError;
use pretty_assertions::assert_eq;
use std::time::Duration;

mod common;
use common::world::TestWorld;

#[test]
fn push_with_excluded_paths_lands_only_mapped_files() {
    let mut world = TestWorld::new();
    world.init();
    world.write_config(
        "[@repo]\n\
         description = exclusion scenario\n\
         \n\
         [main]\n\
         git-branch-name = main\n\
         view = //depot/main/... ...\n\
         \t-//depot/main/gen/... gen/...\n",
    );

    let mut writer = BundleWriter::default();
    let c1 = world.add_commit(&mut writer, vec![], "add library", &[("src/lib.rs", "pub fn lib() {}")]);
    let c2 = world.add_commit(
        &mut writer,
        vec![c1.id().clone()],
        "add tool and generated output",
        &[("gen/tool.bin", "generated"), ("src/tool.rs", "fn tool() {}")],
    );
    world.add_commit(
        &mut writer,
        vec![c2.id().clone()],
        "add notes",
        &[("docs/notes.md", "# notes")],
    );

    let report = world
        .gateway()
        .push("main", &writer.finish(), &world.pusher)
        .unwrap();
    assert_eq!(report.commits, 3);
    assert_eq!(report.changes.len(), 3);

    // the excluded path never reached the depot
    let gateway = world.gateway();
    let depot = gateway.depot();
    for id in depot.list_change_ids().unwrap() {
        let record = depot.read_change(id).unwrap();
        for op in &record.ops {
            for path in op.paths() {
                assert!(!path.contains("/gen/"), "excluded path leaked: {}", path);
            }
        }
    }

    // and fetch agrees
    let fetched = world.gateway().fetch("main").unwrap();
    let bundle = PushBundle::parse(&fetched).unwrap();
    assert_eq!(bundle.commits().len(), 3);
    assert_eq!(bundle.commits()[1].changes().len(), 1);
    assert_eq!(bundle.commits()[1].changes()[0].path(), "src/tool.rs");
}

#[test]
fn trigger_rejection_reverts_the_whole_push() {
    let mut world = TestWorld::new();
    world.init();

    // a foreign session locked this path before the push began
    let gateway = world.gateway();
    gateway
        .depot()
        .lock_file("//depot/main/locked.txt", "other-session")
        .unwrap();

    let mut writer = BundleWriter::default();
    let c1 = world.add_commit(&mut writer, vec![], "free file", &[("free.txt", "ok")]);
    world.add_commit(
        &mut writer,
        vec![c1.id().clone()],
        "locked file",
        &[("locked.txt", "blocked")],
    );

    let err = gateway
        .push("main", &writer.finish(), &world.pusher)
        .unwrap_err();
    match err.downcast_ref::<GatewayError>() {
        Some(GatewayError::PushFailed {
            reverted, source, ..
        }) => {
            assert_eq!(reverted.len(), 1);
            assert!(matches!(**source, GatewayError::TriggerRejected { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }

    // the first commit's changelist was rolled back
    assert!(gateway.depot().list_change_ids().unwrap().is_empty());
}

#[test]
fn pushed_history_fetches_back_identically() {
    let mut world = TestWorld::new();
    world.init();

    let binary = b"\x00\x01\x02binary payload\xff".to_vec();
    let mut writer = BundleWriter::default();
    let lib_hash = writer.blob(b"pub fn lib() {}");
    let bin_hash = writer.blob(&binary);
    let author = world.author();
    let c1 = Commit::new(
        world.next_commit_id(),
        vec![],
        author.clone(),
        author.clone(),
        "initial import".to_string(),
        vec![
            FileChange::Add {
                path: "src/lib.rs".to_string(),
                hash: lib_hash,
            },
            FileChange::Add {
                path: "assets/raw.bin".to_string(),
                hash: bin_hash,
            },
        ],
    );
    writer.commit(&c1);

    let lib_v2 = writer.blob(b"pub fn lib() { todo!() }");
    let c2 = Commit::new(
        world.next_commit_id(),
        vec![c1.id().clone()],
        author.clone(),
        author.clone(),
        "rework library, drop asset".to_string(),
        vec![
            FileChange::Modify {
                path: "src/lib.rs".to_string(),
                hash: lib_v2.clone(),
            },
            FileChange::Delete {
                path: "assets/raw.bin".to_string(),
            },
        ],
    );
    writer.commit(&c2);

    let c3 = Commit::new(
        world.next_commit_id(),
        vec![c2.id().clone()],
        author.clone(),
        author,
        "move library to core".to_string(),
        vec![FileChange::Rename {
            from: "src/lib.rs".to_string(),
            to: "src/core.rs".to_string(),
            hash: lib_v2,
        }],
    );
    writer.commit(&c3);

    let gateway = world.gateway();
    let report = gateway
        .push("main", &writer.finish(), &world.pusher)
        .unwrap();
    assert_eq!(report.changes.len(), 3);

    let fetched = gateway.fetch("main").unwrap();
    let bundle = PushBundle::parse(&fetched).unwrap();
    assert_eq!(bundle.commits(), &[c1, c2, c3]);

    // binary content survived without recompression mangling
    let fetched_bin = bundle
        .blobs()
        .get(&gitdepot::artifacts::commit::ContentHash::of(&binary))
        .unwrap();
    assert_eq!(fetched_bin.as_ref(), binary.as_slice());
}

#[test]
fn push_timestamps_become_depot_record_dates() {
    let mut world = TestWorld::new();
    world.init();

    let mut writer = BundleWriter::default();
    // commit authored years ago
    world.add_commit(&mut writer, vec![], "ancient commit", &[("a.txt", "a")]);

    let before = chrono::Local::now().fixed_offset();
    let gateway = world.gateway();
    let report = gateway.push("main", &writer.finish(), &world.pusher).unwrap();

    let record = gateway.depot().read_change(report.changes[0]).unwrap();
    assert!(record.recorded_at >= before - chrono::Duration::seconds(1));

    // while the Git timestamp survives in the description block
    let (_, info) = DescInfo::extract(&record.description).unwrap();
    assert_eq!(info.author, world.author().display());
}

#[test]
fn transient_depot_outage_is_retried_until_it_lifts() {
    let mut world = TestWorld::new();
    world.init();

    let mut writer = BundleWriter::default();
    world.add_commit(&mut writer, vec![], "patient commit", &[("a.txt", "a")]);

    let gateway = world.gateway();
    gateway.depot().enter_maintenance().unwrap();
    let marker = world.depot_path().join("maintenance");
    let lifter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(5));
        std::fs::remove_file(marker).unwrap();
    });

    let report = gateway
        .push("main", &writer.finish(), &world.pusher)
        .unwrap();
    assert_eq!(report.changes.len(), 1);
    lifter.join().unwrap();
}

#[test]
fn merge_commits_are_rejected_before_anything_lands() {
    let mut world = TestWorld::new();
    world.init();
    world.write_config(
        "[@repo]\n\
         enable-git-merge-commits = no\n\
         \n\
         [main]\n\
         git-branch-name = main\n\
         view = //depot/main/... ...\n",
    );

    let mut writer = BundleWriter::default();
    let c1 = world.add_commit(&mut writer, vec![], "first", &[("a.txt", "a")]);
    let c2 = world.add_commit(&mut writer, vec![], "second root", &[("b.txt", "b")]);
    world.add_commit(
        &mut writer,
        vec![c1.id().clone(), c2.id().clone()],
        "merge",
        &[("c.txt", "c")],
    );

    let gateway = world.gateway();
    let err = gateway
        .push("main", &writer.finish(), &world.pusher)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GatewayError>(),
        Some(GatewayError::MergeCommitsDisabled(_))
    ));
    // translation failed before any changelist was opened
    assert!(gateway.depot().list_change_ids().unwrap().is_empty());
}
