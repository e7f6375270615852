use gitdepot::artifacts::bundle::{BundleWriter, PushBundle};
use predicates::prelude::predicate;

mod common;
use common::world::TestWorld;

#[test]
fn init_creates_depot_layout_and_default_config() {
    let world = TestWorld::new();

    world
        .run_gitdepot(&["init", "--description", "cli test repo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized repository"));

    assert!(world.depot_path().join("changes").is_dir());
    assert!(world.depot_path().join("counters").is_dir());
    assert!(world.depot_path().join("trigger-version").is_file());
    let config = std::fs::read_to_string(
        world
            .depot_path()
            .join("repos")
            .join(&world.repo)
            .join("config"),
    )
    .unwrap();
    assert!(config.contains("cli test repo"));
    assert!(config.contains("git-branch-name = main"));
}

#[test]
fn validate_config_accepts_the_default_and_lists_branches() {
    let world = TestWorld::new();
    world.init();

    world
        .run_gitdepot(&["validate-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"))
        .stdout(predicate::str::contains("main"));
}

#[test]
fn validate_config_rejects_conflicting_mappings() {
    let world = TestWorld::new();
    world.init();
    world.write_config(
        "[main]\n\
         git-branch-name = main\n\
         view = //depot/main/... ...\n\
         \n\
         [mirror]\n\
         git-branch-name = mirror\n\
         view = //depot/main/... ...\n",
    );

    world
        .run_gitdepot(&["validate-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("conflicting branch mappings"));
}

#[test]
fn push_and_fetch_round_trip_through_the_cli() {
    let mut world = TestWorld::new();
    world.init();

    let mut writer = BundleWriter::default();
    world.add_commit(
        &mut writer,
        vec![],
        "hello from the cli",
        &[("hello.txt", "hello\n")],
    );
    let bundle_path = world.depot_path().join("push.bundle");
    std::fs::write(&bundle_path, writer.finish()).unwrap();

    world
        .run_gitdepot(&[
            "push",
            "--branch",
            "main",
            "--bundle",
            bundle_path.to_str().unwrap(),
            "--pusher",
            &world.pusher,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pushed 1 commit(s) to 'main'"));

    let out_path = world.depot_path().join("fetched.bundle");
    world
        .run_gitdepot(&[
            "fetch",
            "--branch",
            "main",
            "--output",
            out_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let fetched = std::fs::read(&out_path).unwrap();
    let bundle = PushBundle::parse(&fetched).unwrap();
    assert_eq!(bundle.commits().len(), 1);
    assert_eq!(bundle.commits()[0].message(), "hello from the cli");
}

#[test]
fn push_to_unmapped_branch_fails_with_a_clear_message() {
    let mut world = TestWorld::new();
    world.init();
    world.write_config(
        "[@repo]\n\
         enable-git-branch-creation = no\n\
         \n\
         [main]\n\
         git-branch-name = main\n\
         view = //depot/main/... ...\n",
    );

    let mut writer = BundleWriter::default();
    world.add_commit(&mut writer, vec![], "stray", &[("a.txt", "a")]);
    let bundle_path = world.depot_path().join("push.bundle");
    std::fs::write(&bundle_path, writer.finish()).unwrap();

    world
        .run_gitdepot(&[
            "push",
            "--branch",
            "feature/stray",
            "--bundle",
            bundle_path.to_str().unwrap(),
            "--pusher",
            &world.pusher,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no mapping entry"));
}

#[test]
fn reap_reports_idle_repository() {
    let world = TestWorld::new();
    world.init();

    world
        .run_gitdepot(&["reap"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No abandoned lock to reap"));
}
