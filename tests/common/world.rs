use assert_cmd::Command;
use assert_fs::TempDir;
use fake::Fake;
use fake::faker::internet::en::FreeEmail;
use fake::faker::lorem::en::{Word, Words};
use fake::faker::name::en::Name;
use gitdepot::areas::gateway::Gateway;
use gitdepot::areas::locks::LockParams;
use gitdepot::artifacts::bundle::BundleWriter;
use gitdepot::artifacts::commit::{Author, Commit, ContentHash, FileChange};
use gitdepot::artifacts::submit::BackoffParams;
use std::path::Path;
use std::time::Duration;

/// Shared world state for gateway scenario tests: one temp depot, one
/// repository, random identities, and helpers for building push bundles.
pub struct TestWorld {
    pub temp_dir: TempDir,
    pub repo: String,
    pub pusher: String,
    pub author_name: String,
    pub author_email: String,
    commit_seq: u32,
}

impl TestWorld {
    pub fn new() -> Self {
        TestWorld {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            repo: Word().fake::<String>(),
            pusher: Word().fake::<String>(),
            author_name: Name().fake::<String>().replace(" ", "_"),
            author_email: FreeEmail().fake::<String>(),
            commit_seq: 0,
        }
    }

    pub fn depot_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Lock and backoff timings shrunk so blocked/retry scenarios finish
    /// in milliseconds.
    pub fn fast_lock_params() -> LockParams {
        LockParams {
            retry_period: Duration::from_millis(10),
            stale_after: Duration::from_millis(300),
            heart_rate: Duration::from_millis(25),
        }
    }

    pub fn gateway(&self) -> Gateway {
        Gateway::new(self.depot_path().to_path_buf(), &self.repo)
            .with_lock_params(Self::fast_lock_params())
            .with_backoff(BackoffParams {
                initial: Duration::from_millis(10),
                max_attempts: 3,
            })
    }

    pub fn init(&self) {
        self.gateway()
            .init("scenario test repository")
            .expect("Failed to initialize repository");
    }

    pub fn write_config(&self, raw: &str) {
        let path = self
            .depot_path()
            .join("repos")
            .join(&self.repo)
            .join("config");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, raw).unwrap();
    }

    pub fn author(&self) -> Author {
        let when = chrono::DateTime::parse_from_rfc3339("2023-04-05T08:00:00+02:00").unwrap();
        Author::new_with_timestamp(self.author_name.clone(), self.author_email.clone(), when)
    }

    pub fn next_commit_id(&mut self) -> ContentHash {
        self.commit_seq += 1;
        ContentHash::of(format!("{}-commit-{}", self.repo, self.commit_seq).as_bytes())
    }

    pub fn random_message(&self) -> String {
        Words(3..6).fake::<Vec<String>>().join(" ")
    }

    /// Append a commit adding the given `(path, content)` pairs to the
    /// bundle under construction. Returns the commit for later assertions.
    pub fn add_commit(
        &mut self,
        writer: &mut BundleWriter,
        parents: Vec<ContentHash>,
        message: &str,
        files: &[(&str, &str)],
    ) -> Commit {
        let changes = files
            .iter()
            .map(|(path, content)| FileChange::Add {
                path: path.to_string(),
                hash: writer.blob(content.as_bytes()),
            })
            .collect();
        let author = self.author();
        let commit = Commit::new(
            self.next_commit_id(),
            parents,
            author.clone(),
            author,
            message.to_string(),
            changes,
        );
        writer.commit(&commit);
        commit
    }

    pub fn run_gitdepot(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("gitdepot").expect("Failed to find gitdepot binary");
        cmd.arg("--depot").arg(self.depot_path());
        cmd.arg("--repo").arg(&self.repo);
        for arg in args {
            cmd.arg(arg);
        }
        cmd
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}
