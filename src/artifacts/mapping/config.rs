//! Branch-mapping configuration files
//!
//! Each repository has one config file in simple INI format:
//!
//! ```text
//! [@repo]
//! description = Example repository
//! charset = utf8
//! enable-git-branch-creation = yes
//! enable-git-merge-commits = yes
//! enable-git-submodules = no
//! ignore-author-permissions = no
//! change-owner = author
//! preflight-commit = none
//!
//! [main]
//! git-branch-name = main
//! view = //depot/main/... ...
//!     -//depot/main/gen/... gen/...
//! ```
//!
//! The `[@repo]` section holds repository-wide options; every other
//! section is one branch mapping entry. The file is read once per Git
//! operation into an immutable `BranchMapping` snapshot and never mutated
//! mid-push; edits take effect on the next operation.

use crate::artifacts::mapping::view::{RuleKind, ViewMap};
use crate::artifacts::trigger::PreflightPolicy;
use crate::errors::{GatewayError, GatewayResult};
use regex::Regex;
use std::path::Path;

pub const SECTION_REPO: &str = "@repo";

pub const KEY_DESCRIPTION: &str = "description";
pub const KEY_CHARSET: &str = "charset";
pub const KEY_ENABLE_BRANCH_CREATION: &str = "enable-git-branch-creation";
pub const KEY_ENABLE_MERGE_COMMITS: &str = "enable-git-merge-commits";
pub const KEY_ENABLE_SUBMODULES: &str = "enable-git-submodules";
pub const KEY_IGNORE_AUTHOR_PERMS: &str = "ignore-author-permissions";
pub const KEY_CHANGE_OWNER: &str = "change-owner";
pub const KEY_PREFLIGHT_COMMIT: &str = "preflight-commit";
pub const KEY_GIT_BRANCH_NAME: &str = "git-branch-name";
pub const KEY_VIEW: &str = "view";

/// Whose identity owns the depot-side change record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ChangeOwner {
    #[default]
    Author,
    Pusher,
}

/// Repository-wide options from the `[@repo]` section.
#[derive(Debug, Clone)]
pub struct RepoOptions {
    pub description: String,
    pub charset: String,
    pub enable_branch_creation: bool,
    pub enable_merge_commits: bool,
    pub enable_submodules: bool,
    pub ignore_author_permissions: bool,
    pub change_owner: ChangeOwner,
    pub preflight: PreflightPolicy,
}

impl Default for RepoOptions {
    fn default() -> Self {
        RepoOptions {
            description: String::new(),
            charset: "utf8".to_string(),
            enable_branch_creation: true,
            enable_merge_commits: true,
            enable_submodules: false,
            ignore_author_permissions: false,
            change_owner: ChangeOwner::Author,
            preflight: PreflightPolicy::None,
        }
    }
}

/// One named branch mapping entry.
#[derive(Debug, Clone)]
pub struct BranchEntry {
    pub section: String,
    pub git_branch_name: String,
    pub view: ViewMap,
}

/// Immutable per-repository mapping snapshot.
#[derive(Debug, Clone)]
pub struct BranchMapping {
    options: RepoOptions,
    entries: Vec<BranchEntry>,
}

impl BranchMapping {
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("unable to read config {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let sections = parse_ini_sections(raw)?;

        let mut options = RepoOptions::default();
        let mut entries = Vec::new();

        for (section, keys) in &sections {
            if section == SECTION_REPO {
                options = parse_repo_options(keys)?;
                continue;
            }
            let git_branch_name = keys
                .iter()
                .find(|(k, _)| k == KEY_GIT_BRANCH_NAME)
                .map(|(_, v)| v.trim().to_string())
                .ok_or_else(|| {
                    GatewayError::Config(format!(
                        "branch section [{}] is missing {}",
                        section, KEY_GIT_BRANCH_NAME
                    ))
                })?;
            let view_raw = keys
                .iter()
                .find(|(k, _)| k == KEY_VIEW)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    GatewayError::Config(format!(
                        "branch section [{}] is missing {}",
                        section, KEY_VIEW
                    ))
                })?;
            entries.push(BranchEntry {
                section: section.clone(),
                git_branch_name,
                view: ViewMap::parse(&view_raw)?,
            });
        }

        let mapping = BranchMapping { options, entries };
        mapping.validate()?;
        Ok(mapping)
    }

    /// Load-time invariant: two entries must not map intersecting git
    /// paths onto the same depot-side target. Silent data loss is worse
    /// than a rejected config.
    fn validate(&self) -> GatewayResult<()> {
        if self.entries.is_empty() {
            return Err(GatewayError::Config(
                "config declares no branch mappings".to_string(),
            ));
        }

        let mut seen_branches = std::collections::HashSet::new();
        for entry in &self.entries {
            if !seen_branches.insert(entry.git_branch_name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "branch '{}' is mapped by more than one section",
                    entry.git_branch_name
                )));
            }
        }

        for (i, left) in self.entries.iter().enumerate() {
            for right in &self.entries[i + 1..] {
                if let Some(target) = conflicting_target(left, right) {
                    return Err(GatewayError::ConflictingMapping {
                        left: left.section.clone(),
                        right: right.section.clone(),
                        target,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn options(&self) -> &RepoOptions {
        &self.options
    }

    pub fn entries(&self) -> &[BranchEntry] {
        &self.entries
    }

    /// Resolve the view for a git branch.
    ///
    /// Unmapped branches fail unless branch creation is enabled, in which
    /// case the branch gets a lightweight view under the depot's
    /// `branches/` area, derived from the first declared entry's depot.
    pub fn view_for(&self, branch: &str) -> GatewayResult<ViewMap> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|entry| entry.git_branch_name == branch)
        {
            return Ok(entry.view.clone());
        }

        if !self.options.enable_branch_creation {
            return Err(GatewayError::UnmappedBranch(branch.to_string()));
        }

        let depot_root = self.depot_root();
        tracing::debug!(branch, %depot_root, "deriving lightweight branch view");
        ViewMap::parse(&format!("{}/branches/{}/... ...", depot_root, branch))
    }

    /// The `//depot`-style root of the first entry's first inclusion.
    fn depot_root(&self) -> String {
        let first_prefix = self.entries[0]
            .view
            .rules()
            .iter()
            .find(|rule| rule.kind() == RuleKind::Include)
            .map(|rule| rule.depot_prefix())
            .unwrap_or("//depot/");
        // "//depot/main/" -> "//depot"
        let body = &first_prefix[2..];
        match body.find('/') {
            Some(idx) => format!("//{}", &body[..idx]),
            None => format!("//{}", body),
        }
    }
}

/// Default config written at repository initialization.
pub fn default_config(description: &str) -> String {
    format!(
        "[{SECTION_REPO}]\n\
         {KEY_DESCRIPTION} = {description}\n\
         {KEY_CHARSET} = utf8\n\
         {KEY_ENABLE_BRANCH_CREATION} = yes\n\
         {KEY_ENABLE_MERGE_COMMITS} = yes\n\
         {KEY_ENABLE_SUBMODULES} = no\n\
         {KEY_IGNORE_AUTHOR_PERMS} = no\n\
         {KEY_CHANGE_OWNER} = author\n\
         {KEY_PREFLIGHT_COMMIT} = none\n\
         \n\
         [main]\n\
         {KEY_GIT_BRANCH_NAME} = main\n\
         {KEY_VIEW} = //depot/main/... ...\n"
    )
}

fn conflicting_target(left: &BranchEntry, right: &BranchEntry) -> Option<String> {
    for lrule in left.view.rules() {
        if lrule.kind() == RuleKind::Exclude {
            continue;
        }
        for rrule in right.view.rules() {
            if rrule.kind() == RuleKind::Exclude {
                continue;
            }
            if prefixes_intersect(lrule.git_prefix(), rrule.git_prefix())
                && prefixes_intersect(lrule.depot_prefix(), rrule.depot_prefix())
            {
                return Some(lrule.depot_prefix().to_string());
            }
        }
    }
    None
}

fn prefixes_intersect(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

type Section = (String, Vec<(String, String)>);

/// Line-oriented INI parsing. Indented lines continue the previous key's
/// value, which is how multi-line views are written.
fn parse_ini_sections(raw: &str) -> GatewayResult<Vec<Section>> {
    let section_re = Regex::new(r"^\[(.+)\]$").expect("section regex is valid");

    let mut sections: Vec<Section> = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty()
            || trimmed.trim_start().starts_with('#')
            || trimmed.trim_start().starts_with(';')
        {
            continue;
        }

        if let Some(captures) = section_re.captures(trimmed.trim()) {
            sections.push((captures[1].trim().to_string(), Vec::new()));
            continue;
        }

        let continuation = trimmed.starts_with(' ') || trimmed.starts_with('\t');
        let Some((_, keys)) = sections.last_mut() else {
            return Err(GatewayError::Config(format!(
                "line {} appears before any section: '{}'",
                lineno + 1,
                trimmed
            )));
        };

        if continuation {
            let Some((_, value)) = keys.last_mut() else {
                return Err(GatewayError::Config(format!(
                    "continuation line {} has no preceding key",
                    lineno + 1
                )));
            };
            value.push('\n');
            value.push_str(trimmed.trim());
        } else {
            let (key, value) = trimmed.split_once('=').ok_or_else(|| {
                GatewayError::Config(format!(
                    "line {} is not a 'key = value' pair: '{}'",
                    lineno + 1,
                    trimmed
                ))
            })?;
            keys.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok(sections)
}

fn parse_repo_options(keys: &[(String, String)]) -> GatewayResult<RepoOptions> {
    let mut options = RepoOptions::default();
    for (key, value) in keys {
        match key.as_str() {
            KEY_DESCRIPTION => options.description = value.clone(),
            KEY_CHARSET => options.charset = value.clone(),
            KEY_ENABLE_BRANCH_CREATION => {
                options.enable_branch_creation = parse_yes_no(key, value)?
            }
            KEY_ENABLE_MERGE_COMMITS => options.enable_merge_commits = parse_yes_no(key, value)?,
            KEY_ENABLE_SUBMODULES => options.enable_submodules = parse_yes_no(key, value)?,
            KEY_IGNORE_AUTHOR_PERMS => {
                options.ignore_author_permissions = parse_yes_no(key, value)?
            }
            KEY_CHANGE_OWNER => {
                options.change_owner = match value.as_str() {
                    "author" => ChangeOwner::Author,
                    "pusher" => ChangeOwner::Pusher,
                    other => {
                        return Err(GatewayError::Config(format!(
                            "{} must be 'author' or 'pusher', got '{}'",
                            KEY_CHANGE_OWNER, other
                        )));
                    }
                }
            }
            KEY_PREFLIGHT_COMMIT => options.preflight = PreflightPolicy::parse(value)?,
            other => {
                return Err(GatewayError::Config(format!(
                    "unknown key '{}' in [{}] section",
                    other, SECTION_REPO
                )));
            }
        }
    }
    Ok(options)
}

fn parse_yes_no(key: &str, value: &str) -> GatewayResult<bool> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(GatewayError::Config(format!(
            "{} must be 'yes' or 'no', got '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn two_branch_config() -> String {
        "[@repo]\n\
         description = demo\n\
         enable-git-branch-creation = no\n\
         change-owner = pusher\n\
         preflight-commit = none\n\
         \n\
         [main]\n\
         git-branch-name = main\n\
         view = //depot/main/... ...\n\
         \t-//depot/main/gen/... gen/...\n\
         \n\
         [release]\n\
         git-branch-name = release/1.0\n\
         view = //depot/r1.0/... ...\n"
            .to_string()
    }

    #[test]
    fn parses_options_and_entries() {
        let mapping = BranchMapping::parse(&two_branch_config()).unwrap();
        assert_eq!(mapping.options().description, "demo");
        assert!(!mapping.options().enable_branch_creation);
        assert_eq!(mapping.options().change_owner, ChangeOwner::Pusher);
        assert_eq!(mapping.entries().len(), 2);

        let view = mapping.view_for("main").unwrap();
        assert_eq!(view.translate("src/a.rs"), vec!["//depot/main/src/a.rs"]);
        assert!(view.translate("gen/a.bin").is_empty());
    }

    #[test]
    fn resolving_twice_yields_identical_rules() {
        let mapping = BranchMapping::parse(&two_branch_config()).unwrap();
        let first = mapping.view_for("release/1.0").unwrap();
        let second = mapping.view_for("release/1.0").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unmapped_branch_fails_when_creation_disabled() {
        let mapping = BranchMapping::parse(&two_branch_config()).unwrap();
        let err = mapping.view_for("feature/new").unwrap_err();
        assert!(matches!(err, GatewayError::UnmappedBranch(name) if name == "feature/new"));
    }

    #[test]
    fn unmapped_branch_gets_lightweight_view_when_creation_enabled() {
        let raw = two_branch_config().replace(
            "enable-git-branch-creation = no",
            "enable-git-branch-creation = yes",
        );
        let mapping = BranchMapping::parse(&raw).unwrap();
        let view = mapping.view_for("feature/new").unwrap();
        assert_eq!(
            view.translate("src/a.rs"),
            vec!["//depot/branches/feature/new/src/a.rs"]
        );
    }

    #[test]
    fn conflicting_depot_targets_are_rejected_at_load() {
        let raw = "[main]\n\
                   git-branch-name = main\n\
                   view = //depot/main/... ...\n\
                   \n\
                   [mirror]\n\
                   git-branch-name = mirror\n\
                   view = //depot/main/... ...\n";
        let err = BranchMapping::parse(raw).unwrap_err();
        assert!(matches!(err, GatewayError::ConflictingMapping { .. }));
    }

    #[test]
    fn duplicate_branch_names_are_rejected() {
        let raw = "[a]\n\
                   git-branch-name = main\n\
                   view = //depot/a/... ...\n\
                   \n\
                   [b]\n\
                   git-branch-name = main\n\
                   view = //depot/b/... ...\n";
        assert!(BranchMapping::parse(raw).is_err());
    }

    #[rstest]
    #[case("change-owner = sometimes")]
    #[case("enable-git-merge-commits = maybe")]
    #[case("unknown-key = 1")]
    fn bad_repo_options_are_rejected(#[case] bad_line: &str) {
        let raw = format!(
            "[@repo]\n{}\n\n[main]\ngit-branch-name = main\nview = //depot/main/... ...\n",
            bad_line
        );
        assert!(BranchMapping::parse(&raw).is_err());
    }

    #[test]
    fn default_config_round_trips() {
        let mapping = BranchMapping::parse(&default_config("fresh repo")).unwrap();
        assert_eq!(mapping.options().description, "fresh repo");
        assert!(mapping.view_for("main").is_ok());
    }
}
