//! View maps: ordered path-translation rules between depot and git paths
//!
//! A view is an ordered list of rules. Each rule maps a depot-side prefix
//! to a git-side prefix and is one of:
//!
//! - inclusion: `//depot/main/... ...`
//! - exclusion: `-//depot/main/gen/... gen/...` removes matches no matter
//!   where the rule sits in the list
//! - overlay:   `+//depot/extra/... docs/...` adds a mapping without
//!   occluding earlier inclusions
//!
//! Later inclusions override earlier ones for overlapping prefixes.
//! Resolution is pure: the same input always yields the same targets.

use crate::errors::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RuleKind {
    Include,
    Exclude,
    Overlay,
}

/// One path-translation rule.
///
/// Wildcard rules (`...` on both sides) map whole subtrees; exact rules
/// map a single path.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ViewRule {
    kind: RuleKind,
    depot_prefix: String,
    git_prefix: String,
    wildcard: bool,
}

impl ViewRule {
    /// Parse one view line, e.g. `-//depot/main/gen/... gen/...`.
    pub fn parse(line: &str) -> GatewayResult<Self> {
        let line = line.trim();
        let (kind, rest) = if let Some(rest) = line.strip_prefix('-') {
            (RuleKind::Exclude, rest)
        } else if let Some(rest) = line.strip_prefix('+') {
            (RuleKind::Overlay, rest)
        } else {
            (RuleKind::Include, line)
        };

        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(GatewayError::Config(format!(
                "view rule must have a depot side and a git side: '{}'",
                line
            )));
        }
        let (depot_side, git_side) = (parts[0], parts[1]);

        if !depot_side.starts_with("//") {
            return Err(GatewayError::Config(format!(
                "depot side of view rule must start with //: '{}'",
                line
            )));
        }

        let depot_wild = depot_side.ends_with("...");
        let git_wild = git_side.ends_with("...") || git_side == "...";
        if depot_wild != git_wild {
            return Err(GatewayError::Config(format!(
                "view rule must use '...' on both sides or neither: '{}'",
                line
            )));
        }

        let normalize = |side: &str| -> String {
            let stripped = side.trim_end_matches("...");
            stripped.to_string()
        };

        Ok(ViewRule {
            kind,
            depot_prefix: normalize(depot_side),
            git_prefix: normalize(git_side),
            wildcard: depot_wild,
        })
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn depot_prefix(&self) -> &str {
        &self.depot_prefix
    }

    pub fn git_prefix(&self) -> &str {
        &self.git_prefix
    }

    /// Match a git path, returning the mapped depot path.
    fn map_git(&self, git_path: &str) -> Option<String> {
        if self.wildcard {
            let remainder = self.strip_git_prefix(git_path)?;
            Some(format!("{}{}", self.depot_prefix, remainder))
        } else if git_path == self.git_prefix {
            Some(self.depot_prefix.clone())
        } else {
            None
        }
    }

    /// Match a depot path, returning the mapped git path.
    fn map_depot(&self, depot_path: &str) -> Option<String> {
        if self.wildcard {
            let remainder = depot_path.strip_prefix(&self.depot_prefix)?;
            Some(format!("{}{}", self.git_prefix, remainder))
        } else if depot_path == self.depot_prefix {
            Some(self.git_prefix.clone())
        } else {
            None
        }
    }

    fn matches_git(&self, git_path: &str) -> bool {
        if self.wildcard {
            self.strip_git_prefix(git_path).is_some()
        } else {
            git_path == self.git_prefix
        }
    }

    fn matches_depot(&self, depot_path: &str) -> bool {
        if self.wildcard {
            depot_path.starts_with(&self.depot_prefix)
        } else {
            depot_path == self.depot_prefix
        }
    }

    fn strip_git_prefix<'a>(&self, git_path: &'a str) -> Option<&'a str> {
        if self.git_prefix.is_empty() {
            return Some(git_path);
        }
        git_path.strip_prefix(&self.git_prefix)
    }

    pub fn display(&self) -> String {
        let marker = match self.kind {
            RuleKind::Include => "",
            RuleKind::Exclude => "-",
            RuleKind::Overlay => "+",
        };
        let wild = if self.wildcard { "..." } else { "" };
        format!(
            "{}{}{} {}{}",
            marker, self.depot_prefix, wild, self.git_prefix, wild
        )
    }
}

/// Ordered set of view rules for one branch mapping entry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ViewMap {
    rules: Vec<ViewRule>,
}

impl ViewMap {
    pub fn parse(lines: &str) -> GatewayResult<Self> {
        let rules = lines
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ViewRule::parse)
            .collect::<GatewayResult<Vec<_>>>()?;
        if rules.is_empty() {
            return Err(GatewayError::Config("view has no rules".to_string()));
        }
        Ok(ViewMap { rules })
    }

    pub fn rules(&self) -> &[ViewRule] {
        &self.rules
    }

    /// Project a git path to zero or more depot paths.
    ///
    /// Zero targets means the path is fully excluded from this view.
    /// The last matching inclusion wins; matching overlays contribute
    /// additional targets in declaration order.
    pub fn translate(&self, git_path: &str) -> Vec<String> {
        // exclusions remove matches regardless of position
        if self
            .rules
            .iter()
            .any(|rule| rule.kind == RuleKind::Exclude && rule.matches_git(git_path))
        {
            return Vec::new();
        }

        let mut primary = None;
        let mut overlays = Vec::new();
        for rule in &self.rules {
            match rule.kind {
                RuleKind::Include => {
                    if let Some(target) = rule.map_git(git_path) {
                        primary = Some(target);
                    }
                }
                RuleKind::Overlay => {
                    if let Some(target) = rule.map_git(git_path) {
                        overlays.push(target);
                    }
                }
                RuleKind::Exclude => {}
            }
        }
        primary.into_iter().chain(overlays).collect()
    }

    /// Inverse projection: depot path back to the git path it came from.
    /// Used by the fetch reconstructor.
    pub fn invert(&self, depot_path: &str) -> Option<String> {
        if self
            .rules
            .iter()
            .any(|rule| rule.kind == RuleKind::Exclude && rule.matches_depot(depot_path))
        {
            return None;
        }

        let mut result = None;
        for rule in &self.rules {
            if rule.kind != RuleKind::Exclude
                && let Some(git_path) = rule.map_depot(depot_path)
            {
                result = Some(git_path);
            }
        }
        result
    }

    /// Does any inclusion or overlay of this view cover the depot path?
    pub fn covers_depot(&self, depot_path: &str) -> bool {
        self.invert(depot_path).is_some()
    }
}
