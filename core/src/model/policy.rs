use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProjectId;
use crate::pattern::Pattern;

/// How a selector's pattern is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decoration {
    /// Select what matches.
    #[default]
    Matches,
    /// Select what does not match.
    Excludes,
}

/// A decorated doublestar pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Matches or excludes.
    #[serde(default)]
    pub decoration: Decoration,
    /// Pattern.
    pub pattern: Pattern,
}

impl Selector {
    /// A selector matching `pattern`.
    pub fn matching(pattern: Pattern) -> Self {
        Selector {
            decoration: Decoration::Matches,
            pattern,
        }
    }

    /// Whether `candidate` is selected.
    pub fn selects(&self, candidate: &str) -> bool {
        let matched = self.pattern.matches(candidate);
        match self.decoration {
            Decoration::Matches => matched,
            Decoration::Excludes => !matched,
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Selector::matching(Pattern::any())
    }
}

/// Immutable rule identifier.
pub type ImmutableRuleId = i64;

/// A rule preventing overwrite or deletion of matching tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmutableRule {
    /// Identifier.
    #[serde(default)]
    pub id: ImmutableRuleId,
    /// Owning project.
    #[serde(default)]
    pub project_id: ProjectId,
    /// Disabled rules never match.
    #[serde(default)]
    pub disabled: bool,
    /// Tags the rule protects.
    pub tag_selector: Selector,
    /// Repositories (path within the project) the rule applies to.
    #[serde(default)]
    pub repository_selector: Selector,
}

impl ImmutableRule {
    /// Whether the rule protects `tag` in the repository `within_project`.
    pub fn protects(&self, within_project: &str, tag: &str) -> bool {
        !self.disabled
            && self.repository_selector.selects(within_project)
            && self.tag_selector.selects(tag)
    }
}

/// One predicate of a retention rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "pattern", rename_all = "snake_case")]
pub enum RetentionSelector {
    /// Artifacts with a tag matching the pattern.
    TagMatch(Pattern),
    /// Artifacts with a tag not matching the pattern.
    TagExclude(Pattern),
    /// Also consider artifacts without tags.
    Untagged,
    /// Repositories (path within the project) matching the pattern.
    RepoMatch(Pattern),
}

/// What a retention rule keeps among the artifacts it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RetentionAction {
    /// The `count` most recently pushed.
    LatestPushed {
        /// How many to keep.
        count: usize,
    },
    /// Those pushed within the last `days` days.
    PushedWithinDays {
        /// Window.
        days: u32,
    },
    /// Those pulled within the last `days` days.
    PulledWithinDays {
        /// Window.
        days: u32,
    },
}

/// A selector list (all must hold) and an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    /// Disabled rules retain nothing.
    #[serde(default)]
    pub disabled: bool,
    /// Predicates.
    pub selectors: Vec<RetentionSelector>,
    /// What to keep.
    pub action: RetentionAction,
}

/// Retention policy identifier.
pub type RetentionPolicyId = i64;

/// Ordered list of retention rules for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Identifier.
    #[serde(default)]
    pub id: RetentionPolicyId,
    /// Project the policy applies to.
    pub project_id: ProjectId,
    /// Rules.
    pub rules: Vec<RetentionRule>,
}

/// CVE allow-list with optional expiry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CveAllowlist {
    /// Allowed CVE identifiers.
    #[serde(default)]
    pub items: Vec<String>,
    /// The list stops applying after this time.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CveAllowlist {
    /// Whether `cve` is allowed at `now`.
    pub fn allows(&self, cve: &str, now: DateTime<Utc>) -> bool {
        let live = self.expires_at.map_or(true, |expires| now < expires);
        live && self.items.iter().any(|item| item == cve)
    }
}

/// Storage quota of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Owning project.
    pub project_id: ProjectId,
    /// Limit in bytes; `None` means unlimited.
    pub hard: Option<u64>,
    /// Committed usage in bytes.
    pub used: u64,
    /// Outstanding, unexpired reservations in bytes.
    pub reserved: u64,
}

/// Handle on a quota reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub uuid::Uuid);
