use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use crate::external::git_host::{
    ChangeStats, IssueNumber, MergeStrategy, PullNumber, PullRequestSnapshot,
};

static CLOSING_KEYWORD: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s+#(\d+)").ok()
});

static BRANCH_ISSUE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^/]+/(\d+)(?:-|$)").ok());

/// The pull request being integrated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub id: PullNumber,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: Option<String>,
    /// Issue this change resolves, if any
    pub work_item: Option<IssueNumber>,
    pub head_sha: String,
    pub labels: Vec<String>,
}

impl MergeCandidate {
    pub fn from_snapshot(snapshot: &PullRequestSnapshot) -> Self {
        let work_item = snapshot
            .body
            .as_deref()
            .and_then(work_item_from_text)
            .or_else(|| work_item_from_branch(&snapshot.head_ref));

        Self {
            id: snapshot.number,
            source_branch: snapshot.head_ref.clone(),
            target_branch: snapshot.base_ref.clone(),
            title: snapshot.title.clone(),
            description: snapshot.body.clone().filter(|b| !b.trim().is_empty()),
            work_item,
            head_sha: snapshot.head_sha.clone(),
            labels: snapshot.labels.clone(),
        }
    }
}

/// First `Fixes #N` / `Closes #N` / `Resolves #N` reference in the text
pub fn work_item_from_text(text: &str) -> Option<IssueNumber> {
    CLOSING_KEYWORD
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Issue number encoded in a branch name like `agent001/42-fix-login`
pub fn work_item_from_branch(branch: &str) -> Option<IssueNumber> {
    BRANCH_ISSUE
        .as_ref()?
        .captures(branch)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequirementKind {
    Approvals,
    CiChecks,
    NoConflicts,
    BranchProtection,
    PolicyCompliance,
}

impl RequirementKind {
    /// Evaluation order, which is also the order of the verdict
    pub const ALL: [RequirementKind; 5] = [
        RequirementKind::Approvals,
        RequirementKind::CiChecks,
        RequirementKind::NoConflicts,
        RequirementKind::BranchProtection,
        RequirementKind::PolicyCompliance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::Approvals => "approvals",
            RequirementKind::CiChecks => "ci-checks",
            RequirementKind::NoConflicts => "no-conflicts",
            RequirementKind::BranchProtection => "branch-protection",
            RequirementKind::PolicyCompliance => "policy-compliance",
        }
    }

    /// Stable code reported when this requirement blocks a merge
    pub fn blocking_code(&self) -> &'static str {
        match self {
            RequirementKind::Approvals => "approval_required",
            RequirementKind::CiChecks => "ci_failed",
            RequirementKind::NoConflicts => "merge_conflict",
            RequirementKind::BranchProtection => "branch_protected",
            RequirementKind::PolicyCompliance => "policy_violation",
        }
    }
}

impl fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementStatus {
    Satisfied,
    Pending,
    Failed,
    /// The data needed to decide could not be read
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub kind: RequirementKind,
    pub status: RequirementStatus,
    pub description: String,
    pub mandatory: bool,
    pub evaluated_at: DateTime<Utc>,
    /// How long until a pending requirement is expected to resolve
    pub wait_estimate: Option<Duration>,
    /// Collaborator error behind an `Unknown` status
    pub error: Option<String>,
    /// A failure the system can clear by itself, such as re-running
    /// cancelled checks
    pub auto_resolvable: bool,
    /// A person can do something about a failure
    pub actionable: bool,
}

impl Requirement {
    pub fn new(
        kind: RequirementKind,
        status: RequirementStatus,
        description: impl Into<String>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            status,
            description: description.into(),
            mandatory: true,
            evaluated_at,
            wait_estimate: None,
            error: None,
            auto_resolvable: false,
            actionable: true,
        }
    }

    pub fn unknown(
        kind: RequirementKind,
        error: impl fmt::Display,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        let error = error.to_string();
        let mut requirement = Self::new(
            kind,
            RequirementStatus::Unknown,
            format!("could not evaluate {kind}: {error}"),
            evaluated_at,
        );
        requirement.error = Some(error);
        requirement
    }

    pub fn with_wait_estimate(mut self, estimate: Option<Duration>) -> Self {
        self.wait_estimate = estimate;
        self
    }

    pub fn is_satisfied(&self) -> bool {
        self.status == RequirementStatus::Satisfied
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub code: String,
    pub requirement: RequirementKind,
    pub message: String,
    pub actionable: bool,
    pub auto_resolvable: bool,
}

/// Aggregate merge decision for one evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessVerdict {
    pub can_merge: bool,
    pub requirements: Vec<Requirement>,
    pub blocking_issues: Vec<BlockingIssue>,
    pub warnings: Vec<String>,
    pub estimated_ready_at: Option<DateTime<Utc>>,
    pub evaluated_at: DateTime<Utc>,
}

impl ReadinessVerdict {
    /// Derive the verdict from evaluated requirements.
    ///
    /// Pure: equal inputs always give equal verdicts.
    pub fn from_requirements(requirements: Vec<Requirement>, now: DateTime<Utc>) -> Self {
        let mandatory = || requirements.iter().filter(|r| r.mandatory);

        let can_merge = mandatory().all(Requirement::is_satisfied);

        let blocking_issues = mandatory()
            .filter(|r| r.status == RequirementStatus::Failed)
            .map(|r| BlockingIssue {
                code: r.kind.blocking_code().to_string(),
                requirement: r.kind,
                message: r.description.clone(),
                actionable: r.actionable,
                auto_resolvable: r.auto_resolvable,
            })
            .collect::<Vec<_>>();

        let mut warnings = Vec::new();
        for requirement in &requirements {
            match (requirement.status, requirement.mandatory) {
                (RequirementStatus::Unknown, true) => {
                    warnings.push(requirement.description.clone())
                }
                (RequirementStatus::Failed | RequirementStatus::Unknown, false) => warnings.push(
                    format!("optional {}: {}", requirement.kind, requirement.description),
                ),
                _ => {}
            }
        }

        let estimated_ready_at = if can_merge {
            Some(now)
        } else {
            let waiting = mandatory().filter(|r| !r.is_satisfied()).collect::<Vec<_>>();
            let all_estimable = waiting
                .iter()
                .all(|r| r.status == RequirementStatus::Pending && r.wait_estimate.is_some());
            if all_estimable {
                waiting
                    .iter()
                    .filter_map(|r| r.wait_estimate)
                    .max()
                    .and_then(|wait| chrono::Duration::from_std(wait).ok())
                    .map(|wait| now + wait)
            } else {
                None
            }
        };

        Self {
            can_merge,
            requirements,
            blocking_issues,
            warnings,
            estimated_ready_at,
            evaluated_at: now,
        }
    }

    pub fn has_failed_mandatory(&self) -> bool {
        self.requirements
            .iter()
            .any(|r| r.mandatory && r.status == RequirementStatus::Failed)
    }

    pub fn requirement(&self, kind: RequirementKind) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.kind == kind)
    }

    pub fn blocking_codes(&self) -> Vec<&str> {
        self.blocking_issues.iter().map(|b| b.code.as_str()).collect()
    }

    /// One line naming what stands in the way, for failure summaries
    pub fn summary(&self) -> String {
        if !self.blocking_issues.is_empty() {
            return self
                .blocking_issues
                .iter()
                .map(|b| format!("{} ({})", b.code, b.message))
                .collect::<Vec<_>>()
                .join("; ");
        }
        let waiting = self
            .requirements
            .iter()
            .filter(|r| r.mandatory && !r.is_satisfied())
            .map(|r| format!("{}: {}", r.kind, r.description))
            .collect::<Vec<_>>();
        if waiting.is_empty() {
            "ready to merge".to_string()
        } else {
            format!("waiting on {}", waiting.join("; "))
        }
    }
}

/// Classified failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    RequirementsNotMet,
    MergeConflict,
    PermissionDenied,
    BranchProtected,
    PolicyViolation,
    CiPending,
    TransportError,
    Timeout,
    VerificationFailed,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::MergeConflict | ErrorKind::CiPending | ErrorKind::TransportError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RequirementsNotMet => "requirements-not-met",
            ErrorKind::MergeConflict => "merge-conflict",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::BranchProtected => "branch-protected",
            ErrorKind::PolicyViolation => "policy-violation",
            ErrorKind::CiPending => "ci-pending",
            ErrorKind::TransportError => "transport-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::VerificationFailed => "verification-failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl MergeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            message: message.into(),
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one merge executor call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub merge_commit: Option<String>,
    pub strategy: MergeStrategy,
    pub stats: ChangeStats,
    pub errors: Vec<MergeError>,
    /// The host already had the change merged and nothing was performed
    pub adopted: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl MergeOutcome {
    pub fn error(&self) -> Option<&MergeError> {
        self.errors.first()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::ready_pull_request;
    use proptest::prelude::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    fn requirement(
        kind: RequirementKind,
        status: RequirementStatus,
        estimate: Option<u64>,
    ) -> Requirement {
        Requirement::new(kind, status, format!("{kind} is {status:?}"), epoch())
            .with_wait_estimate(estimate.map(Duration::from_secs))
    }

    #[test]
    fn test_work_item_from_closing_keywords() {
        assert_eq!(work_item_from_text("This Fixes #12 for real"), Some(12));
        assert_eq!(work_item_from_text("closes #7"), Some(7));
        assert_eq!(work_item_from_text("Resolved #300 and more"), Some(300));
        assert_eq!(work_item_from_text("see #12"), None);
        assert_eq!(work_item_from_text("prefixes #4"), None);
    }

    #[test]
    fn test_work_item_from_branch_name() {
        assert_eq!(work_item_from_branch("agent001/42-fix-login"), Some(42));
        assert_eq!(work_item_from_branch("feature/42"), Some(42));
        assert_eq!(work_item_from_branch("feature/login-42"), None);
        assert_eq!(work_item_from_branch("main"), None);
    }

    #[test]
    fn test_candidate_prefers_description_over_branch() {
        let mut pull = ready_pull_request(5);
        pull.body = Some("Closes #99".to_string());
        assert_eq!(MergeCandidate::from_snapshot(&pull).work_item, Some(99));

        pull.body = None;
        assert_eq!(MergeCandidate::from_snapshot(&pull).work_item, Some(5));
    }

    #[test]
    fn test_all_satisfied_means_mergeable_now() {
        let now = Utc::now();
        let requirements = RequirementKind::ALL
            .iter()
            .map(|k| requirement(*k, RequirementStatus::Satisfied, None))
            .collect();
        let verdict = ReadinessVerdict::from_requirements(requirements, now);

        assert!(verdict.can_merge);
        assert!(verdict.blocking_issues.is_empty());
        assert_eq!(verdict.estimated_ready_at, Some(now));
    }

    #[test]
    fn test_estimate_is_the_longest_pending_wait() {
        let now = Utc::now();
        let verdict = ReadinessVerdict::from_requirements(
            vec![
                requirement(RequirementKind::Approvals, RequirementStatus::Satisfied, None),
                requirement(RequirementKind::CiChecks, RequirementStatus::Pending, Some(300)),
                requirement(RequirementKind::NoConflicts, RequirementStatus::Pending, Some(15)),
            ],
            now,
        );
        assert!(!verdict.can_merge);
        assert_eq!(verdict.estimated_ready_at, Some(now + chrono::Duration::seconds(300)));
    }

    #[test]
    fn test_pending_without_estimate_promises_nothing() {
        let verdict = ReadinessVerdict::from_requirements(
            vec![
                requirement(RequirementKind::Approvals, RequirementStatus::Pending, None),
                requirement(RequirementKind::CiChecks, RequirementStatus::Pending, Some(300)),
            ],
            Utc::now(),
        );
        assert_eq!(verdict.estimated_ready_at, None);
    }

    #[test]
    fn test_optional_failure_is_only_a_warning() {
        let mut optional =
            requirement(RequirementKind::PolicyCompliance, RequirementStatus::Failed, None);
        optional.mandatory = false;
        let approvals = requirement(RequirementKind::Approvals, RequirementStatus::Satisfied, None);
        let verdict = ReadinessVerdict::from_requirements(
            vec![approvals, optional],
            Utc::now(),
        );
        assert!(verdict.can_merge);
        assert!(verdict.blocking_issues.is_empty());
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[test]
    fn test_retryable_error_kinds() {
        assert!(ErrorKind::MergeConflict.is_retryable());
        assert!(ErrorKind::TransportError.is_retryable());
        assert!(ErrorKind::CiPending.is_retryable());
        assert!(!ErrorKind::RequirementsNotMet.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::BranchProtected.is_retryable());
        assert!(!ErrorKind::PolicyViolation.is_retryable());
    }

    fn status_strategy() -> impl Strategy<Value = RequirementStatus> {
        prop_oneof![
            Just(RequirementStatus::Satisfied),
            Just(RequirementStatus::Pending),
            Just(RequirementStatus::Failed),
            Just(RequirementStatus::Unknown),
        ]
    }

    proptest! {
        #[test]
        fn prop_verdict_follows_mandatory_statuses(
            statuses in proptest::collection::vec(
                (status_strategy(), any::<bool>(), proptest::option::of(1u64..3600)),
                5,
            )
        ) {
            let now = epoch();
            let requirements: Vec<Requirement> = RequirementKind::ALL
                .iter()
                .zip(statuses.iter())
                .map(|(kind, (status, mandatory, estimate))| {
                    let mut r = requirement(*kind, *status, *estimate);
                    r.mandatory = *mandatory;
                    r
                })
                .collect();

            let verdict = ReadinessVerdict::from_requirements(requirements.clone(), now);
            let mandatory: Vec<&Requirement> =
                requirements.iter().filter(|r| r.mandatory).collect();
            let any_mandatory =
                |status: RequirementStatus| mandatory.iter().any(|r| r.status == status);

            prop_assert_eq!(
                verdict.can_merge,
                mandatory.iter().all(|r| r.status == RequirementStatus::Satisfied)
            );
            prop_assert_eq!(
                verdict.blocking_issues.len(),
                mandatory.iter().filter(|r| r.status == RequirementStatus::Failed).count()
            );
            if verdict.can_merge {
                prop_assert!(verdict.blocking_issues.is_empty());
            }
            if verdict.has_failed_mandatory() || any_mandatory(RequirementStatus::Unknown) {
                prop_assert!(verdict.estimated_ready_at.is_none());
            }
            let again = ReadinessVerdict::from_requirements(requirements, now);
            prop_assert_eq!(verdict.clone(), again);
        }
    }
}
