use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 1 XLM expressed in stroops, the smallest ledger unit.
pub const STROOPS_PER_XLM: i64 = 10_000_000;

/// Smallest reward a bounty may carry (1 XLM).
pub const MIN_REWARD_STROOPS: i64 = STROOPS_PER_XLM;

/// Generate an opaque record id.
pub fn new_id() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Contributor,
    Maintainer,
    Both,
}

impl Role {
    pub fn can_maintain(&self) -> bool {
        matches!(self, Role::Maintainer | Role::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Lifecycle status of a bounty. Every state advance goes through the
/// engine's compare-and-set; nothing else writes this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BountyStatus {
    /// Persisted locally, upstream issue not yet created
    PendingGithub,
    /// Upstream issue exists, funds not yet locked
    PendingBlockchain,
    /// Accepting applications
    Open,
    /// An application was accepted, assignee is working
    InProgress,
    /// Assignee submitted a PR, awaiting creator review
    UnderReview,
    /// Approval won, payment dispatched
    Completed,
    /// Payment settled and recorded
    Paid,
    Cancelled,
    Closed,
}

impl BountyStatus {
    /// States from which the creator may still cancel.
    pub fn is_pre_completion(&self) -> bool {
        matches!(
            self,
            BountyStatus::PendingGithub
                | BountyStatus::PendingBlockchain
                | BountyStatus::Open
                | BountyStatus::InProgress
                | BountyStatus::UnderReview
        )
    }

    pub fn accepts_applications(&self) -> bool {
        matches!(self, BountyStatus::Open)
    }
}

impl std::fmt::Display for BountyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BountyStatus::PendingGithub => "pending_github",
            BountyStatus::PendingBlockchain => "pending_blockchain",
            BountyStatus::Open => "open",
            BountyStatus::InProgress => "in_progress",
            BountyStatus::UnderReview => "under_review",
            BountyStatus::Completed => "completed",
            BountyStatus::Paid => "paid",
            BountyStatus::Cancelled => "cancelled",
            BountyStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    PendingApproval,
    Accepted,
    Rejected,
    Withdrawn,
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplicationStatus::PendingApproval => "pending_approval",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Withdrawn => "withdrawn",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    BountyCreation,
    PaymentRelease,
    Refund,
    FeePayment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One github repository, addressed as owner/name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// The upstream issue a bounty is pinned to, filled in once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    pub url: String,
    pub node_id: String,
}

/// Pull request submitted by the assignee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRef {
    pub url: String,
    pub number: u64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub bounties_created: u64,
    pub bounties_completed: u64,
    pub total_earned_stroops: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Stellar account funds are paid out to
    pub wallet_address: String,
    pub display_name: String,
    /// Username as associated with github (could potentially decouple from github in future)
    pub github_username: Option<String>,
    /// Opaque github access credential, refreshed on login. Never exposed in responses.
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub role: Role,
    pub stats: UserStats,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCounters {
    pub total_bounties: u64,
    pub active_bounties: u64,
    pub total_paid_stroops: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub auto_create_issues: bool,
    pub require_approval: bool,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        ProjectSettings {
            auto_create_issues: true,
            require_approval: true,
        }
    }
}

/// Maps a maintainer to one repository bounties can be posted against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub maintainer_id: String,
    pub repo: RepoRef,
    pub counters: ProjectCounters,
    pub settings: ProjectSettings,
    pub created_at: DateTime<Utc>,
}

/// One unit of paid work tied to a repository issue.
///
/// Earlier data tracked contract-linked and issue-linked bounties as
/// separate shapes; this is the unified record, with `legacy_contract_id`
/// carrying over the old linkage when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounty {
    pub id: String,
    pub project_id: String,
    /// The user that owns this bounty
    pub creator_id: String,
    pub title: String,
    pub description: String,
    /// Reward in stroops (1 XLM = 10^7 stroops)
    pub reward_stroops: i64,
    pub difficulty: Difficulty,
    pub skills: Vec<String>,
    pub repo: RepoRef,
    pub issue: Option<IssueRef>,
    pub assignee_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub pr: Option<PrRef>,
    pub lock_tx_hash: Option<String>,
    /// Hash of the release payment. Immutable once set.
    pub release_tx_hash: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    /// Append-only feedback / failure notes
    pub notes: Vec<String>,
    pub status: BountyStatus,
    pub legacy_contract_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A contributor's bid to be assigned a bounty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub bounty_id: String,
    pub applicant_id: String,
    pub proposal: String,
    pub estimated_days: u32,
    pub wallet_address: String,
    pub github_username: String,
    pub portfolio_url: Option<String>,
    pub review_comment: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit record of a ledger payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub bounty_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub amount_stroops: i64,
    /// Ledger transaction hash; unique, doubles as the idempotency key
    pub tx_hash: String,
    pub ledger_seq: i64,
    pub status: TransactionStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&BountyStatus::PendingGithub).unwrap();
        assert_eq!(s, r#""pending_github""#);
        let s = serde_json::to_string(&BountyStatus::UnderReview).unwrap();
        assert_eq!(s, r#""under_review""#);
        let back: BountyStatus = serde_json::from_str(r#""in_progress""#).unwrap();
        assert_eq!(back, BountyStatus::InProgress);
    }

    #[test]
    fn pre_completion_states() {
        assert!(BountyStatus::Open.is_pre_completion());
        assert!(BountyStatus::UnderReview.is_pre_completion());
        assert!(!BountyStatus::Paid.is_pre_completion());
        assert!(!BountyStatus::Cancelled.is_pre_completion());
    }

    #[test]
    fn only_open_accepts_applications() {
        assert!(BountyStatus::Open.accepts_applications());
        assert!(!BountyStatus::InProgress.accepts_applications());
        assert!(!BountyStatus::PendingBlockchain.accepts_applications());
    }
}
