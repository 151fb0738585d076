//! Persistence contract for the lifecycle engine.
//!
//! The engine only ever talks to the [`Store`] trait. Production uses the
//! SurrealDB-backed store in [`crate::db`]; tests (and `--memory-db` dev
//! mode) use [`MemStore`], which enforces the same unique indexes and
//! compare-and-set semantics under a single lock.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    models::{
        Application, ApplicationStatus, Bounty, BountyStatus, IssueRef, PrRef, Project, RepoRef,
        Transaction, User,
    },
};

/// Field updates applied to a bounty by a compare-and-set. `status` is the
/// transition target; everything else is set only when present.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BountyPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BountyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<IssueRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_tx_hash: Option<String>,
    /// Full replacement for the notes array (engine appends locally)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplicationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[axum::async_trait]
pub trait Store: Send + Sync {
    // --- users ---
    async fn create_user(&self, user: User) -> Result<User>;
    async fn get_user(&self, id: &str) -> Result<Option<User>>;
    async fn get_user_by_wallet(&self, wallet: &str) -> Result<Option<User>>;
    async fn get_user_by_github(&self, username: &str) -> Result<Option<User>>;
    async fn update_user_token(&self, id: &str, token: &str) -> Result<()>;
    async fn bump_bounties_created(&self, user_id: &str) -> Result<()>;
    /// Settlement-side stats update; callers gate this on the unique
    /// transaction insert so it applies once per ledger tx hash.
    async fn apply_payout_stats(&self, assignee_id: &str, amount_stroops: i64) -> Result<()>;

    // --- projects ---
    async fn create_project(&self, project: Project) -> Result<Project>;
    async fn get_project(&self, id: &str) -> Result<Option<Project>>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn update_project_counters(
        &self,
        id: &str,
        delta_total: i64,
        delta_active: i64,
        delta_paid_stroops: i64,
    ) -> Result<()>;
    /// Fails unless the project has zero active bounties.
    async fn delete_project(&self, id: &str) -> Result<()>;

    // --- bounties ---
    async fn insert_bounty(&self, bounty: Bounty) -> Result<Bounty>;
    async fn get_bounty(&self, id: &str) -> Result<Option<Bounty>>;
    async fn list_bounties(
        &self,
        status: Option<BountyStatus>,
        project_id: Option<&str>,
    ) -> Result<Vec<Bounty>>;
    /// Compensating delete for a bounty whose upstream issue never got created.
    async fn delete_bounty(&self, id: &str) -> Result<()>;
    async fn find_bounty_by_issue(&self, repo: &RepoRef, number: u64) -> Result<Option<Bounty>>;
    /// Compare-and-set: apply `patch` iff the current status is in
    /// `expected`. `Ok(None)` means the record exists but the status check
    /// lost; the caller maps that to `InvalidState`.
    async fn cas_bounty(
        &self,
        id: &str,
        expected: &[BountyStatus],
        patch: BountyPatch,
    ) -> Result<Option<Bounty>>;

    // --- applications ---
    /// Fails with `DuplicateApplication` when (bounty, applicant) exists.
    async fn insert_application(&self, application: Application) -> Result<Application>;
    async fn get_application(&self, id: &str) -> Result<Option<Application>>;
    async fn list_applications(&self, bounty_id: &str) -> Result<Vec<Application>>;
    async fn cas_application(
        &self,
        id: &str,
        expected: ApplicationStatus,
        patch: ApplicationPatch,
    ) -> Result<Option<Application>>;
    /// Accept one application and reject its pending siblings as one logical
    /// operation: CAS the bounty `open -> in_progress` with the assignee set,
    /// mark the application accepted, and sweep every other
    /// `pending_approval` application for the bounty to `rejected`.
    /// `Ok(None)` means the bounty CAS lost.
    async fn accept_application(
        &self,
        bounty_id: &str,
        application_id: &str,
        applicant_id: &str,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Bounty>>;

    // --- transactions ---
    /// Insert-once keyed on the unique ledger tx hash. Returns `false` when
    /// the hash was already recorded (idempotent replay).
    async fn insert_transaction(&self, tx: Transaction) -> Result<bool>;
    async fn list_transactions(&self, bounty_id: &str) -> Result<Vec<Transaction>>;
}

fn apply_bounty_patch(bounty: &mut Bounty, patch: &BountyPatch) {
    if let Some(status) = patch.status {
        bounty.status = status;
    }
    if let Some(issue) = &patch.issue {
        bounty.issue = Some(issue.clone());
    }
    if let Some(assignee) = &patch.assignee_id {
        bounty.assignee_id = Some(assignee.clone());
    }
    if let Some(at) = patch.assigned_at {
        bounty.assigned_at = Some(at);
    }
    if let Some(pr) = &patch.pr {
        bounty.pr = Some(pr.clone());
    }
    if let Some(hash) = &patch.lock_tx_hash {
        bounty.lock_tx_hash = Some(hash.clone());
    }
    if let Some(hash) = &patch.release_tx_hash {
        bounty.release_tx_hash = Some(hash.clone());
    }
    if let Some(notes) = &patch.notes {
        bounty.notes = notes.clone();
    }
    if let Some(at) = patch.completed_at {
        bounty.completed_at = Some(at);
    }
}

pub use memory::MemStore;

mod memory {
    use std::collections::HashMap;

    use tokio::sync::RwLock;

    use super::*;

    #[derive(Default)]
    struct Tables {
        users: HashMap<String, User>,
        projects: HashMap<String, Project>,
        bounties: HashMap<String, Bounty>,
        applications: HashMap<String, Application>,
        transactions: HashMap<String, Transaction>,
    }

    /// In-memory store. Unique indexes and compare-and-set run under one
    /// write lock, so it is a faithful model of the conditional updates the
    /// SurrealDB store performs.
    #[derive(Default)]
    pub struct MemStore {
        tables: RwLock<Tables>,
    }

    impl MemStore {
        pub fn new() -> MemStore {
            MemStore::default()
        }
    }

    #[axum::async_trait]
    impl Store for MemStore {
        async fn create_user(&self, user: User) -> Result<User> {
            let mut t = self.tables.write().await;
            if t.users.values().any(|u| u.wallet_address == user.wallet_address) {
                return Err(Error::Validation {
                    field: "wallet_address",
                    reason: "already registered".into(),
                });
            }
            if let Some(name) = &user.github_username {
                if t.users
                    .values()
                    .any(|u| u.github_username.as_deref() == Some(name))
                {
                    return Err(Error::Validation {
                        field: "github_username",
                        reason: "already registered".into(),
                    });
                }
            }
            t.users.insert(user.id.clone(), user.clone());
            Ok(user)
        }

        async fn get_user(&self, id: &str) -> Result<Option<User>> {
            Ok(self.tables.read().await.users.get(id).cloned())
        }

        async fn get_user_by_wallet(&self, wallet: &str) -> Result<Option<User>> {
            Ok(self
                .tables
                .read()
                .await
                .users
                .values()
                .find(|u| u.wallet_address == wallet)
                .cloned())
        }

        async fn get_user_by_github(&self, username: &str) -> Result<Option<User>> {
            Ok(self
                .tables
                .read()
                .await
                .users
                .values()
                .find(|u| u.github_username.as_deref() == Some(username))
                .cloned())
        }

        async fn update_user_token(&self, id: &str, token: &str) -> Result<()> {
            let mut t = self.tables.write().await;
            if let Some(user) = t.users.get_mut(id) {
                user.github_token = Some(token.to_string());
            }
            Ok(())
        }

        async fn bump_bounties_created(&self, user_id: &str) -> Result<()> {
            let mut t = self.tables.write().await;
            if let Some(user) = t.users.get_mut(user_id) {
                user.stats.bounties_created += 1;
            }
            Ok(())
        }

        async fn apply_payout_stats(&self, assignee_id: &str, amount_stroops: i64) -> Result<()> {
            let mut t = self.tables.write().await;
            if let Some(user) = t.users.get_mut(assignee_id) {
                user.stats.bounties_completed += 1;
                user.stats.total_earned_stroops += amount_stroops;
            }
            Ok(())
        }

        async fn create_project(&self, project: Project) -> Result<Project> {
            let mut t = self.tables.write().await;
            if t.projects.values().any(|p| p.repo == project.repo) {
                return Err(Error::Validation {
                    field: "repo",
                    reason: format!("project for {} already exists", project.repo),
                });
            }
            t.projects.insert(project.id.clone(), project.clone());
            Ok(project)
        }

        async fn get_project(&self, id: &str) -> Result<Option<Project>> {
            Ok(self.tables.read().await.projects.get(id).cloned())
        }

        async fn list_projects(&self) -> Result<Vec<Project>> {
            Ok(self.tables.read().await.projects.values().cloned().collect())
        }

        async fn update_project_counters(
            &self,
            id: &str,
            delta_total: i64,
            delta_active: i64,
            delta_paid_stroops: i64,
        ) -> Result<()> {
            let mut t = self.tables.write().await;
            if let Some(project) = t.projects.get_mut(id) {
                project.counters.total_bounties =
                    project.counters.total_bounties.saturating_add_signed(delta_total);
                project.counters.active_bounties =
                    project.counters.active_bounties.saturating_add_signed(delta_active);
                project.counters.total_paid_stroops += delta_paid_stroops;
            }
            Ok(())
        }

        async fn delete_project(&self, id: &str) -> Result<()> {
            let mut t = self.tables.write().await;
            let Some(project) = t.projects.get(id) else {
                return Err(Error::NotFound {
                    kind: "project",
                    id: id.to_string(),
                });
            };
            if project.counters.active_bounties > 0 {
                return Err(Error::Validation {
                    field: "project",
                    reason: "project still has active bounties".into(),
                });
            }
            t.projects.remove(id);
            Ok(())
        }

        async fn insert_bounty(&self, bounty: Bounty) -> Result<Bounty> {
            let mut t = self.tables.write().await;
            t.bounties.insert(bounty.id.clone(), bounty.clone());
            Ok(bounty)
        }

        async fn get_bounty(&self, id: &str) -> Result<Option<Bounty>> {
            Ok(self.tables.read().await.bounties.get(id).cloned())
        }

        async fn list_bounties(
            &self,
            status: Option<BountyStatus>,
            project_id: Option<&str>,
        ) -> Result<Vec<Bounty>> {
            Ok(self
                .tables
                .read()
                .await
                .bounties
                .values()
                .filter(|b| status.map_or(true, |s| b.status == s))
                .filter(|b| project_id.map_or(true, |p| b.project_id == p))
                .cloned()
                .collect())
        }

        async fn delete_bounty(&self, id: &str) -> Result<()> {
            self.tables.write().await.bounties.remove(id);
            Ok(())
        }

        async fn find_bounty_by_issue(
            &self,
            repo: &RepoRef,
            number: u64,
        ) -> Result<Option<Bounty>> {
            Ok(self
                .tables
                .read()
                .await
                .bounties
                .values()
                .find(|b| {
                    b.repo == *repo && b.issue.as_ref().map_or(false, |i| i.number == number)
                })
                .cloned())
        }

        async fn cas_bounty(
            &self,
            id: &str,
            expected: &[BountyStatus],
            patch: BountyPatch,
        ) -> Result<Option<Bounty>> {
            let mut t = self.tables.write().await;
            let Some(bounty) = t.bounties.get_mut(id) else {
                return Err(Error::NotFound {
                    kind: "bounty",
                    id: id.to_string(),
                });
            };
            if !expected.contains(&bounty.status) {
                return Ok(None);
            }
            if patch.release_tx_hash.is_some() && bounty.release_tx_hash.is_some() {
                return Err(Error::Internal(anyhow::anyhow!(
                    "release_tx_hash is immutable once set"
                )));
            }
            apply_bounty_patch(bounty, &patch);
            Ok(Some(bounty.clone()))
        }

        async fn insert_application(&self, application: Application) -> Result<Application> {
            let mut t = self.tables.write().await;
            if t.applications.values().any(|a| {
                a.bounty_id == application.bounty_id && a.applicant_id == application.applicant_id
            }) {
                return Err(Error::DuplicateApplication);
            }
            t.applications
                .insert(application.id.clone(), application.clone());
            Ok(application)
        }

        async fn get_application(&self, id: &str) -> Result<Option<Application>> {
            Ok(self.tables.read().await.applications.get(id).cloned())
        }

        async fn list_applications(&self, bounty_id: &str) -> Result<Vec<Application>> {
            Ok(self
                .tables
                .read()
                .await
                .applications
                .values()
                .filter(|a| a.bounty_id == bounty_id)
                .cloned()
                .collect())
        }

        async fn cas_application(
            &self,
            id: &str,
            expected: ApplicationStatus,
            patch: ApplicationPatch,
        ) -> Result<Option<Application>> {
            let mut t = self.tables.write().await;
            let Some(application) = t.applications.get_mut(id) else {
                return Err(Error::NotFound {
                    kind: "application",
                    id: id.to_string(),
                });
            };
            if application.status != expected {
                return Ok(None);
            }
            if let Some(status) = patch.status {
                application.status = status;
            }
            if let Some(comment) = &patch.review_comment {
                application.review_comment = Some(comment.clone());
            }
            if let Some(at) = patch.reviewed_at {
                application.reviewed_at = Some(at);
            }
            Ok(Some(application.clone()))
        }

        async fn accept_application(
            &self,
            bounty_id: &str,
            application_id: &str,
            applicant_id: &str,
            comment: Option<String>,
            now: DateTime<Utc>,
        ) -> Result<Option<Bounty>> {
            let mut t = self.tables.write().await;

            let Some(application) = t.applications.get(application_id) else {
                return Err(Error::NotFound {
                    kind: "application",
                    id: application_id.to_string(),
                });
            };
            if application.status != ApplicationStatus::PendingApproval {
                return Err(Error::AlreadyReviewed(application.status));
            }

            let Some(bounty) = t.bounties.get_mut(bounty_id) else {
                return Err(Error::NotFound {
                    kind: "bounty",
                    id: bounty_id.to_string(),
                });
            };
            if bounty.status != BountyStatus::Open {
                return Ok(None);
            }
            bounty.status = BountyStatus::InProgress;
            bounty.assignee_id = Some(applicant_id.to_string());
            bounty.assigned_at = Some(now);
            let updated = bounty.clone();

            for application in t.applications.values_mut() {
                if application.bounty_id != bounty_id {
                    continue;
                }
                if application.id == application_id {
                    application.status = ApplicationStatus::Accepted;
                    application.review_comment = comment.clone();
                    application.reviewed_at = Some(now);
                } else if application.status == ApplicationStatus::PendingApproval {
                    application.status = ApplicationStatus::Rejected;
                    application.review_comment = Some("another application was accepted".into());
                    application.reviewed_at = Some(now);
                }
            }

            Ok(Some(updated))
        }

        async fn insert_transaction(&self, tx: Transaction) -> Result<bool> {
            let mut t = self.tables.write().await;
            if t.transactions.values().any(|x| x.tx_hash == tx.tx_hash) {
                return Ok(false);
            }
            t.transactions.insert(tx.id.clone(), tx);
            Ok(true)
        }

        async fn list_transactions(&self, bounty_id: &str) -> Result<Vec<Transaction>> {
            Ok(self
                .tables
                .read()
                .await
                .transactions
                .values()
                .filter(|t| t.bounty_id == bounty_id)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{new_id, Difficulty, Role, UserStats};

    fn user(wallet: &str) -> User {
        User {
            id: new_id(),
            wallet_address: wallet.to_string(),
            display_name: "someone".into(),
            github_username: None,
            github_token: None,
            role: Role::Both,
            stats: UserStats::default(),
            created_at: Utc::now(),
        }
    }

    fn bounty(status: BountyStatus) -> Bounty {
        Bounty {
            id: new_id(),
            project_id: "p1".into(),
            creator_id: "creator".into(),
            title: "fix the thing".into(),
            description: "it is broken".into(),
            reward_stroops: 50 * crate::models::STROOPS_PER_XLM,
            difficulty: Difficulty::Medium,
            skills: vec!["Go".into()],
            repo: RepoRef {
                owner: "acme".into(),
                name: "widgets".into(),
            },
            issue: None,
            assignee_id: None,
            assigned_at: None,
            pr: None,
            lock_tx_hash: None,
            release_tx_hash: None,
            deadline: None,
            notes: vec![],
            status,
            legacy_contract_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn application(bounty_id: &str, applicant_id: &str) -> Application {
        Application {
            id: new_id(),
            bounty_id: bounty_id.to_string(),
            applicant_id: applicant_id.to_string(),
            proposal: "x".repeat(60),
            estimated_days: 7,
            wallet_address: "GWALLET".into(),
            github_username: "dev".into(),
            portfolio_url: None,
            review_comment: None,
            reviewed_at: None,
            status: ApplicationStatus::PendingApproval,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cas_bounty_requires_expected_status() {
        let store = MemStore::new();
        let b = store.insert_bounty(bounty(BountyStatus::Open)).await.unwrap();

        let won = store
            .cas_bounty(
                &b.id,
                &[BountyStatus::UnderReview],
                BountyPatch {
                    status: Some(BountyStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(won.is_none());

        let won = store
            .cas_bounty(
                &b.id,
                &[BountyStatus::Open],
                BountyPatch {
                    status: Some(BountyStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(won.unwrap().status, BountyStatus::Cancelled);
    }

    #[tokio::test]
    async fn cas_bounty_wins_exactly_once() {
        let store = MemStore::new();
        let b = store
            .insert_bounty(bounty(BountyStatus::UnderReview))
            .await
            .unwrap();

        let mut wins = 0;
        for _ in 0..5 {
            let res = store
                .cas_bounty(
                    &b.id,
                    &[BountyStatus::UnderReview],
                    BountyPatch {
                        status: Some(BountyStatus::Completed),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            if res.is_some() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn duplicate_application_rejected() {
        let store = MemStore::new();
        let b = store.insert_bounty(bounty(BountyStatus::Open)).await.unwrap();
        store
            .insert_application(application(&b.id, "alice"))
            .await
            .unwrap();
        let err = store
            .insert_application(application(&b.id, "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateApplication));
        // a different applicant is fine
        store
            .insert_application(application(&b.id, "bob"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn accept_sweeps_pending_siblings() {
        let store = MemStore::new();
        let b = store.insert_bounty(bounty(BountyStatus::Open)).await.unwrap();
        let winner = store
            .insert_application(application(&b.id, "alice"))
            .await
            .unwrap();
        let loser = store
            .insert_application(application(&b.id, "bob"))
            .await
            .unwrap();

        let updated = store
            .accept_application(&b.id, &winner.id, "alice", None, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, BountyStatus::InProgress);
        assert_eq!(updated.assignee_id.as_deref(), Some("alice"));

        let apps = store.list_applications(&b.id).await.unwrap();
        for app in apps {
            if app.id == winner.id {
                assert_eq!(app.status, ApplicationStatus::Accepted);
            } else {
                assert_eq!(app.id, loser.id);
                assert_eq!(app.status, ApplicationStatus::Rejected);
            }
        }
    }

    #[tokio::test]
    async fn transaction_hash_is_insert_once() {
        let store = MemStore::new();
        let tx = Transaction {
            id: new_id(),
            kind: crate::models::TransactionKind::PaymentRelease,
            bounty_id: "b1".into(),
            from_user_id: "creator".into(),
            to_user_id: "alice".into(),
            amount_stroops: 100,
            tx_hash: "abc123".into(),
            ledger_seq: 7,
            status: crate::models::TransactionStatus::Confirmed,
            description: "payout".into(),
            created_at: Utc::now(),
        };
        assert!(store.insert_transaction(tx.clone()).await.unwrap());
        let replay = Transaction {
            id: new_id(),
            ..tx
        };
        assert!(!store.insert_transaction(replay).await.unwrap());
    }

    #[tokio::test]
    async fn release_hash_immutable() {
        let store = MemStore::new();
        let mut b = bounty(BountyStatus::Completed);
        b.release_tx_hash = Some("first".into());
        let b = store.insert_bounty(b).await.unwrap();

        let err = store
            .cas_bounty(
                &b.id,
                &[BountyStatus::Completed],
                BountyPatch {
                    status: Some(BountyStatus::Paid),
                    release_tx_hash: Some("second".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn unique_wallet_enforced() {
        let store = MemStore::new();
        store.create_user(user("GAAA")).await.unwrap();
        let err = store.create_user(user("GAAA")).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
