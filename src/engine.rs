//! Bounty lifecycle engine.
//!
//! Every status change funnels through here: guards run before any write or
//! external call, each state advance is a compare-and-set on the bounty
//! record, and the payment is only submitted by the request that won the
//! `under_review -> completed` CAS. Collaborators are injected so tests can
//! substitute fakes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    github::{parse_pr_url, IssueTracker},
    models::{
        new_id, Bounty, BountyStatus, Difficulty, PrRef, Transaction, TransactionKind,
        TransactionStatus, User, MIN_REWARD_STROOPS,
    },
    stellar::Ledger,
    store::{BountyPatch, Store},
};

/// Platform escrow account that releases payouts.
#[derive(Clone)]
pub struct EscrowKeys {
    pub public: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBounty {
    pub project_id: String,
    pub title: String,
    pub description: String,
    /// Reward in stroops
    pub reward_stroops: i64,
    pub difficulty: Difficulty,
    pub skills: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
    /// Linkage to the retired contract-based bounty model
    pub legacy_contract_id: Option<u64>,
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) tracker: Arc<dyn IssueTracker>,
    pub(crate) ledger: Arc<dyn Ledger>,
    escrow: EscrowKeys,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        tracker: Arc<dyn IssueTracker>,
        ledger: Arc<dyn Ledger>,
        escrow: EscrowKeys,
    ) -> Engine {
        Engine {
            store,
            tracker,
            ledger,
            escrow,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// CAS a bounty or report `InvalidState` carrying the actual current
    /// status so the client can resync.
    async fn transition(
        &self,
        id: &str,
        expected: &[BountyStatus],
        patch: BountyPatch,
        attempted: &'static str,
    ) -> Result<Bounty> {
        match self.store.cas_bounty(id, expected, patch).await? {
            Some(bounty) => Ok(bounty),
            None => {
                let current = self.require_bounty(id).await?.status;
                Err(Error::InvalidState { attempted, current })
            },
        }
    }

    pub(crate) async fn require_bounty(&self, id: &str) -> Result<Bounty> {
        self.store.get_bounty(id).await?.ok_or_else(|| Error::NotFound {
            kind: "bounty",
            id: id.to_string(),
        })
    }

    pub(crate) async fn require_user(&self, id: &str) -> Result<User> {
        self.store.get_user(id).await?.ok_or_else(|| Error::NotFound {
            kind: "user",
            id: id.to_string(),
        })
    }

    fn creator_token(user: &User) -> Result<&str> {
        user.github_token
            .as_deref()
            .ok_or(Error::Unauthorized("no github credential on record"))
    }

    /// Create a bounty and walk it through
    /// `pending_github -> pending_blockchain -> open`.
    ///
    /// The upstream issue is created before any counters move; if it fails,
    /// the freshly persisted record is deleted again (compensating delete).
    /// A failed funds lock leaves the bounty in `pending_blockchain` with a
    /// note instead of advancing.
    pub async fn create_bounty(&self, actor: &User, req: CreateBounty) -> Result<Bounty> {
        if !actor.role.can_maintain() {
            return Err(Error::Unauthorized("only maintainers can create bounties"));
        }
        if req.reward_stroops < MIN_REWARD_STROOPS {
            return Err(Error::Validation {
                field: "reward_stroops",
                reason: "reward must be at least 1 XLM".into(),
            });
        }
        if req.skills.is_empty() {
            return Err(Error::Validation {
                field: "skills",
                reason: "at least one required skill".into(),
            });
        }
        if req.title.trim().is_empty() {
            return Err(Error::Validation {
                field: "title",
                reason: "title must not be empty".into(),
            });
        }
        let token = Self::creator_token(actor)?;

        let project =
            self.store
                .get_project(&req.project_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    kind: "project",
                    id: req.project_id.clone(),
                })?;
        if project.maintainer_id != actor.id {
            return Err(Error::Unauthorized("not the project maintainer"));
        }

        let bounty = Bounty {
            id: new_id(),
            project_id: project.id.clone(),
            creator_id: actor.id.clone(),
            title: req.title,
            description: req.description,
            reward_stroops: req.reward_stroops,
            difficulty: req.difficulty,
            skills: req.skills,
            repo: project.repo.clone(),
            issue: None,
            assignee_id: None,
            assigned_at: None,
            pr: None,
            lock_tx_hash: None,
            release_tx_hash: None,
            deadline: req.deadline,
            notes: vec![],
            status: BountyStatus::PendingGithub,
            legacy_contract_id: req.legacy_contract_id,
            created_at: Utc::now(),
            completed_at: None,
        };
        let bounty = self.store.insert_bounty(bounty).await?;

        match self.tracker.check_write_access(token, &bounty.repo).await {
            Ok(true) => {},
            Ok(false) => {
                self.store.delete_bounty(&bounty.id).await?;
                return Err(Error::Unauthorized("no write access to repository"));
            },
            Err(e) => {
                // same rollback as a denied check: no upstream issue exists yet
                self.store.delete_bounty(&bounty.id).await?;
                return Err(e);
            },
        }

        let issue_body = format!(
            "{}\n\n---\n**Bounty**: {} stroops | **Difficulty**: {:?} | **Skills**: {}",
            bounty.description,
            bounty.reward_stroops,
            bounty.difficulty,
            bounty.skills.join(", "),
        );
        let labels = vec!["bounty".to_string()];
        let issue = match self
            .tracker
            .create_issue(token, &bounty.repo, &bounty.title, &issue_body, &labels)
            .await
        {
            Ok(issue) => issue,
            Err(e) => {
                // roll the record back; nothing upstream exists to point at it
                self.store.delete_bounty(&bounty.id).await?;
                return Err(e);
            },
        };

        let bounty = self
            .transition(
                &bounty.id,
                &[BountyStatus::PendingGithub],
                BountyPatch {
                    status: Some(BountyStatus::PendingBlockchain),
                    issue: Some(crate::models::IssueRef {
                        number: issue.number,
                        url: issue.url,
                        node_id: issue.node_id,
                    }),
                    ..Default::default()
                },
                "register upstream issue",
            )
            .await?;

        self.store.bump_bounties_created(&actor.id).await?;
        self.store
            .update_project_counters(&project.id, 1, 1, 0)
            .await?;

        self.lock_funds(&bounty, actor).await
    }

    /// `pending_blockchain -> open` when the creator's wallet covers the
    /// reward. The lock is a verified reservation, not an on-chain escrow
    /// transfer; the reference hash ties it to the bounty.
    async fn lock_funds(&self, bounty: &Bounty, creator: &User) -> Result<Bounty> {
        let funded = match self.ledger.balance_stroops(&creator.wallet_address).await {
            Ok(balance) => balance >= bounty.reward_stroops,
            Err(e) => {
                debug!("funds lock balance check failed: {e}");
                false
            },
        };

        if !funded {
            let mut notes = bounty.notes.clone();
            notes.push(format!(
                "funds lock failed: wallet {} does not cover {} stroops",
                creator.wallet_address, bounty.reward_stroops
            ));
            return self
                .transition(
                    &bounty.id,
                    &[BountyStatus::PendingBlockchain],
                    BountyPatch {
                        status: Some(BountyStatus::PendingBlockchain),
                        notes: Some(notes),
                        ..Default::default()
                    },
                    "record lock failure",
                )
                .await;
        }

        let lock_ref = hex::encode(Sha256::digest(format!("lock:{}", bounty.id).as_bytes()));
        self.transition(
            &bounty.id,
            &[BountyStatus::PendingBlockchain],
            BountyPatch {
                status: Some(BountyStatus::Open),
                lock_tx_hash: Some(lock_ref),
                ..Default::default()
            },
            "lock funds",
        )
        .await
    }

    /// Retry the funds lock for a bounty stuck in `pending_blockchain`.
    pub async fn retry_lock(&self, actor: &User, bounty_id: &str) -> Result<Bounty> {
        let bounty = self.require_bounty(bounty_id).await?;
        if bounty.creator_id != actor.id {
            return Err(Error::Unauthorized("only the creator can retry the lock"));
        }
        if bounty.status != BountyStatus::PendingBlockchain {
            return Err(Error::InvalidState {
                attempted: "lock funds",
                current: bounty.status,
            });
        }
        self.lock_funds(&bounty, actor).await
    }

    /// `in_progress -> under_review`: the assignee submits their PR.
    pub async fn submit_work(&self, actor: &User, bounty_id: &str, pr_url: &str) -> Result<Bounty> {
        let bounty = self.require_bounty(bounty_id).await?;
        if bounty.assignee_id.as_deref() != Some(actor.id.as_str()) {
            return Err(Error::Unauthorized("only the assignee can submit work"));
        }
        let parsed = parse_pr_url(pr_url)?;
        if parsed.repo != bounty.repo {
            return Err(Error::Validation {
                field: "pr_url",
                reason: format!(
                    "pull request belongs to {}, bounty repository is {}",
                    parsed.repo, bounty.repo
                ),
            });
        }

        self.transition(
            bounty_id,
            &[BountyStatus::InProgress],
            BountyPatch {
                status: Some(BountyStatus::UnderReview),
                pr: Some(PrRef {
                    url: pr_url.to_string(),
                    number: parsed.number,
                    submitted_at: Utc::now(),
                }),
                ..Default::default()
            },
            "submit work",
        )
        .await
    }

    /// `under_review -> in_progress`: the creator asks for changes.
    pub async fn request_changes(
        &self,
        actor: &User,
        bounty_id: &str,
        feedback: &str,
    ) -> Result<Bounty> {
        let bounty = self.require_bounty(bounty_id).await?;
        if bounty.creator_id != actor.id {
            return Err(Error::Unauthorized("only the creator can request changes"));
        }
        if feedback.trim().is_empty() {
            return Err(Error::Validation {
                field: "feedback",
                reason: "feedback text is required".into(),
            });
        }

        let mut notes = bounty.notes.clone();
        notes.push(format!("changes requested: {feedback}"));

        let updated = self
            .transition(
                bounty_id,
                &[BountyStatus::UnderReview],
                BountyPatch {
                    status: Some(BountyStatus::InProgress),
                    notes: Some(notes),
                    ..Default::default()
                },
                "request changes",
            )
            .await?;

        // notify the assignee on the issue; the transition itself already happened
        if let (Ok(token), Some(issue)) = (Self::creator_token(actor), &updated.issue) {
            let text = format!("Changes requested on the submitted PR:\n\n> {feedback}");
            if let Err(e) = self
                .tracker
                .add_comment(token, &updated.repo, issue.number, &text)
                .await
            {
                warn!("could not notify assignee of requested changes: {e}");
            }
        }

        Ok(updated)
    }

    /// `under_review -> completed -> paid`: the only path that moves money.
    ///
    /// Guards run first with no side effects. The `under_review ->
    /// completed` CAS decides a single winner before the payment is
    /// dispatched; a payment failure reverts to `under_review` with a note
    /// so the bounty is never stranded in `completed` without a recorded
    /// transaction.
    pub async fn approve(&self, actor: &User, bounty_id: &str) -> Result<Bounty> {
        let bounty = self.require_bounty(bounty_id).await?;
        if bounty.creator_id != actor.id {
            return Err(Error::Unauthorized("only the creator can approve"));
        }
        if bounty.status != BountyStatus::UnderReview {
            return Err(Error::InvalidState {
                attempted: "approve",
                current: bounty.status,
            });
        }
        if bounty.pr.is_none() {
            return Err(Error::Validation {
                field: "pr",
                reason: "no pull request on record".into(),
            });
        }
        let assignee_id = bounty.assignee_id.clone().ok_or_else(|| Error::Validation {
            field: "assignee",
            reason: "bounty has no assignee".into(),
        })?;
        let assignee = self.require_user(&assignee_id).await?;

        if !self
            .ledger
            .account_exists(&assignee.wallet_address)
            .await?
        {
            return Err(Error::RecipientUnresolvable(assignee.wallet_address));
        }
        let balance = self.ledger.balance_stroops(&self.escrow.public).await?;
        if balance < bounty.reward_stroops {
            return Err(Error::InsufficientFunds {
                balance_stroops: balance,
                reward_stroops: bounty.reward_stroops,
            });
        }

        // the CAS decides the winner; everyone else sees InvalidState
        let completed = self
            .transition(
                bounty_id,
                &[BountyStatus::UnderReview],
                BountyPatch {
                    status: Some(BountyStatus::Completed),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
                "approve",
            )
            .await?;

        let memo = payment_memo(&completed.id);
        let receipt = match self
            .ledger
            .send_payment(
                &self.escrow.secret,
                &assignee.wallet_address,
                completed.reward_stroops,
                &memo,
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                let mut notes = completed.notes.clone();
                notes.push(format!("payment failed: {e}"));
                self.transition(
                    bounty_id,
                    &[BountyStatus::Completed],
                    BountyPatch {
                        status: Some(BountyStatus::UnderReview),
                        notes: Some(notes),
                        ..Default::default()
                    },
                    "revert failed payment",
                )
                .await?;
                return Err(e);
            },
        };

        let recorded = self
            .store
            .insert_transaction(Transaction {
                id: new_id(),
                kind: TransactionKind::PaymentRelease,
                bounty_id: bounty_id.to_string(),
                from_user_id: completed.creator_id.clone(),
                to_user_id: assignee.id.clone(),
                amount_stroops: completed.reward_stroops,
                tx_hash: receipt.tx_hash.clone(),
                ledger_seq: receipt.ledger_seq,
                status: TransactionStatus::Confirmed,
                description: format!("bounty payout for {}", completed.title),
                created_at: Utc::now(),
            })
            .await?;

        let paid = self
            .transition(
                bounty_id,
                &[BountyStatus::Completed],
                BountyPatch {
                    status: Some(BountyStatus::Paid),
                    release_tx_hash: Some(receipt.tx_hash.clone()),
                    ..Default::default()
                },
                "settle payment",
            )
            .await?;

        // stats apply once per unique tx hash; a replayed hash skips them
        if recorded {
            self.store
                .apply_payout_stats(&assignee.id, completed.reward_stroops)
                .await?;
            self.store
                .update_project_counters(&paid.project_id, 0, -1, completed.reward_stroops)
                .await?;
        }

        if let (Ok(token), Some(issue)) = (Self::creator_token(actor), &paid.issue) {
            let comment = format!(
                "Bounty paid out: {} stroops (tx `{}`)",
                paid.reward_stroops, receipt.tx_hash
            );
            if let Err(e) = self
                .tracker
                .close_issue(token, &paid.repo, issue.number, Some(&comment))
                .await
            {
                warn!("could not close upstream issue for paid bounty: {e}");
            }
        }

        Ok(paid)
    }

    /// Creator cancels from any pre-completion state.
    pub async fn cancel(&self, actor: &User, bounty_id: &str) -> Result<Bounty> {
        let bounty = self.require_bounty(bounty_id).await?;
        if bounty.creator_id != actor.id {
            return Err(Error::Unauthorized("only the creator can cancel"));
        }

        let cancelled = self
            .transition(
                bounty_id,
                &[
                    BountyStatus::PendingGithub,
                    BountyStatus::PendingBlockchain,
                    BountyStatus::Open,
                    BountyStatus::InProgress,
                    BountyStatus::UnderReview,
                ],
                BountyPatch {
                    status: Some(BountyStatus::Cancelled),
                    ..Default::default()
                },
                "cancel",
            )
            .await?;

        self.store
            .update_project_counters(&cancelled.project_id, 0, -1, 0)
            .await?;

        if let (Ok(token), Some(issue)) = (Self::creator_token(actor), &cancelled.issue) {
            if let Err(e) = self
                .tracker
                .close_issue(token, &cancelled.repo, issue.number, Some("Bounty cancelled."))
                .await
            {
                warn!("could not close upstream issue for cancelled bounty: {e}");
            }
        }

        Ok(cancelled)
    }

    /// Administrative close, allowed from any state except `completed`:
    /// a completed bounty has a payment in flight and must settle (or
    /// revert) before anything else touches it.
    pub async fn close(&self, actor: &User, bounty_id: &str) -> Result<Bounty> {
        let bounty = self.require_bounty(bounty_id).await?;
        if bounty.creator_id != actor.id && !actor.role.can_maintain() {
            return Err(Error::Unauthorized("only maintainers can close bounties"));
        }
        if bounty.status == BountyStatus::Completed {
            return Err(Error::InvalidState {
                attempted: "close",
                current: bounty.status,
            });
        }

        let was_active = bounty.status.is_pre_completion();
        let closed = self
            .transition(
                bounty_id,
                &[bounty.status],
                BountyPatch {
                    status: Some(BountyStatus::Closed),
                    ..Default::default()
                },
                "close",
            )
            .await?;

        if was_active {
            self.store
                .update_project_counters(&closed.project_id, 0, -1, 0)
                .await?;
        }

        Ok(closed)
    }
}

/// Memo tying the ledger payment back to the bounty, capped to the ledger's
/// 28-byte text memo.
fn payment_memo(bounty_id: &str) -> String {
    let tail = &bounty_id[..bounty_id.len().min(20)];
    format!("bounty:{tail}")
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::{
        github::MockTracker,
        models::{Project, ProjectCounters, ProjectSettings, RepoRef, Role, UserStats},
        stellar::MockLedger,
        store::MemStore,
    };

    pub const ESCROW_PUBLIC: &str = "GESCROW";
    pub const ESCROW_SECRET: &str = "SESCROW";
    pub const XLM: i64 = MIN_REWARD_STROOPS;

    pub struct World {
        pub engine: Engine,
        pub store: Arc<MemStore>,
        pub tracker: Arc<MockTracker>,
        pub ledger: Arc<MockLedger>,
        pub creator: User,
        pub contributor: User,
        pub project: Project,
    }

    pub fn make_user(name: &str, role: Role, wallet: &str) -> User {
        User {
            id: format!("user-{name}"),
            wallet_address: wallet.to_string(),
            display_name: name.to_string(),
            github_username: Some(name.to_string()),
            github_token: Some(format!("token-{name}")),
            role,
            stats: UserStats::default(),
            created_at: Utc::now(),
        }
    }

    /// Creator wallet holds 1000 XLM, escrow 200 XLM, contributor wallet
    /// exists with 0.
    pub async fn world_with(tracker: MockTracker, ledger: MockLedger) -> World {
        let store = Arc::new(MemStore::new());
        let tracker = Arc::new(tracker);
        let ledger = Arc::new(ledger);
        let engine = Engine::new(
            store.clone(),
            tracker.clone(),
            ledger.clone(),
            EscrowKeys {
                public: ESCROW_PUBLIC.into(),
                secret: ESCROW_SECRET.into(),
            },
        );

        let creator = store
            .create_user(make_user("maintainer", Role::Maintainer, "GCREATOR"))
            .await
            .unwrap();
        let contributor = store
            .create_user(make_user("alice", Role::Contributor, "GALICE"))
            .await
            .unwrap();
        let project = store
            .create_project(Project {
                id: "proj-1".into(),
                maintainer_id: creator.id.clone(),
                repo: RepoRef {
                    owner: "acme".into(),
                    name: "widgets".into(),
                },
                counters: ProjectCounters::default(),
                settings: ProjectSettings::default(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        World {
            engine,
            store,
            tracker,
            ledger,
            creator,
            contributor,
            project,
        }
    }

    pub async fn world() -> World {
        let ledger = MockLedger::new()
            .with_account("GCREATOR", 1000 * XLM)
            .with_account("GALICE", 0)
            .with_account(ESCROW_PUBLIC, 200 * XLM);
        world_with(MockTracker::new(), ledger).await
    }

    pub fn create_req(project_id: &str, reward_stroops: i64) -> CreateBounty {
        CreateBounty {
            project_id: project_id.to_string(),
            title: "Fix the flux capacitor".into(),
            description: "It fluxes when it should capacitate".into(),
            reward_stroops,
            difficulty: Difficulty::Medium,
            skills: vec!["Go".into()],
            deadline: None,
            legacy_contract_id: None,
        }
    }

    /// Drive a fresh bounty to `under_review` with the contributor assigned.
    pub async fn bounty_under_review(w: &World, reward_stroops: i64) -> Bounty {
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, reward_stroops))
            .await
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::Open);

        let application = w
            .engine
            .submit_application(
                &w.contributor,
                crate::review::SubmitApplication {
                    bounty_id: bounty.id.clone(),
                    proposal: "I will fix it properly, with tests and docs. ".repeat(3),
                    estimated_days: 7,
                    wallet_address: w.contributor.wallet_address.clone(),
                    github_username: "alice".into(),
                    portfolio_url: None,
                },
            )
            .await
            .unwrap();

        w.engine
            .review_application(&w.creator, &application.id, crate::review::ReviewAction::Accept, None)
            .await
            .unwrap();

        w.engine
            .submit_work(
                &w.contributor,
                &bounty.id,
                "https://github.com/acme/widgets/pull/5",
            )
            .await
            .unwrap()
    }
}
