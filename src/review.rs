//! Application review flow.
//!
//! Sub-state-machine for contributor applications
//! (`pending_approval -> accepted | rejected | withdrawn`) that feeds the
//! lifecycle engine's assignment transition. Accepting one application
//! rejects every pending sibling in the same logical store operation.

use chrono::Utc;
use log::warn;
use serde::Deserialize;

use crate::{
    engine::Engine,
    error::{Error, Result},
    models::{new_id, Application, ApplicationStatus, Bounty, User},
    store::ApplicationPatch,
};

pub const MIN_PROPOSAL_CHARS: usize = 50;
pub const MAX_PROPOSAL_CHARS: usize = 2000;
pub const MIN_ESTIMATED_DAYS: u32 = 1;
pub const MAX_ESTIMATED_DAYS: u32 = 365;

#[derive(Debug, Deserialize)]
pub struct SubmitApplication {
    pub bounty_id: String,
    pub proposal: String,
    pub estimated_days: u32,
    pub wallet_address: String,
    pub github_username: String,
    pub portfolio_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Accept,
    Reject,
}

impl Engine {
    /// Submit an application for an open bounty.
    pub async fn submit_application(
        &self,
        actor: &User,
        req: SubmitApplication,
    ) -> Result<Application> {
        let proposal_chars = req.proposal.chars().count();
        if !(MIN_PROPOSAL_CHARS..=MAX_PROPOSAL_CHARS).contains(&proposal_chars) {
            return Err(Error::Validation {
                field: "proposal",
                reason: format!(
                    "proposal must be {MIN_PROPOSAL_CHARS}-{MAX_PROPOSAL_CHARS} characters, got {proposal_chars}"
                ),
            });
        }
        if !(MIN_ESTIMATED_DAYS..=MAX_ESTIMATED_DAYS).contains(&req.estimated_days) {
            return Err(Error::Validation {
                field: "estimated_days",
                reason: format!(
                    "estimate must be {MIN_ESTIMATED_DAYS}-{MAX_ESTIMATED_DAYS} days, got {}",
                    req.estimated_days
                ),
            });
        }
        if req.wallet_address.trim().is_empty() {
            return Err(Error::Validation {
                field: "wallet_address",
                reason: "payout wallet is required".into(),
            });
        }

        let bounty = self.require_bounty(&req.bounty_id).await?;
        if bounty.creator_id == actor.id {
            return Err(Error::SelfApplication);
        }
        if !bounty.status.accepts_applications() {
            return Err(Error::InvalidState {
                attempted: "apply",
                current: bounty.status,
            });
        }

        // the unique (bounty, applicant) index turns a concurrent duplicate
        // into DuplicateApplication rather than a second row
        self.store()
            .insert_application(Application {
                id: new_id(),
                bounty_id: bounty.id,
                applicant_id: actor.id.clone(),
                proposal: req.proposal,
                estimated_days: req.estimated_days,
                wallet_address: req.wallet_address,
                github_username: req.github_username,
                portfolio_url: req.portfolio_url,
                review_comment: None,
                reviewed_at: None,
                status: ApplicationStatus::PendingApproval,
                created_at: Utc::now(),
            })
            .await
    }

    /// Accept or reject a pending application. Accepting drives the
    /// engine's `open -> in_progress` assignment and sweeps the pending
    /// siblings to `rejected`.
    pub async fn review_application(
        &self,
        actor: &User,
        application_id: &str,
        action: ReviewAction,
        comment: Option<String>,
    ) -> Result<Application> {
        let application = self.require_application(application_id).await?;
        let bounty = self.require_bounty(&application.bounty_id).await?;
        if bounty.creator_id != actor.id {
            return Err(Error::Unauthorized("only the bounty creator can review"));
        }
        if application.status != ApplicationStatus::PendingApproval {
            return Err(Error::AlreadyReviewed(application.status));
        }

        match action {
            ReviewAction::Reject => {
                let rejected = self
                    .store()
                    .cas_application(
                        application_id,
                        ApplicationStatus::PendingApproval,
                        ApplicationPatch {
                            status: Some(ApplicationStatus::Rejected),
                            review_comment: comment,
                            reviewed_at: Some(Utc::now()),
                        },
                    )
                    .await?;
                match rejected {
                    Some(application) => Ok(application),
                    None => {
                        let current = self.require_application(application_id).await?.status;
                        Err(Error::AlreadyReviewed(current))
                    },
                }
            },
            ReviewAction::Accept => {
                let assigned = self
                    .store()
                    .accept_application(
                        &bounty.id,
                        application_id,
                        &application.applicant_id,
                        comment,
                        Utc::now(),
                    )
                    .await?;
                let Some(assigned) = assigned else {
                    let current = self.require_bounty(&bounty.id).await?.status;
                    return Err(Error::InvalidState {
                        attempted: "accept application",
                        current,
                    });
                };

                self.announce_assignment(actor, &assigned, &application).await;

                self.require_application(application_id).await
            },
        }
    }

    /// Applicant withdraws their own pending application.
    pub async fn withdraw_application(
        &self,
        actor: &User,
        application_id: &str,
    ) -> Result<Application> {
        let application = self.require_application(application_id).await?;
        if application.applicant_id != actor.id {
            return Err(Error::Unauthorized("only the applicant can withdraw"));
        }
        if application.status != ApplicationStatus::PendingApproval {
            return Err(Error::NotPending(application.status));
        }

        let withdrawn = self
            .store()
            .cas_application(
                application_id,
                ApplicationStatus::PendingApproval,
                ApplicationPatch {
                    status: Some(ApplicationStatus::Withdrawn),
                    review_comment: None,
                    reviewed_at: Some(Utc::now()),
                },
            )
            .await?;
        match withdrawn {
            Some(application) => Ok(application),
            None => {
                let current = self.require_application(application_id).await?.status;
                Err(Error::NotPending(current))
            },
        }
    }

    pub async fn require_application(&self, id: &str) -> Result<Application> {
        self.store()
            .get_application(id)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "application",
                id: id.to_string(),
            })
    }

    /// Assign + comment on the upstream issue. The state change already
    /// happened; tracker trouble here only gets logged.
    async fn announce_assignment(&self, actor: &User, bounty: &Bounty, application: &Application) {
        let Some(token) = actor.github_token.as_deref() else {
            return;
        };
        let Some(issue) = &bounty.issue else {
            return;
        };
        if let Err(e) = self
            .tracker
            .assign_issue(token, &bounty.repo, issue.number, &application.github_username)
            .await
        {
            warn!("could not assign upstream issue: {e}");
        }
        let text = format!(
            "This bounty has been assigned to @{} (estimated {} days).",
            application.github_username, application.estimated_days
        );
        if let Err(e) = self
            .tracker
            .add_comment(token, &bounty.repo, issue.number, &text)
            .await
        {
            warn!("could not comment on upstream issue: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::testutil::{create_req, make_user, world, XLM},
        models::{BountyStatus, Role},
        store::Store,
    };

    fn submit_req(bounty_id: &str) -> SubmitApplication {
        SubmitApplication {
            bounty_id: bounty_id.to_string(),
            proposal: "I have fixed several of these before and can handle it end to end.".into(),
            estimated_days: 10,
            wallet_address: "GALICE".into(),
            github_username: "alice".into(),
            portfolio_url: None,
        }
    }

    #[tokio::test]
    async fn submit_validates_bounds() {
        let w = world().await;
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();

        let mut req = submit_req(&bounty.id);
        req.proposal = "too short".into();
        let err = w
            .engine
            .submit_application(&w.contributor, req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "proposal", .. }));

        let mut req = submit_req(&bounty.id);
        req.proposal = "x".repeat(2001);
        let err = w
            .engine
            .submit_application(&w.contributor, req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "proposal", .. }));

        let mut req = submit_req(&bounty.id);
        req.estimated_days = 0;
        let err = w
            .engine
            .submit_application(&w.contributor, req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "estimated_days", .. }));

        let mut req = submit_req(&bounty.id);
        req.estimated_days = 366;
        let err = w
            .engine
            .submit_application(&w.contributor, req)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "estimated_days", .. }));
    }

    #[tokio::test]
    async fn creator_cannot_apply_to_own_bounty() {
        let w = world().await;
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();

        let err = w
            .engine
            .submit_application(&w.creator, submit_req(&bounty.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelfApplication));
    }

    #[tokio::test]
    async fn duplicate_application_is_conflict() {
        let w = world().await;
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();

        w.engine
            .submit_application(&w.contributor, submit_req(&bounty.id))
            .await
            .unwrap();
        let err = w
            .engine
            .submit_application(&w.contributor, submit_req(&bounty.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateApplication));
    }

    #[tokio::test]
    async fn cannot_apply_before_bounty_is_open() {
        let ledger = crate::stellar::MockLedger::new()
            .with_account(crate::engine::testutil::ESCROW_PUBLIC, 200 * XLM);
        let w = crate::engine::testutil::world_with(crate::github::MockTracker::new(), ledger).await;

        // unfunded creator wallet leaves the bounty in pending_blockchain
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();
        assert_eq!(bounty.status, BountyStatus::PendingBlockchain);

        let err = w
            .engine
            .submit_application(&w.contributor, submit_req(&bounty.id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                current: BountyStatus::PendingBlockchain,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn accept_assigns_and_sweeps_siblings() {
        let w = world().await;
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();

        let bob = w
            .store
            .create_user(make_user("bob", Role::Contributor, "GBOB"))
            .await
            .unwrap();

        let winner = w
            .engine
            .submit_application(&w.contributor, submit_req(&bounty.id))
            .await
            .unwrap();
        let loser = w
            .engine
            .submit_application(&bob, submit_req(&bounty.id))
            .await
            .unwrap();

        let accepted = w
            .engine
            .review_application(&w.creator, &winner.id, ReviewAction::Accept, Some("welcome".into()))
            .await
            .unwrap();
        assert_eq!(accepted.status, ApplicationStatus::Accepted);

        let bounty = w.store.get_bounty(&bounty.id).await.unwrap().unwrap();
        assert_eq!(bounty.status, BountyStatus::InProgress);
        assert_eq!(bounty.assignee_id.as_deref(), Some(w.contributor.id.as_str()));
        assert!(bounty.assigned_at.is_some());

        let loser = w.store.get_application(&loser.id).await.unwrap().unwrap();
        assert_eq!(loser.status, ApplicationStatus::Rejected);

        // no application left dangling in pending_approval
        let apps = w.store.list_applications(&bounty.id).await.unwrap();
        assert!(apps
            .iter()
            .all(|a| a.status != ApplicationStatus::PendingApproval));

        // upstream issue was assigned
        let assigned = w.tracker.assigned.lock().unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].1, "alice");
    }

    #[tokio::test]
    async fn review_guards() {
        let w = world().await;
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();
        let application = w
            .engine
            .submit_application(&w.contributor, submit_req(&bounty.id))
            .await
            .unwrap();

        // only the creator reviews
        let err = w
            .engine
            .review_application(&w.contributor, &application.id, ReviewAction::Accept, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        // a reviewed application stays reviewed
        w.engine
            .review_application(&w.creator, &application.id, ReviewAction::Reject, Some("no".into()))
            .await
            .unwrap();
        let err = w
            .engine
            .review_application(&w.creator, &application.id, ReviewAction::Accept, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyReviewed(ApplicationStatus::Rejected)));
    }

    #[tokio::test]
    async fn withdraw_rules() {
        let w = world().await;
        let bounty = w
            .engine
            .create_bounty(&w.creator, create_req(&w.project.id, 10 * XLM))
            .await
            .unwrap();
        let application = w
            .engine
            .submit_application(&w.contributor, submit_req(&bounty.id))
            .await
            .unwrap();

        // only the applicant may withdraw
        let err = w
            .engine
            .withdraw_application(&w.creator, &application.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let withdrawn = w
            .engine
            .withdraw_application(&w.contributor, &application.id)
            .await
            .unwrap();
        assert_eq!(withdrawn.status, ApplicationStatus::Withdrawn);

        // withdrawn is terminal
        let err = w
            .engine
            .withdraw_application(&w.contributor, &application.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPending(ApplicationStatus::Withdrawn)));
    }
}
