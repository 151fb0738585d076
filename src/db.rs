//! SurrealDB-backed store.
//!
//! Records keep their business id in a `uid` field (surreal reserves `id`
//! for the record id); every read projects `uid` back onto `id` before
//! deserializing into the model types. State advances are conditional
//! updates (`WHERE uid = $id AND status IN $expected`) whose returned row
//! count decides who won a race.

use chrono::{DateTime, Utc};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use surrealdb::{
    engine::remote::ws::{Client, Ws},
    opt::auth::Root,
    Surreal,
};

use crate::{
    error::{Error, Result},
    models::{
        Application, ApplicationStatus, Bounty, BountyStatus, Project, RepoRef, Transaction, User,
    },
    store::{ApplicationPatch, BountyPatch, Store},
};

pub type DBConnection = Surreal<Client>;

pub async fn connect(
    connection_string: &str,
    username: &str,
    password: &str,
    namespace: &str,
    database: &str,
) -> surrealdb::Result<DBConnection> {
    let db = Surreal::new::<Ws>(connection_string).await?;

    db.signin(Root { username, password }).await?;

    db.use_ns(namespace).use_db(database).await?;

    info!("Successfully connected to database");

    Ok(db)
}

/// Define the unique indexes the data model relies on.
pub async fn migrate(db: &DBConnection) -> surrealdb::Result<()> {
    db.query(
        "
        DEFINE INDEX user_uid ON TABLE user COLUMNS uid UNIQUE;
        DEFINE INDEX user_wallet ON TABLE user COLUMNS wallet_address UNIQUE;
        DEFINE INDEX project_uid ON TABLE project COLUMNS uid UNIQUE;
        DEFINE INDEX project_repo ON TABLE project COLUMNS repo.owner, repo.name UNIQUE;
        DEFINE INDEX bounty_uid ON TABLE bounty COLUMNS uid UNIQUE;
        DEFINE INDEX application_uid ON TABLE application COLUMNS uid UNIQUE;
        DEFINE INDEX application_pair ON TABLE application COLUMNS bounty_id, applicant_id UNIQUE;
        DEFINE INDEX ledger_tx_uid ON TABLE ledger_tx COLUMNS uid UNIQUE;
        DEFINE INDEX ledger_tx_hash ON TABLE ledger_tx COLUMNS tx_hash UNIQUE;
        ",
    )
    .await?;
    info!("Database indexes defined");
    Ok(())
}

pub struct SurrealStore {
    db: DBConnection,
}

impl SurrealStore {
    pub fn new(db: DBConnection) -> SurrealStore {
        SurrealStore { db }
    }
}

fn internal(e: surrealdb::Error) -> Error {
    Error::Internal(e.into())
}

fn is_unique_violation(e: &surrealdb::Error) -> bool {
    e.to_string().contains("already contains")
}

/// Serialize a model for storage, moving `id` into the `uid` field.
fn content<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    let mut v = serde_json::to_value(value).map_err(|e| Error::Internal(e.into()))?;
    if let Some(obj) = v.as_object_mut() {
        if let Some(id) = obj.remove("id") {
            obj.insert("uid".into(), id);
        }
    }
    Ok(v)
}

/// Deserialize rows read back with `SELECT * OMIT id`, restoring `uid` to `id`.
fn from_rows<T: DeserializeOwned>(rows: Vec<serde_json::Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|mut row| {
            if let Some(obj) = row.as_object_mut() {
                if let Some(id) = obj.remove("uid") {
                    obj.insert("id".into(), id);
                }
            }
            serde_json::from_value(row).map_err(|e| Error::Internal(e.into()))
        })
        .collect()
}

impl SurrealStore {
    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &'static str,
        id: &str,
    ) -> Result<Option<T>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT * OMIT id FROM {table} WHERE uid = $uid LIMIT 1"
            ))
            .bind(("uid", id))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        Ok(from_rows(rows)?.into_iter().next())
    }

    async fn create<T: Serialize>(&self, table: &'static str, value: &T) -> Result<()> {
        let data = content(value)?;
        self.db
            .query(format!("CREATE {table} CONTENT $data RETURN NONE"))
            .bind(("data", data))
            .await
            .map_err(internal)?
            .check()
            .map_err(internal)?;
        Ok(())
    }
}

#[axum::async_trait]
impl Store for SurrealStore {
    async fn create_user(&self, user: User) -> Result<User> {
        let data = content(&user)?;
        let res = self
            .db
            .query("CREATE user CONTENT $data RETURN NONE")
            .bind(("data", data))
            .await
            .map_err(internal)?
            .check();
        match res {
            Ok(_) => Ok(user),
            Err(e) if is_unique_violation(&e) => Err(Error::Validation {
                field: "wallet_address",
                reason: "already registered".into(),
            }),
            Err(e) => Err(internal(e)),
        }
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.select_one("user", id).await
    }

    async fn get_user_by_wallet(&self, wallet: &str) -> Result<Option<User>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM user WHERE wallet_address = $wallet LIMIT 1")
            .bind(("wallet", wallet))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        Ok(from_rows(rows)?.into_iter().next())
    }

    async fn get_user_by_github(&self, username: &str) -> Result<Option<User>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM user WHERE github_username = $name LIMIT 1")
            .bind(("name", username))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        Ok(from_rows(rows)?.into_iter().next())
    }

    async fn update_user_token(&self, id: &str, token: &str) -> Result<()> {
        self.db
            .query("UPDATE user SET github_token = $token WHERE uid = $uid RETURN NONE")
            .bind(("token", token))
            .bind(("uid", id))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn bump_bounties_created(&self, user_id: &str) -> Result<()> {
        self.db
            .query("UPDATE user SET stats.bounties_created += 1 WHERE uid = $uid RETURN NONE")
            .bind(("uid", user_id))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn apply_payout_stats(&self, assignee_id: &str, amount_stroops: i64) -> Result<()> {
        self.db
            .query(
                "UPDATE user SET stats.bounties_completed += 1, \
                 stats.total_earned_stroops += $amount WHERE uid = $uid RETURN NONE",
            )
            .bind(("amount", amount_stroops))
            .bind(("uid", assignee_id))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn create_project(&self, project: Project) -> Result<Project> {
        let data = content(&project)?;
        let res = self
            .db
            .query("CREATE project CONTENT $data RETURN NONE")
            .bind(("data", data))
            .await
            .map_err(internal)?
            .check();
        match res {
            Ok(_) => Ok(project),
            Err(e) if is_unique_violation(&e) => Err(Error::Validation {
                field: "repo",
                reason: format!("project for {} already exists", project.repo),
            }),
            Err(e) => Err(internal(e)),
        }
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.select_one("project", id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM project")
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        from_rows(rows)
    }

    async fn update_project_counters(
        &self,
        id: &str,
        delta_total: i64,
        delta_active: i64,
        delta_paid_stroops: i64,
    ) -> Result<()> {
        self.db
            .query(
                "UPDATE project SET counters.total_bounties += $dt, \
                 counters.active_bounties += $da, \
                 counters.total_paid_stroops += $dp WHERE uid = $uid RETURN NONE",
            )
            .bind(("dt", delta_total))
            .bind(("da", delta_active))
            .bind(("dp", delta_paid_stroops))
            .bind(("uid", id))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        let Some(project) = self.get_project(id).await? else {
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
        // condition re-checked so a concurrent bounty creation can't slip in
        self.db
            .query(
                "DELETE project WHERE uid = $uid AND counters.active_bounties = 0 RETURN NONE",
            )
            .bind(("uid", id))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn insert_bounty(&self, bounty: Bounty) -> Result<Bounty> {
        self.create("bounty", &bounty).await?;
        Ok(bounty)
    }

    async fn get_bounty(&self, id: &str) -> Result<Option<Bounty>> {
        self.select_one("bounty", id).await
    }

    async fn list_bounties(
        &self,
        status: Option<BountyStatus>,
        project_id: Option<&str>,
    ) -> Result<Vec<Bounty>> {
        let mut res = self
            .db
            .query(
                "SELECT * OMIT id FROM bounty \
                 WHERE ($status = NONE OR $status = NULL OR status = $status) \
                 AND ($project = NONE OR $project = NULL OR project_id = $project)",
            )
            .bind(("status", status))
            .bind(("project", project_id))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        from_rows(rows)
    }

    async fn delete_bounty(&self, id: &str) -> Result<()> {
        self.db
            .query("DELETE bounty WHERE uid = $uid RETURN NONE")
            .bind(("uid", id))
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn find_bounty_by_issue(&self, repo: &RepoRef, number: u64) -> Result<Option<Bounty>> {
        let mut res = self
            .db
            .query(
                "SELECT * OMIT id FROM bounty \
                 WHERE repo.owner = $owner AND repo.name = $name \
                 AND issue.number = $number LIMIT 1",
            )
            .bind(("owner", &repo.owner))
            .bind(("name", &repo.name))
            .bind(("number", number))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        Ok(from_rows(rows)?.into_iter().next())
    }

    async fn cas_bounty(
        &self,
        id: &str,
        expected: &[BountyStatus],
        patch: BountyPatch,
    ) -> Result<Option<Bounty>> {
        let patch_value = serde_json::to_value(&patch).map_err(|e| Error::Internal(e.into()))?;
        let mut res = self
            .db
            .query(
                "UPDATE bounty MERGE $patch \
                 WHERE uid = $uid AND status IN $expected \
                 AND ($release = NONE OR $release = NULL OR release_tx_hash = NONE) \
                 RETURN uid",
            )
            .bind(("patch", patch_value))
            .bind(("uid", id))
            .bind(("expected", expected))
            .bind(("release", &patch.release_tx_hash))
            .await
            .map_err(internal)?;
        let won: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        if won.is_empty() {
            // distinguish a lost race, an immutability violation, and a
            // missing record
            return match self.get_bounty(id).await? {
                Some(current) if !expected.contains(&current.status) => Ok(None),
                Some(current)
                    if patch.release_tx_hash.is_some() && current.release_tx_hash.is_some() =>
                {
                    Err(Error::Internal(anyhow::anyhow!(
                        "release_tx_hash is immutable once set"
                    )))
                },
                Some(_) => Ok(None),
                None => Err(Error::NotFound {
                    kind: "bounty",
                    id: id.to_string(),
                }),
            };
        }
        self.get_bounty(id).await
    }

    async fn insert_application(&self, application: Application) -> Result<Application> {
        let data = content(&application)?;
        let res = self
            .db
            .query("CREATE application CONTENT $data RETURN NONE")
            .bind(("data", data))
            .await
            .map_err(internal)?
            .check();
        match res {
            Ok(_) => Ok(application),
            Err(e) if is_unique_violation(&e) => Err(Error::DuplicateApplication),
            Err(e) => Err(internal(e)),
        }
    }

    async fn get_application(&self, id: &str) -> Result<Option<Application>> {
        self.select_one("application", id).await
    }

    async fn list_applications(&self, bounty_id: &str) -> Result<Vec<Application>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM application WHERE bounty_id = $bounty")
            .bind(("bounty", bounty_id))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        from_rows(rows)
    }

    async fn cas_application(
        &self,
        id: &str,
        expected: ApplicationStatus,
        patch: ApplicationPatch,
    ) -> Result<Option<Application>> {
        let patch_value = serde_json::to_value(&patch).map_err(|e| Error::Internal(e.into()))?;
        let mut res = self
            .db
            .query(
                "UPDATE application MERGE $patch \
                 WHERE uid = $uid AND status = $expected RETURN uid",
            )
            .bind(("patch", patch_value))
            .bind(("uid", id))
            .bind(("expected", expected))
            .await
            .map_err(internal)?;
        let won: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        if won.is_empty() {
            return match self.get_application(id).await? {
                Some(_) => Ok(None),
                None => Err(Error::NotFound {
                    kind: "application",
                    id: id.to_string(),
                }),
            };
        }
        self.get_application(id).await
    }

    async fn accept_application(
        &self,
        bounty_id: &str,
        application_id: &str,
        applicant_id: &str,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Bounty>> {
        // accept the application first; losing the bounty CAS below reverts it
        let accepted = self
            .cas_application(
                application_id,
                ApplicationStatus::PendingApproval,
                ApplicationPatch {
                    status: Some(ApplicationStatus::Accepted),
                    review_comment: comment,
                    reviewed_at: Some(now),
                },
            )
            .await?;
        if accepted.is_none() {
            let current = self
                .get_application(application_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    kind: "application",
                    id: application_id.to_string(),
                })?;
            return Err(Error::AlreadyReviewed(current.status));
        }

        let won = self
            .cas_bounty(
                bounty_id,
                &[BountyStatus::Open],
                BountyPatch {
                    status: Some(BountyStatus::InProgress),
                    assignee_id: Some(applicant_id.to_string()),
                    assigned_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        if won.is_none() {
            // compensate: put the application back so the record stays reviewable
            self.db
                .query(
                    "UPDATE application SET status = $pending, review_comment = NONE, \
                     reviewed_at = NONE WHERE uid = $uid RETURN NONE",
                )
                .bind(("pending", ApplicationStatus::PendingApproval))
                .bind(("uid", application_id))
                .await
                .map_err(internal)?;
            return Ok(None);
        }

        self.db
            .query(
                "UPDATE application SET status = $rejected, \
                 review_comment = 'another application was accepted', \
                 reviewed_at = $now \
                 WHERE bounty_id = $bounty AND status = $pending AND uid != $winner \
                 RETURN NONE",
            )
            .bind(("rejected", ApplicationStatus::Rejected))
            .bind(("pending", ApplicationStatus::PendingApproval))
            .bind(("now", now))
            .bind(("bounty", bounty_id))
            .bind(("winner", application_id))
            .await
            .map_err(internal)?;

        Ok(won)
    }

    async fn insert_transaction(&self, tx: Transaction) -> Result<bool> {
        let data = content(&tx)?;
        let res = self
            .db
            .query("CREATE ledger_tx CONTENT $data RETURN NONE")
            .bind(("data", data))
            .await
            .map_err(internal)?
            .check();
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(internal(e)),
        }
    }

    async fn list_transactions(&self, bounty_id: &str) -> Result<Vec<Transaction>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM ledger_tx WHERE bounty_id = $bounty")
            .bind(("bounty", bounty_id))
            .await
            .map_err(internal)?;
        let rows: Vec<serde_json::Value> = res.take(0).map_err(internal)?;
        from_rows(rows)
    }
}
