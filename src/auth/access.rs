//! Access decisions.
//!
//! Every transport funnels through [`AccessControl::decide`]. The reason
//! carried by a [`Decision::Deny`] is for the server log only; callers turn
//! any denial into the same opaque message a missing repository gets.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{AuthorizedKey, Database, Repository, User};
use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Access mode
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum AccessMode {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::None => "none",
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        };
        f.write_str(s)
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AccessMode::None),
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            other => Err(format!("unknown access mode '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Principals and outcomes
// ---------------------------------------------------------------------------

/// Who is asking.
#[derive(Debug, Clone)]
pub enum Principal {
    Anonymous,
    User(User),
    /// A key bound to a single repository rather than an account.
    DeployKey(AuthorizedKey),
}

impl Principal {
    /// Label for log lines.
    pub fn describe(&self) -> String {
        match self {
            Principal::Anonymous => "anonymous".to_string(),
            Principal::User(user) => format!("user:{}", user.name),
            Principal::DeployKey(key) => format!("deploy-key:{}", key.id),
        }
    }

    /// The account pushes are attributed to, if any.
    pub fn user(&self) -> Option<&User> {
        match self {
            Principal::User(user) => Some(user),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("mirror repositories are read-only")]
    MirrorReadOnly,

    #[error("anonymous access requires a public repository and no forced sign-in")]
    SignInRequired,

    #[error("deploy key {key_id} is not scoped to repository {repo_id}")]
    DeployKeyScope { key_id: i64, repo_id: i64 },

    #[error("deploy key allows {have}, {want} requested")]
    DeployKeyMode { have: AccessMode, want: AccessMode },

    #[error("effective mode {have}, {want} requested")]
    InsufficientMode { have: AccessMode, want: AccessMode },

    #[error("accounts with two-factor authentication must use an access token")]
    TwoFactorRestricted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Convert into a `Result` so callers can use `?`.
    pub fn into_result(self) -> Result<(), GatewayError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(GatewayError::AuthorizationDenied(reason)),
        }
    }
}

// ---------------------------------------------------------------------------
// Membership seam
// ---------------------------------------------------------------------------

/// Nominal access level of a user on a repository, computed by whatever
/// owns teams, organisations and collaborators.
#[async_trait]
pub trait Membership: Send + Sync {
    async fn access_mode(&self, user: &User, repo: &Repository) -> crate::db::Result<AccessMode>;
}

/// Membership read straight from the local tables: the owner writes,
/// collaborators get their stored mode, everyone else reads public
/// repositories.
#[derive(Clone)]
pub struct DbMembership {
    db: Database,
}

impl DbMembership {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Membership for DbMembership {
    async fn access_mode(&self, user: &User, repo: &Repository) -> crate::db::Result<AccessMode> {
        if user.id == repo.owner_id {
            return Ok(AccessMode::Write);
        }
        let collaborator = self.db.repos().collaborator_mode(repo.id, user.id).await?;
        let public = if repo.is_private {
            AccessMode::None
        } else {
            AccessMode::Read
        };
        Ok(collaborator.unwrap_or(AccessMode::None).max(public))
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

pub struct AccessControl<'a> {
    pub db: &'a Database,
    pub membership: &'a dyn Membership,
    pub require_signin_view: bool,
}

impl AccessControl<'_> {
    pub async fn decide(
        &self,
        principal: &Principal,
        repo: &Repository,
        requested: AccessMode,
    ) -> Result<Decision, GatewayError> {
        let decision = self.evaluate(principal, repo, requested).await?;
        match &decision {
            Decision::Allow => debug!(
                principal = %principal.describe(),
                repo_id = repo.id,
                mode = %requested,
                "access allowed"
            ),
            Decision::Deny(reason) => warn!(
                principal = %principal.describe(),
                repo_id = repo.id,
                mode = %requested,
                reason = %reason,
                "access denied"
            ),
        }
        Ok(decision)
    }

    async fn evaluate(
        &self,
        principal: &Principal,
        repo: &Repository,
        requested: AccessMode,
    ) -> Result<Decision, GatewayError> {
        if requested == AccessMode::Write && repo.is_mirror {
            return Ok(Decision::Deny(DenyReason::MirrorReadOnly));
        }

        match principal {
            Principal::Anonymous => {
                if requested <= AccessMode::Read && !repo.is_private && !self.require_signin_view {
                    Ok(Decision::Allow)
                } else {
                    Ok(Decision::Deny(DenyReason::SignInRequired))
                }
            }
            Principal::DeployKey(key) => {
                if key.repo_id != Some(repo.id) {
                    return Ok(Decision::Deny(DenyReason::DeployKeyScope {
                        key_id: key.id,
                        repo_id: repo.id,
                    }));
                }
                if key.mode < requested {
                    return Ok(Decision::Deny(DenyReason::DeployKeyMode {
                        have: key.mode,
                        want: requested,
                    }));
                }
                self.db.keys().touch(key.id).await?;
                Ok(Decision::Allow)
            }
            Principal::User(user) => {
                let have = self.membership.access_mode(user, repo).await?;
                if have >= requested {
                    Ok(Decision::Allow)
                } else {
                    Ok(Decision::Deny(DenyReason::InsufficientMode {
                        have,
                        want: requested,
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Membership that hands every user the same mode.
    struct Fixed(AccessMode);

    #[async_trait]
    impl Membership for Fixed {
        async fn access_mode(&self, _: &User, _: &Repository) -> crate::db::Result<AccessMode> {
            Ok(self.0)
        }
    }

    struct Fixture {
        db: Database,
        alice: User,
        public: Repository,
        private: Repository,
        mirror: Repository,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let alice = db.users().create("alice", "", "pw").await.unwrap();
        let public = db.repos().create(alice.id, "pub", false, false).await.unwrap();
        let private = db.repos().create(alice.id, "priv", true, false).await.unwrap();
        let mirror = db.repos().create(alice.id, "mirror", false, true).await.unwrap();
        Fixture {
            db,
            alice,
            public,
            private,
            mirror,
        }
    }

    fn control<'a>(db: &'a Database, membership: &'a dyn Membership) -> AccessControl<'a> {
        AccessControl {
            db,
            membership,
            require_signin_view: false,
        }
    }

    #[test]
    fn modes_are_ordered() {
        assert!(AccessMode::None < AccessMode::Read);
        assert!(AccessMode::Read < AccessMode::Write);
        assert_eq!(AccessMode::default(), AccessMode::None);
        assert_eq!("WRITE".parse::<AccessMode>().unwrap(), AccessMode::Write);
        assert!("admin".parse::<AccessMode>().is_err());
    }

    #[tokio::test]
    async fn mirror_never_grants_write() {
        let f = fixture().await;
        let membership = Fixed(AccessMode::Write);
        let ac = control(&f.db, &membership);

        let owner = Principal::User(f.alice.clone());
        let decision = ac.decide(&owner, &f.mirror, AccessMode::Write).await.unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::MirrorReadOnly));
        assert!(ac.decide(&owner, &f.mirror, AccessMode::Read).await.unwrap().is_allowed());

        let key = f
            .db
            .keys()
            .add_deploy_key(f.mirror.id, "ci", "ssh-ed25519 AAAAmirror", AccessMode::Write)
            .await
            .unwrap();
        let decision = ac
            .decide(&Principal::DeployKey(key), &f.mirror, AccessMode::Write)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::MirrorReadOnly));
    }

    #[tokio::test]
    async fn deploy_key_is_scoped_to_one_repository() {
        let f = fixture().await;
        let membership = Fixed(AccessMode::Write);
        let ac = control(&f.db, &membership);

        let key = f
            .db
            .keys()
            .add_deploy_key(f.private.id, "ci", "ssh-ed25519 AAAAscope", AccessMode::Write)
            .await
            .unwrap();
        let principal = Principal::DeployKey(key.clone());

        for mode in [AccessMode::Read, AccessMode::Write] {
            let decision = ac.decide(&principal, &f.public, mode).await.unwrap();
            assert_eq!(
                decision,
                Decision::Deny(DenyReason::DeployKeyScope {
                    key_id: key.id,
                    repo_id: f.public.id
                })
            );
        }
        assert!(ac
            .decide(&principal, &f.private, AccessMode::Write)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn deploy_key_mode_is_a_ceiling() {
        let f = fixture().await;
        let membership = Fixed(AccessMode::Write);
        let ac = control(&f.db, &membership);

        let key = f
            .db
            .keys()
            .add_deploy_key(f.private.id, "ro", "ssh-ed25519 AAAAro", AccessMode::Read)
            .await
            .unwrap();
        let before = key.updated_at;
        let principal = Principal::DeployKey(key.clone());

        assert!(ac
            .decide(&principal, &f.private, AccessMode::Read)
            .await
            .unwrap()
            .is_allowed());
        let touched = f.db.keys().get_by_id(key.id).await.unwrap();
        assert!(touched.updated_at >= before);

        let decision = ac.decide(&principal, &f.private, AccessMode::Write).await.unwrap();
        assert!(matches!(decision, Decision::Deny(DenyReason::DeployKeyMode { .. })));
    }

    #[tokio::test]
    async fn anonymous_reads_public_only() {
        let f = fixture().await;
        let membership = Fixed(AccessMode::None);
        let ac = control(&f.db, &membership);

        let anon = Principal::Anonymous;
        assert!(ac.decide(&anon, &f.public, AccessMode::Read).await.unwrap().is_allowed());
        assert!(!ac.decide(&anon, &f.public, AccessMode::Write).await.unwrap().is_allowed());
        assert!(!ac.decide(&anon, &f.private, AccessMode::Read).await.unwrap().is_allowed());

        let forced = AccessControl {
            require_signin_view: true,
            ..control(&f.db, &membership)
        };
        let decision = forced.decide(&anon, &f.public, AccessMode::Read).await.unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::SignInRequired));
    }

    #[tokio::test]
    async fn db_membership_levels() {
        let f = fixture().await;
        let bob = f.db.users().create("bob", "", "pw").await.unwrap();
        let carol = f.db.users().create("carol", "", "pw").await.unwrap();
        f.db.repos()
            .set_collaborator(f.private.id, bob.id, AccessMode::Write)
            .await
            .unwrap();

        let membership = DbMembership::new(f.db.clone());
        assert_eq!(
            membership.access_mode(&f.alice, &f.private).await.unwrap(),
            AccessMode::Write
        );
        assert_eq!(
            membership.access_mode(&bob, &f.private).await.unwrap(),
            AccessMode::Write
        );
        assert_eq!(
            membership.access_mode(&carol, &f.private).await.unwrap(),
            AccessMode::None
        );
        assert_eq!(
            membership.access_mode(&carol, &f.public).await.unwrap(),
            AccessMode::Read
        );

        let ac = control(&f.db, &membership);
        let decision = ac
            .decide(&Principal::User(carol), &f.public, AccessMode::Write)
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::InsufficientMode {
                have: AccessMode::Read,
                want: AccessMode::Write
            })
        );
    }
}
