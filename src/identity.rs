use crate::model::{ProfileDefaults, UserId};

/// The authenticated member behind the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    pub email: Option<String>,
    pub full_name: Option<String>,
}

impl AuthUser {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            email: None,
            full_name: None,
        }
    }

    /// Defaults used to provision a profile for this member.
    pub fn profile_defaults(&self) -> ProfileDefaults {
        ProfileDefaults {
            email: self.email.clone().unwrap_or_default(),
            full_name: self.full_name.clone(),
        }
    }
}

/// Identity provider seam. `None` means the session is unauthenticated
/// (or has expired since the flow started).
pub trait Identity: Send + Sync {
    fn current_user(&self) -> Option<AuthUser>;

    fn current_user_id(&self) -> Option<UserId> {
        self.current_user().map(|u| u.id)
    }

    fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }
}

/// Fixed identity: a logged-in member, or nobody.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<AuthUser>);

impl StaticIdentity {
    pub fn member(id: UserId) -> Self {
        Self(Some(AuthUser::new(id)))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl Identity for StaticIdentity {
    fn current_user(&self) -> Option<AuthUser> {
        self.0.clone()
    }
}
