//! Identity and access-control collaborators.
//!
//! The server never issues credentials or manages memberships itself; it asks
//! an [`IdentityVerifier`] who a bearer token belongs to and an
//! [`AccessControl`] what that user may do in a workspace.
//! [`StaticDirectory`] implements both from the `[[users]]` and `[[grants]]`
//! tables of the server config.

use std::collections::HashMap;

use serde::Deserialize;

/// Errors from identity verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No bearer token was presented.
    #[error("missing bearer token")]
    MissingToken,
    /// The token is not recognised.
    #[error("invalid bearer token")]
    InvalidToken,
}

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user id.
    pub user_id: String,
    /// Email address.
    pub email: String,
    /// Display name.
    pub name: String,
}

/// A user's role in a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control.
    Owner,
    /// May read and submit operations.
    Editor,
    /// May read and join the live channel, but not submit.
    Viewer,
    /// No access.
    #[default]
    None,
}

impl Role {
    /// Whether the role may append operations.
    #[must_use]
    pub const fn can_write(self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }

    /// Whether the role may read state or connect to the live channel.
    #[must_use]
    pub const fn can_read(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Editor => write!(f, "editor"),
            Self::Viewer => write!(f, "viewer"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Resolves a bearer token to a user.
pub trait IdentityVerifier: Send + Sync {
    /// Verifies `token`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the token is unknown.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Looks up a user's role in a workspace.
pub trait AccessControl: Send + Sync {
    /// Role of `user_id` in `workspace`; [`Role::None`] if unknown.
    fn role(&self, workspace: &str, user_id: &str) -> Role;
}

/// A `[[users]]` row.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    /// Bearer token.
    pub token: String,
    /// User id.
    pub user_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Email address.
    #[serde(default)]
    pub email: String,
}

/// A `[[grants]]` row. `workspace = "*"` applies to every workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantEntry {
    /// Workspace id or `*`.
    pub workspace: String,
    /// User id.
    pub user_id: String,
    /// Granted role.
    pub role: Role,
}

/// Wildcard workspace in a grant.
const ANY_WORKSPACE: &str = "*";

/// Token and grant tables loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: HashMap<String, Identity>,
    grants: HashMap<(String, String), Role>,
}

impl StaticDirectory {
    /// Builds a directory from config rows. Later rows win on conflict.
    #[must_use]
    pub fn new(users: &[UserEntry], grants: &[GrantEntry]) -> Self {
        let users = users
            .iter()
            .map(|u| {
                (
                    u.token.clone(),
                    Identity {
                        user_id: u.user_id.clone(),
                        email: u.email.clone(),
                        name: if u.name.is_empty() {
                            u.user_id.clone()
                        } else {
                            u.name.clone()
                        },
                    },
                )
            })
            .collect();
        let grants = grants
            .iter()
            .map(|g| ((g.workspace.clone(), g.user_id.clone()), g.role))
            .collect();
        Self { users, grants }
    }
}

impl IdentityVerifier for StaticDirectory {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.users.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

impl AccessControl for StaticDirectory {
    fn role(&self, workspace: &str, user_id: &str) -> Role {
        self.grants
            .get(&(workspace.to_string(), user_id.to_string()))
            .or_else(|| {
                self.grants
                    .get(&(ANY_WORKSPACE.to_string(), user_id.to_string()))
            })
            .copied()
            .unwrap_or_default()
    }
}
