use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// The action a permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    Create,
    Preview,
    View,
    Acquire,
    Update,
    Generate,
    Delete,
    Reassign,
}

/// How far a permission reaches: safe < company < universal.
///
/// The derived `Ord` follows declaration order, which encodes the scope
/// hierarchy. A permission at a wider scope satisfies any check at a
/// narrower one for the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Safe,
    Company,
    Universal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "type")]
    pub kind: PermissionType,
    pub scope: PermissionScope,
}

impl Permission {
    pub const fn new(kind: PermissionType, scope: PermissionScope) -> Self {
        Self { kind, scope }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    /// Teams from different companies have unrelated hierarchies.
    #[error("cannot compare two teams from different companies")]
    CrossCompanyComparison,
    #[error("unknown permission type: {0}")]
    UnknownPermissionType(String),
    #[error("unknown permission scope: {0}")]
    UnknownPermissionScope(String),
}

impl std::str::FromStr for PermissionType {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "preview" => Ok(Self::Preview),
            "view" => Ok(Self::View),
            "acquire" => Ok(Self::Acquire),
            "update" => Ok(Self::Update),
            "generate" => Ok(Self::Generate),
            "delete" => Ok(Self::Delete),
            "reassign" => Ok(Self::Reassign),
            other => Err(IdentityError::UnknownPermissionType(other.to_string())),
        }
    }
}

impl std::str::FromStr for PermissionScope {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safe" => Ok(Self::Safe),
            "company" => Ok(Self::Company),
            "universal" => Ok(Self::Universal),
            other => Err(IdentityError::UnknownPermissionScope(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Company {
    pub id: i64,
    pub name: String,
}

impl PartialEq for Company {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Company {}

impl std::hash::Hash for Company {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Company {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Company {
    pub fn to_json(&self) -> Value {
        json!({ "id": self.id, "name": self.name })
    }
}

/// A team inside one company. Teams of the same company are totally
/// ordered by `hierarchy_index`.
#[derive(Debug, Clone)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub hierarchy_index: i32,
    pub company: Company,
    pub permissions: Vec<Permission>,
}

impl PartialEq for Team {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Team {}

impl std::hash::Hash for Team {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Team {
    /// True iff any held permission matches `permission.kind` at a scope
    /// at least as wide as `permission.scope`.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions
            .iter()
            .any(|held| held.kind == permission.kind && held.scope >= permission.scope)
    }

    /// Compare hierarchy positions. Callers must restrict to a single
    /// company before comparing.
    pub fn outranks_or_equals(&self, other: &Team) -> Result<bool, IdentityError> {
        if self.company != other.company {
            return Err(IdentityError::CrossCompanyComparison);
        }
        Ok(self.hierarchy_index >= other.hierarchy_index)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "hierarchy_index": self.hierarchy_index,
            "company": self.company.to_json(),
            "permissions": self.permissions,
        })
    }
}

/// Immutable snapshot of an authenticated identity.
///
/// An autopilot user is a headless worker; a non-autopilot user is a human
/// operator. Equality and hashing go by id.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub autopilot: bool,
    pub admin: bool,
    pub teams: Vec<Team>,
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}

impl std::hash::Hash for User {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display())
    }
}

impl User {
    /// Human-facing name: display name if set, username otherwise.
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }

    pub fn company_ids(&self) -> HashSet<i64> {
        self.teams.iter().map(|t| t.company.id).collect()
    }

    /// Evaluate whether this user may perform `kind` on a resource owned
    /// by `owner`.
    ///
    /// Admins may do anything. Otherwise a universal grant wins outright;
    /// a company grant applies when the user and owner share that company;
    /// a safe grant additionally requires the granting team to sit at or
    /// above the owner's highest team within the shared company.
    pub fn has_permission_for(&self, kind: PermissionType, owner: &User) -> bool {
        if self.admin {
            return true;
        }

        if self
            .teams
            .iter()
            .any(|t| t.has_permission(Permission::new(kind, PermissionScope::Universal)))
        {
            return true;
        }

        let shared: HashSet<i64> = self
            .company_ids()
            .intersection(&owner.company_ids())
            .copied()
            .collect();
        if shared.is_empty() {
            return false;
        }

        let shared_teams = || self.teams.iter().filter(|t| shared.contains(&t.company.id));

        if shared_teams().any(|t| t.has_permission(Permission::new(kind, PermissionScope::Company)))
        {
            return true;
        }

        shared_teams().any(|team| {
            let owner_highest = owner
                .teams
                .iter()
                .filter(|o| o.company.id == team.company.id)
                .map(|o| o.hierarchy_index)
                .max();
            match owner_highest {
                Some(highest) => {
                    team.hierarchy_index >= highest
                        && team.has_permission(Permission::new(kind, PermissionScope::Safe))
                }
                None => false,
            }
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "display_name": self.display_name,
            "email": self.email,
            "autopilot": self.autopilot,
            "admin": self.admin,
        })
    }
}
