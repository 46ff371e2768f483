//! Channel names and the subscription authorization rules
//!
//! A channel is a plain string; the `user:`, `role:`, and `department:`
//! prefixes carry access semantics, everything else is an ad-hoc broadcast
//! group (e.g. `ticket:<id>`). Authorization is a pure function over the
//! connection's verified identity and the channel name.

use crate::auth::Identity;

pub const USER_PREFIX: &str = "user:";
pub const ROLE_PREFIX: &str = "role:";
pub const DEPARTMENT_PREFIX: &str = "department:";

/// Roles that may subscribe to any channel
pub const ADMIN_ROLES: &[&str] = &["admin", "super_admin"];

/// The user-scoped channel for a user id
pub fn user_channel(user_id: &str) -> String {
    format!("{}{}", USER_PREFIX, user_id)
}

/// The broadcast channel for a role
pub fn role_channel(role: &str) -> String {
    format!("{}{}", ROLE_PREFIX, role)
}

/// The broadcast channel for a department
pub fn department_channel(department: &str) -> String {
    format!("{}{}", DEPARTMENT_PREFIX, department)
}

/// Parsed form of a channel name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind<'a> {
    User(&'a str),
    Role(&'a str),
    Department(&'a str),
    Other(&'a str),
}

impl<'a> ChannelKind<'a> {
    pub fn parse(channel: &'a str) -> Self {
        if let Some(id) = channel.strip_prefix(USER_PREFIX) {
            Self::User(id)
        } else if let Some(role) = channel.strip_prefix(ROLE_PREFIX) {
            Self::Role(role)
        } else if let Some(dept) = channel.strip_prefix(DEPARTMENT_PREFIX) {
            Self::Department(dept)
        } else {
            Self::Other(channel)
        }
    }
}

/// Decide whether a connection may subscribe to a channel
///
/// Membership rules only ever grant; a failed membership check falls through
/// to the admin-tier rule, so administrators may join any channel. The final
/// rule denies.
pub fn authorize(identity: &Identity, channel: &str) -> bool {
    match ChannelKind::parse(channel) {
        ChannelKind::User(id) if id == identity.user_id => return true,
        ChannelKind::Role(role) if identity.roles.iter().any(|r| r == role) => return true,
        ChannelKind::Department(dept) if identity.departments.iter().any(|d| d == dept) => {
            return true
        }
        _ => {}
    }

    identity
        .roles
        .iter()
        .any(|role| ADMIN_ROLES.contains(&role.as_str()))
}
