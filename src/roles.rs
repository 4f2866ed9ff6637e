use std::collections::HashSet;

use log::debug;

use crate::{db::Database, error::Result, models::Facility};

#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    SuperAdmin,
    /// Administers the listed facilities.
    FacilityAdmin(Vec<Facility>),
    Reader,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        !matches!(self, Role::Reader)
    }

    pub fn can_manage(&self, facility_id: &str) -> bool {
        match self {
            Role::SuperAdmin => true,
            Role::FacilityAdmin(facilities) => {
                facilities.iter().any(|f| f.facility_id == facility_id)
            }
            Role::Reader => false,
        }
    }
}

/// Classifies a signed-in email. Super-admin emails come from configuration.
#[derive(Clone)]
pub struct RoleResolver {
    db: Database,
    super_admins: HashSet<String>,
}

impl RoleResolver {
    pub fn new<I, S>(db: Database, super_admin_emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let super_admins = super_admin_emails
            .into_iter()
            .map(|email| email.as_ref().trim().to_lowercase())
            .filter(|email| !email.is_empty())
            .collect();
        Self { db, super_admins }
    }

    pub fn is_super_admin(&self, email: &str) -> bool {
        self.super_admins.contains(&email.trim().to_lowercase())
    }

    pub async fn resolve(&self, email: &str) -> Result<Role> {
        if self.is_super_admin(email) {
            return Ok(Role::SuperAdmin);
        }
        let facilities = self.db.facilities_for_admin(email.trim()).await?;
        let role = if facilities.is_empty() {
            Role::Reader
        } else {
            Role::FacilityAdmin(facilities)
        };
        debug!("Resolved {email} as {role:?}");
        Ok(role)
    }
}
