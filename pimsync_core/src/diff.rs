//! Correlating desired grants with observed ones

pub mod grants;
pub mod removal;

use std::collections::HashMap;

use anyhow::Result;

use crate::ReconcileError;

pub use grants::{match_grants, needs_update, GrantMatch};
pub use removal::{resolve_delete, DeleteAction};

/// Id-to-name resolution, as needed to build correlation keys for observed
/// grants. Both lookups fail on ids that don't resolve.
pub trait NameLookup {
    /// The configured name of the principal with this id
    fn principal_name(&self, principal_id: &str) -> Result<&str>;
    /// The display name of the role definition with this id
    fn role_name(&self, role_definition_id: &str) -> Result<&str>;
}

/// Names resolved ahead of matching
#[derive(Default, Debug, Clone)]
pub struct ResolvedNames {
    principals: HashMap<String, String>,
    roles: HashMap<String, String>,
}

impl ResolvedNames {
    /// Record a principal's name
    pub fn insert_principal<S: Into<String>>(&mut self, id: S, name: S) {
        self.principals.insert(id.into(), name.into());
    }

    /// Record a role's name. Role ids are paths, compared case-insensitively.
    pub fn insert_role<S: Into<String>>(&mut self, id: S, name: S) {
        self.roles.insert(id.into().to_lowercase(), name.into());
    }
}

impl NameLookup for ResolvedNames {
    fn principal_name(&self, principal_id: &str) -> Result<&str> {
        self.principals
            .get(principal_id)
            .map(String::as_str)
            .ok_or_else(|| {
                ReconcileError::DanglingReference {
                    kind: "principal",
                    id: principal_id.to_owned(),
                }
                .into()
            })
    }

    fn role_name(&self, role_definition_id: &str) -> Result<&str> {
        self.roles
            .get(&role_definition_id.to_lowercase())
            .map(String::as_str)
            .ok_or_else(|| {
                ReconcileError::DanglingReference {
                    kind: "role definition",
                    id: role_definition_id.to_owned(),
                }
                .into()
            })
    }
}
