//! The capability-check seam consumed by the dispatch layer.
//!
//! Identity and authorization live in a collaborator; the core only asks a
//! yes/no question per request. The default policy allows everything, which
//! is the correct behavior for a server run without an auth plugin.

use tileforge_core::types::ProjectId;

/// What a request wants to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessAction {
	/// Administrative operations: batch jobs, deletes, transactions.
	Admin,
	/// Reading a project's tiles, capabilities, or run state.
	ProjectRead(ProjectId),
}

pub trait AccessPolicy: Send + Sync {
	fn allows(&self, action: &AccessAction) -> bool;
}

/// The policy used when no auth collaborator is attached.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
	fn allows(&self, _action: &AccessAction) -> bool {
		true
	}
}

#[cfg(test)]
pub struct DenyAdmin;

#[cfg(test)]
impl AccessPolicy for DenyAdmin {
	fn allows(&self, action: &AccessAction) -> bool {
		!matches!(action, AccessAction::Admin)
	}
}
