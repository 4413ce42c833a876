//! Actor authorization for transaction intake
//! Supplies the caller's role and customer assignment; session handling lives elsewhere

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Front-line agent, restricted to assigned customers
    Agent,
    Manager,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::Manager => write!(f, "manager"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// The employee submitting a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub employee_id: String,
    pub role: Role,
    pub branch_id: Option<String>,
}

impl Actor {
    pub fn new(employee_id: impl Into<String>, role: Role) -> Self {
        Self {
            employee_id: employee_id.into(),
            role,
            branch_id: None,
        }
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }
}

/// Customer assignment lookups backing intake check 2
pub trait ActorDirectory: Send + Sync {
    fn is_assigned(&self, employee_id: &str, customer_id: &str) -> Result<bool>;
}

/// In-process directory of agent → customer assignments
#[derive(Debug, Default)]
pub struct StaffDirectory {
    assignments: RwLock<HashMap<String, HashSet<String>>>, // employee_id -> customer_ids
}

impl StaffDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a customer to an agent
    pub fn assign(&self, employee_id: &str, customer_id: &str) -> Result<()> {
        let mut assignments = self.assignments.write().map_err(|_| LedgerError::StorageError {
            message: "staff directory lock poisoned".to_string(),
        })?;
        assignments
            .entry(employee_id.trim().to_string())
            .or_default()
            .insert(customer_id.trim().to_string());
        Ok(())
    }

    /// Remove an assignment, e.g. when a customer moves branch
    pub fn unassign(&self, employee_id: &str, customer_id: &str) -> Result<bool> {
        let mut assignments = self.assignments.write().map_err(|_| LedgerError::StorageError {
            message: "staff directory lock poisoned".to_string(),
        })?;
        Ok(assignments
            .get_mut(employee_id.trim())
            .map(|customers| customers.remove(customer_id.trim()))
            .unwrap_or(false))
    }
}

impl ActorDirectory for StaffDirectory {
    fn is_assigned(&self, employee_id: &str, customer_id: &str) -> Result<bool> {
        let assignments = self.assignments.read().map_err(|_| LedgerError::StorageError {
            message: "staff directory lock poisoned".to_string(),
        })?;
        Ok(assignments
            .get(employee_id.trim())
            .is_some_and(|customers| customers.contains(customer_id.trim())))
    }
}
