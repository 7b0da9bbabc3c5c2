//! Migration catalog and the executor seam.
//!
//! Migrations are forward-only SQL scripts named `NNNN_name.sql`. Versions
//! start at 1 and are contiguous. Each step carries the SHA-256 checksum of
//! its script, which is recorded in the tenant's ledger when the step commits
//! and verified on every later run.

use crate::error::TenantError;
use crate::tenant::ConnectionDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// Ledger table kept inside every tenant database.
pub const LEDGER_TABLE: &str = "_tenantry_migrations";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: u32,
    pub name: String,
    pub checksum: String,
    pub sql: String,
}

impl MigrationStep {
    pub fn new(version: u32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let checksum = hex::encode(Sha256::digest(sql.as_bytes()));
        Self {
            version,
            name: name.into(),
            checksum,
            sql,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CatalogError {
    #[error("Migration versions must be contiguous from 1: expected {expected}, found {found}")]
    Gap { expected: u32, found: u32 },

    #[error("Duplicate migration version {0}")]
    Duplicate(u32),

    #[error("Invalid migration file name: {0}")]
    InvalidFileName(String),

    #[error("Failed to read migrations: {0}")]
    Io(String),
}

impl From<CatalogError> for TenantError {
    fn from(err: CatalogError) -> Self {
        TenantError::Validation(err.to_string())
    }
}

/// The ordered list of schema steps every tenant moves through.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    steps: Vec<MigrationStep>,
}

impl MigrationCatalog {
    pub fn new(mut steps: Vec<MigrationStep>) -> Result<Self, CatalogError> {
        steps.sort_by_key(|s| s.version);
        for (index, step) in steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.version == expected {
                continue;
            }
            if index > 0 && step.version == steps[index - 1].version {
                return Err(CatalogError::Duplicate(step.version));
            }
            return Err(CatalogError::Gap {
                expected,
                found: step.version,
            });
        }
        Ok(Self { steps })
    }

    /// Load every `NNNN_name.sql` file in `dir`. Other files are ignored.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| CatalogError::Io(format!("{}: {}", dir.display(), e)))?;

        let mut steps = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CatalogError::Io(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let (version, name) = parse_file_name(&file_name)?;
            let sql = std::fs::read_to_string(&path).map_err(|e| CatalogError::Io(format!("{}: {}", file_name, e)))?;
            steps.push(MigrationStep::new(version, name, sql));
        }

        Self::new(steps)
    }

    /// Highest version in the catalog, 0 when empty.
    pub fn latest(&self) -> u32 {
        self.steps.last().map(|s| s.version).unwrap_or(0)
    }

    pub fn step(&self, version: u32) -> Option<&MigrationStep> {
        version
            .checked_sub(1)
            .and_then(|index| self.steps.get(index as usize))
    }

    /// Steps after `current` up to and including `target`.
    pub fn pending(&self, current: u32, target: u32) -> &[MigrationStep] {
        let start = (current as usize).min(self.steps.len());
        let end = (target as usize).min(self.steps.len()).max(start);
        &self.steps[start..end]
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn parse_file_name(file_name: &str) -> Result<(u32, String), CatalogError> {
    let stem = file_name.trim_end_matches(".sql");
    let (digits, name) = stem
        .split_once('_')
        .ok_or_else(|| CatalogError::InvalidFileName(file_name.to_string()))?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || name.is_empty() {
        return Err(CatalogError::InvalidFileName(file_name.to_string()));
    }
    let version = digits
        .parse::<u32>()
        .map_err(|_| CatalogError::InvalidFileName(file_name.to_string()))?;
    Ok((version, name.to_string()))
}

/// A row of the tenant's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub version: u32,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Could not reach the tenant database; worth retrying.
    #[error("Tenant database unavailable: {0}")]
    Transient(String),

    /// The step's SQL failed and was rolled back.
    #[error("{0}")]
    Step(String),

    #[error("Migration ledger error: {0}")]
    Ledger(String),
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Transient(_))
    }
}

/// Runs migration steps inside a tenant database.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Ledger rows in version order. An absent ledger reads as empty.
    async fn applied_steps(&self, conn: &ConnectionDescriptor) -> Result<Vec<AppliedStep>, ExecError>;

    /// Execute one step and record it in the ledger in a single transaction.
    ///
    /// A step already in the ledger with the same checksum is returned as
    /// applied, so retrying after a lost commit acknowledgement is safe.
    async fn apply_step(&self, conn: &ConnectionDescriptor, step: &MigrationStep) -> Result<AppliedStep, ExecError>;
}

/// The ledger row recording `step`, if any.
pub(crate) fn recorded_step(ledger: &[AppliedStep], step: &MigrationStep) -> Result<Option<AppliedStep>, ExecError> {
    match ledger.iter().find(|row| row.version == step.version) {
        Some(row) if row.checksum == step.checksum => Ok(Some(row.clone())),
        Some(_) => Err(ExecError::Ledger(format!(
            "version {} is recorded with a different checksum",
            step.version
        ))),
        None => Ok(None),
    }
}
