//! Tiered integrity verification of a database file (usually a fresh backup).
//!
//! - Tier 1: the file exists and its size is near the reference's. A size
//!   deviation is reported but does not fail verification, since a
//!   `VACUUM INTO` export is legitimately smaller than its source.
//! - Tier 2: `PRAGMA integrity_check` must return a single `ok` row.
//! - Tier 3 (deep): `PRAGMA quick_check`, plus table/index count parity of
//!   `sqlite_master` against the reference.

use crate::driver::{DatabaseDriver, DbSession, OpenMode};
use crate::error::DbResult;
use crate::files::file_size;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyOptions {
    pub deep: bool,
    /// Allowed relative size deviation from the reference (0.10 = 10%).
    pub size_tolerance: f64,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            deep: false,
            size_tolerance: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub exists_check: bool,
    pub size_delta_check: bool,
    /// `|candidate - reference| / reference`, when a reference was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_delta: Option<f64>,
    pub structural_integrity_check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_check: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_count_check: Option<bool>,
    pub passed: bool,
    pub details: Vec<String>,
}

impl VerificationResult {
    fn missing(path: &Path) -> Self {
        Self {
            exists_check: false,
            size_delta_check: false,
            size_delta: None,
            structural_integrity_check: false,
            quick_check: None,
            table_count_check: None,
            passed: false,
            details: vec![format!("{} does not exist", path.display())],
        }
    }
}

/// Schema object counts from `sqlite_master`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaCounts {
    pub tables: u64,
    pub indexes: u64,
}

/// Run a check pragma; `Ok(problems)` where an empty list means "ok".
fn check_pragma(session: &mut dyn DbSession, pragma: &str) -> DbResult<Vec<String>> {
    let rows = session.query(pragma)?;
    let lines: Vec<String> = rows
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .collect();
    if lines.len() == 1 && lines[0].trim().eq_ignore_ascii_case("ok") {
        Ok(Vec::new())
    } else if lines.is_empty() {
        Ok(vec![format!("{pragma} returned no rows")])
    } else {
        Ok(lines)
    }
}

/// Count tables and indexes in `sqlite_master`.
///
/// # Errors
///
/// Driver failures.
pub fn schema_counts(session: &mut dyn DbSession) -> DbResult<SchemaCounts> {
    let rows = session.query(
        "SELECT type, COUNT(*) FROM sqlite_master WHERE type IN ('table', 'index') GROUP BY type",
    )?;
    let mut counts = SchemaCounts {
        tables: 0,
        indexes: 0,
    };
    for row in rows {
        let n = row.get(1).and_then(|v| v.parse().ok()).unwrap_or(0);
        match row.first().map(String::as_str) {
            Some("table") => counts.tables = n,
            Some("index") => counts.indexes = n,
            _ => {}
        }
    }
    Ok(counts)
}

fn reference_counts(driver: &dyn DatabaseDriver, reference: &Path) -> DbResult<SchemaCounts> {
    let mut session = driver.open(reference, OpenMode::ReadOnly)?;
    let counts = schema_counts(session.as_mut())?;
    session.close()?;
    Ok(counts)
}

/// Verify `candidate`, optionally against a `reference` database.
///
/// Never returns an error: every failure is recorded in the result.
#[must_use]
pub fn verify(
    driver: &dyn DatabaseDriver,
    candidate: &Path,
    reference: Option<&Path>,
    opts: &VerifyOptions,
) -> VerificationResult {
    if !candidate.is_file() {
        return VerificationResult::missing(candidate);
    }
    let mut details = Vec::new();

    // Tier 1: size drift.
    let candidate_size = file_size(candidate);
    let mut size_delta = None;
    let mut size_delta_check = true;
    if let Some(reference) = reference {
        let reference_size = file_size(reference);
        if reference_size > 0 {
            #[allow(clippy::cast_precision_loss)]
            let delta = candidate_size.abs_diff(reference_size) as f64 / reference_size as f64;
            size_delta = Some(delta);
            if delta > opts.size_tolerance {
                size_delta_check = false;
                tracing::warn!(
                    candidate = %candidate.display(),
                    candidate_bytes = candidate_size,
                    reference_bytes = reference_size,
                    delta,
                    tolerance = opts.size_tolerance,
                    "backup size deviates from source"
                );
                details.push(format!(
                    "size delta {:.1}% exceeds tolerance {:.1}%",
                    delta * 100.0,
                    opts.size_tolerance * 100.0
                ));
            }
        }
    }

    let mut session = match driver.open(candidate, OpenMode::ReadOnly) {
        Ok(s) => s,
        Err(e) => {
            details.push(format!("cannot open candidate: {e}"));
            return VerificationResult {
                exists_check: true,
                size_delta_check,
                size_delta,
                structural_integrity_check: false,
                quick_check: None,
                table_count_check: None,
                passed: false,
                details,
            };
        }
    };

    // Tier 2: structural integrity.
    let structural_integrity_check = match check_pragma(session.as_mut(), "PRAGMA integrity_check") {
        Ok(problems) if problems.is_empty() => true,
        Ok(problems) => {
            details.extend(problems.into_iter().map(|p| format!("integrity_check: {p}")));
            false
        }
        Err(e) => {
            details.push(format!("integrity_check failed: {e}"));
            false
        }
    };

    // Tier 3: quick check and schema parity.
    let mut quick_check = None;
    let mut table_count_check = None;
    if opts.deep {
        quick_check = Some(match check_pragma(session.as_mut(), "PRAGMA quick_check") {
            Ok(problems) if problems.is_empty() => true,
            Ok(problems) => {
                details.extend(problems.into_iter().map(|p| format!("quick_check: {p}")));
                false
            }
            Err(e) => {
                details.push(format!("quick_check failed: {e}"));
                false
            }
        });

        if let Some(reference) = reference {
            let parity = schema_counts(session.as_mut())
                .and_then(|ours| reference_counts(driver, reference).map(|theirs| (ours, theirs)));
            table_count_check = Some(match parity {
                Ok((ours, theirs)) if ours == theirs => true,
                Ok((ours, theirs)) => {
                    details.push(format!(
                        "schema mismatch: {} tables/{} indexes vs reference {}/{}",
                        ours.tables, ours.indexes, theirs.tables, theirs.indexes
                    ));
                    false
                }
                Err(e) => {
                    details.push(format!("table count check failed: {e}"));
                    false
                }
            });
        }
    }
    if let Err(e) = session.close() {
        tracing::debug!(error = %e, "closing verification session failed");
    }

    let deep_ok = !opts.deep || (quick_check == Some(true) && table_count_check != Some(false));
    let passed = structural_integrity_check && deep_ok;

    VerificationResult {
        exists_check: true,
        size_delta_check,
        size_delta,
        structural_integrity_check,
        quick_check,
        table_count_check,
        passed,
        details,
    }
}
