//! One pass over every company the configured user can reach: data gates
//! first, then catalog, posting window and entries for the companies that
//! pass.

use std::time::Duration;

use chrono::Local;
use serde::Serialize;

use crate::config::RunConfig;
use crate::data::{AccountKind, CompanyRecord, DataAccess};
use crate::dialog::DialogOutcome;
use crate::error::Result;
use crate::primitives::wait_for_element;

use super::catalog::{close_company, open_catalog, open_company};
use super::posting::{open_posting_window, EntryReport, PostingSession};
use super::Desktop;

pub const POSTING_CLOSE_WAIT: Duration = Duration::from_secs(3);

const POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompanyOutcome {
    Processed { entries: Vec<EntryReport> },
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyReport {
    pub name: String,
    pub database: String,
    #[serde(flatten)]
    pub outcome: CompanyOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub companies: Vec<CompanyReport>,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    fn new(started_at: String, companies: Vec<CompanyReport>) -> Self {
        let count =
            |f: fn(&CompanyOutcome) -> bool| companies.iter().filter(|c| f(&c.outcome)).count();
        let processed = count(|o| matches!(o, CompanyOutcome::Processed { .. }));
        let skipped = count(|o| matches!(o, CompanyOutcome::Skipped { .. }));
        let failed = count(|o| matches!(o, CompanyOutcome::Failed { .. }));
        Self {
            started_at,
            finished_at: Local::now().to_rfc3339(),
            companies,
            processed,
            skipped,
            failed,
        }
    }
}

pub struct Orchestrator<'a> {
    desktop: Desktop<'a>,
    data: &'a dyn DataAccess,
    config: &'a RunConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(desktop: Desktop<'a>, data: &'a dyn DataAccess, config: &'a RunConfig) -> Self {
        Self { desktop, data, config }
    }

    /// Processes every company. Per-company failures land in the report;
    /// only fatal errors stop the run.
    pub fn run(&self) -> Result<RunReport> {
        let started_at = Local::now().to_rfc3339();
        let user = self.config.company_user();
        let records = self.data.companies_for_user(user)?;
        log::info!("[run] {} companies for '{user}'", records.len());

        let mut companies = Vec::with_capacity(records.len());
        for record in &records {
            let outcome = self.process_company(record)?;
            log::info!("[run] {}: {}", record.name, summary(&outcome));
            companies.push(CompanyReport {
                name: record.name.clone(),
                database: record.database_alias.clone(),
                outcome,
            });
        }

        let report = RunReport::new(started_at, companies);
        log::info!(
            "[run] done: {} processed, {} skipped, {} failed",
            report.processed,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    fn process_company(&self, record: &CompanyRecord) -> Result<CompanyOutcome> {
        if self.config.company(&record.name).is_none() {
            return Ok(CompanyOutcome::Skipped {
                reason: "not configured".to_string(),
            });
        }
        match self.gate(record) {
            Ok(Some(reason)) => return Ok(CompanyOutcome::Skipped { reason }),
            Ok(None) => {}
            Err(err) => {
                return Ok(CompanyOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }

        match self.post_company(record) {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                log::error!("[run] {} failed: {err}", record.name);
                Ok(CompanyOutcome::Failed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Data checks that decide whether a company is touched at all. Returns
    /// the skip reason when one fails.
    fn gate(&self, record: &CompanyRecord) -> Result<Option<String>> {
        let alias = record.database_alias.as_str();
        let parameters = self.data.validate_operating_parameters(alias)?;
        if !parameters.valid {
            return Ok(Some("invalid operating parameters".to_string()));
        }
        for kind in [AccountKind::Client, AccountKind::Supplier] {
            let check = self.data.account_code_for_company(alias, kind)?;
            if !check.valid {
                let code = check.code.as_deref().unwrap_or("none");
                return Ok(Some(format!("invalid {} account {code}", kind.label())));
            }
        }
        Ok(None)
    }

    fn post_company(&self, record: &CompanyRecord) -> Result<CompanyOutcome> {
        let desktop = &self.desktop;
        open_catalog(desktop)?;
        match open_company(desktop, &record.name)? {
            DialogOutcome::Handled(_) | DialogOutcome::Ignored(_) => {}
            DialogOutcome::Failed(reason) => return Ok(CompanyOutcome::Failed { reason }),
            DialogOutcome::Unrecognized => {
                return Ok(CompanyOutcome::Failed {
                    reason: "unrecognized dialog while opening".to_string(),
                })
            }
        }

        let outcome = self.post_entries(record);
        if let Err(err) = close_company(desktop) {
            if outcome.is_ok() {
                return Err(err);
            }
            log::warn!("[run] could not close {}: {err}", record.name);
        }
        outcome
    }

    fn post_entries(&self, record: &CompanyRecord) -> Result<CompanyOutcome> {
        let alias = record.database_alias.as_str();
        let entries = self.data.entries_for_database(alias)?;
        if entries.is_empty() {
            log::info!("[run] no eligible entries for {}", record.name);
            return Ok(CompanyOutcome::Processed { entries: Vec::new() });
        }

        let window = open_posting_window(&self.desktop)?;
        let session = PostingSession::new(self.desktop, self.data, self.config, window);
        let reports = entries
            .iter()
            .map(|entry| session.process_entry(entry, &record.name, alias))
            .collect();

        let ui = self.desktop.ui;
        let window = session.window();
        if wait_for_element(ui, self.desktop.clock, window, POSTING_CLOSE_WAIT, POLL).is_ok() {
            ui.close(window)?;
            if !self.desktop.locator().wait_for_window_disappearance(window, POSTING_CLOSE_WAIT) {
                log::warn!("[run] posting window still open");
            }
        }
        Ok(CompanyOutcome::Processed { entries: reports })
    }
}

fn summary(outcome: &CompanyOutcome) -> String {
    match outcome {
        CompanyOutcome::Processed { entries } => {
            let failed = entries.iter().filter(|e| e.outcome.is_failure()).count();
            format!("{} entries, {failed} failed", entries.len())
        }
        CompanyOutcome::Skipped { reason } => format!("skipped ({reason})"),
        CompanyOutcome::Failed { reason } => format!("failed ({reason})"),
    }
}
