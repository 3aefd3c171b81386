//! Typed records and validation rules the workflow consumes from the
//! accounting databases. The engine only sees [`DataAccess`]; the rules below
//! are shared by every backend.

pub mod pool;
pub mod sqlite;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("connection pool for '{0}' exhausted")]
    PoolExhausted(String),
    #[error("query failed on '{database}': {message}")]
    Query { database: String, message: String },
    #[error("no rows: {0}")]
    Missing(String),
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl DataError {
    pub fn query(database: &str, err: impl std::fmt::Display) -> Self {
        Self::Query {
            database: database.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyRecord {
    pub id: i64,
    pub name: String,
    pub database_alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecord {
    pub code: String,
    pub name: String,
    pub document_type: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountCheck {
    pub code: Option<String>,
    pub valid: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterCheck {
    pub valid: bool,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DateRange {
    /// `DD/MM/YYYY`, the format the filter window expects.
    pub fn first_text(&self) -> String {
        self.first.format("%d/%m/%Y").to_string()
    }

    pub fn last_text(&self) -> String {
        self.last.format("%d/%m/%Y").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Client,
    Supplier,
}

impl AccountKind {
    /// SAT grouping code of the parent account new sub-accounts hang from.
    pub fn grouping_code(self) -> &'static str {
        match self {
            Self::Client => "105.01",
            Self::Supplier => "201.01",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Supplier => "supplier",
        }
    }
}

pub trait DataAccess {
    fn companies_for_user(&self, user: &str) -> Result<Vec<CompanyRecord>, DataError>;
    fn entries_for_database(&self, alias: &str) -> Result<Vec<EntryRecord>, DataError>;
    fn account_code_for_company(
        &self,
        alias: &str,
        kind: AccountKind,
    ) -> Result<AccountCheck, DataError>;
    fn validate_operating_parameters(&self, alias: &str) -> Result<ParameterCheck, DataError>;
    fn date_range_for_company(&self, alias: &str) -> Result<DateRange, DataError>;
}

/// Operating parameters are a positional flag string. Positions are 1-based
/// after removing spaces: 7 must be `N`, 8 `S` or `M`, 43 `S`.
pub fn parameters_valid(raw: &str) -> bool {
    let flags: Vec<char> = raw.chars().filter(|c| *c != ' ').collect();
    flags.len() >= 43
        && flags[6] == 'N'
        && matches!(flags[7], 'S' | 'M')
        && flags[42] == 'S'
}

/// Length of the last segment of an account structure such as `3-2-3`.
/// Anything unparsable counts as zero.
pub fn last_segment_length(structure: &str) -> i64 {
    structure
        .trim()
        .rsplit('-')
        .next()
        .and_then(|segment| segment.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

pub fn account_code_valid(code: &str, structure: &str) -> bool {
    let segment = last_segment_length(structure);
    if segment <= 0 {
        return false;
    }
    let digits: Vec<char> = code.chars().collect();
    let n = segment as usize;
    digits.len() >= n && digits[digits.len() - n..].iter().all(|c| *c == '0')
}

pub fn check_account(kind: AccountKind, code: Option<&str>, structure: &str) -> AccountCheck {
    match code {
        None => AccountCheck {
            code: None,
            valid: false,
            message: format!(
                "no {} account under grouping code {}",
                kind.label(),
                kind.grouping_code()
            ),
        },
        Some(code) => {
            let valid = account_code_valid(code, structure);
            AccountCheck {
                code: Some(code.to_string()),
                valid,
                message: format!(
                    "account {code} {} a zero last segment for structure {structure}",
                    if valid { "has" } else { "does not have" }
                ),
            }
        }
    }
}

const EXCLUDED_FORMULAS: [&str; 3] = ["Banco_Deudor", "Por captar", "Gastos_Proveedor"];

/// `formulas` holds the account formula of every movement of the entry. An
/// entry without movements is not eligible.
pub fn entry_eligible(document_type: i64, name: &str, formulas: &[Option<String>]) -> bool {
    if !matches!(document_type, 1 | 4) {
        return false;
    }
    if name.contains("Cobro") || name.contains("Pago") {
        return false;
    }
    !formulas.is_empty()
        && formulas.iter().all(|formula| match formula {
            Some(formula) => !EXCLUDED_FORMULAS.contains(&formula.as_str()),
            None => false,
        })
}

/// First and last day of `period` (month number) in `fiscal_year`.
pub fn company_period(fiscal_year: i32, period: u32) -> Result<DateRange, DataError> {
    let first = NaiveDate::from_ymd_opt(fiscal_year, period, 1)
        .ok_or_else(|| DataError::Invalid(format!("period {period} of year {fiscal_year}")))?;
    let next_month = if period == 12 {
        NaiveDate::from_ymd_opt(fiscal_year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(fiscal_year, period + 1, 1)
    };
    let last = next_month
        .and_then(|date| date.pred_opt())
        .ok_or_else(|| DataError::Invalid(format!("period {period} of year {fiscal_year}")))?;
    debug_assert_eq!(first.month(), last.month());
    Ok(DateRange { first, last })
}
