//! Bulk import of inventory rows from the admin spreadsheet export.
//!
//! Expected headers: `status,current_users,max_capacity,password_ref,
//! account_email,plan_type,duration,Product_Type,product_id`. Unknown columns
//! are ignored. Secrets are sealed before they leave this module.

use serde::Deserialize;
use shared::{AccountKind, AccountState, ProductId};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::models::NewInventoryAccount;
use crate::secrets::{SecretBox, SecretError};
use crate::store::InventoryStore;

/// Plan type used by the Persian storefront for shared accounts.
const SHARED_PLAN_FA: &str = "اشتراکی";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: missing product id")]
    MissingProductId { line: usize },

    #[error("line {line}: missing account email")]
    MissingEmail { line: usize },

    #[error("line {line}: missing password")]
    MissingSecret { line: usize },

    #[error("line {line}: {source}")]
    Seal { line: usize, source: SecretError },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InputRow {
    status: Option<String>,
    current_users: Option<String>,
    max_capacity: Option<String>,
    password_ref: Option<String>,
    account_email: Option<String>,
    plan_type: Option<String>,
    duration: Option<String>,
    #[serde(rename = "Product_Type", alias = "product_type")]
    product_type: Option<String>,
    #[serde(alias = "WooCommerce Product ID")]
    product_id: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub rejected: usize,
}

/// Read inventory rows from csv data. Each item carries its own error so one
/// bad row does not stop the rest.
pub fn read_accounts<'a, R: io::Read + 'a>(
    reader: R,
    secrets: &'a SecretBox,
) -> impl Iterator<Item = Result<NewInventoryAccount, ImportError>> + 'a {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader)
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(move |(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| ImportError::Parse { line, source })?;
            convert(row, line, secrets)
        })
}

/// Import a csv file into the store in one batch.
pub async fn import_file(
    path: impl AsRef<Path>,
    store: &dyn InventoryStore,
    secrets: &SecretBox,
) -> anyhow::Result<ImportSummary> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut summary = ImportSummary::default();
    let mut accounts = Vec::new();

    for result in read_accounts(file, secrets) {
        match result {
            Ok(account) => accounts.push(account),
            Err(e) => {
                warn!("{e}");
                summary.rejected += 1;
            }
        }
    }

    summary.inserted = store.insert(accounts).await?.len();
    Ok(summary)
}

fn convert(row: InputRow, line: usize, secrets: &SecretBox) -> Result<NewInventoryAccount, ImportError> {
    let text = |value: Option<String>| value.map(|v| v.trim().to_string()).unwrap_or_default();

    let product_id: ProductId = leading_int(&text(row.product_id).replace('#', "")).abs();
    if product_id == 0 {
        return Err(ImportError::MissingProductId { line });
    }
    let account_email = text(row.account_email);
    if account_email.is_empty() {
        return Err(ImportError::MissingEmail { line });
    }
    let password = text(row.password_ref);
    if password.is_empty() {
        return Err(ImportError::MissingSecret { line });
    }

    let plan = text(row.plan_type);
    let kind = if plan == SHARED_PLAN_FA || plan.eq_ignore_ascii_case("shared") {
        AccountKind::Shared
    } else {
        AccountKind::Dedicated
    };

    let capacity = clamp_i32(leading_int(&text(row.max_capacity))).max(1);
    let current = clamp_i32(leading_int(&text(row.current_users))).max(0);
    let status = parse_status(&text(row.status));

    let (occupancy, state) = match kind {
        // Seat count decides the state so closed always means full.
        AccountKind::Shared => {
            let occupancy = current.min(capacity);
            (occupancy, AccountState::for_occupancy(occupancy, capacity))
        }
        AccountKind::Dedicated => match status {
            AccountState::Free => (0, AccountState::Free),
            taken => (1, taken),
        },
    };

    let notes = format!("{} - {} - {}", plan, text(row.duration), text(row.product_type))
        .trim_matches(|c| c == ' ' || c == '-')
        .to_string();

    let sealed_secret = secrets
        .seal(&password)
        .map_err(|source| ImportError::Seal { line, source })?;

    Ok(NewInventoryAccount {
        product_id,
        account_email,
        sealed_secret,
        kind,
        capacity,
        occupancy,
        state,
        notes,
    })
}

/// Accepts the legacy `use`/`close` tokens; anything unknown is free.
fn parse_status(raw: &str) -> AccountState {
    match raw.to_ascii_lowercase().as_str() {
        "use" | "in_use" => AccountState::InUse,
        "close" | "closed" => AccountState::Closed,
        _ => AccountState::Free,
    }
}

/// Integer prefix of `raw` (optional sign, then digits); 0 when there is none.
fn leading_int(raw: &str) -> i64 {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let value = digits
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .fold(0i64, |acc, c| acc.saturating_mul(10).saturating_add(i64::from(c as u8 - b'0')));
    if negative { -value } else { value }
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
