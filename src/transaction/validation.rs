/// Validation logic for transactions separated from type definitions
use crate::blockchain::Accounts;
use crate::canonical::{verify, Signed};
use crate::crypto::{abbreviate, is_valid_public_key};
use crate::transaction::types::{Split, Transaction, MIN_AMOUNT};
use serde_json::{Map, Value};

fn extra_fields_error(kind: &str, extra: &Map<String, Value>) -> Option<String> {
    if extra.is_empty() {
        return None;
    }
    let names: Vec<&str> = extra.keys().map(String::as_str).collect();
    Some(format!(
        "The {} contained extra unsupported properties: {}",
        kind,
        names.join(", ")
    ))
}

/// Structural checks of a single split.
pub fn validate_split(split: &Split) -> Vec<String> {
    let mut errors = Vec::new();

    match &split.account {
        None => errors.push("account is required".to_string()),
        Some(account) if !is_valid_public_key(account) => {
            errors.push("account is not a valid public key".to_string())
        }
        Some(_) => {}
    }

    match split.amount {
        None => errors.push("An amount is required and cannot be zero".to_string()),
        Some(amount) if amount == 0.0 => {
            errors.push("An amount is required and cannot be zero".to_string())
        }
        Some(amount) if !amount.is_finite() => errors.push("Amounts must be finite".to_string()),
        Some(amount) if amount.abs() <= MIN_AMOUNT => {
            errors.push("Amounts must be greater than 1E-15".to_string())
        }
        Some(_) => {}
    }

    errors.extend(extra_fields_error("split", &split.extra));
    errors
}

/// Structural checks of a transaction: shape, amounts and signatures.
pub fn validate_transaction(transaction: &Transaction) -> Vec<String> {
    let mut errors = Vec::new();

    if transaction.splits.is_empty() {
        errors.push("A transaction must contain at least one split".to_string());
    }

    if transaction.collected_signatures().is_empty() {
        errors.push("A transaction must be signed".to_string());
    }

    errors.extend(extra_fields_error("transaction", &transaction.extra));

    let split_errors: Vec<String> = transaction
        .splits
        .iter()
        .enumerate()
        .flat_map(|(i, split)| {
            validate_split(split)
                .into_iter()
                .map(move |e| format!("split {}: {}", i, e))
        })
        .collect();
    if !split_errors.is_empty() {
        errors.push("There were problems with one or more splits".to_string());
        errors.extend(split_errors);
    }

    if !transaction.splits.is_empty() {
        let debits: f64 = transaction
            .splits
            .iter()
            .filter_map(|s| s.amount)
            .filter(|a| *a < 0.0)
            .map(f64::abs)
            .sum();
        let credits: f64 = transaction
            .splits
            .iter()
            .filter_map(|s| s.amount)
            .filter(|a| *a > 0.0)
            .sum();

        if debits < credits {
            errors.push(format!(
                "The from amount {} is less than the to amount {}",
                debits, credits
            ));
        } else if debits == credits {
            errors.push(
                "No transaction charge was given. The debit and credit totals were equal"
                    .to_string(),
            );
        }

        let debit_accounts = transaction.debit_accounts();
        if !debit_accounts.is_empty() && !verify(transaction, Some(debit_accounts.as_slice())) {
            errors.push(
                "The transaction was not signed by each from account's private key".to_string(),
            );
        }
    }

    errors
}

/// Applies `transactions` in order to a running copy of `starting_balances`
/// and reports every transaction that drove an account negative.
///
/// Processing never stops at the first offender: later transactions apply
/// on top of the already-negative balances, so the order of the batch
/// decides which transaction is reported.
pub fn validate_transactions_deep(
    transactions: &[Transaction],
    starting_balances: &Accounts,
) -> Vec<String> {
    let mut balances = starting_balances.clone();
    let mut errors = Vec::new();

    for transaction in transactions {
        let overdrawn = apply_splits(&mut balances, transaction);
        if !overdrawn.is_empty() {
            let names: Vec<String> = overdrawn.iter().map(|a| abbreviate(a)).collect();
            errors.push(format!(
                "Transaction {} would make the balance of {} negative",
                transaction.label(),
                names.join(", ")
            ));
        }
    }

    errors
}

/// Keeps the transactions that still apply, in order, to `balances`.
/// A transaction that would overdraw an account is skipped and does not
/// affect the ones after it.
pub fn exclude_invalid_transactions(
    transactions: &[Transaction],
    balances: &Accounts,
) -> Vec<Transaction> {
    let mut running = balances.clone();
    let mut kept = Vec::new();

    for transaction in transactions {
        let mut trial = running.clone();
        if apply_splits(&mut trial, transaction).is_empty() {
            running = trial;
            kept.push(transaction.clone());
        }
    }

    kept
}

/// Adds every split to `balances`, returning the accounts that went negative.
fn apply_splits(balances: &mut Accounts, transaction: &Transaction) -> Vec<String> {
    let mut overdrawn: Vec<String> = Vec::new();

    for split in &transaction.splits {
        let (Some(account), Some(amount)) = (&split.account, split.amount) else {
            continue;
        };
        let balance = balances.entry(account.clone()).or_insert(0.0);
        *balance += amount;
        if *balance < 0.0 && !overdrawn.contains(account) {
            overdrawn.push(account.clone());
        }
    }

    overdrawn
}
