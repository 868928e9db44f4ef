use crate::transaction::Transaction;
use std::collections::BTreeMap;

/// Balance per public key.
pub type Accounts = BTreeMap<String, f64>;

/// Applies a block's transactions and reward on top of `parent_accounts`.
///
/// The result holds only the accounts this block touches, the author
/// included, each carrying its parent balance plus this block's changes.
/// Merge it over the parent accounts to get the block's full accounts.
pub fn apply_block_transactions(
    transactions: &[Transaction],
    author: &str,
    parent_accounts: &Accounts,
    block_reward: f64,
) -> Accounts {
    let prior = |account: &str| parent_accounts.get(account).copied().unwrap_or(0.0);

    let mut balances = Accounts::new();
    balances.insert(author.to_string(), prior(author));

    for transaction in transactions {
        let mut spread = 0.0;
        for split in &transaction.splits {
            let (Some(account), Some(amount)) = (&split.account, split.amount) else {
                continue;
            };
            spread -= amount;
            *balances
                .entry(account.clone())
                .or_insert_with(|| prior(account)) += amount;
        }

        // the transaction charge goes to the author
        *balances.entry(author.to_string()).or_insert(0.0) += spread;
    }

    *balances.entry(author.to_string()).or_insert(0.0) += block_reward;
    balances
}

/// Merges a block's balances over its parent's accounts.
pub fn merge_accounts(parent_accounts: &Accounts, balances: &Accounts) -> Accounts {
    let mut accounts = parent_accounts.clone();
    accounts.extend(balances.iter().map(|(k, v)| (k.clone(), *v)));
    accounts
}
