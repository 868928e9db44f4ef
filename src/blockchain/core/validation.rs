use crate::canonical::verify;
use crate::crypto::{abbreviate, encode, is_valid_base64, is_valid_hash, is_valid_public_key};
use crate::miner::{is_solution, Target};
use crate::transaction::{validate_transaction, validate_transactions_deep};

use super::chain::{Block, MAX_SAFE_HEIGHT};
use super::state::Accounts;

/// A resolved parent block together with its full accounts.
#[derive(Debug, Clone, Copy)]
pub struct ParentRef<'a> {
    pub block: &'a Block,
    pub accounts: &'a Accounts,
}

/// Structural checks of a block, signature included.
pub fn validate_block(block: &Block) -> Vec<String> {
    let mut errors = validate_block_unsigned(block);
    errors.extend(validate_block_signature(block));
    errors
}

/// Structural checks of a block that hold before it is solved and signed.
pub fn validate_block_unsigned(block: &Block) -> Vec<String> {
    let mut errors = Vec::new();

    match &block.compliment {
        Some(c) if is_valid_hash(c) => {}
        _ => errors.push("compliment must be a 43 character base64url string".to_string()),
    }

    match &block.hash {
        None => errors.push("hash is required".to_string()),
        Some(hash) => match block.compute_hash() {
            Ok(computed) if encode(computed) == *hash => {}
            _ => errors.push("hash does not match the contents of the block".to_string()),
        },
    }

    match &block.author {
        None => errors.push("author is required".to_string()),
        Some(author) if !is_valid_base64(author) => {
            errors.push("author is not valid base64".to_string())
        }
        Some(author) if !is_valid_public_key(author) => {
            errors.push("author is not a valid public key".to_string())
        }
        Some(_) => {}
    }

    if let Some(parent) = &block.parent {
        if !is_valid_hash(parent) {
            errors.push("parent is not a valid hash".to_string());
        }
    }

    if block.height > MAX_SAFE_HEIGHT {
        errors.push("height must be a safe integer".to_string());
    }

    if block.height == 0 && block.parent.is_some() {
        errors.push("A block at height 0 cannot have a parent".to_string());
    }
    if block.height > 0 && block.parent.is_none() {
        errors.push("A block above height 0 must have a parent".to_string());
    }

    for transaction in &block.transactions {
        let label = transaction.label();
        errors.extend(
            validate_transaction(transaction)
                .into_iter()
                .map(|e| format!("transaction {}: {}", label, e)),
        );
    }

    if !block.extra.is_empty() {
        let names: Vec<&str> = block.extra.keys().map(String::as_str).collect();
        errors.push(format!(
            "The block contained extra unsupported properties: {}",
            names.join(", ")
        ));
    }

    errors
}

fn validate_block_signature(block: &Block) -> Vec<String> {
    let mut errors = Vec::new();

    if block.signatures.is_some() {
        errors.push("A block must have exactly one signature".to_string());
    }

    match (&block.signature, &block.author) {
        (None, _) => errors.push("A block must be signed".to_string()),
        (Some(_), Some(author)) if is_valid_public_key(author) => {
            if !verify(block, Some(std::slice::from_ref(author))) {
                errors.push("The block was not signed by its author".to_string());
            }
        }
        // an unusable author is already reported
        (Some(_), _) => {}
    }

    errors
}

/// Full checks of a block against the chain it extends.
///
/// `parent` must be the block named by `block.parent`, or `None` if it is
/// not stored. Genesis blocks ignore it.
pub fn validate_block_deep(block: &Block, parent: Option<ParentRef<'_>>, target: &Target) -> Vec<String> {
    let mut errors = validate_block(block);

    let solved = match (block.hash_bytes(), block.compliment_bytes()) {
        (Ok(hash), Ok(compliment)) => is_solution(&compliment, &hash, target),
        _ => false,
    };
    if !solved {
        errors.push("The block does not satisfy the proof of work target".to_string());
    }

    match &block.parent {
        Some(parent_hash) => match parent {
            None => errors.push(format!(
                "The parent block {} is not known",
                abbreviate(parent_hash)
            )),
            Some(ParentRef { block: parent_block, accounts }) => {
                if parent_block.hash.as_deref() != Some(parent_hash.as_str()) {
                    errors.push(format!(
                        "The parent block {} is not the block named by this block",
                        abbreviate(parent_block.hash.as_deref().unwrap_or_default())
                    ));
                }
                if block.height != parent_block.height + 1 {
                    errors.push(format!(
                        "Invalid block height. Expected {}, but got {}",
                        parent_block.height + 1,
                        block.height
                    ));
                }
                errors.extend(validate_transactions_deep(&block.transactions, accounts));
            }
        },
        // height 0 without a parent is a structural check
        None => {
            if !block.transactions.is_empty() {
                errors.push("A genesis block cannot contain transactions".to_string());
            }
        }
    }

    errors
}
