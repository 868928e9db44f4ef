//! Transaction module split into types and validation

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::{
    exclude_invalid_transactions, validate_split, validate_transaction,
    validate_transactions_deep,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use serde_json::json;

    #[test]
    fn test_transfer_builds_debit_and_credit() {
        let tx = Transaction::transfer("from", "to", 1.0, 0.25);
        assert_eq!(tx.splits.len(), 2);
        assert_eq!(tx.splits[0].amount, Some(-1.25));
        assert_eq!(tx.splits[1].amount, Some(1.0));
        assert_eq!(tx.debit_accounts(), vec!["from".to_string()]);
        assert!((tx.charge() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_debit_accounts_are_distinct_and_ordered() {
        let tx = Transaction::new(vec![
            Split::new("b", -1.0),
            Split::new("a", -1.0),
            Split::new("b", -1.0),
            Split::new("c", 2.5),
        ]);
        assert_eq!(tx.debit_accounts(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_hash_ignores_signatures() {
        let key = KeyPair::generate();
        let tx = Transaction::transfer(&key.public_key_encoded(), "to", 1.0, 0.1);
        let signed = tx.signed(std::slice::from_ref(&key)).unwrap();
        assert_eq!(tx.hash().unwrap(), signed.hash().unwrap());
        assert_eq!(tx.label(), signed.label());
    }

    #[test]
    fn test_wire_format_round_trip() {
        let value = json!({
            "splits": [{"account": "a", "amount": -1.5}, {"account": "b", "amount": 1}],
            "nonce": "n1",
            "signature": "sig"
        });
        let tx: Transaction = serde_json::from_value(value.clone()).unwrap();
        assert!(tx.extra.is_empty());
        assert_eq!(tx.nonce.as_deref(), Some("n1"));

        let back = serde_json::to_value(&tx).unwrap();
        assert_eq!(back["splits"][0]["amount"], json!(-1.5));
        assert_eq!(back["signature"], json!("sig"));
        assert!(back.get("signatures").is_none());
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        let tx: Transaction =
            serde_json::from_value(json!({"splits": [], "memo": "hi"})).unwrap();
        assert_eq!(tx.extra.get("memo"), Some(&json!("hi")));
        let back = serde_json::to_value(&tx).unwrap();
        assert_eq!(back["memo"], json!("hi"));
    }
}
