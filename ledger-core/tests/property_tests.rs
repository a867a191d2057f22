//! Property-based tests for ledger invariants
//!
//! - Amount round-trips and NaN propagation
//! - Accumulator continuation and tamper detection
//! - Substate up/down exclusivity
//! - Gapless, parent-checked chain extension

use chrono::Utc;
use gateway_ledger_core::{
    accumulator::{self, Hash32, PRE_GENESIS_ACCUMULATOR},
    CommittedTransaction, Config, Error, Ledger, NoVirtualSubstates, OperationGroup,
    OperationProvenance, PrefixVirtualRecognizer, Storage, SubstateContent, SubstateId,
    SubstateLedger, TokenAmount, TransactionOpLocator,
};
use proptest::prelude::*;
use tempfile::TempDir;

/// Canonical form of `[-]whole.fraction`
fn normalize(negative: bool, whole: u64, fraction: &str) -> String {
    let fraction = fraction.trim_end_matches('0');
    if whole == 0 && fraction.is_empty() {
        return "0".to_string();
    }
    let sign = if negative { "-" } else { "" };
    if fraction.is_empty() {
        format!("{}{}", sign, whole)
    } else {
        format!("{}{}.{}", sign, whole, fraction)
    }
}

/// Strategy for decimal strings within 18 fractional digits
fn decimal_strategy() -> impl Strategy<Value = (bool, u64, String, usize)> {
    (any::<bool>(), any::<u64>(), "[0-9]{0,18}", 0usize..3)
}

fn finite_amount_strategy() -> impl Strategy<Value = TokenAmount> {
    any::<i128>().prop_map(TokenAmount::from_sub_units)
}

fn test_storage() -> (Storage, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    (Storage::open(&config).unwrap(), temp_dir)
}

fn locator() -> TransactionOpLocator {
    TransactionOpLocator {
        state_version: 1,
        transaction_identifier: [0u8; 32],
        operation_group_index: Some(0),
        operation_index: Some(0),
    }
}

fn provenance(operation_index: u32) -> OperationProvenance {
    OperationProvenance {
        state_version: 1,
        operation_group_index: 0,
        operation_index,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_decimal_round_trip((negative, whole, fraction, leading_zeros) in decimal_strategy()) {
        let input = format!(
            "{}{}{}{}",
            if negative { "-" } else { "" },
            "0".repeat(leading_zeros),
            whole,
            if fraction.is_empty() { String::new() } else { format!(".{}", fraction) }
        );

        let parsed = TokenAmount::from_decimal_str(&input);
        prop_assert_eq!(parsed.to_string(), normalize(negative, whole, &fraction));
    }

    #[test]
    fn prop_full_precision_round_trip(amount in finite_amount_strategy()) {
        let rendered = amount.to_full_precision_string();
        let (_, fraction) = rendered.split_once('.').unwrap();
        prop_assert_eq!(fraction.len(), 18);
        prop_assert_eq!(TokenAmount::from_decimal_str(&rendered), amount.clone());
        prop_assert_eq!(TokenAmount::from_decimal_str(&amount.to_string()), amount);
    }

    #[test]
    fn prop_nan_propagates(amount in finite_amount_strategy()) {
        let nan = TokenAmount::nan();
        prop_assert!((&amount + &nan).is_nan());
        prop_assert!((&nan + &amount).is_nan());
        prop_assert!((&amount - &nan).is_nan());
        prop_assert!((&nan - &amount).is_nan());
        prop_assert_ne!(&amount, &nan);
        prop_assert_eq!(&nan, &TokenAmount::nan());
    }

    #[test]
    fn prop_arithmetic_inverts(a in finite_amount_strategy(), b in finite_amount_strategy()) {
        prop_assert_eq!(&(&a + &b) - &b, a.clone());
        prop_assert_eq!(-(-a.clone()), a);
    }

    #[test]
    fn prop_chain_continuity(parent in any::<[u8; 32]>(), child in any::<[u8; 32]>(), index in 0usize..32, flip in 1u8..=255) {
        let next = accumulator::compute_next(&parent, &child).unwrap();
        prop_assert!(accumulator::is_valid_continuation(&parent, &child, &next).unwrap());

        let mut tampered = next;
        tampered[index] ^= flip;
        prop_assert!(!accumulator::is_valid_continuation(&parent, &child, &tampered).unwrap());
    }

    #[test]
    fn prop_substate_exclusivity(id in prop::collection::vec(any::<u8>(), 1..16), byte in any::<u8>()) {
        let (storage, _dir) = test_storage();
        let mut ledger = SubstateLedger::new(&storage, &NoVirtualSubstates);
        let identifier = SubstateId::new(id);
        let content = SubstateContent::Data(vec![byte]);

        // down before any up fails for non-virtual identifiers
        let missing = ledger.down_expecting(identifier.clone(), &content, provenance(0), &locator());
        prop_assert!(
            matches!(missing, Err(Error::InvalidTransaction { .. })),
            "down of a missing non-virtual substate succeeded"
        );

        ledger.up(identifier.clone(), || content.clone(), provenance(0), &locator()).unwrap();
        prop_assert!(ledger.up(identifier.clone(), || content.clone(), provenance(1), &locator()).is_err());

        ledger.down_expecting(identifier.clone(), &content, provenance(2), &locator()).unwrap();
        prop_assert!(ledger.down_expecting(identifier.clone(), &content, provenance(3), &locator()).is_err());
        prop_assert!(ledger.up(identifier, || content.clone(), provenance(4), &locator()).is_err());
    }

    #[test]
    fn prop_virtual_down_synthesizes_up(suffix in prop::collection::vec(any::<u8>(), 0..16)) {
        let (storage, _dir) = test_storage();
        let recognizer = PrefixVirtualRecognizer::new(vec![0xfe]);
        let mut ledger = SubstateLedger::new(&storage, &recognizer);

        let mut id = vec![0xfe];
        id.extend(suffix);
        let identifier = SubstateId::new(id);

        ledger
            .down_expecting(identifier.clone(), &SubstateContent::Data(Vec::new()), provenance(5), &locator())
            .unwrap();
        let substate = ledger.get(&identifier).unwrap().unwrap();
        prop_assert!(substate.is_down());
        prop_assert_eq!(substate.up, provenance(5));
    }
}

fn chained(state_version: u64, parent_state_version: u64, parent_accumulator: &Hash32) -> CommittedTransaction {
    let payload = format!("transaction {}", state_version).into_bytes();
    let identifier = accumulator::hash_payload(&payload);
    CommittedTransaction {
        state_version,
        parent_state_version,
        transaction_identifier: identifier,
        accumulator: accumulator::compute_next(parent_accumulator, &identifier).unwrap(),
        payload: Some(payload),
        fee_paid: TokenAmount::from_decimal_str("0.5"),
        round_in_epoch: state_version,
        ends_epoch: false,
        timestamp: Utc::now(),
        operation_groups: vec![OperationGroup::default()],
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    async fn open_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Ledger::open(config).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_three_transactions_then_stale_parent_rejected() {
        let (ledger, _dir) = open_ledger().await;

        let first = chained(1, 0, &PRE_GENESIS_ACCUMULATOR);
        let second = chained(2, 1, &first.accumulator);
        let third = chained(3, 2, &second.accumulator);
        let report = ledger
            .commit_batch(vec![first.clone(), second, third.clone()])
            .await
            .unwrap();
        assert_eq!(report.transactions_committed, 3);
        assert_eq!(ledger.top_of_ledger().unwrap().state_version, 3);

        // A fourth transaction claiming parent 1
        let stale = chained(4, 1, &first.accumulator);
        let error = ledger.commit_batch(vec![stale]).await.unwrap_err();
        match error {
            Error::InvalidTransaction { locator, reason } => {
                assert_eq!(locator.state_version, 4);
                assert!(reason.contains("parent state version 1"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let tip = ledger.top_of_ledger().unwrap();
        assert_eq!(tip.state_version, 3);
        assert_eq!(tip.accumulator, third.accumulator);
        ledger.verify_chain().unwrap();
    }

    #[tokio::test]
    async fn test_gap_rejected() {
        let (ledger, _dir) = open_ledger().await;

        let first = chained(1, 0, &PRE_GENESIS_ACCUMULATOR);
        ledger.commit_batch(vec![first.clone()]).await.unwrap();

        let skipping = chained(3, 1, &first.accumulator);
        assert!(ledger.commit_batch(vec![skipping]).await.unwrap_err().is_invalid_transaction());
        assert_eq!(ledger.top_of_ledger().unwrap().state_version, 1);
    }

    #[tokio::test]
    async fn test_committed_transactions_are_immutable_records() {
        let (ledger, _dir) = open_ledger().await;

        let first = chained(1, 0, &PRE_GENESIS_ACCUMULATOR);
        ledger.commit_batch(vec![first.clone()]).await.unwrap();

        let stored = ledger.get_transaction(1).unwrap().unwrap();
        assert_eq!(stored.transaction_identifier, first.transaction_identifier);
        assert_eq!(stored.fee_paid.to_string(), "0.5");
        assert_eq!(stored.index_in_epoch, 0);
        assert_eq!(stored.parent_state_version, 0);
    }
}
