//! Conversion Audit Log.
//!
//! Append-only, hash-chained record of every committed conversion. No
//! in-place mutation API exists: entries are built against the current tip,
//! persisted by the backend, and only then committed to the in-memory chain.

use crate::error::{StorageError, StorageResult};
use influence_types::{BalanceKey, Conversion, ConversionDraft};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct ConversionChain {
    entries: Vec<Conversion>,
}

impl ConversionChain {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a chain from persisted entries and verify its integrity.
    pub fn from_entries(entries: Vec<Conversion>) -> StorageResult<Self> {
        for (position, entry) in entries.iter().enumerate() {
            let expected = position as u64 + 1;
            if entry.sequence != expected {
                return Err(StorageError::InvariantViolation(format!(
                    "conversion log sequence gap at position {position} (found {})",
                    entry.sequence
                )));
            }
        }

        let chain = Self { entries };
        if !chain.verify_chain() {
            return Err(StorageError::InvariantViolation(
                "persisted conversion log hash-chain verification failed".to_string(),
            ));
        }
        Ok(chain)
    }

    pub fn entries(&self) -> &[Conversion] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tip_hash(&self) -> Option<&str> {
        self.entries.last().map(|entry| entry.entry_hash.as_str())
    }

    /// Build the next entry without mutating the chain.
    pub fn build_entry(&self, draft: ConversionDraft) -> StorageResult<Conversion> {
        seal_conversion(
            draft,
            self.entries.len() as u64 + 1,
            self.tip_hash().map(str::to_string),
        )
    }

    /// Commit a pre-built entry after external durability succeeds.
    pub fn commit_entry(&mut self, entry: Conversion) -> StorageResult<()> {
        let expected_sequence = self.entries.len() as u64 + 1;
        if entry.sequence != expected_sequence {
            return Err(StorageError::InvariantViolation(format!(
                "commit sequence mismatch: expected {}, got {}",
                expected_sequence, entry.sequence
            )));
        }

        if entry.previous_hash.as_deref() != self.tip_hash() {
            return Err(StorageError::InvariantViolation(
                "commit previous hash mismatch".to_string(),
            ));
        }

        if entry.entry_hash != conversion_hash(&entry)? {
            return Err(StorageError::InvariantViolation(
                "commit hash mismatch for conversion entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }

    pub fn verify_chain(&self) -> bool {
        verify_entries(&self.entries)
    }
}

/// Assign sequence and chain hashes to a draft.
pub fn seal_conversion(
    draft: ConversionDraft,
    sequence: u64,
    previous_hash: Option<String>,
) -> StorageResult<Conversion> {
    if draft.amount == 0 {
        return Err(StorageError::InvariantViolation(
            "conversion records must move a positive amount".to_string(),
        ));
    }
    if draft.from_division == draft.to_division {
        return Err(StorageError::InvariantViolation(format!(
            "conversion source and destination are both division {}",
            draft.from_division
        )));
    }

    let mut conversion = Conversion {
        conversion_id: draft.conversion_id,
        sequence,
        timestamp: draft.timestamp,
        member: draft.member,
        from_division: draft.from_division,
        to_division: draft.to_division,
        category: draft.category,
        amount: draft.amount,
        previous_hash,
        entry_hash: String::new(),
    };
    conversion.entry_hash = conversion_hash(&conversion)?;
    Ok(conversion)
}

/// Check sequence continuity and hash links over an ordered slice.
pub fn verify_entries(entries: &[Conversion]) -> bool {
    let mut previous_hash: Option<&str> = None;
    for (position, entry) in entries.iter().enumerate() {
        if entry.sequence != position as u64 + 1 {
            return false;
        }
        if entry.previous_hash.as_deref() != previous_hash {
            return false;
        }
        match conversion_hash(entry) {
            Ok(expected) if expected == entry.entry_hash => {}
            _ => return false,
        }
        previous_hash = Some(entry.entry_hash.as_str());
    }
    true
}

fn conversion_hash(conversion: &Conversion) -> StorageResult<String> {
    let material = serde_json::json!({
        "conversion_id": conversion.conversion_id,
        "sequence": conversion.sequence,
        "timestamp": conversion.timestamp,
        "member": conversion.member,
        "from_division": conversion.from_division,
        "to_division": conversion.to_division,
        "category": conversion.category,
        "amount": conversion.amount,
        "previous_hash": conversion.previous_hash,
    });

    let bytes =
        serde_json::to_vec(&material).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Net movement per balance implied by a sequence of conversions.
///
/// Replaying the log against an all-zero starting state yields, for every
/// balance a conversion touched, the signed total moved in or out of it.
pub fn replay(conversions: &[Conversion]) -> BTreeMap<BalanceKey, i128> {
    let mut deltas = BTreeMap::new();
    for conversion in conversions {
        let amount = i128::from(conversion.amount);
        *deltas.entry(conversion.source_key()).or_insert(0) -= amount;
        *deltas.entry(conversion.destination_key()).or_insert(0) += amount;
    }
    deltas
}
