//! Routing table for data messages
//!
//! The table is a dense array: the index decoded from a data-message id is
//! the position in the table, so lookup is a single bounds-checked index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ecu::EcuId;
use crate::error::GatewayError;

/// One routing descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Human-readable label (e.g. "wheel_speed")
    pub label: String,
    /// ECUs that receive this data message
    #[serde(default)]
    pub destinations: Vec<EcuId>,
}

/// Dense, ascending routing table
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

impl RoutingTable {
    /// Build from entries already in index order
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    /// Build from explicitly indexed entries
    ///
    /// Indices must form the range `0..n` exactly once each, and every
    /// destination must be a registry index below `ecu_count`.
    pub fn from_indexed(
        indexed: Vec<(u32, RouteEntry)>,
        ecu_count: usize,
    ) -> Result<Self, GatewayError> {
        let mut by_index = BTreeMap::new();
        for (index, entry) in indexed {
            if let Some(ecu) = entry.destinations.iter().find(|e| e.index() >= ecu_count) {
                return Err(GatewayError::Config(format!(
                    "Route {} ({}) targets unknown ECU {}",
                    index, entry.label, ecu
                )));
            }
            if by_index.insert(index, entry).is_some() {
                return Err(GatewayError::Config(format!(
                    "Duplicate route index {}",
                    index
                )));
            }
        }

        let mut entries = Vec::with_capacity(by_index.len());
        for (expected, (index, entry)) in by_index.into_iter().enumerate() {
            if index as usize != expected {
                return Err(GatewayError::Config(format!(
                    "Routing table has a gap: expected index {}, found {}",
                    expected, index
                )));
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    pub fn lookup(&self, index: usize) -> Option<&RouteEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str, dests: &[u8]) -> RouteEntry {
        RouteEntry {
            label: label.to_string(),
            destinations: dests.iter().map(|&d| EcuId(d)).collect(),
        }
    }

    #[test]
    fn test_indexed_entries_are_sorted() {
        let table = RoutingTable::from_indexed(
            vec![(1, entry("b", &[1])), (0, entry("a", &[0]))],
            2,
        )
        .unwrap();
        assert_eq!(table.lookup(0).unwrap().label, "a");
        assert_eq!(table.lookup(1).unwrap().label, "b");
        assert!(table.lookup(2).is_none());
    }

    #[test]
    fn test_gap_is_rejected() {
        let err = RoutingTable::from_indexed(
            vec![(0, entry("a", &[])), (2, entry("c", &[]))],
            1,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(msg) if msg.contains("gap")));
    }

    #[test]
    fn test_duplicate_and_unknown_destination_rejected() {
        assert!(RoutingTable::from_indexed(
            vec![(0, entry("a", &[])), (0, entry("b", &[]))],
            1
        )
        .is_err());
        assert!(RoutingTable::from_indexed(vec![(0, entry("a", &[3]))], 2).is_err());
    }
}
