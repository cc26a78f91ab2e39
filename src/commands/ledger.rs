//! Ledger command handler: totals of completed items per collection/year/track.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use harvester_core::{Ledger, LedgerBackend, LedgerEntry, OutputLayout, Track};
use serde::Serialize;

use crate::cli::LedgerArgs;

/// One row of the ledger report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct LedgerGroup {
    pub(crate) collection_id: String,
    pub(crate) year: i32,
    pub(crate) track: Track,
    pub(crate) items: usize,
    pub(crate) bytes: u64,
}

pub async fn run_ledger_command(args: &LedgerArgs) -> Result<()> {
    let layout = OutputLayout::new(&args.output_dir);
    let store_path = match args.ledger {
        LedgerBackend::Json => layout.ledger_json_path(),
        LedgerBackend::Sqlite => layout.ledger_db_path(),
    };
    if !store_path.exists() {
        println!("No ledger found at {}.", store_path.display());
        return Ok(());
    }

    let ledger = Ledger::open_backend(args.ledger, &layout)
        .await
        .with_context(|| format!("failed to open ledger {}", store_path.display()))?;
    let groups = group_entries(&ledger.entries());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("Ledger {} is empty.", ledger.location());
        return Ok(());
    }
    println!("{:<24} {:>6} {:<10} {:>7} {:>12}", "COLLECTION", "YEAR", "TRACK", "ITEMS", "BYTES");
    for group in &groups {
        println!(
            "{:<24} {:>6} {:<10} {:>7} {:>12}",
            group.collection_id, group.year, group.track, group.items, group.bytes
        );
    }
    println!("{} item(s) in {}", ledger.len(), ledger.location());
    Ok(())
}

pub(crate) fn group_entries(entries: &[LedgerEntry]) -> Vec<LedgerGroup> {
    let mut groups: BTreeMap<(String, i32, &'static str), LedgerGroup> = BTreeMap::new();
    for entry in entries {
        let key = (entry.collection_id.clone(), entry.year, entry.track.as_str());
        let group = groups.entry(key).or_insert_with(|| LedgerGroup {
            collection_id: entry.collection_id.clone(),
            year: entry.year,
            track: entry.track,
            items: 0,
            bytes: 0,
        });
        group.items += 1;
        group.bytes += entry.bytes;
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn entry(identity: &str, collection: &str, year: i32, track: Track, bytes: u64) -> LedgerEntry {
        LedgerEntry {
            identity: identity.to_string(),
            local_path: format!("pdfs/{identity}.pdf").into(),
            year,
            collection_id: collection.to_string(),
            track,
            completed_at: Utc::now(),
            display_title: identity.to_string(),
            sub_collection_id: String::new(),
            artifact_url: String::new(),
            bytes,
            sha256: String::new(),
        }
    }

    #[test]
    fn test_group_entries_by_collection_year_track() {
        let groups = group_entries(&[
            entry("a", "ACL", 2023, Track::Main, 10),
            entry("b", "ACL", 2023, Track::Main, 5),
            entry("c", "ACL", 2023, Track::Workshop, 1),
            entry("d", "PMLR", 2022, Track::Main, 7),
        ]);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].collection_id, "ACL");
        assert_eq!((groups[0].items, groups[0].bytes), (2, 15));
        assert_eq!(groups[1].track, Track::Workshop);
        assert_eq!(groups[2].collection_id, "PMLR");
    }
}
