//! Core data model shared by traversal, execution and persistence.
//!
//! Catalogs are organized as root index → collection → sub-collection → item.
//! A [`SiteAdapter`](crate::adapter::SiteAdapter) returns the references and
//! candidates defined here; the traversal engine turns candidates into
//! [`WorkItem`]s carrying a dedup identity, and the ledger persists one
//! [`LedgerEntry`] per completed item.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filename::identity_for_title;

/// Track of a proceedings volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Main conference track.
    #[default]
    Main,
    /// Co-located workshop.
    Workshop,
    /// Demonstration track.
    Demo,
    /// Survey track.
    Survey,
}

impl Track {
    /// Returns the stable lowercase label used in metadata records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Workshop => "workshop",
            Self::Demo => "demo",
            Self::Survey => "survey",
        }
    }

    /// Detects the track from free text such as a volume URL or heading.
    ///
    /// Falls back to [`Track::Main`] when no keyword matches.
    ///
    /// ```
    /// use harvester_core::Track;
    ///
    /// assert_eq!(Track::detect("/volumes/2023.acl-workshop.1/"), Track::Workshop);
    /// assert_eq!(Track::detect("Survey Track"), Track::Survey);
    /// assert_eq!(Track::detect("Long Papers"), Track::Main);
    /// ```
    #[must_use]
    pub fn detect(text: &str) -> Self {
        let lowered = text.to_lowercase();
        if lowered.contains("workshop") {
            Self::Workshop
        } else if lowered.contains("demo") {
            Self::Demo
        } else if lowered.contains("survey") {
            Self::Survey
        } else {
            Self::Main
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" | "main conference" => Ok(Self::Main),
            "workshop" => Ok(Self::Workshop),
            "demo" => Ok(Self::Demo),
            "survey" => Ok(Self::Survey),
            other => Err(format!("unknown track '{other}'")),
        }
    }
}

/// A top-level collection listed on the catalog root (e.g. one conference edition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionRef {
    /// Stable label for the collection, recorded in metadata.
    pub id: String,
    /// Page listing the collection's sub-collections.
    pub url: String,
    /// Year when the adapter can tell it at this level.
    #[serde(default)]
    pub year: Option<i32>,
}

/// A sub-collection (volume, track listing) inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubCollectionRef {
    /// Owning collection id.
    pub collection_id: String,
    /// Stable label for the sub-collection.
    pub id: String,
    /// Page listing the items.
    pub url: String,
    /// Year when known at this level; overrides the collection's year.
    #[serde(default)]
    pub year: Option<i32>,
    /// Track of every item in this sub-collection unless the item overrides it.
    #[serde(default)]
    pub track: Track,
}

/// A raw item candidate as extracted by a site adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WorkItemCandidate {
    /// Human-readable title as shown by the catalog.
    pub display_title: String,
    /// Item detail page, fetched lazily to find the artifact.
    #[serde(default)]
    pub detail_url: Option<String>,
    /// Direct artifact URL when the listing already exposes it.
    #[serde(default)]
    pub artifact_url: Option<String>,
    /// Item-level year override.
    #[serde(default)]
    pub year: Option<i32>,
    /// Item-level track override.
    #[serde(default)]
    pub track: Option<Track>,
}

/// Position of a work item in the catalog hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hierarchy {
    pub collection_id: String,
    pub sub_collection_id: String,
    /// Publication year, `0` when undetectable.
    pub year: i32,
    pub track: Track,
}

/// One candidate document with its dedup identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Canonical dedup key: the sanitized display title.
    pub identity: String,
    pub display_title: String,
    pub hierarchy: Hierarchy,
    pub detail_url: Option<String>,
    /// Resolved lazily from `detail_url` when absent.
    pub artifact_url: Option<String>,
}

impl WorkItem {
    /// Builds a work item from an adapter candidate and its parents.
    ///
    /// Year and track are taken from the most specific level that sets them.
    #[must_use]
    pub fn from_candidate(
        candidate: WorkItemCandidate,
        collection: &CollectionRef,
        sub_collection: &SubCollectionRef,
        max_identity_len: usize,
    ) -> Self {
        let display_title = collapse_whitespace(&candidate.display_title);
        let year = candidate
            .year
            .or(sub_collection.year)
            .or(collection.year)
            .unwrap_or(0);
        let track = candidate.track.unwrap_or(sub_collection.track);

        Self {
            identity: identity_for_title(&display_title, max_identity_len),
            display_title,
            hierarchy: Hierarchy {
                collection_id: collection.id.clone(),
                sub_collection_id: sub_collection.id.clone(),
                year,
                track,
            },
            detail_url: candidate.detail_url,
            artifact_url: candidate.artifact_url,
        }
    }

    /// Returns the adapter-facing view of this item.
    #[must_use]
    pub fn to_candidate(&self) -> WorkItemCandidate {
        WorkItemCandidate {
            display_title: self.display_title.clone(),
            detail_url: self.detail_url.clone(),
            artifact_url: self.artifact_url.clone(),
            year: Some(self.hierarchy.year),
            track: Some(self.hierarchy.track),
        }
    }
}

/// Durable completion record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub local_path: PathBuf,
    pub year: i32,
    pub collection_id: String,
    pub track: Track,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub display_title: String,
    #[serde(default)]
    pub sub_collection_id: String,
    #[serde(default)]
    pub artifact_url: String,
    #[serde(default)]
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the artifact.
    #[serde(default)]
    pub sha256: String,
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn collection() -> CollectionRef {
        CollectionRef {
            id: "ACL".to_string(),
            url: "https://example.org/events/acl-2023/".to_string(),
            year: Some(2023),
        }
    }

    fn sub_collection(track: Track, year: Option<i32>) -> SubCollectionRef {
        SubCollectionRef {
            collection_id: "ACL".to_string(),
            id: "2023.acl-long".to_string(),
            url: "https://example.org/volumes/2023.acl-long/".to_string(),
            year,
            track,
        }
    }

    #[test]
    fn test_track_detect_keywords() {
        assert_eq!(Track::detect("WORKSHOP proceedings"), Track::Workshop);
        assert_eq!(Track::detect("System Demonstrations"), Track::Demo);
        assert_eq!(Track::detect("survey"), Track::Survey);
        assert_eq!(Track::detect(""), Track::Main);
    }

    #[test]
    fn test_track_from_str_accepts_source_labels() {
        assert_eq!("main conference".parse::<Track>().unwrap(), Track::Main);
        assert_eq!(" Workshop ".parse::<Track>().unwrap(), Track::Workshop);
        assert!("poster".parse::<Track>().is_err());
    }

    #[test]
    fn test_track_serde_snake_case() {
        let json = serde_json::to_string(&Track::Workshop).unwrap();
        assert_eq!(json, "\"workshop\"");
    }

    #[test]
    fn test_from_candidate_inherits_parent_year_and_track() {
        let candidate = WorkItemCandidate {
            display_title: "  Deep   Learning\n for Parsing ".to_string(),
            artifact_url: Some("https://example.org/a.pdf".to_string()),
            ..WorkItemCandidate::default()
        };
        let item = WorkItem::from_candidate(
            candidate,
            &collection(),
            &sub_collection(Track::Workshop, None),
            150,
        );

        assert_eq!(item.display_title, "Deep Learning for Parsing");
        assert_eq!(item.identity, "Deep Learning for Parsing");
        assert_eq!(item.hierarchy.year, 2023);
        assert_eq!(item.hierarchy.track, Track::Workshop);
        assert_eq!(item.hierarchy.collection_id, "ACL");
    }

    #[test]
    fn test_from_candidate_most_specific_level_wins() {
        let candidate = WorkItemCandidate {
            display_title: "Paper".to_string(),
            year: Some(2021),
            track: Some(Track::Survey),
            ..WorkItemCandidate::default()
        };
        let item = WorkItem::from_candidate(
            candidate,
            &collection(),
            &sub_collection(Track::Main, Some(2022)),
            150,
        );
        assert_eq!(item.hierarchy.year, 2021);
        assert_eq!(item.hierarchy.track, Track::Survey);
    }

    #[test]
    fn test_from_candidate_year_defaults_to_zero() {
        let mut parent = collection();
        parent.year = None;
        let item = WorkItem::from_candidate(
            WorkItemCandidate {
                display_title: "Paper".to_string(),
                ..WorkItemCandidate::default()
            },
            &parent,
            &sub_collection(Track::Main, None),
            150,
        );
        assert_eq!(item.hierarchy.year, 0);
    }

    #[test]
    fn test_ledger_entry_parses_without_optional_fields() {
        let raw = r#"{
            "identity": "Paper",
            "local_path": "harvest/pdfs/Paper.pdf",
            "year": 2020,
            "collection_id": "PMLR",
            "track": "main",
            "completed_at": "2024-05-01T10:00:00Z"
        }"#;
        let entry: LedgerEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.identity, "Paper");
        assert_eq!(entry.bytes, 0);
        assert!(entry.sha256.is_empty());
    }
}
