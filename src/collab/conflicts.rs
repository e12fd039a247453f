//! Last-writer-wins resolution for replicated entities
//!
//! An incoming copy replaces the local one wholesale when its version is
//! higher, or when versions tie and its timestamp is later. Everything else,
//! exact equality included, is discarded. Fields are never merged.

use chrono::{DateTime, Utc};

use crate::models::{Contract, Project, RepoContext};

/// An entity replicated as a single register
pub trait Replicated {
    fn version(&self) -> u64;
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Replicated for Contract {
    fn version(&self) -> u64 {
        self.version
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

// Projects and repos carry no version number; the timestamp decides.
// A project competes on its header stamp only, so nested activity never
// shadows a status or name change.
impl Replicated for Project {
    fn version(&self) -> u64 {
        0
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.header_updated_at
    }
}

impl Replicated for RepoContext {
    fn version(&self) -> u64 {
        0
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Decision for one incoming copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    AcceptIncoming,
    KeepLocal,
}

pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve<T: Replicated>(local: &T, incoming: &T) -> Resolution {
        if Self::supersedes(local, incoming) {
            Resolution::AcceptIncoming
        } else {
            Resolution::KeepLocal
        }
    }

    /// True when `incoming` should replace `local`
    pub fn supersedes<T: Replicated>(local: &T, incoming: &T) -> bool {
        match incoming.version().cmp(&local.version()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => incoming.updated_at() > local.updated_at(),
        }
    }
}
