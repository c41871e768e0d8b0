//! Last-observed version per cluster member.
//!
//! Members record their version whenever a check reads it, so later actions
//! in the same pass (and later passes) can reason about their peers without
//! contacting them.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::store::{KvStore, StoreKey};

const ROOT: &str = "shards";
const LEAF: &str = "version";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberVersion {
    pub shard: String,
    pub member: String,
    pub version: String,
}

#[derive(Clone)]
pub struct VersionStore {
    kv: Arc<dyn KvStore>,
}

impl VersionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(shard: &str, member: &str) -> Result<StoreKey> {
        StoreKey::new([ROOT, shard, member, LEAF])
    }

    pub fn record(&self, shard: &str, member: &str, version: &str) -> Result<()> {
        tracing::debug!(shard, member, version, "recording version");
        self.kv.set(&Self::key(shard, member)?, version)
    }

    pub fn get(&self, shard: &str, member: &str) -> Result<Option<String>> {
        self.kv.get(&Self::key(shard, member)?)
    }

    /// Every recorded member, optionally restricted to one shard.
    pub fn list(&self, shard: Option<&str>) -> Result<Vec<MemberVersion>> {
        let prefix = match shard {
            Some(s) => StoreKey::new([ROOT, s])?,
            None => StoreKey::new([ROOT])?,
        };
        Ok(self
            .kv
            .list(&prefix)?
            .into_iter()
            .filter_map(|(key, version)| match key.segments() {
                [_, shard, member, leaf] if leaf == LEAF => Some(MemberVersion {
                    shard: shard.clone(),
                    member: member.clone(),
                    version,
                }),
                _ => None,
            })
            .collect())
    }

    /// Recorded versions of the other members of `shard`.
    pub fn peers(&self, shard: &str, member: &str) -> Result<Vec<MemberVersion>> {
        Ok(self
            .list(Some(shard))?
            .into_iter()
            .filter(|m| m.member != member)
            .collect())
    }

    /// True when `member` is the last one in its shard not yet at `desired`:
    /// its own recorded version differs from `desired`, exactly
    /// `expected_peers` peers are recorded and all of them already run
    /// `desired`. An unknown or short peer list is `false`.
    pub fn peers_at_version(
        &self,
        shard: &str,
        member: &str,
        desired: &str,
        expected_peers: usize,
    ) -> Result<bool> {
        if self.get(shard, member)?.as_deref() == Some(desired) {
            tracing::debug!(shard, member, desired, "member already upgraded");
            return Ok(false);
        }
        let peers = self.peers(shard, member)?;
        tracing::debug!(
            shard,
            member,
            versions = ?peers.iter().map(|p| p.version.as_str()).collect::<Vec<_>>(),
            "peer versions"
        );
        if peers.is_empty() || peers.len() != expected_peers {
            return Ok(false);
        }
        Ok(peers.iter().all(|p| p.version == desired))
    }
}
