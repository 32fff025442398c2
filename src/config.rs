//! # Seed Directory Configuration
//!
//! Both node roles read the same `config.csv`: one seed per line, `IP,PORT`,
//! ASCII. The directory is fixed for the lifetime of the process and drives
//! the consensus majority, so loading fails fast on any malformed or
//! duplicate entry rather than running with a partial view.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::identity::NodeId;

/// The well-known set of seed coordinators.
#[derive(Clone, Debug)]
pub struct SeedDirectory {
    seeds: Vec<NodeId>,
}

impl SeedDirectory {
    /// Load the directory from `config.csv`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading seed config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing seed config {}", path.display()))
    }

    /// Parse directory contents: one `IP,PORT` per non-empty line.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut seeds = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (ip, port) = line
                .split_once(',')
                .with_context(|| format!("line {}: expected IP,PORT", lineno + 1))?;
            let ip = ip
                .trim()
                .parse()
                .with_context(|| format!("line {}: invalid IP {:?}", lineno + 1, ip.trim()))?;
            let port = port
                .trim()
                .parse()
                .with_context(|| format!("line {}: invalid port {:?}", lineno + 1, port.trim()))?;
            let seed = NodeId::new(ip, port);
            if seeds.contains(&seed) {
                bail!("line {}: duplicate seed {seed}", lineno + 1);
            }
            seeds.push(seed);
        }
        if seeds.is_empty() {
            bail!("no seeds configured");
        }
        Ok(Self { seeds })
    }

    pub fn seeds(&self) -> &[NodeId] {
        &self.seeds
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Consensus majority over the configured seeds: `floor(n/2) + 1`.
    pub fn majority(&self) -> usize {
        self.seeds.len() / 2 + 1
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.seeds.contains(id)
    }

    /// The directory entry listening on `port`, used by a starting seed to
    /// learn its own advertised IP.
    pub fn entry_for_port(&self, port: u16) -> Option<NodeId> {
        self.seeds.iter().copied().find(|s| s.port == port)
    }

    /// Every seed except `this`.
    pub fn others(&self, this: NodeId) -> Vec<NodeId> {
        self.seeds.iter().copied().filter(|s| *s != this).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_directory() {
        let dir = SeedDirectory::parse("127.0.0.1,5001\n127.0.0.1,5002\n127.0.0.1,5003\n").unwrap();
        assert_eq!(dir.len(), 3);
        assert_eq!(dir.majority(), 2);
        assert_eq!(
            dir.entry_for_port(5002),
            Some("127.0.0.1:5002".parse().unwrap())
        );
    }

    #[test]
    fn skips_blank_lines() {
        let dir = SeedDirectory::parse("\n127.0.0.1,5001\n\n").unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.majority(), 1);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(SeedDirectory::parse("127.0.0.1 5001").is_err());
        assert!(SeedDirectory::parse("nothost,5001").is_err());
        assert!(SeedDirectory::parse("127.0.0.1,notaport").is_err());
        assert!(SeedDirectory::parse("").is_err());
    }

    #[test]
    fn rejects_duplicates() {
        assert!(SeedDirectory::parse("127.0.0.1,5001\n127.0.0.1,5001").is_err());
    }

    #[test]
    fn others_excludes_self() {
        let dir = SeedDirectory::parse("127.0.0.1,5001\n127.0.0.1,5002").unwrap();
        let me: NodeId = "127.0.0.1:5001".parse().unwrap();
        assert_eq!(dir.others(me), vec!["127.0.0.1:5002".parse().unwrap()]);
    }
}
