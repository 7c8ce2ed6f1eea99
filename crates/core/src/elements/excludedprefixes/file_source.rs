//! Operator-managed excluded prefixes, decoded from a YAML document with a
//! top-level `prefixes:` list. Watching the file for changes is left to the
//! host; it re-reads through [`PrefixesFile::reload`] and every request sees
//! the swapped set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, serde::Deserialize)]
struct PrefixesDocument {
    #[serde(default)]
    prefixes: Vec<String>,
}

pub fn decode_prefixes_yaml(contents: &str) -> anyhow::Result<Vec<String>> {
    let doc: PrefixesDocument = serde_yaml::from_str(contents)?;
    for prefix in &doc.prefixes {
        prefix
            .parse::<ipnet::IpNet>()
            .map_err(|e| anyhow::anyhow!("invalid prefix {prefix}: {e}"))?;
    }
    Ok(doc.prefixes)
}

/// Atomically swappable prefix list shared with the exclude element.
#[derive(Clone, Default)]
pub struct PrefixesHandle {
    inner: Arc<RwLock<Vec<String>>>,
}

impl PrefixesHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Vec<String> {
        self.inner.read().clone()
    }

    pub fn swap(&self, prefixes: Vec<String>) {
        *self.inner.write() = prefixes;
    }
}

pub struct PrefixesFile {
    path: PathBuf,
    handle: PrefixesHandle,
}

impl PrefixesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: PrefixesHandle::new(),
        }
    }

    pub fn handle(&self) -> PrefixesHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload(&self) -> anyhow::Result<()> {
        let contents = std::fs::read_to_string(&self.path)?;
        let prefixes = decode_prefixes_yaml(&contents)?;
        tracing::debug!(path = %self.path.display(), count = prefixes.len(), "reloaded excluded prefixes");
        self.handle.swap(prefixes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_prefixes_key() {
        let doc = "prefixes:\n  - 172.16.0.0/12\n  - 10.32.0.0/11\n";
        let prefixes = decode_prefixes_yaml(doc).unwrap();
        assert_eq!(prefixes, vec!["172.16.0.0/12", "10.32.0.0/11"]);
    }

    #[test]
    fn missing_key_means_no_prefixes() {
        assert!(decode_prefixes_yaml("{}").unwrap().is_empty());
    }

    #[test]
    fn malformed_prefixes_are_rejected() {
        assert!(decode_prefixes_yaml("prefixes:\n  - not-a-cidr\n").is_err());
    }

    #[test]
    fn handle_swaps_are_visible() {
        let handle = PrefixesHandle::new();
        assert!(handle.get().is_empty());
        handle.swap(vec!["10.0.0.0/8".into()]);
        assert_eq!(handle.get(), vec!["10.0.0.0/8"]);
    }

    #[test]
    fn reload_picks_up_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("excluded_prefixes.yaml");
        std::fs::write(&path, "prefixes:\n  - 172.16.0.0/12\n").unwrap();

        let file = PrefixesFile::new(&path);
        let handle = file.handle();
        file.reload().unwrap();
        assert_eq!(handle.get(), vec!["172.16.0.0/12"]);

        std::fs::write(&path, "prefixes:\n  - 10.32.0.0/11\n  - 172.16.0.0/12\n").unwrap();
        file.reload().unwrap();
        assert_eq!(handle.get(), vec!["10.32.0.0/11", "172.16.0.0/12"]);
    }
}
