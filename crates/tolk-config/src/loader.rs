// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/tolk/config.yaml"),
        PathBuf::from("/etc/tolk/config.yml"),
        PathBuf::from(".tolk/config.yaml"),
        PathBuf::from(".tolk/config.yml"),
        PathBuf::from("tolk.yaml"),
        PathBuf::from("tolk.yml"),
    ]
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (d, s) => *d = s,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_explicit_path_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/tolk.yaml"))).is_err());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "queue:\n  capacity: 17").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.queue.capacity, 17);
        // Untouched sections keep their defaults.
        assert_eq!(
            cfg.batch.max_items_per_batch,
            crate::BatchConfig::default().max_items_per_batch
        );
    }

    #[test]
    fn merge_prefers_src_scalars_and_keeps_dst_extras() {
        let mut dst: serde_yaml::Value =
            serde_yaml::from_str("a: 1\nnested:\n  x: 1\n  y: 2").unwrap();
        let src: serde_yaml::Value = serde_yaml::from_str("a: 9\nnested:\n  x: 7").unwrap();
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"], serde_yaml::Value::from(9));
        assert_eq!(dst["nested"]["x"], serde_yaml::Value::from(7));
        assert_eq!(dst["nested"]["y"], serde_yaml::Value::from(2));
    }
}
