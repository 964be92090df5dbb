pub mod table {
    fn sep(widths: &[usize]) -> String {
        let mut s = String::from("+");
        for w in widths {
            s.push_str(&"-".repeat(w + 2));
            s.push('+');
        }
        s
    }

    fn line(cells: &[String], widths: &[usize]) -> String {
        let mut s = String::from("|");
        for (cell, w) in cells.iter().zip(widths) {
            let len = cell.chars().count();
            s.push(' ');
            s.push_str(cell);
            s.push_str(&" ".repeat(w.saturating_sub(len)));
            s.push_str(" |");
        }
        s
    }

    /// Render an ASCII table. Missing cells render empty, extra cells are dropped.
    #[must_use]
    pub fn render(headers: &[&str], rows: &[Vec<String>]) -> String {
        let cols = headers.len();
        let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
        for row in rows {
            for (c, w) in widths.iter_mut().enumerate() {
                *w = (*w).max(row.get(c).map_or(0, |s| s.chars().count()));
            }
        }

        let border = sep(&widths);
        let header_cells: Vec<String> = headers.iter().map(|s| (*s).to_string()).collect();
        let mut out = format!("{border}\n{}\n{border}\n", line(&header_cells, &widths));
        for row in rows {
            let cells: Vec<String> = (0..cols).map(|i| row.get(i).cloned().unwrap_or_default()).collect();
            out.push_str(&line(&cells, &widths));
            out.push('\n');
        }
        out.push_str(&border);
        out
    }

    /// Slice `items` for `--offset/--limit` paging.
    #[must_use]
    pub fn page<T>(items: &[T], offset: usize, limit: Option<usize>) -> &[T] {
        let start = offset.min(items.len());
        let end = limit.map_or(items.len(), |l| start.saturating_add(l).min(items.len()));
        &items[start..end]
    }

    /// Shorten long ids for text tables.
    #[must_use]
    pub fn short_id(id: &str) -> String {
        if id.chars().count() <= 12 {
            id.to_string()
        } else {
            id.chars().take(12).collect()
        }
    }
}

pub mod config {
    //! `atlas-graph.toml` loading. Every field is optional; unset fields keep library defaults.
    use serde::Deserialize;
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::docs::DocConfig;
    use crate::errors::AtlasGraphError;
    use crate::export::{DotOptions, DotTheme, RankDir};
    use crate::graph::NodeKind;
    use crate::persistence::RetryPolicy;
    use crate::store::ServiceSettings;
    use crate::stream::WorkerSettings;

    pub const CONFIG_FILE: &str = "atlas-graph.toml";

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct IngestConfig {
        pub pending_retention_secs: Option<i64>,
        pub bulk_ratio: Option<f64>,
        pub queue_capacity: Option<usize>,
        pub batch_size: Option<usize>,
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct TraversalConfig {
        pub time_budget_ms: Option<u64>,
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct DocsConfig {
        pub partial_threshold: Option<f64>,
        pub centrality_cap: Option<usize>,
        pub placeholder_hashes: Option<Vec<String>>,
        /// Node kind (snake_case) to documentable attribute keys; replaces the default per kind.
        pub documentable: Option<BTreeMap<String, Vec<String>>>,
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct PersistenceConfig {
        pub max_attempts: Option<u32>,
        pub initial_backoff_ms: Option<u64>,
        pub backoff_multiplier: Option<f64>,
        pub max_backoff_ms: Option<u64>,
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct DotConfig {
        pub clusters: Option<bool>,
        pub legend: Option<bool>,
        pub theme: Option<String>,   // "light" | "dark"
        pub rankdir: Option<String>, // "LR" | "TB"
        pub rounded: Option<bool>,
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct QueryConfig {
        pub default_format: Option<String>, // "text" | "json"
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub struct Config {
        pub ingest: Option<IngestConfig>,
        pub traversal: Option<TraversalConfig>,
        pub docs: Option<DocsConfig>,
        pub persistence: Option<PersistenceConfig>,
        pub dot: Option<DotConfig>,
        pub query: Option<QueryConfig>,
    }

    impl Config {
        /// # Errors
        /// Returns `AtlasGraphError::Config` for out-of-range values or unknown node kinds.
        pub fn service_settings(&self) -> Result<ServiceSettings, AtlasGraphError> {
            let mut s = ServiceSettings::default();
            if let Some(i) = &self.ingest {
                if let Some(secs) = i.pending_retention_secs {
                    if secs < 0 {
                        return Err(AtlasGraphError::Config("ingest.pending_retention_secs must be >= 0".into()));
                    }
                    s.builder.pending_retention = chrono::Duration::seconds(secs);
                }
                if let Some(r) = i.bulk_ratio {
                    if !(0.0..=1.0).contains(&r) {
                        return Err(AtlasGraphError::Config("ingest.bulk_ratio must be within [0, 1]".into()));
                    }
                    s.builder.bulk_ratio = r;
                }
            }
            if let Some(t) = &self.traversal {
                s.traversal_budget = t.time_budget_ms.map(Duration::from_millis);
            }
            if let Some(d) = &self.docs {
                s.docs = doc_config(d)?;
            }
            if let Some(p) = &self.persistence {
                s.retry = retry_policy(p)?;
            }
            Ok(s)
        }

        /// # Errors
        /// Returns `AtlasGraphError::Config` when a queue or batch size is zero.
        pub fn worker_settings(&self) -> Result<WorkerSettings, AtlasGraphError> {
            let mut w = WorkerSettings::default();
            if let Some(i) = &self.ingest {
                if let Some(c) = i.queue_capacity {
                    if c == 0 {
                        return Err(AtlasGraphError::Config("ingest.queue_capacity must be > 0".into()));
                    }
                    w.queue_capacity = c;
                }
                if let Some(b) = i.batch_size {
                    if b == 0 {
                        return Err(AtlasGraphError::Config("ingest.batch_size must be > 0".into()));
                    }
                    w.batch_size = b;
                }
            }
            Ok(w)
        }

        /// Apply `[dot]` overrides on top of `base`.
        #[must_use]
        pub fn dot_options(&self, base: DotOptions) -> DotOptions {
            let mut o = base;
            if let Some(dot) = &self.dot {
                if let Some(v) = dot.clusters {
                    o.clusters = v;
                }
                if let Some(v) = dot.legend {
                    o.legend = v;
                }
                if let Some(v) = &dot.theme {
                    o.theme = if v.eq_ignore_ascii_case("dark") { DotTheme::Dark } else { DotTheme::Light };
                }
                if let Some(v) = &dot.rankdir {
                    o.rankdir = if v.eq_ignore_ascii_case("TB") { RankDir::TB } else { RankDir::LR };
                }
                if let Some(v) = dot.rounded {
                    o.rounded = v;
                }
            }
            o
        }

        #[must_use]
        pub fn default_format(&self) -> Option<&str> {
            self.query.as_ref().and_then(|q| q.default_format.as_deref())
        }
    }

    fn doc_config(d: &DocsConfig) -> Result<DocConfig, AtlasGraphError> {
        let mut c = DocConfig::default();
        if let Some(t) = d.partial_threshold {
            if !(t > 0.0 && t < 1.0) {
                return Err(AtlasGraphError::Config("docs.partial_threshold must be within (0, 1)".into()));
            }
            c.partial_threshold = t;
        }
        if let Some(cap) = d.centrality_cap {
            c.centrality_cap = cap.max(1);
        }
        if let Some(h) = &d.placeholder_hashes {
            c.placeholder_hashes.extend(h.iter().cloned());
        }
        if let Some(map) = &d.documentable {
            for (kind, keys) in map {
                let k = NodeKind::parse(kind)
                    .ok_or_else(|| AtlasGraphError::Config(format!("docs.documentable: unknown node kind '{kind}'")))?;
                let keys: BTreeSet<String> = keys.iter().cloned().collect();
                c.documentable.insert(k, keys.into_iter().collect());
            }
        }
        Ok(c)
    }

    fn retry_policy(p: &PersistenceConfig) -> Result<RetryPolicy, AtlasGraphError> {
        let mut r = RetryPolicy::default();
        if let Some(a) = p.max_attempts {
            if a == 0 {
                return Err(AtlasGraphError::Config("persistence.max_attempts must be > 0".into()));
            }
            r.max_attempts = a;
        }
        if let Some(ms) = p.initial_backoff_ms {
            r.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(m) = p.backoff_multiplier {
            if m < 1.0 {
                return Err(AtlasGraphError::Config("persistence.backoff_multiplier must be >= 1".into()));
            }
            r.multiplier = m;
        }
        if let Some(ms) = p.max_backoff_ms {
            r.max_backoff = Duration::from_millis(ms);
        }
        Ok(r)
    }

    #[must_use]
    pub fn default_config_path(state_dir: &Path) -> PathBuf {
        state_dir.join(CONFIG_FILE)
    }

    /// # Errors
    /// Returns `AtlasGraphError` if the file cannot be read or is not valid TOML for `Config`.
    pub fn load_config_at(path: &Path) -> Result<Config, AtlasGraphError> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str::<Config>(&data)?)
    }

    /// Explicit `--config` path wins; otherwise `atlas-graph.toml` next to the state directory.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when a config file exists but cannot be loaded.
    pub fn resolve_config(explicit: Option<&Path>, state_dir: Option<&Path>) -> Result<Config, AtlasGraphError> {
        if let Some(p) = explicit {
            return load_config_at(p);
        }
        match state_dir.map(default_config_path) {
            Some(p) if p.exists() => load_config_at(&p),
            _ => Ok(Config::default()),
        }
    }
}

pub mod logging {
    use tracing_subscriber::EnvFilter;

    /// Install the stderr subscriber. `RUST_LOG` wins over the verbosity flags.
    pub fn init(quiet: bool, verbose: u8) {
        let default = if quiet {
            "warn"
        } else {
            match verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        // A second init (tests running the CLI in-process) is a no-op
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::config::*;
    use super::table::*;
    use crate::graph::NodeKind;

    #[test]
    fn table_pads_and_fills_missing_cells() {
        let t = render(&["Name", "N"], &[vec!["build".into(), "3".into()], vec!["x".into()]]);
        let lines: Vec<&str> = t.lines().collect();
        assert_eq!(lines[0], "+-------+---+");
        assert_eq!(lines[1], "| Name  | N |");
        assert_eq!(lines[3], "| build | 3 |");
        assert_eq!(lines[4], "| x     |   |");
    }

    #[test]
    fn page_clamps_bounds() {
        let v = [1, 2, 3, 4];
        assert_eq!(page(&v, 1, Some(2)), &[2, 3]);
        assert_eq!(page(&v, 3, Some(10)), &[4]);
        assert!(page(&v, 9, None).is_empty());
    }

    #[test]
    fn config_overrides_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [ingest]
            pending_retention_secs = 60
            batch_size = 8
            [docs]
            partial_threshold = 0.4
            documentable = { job = ["image"] }
            [persistence]
            max_attempts = 5
            [dot]
            theme = "dark"
            "#,
        )
        .unwrap();
        let s = cfg.service_settings().unwrap();
        assert_eq!(s.builder.pending_retention, chrono::Duration::seconds(60));
        assert_eq!(s.docs.documentable[&NodeKind::Job], vec!["image".to_string()]);
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(cfg.worker_settings().unwrap().batch_size, 8);
        let dot = cfg.dot_options(crate::export::DotOptions::default());
        assert_eq!(dot.theme, crate::export::DotTheme::Dark);
    }

    #[test]
    fn config_rejects_bad_values() {
        let cfg: Config = toml::from_str("[docs]\ndocumentable = { gizmo = [\"a\"] }\n").unwrap();
        assert!(cfg.service_settings().is_err());
        assert!(toml::from_str::<Config>("[ingest]\nnope = 1\n").is_err());
    }
}
