//! Effective parameter resolution.
//!
//! Precedence, high to low:
//!
//! 1. the manual override set for the slug, when non-empty;
//! 2. auto-discovered defaults: an inline `-- @params {...}` directive in
//!    the first 4 KiB of the template, else the parameters sidecar;
//! 3. the empty set.
//!
//! Auto-discovery is best effort. Unreadable files and malformed JSON fall
//! through to the next source without being reported.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{parameter_set_from_json, ParameterSet};
use crate::storage::FacetLayout;

/// Bytes of the template scanned for an inline directive.
pub const DIRECTIVE_SCAN_BYTES: u64 = 4096;

const DIRECTIVE_TAGS: [&str; 2] = ["@parameters", "@params"];

/// Manual parameter overrides, keyed by slug.
///
/// Only explicit `set`/`clear` calls change it; reads never do.
#[derive(Default)]
pub struct ParameterCache {
    inner: RwLock<HashMap<String, ParameterSet>>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, slug: &str) -> Option<ParameterSet> {
        self.inner.read().await.get(slug).cloned()
    }

    pub async fn set(&self, slug: &str, parameters: ParameterSet) {
        self.inner
            .write()
            .await
            .insert(slug.to_string(), parameters);
    }

    pub async fn clear(&self, slug: &str) -> bool {
        self.inner.write().await.remove(slug).is_some()
    }

    /// Whether the slug has a non-empty manual set.
    pub async fn has_manual(&self, slug: &str) -> bool {
        self.inner
            .read()
            .await
            .get(slug)
            .is_some_and(|p| !p.is_empty())
    }
}

pub struct ParameterResolver {
    cache: Arc<ParameterCache>,
}

impl ParameterResolver {
    pub fn new(cache: Arc<ParameterCache>) -> Self {
        Self { cache }
    }

    pub async fn effective_parameters(&self, slug: &str, layout: Option<&FacetLayout>) -> ParameterSet {
        if let Some(manual) = self.cache.get(slug).await {
            if !manual.is_empty() {
                return manual;
            }
        }
        layout.and_then(discover).unwrap_or_default()
    }
}

/// Auto-discover defaults for a layout: inline directive first, then the
/// sidecar.
pub fn discover(layout: &FacetLayout) -> Option<ParameterSet> {
    if let Some(found) = layout.template_path.as_deref().and_then(read_inline_directive) {
        return Some(found);
    }
    read_sidecar(&layout.parameters_sidecar)
}

pub fn read_inline_directive(template: &Path) -> Option<ParameterSet> {
    let file = std::fs::File::open(template).ok()?;
    let mut head = Vec::new();
    file.take(DIRECTIVE_SCAN_BYTES).read_to_end(&mut head).ok()?;
    parse_inline_directive(&String::from_utf8_lossy(&head))
}

/// Find the first `-- @params {json}` line carrying a JSON object.
pub fn parse_inline_directive(text: &str) -> Option<ParameterSet> {
    text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("--")?.trim_start();
        let json = DIRECTIVE_TAGS
            .iter()
            .find_map(|tag| rest.strip_prefix(tag))?
            .trim();
        let value: serde_json::Value = serde_json::from_str(json).ok()?;
        parameter_set_from_json(&value)
    })
}

pub fn read_sidecar(path: &Path) -> Option<ParameterSet> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    parameter_set_from_json(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn layout(template: Option<PathBuf>, sidecar: PathBuf) -> FacetLayout {
        FacetLayout {
            slug: "customers".into(),
            template_path: template,
            cache_template_path: None,
            parameters_sidecar: sidecar,
        }
    }

    #[test]
    fn directive_forms() {
        let p = parse_inline_directive("SELECT 1\n  -- @params {\"id\": \"7\", \"n\": 2}\n").unwrap();
        assert_eq!(p.get("id").map(String::as_str), Some("7"));
        assert_eq!(p.get("n").map(String::as_str), Some("2"));

        let p = parse_inline_directive("--@parameters {\"a\":\"b\"}").unwrap();
        assert_eq!(p.get("a").map(String::as_str), Some("b"));

        assert!(parse_inline_directive("-- @params [1,2]").is_none());
        assert!(parse_inline_directive("-- @params {broken").is_none());
        assert!(parse_inline_directive("SELECT '@params {}'").is_none());
    }

    #[test]
    fn directive_beyond_scan_window_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("t.sql");
        let padding = "-- filler\n".repeat(500);
        std::fs::write(&template, format!("{padding}-- @params {{\"id\":\"1\"}}\n")).unwrap();
        assert!(read_inline_directive(&template).is_none());
    }

    #[test]
    fn falls_back_to_sidecar_then_empty() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("t.sql");
        let sidecar = tmp.path().join("t.sql.vars.json");
        std::fs::write(&template, "SELECT 1").unwrap();

        let l = layout(Some(template.clone()), sidecar.clone());
        assert!(discover(&l).is_none());

        std::fs::write(&sidecar, "{ not json").unwrap();
        assert!(discover(&l).is_none());

        std::fs::write(&sidecar, r#"{"region":"eu"}"#).unwrap();
        let found = discover(&l).unwrap();
        assert_eq!(found.get("region").map(String::as_str), Some("eu"));
    }

    #[tokio::test]
    async fn manual_set_wins_when_non_empty() {
        let tmp = TempDir::new().unwrap();
        let template = tmp.path().join("t.sql");
        std::fs::write(&template, "-- @params {\"id\":\"auto\"}\nSELECT 1").unwrap();
        let l = layout(Some(template), tmp.path().join("t.sql.vars.json"));

        let cache = Arc::new(ParameterCache::new());
        let resolver = ParameterResolver::new(cache.clone());

        let auto = resolver.effective_parameters("customers", Some(&l)).await;
        assert_eq!(auto.get("id").map(String::as_str), Some("auto"));

        cache.set("customers", ParameterSet::new()).await;
        let still_auto = resolver.effective_parameters("customers", Some(&l)).await;
        assert_eq!(still_auto, auto);

        let mut manual = ParameterSet::new();
        manual.insert("id".into(), "manual".into());
        cache.set("customers", manual.clone()).await;
        assert_eq!(resolver.effective_parameters("customers", Some(&l)).await, manual);
        assert_eq!(resolver.effective_parameters("customers", None).await, manual);
    }
}
