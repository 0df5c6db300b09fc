//! Per-facet storage addressing.
//!
//! Given the backend-reported configuration of a resource, decide for each
//! facet whether its document is a virtual address served by this engine
//! or a real file on disk:
//!
//! | Facet | Address |
//! |-------|---------|
//! | `config`, `cache`, `results` | always virtual |
//! | `template` | the template source file when configured, else virtual |
//! | `cacheTemplate` | the cache template file when configured, else virtual |
//! | `parameters` | the parameters sidecar file |
//!
//! The sidecar is `<template-path>.vars.json` when a template file is
//! configured, otherwise `<fallback_dir>/<slug>.vars.json`. This module is
//! the only place that creates files, and [`ensure_parameters_sidecar`]
//! never overwrites an existing sidecar.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::WorkspaceConfig;
use crate::facets::{Facet, StorageAddress, VirtualAddress};
use crate::models::{parameter_set_to_json, ParameterSet};

/// Extension appended to a template path to form its sidecar.
pub const SIDECAR_SUFFIX: &str = ".vars.json";

const TEMPLATE_KEYS: [&str; 3] = ["template-source", "template_source", "templateSource"];
const CACHE_TEMPLATE_KEYS: [&str; 4] = [
    "template-file",
    "template_file",
    "template-source",
    "templateFile",
];

/// Resolved storage of every facet of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacetLayout {
    pub slug: String,
    pub template_path: Option<PathBuf>,
    pub cache_template_path: Option<PathBuf>,
    pub parameters_sidecar: PathBuf,
}

impl FacetLayout {
    pub fn address(&self, facet: Facet) -> StorageAddress {
        let virtual_addr = || StorageAddress::Virtual(VirtualAddress::new(&self.slug, facet));
        match facet {
            Facet::Template => self
                .template_path
                .clone()
                .map(StorageAddress::File)
                .unwrap_or_else(virtual_addr),
            Facet::CacheTemplate => self
                .cache_template_path
                .clone()
                .map(StorageAddress::File)
                .unwrap_or_else(virtual_addr),
            Facet::Parameters => StorageAddress::File(self.parameters_sidecar.clone()),
            Facet::Config | Facet::Cache | Facet::Results => virtual_addr(),
        }
    }

    /// Every facet paired with its address, in display order.
    pub fn entries(&self) -> Vec<(Facet, StorageAddress)> {
        Facet::ALL.iter().map(|f| (*f, self.address(*f))).collect()
    }
}

pub struct FacetStorageResolver {
    workspace_roots: Vec<PathBuf>,
    fallback_dir: Option<PathBuf>,
}

impl FacetStorageResolver {
    pub fn new(workspace_roots: Vec<PathBuf>, fallback_dir: Option<PathBuf>) -> Self {
        Self {
            workspace_roots,
            fallback_dir,
        }
    }

    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self::new(config.roots.clone(), config.fallback_dir.clone())
    }

    /// First workspace root, else the process working directory.
    pub fn anchor(&self) -> Result<PathBuf> {
        match self.workspace_roots.first() {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().context("No workspace root and no working directory"),
        }
    }

    /// Anchor a configured source path: absolute paths are kept, relative
    /// ones are joined onto [`anchor`](Self::anchor).
    pub fn anchor_path(&self, source: &str) -> Result<PathBuf> {
        let path = Path::new(source);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.anchor()?.join(path))
        }
    }

    pub fn fallback_dir(&self) -> Result<PathBuf> {
        match &self.fallback_dir {
            Some(dir) if dir.is_absolute() => Ok(dir.clone()),
            Some(dir) => Ok(self.anchor()?.join(dir)),
            None => Ok(self.anchor()?.join(".epw").join("parameters")),
        }
    }

    /// Resolve the layout of `slug` from its current configuration.
    pub fn resolve(&self, config: &Value, slug: &str) -> Result<FacetLayout> {
        let template_path = template_source(config)
            .map(|s| self.anchor_path(s))
            .transpose()?;
        let cache_template_path = cache_template_source(config)
            .map(|s| self.anchor_path(s))
            .transpose()?;

        let parameters_sidecar = match &template_path {
            Some(template) => sidecar_path(template),
            None => self.fallback_dir()?.join(format!("{slug}{SIDECAR_SUFFIX}")),
        };

        Ok(FacetLayout {
            slug: slug.to_string(),
            template_path,
            cache_template_path,
            parameters_sidecar,
        })
    }
}

/// `<template>.vars.json`
pub fn sidecar_path(template: &Path) -> PathBuf {
    let mut name = template.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn non_empty_str<'a>(object: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| object.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

pub fn template_source(config: &Value) -> Option<&str> {
    non_empty_str(config, &TEMPLATE_KEYS)
}

pub fn cache_template_source(config: &Value) -> Option<&str> {
    config
        .get("cache")
        .and_then(|cache| non_empty_str(cache, &CACHE_TEMPLATE_KEYS))
}

/// Create the sidecar with `defaults` if it does not exist yet.
///
/// Returns whether a file was created. An existing sidecar is left
/// byte-for-byte untouched.
pub fn ensure_parameters_sidecar(layout: &FacetLayout, defaults: &ParameterSet) -> Result<bool> {
    let path = &layout.parameters_sidecar;
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create sidecar directory: {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(&parameter_set_to_json(defaults))?;
    let created = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(content.as_bytes()));

    match created {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "created parameters sidecar");
            Ok(true)
        }
        // lost a race with another opener
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to create sidecar: {}", path.display()))),
    }
}

/// Replace the sidecar contents with `parameters`.
pub fn write_parameters_sidecar(layout: &FacetLayout, parameters: &ParameterSet) -> Result<()> {
    let path = &layout.parameters_sidecar;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create sidecar directory: {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(&parameter_set_to_json(parameters))?;
    atomic_write_file(path, content.as_bytes())
        .with_context(|| format!("Failed to write sidecar: {}", path.display()))
}

fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let tmp_path = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("sidecar"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    ));

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(parent)
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
