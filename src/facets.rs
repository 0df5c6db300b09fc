//! Facets of a resource and the addresses they live at.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::WorkbenchError;

/// URI scheme for addresses served by this engine.
pub const DEFAULT_SCHEME: &str = "epw";

/// One editable view of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Facet {
    Config,
    Template,
    Cache,
    CacheTemplate,
    Parameters,
    Results,
}

impl Facet {
    pub const ALL: [Facet; 6] = [
        Facet::Config,
        Facet::Template,
        Facet::Cache,
        Facet::CacheTemplate,
        Facet::Parameters,
        Facet::Results,
    ];

    /// Facets whose content depends on the saved remote resource and is
    /// refreshed after every successful save.
    pub const SAVE_INVALIDATED: [Facet; 5] = [
        Facet::Config,
        Facet::Template,
        Facet::Cache,
        Facet::CacheTemplate,
        Facet::Parameters,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Facet::Config => "config",
            Facet::Template => "template",
            Facet::Cache => "cache",
            Facet::CacheTemplate => "cacheTemplate",
            Facet::Parameters => "parameters",
            Facet::Results => "results",
        }
    }

    pub fn from_name(name: &str) -> Option<Facet> {
        Facet::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Layout slot the facet is displayed in when a resource is opened.
    pub fn slot(&self) -> PanelSlot {
        match self {
            Facet::Config => PanelSlot::Left,
            Facet::Template => PanelSlot::Center,
            Facet::Cache | Facet::CacheTemplate => PanelSlot::Right,
            Facet::Parameters | Facet::Results => PanelSlot::Bottom,
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the host should place a facet's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PanelSlot {
    Left,
    Center,
    Right,
    Bottom,
}

/// Address of a document owned by this engine: `<scheme>://<slug>/<facet>`.
///
/// The facet is kept as a raw name so that addresses naming facets this
/// engine does not know can still be parsed and answered with a
/// placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualAddress {
    pub scheme: String,
    pub slug: String,
    pub facet_name: String,
}

impl VirtualAddress {
    pub fn new(slug: impl Into<String>, facet: Facet) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            slug: slug.into(),
            facet_name: facet.name().to_string(),
        }
    }

    pub fn facet(&self) -> Option<Facet> {
        Facet::from_name(&self.facet_name)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.slug, self.facet_name)
    }
}

impl FromStr for VirtualAddress {
    type Err = WorkbenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WorkbenchError::InvalidAddress(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (slug, facet_name) = rest.rsplit_once('/').ok_or_else(invalid)?;
        if scheme.is_empty() || slug.is_empty() || facet_name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            slug: slug.to_string(),
            facet_name: facet_name.to_string(),
        })
    }
}

/// Storage location of one facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "camelCase")]
pub enum StorageAddress {
    Virtual(VirtualAddress),
    File(PathBuf),
}

impl StorageAddress {
    pub fn as_virtual(&self) -> Option<&VirtualAddress> {
        match self {
            StorageAddress::Virtual(addr) => Some(addr),
            StorageAddress::File(_) => None,
        }
    }

    /// Document identifier used when talking to the host (diagnostics,
    /// panel placement): the virtual URI or the file path.
    pub fn document_id(&self) -> String {
        match self {
            StorageAddress::Virtual(addr) => addr.to_string(),
            StorageAddress::File(path) => path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facet_names_round_trip() {
        for facet in Facet::ALL {
            assert_eq!(Facet::from_name(facet.name()), Some(facet));
        }
        assert_eq!(Facet::from_name("nope"), None);
    }

    #[test]
    fn facet_serializes_camel_case() {
        let json = serde_json::to_string(&Facet::CacheTemplate).unwrap();
        assert_eq!(json, "\"cacheTemplate\"");
    }

    #[test]
    fn address_display_and_parse() {
        let addr = VirtualAddress::new("customers-slash", Facet::CacheTemplate);
        let text = addr.to_string();
        assert_eq!(text, "epw://customers-slash/cacheTemplate");
        let parsed: VirtualAddress = text.parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.facet(), Some(Facet::CacheTemplate));
    }

    #[test]
    fn address_with_unknown_facet_still_parses() {
        let parsed: VirtualAddress = "epw://orders/lineage".parse().unwrap();
        assert_eq!(parsed.facet_name, "lineage");
        assert_eq!(parsed.facet(), None);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!("orders/config".parse::<VirtualAddress>().is_err());
        assert!("epw://orders".parse::<VirtualAddress>().is_err());
        assert!("epw:///config".parse::<VirtualAddress>().is_err());
    }

    #[test]
    fn results_is_not_save_invalidated() {
        assert!(!Facet::SAVE_INVALIDATED.contains(&Facet::Results));
        assert_eq!(Facet::SAVE_INVALIDATED.len(), 5);
    }
}
