//! Virtual document content, one provider per facet.
//!
//! [`ContentProviderRegistry::read`] dispatches a [`VirtualAddress`] by
//! `(scheme, slug, facet)` to the registered [`FacetProvider`]. Every read
//! goes back to the backend, except the `parameters` facet, which renders
//! the manual override set held in the [`ParameterCache`].
//!
//! Reads never fail. A backend error becomes placeholder text (or a
//! `{"error": ...}` object for the JSON facets), and an address naming an
//! unknown facet or a foreign scheme yields [`DocumentContent::Unknown`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::backend::ConfigBackend;
use crate::facets::{Facet, VirtualAddress, DEFAULT_SCHEME};
use crate::history::TestStateStore;
use crate::host::ContentChangeListener;
use crate::models::{parameter_set_to_json, ParameterSet};
use crate::parameters::ParameterCache;

/// What a virtual document resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentContent {
    Text(String),
    /// The address is not served by any provider. Carries placeholder text.
    Unknown(String),
}

impl DocumentContent {
    pub fn text(&self) -> &str {
        match self {
            DocumentContent::Text(text) | DocumentContent::Unknown(text) => text,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, DocumentContent::Unknown(_))
    }
}

/// Shared collaborators available to every provider.
#[derive(Clone)]
pub struct ProviderContext {
    pub backend: Arc<dyn ConfigBackend>,
    pub parameters: Arc<ParameterCache>,
    pub history: TestStateStore,
}

/// Renders one facet of a resource.
#[async_trait]
pub trait FacetProvider: Send + Sync {
    fn facet(&self) -> Facet;

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String>;

    /// Text shown in place of the document when [`render`](Self::render)
    /// fails.
    fn render_error(&self, err: &anyhow::Error) -> String {
        format!("-- Failed to load {}: {:#}", self.facet(), err)
    }
}

fn json_error(err: &anyhow::Error) -> String {
    serde_json::to_string_pretty(&json!({ "error": format!("{:#}", err) }))
        .unwrap_or_else(|_| "{}".to_string())
}

pub struct ConfigProvider;

#[async_trait]
impl FacetProvider for ConfigProvider {
    fn facet(&self) -> Facet {
        Facet::Config
    }

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String> {
        let config = ctx.backend.get_endpoint(slug).await?;
        Ok(serde_json::to_string_pretty(&config)?)
    }

    fn render_error(&self, err: &anyhow::Error) -> String {
        json_error(err)
    }
}

pub struct TemplateProvider;

#[async_trait]
impl FacetProvider for TemplateProvider {
    fn facet(&self) -> Facet {
        Facet::Template
    }

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String> {
        ctx.backend.get_template(slug).await
    }

    fn render_error(&self, err: &anyhow::Error) -> String {
        format!("-- Failed to load template: {:#}", err)
    }
}

pub struct CacheProvider;

#[async_trait]
impl FacetProvider for CacheProvider {
    fn facet(&self) -> Facet {
        Facet::Cache
    }

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String> {
        let cache = ctx.backend.get_cache(slug).await?;
        Ok(serde_json::to_string_pretty(&cache)?)
    }

    fn render_error(&self, err: &anyhow::Error) -> String {
        json_error(err)
    }
}

pub struct CacheTemplateProvider;

#[async_trait]
impl FacetProvider for CacheTemplateProvider {
    fn facet(&self) -> Facet {
        Facet::CacheTemplate
    }

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String> {
        ctx.backend.get_cache_template(slug).await
    }

    fn render_error(&self, err: &anyhow::Error) -> String {
        format!("-- Failed to load cache template: {:#}", err)
    }
}

/// Serves the cached manual overrides; never touches the backend.
pub struct ParametersProvider;

#[async_trait]
impl FacetProvider for ParametersProvider {
    fn facet(&self) -> Facet {
        Facet::Parameters
    }

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String> {
        let set = ctx.parameters.get(slug).await.unwrap_or_default();
        Ok(serde_json::to_string_pretty(&parameter_set_to_json(&set))?)
    }
}

/// Renders the most recent test execution of the resource.
pub struct ResultsProvider;

#[async_trait]
impl FacetProvider for ResultsProvider {
    fn facet(&self) -> Facet {
        Facet::Results
    }

    async fn render(&self, slug: &str, ctx: &ProviderContext) -> Result<String> {
        let state = ctx.history.get_state(slug).await?;
        match state.as_ref().and_then(|s| s.latest()) {
            Some(entry) => Ok(serde_json::to_string_pretty(entry)?),
            None => Ok(format!("// No test executions yet for {}", slug)),
        }
    }
}

pub struct ContentProviderRegistry {
    scheme: String,
    providers: Vec<Box<dyn FacetProvider>>,
    ctx: ProviderContext,
    listener: Option<Arc<dyn ContentChangeListener>>,
}

impl ContentProviderRegistry {
    pub fn new(ctx: ProviderContext) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            providers: Vec::new(),
            ctx,
            listener: None,
        }
    }

    /// A registry serving all six facets.
    pub fn with_builtins(ctx: ProviderContext) -> Self {
        let mut registry = Self::new(ctx);
        registry.register(Box::new(ConfigProvider));
        registry.register(Box::new(TemplateProvider));
        registry.register(Box::new(CacheProvider));
        registry.register(Box::new(CacheTemplateProvider));
        registry.register(Box::new(ParametersProvider));
        registry.register(Box::new(ResultsProvider));
        registry
    }

    pub fn with_listener(mut self, listener: Arc<dyn ContentChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register a provider. A later registration for the same facet
    /// replaces the earlier one.
    pub fn register(&mut self, provider: Box<dyn FacetProvider>) {
        self.providers.retain(|p| p.facet() != provider.facet());
        self.providers.push(provider);
    }

    pub fn find(&self, facet: Facet) -> Option<&dyn FacetProvider> {
        self.providers
            .iter()
            .find(|p| p.facet() == facet)
            .map(|p| p.as_ref())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn parameter_cache(&self) -> Arc<ParameterCache> {
        self.ctx.parameters.clone()
    }

    pub async fn read(&self, address: &VirtualAddress) -> DocumentContent {
        if address.scheme != self.scheme {
            return DocumentContent::Unknown(format!("// Unknown document: {}", address));
        }
        let provider = match address.facet().and_then(|f| self.find(f)) {
            Some(provider) => provider,
            None => {
                tracing::debug!(%address, "no provider for facet");
                return DocumentContent::Unknown(format!(
                    "// Unknown document: no '{}' view for {}",
                    address.facet_name, address.slug
                ));
            }
        };

        match provider.render(&address.slug, &self.ctx).await {
            Ok(text) => DocumentContent::Text(text),
            Err(e) => {
                tracing::warn!(%address, "failed to render document: {:#}", e);
                DocumentContent::Text(provider.render_error(&e))
            }
        }
    }

    /// Parse and read a `<scheme>://<slug>/<facet>` URI.
    pub async fn read_uri(&self, uri: &str) -> DocumentContent {
        match uri.parse::<VirtualAddress>() {
            Ok(address) => self.read(&address).await,
            Err(e) => DocumentContent::Unknown(format!("// {}", e)),
        }
    }

    pub async fn parameters(&self, slug: &str) -> Option<ParameterSet> {
        self.ctx.parameters.get(slug).await
    }

    pub async fn set_parameters(&self, slug: &str, parameters: ParameterSet) {
        self.ctx.parameters.set(slug, parameters).await;
        self.refresh(&VirtualAddress::new(slug, Facet::Parameters))
            .await;
    }

    pub async fn clear_parameters(&self, slug: &str) {
        if self.ctx.parameters.clear(slug).await {
            self.refresh(&VirtualAddress::new(slug, Facet::Parameters))
                .await;
        }
    }

    /// Ask the host to re-read `address`. Cached parameters are untouched.
    pub async fn refresh(&self, address: &VirtualAddress) {
        if let Some(listener) = &self.listener {
            listener.content_changed(address).await;
        }
    }

    /// Refresh every save-dependent facet of `slug`.
    pub async fn invalidate_resource(&self, slug: &str) {
        for facet in Facet::SAVE_INVALIDATED {
            self.refresh(&VirtualAddress::new(slug, facet)).await;
        }
    }
}
