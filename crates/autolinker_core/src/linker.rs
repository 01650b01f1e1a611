use std::collections::BTreeSet;

use anyhow::Result;
use regex::Regex;
use tracing::instrument;

use crate::cache::{CacheStore, CatalogCache, Clock, SystemClock, cache_key};
use crate::catalog::Catalog;
use crate::config::AutolinkSettings;
use crate::fetch::{
    CatalogSource, FetchLimits, MediaWikiCatalogClient, MediaWikiClientConfig,
    RemoteCatalogFetcher,
};
use crate::patterns::build_patterns;
use crate::rewrite::{ExternalLinkRenderer, LinkRenderer, Rewriter};
use crate::variants;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub html: String,
    pub changed: bool,
    pub replaced: usize,
}

impl LinkOutcome {
    fn unchanged(html: &str) -> Self {
        Self {
            html: html.to_string(),
            changed: false,
            replaced: 0,
        }
    }
}

/// Targets and patterns derived from one catalog snapshot.
struct PreparedTargets {
    source: Catalog,
    targets: Catalog,
    patterns: Vec<Regex>,
}

/// Adds outbound links to every known title found in rendered HTML.
pub struct AutoLinker<K, S, C = SystemClock> {
    cache: CatalogCache<K, S, C>,
    excluded: BTreeSet<String>,
    scope_class: Option<String>,
    renderer: Box<dyn LinkRenderer>,
    prepared: Option<PreparedTargets>,
}

impl<K: CacheStore> AutoLinker<K, MediaWikiCatalogClient, SystemClock> {
    /// Wire the MediaWiki client, fetch limits and cache key from settings.
    pub fn from_settings(settings: &AutolinkSettings, store: K) -> Result<Self> {
        let client = MediaWikiCatalogClient::new(MediaWikiClientConfig::from_settings(settings))?;
        let limits = FetchLimits::from_settings(settings);
        let key = cache_key(settings.api_url.as_deref(), limits);
        let cache = CatalogCache::new(store, RemoteCatalogFetcher::new(client, limits), key);
        Ok(Self::new(cache, settings))
    }
}

impl<K: CacheStore, S: CatalogSource, C: Clock> AutoLinker<K, S, C> {
    pub fn new(cache: CatalogCache<K, S, C>, settings: &AutolinkSettings) -> Self {
        Self {
            cache,
            excluded: settings.exclude_links_to.clone(),
            scope_class: settings.only_within_class_name.clone(),
            renderer: Box::new(ExternalLinkRenderer),
            prepared: None,
        }
    }

    pub fn with_renderer(mut self, renderer: impl LinkRenderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn with_scope_class(mut self, scope_class: Option<String>) -> Self {
        self.scope_class = scope_class.filter(|class| !class.trim().is_empty());
        self
    }

    pub fn cache(&self) -> &CatalogCache<K, S, C> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CatalogCache<K, S, C> {
        &mut self.cache
    }

    pub fn into_cache(self) -> CatalogCache<K, S, C> {
        self.cache
    }

    /// Title to URL mapping actually used for linking: exclusions removed,
    /// lowercase-first variants added.
    pub fn targets(&mut self) -> Catalog {
        self.prepare()
            .map(|prepared| prepared.targets.clone())
            .unwrap_or_default()
    }

    /// Never fails. An unavailable or empty catalog leaves `html` untouched.
    #[instrument(skip_all, fields(bytes = html.len()))]
    pub fn add_links(&mut self, html: &str) -> LinkOutcome {
        let scope_class = self.scope_class.clone();
        let renderer = &*self.renderer;
        let Some(prepared) = prepare_targets(&mut self.cache, &self.excluded, &mut self.prepared)
        else {
            return LinkOutcome::unchanged(html);
        };

        let outcome = Rewriter::new(&prepared.patterns, &prepared.targets, renderer)
            .rewrite(html, scope_class.as_deref());
        tracing::debug!(replaced = outcome.replaced, "Rewrite finished");
        if outcome.replaced == 0 {
            return LinkOutcome::unchanged(html);
        }
        LinkOutcome {
            html: outcome.html,
            changed: true,
            replaced: outcome.replaced,
        }
    }

    fn prepare(&mut self) -> Option<&PreparedTargets> {
        prepare_targets(&mut self.cache, &self.excluded, &mut self.prepared)
    }
}

/// Reuse compiled patterns while the cached catalog stays the same.
fn prepare_targets<'p, K, S, C>(
    cache: &mut CatalogCache<K, S, C>,
    excluded: &BTreeSet<String>,
    prepared: &'p mut Option<PreparedTargets>,
) -> Option<&'p PreparedTargets>
where
    K: CacheStore,
    S: CatalogSource,
    C: Clock,
{
    let catalog = cache.get_catalog();
    if catalog.is_empty() {
        *prepared = None;
        return None;
    }

    let stale = prepared
        .as_ref()
        .is_none_or(|current| current.source != catalog);
    if stale {
        let targets = variants::expand(&catalog.without(excluded));
        let patterns = build_patterns(targets.titles());
        tracing::debug!(
            titles = targets.len(),
            patterns = patterns.len(),
            "Compiled title patterns"
        );
        *prepared = Some(PreparedTargets {
            source: catalog,
            targets,
            patterns,
        });
    }
    prepared.as_ref().filter(|current| !current.targets.is_empty())
}
