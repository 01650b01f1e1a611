use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One page of the remote wiki: its canonical title and absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub title: String,
    pub url: String,
}

/// Title to URL mapping built in one fetch cycle.
///
/// A catalog is never mutated after construction; refreshing replaces the
/// whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    entries: BTreeMap<String, String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, title: &str) -> Option<&str> {
        self.entries.get(title).map(String::as_str)
    }

    pub fn contains(&self, title: &str) -> bool {
        self.entries.contains_key(title)
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(title, url)| (title.as_str(), url.as_str()))
    }

    /// Copy of this catalog without the given titles.
    pub fn without(&self, excluded: &BTreeSet<String>) -> Self {
        if excluded.is_empty() {
            return self.clone();
        }
        self.entries
            .iter()
            .filter(|(title, _)| !excluded.contains(*title))
            .map(|(title, url)| (title.clone(), url.clone()))
            .collect()
    }

    /// Insert only when the title is not present yet.
    pub(crate) fn insert_if_absent(&mut self, title: String, url: String) {
        self.entries.entry(title).or_insert(url);
    }
}

impl FromIterator<(String, String)> for Catalog {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl FromIterator<CatalogEntry> for Catalog {
    fn from_iter<I: IntoIterator<Item = CatalogEntry>>(iter: I) -> Self {
        iter.into_iter()
            .map(|entry| (entry.title, entry.url))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{Catalog, CatalogEntry};

    fn entry(title: &str, url: &str) -> CatalogEntry {
        CatalogEntry {
            title: title.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn duplicate_titles_keep_last_url() {
        let catalog = [
            entry("Alpha", "https://wiki.example.org/old"),
            entry("Alpha", "https://wiki.example.org/new"),
        ]
        .into_iter()
        .collect::<Catalog>();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("Alpha"), Some("https://wiki.example.org/new"));
    }

    #[test]
    fn without_drops_excluded_titles_only() {
        let catalog = [
            entry("Alpha", "https://wiki.example.org/Alpha"),
            entry("Beta", "https://wiki.example.org/Beta"),
        ]
        .into_iter()
        .collect::<Catalog>();
        let excluded = BTreeSet::from(["Beta".to_string()]);
        let filtered = catalog.without(&excluded);
        assert!(filtered.contains("Alpha"));
        assert!(!filtered.contains("Beta"));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn catalog_serializes_as_plain_object() {
        let catalog = [entry("Alpha", "https://wiki.example.org/Alpha")]
            .into_iter()
            .collect::<Catalog>();
        let json = serde_json::to_string(&catalog).expect("serialize");
        assert_eq!(json, r#"{"Alpha":"https://wiki.example.org/Alpha"}"#);
        let decoded: Catalog = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, catalog);
    }
}
