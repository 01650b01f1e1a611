use crate::catalog::Catalog;

/// Adds a lowercase-first variant of every title, pointing at the same URL.
///
/// Canonical titles start with an uppercase letter, but prose uses the same
/// words lowercased. Only the first character varies; canonical entries are
/// never overwritten by a colliding variant.
pub fn expand(catalog: &Catalog) -> Catalog {
    let mut expanded = catalog.clone();
    for (title, url) in catalog.iter() {
        let variant = lowercase_first(title);
        if variant != title {
            expanded.insert_if_absent(variant, url.to_string());
        }
    }
    expanded
}

pub fn lowercase_first(title: &str) -> String {
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn uppercase_first(title: &str) -> String {
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
