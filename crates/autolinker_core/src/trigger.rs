use crate::config::AutolinkSettings;
use crate::variants::uppercase_first;

pub const VIEW_ACTION: &str = "view";

/// What the host knows about the page being rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub action: String,
    pub categories: Vec<String>,
}

impl PageContext {
    pub fn view<I, T>(categories: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            action: VIEW_ACTION.to_string(),
            categories: categories.into_iter().map(Into::into).collect(),
        }
    }
}

/// Links are only added to viewed pages in the configured category. Without a
/// category, linking is off.
pub fn should_add_links(settings: &AutolinkSettings, page: &PageContext) -> bool {
    let Some(required) = settings.category_name.as_deref() else {
        return false;
    };
    let required = normalize_category(required);
    if required.is_empty() || page.action.trim() != VIEW_ACTION {
        return false;
    }
    page.categories
        .iter()
        .any(|category| normalize_category(category) == required)
}

/// `Category:Big_cats`, `big cats` and `Big cats` all normalize to `Big cats`.
pub fn normalize_category(name: &str) -> String {
    let trimmed = name.trim();
    let without_prefix = match trimmed.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("category") => rest,
        _ => trimmed,
    };
    let spaced = without_prefix
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    uppercase_first(&spaced)
}
