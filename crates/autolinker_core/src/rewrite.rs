//! Link insertion into rendered HTML without touching markup.
//!
//! Text that must never be rewritten (tags, anchors, headings, URLs, character
//! references) is swapped for marker tokens before the title patterns run.
//! Every inserted link is itself stored behind a marker, so later patterns
//! cannot match inside it. All markers are resolved in one final pass.

use std::sync::LazyLock;

use regex::{Captures, Regex, Replacer};
use scraper::node::Text;
use scraper::{ElementRef, Html, Node};

use crate::catalog::Catalog;

const MARKER_OPEN: char = '\u{E000}';
const MARKER_CLOSE: char = '\u{E001}';
const MARKER_DIGITS: [char; 10] = [
    '\u{E010}', '\u{E011}', '\u{E012}', '\u{E013}', '\u{E014}', '\u{E015}', '\u{E016}',
    '\u{E017}', '\u{E018}', '\u{E019}',
];

/// Whole elements whose content is never prose to link.
static PROTECTED_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?is)<!--.*?-->",
        r"|<a[\s>].*?</a\s*>",
        r"|<h1[\s>].*?</h1\s*>",
        r"|<h2[\s>].*?</h2\s*>",
        r"|<h3[\s>].*?</h3\s*>",
        r"|<h4[\s>].*?</h4\s*>",
        r"|<h5[\s>].*?</h5\s*>",
        r"|<h6[\s>].*?</h6\s*>",
        r"|<script[\s>].*?</script\s*>",
        r"|<style[\s>].*?</style\s*>",
        r"|<textarea[\s>].*?</textarea\s*>",
        r"|<title[\s>].*?</title\s*>",
        r"|<option[\s>].*?</option\s*>",
    ))
    .expect("PROTECTED_ELEMENTS regex is valid")
});

/// Remaining tags, bare URLs and character references.
static PROTECTED_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<[^<>]*>|https?://[^\s<>"']+|&(?:[a-z][a-z0-9]*|#[0-9]+|#x[0-9a-f]+);"#)
        .expect("PROTECTED_TOKENS regex is valid")
});

/// Input parsed as a full document rather than a fragment.
static DOCUMENT_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\A(?:\s|<!--.*?-->)*<(?:!doctype|html)[\s>]")
        .expect("DOCUMENT_START regex is valid")
});

/// Renders the markup of one outbound link.
pub trait LinkRenderer {
    fn make_external_link(&self, url: &str, text: &str) -> String;
}

/// MediaWiki-style external link markup.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalLinkRenderer;

impl LinkRenderer for ExternalLinkRenderer {
    fn make_external_link(&self, url: &str, text: &str) -> String {
        format!(
            r#"<a rel="nofollow" class="external text" href="{}">{}</a>"#,
            html_escape::encode_double_quoted_attribute(url),
            html_escape::encode_text(text)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub html: String,
    pub replaced: usize,
}

impl RewriteOutcome {
    fn unchanged(html: &str) -> Self {
        Self {
            html: html.to_string(),
            replaced: 0,
        }
    }
}

/// Marker arena for a single rewrite pass.
#[derive(Debug, Default)]
struct RewriteSession {
    values: Vec<Option<String>>,
}

impl RewriteSession {
    fn push_marker(&mut self, value: String, dst: &mut String) {
        let id = self.values.len();
        self.values.push(Some(value));
        dst.push(MARKER_OPEN);
        for digit in id.to_string().bytes() {
            dst.push(MARKER_DIGITS[usize::from(digit - b'0')]);
        }
        dst.push(MARKER_CLOSE);
    }

    /// Replace every marker with its value, consuming each value once.
    fn restore(mut self, text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(MARKER_OPEN) {
            output.push_str(&rest[..start]);
            let after = &rest[start + MARKER_OPEN.len_utf8()..];
            let resolved = after.find(MARKER_CLOSE).and_then(|end| {
                let value = decode_marker_id(&after[..end])
                    .and_then(|id| self.values.get_mut(id))
                    .and_then(Option::take)?;
                Some((end, value))
            });
            match resolved {
                Some((end, value)) => {
                    output.push_str(&value);
                    rest = &after[end + MARKER_CLOSE.len_utf8()..];
                }
                None => {
                    output.push(MARKER_OPEN);
                    rest = after;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

fn decode_marker_id(digits: &str) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    digits.chars().try_fold(0usize, |id, ch| {
        let digit = MARKER_DIGITS.iter().position(|candidate| *candidate == ch)?;
        id.checked_mul(10)?.checked_add(digit)
    })
}

struct ProtectReplacer<'s> {
    session: &'s mut RewriteSession,
}

impl Replacer for ProtectReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        self.session.push_marker(caps[0].to_string(), dst);
    }
}

struct LinkReplacer<'s, 'a> {
    session: &'s mut RewriteSession,
    targets: &'a Catalog,
    renderer: &'a dyn LinkRenderer,
    replaced: usize,
}

impl Replacer for LinkReplacer<'_, '_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let text = &caps[0];
        match self.targets.get(text) {
            Some(url) => {
                let link = self.renderer.make_external_link(url, text);
                self.session.push_marker(link, dst);
                self.replaced += 1;
            }
            None => dst.push_str(text),
        }
    }
}

/// Applies compiled title patterns to HTML.
pub struct Rewriter<'a> {
    patterns: &'a [Regex],
    targets: &'a Catalog,
    renderer: &'a dyn LinkRenderer,
}

impl<'a> Rewriter<'a> {
    pub fn new(patterns: &'a [Regex], targets: &'a Catalog, renderer: &'a dyn LinkRenderer) -> Self {
        Self {
            patterns,
            targets,
            renderer,
        }
    }

    /// Rewrite the whole string, or only inside elements carrying `scope_class`.
    pub fn rewrite(&self, html: &str, scope_class: Option<&str>) -> RewriteOutcome {
        match scope_class {
            Some(class_name) => self.rewrite_scoped(html, class_name),
            None => self.rewrite_document(html),
        }
    }

    pub fn rewrite_document(&self, html: &str) -> RewriteOutcome {
        if self.patterns.is_empty() {
            return RewriteOutcome::unchanged(html);
        }
        if html.contains([MARKER_OPEN, MARKER_CLOSE]) {
            tracing::debug!("HTML already contains marker characters; leaving it untouched");
            return RewriteOutcome::unchanged(html);
        }

        let mut session = RewriteSession::default();
        let mut text = PROTECTED_ELEMENTS
            .replace_all(
                html,
                ProtectReplacer {
                    session: &mut session,
                },
            )
            .into_owned();
        text = PROTECTED_TOKENS
            .replace_all(
                &text,
                ProtectReplacer {
                    session: &mut session,
                },
            )
            .into_owned();

        let mut replaced = 0;
        for pattern in self.patterns {
            let mut replacer = LinkReplacer {
                session: &mut session,
                targets: self.targets,
                renderer: self.renderer,
                replaced: 0,
            };
            text = pattern.replace_all(&text, replacer.by_ref()).into_owned();
            replaced += replacer.replaced;
        }

        if replaced == 0 {
            return RewriteOutcome::unchanged(html);
        }
        RewriteOutcome {
            html: session.restore(&text),
            replaced,
        }
    }

    /// Rewrite the inner HTML of every outermost element whose `class`
    /// contains `class_name`. The rest of the tree goes through html5ever's
    /// serializer unchanged, doctype and namespaced attributes included.
    pub fn rewrite_scoped(&self, html: &str, class_name: &str) -> RewriteOutcome {
        if self.patterns.is_empty() {
            return RewriteOutcome::unchanged(html);
        }
        if html.contains([MARKER_OPEN, MARKER_CLOSE]) {
            tracing::debug!("HTML already contains marker characters; leaving it untouched");
            return RewriteOutcome::unchanged(html);
        }

        let is_document = DOCUMENT_START.is_match(html);
        let mut parsed = if is_document {
            Html::parse_document(html)
        } else {
            Html::parse_fragment(html)
        };

        let mut scoped = Vec::new();
        let root = parsed.root_element();
        if is_document && has_class(root.value().attr("class"), class_name) {
            scoped.push(root);
        } else {
            collect_scoped(root, class_name, &mut scoped);
        }

        let mut session = RewriteSession::default();
        let mut placeholders = Vec::new();
        let mut replaced = 0;
        for element in scoped {
            let inner = self.rewrite_document(&element.inner_html());
            if inner.replaced == 0 {
                continue;
            }
            replaced += inner.replaced;
            let mut placeholder = String::new();
            session.push_marker(inner.html, &mut placeholder);
            placeholders.push((element.id(), placeholder));
        }
        if replaced == 0 {
            return RewriteOutcome::unchanged(html);
        }

        for (id, placeholder) in placeholders {
            let Some(mut node) = parsed.tree.get_mut(id) else {
                continue;
            };
            while let Some(mut child) = node.first_child() {
                child.detach();
            }
            node.append(Node::Text(Text {
                text: placeholder.as_str().into(),
            }));
        }

        let serialized = if is_document {
            parsed.html()
        } else {
            parsed.root_element().inner_html()
        };
        RewriteOutcome {
            html: session.restore(&serialized),
            replaced,
        }
    }
}

/// Outermost descendants of `element` carrying `class_name`.
fn collect_scoped<'h>(element: ElementRef<'h>, class_name: &str, found: &mut Vec<ElementRef<'h>>) {
    for child in element.children().filter_map(ElementRef::wrap) {
        if has_class(child.value().attr("class"), class_name) {
            found.push(child);
        } else {
            collect_scoped(child, class_name, found);
        }
    }
}

fn has_class(class_attr: Option<&str>, class_name: &str) -> bool {
    class_attr.is_some_and(|classes| classes.split_ascii_whitespace().any(|class| class == class_name))
}

#[cfg(test)]
mod tests {
    use super::{
        ExternalLinkRenderer, LinkRenderer, MARKER_OPEN, RewriteSession, Rewriter,
        decode_marker_id,
    };
    use crate::catalog::Catalog;
    use crate::patterns::build_patterns;

    /// Short markup so expectations stay readable.
    struct PlainRenderer;

    impl LinkRenderer for PlainRenderer {
        fn make_external_link(&self, url: &str, text: &str) -> String {
            format!(r#"<a href="{url}">{text}</a>"#)
        }
    }

    fn targets(entries: &[(&str, &str)]) -> Catalog {
        entries
            .iter()
            .map(|(title, url)| (title.to_string(), url.to_string()))
            .collect()
    }

    fn rewrite(entries: &[(&str, &str)], html: &str, scope: Option<&str>) -> (String, usize) {
        let targets = targets(entries);
        let patterns = build_patterns(targets.titles());
        let outcome = Rewriter::new(&patterns, &targets, &PlainRenderer).rewrite(html, scope);
        (outcome.html, outcome.replaced)
    }

    #[test]
    fn session_markers_round_trip() {
        let mut session = RewriteSession::default();
        let mut text = String::from("a ");
        for index in 0..12 {
            session.push_marker(format!("<v{index}>"), &mut text);
        }
        text.push_str(" b");
        assert_eq!(decode_marker_id("\u{E011}\u{E010}"), Some(10));
        assert_eq!(
            session.restore(&text),
            "a <v0><v1><v2><v3><v4><v5><v6><v7><v8><v9><v10><v11> b"
        );
    }

    #[test]
    fn longest_title_is_linked_as_one_unit() {
        let (html, replaced) = rewrite(
            &[("Square", "https://w/Square"), ("Times Square", "https://w/Times_Square")],
            "<p>Times Square is here</p>",
            None,
        );
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            r#"<p><a href="https://w/Times_Square">Times Square</a> is here</p>"#
        );
    }

    #[test]
    fn existing_anchor_and_headings_are_untouched() {
        let input = r#"<h2 id="x">Square</h2><a href="x">Times Square</a> and Square"#;
        let (html, replaced) = rewrite(
            &[("Square", "https://w/Square"), ("Times Square", "https://w/Times_Square")],
            input,
            None,
        );
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            r#"<h2 id="x">Square</h2><a href="x">Times Square</a> and <a href="https://w/Square">Square</a>"#
        );
    }

    #[test]
    fn attributes_urls_and_entities_are_never_rewritten() {
        let input = concat!(
            r#"<img alt="Square" src="/Square.png"> see https://example.org/Square "#,
            r#"&amp; <!-- Square --> Square"#
        );
        let (html, replaced) = rewrite(&[("Square", "https://w/Square"), ("amp", "https://w/amp")], input, None);
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            concat!(
                r#"<img alt="Square" src="/Square.png"> see https://example.org/Square "#,
                r#"&amp; <!-- Square --> <a href="https://w/Square">Square</a>"#
            )
        );
    }

    #[test]
    fn inserted_links_are_not_matched_by_later_chunks() {
        let mut entries = vec![("Times Square".to_string(), "https://w/Times_Square".to_string())];
        for index in 0..600 {
            entries.push((format!("Filler title number {index}"), format!("https://w/f{index}")));
        }
        entries.push(("Times".to_string(), "https://w/Times".to_string()));
        entries.push(("w".to_string(), "https://w/w".to_string()));
        let targets = entries.into_iter().collect::<Catalog>();
        let patterns = build_patterns(targets.titles());
        assert!(patterns.len() > 1);

        let outcome =
            Rewriter::new(&patterns, &targets, &PlainRenderer).rewrite("Times Square, Times.", None);
        assert_eq!(outcome.replaced, 2);
        assert_eq!(
            outcome.html,
            r#"<a href="https://w/Times_Square">Times Square</a>, <a href="https://w/Times">Times</a>."#
        );
    }

    #[test]
    fn second_pass_changes_nothing() {
        let entries = [("Big cats", "https://w/Big_cats"), ("big cats", "https://w/Big_cats")];
        let (first, replaced) = rewrite(&entries, "<p>big cats and Big cats</p>", None);
        assert_eq!(replaced, 2);
        let (second, replaced_again) = rewrite(&entries, &first, None);
        assert_eq!(replaced_again, 0);
        assert_eq!(second, first);
    }

    #[test]
    fn empty_patterns_return_input() {
        let (html, replaced) = rewrite(&[], "<p>Anything</p>", None);
        assert_eq!(replaced, 0);
        assert_eq!(html, "<p>Anything</p>");

        let (html, replaced) = rewrite(&[], "<p>Anything</p>", Some("body"));
        assert_eq!(replaced, 0);
        assert_eq!(html, "<p>Anything</p>");
    }

    #[test]
    fn marker_characters_in_input_skip_rewriting() {
        let input = format!("Square {MARKER_OPEN}");
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], &input, None);
        assert_eq!(replaced, 0);
        assert_eq!(html, input);
    }

    #[test]
    fn scoped_rewrite_only_touches_marked_elements() {
        let input = concat!(
            r#"<div class="nav">Square</div>"#,
            r#"<div class="content main"><p>Square &amp; more</p></div>"#,
            r#"<p>Square</p>"#
        );
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, Some("main"));
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            concat!(
                r#"<div class="nav">Square</div>"#,
                r#"<div class="content main"><p><a href="https://w/Square">Square</a> &amp; more</p></div>"#,
                r#"<p>Square</p>"#
            )
        );
    }

    #[test]
    fn scoped_rewrite_without_matching_class_returns_original() {
        let input = "<div class='other'>Square</div>";
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, Some("main"));
        assert_eq!(replaced, 0);
        assert_eq!(html, input);
    }

    #[test]
    fn scoped_rewrite_serializes_void_and_raw_text_elements() {
        let input = concat!(
            r#"<script>if (a < b) { Square(); }</script>"#,
            r#"<div class="main">Square<br>next</div><hr>"#
        );
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, Some("main"));
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            concat!(
                r#"<script>if (a < b) { Square(); }</script>"#,
                r#"<div class="main"><a href="https://w/Square">Square</a><br>next</div><hr>"#
            )
        );
    }

    #[test]
    fn title_option_and_textarea_text_is_never_linked() {
        let input = concat!(
            "<html><head><title>Square</title></head><body>",
            "<textarea>Square</textarea><select><option>Square</option></select>",
            "<p>Square</p></body></html>"
        );
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, None);
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            concat!(
                "<html><head><title>Square</title></head><body>",
                "<textarea>Square</textarea><select><option>Square</option></select>",
                r#"<p><a href="https://w/Square">Square</a></p></body></html>"#
            )
        );
    }

    #[test]
    fn scoped_rewrite_keeps_the_document_shell() {
        let input = concat!(
            r#"<!DOCTYPE html><html lang="en"><head><meta charset="utf-8"><title>Square</title></head>"#,
            r#"<body class="b"><div class="main">Square</div></body></html>"#
        );
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, Some("main"));
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            concat!(
                r#"<!DOCTYPE html><html lang="en"><head><meta charset="utf-8"><title>Square</title></head>"#,
                r#"<body class="b"><div class="main"><a href="https://w/Square">Square</a></div></body></html>"#
            )
        );
    }

    #[test]
    fn scoped_rewrite_keeps_attributes_outside_the_scope() {
        let input = concat!(
            r##"<svg><use xlink:href="#icon"></use></svg>"##,
            r#"<p title="a &amp; b &quot;c&quot;">Square</p>"#,
            r#"<div class="main">Square</div>"#
        );
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, Some("main"));
        assert_eq!(replaced, 1);
        assert_eq!(
            html,
            concat!(
                r##"<svg><use xlink:href="#icon"></use></svg>"##,
                r#"<p title="a &amp; b &quot;c&quot;">Square</p>"#,
                r#"<div class="main"><a href="https://w/Square">Square</a></div>"#
            )
        );
    }

    #[test]
    fn nested_scope_elements_are_rewritten_once() {
        let input = r#"<div class="main">Square <div class="main">Square</div></div>"#;
        let (html, replaced) = rewrite(&[("Square", "https://w/Square")], input, Some("main"));
        assert_eq!(replaced, 2);
        assert_eq!(
            html,
            concat!(
                r#"<div class="main"><a href="https://w/Square">Square</a> "#,
                r#"<div class="main"><a href="https://w/Square">Square</a></div></div>"#
            )
        );
    }

    #[test]
    fn external_link_renderer_escapes_url_and_text() {
        let markup = ExternalLinkRenderer.make_external_link("https://w/A?b=1&c=\"2\"", "A<b>");
        assert_eq!(
            markup,
            r#"<a rel="nofollow" class="external text" href="https://w/A?b=1&amp;c=&quot;2&quot;">A&lt;b&gt;</a>"#
        );
    }
}
