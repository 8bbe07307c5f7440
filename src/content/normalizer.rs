use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;

use crate::cli::config::ContentSettings;
use crate::error::ErrorKind;
use crate::plugins::RawFields;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid exclusion selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

impl NormalizeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

/// Elements whose boundaries separate paragraphs
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "dd", "details", "div", "dl", "dt", "fieldset",
    "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr",
    "li", "main", "nav", "ol", "p", "pre", "section", "summary", "table", "tr", "td", "th", "ul",
];

/// Zero-width, BOM, soft hyphen and bidi control code points
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}'
    )
}

/// Collapse whitespace inside paragraphs and keep one `\n` between them.
///
/// CR, CRLF, U+2028 and U+2029 count as paragraph boundaries. Invisible and
/// control characters are removed. The output is a fixed point of this function.
pub fn normalize_text(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                cleaned.push('\n');
            }
            '\n' | '\u{2028}' | '\u{2029}' => cleaned.push('\n'),
            '\t' => cleaned.push(' '),
            c if is_invisible(c) => {}
            c if c.is_control() => {}
            c => cleaned.push(c),
        }
    }

    cleaned
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Turns extracted HTML into stable text, skipping configured non-content elements
#[derive(Debug, Clone)]
pub struct ContentNormalizer {
    exclusions: Vec<Selector>,
}

impl ContentNormalizer {
    pub fn new(exclude_selectors: &[String]) -> Result<Self, NormalizeError> {
        let exclusions = exclude_selectors
            .iter()
            .map(|css| {
                Selector::parse(css).map_err(|e| NormalizeError::InvalidSelector {
                    selector: css.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { exclusions })
    }

    pub fn from_settings(settings: &ContentSettings) -> Result<Self, NormalizeError> {
        Self::new(&settings.exclude_selectors)
    }

    /// Normalized text of the main content a parse plugin selected
    pub fn normalize(&self, raw: &RawFields) -> String {
        self.normalize_html(&raw.body_html)
    }

    pub fn normalize_html(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        let mut text = String::new();
        self.collect_text(document.root_element(), &mut text);
        normalize_text(&text)
    }

    fn is_excluded(&self, element: &ElementRef<'_>) -> bool {
        element.value().name() == "head" || self.exclusions.iter().any(|s| s.matches(element))
    }

    fn collect_text(&self, element: ElementRef<'_>, out: &mut String) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => {
                    // Source line breaks inside text are plain whitespace in HTML
                    out.extend(text.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }));
                }
                Node::Element(_) => {
                    let Some(child) = ElementRef::wrap(child) else {
                        continue;
                    };
                    if self.is_excluded(&child) {
                        continue;
                    }
                    let name = child.value().name();
                    if name == "br" {
                        out.push('\n');
                        continue;
                    }
                    let block = BLOCK_ELEMENTS.contains(&name);
                    if block {
                        out.push('\n');
                    }
                    self.collect_text(child, out);
                    if block {
                        out.push('\n');
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> ContentNormalizer {
        ContentNormalizer::from_settings(&ContentSettings::default()).unwrap()
    }

    #[test]
    fn collapses_whitespace_and_keeps_paragraphs() {
        assert_eq!(normalize_text("  Hello \t  world  \n\n\n second\u{00A0}line "), "Hello world\nsecond line");
        assert_eq!(normalize_text("a\r\nb\rc\u{2029}d"), "a\nb\nc\nd");
        assert_eq!(normalize_text(" \n \t \n"), "");
    }

    #[test]
    fn strips_invisible_code_points() {
        let raw = "\u{FEFF}zero\u{200B}width\u{00AD} soft\u{200E} text\u{0007}";
        assert_eq!(normalize_text(raw), "zerowidth soft text");
    }

    #[test]
    fn normalized_text_is_a_fixed_point() {
        let samples = [
            "  Mixed \u{2003} spaces \r\n\r\n and\u{200D} marks ",
            "<p>not html</p>\n\n\ttabbed\u{2028}line",
            "already\nclean",
            "",
        ];
        for sample in samples {
            let once = normalize_text(sample);
            assert_eq!(normalize_text(&once), once, "sample {:?}", sample);
        }

        let html = "<div><p>One <b>two</b></p><script>x()</script><p>three<br>four</p></div>";
        let once = normalizer().normalize_html(html);
        assert_eq!(normalize_text(&once), once);
    }

    #[test]
    fn excluded_elements_are_dropped_before_concatenation() {
        let html = r#"<main>
            <h2>Results</h2>
            <script>track();</script>
            <style>.x { color: red }</style>
            <div class="ad">Buy now</div>
            <div data-ad="1">Sponsored</div>
            <p>First   item</p>
            <p>Second<br>line</p>
        </main>"#;

        assert_eq!(normalizer().normalize_html(html), "Results\nFirst item\nSecond\nline");
    }

    #[test]
    fn exclusions_come_from_configuration() {
        let custom = ContentNormalizer::new(&["nav".to_string()]).unwrap();
        let html = "<body><nav>Menu</nav><script>kept()</script><p>Body</p></body>";
        assert_eq!(custom.normalize_html(html), "kept()\nBody");
    }

    #[test]
    fn inline_elements_do_not_split_paragraphs() {
        let html = "<p>Price: <span>10</span>\n<em>EUR</em></p>";
        assert_eq!(normalizer().normalize_html(html), "Price: 10 EUR");
    }

    #[test]
    fn invalid_exclusion_selectors_are_rejected() {
        let err = ContentNormalizer::new(&["p[".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn raw_fields_normalize_their_body() {
        let raw = RawFields {
            body_html: "<article><p>  Body\u{200B} text </p></article>".to_string(),
            ..RawFields::default()
        };
        assert_eq!(normalizer().normalize(&raw), "Body text");
    }
}
