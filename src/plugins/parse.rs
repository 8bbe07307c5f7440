use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;

use crate::plugins::{page_links, selector, PageSource, ParsePlugin, Plugin, PluginError, RawFields, UrlMatcher};

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Article pages under `/news/`
pub struct NewsParser {
    matcher: UrlMatcher,
    title: Selector,
    date: Selector,
    paragraphs: Selector,
    article: Selector,
    body: Selector,
    anchors: Selector,
}

impl NewsParser {
    pub fn new() -> Result<Self, PluginError> {
        Ok(Self {
            matcher: UrlMatcher::contains("/news/"),
            title: selector("h1")?,
            date: selector("time[datetime]")?,
            paragraphs: selector("p")?,
            article: selector("article")?,
            body: selector("body")?,
            anchors: selector("a[href]")?,
        })
    }
}

impl Plugin for NewsParser {
    fn name(&self) -> &str {
        "news"
    }

    fn can_handle(&self, url: &str) -> bool {
        self.matcher.matches(url)
    }
}

impl ParsePlugin for NewsParser {
    fn extract(&self, page: &PageSource<'_>) -> Result<RawFields, PluginError> {
        let document = Html::parse_document(page.html);
        let mut fields = BTreeMap::new();

        if let Some(title) = document.select(&self.title).next() {
            fields.insert("title".to_string(), element_text(title));
        }
        if let Some(date) = document
            .select(&self.date)
            .next()
            .and_then(|el| el.value().attr("datetime"))
        {
            fields.insert("date".to_string(), date.to_string());
        }

        let content = document
            .select(&self.paragraphs)
            .map(element_text)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        fields.insert("content".to_string(), content);
        fields.insert("type".to_string(), "news".to_string());

        let body_html = document
            .select(&self.article)
            .next()
            .or_else(|| document.select(&self.body).next())
            .map(|el| el.html())
            .unwrap_or_else(|| page.html.to_string());

        Ok(RawFields {
            fields,
            links: page_links(&document, &self.anchors, page.url),
            body_html,
        })
    }
}

/// Catch-all parser: page title plus the first matching content container
pub struct GenericParser {
    title: Selector,
    heading: Selector,
    body: Selector,
    anchors: Selector,
    content: Vec<(String, Selector)>,
}

impl GenericParser {
    pub fn new(content_selectors: &[String]) -> Result<Self, PluginError> {
        let content = content_selectors
            .iter()
            .map(|css| selector(css).map(|sel| (css.clone(), sel)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            title: selector("title")?,
            heading: selector("h1, .title, #title")?,
            body: selector("body")?,
            anchors: selector("a[href]")?,
            content,
        })
    }
}

impl Plugin for GenericParser {
    fn name(&self) -> &str {
        "generic"
    }

    fn can_handle(&self, _url: &str) -> bool {
        true
    }
}

impl ParsePlugin for GenericParser {
    fn extract(&self, page: &PageSource<'_>) -> Result<RawFields, PluginError> {
        let document = Html::parse_document(page.html);
        let mut fields = BTreeMap::new();

        let title = document
            .select(&self.heading)
            .next()
            .or_else(|| document.select(&self.title).next())
            .map(element_text)
            .filter(|t| !t.is_empty());
        if let Some(title) = title {
            fields.insert("title".to_string(), title);
        }

        let container = self
            .content
            .iter()
            .find_map(|(css, sel)| document.select(sel).next().map(|el| (css.as_str(), el)));

        let body_html = match container {
            Some((css, element)) => {
                fields.insert("content_selector".to_string(), css.to_string());
                element.html()
            }
            None => match document.select(&self.body).next() {
                Some(body) => body.html(),
                None => {
                    return Err(PluginError::Extraction {
                        plugin: self.name().to_string(),
                        message: format!("no content container in {}", page.url),
                    })
                }
            },
        };

        Ok(RawFields {
            fields,
            links: page_links(&document, &self.anchors, page.url),
            body_html,
        })
    }
}
