use scraper::{ElementRef, Html, Selector};

use crate::{clean_text, ExtractError};

const CONTAINER_SELECTOR: &str =
    "article, main, .content, .post, .article, .entry-content, #content, #main";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlExtraction {
    pub title: Option<String>,
    pub text: String,
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

fn select_first_text(root: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(root.select(&sel).next().and_then(|n| text_or_none(element_text(n))))
}

fn select_first_attr(root: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>, ExtractError> {
    let sel = selector(css)?;
    Ok(root
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn char_len_between(text: &str, min_exclusive: usize, max_exclusive: usize) -> bool {
    let len = text.chars().count();
    len > min_exclusive && len < max_exclusive
}

/// Heuristic text extraction. Containers, headings, paragraphs and any
/// embedded `item`/`entry` fragments all feed one accumulated block.
pub fn extract_html(body: &str) -> Result<HtmlExtraction, ExtractError> {
    let document = Html::parse_document(body);
    let root = document.root_element();
    let mut out = String::new();

    let title = select_first_text(root, "title")?;

    for node in document.select(&selector(CONTAINER_SELECTOR)?) {
        let text = element_text(node);
        if text.chars().count() > 100 {
            out.push_str(&text);
            out.push_str("\n\n");
        }
    }

    for node in document.select(&selector("h1, h2, h3")?) {
        let text = element_text(node);
        if char_len_between(&text, 10, 200) {
            out.push_str("HEADLINE: ");
            out.push_str(&text);
            out.push('\n');
        }
    }

    for node in document.select(&selector("p")?) {
        let text = element_text(node);
        if char_len_between(&text, 50, 2000) {
            out.push_str(&text);
            out.push('\n');
        }
    }

    for node in document.select(&selector("item, entry")?) {
        let Some(item_title) = select_first_text(node, "title")? else {
            continue;
        };
        out.push_str("ARTICLE: ");
        out.push_str(&item_title);
        out.push('\n');

        let link = match select_first_text(node, "link")? {
            Some(link) => Some(link),
            None => select_first_attr(node, "link", "href")?,
        };
        if let Some(link) = link {
            out.push_str("LINK: ");
            out.push_str(&link);
            out.push('\n');
        }
        if let Some(desc) = select_first_text(node, "description, summary, content")? {
            out.push_str(&desc);
            out.push_str("\n\n");
        }
    }

    Ok(HtmlExtraction {
        title,
        text: out.trim().to_string(),
    })
}

/// Finds an advertised RSS/Atom feed (`<link rel="alternate">`) and resolves
/// it against the page URL.
pub fn discover_feed_link(body: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(body);
    let sel = Selector::parse(r#"link[rel="alternate"]"#).ok()?;
    let href = document.select(&sel).find_map(|node| {
        let kind = node.value().attr("type")?.to_ascii_lowercase();
        if kind.contains("application/rss+xml") || kind.contains("application/atom+xml") {
            node.value().attr("href").and_then(|h| text_or_none(h.to_string()))
        } else {
            None
        }
    })?;

    match url::Url::parse(page_url) {
        Ok(base) => base.join(&href).ok().map(|u| u.to_string()),
        Err(_) => Some(href),
    }
}
