//! Page fetching and crawling.
//!
//! The [`Fetcher`] wraps a shared HTTP client and turns pages into
//! [`FetchResult`]s. Fetch failures are always carried in-band
//! (`success = false` plus an error string) so batch crawls keep going
//! when individual pages fail; only failure to construct the client at
//! all is surfaced as an `Err`.
//!
//! Crawling comes in two shapes:
//! - [`Fetcher::crawl_batch`]: a known URL list, fetched in windows of
//!   at most `max_concurrent` parallel requests.
//! - [`Fetcher::crawl_recursive`]: breadth-first link following from
//!   seed pages, bounded by depth and a global visited set.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::CrawlConfig;
use crate::models::{FetchResult, PageLinks};
use crate::progress::{IngestPhase, NoProgress, ProgressEvent, ProgressReporter, CRAWL_CEILING};

/// Elements whose text is never indexable.
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "svg", "template", "head"];

/// Elements that force a line break around their text.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "aside", "ul", "ol", "table", "tr", "blockquote",
    "br", "hr", "dt", "dd",
];

/// HTTP fetcher with a shared connection pool.
///
/// Cheap to clone; clones share the underlying client.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// Builds the HTTP client from crawl settings.
    ///
    /// An error here means there is no fetch capability at all, which
    /// callers treat as fatal before any crawl starts.
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .use_rustls_tls()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Fetches one page and reduces it to indexable text.
    ///
    /// HTML is flattened to markdown-shaped text (headings become `#`
    /// lines, `<pre>` blocks become fenced code blocks), the `<title>`
    /// is extracted, and `<a href>` links are resolved against the page
    /// URL and split into same-host internal links and external ones.
    /// Plain text and markdown bodies pass through verbatim with an
    /// empty link set.
    pub async fn fetch_page(&self, url: &str) -> FetchResult {
        let page_url = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return FetchResult::failure(url, format!("invalid url: {e}")),
        };

        let response = match self.client.get(page_url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return FetchResult::failure(url, format!("request failed: {e}")),
        };
        let status = response.status();
        if !status.is_success() {
            return FetchResult::failure(url, format!("HTTP {status}"));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return FetchResult::failure(url, format!("failed to read body: {e}")),
        };

        if is_plain_text(&content_type, url) {
            return FetchResult {
                url: url.to_string(),
                success: true,
                content: body,
                title: None,
                links: PageLinks::default(),
                error: None,
            };
        }

        let (content, title, links) = reduce_html(&body, &page_url);
        FetchResult {
            url: url.to_string(),
            success: true,
            content,
            title,
            links,
            error: None,
        }
    }

    /// Fetches an XML sitemap and returns the page URLs it lists.
    ///
    /// Sitemap indexes are followed one level deep. Any failure, be it
    /// network, a non-success status, or malformed XML, degrades to an
    /// empty list; callers treat that as "nothing to crawl", not as an
    /// error.
    pub async fn expand_sitemap(&self, url: &str) -> Vec<String> {
        let xml = match self.fetch_sitemap_body(url).await {
            Some(xml) => xml,
            None => return Vec::new(),
        };

        let mut pages = Vec::new();
        let mut seen = HashSet::new();
        for loc in parse_sitemap_locs(&xml) {
            if is_sitemap(&loc) {
                // Sitemap index entry: expand the nested sitemap, but
                // never recurse past that level.
                let nested = match self.fetch_sitemap_body(&loc).await {
                    Some(xml) => parse_sitemap_locs(&xml),
                    None => Vec::new(),
                };
                for page in nested {
                    if !is_sitemap(&page) && seen.insert(page.clone()) {
                        pages.push(page);
                    }
                }
            } else if seen.insert(loc.clone()) {
                pages.push(loc);
            }
        }
        pages
    }

    async fn fetch_sitemap_body(&self, url: &str) -> Option<String> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url, error = %e, "sitemap fetch failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(url, status = %response.status(), "sitemap fetch failed");
            return None;
        }
        response.text().await.ok()
    }

    /// Crawls `urls` in windows of at most `max_concurrent` parallel
    /// fetches, accumulating results across windows.
    ///
    /// A failing URL never aborts the batch. Progress runs from 0 up to
    /// the crawl ceiling, leaving headroom for the chunk and index
    /// phases that follow in a full ingestion run. The cancellation
    /// token is checked between windows.
    pub async fn crawl_batch(
        &self,
        urls: &[String],
        max_concurrent: usize,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Vec<FetchResult> {
        let window = max_concurrent.max(1);
        let total = urls.len();
        let mut results = Vec::with_capacity(total);

        progress.report(ProgressEvent::new(
            IngestPhase::Crawling,
            0,
            format!("crawling {total} pages"),
        ));

        for batch in urls.chunks(window) {
            if cancel.is_cancelled() {
                tracing::info!(
                    fetched = results.len(),
                    total,
                    "crawl cancelled between windows"
                );
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for url in batch {
                let fetcher = self.clone();
                let url = url.clone();
                handles.push((
                    url.clone(),
                    tokio::spawn(async move { fetcher.fetch_page(&url).await }),
                ));
            }
            for (url, handle) in handles {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        results.push(FetchResult::failure(&url, format!("fetch task failed: {e}")))
                    }
                }
            }

            let done = results.len();
            let pct = ((done * CRAWL_CEILING as usize) / total) as u8;
            progress.report(ProgressEvent::new(
                IngestPhase::Crawling,
                pct,
                format!("fetched {done}/{total} pages"),
            ));
        }

        if total == 0 {
            progress.report(ProgressEvent::new(
                IngestPhase::Crawling,
                CRAWL_CEILING,
                "no pages to crawl",
            ));
        }

        results
    }

    /// Breadth-first crawl from `seeds`, following internal links only.
    ///
    /// Every page at depth N is fetched before any page at depth N+1,
    /// because the links discovered at depth N form the next frontier.
    /// A global visited set keyed on canonicalized URLs (fragment
    /// stripped, trailing slash trimmed) ensures no URL is fetched
    /// twice and bounds total work. `max_depth` counts levels, so a
    /// depth of 1 fetches only the seeds.
    pub async fn crawl_recursive(
        &self,
        seeds: &[String],
        max_depth: usize,
        max_concurrent: usize,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Vec<FetchResult> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = Vec::new();
        for seed in seeds {
            if visited.insert(canonical_url(seed)) {
                frontier.push(seed.clone());
            }
        }

        progress.report(ProgressEvent::new(
            IngestPhase::Crawling,
            0,
            format!("recursive crawl from {} seeds", frontier.len()),
        ));

        let mut results = Vec::new();
        for depth in 1..=max_depth {
            if frontier.is_empty() || cancel.is_cancelled() {
                break;
            }
            tracing::debug!(depth, pages = frontier.len(), "crawling level");

            let level = self
                .crawl_batch(&frontier, max_concurrent, &NoProgress, cancel)
                .await;

            let mut next: Vec<String> = Vec::new();
            if depth < max_depth {
                for result in &level {
                    if !result.success {
                        continue;
                    }
                    for link in &result.links.internal {
                        if visited.insert(canonical_url(link)) {
                            next.push(link.clone());
                        }
                    }
                }
            }
            results.extend(level);

            let pct = ((depth * CRAWL_CEILING as usize) / max_depth).min(CRAWL_CEILING as usize);
            progress.report(ProgressEvent::new(
                IngestPhase::Crawling,
                pct as u8,
                format!("depth {depth}/{max_depth}: {} pages fetched", results.len()),
            ));

            frontier = next;
        }

        results
    }
}

/// Path heuristic: the final segment is `sitemap*.xml` or otherwise an
/// XML file naming itself a sitemap (`sitemap_index.xml` and friends).
pub fn is_sitemap(url: &str) -> bool {
    let path = url_path(url);
    let segment = path.rsplit('/').next().unwrap_or("").to_ascii_lowercase();
    segment.ends_with(".xml") && segment.contains("sitemap")
}

/// Path heuristic for plain text documents such as `llms.txt`.
pub fn is_txt(url: &str) -> bool {
    url_path(url).to_ascii_lowercase().ends_with(".txt")
}

fn url_path(url: &str) -> String {
    Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn is_plain_text(content_type: &str, url: &str) -> bool {
    content_type.starts_with("text/plain")
        || content_type.starts_with("text/markdown")
        || is_txt(url)
}

/// Canonical key for the visited set: fragment stripped, trailing
/// slash trimmed, scheme and host normalized by the url crate.
fn canonical_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let mut canonical = parsed.to_string();
            if canonical.ends_with('/') {
                canonical.pop();
            }
            canonical
        }
        Err(_) => raw.trim_end_matches('/').to_string(),
    }
}

fn reduce_html(body: &str, page_url: &Url) -> (String, Option<String>, PageLinks) {
    let document = Html::parse_document(body);

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|element| element.text().collect::<String>())
        })
        .map(|raw| raw.trim().to_string())
        .filter(|title| !title.is_empty());

    let mut text = String::new();
    let body_element = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next());
    match body_element {
        Some(element) => push_element_text(element, &mut text),
        None => push_element_text(document.root_element(), &mut text),
    }

    (collapse_blank_lines(&text), title, collect_links(&document, page_url))
}

fn push_element_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            let name = el.value().name();
            if SKIPPED_TAGS.contains(&name) {
                continue;
            }
            if let Some(level) = heading_level(name) {
                ensure_paragraph_break(out);
                for _ in 0..level {
                    out.push('#');
                }
                out.push(' ');
                push_element_text(el, out);
                ensure_paragraph_break(out);
            } else if name == "pre" {
                ensure_paragraph_break(out);
                out.push_str("```");
                if let Some(lang) = fence_language(el) {
                    out.push_str(&lang);
                }
                out.push('\n');
                push_raw_text(el, out);
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("```");
                ensure_paragraph_break(out);
            } else if name == "li" {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("- ");
                push_element_text(el, out);
            } else if BLOCK_TAGS.contains(&name) {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                push_element_text(el, out);
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            } else {
                push_element_text(el, out);
            }
        } else if let Some(text) = child.value().as_text() {
            push_inline_text(text, out);
        }
    }
}

/// Verbatim text of a `<pre>` subtree; code keeps its formatting.
fn push_raw_text(element: ElementRef, out: &mut String) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            push_raw_text(el, out);
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
        }
    }
}

/// Inline text with whitespace runs collapsed to single spaces.
fn push_inline_text(text: &str, out: &mut String) {
    if text.trim().is_empty() {
        if needs_space(out) {
            out.push(' ');
        }
        return;
    }
    if text.starts_with(char::is_whitespace) && needs_space(out) {
        out.push(' ');
    }
    let mut first = true;
    for word in text.split_whitespace() {
        if !first {
            out.push(' ');
        }
        out.push_str(word);
        first = false;
    }
    if text.ends_with(char::is_whitespace) {
        out.push(' ');
    }
}

fn needs_space(out: &str) -> bool {
    !out.is_empty() && !out.ends_with(char::is_whitespace)
}

fn heading_level(name: &str) -> Option<usize> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn ensure_paragraph_break(out: &mut String) {
    if out.is_empty() {
        return;
    }
    while !out.ends_with("\n\n") {
        out.push('\n');
    }
}

/// `language-x` class on a nested `<code>` names the fence language.
fn fence_language(pre: ElementRef) -> Option<String> {
    for child in pre.children() {
        if let Some(el) = ElementRef::wrap(child) {
            if el.value().name() == "code" {
                if let Some(class) = el.value().attr("class") {
                    for token in class.split_whitespace() {
                        if let Some(lang) = token.strip_prefix("language-") {
                            return Some(lang.to_string());
                        }
                    }
                }
            }
        }
    }
    None
}

fn collapse_blank_lines(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut last_blank = false;
    for line in text.lines() {
        let is_fence = line.trim_start().starts_with("```");
        if in_fence {
            lines.push(line);
            if is_fence {
                in_fence = false;
                last_blank = false;
            }
            continue;
        }
        if is_fence {
            in_fence = true;
            lines.push(line.trim_end());
            last_blank = false;
            continue;
        }
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            if !last_blank && !lines.is_empty() {
                lines.push("");
            }
            last_blank = true;
        } else {
            lines.push(trimmed);
            last_blank = false;
        }
    }
    lines.join("\n").trim().to_string()
}

fn collect_links(document: &Html, page_url: &Url) -> PageLinks {
    let mut links = PageLinks::default();
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(_) => return links,
    };

    let mut seen = HashSet::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("javascript:")
        {
            continue;
        }
        let Ok(mut resolved) = page_url.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        let as_string = resolved.to_string();
        if !seen.insert(as_string.clone()) {
            continue;
        }
        if resolved.host_str() == page_url.host_str() {
            links.internal.push(as_string);
        } else {
            links.external.push(as_string);
        }
    }
    links
}

fn parse_sitemap_locs(xml: &str) -> Vec<String> {
    let mut locs = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"loc" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        let loc = te.unescape().unwrap_or_default().trim().to_string();
                        if !loc.is_empty() {
                            locs.push(loc);
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => return Vec::new(),
            _ => {}
        }
        buf.clear();
    }
    locs
}
