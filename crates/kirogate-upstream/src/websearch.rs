//! Server-side web search (DuckDuckGo HTML, no API key).
//!
//! The upstream's `webSearch` tool is executed by the gateway after the
//! main stream finishes; results come back to the client as a trailing
//! text block rather than a pending tool call.

use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

use crate::UpstreamError;

const DEFAULT_RESULTS: usize = 8;
const MAX_RESULTS: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

fn result_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<a[^>]*class="result__a"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#)
            .expect("static regex")
    })
}

fn snippet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#).expect("static regex")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn strip_tags(html: &str) -> String {
    let text = tag_regex().replace_all(html, "");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

pub fn parse_ddg_results(html: &str, max_results: usize) -> Vec<SearchResult> {
    let snippets: Vec<String> = snippet_regex()
        .captures_iter(html)
        .map(|c| strip_tags(&c[1]))
        .collect();

    result_regex()
        .captures_iter(html)
        .take(max_results)
        .enumerate()
        .map(|(i, c)| SearchResult {
            url: c[1].to_string(),
            title: strip_tags(&c[2]),
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        })
        .collect()
}

/// Run the search and format results as the trailing text block.
pub async fn execute_web_search(
    client: &reqwest::Client,
    query: &str,
    num_results: Option<usize>,
) -> Result<String, UpstreamError> {
    let limit = num_results.unwrap_or(DEFAULT_RESULTS).min(MAX_RESULTS);
    let url = format!(
        "https://html.duckduckgo.com/html/?q={}",
        urlencoding::encode(query)
    );

    let response = client
        .get(&url)
        .header("user-agent", "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(UpstreamError::Status {
            status: response.status().as_u16(),
            message: "web search failed".to_string(),
        });
    }

    let html = response.text().await?;
    let results = parse_ddg_results(&html, limit);
    debug!(query, count = results.len(), "web search complete");

    if results.is_empty() {
        return Ok(format!("No results found for: {query}"));
    }

    let mut output = format!("Search results for: {query}\n\n");
    for (i, r) in results.iter().enumerate() {
        output.push_str(&format!(
            "{}. **{}**\n   {}\n   {}\n\n",
            i + 1,
            r.title,
            r.url,
            r.snippet
        ));
    }
    Ok(output)
}
