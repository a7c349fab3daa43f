//! Web access tools: search and fetch URLs.
//!
//! Web search uses the Tavily API when `TAVILY_API_KEY` is set, otherwise it
//! falls back to DuckDuckGo's HTML endpoint.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Tool, ToolCapabilities, ToolContext, ToolOutput};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; MagicAgent/1.0)";

fn network_read() -> ToolCapabilities {
    ToolCapabilities {
        requires_network: true,
        requires_sandbox: false,
        idempotent: true,
    }
}

/// Search the web using Tavily (preferred) or DuckDuckGo.
pub struct WebSearch;

#[derive(Debug, Serialize)]
struct TavilySearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u32,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    content: String,
}

#[async_trait]
impl Tool for WebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, snippets and URLs of matching pages."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 10,
                    "description": "Maximum number of results (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        network_read()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'query' argument"))?;
        let num_results = args["num_results"].as_u64().unwrap_or(5).min(10) as u32;

        match std::env::var("TAVILY_API_KEY") {
            Ok(api_key) if !api_key.is_empty() => search_tavily(&api_key, query, num_results).await,
            _ => search_duckduckgo(query, num_results as usize).await,
        }
    }
}

async fn search_tavily(api_key: &str, query: &str, max_results: u32) -> anyhow::Result<ToolOutput> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let response = client
        .post("https://api.tavily.com/search")
        .json(&TavilySearchRequest {
            api_key,
            query,
            max_results,
            include_answer: true,
        })
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Tavily API error ({}): {}", status, error_text);
    }
    let parsed: TavilySearchResponse = response.json().await?;
    if parsed.results.is_empty() {
        return Ok(ToolOutput::text(format!("No results found for: {}", query)));
    }

    let mut output = String::new();
    if let Some(answer) = parsed.answer.filter(|a| !a.is_empty()) {
        output.push_str(&format!("Answer: {}\n\n", answer));
    }
    let mut structured = Vec::new();
    for (i, result) in parsed.results.iter().enumerate() {
        output.push_str(&format!(
            "{}. {}\n   {}\n   {}\n\n",
            i + 1,
            result.title,
            result.url,
            result.content
        ));
        structured.push(json!({"title": result.title, "url": result.url}));
    }
    Ok(ToolOutput::text(output.trim_end()).with_structured(Value::Array(structured)))
}

async fn search_duckduckgo(query: &str, limit: usize) -> anyhow::Result<ToolOutput> {
    let url = format!(
        "https://html.duckduckgo.com/html/?q={}",
        urlencoding::encode(query)
    );
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()?;
    let html = client.get(&url).send().await?.text().await?;

    if html.contains("anomaly-modal") || html.contains("Unfortunately, bots") {
        anyhow::bail!(
            "DuckDuckGo blocked the request with a CAPTCHA. Set TAVILY_API_KEY for reliable search."
        );
    }

    let results = extract_ddg_results(&html, limit);
    if results.is_empty() {
        Ok(ToolOutput::text(format!("No results found for: {}", query)))
    } else {
        Ok(ToolOutput::text(results.join("\n\n")))
    }
}

fn extract_ddg_results(html: &str, limit: usize) -> Vec<String> {
    let field = |chunk: &str, class: &str| -> String {
        chunk
            .split(&format!("class=\"{}\"", class))
            .nth(1)
            .and_then(|s| s.split('>').nth(1))
            .and_then(|s| s.split('<').next())
            .map(|s| html_decode(s.trim()))
            .unwrap_or_default()
    };

    html.split("class=\"result__body\"")
        .skip(1)
        .filter_map(|chunk| {
            let title = field(chunk, "result__a");
            if title.is_empty() {
                return None;
            }
            Some(format!(
                "{}\n{}\nURL: {}",
                title,
                field(chunk, "result__snippet"),
                field(chunk, "result__url")
            ))
        })
        .take(limit)
        .collect()
}

fn html_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

/// Fetch a URL and return its text content.
pub struct FetchUrl;

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch the content of a URL. HTML pages are reduced to their readable text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        network_read()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let raw = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;
        let url = url::Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Unsupported URL scheme '{}'", url.scheme());
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()?;
        let response = client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP error: {}", status);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;
        let text = if content_type.contains("text/html") {
            extract_text_from_html(&body)
        } else {
            body
        };

        Ok(ToolOutput::text(text).with_structured(json!({
            "url": url.as_str(),
            "status": status.as_u16(),
            "content_type": content_type,
        })))
    }
}

fn non_content_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<!--.*?-->")
            .expect("static regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"))
}

/// Extract readable text from HTML.
pub(crate) fn extract_text_from_html(html: &str) -> String {
    let without_code = non_content_re().replace_all(html, " ");
    let without_tags = tag_re().replace_all(&without_code, " ");
    let collapsed = without_tags.split_whitespace().collect::<Vec<_>>().join(" ");
    html_decode(&collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_from_html() {
        let html = r#"<html><head><style>p{color:red}</style><script>var x = "<p>";</script></head>
            <body><h1>Title</h1><p>Fish &amp; chips</p><!-- hidden --></body></html>"#;
        assert_eq!(extract_text_from_html(html), "Title Fish & chips");
    }

    #[test]
    fn test_extract_ddg_results() {
        let html = r#"
            <div class="result__body"><a class="result__a" href="x">Rust &amp; Tokio</a>
            <a class="result__snippet">Async runtime</a><a class="result__url"> tokio.rs </a></div>
            <div class="result__body"><a class="result__a" href="y">Second</a></div>
        "#;
        let results = extract_ddg_results(html, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], "Rust & Tokio\nAsync runtime\nURL: tokio.rs");
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http() {
        let err = FetchUrl
            .execute(json!({"url": "file:///etc/passwd"}), &ToolContext::new("/tmp"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported URL scheme"));
    }
}
