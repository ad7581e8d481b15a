//! Tools the agent runtime can execute on behalf of `evaluate` calls.
//!
//! Each tool implements [`Tool`]; the [`ToolRegistry`] maps tool names to
//! implementations and is consulted once per inbound request.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::protocol::EvaluateParams;
use crate::{AppError, Result};

/// Arguments handed to a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Evaluation being served.
    pub evaluation_id: String,
    /// Page the evaluation targets, if any.
    pub url: Option<String>,
    /// Tool-specific input.
    pub input: Value,
    /// Free-form metadata from the definition.
    pub metadata: Value,
}

impl From<&EvaluateParams> for ToolCall {
    fn from(params: &EvaluateParams) -> Self {
        Self {
            evaluation_id: params.evaluation_id.clone(),
            url: params.url.clone(),
            input: params.input.clone(),
            metadata: params.metadata.clone(),
        }
    }
}

/// What a tool produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Primary output, judged by the server.
    pub output: Value,
    /// Intermediate steps worth reporting.
    pub steps: Vec<Value>,
}

/// A named capability the agent advertises and executes.
pub trait Tool: Send + Sync {
    /// Registry name, as used in evaluation definitions.
    fn name(&self) -> &str;

    /// Run the tool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tool` when the tool cannot complete.
    fn execute(&self, call: ToolCall) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + '_>>;
}

/// Name-to-tool map.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `echo` and `fetch_page`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client for `fetch_page` cannot
    /// be built.
    pub fn with_builtin_tools() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FetchPageTool::new()?));
        Ok(registry)
    }

    /// Add or replace a tool under its own name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Look up a tool.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names in sorted order, as advertised in `capabilities.tools`.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

// ── echo ─────────────────────────────────────────────────────────────────────

/// Returns its input unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, call: ToolCall) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + '_>> {
        Box::pin(async move {
            Ok(ToolOutput {
                output: call.input,
                steps: Vec::new(),
            })
        })
    }
}

// ── fetch_page ───────────────────────────────────────────────────────────────

/// Default number of characters kept from the page text.
const DEFAULT_EXCERPT_CHARS: usize = 2000;

/// Fetches a page over HTTP and reports its status, title, and text.
///
/// The target is `input.url` when present, else the evaluation's `url`.
/// `input.max_chars` bounds the text excerpt.
pub struct FetchPageTool {
    client: reqwest::Client,
}

impl FetchPageTool {
    /// Build the tool with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the client cannot be constructed.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }

    async fn fetch(&self, call: ToolCall) -> Result<ToolOutput> {
        let url = call
            .input
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or(call.url)
            .ok_or_else(|| AppError::Tool("fetch_page requires a url".into()))?;
        let max_chars = call
            .input
            .get("max_chars")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_EXCERPT_CHARS);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Tool(format!("fetch {url} failed: {e}")))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Tool(format!("reading {url} failed: {e}")))?;

        let title = extract_title(&body);
        let text = text_excerpt(&body, max_chars);
        Ok(ToolOutput {
            output: json!({
                "status": status,
                "url": final_url,
                "title": title,
                "text": text,
            }),
            steps: vec![json!({ "action": "navigate", "url": url, "status": status })],
        })
    }
}

impl Tool for FetchPageTool {
    fn name(&self) -> &str {
        "fetch_page"
    }

    fn execute(&self, call: ToolCall) -> Pin<Box<dyn Future<Output = Result<ToolOutput>> + Send + '_>> {
        Box::pin(self.fetch(call))
    }
}

/// Content of the first `<title>` element, whitespace-collapsed.
#[must_use]
pub fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    let title = collapse_whitespace(&html[start..end]);
    (!title.is_empty()).then_some(title)
}

/// Visible text of an HTML document, truncated to `max_chars` characters.
///
/// Tags are dropped, as is the content of `<script>` and `<style>`.
#[must_use]
pub fn text_excerpt(html: &str, max_chars: usize) -> String {
    let lower = html.to_ascii_lowercase();
    let mut text = String::new();
    let mut pos = 0;

    while pos < html.len() {
        let Some(rel) = lower[pos..].find('<') else {
            text.push_str(&html[pos..]);
            break;
        };
        text.push_str(&html[pos..pos + rel]);
        text.push(' ');
        let tag_start = pos + rel;
        let Some(tag_len) = lower[tag_start..].find('>') else {
            break;
        };
        pos = tag_start + tag_len + 1;

        for skipped in ["script", "style"] {
            if lower[tag_start + 1..].starts_with(skipped) {
                let close = format!("</{skipped}");
                pos = lower[pos..]
                    .find(&close)
                    .map_or(html.len(), |offset| pos + offset);
            }
        }
    }

    collapse_whitespace(&text).chars().take(max_chars).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
