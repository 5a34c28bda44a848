use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use deckfit_contracts::deck::SlideContent;
use deckfit_contracts::providers::ProviderKind;
use deckfit_contracts::templates::{TemplateCatalog, TemplateProfile};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::scoring::{FitBreakdown, FitScorer};

const ADJACENT_REPEAT_PENALTY: f64 = 3.0;
const VISUAL_AFFINITY_BONUS: f64 = 4.0;

const HOSTED_SYSTEM_PROMPT: &str = "You choose slide layouts. Given one slide and a list of \
candidate templates with character capacities and expected visual counts, reply with a JSON \
object {\"template\": <candidate name>, \"emphasis\": \"balanced|visual|text|metric\", \
\"rationale\": <one sentence>}. Only choose a listed candidate.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emphasis {
    Balanced,
    Visual,
    Text,
    Metric,
}

impl Emphasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Visual => "visual",
            Self::Text => "text",
            Self::Metric => "metric",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "balanced" => Some(Self::Balanced),
            "visual" => Some(Self::Visual),
            "text" => Some(Self::Text),
            "metric" => Some(Self::Metric),
            _ => None,
        }
    }
}

pub fn infer_emphasis(slide: &SlideContent, template: &TemplateProfile) -> Emphasis {
    let kinds = slide
        .visual_requests
        .iter()
        .map(|visual| visual.kind.trim().to_ascii_lowercase())
        .collect::<Vec<String>>();
    if kinds.iter().any(|kind| kind == "kpi") {
        return Emphasis::Metric;
    }
    if kinds.iter().any(|kind| template.supports_visual(kind)) {
        return Emphasis::Visual;
    }
    if kinds.is_empty() && !slide.claims.is_empty() {
        return Emphasis::Text;
    }
    Emphasis::Balanced
}

/// Everything a provider sees when deciding one slide.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    /// 1-based position in the deck.
    pub page: usize,
    pub slide: &'a SlideContent,
    pub previous: Option<&'a SlideContent>,
    pub next: Option<&'a SlideContent>,
    pub candidates: &'a [&'a TemplateProfile],
    pub catalog: &'a TemplateCatalog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDecision {
    pub template: String,
    pub emphasis: Emphasis,
    pub rationale: String,
}

pub trait DecisionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn decide(&self, request: &DecisionRequest<'_>) -> Result<ProviderDecision>;
}

#[derive(Default)]
pub struct DecisionProviderRegistry {
    providers: BTreeMap<String, Box<dyn DecisionProvider>>,
}

impl DecisionProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: DecisionProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.kind().as_str().to_string(), Box::new(provider));
    }

    pub fn get(&self, kind: ProviderKind) -> Option<&dyn DecisionProvider> {
        self.providers
            .get(kind.as_str())
            .map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(config: &PipelineConfig) -> Result<DecisionProviderRegistry> {
    let mut providers = DecisionProviderRegistry::new();
    providers.register(HeuristicProvider);
    providers.register(LocalReasoningProvider);
    providers.register(HostedModelProvider::new(
        &config.hosted.endpoint,
        &config.hosted.model,
        hosted_api_key(),
        config.timeout(),
    )?);
    Ok(providers)
}

fn describe(breakdown: &FitBreakdown) -> String {
    format!(
        "{} scored {:.3} (title {:.1}, message {:.1}, body {:.1}, visuals {:.1}, claims {:.1}, category {:.1})",
        breakdown.template,
        breakdown.total,
        breakdown.title,
        breakdown.message,
        breakdown.body,
        breakdown.visuals,
        breakdown.claims,
        breakdown.category
    )
}

/// Picks the highest fit score; ties go to the earlier template.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicProvider;

impl DecisionProvider for HeuristicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Heuristic
    }

    fn decide(&self, request: &DecisionRequest<'_>) -> Result<ProviderDecision> {
        let ranked = FitScorer.rank(request.slide, request.candidates);
        let Some((template, breakdown)) = ranked.first() else {
            bail!("no candidate templates for category '{}'", request.slide.category);
        };
        let mut rationale = describe(breakdown);
        if let Some((runner_up, score)) = ranked.get(1) {
            rationale.push_str(&format!("; runner-up {} at {:.3}", runner_up.name, score.total));
        }
        Ok(ProviderDecision {
            template: template.name.clone(),
            emphasis: infer_emphasis(request.slide, template),
            rationale,
        })
    }
}

/// Heuristic scores adjusted for deck rhythm: the template the previous slide would pick on its
/// own is penalized, and templates that host the requested visual kinds get a bonus.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReasoningProvider;

impl DecisionProvider for LocalReasoningProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalReasoning
    }

    fn decide(&self, request: &DecisionRequest<'_>) -> Result<ProviderDecision> {
        let neighbour_pick = request
            .previous
            .and_then(|previous| FitScorer.best(previous, request.catalog))
            .map(|(template, _)| template.name.clone());

        let mut adjusted = FitScorer
            .rank(request.slide, request.candidates)
            .into_iter()
            .map(|(template, breakdown)| {
                let mut notes = Vec::new();
                let mut total = breakdown.total;
                if neighbour_pick.as_deref() == Some(template.name.as_str()) {
                    total -= ADJACENT_REPEAT_PENALTY;
                    notes.push("repeats previous layout".to_string());
                }
                let affinity = request
                    .slide
                    .visual_requests
                    .iter()
                    .filter(|visual| template.supports_visual(&visual.kind))
                    .count();
                if affinity > 0 {
                    total += VISUAL_AFFINITY_BONUS * affinity as f64;
                    notes.push(format!("hosts {affinity} requested visual(s)"));
                }
                (template, breakdown, total, notes)
            })
            .collect::<Vec<_>>();
        // Stable: rank order already breaks ties by declaration order.
        adjusted.sort_by(|left, right| right.2.total_cmp(&left.2));

        let Some((template, breakdown, total, notes)) = adjusted.into_iter().next() else {
            bail!("no candidate templates for category '{}'", request.slide.category);
        };
        let mut rationale = format!("{}; adjusted {:.3}", describe(&breakdown), total);
        if !notes.is_empty() {
            rationale.push_str(&format!(" ({})", notes.join(", ")));
        }
        Ok(ProviderDecision {
            template: template.name.clone(),
            emphasis: infer_emphasis(request.slide, template),
            rationale,
        })
    }
}

/// OpenAI-compatible chat completion; one attempt bounded by the client timeout.
pub struct HostedModelProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl HostedModelProvider {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build hosted model HTTP client")?;
        Ok(Self {
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            api_key,
            http,
        })
    }

    fn request_payload(&self, request: &DecisionRequest<'_>) -> Value {
        let candidates = FitScorer
            .rank(request.slide, request.candidates)
            .into_iter()
            .map(|(template, breakdown)| {
                json!({
                    "name": template.name,
                    "zone_capacities": template.zone_capacities,
                    "expected_visual_count_range": template.expected_visual_count_range,
                    "expected_claim_count_range": template.expected_claim_count_range,
                    "visual_kinds": template.visual_kinds,
                    "heuristic_score": breakdown.total,
                })
            })
            .collect::<Vec<Value>>();
        let slide = request.slide;
        let user = json!({
            "page": request.page,
            "slide": {
                "id": slide.id,
                "category": slide.category,
                "title": slide.title,
                "governing_message": slide.governing_message,
                "claims": slide.claims.iter().map(|claim| claim.text.as_str()).collect::<Vec<&str>>(),
                "visual_requests": slide.visual_requests.iter().map(|visual| visual.kind.as_str()).collect::<Vec<&str>>(),
            },
            "previous_title": request.previous.map(|previous| previous.title.as_str()),
            "next_title": request.next.map(|next| next.title.as_str()),
            "candidates": candidates,
        });
        json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": HOSTED_SYSTEM_PROMPT},
                {"role": "user", "content": user.to_string()},
            ],
        })
    }
}

impl DecisionProvider for HostedModelProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HostedModel
    }

    fn decide(&self, request: &DecisionRequest<'_>) -> Result<ProviderDecision> {
        if self.api_key.is_none() && self.endpoint.starts_with("https://") {
            bail!("no API key for hosted model (set DECKFIT_API_KEY or OPENAI_API_KEY)");
        }
        let payload = self.request_payload(request);
        let mut call = self.http.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            call = call.bearer_auth(api_key);
        }
        let response = call
            .send()
            .with_context(|| format!("hosted model request failed ({})", self.endpoint))?;
        let body = response_json_or_error("hosted model", response)?;
        let content = extract_message_text(&body)
            .ok_or_else(|| anyhow!("hosted model response has no message content"))?;
        let decision = extract_json_object(&content)
            .ok_or_else(|| anyhow!("hosted model reply is not a JSON object: {}", truncate_text(&content, 160)))?;

        let template = decision
            .get("template")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("hosted model reply has no template"))?;
        let Some(profile) = request
            .candidates
            .iter()
            .find(|candidate| candidate.name == template)
        else {
            bail!("hosted model proposed unknown template '{template}'");
        };
        let emphasis = decision
            .get("emphasis")
            .and_then(Value::as_str)
            .and_then(Emphasis::parse)
            .unwrap_or_else(|| infer_emphasis(request.slide, profile));
        let rationale = decision
            .get("rationale")
            .and_then(Value::as_str)
            .map(|text| truncate_text(text.trim(), 240))
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| format!("{} chose {template}", self.model));

        Ok(ProviderDecision {
            template: profile.name.clone(),
            emphasis,
            rationale,
        })
    }
}

fn hosted_api_key() -> Option<String> {
    non_empty_env("DECKFIT_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY"))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn extract_message_text(body: &Value) -> Option<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| body.get("output_text").and_then(Value::as_str))
        .map(str::to_string)
}

fn extract_json_object(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&content[start..=end])
        .ok()
        .filter(Value::is_object)
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().is_some_and(|existing| existing == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use deckfit_contracts::deck::{Claim, SlideContent, VisualRequest};
    use deckfit_contracts::providers::ProviderKind;
    use deckfit_contracts::templates::{TemplateCatalog, TemplateProfile};

    use super::{
        extract_json_object, DecisionProvider, DecisionRequest, Emphasis, HeuristicProvider,
        HostedModelProvider, LocalReasoningProvider,
    };
    use crate::capacity::CapacityModel;
    use crate::catalog::bundled_catalog;

    fn slide(id: &str, category: &str, visual: Option<&str>) -> SlideContent {
        SlideContent {
            id: id.to_string(),
            category: category.to_string(),
            title: "Margin outlook by region".to_string(),
            governing_message: "Prioritize pricing discipline in the mid-market.".to_string(),
            claims: vec![Claim {
                text: "Gross margin fell 3.7pt in FY2024 across all regions.".to_string(),
                supporting_reference_ids: vec!["sources.md#finance".to_string()],
            }],
            visual_requests: visual
                .map(|kind| {
                    vec![VisualRequest {
                        kind: kind.to_string(),
                        description: String::new(),
                    }]
                })
                .unwrap_or_default(),
            source_footer: Vec::new(),
            slide_constraints: Default::default(),
        }
    }

    fn catalog() -> anyhow::Result<TemplateCatalog> {
        bundled_catalog(&CapacityModel::new(12, 0.9))
    }

    /// Serves one canned HTTP response and returns the request it received.
    fn serve_once(body: String) -> anyhow::Result<(String, thread::JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let endpoint = format!("http://{}/v1/chat/completions", listener.local_addr()?);
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return String::new();
            };
            let mut received = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let Ok(read) = stream.read(&mut buffer) else {
                    break;
                };
                received.extend_from_slice(&buffer[..read]);
                let text = String::from_utf8_lossy(&received);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .and_then(|value| value.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + length {
                        break;
                    }
                }
                if read == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
            String::from_utf8_lossy(&received).to_string()
        });
        Ok((endpoint, handle))
    }

    #[test]
    fn heuristic_prefers_category_templates() -> anyhow::Result<()> {
        let catalog = catalog()?;
        let content = slide("s1", "chart", Some("chart"));
        let candidates = catalog.candidates("chart");
        let request = DecisionRequest {
            page: 1,
            slide: &content,
            previous: None,
            next: None,
            candidates: &candidates,
            catalog: &catalog,
        };
        let decision = HeuristicProvider.decide(&request)?;
        // A single short claim underfills the tall chart_insight body.
        assert_eq!(decision.template, "chart_full");
        assert_eq!(decision.emphasis, Emphasis::Visual);
        assert!(decision.rationale.starts_with("chart_full scored"));
        assert!(decision.rationale.contains("runner-up chart_insight"));
        Ok(())
    }

    #[test]
    fn local_reasoning_avoids_repeating_the_previous_layout() -> anyhow::Result<()> {
        let catalog = catalog()?;
        let previous = slide("s1", "chart", Some("chart"));
        let content = slide("s2", "chart", Some("chart"));
        let candidates = catalog.candidates("chart");
        let request = DecisionRequest {
            page: 2,
            slide: &content,
            previous: Some(&previous),
            next: None,
            candidates: &candidates,
            catalog: &catalog,
        };
        let decision = LocalReasoningProvider.decide(&request)?;
        assert_eq!(decision.template, "chart_insight");
        assert!(decision.rationale.contains("hosts 1 requested visual(s)"));
        Ok(())
    }

    #[test]
    fn hosted_model_reads_chat_completion_reply() -> anyhow::Result<()> {
        let catalog = catalog()?;
        let content = slide("s1", "chart", Some("chart"));
        let candidates = catalog.candidates("chart");
        let reply = serde_json::json!({
            "choices": [{"message": {"content": "{\"template\": \"chart_full\", \"emphasis\": \"metric\", \"rationale\": \"wide chart reads better\"}"}}]
        });
        let (endpoint, handle) = serve_once(reply.to_string())?;
        let provider =
            HostedModelProvider::new(&endpoint, "test-model", None, Duration::from_secs(5))?;
        let request = DecisionRequest {
            page: 1,
            slide: &content,
            previous: None,
            next: None,
            candidates: &candidates,
            catalog: &catalog,
        };
        let decision = provider.decide(&request)?;
        let received = handle.join().unwrap_or_default();

        assert_eq!(provider.kind(), ProviderKind::HostedModel);
        assert_eq!(decision.template, "chart_full");
        assert_eq!(decision.emphasis, Emphasis::Metric);
        assert_eq!(decision.rationale, "wide chart reads better");
        assert!(received.contains("\"model\":\"test-model\""));
        assert!(received.contains("chart_insight"));
        Ok(())
    }

    #[test]
    fn hosted_model_rejects_unknown_templates() -> anyhow::Result<()> {
        let catalog = catalog()?;
        let content = slide("s1", "chart", None);
        let candidates = catalog.candidates("chart");
        let reply = serde_json::json!({"output_text": "{\"template\": \"hologram\"}"});
        let (endpoint, handle) = serve_once(reply.to_string())?;
        let provider =
            HostedModelProvider::new(&endpoint, "test-model", None, Duration::from_secs(5))?;
        let request = DecisionRequest {
            page: 1,
            slide: &content,
            previous: None,
            next: None,
            candidates: &candidates,
            catalog: &catalog,
        };
        let err = provider.decide(&request).err().map(|err| err.to_string());
        let _ = handle.join();
        assert_eq!(
            err.as_deref(),
            Some("hosted model proposed unknown template 'hologram'")
        );
        Ok(())
    }

    #[test]
    fn hosted_model_without_key_fails_fast_on_https() -> anyhow::Result<()> {
        let catalog = catalog()?;
        let content = slide("s1", "chart", None);
        let candidates: Vec<&TemplateProfile> = catalog.candidates("chart");
        let provider = HostedModelProvider::new(
            "https://api.example.invalid/v1/chat/completions",
            "test-model",
            None,
            Duration::from_secs(1),
        )?;
        let request = DecisionRequest {
            page: 1,
            slide: &content,
            previous: None,
            next: None,
            candidates: &candidates,
            catalog: &catalog,
        };
        assert!(provider.decide(&request).is_err());
        Ok(())
    }

    #[test]
    fn json_object_is_found_inside_prose() {
        let value = extract_json_object("Sure! {\"template\": \"a\"} hope this helps");
        assert_eq!(value.and_then(|row| row["template"].as_str().map(str::to_string)), Some("a".to_string()));
        assert!(extract_json_object("no json here").is_none());
    }
}
