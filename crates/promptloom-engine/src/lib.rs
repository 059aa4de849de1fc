use std::collections::BTreeMap;
use std::env;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use promptloom_contracts::batch::{BatchSnapshot, BatchState};
use promptloom_contracts::events::{BatchEvent, EventLog};
use promptloom_contracts::jobs::{ImageData, JobStatus, PromptJob};
use promptloom_contracts::naming::archive_entry_name;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::Url;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One generated image as returned by an upstream service.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub seed: Option<i64>,
    pub negative_prompt: Option<String>,
    /// Upstream model identifier; empty means the provider default.
    pub model: String,
    pub timeout: Duration,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Offline provider producing a deterministic solid-color placeholder.
/// Used by tests and smoke runs; never touches the network.
struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let width = request.width.clamp(8, 256);
        let height = request.height.clamp(8, 256);
        let (r, g, b) = color_from_prompt(&request.prompt, request.seed.unwrap_or_default());
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut cursor = Cursor::new(Vec::new());
        canvas
            .write_to(&mut cursor, ImageFormat::Png)
            .context("failed encoding dryrun placeholder")?;
        Ok(GeneratedImage {
            bytes: cursor.into_inner(),
            mime_type: Some("image/png".to_string()),
        })
    }
}

struct PollinationsProvider {
    api_base: String,
    http: HttpClient,
}

impl PollinationsProvider {
    fn new() -> Self {
        Self {
            api_base: api_base_from_env("POLLINATIONS_API_BASE", "https://image.pollinations.ai"),
            http: HttpClient::new(),
        }
    }

    fn resolve_model(request: &GenerateRequest) -> &str {
        let trimmed = request.model.trim();
        if trimmed.is_empty() {
            "flux"
        } else {
            trimmed
        }
    }

    fn request_url(&self, request: &GenerateRequest) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .with_context(|| format!("invalid Pollinations base URL ({})", self.api_base))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Pollinations base URL cannot carry path segments"))?
            .pop_if_empty()
            .push("prompt")
            .push(&request.prompt);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("width", &request.width.to_string());
            query.append_pair("height", &request.height.to_string());
            query.append_pair("model", Self::resolve_model(request));
            query.append_pair("nologo", "true");
            if let Some(seed) = request.seed {
                query.append_pair("seed", &seed.to_string());
            }
            if let Some(negative) = request.negative_prompt.as_deref() {
                query.append_pair("negative", negative);
            }
        }
        Ok(url)
    }
}

impl ImageProvider for PollinationsProvider {
    fn name(&self) -> &str {
        "pollinations"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let url = self.request_url(request)?;
        let response = self
            .http
            .get(url.clone())
            .timeout(request.timeout)
            .send()
            .with_context(|| format!("Pollinations request failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Pollinations request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = content_type(&response);
        if !mime_type
            .as_deref()
            .map(|mime| mime.contains("image"))
            .unwrap_or(false)
        {
            bail!(
                "Pollinations returned no image payload (content-type {})",
                mime_type.as_deref().unwrap_or("missing")
            );
        }
        let bytes = response
            .bytes()
            .context("failed reading Pollinations image bytes")?
            .to_vec();
        Ok(GeneratedImage { bytes, mime_type })
    }
}

const CRAIYON_DEFAULT_VERSION: &str = "c6y2m3p4z3t8";

struct CraiyonProvider {
    api_base: String,
    http: HttpClient,
}

impl CraiyonProvider {
    fn new() -> Self {
        Self {
            api_base: api_base_from_env("CRAIYON_API_BASE", "https://backend.craiyon.com"),
            http: HttpClient::new(),
        }
    }

    fn resolve_version(request: &GenerateRequest) -> &str {
        let trimmed = request.model.trim();
        if trimmed.is_empty() {
            CRAIYON_DEFAULT_VERSION
        } else {
            trimmed
        }
    }

    fn decode_first_image(payload: &Value) -> Result<GeneratedImage> {
        let images = payload
            .get("images")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in images {
            let Some(data) = item.as_str().map(str::trim).filter(|data| !data.is_empty()) else {
                continue;
            };
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("Craiyon image base64 decode failed")?;
            return Ok(GeneratedImage {
                bytes,
                mime_type: Some("image/png".to_string()),
            });
        }
        bail!("Craiyon response contained no images");
    }
}

impl ImageProvider for CraiyonProvider {
    fn name(&self) -> &str {
        "craiyon"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let endpoint = format!("{}/v3", self.api_base);
        let payload = json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt.clone().unwrap_or_default(),
            "version": Self::resolve_version(request),
        });
        let response = self
            .http
            .post(&endpoint)
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Craiyon request failed ({endpoint})"))?;
        let payload = response_json_or_error("Craiyon", response)?;
        Self::decode_first_image(&payload)
    }
}

struct DeepaiProvider {
    api_base: String,
    http: HttpClient,
}

impl DeepaiProvider {
    fn new() -> Self {
        Self {
            api_base: api_base_from_env("DEEPAI_API_BASE", "https://api.deepai.org"),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("DEEPAI_API_KEY")
    }

    fn download_image(&self, url: &str, timeout: Duration) -> Result<GeneratedImage> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .with_context(|| format!("failed downloading DeepAI image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "DeepAI image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = content_type(&response);
        let bytes = response
            .bytes()
            .context("failed reading DeepAI image bytes")?
            .to_vec();
        Ok(GeneratedImage { bytes, mime_type })
    }
}

impl ImageProvider for DeepaiProvider {
    fn name(&self) -> &str {
        "deepai"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let Some(api_key) = Self::api_key() else {
            bail!("DEEPAI_API_KEY not set");
        };
        let endpoint = format!("{}/api/text2img", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .header("api-key", api_key)
            .timeout(request.timeout)
            .form(&[("text", request.prompt.as_str())])
            .send()
            .with_context(|| format!("DeepAI request failed ({endpoint})"))?;
        let payload = response_json_or_error("DeepAI", response)?;
        let Some(output_url) = payload
            .get("output_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
        else {
            bail!("DeepAI response contained no output_url");
        };
        self.download_image(output_url, request.timeout)
    }
}

struct CloudflareProvider {
    api_base: String,
    http: HttpClient,
}

impl CloudflareProvider {
    const DEFAULT_MODEL: &'static str = "@cf/stabilityai/stable-diffusion-xl-base-1.0";

    fn new() -> Self {
        Self {
            api_base: api_base_from_env("CLOUDFLARE_API_BASE", "https://api.cloudflare.com/client/v4"),
            http: HttpClient::new(),
        }
    }

    fn account_id() -> Option<String> {
        non_empty_env("CLOUDFLARE_ACCOUNT_ID")
    }

    fn api_token() -> Option<String> {
        non_empty_env("CLOUDFLARE_API_TOKEN")
    }

    fn resolve_model(request: &GenerateRequest) -> &str {
        let trimmed = request.model.trim();
        if trimmed.is_empty() {
            Self::DEFAULT_MODEL
        } else {
            trimmed
        }
    }

    fn error_messages(payload: &Value) -> String {
        let messages: Vec<String> = payload
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(|error| error.get("message").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if messages.is_empty() {
            truncate_text(&payload.to_string(), 512)
        } else {
            messages.join("; ")
        }
    }
}

impl ImageProvider for CloudflareProvider {
    fn name(&self) -> &str {
        "cloudflare"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let Some(account_id) = Self::account_id() else {
            bail!("CLOUDFLARE_ACCOUNT_ID not set");
        };
        let Some(api_token) = Self::api_token() else {
            bail!("CLOUDFLARE_API_TOKEN not set");
        };
        let model = Self::resolve_model(request);
        let endpoint = format!("{}/accounts/{}/ai/run/{}", self.api_base, account_id, model);

        let mut body = json!({
            "prompt": request.prompt,
            "width": request.width,
            "height": request.height,
        });
        if let Some(negative) = request.negative_prompt.as_deref() {
            body["negative_prompt"] = Value::String(negative.to_string());
        }
        if let Some(seed) = request.seed {
            body["seed"] = Value::Number(seed.into());
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_token)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .with_context(|| format!("Cloudflare request failed ({endpoint})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Cloudflare request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = content_type(&response);
        // Workers AI answers image routes with raw bytes; a JSON body on a
        // success status is an error envelope with no usable image.
        if mime_type
            .as_deref()
            .map(|mime| mime.contains("application/json"))
            .unwrap_or(false)
        {
            let payload: Value = response
                .json()
                .context("Cloudflare returned invalid JSON payload")?;
            bail!(
                "Cloudflare returned no image payload: {}",
                Self::error_messages(&payload)
            );
        }
        let bytes = response
            .bytes()
            .context("failed reading Cloudflare image bytes")?
            .to_vec();
        Ok(GeneratedImage { bytes, mime_type })
    }
}

struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    const DEFAULT_MODEL: &'static str = "gemini-2.5-flash-image";

    fn new() -> Self {
        Self {
            api_base: api_base_from_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn resolve_model(request: &GenerateRequest) -> &str {
        let trimmed = request.model.trim();
        if trimmed.is_empty() {
            Self::DEFAULT_MODEL
        } else {
            trimmed
        }
    }

    fn prompt_text(request: &GenerateRequest) -> String {
        match request.negative_prompt.as_deref() {
            Some(negative) if !negative.trim().is_empty() => {
                format!("{}\nAvoid: {}", request.prompt, negative.trim())
            }
            _ => request.prompt.clone(),
        }
    }

    fn extract_inline_images(response_payload: &Value) -> Result<Vec<GeneratedImage>> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .context("Gemini image base64 decode failed")?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                out.push(GeneratedImage { bytes, mime_type });
            }
        }

        Ok(out)
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(Self::resolve_model(request));
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": Self::prompt_text(request) }],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let payload = response_json_or_error("Gemini", response)?;
        let mut images = Self::extract_inline_images(&payload)?;
        if images.is_empty() {
            bail!("Gemini response contained no image parts");
        }
        Ok(images.remove(0))
    }
}

/// Registry with every built-in upstream plus the offline dryrun provider.
pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(PollinationsProvider::new());
    registry.register(CraiyonProvider::new());
    registry.register(DeepaiProvider::new());
    registry.register(CloudflareProvider::new());
    registry.register(GeminiProvider::new());
    registry
}

const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub provider: String,
    /// Primary model; empty means the provider default.
    pub model: String,
    /// Ordered fallback models tried on later attempts.
    pub model_fallbacks: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub seed: Option<i64>,
    pub negative_prompt: Option<String>,
    pub attempts: usize,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            provider: "pollinations".to_string(),
            model: String::new(),
            model_fallbacks: Vec::new(),
            width: 1024,
            height: 1024,
            seed: None,
            negative_prompt: None,
            attempts: 1,
            retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// Processes a batch of prompts strictly sequentially against one provider.
///
/// Serialization is deliberate: the upstream services rate-limit aggressively,
/// so one request is in flight at a time. Failures stay contained to their
/// job; the batch always runs to completion over every prompt.
pub struct BatchRunner {
    registry: ProviderRegistry,
    config: RunnerConfig,
    events_path: Option<PathBuf>,
}

impl BatchRunner {
    pub fn new(registry: ProviderRegistry, config: RunnerConfig) -> Self {
        Self {
            registry,
            config,
            events_path: None,
        }
    }

    pub fn with_events_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.events_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs one submission. The observer receives a snapshot after every
    /// transition, starting with the all-pending placeholder list; the final
    /// snapshot has `done = true`. Empty input is a no-op and the observer is
    /// never called.
    pub fn run<F>(&self, raw_text: &str, mut observer: F) -> Result<BatchSnapshot>
    where
        F: FnMut(&BatchSnapshot),
    {
        let mut state = BatchState::from_raw_text(raw_text);
        if state.is_empty() {
            return Ok(state.snapshot());
        }

        let provider = self
            .registry
            .get(&self.config.provider)
            .with_context(|| format!("unknown provider '{}'", self.config.provider))?;
        let events = self
            .events_path
            .as_ref()
            .map(|path| EventLog::new(path, state.batch_id()));

        record_event(
            events.as_ref(),
            &BatchEvent::BatchStarted {
                provider: provider.name().to_string(),
                jobs: state.len(),
            },
        );
        observer(&state.snapshot());

        let queue: Vec<(String, String)> = state
            .jobs()
            .iter()
            .map(|job| (job.id.clone(), job.prompt.clone()))
            .collect();

        for (position, (id, prompt)) in queue.iter().enumerate() {
            let snapshot = state.start_job(id)?;
            record_event(
                events.as_ref(),
                &BatchEvent::JobStarted {
                    job_id: id.clone(),
                    index: position,
                    prompt: prompt.clone(),
                },
            );
            observer(&snapshot);

            let started = Instant::now();
            let snapshot = match self.generate_with_retries(provider, prompt) {
                Ok((image, model)) => {
                    record_event(
                        events.as_ref(),
                        &BatchEvent::JobSucceeded {
                            job_id: id.clone(),
                            model,
                            bytes: image.bytes.len(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                    state.complete_job(id, image_data_from(image))?
                }
                Err(err) => {
                    let message = error_chain_text(&err, 512);
                    record_event(
                        events.as_ref(),
                        &BatchEvent::JobFailed {
                            job_id: id.clone(),
                            error: message.clone(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                    state.fail_job(id, message)?
                }
            };
            observer(&snapshot);
        }

        let snapshot = state.snapshot();
        let succeeded = snapshot
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Succeeded)
            .count();
        record_event(
            events.as_ref(),
            &BatchEvent::BatchCompleted {
                succeeded,
                failed: snapshot.jobs.len() - succeeded,
            },
        );
        Ok(snapshot)
    }

    /// Ordered per-attempt model list: the primary model first, then each
    /// fallback once, padded with the last entry up to the configured attempt
    /// count. Bounded so a job can never stall the batch indefinitely.
    fn attempt_plan(&self) -> Vec<String> {
        let mut models = vec![self.config.model.trim().to_string()];
        for fallback in &self.config.model_fallbacks {
            let trimmed = fallback.trim();
            if !trimmed.is_empty() && !models.iter().any(|model| model == trimmed) {
                models.push(trimmed.to_string());
            }
        }
        models.truncate(MAX_ATTEMPTS);
        let tries = self
            .config
            .attempts
            .clamp(1, MAX_ATTEMPTS)
            .max(models.len());
        while models.len() < tries {
            let last = models.last().cloned().unwrap_or_default();
            models.push(last);
        }
        models
    }

    fn generate_with_retries(
        &self,
        provider: &dyn ImageProvider,
        prompt: &str,
    ) -> Result<(GeneratedImage, String)> {
        let plan = self.attempt_plan();
        let total = plan.len();
        let mut last_err = None;

        for (attempt, model) in plan.iter().enumerate() {
            if attempt > 0 && !self.config.retry_delay.is_zero() {
                thread::sleep(self.config.retry_delay);
            }
            let request = GenerateRequest {
                prompt: prompt.to_string(),
                width: self.config.width,
                height: self.config.height,
                seed: self.config.seed,
                negative_prompt: self.config.negative_prompt.clone(),
                model: model.clone(),
                timeout: self.config.request_timeout,
            };
            match provider.generate(&request) {
                Ok(image) => return Ok((image, display_model(model).to_string())),
                Err(err) => {
                    last_err = Some(err.context(format!(
                        "attempt {}/{} (model '{}')",
                        attempt + 1,
                        total,
                        display_model(model)
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no generation attempts were made")))
    }
}

/// Packs every succeeded job into a zip archive, one entry per job in job
/// order. Returns `None` when no job succeeded.
pub fn export_archive(jobs: &[PromptJob]) -> Result<Option<Vec<u8>>> {
    let succeeded: Vec<&PromptJob> = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Succeeded)
        .collect();
    if succeeded.is_empty() {
        return Ok(None);
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (position, job) in succeeded.iter().enumerate() {
        let Some(image) = job.image.as_ref() else {
            continue;
        };
        let name = archive_entry_name(&job.prompt, position + 1, &image.extension);
        if writer.start_file(name.as_str(), options).is_err() {
            continue;
        }
        if writer.write_all(&image.bytes).is_err() {
            let _ = writer.abort_file();
            continue;
        }
    }

    let cursor = writer.finish().context("failed finalizing zip archive")?;
    Ok(Some(cursor.into_inner()))
}

/// Writes the batch archive to `path`. Returns `false` when there was
/// nothing to export and no file was written.
pub fn write_archive(jobs: &[PromptJob], path: &Path) -> Result<bool> {
    match export_archive(jobs)? {
        Some(bytes) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating {}", parent.display()))?;
            }
            std::fs::write(path, bytes)
                .with_context(|| format!("failed writing {}", path.display()))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

pub fn image_data_from(image: GeneratedImage) -> ImageData {
    let extension = extension_from_mime(image.mime_type.as_deref()).to_string();
    ImageData {
        bytes: image.bytes,
        extension,
    }
}

pub fn extension_from_mime(mime: Option<&str>) -> &'static str {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("gif") {
            return "gif";
        }
    }
    "png"
}

fn display_model(model: &str) -> &str {
    if model.trim().is_empty() {
        "default"
    } else {
        model
    }
}

fn api_base_from_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn content_type(response: &HttpResponse) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
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

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn color_from_prompt(prompt: &str, seed: i64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

// Event log trouble must never abort a running batch; the loss is reported
// on stderr and every job still reaches a terminal state.
fn record_event(events: Option<&EventLog>, event: &BatchEvent) {
    if let Some(events) = events {
        if let Err(err) = events.record(event) {
            eprintln!("event log write failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use promptloom_contracts::jobs::parse_prompts;
    use zip::ZipArchive;

    use super::*;

    enum ScriptedOutcome {
        Image(&'static [u8]),
        Error(&'static str),
    }

    /// In-process provider driven by a fixed outcome script. Outcomes are
    /// consumed in call order; the script repeats its last entry when
    /// exhausted.
    struct ScriptedProvider {
        outcomes: Vec<ScriptedOutcome>,
        calls: AtomicUsize,
        models_seen: Mutex<Vec<String>>,
        timeouts_seen: Mutex<Vec<Duration>>,
    }

    impl ScriptedProvider {
        fn new(outcomes: Vec<ScriptedOutcome>) -> Self {
            Self {
                outcomes,
                calls: AtomicUsize::new(0),
                models_seen: Mutex::new(Vec::new()),
                timeouts_seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ImageProvider for &'static ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.models_seen
                .lock()
                .unwrap()
                .push(request.model.clone());
            self.timeouts_seen.lock().unwrap().push(request.timeout);
            let outcome = self
                .outcomes
                .get(call)
                .or_else(|| self.outcomes.last())
                .expect("scripted provider needs at least one outcome");
            match outcome {
                ScriptedOutcome::Image(bytes) => Ok(GeneratedImage {
                    bytes: bytes.to_vec(),
                    mime_type: Some("image/png".to_string()),
                }),
                ScriptedOutcome::Error(message) => Err(anyhow!("{message}")),
            }
        }
    }

    fn scripted_runner(provider: &'static ScriptedProvider, config: RunnerConfig) -> BatchRunner {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        BatchRunner::new(registry, config)
    }

    fn quick_config() -> RunnerConfig {
        RunnerConfig {
            provider: "scripted".to_string(),
            retry_delay: Duration::ZERO,
            ..RunnerConfig::default()
        }
    }

    fn leak(provider: ScriptedProvider) -> &'static ScriptedProvider {
        Box::leak(Box::new(provider))
    }

    #[test]
    fn empty_input_is_a_noop() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![ScriptedOutcome::Error("unused")]));
        let runner = scripted_runner(provider, quick_config());

        let mut observer_calls = 0;
        let snapshot = runner.run("   \n\t\n", |_| observer_calls += 1)?;

        assert!(snapshot.jobs.is_empty());
        assert_eq!(observer_calls, 0);
        assert_eq!(provider.calls(), 0);
        Ok(())
    }

    #[test]
    fn jobs_match_non_empty_lines_in_order() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![ScriptedOutcome::Image(b"img")]));
        let runner = scripted_runner(provider, quick_config());

        let snapshot = runner.run("a red apple\n\nb blue sky\n", |_| {})?;
        let prompts: Vec<&str> = snapshot
            .jobs
            .iter()
            .map(|job| job.prompt.as_str())
            .collect();
        assert_eq!(prompts, vec!["a red apple", "b blue sky"]);
        assert_eq!(prompts, parse_prompts("a red apple\n\nb blue sky\n"));
        Ok(())
    }

    #[test]
    fn first_snapshot_is_all_pending_placeholders() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![ScriptedOutcome::Image(b"img")]));
        let runner = scripted_runner(provider, quick_config());

        let mut snapshots: Vec<BatchSnapshot> = Vec::new();
        runner.run("one\ntwo", |snapshot| snapshots.push(snapshot.clone()))?;

        let first = snapshots.first().expect("no snapshots emitted");
        assert!(first
            .jobs
            .iter()
            .all(|job| job.status == JobStatus::Pending));
        assert!(!first.done);
        assert!(snapshots.last().expect("no snapshots").done);
        Ok(())
    }

    #[test]
    fn all_jobs_reach_a_terminal_state() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![
            ScriptedOutcome::Image(b"one"),
            ScriptedOutcome::Error("boom"),
            ScriptedOutcome::Image(b"three"),
        ]));
        let runner = scripted_runner(provider, quick_config());

        let snapshot = runner.run("one\ntwo\nthree", |_| {})?;
        assert!(snapshot.done);
        for job in &snapshot.jobs {
            assert!(job.status.is_terminal(), "job {} not terminal", job.index);
            match job.status {
                JobStatus::Succeeded => {
                    assert!(job.image.is_some());
                    assert!(job.error.is_none());
                }
                JobStatus::Failed => {
                    assert!(job.image.is_none());
                    assert!(!job.error.as_deref().unwrap_or_default().is_empty());
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    #[test]
    fn one_failure_never_skips_later_jobs() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![
            ScriptedOutcome::Image(b"one"),
            ScriptedOutcome::Error("HTTP 500"),
            ScriptedOutcome::Image(b"three"),
        ]));
        let runner = scripted_runner(provider, quick_config());

        let snapshot = runner.run("one\ntwo\nthree", |_| {})?;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(snapshot.jobs[1].status, JobStatus::Failed);
        assert!(snapshot.jobs[1]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("HTTP 500"));
        assert_eq!(snapshot.jobs[2].status, JobStatus::Succeeded);
        assert_eq!(provider.calls(), 3);
        Ok(())
    }

    #[test]
    fn retries_until_an_attempt_succeeds() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![
            ScriptedOutcome::Error("transient"),
            ScriptedOutcome::Error("transient"),
            ScriptedOutcome::Image(b"finally"),
        ]));
        let config = RunnerConfig {
            attempts: 3,
            ..quick_config()
        };
        let runner = scripted_runner(provider, config);

        let snapshot = runner.run("one", |_| {})?;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(provider.calls(), 3);
        Ok(())
    }

    #[test]
    fn attempts_are_bounded() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![ScriptedOutcome::Error("down")]));
        let config = RunnerConfig {
            attempts: 50,
            ..quick_config()
        };
        let runner = scripted_runner(provider, config);

        let snapshot = runner.run("one", |_| {})?;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Failed);
        assert_eq!(provider.calls(), MAX_ATTEMPTS);
        Ok(())
    }

    #[test]
    fn fallback_models_are_tried_in_order() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![
            ScriptedOutcome::Error("model a rejected"),
            ScriptedOutcome::Image(b"from b"),
        ]));
        let config = RunnerConfig {
            model: "model-a".to_string(),
            model_fallbacks: vec!["model-b".to_string()],
            ..quick_config()
        };
        let runner = scripted_runner(provider, config);

        let snapshot = runner.run("one", |_| {})?;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Succeeded);
        let models = provider.models_seen.lock().unwrap().clone();
        assert_eq!(models, vec!["model-a", "model-b"]);
        Ok(())
    }

    #[test]
    fn each_attempt_carries_the_configured_timeout() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![ScriptedOutcome::Error("down")]));
        let config = RunnerConfig {
            attempts: 3,
            request_timeout: Duration::from_millis(1234),
            ..quick_config()
        };
        let runner = scripted_runner(provider, config);

        let snapshot = runner.run("one", |_| {})?;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Failed);
        let timeouts = provider.timeouts_seen.lock().unwrap().clone();
        assert_eq!(timeouts, vec![Duration::from_millis(1234); 3]);
        Ok(())
    }

    #[test]
    fn failing_job_is_bounded_by_attempts_and_retry_delays() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![ScriptedOutcome::Error("down")]));
        let config = RunnerConfig {
            attempts: 3,
            retry_delay: Duration::from_millis(25),
            ..quick_config()
        };
        let runner = scripted_runner(provider, config);

        let started = Instant::now();
        let snapshot = runner.run("one", |_| {})?;
        assert_eq!(snapshot.jobs[0].status, JobStatus::Failed);
        assert_eq!(provider.calls(), 3);
        // two inter-attempt delays of 25ms each
        assert!(started.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let registry = ProviderRegistry::new();
        let runner = BatchRunner::new(
            registry,
            RunnerConfig {
                provider: "nope".to_string(),
                ..RunnerConfig::default()
            },
        );
        assert!(runner.run("one", |_| {}).is_err());
    }

    #[test]
    fn events_trace_the_batch_lifecycle() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![
            ScriptedOutcome::Image(b"one"),
            ScriptedOutcome::Error("boom"),
        ]));
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let runner =
            scripted_runner(provider, quick_config()).with_events_path(&events_path);

        runner.run("one\ntwo", |_| {})?;

        let content = std::fs::read_to_string(&events_path)?;
        let types: Vec<String> = content
            .lines()
            .map(|line| {
                let parsed: Value = serde_json::from_str(line).expect("invalid event line");
                parsed["type"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(
            types,
            vec![
                "batch_started",
                "job_started",
                "job_succeeded",
                "job_started",
                "job_failed",
                "batch_completed",
            ]
        );
        Ok(())
    }

    #[test]
    fn event_log_failures_do_not_abort_the_batch() -> Result<()> {
        let provider = leak(ScriptedProvider::new(vec![
            ScriptedOutcome::Image(b"one"),
            ScriptedOutcome::Error("boom"),
        ]));
        let temp = tempfile::tempdir()?;
        // the events path is a directory, so every append fails
        let runner = scripted_runner(provider, quick_config()).with_events_path(temp.path());

        let snapshot = runner.run("one\ntwo", |_| {})?;
        assert!(snapshot.done);
        assert!(snapshot.jobs.iter().all(|job| job.status.is_terminal()));
        assert_eq!(snapshot.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(snapshot.jobs[1].status, JobStatus::Failed);
        Ok(())
    }

    fn terminal_jobs() -> Vec<PromptJob> {
        let mut state = BatchState::from_raw_text("a red apple\nbroken one\nb blue sky");
        let ids = state.job_ids();
        state.start_job(&ids[0]).unwrap();
        state
            .complete_job(
                &ids[0],
                ImageData {
                    bytes: b"apple-bytes".to_vec(),
                    extension: "png".to_string(),
                },
            )
            .unwrap();
        state.start_job(&ids[1]).unwrap();
        state.fail_job(&ids[1], "upstream 500").unwrap();
        state.start_job(&ids[2]).unwrap();
        state
            .complete_job(
                &ids[2],
                ImageData {
                    bytes: b"sky-bytes".to_vec(),
                    extension: "jpg".to_string(),
                },
            )
            .unwrap();
        state.snapshot().jobs
    }

    #[test]
    fn archive_contains_one_ordered_entry_per_succeeded_job() -> Result<()> {
        let jobs = terminal_jobs();
        let bytes = export_archive(&jobs)?.expect("archive should be produced");

        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        assert_eq!(archive.len(), 2);

        let mut names = Vec::new();
        for index in 0..archive.len() {
            names.push(archive.by_index(index)?.name().to_string());
        }
        assert_eq!(names, vec!["a_red_apple_001.png", "b_blue_sky_002.jpg"]);
        Ok(())
    }

    #[test]
    fn archive_entries_round_trip_byte_for_byte() -> Result<()> {
        let jobs = terminal_jobs();
        let bytes = export_archive(&jobs)?.expect("archive should be produced");

        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut first = Vec::new();
        archive.by_index(0)?.read_to_end(&mut first)?;
        assert_eq!(first, b"apple-bytes");

        let mut second = Vec::new();
        archive.by_index(1)?.read_to_end(&mut second)?;
        assert_eq!(second, b"sky-bytes");
        Ok(())
    }

    #[test]
    fn no_succeeded_jobs_means_no_archive() -> Result<()> {
        let mut state = BatchState::from_raw_text("one\ntwo");
        let ids = state.job_ids();
        for id in &ids {
            state.start_job(id)?;
            state.fail_job(id, "down")?;
        }
        assert!(export_archive(&state.snapshot().jobs)?.is_none());
        Ok(())
    }

    #[test]
    fn write_archive_reports_whether_a_file_was_written() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("out").join("batch.zip");

        assert!(!write_archive(&[], &path)?);
        assert!(!path.exists());

        assert!(write_archive(&terminal_jobs(), &path)?);
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn dryrun_provider_is_deterministic_png() -> Result<()> {
        let request = GenerateRequest {
            prompt: "a red apple".to_string(),
            width: 32,
            height: 32,
            seed: Some(7),
            negative_prompt: None,
            model: String::new(),
            timeout: Duration::from_secs(1),
        };
        let first = DryrunProvider.generate(&request)?;
        let second = DryrunProvider.generate(&request)?;
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(&first.bytes[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(first.mime_type.as_deref(), Some("image/png"));
        Ok(())
    }

    #[test]
    fn gemini_extraction_handles_both_casings() -> Result<()> {
        let encoded = BASE64.encode(b"pixels");
        let payload = json!({
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "here is your image" },
                            { "inlineData": { "mimeType": "image/png", "data": encoded } },
                        ],
                    },
                },
                {
                    "content": {
                        "parts": [
                            { "inline_data": { "mime_type": "image/webp", "data": encoded } },
                        ],
                    },
                },
            ],
        });
        let images = GeminiProvider::extract_inline_images(&payload)?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].bytes, b"pixels");
        assert_eq!(images[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(images[1].mime_type.as_deref(), Some("image/webp"));
        Ok(())
    }

    #[test]
    fn gemini_extraction_of_text_only_response_is_empty() -> Result<()> {
        let payload = json!({
            "candidates": [
                { "content": { "parts": [{ "text": "refused" }] } },
            ],
        });
        assert!(GeminiProvider::extract_inline_images(&payload)?.is_empty());
        Ok(())
    }

    #[test]
    fn craiyon_decode_takes_the_first_image() -> Result<()> {
        let payload = json!({ "images": [BASE64.encode(b"first"), BASE64.encode(b"second")] });
        let image = CraiyonProvider::decode_first_image(&payload)?;
        assert_eq!(image.bytes, b"first");
        Ok(())
    }

    #[test]
    fn craiyon_decode_without_images_is_a_payload_error() {
        let err = CraiyonProvider::decode_first_image(&json!({ "images": [] }))
            .err()
            .expect("empty images must fail");
        assert!(err.to_string().contains("no images"));
    }

    #[test]
    fn extension_inference_prefers_mime() {
        assert_eq!(extension_from_mime(Some("image/jpeg")), "jpg");
        assert_eq!(extension_from_mime(Some("image/webp")), "webp");
        assert_eq!(extension_from_mime(Some("image/png")), "png");
        assert_eq!(extension_from_mime(None), "png");
    }

    #[test]
    fn default_registry_lists_all_providers() {
        let registry = default_provider_registry();
        assert_eq!(
            registry.names(),
            vec![
                "cloudflare",
                "craiyon",
                "deepai",
                "dryrun",
                "gemini",
                "pollinations",
            ]
        );
    }

    #[test]
    fn error_chain_text_joins_causes() {
        let err = anyhow!("root cause")
            .context("middle layer")
            .context("outer layer");
        let text = error_chain_text(&err, 512);
        assert!(text.contains("outer layer"));
        assert!(text.contains("caused by"));
        assert!(text.contains("root cause"));
    }
}
