use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Duration;

const OLLAMA_PROMPT: &str = "Extract the Indian vehicle license plate number from the image. \
Return only the license plate number in the format XX00XX0000. \
If multiple plates are visible, return the most prominent one. \
If no license plate is found, return 'NOT_FOUND'.";

const LLAMA_PROMPT: &str = "Read the Indian license plate number from this image and return \
it in uppercase without any extra text.";

/// One engine's raw answer for a crop.
#[derive(Clone, Debug)]
pub struct EngineReading {
    pub text: String,
    pub confidence: f32,
}

/// A vision/OCR engine behind a uniform contract.
///
/// Engines are external collaborators; an error or timeout here is "no
/// result" for that engine, never a pipeline failure.
pub trait RecognitionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Recognize plate text in a JPEG crop. `Ok(None)` means the engine
    /// answered but found no plate.
    fn recognize(&self, jpeg: &[u8]) -> Result<Option<EngineReading>>;
}

/// The vision models return no calibrated confidence, so readings get a
/// shape-based estimate: a clean plate-length token is trusted, anything
/// chatty is not.
fn estimate_confidence(text: &str) -> f32 {
    let compact: String = text.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if compact.len() == text.len() && (6..=11).contains(&compact.len()) {
        0.9
    } else {
        0.4
    }
}

fn clean_reading(raw: &str) -> Option<EngineReading> {
    let text = raw.trim().trim_matches('"').trim().to_string();
    if text.is_empty()
        || text.eq_ignore_ascii_case("NOT_FOUND")
        || text.eq_ignore_ascii_case("ERROR_PROCESSING")
    {
        return None;
    }
    Some(EngineReading {
        confidence: estimate_confidence(&text),
        text,
    })
}

// ----------------------------------------------------------------------------
// Ollama chat API (fast engine)
// ----------------------------------------------------------------------------

/// Fast engine backed by an Ollama vision model.
pub struct OllamaEngine {
    agent: ureq::Agent,
    host: String,
    model: String,
}

impl OllamaEngine {
    pub fn new(host: &str, model: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_read(timeout)
                .timeout_write(timeout)
                .build(),
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

impl RecognitionEngine for OllamaEngine {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn recognize(&self, jpeg: &[u8]) -> Result<Option<EngineReading>> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": OLLAMA_PROMPT,
                "images": [BASE64.encode(jpeg)],
            }],
            "stream": false,
            "options": {
                "temperature": 0.1,
                "num_ctx": 256,
                "num_predict": 16,
            },
        });
        let response = self
            .agent
            .post(&format!("{}/api/chat", self.host))
            .send_json(payload)
            .context("ollama chat request")?;
        let body: serde_json::Value = response.into_json().context("parse ollama response")?;
        let content = body
            .pointer("/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("ollama response missing message content"))?;
        Ok(clean_reading(content))
    }
}

// ----------------------------------------------------------------------------
// llama.cpp server completion API (accurate engine)
// ----------------------------------------------------------------------------

/// Slower, higher-accuracy engine backed by a llama.cpp server with a
/// vision projector.
pub struct LlamaServerEngine {
    agent: ureq::Agent,
    host: String,
}

impl LlamaServerEngine {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_read(timeout)
                .timeout_write(timeout)
                .build(),
            host: host.trim_end_matches('/').to_string(),
        }
    }
}

impl RecognitionEngine for LlamaServerEngine {
    fn name(&self) -> &'static str {
        "llama-server"
    }

    fn recognize(&self, jpeg: &[u8]) -> Result<Option<EngineReading>> {
        let payload = serde_json::json!({
            "prompt": format!("USER: [img-1] {}\nASSISTANT:", LLAMA_PROMPT),
            "image_data": [{ "data": BASE64.encode(jpeg), "id": 1 }],
            "n_predict": 16,
            "temperature": 0.1,
        });
        let response = self
            .agent
            .post(&format!("{}/completion", self.host))
            .send_json(payload)
            .context("llama server completion request")?;
        let body: serde_json::Value = response.into_json().context("parse llama response")?;
        let content = body
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("llama response missing content"))?;
        Ok(clean_reading(content))
    }
}
