//! `cache_options` plumbing: an in-process cache keyed by a
//! `blake3` hash of everything that determines a model call's output, sitting in front of
//! `ModelConfig::infer` the way the Design Notes describe. Not a distributed cache — that's
//! out of scope here — just the hook so `off`/`read_only`/`read_write`/`write_only` behave.

use std::time::{Duration, Instant};

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::types::{ProviderInferenceResponse, Usage};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheEnabledMode {
    #[default]
    Off,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl CacheEnabledMode {
    fn may_read(self) -> bool {
        matches!(self, CacheEnabledMode::ReadOnly | CacheEnabledMode::ReadWrite)
    }

    fn may_write(self) -> bool {
        matches!(self, CacheEnabledMode::WriteOnly | CacheEnabledMode::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CacheOptions {
    #[serde(default)]
    pub mode: CacheEnabledMode,
    #[serde(default = "default_max_age_s")]
    pub max_age_s: Option<u64>,
}

fn default_max_age_s() -> Option<u64> {
    None
}

/// A cached response, trimmed to the fields a cache hit needs to rebuild a
/// `ProviderInferenceResponse` without the original request in hand.
#[derive(Clone)]
struct CachedResponse {
    content: Vec<crate::inference::types::ContentBlockOutput>,
    raw_request: String,
    raw_response: String,
    usage: Usage,
    finish_reason: Option<crate::inference::types::FinishReason>,
    inserted_at: Instant,
}

pub struct InferenceCache {
    cache: Cache<String, CachedResponse>,
}

impl InferenceCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(Duration::from_secs(60 * 60 * 24))
                .build(),
        }
    }

    /// Hashes exactly the fields that determine a call's output
    /// (`function_or_model_name`, `variant_name`, resolved input, params, tools,
    /// output schema), so two requests that differ only in `episode_id` or tags still share a
    /// cache entry.
    pub fn key(
        model_or_function_name: &str,
        variant_name: &str,
        resolved_input: &Value,
        params: &Value,
        tools: &Value,
        output_schema: Option<&Value>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(model_or_function_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(variant_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(resolved_input.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(params.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(tools.to_string().as_bytes());
        hasher.update(b"\0");
        if let Some(schema) = output_schema {
            hasher.update(schema.to_string().as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn get(&self, options: CacheOptions, key: &str) -> Option<ProviderInferenceResponse> {
        if !options.mode.may_read() {
            return None;
        }
        let cached = self.cache.get(key)?;
        if let Some(max_age_s) = options.max_age_s {
            if cached.inserted_at.elapsed() > Duration::from_secs(max_age_s) {
                self.cache.invalidate(key);
                return None;
            }
        }
        Some(ProviderInferenceResponse {
            id: uuid::Uuid::now_v7(),
            content: cached.content,
            raw_request: cached.raw_request,
            raw_response: cached.raw_response,
            usage: cached.usage,
            latency: crate::inference::types::Latency::NonStreaming {
                response_time: Duration::ZERO,
            },
            finish_reason: cached.finish_reason,
        })
    }

    pub fn put(&self, options: CacheOptions, key: String, response: &ProviderInferenceResponse) {
        if !options.mode.may_write() {
            return;
        }
        self.cache.insert(
            key,
            CachedResponse {
                content: response.content.clone(),
                raw_request: response.raw_request.clone(),
                raw_response: response.raw_response.clone(),
                usage: response.usage,
                finish_reason: response.finish_reason,
                inserted_at: Instant::now(),
            },
        );
    }
}

impl Default for InferenceCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn sample_response() -> ProviderInferenceResponse {
        ProviderInferenceResponse {
            id: uuid::Uuid::now_v7(),
            content: vec![crate::inference::types::ContentBlockOutput::Text {
                text: "hi".to_string(),
            }],
            raw_request: "{}".to_string(),
            raw_response: "{}".to_string(),
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
            },
            latency: crate::inference::types::Latency::NonStreaming {
                response_time: StdDuration::from_millis(1),
            },
            finish_reason: Some(crate::inference::types::FinishReason::Stop),
        }
    }

    #[test]
    fn read_write_mode_round_trips() {
        let cache = InferenceCache::new(100);
        let key = InferenceCache::key("m", "v", &json!({}), &json!({}), &json!(null), None);
        let options = CacheOptions {
            mode: CacheEnabledMode::ReadWrite,
            max_age_s: None,
        };
        assert!(cache.get(options, &key).is_none());
        cache.put(options, key.clone(), &sample_response());
        assert!(cache.get(options, &key).is_some());
    }

    #[test]
    fn off_mode_never_reads_or_writes() {
        let cache = InferenceCache::new(100);
        let key = InferenceCache::key("m", "v", &json!({}), &json!({}), &json!(null), None);
        let options = CacheOptions {
            mode: CacheEnabledMode::Off,
            max_age_s: None,
        };
        cache.put(options, key.clone(), &sample_response());
        assert!(cache.get(options, &key).is_none());
    }

    #[test]
    fn write_only_mode_does_not_serve_reads() {
        let cache = InferenceCache::new(100);
        let key = InferenceCache::key("m", "v", &json!({}), &json!({}), &json!(null), None);
        let write_options = CacheOptions {
            mode: CacheEnabledMode::WriteOnly,
            max_age_s: None,
        };
        cache.put(write_options, key.clone(), &sample_response());
        assert!(cache.get(write_options, &key).is_none());
        let read_options = CacheOptions {
            mode: CacheEnabledMode::ReadOnly,
            max_age_s: None,
        };
        assert!(cache.get(read_options, &key).is_some());
    }

    #[test]
    fn max_age_s_caps_entry_age() {
        let cache = InferenceCache::new(100);
        let key = InferenceCache::key("m", "v", &json!({}), &json!({}), &json!(null), None);
        let write_options = CacheOptions {
            mode: CacheEnabledMode::ReadWrite,
            max_age_s: None,
        };
        cache.put(write_options, key.clone(), &sample_response());
        std::thread::sleep(StdDuration::from_millis(20));
        let strict_options = CacheOptions {
            mode: CacheEnabledMode::ReadWrite,
            max_age_s: Some(0),
        };
        assert!(cache.get(strict_options, &key).is_none());
        let lenient_options = CacheOptions {
            mode: CacheEnabledMode::ReadWrite,
            max_age_s: Some(3600),
        };
        cache.put(write_options, key.clone(), &sample_response());
        assert!(cache.get(lenient_options, &key).is_some());
    }
}
