//! Capability-driven LLM router.
//!
//! The router resolves a [`ModelRole`] to a configured provider/model and
//! handles automatic fallback when the primary model fails with a timeout
//! or provider-classified retryable error.

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use cc_domain::capability::ModelRole;
use cc_domain::config::{LlmConfig, RoleConfig};
use cc_domain::error::{classify_error, Error, Result};
use cc_domain::stream::{BoxStream, StreamEvent};
use cc_domain::trace::TraceEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A capability-driven router that selects providers per role and handles
/// fallback on transient failures.
pub struct LlmRouter {
    registry: ProviderRegistry,
    role_configs: HashMap<String, RoleConfig>,
    default_timeout_ms: u64,
}

impl LlmRouter {
    pub fn from_config(llm_config: &LlmConfig) -> Result<Self> {
        let registry = ProviderRegistry::from_config(llm_config)?;
        let role_configs = llm_config.roles.clone();
        Ok(Self {
            registry,
            role_configs,
            default_timeout_ms: llm_config.default_timeout_ms,
        })
    }

    /// Build from an already-constructed registry (useful for testing).
    pub fn new(registry: ProviderRegistry, role_configs: HashMap<String, RoleConfig>, default_timeout_ms: u64) -> Self {
        Self {
            registry,
            role_configs,
            default_timeout_ms,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Send a chat request for a given model role.
    ///
    /// 1. Resolve the primary model from the role config.
    /// 2. Send the request.
    /// 3. On a retryable error, fall back to the next configured model.
    /// 4. Emit `TraceEvent::LlmRequest` / `TraceEvent::LlmFallback`.
    pub async fn chat_for_role(&self, role: ModelRole, mut req: ChatRequest) -> Result<ChatResponse> {
        let role_str = role_to_string(role);
        let role_cfg = self
            .role_configs
            .get(&role_str)
            .ok_or_else(|| Error::Config(format!("no role config for '{}'", role_str)))?;

        let (provider_id, model_name) = resolve_model(&role_cfg.model);
        if let Some(provider) = self.registry.get(provider_id) {
            req.model = Some(model_name.to_string());
            let start = Instant::now();
            let result = self.try_chat(&provider, &req).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(resp) => {
                    TraceEvent::LlmRequest {
                        provider: provider_id.to_string(),
                        model: model_name.to_string(),
                        role: role_str.clone(),
                        streaming: false,
                        duration_ms,
                        prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens),
                        completion_tokens: resp.usage.as_ref().map(|u| u.completion_tokens),
                    }
                    .emit();
                    return result;
                }
                Err(e) if Self::is_retryable(e) => {
                    tracing::warn!(provider = %provider_id, model = %model_name, error = %e, "primary model failed, trying fallbacks");
                }
                Err(_) => {
                    TraceEvent::LlmRequest {
                        provider: provider_id.to_string(),
                        model: model_name.to_string(),
                        role: role_str.clone(),
                        streaming: false,
                        duration_ms,
                        prompt_tokens: None,
                        completion_tokens: None,
                    }
                    .emit();
                    return result;
                }
            }
        } else {
            tracing::warn!(provider = %provider_id, "primary provider not found in registry, trying fallbacks");
        }

        for (idx, fallback_spec) in role_cfg.fallbacks.iter().enumerate() {
            let (fb_provider_id, fb_model_name) = resolve_model(fallback_spec);
            let fb_provider = match self.registry.get(fb_provider_id) {
                Some(p) => p,
                None => {
                    tracing::warn!(provider = %fb_provider_id, "fallback provider not found, skipping");
                    continue;
                }
            };

            TraceEvent::LlmFallback {
                from_provider: provider_id.to_string(),
                from_model: model_name.to_string(),
                to_provider: fb_provider_id.to_string(),
                to_model: fb_model_name.to_string(),
                reason: "primary model failed or unavailable".to_string(),
            }
            .emit();

            req.model = Some(fb_model_name.to_string());
            let start = Instant::now();
            let result = self.try_chat(&fb_provider, &req).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(resp) => {
                    TraceEvent::LlmRequest {
                        provider: fb_provider_id.to_string(),
                        model: fb_model_name.to_string(),
                        role: role_str.clone(),
                        streaming: false,
                        duration_ms,
                        prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens),
                        completion_tokens: resp.usage.as_ref().map(|u| u.completion_tokens),
                    }
                    .emit();
                    return result;
                }
                Err(e) if Self::is_retryable(e) => {
                    tracing::warn!(
                        provider = %fb_provider_id,
                        model = %fb_model_name,
                        error = %e,
                        fallback_index = %idx,
                        "fallback model failed, trying next"
                    );
                    continue;
                }
                Err(_) => {
                    TraceEvent::LlmRequest {
                        provider: fb_provider_id.to_string(),
                        model: fb_model_name.to_string(),
                        role: role_str.clone(),
                        streaming: false,
                        duration_ms,
                        prompt_tokens: None,
                        completion_tokens: None,
                    }
                    .emit();
                    return result;
                }
            }
        }

        Err(Error::Provider {
            provider: "router".into(),
            message: format!("all models for role '{}' failed or were unavailable", role_str),
        })
    }

    /// Open a streaming chat for a role, honoring an optional explicit
    /// `"provider_id/model_name"` override (a session's pinned model). An
    /// override replaces the role's primary model outright and is not
    /// retried against the role's configured fallbacks — an explicit choice
    /// should fail loudly rather than silently land on a different model.
    /// Without an override, the role's primary model is tried first, then
    /// each fallback in order, exactly as [`Self::chat_for_role`] does for
    /// the non-streaming path. Returns the opened stream plus the
    /// `(provider_id, model_name)` that actually served it, since the Tool
    /// Loop persists the serving model on the session.
    pub async fn chat_stream_for_role(
        &self,
        role: ModelRole,
        mut req: ChatRequest,
        model_override: Option<&str>,
    ) -> Result<(BoxStream<'static, Result<StreamEvent>>, String, String)> {
        let role_str = role_to_string(role);
        let role_cfg = self.role_configs.get(&role_str);

        let mut candidates: Vec<String> = Vec::new();
        match model_override {
            Some(spec) => candidates.push(spec.to_string()),
            None => {
                let role_cfg = role_cfg
                    .ok_or_else(|| Error::Config(format!("no role config for '{}'", role_str)))?;
                candidates.push(role_cfg.model.clone());
                candidates.extend(role_cfg.fallbacks.iter().cloned());
            }
        }

        let timeout = Duration::from_millis(self.default_timeout_ms);
        let mut last_err: Option<Error> = None;
        for (idx, spec) in candidates.iter().enumerate() {
            let (provider_id, model_name) = resolve_model(spec);
            let Some(provider) = self.registry.get(provider_id) else {
                tracing::warn!(provider = %provider_id, "provider not found in registry, skipping");
                continue;
            };
            if idx > 0 {
                TraceEvent::LlmFallback {
                    from_provider: resolve_model(&candidates[0]).0.to_string(),
                    from_model: resolve_model(&candidates[0]).1.to_string(),
                    to_provider: provider_id.to_string(),
                    to_model: model_name.to_string(),
                    reason: "primary model failed or unavailable".to_string(),
                }
                .emit();
            }
            req.model = Some(model_name.to_string());
            match tokio::time::timeout(timeout, provider.chat_stream(req.clone())).await {
                Ok(Ok(stream)) => {
                    TraceEvent::LlmRequest {
                        provider: provider_id.to_string(),
                        model: model_name.to_string(),
                        role: role_str.clone(),
                        streaming: true,
                        duration_ms: 0,
                        prompt_tokens: None,
                        completion_tokens: None,
                    }
                    .emit();
                    return Ok((stream, provider_id.to_string(), model_name.to_string()));
                }
                Ok(Err(e)) if model_override.is_none() && Self::is_retryable(&e) => {
                    tracing::warn!(provider = %provider_id, model = %model_name, error = %e, "stream open failed, trying fallback");
                    last_err = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    last_err = Some(Error::Timeout(format!(
                        "provider '{provider_id}' timed out opening stream after {}ms",
                        self.default_timeout_ms
                    )));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "router".into(),
            message: format!("all models for role '{}' failed or were unavailable", role_str),
        }))
    }

    async fn try_chat(&self, provider: &Arc<dyn LlmProvider>, req: &ChatRequest) -> Result<ChatResponse> {
        let timeout = std::time::Duration::from_millis(self.default_timeout_ms);
        match tokio::time::timeout(timeout, provider.chat(req.clone())).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "provider '{}' timed out after {}ms",
                provider.provider_id(),
                self.default_timeout_ms
            ))),
        }
    }

    /// An error is retryable if it's a bare timeout/transport error, or if
    /// its message classifies as rate-limited/provider-side via the shared
    /// [`classify_error`] taxonomy.
    fn is_retryable(err: &Error) -> bool {
        match err {
            Error::Timeout(_) | Error::Http(_) => true,
            Error::Provider { message, .. } => classify_error(message).is_retryable(),
            _ => false,
        }
    }
}

/// Split a `"provider_id/model_name"` string into its two components.
pub fn resolve_model(model_str: &str) -> (&str, &str) {
    match model_str.split_once('/') {
        Some((provider, model)) => (provider, model),
        None => (model_str, ""),
    }
}

fn role_to_string(role: ModelRole) -> String {
    match role {
        ModelRole::Executor => "executor".to_string(),
        ModelRole::Summarizer => "summarizer".to_string(),
    }
}
