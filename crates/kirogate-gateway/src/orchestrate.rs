//! Per-request orchestration: account selection, token freshness, request
//! assembly, streaming, and the retry state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kirogate_auth::AuthError;
use kirogate_core::anthropic::{ChatMessage, MessagesRequest};
use kirogate_core::config::DEFAULT_UPSTREAM_MODEL;
use kirogate_core::GatewayError;
use kirogate_pool::{classify, decide, Disposition, RetryAction};
use kirogate_translate::builder::{build_request, BuildOptions};
use kirogate_translate::prune::ai_condense;
use kirogate_translate::tokens::{estimate_messages, reserved_tokens, AUTO_PRUNE_TRIGGER};
use kirogate_translate::models;
use kirogate_upstream::summarize::UpstreamSummarizer;

use crate::app::AppState;
use crate::emit::{run_stream, AnthropicEvent, EmitterConfig, StreamSummary};
use crate::error::from_upstream;

/// Drive one `/v1/messages` request to completion, emitting Anthropic
/// events on `out`. Errors returned here happened before any event was
/// produced; once the upstream stream opens, failures surface as `error`
/// events instead.
pub async fn execute(
    state: Arc<AppState>,
    mut req: MessagesRequest,
    cancel: CancellationToken,
    out: mpsc::Sender<AnthropicEvent>,
) -> Result<StreamSummary, GatewayError> {
    let requested_model = req.model.clone();
    let mut attempt: u32 = 0;
    let max_retries = state.config.request_max_retries;
    let base_delay = Duration::from_millis(state.config.request_base_delay);

    'accounts: loop {
        // Select a pooled account; fall back to the global credential.
        let (store, account_uuid) = match state.pool.select(Some(&requested_model)).await {
            Some(account) => match state.store_for(&account.credential_ref) {
                Some(store) => (store, Some(account.uuid)),
                None => {
                    let classified =
                        classify(None, &format!("credential file missing: {}", account.credential_ref));
                    state.pool.record_failure(&account.uuid, &classified).await;
                    if attempt < max_retries {
                        attempt += 1;
                        continue 'accounts;
                    }
                    return Err(GatewayError::Internal(
                        "no account with readable credentials".to_string(),
                    ));
                }
            },
            None => match &state.fallback {
                Some(store) => {
                    debug!("pool empty for model, using the configured fallback credential");
                    (store.clone(), None)
                }
                None => {
                    return Err(GatewayError::AuthExpired(
                        "no usable upstream account".to_string(),
                    ))
                }
            },
        };

        let token = match state.refresher.ensure_fresh(&store).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                if let Some(uuid) = &account_uuid {
                    let classified = classify(None, &format!("token is expired: {e}"));
                    state.pool.record_failure(uuid, &classified).await;
                }
                if matches!(e, AuthError::Http(_)) && attempt < max_retries {
                    attempt += 1;
                    continue 'accounts;
                }
                return Err(GatewayError::AuthExpired(e.to_string()));
            }
        };

        let bundle = store.bundle().await;

        maybe_ai_condense(&state, &mut req, &token, bundle.profile_arn.clone()).await;

        let built = build_request(
            &req,
            &BuildOptions {
                default_model_id: DEFAULT_UPSTREAM_MODEL.to_string(),
                thinking_default: state.config.enable_thinking_by_default,
                profile_arn: bundle.profile_arn.clone(),
            },
        );

        loop {
            match state
                .upstream
                .send_generate(&built.request, &token, cancel.clone())
                .await
            {
                Ok(mut events) => {
                    info!(
                        model = %built.model_id,
                        account = account_uuid.as_deref().unwrap_or("fallback"),
                        "upstream stream opened"
                    );
                    let emitter_cfg = EmitterConfig {
                        message_id: format!("msg_{}", Uuid::new_v4().simple()),
                        model: requested_model.clone(),
                        thinking_injected: built.thinking_injected,
                    };
                    let search_client = state.upstream.http().await;
                    let summary =
                        run_stream(&mut events, &emitter_cfg, &out, Some(&search_client)).await;
                    return Ok(summary);
                }
                Err(e) => {
                    let (classified, gateway_error) = from_upstream(&e);
                    if let Some(uuid) = &account_uuid {
                        // a 400 complaining about the model is account-specific:
                        // remember it and rotate instead of blaming the client
                        let lower = classified.message.to_lowercase();
                        if classified.disposition == Disposition::ClientFault
                            && lower.contains("model")
                            && (lower.contains("not supported")
                                || lower.contains("unsupported")
                                || lower.contains("not authorized"))
                        {
                            state
                                .pool
                                .mark_model_unsupported(uuid, &requested_model)
                                .await;
                            if attempt < max_retries {
                                attempt += 1;
                                continue 'accounts;
                            }
                        }
                        state.pool.record_failure(uuid, &classified).await;
                    }
                    match decide(&classified, attempt, max_retries, base_delay) {
                        RetryAction::SurfaceToClient => return Err(gateway_error),
                        RetryAction::RetrySameAccount { delay } => {
                            attempt += 1;
                            debug!(attempt, ?delay, "retrying same account");
                            tokio::time::sleep(delay).await;
                        }
                        RetryAction::RetryOtherAccount => {
                            attempt += 1;
                            debug!(attempt, "rotating to another account");
                            continue 'accounts;
                        }
                    }
                }
            }
        }
    }
}

/// Run the AI-assisted condensation when the request is over the prune
/// trigger. Fails open silently — the deterministic pruner inside the
/// builder is always the backstop.
async fn maybe_ai_condense(
    state: &AppState,
    req: &mut MessagesRequest,
    token: &str,
    profile_arn: Option<String>,
) {
    let reserved = reserved_tokens(req.system.as_ref(), &req.tools);
    if estimate_messages(&req.messages) + reserved <= AUTO_PRUNE_TRIGGER {
        return;
    }
    let model_id = models::map_model(&req.model, DEFAULT_UPSTREAM_MODEL);
    let summarizer = UpstreamSummarizer::new(
        state.upstream.clone(),
        token.to_string(),
        model_id,
        profile_arn,
    );
    if let Some(condensed) = ai_condense(&summarizer, &state.ai_summary, &req.messages).await {
        info!(
            before = req.messages.len(),
            after = condensed.len(),
            "history condensed via AI summarization"
        );
        req.messages = condensed;
    }
}

/// One-token probe through the normal pipeline. Success resets the
/// account to healthy; failure re-records the error.
pub async fn probe_account(state: Arc<AppState>, account_uuid: &str) {
    let probe_model = state.config.health_check_model.clone();
    let Some(account) = state
        .pool
        .snapshot()
        .await
        .into_iter()
        .find(|a| a.uuid == account_uuid)
    else {
        return;
    };
    let Some(store) = state.store_for(&account.credential_ref) else {
        return;
    };
    let token = match state.refresher.ensure_fresh(&store).await {
        Ok(t) => t,
        Err(e) => {
            let classified = classify(None, &format!("token is expired: {e}"));
            state.pool.record_failure(account_uuid, &classified).await;
            return;
        }
    };
    let bundle = store.bundle().await;

    let probe_req = MessagesRequest {
        model: probe_model.clone(),
        messages: vec![ChatMessage::user("Hi")],
        system: None,
        tools: Vec::new(),
        max_tokens: 1,
        stream: true,
        thinking: None,
        metadata: None,
    };
    let built = build_request(
        &probe_req,
        &BuildOptions {
            default_model_id: DEFAULT_UPSTREAM_MODEL.to_string(),
            thinking_default: false,
            profile_arn: bundle.profile_arn,
        },
    );

    match state
        .upstream
        .send_generate(&built.request, &token, CancellationToken::new())
        .await
    {
        Ok(mut rx) => {
            let mut failed: Option<String> = None;
            while let Some(event) = rx.recv().await {
                if let kirogate_protocol::UpstreamEvent::Error { code, message } = event {
                    failed = Some(format!("{code}: {message}"));
                }
            }
            match failed {
                None => {
                    info!(uuid = %account_uuid, model = %probe_model, "health probe passed");
                    state.pool.mark_healthy(account_uuid, Some(&probe_model)).await;
                }
                Some(message) => {
                    warn!(uuid = %account_uuid, error = %message, "health probe stream errored");
                    state
                        .pool
                        .record_failure(account_uuid, &classify(None, &message))
                        .await;
                }
            }
        }
        Err(e) => {
            let (classified, _) = from_upstream(&e);
            warn!(uuid = %account_uuid, error = %e, "health probe failed");
            state.pool.record_failure(account_uuid, &classified).await;
        }
    }
}
