//! Upstream usage limits (`getUsageLimits`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{UpstreamClient, UpstreamError};

/// Usage snapshot. The limit document itself is passed through untyped —
/// its shape shifts with upstream releases and the gateway only reads the
/// identity fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub limits: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageLimitsResponse {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

impl UpstreamClient {
    pub async fn get_usage_limits(
        &self,
        access_token: &str,
        profile_arn: Option<&str>,
    ) -> Result<UsageSnapshot, UpstreamError> {
        let mut url = format!(
            "{}/getUsageLimits?isEmailRequired=true&origin=AI_EDITOR&resourceType=AGENTIC_REQUEST",
            self.usage_base()
        );
        if let Some(arn) = profile_arn {
            url.push_str(&format!("&profileArn={}", urlencoding::encode(arn)));
        }

        let response = self
            .http()
            .await
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            warn!(status, "getUsageLimits failed");
            return Err(UpstreamError::Status { status, message });
        }

        let parsed: UsageLimitsResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Stream(format!("unparseable usage response: {e}")))?;

        Ok(UsageSnapshot {
            email: parsed.email,
            user_id: parsed.user_id,
            limits: parsed.rest,
        })
    }
}
