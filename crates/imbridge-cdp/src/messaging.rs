//! In-page queries and commands against the host application.

use imbridge_core::SessionList;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CdpError;
use crate::page::PageEvaluator;
use crate::scripts;

/// Which UI framework the page exposes, if any. `None` means the target is
/// not the chat application.
pub async fn probe_framework(page: &dyn PageEvaluator) -> Result<Option<String>, CdpError> {
    let value = page.evaluate(scripts::PROBE, false).await?;
    Ok(value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

pub async fn diagnose(page: &dyn PageEvaluator) -> Result<Value, CdpError> {
    page.evaluate(&scripts::with_prelude(scripts::DIAGNOSE), false)
        .await
}

pub async fn own_account(page: &dyn PageEvaluator) -> Result<Option<String>, CdpError> {
    let value = page
        .evaluate(&scripts::with_prelude(scripts::OWN_ACCOUNT), false)
        .await?;
    Ok(value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

/// Current session list. A list with `ok == false` carries the page-side
/// reason in `error`.
pub async fn session_list(page: &dyn PageEvaluator) -> Result<SessionList, CdpError> {
    let value = page
        .evaluate(&scripts::with_prelude(scripts::SESSION_LIST), false)
        .await?;
    serde_json::from_value(value).map_err(|e| CdpError::Decode(format!("session list: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub id_client: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    id_client: String,
    #[serde(default)]
    error: Option<String>,
}

/// Send `text` to `chat_id` through the host's messaging handle.
pub async fn send_text(
    page: &dyn PageEvaluator,
    chat_id: &str,
    text: &str,
) -> Result<SendReceipt, CdpError> {
    let value = page
        .evaluate(&scripts::send_script(chat_id, text), true)
        .await?;
    let reply: SendReply =
        serde_json::from_value(value).map_err(|e| CdpError::Decode(format!("send reply: {e}")))?;
    if !reply.ok {
        return Err(CdpError::Rejected(
            reply.error.unwrap_or_else(|| "send failed".into()),
        ));
    }
    Ok(SendReceipt {
        id_client: reply.id_client,
    })
}
