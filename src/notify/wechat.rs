//! WeChat Work (enterprise) message channel.
//!
//! Sending requires an access token fetched from the corp API. Tokens are
//! valid for two hours and cached on disk as JSON so restarts and the other
//! channels don't burn through the token quota; the cache file is internal
//! to this adapter and is not engine state.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

const TOKEN_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin/gettoken";
const SEND_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin/message/send";
const TOKEN_CACHE_FILE: &str = "wechat_token.json";
const TOKEN_VALIDITY_SECS: i64 = 2 * 60 * 60;

pub(crate) struct WeChatChannel {
    client: reqwest::Client,
    corpid: String,
    secret: String,
    users: Vec<String>,
    cache_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    token: String,
    /// Unix timestamp after which the token must be re-fetched.
    expires_at: i64,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    access_token: Option<String>,
}

impl WeChatChannel {
    pub(crate) fn new(corpid: &str, secret: &str, users: &[String]) -> Self {
        Self {
            client: reqwest::Client::new(),
            corpid: corpid.to_string(),
            secret: secret.to_string(),
            users: users.to_vec(),
            cache_path: PathBuf::from(TOKEN_CACHE_FILE),
        }
    }

    pub(crate) async fn send(&self, text: &str) -> eyre::Result<()> {
        let token = self.access_token().await?;
        let url = format!("{SEND_URL}?access_token={token}");
        let response: serde_json::Value = self
            .client
            .post(&url)
            .json(&text_message(&self.users, text))
            .send()
            .await?
            .json()
            .await?;
        let errcode = response
            .get("errcode")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        if errcode != 0 {
            let errmsg = response
                .get("errmsg")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error");
            eyre::bail!("WeChat send failed with {errcode}: {errmsg}");
        }
        Ok(())
    }

    async fn access_token(&self) -> eyre::Result<String> {
        if let Some(cached) = self.read_cache().await {
            if cached.is_fresh(Utc::now().timestamp()) {
                return Ok(cached.token);
            }
        }
        let token = self.fetch_token().await?;
        self.write_cache(&token).await;
        Ok(token)
    }

    async fn fetch_token(&self) -> eyre::Result<String> {
        let url = format!(
            "{TOKEN_URL}?corpid={}&corpsecret={}",
            self.corpid, self.secret
        );
        let response: TokenResponse = self.client.get(&url).send().await?.json().await?;
        if response.errcode != 0 {
            eyre::bail!("WeChat token request failed: {}", response.errmsg);
        }
        response
            .access_token
            .ok_or_else(|| eyre::eyre!("WeChat token response carried no access_token"))
    }

    async fn read_cache(&self) -> Option<CachedToken> {
        let bytes = tokio::fs::read(&self.cache_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_cache(&self, token: &str) {
        let cached = CachedToken {
            token: token.to_string(),
            expires_at: Utc::now().timestamp() + TOKEN_VALIDITY_SECS,
        };
        if let Ok(bytes) = serde_json::to_vec(&cached) {
            if let Err(err) = tokio::fs::write(&self.cache_path, bytes).await {
                debug!(error = %err, "failed to persist the WeChat token cache");
            }
        }
    }
}

fn text_message(users: &[String], text: &str) -> serde_json::Value {
    serde_json::json!({
        "touser": users.join("|"),
        "msgtype": "text",
        "agentid": 0,
        "text": {"content": text},
    })
}
