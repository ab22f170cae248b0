//! DingTalk robot webhook channel.

use eyre::WrapErr as _;

const SEND_URL: &str = "https://oapi.dingtalk.com/robot/send?access_token=";

pub(crate) struct DingTalkRobot {
    client: reqwest::Client,
    webhook: String,
}

impl DingTalkRobot {
    pub(crate) fn new(robot_token: &str) -> Self {
        Self::with_webhook(format!("{SEND_URL}{robot_token}"))
    }

    pub(crate) fn with_webhook(webhook: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook,
        }
    }

    pub(crate) async fn send(&self, text: &str) -> eyre::Result<()> {
        self.client
            .post(&self.webhook)
            .json(&text_message(text))
            .send()
            .await
            .wrap_err("DingTalk webhook unreachable")?
            .error_for_status()
            .wrap_err("DingTalk webhook rejected the message")?;
        Ok(())
    }
}

fn text_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "msgtype": "text",
        "text": {"content": text},
    })
}
