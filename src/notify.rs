//! Best-effort notification fan-out.
//!
//! Every emitted event is sent to every configured channel. Channels fail
//! independently: a dead webhook or SMTP server produces a warning and
//! nothing else, the monitor never stops over a notification.

pub(crate) mod dingtalk;
pub(crate) mod email;
pub(crate) mod wechat;

use futures::future;
use tracing::warn;

use crate::config::NotifyEntry;
use dingtalk::DingTalkRobot;
use email::EmailChannel;
use wechat::WeChatChannel;

/// All configured channels behind one `send_all`.
pub struct Notifier {
    channels: Vec<Channel>,
}

enum Channel {
    DingTalk(DingTalkRobot),
    WeChat(WeChatChannel),
    Email(EmailChannel),
}

impl Channel {
    const fn kind(&self) -> &'static str {
        match *self {
            Self::DingTalk(_) => "dingding",
            Self::WeChat(_) => "wechat",
            Self::Email(_) => "email",
        }
    }

    async fn send(&self, text: &str) -> eyre::Result<()> {
        match *self {
            Self::DingTalk(ref robot) => robot.send(text).await,
            Self::WeChat(ref channel) => channel.send(text).await,
            Self::Email(ref channel) => channel.send(text).await,
        }
    }
}

impl Notifier {
    /// Builds every configured channel.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable channel configuration, e.g. an invalid
    /// SMTP relay or a malformed mail address.
    pub fn from_config(entries: &[NotifyEntry]) -> eyre::Result<Self> {
        if entries.is_empty() {
            warn!("no notification channels configured, events will only show up in the logs");
        }
        let channels = entries
            .iter()
            .map(|entry| {
                Ok(match *entry {
                    NotifyEntry::Dingding { ref robot_token } => {
                        Channel::DingTalk(DingTalkRobot::new(robot_token))
                    }
                    NotifyEntry::Wechat {
                        ref corpid,
                        ref secret,
                        ref users,
                    } => Channel::WeChat(WeChatChannel::new(corpid, secret, users)),
                    NotifyEntry::Email {
                        ref server,
                        port,
                        ref username,
                        ref password,
                        ref users,
                    } => Channel::Email(EmailChannel::new(server, port, username, password, users)?),
                })
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        Ok(Self { channels })
    }

    /// Fans `text` out to every channel concurrently. Individual failures
    /// are logged and swallowed.
    pub async fn send_all(&self, text: &str) {
        let sends = self.channels.iter().map(|channel| async move {
            (channel.kind(), channel.send(text).await)
        });
        for (kind, result) in future::join_all(sends).await {
            if let Err(err) = result {
                warn!(channel = kind, error = %err, "notification channel failed");
            }
        }
    }
}
