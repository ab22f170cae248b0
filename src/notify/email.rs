//! SMTP mail channel.

use eyre::WrapErr as _;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport as _, Message, Tokio1Executor};

pub(crate) struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailChannel {
    /// # Errors
    ///
    /// Returns an error if the relay host or one of the mail addresses is
    /// unusable.
    pub(crate) fn new(
        server: &str,
        port: u16,
        username: &str,
        password: &str,
        users: &[String],
    ) -> eyre::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .wrap_err_with(|| format!("Invalid SMTP relay: {server}"))?
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();
        let from = username
            .parse::<Mailbox>()
            .wrap_err_with(|| format!("Invalid sender address: {username}"))?;
        let recipients = users
            .iter()
            .map(|user| {
                user.parse::<Mailbox>()
                    .wrap_err_with(|| format!("Invalid recipient address: {user}"))
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        Ok(Self {
            transport,
            from,
            recipients,
        })
    }

    pub(crate) async fn send(&self, text: &str) -> eyre::Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject_of(text));
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let message = builder
            .body(text.to_string())
            .wrap_err("Failed to build mail message")?;
        self.transport
            .send(message)
            .await
            .wrap_err("SMTP delivery failed")?;
        Ok(())
    }
}

/// The first line of the event doubles as the subject.
fn subject_of(text: &str) -> &str {
    text.lines().next().unwrap_or("poolwatch event")
}
