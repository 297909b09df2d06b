use super::{MailSink, SinkError};
use crate::config::MailConfig;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

/// Sends digests through a plain, unauthenticated SMTP relay.
pub(crate) struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl SmtpMailer {
    pub(crate) fn new(config: &MailConfig) -> Result<Self, SinkError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.relay)
            .port(config.port)
            .build();

        Ok(Self {
            transport,
            from: config.from.parse()?,
            to: config
                .to
                .iter()
                .map(|a| a.parse())
                .collect::<Result<_, _>>()?,
        })
    }

    fn build(&self, subject: &str, body: &str) -> Result<Message, SinkError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);

        for to in &self.to {
            builder = builder.to(to.clone());
        }

        Ok(builder.body(body.to_owned())?)
    }
}

#[async_trait]
impl MailSink for SmtpMailer {
    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), SinkError> {
        let message = self.build(subject, body)?;
        self.transport.send(message).await?;
        Ok(())
    }
}
