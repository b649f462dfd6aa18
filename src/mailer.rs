//! Module for sending alert mails over SMTP.
use std::time::Duration;

use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};

use crate::alert::Alert;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Connection security for the SMTP server.
pub enum MailSecurity {
    /// Plain connection upgraded with STARTTLS.
    Starttls,
    /// Implicit TLS from the first byte.
    Tls,
    /// Unencrypted connection, only meant for local relays.
    None,
}

impl Default for MailSecurity {
    fn default() -> Self {
        MailSecurity::Starttls
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the SMTP connection and the alert recipient.
pub struct MailParameters {
    /// The hostname of the SMTP server.
    pub hostname: String,
    /// The port of the SMTP server.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub security: MailSecurity,
    /// The username to authenticate with.
    #[serde(default)]
    pub username: Option<String>,
    /// The password to authenticate with.
    #[serde(default)]
    pub password: Option<String>,
    /// Sender address of the alert mails. Defaults to the username.
    #[serde(default)]
    pub sender: Option<String>,
    /// Address every alert is sent to.
    pub recipient: String,
    /// Seconds to wait for the SMTP server.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    587
}

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("no sender address configured")]
    MissingSender,
    #[error("invalid mail address: {0}")]
    Address(#[from] AddressError),
    #[error("could not build mail: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers alerts to a recipient.
pub trait Notifier {
    fn notify(&self, recipient: &str, alert: &Alert) -> Result<(), NotifyError>;
}

/// Notifier sending plain text mails through an SMTP relay.
pub struct SmtpNotifier {
    sender: Mailbox,
    transport: SmtpTransport,
}

impl SmtpNotifier {
    pub fn new(params: &MailParameters) -> Result<Self, NotifyError> {
        let sender = params.sender.as_ref()
            .or(params.username.as_ref())
            .ok_or(NotifyError::MissingSender)?
            .parse::<Mailbox>()?;

        let mut builder = match params.security {
            MailSecurity::Starttls => SmtpTransport::starttls_relay(&params.hostname)?,
            MailSecurity::Tls => SmtpTransport::relay(&params.hostname)?,
            MailSecurity::None => SmtpTransport::builder_dangerous(&params.hostname),
        };
        builder = builder
            .port(params.port)
            .timeout(Some(Duration::from_secs(params.timeout_secs)));
        if let (Some(username), Some(password)) = (&params.username, &params.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(SmtpNotifier { sender, transport: builder.build() })
    }
}

fn compose(sender: &Mailbox, recipient: &str, alert: &Alert) -> Result<Message, NotifyError> {
    let message = Message::builder()
        .from(sender.clone())
        .to(recipient.parse()?)
        .subject(alert.subject.as_str())
        .header(ContentType::TEXT_PLAIN)
        .body(alert.body.clone())?;
    Ok(message)
}

impl Notifier for SmtpNotifier {
    fn notify(&self, recipient: &str, alert: &Alert) -> Result<(), NotifyError> {
        let message = compose(&self.sender, recipient, alert)?;
        self.transport.send(&message)?;
        log::info!(target: "sensord::mail", "Mail sent to \'{}\' with subject: \'{}\'", recipient, alert.subject);
        Ok(())
    }
}
