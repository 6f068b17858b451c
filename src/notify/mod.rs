//! Email notification sink.
//!
//! Invoked by the terminal stage of a job, and by any stage completion for
//! jobs that asked for periodic notification. Delivery failures are logged
//! at warn and swallowed.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::warn;

use crate::config::Config;
use crate::messages::{JobStatus, NotificationType};
use crate::pipeline;

/// Everything the sink needs to decide on and render one notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub job_id: String,
    pub to: Option<String>,
    pub notification_type: NotificationType,
    pub status: JobStatus,
    pub utctime: String,
    pub service: String,
    pub last_service: String,
    pub error_msgs: Vec<String>,
}

/// Delivery policy: single means only the terminal stage reports, and only
/// a settled outcome; periodic means every stage completion reports.
/// No address, no mail.
pub fn should_notify(note: &Notification) -> bool {
    if note.to.is_none() {
        return false;
    }

    match note.notification_type {
        NotificationType::Periodic => true,
        NotificationType::Single => {
            note.service == note.last_service
                && matches!(
                    note.status,
                    JobStatus::Success | JobStatus::Failed | JobStatus::Exception
                )
        }
    }
}

pub struct NotificationSink {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
    subject: String,
    email_allowlist: Vec<String>,
    domain_allowlist: Vec<String>,
}

impl NotificationSink {
    pub fn new(config: &Config) -> Self {
        let transport = build_transport(config);
        if transport.is_none() {
            warn!("SMTP transport unavailable, notifications disabled");
        }

        let from = config
            .smtp_user
            .clone()
            .unwrap_or_else(|| format!("mash@{}", config.smtp_host));

        Self {
            transport,
            from,
            subject: config.notification_subject.clone(),
            email_allowlist: config.email_allowlist.clone(),
            domain_allowlist: config.domain_allowlist.clone(),
        }
    }

    /// Apply the delivery policy and send. All failure paths log and return.
    pub async fn notify(&self, note: &Notification) {
        if !should_notify(note) {
            return;
        }
        let Some(to) = note.to.as_deref() else {
            return;
        };

        if !self.address_allowed(to) {
            warn!(
                job_id = %note.job_id,
                "notification address not in allowlist, not sending"
            );
            return;
        }

        let Some(transport) = &self.transport else {
            return;
        };

        let email = Message::builder()
            .from(match self.from.parse() {
                Ok(mailbox) => mailbox,
                Err(error) => {
                    warn!("unable to send notification email: {error}");
                    return;
                }
            })
            .to(match to.parse() {
                Ok(mailbox) => mailbox,
                Err(error) => {
                    warn!("unable to send notification email: {error}");
                    return;
                }
            })
            .subject(&self.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(notification_content(note));

        let email = match email {
            Ok(email) => email,
            Err(error) => {
                warn!("unable to send notification email: {error}");
                return;
            }
        };

        if let Err(error) = transport.send(email).await {
            warn!("unable to send notification email: {error}");
        }
    }

    fn address_allowed(&self, to: &str) -> bool {
        if self.email_allowlist.is_empty() && self.domain_allowlist.is_empty() {
            return true;
        }
        if self.email_allowlist.iter().any(|entry| entry == to) {
            return true;
        }
        to.rsplit_once('@')
            .map(|(_, domain)| self.domain_allowlist.iter().any(|entry| entry == domain))
            .unwrap_or(false)
    }
}

fn build_transport(config: &Config) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let mut builder = if config.smtp_ssl {
        match AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host) {
            Ok(builder) => builder,
            Err(error) => {
                warn!("SMTP relay setup failed: {error}");
                return None;
            }
        }
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
    };
    builder = builder.port(config.smtp_port);

    if let (Some(user), Some(pass)) = (&config.smtp_user, &config.smtp_pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }

    Some(builder.build())
}

/// Human-readable job summary for the notification body.
fn notification_content(note: &Notification) -> String {
    let step = pipeline::position(&note.service)
        .map(|idx| idx + 1)
        .unwrap_or(0);
    let total = pipeline::position(&note.last_service)
        .map(|idx| idx + 1)
        .unwrap_or(pipeline::PIPELINE.len());

    let mut content = format!(
        "Job: {id}\n\
         Status: {status}\n\
         Stage: {service} (step {step} of {total})\n\
         Schedule: {utctime}\n",
        id = note.job_id,
        status = note.status,
        service = note.service,
        step = step,
        total = total,
        utctime = note.utctime,
    );

    if !note.error_msgs.is_empty() {
        content.push_str("\nErrors:\n");
        for msg in &note.error_msgs {
            content.push_str(&format!("  {msg}\n"));
        }
    }

    content
}
