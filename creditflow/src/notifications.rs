//! Payment confirmation notifications.
//!
//! Sending is best effort from the billing point of view: by the time a
//! notification goes out the balance has already moved, so a failed send is
//! reported to the caller and never undoes or repeats the credit.

use async_trait::async_trait;
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use rust_decimal::Decimal;
use std::path::Path;

use crate::{
    config::{EmailConfig, EmailTransportConfig},
    errors::Error,
    types::OrderId,
};

/// Everything the payment-success email shows
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSuccessNotice {
    pub to_email: String,
    pub to_name: Option<String>,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub credits: i64,
    pub new_balance: i64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn payment_succeeded(&self, notice: &PaymentSuccessNotice) -> Result<(), Error>;
}

/// Used when no email transport is configured: the confirmation is logged
/// and treated as sent.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn payment_succeeded(&self, notice: &PaymentSuccessNotice) -> Result<(), Error> {
        tracing::info!(
            order_id = %notice.order_id,
            credits = notice.credits,
            new_balance = notice.new_balance,
            "Email not configured, skipping payment confirmation"
        );
        Ok(())
    }
}

pub struct EmailNotifier {
    transport: EmailTransport,
    from_email: String,
    from_name: String,
    reply_to: Option<String>,
    dashboard_url: String,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

impl EmailNotifier {
    pub fn new(email_config: &EmailConfig, dashboard_url: &str) -> Result<Self, Error> {
        let transport = match &email_config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                if !emails_dir.exists() {
                    std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                        operation: format!("create emails directory: {e}"),
                    })?;
                }
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
        };

        Ok(Self {
            transport,
            from_email: email_config.from_email.clone(),
            from_name: email_config.from_name.clone(),
            reply_to: email_config.reply_to.clone(),
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send_email(&self, to_email: &str, to_name: Option<&str>, subject: &str, body: &str) -> Result<(), Error> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| Error::Internal {
                operation: format!("parse from email: {e}"),
            })?;

        let to = if let Some(name) = to_name {
            format!("{name} <{to_email}>")
        } else {
            to_email.to_string()
        }
        .parse::<Mailbox>()
        .map_err(|e| Error::Internal {
            operation: format!("parse to email: {e}"),
        })?;

        let mut builder = Message::builder().from(from).to(to).subject(subject).header(ContentType::TEXT_HTML);
        if let Some(reply_to) = &self.reply_to {
            let reply_to = reply_to.parse::<Mailbox>().map_err(|e| Error::Internal {
                operation: format!("parse reply-to email: {e}"),
            })?;
            builder = builder.reply_to(reply_to);
        }

        let message = builder.body(body.to_string()).map_err(|e| Error::Internal {
            operation: format!("build email message: {e}"),
        })?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send SMTP email: {e}"),
                })?;
            }
            EmailTransport::File(file) => {
                file.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send file email: {e}"),
                })?;
            }
        }

        Ok(())
    }

    fn create_payment_success_body(&self, notice: &PaymentSuccessNotice) -> String {
        let name = notice.to_name.as_deref().unwrap_or("there");
        let amount = notice.amount.round_dp(2);
        let dashboard_link = format!("{}/dashboard/credits", self.dashboard_url);
        let order_id = notice.order_id;
        let credits = notice.credits;
        let new_balance = notice.new_balance;

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Payment Successful</title>
    <style>
        body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; }}
        .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
        .summary td {{ padding: 4px 12px 4px 0; }}
        .footer {{ margin-top: 30px; font-size: 12px; color: #666; }}
    </style>
</head>
<body>
    <div class="container">
        <h2>Payment Successful</h2>

        <p>Hi {name},</p>

        <p>Thanks for your purchase. Your credits have been added to your account.</p>

        <table class="summary">
            <tr><td>Order</td><td>{order_id}</td></tr>
            <tr><td>Amount paid</td><td>${amount:.2}</td></tr>
            <tr><td>Credits added</td><td>{credits}</td></tr>
            <tr><td>New balance</td><td>{new_balance}</td></tr>
        </table>

        <p><a href="{dashboard_link}">View your credits</a></p>

        <div class="footer">
            <p>This is an automated message, please do not reply to this email.</p>
        </div>
    </div>
</body>
</html>"#
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn payment_succeeded(&self, notice: &PaymentSuccessNotice) -> Result<(), Error> {
        let body = self.create_payment_success_body(notice);
        self.send_email(&notice.to_email, notice.to_name.as_deref(), "Payment Successful - Credits Added", &body)
            .await?;
        tracing::info!(order_id = %notice.order_id, "Payment confirmation email sent");
        Ok(())
    }
}
