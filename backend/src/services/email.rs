use crate::config::SmtpConfig;
use crate::services::DeliveryError;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use reviewflow_shared::{Business, Customer};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

/// Outbound email channel used by the execution engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send a follow-up email using a template type or template name
    async fn send_follow_up_email(
        &self,
        customer: &Customer,
        business: &Business,
        template: &str,
    ) -> Result<bool, DeliveryError>;

    /// Send the default review-request email
    async fn send_review_request_with_template(
        &self,
        customer: &Customer,
        business: &Business,
    ) -> Result<bool, DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

pub const REVIEW_REQUEST_TEMPLATE: &str = "review_request";

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(EmailService {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        })
    }

    pub async fn send_email(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        template: &EmailTemplate,
    ) -> Result<(), DeliveryError> {
        let from = format!("{} <{}>", self.from_name, self.from_email).parse::<Mailbox>()?;

        let to = match to_name {
            Some(name) if !name.trim().is_empty() => format!("{} <{}>", name, to_email).parse::<Mailbox>()?,
            _ => to_email.parse::<Mailbox>()?,
        };

        let builder = Message::builder().from(from).to(to).subject(&template.subject);

        let message = match &template.text_body {
            Some(text) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(template.html_body.clone()),
                    ),
            )?,
            None => builder.header(ContentType::TEXT_HTML).body(template.html_body.clone())?,
        };

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", to_email);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to_email, e);
                Err(e.into())
            }
        }
    }

    async fn send_template(
        &self,
        customer: &Customer,
        business: &Business,
        template_key: &str,
    ) -> Result<bool, DeliveryError> {
        let Some(to_email) = customer.email.as_deref().filter(|e| !e.trim().is_empty()) else {
            debug!(customer_id = %customer.id, "Customer has no email address, skipping");
            return Ok(false);
        };

        let template = render_template(template_key, customer, business)
            .ok_or_else(|| DeliveryError::TemplateNotFound(template_key.to_string()))?;

        self.send_email(to_email, Some(&customer.name), &template).await?;
        Ok(true)
    }
}

#[async_trait]
impl EmailSender for EmailService {
    async fn send_follow_up_email(
        &self,
        customer: &Customer,
        business: &Business,
        template: &str,
    ) -> Result<bool, DeliveryError> {
        self.send_template(customer, business, template).await
    }

    async fn send_review_request_with_template(
        &self,
        customer: &Customer,
        business: &Business,
    ) -> Result<bool, DeliveryError> {
        self.send_template(customer, business, REVIEW_REQUEST_TEMPLATE).await
    }
}

fn first_name(customer: &Customer) -> &str {
    customer.name.split_whitespace().next().unwrap_or("there")
}

/// Escape text interpolated into HTML bodies and attributes
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// `body` must already be escaped
fn layout(title: &str, body: &str, business: &Business) -> String {
    format!(
        r#"
        <html>
        <head>
            <style>
                body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background-color: #f5f5f5; }}
                .container {{ max-width: 600px; margin: 0 auto; background: white; border-radius: 8px; overflow: hidden; }}
                .header {{ background: #2563eb; color: white; padding: 20px; text-align: center; }}
                .content {{ padding: 30px; }}
                .btn {{ display: inline-block; background: #2563eb; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; margin: 10px 0; }}
                .footer {{ background: #f8fafc; padding: 20px; text-align: center; color: #666; }}
            </style>
        </head>
        <body>
            <div class="container">
                <div class="header"><h1>{}</h1></div>
                <div class="content">{}</div>
                <div class="footer"><p>Sent on behalf of {}.</p></div>
            </div>
        </body>
        </html>
        "#,
        escape_html(title),
        body,
        escape_html(&business.name)
    )
}

/// Built-in templates, looked up by type or name
pub fn render_template(key: &str, customer: &Customer, business: &Business) -> Option<EmailTemplate> {
    let name = first_name(customer);
    let review_url = business.review_url.as_deref().unwrap_or("");
    let (html_name, html_business, html_url) = (
        escape_html(name),
        escape_html(&business.name),
        escape_html(review_url),
    );

    let (subject, html, text) = match key.trim().to_ascii_lowercase().as_str() {
        "review_request" => (
            format!("How was your experience with {}?", business.name),
            format!(
                r#"<p>Hi {},</p>
                <p>Thank you for choosing {}. We'd love to hear how we did.</p>
                <a href="{}" class="btn">Leave a review</a>"#,
                html_name, html_business, html_url
            ),
            format!(
                "Hi {},\n\nThank you for choosing {}. We'd love to hear how we did.\n\nLeave a review: {}",
                name, business.name, review_url
            ),
        ),
        "follow_up" => (
            format!("A quick follow-up from {}", business.name),
            format!(
                r#"<p>Hi {},</p>
                <p>We wanted to check in after your recent visit. If you have a minute, a short review helps us a lot.</p>
                <a href="{}" class="btn">Share your feedback</a>"#,
                html_name, html_url
            ),
            format!(
                "Hi {},\n\nWe wanted to check in after your recent visit. If you have a minute, a short review helps us a lot.\n\n{}",
                name, review_url
            ),
        ),
        "reminder" => (
            format!("Reminder: share your feedback with {}", business.name),
            format!(
                r#"<p>Hi {},</p>
                <p>Just a friendly reminder that your feedback is still welcome.</p>
                <a href="{}" class="btn">Leave a review</a>"#,
                html_name, html_url
            ),
            format!(
                "Hi {},\n\nJust a friendly reminder that your feedback is still welcome.\n\n{}",
                name, review_url
            ),
        ),
        "thank_you" => (
            format!("Thank you from {}", business.name),
            format!(
                "<p>Hi {},</p><p>Thank you for taking the time to leave a review. It means a lot to the whole team at {}.</p>",
                html_name, html_business
            ),
            format!(
                "Hi {},\n\nThank you for taking the time to leave a review. It means a lot to the whole team at {}.",
                name, business.name
            ),
        ),
        _ => return None,
    };

    Some(EmailTemplate {
        html_body: layout(&subject, &html, business),
        subject,
        text_body: Some(text),
    })
}
