//! Message body rendering.
//!
//! The stored body keeps two markers so it can be personalised for each
//! recipient when it is transmitted:
//! - [`RECIPIENT_MARKER`]: replaced by the recipient address
//! - [`UNSUBSCRIBE_MARKER`]: replaced by that recipient's signed unsubscribe link

pub const RECIPIENT_MARKER: &str = "<!--recipient-->";
pub const UNSUBSCRIBE_MARKER: &str = "<!--unsubscribe url-->";

/// Render the body that is stored with a queue record
#[must_use]
pub fn render_body(
    message: &str,
    to: &[String],
    cc: &[String],
    expose_recipients: bool,
    unsubscribe_message: Option<&str>,
) -> String {
    let mut body = String::with_capacity(message.len() + 128);

    if expose_recipients {
        if !to.is_empty() {
            body.push_str("To: ");
            body.push_str(&to.join(", "));
            body.push('\n');
        }

        if !cc.is_empty() {
            body.push_str("CC: ");
            body.push_str(&cc.join(", "));
            body.push('\n');
        }

        body.push('\n');
    }

    body.push_str(message);

    if let Some(text) = unsubscribe_message {
        body.push_str("\n\n");
        body.push_str(RECIPIENT_MARKER);
        body.push('\n');
        body.push_str(text);
        body.push('\n');
        body.push_str(UNSUBSCRIBE_MARKER);
        body.push('\n');
    }

    body
}

/// Whether a stored body expects a per-recipient unsubscribe link
#[must_use]
pub fn wants_unsubscribe_link(body: &str) -> bool {
    body.contains(UNSUBSCRIBE_MARKER)
}

/// Substitute the markers for one recipient
#[must_use]
pub fn personalise(body: &str, recipient: &str, unsubscribe_url: Option<&str>) -> String {
    let body = body.replace(RECIPIENT_MARKER, recipient);
    match unsubscribe_url {
        Some(url) => body.replace(UNSUBSCRIBE_MARKER, url),
        None => body,
    }
}
