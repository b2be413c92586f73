//! MIME parsing into the report model

use mail_parser::{Address, MessageParser, MimeHeaders};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A mailbox as it appears in the report: address plus display name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailAddr {
    pub address: String,
    pub name: String,
}

impl MailAddr {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// One decoded attachment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Collision-free name, used as the multipart field name on delivery
    pub generated_file_name: String,

    pub content_type: String,

    pub content_disposition: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_encoding: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,

    /// Hex SHA-256 of the decoded content
    pub checksum: String,

    /// Decoded length in bytes
    pub length: usize,

    /// Decoded bytes; delivered out-of-band, never serialized into the report
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// Structured email, with both body representations always populated
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEmail {
    /// Headers in arrival order, raw values
    #[serde(serialize_with = "serialize_headers")]
    pub headers: Vec<(String, String)>,

    pub text: String,

    pub html: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    pub from: Vec<MailAddr>,

    pub to: Vec<MailAddr>,

    pub cc: Vec<MailAddr>,

    pub attachments: Vec<Attachment>,
}

fn serialize_headers<S: Serializer>(
    headers: &[(String, String)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(headers.len()))?;
    for (name, value) in headers {
        map.serialize_entry(name, value)?;
    }
    map.end()
}

/// Parse raw message bytes into a [`ParsedEmail`].
///
/// Returns `None` when the bytes are not parseable as a message; the caller
/// substitutes its unparsed sentinel.
pub fn parse_message(raw: &[u8]) -> Option<ParsedEmail> {
    let message = MessageParser::default().parse(raw)?;

    let mut headers = Vec::new();
    for header in message.headers() {
        let value = raw
            .get(header.offset_start()..header.offset_end())
            .map(|slice| {
                String::from_utf8_lossy(slice)
                    .replace(['\r', '\n'], "")
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();
        headers.push((header.name().to_string().to_lowercase(), value));
    }

    let text = message.body_text(0).map(|body| body.to_string());
    let html = message.body_html(0).map(|body| body.to_string());

    // mail-parser synthesizes each body representation from the other, so a
    // one-sided message still yields both. A bodiless message gets the
    // explicit empty values.
    let (text, html) = match (text, html) {
        (None, None) => (String::new(), "<div></div>".to_string()),
        (text, html) => (text.unwrap_or_default(), html.unwrap_or_default()),
    };

    let mut seen_names: HashMap<String, usize> = HashMap::new();
    let mut attachments = Vec::new();
    for (index, part) in message.attachments().enumerate() {
        let content = part.contents().to_vec();
        let file_name = part.attachment_name().map(|name| name.to_string());

        let base_name = file_name
            .clone()
            .unwrap_or_else(|| format!("attachment-{}", index + 1));
        let generated_file_name = dedup_file_name(&mut seen_names, base_name);

        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let content_disposition = part
            .content_disposition()
            .map(|cd| cd.ctype().to_string())
            .unwrap_or_else(|| "attachment".to_string());

        let checksum = hex::encode(Sha256::digest(&content));

        attachments.push(Attachment {
            file_name,
            generated_file_name,
            content_type,
            content_disposition,
            transfer_encoding: part.content_transfer_encoding().map(|enc| enc.to_string()),
            content_id: part.content_id().map(|id| id.to_string()),
            checksum,
            length: content.len(),
            content,
        });
    }

    Some(ParsedEmail {
        headers,
        text,
        html,
        subject: message.subject().map(|subject| subject.to_string()),
        from: address_list(message.from()),
        to: address_list(message.to()),
        cc: address_list(message.cc()),
        attachments,
    })
}

fn address_list(address: Option<&Address>) -> Vec<MailAddr> {
    let mut out = Vec::new();
    let Some(address) = address else {
        return out;
    };
    match address {
        Address::List(list) => {
            for addr in list {
                out.push(MailAddr::new(
                    addr.address().unwrap_or_default(),
                    addr.name().unwrap_or_default(),
                ));
            }
        }
        Address::Group(groups) => {
            for group in groups {
                for addr in &group.addresses {
                    out.push(MailAddr::new(
                        addr.address().unwrap_or_default(),
                        addr.name().unwrap_or_default(),
                    ));
                }
            }
        }
    }
    out
}

/// Make a filename unique within one message by suffixing a counter before
/// the extension
fn dedup_file_name(seen: &mut HashMap<String, usize>, name: String) -> String {
    let count = seen.entry(name.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        return name;
    }

    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, count, ext),
        None => format!("{}-{}", name, count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const WITH_ATTACHMENT: &str = concat!(
        "From: \"Me\" <me@jokund.com>\r\n",
        "To: \"First Receiver\" <first@jokund.com>, second@jokund.com\r\n",
        "Subject: Attached\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=\"frontier\"\r\n",
        "\r\n",
        "--frontier\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "Hello world!\r\n",
        "--frontier\r\n",
        "Content-Type: text/plain\r\n",
        "Content-Disposition: attachment; filename=\"dummyFile.txt\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "RHVtbXkgY29udGVudCBmb3IgdGVzdHM=\r\n",
        "--frontier--\r\n",
    );

    #[test]
    fn test_parse_with_attachment() {
        let email = parse_message(WITH_ATTACHMENT.as_bytes()).unwrap();

        assert!(email.text.contains("Hello world!"));
        assert!(!email.html.is_empty());
        assert_eq!(email.subject.as_deref(), Some("Attached"));
        assert_eq!(email.from, vec![MailAddr::new("me@jokund.com", "Me")]);
        assert_eq!(
            email.to,
            vec![
                MailAddr::new("first@jokund.com", "First Receiver"),
                MailAddr::new("second@jokund.com", ""),
            ]
        );
        assert!(email.cc.is_empty());

        assert_eq!(email.attachments.len(), 1);
        let attachment = &email.attachments[0];
        assert_eq!(attachment.file_name.as_deref(), Some("dummyFile.txt"));
        assert_eq!(attachment.generated_file_name, "dummyFile.txt");
        assert_eq!(attachment.content_type, "text/plain");
        assert_eq!(attachment.content_disposition, "attachment");
        assert_eq!(attachment.content, b"Dummy content for tests");
        assert_eq!(attachment.length, attachment.content.len());
        assert_eq!(
            attachment.checksum,
            hex::encode(Sha256::digest(b"Dummy content for tests"))
        );
    }

    #[test]
    fn test_headers_keep_arrival_order() {
        let email = parse_message(WITH_ATTACHMENT.as_bytes()).unwrap();
        let names: Vec<&str> = email.headers.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["from", "to", "subject", "mime-version", "content-type"]
        );
        assert_eq!(email.headers[0].1, "\"Me\" <me@jokund.com>");
    }

    #[test]
    fn test_html_only_synthesizes_text() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<b>Hello world!</b>\r\n",
        );
        let email = parse_message(raw.as_bytes()).unwrap();
        assert!(email.html.contains("<b>Hello world!</b>"));
        assert!(email.text.contains("Hello world!"));
        assert!(!email.text.contains('<'));
    }

    #[test]
    fn test_text_only_synthesizes_html() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "\r\n",
            "plain text body\r\n",
        );
        let email = parse_message(raw.as_bytes()).unwrap();
        assert!(email.text.contains("plain text body"));
        assert!(email.html.contains("plain text body"));
    }

    #[test]
    fn test_bodiless_message_gets_empty_values() {
        let raw = "From: a@example.com\r\nSubject: nothing\r\n\r\n";
        let email = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(email.text, "");
        assert_eq!(email.html, "<div></div>");
    }

    #[test]
    fn test_dedup_file_name() {
        let mut seen = HashMap::new();
        assert_eq!(
            dedup_file_name(&mut seen, "report.pdf".to_string()),
            "report.pdf"
        );
        assert_eq!(
            dedup_file_name(&mut seen, "report.pdf".to_string()),
            "report-2.pdf"
        );
        assert_eq!(dedup_file_name(&mut seen, "notes".to_string()), "notes");
        assert_eq!(dedup_file_name(&mut seen, "notes".to_string()), "notes-2");
    }
}
