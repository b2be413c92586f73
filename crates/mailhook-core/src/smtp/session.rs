//! SMTP session state machine
//!
//! One session per accepted connection. The session owns no shared mutable
//! state: everything cross-connection lives behind the [`SessionHost`].
//! When DATA completes, an immutable snapshot is frozen and handed to the
//! pipeline; the live envelope is then reset for the next message on the
//! same connection.

use crate::observer::{AddressPolicy, SessionObserver};
use crate::pipeline::Pipeline;
use crate::validate::{AddressKind, AddressValidator, Verdict};
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use mailhook_common::config::SmtpConfig;
use mailhook_common::types::{AuthState, EmailAddress, Envelope, SessionSnapshot};
use mailhook_storage::TempStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a session needs from the server, shared across connections
pub(crate) struct SessionHost {
    pub config: SmtpConfig,
    pub store: Arc<TempStore>,
    pub validator: AddressValidator,
    pub policy: Option<Arc<dyn AddressPolicy>>,
    pub observers: Vec<Arc<dyn SessionObserver>>,
    pub pipeline: Arc<Pipeline>,
}

/// Protocol state of one session
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Idle,
    GotSender,
    GotRecipient,
}

/// One SMTP connection
pub(crate) struct SmtpSession {
    host: Arc<SessionHost>,
    peer_addr: SocketAddr,
    id: String,
}

impl SmtpSession {
    pub fn new(host: Arc<SessionHost>, peer_addr: SocketAddr) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            host,
            peer_addr,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the session until QUIT or disconnect
    pub async fn handle<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut state = SessionState::Idle;
        let mut greeted = false;
        let mut envelope = Envelope {
            from: None,
            to: Vec::new(),
            client_ip: Some(self.peer_addr.ip().to_string()),
            helo: None,
        };
        let mut auth = AuthState::default();

        self.send_response(&mut writer, 220, &self.host.config.banner)
            .await?;

        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                debug!(session = %self.id, "Client {} disconnected", self.peer_addr);
                break;
            }

            let line = line.trim();
            debug!(session = %self.id, "SMTP from {}: {}", self.peer_addr, line);

            let (command, args) = parse_command(line);
            let command = command.to_uppercase();

            if self.is_disabled(&command) {
                self.send_response(&mut writer, 502, "5.5.1 Command disabled")
                    .await?;
                continue;
            }

            match command.as_str() {
                "HELO" => {
                    envelope.helo = Some(args.to_string());
                    greeted = true;
                    self.send_response(&mut writer, 250, &format!("Hello {}", args))
                        .await?;
                }

                "EHLO" => {
                    envelope.helo = Some(args.to_string());
                    greeted = true;

                    let max_size = self.host.config.max_message_size.unwrap_or(0);
                    let mut responses = vec![
                        format!("{} Hello {}", self.host.config.banner, args),
                        format!("SIZE {}", max_size),
                        "8BITMIME".to_string(),
                        "PIPELINING".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];
                    if !self.is_disabled("AUTH") {
                        responses.push("AUTH PLAIN LOGIN".to_string());
                    }

                    for (i, resp) in responses.iter().enumerate() {
                        if i == responses.len() - 1 {
                            self.send_response(&mut writer, 250, resp).await?;
                        } else {
                            self.send_response_continue(&mut writer, 250, resp).await?;
                        }
                    }
                }

                "AUTH" => {
                    if !greeted {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }
                    self.handle_auth(&mut reader, &mut writer, args, &mut auth)
                        .await?;
                }

                "MAIL" => {
                    if !greeted || state != SessionState::Idle {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let from_addr = match parse_mail_from(args) {
                        Some(addr) => addr,
                        None => {
                            self.send_response(&mut writer, 501, "5.1.7 Bad sender address syntax")
                                .await?;
                            continue;
                        }
                    };

                    let verdict = self
                        .host
                        .validator
                        .validate(AddressKind::Sender, from_addr.as_ref(), &envelope)
                        .await;

                    match verdict {
                        Verdict::Accept => {
                            envelope.from = from_addr;
                            state = SessionState::GotSender;
                            self.send_response(&mut writer, 250, "2.1.0 OK").await?;
                        }
                        Verdict::Reject { code, message } => {
                            let rejected = from_addr
                                .map(|addr| addr.to_string())
                                .unwrap_or_default();
                            warn!(session = %self.id, address = %rejected, "Sender rejected");
                            for observer in &self.host.observers {
                                observer
                                    .on_sender_validation_failed(&self.id, &rejected)
                                    .await;
                            }
                            self.send_response(&mut writer, code, &message).await?;
                        }
                    }
                }

                "RCPT" => {
                    if state != SessionState::GotSender && state != SessionState::GotRecipient {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    let to_addr = match parse_rcpt_to(args) {
                        Some(addr) => addr,
                        None => {
                            self.send_response(
                                &mut writer,
                                501,
                                "5.1.3 Bad recipient address syntax",
                            )
                            .await?;
                            continue;
                        }
                    };

                    let verdict = self
                        .host
                        .validator
                        .validate(AddressKind::Recipient, Some(&to_addr), &envelope)
                        .await;

                    match verdict {
                        Verdict::Accept => {
                            envelope.to.push(to_addr);
                            state = SessionState::GotRecipient;
                            self.send_response(&mut writer, 250, "2.1.5 OK").await?;
                        }
                        Verdict::Reject { code, message } => {
                            let rejected = to_addr.to_string();
                            warn!(session = %self.id, address = %rejected, "Recipient rejected");
                            for observer in &self.host.observers {
                                observer
                                    .on_recipient_validation_failed(&self.id, &rejected)
                                    .await;
                            }
                            self.send_response(&mut writer, code, &message).await?;
                        }
                    }
                }

                "DATA" => {
                    if state != SessionState::GotRecipient || envelope.to.is_empty() {
                        self.send_response(&mut writer, 503, "5.5.1 Bad sequence of commands")
                            .await?;
                        continue;
                    }

                    self.receive_data(&mut reader, &mut writer, &envelope, &auth)
                        .await?;

                    // The live session is reused for the next message
                    state = SessionState::Idle;
                    envelope.from = None;
                    envelope.to.clear();
                }

                "RSET" => {
                    envelope.from = None;
                    envelope.to.clear();
                    state = SessionState::Idle;
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(&mut writer, 250, "2.0.0 OK").await?;
                }

                "VRFY" => {
                    self.send_response(&mut writer, 252, "2.5.2 Cannot VRFY user")
                        .await?;
                }

                "QUIT" => {
                    self.send_response(&mut writer, 221, "2.0.0 Bye").await?;
                    break;
                }

                _ => {
                    self.send_response(&mut writer, 500, "5.5.2 Command not recognized")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Stream the message body into the spool, then hand the frozen
    /// snapshot to the pipeline before acknowledging the client.
    async fn receive_data<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        envelope: &Envelope,
        auth: &AuthState,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let message_id = TempStore::make_id();
        let mut spool = match self.host.store.create(&message_id).await {
            Ok(spool) => spool,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to open spool file");
                self.send_response(writer, 451, "4.3.0 Temporary error").await?;
                return Ok(());
            }
        };

        let snapshot = self.freeze(envelope, auth);
        info!(
            session = %self.id,
            from = ?envelope.from.as_ref().map(|a| a.to_string()),
            "Receiving message"
        );
        for observer in &self.host.observers {
            observer.on_start_data(&snapshot).await;
            observer.on_start_message(&snapshot).await;
        }

        self.send_response(writer, 354, "Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let max_size = self.host.config.max_message_size.unwrap_or(usize::MAX);
        let mut received = 0usize;
        let mut overflow = false;
        let mut line: Vec<u8> = Vec::new();

        loop {
            line.clear();
            let bytes_read = reader.read_until(b'\n', &mut line).await?;

            if bytes_read == 0 {
                anyhow::bail!("Connection closed during DATA");
            }

            if line == b".\r\n" || line == b".\n" || line == b"." {
                break;
            }

            // Dot-stuffing: a leading ".." encodes a line starting with "."
            let chunk: &[u8] = if line.starts_with(b"..") {
                &line[1..]
            } else {
                &line
            };

            received += chunk.len();
            if received > max_size {
                overflow = true;
                continue;
            }

            spool.write_chunk(chunk).await?;
            for observer in &self.host.observers {
                observer.on_data(&self.id, chunk).await;
            }
        }

        if overflow {
            warn!(session = %self.id, "Message exceeds maximum size");
            if let Err(e) = self.host.store.delete(&message_id).await {
                warn!(session = %self.id, error = %e, "Failed to drop oversized spool file");
            }
            self.send_response(writer, 552, "5.3.4 Message too large").await?;
            return Ok(());
        }

        spool.finish().await?;

        // Freeze again so the snapshot carries the complete envelope, then
        // dispatch the pipeline. The 250 only goes out once the pipeline
        // task exists; the pipeline itself never blocks the reply.
        let snapshot = self.freeze(envelope, auth);
        tokio::spawn(
            self.host
                .pipeline
                .clone()
                .run(snapshot, message_id.clone()),
        );

        self.send_response(
            writer,
            250,
            &format!("2.0.0 OK: queued as {}", message_id),
        )
        .await?;

        Ok(())
    }

    async fn handle_auth<R, W>(
        &self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        args: &str,
        auth: &mut AuthState,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut parts = args.splitn(2, ' ');
        let mechanism = parts.next().unwrap_or("").to_uppercase();
        let initial = parts.next();

        let credentials = match mechanism.as_str() {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload.to_string(),
                    None => {
                        self.send_response(writer, 334, "").await?;
                        read_auth_line(reader).await?
                    }
                };
                decode_auth_plain(&payload)
            }
            "LOGIN" => {
                self.send_response(writer, 334, "VXNlcm5hbWU6").await?;
                let username = read_auth_line(reader).await?;
                self.send_response(writer, 334, "UGFzc3dvcmQ6").await?;
                let password = read_auth_line(reader).await?;
                match (BASE64.decode(&username), BASE64.decode(&password)) {
                    (Ok(username), Ok(password)) => Some((
                        String::from_utf8_lossy(&username).to_string(),
                        String::from_utf8_lossy(&password).to_string(),
                    )),
                    _ => None,
                }
            }
            _ => {
                self.send_response(writer, 504, "5.5.4 Unrecognized authentication mechanism")
                    .await?;
                return Ok(());
            }
        };

        let Some((username, password)) = credentials else {
            self.send_response(writer, 501, "5.5.2 Invalid credentials encoding")
                .await?;
            return Ok(());
        };

        // Absent a registered policy, authentication is accepted as-is
        let authorized = match &self.host.policy {
            Some(policy) => policy.authorize(&username, &password).await,
            None => true,
        };

        if authorized {
            auth.authenticated = true;
            auth.username = Some(username);
            self.send_response(writer, 235, "2.7.0 Authentication successful")
                .await?;
        } else {
            self.send_response(writer, 535, "5.7.8 Authentication credentials invalid")
                .await?;
        }

        Ok(())
    }

    /// Take the immutable value copy handed to observers and the pipeline
    fn freeze(&self, envelope: &Envelope, auth: &AuthState) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            remote_address: self.peer_addr.to_string(),
            helo: envelope.helo.clone(),
            envelope: envelope.clone(),
            authentication: auth.clone(),
            received_at: Utc::now(),
        }
    }

    fn is_disabled(&self, command: &str) -> bool {
        self.host
            .config
            .disabled_commands
            .iter()
            .any(|disabled| disabled.eq_ignore_ascii_case(command))
    }

    async fn send_response<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{} {}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        debug!(session = %self.id, "SMTP to {}: {}", self.peer_addr, response.trim());
        Ok(())
    }

    async fn send_response_continue<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut BufWriter<W>,
        code: u16,
        message: &str,
    ) -> Result<()> {
        let response = format!("{}-{}\r\n", code, message);
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_auth_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        anyhow::bail!("Connection closed during AUTH");
    }
    Ok(line.trim().to_string())
}

/// Decode an AUTH PLAIN payload: base64("authzid\0authcid\0password")
fn decode_auth_plain(payload: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(payload).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let username = parts.next()?;
    let password = parts.next()?;
    Some((username.to_string(), password.to_string()))
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    let parts: Vec<&str> = line.splitn(2, ' ').collect();
    (parts.first().unwrap_or(&""), parts.get(1).unwrap_or(&""))
}

/// Parse MAIL FROM:<address>; `Some(None)` is the null sender
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let args = args.trim();

    let addr_part = if args.to_uppercase().starts_with("FROM:") {
        &args[5..]
    } else {
        return None;
    };

    let addr_part = addr_part.trim();

    if addr_part == "<>" {
        return Some(None);
    }

    let email = if addr_part.starts_with('<') && addr_part.contains('>') {
        let end = addr_part.find('>')?;
        &addr_part[1..end]
    } else {
        addr_part.split_whitespace().next()?
    };

    if email.is_empty() {
        Some(None)
    } else {
        Some(EmailAddress::parse(email))
    }
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let args = args.trim();

    let addr_part = if args.to_uppercase().starts_with("TO:") {
        &args[3..]
    } else {
        return None;
    };

    let addr_part = addr_part.trim();

    let email = if addr_part.starts_with('<') && addr_part.contains('>') {
        let end = addr_part.find('>')?;
        &addr_part[1..end]
    } else {
        addr_part.split_whitespace().next()?
    };

    EmailAddress::parse(email)
}
