//! Per-message enrichment pipeline
//!
//! A dependency graph executed once per received message: DKIM, SPF, spam
//! scoring and MIME parsing fan out concurrently, language detection waits
//! on the parse, and the finalize step joins everything into the report.
//! Every enrichment stage degrades to its conservative default on failure;
//! only an unreadable spool file aborts the run. Cleanup always happens.

use crate::message::{parse_message, ParsedEmail};
use crate::observer::{MessageObserver, SessionObserver};
use crate::report::{FinalizedReport, ValidationResult};
use crate::spam::{SpamScorer, SpamdClient};
use crate::verify::{CommandDkimVerifier, CommandSpfVerifier, DkimVerifier, SpfVerifier};
use crate::webhook::WebhookClient;
use mailhook_common::config::Config;
use mailhook_common::types::SessionSnapshot;
use mailhook_common::Result;
use mailhook_storage::TempStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Enrichment pipeline, shared by every session of one server
pub struct Pipeline {
    store: Arc<TempStore>,
    dkim: Option<Arc<dyn DkimVerifier>>,
    spf: Option<Arc<dyn SpfVerifier>>,
    scorer: Option<Arc<dyn SpamScorer>>,
    webhook: Option<Arc<WebhookClient>>,
    keep_temp_file: bool,
    parsing_enabled: bool,
    language_enabled: bool,
    session_observers: Vec<Arc<dyn SessionObserver>>,
    message_observers: Vec<Arc<dyn MessageObserver>>,
}

impl Pipeline {
    /// Build a pipeline from the configuration.
    ///
    /// Disabled stages (and stages with no configured collaborator) are
    /// simply absent and contribute their defaults.
    pub fn new(store: Arc<TempStore>, config: &Config) -> Result<Self> {
        let dkim: Option<Arc<dyn DkimVerifier>> = match &config.pipeline.dkim_command {
            Some(command) if !config.pipeline.disable_dkim => {
                Some(Arc::new(CommandDkimVerifier::new(command.clone())))
            }
            _ => None,
        };

        let spf: Option<Arc<dyn SpfVerifier>> = match &config.pipeline.spf_command {
            Some(command) if !config.pipeline.disable_spf => {
                Some(Arc::new(CommandSpfVerifier::new(command.clone())))
            }
            _ => None,
        };

        let scorer: Option<Arc<dyn SpamScorer>> = if config.pipeline.disable_spam_score {
            None
        } else {
            Some(Arc::new(SpamdClient::new(&config.spamd)?))
        };

        let webhook = if config.webhook.disabled {
            None
        } else {
            Some(Arc::new(WebhookClient::new(&config.webhook)?))
        };

        Ok(Self {
            store,
            dkim,
            spf,
            scorer,
            webhook,
            keep_temp_file: config.storage.keep_temp_file,
            parsing_enabled: !config.pipeline.disable_email_parsing,
            language_enabled: !config.pipeline.disable_language_detection,
            session_observers: Vec::new(),
            message_observers: Vec::new(),
        })
    }

    /// Replace the DKIM verifier (tests, embedders)
    pub fn with_dkim_verifier(mut self, verifier: Arc<dyn DkimVerifier>) -> Self {
        self.dkim = Some(verifier);
        self
    }

    /// Replace the SPF verifier
    pub fn with_spf_verifier(mut self, verifier: Arc<dyn SpfVerifier>) -> Self {
        self.spf = Some(verifier);
        self
    }

    /// Replace the spam scorer
    pub fn with_spam_scorer(mut self, scorer: Arc<dyn SpamScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn add_session_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.session_observers.push(observer);
    }

    pub fn add_message_observer(&mut self, observer: Arc<dyn MessageObserver>) {
        self.message_observers.push(observer);
    }

    pub fn webhook(&self) -> Option<&Arc<WebhookClient>> {
        self.webhook.as_ref()
    }

    /// Run the pipeline for one spooled message.
    ///
    /// Never returns an error: failures end up in the logs and the error
    /// notification. The spool file is deleted on every path unless the
    /// keep flag is set.
    pub async fn run(self: Arc<Self>, session: SessionSnapshot, message_id: String) {
        info!(session = %session.id, "Processing message");

        let outcome = self.process(&session, &message_id).await;

        // Cleanup runs whatever happened above
        if !self.keep_temp_file {
            if let Err(e) = self.store.delete(&message_id).await {
                error!(session = %session.id, error = %e, "Failed to delete spool file");
            }
        }

        match outcome {
            Ok((report, raw)) => {
                for observer in &self.message_observers {
                    observer.on_message(&session, &report, &raw).await;
                }
                info!(session = %session.id, "End processing message");
            }
            Err(e) => {
                error!(session = %session.id, error = %e, "Message processing failed");
                for observer in &self.session_observers {
                    observer.on_error(&session.id, &e.to_string()).await;
                }
            }
        }
    }

    async fn process(
        &self,
        session: &SessionSnapshot,
        message_id: &str,
    ) -> Result<(FinalizedReport, Vec<u8>)> {
        // The only fatal stage: without the raw bytes there is nothing to do
        let raw = self.store.read(message_id).await?;

        // dkim, spf, spam and parse are independent and I/O-bound; language
        // waits only on the parse. finalize is the join point.
        let (dkim_pass, spf_pass, spam_score, (parsed, language)) = tokio::join!(
            self.validate_dkim(&raw),
            self.validate_spf(session),
            self.compute_spam_score(&raw, session),
            async {
                let parsed = self.parse_email(&raw);
                let language = self.detect_language(parsed.as_ref());
                (parsed, language)
            },
        );

        let validation = ValidationResult {
            dkim_pass,
            spf_pass,
            spam_score,
            language,
        };
        let report = FinalizedReport::new(parsed, validation, session.clone());

        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook.deliver(&report).await {
                warn!(session = %session.id, error = %e, "Error in posting to webhook");
            }
        }

        Ok((report, raw))
    }

    async fn validate_dkim(&self, raw: &[u8]) -> bool {
        let Some(verifier) = &self.dkim else {
            return false;
        };

        debug!("Validating dkim");
        match verifier.verify(raw).await {
            Ok(pass) => pass,
            Err(e) => {
                error!(error = %e, "Unable to validate dkim, considering dkim as failed");
                false
            }
        }
    }

    async fn validate_spf(&self, session: &SessionSnapshot) -> bool {
        let Some(verifier) = &self.spf else {
            return false;
        };

        let sender = session
            .envelope
            .from
            .as_ref()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let helo = session.helo.clone().unwrap_or_default();

        debug!("Validating spf");
        match verifier.verify(session.remote_ip(), &sender, &helo).await {
            Ok(pass) => pass,
            Err(e) => {
                error!(error = %e, "Unable to validate spf, considering spf as failed");
                false
            }
        }
    }

    async fn compute_spam_score(&self, raw: &[u8], session: &SessionSnapshot) -> f64 {
        let Some(scorer) = &self.scorer else {
            return 0.0;
        };

        debug!("Computing spam score");
        match scorer.score(raw, session).await {
            Ok(score) => score,
            Err(e) => {
                error!(error = %e, "Unable to compute spam score, setting spam score to 0");
                0.0
            }
        }
    }

    fn parse_email(&self, raw: &[u8]) -> Option<ParsedEmail> {
        if !self.parsing_enabled {
            return None;
        }

        debug!("Parsing email");
        let parsed = parse_message(raw);
        if parsed.is_none() {
            error!("Error while parsing the email");
        }
        parsed
    }

    fn detect_language(&self, parsed: Option<&ParsedEmail>) -> String {
        if !self.language_enabled {
            return String::new();
        }

        let text = match parsed {
            Some(email) if !email.text.is_empty() => email.text.as_str(),
            _ => return String::new(),
        };

        debug!("Detecting language");
        match whatlang::detect(text) {
            Some(detection) => detection.lang().eng_name().to_lowercase(),
            None => {
                info!("Unable to detect language for the current message");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailhook_common::types::{AuthState, EmailAddress, Envelope};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        reports: Mutex<Vec<FinalizedReport>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageObserver for Recorder {
        async fn on_message(
            &self,
            _session: &SessionSnapshot,
            report: &FinalizedReport,
            _raw: &[u8],
        ) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    #[async_trait]
    impl SessionObserver for Recorder {
        async fn on_error(&self, _session_id: &str, error: &str) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            id: "ab12cd34".to_string(),
            remote_address: "192.0.2.7:45123".to_string(),
            helo: Some("mx.example.com".to_string()),
            envelope: Envelope {
                from: EmailAddress::parse("envelopefrom@jokund.com"),
                to: vec![EmailAddress::parse("envelopeto@jokund.com").unwrap()],
                client_ip: Some("192.0.2.7".to_string()),
                helo: Some("mx.example.com".to_string()),
            },
            authentication: AuthState::default(),
            received_at: chrono::Utc::now(),
        }
    }

    fn disabled_config() -> Config {
        let mut config = Config::default();
        config.pipeline.disable_dkim = true;
        config.pipeline.disable_spf = true;
        config.pipeline.disable_spam_score = true;
        config.webhook.disabled = true;
        config
    }

    async fn spool(store: &TempStore, body: &[u8]) -> String {
        let id = TempStore::make_id();
        let mut writer = store.create(&id).await.unwrap();
        writer.write_chunk(body).await.unwrap();
        writer.finish().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_disabled_stages_substitute_defaults() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TempStore::new(dir.path()).unwrap());
        let mut pipeline = Pipeline::new(store.clone(), &disabled_config()).unwrap();

        let recorder = Arc::new(Recorder::default());
        pipeline.add_message_observer(recorder.clone());
        let pipeline = Arc::new(pipeline);

        let raw = concat!(
            "From: me@jokund.com\r\n",
            "Subject: hi\r\n",
            "\r\n",
            "This is an english sentence for the detector to chew on.\r\n",
        );
        let id = spool(&store, raw.as_bytes()).await;

        pipeline.run(snapshot(), id.clone()).await;

        let reports = recorder.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.dkim, "failed");
        assert_eq!(report.spf, "failed");
        assert_eq!(report.spam_score, 0.0);
        assert_eq!(report.language, "english");
        assert!(!report.email.text.is_empty());

        // Cleanup ran
        assert!(store.read(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_language_empty_when_detection_disabled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TempStore::new(dir.path()).unwrap());
        let mut config = disabled_config();
        config.pipeline.disable_language_detection = true;

        let mut pipeline = Pipeline::new(store.clone(), &config).unwrap();
        let recorder = Arc::new(Recorder::default());
        pipeline.add_message_observer(recorder.clone());
        let pipeline = Arc::new(pipeline);

        let id = spool(&store, b"From: a@b.c\r\n\r\nsome text\r\n").await;
        pipeline.run(snapshot(), id).await;

        let reports = recorder.reports.lock().unwrap();
        assert_eq!(reports[0].language, "");
    }

    #[tokio::test]
    async fn test_language_empty_when_parsing_disabled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TempStore::new(dir.path()).unwrap());
        let mut config = disabled_config();
        config.pipeline.disable_email_parsing = true;

        let mut pipeline = Pipeline::new(store.clone(), &config).unwrap();
        let recorder = Arc::new(Recorder::default());
        pipeline.add_message_observer(recorder.clone());
        let pipeline = Arc::new(pipeline);

        let id = spool(&store, b"From: a@b.c\r\n\r\nsome text\r\n").await;
        pipeline.run(snapshot(), id).await;

        let reports = recorder.reports.lock().unwrap();
        let report = &reports[0];
        assert_eq!(report.language, "");
        // Unparsed sentinel still honors the array invariant
        let json = serde_json::to_value(report).unwrap();
        assert!(json["cc"].is_array());
        assert!(json["attachments"].is_array());
    }

    #[tokio::test]
    async fn test_keep_temp_file_skips_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TempStore::new(dir.path()).unwrap());
        let mut config = disabled_config();
        config.storage.keep_temp_file = true;

        let pipeline = Arc::new(Pipeline::new(store.clone(), &config).unwrap());
        let id = spool(&store, b"From: a@b.c\r\n\r\nbody\r\n").await;
        pipeline.run(snapshot(), id.clone()).await;

        assert!(store.read(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreadable_raw_is_fatal_but_clean() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TempStore::new(dir.path()).unwrap());
        let mut pipeline = Pipeline::new(store.clone(), &disabled_config()).unwrap();

        let recorder = Arc::new(Recorder::default());
        pipeline.add_message_observer(recorder.clone());
        pipeline.add_session_observer(recorder.clone());
        let pipeline = Arc::new(pipeline);

        // Never spooled
        pipeline
            .run(snapshot(), TempStore::make_id())
            .await;

        assert!(recorder.reports.lock().unwrap().is_empty());
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_verifiers_fall_back_to_failed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TempStore::new(dir.path()).unwrap());
        let mut config = disabled_config();
        config.pipeline.disable_dkim = false;
        config.pipeline.disable_spf = false;
        config.pipeline.dkim_command = Some("/nonexistent/verifydkim".into());
        config.pipeline.spf_command = Some("/nonexistent/verifyspf".into());

        let mut pipeline = Pipeline::new(store.clone(), &config).unwrap();
        let recorder = Arc::new(Recorder::default());
        pipeline.add_message_observer(recorder.clone());
        let pipeline = Arc::new(pipeline);

        let id = spool(&store, b"From: a@b.c\r\n\r\nbody\r\n").await;
        pipeline.run(snapshot(), id).await;

        let reports = recorder.reports.lock().unwrap();
        assert_eq!(reports[0].dkim, "failed");
        assert_eq!(reports[0].spf, "failed");
    }
}
