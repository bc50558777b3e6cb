#[macro_use]
extern crate rocket;

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod inbox;
pub mod mail;
pub mod models;
pub mod request_logger;
pub mod routes;
pub mod store;
pub mod transitions;

use crate::agent::AgentContext;
use crate::config::AppConfig;
use crate::db::AckDb;
use crate::extract::PdfStringScanner;
use crate::extract::llm::HttpLlmClient;
use crate::mail::gmail::GmailClient;
use crate::mail::{MailProvider, UnconfiguredMailProvider};
use crate::request_logger::RequestLog;
use crate::store::Store;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let app_config = AppConfig::from_env();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://ack-engine.db?mode=rwc".to_string());
    let figment = rocket::Config::figment().merge(("databases.ack_db.url", database_url));

    // Configure CORS
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Put, Method::Delete, Method::Patch]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::custom(figment)
        .attach(RequestLog)
        .attach(AckDb::init())
        .attach(cors)
        // Run database migrations and the one-shot attachment cleanup on startup
        .attach(AdHoc::try_on_ignite("Run Migrations", |rocket| async move {
            match AckDb::fetch(&rocket) {
                Some(db) => {
                    let pool = (**db).clone();
                    if let Err(e) = store::run_migrations(&pool).await {
                        log::error!("database migrations failed: {}", e);
                        return Err(rocket);
                    }
                    log::info!("database migrations successful");

                    // Duplicate cleanup must precede the unique hash index on
                    // databases that predate content addressing.
                    let store = Store::new(pool.clone());
                    match store.cleanup_duplicate_attachments().await {
                        Ok(summary) if summary.groups > 0 => {
                            log::info!(
                                "legacy attachment cleanup removed {} duplicate row(s)",
                                summary.deleted
                            );
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("attachment cleanup failed (non-fatal): {}", e),
                    }
                    if let Err(e) = store::ensure_hash_indexes(&pool).await {
                        log::error!("hash index creation failed: {}", e);
                        return Err(rocket);
                    }
                    Ok(rocket)
                }
                None => {
                    log::error!("database pool not available for migrations");
                    Err(rocket)
                }
            }
        }))
        // Construct the agent context: store, mail provider, LLM, PDF scanner
        .attach(AdHoc::try_on_ignite("Init Agent Context", move |rocket| async move {
            let pool = match AckDb::fetch(&rocket) {
                Some(db) => (**db).clone(),
                None => {
                    log::error!("database pool not available for agent context");
                    return Err(rocket);
                }
            };
            let store = Store::new(pool.clone());

            let mail: Arc<dyn MailProvider> = if app_config.mail_client_id.is_some()
                && app_config.mail_client_secret.is_some()
            {
                match GmailClient::new(store.clone(), &app_config) {
                    Ok(client) => Arc::new(client),
                    Err(err) => {
                        log::error!("failed to initialize mail client: {}", err);
                        return Err(rocket);
                    }
                }
            } else {
                log::warn!("mail credentials absent; mail operations will fail until configured");
                Arc::new(UnconfiguredMailProvider)
            };

            let llm = HttpLlmClient::from_config(&app_config)
                .map(|client| Arc::new(client) as Arc<dyn extract::llm::LlmClient>);
            if llm.is_none() {
                log::warn!("LLM_API_KEY absent; field extraction runs heuristics only");
            }

            let ctx = AgentContext {
                store: store.clone(),
                mail,
                llm,
                pdf: Arc::new(PdfStringScanner),
                config: app_config.clone(),
            };

            Ok(rocket.manage(pool).manage(store).manage(app_config).manage(ctx))
        }))
        .mount(
            "/",
            openapi_get_routes![
                // Health
                routes::health::live_health,
                routes::health::ready_health,
                // Agent
                routes::agent::orchestrate,
                routes::agent::orchestrate_stream,
                routes::agent::poll_due,
                routes::agent::chat,
                // Confirmation records
                routes::confirmations::get_records,
                routes::confirmations::fetch_records,
                routes::confirmations::upsert_record,
                routes::confirmations::reset,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../../openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Ack Engine API", "../../../openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    };
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    use crate::agent::AgentContext;
    use crate::config::AppConfig;
    use crate::extract::PdfStringScanner;
    use crate::mail::{
        MailError, MailProvider, MessageHandle, OutgoingMail, ProviderMessage, SentMail,
    };
    use crate::store::{Store, StoreError, run_migrations};

    /// Ephemeral file-backed SQLite database for integration tests.
    pub struct TestDatabase {
        _dir: TempDir,
        pool: SqlitePool,
    }

    impl TestDatabase {
        pub async fn new() -> Result<Self, StoreError> {
            let dir = tempfile::tempdir()
                .map_err(|err| StoreError::Integrity(format!("tempdir: {err}")))?;
            let path = dir.path().join("ack-test.db");

            let options = SqliteConnectOptions::from_str(&format!(
                "sqlite://{}?mode=rwc",
                path.display()
            ))
            .map_err(StoreError::Sqlx)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(250));

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;

            run_migrations(&pool).await?;
            crate::store::ensure_hash_indexes(&pool).await?;

            Ok(Self { _dir: dir, pool })
        }

        pub fn pool(&self) -> &SqlitePool {
            &self.pool
        }

        pub fn pool_clone(&self) -> SqlitePool {
            self.pool.clone()
        }

        pub fn store(&self) -> Store {
            Store::new(self.pool.clone())
        }
    }

    /// Configuration with predictable values for tests.
    pub fn test_config() -> AppConfig {
        AppConfig {
            cron_secret: "test-cron-secret".into(),
            cron_enabled: true,
            buyer_address: "buyer@example.com".into(),
            demo_mode: false,
            demo_recipient: "demo-inbox@example.com".into(),
            mail_client_id: None,
            mail_client_secret: None,
            mail_redirect_uri: None,
            llm_api_key: None,
            llm_api_base: "http://localhost".into(),
            llm_model: "test".into(),
            default_lookback_days: 30,
            inbox_supplier_filter: false,
            allow_reset: true,
        }
    }

    /// Agent context wired to the scripted provider, heuristics-only
    /// extraction, and the given store.
    pub fn test_context(
        store: Store,
        mail: Arc<dyn MailProvider>,
        config: AppConfig,
    ) -> AgentContext {
        AgentContext {
            store,
            mail,
            llm: None,
            pdf: Arc::new(PdfStringScanner),
            config,
        }
    }

    /// In-memory mail provider scripted per test: canned search hits,
    /// messages, threads, and attachment payloads, plus a sent-mail log.
    #[derive(Default)]
    pub struct ScriptedMailProvider {
        search_hits: Vec<MessageHandle>,
        messages: HashMap<String, ProviderMessage>,
        attachments: HashMap<(String, String), String>,
        pub sent: Mutex<Vec<OutgoingMail>>,
        send_counter: AtomicUsize,
    }

    impl ScriptedMailProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a message and make it a search hit.
        pub fn with_message(mut self, message: ProviderMessage) -> Self {
            self.search_hits.push(MessageHandle {
                id: message.id.clone(),
                thread_id: message.thread_id.clone(),
            });
            self.messages.insert(message.id.clone(), message);
            self
        }

        /// Register a message reachable only through its thread.
        pub fn with_thread_message(mut self, message: ProviderMessage) -> Self {
            self.messages.insert(message.id.clone(), message);
            self
        }

        /// Script the payload returned by the attachment endpoint.
        pub fn with_attachment_data(
            mut self,
            message_id: &str,
            provider_attachment_id: &str,
            base64url_data: &str,
        ) -> Self {
            self.attachments.insert(
                (message_id.to_string(), provider_attachment_id.to_string()),
                base64url_data.to_string(),
            );
            self
        }
    }

    #[rocket::async_trait]
    impl MailProvider for ScriptedMailProvider {
        async fn search(
            &self,
            _query: &str,
            max_results: u32,
        ) -> Result<Vec<MessageHandle>, MailError> {
            Ok(self
                .search_hits
                .iter()
                .take(max_results as usize)
                .cloned()
                .collect())
        }

        async fn get_message(&self, message_id: &str) -> Result<ProviderMessage, MailError> {
            self.messages.get(message_id).cloned().ok_or_else(|| {
                MailError::Provider {
                    status: 404,
                    body: format!("message {message_id} not scripted"),
                }
            })
        }

        async fn list_thread(&self, thread_id: &str) -> Result<Vec<ProviderMessage>, MailError> {
            let mut messages: Vec<ProviderMessage> = self
                .messages
                .values()
                .filter(|m| m.thread_id == thread_id)
                .cloned()
                .collect();
            messages.sort_by(|a, b| a.internal_date.cmp(&b.internal_date));
            Ok(messages)
        }

        async fn fetch_attachment(
            &self,
            message_id: &str,
            attachment_id: &str,
        ) -> Result<String, MailError> {
            self.attachments
                .get(&(message_id.to_string(), attachment_id.to_string()))
                .cloned()
                .ok_or_else(|| MailError::Provider {
                    status: 404,
                    body: format!("attachment {attachment_id} not scripted"),
                })
        }

        async fn send(&self, outgoing: &OutgoingMail) -> Result<SentMail, MailError> {
            let n = self.send_counter.fetch_add(1, Ordering::SeqCst) + 1;
            self.sent.lock().await.push(outgoing.clone());
            Ok(SentMail {
                message_id: format!("sent-msg-{n}"),
                thread_id: outgoing
                    .thread_id
                    .clone()
                    .unwrap_or_else(|| format!("sent-thread-{n}")),
            })
        }
    }

    /// Minimal single-stream PDF whose literals the string scanner can read.
    pub fn make_pdf(lines: &[&str]) -> Vec<u8> {
        let mut body = String::from("%PDF-1.4\n1 0 obj\n<< /Length 0 >>\nstream\nBT\n");
        for line in lines {
            body.push_str(&format!("({line}) Tj\n"));
        }
        body.push_str("ET\nendstream\nendobj\n%%EOF\n");
        body.into_bytes()
    }

    /// Provider message with a plain-text body, received `age_days` ago.
    pub fn inbound_message(
        id: &str,
        thread_id: &str,
        from: &str,
        subject: &str,
        body: &str,
        age_days: i64,
    ) -> ProviderMessage {
        use crate::mail::{Header, MessagePart, PartBody};
        use base64::Engine as _;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let received = chrono::Utc::now() - chrono::Duration::days(age_days);
        ProviderMessage {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            snippet: body.chars().take(80).collect(),
            internal_date: Some(received.timestamp_millis().to_string()),
            payload: MessagePart {
                mime_type: "multipart/alternative".into(),
                headers: vec![
                    Header { name: "From".into(), value: from.to_string() },
                    Header { name: "To".into(), value: "buyer@example.com".into() },
                    Header { name: "Subject".into(), value: subject.to_string() },
                ],
                parts: vec![MessagePart {
                    mime_type: "text/plain".into(),
                    body: PartBody {
                        data: Some(URL_SAFE_NO_PAD.encode(body)),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    /// Attach an inline PDF part to a provider message.
    pub fn attach_pdf(message: &mut ProviderMessage, filename: &str, pdf_bytes: &[u8]) {
        use crate::mail::{MessagePart, PartBody};
        use base64::Engine as _;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        message.payload.parts.push(MessagePart {
            mime_type: "application/pdf".into(),
            filename: filename.to_string(),
            body: PartBody {
                attachment_id: Some(format!("prov-{filename}")),
                size: Some(pdf_bytes.len() as i64),
                data: Some(URL_SAFE_NO_PAD.encode(pdf_bytes)),
            },
            ..Default::default()
        });
    }

    /// Builder for constructing Rocket instances tailored for integration
    /// tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        context: Option<AgentContext>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging
        /// disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                context: None,
            }
        }

        /// Mount routes at the root, matching the production layout.
        pub fn mount_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/".to_string(), routes));
            self
        }

        /// Manage an [`AgentContext`] (which also provides the store and
        /// config state used by handlers).
        pub fn manage_context(mut self, context: AgentContext) -> Self {
            self.context = Some(context);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(context) = self.context {
                rocket = rocket
                    .manage(context.store.clone())
                    .manage(context.config.clone())
                    .manage(context);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
