#[macro_use]
extern crate rocket;

pub mod config;
pub mod error;
pub mod health;
pub mod imap;
pub mod indexer;
pub mod models;
pub mod pipeline;
pub mod request_logger;
pub mod retry;
pub mod routes;
pub mod service;
pub mod store;
pub mod supervisor;

use crate::config::AppConfig;
use crate::imap::ImapConnector;
use crate::request_logger::RequestLogger;
use crate::service::{IngestService, connect_store};
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
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

/// Every route of the operator API, with its OpenAPI document.
pub fn api_routes() -> Vec<rocket::Route> {
    openapi_get_routes![
        routes::health::health_check,
        routes::accounts::list_accounts,
        routes::accounts::get_account,
        routes::accounts::reconnect_all,
        routes::accounts::reconnect_account,
        routes::index::get_index_stats,
    ]
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let mut rocket = rocket::build().attach(RequestLogger);

    match CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .to_cors()
    {
        Ok(cors) => rocket = rocket.attach(cors),
        Err(err) => log::error!("CORS disabled, invalid options: {}", err),
    }

    rocket
        .attach(AdHoc::try_on_ignite(
            "Ingestion Services",
            |rocket| async move {
                let config = match AppConfig::from_env() {
                    Ok(config) => config,
                    Err(err) => {
                        log::error!("invalid configuration: {}", err);
                        return Err(rocket);
                    }
                };

                let store = match connect_store(&config).await {
                    Ok(store) => store,
                    Err(err) => {
                        log::error!("document store not reachable: {}", err);
                        return Err(rocket);
                    }
                };

                let connector = Arc::new(ImapConnector::new(config.imap.clone()));
                let service = IngestService::new(&config, store, connector);
                log::info!(
                    "ingestion configured for {} account(s), batch size {}",
                    config.accounts.len(),
                    config.indexer.batch_size
                );

                Ok(rocket
                    .manage(service.supervisor().clone())
                    .manage(service.indexer().clone())
                    .manage(service))
            },
        ))
        .attach(AdHoc::on_liftoff("Start Ingestion", |rocket| {
            Box::pin(async move {
                match rocket.state::<IngestService>() {
                    Some(service) => {
                        if let Err(err) = service.start() {
                            log::error!("failed to register mail accounts: {}", err);
                        }
                    }
                    None => log::error!("ingest service not available at liftoff"),
                }
            })
        }))
        .attach(AdHoc::on_shutdown("Stop Ingestion", |rocket| {
            Box::pin(async move {
                if let Some(service) = rocket.state::<IngestService>() {
                    service.stop().await;
                }
            })
        }))
        .mount("/api/v1", api_routes())
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Inbox Indexer API", "../../v1/openapi.json")],
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
    use crate::models::{Category, EmailDocument, MailAccount};
    use crate::supervisor::{SessionConnector, SessionSink};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    pub use elasticsearch::TestElasticsearch;

    /// A mailbox account pointing nowhere, for supervisor tests.
    pub fn test_account(id: &str) -> MailAccount {
        MailAccount {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            host: "imap.example.com".to_string(),
            port: 993,
            user: format!("{id}@example.com"),
            password: "app-password".to_string(),
            tls: true,
        }
    }

    pub fn test_document(account_id: &str, id: &str) -> EmailDocument {
        let date = Utc
            .with_ymd_and_hms(2024, 5, 14, 10, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        EmailDocument {
            id: id.to_string(),
            account_id: account_id.to_string(),
            folder: "INBOX".to_string(),
            subject: format!("Message {id}"),
            body: format!("Body of {id}"),
            from: "Sender <sender@example.com>".to_string(),
            to: vec![format!("{account_id}@example.com")],
            cc: None,
            date,
            ai_category: Category::Uncategorized,
            indexed_at: date,
            has_attachments: false,
            flags: Vec::new(),
        }
    }

    /// What one scripted session attempt does.
    #[derive(Debug, Clone)]
    pub enum SessionScript {
        /// Report ready and stay connected until cancelled.
        Ready,
        /// Report an error and return.
        Error(String),
        /// Report a graceful end and return.
        End,
        /// Report a stall, then linger until the supervisor closes the session.
        Timeout,
        /// Return without reporting anything.
        Exit,
        /// Never report, wait to be cancelled.
        Hang,
        /// Report ready, deliver the documents, stay connected.
        Deliver(Vec<EmailDocument>),
    }

    /// [`SessionConnector`] replaying per-account scripts, one step per attempt.
    /// Accounts without a script (or with an exhausted one) use the fallback.
    pub struct ScriptedConnector {
        fallback: SessionScript,
        scripts: Mutex<HashMap<String, VecDeque<SessionScript>>>,
        attempts: Mutex<HashMap<String, Vec<Instant>>>,
        cancelled: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedConnector {
        pub fn new(fallback: SessionScript) -> Self {
            Self {
                fallback,
                scripts: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashMap::new()),
            }
        }

        pub fn script(&self, account_id: &str, steps: impl IntoIterator<Item = SessionScript>) {
            self.scripts
                .lock()
                .entry(account_id.to_string())
                .or_default()
                .extend(steps);
        }

        /// When each attempt for `account_id` started.
        pub fn attempts(&self, account_id: &str) -> Vec<Instant> {
            self.attempts
                .lock()
                .get(account_id)
                .cloned()
                .unwrap_or_default()
        }

        pub fn attempt_count(&self, account_id: &str) -> usize {
            self.attempts
                .lock()
                .get(account_id)
                .map_or(0, Vec::len)
        }

        /// Sessions that were still open when the supervisor cancelled them.
        pub fn cancelled_sessions(&self, account_id: &str) -> usize {
            self.cancelled.lock().get(account_id).copied().unwrap_or(0)
        }

        fn next_step(&self, account_id: &str) -> SessionScript {
            self.attempts
                .lock()
                .entry(account_id.to_string())
                .or_default()
                .push(Instant::now());
            self.scripts
                .lock()
                .get_mut(account_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| self.fallback.clone())
        }

        async fn linger(&self, account_id: &str, shutdown: &CancellationToken) {
            shutdown.cancelled().await;
            *self
                .cancelled
                .lock()
                .entry(account_id.to_string())
                .or_default() += 1;
        }
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        async fn run(&self, account: Arc<MailAccount>, sink: SessionSink, shutdown: CancellationToken) {
            match self.next_step(&account.id) {
                SessionScript::Ready => {
                    sink.ready();
                    self.linger(&account.id, &shutdown).await;
                }
                SessionScript::Error(cause) => sink.error(cause),
                SessionScript::End => sink.end(),
                SessionScript::Timeout => {
                    sink.timeout();
                    self.linger(&account.id, &shutdown).await;
                }
                SessionScript::Exit => {}
                SessionScript::Hang => self.linger(&account.id, &shutdown).await,
                SessionScript::Deliver(documents) => {
                    sink.ready();
                    for document in documents {
                        sink.deliver(document);
                    }
                    self.linger(&account.id, &shutdown).await;
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        managed: Vec<Box<dyn FnOnce(Rocket<Build>) -> Rocket<Build> + Send>>,
    }

    impl Default for TestRocketBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                managed: Vec::new(),
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Hand `state` to Rocket so handlers can take it as `&State<T>`.
        pub fn manage<T: Send + Sync + 'static>(mut self, state: T) -> Self {
            self.managed.push(Box::new(move |rocket| rocket.manage(state)));
            self
        }

        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }
            for manage in self.managed {
                rocket = manage(rocket);
            }

            rocket
        }

        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }

    pub mod elasticsearch {
        use testcontainers::core::error::TestcontainersError;
        use testcontainers::core::{IntoContainerPort, WaitFor};
        use testcontainers::runners::AsyncRunner;
        use testcontainers::{ContainerAsync, GenericImage, ImageExt};

        const IMAGE: &str = "docker.elastic.co/elasticsearch/elasticsearch";
        const TAG: &str = "8.15.3";

        /// Disposable single-node Elasticsearch with security disabled.
        /// The container is removed when this value is dropped.
        pub struct TestElasticsearch {
            url: String,
            _container: ContainerAsync<GenericImage>,
        }

        impl TestElasticsearch {
            pub async fn start() -> Result<Self, TestcontainersError> {
                let container = GenericImage::new(IMAGE, TAG)
                    .with_exposed_port(9200.tcp())
                    .with_wait_for(WaitFor::message_on_stdout("\"started"))
                    .with_env_var("discovery.type", "single-node")
                    .with_env_var("xpack.security.enabled", "false")
                    .with_env_var("ES_JAVA_OPTS", "-Xms512m -Xmx512m")
                    .start()
                    .await?;

                let host = container.get_host().await?;
                let port = container.get_host_port_ipv4(9200).await?;

                Ok(Self {
                    url: format!("http://{host}:{port}"),
                    _container: container,
                })
            }

            pub fn url(&self) -> &str {
                &self.url
            }
        }
    }
}
