//! Proxy server implementation
//! Owns the rule table, the active listener and the forwarding engine, and
//! applies rule and configuration changes while traffic keeps flowing.

use crate::api;
use crate::certificate::CertificateManager;
use crate::config::{LogLevel, ProxyConfig};
use crate::error::ProxyError;
use crate::forward::{classify, ForwardEngine, ProbeReport};
use crate::listener::{ConnContext, Listener, RequestHandler};
use crate::relay::RelayMode;
use crate::response::{error_response, ProxyBody};
use crate::router::{request_host, Router};
use crate::rules::{Rule, RuleTable};
use crate::store::ConfigStore;
use crate::tls::TlsTerminator;
use async_trait::async_trait;
use futures_util::future::join_all;
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Called whenever an applied config changes the log level
pub type LogLevelHook = Arc<dyn Fn(LogLevel) + Send + Sync>;

/// Collaborators the server talks to but does not own
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Where committed configurations are saved; `None` keeps them in memory
    pub store: Option<Arc<dyn ConfigStore>>,
    /// Source of the self-signed pair when HTTPS is enabled without paths
    pub certificates: Option<CertificateManager>,
    pub log_hook: Option<LogLevelHook>,
}

/// Result of a mutation that was applied in memory. `warning` is set when
/// the change could not be persisted.
#[derive(Debug, Clone)]
pub struct Applied<T> {
    pub value: T,
    pub warning: Option<String>,
}

impl<T> Applied<T> {
    fn new(value: T, persisted: Result<(), ProxyError>) -> Self {
        Self {
            value,
            warning: persisted.err().map(|e| e.to_string()),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Applied<U> {
        Applied {
            value: f(self.value),
            warning: self.warning,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    me: Weak<ProxyServer>,
    rules: Arc<RuleTable>,
    router: Router,
    /// Everything but the rules, which live in `rules`
    settings: RwLock<ProxyConfig>,
    engine: RwLock<Arc<ForwardEngine>>,
    options: ServerOptions,
    /// Held for the whole of a config apply, which serializes them
    listener: AsyncMutex<Option<Arc<Listener>>>,
    /// Closed generations whose connections are still running
    retired: Mutex<Vec<Arc<Listener>>>,
    bound: RwLock<Option<SocketAddr>>,
    persist_lock: AsyncMutex<()>,
}

impl ProxyServer {
    /// Validate `config`, bind the listener and start serving.
    ///
    /// TLS problems are fatal here; after startup they only reject the change.
    pub async fn start(config: ProxyConfig, options: ServerOptions) -> Result<Arc<Self>, ProxyError> {
        let mut config = config;
        let generated = prepare_https(&mut config, &options)?;
        config.validate()?;

        let rules = config.rules()?;
        let tls = terminator_for(&config)?;
        let engine = Arc::new(ForwardEngine::new(config.upstream.clone())?);
        let table = Arc::new(RuleTable::from_rules(rules));
        let listen_addr = config.listen_addr();
        config.proxy_rules.clear();

        let server = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            router: Router::new(table.clone()),
            rules: table,
            settings: RwLock::new(config),
            engine: RwLock::new(engine),
            options,
            listener: AsyncMutex::new(None),
            retired: Mutex::new(Vec::new()),
            bound: RwLock::new(None),
            persist_lock: AsyncMutex::new(()),
        });

        let listener = Listener::bind(&listen_addr, tls, server.clone()).await?;
        *server.bound.write() = Some(listener.local_addr());
        *server.listener.lock().await = Some(Arc::new(listener));

        if generated {
            if let Err(e) = server.persist().await {
                warn!("Generated certificate paths were not saved: {}", e);
            }
        }

        info!(rules = server.rules.len(), "Proxy started");
        Ok(server)
    }

    /// Stop accepting, drain every listener generation and wait for it
    pub async fn stop(&self) {
        let grace = self.settings.read().shutdown_grace();
        let current = self.listener.lock().await.take();
        let mut listeners: Vec<Arc<Listener>> = std::mem::take(&mut *self.retired.lock());
        listeners.extend(current);

        join_all(listeners.iter().map(|listener| listener.drain(grace))).await;
        *self.bound.write() = None;
        info!("Proxy stopped");
    }

    /// Address the active listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.read()
    }

    pub fn is_tls(&self) -> bool {
        self.settings.read().https.enabled
    }

    /// Current configuration, rules included
    pub fn config(&self) -> ProxyConfig {
        let settings = self.settings.read();
        let mut snapshot = settings.clone();
        snapshot.proxy_rules = self.rules.snapshot();
        snapshot
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.list()
    }

    /// Add or overwrite a rule. Takes effect for the next request.
    pub async fn upsert_rule(&self, source: &str, target: &str) -> Result<Applied<Rule>, ProxyError> {
        let rule = Rule::new(source, target)?;
        match self.rules.upsert(rule.clone()) {
            Some(previous) if previous == rule.target => debug!("Rule unchanged: {}", rule.source),
            Some(previous) => info!("Rule updated: {} -> {} (was {})", rule.source, rule.target, previous),
            None => info!("Rule added: {} -> {}", rule.source, rule.target),
        }
        Ok(Applied::new(rule, self.persist().await))
    }

    /// Remove a rule. Removing an absent rule is not an error.
    pub async fn delete_rule(&self, source: &str) -> Applied<bool> {
        if !self.rules.delete(source) {
            debug!("No rule to delete for '{}'", source);
            return Applied::new(false, Ok(()));
        }
        info!("Rule deleted: {}", source.trim().to_ascii_lowercase());
        Applied::new(true, self.persist().await)
    }

    /// Replace the whole configuration.
    ///
    /// Everything is validated before anything changes. When the listener
    /// has to change, the replacement is bound first; if that fails the
    /// change is rejected and the running listener keeps serving.
    pub async fn apply_config(&self, next: ProxyConfig) -> Result<Applied<ProxyConfig>, ProxyError> {
        let mut slot = self.listener.lock().await;

        let mut next = next;
        prepare_https(&mut next, &self.options)?;
        next.validate()?;
        let rules = next.rules()?;

        let current = self.settings.read().clone();
        let engine = if next.upstream != current.upstream {
            Some(Arc::new(ForwardEngine::new(next.upstream.clone())?))
        } else {
            None
        };

        if current.listener_changed(&next) {
            let tls = terminator_for(&next)?;
            self.rebind(&mut slot, &current, &next, tls).await?;
        }

        let level_changed = current.log_level != next.log_level;
        let level = next.log_level;
        next.proxy_rules.clear();
        {
            let mut settings = self.settings.write();
            self.rules.replace_all(rules);
            if let Some(engine) = engine {
                *self.engine.write() = engine;
            }
            *settings = next;
        }
        drop(slot);

        if level_changed {
            if let Some(hook) = &self.options.log_hook {
                hook(level);
            }
            info!("Log level set to {}", level);
        }
        info!(rules = self.rules.len(), "Configuration applied");

        Ok(Applied::new(self.config(), self.persist().await))
    }

    /// One-off diagnostic GET through the upstream client
    pub async fn test_forward(&self, url: &str) -> Result<ProbeReport, ProxyError> {
        self.engine().probe(url).await
    }

    fn engine(&self) -> Arc<ForwardEngine> {
        self.engine.read().clone()
    }

    fn handler(&self) -> Result<Arc<dyn RequestHandler>, ProxyError> {
        match self.me.upgrade() {
            Some(server) => Ok(server as Arc<dyn RequestHandler>),
            None => Err(ProxyError::InvalidConfig("proxy is shutting down".into())),
        }
    }

    async fn rebind(
        &self,
        slot: &mut Option<Arc<Listener>>,
        current: &ProxyConfig,
        next: &ProxyConfig,
        tls: Option<TlsTerminator>,
    ) -> Result<(), ProxyError> {
        let handler = self.handler()?;
        let same_socket = current.port == next.port && current.bind_address == next.bind_address;

        let old = match slot.take() {
            Some(old) => old,
            None => {
                let listener = Listener::bind(&next.listen_addr(), tls, handler).await?;
                self.install(slot, listener);
                return Ok(());
            }
        };

        if !same_socket {
            let listener = match Listener::bind(&next.listen_addr(), tls, handler).await {
                Ok(listener) => listener,
                Err(e) => {
                    *slot = Some(old);
                    return Err(e);
                }
            };
            self.install(slot, listener);

            info!("Moved from {} to {}", old.local_addr(), next.listen_addr());
            self.park(old.clone());
            let grace = current.shutdown_grace();
            tokio::spawn(async move { old.drain(grace).await });
            return Ok(());
        }

        // Same socket address: the old socket has to be released first.
        let addr = old.local_addr().to_string();
        old.close().await;
        match Listener::bind(&addr, tls, handler.clone()).await {
            Ok(listener) => {
                self.install(slot, listener);
                self.park(old.clone());
                let grace = current.shutdown_grace();
                tokio::spawn(async move { old.retire(grace).await });
                Ok(())
            }
            Err(e) => {
                warn!("Rebinding {} failed, restoring previous listener: {}", addr, e);
                match Listener::bind(&addr, old.tls(), handler).await {
                    Ok(restored) => self.install(slot, restored),
                    Err(e) => {
                        error!("Failed to restore listener on {}: {}", addr, e);
                        *self.bound.write() = None;
                    }
                }
                self.park(old);
                Err(e)
            }
        }
    }

    fn install(&self, slot: &mut Option<Arc<Listener>>, listener: Listener) {
        *self.bound.write() = Some(listener.local_addr());
        *slot = Some(Arc::new(listener));
    }

    /// Keep an old generation around so `stop()` can still drain it
    fn park(&self, listener: Arc<Listener>) {
        let mut retired = self.retired.lock();
        retired.push(listener);
        retired.retain(|l| l.active_connections() > 0);
    }

    /// Save the current snapshot. Saves are serialized so the last one
    /// written always reflects the latest state.
    async fn persist(&self) -> Result<(), ProxyError> {
        let Some(store) = &self.options.store else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.config();
        store.save(&snapshot).await.map_err(|e| {
            warn!("Failed to persist config: {}", e);
            ProxyError::ConfigPersist(e.to_string())
        })
    }

    async fn dispatch(&self, req: Request<Incoming>, ctx: &ConnContext) -> Result<Response<ProxyBody>, ProxyError> {
        if req.method() == Method::CONNECT {
            return Err(ProxyError::MethodNotSupported(format!("CONNECT {}", req.uri())));
        }

        let management = api::is_management_path(req.uri().path());
        let host = match request_host(&req) {
            Some(host) => host,
            None if management => return Ok(api::handle(self, req).await),
            None => return Err(ProxyError::BadRequest("missing Host header".into())),
        };

        match self.router.resolve(&host) {
            Ok(target) => {
                let engine = self.engine();
                let response = engine.forward(req, &target, ctx.shutdown_signal()).await?;
                if classify(response.headers()) == RelayMode::Streaming {
                    ctx.mark_streaming();
                }
                Ok(response)
            }
            Err(_) if management => Ok(api::handle(self, req).await),
            Err(no_route) => Err(no_route),
        }
    }
}

#[async_trait]
impl RequestHandler for ProxyServer {
    async fn handle(&self, req: Request<Incoming>, ctx: ConnContext) -> Response<ProxyBody> {
        let span = info_span!("request", id = %Uuid::new_v4(), remote = %ctx.remote_addr);
        async move {
            match self.dispatch(req, &ctx).await {
                Ok(response) => response,
                Err(e) => {
                    report(&e);
                    error_response(&e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn report(err: &ProxyError) {
    match err {
        ProxyError::NoRoute { host, .. } => warn!("No route for host '{}'", host),
        ProxyError::UpstreamUnreachable { .. } => error!("{}", err),
        ProxyError::UpstreamTimeout { .. } | ProxyError::PayloadTooLarge { .. } => warn!("{}", err),
        ProxyError::MethodNotSupported(_) => info!("Rejected: {}", err),
        _ => debug!("Request failed: {}", err),
    }
}

fn terminator_for(config: &ProxyConfig) -> Result<Option<TlsTerminator>, ProxyError> {
    if config.https.enabled {
        TlsTerminator::from_config(&config.https).map(Some)
    } else {
        Ok(None)
    }
}

/// Fill in self-signed certificate paths when HTTPS is enabled without
/// them. Returns whether paths were filled in.
fn prepare_https(config: &mut ProxyConfig, options: &ServerOptions) -> Result<bool, ProxyError> {
    let https = &config.https;
    if !https.enabled || !https.auto_generate || (https.cert_path.is_some() && https.key_path.is_some()) {
        return Ok(false);
    }
    let Some(certificates) = &options.certificates else {
        return Ok(false);
    };

    let domains: Vec<String> = config.proxy_rules.keys().map(|s| s.to_ascii_lowercase()).collect();
    let (cert_path, key_path) = certificates.ensure(domains.as_slice())?;
    config.https.cert_path = Some(cert_path);
    config.https.key_path = Some(key_path);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpsConfig;
    use crate::store::{JsonFileStore, StoreError};
    use tempfile::tempdir;

    fn local_config() -> ProxyConfig {
        ProxyConfig {
            port: 0,
            bind_address: "127.0.0.1".into(),
            shutdown_grace_ms: 200,
            ..ProxyConfig::default()
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ConfigStore for BrokenStore {
        async fn save(&self, _config: &ProxyConfig) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: "/read-only/config.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test]
    async fn test_rule_mutations_are_persisted() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("config.json")));
        let options = ServerOptions {
            store: Some(store.clone()),
            ..ServerOptions::default()
        };
        let server = ProxyServer::start(local_config(), options).await.unwrap();

        let applied = server.upsert_rule("API.local", "api.example.com").await.unwrap();
        assert_eq!(applied.value.source, "api.local");
        assert!(applied.warning.is_none());
        assert_eq!(store.load().unwrap().proxy_rules["api.local"], "api.example.com");

        assert!(server.delete_rule("api.local").await.value);
        assert!(!server.delete_rule("api.local").await.value);
        assert!(store.load().unwrap().proxy_rules.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_persist_failure_is_a_warning() {
        let options = ServerOptions {
            store: Some(Arc::new(BrokenStore)),
            ..ServerOptions::default()
        };
        let server = ProxyServer::start(local_config(), options).await.unwrap();

        let applied = server.upsert_rule("api.local", "api.example.com").await.unwrap();
        assert!(applied.warning.unwrap().contains("read-only"));
        assert_eq!(server.list_rules().len(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_state_untouched() {
        let server = ProxyServer::start(local_config(), ServerOptions::default()).await.unwrap();
        server.upsert_rule("api.local", "api.example.com").await.unwrap();
        let before = server.config();

        let mut bad = before.clone();
        bad.proxy_rules.insert("web.local".into(), "https://web.example.com".into());
        assert!(matches!(
            server.apply_config(bad).await,
            Err(ProxyError::InvalidRuleInput(_))
        ));

        let mut bad_tls = before.clone();
        bad_tls.https = HttpsConfig {
            enabled: true,
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            auto_generate: false,
        };
        assert!(matches!(
            server.apply_config(bad_tls).await,
            Err(ProxyError::TlsConfig(_))
        ));

        assert_eq!(server.config(), before);
        assert!(!server.is_tls());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_apply_replaces_rules_and_calls_log_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook: LogLevelHook = {
            let seen = seen.clone();
            Arc::new(move |level| seen.lock().push(level))
        };
        let options = ServerOptions {
            log_hook: Some(hook),
            ..ServerOptions::default()
        };
        let server = ProxyServer::start(local_config(), options).await.unwrap();
        server.upsert_rule("old.local", "old.example.com").await.unwrap();

        let mut next = server.config();
        next.proxy_rules.clear();
        next.proxy_rules.insert("new.local".into(), "new.example.com:8443".into());
        next.log_level = LogLevel::Debug;

        let applied = server.apply_config(next).await.unwrap();
        assert_eq!(applied.value.proxy_rules.len(), 1);
        assert_eq!(server.list_rules()[0].source, "new.local");
        assert_eq!(seen.lock().as_slice(), &[LogLevel::Debug]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_auto_generated_certificate() {
        let dir = tempdir().unwrap();
        let options = ServerOptions {
            certificates: Some(CertificateManager::new(dir.path()).unwrap()),
            ..ServerOptions::default()
        };
        let mut config = local_config();
        config.https.enabled = true;
        config.proxy_rules.insert("api.local".into(), "api.example.com".into());

        let server = ProxyServer::start(config, options).await.unwrap();
        assert!(server.is_tls());
        assert_eq!(server.config().https.cert_path, Some(dir.path().join("cert.pem")));

        server.stop().await;
        assert!(server.local_addr().is_none());
    }
}
