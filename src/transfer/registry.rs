//! The transport context: driver registry, endpoint/resource registry and
//! transfer-template cache.
//!
//! All of it sits behind one coarse mutex. The lock is held for lookups,
//! inserts and template construction, never while data moves.

use super::driver::TransferDriver;
use super::pio::PioDriver;
use super::resources::SharedMemoryResource;
use super::template::TransferTemplate;
use crate::config::TransportConfig;
use crate::endpoint::{Endpoint, EndpointUri, MailboxAllocator};
use crate::error::{Error, Result};
use crate::observability;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct CachedTemplate {
    template: Arc<TransferTemplate>,
    refs: usize,
}

#[derive(Default)]
struct RegistryState {
    refs: usize,
    drivers: Vec<Arc<dyn TransferDriver>>,
    endpoints: HashMap<String, Arc<Endpoint>>,
    resources: HashMap<String, Arc<SharedMemoryResource>>,
    templates: HashMap<(String, String), CachedTemplate>,
    mailboxes: HashMap<String, MailboxAllocator>,
    next_name: u64,
}

impl RegistryState {
    fn find(&self, ep1: &str, ep2: &str) -> Option<Arc<dyn TransferDriver>> {
        self.drivers.iter().find(|d| d.supports(ep1, ep2)).cloned()
    }

    fn mailboxes_for(&mut self, protocol: &str, max: u16, config: &TransportConfig) -> &MailboxAllocator {
        self.mailboxes
            .entry(protocol.to_string())
            .or_insert_with(|| MailboxAllocator::new(protocol, config.first_mailbox, max))
    }

    fn endpoint(&mut self, uri: &str, config: &TransportConfig) -> Result<Arc<Endpoint>> {
        if let Some(ep) = self.endpoints.get(uri) {
            return Ok(Arc::clone(ep));
        }
        let parsed = EndpointUri::parse(uri)?;
        let driver = self
            .find(uri, "")
            .ok_or_else(|| Error::UnsupportedEndpoint(uri.to_string()))?;
        let endpoint = driver.create_endpoint(&parsed, true)?;
        self.mailboxes_for(parsed.protocol(), parsed.max_count(), config)
            .reserve(parsed.mailbox());
        self.endpoints.insert(uri.to_string(), Arc::clone(&endpoint));
        debug!(endpoint = %uri, "registered endpoint");
        Ok(endpoint)
    }
}

/// Process-wide transport state with an explicit lifecycle.
///
/// Construct one per process (or per test), share it as
/// `Arc<TransportContext>`, and bracket use with [`init`](Self::init) /
/// [`shutdown`](Self::shutdown). Operations that touch endpoints fail with
/// [`Error::NotInitialized`] outside that bracket.
pub struct TransportContext {
    config: TransportConfig,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("config", &self.config)
            .field("protocols", &self.supported_protocols())
            .field("templates", &self.template_count())
            .finish()
    }
}

impl TransportContext {
    /// Create a context with no drivers registered.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Create and initialise a context with a memfd-backed [`PioDriver`].
    pub fn with_pio(config: TransportConfig) -> Arc<Self> {
        let ctx = Arc::new(Self::new(config));
        ctx.register(Arc::new(PioDriver::new()));
        ctx.init();
        ctx
    }

    /// Configuration in effect.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Take a reference on the context.
    pub fn init(&self) {
        let mut state = self.state.lock();
        state.refs += 1;
        if state.refs == 1 {
            info!(drivers = state.drivers.len(), "transport context initialised");
        }
    }

    /// Drop a reference. The last one clears every template, resource and endpoint.
    ///
    /// Returns `true` if this call tore the context down.
    pub fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if state.refs == 0 {
            warn!("shutdown of a transport context that is not initialised");
            return false;
        }
        state.refs -= 1;
        if state.refs > 0 {
            return false;
        }

        let templates = state.templates.len();
        state.templates.clear();
        state.resources.clear();
        let endpoints: Vec<String> = state.endpoints.drain().map(|(id, _)| id).collect();
        for id in &endpoints {
            if let Some(driver) = state.find(id, "") {
                driver.forget_endpoint(id);
            }
        }
        state.mailboxes.clear();
        info!(templates, endpoints = endpoints.len(), "transport context shut down");
        true
    }

    /// Whether `init` has been called more often than `shutdown`.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().refs > 0
    }

    fn initialized(&self) -> Result<parking_lot::MutexGuard<'_, RegistryState>> {
        let state = self.state.lock();
        if state.refs == 0 {
            return Err(Error::NotInitialized);
        }
        Ok(state)
    }

    /// Add a driver. Drivers are probed in registration order.
    pub fn register(&self, driver: Arc<dyn TransferDriver>) {
        info!(protocol = %driver.protocol(), "registered transfer driver");
        self.state.lock().drivers.push(driver);
    }

    /// Remove the driver for `protocol`. Returns `false` if none was registered.
    pub fn unregister(&self, protocol: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.drivers.len();
        state.drivers.retain(|d| d.protocol() != protocol);
        let removed = state.drivers.len() != before;
        if removed {
            info!(protocol, "unregistered transfer driver");
        }
        removed
    }

    /// First registered driver supporting both (or the single non-empty) endpoint.
    pub fn find(&self, ep1: &str, ep2: &str) -> Option<Arc<dyn TransferDriver>> {
        self.state.lock().find(ep1, ep2)
    }

    /// Protocols of all registered drivers, in registration order.
    pub fn supported_protocols(&self) -> Vec<String> {
        self.state
            .lock()
            .drivers
            .iter()
            .map(|d| d.protocol().to_string())
            .collect()
    }

    /// Allocate a fresh endpoint string for `protocol` (empty means the first driver).
    ///
    /// The endpoint itself is created on first use.
    pub fn allocate_endpoint(&self, protocol: &str) -> Result<String> {
        let mut state = self.initialized()?;
        let driver = match protocol {
            "" => state.drivers.first().cloned(),
            _ => state.find(protocol, ""),
        };
        let driver = driver.ok_or_else(|| Error::UnsupportedEndpoint(protocol.to_string()))?;

        let max = self.config.max_mailbox;
        let mailbox = state
            .mailboxes_for(driver.protocol(), max, &self.config)
            .next()?;
        state.next_name += 1;
        let name = format!("conduit-{}-{}", std::process::id(), state.next_name);
        let uri = driver.allocate_endpoint(&name, self.config.smb_size, mailbox, max);
        debug!(endpoint = %uri, "allocated endpoint");
        Ok(uri)
    }

    /// Allocate an endpoint able to talk to `remote` (same protocol and
    /// mailbox domain, different mailbox).
    pub fn allocate_compatible_endpoint(&self, remote: &str) -> Result<String> {
        let remote = EndpointUri::parse(remote)?;
        let mut state = self.initialized()?;
        let driver = state
            .find(remote.protocol(), "")
            .ok_or_else(|| Error::UnsupportedEndpoint(remote.to_string()))?;
        let mailbox = state
            .mailboxes_for(remote.protocol(), remote.max_count(), &self.config)
            .new_compatible(remote.mailbox())?;
        state.next_name += 1;
        let name = format!("conduit-{}-{}", std::process::id(), state.next_name);
        Ok(driver.allocate_endpoint(&name, remote.size(), mailbox, remote.max_count()))
    }

    /// Get or create the endpoint for `uri`.
    pub fn endpoint(&self, uri: &str) -> Result<Arc<Endpoint>> {
        let mut state = self.initialized()?;
        state.endpoint(uri, &self.config)
    }

    /// Register an endpoint created elsewhere (e.g. attached over a socket).
    pub fn register_endpoint(&self, endpoint: Arc<Endpoint>) -> Result<()> {
        let mut state = self.initialized()?;
        state
            .mailboxes_for(endpoint.protocol(), endpoint.max_count(), &self.config)
            .reserve(endpoint.mailbox());
        state.endpoints.insert(endpoint.id().to_string(), endpoint);
        Ok(())
    }

    /// Get or create the communication resources of `uri`.
    pub fn resources(&self, uri: &str) -> Result<Arc<SharedMemoryResource>> {
        let mut state = self.initialized()?;
        if let Some(res) = state.resources.get(uri) {
            return Ok(Arc::clone(res));
        }
        let endpoint = state.endpoint(uri, &self.config)?;
        let res = Arc::new(SharedMemoryResource::new(endpoint)?);
        state.resources.insert(uri.to_string(), Arc::clone(&res));
        Ok(res)
    }

    /// Drop the registry's hold on `uri`'s resources and endpoint.
    ///
    /// Ports and templates still holding the endpoint keep it mapped.
    pub fn release_resources(&self, uri: &str) -> bool {
        let mut state = self.state.lock();
        let had = state.resources.remove(uri).is_some();
        if let Some(ep) = state.endpoints.remove(uri) {
            if let Some(alloc) = state.mailboxes.get(ep.protocol()) {
                alloc.release(ep.mailbox());
            }
        }
        had
    }

    /// The template moving data from `src` to `dst`.
    ///
    /// At most one template exists per ordered pair: concurrent callers get
    /// the same `Arc`, and the driver is asked to build it once. Each call
    /// takes a reference released by [`release_service`](Self::release_service).
    pub fn get_service(&self, src: &str, dst: &str) -> Result<Arc<TransferTemplate>> {
        let mut state = self.initialized()?;
        let key = (src.to_string(), dst.to_string());
        if let Some(cached) = state.templates.get_mut(&key) {
            cached.refs += 1;
            return Ok(Arc::clone(&cached.template));
        }

        let driver = state
            .find(src, dst)
            .ok_or_else(|| Error::UnsupportedEndpoint(format!("{src} -> {dst}")))?;
        let source = state.endpoint(src, &self.config)?;
        let target = state.endpoint(dst, &self.config)?;
        let template = Arc::new(driver.create_template(&source, &target)?);
        state.templates.insert(
            key,
            CachedTemplate {
                template: Arc::clone(&template),
                refs: 1,
            },
        );
        observability::record_template_created(driver.protocol());
        info!(
            source = %src,
            target = %dst,
            creation_id = template.creation_id(),
            "created transfer template"
        );
        Ok(template)
    }

    /// Release one reference on the `src -> dst` template.
    ///
    /// Returns the remaining reference count; the template leaves the cache at zero.
    pub fn release_service(&self, src: &str, dst: &str) -> usize {
        let mut state = self.state.lock();
        let key = (src.to_string(), dst.to_string());
        let Some(cached) = state.templates.get_mut(&key) else {
            return 0;
        };
        cached.refs = cached.refs.saturating_sub(1);
        let remaining = cached.refs;
        if remaining == 0 {
            state.templates.remove(&key);
            debug!(source = %src, target = %dst, "released transfer template");
        }
        remaining
    }

    /// Number of cached templates.
    pub fn template_count(&self) -> usize {
        self.state.lock().templates.len()
    }

    /// Reference count of the `src -> dst` template (0 if not cached).
    pub fn template_refs(&self, src: &str, dst: &str) -> usize {
        self.state
            .lock()
            .templates
            .get(&(src.to_string(), dst.to_string()))
            .map_or(0, |c| c.refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::PioBacking;

    fn context() -> TransportContext {
        let ctx = TransportContext::new(TransportConfig::default().with_smb_size(64 * 1024));
        ctx.register(Arc::new(PioDriver::heap()));
        ctx.init();
        ctx
    }

    #[test]
    fn test_not_initialized() {
        let ctx = TransportContext::new(TransportConfig::default());
        ctx.register(Arc::new(PioDriver::heap()));
        assert!(matches!(ctx.allocate_endpoint(""), Err(Error::NotInitialized)));
        assert!(!ctx.shutdown());
    }

    #[test]
    fn test_allocate_endpoint_mailboxes() {
        let ctx = context();
        let a = EndpointUri::parse(&ctx.allocate_endpoint("").unwrap()).unwrap();
        let b = EndpointUri::parse(&ctx.allocate_endpoint("ocpi-smb-pio").unwrap()).unwrap();
        assert_eq!(a.protocol(), "ocpi-smb-pio");
        assert_eq!(a.mailbox(), 1);
        assert_eq!(b.mailbox(), 2);
        assert_eq!(a.size(), 64 * 1024);
        assert!(a.can_support(&b));
        assert!(matches!(
            ctx.allocate_endpoint("ocpi-dma"),
            Err(Error::UnsupportedEndpoint(_))
        ));
    }

    #[test]
    fn test_compatible_endpoint() {
        let ctx = context();
        let uri = ctx
            .allocate_compatible_endpoint("ocpi-smb-pio:remote:65536.1.20")
            .unwrap();
        let parsed = EndpointUri::parse(&uri).unwrap();
        assert_ne!(parsed.mailbox(), 1);
        assert_eq!(parsed.max_count(), 20);
    }

    #[test]
    fn test_template_refcount() {
        let ctx = context();
        let a = ctx.allocate_endpoint("").unwrap();
        let b = ctx.allocate_endpoint("").unwrap();
        let t1 = ctx.get_service(&a, &b).unwrap();
        let t2 = ctx.get_service(&a, &b).unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
        assert_eq!(ctx.template_refs(&a, &b), 2);

        let back = ctx.get_service(&b, &a).unwrap();
        assert!(!Arc::ptr_eq(&t1, &back));
        assert_eq!(ctx.template_count(), 2);

        assert_eq!(ctx.release_service(&a, &b), 1);
        assert_eq!(ctx.release_service(&a, &b), 0);
        assert_eq!(ctx.template_count(), 1);
        assert_eq!(ctx.release_service(&a, &b), 0);
    }

    #[test]
    fn test_endpoint_and_resources_cached() {
        let ctx = context();
        let a = ctx.allocate_endpoint("").unwrap();
        let e1 = ctx.endpoint(&a).unwrap();
        let e2 = ctx.endpoint(&a).unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
        let r1 = ctx.resources(&a).unwrap();
        let r2 = ctx.resources(&a).unwrap();
        assert!(Arc::ptr_eq(&r1, &r2));
        assert!(ctx.release_resources(&a));
        assert!(!ctx.release_resources(&a));
    }

    #[test]
    fn test_shutdown_refcounted() {
        let ctx = context();
        ctx.init();
        let a = ctx.allocate_endpoint("").unwrap();
        let b = ctx.allocate_endpoint("").unwrap();
        ctx.get_service(&a, &b).unwrap();

        assert!(!ctx.shutdown());
        assert_eq!(ctx.template_count(), 1);
        assert!(ctx.shutdown());
        assert_eq!(ctx.template_count(), 0);
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn test_unregister() {
        let ctx = context();
        ctx.register(Arc::new(PioDriver::with_protocol("ocpi-smb-alt", PioBacking::Heap)));
        assert_eq!(ctx.supported_protocols(), vec!["ocpi-smb-pio", "ocpi-smb-alt"]);
        assert!(ctx.unregister("ocpi-smb-pio"));
        assert!(!ctx.unregister("ocpi-smb-pio"));
        assert!(ctx.find("ocpi-smb-pio:x:100.1.20", "").is_none());
        assert!(ctx.find("ocpi-smb-alt:x:100.1.20", "").is_some());
    }
}
