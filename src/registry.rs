//! Reference-counted sharing of endpoints between clients asking for the same configuration.
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::StreamId;
use crate::config::{EndpointOptions, StreamConfig};
use crate::endpoint::{EndpointStatus, ServiceEndpoint};
use crate::hardware::HardwareFactory;
use crate::{EndpointError, push_log};

struct RegistryInner {
    factory: Arc<dyn HardwareFactory>,
    options: EndpointOptions,
    endpoints: Mutex<Vec<Arc<ServiceEndpoint>>>,
}

impl RegistryInner {
    fn release(&self, endpoint: &Arc<ServiceEndpoint>) {
        let mut endpoints = self.endpoints.lock();
        let count = endpoint.reference_count().saturating_sub(1);
        endpoint.set_reference_count(count);
        debug!(
            device = endpoint.config().device_id,
            reference_count = count,
            "endpoint released"
        );
        if count > 0 {
            return;
        }
        endpoints.retain(|e| !Arc::ptr_eq(e, endpoint));
        if endpoint.is_open() {
            if let Err(err) = endpoint.close() {
                warn!(%err, "closing released endpoint failed");
            }
        }
        push_log(format!(
            "endpoint {} released and closed",
            endpoint.config().device_id
        ));
    }
}

/// Owns every shared endpoint of one audio server context.
///
/// Acquire and release are serialized by a single lock so two clients can never race to open
/// the same hardware twice, or close it while another is joining.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<RegistryInner>,
}

impl EndpointRegistry {
    /// Registry opening hardware through `factory` with `options` for every endpoint.
    pub fn new(factory: Arc<dyn HardwareFactory>, options: EndpointOptions) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                factory,
                options,
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Share an open endpoint matching `config`, opening a new one if none fits.
    ///
    /// Endpoints that were disconnected or faulted are never handed out again; the next
    /// acquire opens a fresh hardware stream instead.
    pub fn acquire(&self, config: &StreamConfig) -> Result<EndpointHandle, EndpointError> {
        let mut endpoints = self.inner.endpoints.lock();

        if let Some(endpoint) = endpoints
            .iter()
            .find(|e| e.is_usable() && e.config().matches(config))
        {
            let count = endpoint.reference_count() + 1;
            endpoint.set_reference_count(count);
            debug!(
                device = config.device_id,
                reference_count = count,
                "sharing existing endpoint"
            );
            return Ok(EndpointHandle::new(self.inner.clone(), endpoint.clone()));
        }

        let hardware = self.inner.factory.create(config);
        let endpoint = Arc::new(ServiceEndpoint::new(
            config.clone(),
            self.inner.options.clone(),
            hardware,
        ));
        endpoint.open()?;
        endpoint.set_reference_count(1);
        endpoints.push(endpoint.clone());
        info!(
            device = config.device_id,
            sample_rate = config.sample_rate,
            channels = config.channel_count,
            open_endpoints = endpoints.len(),
            "opened shared endpoint"
        );
        Ok(EndpointHandle::new(self.inner.clone(), endpoint))
    }

    /// Endpoints currently held by at least one client.
    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }

    /// Status of every held endpoint.
    pub fn status(&self) -> Vec<EndpointStatus> {
        let endpoints: Vec<Arc<ServiceEndpoint>> = self.inner.endpoints.lock().clone();
        endpoints.iter().map(|e| e.status()).collect()
    }

    /// Endpoint that has `id` registered.
    pub fn endpoint_for_stream(&self, id: StreamId) -> Option<Arc<ServiceEndpoint>> {
        self.inner
            .endpoints
            .lock()
            .iter()
            .find(|e| e.registered_streams().contains(&id))
            .cloned()
    }

    /// Options applied to new endpoints.
    pub fn options(&self) -> &EndpointOptions {
        &self.inner.options
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}

/// A client's hold on a shared endpoint. Dropping it releases the reference.
pub struct EndpointHandle {
    registry: Arc<RegistryInner>,
    endpoint: Arc<ServiceEndpoint>,
}

impl EndpointHandle {
    fn new(registry: Arc<RegistryInner>, endpoint: Arc<ServiceEndpoint>) -> Self {
        Self { registry, endpoint }
    }

    /// The shared endpoint.
    pub fn endpoint(&self) -> &Arc<ServiceEndpoint> {
        &self.endpoint
    }

    /// Release explicitly; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Deref for EndpointHandle {
    type Target = ServiceEndpoint;

    fn deref(&self) -> &ServiceEndpoint {
        &self.endpoint
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.registry.release(&self.endpoint);
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointHandle").field(&self.endpoint).finish()
    }
}
