//! Shared-ownership proxies for natively-owned resources
//!
//! Many independent owners (tracks, transponders, the manager) need to call into the
//! same engine resource. [`ProxyRegistry`] guarantees that a given [`HandleId`] maps to
//! at most one [`Proxy`] at any time, so every owner observes the same identity.
//!
//! Release is explicit: entries leave the registry only through [`ProxyRegistry::release`],
//! which also invokes the native release. There is no reference counting across proxies;
//! forgetting to release leaks the entry but is never unsound.

use crate::engine::NativeResource;
use crate::error::{Error, Result};
use crate::types::HandleId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

struct RegistryInner {
    /// Type-erased `Proxy<T>` per handle
    proxies: DashMap<HandleId, Box<dyn Any + Send + Sync>>,
}

/// Registry of live proxies, shared by cloning
#[derive(Clone)]
pub struct ProxyRegistry {
    inner: Arc<RegistryInner>,
}

impl ProxyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                proxies: DashMap::new(),
            }),
        }
    }

    /// Wrap a raw handle or pass an existing proxy through unchanged
    pub fn wrap<T, H>(&self, handle: H) -> Result<Proxy<T>>
    where
        T: ?Sized + NativeResource,
        H: IntoProxy<T>,
    {
        handle.into_proxy(self)
    }

    fn wrap_handle<T>(&self, handle: Arc<T>) -> Result<Proxy<T>>
    where
        T: ?Sized + NativeResource,
    {
        let id = handle.handle_id();
        if handle.is_released() {
            return Err(Error::Released(id));
        }

        match self.inner.proxies.entry(id) {
            Entry::Occupied(entry) => {
                debug!(handle = %id, "Proxy cache hit");
                entry
                    .get()
                    .downcast_ref::<Proxy<T>>()
                    .cloned()
                    .ok_or(Error::HandleTypeMismatch(id))
            }
            Entry::Vacant(entry) => {
                let proxy = Proxy {
                    inner: Arc::new(ProxyInner {
                        id,
                        registry: Arc::downgrade(&self.inner),
                        handle,
                    }),
                };
                entry.insert(Box::new(proxy.clone()));
                debug!(handle = %id, "Created proxy");
                Ok(proxy)
            }
        }
    }

    /// Raw handle behind a proxy, for passing into lower-level engine calls
    #[must_use]
    pub fn unwrap<T>(&self, proxy: &Proxy<T>) -> Arc<T>
    where
        T: ?Sized + NativeResource,
    {
        proxy.handle()
    }

    /// Drop the cache entry for this proxy and release the native resource
    ///
    /// Calling this more than once is a no-op.
    pub fn release<T>(&self, proxy: &Proxy<T>)
    where
        T: ?Sized + NativeResource,
    {
        let id = proxy.id();
        let removed = self
            .inner
            .proxies
            .remove_if(&id, |_, cached| {
                cached
                    .downcast_ref::<Proxy<T>>()
                    .is_some_and(|cached| cached.ptr_eq(proxy))
            })
            .is_some();

        if !proxy.inner.handle.is_released() {
            proxy.inner.handle.release();
            info!(handle = %id, evicted = removed, "Released native resource");
        }
    }

    /// Forget the entry of a resource that was released outside the registry
    pub(crate) fn evict(&self, id: HandleId) -> bool {
        self.inner.proxies.remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: HandleId) -> bool {
        self.inner.proxies.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.proxies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.proxies.is_empty()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("proxies", &self.inner.proxies.len())
            .finish()
    }
}

struct ProxyInner<T: ?Sized> {
    id: HandleId,
    registry: Weak<RegistryInner>,
    handle: Arc<T>,
}

/// Cached, identity-preserving wrapper around a native resource
pub struct Proxy<T: ?Sized> {
    inner: Arc<ProxyInner<T>>,
}

impl<T: ?Sized + NativeResource> Proxy<T> {
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    /// Call into the underlying resource
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        if self.inner.handle.is_released() {
            return Err(Error::Released(self.inner.id));
        }
        Ok(f(&*self.inner.handle))
    }

    /// Call into the resource and wrap the handle it returns through the same registry
    pub fn wrap_result<U>(&self, f: impl FnOnce(&T) -> Arc<U>) -> Result<Proxy<U>>
    where
        U: ?Sized + NativeResource,
    {
        let registry = self.registry()?;
        let handle = self.with(f)?;
        registry.wrap_handle(handle)
    }

    /// Like [`Proxy::wrap_result`] for calls returning several handles
    pub fn wrap_results<U>(&self, f: impl FnOnce(&T) -> Vec<Arc<U>>) -> Result<Vec<Proxy<U>>>
    where
        U: ?Sized + NativeResource,
    {
        let registry = self.registry()?;
        self.with(f)?
            .into_iter()
            .map(|handle| registry.wrap_handle(handle))
            .collect()
    }

    fn registry(&self) -> Result<ProxyRegistry> {
        self.inner
            .registry
            .upgrade()
            .map(|inner| ProxyRegistry { inner })
            .ok_or(Error::Released(self.inner.id))
    }

    #[must_use]
    pub fn handle(&self) -> Arc<T> {
        Arc::clone(&self.inner.handle)
    }

    /// Raw handle, unless the resource was already released
    pub fn live_handle(&self) -> Result<Arc<T>> {
        if self.inner.handle.is_released() {
            return Err(Error::Released(self.inner.id));
        }
        Ok(self.handle())
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.handle.is_released()
    }

    /// Whether both proxies are the same wrapper instance
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Clone for Proxy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Proxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Proxy").field(&self.inner.id).finish()
    }
}

/// Anything the registry can turn into a proxy
pub trait IntoProxy<T: ?Sized + NativeResource> {
    fn into_proxy(self, registry: &ProxyRegistry) -> Result<Proxy<T>>;
}

impl<T: ?Sized + NativeResource> IntoProxy<T> for Arc<T> {
    fn into_proxy(self, registry: &ProxyRegistry) -> Result<Proxy<T>> {
        registry.wrap_handle(self)
    }
}

impl<T: ?Sized + NativeResource> IntoProxy<T> for Proxy<T> {
    fn into_proxy(self, _registry: &ProxyRegistry) -> Result<Proxy<T>> {
        Ok(self)
    }
}

impl<T: ?Sized + NativeResource> IntoProxy<T> for &Proxy<T> {
    fn into_proxy(self, _registry: &ProxyRegistry) -> Result<Proxy<T>> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Device {
        id: HandleId,
        released: AtomicBool,
        release_calls: AtomicUsize,
        children: Vec<Arc<Device>>,
    }

    impl Device {
        fn new() -> Arc<Self> {
            Self::with_children(Vec::new())
        }

        fn with_children(children: Vec<Arc<Device>>) -> Arc<Self> {
            Arc::new(Self {
                id: HandleId::next(),
                released: AtomicBool::new(false),
                release_calls: AtomicUsize::new(0),
                children,
            })
        }
    }

    impl NativeResource for Device {
        fn handle_id(&self) -> HandleId {
            self.id
        }

        fn release(&self) {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            self.released.store(true, Ordering::SeqCst);
        }

        fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    trait Named: NativeResource {
        fn name(&self) -> &'static str;
    }

    impl Named for Device {
        fn name(&self) -> &'static str {
            "device"
        }
    }

    #[test]
    fn test_repeated_wrap_returns_same_proxy() {
        let registry = ProxyRegistry::new();
        let device = Device::new();

        let first: Proxy<Device> = registry.wrap(Arc::clone(&device)).unwrap();
        for _ in 0..5 {
            let again: Proxy<Device> = registry.wrap(Arc::clone(&device)).unwrap();
            assert!(again.ptr_eq(&first));
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_wrapping_proxy_is_identity() {
        let registry = ProxyRegistry::new();
        let proxy: Proxy<Device> = registry.wrap(Device::new()).unwrap();

        let same = registry.wrap(&proxy).unwrap();
        assert!(same.ptr_eq(&proxy));
        let same = registry.wrap(proxy.clone()).unwrap();
        assert!(same.ptr_eq(&proxy));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_returned_handles_are_wrapped_through_cache() {
        let registry = ProxyRegistry::new();
        let child = Device::new();
        let parent = Device::with_children(vec![Arc::clone(&child), Device::new()]);

        let parent: Proxy<Device> = registry.wrap(parent).unwrap();
        let child_proxy: Proxy<Device> = registry.wrap(Arc::clone(&child)).unwrap();

        let first = parent
            .wrap_result(|device| Arc::clone(&device.children[0]))
            .unwrap();
        assert!(first.ptr_eq(&child_proxy));

        let all = parent.wrap_results(|device| device.children.clone()).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].ptr_eq(&child_proxy));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_release_is_explicit_and_idempotent() {
        let registry = ProxyRegistry::new();
        let device = Device::new();
        let proxy: Proxy<Device> = registry.wrap(Arc::clone(&device)).unwrap();

        // Dropping clones never evicts
        drop(proxy.clone());
        assert!(registry.contains(proxy.id()));

        registry.release(&proxy);
        registry.release(&proxy);
        assert!(!registry.contains(proxy.id()));
        assert_eq!(device.release_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(proxy.with(|d| d.id), Err(Error::Released(_))));
        assert!(matches!(
            registry.wrap::<Device, _>(device),
            Err(Error::Released(_))
        ));
    }

    #[test]
    fn test_unwrap_returns_raw_handle() {
        let registry = ProxyRegistry::new();
        let device = Device::new();
        let proxy: Proxy<Device> = registry.wrap(Arc::clone(&device)).unwrap();
        assert!(Arc::ptr_eq(&registry.unwrap(&proxy), &device));
    }

    #[test]
    fn test_interface_mismatch_is_rejected() {
        let registry = ProxyRegistry::new();
        let device = Device::new();

        let concrete: Proxy<Device> = registry.wrap(Arc::clone(&device)).unwrap();
        let as_named: Arc<dyn Named> = device;
        let result: Result<Proxy<dyn Named>> = registry.wrap(as_named);
        assert!(matches!(result, Err(Error::HandleTypeMismatch(id)) if id == concrete.id()));
    }

    #[test]
    fn test_trait_object_proxies() {
        let registry = ProxyRegistry::new();
        let named: Arc<dyn Named> = Device::new();
        let proxy: Proxy<dyn Named> = registry.wrap(Arc::clone(&named)).unwrap();
        assert_eq!(proxy.with(|n| n.name()).unwrap(), "device");

        let again: Proxy<dyn Named> = registry.wrap(named).unwrap();
        assert!(again.ptr_eq(&proxy));
    }
}
