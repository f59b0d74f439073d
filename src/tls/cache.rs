//! Certificate caching for minted leaf certificates
//!
//! Entries are keyed by the exact domain string, never evicted and never
//! replaced. Concurrent first lookups for the same domain share a single
//! mint: the first caller runs it and the others wait on its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;

use super::mint::LeafCertificate;
use crate::error::Result;

type Slot = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Unbounded domain → certificate map with per-domain single-flight
#[derive(Default)]
pub struct CertificateCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl CertificateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, domain: &str) -> Slot {
        let mut slots = self.slots();
        match slots.get(domain) {
            Some(slot) => slot.clone(),
            None => {
                let slot = Slot::default();
                slots.insert(domain.to_string(), slot.clone());
                slot
            }
        }
    }

    /// Get a certificate from the cache if one has been stored
    pub fn get(&self, domain: &str) -> Option<Arc<LeafCertificate>> {
        self.slots().get(domain).and_then(|slot| slot.get().cloned())
    }

    /// Store a certificate unless the domain already has one.
    ///
    /// Returns whichever certificate the cache holds afterwards.
    pub fn insert(&self, domain: &str, cert: LeafCertificate) -> Arc<LeafCertificate> {
        let slot = self.slot(domain);
        let cert = Arc::new(cert);
        match slot.set(cert.clone()) {
            Ok(()) => cert,
            Err(_) => slot.get().cloned().unwrap_or(cert),
        }
    }

    /// Return the cached certificate, or run `mint` once to produce it.
    ///
    /// Callers arriving while a mint for the same domain is in flight wait
    /// for it instead of starting their own. A failed mint stores nothing,
    /// so the next lookup tries again.
    pub async fn get_or_mint<F, Fut>(&self, domain: &str, mint: F) -> Result<Arc<LeafCertificate>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LeafCertificate>>,
    {
        let slot = self.slot(domain);
        match slot
            .get_or_try_init(|| async move { mint().await.map(Arc::new) })
            .await
        {
            Ok(cert) => {
                let cert = cert.clone();
                // A failed mint elsewhere may have released the slot meanwhile
                self.slots()
                    .entry(domain.to_string())
                    .or_insert_with(|| slot.clone());
                Ok(cert)
            }
            Err(e) => {
                self.release(domain, &slot);
                Err(e)
            }
        }
    }

    /// Drop `slot` from the map if it is still the one registered for
    /// `domain` and holds nothing
    fn release(&self, domain: &str, slot: &Slot) {
        let mut slots = self.slots();
        let empty = slots
            .get(domain)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if empty {
            slots.remove(domain);
        }
    }

    /// Number of domains holding a certificate
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
