use std::collections::HashMap;
use std::net::{IpAddr, TcpListener};
use std::ops::RangeInclusive;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::FurnaceConfig;
use crate::core::{Allocation, FurnaceError, FurnaceResult, HostnameBinding, Recipe};

#[derive(Default)]
struct AllocatorState {
    by_recipe: HashMap<String, Allocation>,
    ports: HashMap<u16, String>,
    hostnames: HashMap<String, String>,
}

/// Hands out ports and site hostnames to starting environments.
///
/// Reservation happens under one lock: the free-port search, the hostname
/// check and the insert are a single compare-and-reserve step.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    bind_address: IpAddr,
    skip_busy: bool,
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, bind_address: IpAddr, skip_busy: bool) -> Self {
        Self {
            range,
            bind_address,
            skip_busy,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn from_config(config: &FurnaceConfig) -> Self {
        Self::new(
            config.ports.start..=config.ports.end,
            config.sites.bind_address,
            config.ports.skip_busy,
        )
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    pub async fn allocate(&self, recipe: &Recipe) -> FurnaceResult<Allocation> {
        let mut state = self.state.lock().await;

        if state.by_recipe.contains_key(&recipe.name) {
            return Err(FurnaceError::conflict(
                &recipe.name,
                "recipe already holds an allocation",
            ));
        }

        let hostname = recipe.site_hostname.to_ascii_lowercase();
        if let Some(owner) = state.hostnames.get(&hostname) {
            return Err(FurnaceError::conflict(
                &recipe.name,
                format!("site '{}' is bound to running recipe '{}'", hostname, owner),
            ));
        }

        let port = self
            .range
            .clone()
            .find(|port| !state.ports.contains_key(port) && self.is_bindable(*port))
            .ok_or_else(|| FurnaceError::ResourceExhausted {
                recipe: recipe.name.clone(),
                start: *self.range.start(),
                end: *self.range.end(),
            })?;

        let allocation = Allocation {
            recipe_name: recipe.name.clone(),
            port,
            hostname_binding: HostnameBinding {
                address: self.bind_address,
                hostname: hostname.clone(),
            },
        };

        state.ports.insert(port, recipe.name.clone());
        state.hostnames.insert(hostname, recipe.name.clone());
        state
            .by_recipe
            .insert(recipe.name.clone(), allocation.clone());

        info!(
            "Allocated port {} and {} to recipe '{}'",
            port, allocation.hostname_binding, recipe.name
        );
        Ok(allocation)
    }

    /// Frees a recipe's port and hostname. Releasing twice is a no-op.
    pub async fn release(&self, recipe_name: &str) -> Option<Allocation> {
        let mut state = self.state.lock().await;
        let allocation = state.by_recipe.remove(recipe_name)?;
        state.ports.remove(&allocation.port);
        state.hostnames.remove(allocation.hostname());
        debug!(
            "Released port {} of recipe '{}'",
            allocation.port, recipe_name
        );
        Some(allocation)
    }

    pub async fn get(&self, recipe_name: &str) -> Option<Allocation> {
        self.state.lock().await.by_recipe.get(recipe_name).cloned()
    }

    pub async fn allocations(&self) -> Vec<Allocation> {
        let mut allocations: Vec<Allocation> =
            self.state.lock().await.by_recipe.values().cloned().collect();
        allocations.sort_by(|a, b| a.recipe_name.cmp(&b.recipe_name));
        allocations
    }

    /// Number of live allocations.
    pub async fn len(&self) -> usize {
        self.state.lock().await.by_recipe.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_bindable(&self, port: u16) -> bool {
        !self.skip_busy || TcpListener::bind((self.bind_address, port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServingEngine;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(start..=end, IpAddr::V4(Ipv4Addr::LOCALHOST), false)
    }

    fn recipe(name: &str, site: &str) -> Recipe {
        Recipe::new(name, format!("/srv/{}", name), "8.2", ServingEngine::Nginx, site)
    }

    #[tokio::test]
    async fn picks_lowest_free_port_and_reuses_released_ones() {
        let allocator = allocator(9000, 9010);
        let a = allocator.allocate(&recipe("a", "a.test")).await.unwrap();
        let b = allocator.allocate(&recipe("b", "b.test")).await.unwrap();
        assert_eq!((a.port, b.port), (9000, 9001));

        allocator.release("a").await;
        let c = allocator.allocate(&recipe("c", "c.test")).await.unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.hostname_binding.to_string(), "127.0.0.1 c.test");
    }

    #[tokio::test]
    async fn exhausted_range_is_reported() {
        let allocator = allocator(9000, 9000);
        allocator.allocate(&recipe("a", "a.test")).await.unwrap();
        let err = allocator.allocate(&recipe("b", "b.test")).await.unwrap_err();
        assert!(matches!(
            err,
            FurnaceError::ResourceExhausted {
                start: 9000,
                end: 9000,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn hostname_is_exclusive() {
        let allocator = allocator(9000, 9010);
        allocator.allocate(&recipe("a", "same.test")).await.unwrap();
        let err = allocator.allocate(&recipe("b", "SAME.test")).await.unwrap_err();
        assert!(matches!(err, FurnaceError::Conflict { .. }));
        assert_eq!(allocator.len().await, 1);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let allocator = allocator(9000, 9010);
        allocator.allocate(&recipe("a", "a.test")).await.unwrap();
        assert!(allocator.release("a").await.is_some());
        assert!(allocator.release("a").await.is_none());
        assert!(allocator.release("never").await.is_none());
        assert!(allocator.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_allocations_are_disjoint() {
        let allocator = Arc::new(allocator(9000, 9099));
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    let name = format!("r{}", i);
                    let site = format!("r{}.test", i);
                    allocator.allocate(&recipe(&name, &site)).await.unwrap()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        let mut hosts = HashSet::new();
        for task in tasks {
            let allocation = task.await.unwrap();
            assert!(ports.insert(allocation.port));
            assert!(hosts.insert(allocation.hostname_binding.hostname));
        }
        assert_eq!(allocator.len().await, 50);
    }

    #[tokio::test]
    async fn skips_ports_held_by_other_programs() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(
            busy..=busy.saturating_add(20),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            true,
        );

        let allocation = allocator.allocate(&recipe("a", "a.test")).await.unwrap();
        assert_ne!(allocation.port, busy);
    }
}
