//! # Page Cache
//!
//! The residency set of in-memory pages, keyed by address, bounded by a byte
//! budget. The cache owns its pages; the page manager and its callers borrow
//! them for the duration of an operation.
//!
//! ## Eviction
//!
//! The cache performs no I/O. When the budget is exceeded, [`PageCache::purge`]
//! selects least-recently-used victims and hands each to a visitor that must
//! flush and release it. A page is **ineligible** for eviction when
//!
//! - a cursor is coupled to it,
//! - it is the header page, or
//! - its pin counter is non-zero (an operation is mid-flight on it).
//!
//! To guarantee forward progress a purge evicts at least
//! [`PURGE_AT_LEAST`](crate::config::PURGE_AT_LEAST) pages when that many are
//! eligible; otherwise it evicts as many as it can and returns.
//!
//! [`PageCache::purge_if`] is the bulk variant used by flush-all and by
//! database close: the predicate/visitor decides per page whether it is
//! dropped after flushing.
//!
//! ## Full Condition
//!
//! `allocated_elements() * PAGE_SIZE > capacity()`; the page manager checks
//! this before purging.

use eyre::{Result, WrapErr};
use hashbrown::HashMap;

use crate::config::{HEADER_PAGE_ADDRESS, PAGE_SIZE, PURGE_AT_LEAST};
use crate::storage::page::Page;

pub struct PageCache {
    pages: HashMap<u64, Page>,
    /// Byte budget.
    capacity: usize,
    /// Monotonic LRU clock.
    tick: u64,
    hits: u64,
    misses: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            pages: HashMap::new(),
            capacity,
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Looks up a resident page, recording a hit or miss and refreshing the
    /// page's LRU stamp.
    pub fn get(&mut self, address: u64) -> Option<&mut Page> {
        self.tick += 1;
        match self.pages.get_mut(&address) {
            Some(page) => {
                self.hits += 1;
                page.last_access = self.tick;
                Some(page)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Metric-free residency check.
    pub fn contains(&self, address: u64) -> bool {
        self.pages.contains_key(&address)
    }

    /// Borrows a page known to be resident, without touching metrics or the
    /// LRU clock.
    pub fn resident_mut(&mut self, address: u64) -> Result<&mut Page> {
        self.pages
            .get_mut(&address)
            .ok_or_else(|| eyre::eyre!("page {} not resident in cache", address))
    }

    pub fn resident(&self, address: u64) -> Result<&Page> {
        self.pages
            .get(&address)
            .ok_or_else(|| eyre::eyre!("page {} not resident in cache", address))
    }

    /// Inserts a page. The address must not already be resident.
    pub fn put(&mut self, mut page: Page) {
        self.tick += 1;
        page.last_access = self.tick;
        let previous = self.pages.insert(page.address(), page);
        debug_assert!(previous.is_none(), "page inserted into cache twice");
    }

    /// Removes a page without flushing it.
    pub fn del(&mut self, address: u64) -> Option<Page> {
        self.pages.remove(&address)
    }

    pub fn allocated_elements(&self) -> usize {
        self.pages.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.allocated_elements() * PAGE_SIZE > self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    fn is_eligible(page: &Page) -> bool {
        page.pin_count() == 0 && !page.has_cursors() && page.address() != HEADER_PAGE_ADDRESS
    }

    /// Evicts least-recently-used eligible pages through `visitor` until the
    /// byte budget is honoured, with a floor of [`PURGE_AT_LEAST`] evictions
    /// per call. The visitor must flush the page; the cache drops it
    /// afterwards. Returns the number of pages evicted.
    pub fn purge<F>(&mut self, mut visitor: F) -> Result<usize>
    where
        F: FnMut(&mut Page) -> Result<()>,
    {
        if !self.is_full() {
            return Ok(0);
        }

        let mut victims: Vec<(u64, u64)> = self
            .pages
            .values()
            .filter(|p| Self::is_eligible(p))
            .map(|p| (p.last_access, p.address()))
            .collect();
        victims.sort_unstable();

        let mut evicted = 0;
        for (_, address) in victims {
            if !self.is_full() && evicted >= PURGE_AT_LEAST {
                break;
            }
            let mut page = match self.pages.remove(&address) {
                Some(p) => p,
                None => continue,
            };
            visitor(&mut page)
                .wrap_err_with(|| format!("purge visitor failed for page {}", address))?;
            evicted += 1;
        }

        Ok(evicted)
    }

    /// Visits every resident page; the visitor returns `true` to drop the
    /// page after flushing it, `false` to keep it resident. Returns the
    /// number of pages dropped.
    pub fn purge_if<F>(&mut self, mut visitor: F) -> Result<usize>
    where
        F: FnMut(&mut Page) -> Result<bool>,
    {
        let addresses: Vec<u64> = self.pages.keys().copied().collect();
        let mut dropped = 0;

        for address in addresses {
            let page = match self.pages.get_mut(&address) {
                Some(p) => p,
                None => continue,
            };
            if visitor(page)? {
                self.pages.remove(&address);
                dropped += 1;
            }
        }

        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_at(n: u64) -> Page {
        Page::new(n * PAGE_SIZE as u64, None)
    }

    fn cache_with_pages(capacity_pages: usize, count: u64) -> PageCache {
        let mut cache = PageCache::new(capacity_pages * PAGE_SIZE);
        for i in 1..=count {
            cache.put(page_at(i));
        }
        cache
    }

    #[test]
    fn get_records_hits_and_misses() {
        let mut cache = cache_with_pages(8, 2);

        assert!(cache.get(PAGE_SIZE as u64).is_some());
        assert!(cache.get(99 * PAGE_SIZE as u64).is_none());

        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn full_condition_uses_byte_budget() {
        let cache = cache_with_pages(2, 2);
        assert!(!cache.is_full());

        let cache = cache_with_pages(2, 3);
        assert!(cache.is_full());
    }

    #[test]
    fn purge_is_a_noop_when_not_full() {
        let mut cache = cache_with_pages(8, 3);
        let evicted = cache.purge(|_| Ok(())).unwrap();
        assert_eq!(evicted, 0);
        assert_eq!(cache.allocated_elements(), 3);
    }

    #[test]
    fn purge_evicts_least_recently_used_first() {
        let mut cache = cache_with_pages(2, 3);

        // refresh pages 1 and 3; page 2 becomes the LRU victim
        cache.get(PAGE_SIZE as u64);
        cache.get(3 * PAGE_SIZE as u64);

        let mut evicted = Vec::new();
        cache
            .purge(|page| {
                evicted.push(page.address());
                Ok(())
            })
            .unwrap();

        assert_eq!(evicted[0], 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn purge_evicts_at_least_the_floor_when_eligible() {
        let mut cache = cache_with_pages(4, 30);

        let evicted = cache.purge(|_| Ok(())).unwrap();

        assert!(evicted >= PURGE_AT_LEAST, "evicted only {}", evicted);
    }

    #[test]
    fn purge_skips_pinned_pages() {
        let mut cache = cache_with_pages(1, 3);
        cache
            .resident_mut(PAGE_SIZE as u64)
            .unwrap()
            .pin();

        let mut evicted = Vec::new();
        cache
            .purge(|page| {
                evicted.push(page.address());
                Ok(())
            })
            .unwrap();

        assert!(!evicted.contains(&(PAGE_SIZE as u64)));
        assert!(cache.contains(PAGE_SIZE as u64));
    }

    #[test]
    fn purge_skips_pages_with_coupled_cursors() {
        let mut cache = cache_with_pages(1, 3);
        cache
            .resident_mut(2 * PAGE_SIZE as u64)
            .unwrap()
            .add_cursor(7);

        cache.purge(|_| Ok(())).unwrap();

        assert!(cache.contains(2 * PAGE_SIZE as u64));
    }

    #[test]
    fn purge_never_evicts_the_header_page() {
        let mut cache = PageCache::new(PAGE_SIZE);
        cache.put(Page::new(HEADER_PAGE_ADDRESS, None));
        cache.put(page_at(1));
        cache.put(page_at(2));

        cache.purge(|_| Ok(())).unwrap();

        assert!(cache.contains(HEADER_PAGE_ADDRESS));
    }

    #[test]
    fn purge_if_drops_only_matching_pages() {
        let mut cache = cache_with_pages(8, 4);

        let dropped = cache
            .purge_if(|page| Ok(page.address() >= 3 * PAGE_SIZE as u64))
            .unwrap();

        assert_eq!(dropped, 2);
        assert_eq!(cache.allocated_elements(), 2);
        assert!(cache.contains(PAGE_SIZE as u64));
        assert!(!cache.contains(4 * PAGE_SIZE as u64));
    }

    #[test]
    fn put_then_del_round_trips() {
        let mut cache = PageCache::new(8 * PAGE_SIZE);
        cache.put(page_at(5));

        let page = cache.del(5 * PAGE_SIZE as u64).unwrap();
        assert_eq!(page.address(), 5 * PAGE_SIZE as u64);
        assert!(cache.del(5 * PAGE_SIZE as u64).is_none());
    }
}
