//! Inline caches
//!
//! Each named get or put site owns a short chain of entries keyed by the
//! receiver's class id. An entry records where the property was found:
//!
//! - an own slot (`offset`),
//! - a slot in a prototype (`Prototype` target, guarded by the epoch),
//! - nowhere (negative entry, guarded by the epoch),
//! - for puts, the class the receiver moves to when the property is added.
//!
//! Dictionary-mode receivers keep their class id while growing, so entries
//! also carry a `limit`: positive entries need `offset < count`, negative
//! and prototype entries need `count <= limit`.
//!
//! Chains hold at most one entry per class id, except that a negative-like
//! entry may sit immediately in front of a positive entry for the same id.

use smallvec::SmallVec;
use tern_vm_gc::{GcRef, Tracer};

use crate::class::{ClassId, ClassRef};

/// Bits of the packed word holding the slot offset
pub const CACHE_OFFSET_BITS: u32 = 20;
/// Bits of the packed word holding the limit
pub const CACHE_LIMIT_BITS: u32 = 12;

const OFFSET_MASK: u32 = (1 << CACHE_OFFSET_BITS) - 1;
/// Offset value of a negative entry
const NEGATIVE_OFFSET: u32 = OFFSET_MASK;
/// Largest limit an entry can record
pub const MAX_CACHE_LIMIT: u32 = (1 << CACHE_LIMIT_BITS) - 1;

/// Whether an entry with this offset (`None` for negative) and limit fits the packed word
#[inline]
pub fn can_cache(offset: Option<u32>, limit: u32) -> bool {
    offset.is_none_or(|o| o < NEGATIVE_OFFSET) && limit <= MAX_CACHE_LIMIT
}

/// Storage kinds recorded in [`CachedType`]
pub mod storage {
    /// A full [`crate::Value`] slot
    pub const VALUE: u8 = 1;
}

/// Value type, storage kind and storage size of a cached property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedType(u32);

impl CachedType {
    /// Pack the three fields
    pub const fn new(type_bits: u8, storage: u8, size: u8) -> Self {
        Self(type_bits as u32 | (storage as u32) << 8 | (size as u32) << 16)
    }

    /// Value type bits seen when the entry was made
    pub const fn type_bits(self) -> u8 {
        self.0 as u8
    }

    /// Storage kind
    pub const fn storage(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Storage size in bytes
    pub const fn size(self) -> u8 {
        (self.0 >> 16) as u8
    }
}

/// Where a cache entry finds its property
#[derive(Debug, Clone, Default)]
pub enum CacheTarget {
    /// In the receiver, or nowhere for a negative entry
    #[default]
    Own,
    /// In a slot of this prototype object
    Prototype(GcRef),
    /// Not present; a put adds it and moves the receiver to this class
    Transition(ClassRef),
}

/// One inline cache entry
#[derive(Debug, Clone, Default)]
pub struct PropertyCache {
    /// Receiver class id; [`ClassId::EMPTY`] marks an unused entry
    pub class_id: ClassId,
    data: u32,
    /// What the property looked like when cached
    pub cached_type: CachedType,
    /// Where the property lives
    pub target: CacheTarget,
    /// Receiver class when the entry was made
    pub object_class: Option<ClassRef>,
    /// Prototype epoch the entry depends on
    pub epoch: u64,
    next: Option<u32>,
}

impl PropertyCache {
    fn packed(class_id: ClassId, offset: u32, limit: u32) -> Self {
        Self {
            class_id,
            data: (limit << CACHE_OFFSET_BITS) | (offset & OFFSET_MASK),
            ..Self::default()
        }
    }

    /// Property found in the receiver's own slot
    pub fn own(class_id: ClassId, offset: u32) -> Self {
        Self::packed(class_id, offset, 0)
    }

    /// Property absent along the whole chain
    pub fn negative(class_id: ClassId, limit: u32, epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::packed(class_id, NEGATIVE_OFFSET, limit)
        }
    }

    /// Property found in a prototype's slot
    pub fn prototype(class_id: ClassId, holder: GcRef, offset: u32, limit: u32, epoch: u64) -> Self {
        Self {
            target: CacheTarget::Prototype(holder),
            epoch,
            ..Self::packed(class_id, offset, limit)
        }
    }

    /// Put that adds the property at `offset` and moves the receiver to `class`
    pub fn transition(class_id: ClassId, class: ClassRef, offset: u32, epoch: u64) -> Self {
        Self {
            target: CacheTarget::Transition(class),
            epoch,
            ..Self::packed(class_id, offset, offset)
        }
    }

    /// Attach the observed value type
    pub fn with_type(mut self, cached_type: CachedType) -> Self {
        self.cached_type = cached_type;
        self
    }

    /// Attach the receiver's class
    pub fn with_class(mut self, class: Option<ClassRef>) -> Self {
        self.object_class = class;
        self
    }

    /// Slot offset, `None` for a negative entry
    #[inline]
    pub fn offset(&self) -> Option<u32> {
        let offset = self.data & OFFSET_MASK;
        (offset != NEGATIVE_OFFSET).then_some(offset)
    }

    /// Recorded limit
    #[inline]
    pub fn limit(&self) -> u32 {
        self.data >> CACHE_OFFSET_BITS
    }

    /// Unused entry
    pub fn is_empty(&self) -> bool {
        self.class_id == ClassId::EMPTY
    }

    /// Negative entries and prototype hits go in front of a same-class positive entry
    pub fn is_negative_like(&self) -> bool {
        self.offset().is_none() || matches!(self.target, CacheTarget::Prototype(_))
    }

    /// Whether the entry still describes a receiver with this layout
    #[inline]
    pub fn is_valid_for(&self, receiver: &Receiver, epoch: u64) -> bool {
        if self.class_id != receiver.class_id {
            return false;
        }
        let within_limit = !receiver.dictionary || receiver.count <= self.limit();
        match (&self.target, self.offset()) {
            (CacheTarget::Own, Some(offset)) => !receiver.dictionary || offset < receiver.count,
            (CacheTarget::Own, None) | (CacheTarget::Prototype(_), _) => {
                self.epoch == epoch && within_limit
            }
            (CacheTarget::Transition(_), _) => {
                !receiver.dictionary && self.epoch == epoch && receiver.count == self.limit()
            }
        }
    }
}

/// What a probe needs to know about the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receiver {
    /// Class or dictionary id
    pub class_id: ClassId,
    /// Named property count
    pub count: u32,
    /// Dictionary mode
    pub dictionary: bool,
}

/// Result of probing a get site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetProbe {
    /// Receiver's own slot
    Own(u32),
    /// Prototype slot
    Prototype {
        /// Object holding the property
        holder: GcRef,
        /// Slot in the holder
        offset: u32,
    },
    /// Property is absent; the result is `undefined`
    Absent,
    /// No valid entry
    Miss,
}

/// Result of probing a put site
#[derive(Debug, Clone)]
pub enum PutProbe {
    /// Overwrite the receiver's own slot
    Own(u32),
    /// Append at `offset` and move to `class`
    Transition {
        /// New slot
        offset: u32,
        /// New class
        class: ClassRef,
    },
    /// No valid entry
    Miss,
}

/// The cache chains of one code instance's get or put sites.
///
/// Chain heads live inline, one per site; further entries come from a
/// shared overflow pool with a free list.
#[derive(Debug, Clone, Default)]
pub struct CacheSlab {
    sites: Vec<PropertyCache>,
    overflow: Vec<PropertyCache>,
    free: Vec<u32>,
    chain_limit: usize,
}

type Chain = SmallVec<[PropertyCache; 8]>;

impl CacheSlab {
    /// Slab for `sites` sites whose chains hold at most `chain_limit` entries
    pub fn new(sites: usize, chain_limit: usize) -> Self {
        Self {
            sites: vec![PropertyCache::default(); sites],
            overflow: Vec::new(),
            free: Vec::new(),
            chain_limit: chain_limit.max(1),
        }
    }

    /// Number of sites
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Entries of a site's chain, head first
    pub fn chain(&self, site: u32) -> impl Iterator<Item = &PropertyCache> {
        let head = self.sites.get(site as usize).filter(|entry| !entry.is_empty());
        std::iter::successors(head, |entry| {
            entry.next.and_then(|index| self.overflow.get(index as usize))
        })
    }

    /// Look up a get site
    #[inline]
    pub fn probe_get(&self, site: u32, receiver: &Receiver, epoch: u64) -> GetProbe {
        for entry in self.chain(site) {
            if !entry.is_valid_for(receiver, epoch) {
                continue;
            }
            return match (&entry.target, entry.offset()) {
                (CacheTarget::Prototype(holder), Some(offset)) => GetProbe::Prototype {
                    holder: *holder,
                    offset,
                },
                (_, Some(offset)) => GetProbe::Own(offset),
                (_, None) => GetProbe::Absent,
            };
        }
        GetProbe::Miss
    }

    /// Look up a put site
    #[inline]
    pub fn probe_put(&self, site: u32, receiver: &Receiver, epoch: u64) -> PutProbe {
        for entry in self.chain(site) {
            if !entry.is_valid_for(receiver, epoch) {
                continue;
            }
            return match (&entry.target, entry.offset()) {
                (CacheTarget::Transition(class), Some(offset)) => PutProbe::Transition {
                    offset,
                    class: class.clone(),
                },
                (CacheTarget::Own, Some(offset)) => PutProbe::Own(offset),
                _ => continue,
            };
        }
        PutProbe::Miss
    }

    fn take_chain(&mut self, site: u32) -> Chain {
        let mut chain = Chain::new();
        let Some(head) = self.sites.get_mut(site as usize) else {
            return chain;
        };
        if head.is_empty() {
            return chain;
        }
        let mut next = head.next.take();
        chain.push(std::mem::take(head));
        while let Some(index) = next {
            let Some(entry) = self.overflow.get_mut(index as usize) else {
                break;
            };
            next = entry.next.take();
            chain.push(std::mem::take(entry));
            self.free.push(index);
        }
        chain
    }

    fn write_chain(&mut self, site: u32, chain: Chain) {
        let mut entries = chain.into_iter();
        let Some(mut head) = entries.next() else {
            return;
        };
        let mut rest: Vec<PropertyCache> = entries.collect();
        let mut next = None;
        while let Some(mut entry) = rest.pop() {
            entry.next = next;
            let index = match self.free.pop() {
                Some(index) => {
                    self.overflow[index as usize] = entry;
                    index
                }
                None => {
                    self.overflow.push(entry);
                    (self.overflow.len() - 1) as u32
                }
            };
            next = Some(index);
        }
        head.next = next;
        if let Some(slot) = self.sites.get_mut(site as usize) {
            *slot = head;
        }
    }

    /// Drop entries for this receiver's class id that no longer validate
    pub fn remove_stale(&mut self, site: u32, receiver: &Receiver, epoch: u64) {
        let stale = self
            .chain(site)
            .any(|e| e.class_id == receiver.class_id && !e.is_valid_for(receiver, epoch));
        if !stale {
            return;
        }
        let mut chain = self.take_chain(site);
        chain.retain(|e| e.class_id != receiver.class_id || e.is_valid_for(receiver, epoch));
        self.write_chain(site, chain);
    }

    /// Add an entry, replacing a same-class entry of the same polarity and
    /// trimming the chain from the tail
    pub fn install(&mut self, site: u32, entry: PropertyCache) {
        if site as usize >= self.sites.len() || entry.is_empty() {
            return;
        }
        let mut chain = self.take_chain(site);
        let negative = entry.is_negative_like();
        chain.retain(|e| !(e.class_id == entry.class_id && e.is_negative_like() == negative));
        let partner = chain.iter().position(|e| e.class_id == entry.class_id);
        let at = match partner {
            Some(index) if negative => index,
            Some(index) => index + 1,
            None => 0,
        };
        chain.insert(at, entry);
        chain.truncate(self.chain_limit);
        self.write_chain(site, chain);
        debug_assert!(self.check_invariants(site));
    }

    /// Empty every chain
    pub fn clear(&mut self) {
        self.sites.fill(PropertyCache::default());
        self.overflow.clear();
        self.free.clear();
    }

    /// Chain length of a site
    pub fn chain_len(&self, site: u32) -> usize {
        self.chain(site).count()
    }

    /// Whether a site's chain is well formed
    pub fn check_invariants(&self, site: u32) -> bool {
        let entries: Vec<&PropertyCache> = self.chain(site).collect();
        if entries.len() > self.chain_limit {
            return false;
        }
        for (i, entry) in entries.iter().enumerate() {
            for (j, other) in entries.iter().enumerate().skip(i + 1) {
                if entry.class_id != other.class_id {
                    continue;
                }
                let paired = j == i + 1 && entry.is_negative_like() && !other.is_negative_like();
                if !paired {
                    return false;
                }
            }
        }
        true
    }

    /// Mark prototype holders and classes' prototypes held by entries
    pub(crate) fn trace(&self, tracer: &mut Tracer<'_>) {
        for entry in self.sites.iter().chain(self.overflow.iter()) {
            if let CacheTarget::Prototype(holder) = entry.target {
                tracer.mark(holder);
            }
            if let CacheTarget::Transition(class) = &entry.target {
                tracer.mark_opt(class.prototype());
            }
            if let Some(class) = &entry.object_class {
                tracer.mark_opt(class.prototype());
            }
        }
    }
}

/// Cache for one global access site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GlobalCache {
    /// Not yet resolved
    #[default]
    Empty,
    /// Declared global variable
    Variable {
        /// Variable slot
        slot: u32,
    },
    /// Own data property of the global object
    Property {
        /// Global object class id when cached
        class_id: ClassId,
        /// Slot in the global object
        offset: u32,
    },
}

/// Hit and miss counters across all caches of a context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Named gets served by a cache
    pub get_hits: u64,
    /// Named gets that took the slow path
    pub get_misses: u64,
    /// Named puts served by a cache
    pub put_hits: u64,
    /// Named puts that took the slow path
    pub put_misses: u64,
    /// Global accesses served by a cache
    pub global_hits: u64,
    /// Global accesses that took the slow path
    pub global_misses: u64,
}
