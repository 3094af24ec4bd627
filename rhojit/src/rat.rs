//! The runtime assumption table.
//! Every assumption sits on two lists at once: the bucket of its kind's hash table, found by its
//! key, and the circular list of the compiled body that made it, which is rooted at a sentinel.
//! Both are index chains through one arena of nodes, and both are only ever touched while the
//! table lock is held.
//!
//! Removal is done in two steps. An assumption is first marked for detach, which makes lookups
//! skip it, and later a reclaim sweep unlinks it from both lists and frees the node.

use parking_lot::{Mutex, MutexGuard};
use rhojit_base::{
    bucket_index,
    id::{AssumptionId, BodyId, ClassId, MethodId},
    util::{new_address_map, AddressMap},
};
use smallvec::SmallVec;
use usize_cast::IntoUsize;

use crate::{
    assumption::{BodyRange, PatchSite, PatchTarget, RuntimeAssumption, RuntimeAssumptionKind},
    code_memory::{read_vec, CodeMemory},
    unloaded::UnloadedAddresses,
    AssumptionError, JitConfig,
};

pub const DEFAULT_RAT_SIZE: usize = 251;
/// Class extend table size when classes come from a shared class cache
pub const SHARED_CLASS_CACHE_CLASS_EXTEND_RAT_SIZE: usize = 3079;
/// Unresolved PIC table size when hot code replace is enabled
pub const HCR_UPIC_RAT_SIZE: usize = 1543;
/// With purging enabled, the table is purged on every n-th insertion into a kind
pub const PURGE_INTERVAL: u64 = 10;

/// The number of buckets the table for `kind` is created with
#[must_use]
pub fn rat_table_size(kind: RuntimeAssumptionKind, config: &JitConfig) -> usize {
    match kind {
        RuntimeAssumptionKind::ClassExtend => {
            if config.class_extend_rat_size > 0 {
                config.class_extend_rat_size
            } else if config.shared_class_cache {
                SHARED_CLASS_CACHE_CLASS_EXTEND_RAT_SIZE
            } else {
                DEFAULT_RAT_SIZE
            }
        }
        RuntimeAssumptionKind::MethodOverride if config.method_override_rat_size > 0 => {
            config.method_override_rat_size
        }
        RuntimeAssumptionKind::ClassRedefinitionUpic => {
            if config.class_redefinition_upic_rat_size > 0 {
                config.class_redefinition_upic_rat_size
            } else if config.hcr_enabled {
                HCR_UPIC_RAT_SIZE
            } else {
                DEFAULT_RAT_SIZE
            }
        }
        _ => DEFAULT_RAT_SIZE,
    }
}

#[derive(Debug)]
enum NodeEntry {
    Free,
    /// Root of the circular list of a body's assumptions
    Sentinel(BodyId),
    Assumption(RuntimeAssumption),
}

#[derive(Debug)]
struct Node {
    entry: NodeEntry,
    marked: bool,
    next_in_bucket: Option<AssumptionId>,
    /// `None` once the node is no longer on its body's list
    next_in_body: Option<AssumptionId>,
}
impl Node {
    fn new(entry: NodeEntry) -> Node {
        Node {
            entry,
            marked: false,
            next_in_bucket: None,
            next_in_body: None,
        }
    }
}

#[derive(Debug)]
struct KindTable {
    buckets: Vec<Option<AssumptionId>>,
    /// Number of marked assumptions per bucket
    marked_counts: Vec<u32>,
    detach_pending: bool,
    assumption_count: u64,
    reclaimed_count: u64,
}
impl KindTable {
    fn new(size: usize) -> KindTable {
        KindTable {
            buckets: vec![None; size],
            marked_counts: vec![0; size],
            detach_pending: false,
            assumption_count: 0,
            reclaimed_count: 0,
        }
    }

    fn bucket(&self, key: usize) -> usize {
        bucket_index(key, self.buckets.len())
    }
}

fn idx(id: AssumptionId) -> usize {
    id.get().into_usize()
}

/// The assumption tables, only reachable while the lock is held
pub struct AssumptionTables<M: CodeMemory> {
    target: PatchTarget,
    code: M,
    tables: Vec<KindTable>,
    nodes: Vec<Node>,
    free: Vec<AssumptionId>,
    body_sentinels: AddressMap<BodyId, AssumptionId>,
    /// Total number of marked assumptions that have not been reclaimed
    marked: usize,
    purge_enabled: bool,
    unrecognized_patterns: u64,
    unloaded: UnloadedAddresses,
}

pub type AssumptionTableGuard<'a, M> = MutexGuard<'a, AssumptionTables<M>>;

pub struct AssumptionTable<M: CodeMemory> {
    state: Mutex<AssumptionTables<M>>,
}
impl<M: CodeMemory> AssumptionTable<M> {
    pub fn new(config: &JitConfig, code: M) -> AssumptionTable<M> {
        let tables = RuntimeAssumptionKind::ALL
            .iter()
            .map(|kind| KindTable::new(rat_table_size(*kind, config)))
            .collect();
        AssumptionTable {
            state: Mutex::new(AssumptionTables {
                target: config.target,
                code,
                tables,
                nodes: Vec::new(),
                free: Vec::new(),
                body_sentinels: new_address_map(),
                marked: 0,
                purge_enabled: config.rat_purging,
                unrecognized_patterns: 0,
                unloaded: UnloadedAddresses::new(config.unloaded_address_ranges()),
            }),
        }
    }

    pub fn lock(&self) -> AssumptionTableGuard<'_, M> {
        self.state.lock()
    }

    /// Reclaim at most `budget` marked assumptions, returning how many were reclaimed
    pub fn reclaim_marked_assumptions(&self, budget: usize) -> Result<usize, AssumptionError> {
        self.lock().reclaim_marked(budget)
    }

    pub fn is_unloaded_class(&self, address: usize) -> bool {
        self.lock().unloaded.is_unloaded_class(address)
    }

    pub fn is_in_unloaded_method(&self, address: usize) -> bool {
        self.lock().unloaded.is_in_unloaded_method(address)
    }

    pub fn add_unloaded_class(&self, class: ClassId, method_start: usize, size: u32) {
        self.lock()
            .unloaded
            .add_unloaded_class(class, method_start, size);
    }
}

impl<M: CodeMemory> AssumptionTables<M> {
    #[must_use]
    pub fn code(&self) -> &M {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut M {
        &mut self.code
    }

    #[must_use]
    pub fn unloaded(&self) -> &UnloadedAddresses {
        &self.unloaded
    }

    pub fn unloaded_mut(&mut self) -> &mut UnloadedAddresses {
        &mut self.unloaded
    }

    #[must_use]
    pub fn table_size(&self, kind: RuntimeAssumptionKind) -> usize {
        self.tables[kind.index()].buckets.len()
    }

    /// Number of assumptions ever added for the kind
    #[must_use]
    pub fn assumption_count(&self, kind: RuntimeAssumptionKind) -> u64 {
        self.tables[kind.index()].assumption_count
    }

    #[must_use]
    pub fn reclaimed_count(&self, kind: RuntimeAssumptionKind) -> u64 {
        self.tables[kind.index()].reclaimed_count
    }

    /// Number of assumptions marked for detach but not yet reclaimed
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked
    }

    /// Number of unresolved PIC sites whose code was not a recognized materialization sequence
    #[must_use]
    pub fn unrecognized_pattern_count(&self) -> u64 {
        self.unrecognized_patterns
    }

    /// `None` if the id is not a live assumption
    #[must_use]
    pub fn assumption(&self, id: AssumptionId) -> Option<&RuntimeAssumption> {
        match &self.nodes.get(idx(id))?.entry {
            NodeEntry::Assumption(assumption) => Some(assumption),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_marked(&self, id: AssumptionId) -> bool {
        self.nodes.get(idx(id)).map_or(false, |node| node.marked)
    }

    fn alloc_node(&mut self, entry: NodeEntry) -> Result<AssumptionId, AssumptionError> {
        if let Some(id) = self.free.pop() {
            self.nodes[idx(id)] = Node::new(entry);
            return Ok(id);
        }

        self.nodes
            .try_reserve(1)
            .map_err(|_| AssumptionError::AllocationFailure)?;
        let id = u32::try_from(self.nodes.len()).map_err(|_| AssumptionError::AllocationFailure)?;
        self.nodes.push(Node::new(entry));
        Ok(AssumptionId::new_unchecked(id))
    }

    fn free_node(&mut self, id: AssumptionId) {
        self.nodes[idx(id)] = Node::new(NodeEntry::Free);
        self.free.push(id);
    }

    /// Add the assumption made by the compilation of `body`.
    /// If allocation fails then nothing was added, and the code the assumption was for must not
    /// be relied on.
    /// The returned id is stale if this insertion triggered a purge.
    pub fn add_assumption(
        &mut self,
        assumption: RuntimeAssumption,
        body: BodyId,
    ) -> Result<AssumptionId, AssumptionError> {
        let kind = assumption.kind();
        let key = assumption.key();

        let sentinel = if let Some(sentinel) = self.body_sentinels.get(&body) {
            *sentinel
        } else {
            self.body_sentinels
                .try_reserve(1)
                .map_err(|_| AssumptionError::AllocationFailure)?;
            let sentinel = self.alloc_node(NodeEntry::Sentinel(body))?;
            self.nodes[idx(sentinel)].next_in_body = Some(sentinel);
            self.body_sentinels.insert(body, sentinel);
            sentinel
        };
        let id = self.alloc_node(NodeEntry::Assumption(assumption))?;

        // Body list, directly after the sentinel
        self.nodes[idx(id)].next_in_body = self.nodes[idx(sentinel)].next_in_body;
        self.nodes[idx(sentinel)].next_in_body = Some(id);

        let table = &mut self.tables[kind.index()];
        table.assumption_count += 1;
        let count = table.assumption_count;
        let bucket = table.bucket(key);
        self.link_into_bucket(kind, bucket, id);

        tracing::debug!(
            "Adding {} assumption key={:#x} for body {:#x}",
            kind.name(),
            key,
            body.get()
        );

        if self.purge_enabled && count % PURGE_INTERVAL == 0 {
            self.purge()?;
        }

        Ok(id)
    }

    /// Link into the bucket, in front of every entry that isn't already marked
    fn link_into_bucket(&mut self, kind: RuntimeAssumptionKind, bucket: usize, id: AssumptionId) {
        let mut prev = None;
        let mut cursor = self.tables[kind.index()].buckets[bucket];
        while let Some(current) = cursor {
            if !self.nodes[idx(current)].marked {
                break;
            }
            prev = Some(current);
            cursor = self.nodes[idx(current)].next_in_bucket;
        }

        self.nodes[idx(id)].next_in_bucket = cursor;
        match prev {
            Some(prev) => self.nodes[idx(prev)].next_in_bucket = Some(id),
            None => self.tables[kind.index()].buckets[bucket] = Some(id),
        }
    }

    fn unlink_from_bucket(
        &mut self,
        kind: RuntimeAssumptionKind,
        bucket: usize,
        id: AssumptionId,
    ) -> Result<(), AssumptionError> {
        let next = self.nodes[idx(id)].next_in_bucket;
        let mut prev = None;
        let mut cursor = self.tables[kind.index()].buckets[bucket];
        while let Some(current) = cursor {
            if current == id {
                match prev {
                    Some(prev) => self.nodes[idx(prev)].next_in_bucket = next,
                    None => self.tables[kind.index()].buckets[bucket] = next,
                }
                self.nodes[idx(id)].next_in_bucket = None;
                return Ok(());
            }
            prev = Some(current);
            cursor = self.nodes[idx(current)].next_in_bucket;
        }

        Err(AssumptionError::InternalConsistency(
            "assumption was not in the bucket of its key",
        ))
    }

    /// Take the assumption out of its body's circular list.
    /// Any other marked node met along the way is taken out too, and a marked sentinel is freed
    /// since nothing else refers to it.
    fn dequeue_from_body(&mut self, id: AssumptionId) -> Result<(), AssumptionError> {
        let mut current = self.nodes[idx(id)]
            .next_in_body
            .ok_or(AssumptionError::InternalConsistency(
                "assumption must be queued when it is dequeued",
            ))?;
        let mut prev = id;
        while current != id {
            let next = self.nodes[idx(current)].next_in_body.ok_or(
                AssumptionError::InternalConsistency("body assumption list is not circular"),
            )?;
            if self.nodes[idx(current)].marked {
                self.nodes[idx(prev)].next_in_body = Some(next);
                self.nodes[idx(current)].next_in_body = None;
                if matches!(self.nodes[idx(current)].entry, NodeEntry::Sentinel(_)) {
                    self.free_node(current);
                }
            } else {
                prev = current;
            }
            current = next;
        }

        // Completed a full circle
        let after = self.nodes[idx(id)].next_in_body;
        self.nodes[idx(prev)].next_in_body = after;
        self.nodes[idx(id)].next_in_body = None;

        if let NodeEntry::Assumption(assumption) = &self.nodes[idx(id)].entry {
            tracing::debug!(
                "Deleting {} assumption key={:#x}",
                assumption.kind().name(),
                assumption.key()
            );
        }

        Ok(())
    }

    /// The live assumptions in the bucket that `key` hashes to.
    /// Marked assumptions are skipped, and entries with other keys that share the bucket are
    /// included.
    pub fn find_bucket(
        &self,
        kind: RuntimeAssumptionKind,
        key: usize,
    ) -> impl Iterator<Item = (AssumptionId, &RuntimeAssumption)> + '_ {
        self.raw_bucket(kind, key)
            .filter(|(_, _, marked)| !marked)
            .map(|(id, assumption, _)| (id, assumption))
    }

    /// Every assumption in the bucket that `key` hashes to, with whether it is marked
    pub fn raw_bucket(
        &self,
        kind: RuntimeAssumptionKind,
        key: usize,
    ) -> impl Iterator<Item = (AssumptionId, &RuntimeAssumption, bool)> + '_ {
        let table = &self.tables[kind.index()];
        self.bucket_iter(table.buckets[table.bucket(key)])
    }

    fn bucket_iter(
        &self,
        head: Option<AssumptionId>,
    ) -> impl Iterator<Item = (AssumptionId, &RuntimeAssumption, bool)> + '_ {
        let mut cursor = head;
        std::iter::from_fn(move || loop {
            let id = cursor?;
            let node = &self.nodes[idx(id)];
            cursor = node.next_in_bucket;
            if let NodeEntry::Assumption(assumption) = &node.entry {
                return Some((id, assumption, node.marked));
            }
        })
    }

    /// The assumptions still on the body's list (marked ones included, until they are
    /// reclaimed)
    #[must_use]
    pub fn body_assumptions(&self, body: BodyId) -> Vec<AssumptionId> {
        let mut result = Vec::new();
        if let Some(sentinel) = self.body_sentinels.get(&body) {
            let mut cursor = self.nodes[idx(*sentinel)].next_in_body;
            while let Some(id) = cursor {
                if id == *sentinel {
                    break;
                }
                result.push(id);
                cursor = self.nodes[idx(id)].next_in_body;
            }
        }
        result
    }

    /// Whether the body still has a sentinel, which is the case until all of its assumptions
    /// have been detached
    #[must_use]
    pub fn has_body(&self, body: BodyId) -> bool {
        self.body_sentinels.contains_key(&body)
    }

    /// Mark an assumption so that lookups skip it, to be unlinked by
    /// [`reclaim_marked`](AssumptionTables::reclaim_marked)
    pub fn mark_for_detach(&mut self, id: AssumptionId) -> Result<(), AssumptionError> {
        let (kind, key) = match &self.nodes[idx(id)].entry {
            NodeEntry::Assumption(assumption) => (assumption.kind(), assumption.key()),
            _ => {
                return Err(AssumptionError::InternalConsistency(
                    "only assumptions can be marked for detach",
                ))
            }
        };
        if self.nodes[idx(id)].marked {
            return Ok(());
        }

        let table = &mut self.tables[kind.index()];
        let bucket = table.bucket(key);
        table.detach_pending = true;
        table.marked_counts[bucket] += 1;
        self.nodes[idx(id)].marked = true;
        self.marked += 1;
        Ok(())
    }

    /// Unlink and free marked assumptions, stopping after `budget` of them.
    /// Only kinds with pending detaches, and only buckets with marked entries, are walked.
    pub fn reclaim_marked(&mut self, budget: usize) -> Result<usize, AssumptionError> {
        let mut remaining = budget;
        if self.marked == 0 {
            return Ok(0);
        }

        for kind in RuntimeAssumptionKind::ALL {
            if self.marked == 0 || remaining == 0 {
                break;
            }
            let k = kind.index();
            if !self.tables[k].detach_pending {
                continue;
            }

            let mut fully_cleaned = true;
            for bucket in 0..self.tables[k].buckets.len() {
                if remaining == 0 {
                    fully_cleaned = false;
                    break;
                }

                let mut prev: Option<AssumptionId> = None;
                let mut cursor = self.tables[k].buckets[bucket];
                while let Some(current) = cursor {
                    if remaining == 0 || self.tables[k].marked_counts[bucket] == 0 {
                        break;
                    }

                    let next = self.nodes[idx(current)].next_in_bucket;
                    if self.nodes[idx(current)].marked {
                        if let Some(prev) = prev {
                            self.nodes[idx(prev)].next_in_bucket = next;
                        } else if self.tables[k].buckets[bucket] == Some(current) {
                            self.tables[k].buckets[bucket] = next;
                        } else {
                            return Err(AssumptionError::InternalConsistency(
                                "bucket head is not the cursor",
                            ));
                        }

                        if self.nodes[idx(current)].next_in_body.is_some() {
                            self.dequeue_from_body(current)?;
                        }

                        self.tables[k].marked_counts[bucket] -= 1;
                        self.tables[k].reclaimed_count += 1;
                        self.marked -= 1;
                        self.free_node(current);
                        remaining -= 1;
                    } else {
                        prev = Some(current);
                    }
                    cursor = next;
                }

                if self.tables[k].marked_counts[bucket] != 0 {
                    fully_cleaned = false;
                }
            }

            if fully_cleaned {
                self.tables[k].detach_pending = false;
            }
        }

        let reclaimed = budget - remaining;
        tracing::trace!("Reclaimed {} marked assumptions", reclaimed);
        Ok(reclaimed)
    }

    /// Compensate and free every assumption, except those on native registration.
    /// This is for shaking out code which is missing a guard.
    fn purge(&mut self) -> Result<(), AssumptionError> {
        tracing::info!("Purging the runtime assumption table");
        for kind in RuntimeAssumptionKind::ALL {
            if kind == RuntimeAssumptionKind::RegisterNative {
                continue;
            }

            let k = kind.index();
            for bucket in 0..self.tables[k].buckets.len() {
                while let Some(head) = self.tables[k].buckets[bucket] {
                    let node = &self.nodes[idx(head)];
                    let next = node.next_in_bucket;
                    let marked = node.marked;
                    if let NodeEntry::Assumption(assumption) = &node.entry {
                        assumption.compensate(self.target, &mut self.code, None)?;
                    }
                    if self.nodes[idx(head)].next_in_body.is_some() {
                        self.dequeue_from_body(head)?;
                    }
                    if marked {
                        self.tables[k].marked_counts[bucket] -= 1;
                        self.marked -= 1;
                    }

                    self.tables[k].buckets[bucket] = next;
                    self.tables[k].reclaimed_count += 1;
                    self.free_node(head);
                }
            }
            self.tables[k].detach_pending = false;
        }

        Ok(())
    }

    fn compensate(
        &mut self,
        id: AssumptionId,
        value: Option<usize>,
    ) -> Result<(), AssumptionError> {
        if let NodeEntry::Assumption(assumption) = &self.nodes[idx(id)].entry {
            assumption.compensate(self.target, &mut self.code, value)?;
        }
        Ok(())
    }

    /// Live assumptions of the kind with exactly this key that pass the filter
    fn matching(
        &self,
        kind: RuntimeAssumptionKind,
        key: usize,
        filter: impl Fn(&RuntimeAssumption) -> bool,
    ) -> SmallVec<[AssumptionId; 8]> {
        self.find_bucket(kind, key)
            .filter(|(_, assumption)| assumption.matches(key) && filter(assumption))
            .map(|(id, _)| id)
            .collect()
    }

    /// Compensate every live assumption of the kind on `key` and mark them for detach.
    /// Returns how many there were.
    pub fn notify_event(
        &mut self,
        kind: RuntimeAssumptionKind,
        key: usize,
        value: Option<usize>,
    ) -> Result<usize, AssumptionError> {
        let ids = self.matching(kind, key, |_| true);
        for id in &ids {
            self.compensate(*id, value)?;
            self.mark_for_detach(*id)?;
        }

        if !ids.is_empty() {
            tracing::debug!(
                "Compensated {} {} assumptions for key={:#x}",
                ids.len(),
                kind.name(),
                key
            );
        }
        Ok(ids.len())
    }

    pub fn notify_class_extend_event(&mut self, class: ClassId) -> Result<usize, AssumptionError> {
        self.notify_event(RuntimeAssumptionKind::ClassExtend, class.get(), None)
    }

    pub fn notify_method_override_event(
        &mut self,
        method: MethodId,
    ) -> Result<usize, AssumptionError> {
        self.notify_event(RuntimeAssumptionKind::MethodOverride, method.get(), None)
    }

    /// `key` identifies the class by name, since it may not have been loaded
    pub fn notify_class_pre_initialize_event(
        &mut self,
        key: usize,
    ) -> Result<usize, AssumptionError> {
        self.notify_event(RuntimeAssumptionKind::ClassPreInitialize, key, None)
    }

    /// Patch the call sites of `method` to call `address` directly
    pub fn notify_register_native_event(
        &mut self,
        method: MethodId,
        address: usize,
    ) -> Result<usize, AssumptionError> {
        self.notify_event(
            RuntimeAssumptionKind::RegisterNative,
            method.get(),
            Some(address),
        )
    }

    pub fn notify_method_breakpoint_event(
        &mut self,
        method: MethodId,
    ) -> Result<usize, AssumptionError> {
        self.notify_event(RuntimeAssumptionKind::MethodBreakpoint, method.get(), None)
    }

    pub fn notify_profiling_value_event(&mut self, key: usize) -> Result<usize, AssumptionError> {
        self.notify_event(RuntimeAssumptionKind::JProfilingValue, key, None)
    }

    pub fn notify_mutable_call_site_change_event(
        &mut self,
        cookie: usize,
    ) -> Result<usize, AssumptionError> {
        self.notify_event(RuntimeAssumptionKind::MutableCallSiteChange, cookie, None)
    }

    /// A static final field of `class` was written to
    pub fn notify_illegal_static_final_field_modification_event(
        &mut self,
        class: ClassId,
    ) -> Result<usize, AssumptionError> {
        let count = self.notify_event(
            RuntimeAssumptionKind::StaticFinalFieldModification,
            class.get(),
            None,
        )?;
        if count == 0 {
            tracing::warn!(
                "Static final modification key {:#x} not registered",
                class.get()
            );
        }
        Ok(count)
    }

    /// `unloaded` is being unloaded, and `assuming` had PIC sites that may cache it.
    /// Sites caching the unloaded class are invalidated. When the assuming class itself is the one
    /// going away, all of its sites are invalidated and detached.
    pub fn notify_class_unload_event(
        &mut self,
        assuming: ClassId,
        unloaded: ClassId,
    ) -> Result<usize, AssumptionError> {
        let assuming_is_unloaded = assuming == unloaded;
        let ids = self.matching(RuntimeAssumptionKind::ClassUnload, assuming.get(), |a| {
            match a.site() {
                PatchSite::UnloadedClassPic { pic_value, .. } => {
                    assuming_is_unloaded || *pic_value == unloaded.get()
                }
                _ => false,
            }
        });

        for id in &ids {
            self.compensate(*id, None)?;
            if assuming_is_unloaded {
                self.mark_for_detach(*id)?;
            }
        }

        Ok(ids.len())
    }

    /// `old` was replaced by `new`.
    /// Resolved PIC sites are rewritten and rekeyed, nop guards are patched and detached, and
    /// unresolved PIC sites which currently hold `old` are rewritten to hold `new`.
    pub fn notify_class_redefinition_event(
        &mut self,
        old: ClassId,
        new: ClassId,
    ) -> Result<(), AssumptionError> {
        let (old_key, new_key) = (old.get(), new.get());

        let pic_kind = RuntimeAssumptionKind::ClassRedefinitionPic;
        let ids = self.matching(pic_kind, old_key, |_| true);
        if ids.is_empty() {
            tracing::trace!("Old key {:#x} not registered with PIC", old_key);
        }
        let old_bucket = self.tables[pic_kind.index()].bucket(old_key);
        let new_bucket = self.tables[pic_kind.index()].bucket(new_key);
        for id in ids {
            self.compensate(id, Some(new_key))?;
            if let NodeEntry::Assumption(assumption) = &mut self.nodes[idx(id)].entry {
                assumption.set_key(new_key);
            }

            // The new key may hash differently
            if old_bucket != new_bucket {
                self.unlink_from_bucket(pic_kind, old_bucket, id)?;
                self.link_into_bucket(pic_kind, new_bucket, id);
            }
        }

        let nop_count = self.notify_event(RuntimeAssumptionKind::ClassRedefinitionNop, old_key, None)?;
        if nop_count == 0 {
            tracing::trace!("Old key {:#x} not registered with NOP", old_key);
        }

        self.patch_unresolved_pics(old_key as u64, new_key as u64)
    }

    /// Unresolved PIC sites are found by what they currently hold, so every one is looked at
    fn patch_unresolved_pics(&mut self, old: u64, new: u64) -> Result<(), AssumptionError> {
        let table = &self.tables[RuntimeAssumptionKind::ClassRedefinitionUpic.index()];
        let sites: Vec<(usize, bool)> = table
            .buckets
            .iter()
            .flat_map(|head| self.bucket_iter(*head))
            .filter(|(_, _, marked)| !marked)
            .filter_map(|(_, assumption, _)| match assumption.site() {
                PatchSite::RedefinedClassUpic {
                    location,
                    materialization,
                } => Some((*location, *materialization)),
                _ => None,
            })
            .collect();

        for (location, materialization) in sites {
            if !materialization {
                if self.code.read_u64(location)? == old {
                    tracing::trace!("Patching unresolved PIC data at {:#x}", location);
                    self.code.write_u64(location, new)?;
                }
                continue;
            }

            let len = self.target.materialization_len();
            let mut code = read_vec(&self.code, location, len)?;
            match self.target.decode_materialization(&code) {
                Some(value) if value == old => {
                    tracing::trace!("Patching unresolved PIC materialization at {:#x}", location);
                    self.target.encode_materialization(&mut code, new);
                    self.code.write_bytes(location, &code)?;
                }
                Some(_) => {}
                None => {
                    self.unrecognized_patterns += 1;
                    tracing::warn!(
                        "Unresolved PIC site at {:#x} is not a recognized address materialization",
                        location
                    );
                }
            }
        }

        Ok(())
    }

    /// Mark every assumption which patches code inside of the body, and detach the body's list
    /// if nothing is left on it.
    /// Assumptions outside of the body (which are expected to only be redefinition assumptions
    /// on persistent method information) are left alone.
    pub fn mark_assumptions_and_detach(
        &mut self,
        body: &BodyRange,
        reclaim_pre_prologue: bool,
    ) -> Result<(), AssumptionError> {
        self.detach_body(body.body, Some(body), reclaim_pre_prologue)
    }

    /// Like [`mark_assumptions_and_detach`](AssumptionTables::mark_assumptions_and_detach), but
    /// without a range everything is marked, such as when the compilation failed.
    pub fn reclaim_assumptions(
        &mut self,
        body: BodyId,
        range: Option<&BodyRange>,
        reclaim_pre_prologue: bool,
    ) -> Result<(), AssumptionError> {
        self.detach_body(body, range, reclaim_pre_prologue)
    }

    fn detach_body(
        &mut self,
        body: BodyId,
        range: Option<&BodyRange>,
        reclaim_pre_prologue: bool,
    ) -> Result<(), AssumptionError> {
        let sentinel = if let Some(sentinel) = self.body_sentinels.get(&body) {
            *sentinel
        } else {
            return Ok(());
        };

        let mut entries_remain = false;
        for id in self.body_assumptions(body) {
            let (kind, key, pc) = match &self.nodes[idx(id)].entry {
                NodeEntry::Assumption(a) => (a.kind(), a.key(), a.site().assuming_pc()),
                _ => {
                    return Err(AssumptionError::InternalConsistency(
                        "body list holds a node which is not an assumption",
                    ))
                }
            };

            if range.map_or(true, |range| range.is_assuming(pc, reclaim_pre_prologue)) {
                self.mark_for_detach(id)?;
            } else {
                entries_remain = true;
                if !kind.is_redefinition() {
                    tracing::error!(
                        "Non redefinition assumption (kind={} key={:#x} pc={:#x}) left after reclaiming body {:#x}",
                        kind.name(),
                        key,
                        pc,
                        body.get()
                    );
                }
            }
        }

        if !entries_remain {
            self.nodes[idx(sentinel)].marked = true;
            self.body_sentinels.remove(&body);
        }

        Ok(())
    }

    /// Number of live assumptions in every table
    #[must_use]
    pub fn count_rat_assumptions(&self) -> usize {
        self.tables
            .iter()
            .map(|table| {
                table
                    .buckets
                    .iter()
                    .map(|head| {
                        self.bucket_iter(*head)
                            .filter(|(_, _, marked)| !marked)
                            .count()
                    })
                    .sum::<usize>()
            })
            .sum()
    }
}
