//! Questions compilations ask of the class table.
//! Everything here is capped so that a huge hierarchy can't make a compilation stall, and going
//! over the cap always gives the conservative answer.

use rhojit_base::{
    id::{BodyId, ClassId},
    util::new_address_hash_set,
};
use smallvec::SmallVec;

use super::{
    class_info::PersistentClassInfo,
    visitor::{walk_subclasses, CollectClasses, SubclassVisitor},
    ActiveClassTable, ClassHost, MethodResolver, ResolvedMethodInfo,
};
use crate::{
    assumption::{RuntimeAssumption, RuntimeAssumptionKind},
    code_memory::CodeMemory,
    guards::VirtualGuardSite,
    rat::AssumptionTables,
    AssumptionError, Hotness,
};

/// Looks for exactly one instantiable subclass, failing on a second one or on visiting too many
struct FindSingleConcrete<'a> {
    host: &'a dyn ClassHost,
    max_visited: usize,
    visited: usize,
    concrete: Option<ClassId>,
    failed: bool,
}
impl<'a> SubclassVisitor for FindSingleConcrete<'a> {
    fn visit_subclass(&mut self, info: &PersistentClassInfo, _depth: usize) -> bool {
        self.visited += 1;
        if self.visited > self.max_visited {
            self.failed = true;
            return false;
        }

        let class = info.class();
        if !self.host.is_abstract(class) && !self.host.is_interface(class) {
            if self.concrete.is_some() {
                self.failed = true;
                return false;
            }
            self.concrete = Some(class);
        }

        true
    }

    fn should_stop(&self) -> bool {
        self.failed
    }
}

/// The result of collecting the distinct implementations of a dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedImplementors {
    /// The number of distinct implementations.
    /// This is larger than the cap that was asked for if the collection gave up, in which case
    /// `methods` should not be relied on.
    pub count: usize,
    pub methods: SmallVec<[ResolvedMethodInfo; 4]>,
}
impl CollectedImplementors {
    fn gave_up(max_count: usize) -> CollectedImplementors {
        CollectedImplementors {
            count: max_count + 1,
            methods: SmallVec::new(),
        }
    }

    /// The single implementation, if there was exactly one
    #[must_use]
    pub fn single(&self) -> Option<ResolvedMethodInfo> {
        if self.count == 1 {
            self.methods.first().copied()
        } else {
            None
        }
    }
}

struct CollectImplementors<'a> {
    host: &'a dyn ClassHost,
    resolver: &'a dyn MethodResolver,
    use_interface: bool,
    slot: u32,
    max_count: usize,
    max_visited: usize,
    visited: usize,
    methods: SmallVec<[ResolvedMethodInfo; 4]>,
    failed: bool,
    stop: bool,
    /// Only keep compiled methods at or above this hotness
    compiled_at: Option<Hotness>,
}
impl<'a> CollectImplementors<'a> {
    fn count(&self) -> usize {
        if self.failed {
            self.max_count + 1
        } else {
            self.methods.len()
        }
    }

    fn finish(self) -> CollectedImplementors {
        CollectedImplementors {
            count: self.count(),
            methods: self.methods,
        }
    }
}
impl<'a> SubclassVisitor for CollectImplementors<'a> {
    fn visit_subclass(&mut self, info: &PersistentClassInfo, _depth: usize) -> bool {
        let class = info.class();
        if self.host.is_abstract(class) || self.host.is_interface(class) {
            return true;
        }

        let method = if self.use_interface {
            self.resolver.resolved_interface_method(class, self.slot)
        } else {
            self.resolver.resolved_virtual_method(class, self.slot)
        };

        self.visited += 1;
        let method = match method {
            Some(method) if self.visited <= self.max_visited => method,
            _ => {
                self.failed = true;
                self.stop = true;
                return false;
            }
        };

        if self.methods.iter().any(|known| known.method == method.method) {
            return true;
        }

        self.methods.push(method);
        if let Some(threshold) = self.compiled_at {
            let hot_enough = method.compiled && method.hotness.map_or(false, |h| h >= threshold);
            if !hot_enough {
                self.methods.pop();
            } else if self.methods.len() + 1 >= self.max_count {
                // The compiled collection runs with one more than was asked for
                self.stop = true;
            }
        } else if self.methods.len() >= self.max_count {
            self.stop = true;
        }

        true
    }

    fn should_stop(&self) -> bool {
        self.stop
    }
}

impl<'a> ActiveClassTable<'a> {
    fn run_implementor_collection(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        max_count: usize,
        slot: u32,
        use_interface: Option<bool>,
        compiled_at: Option<Hotness>,
    ) -> CollectedImplementors {
        if self.ch_opts_disabled() {
            return CollectedImplementors::gave_up(max_count);
        }

        let info = if let Some(info) = self.find_class_info(class) {
            info
        } else {
            return CollectedImplementors::gave_up(max_count);
        };

        let mut collector = CollectImplementors {
            host,
            resolver,
            use_interface: use_interface.unwrap_or_else(|| host.is_interface(class)),
            slot,
            max_count,
            max_visited: self.max_visited(),
            visited: 0,
            methods: SmallVec::new(),
            failed: false,
            stop: false,
            compiled_at,
        };

        // The root itself is an implementor too
        collector.visit_subclass(info, 0);
        if !collector.should_stop() {
            walk_subclasses(self.classes(), host, class, &mut collector);
        }

        let result = collector.finish();
        tracing::trace!(
            "Collected {} implementors of slot {} under {}",
            result.count,
            slot,
            host.class_name(class)
        );
        result
    }

    /// Collect up to `max_count` distinct methods that the slot resolves to in `class` and
    /// its subclasses.
    /// `use_interface` overrides whether the slot is an interface method index, otherwise it is
    /// one when `class` is an interface.
    pub fn collect_implementors_capped(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        max_count: usize,
        slot: u32,
        use_interface: Option<bool>,
    ) -> CollectedImplementors {
        self.run_implementor_collection(host, resolver, class, max_count, slot, use_interface, None)
    }

    /// Like [`collect_implementors_capped`](ActiveClassTable::collect_implementors_capped), but
    /// only compiled methods at or above `hotness` are kept.
    pub fn collect_compiled_implementors_capped(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        max_count: usize,
        slot: u32,
        hotness: Hotness,
        use_interface: Option<bool>,
    ) -> CollectedImplementors {
        let mut result = self.run_implementor_collection(
            host,
            resolver,
            class,
            max_count + 1,
            slot,
            use_interface,
            Some(hotness),
        );
        if result.count > max_count {
            result.count = max_count + 1;
        }
        result
    }

    /// The subclasses (at any depth) which have no subclasses of their own
    #[must_use]
    pub fn collect_leafs(&self, host: &dyn ClassHost, class: ClassId) -> Vec<ClassId> {
        let mut collect =
            CollectClasses::new(|info| info.sub_classes().is_empty().then(|| true), None);
        walk_subclasses(self.classes(), host, class, &mut collect);
        collect.classes
    }

    /// Every subclass at any depth, each listed once
    #[must_use]
    pub fn collect_all_sub_classes(&self, host: &dyn ClassHost, class: ClassId) -> Vec<ClassId> {
        let mut seen = new_address_hash_set();
        let mut collect = CollectClasses::new(|info| seen.insert(info.class()).then(|| true), None);
        walk_subclasses(self.classes(), host, class, &mut collect);
        collect.classes
    }

    /// The subclasses which are not interfaces.
    /// The walk goes through interfaces to find the classes implementing them, but not through
    /// the classes it collects.
    #[must_use]
    pub fn collect_all_non_if_sub_classes(
        &self,
        host: &dyn ClassHost,
        class: ClassId,
    ) -> Vec<ClassId> {
        let mut collect = CollectClasses::new(
            |info| (!host.is_interface(info.class())).then(|| false),
            None,
        );
        walk_subclasses(self.classes(), host, class, &mut collect);
        collect.classes
    }

    /// Count the non interface subclasses at any depth, stopping once `max` is reached
    #[must_use]
    pub fn count_all_non_if_sub_classes_with_depth(
        &self,
        host: &dyn ClassHost,
        class: ClassId,
        max: usize,
    ) -> usize {
        let mut collect = CollectClasses::new(
            |info| (!host.is_interface(info.class())).then(|| true),
            Some(max),
        );
        walk_subclasses(self.classes(), host, class, &mut collect);
        collect.classes.len()
    }

    /// The only subclass which can be instantiated, if there is exactly one
    #[must_use]
    pub fn find_single_concrete_sub_class(
        &self,
        host: &dyn ClassHost,
        class: ClassId,
    ) -> Option<ClassId> {
        if self.ch_opts_disabled() {
            return None;
        }

        let mut find = FindSingleConcrete {
            host,
            max_visited: self.max_visited(),
            visited: 0,
            concrete: None,
            failed: false,
        };
        walk_subclasses(self.classes(), host, class, &mut find);

        if find.failed {
            None
        } else {
            find.concrete
        }
    }

    /// The method that every instance of `class` dispatches `slot` to, if there's only one
    pub fn find_single_implementer(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        slot: u32,
        use_interface: Option<bool>,
    ) -> Option<ResolvedMethodInfo> {
        self.collect_implementors_capped(host, resolver, class, 2, slot, use_interface)
            .single()
    }

    pub fn find_single_interface_implementer(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        interface: ClassId,
        index: u32,
    ) -> Option<ResolvedMethodInfo> {
        self.find_single_implementer(host, resolver, interface, index, Some(true))
    }

    pub fn find_single_abstract_implementer(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        slot: u32,
    ) -> Option<ResolvedMethodInfo> {
        self.find_single_implementer(host, resolver, class, slot, Some(false))
    }

    /// The single implementation, when it is compiled at or above the configured hotness.
    /// An implementation that is still interpreted anywhere in the hierarchy means there is no
    /// answer, rather than the answer being whichever one is compiled.
    pub fn find_single_jitted_implementer(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        slot: u32,
        use_interface: Option<bool>,
    ) -> Option<ResolvedMethodInfo> {
        let threshold = self.jitted_threshold();
        self.find_single_implementer(host, resolver, class, slot, use_interface)
            .filter(|method| {
                method.compiled && method.hotness.map_or(false, |hotness| hotness >= threshold)
            })
    }

    pub fn has_three_or_more_compiled_implementors(
        &self,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        slot: u32,
        hotness: Hotness,
    ) -> bool {
        self.collect_compiled_implementors_capped(host, resolver, class, 3, slot, hotness, None)
            .count
            >= 3
    }

    /// Register a class extend nop guard at each site on `class` and on every subclass of it,
    /// so that loading a new class anywhere below `class` patches the sites.
    pub fn add_an_assumption_for_each_sub_class<M: CodeMemory>(
        &self,
        host: &dyn ClassHost,
        assumptions: &mut AssumptionTables<M>,
        class: ClassId,
        sites: &[VirtualGuardSite],
        body: BodyId,
    ) -> Result<usize, AssumptionError> {
        let mut classes = self.collect_all_sub_classes(host, class);
        classes.push(class);

        let mut count = 0;
        for site in sites {
            for class in &classes {
                assumptions.add_assumption(
                    RuntimeAssumption::nop_guard(
                        RuntimeAssumptionKind::ClassExtend,
                        class.get(),
                        site.location,
                        site.destination,
                    ),
                    body,
                )?;
                count += 1;
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use rhojit_base::id::{BodyId, ClassId, MethodId};

    use crate::{
        assumption::RuntimeAssumptionKind,
        chtable::{
            tests::{compiled, interpreted, TestHost},
            PersistentChTable,
        },
        code_memory::BufferCodeMemory,
        guards::VirtualGuardSite,
        rat::AssumptionTable,
        Hotness, JitConfig,
    };

    const SLOT: usize = 3;

    /// `Object <- A <- {B, C}` with `C <- D`
    fn hierarchy() -> (TestHost, [ClassId; 5]) {
        let mut host = TestHost::new();
        let object = host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let b = host.add(0x300, "B", Some(0x200));
        let c = host.add(0x400, "C", Some(0x200));
        let d = host.add(0x500, "D", Some(0x400));
        (host, [object, a, b, c, d])
    }

    #[test]
    fn test_single_jitted_implementer() {
        let (mut host, [_, a, b, c, d]) = hierarchy();
        host.class_mut(a).is_abstract = true;
        let foo = compiled(0x7000, Hotness::Warm);
        for class in [b, c, d] {
            host.set_method(class, SLOT, foo);
        }

        let table = PersistentChTable::new(&JitConfig::new());
        table.activate(&host);
        let active = table.active().unwrap();
        assert_eq!(
            active.find_single_jitted_implementer(&host, &host, a, SLOT as u32, None),
            Some(foo)
        );

        // A second distinct compiled override
        host.set_method(d, SLOT, compiled(0x7100, Hotness::Hot));
        assert_eq!(
            active.find_single_jitted_implementer(&host, &host, a, SLOT as u32, None),
            None
        );
        let collected = active.collect_implementors_capped(&host, &host, a, 2, SLOT as u32, None);
        assert_eq!(collected.count, 2);
    }

    #[test]
    fn test_jitted_implementer_must_be_compiled() {
        let (mut host, [_, a, b, c, d]) = hierarchy();
        host.class_mut(a).is_abstract = true;
        for class in [b, c, d] {
            host.set_method(class, SLOT, interpreted(0x7000));
        }

        let table = PersistentChTable::new(&JitConfig::new());
        table.activate(&host);
        let active = table.active().unwrap();
        assert_eq!(
            active.find_single_jitted_implementer(&host, &host, a, SLOT as u32, None),
            None
        );
        assert_eq!(
            active.find_single_implementer(&host, &host, a, SLOT as u32, None),
            Some(interpreted(0x7000))
        );
    }

    #[test]
    fn test_visit_cap() {
        let (mut host, [_, a, b, c, d]) = hierarchy();
        let foo = compiled(0x7000, Hotness::Scorching);
        for class in [a, b, c, d] {
            host.set_method(class, SLOT, foo);
        }

        let mut config = JitConfig::new();
        config.max_visited_subclasses = 2;
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let active = table.active().unwrap();

        let collected = active.collect_implementors_capped(&host, &host, a, 2, SLOT as u32, None);
        assert_eq!(collected.count, 3);
        assert_eq!(
            active.find_single_jitted_implementer(&host, &host, a, SLOT as u32, None),
            None
        );
        // Within the cap it's fine
        assert_eq!(
            active.find_single_jitted_implementer(&host, &host, c, SLOT as u32, None),
            Some(foo)
        );
    }

    #[test]
    fn test_single_concrete_sub_class_visit_cap() {
        let (mut host, [_, a, b, c, d]) = hierarchy();
        for class in [a, b, c] {
            host.class_mut(class).is_abstract = true;
        }

        let table = PersistentChTable::new(&JitConfig::new());
        table.activate(&host);
        let active = table.active().unwrap();
        assert_eq!(active.find_single_concrete_sub_class(&host, a), Some(d));

        // D is the only concrete class, but finding it means visiting three subclasses of A
        let mut config = JitConfig::new();
        config.max_visited_subclasses = 2;
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let active = table.active().unwrap();
        assert_eq!(active.find_single_concrete_sub_class(&host, a), None);
        assert_eq!(active.find_single_concrete_sub_class(&host, c), Some(d));
    }

    #[test]
    fn test_ch_opts_disabled() {
        let (mut host, [_, a, ..]) = hierarchy();
        host.set_method(a, SLOT, compiled(0x7000, Hotness::Hot));
        let mut config = JitConfig::new();
        config.disable_ch_opts = true;
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let active = table.active().unwrap();

        let collected = active.collect_implementors_capped(&host, &host, a, 4, SLOT as u32, None);
        assert_eq!(collected.count, 5);
        assert_eq!(active.find_single_concrete_sub_class(&host, a), None);
    }

    #[test]
    fn test_compiled_implementors() {
        let (mut host, [_, a, b, c, d]) = hierarchy();
        host.class_mut(a).is_abstract = true;
        host.set_method(b, SLOT, compiled(0x7000, Hotness::Hot));
        host.set_method(c, SLOT, compiled(0x7100, Hotness::Cold));
        host.set_method(d, SLOT, compiled(0x7200, Hotness::VeryHot));

        let table = PersistentChTable::new(&JitConfig::new());
        table.activate(&host);
        let active = table.active().unwrap();

        let collected = active.collect_compiled_implementors_capped(
            &host,
            &host,
            a,
            3,
            SLOT as u32,
            Hotness::Warm,
            None,
        );
        assert_eq!(collected.count, 2);
        assert_eq!(
            collected
                .methods
                .iter()
                .map(|m| m.method)
                .collect::<Vec<_>>(),
            vec![MethodId::new_unchecked(0x7000), MethodId::new_unchecked(0x7200)]
        );
        assert!(active.has_three_or_more_compiled_implementors(
            &host,
            &host,
            a,
            SLOT as u32,
            Hotness::Cold
        ));
    }

    #[test]
    fn test_sub_class_collections() {
        let (mut host, [object, a, b, c, d]) = hierarchy();
        let iface = host.add(0x600, "I", Some(0x100));
        host.class_mut(iface).is_interface = true;
        let e = host.add(0x700, "E", Some(0x100));
        host.class_mut(e).interfaces.push(iface);
        host.class_mut(c).is_abstract = true;

        let table = PersistentChTable::new(&JitConfig::new());
        table.activate(&host);
        let active = table.active().unwrap();

        assert_eq!(active.collect_leafs(&host, a), vec![b, d]);
        assert_eq!(active.collect_all_sub_classes(&host, a), vec![b, c, d]);
        // Interfaces are walked through, but not collected
        assert_eq!(active.collect_all_non_if_sub_classes(&host, object), vec![a, e]);
        assert_eq!(active.count_all_non_if_sub_classes_with_depth(&host, object, 3), 3);
        assert_eq!(active.count_all_non_if_sub_classes_with_depth(&host, a, 10), 3);
        assert_eq!(active.find_single_concrete_sub_class(&host, c), Some(d));
        assert_eq!(active.find_single_concrete_sub_class(&host, a), None);
    }

    #[test]
    fn test_assumption_for_each_sub_class() {
        let (host, [_, a, b, c, d]) = hierarchy();
        let config = JitConfig::new();
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let active = table.active().unwrap();
        let rat = AssumptionTable::new(&config, BufferCodeMemory::new(0x1000, 0x100));
        let mut rat = rat.lock();

        let sites = [
            VirtualGuardSite {
                location: 0x1010,
                destination: 0x1040,
            },
            VirtualGuardSite {
                location: 0x1020,
                destination: 0x1040,
            },
        ];
        let count = active
            .add_an_assumption_for_each_sub_class(
                &host,
                &mut rat,
                a,
                &sites,
                BodyId::new_unchecked(9),
            )
            .unwrap();
        assert_eq!(count, 8);

        for class in [a, b, c, d] {
            assert_eq!(
                rat.find_bucket(RuntimeAssumptionKind::ClassExtend, class.get())
                    .count(),
                2
            );
        }
    }
}
