//! The persistent class hierarchy table.
//! This records the subclasses of every loaded class, which lets compilations ask questions like
//! "does this virtual call only ever go to one method" and then guard that answer with an
//! assumption.
//!
//! The table starts off inactive, and is seeded with the already loaded classes by
//! [`PersistentChTable::activate`]. After that it must be told about every class load.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rhojit_base::{
    id::{ClassId, MethodId},
    util::{new_address_hash_set, new_address_map, AddressHashSet, AddressMap},
};
use smallvec::SmallVec;

use crate::{
    code_memory::CodeMemory, rat::AssumptionTables, AssumptionError, ClassTableError, Hotness,
    JitConfig,
};

use self::class_info::{ClassInfoFlags, PersistentClassInfo};

pub mod class_info;
mod queries;
mod visitor;

pub use queries::CollectedImplementors;

/// What the class table needs from the class loading subsystem.
pub trait ClassHost {
    fn superclass(&self, class: ClassId) -> Option<ClassId>;

    /// The directly implemented interfaces
    fn interfaces(&self, class: ClassId) -> SmallVec<[ClassId; 4]>;

    /// The array class whose component is `class`, if it has been created
    fn array_class(&self, class: ClassId) -> Option<ClassId>;

    fn is_interface(&self, class: ClassId) -> bool;

    fn is_abstract(&self, class: ClassId) -> bool;

    /// Number of superclasses above the class. `java/lang/Object` is at depth 0.
    fn class_depth(&self, class: ClassId) -> usize;

    fn class_name(&self, class: ClassId) -> String;

    fn is_initialized(&self, class: ClassId) -> bool;

    /// Whether a subclass of the class has ever been loaded
    fn class_has_been_extended(&self, class: ClassId) -> bool;

    /// Whether the class has been replaced by a redefinition
    fn class_has_been_replaced(&self, class: ClassId) -> bool;

    /// Every currently loaded class, in load order
    fn loaded_classes(&self) -> Result<Vec<ClassId>, ClassTableError>;
}

/// A method that a class resolves a dispatch slot to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMethodInfo {
    pub method: MethodId,
    /// Whether a compiled body exists for the method
    pub compiled: bool,
    /// The hotness the method was last compiled at
    pub hotness: Option<Hotness>,
}

/// How dispatch slots resolve to methods.
pub trait MethodResolver {
    /// The method `class` has in the virtual table slot
    fn resolved_virtual_method(&self, class: ClassId, slot: u32) -> Option<ResolvedMethodInfo>;

    /// The method `class` uses for the interface method at `index`
    fn resolved_interface_method(&self, class: ClassId, index: u32)
        -> Option<ResolvedMethodInfo>;

    fn virtual_method_is_overridden(&self, method: MethodId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
    /// Seeding the table failed. It stays unusable after this.
    FailedToActivate = 3,
}
impl ActivationState {
    fn from_u8(value: u8) -> ActivationState {
        match value {
            0 => ActivationState::Inactive,
            1 => ActivationState::Activating,
            2 => ActivationState::Active,
            _ => ActivationState::FailedToActivate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationResult {
    Activated,
    AlreadyActive,
    Failed,
}

#[derive(Debug)]
pub struct ChState {
    classes: AddressMap<ClassId, PersistentClassInfo>,
}
impl ChState {
    fn add_class(&mut self, host: &dyn ClassHost, class: ClassId) -> Result<(), ClassTableError> {
        if self.classes.contains_key(&class) {
            return Err(ClassTableError::DuplicateClass(class));
        }

        self.classes
            .try_reserve(1)
            .map_err(|_| ClassTableError::AllocationFailure)?;

        let mut info = PersistentClassInfo::new(class);
        if let Ok(length) = u32::try_from(host.class_name(class).len()) {
            info.set_name_length(length);
        }
        if host.is_initialized(class) {
            info.set_initialized(0);
        }
        self.classes.insert(class, info);

        let mut parents: SmallVec<[ClassId; 4]> = host.interfaces(class);
        if let Some(super_id) = host.superclass(class) {
            parents.insert(0, super_id);
        }
        for parent in parents {
            if let Some(parent) = self.classes.get_mut(&parent) {
                parent.add_sub_class(class);
            }
        }

        Ok(())
    }

    /// Add the class along with every class it depends on, parents before children
    fn seed_class(
        &mut self,
        host: &dyn ClassHost,
        class: ClassId,
        seen: &mut AddressHashSet<ClassId>,
    ) -> Result<(), ClassTableError> {
        if !seen.insert(class) {
            return Ok(());
        }

        if let Some(super_id) = host.superclass(class) {
            self.seed_class(host, super_id, seen)?;
        }
        for interface in host.interfaces(class) {
            self.seed_class(host, interface, seen)?;
        }

        self.add_class(host, class)?;

        if let Some(array_class) = host.array_class(class) {
            self.seed_class(host, array_class, seen)?;
        }

        Ok(())
    }
}

pub struct PersistentChTable {
    activation: AtomicU8,
    state: Mutex<ChState>,
    max_visited: usize,
    disable_ch_opts: bool,
    jitted_threshold: Hotness,
}
impl PersistentChTable {
    #[must_use]
    pub fn new(config: &JitConfig) -> PersistentChTable {
        PersistentChTable {
            activation: AtomicU8::new(ActivationState::Inactive as u8),
            state: Mutex::new(ChState {
                classes: new_address_map(),
            }),
            max_visited: config.max_visited_subclasses,
            disable_ch_opts: config.disable_ch_opts,
            jitted_threshold: config.jitted_implementer_hotness,
        }
    }

    #[must_use]
    pub fn activation_state(&self) -> ActivationState {
        ActivationState::from_u8(self.activation.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.activation_state() == ActivationState::Active
    }

    /// Seed the table with every loaded class.
    /// Class loads that happen while this is running are not recorded by
    /// [`ActiveClassTable::class_got_loaded`], since the table isn't active yet, but they are
    /// found by the walk since it holds the table lock.
    pub fn activate(&self, host: &dyn ClassHost) -> ActivationResult {
        let mut state = self.state.lock();
        match self.activation_state() {
            ActivationState::Active => return ActivationResult::AlreadyActive,
            ActivationState::FailedToActivate => return ActivationResult::Failed,
            ActivationState::Inactive | ActivationState::Activating => {}
        }

        self.activation
            .store(ActivationState::Activating as u8, Ordering::Release);

        let result = host.loaded_classes().and_then(|classes| {
            let mut seen = new_address_hash_set();
            for class in classes {
                state.seed_class(host, class, &mut seen)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                tracing::info!("Class table activated with {} classes", state.classes.len());
                self.activation
                    .store(ActivationState::Active as u8, Ordering::Release);
                ActivationResult::Activated
            }
            Err(err) => {
                tracing::warn!("Failed to activate class table: {:?}", err);
                state.classes.clear();
                self.activation
                    .store(ActivationState::FailedToActivate as u8, Ordering::Release);
                ActivationResult::Failed
            }
        }
    }

    /// Lock the table, if it is active
    #[must_use]
    pub fn active(&self) -> Option<ActiveClassTable<'_>> {
        if !self.is_active() {
            return None;
        }

        let state = self.state.lock();
        Some(ActiveClassTable { table: self, state })
    }
}

/// The locked and active class table.
/// When the assumption table is also needed, take this first.
pub struct ActiveClassTable<'a> {
    table: &'a PersistentChTable,
    state: MutexGuard<'a, ChState>,
}
impl<'a> ActiveClassTable<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.classes.is_empty()
    }

    #[must_use]
    pub fn find_class_info(&self, class: ClassId) -> Option<&PersistentClassInfo> {
        self.state.classes.get(&class)
    }

    pub fn find_class_info_mut(&mut self, class: ClassId) -> Option<&mut PersistentClassInfo> {
        self.state.classes.get_mut(&class)
    }

    pub(crate) fn classes(&self) -> &AddressMap<ClassId, PersistentClassInfo> {
        &self.state.classes
    }

    pub(crate) fn max_visited(&self) -> usize {
        self.table.max_visited
    }

    pub(crate) fn ch_opts_disabled(&self) -> bool {
        self.table.disable_ch_opts
    }

    pub(crate) fn jitted_threshold(&self) -> Hotness {
        self.table.jitted_threshold
    }

    /// Record a newly loaded class under its superclass and interfaces.
    pub fn class_got_loaded(
        &mut self,
        host: &dyn ClassHost,
        class: ClassId,
    ) -> Result<(), ClassTableError> {
        tracing::trace!("Class loaded: {}", host.class_name(class));
        self.state.add_class(host, class)
    }

    /// Tell the assumption table that every class above `class` has now been extended
    pub fn notify_superclasses_of_extension<M: CodeMemory>(
        &self,
        host: &dyn ClassHost,
        class: ClassId,
        assumptions: &mut AssumptionTables<M>,
    ) -> Result<usize, AssumptionError> {
        let mut seen = new_address_hash_set();
        let mut pending: SmallVec<[ClassId; 8]> = SmallVec::new();
        pending.extend(host.superclass(class));
        pending.extend(host.interfaces(class));

        let mut count = 0;
        while let Some(parent) = pending.pop() {
            if !seen.insert(parent) {
                continue;
            }

            count += assumptions.notify_class_extend_event(parent)?;
            pending.extend(host.superclass(parent));
            pending.extend(host.interfaces(parent));
        }

        Ok(count)
    }

    /// Returns whether the class was known
    pub fn class_got_initialized(&mut self, class: ClassId, elapsed_ms: u64) -> bool {
        if let Some(info) = self.state.classes.get_mut(&class) {
            info.set_initialized(elapsed_ms);
            true
        } else {
            false
        }
    }

    /// Record `sub` under `class`, such as when the link was missed during load
    pub fn class_got_extended(&mut self, class: ClassId, sub: ClassId) -> bool {
        if let Some(info) = self.state.classes.get_mut(&class) {
            if !info.sub_classes().contains(&sub) {
                info.add_sub_class(sub);
            }
            true
        } else {
            false
        }
    }

    /// Mark the class as unloaded. Walks skip it from then on, and its parents drop it once
    /// [`remove_unloaded_sub_classes`](ActiveClassTable::remove_unloaded_sub_classes) is called.
    pub fn class_got_unloaded(&mut self, class: ClassId) -> bool {
        if let Some(info) = self.state.classes.get_mut(&class) {
            info.set_unloaded();
            true
        } else {
            false
        }
    }

    /// Drop every unloaded class from the subclass lists, and then from the table itself.
    /// Returns how many classes were removed.
    pub fn remove_unloaded_classes(&mut self) -> usize {
        let unloaded: AddressHashSet<ClassId> = self
            .state
            .classes
            .values()
            .filter(|info| info.is_unloaded())
            .map(PersistentClassInfo::class)
            .collect();
        if unloaded.is_empty() {
            return 0;
        }

        for info in self.state.classes.values_mut() {
            info.remove_unloaded_sub_classes(|sub| unloaded.contains(&sub));
        }
        self.state.classes.retain(|class, _| !unloaded.contains(class));

        unloaded.len()
    }

    /// Drop unloaded subclasses from the list of one class
    pub fn remove_unloaded_sub_classes(&mut self, class: ClassId) {
        let unloaded: SmallVec<[ClassId; 4]> = match self.state.classes.get(&class) {
            Some(info) => info
                .sub_classes()
                .iter()
                .copied()
                .filter(|sub| {
                    self.state
                        .classes
                        .get(sub)
                        .map_or(true, PersistentClassInfo::is_unloaded)
                })
                .collect(),
            None => return,
        };

        if let Some(info) = self.state.classes.get_mut(&class) {
            info.remove_unloaded_sub_classes(|sub| unloaded.contains(&sub));
        }
    }

    /// `old` was replaced by `new`. The new class takes over the subclasses of the old one.
    pub fn class_got_redefined(&mut self, old: ClassId, new: ClassId) {
        let sub_classes: SmallVec<[ClassId; 4]> = match self.state.classes.get_mut(&old) {
            Some(info) => {
                info.set_flag(ClassInfoFlags::REDEFINED);
                info.sub_classes().iter().copied().collect()
            }
            None => return,
        };

        if let Some(info) = self.state.classes.get_mut(&new) {
            for sub in sub_classes {
                if !info.sub_classes().contains(&sub) {
                    info.add_sub_class(sub);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;

    use rhojit_base::{
        id::{BodyId, ClassId, MethodId},
        util::{new_address_map, AddressMap},
    };
    use smallvec::SmallVec;

    use super::{
        ActivationResult, ActivationState, ClassHost, MethodResolver, PersistentChTable,
        ResolvedMethodInfo,
    };
    use crate::{
        assumption::RuntimeAssumption, code_memory::BufferCodeMemory, rat::AssumptionTable,
        ClassTableError, Hotness, JitConfig,
    };

    #[derive(Default, Clone)]
    pub(crate) struct TestClass {
        pub name: String,
        pub superclass: Option<ClassId>,
        pub interfaces: SmallVec<[ClassId; 4]>,
        pub array_class: Option<ClassId>,
        pub is_interface: bool,
        pub is_abstract: bool,
        pub depth: usize,
        pub extended: bool,
        /// virtual slot -> method
        pub methods: Vec<Option<ResolvedMethodInfo>>,
    }

    #[derive(Default)]
    pub(crate) struct TestHost {
        pub classes: AddressMap<ClassId, TestClass>,
        pub order: Vec<ClassId>,
        pub overridden: Vec<MethodId>,
        pub fail_walk: bool,
        pub walks: Cell<usize>,
    }
    impl TestHost {
        pub fn new() -> TestHost {
            TestHost {
                classes: new_address_map(),
                ..TestHost::default()
            }
        }

        pub fn add(&mut self, id: usize, name: &str, superclass: Option<usize>) -> ClassId {
            let id = ClassId::new_unchecked(id);
            let superclass = superclass.map(ClassId::new_unchecked);
            let depth = superclass
                .and_then(|s| self.classes.get(&s))
                .map_or(0, |s| s.depth + 1);
            if let Some(super_id) = superclass {
                if let Some(s) = self.classes.get_mut(&super_id) {
                    s.extended = true;
                }
            }
            self.classes.insert(
                id,
                TestClass {
                    name: name.to_owned(),
                    superclass,
                    depth,
                    ..TestClass::default()
                },
            );
            self.order.push(id);
            id
        }

        pub fn class_mut(&mut self, id: ClassId) -> &mut TestClass {
            self.classes.get_mut(&id).unwrap()
        }

        pub fn set_method(&mut self, class: ClassId, slot: usize, info: ResolvedMethodInfo) {
            let methods = &mut self.class_mut(class).methods;
            if methods.len() <= slot {
                methods.resize(slot + 1, None);
            }
            methods[slot] = Some(info);
        }
    }
    impl ClassHost for TestHost {
        fn superclass(&self, class: ClassId) -> Option<ClassId> {
            self.classes.get(&class).and_then(|c| c.superclass)
        }

        fn interfaces(&self, class: ClassId) -> SmallVec<[ClassId; 4]> {
            self.classes
                .get(&class)
                .map(|c| c.interfaces.clone())
                .unwrap_or_default()
        }

        fn array_class(&self, class: ClassId) -> Option<ClassId> {
            self.classes.get(&class).and_then(|c| c.array_class)
        }

        fn is_interface(&self, class: ClassId) -> bool {
            self.classes.get(&class).map_or(false, |c| c.is_interface)
        }

        fn is_abstract(&self, class: ClassId) -> bool {
            self.classes.get(&class).map_or(false, |c| c.is_abstract)
        }

        fn class_depth(&self, class: ClassId) -> usize {
            self.classes.get(&class).map_or(0, |c| c.depth)
        }

        fn class_name(&self, class: ClassId) -> String {
            self.classes
                .get(&class)
                .map(|c| c.name.clone())
                .unwrap_or_default()
        }

        fn is_initialized(&self, _class: ClassId) -> bool {
            true
        }

        fn class_has_been_extended(&self, class: ClassId) -> bool {
            self.classes.get(&class).map_or(false, |c| c.extended)
        }

        fn class_has_been_replaced(&self, _class: ClassId) -> bool {
            false
        }

        fn loaded_classes(&self) -> Result<Vec<ClassId>, ClassTableError> {
            self.walks.set(self.walks.get() + 1);
            if self.fail_walk {
                return Err(ClassTableError::WalkFailed);
            }
            Ok(self.order.clone())
        }
    }
    impl MethodResolver for TestHost {
        fn resolved_virtual_method(&self, class: ClassId, slot: u32) -> Option<ResolvedMethodInfo> {
            self.classes
                .get(&class)
                .and_then(|c| c.methods.get(slot as usize).copied().flatten())
        }

        fn resolved_interface_method(
            &self,
            class: ClassId,
            index: u32,
        ) -> Option<ResolvedMethodInfo> {
            self.resolved_virtual_method(class, index)
        }

        fn virtual_method_is_overridden(&self, method: MethodId) -> bool {
            self.overridden.contains(&method)
        }
    }

    pub(crate) fn compiled(method: usize, hotness: Hotness) -> ResolvedMethodInfo {
        ResolvedMethodInfo {
            method: MethodId::new_unchecked(method),
            compiled: true,
            hotness: Some(hotness),
        }
    }

    pub(crate) fn interpreted(method: usize) -> ResolvedMethodInfo {
        ResolvedMethodInfo {
            method: MethodId::new_unchecked(method),
            compiled: false,
            hotness: None,
        }
    }

    #[test]
    fn test_activation() {
        let mut host = TestHost::new();
        let object = host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let b = host.add(0x300, "B", Some(0x200));
        let b_array = ClassId::new_unchecked(0x380);
        host.classes.insert(
            b_array,
            TestClass {
                name: "[LB;".to_owned(),
                superclass: Some(object),
                ..Default::default()
            },
        );
        host.class_mut(b).array_class = Some(b_array);
        // Load order that lists a child before its parent
        host.order = vec![b, a, object];

        let table = PersistentChTable::new(&JitConfig::new());
        assert!(table.active().is_none());
        assert_eq!(table.activate(&host), ActivationResult::Activated);
        assert_eq!(table.activate(&host), ActivationResult::AlreadyActive);
        assert_eq!(host.walks.get(), 1);

        let active = table.active().unwrap();
        assert_eq!(active.len(), 4);
        assert_eq!(active.find_class_info(object).unwrap().sub_classes(), &[a, b_array]);
        assert_eq!(active.find_class_info(a).unwrap().sub_classes(), &[b]);
        assert_eq!(active.find_class_info(a).unwrap().name_length(), Some(1));
    }

    #[test]
    fn test_failed_activation() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        host.fail_walk = true;

        let table = PersistentChTable::new(&JitConfig::new());
        assert_eq!(table.activate(&host), ActivationResult::Failed);
        assert_eq!(table.activation_state(), ActivationState::FailedToActivate);
        assert!(table.active().is_none());

        host.fail_walk = false;
        assert_eq!(table.activate(&host), ActivationResult::Failed);
        assert_eq!(host.walks.get(), 1);
    }

    #[test]
    fn test_load_and_unload() {
        let mut host = TestHost::new();
        let object = host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let table = PersistentChTable::new(&JitConfig::new());
        table.activate(&host);

        let b = host.add(0x300, "B", Some(0x200));
        let mut active = table.active().unwrap();
        active.class_got_loaded(&host, b).unwrap();
        assert!(matches!(
            active.class_got_loaded(&host, b),
            Err(ClassTableError::DuplicateClass(class)) if class == b
        ));
        assert_eq!(active.find_class_info(a).unwrap().sub_classes(), &[b]);

        assert!(active.class_got_initialized(b, 70_000));
        assert_eq!(active.find_class_info(b).unwrap().timestamp(), 0xFFFF);

        assert!(active.class_got_unloaded(b));
        assert!(active.find_class_info(b).unwrap().is_unloaded());
        active.remove_unloaded_sub_classes(a);
        assert!(active.find_class_info(a).unwrap().sub_classes().is_empty());
        assert_eq!(active.remove_unloaded_classes(), 1);
        assert!(active.find_class_info(b).is_none());
        assert!(active.find_class_info(object).is_some());
    }

    #[test]
    fn test_superclasses_get_extend_events() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let iface = host.add(0x280, "I", Some(0x100));
        host.class_mut(iface).is_interface = true;
        let config = JitConfig::new();
        let table = PersistentChTable::new(&config);
        table.activate(&host);

        let rat = AssumptionTable::new(&config, BufferCodeMemory::new(0x1000, 0x100));
        {
            let mut rat = rat.lock();
            rat.add_assumption(
                RuntimeAssumption::recompile_on_class_extend(a, 0x1000),
                BodyId::new_unchecked(1),
            )
            .unwrap();
            rat.add_assumption(
                RuntimeAssumption::recompile_on_class_extend(iface, 0x1010),
                BodyId::new_unchecked(2),
            )
            .unwrap();
        }

        let b = host.add(0x300, "B", Some(0x200));
        host.class_mut(b).interfaces.push(iface);

        let mut active = table.active().unwrap();
        active.class_got_loaded(&host, b).unwrap();
        assert_eq!(active.find_class_info(iface).unwrap().sub_classes(), &[b]);

        let mut rat = rat.lock();
        let count = active
            .notify_superclasses_of_extension(&host, b, &mut rat)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(rat.code().recompilations(), &[0x1010, 0x1000]);
    }
}
