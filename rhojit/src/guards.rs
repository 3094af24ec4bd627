//! What a single compilation assumed about the class hierarchy.
//! These are collected while compiling and only turned into runtime assumptions at
//! [`CompilationGuards::commit`], once the code is in place. Committing checks that nothing the
//! compilation relied on changed in the meantime.

use rhojit_base::id::{BodyId, ClassId, MethodId};
use smallvec::SmallVec;

use crate::{
    assumption::{RuntimeAssumption, RuntimeAssumptionKind},
    chtable::{
        class_info::ClassInfoFlags, ActiveClassTable, ClassHost, MethodResolver,
        ResolvedMethodInfo,
    },
    code_memory::CodeMemory,
    rat::AssumptionTables,
    AssumptionError,
};

/// A patchable guard in the generated code and where it jumps to once patched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualGuardSite {
    pub location: usize,
    pub destination: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualGuard {
    /// The call was devirtualized because no class below `class` overrides the method
    Hierarchy {
        class: ClassId,
        sites: SmallVec<[VirtualGuardSite; 2]>,
    },
    /// The call was devirtualized because `method` is not overridden
    NonOverridden {
        method: MethodId,
        sites: SmallVec<[VirtualGuardSite; 2]>,
    },
    /// The guarded code depends on `class` not being redefined
    Redefinition {
        class: ClassId,
        sites: SmallVec<[VirtualGuardSite; 2]>,
    },
    MutableCallSite {
        cookie: usize,
        sites: SmallVec<[VirtualGuardSite; 2]>,
    },
    Breakpoint {
        method: MethodId,
        sites: SmallVec<[VirtualGuardSite; 2]>,
    },
}

/// The guards of one compilation
#[derive(Debug, Default)]
pub struct CompilationGuards {
    pre_x_methods: SmallVec<[MethodId; 4]>,
    classes: SmallVec<[ClassId; 4]>,
    classes_not_newly_extended: SmallVec<[ClassId; 4]>,
    /// Classes whose static final fields were folded
    static_final_classes: SmallVec<[ClassId; 4]>,
    virtual_guards: Vec<VirtualGuard>,
}
impl CompilationGuards {
    #[must_use]
    pub fn new() -> CompilationGuards {
        CompilationGuards::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre_x_methods.is_empty()
            && self.classes.is_empty()
            && self.classes_not_newly_extended.is_empty()
            && self.static_final_classes.is_empty()
            && self.virtual_guards.is_empty()
    }

    /// Recompile if `method` is ever overridden.
    /// Returns whether this is new for the compilation.
    pub fn recompile_on_method_override(&mut self, method: MethodId) -> bool {
        push_unique(&mut self.pre_x_methods, method)
    }

    /// Recompile if `class` is ever extended
    pub fn recompile_on_class_extend(&mut self, class: ClassId) -> bool {
        push_unique(&mut self.classes, class)
    }

    /// Recompile if `class` gets a subclass that the compilation didn't already know about.
    /// The subclasses that it did know about must be registered with this too.
    pub fn recompile_on_new_class_extend(&mut self, class: ClassId) -> bool {
        push_unique(&mut self.classes_not_newly_extended, class)
    }

    /// The compilation folded static final fields of `class`
    pub fn depend_on_static_final_fields(&mut self, class: ClassId) -> bool {
        push_unique(&mut self.static_final_classes, class)
    }

    pub fn add_virtual_guard(&mut self, guard: VirtualGuard) {
        self.virtual_guards.push(guard);
    }

    #[must_use]
    pub fn virtual_guards(&self) -> &[VirtualGuard] {
        &self.virtual_guards
    }

    /// Ask for the single jitted implementation of `slot` below `class`, and if there is one
    /// remember that the compilation relies on no new subclass showing up.
    pub fn devirtualize(
        &mut self,
        table: &ActiveClassTable<'_>,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        class: ClassId,
        slot: u32,
    ) -> Option<ResolvedMethodInfo> {
        let method = table.find_single_jitted_implementer(host, resolver, class, slot, None)?;
        self.recompile_on_new_class_extend(class);
        for sub in table.collect_all_sub_classes(host, class) {
            self.recompile_on_new_class_extend(sub);
        }
        Some(method)
    }

    /// Turn the guards into runtime assumptions for the body starting at `start_pc`.
    ///
    /// Returns `false` if something the compilation relied on has already been invalidated.
    /// The compilation must then be failed, and any assumptions already added for the body
    /// reclaimed through
    /// [`reclaim_assumptions`](crate::rat::AssumptionTables::reclaim_assumptions).
    pub fn commit<M: CodeMemory>(
        &self,
        table: &ActiveClassTable<'_>,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        assumptions: &mut AssumptionTables<M>,
        body: BodyId,
        start_pc: usize,
    ) -> Result<bool, AssumptionError> {
        if self.is_empty() {
            return Ok(true);
        }

        if self
            .pre_x_methods
            .iter()
            .any(|method| resolver.virtual_method_is_overridden(*method))
        {
            tracing::debug!("Commit failed, a method has been overridden");
            return Ok(false);
        }
        for method in &self.pre_x_methods {
            assumptions.add_assumption(
                RuntimeAssumption::recompile_on_method_override(*method, start_pc),
                body,
            )?;
        }

        for class in &self.classes {
            if host.class_has_been_extended(*class) {
                tracing::debug!(
                    "Commit failed, {} has been extended",
                    host.class_name(*class)
                );
                return Ok(false);
            }
            assumptions.add_assumption(
                RuntimeAssumption::recompile_on_class_extend(*class, start_pc),
                body,
            )?;
        }

        // An extended class is only fine if the compilation knew about each of its subclasses
        let known = &self.classes_not_newly_extended;
        for class in known {
            if !host.class_has_been_extended(*class) {
                continue;
            }

            let has_new_sub_class = table.find_class_info(*class).map_or(false, |info| {
                info.sub_classes().iter().any(|sub| !known.contains(sub))
            });
            if has_new_sub_class {
                tracing::debug!(
                    "Commit failed, {} has a new subclass",
                    host.class_name(*class)
                );
                return Ok(false);
            }
        }
        for class in known {
            assumptions.add_assumption(
                RuntimeAssumption::recompile_on_class_extend(*class, start_pc),
                body,
            )?;
        }

        for class in &self.static_final_classes {
            let modified = table.find_class_info(*class).map_or(false, |info| {
                info.flags()
                    .contains(ClassInfoFlags::CANNOT_TRUST_STATIC_FINAL)
            });
            if modified {
                tracing::debug!(
                    "Commit failed, a static final field of {} was modified",
                    host.class_name(*class)
                );
                return Ok(false);
            }
        }

        for guard in &self.virtual_guards {
            match guard {
                VirtualGuard::Hierarchy { class, sites } => {
                    table.add_an_assumption_for_each_sub_class(
                        host,
                        assumptions,
                        *class,
                        sites,
                        body,
                    )?;
                }
                VirtualGuard::NonOverridden { method, sites } => {
                    add_nop_guards(
                        assumptions,
                        RuntimeAssumptionKind::MethodOverride,
                        method.get(),
                        sites,
                        body,
                    )?;
                }
                VirtualGuard::Redefinition { class, sites } => {
                    add_nop_guards(
                        assumptions,
                        RuntimeAssumptionKind::ClassRedefinitionNop,
                        class.get(),
                        sites,
                        body,
                    )?;
                }
                VirtualGuard::MutableCallSite { cookie, sites } => {
                    add_nop_guards(
                        assumptions,
                        RuntimeAssumptionKind::MutableCallSiteChange,
                        *cookie,
                        sites,
                        body,
                    )?;
                }
                VirtualGuard::Breakpoint { method, sites } => {
                    add_nop_guards(
                        assumptions,
                        RuntimeAssumptionKind::MethodBreakpoint,
                        method.get(),
                        sites,
                        body,
                    )?;
                }
            }
        }

        Ok(true)
    }
}

fn push_unique<T: PartialEq, const N: usize>(list: &mut SmallVec<[T; N]>, value: T) -> bool {
    if list.contains(&value) {
        false
    } else {
        list.push(value);
        true
    }
}

fn add_nop_guards<M: CodeMemory>(
    assumptions: &mut AssumptionTables<M>,
    kind: RuntimeAssumptionKind,
    key: usize,
    sites: &[VirtualGuardSite],
    body: BodyId,
) -> Result<(), AssumptionError> {
    for site in sites {
        assumptions.add_assumption(
            RuntimeAssumption::nop_guard(kind, key, site.location, site.destination),
            body,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rhojit_base::id::{BodyId, MethodId};
    use smallvec::smallvec;

    use super::{CompilationGuards, VirtualGuard, VirtualGuardSite};
    use crate::{
        assumption::RuntimeAssumptionKind,
        chtable::{
            class_info::ClassInfoFlags,
            tests::{compiled, TestHost},
            PersistentChTable,
        },
        code_memory::BufferCodeMemory,
        rat::AssumptionTable,
        Hotness, JitConfig,
    };

    const BODY: BodyId = BodyId::new_unchecked(0x40);

    #[test]
    fn test_commit_records_assumptions() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let b = host.add(0x300, "B", Some(0x200));
        let config = JitConfig::new();
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let active = table.active().unwrap();
        let rat = AssumptionTable::new(&config, BufferCodeMemory::new(0x1000, 0x100));
        let mut rat = rat.lock();

        let mut guards = CompilationGuards::new();
        assert!(guards.recompile_on_class_extend(b));
        assert!(!guards.recompile_on_class_extend(b));
        assert!(guards.recompile_on_method_override(MethodId::new_unchecked(0x7000)));
        guards.add_virtual_guard(VirtualGuard::Hierarchy {
            class: a,
            sites: smallvec![VirtualGuardSite {
                location: 0x1010,
                destination: 0x1020,
            }],
        });

        assert!(guards
            .commit(&active, &host, &host, &mut rat, BODY, 0x1000)
            .unwrap());
        assert_eq!(rat.body_assumptions(BODY).len(), 4);
        assert_eq!(
            rat.find_bucket(RuntimeAssumptionKind::MethodOverride, 0x7000)
                .count(),
            1
        );

        // Loading a subclass of B patches the recompile assumption
        rat.notify_class_extend_event(b).unwrap();
        assert_eq!(rat.code().recompilations(), &[0x1000]);
    }

    #[test]
    fn test_static_final_modification() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let config = JitConfig::new();
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let rat = AssumptionTable::new(&config, BufferCodeMemory::new(0x1000, 0x100));
        let mut rat = rat.lock();

        let mut guards = CompilationGuards::new();
        guards.depend_on_static_final_fields(a);
        let mut active = table.active().unwrap();
        assert!(guards
            .commit(&active, &host, &host, &mut rat, BODY, 0x1000)
            .unwrap());

        active
            .find_class_info_mut(a)
            .unwrap()
            .set_flag(ClassInfoFlags::CANNOT_TRUST_STATIC_FINAL);
        assert!(!guards
            .commit(&active, &host, &host, &mut rat, BODY, 0x1000)
            .unwrap());
    }

    #[test]
    fn test_commit_fails_when_invalidated() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let config = JitConfig::new();
        let table = PersistentChTable::new(&config);
        table.activate(&host);
        let rat = AssumptionTable::new(&config, BufferCodeMemory::new(0x1000, 0x100));

        let mut guards = CompilationGuards::new();
        guards.recompile_on_method_override(MethodId::new_unchecked(0x7000));
        host.overridden.push(MethodId::new_unchecked(0x7000));
        {
            let active = table.active().unwrap();
            let mut rat = rat.lock();
            assert!(!guards
                .commit(&active, &host, &host, &mut rat, BODY, 0x1000)
                .unwrap());
        }

        let mut guards = CompilationGuards::new();
        guards.recompile_on_new_class_extend(a);
        let foo = compiled(0x7000, Hotness::Hot);
        host.set_method(a, 0, foo);
        {
            let active = table.active().unwrap();
            let mut rat = rat.lock();
            assert!(guards
                .commit(&active, &host, &host, &mut rat, BODY, 0x1000)
                .unwrap());
        }

        // A subclass appears between compiling and committing
        let mut guards = CompilationGuards::new();
        {
            let active = table.active().unwrap();
            assert_eq!(guards.devirtualize(&active, &host, &host, a, 0), Some(foo));
        }
        let b = host.add(0x300, "B", Some(0x200));
        let mut active = table.active().unwrap();
        active.class_got_loaded(&host, b).unwrap();
        let mut rat = rat.lock();
        let body = BodyId::new_unchecked(0x41);
        assert!(!guards
            .commit(&active, &host, &host, &mut rat, body, 0x1040)
            .unwrap());
        rat.reclaim_assumptions(body, None, true).unwrap();
        assert!(!rat.has_body(body));

        // Knowing about B from the start is fine
        host.set_method(b, 0, foo);
        let mut guards = CompilationGuards::new();
        assert_eq!(guards.devirtualize(&active, &host, &host, a, 0), Some(foo));
        assert!(guards
            .commit(&active, &host, &host, &mut rat, body, 0x1040)
            .unwrap());
    }
}
