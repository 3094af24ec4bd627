//! The symbol reference table of a single compilation.
//!
//! Every memory access and call that the compiled code makes goes through a symbol reference.
//! References are deduplicated so that two accesses to the same field end up with the same
//! reference, and each reference is put into the alias set for its category. The table belongs
//! to one compilation, and is never shared between threads.

use indexmap::{IndexMap, IndexSet};
use rhojit_base::{
    id::{ClassId, CpIndex, OwningMethodIndex, SymRefNumber},
    types::DataType,
    util::{new_id_map, IdMap},
};
use smallvec::SmallVec;
use usize_cast::IntoUsize;

use crate::{
    chtable::{ActiveClassTable, ClassHost, MethodResolver},
    guards::CompilationGuards,
    Hotness, JitConfig,
};

use self::{
    alias::{AccessKind, AliasSets, SymRefSet},
    immutable::{ImmutableInfo, IMMUTABLE_CLASSES},
    oracle::{ConstantAttributes, ConstantKind, ConstantPoolOracle, MethodKind, RecognizedField},
    symbol::{
        merge_conservative, RuntimeHelper, Symbol, SymbolFlags, SymbolId, SymbolKind,
        SymbolReference, WellKnown,
    },
};

pub mod alias;
pub mod immutable;
pub mod oracle;
pub mod symbol;

/// Constant pool index of references which were made up by the compiler
pub const NO_CP_INDEX: CpIndex = -1;

#[derive(Debug)]
#[non_exhaustive]
pub enum SymbolTableError {
    /// An interface call names a method that `java/lang/Object` declares final.
    /// The bytecode is illegal, so the compilation has to be abandoned.
    MethodFinalInObject {
        method: OwningMethodIndex,
        cp: CpIndex,
    },
    /// Tried to mark a reference unresolved after it had been resolved
    ResolvedToUnresolved(SymRefNumber),
    /// A table invariant did not hold
    InternalConsistency(&'static str),
}

/// Identity of a resolved instance field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedFieldShadowKey {
    pub class: ClassId,
    pub offset: u32,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UnsafeKey {
    data_type: DataType,
    java_static_reference: bool,
    volatile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TableEntry {
    CallSite(u32),
    MethodType(CpIndex),
}

/// The per compilation table of symbols and the references to them
pub struct SymbolReferenceTable {
    hotness: Hotness,
    conservative_generic_int_shadow_aliasing: bool,
    immutable_field_aliasing: bool,
    class_lookahead: bool,

    symbols: Vec<Symbol>,
    refs: Vec<SymbolReference>,
    aliases: AliasSets,
    unresolved_count: u32,

    resolved_field_shadows: IndexMap<ResolvedFieldShadowKey, SymRefNumber>,
    method_refs: IndexMap<(OwningMethodIndex, CpIndex, MethodKind), SymRefNumber>,
    /// Call site index -> the dynamic method references made for it, one per owning method
    dynamic_method_refs: IdMap<u32, SmallVec<[SymRefNumber; 2]>>,
    constant_refs: IndexMap<(OwningMethodIndex, CpIndex), SymRefNumber>,
    table_entry_refs: IndexMap<(OwningMethodIndex, TableEntry), SymRefNumber>,
    helpers: IndexMap<RuntimeHelper, SymRefNumber>,
    well_known: IndexMap<WellKnown, SymRefNumber>,
    unsafe_refs: IndexMap<UnsafeKey, SymRefNumber>,
    generic_int_shadow: Option<SymbolId>,
    immutable_generic_int_shadow: Option<SymbolId>,

    /// Objects whose identity the compilation knows, by the address of the slot holding them
    known_objects: IndexSet<usize>,

    pub(crate) immutable_class_refs: [SymRefSet; IMMUTABLE_CLASSES.len()],
    pub(crate) immutable_infos: Vec<ImmutableInfo>,
    pub(crate) has_immutable: bool,
    has_unsafe_symbol: bool,
}
impl SymbolReferenceTable {
    /// Create the table for a compilation at `hotness`
    #[must_use]
    pub fn new(config: &JitConfig, hotness: Hotness) -> SymbolReferenceTable {
        SymbolReferenceTable {
            hotness,
            conservative_generic_int_shadow_aliasing: !config
                .disable_conservative_generic_int_shadow_aliasing,
            immutable_field_aliasing: !config.disable_immutable_field_aliasing,
            class_lookahead: !config.disable_class_lookahead,
            symbols: Vec::new(),
            refs: Vec::new(),
            aliases: AliasSets::default(),
            unresolved_count: 0,
            resolved_field_shadows: IndexMap::new(),
            method_refs: IndexMap::new(),
            dynamic_method_refs: new_id_map(),
            constant_refs: IndexMap::new(),
            table_entry_refs: IndexMap::new(),
            helpers: IndexMap::new(),
            well_known: IndexMap::new(),
            unsafe_refs: IndexMap::new(),
            generic_int_shadow: None,
            immutable_generic_int_shadow: None,
            known_objects: IndexSet::new(),
            immutable_class_refs: Default::default(),
            immutable_infos: Vec::new(),
            has_immutable: false,
            has_unsafe_symbol: false,
        }
    }

    #[must_use]
    pub fn hotness(&self) -> Hotness {
        self.hotness
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// # Panics
    /// If `number` was not produced by this table
    #[must_use]
    pub fn reference(&self, number: SymRefNumber) -> &SymbolReference {
        &self.refs[number.get().into_usize()]
    }

    pub fn reference_mut(&mut self, number: SymRefNumber) -> &mut SymbolReference {
        &mut self.refs[number.get().into_usize()]
    }

    #[must_use]
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0.into_usize()]
    }

    /// The symbol that the reference refers to
    #[must_use]
    pub fn symbol_of(&self, number: SymRefNumber) -> &Symbol {
        self.symbol(self.reference(number).symbol())
    }

    #[must_use]
    pub fn alias_sets(&self) -> &AliasSets {
        &self.aliases
    }

    #[must_use]
    pub fn unresolved_count(&self) -> u32 {
        self.unresolved_count
    }

    #[must_use]
    pub fn known_object_count(&self) -> usize {
        self.known_objects.len()
    }

    /// Whether something in the compilation accesses java objects through `Unsafe`
    #[must_use]
    pub fn has_unsafe_symbol(&self) -> bool {
        self.has_unsafe_symbol
    }

    fn push_symbol(&mut self, symbol: Symbol) -> SymbolId {
        // There are never anywhere near u32::MAX symbols in one compilation
        #[allow(clippy::cast_possible_truncation)]
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        id
    }

    fn push_reference(
        &mut self,
        symbol: SymbolId,
        owning: OwningMethodIndex,
        cp: CpIndex,
        offset: u32,
    ) -> SymRefNumber {
        #[allow(clippy::cast_possible_truncation)]
        let number = SymRefNumber::new_unchecked(self.refs.len() as u32);
        self.refs
            .push(SymbolReference::new(number, symbol, owning, cp, offset));
        number
    }

    fn mark_unresolved(&mut self, number: SymRefNumber) -> Result<(), SymbolTableError> {
        let index = self.unresolved_count;
        self.reference_mut(number).set_unresolved(index)?;
        self.unresolved_count += 1;
        self.aliases.unresolved.insert(number);
        Ok(())
    }

    /// Make `existing` share its symbol with a new reference whose symbol would have had
    /// `incoming` flags
    fn share_symbol(&mut self, existing: SymRefNumber, incoming: SymbolFlags) -> SymbolId {
        let symbol = self.reference(existing).symbol();
        let flags = &mut self.symbols[symbol.0.into_usize()].flags;
        *flags = merge_conservative(*flags, incoming);
        self.reference_mut(existing).really_shares_symbol = true;
        symbol
    }

    /// Index of the object held in the slot at `address` in the known object table
    fn known_object_index(&mut self, address: usize) -> u32 {
        let (index, _) = self.known_objects.insert_full(address);
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        index
    }

    fn field_flags(volatile: bool, private: bool, is_final: bool) -> SymbolFlags {
        let mut flags = SymbolFlags::empty();
        flags.set(SymbolFlags::VOLATILE, volatile);
        flags.set(SymbolFlags::PRIVATE, private);
        flags.set(SymbolFlags::FINAL, is_final);
        flags
    }

    // Shadows

    /// The existing reference for the resolved field at `key`.
    /// Its symbol must be at least as restrictive as the field itself.
    pub fn find_resolved_field_shadow(
        &self,
        key: ResolvedFieldShadowKey,
        flags: SymbolFlags,
    ) -> Result<Option<SymRefNumber>, SymbolTableError> {
        let number = if let Some(number) = self.resolved_field_shadows.get(&key) {
            *number
        } else {
            return Ok(None);
        };

        let existing = self.symbol_of(number).flags;
        if merge_conservative(existing, flags) != existing {
            return Err(SymbolTableError::InternalConsistency(
                "resolved field shadow is less restrictive than the field",
            ));
        }

        Ok(Some(number))
    }

    /// A reference to the same field as `cp` in `owning`, if one was already made
    fn find_shadow_symbol(
        &self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
        data_type: DataType,
        recognized: Option<RecognizedField>,
    ) -> Option<SymRefNumber> {
        self.aliases
            .set_for(AccessKind::Shadow, data_type)
            .iter()
            .find(|number| {
                let symref = self.reference(*number);
                let symbol = self.symbol(symref.symbol());
                if !symbol.is_shadow() || symbol.data_type != data_type {
                    return false;
                }

                if recognized.is_some() && symbol.recognized_field == recognized {
                    return true;
                }

                cp > 0
                    && symref.cp_index() > 0
                    && oracle.fields_are_same(
                        owning,
                        cp,
                        symref.owning_method(),
                        symref.cp_index(),
                        false,
                    )
            })
    }

    fn create_shadow_symbol(
        &mut self,
        data_type: DataType,
        flags: SymbolFlags,
        recognized: Option<RecognizedField>,
        name: Option<String>,
    ) -> SymbolId {
        if self.aliases.mutable_generic_int_shadow_created
            && self.conservative_generic_int_shadow_aliasing
        {
            self.aliases.conservative_generic_int_shadow_aliasing = true;
        }

        let mut symbol = Symbol::new(data_type, SymbolKind::Shadow, flags);
        symbol.recognized_field = recognized;
        symbol.name = name;
        self.push_symbol(symbol)
    }

    fn register_shadow(&mut self, number: SymRefNumber, data_type: DataType, cp: CpIndex) {
        self.aliases
            .set_for_mut(AccessKind::Shadow, data_type)
            .insert(number);
        if cp > 0 {
            self.aliases.cp_sym_refs.insert(number);
        }
    }

    /// The reference for the instance field named by `cp` in `owning`.
    ///
    /// Resolved references to the same field always give the same reference. Otherwise a
    /// reference to the same field with a different resolution state shares its symbol with the
    /// new reference.
    /// A newly created resolved reference is checked for being an immutable field, using the
    /// class table for the class lookahead when one is given.
    pub fn find_or_create_shadow_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        classes: Option<&mut ActiveClassTable<'_>>,
        owning: OwningMethodIndex,
        cp: CpIndex,
        is_store: bool,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.field_attributes(owning, cp, is_store);
        let recognized = oracle.recognized_field(owning, cp, false);
        let flags = Self::field_flags(attrs.volatile, attrs.private, attrs.is_final);

        let key = if attrs.resolved {
            attrs.containing_class.map(|class| ResolvedFieldShadowKey {
                class,
                offset: attrs.offset,
                data_type: attrs.data_type,
            })
        } else {
            None
        };
        if let Some(key) = key {
            if let Some(number) = self.find_resolved_field_shadow(key, flags)? {
                return Ok(number);
            }
        }

        let shared =
            if let Some(existing) =
                self.find_shadow_symbol(oracle, owning, cp, attrs.data_type, recognized)
            {
                let existing_ref = self.reference(existing);
                let compatible = if attrs.resolved {
                    existing_ref.is_resolved()
                } else {
                    existing_ref.is_unresolved() && existing_ref.owning_method() == owning
                };
                if compatible {
                    return Ok(existing);
                }

                Some(self.share_symbol(existing, flags))
            } else {
                None
            };

        let symbol = if let Some(symbol) = shared {
            symbol
        } else {
            self.create_shadow_symbol(attrs.data_type, flags, recognized, None)
        };

        let offset = if attrs.resolved { attrs.offset } else { 0 };
        let number = self.push_reference(symbol, owning, cp, offset);
        {
            let symref = self.reference_mut(number);
            symref.really_shares_symbol = shared.is_some();
            symref.unresolved_in_cp = attrs.unresolved_in_cp;
        }
        if attrs.resolved {
            self.reference_mut(number).set_resolved();
        } else {
            self.mark_unresolved(number)?;
            self.reference_mut(number).set_can_gc();
        }

        self.register_shadow(number, attrs.data_type, cp);
        if let Some(key) = key {
            self.resolved_field_shadows.entry(key).or_insert(number);
        }
        if attrs.resolved {
            self.check_immutable(oracle, classes, number);
        }

        tracing::trace!(
            "Created shadow #{} for cp {} of method {} (resolved: {}, shares: {})",
            number.get(),
            cp,
            owning,
            attrs.resolved,
            shared.is_some()
        );

        Ok(number)
    }

    /// The reference for a field that the compiler knows about, creating it if needed
    pub fn find_or_fabricate_recognized_shadow(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        recognized: RecognizedField,
        data_type: DataType,
        offset: u32,
        flags: SymbolFlags,
    ) -> SymRefNumber {
        if let Some(number) =
            self.find_shadow_symbol(oracle, owning, NO_CP_INDEX, data_type, Some(recognized))
        {
            return number;
        }

        let symbol = self.create_shadow_symbol(data_type, flags, Some(recognized), None);
        let number = self.push_reference(symbol, owning, NO_CP_INDEX, offset);
        self.reference_mut(number).set_resolved();
        self.register_shadow(number, data_type, NO_CP_INDEX);
        number
    }

    /// The reference for the field at `offset` inside of instances of `class`, creating one
    /// named `Class.name signature` if the field hasn't been referenced yet
    pub fn find_or_fabricate_shadow_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        class: ClassId,
        data_type: DataType,
        offset: u32,
        flags: SymbolFlags,
        name: &str,
        signature: &str,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let key = ResolvedFieldShadowKey {
            class,
            offset,
            data_type,
        };
        if let Some(number) = self.find_resolved_field_shadow(key, flags)? {
            return Ok(number);
        }

        let qualified = format!("{}.{} {}", oracle.class_name(class), name, signature);
        let symbol =
            self.create_shadow_symbol(data_type, flags | SymbolFlags::NAMED, None, Some(qualified));
        let number = self.push_reference(symbol, 0, NO_CP_INDEX, offset);
        self.reference_mut(number).set_resolved();
        self.register_shadow(number, data_type, NO_CP_INDEX);
        self.resolved_field_shadows.insert(key, number);
        Ok(number)
    }

    /// A new reference to the int shadow used for raw accesses at `offset` into an object.
    /// Once a mutable one exists, later shadows have to alias with it.
    pub fn find_or_create_generic_int_shadow(&mut self, offset: u32, mutable: bool) -> SymRefNumber {
        let existing = if mutable {
            self.generic_int_shadow
        } else {
            self.immutable_generic_int_shadow
        };
        let symbol = if let Some(symbol) = existing {
            symbol
        } else {
            let symbol = self.create_shadow_symbol(
                DataType::Int32,
                SymbolFlags::GENERIC_INT_SHADOW,
                None,
                None,
            );
            if mutable {
                self.generic_int_shadow = Some(symbol);
            } else {
                self.immutable_generic_int_shadow = Some(symbol);
            }
            symbol
        };

        if mutable {
            self.aliases.mutable_generic_int_shadow_created = true;
        }

        let number = self.push_reference(symbol, 0, NO_CP_INDEX, offset);
        let symref = self.reference_mut(number);
        symref.set_resolved();
        symref.really_shares_symbol = existing.is_some();
        self.aliases.generic_int_shadows.insert(number);
        self.aliases.int_shadows.insert(number);
        number
    }

    // Statics

    fn find_static_symbol(
        &self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
        data_type: DataType,
    ) -> Option<SymRefNumber> {
        if cp <= 0 {
            return None;
        }

        self.aliases
            .set_for(AccessKind::Static, data_type)
            .iter()
            .find(|number| {
                let symref = self.reference(*number);
                let symbol = self.symbol(symref.symbol());
                symbol.is_static()
                    && symbol.data_type == data_type
                    && symref.cp_index() > 0
                    && oracle.fields_are_same(
                        owning,
                        cp,
                        symref.owning_method(),
                        symref.cp_index(),
                        true,
                    )
            })
    }

    /// The reference for the static named by `cp` in `owning`
    pub fn find_or_create_static_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
        is_store: bool,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.static_attributes(owning, cp, is_store);
        let flags = Self::field_flags(attrs.volatile, attrs.private, attrs.is_final);

        let shared = if let Some(existing) = self.find_static_symbol(oracle, owning, cp, attrs.data_type)
        {
            let existing_ref = self.reference(existing);
            let compatible = if attrs.resolved {
                existing_ref.is_resolved()
            } else {
                existing_ref.is_unresolved() && existing_ref.owning_method() == owning
            };
            if compatible {
                return Ok(existing);
            }

            Some(self.share_symbol(existing, flags))
        } else {
            None
        };

        let address = attrs.resolved.then(|| attrs.address);
        let symbol = if let Some(symbol) = shared {
            if let SymbolKind::Static { address: existing @ None } =
                &mut self.symbols[symbol.0.into_usize()].kind
            {
                *existing = address;
            }
            symbol
        } else {
            self.push_symbol(Symbol::new(
                attrs.data_type,
                SymbolKind::Static { address },
                flags,
            ))
        };

        let number = self.push_reference(symbol, owning, cp, 0);
        {
            let symref = self.reference_mut(number);
            symref.really_shares_symbol = shared.is_some();
            symref.unresolved_in_cp = attrs.unresolved_in_cp;
        }

        if attrs.resolved {
            self.reference_mut(number).set_resolved();
            let foldable = attrs
                .declaring_class
                .map_or(false, |class| oracle.fold_final_fields_in(class));
            if attrs.is_final
                && attrs.data_type == DataType::Address
                && attrs.class_initialized
                && attrs.value_non_null
                && foldable
            {
                let index = self.known_object_index(attrs.address);
                self.reference_mut(number).known_object = Some(index);
            }
        } else {
            self.mark_unresolved(number)?;
            self.reference_mut(number).set_can_gc();
        }

        self.aliases
            .set_for_mut(AccessKind::Static, attrs.data_type)
            .insert(number);
        if cp > 0 {
            self.aliases.cp_sym_refs.insert(number);
        }

        Ok(number)
    }

    // Methods

    fn find_or_create_method_symbol(
        &mut self,
        owning: OwningMethodIndex,
        cp: CpIndex,
        callee: Option<oracle::ResolvedCallee>,
        kind: MethodKind,
    ) -> Result<SymRefNumber, SymbolTableError> {
        if cp > 0 {
            if let Some(number) = self.method_refs.get(&(owning, cp, kind)) {
                return Ok(*number);
            }
        }

        let symbol = self.push_symbol(Symbol::new(
            DataType::NoType,
            SymbolKind::Method {
                method: callee.map(|callee| callee.method),
                kind,
            },
            SymbolFlags::empty(),
        ));
        let number = self.push_reference(symbol, owning, cp, 0);
        // Calls into java code can always collect
        self.reference_mut(number).set_can_gc();

        if let Some(callee) = callee {
            let symref = self.reference_mut(number);
            symref.set_resolved();
            symref.unresolved_in_cp = callee.unresolved_in_cp;
        } else {
            self.reference_mut(number).unresolved_in_cp = true;
            self.mark_unresolved(number)?;
        }

        if cp > 0 {
            self.method_refs.insert((owning, cp, kind), number);
            self.aliases.cp_sym_refs.insert(number);
        }

        Ok(number)
    }

    pub fn find_or_create_static_method_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let callee = oracle.resolved_method(owning, cp, MethodKind::Static);
        self.find_or_create_method_symbol(owning, cp, callee, MethodKind::Static)
    }

    pub fn find_or_create_special_method_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let callee = oracle.resolved_method(owning, cp, MethodKind::Special);
        self.find_or_create_method_symbol(owning, cp, callee, MethodKind::Special)
    }

    pub fn find_or_create_virtual_method_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let callee = oracle.resolved_method(owning, cp, MethodKind::Virtual);
        self.find_or_create_method_symbol(owning, cp, callee, MethodKind::Virtual)
    }

    /// The reference for an interface call.
    /// Interface calls to the final methods of `java/lang/Object` abandon the compilation.
    pub fn find_or_create_interface_method_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        if oracle.interface_method_is_final_in_object(owning, cp) {
            tracing::info!(
                "Interface call at cp {} of method {} is final in Object, abandoning",
                cp,
                owning
            );
            return Err(SymbolTableError::MethodFinalInObject { method: owning, cp });
        }

        let callee = oracle.resolved_method(owning, cp, MethodKind::Interface);
        self.find_or_create_method_symbol(owning, cp, callee, MethodKind::Interface)
    }

    /// The reference for the adapter that an `invokedynamic` at `call_site` goes through.
    /// There is one per call site and owning method.
    pub fn find_or_create_dynamic_method_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        call_site: u32,
    ) -> Result<SymRefNumber, SymbolTableError> {
        if let Some(refs) = self.dynamic_method_refs.get(&call_site) {
            let existing = refs
                .iter()
                .copied()
                .find(|number| self.reference(*number).owning_method() == owning);
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }

        let callee = oracle.dynamic_method(owning, call_site);
        let number =
            self.find_or_create_method_symbol(owning, NO_CP_INDEX, callee, MethodKind::Static)?;
        self.dynamic_method_refs
            .entry(call_site)
            .or_default()
            .push(number);
        Ok(number)
    }

    /// The reference for an `invokehandle`, whose target is computed at runtime
    pub fn find_or_create_handle_method_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let callee = oracle.resolved_method(owning, cp, MethodKind::ComputedVirtual);
        self.find_or_create_method_symbol(owning, cp, callee, MethodKind::ComputedVirtual)
    }

    /// Devirtualize a call through `slot` on `class` if the class table knows of a single
    /// compiled implementation. The compilation then depends on no new subclass of `class`
    /// being loaded, which is recorded in `guards`.
    pub fn find_or_create_devirtualized_method_symbol(
        &mut self,
        guards: &mut CompilationGuards,
        table: &ActiveClassTable<'_>,
        host: &dyn ClassHost,
        resolver: &dyn MethodResolver,
        owning: OwningMethodIndex,
        class: ClassId,
        slot: u32,
    ) -> Result<Option<SymRefNumber>, SymbolTableError> {
        let method = if let Some(method) = guards.devirtualize(table, host, resolver, class, slot)
        {
            method
        } else {
            return Ok(None);
        };

        let callee = oracle::ResolvedCallee {
            method: method.method,
            unresolved_in_cp: false,
        };
        self.find_or_create_method_symbol(owning, NO_CP_INDEX, Some(callee), MethodKind::Virtual)
            .map(Some)
    }

    /// The reference for a call to a runtime helper
    pub fn find_or_create_runtime_helper(
        &mut self,
        helper: RuntimeHelper,
        can_gc_and_return: bool,
        can_gc_and_except: bool,
        preserves_all_registers: bool,
    ) -> SymRefNumber {
        if let Some(number) = self.helpers.get(&helper) {
            return *number;
        }

        let symbol = self.push_symbol(Symbol::new(
            DataType::NoType,
            SymbolKind::Helper(helper),
            SymbolFlags::empty(),
        ));
        let number = self.push_reference(symbol, 0, NO_CP_INDEX, 0);
        let symref = self.reference_mut(number);
        symref.set_resolved();
        symref.can_gc_and_return = can_gc_and_return;
        symref.can_gc_and_except = can_gc_and_except;
        symref.preserves_all_registers = preserves_all_registers;
        self.helpers.insert(helper, number);
        number
    }

    /// The reference for a runtime structure that compiled code reads directly
    pub fn find_or_create_well_known(&mut self, which: WellKnown) -> SymRefNumber {
        if let Some(number) = self.well_known.get(&which) {
            return *number;
        }

        let data_type = which.data_type();
        let (kind, access) = if which.is_static() {
            (SymbolKind::Static { address: None }, AccessKind::Static)
        } else {
            (SymbolKind::Shadow, AccessKind::Shadow)
        };
        let symbol = self.push_symbol(Symbol::new(data_type, kind, SymbolFlags::empty()));
        let number = self.push_reference(symbol, 0, NO_CP_INDEX, 0);
        self.reference_mut(number).set_resolved();
        self.aliases.set_for_mut(access, data_type).insert(number);
        self.well_known.insert(which, number);
        number
    }

    // Constants

    fn find_or_create_cp_symbol(
        &mut self,
        owning: OwningMethodIndex,
        cp: CpIndex,
        kind: ConstantKind,
        attrs: ConstantAttributes,
        flags: SymbolFlags,
    ) -> Result<SymRefNumber, SymbolTableError> {
        if let Some(number) = self.constant_refs.get(&(owning, cp)) {
            return Ok(*number);
        }

        let symbol = self.push_symbol(Symbol::new(
            DataType::Address,
            SymbolKind::Constant {
                kind,
                address: attrs.resolved.then(|| attrs.address),
            },
            flags,
        ));
        let number = self.push_reference(symbol, owning, cp, 0);
        if attrs.resolved {
            self.reference_mut(number).set_resolved();
            let index = self.known_object_index(attrs.address);
            self.reference_mut(number).known_object = Some(index);
        } else {
            self.mark_unresolved(number)?;
            self.reference_mut(number).set_can_gc();
        }

        self.aliases.address_statics.insert(number);
        if cp > 0 {
            self.aliases.cp_sym_refs.insert(number);
        }
        self.constant_refs.insert((owning, cp), number);
        Ok(number)
    }

    pub fn find_or_create_string_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.constant(owning, cp, ConstantKind::String);
        self.find_or_create_cp_symbol(
            owning,
            cp,
            ConstantKind::String,
            attrs,
            SymbolFlags::CONST_STRING,
        )
    }

    pub fn find_or_create_method_type_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.constant(owning, cp, ConstantKind::MethodType);
        self.find_or_create_cp_symbol(
            owning,
            cp,
            ConstantKind::MethodType,
            attrs,
            SymbolFlags::CONST_METHOD_TYPE,
        )
    }

    pub fn find_or_create_method_handle_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.constant(owning, cp, ConstantKind::MethodHandle);
        self.find_or_create_cp_symbol(
            owning,
            cp,
            ConstantKind::MethodHandle,
            attrs,
            SymbolFlags::CONST_METHOD_HANDLE,
        )
    }

    /// `primitive` constants are boxed when loaded
    pub fn find_or_create_constant_dynamic_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
        primitive: bool,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let kind = ConstantKind::Dynamic { primitive };
        let attrs = oracle.constant(owning, cp, kind);
        let mut flags = SymbolFlags::CONSTANT_DYNAMIC;
        flags.set(SymbolFlags::CONSTANT_DYNAMIC_PRIMITIVE, primitive);
        self.find_or_create_cp_symbol(owning, cp, kind, attrs, flags)
    }

    fn find_or_create_table_entry_symbol(
        &mut self,
        owning: OwningMethodIndex,
        entry: TableEntry,
        attrs: ConstantAttributes,
    ) -> Result<SymRefNumber, SymbolTableError> {
        if let Some(number) = self.table_entry_refs.get(&(owning, entry)) {
            return Ok(*number);
        }

        let flags = match entry {
            TableEntry::CallSite(_) => SymbolFlags::CALL_SITE_TABLE_ENTRY,
            TableEntry::MethodType(_) => SymbolFlags::METHOD_TYPE_TABLE_ENTRY,
        };
        let symbol = self.push_symbol(Symbol::new(
            DataType::Address,
            SymbolKind::Static {
                address: attrs.resolved.then(|| attrs.address),
            },
            flags,
        ));
        let number = self.push_reference(symbol, owning, NO_CP_INDEX, 0);
        if attrs.resolved {
            self.reference_mut(number).set_resolved();
            let index = self.known_object_index(attrs.address);
            self.reference_mut(number).known_object = Some(index);
        } else {
            self.mark_unresolved(number)?;
            self.reference_mut(number).set_can_gc();
        }

        match entry {
            TableEntry::CallSite(_) => self.aliases.call_site_table_entries.insert(number),
            TableEntry::MethodType(_) => self.aliases.method_type_table_entries.insert(number),
        };
        self.table_entry_refs.insert((owning, entry), number);
        Ok(number)
    }

    /// The slot holding the linked call site object of an `invokedynamic`
    pub fn find_or_create_call_site_table_entry_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        call_site: u32,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.call_site_table_entry(owning, call_site);
        self.find_or_create_table_entry_symbol(owning, TableEntry::CallSite(call_site), attrs)
    }

    /// The slot holding the method type of an `invokehandle`
    pub fn find_or_create_method_type_table_entry_symbol(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        owning: OwningMethodIndex,
        cp: CpIndex,
    ) -> Result<SymRefNumber, SymbolTableError> {
        let attrs = oracle.method_type_table_entry(owning, cp);
        self.find_or_create_table_entry_symbol(owning, TableEntry::MethodType(cp), attrs)
    }

    // Unsafe

    #[must_use]
    pub fn find_unsafe_symbol_ref(
        &self,
        data_type: DataType,
        java_static_reference: bool,
        volatile: bool,
    ) -> Option<SymRefNumber> {
        self.unsafe_refs
            .get(&UnsafeKey {
                data_type,
                java_static_reference,
                volatile,
            })
            .copied()
    }

    /// The reference used for `Unsafe` accesses of `data_type`.
    /// `java_object_reference` is whether the access goes into a java object rather than into
    /// native memory.
    pub fn find_or_create_unsafe_symbol_ref(
        &mut self,
        data_type: DataType,
        java_object_reference: bool,
        java_static_reference: bool,
        volatile: bool,
    ) -> SymRefNumber {
        let key = UnsafeKey {
            data_type,
            java_static_reference,
            volatile,
        };
        if let Some(number) = self.unsafe_refs.get(&key) {
            return *number;
        }

        let mut flags = SymbolFlags::UNSAFE | SymbolFlags::ARRAY_SHADOW;
        flags.set(SymbolFlags::VOLATILE, volatile);
        let symbol = self.push_symbol(Symbol::new(data_type, SymbolKind::Shadow, flags));
        let number = self.push_reference(symbol, 0, NO_CP_INDEX, 0);
        self.reference_mut(number).set_resolved();
        self.aliases.unsafe_accesses.insert(number);
        if java_object_reference {
            self.has_unsafe_symbol = true;
        } else {
            self.reference_mut(number).really_shares_symbol = true;
        }

        self.unsafe_refs.insert(key, number);
        number
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::Cell, collections::HashMap};

    use rhojit_base::{
        id::{ClassId, CpIndex, MethodId, OwningMethodIndex},
        types::DataType,
    };

    use super::{
        oracle::{
            ConstantAttributes, ConstantKind, ConstantPoolOracle, FieldAttributes, MethodKind,
            RecognizedField, ResolvedCallee, StaticAttributes,
        },
        symbol::{RuntimeHelper, SymbolFlags, SymbolKind, WellKnown},
        SymbolReferenceTable, SymbolTableError, NO_CP_INDEX,
    };
    use crate::{
        chtable::{
            tests::{compiled, TestHost},
            PersistentChTable,
        },
        guards::CompilationGuards,
        Hotness, JitConfig,
    };

    pub(crate) const INTEGER: ClassId = ClassId::new_unchecked(0x1000);
    pub(crate) const POINT: ClassId = ClassId::new_unchecked(0x2000);

    /// `field` names the field across constant pools, references with the same name are the
    /// same field
    pub(crate) struct TestField {
        pub field: &'static str,
        pub class_name: &'static str,
        pub class: Option<ClassId>,
        pub attrs: FieldAttributes,
    }

    #[derive(Default)]
    pub(crate) struct TestOracle {
        pub fields: HashMap<(OwningMethodIndex, CpIndex), TestField>,
        pub statics: HashMap<(OwningMethodIndex, CpIndex), (&'static str, StaticAttributes)>,
        pub methods: HashMap<(OwningMethodIndex, CpIndex), ResolvedCallee>,
        pub final_in_object: Vec<(OwningMethodIndex, CpIndex)>,
        pub constants: HashMap<(OwningMethodIndex, CpIndex), ConstantAttributes>,
        pub recognized: HashMap<(OwningMethodIndex, CpIndex), RecognizedField>,
        pub final_classes: Vec<ClassId>,
        pub lookahead: HashMap<ClassId, Vec<u32>>,
        pub lookaheads: Cell<usize>,
    }
    impl TestOracle {
        pub fn field(
            &mut self,
            method: OwningMethodIndex,
            cp: CpIndex,
            field: &'static str,
            attrs: FieldAttributes,
        ) {
            self.fields.insert(
                (method, cp),
                TestField {
                    field,
                    class_name: "Point",
                    class: attrs.containing_class,
                    attrs,
                },
            );
        }
    }

    pub(crate) fn resolved_field(offset: u32, data_type: DataType, class: ClassId) -> FieldAttributes {
        FieldAttributes {
            resolved: true,
            offset,
            data_type,
            volatile: false,
            is_final: false,
            private: false,
            unresolved_in_cp: false,
            containing_class: Some(class),
        }
    }

    impl ConstantPoolOracle for TestOracle {
        fn field_attributes(
            &self,
            method: OwningMethodIndex,
            cp: CpIndex,
            _is_store: bool,
        ) -> FieldAttributes {
            self.fields
                .get(&(method, cp))
                .map_or_else(|| FieldAttributes::unresolved(DataType::Int32), |f| f.attrs.clone())
        }

        fn static_attributes(
            &self,
            method: OwningMethodIndex,
            cp: CpIndex,
            _is_store: bool,
        ) -> StaticAttributes {
            self.statics.get(&(method, cp)).map_or_else(
                || StaticAttributes::unresolved(DataType::Int32),
                |(_, attrs)| attrs.clone(),
            )
        }

        fn fields_are_same(
            &self,
            a_method: OwningMethodIndex,
            a_cp: CpIndex,
            b_method: OwningMethodIndex,
            b_cp: CpIndex,
            is_static: bool,
        ) -> bool {
            if is_static {
                let a = self.statics.get(&(a_method, a_cp)).map(|s| s.0);
                let b = self.statics.get(&(b_method, b_cp)).map(|s| s.0);
                a.is_some() && a == b
            } else {
                let a = self.fields.get(&(a_method, a_cp)).map(|f| f.field);
                let b = self.fields.get(&(b_method, b_cp)).map(|f| f.field);
                a.is_some() && a == b
            }
        }

        fn class_name_of_field(&self, method: OwningMethodIndex, cp: CpIndex) -> Option<String> {
            self.fields
                .get(&(method, cp))
                .map(|f| f.class_name.to_owned())
        }

        fn class_of_field(&self, method: OwningMethodIndex, cp: CpIndex) -> Option<ClassId> {
            self.fields.get(&(method, cp)).and_then(|f| f.class)
        }

        fn class_name(&self, class: ClassId) -> String {
            if class == INTEGER {
                "java/lang/Integer".to_owned()
            } else {
                "Point".to_owned()
            }
        }

        fn is_class_final(&self, class: ClassId) -> bool {
            self.final_classes.contains(&class)
        }

        fn recognized_field(
            &self,
            method: OwningMethodIndex,
            cp: CpIndex,
            _is_static: bool,
        ) -> Option<RecognizedField> {
            self.recognized.get(&(method, cp)).copied()
        }

        fn resolved_method(
            &self,
            method: OwningMethodIndex,
            cp: CpIndex,
            _kind: MethodKind,
        ) -> Option<ResolvedCallee> {
            self.methods.get(&(method, cp)).copied()
        }

        fn dynamic_method(
            &self,
            _method: OwningMethodIndex,
            call_site: u32,
        ) -> Option<ResolvedCallee> {
            Some(ResolvedCallee {
                method: MethodId::new_unchecked(0x9000 + call_site as usize),
                unresolved_in_cp: false,
            })
        }

        fn interface_method_is_final_in_object(
            &self,
            method: OwningMethodIndex,
            cp: CpIndex,
        ) -> bool {
            self.final_in_object.contains(&(method, cp))
        }

        fn constant(
            &self,
            method: OwningMethodIndex,
            cp: CpIndex,
            _kind: ConstantKind,
        ) -> ConstantAttributes {
            self.constants
                .get(&(method, cp))
                .copied()
                .unwrap_or(ConstantAttributes {
                    resolved: false,
                    address: 0,
                })
        }

        fn call_site_table_entry(
            &self,
            _method: OwningMethodIndex,
            call_site: u32,
        ) -> ConstantAttributes {
            ConstantAttributes {
                resolved: call_site % 2 == 0,
                address: 0x7000 + call_site as usize * 8,
            }
        }

        fn method_type_table_entry(
            &self,
            _method: OwningMethodIndex,
            _cp: CpIndex,
        ) -> ConstantAttributes {
            ConstantAttributes {
                resolved: false,
                address: 0,
            }
        }

        fn class_lookahead(&self, class: ClassId) -> Vec<u32> {
            self.lookaheads.set(self.lookaheads.get() + 1);
            self.lookahead.get(&class).cloned().unwrap_or_default()
        }
    }

    fn table() -> SymbolReferenceTable {
        SymbolReferenceTable::new(&JitConfig::new(), Hotness::Warm)
    }

    #[test]
    fn test_unresolved_then_resolved_stays_volatile() {
        let mut oracle = TestOracle::default();
        oracle.field(0, 5, "Point.x", FieldAttributes::unresolved(DataType::Int32));
        oracle.field(1, 7, "Point.x", resolved_field(8, DataType::Int32, POINT));

        let mut table = table();
        let first = table.find_or_create_shadow_symbol(&oracle, None, 0, 5, false).unwrap();
        assert!(table.reference(first).is_unresolved());
        assert!(table.symbol_of(first).is_volatile());

        // The resolved field is not volatile, but the symbol is already shared with the
        // unresolved reference which had to assume it was
        let second = table.find_or_create_shadow_symbol(&oracle, None, 1, 7, false).unwrap();
        assert_ne!(first, second);
        assert!(table.reference(second).is_resolved());
        assert_eq!(
            table.reference(first).symbol(),
            table.reference(second).symbol()
        );
        assert!(table.symbol_of(second).is_volatile());
        assert!(table.reference(first).really_shares_symbol);
        assert!(table.reference(second).really_shares_symbol);

        // Going through the resolved cache again must not complain about the volatility
        let third = table.find_or_create_shadow_symbol(&oracle, None, 1, 7, false).unwrap();
        assert_eq!(third, second);
        assert!(table.symbol_of(third).is_volatile());
        assert_eq!(table.unresolved_count(), 1);
        assert!(table.alias_sets().unresolved.contains(first));
    }

    #[test]
    fn test_resolved_field_collapses() {
        let mut oracle = TestOracle::default();
        // Two different constant pools, neither knows about the other's entry
        oracle.field(0, 3, "Point.y", resolved_field(12, DataType::Int32, POINT));
        oracle.field(2, 9, "Point.y (other cp)", resolved_field(12, DataType::Int32, POINT));
        oracle.field(0, 4, "Point.z", resolved_field(16, DataType::Int32, POINT));

        let mut table = table();
        let a = table.find_or_create_shadow_symbol(&oracle, None, 0, 3, false).unwrap();
        let b = table.find_or_create_shadow_symbol(&oracle, None, 2, 9, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);

        let c = table.find_or_create_shadow_symbol(&oracle, None, 0, 4, false).unwrap();
        assert_ne!(a, c);
        assert!(table.alias_sets().int_shadows.contains(a));
        assert!(table.alias_sets().int_shadows.contains(c));
        assert!(table.alias_sets().cp_sym_refs.contains(c));
        assert!(table.alias_sets().address_shadows.is_empty());
    }

    #[test]
    fn test_unresolved_per_owning_method() {
        let mut oracle = TestOracle::default();
        oracle.field(0, 5, "Point.x", FieldAttributes::unresolved(DataType::Address));
        oracle.field(1, 6, "Point.x", FieldAttributes::unresolved(DataType::Address));

        let mut table = table();
        let a = table.find_or_create_shadow_symbol(&oracle, None, 0, 5, false).unwrap();
        assert_eq!(
            table.find_or_create_shadow_symbol(&oracle, None, 0, 5, true).unwrap(),
            a
        );

        // Each inlined method resolves the field on its own
        let b = table.find_or_create_shadow_symbol(&oracle, None, 1, 6, false).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.reference(a).symbol(), table.reference(b).symbol());
        assert_eq!(table.reference(b).unresolved_index(), Some(1));
        assert!(table.reference(b).can_gc_and_return);
        assert!(table.alias_sets().address_shadows.contains(b));
    }

    #[test]
    fn test_recognized_and_fabricated_shadows() {
        let mut oracle = TestOracle::default();
        let value = RecognizedField(1);
        oracle.field(0, 2, "String.value", resolved_field(16, DataType::Address, POINT));
        oracle.recognized.insert((0, 2), value);

        let mut table = table();
        let from_cp = table.find_or_create_shadow_symbol(&oracle, None, 0, 2, false).unwrap();
        let fabricated = table.find_or_fabricate_recognized_shadow(
            &oracle,
            0,
            value,
            DataType::Address,
            16,
            SymbolFlags::FINAL,
        );
        assert_eq!(from_cp, fabricated);

        let named = table
            .find_or_fabricate_shadow_symbol(
                &oracle,
                INTEGER,
                DataType::Int32,
                12,
                SymbolFlags::FINAL | SymbolFlags::PRIVATE,
                "value",
                "I",
            )
            .unwrap();
        assert_eq!(
            table.symbol_of(named).name.as_deref(),
            Some("java/lang/Integer.value I")
        );
        assert_eq!(table.reference(named).cp_index(), NO_CP_INDEX);
        assert_eq!(table.reference(named).owning_method(), 0);
        // Fabricating the same field again finds it
        let again = table
            .find_or_fabricate_shadow_symbol(
                &oracle,
                INTEGER,
                DataType::Int32,
                12,
                SymbolFlags::FINAL | SymbolFlags::PRIVATE,
                "value",
                "I",
            )
            .unwrap();
        assert_eq!(named, again);

        // Asking for it as if it were mutable would make the cached symbol look too permissive
        assert!(matches!(
            table.find_or_fabricate_shadow_symbol(
                &oracle,
                INTEGER,
                DataType::Int32,
                12,
                SymbolFlags::empty(),
                "value",
                "I",
            ),
            Err(SymbolTableError::InternalConsistency(_))
        ));
    }

    #[test]
    fn test_conservative_generic_int_shadow() {
        let mut oracle = TestOracle::default();
        oracle.field(0, 1, "Point.x", resolved_field(8, DataType::Int32, POINT));
        oracle.field(0, 2, "Point.y", resolved_field(12, DataType::Int32, POINT));

        let mut table = table();
        table.find_or_create_shadow_symbol(&oracle, None, 0, 1, false).unwrap();
        let immutable = table.find_or_create_generic_int_shadow(4, false);
        assert!(!table.alias_sets().conservative_generic_int_shadow_aliasing);

        let first = table.find_or_create_generic_int_shadow(8, true);
        let second = table.find_or_create_generic_int_shadow(16, true);
        assert_eq!(
            table.reference(first).symbol(),
            table.reference(second).symbol()
        );
        assert_ne!(
            table.reference(first).symbol(),
            table.reference(immutable).symbol()
        );
        assert!(table.reference(second).really_shares_symbol);
        assert!(!table.alias_sets().conservative_generic_int_shadow_aliasing);

        table.find_or_create_shadow_symbol(&oracle, None, 0, 2, false).unwrap();
        assert!(table.alias_sets().conservative_generic_int_shadow_aliasing);

        let mut config = JitConfig::new();
        config.disable_conservative_generic_int_shadow_aliasing = true;
        let mut table = SymbolReferenceTable::new(&config, Hotness::Warm);
        table.find_or_create_generic_int_shadow(8, true);
        table.find_or_create_shadow_symbol(&oracle, None, 0, 2, false).unwrap();
        assert!(!table.alias_sets().conservative_generic_int_shadow_aliasing);
    }

    #[test]
    fn test_statics() {
        let mut oracle = TestOracle::default();
        let cache = StaticAttributes {
            resolved: true,
            address: 0x5000,
            data_type: DataType::Address,
            volatile: false,
            is_final: true,
            private: true,
            unresolved_in_cp: false,
            declaring_class: Some(INTEGER),
            class_initialized: true,
            value_non_null: true,
        };
        oracle.statics.insert((0, 3), ("Integer.cache", cache.clone()));
        oracle.statics.insert((1, 8), ("Integer.cache", cache.clone()));
        let mut counter = cache;
        counter.address = 0x5008;
        counter.data_type = DataType::Int64;
        counter.is_final = false;
        oracle.statics.insert((0, 4), ("Point.count", counter));
        oracle.statics.insert(
            (0, 6),
            ("Point.unknown", StaticAttributes::unresolved(DataType::Int64)),
        );

        let mut table = table();
        let cache_ref = table.find_or_create_static_symbol(&oracle, 0, 3, false).unwrap();
        assert_eq!(table.reference(cache_ref).known_object, Some(0));
        assert_eq!(
            table.symbol_of(cache_ref).kind,
            SymbolKind::Static {
                address: Some(0x5000)
            }
        );
        assert!(table.alias_sets().address_statics.contains(cache_ref));
        // Same static through another constant pool
        assert_eq!(
            table.find_or_create_static_symbol(&oracle, 1, 8, false).unwrap(),
            cache_ref
        );

        let count_ref = table.find_or_create_static_symbol(&oracle, 0, 4, true).unwrap();
        assert_eq!(table.reference(count_ref).known_object, None);
        assert!(table.alias_sets().int_statics.contains(count_ref));

        let unknown = table.find_or_create_static_symbol(&oracle, 0, 6, false).unwrap();
        assert!(table.reference(unknown).is_unresolved());
        assert!(table.symbol_of(unknown).is_volatile());
        assert_eq!(
            table.symbol_of(unknown).kind,
            SymbolKind::Static { address: None }
        );
        assert_eq!(table.known_object_count(), 1);
    }

    #[test]
    fn test_methods() {
        let mut oracle = TestOracle::default();
        let callee = ResolvedCallee {
            method: MethodId::new_unchecked(0x40),
            unresolved_in_cp: false,
        };
        oracle.methods.insert((0, 10), callee);
        oracle.methods.insert((0, 12), callee);
        oracle.final_in_object.push((0, 13));

        let mut table = table();
        let a = table
            .find_or_create_virtual_method_symbol(&oracle, 0, 10)
            .unwrap();
        assert_eq!(
            table
                .find_or_create_virtual_method_symbol(&oracle, 0, 10)
                .unwrap(),
            a
        );
        assert_eq!(
            table.symbol_of(a).kind,
            SymbolKind::Method {
                method: Some(callee.method),
                kind: MethodKind::Virtual
            }
        );
        // The same entry used by a different kind of invoke is a different reference
        let special = table
            .find_or_create_special_method_symbol(&oracle, 0, 10)
            .unwrap();
        assert_ne!(a, special);

        let unresolved = table
            .find_or_create_static_method_symbol(&oracle, 0, 11)
            .unwrap();
        assert!(table.reference(unresolved).is_unresolved());
        assert!(table.reference(unresolved).can_gc_and_except);

        table
            .find_or_create_interface_method_symbol(&oracle, 0, 12)
            .unwrap();
        assert!(matches!(
            table.find_or_create_interface_method_symbol(&oracle, 0, 13),
            Err(SymbolTableError::MethodFinalInObject { method: 0, cp: 13 })
        ));

        let handle = table
            .find_or_create_handle_method_symbol(&oracle, 0, 12)
            .unwrap();
        assert!(matches!(
            table.symbol_of(handle).kind,
            SymbolKind::Method {
                kind: MethodKind::ComputedVirtual,
                ..
            }
        ));
    }

    #[test]
    fn test_dynamic_methods_per_call_site() {
        let oracle = TestOracle::default();
        let mut table = table();
        let a = table
            .find_or_create_dynamic_method_symbol(&oracle, 0, 3)
            .unwrap();
        assert_eq!(
            table
                .find_or_create_dynamic_method_symbol(&oracle, 0, 3)
                .unwrap(),
            a
        );
        let other_method = table
            .find_or_create_dynamic_method_symbol(&oracle, 1, 3)
            .unwrap();
        let other_site = table
            .find_or_create_dynamic_method_symbol(&oracle, 0, 4)
            .unwrap();
        assert_ne!(a, other_method);
        assert_ne!(a, other_site);
        assert_eq!(table.reference(a).cp_index(), NO_CP_INDEX);
    }

    #[test]
    fn test_constants() {
        let mut oracle = TestOracle::default();
        oracle.constants.insert(
            (0, 20),
            ConstantAttributes {
                resolved: true,
                address: 0x6000,
            },
        );

        let mut table = table();
        let string = table.find_or_create_string_symbol(&oracle, 0, 20).unwrap();
        assert!(table.symbol_of(string).flags.contains(SymbolFlags::CONST_STRING));
        assert_eq!(table.reference(string).known_object, Some(0));
        assert_eq!(table.find_or_create_string_symbol(&oracle, 0, 20).unwrap(), string);

        let dynamic = table
            .find_or_create_constant_dynamic_symbol(&oracle, 0, 21, true)
            .unwrap();
        assert!(table.reference(dynamic).is_unresolved());
        assert!(table.symbol_of(dynamic).flags.contains(
            SymbolFlags::CONSTANT_DYNAMIC | SymbolFlags::CONSTANT_DYNAMIC_PRIMITIVE
        ));
        let method_type = table
            .find_or_create_method_type_symbol(&oracle, 0, 22)
            .unwrap();
        let handle = table
            .find_or_create_method_handle_symbol(&oracle, 0, 23)
            .unwrap();
        assert!(table.alias_sets().address_statics.contains(method_type));
        assert!(table.alias_sets().address_statics.contains(handle));

        // The test oracle only links even call sites
        let linked = table
            .find_or_create_call_site_table_entry_symbol(&oracle, 0, 2)
            .unwrap();
        let unlinked = table
            .find_or_create_call_site_table_entry_symbol(&oracle, 0, 3)
            .unwrap();
        assert!(table.reference(linked).is_resolved());
        assert!(table.reference(linked).known_object.is_some());
        assert!(table.reference(unlinked).can_gc_and_return);
        assert_eq!(
            table
                .find_or_create_call_site_table_entry_symbol(&oracle, 0, 2)
                .unwrap(),
            linked
        );
        assert!(table.alias_sets().call_site_table_entries.contains(unlinked));

        let entry = table
            .find_or_create_method_type_table_entry_symbol(&oracle, 0, 22)
            .unwrap();
        assert!(table.alias_sets().method_type_table_entries.contains(entry));
        assert!(!table.alias_sets().address_statics.contains(entry));
    }

    #[test]
    fn test_helpers_and_well_known() {
        let mut table = table();
        let enter = table.find_or_create_runtime_helper(
            RuntimeHelper::MethodMonitorEntry,
            true,
            true,
            false,
        );
        assert_eq!(
            table.find_or_create_runtime_helper(
                RuntimeHelper::MethodMonitorEntry,
                true,
                true,
                false
            ),
            enter
        );
        assert!(table.reference(enter).can_gc_and_return);

        let barrier =
            table.find_or_create_runtime_helper(RuntimeHelper::WriteBarrierStore, false, false, true);
        assert!(table.reference(barrier).preserves_all_registers);

        let thread = table.find_or_create_well_known(WellKnown::CurrentThread);
        let flags = table.find_or_create_well_known(WellKnown::ClassFlags);
        assert_eq!(table.find_or_create_well_known(WellKnown::CurrentThread), thread);
        assert!(table.alias_sets().address_statics.contains(thread));
        assert!(table.alias_sets().int_shadows.contains(flags));
    }

    #[test]
    fn test_unsafe_cached() {
        let mut table = table();
        assert_eq!(table.find_unsafe_symbol_ref(DataType::Int64, false, false), None);
        let native = table.find_or_create_unsafe_symbol_ref(DataType::Int64, false, false, false);
        assert!(!table.has_unsafe_symbol());
        assert!(table.reference(native).really_shares_symbol);

        let object = table.find_or_create_unsafe_symbol_ref(DataType::Int64, true, false, false);
        // Object and native accesses of the same type share the cached reference
        assert_eq!(object, native);

        let volatile = table.find_or_create_unsafe_symbol_ref(DataType::Int64, true, false, true);
        assert_ne!(volatile, native);
        assert!(table.has_unsafe_symbol());
        assert!(table.symbol_of(volatile).is_volatile());
        assert_eq!(
            table.find_unsafe_symbol_ref(DataType::Int64, false, true),
            Some(volatile)
        );
        assert_eq!(table.alias_sets().unsafe_accesses.len(), 2);
    }

    #[test]
    fn test_devirtualized_call() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        let a = host.add(0x200, "A", Some(0x100));
        let foo = compiled(0x4000, Hotness::Hot);
        host.set_method(a, 0, foo);

        let ch = PersistentChTable::new(&JitConfig::new());
        ch.activate(&host);
        let active = ch.active().unwrap();

        let mut guards = CompilationGuards::new();
        let mut table = table();
        let number = table
            .find_or_create_devirtualized_method_symbol(&mut guards, &active, &host, &host, 0, a, 0)
            .unwrap()
            .unwrap();
        assert_eq!(
            table.symbol_of(number).kind,
            SymbolKind::Method {
                method: Some(foo.method),
                kind: MethodKind::Virtual
            }
        );
        assert!(!guards.is_empty());

        // Nothing implements slot 1
        assert!(table
            .find_or_create_devirtualized_method_symbol(&mut guards, &active, &host, &host, 0, a, 1)
            .unwrap()
            .is_none());
    }
}
