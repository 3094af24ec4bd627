//! What the symbol table needs to know about the constant pools of the methods in a compilation.

use rhojit_base::{
    id::{ClassId, CpIndex, MethodId, OwningMethodIndex},
    types::DataType,
};

/// A field that the compiler knows by name, such as `java/lang/String.value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecognizedField(pub u32);

/// What resolving an instance field reference told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAttributes {
    pub resolved: bool,
    /// Offset from the start of the object. Meaningless when unresolved.
    pub offset: u32,
    pub data_type: DataType,
    pub volatile: bool,
    pub is_final: bool,
    pub private: bool,
    /// The constant pool entry itself was unresolved when the bytecode was looked at
    pub unresolved_in_cp: bool,
    /// The class which declares the field, if known
    pub containing_class: Option<ClassId>,
}
impl FieldAttributes {
    /// An unresolved field of `data_type`.
    /// Nothing is known about it, so it has to be treated as volatile.
    #[must_use]
    pub fn unresolved(data_type: DataType) -> FieldAttributes {
        FieldAttributes {
            resolved: false,
            offset: 0,
            data_type,
            volatile: true,
            is_final: false,
            private: false,
            unresolved_in_cp: true,
            containing_class: None,
        }
    }
}

/// What resolving a static field reference told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAttributes {
    pub resolved: bool,
    /// Address of the static's storage. Meaningless when unresolved.
    pub address: usize,
    pub data_type: DataType,
    pub volatile: bool,
    pub is_final: bool,
    pub private: bool,
    pub unresolved_in_cp: bool,
    pub declaring_class: Option<ClassId>,
    /// Whether the declaring class has finished initialization
    pub class_initialized: bool,
    /// Whether the static currently holds a non-null reference
    pub value_non_null: bool,
}
impl StaticAttributes {
    #[must_use]
    pub fn unresolved(data_type: DataType) -> StaticAttributes {
        StaticAttributes {
            resolved: false,
            address: 0,
            data_type,
            volatile: true,
            is_final: false,
            private: false,
            unresolved_in_cp: true,
            declaring_class: None,
            class_initialized: false,
            value_non_null: false,
        }
    }
}

/// The different ways a method can be invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Static,
    Special,
    Virtual,
    Interface,
    /// Invoked through a method handle or call site, the target is only known at runtime
    ComputedVirtual,
    /// A runtime helper routine
    Helper,
}

/// A resolved call target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCallee {
    pub method: MethodId,
    pub unresolved_in_cp: bool,
}

/// The kinds of constant pool entries which are loaded as objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantKind {
    String,
    MethodType,
    MethodHandle,
    /// A dynamically computed constant. `primitive` is whether it produces a primitive value,
    /// which is then boxed.
    Dynamic { primitive: bool },
}

/// Where a resolved constant object lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantAttributes {
    pub resolved: bool,
    /// Address of the slot holding the object reference
    pub address: usize,
}

/// The constant pool view of every method in a compilation.
/// Methods are identified by their index within the compilation, and entries by their constant
/// pool index in that method.
pub trait ConstantPoolOracle {
    fn field_attributes(
        &self,
        method: OwningMethodIndex,
        cp: CpIndex,
        is_store: bool,
    ) -> FieldAttributes;

    fn static_attributes(
        &self,
        method: OwningMethodIndex,
        cp: CpIndex,
        is_store: bool,
    ) -> StaticAttributes;

    /// Whether two (possibly unresolved) field references name the same field
    fn fields_are_same(
        &self,
        a_method: OwningMethodIndex,
        a_cp: CpIndex,
        b_method: OwningMethodIndex,
        b_cp: CpIndex,
        is_static: bool,
    ) -> bool;

    /// Name of the class which a field reference names, such as `java/lang/Integer`
    fn class_name_of_field(&self, method: OwningMethodIndex, cp: CpIndex) -> Option<String>;

    /// The class a field reference resolves to, if it has been loaded
    fn class_of_field(&self, method: OwningMethodIndex, cp: CpIndex) -> Option<ClassId>;

    fn class_name(&self, class: ClassId) -> String;

    fn is_class_final(&self, class: ClassId) -> bool;

    /// Whether final fields of objects of the class may be folded to the values they hold
    fn fold_final_fields_in(&self, _class: ClassId) -> bool {
        true
    }

    fn recognized_field(
        &self,
        method: OwningMethodIndex,
        cp: CpIndex,
        is_static: bool,
    ) -> Option<RecognizedField>;

    /// Resolve the method reference. `kind` says how it is invoked.
    fn resolved_method(
        &self,
        method: OwningMethodIndex,
        cp: CpIndex,
        kind: MethodKind,
    ) -> Option<ResolvedCallee>;

    /// The adapter method that an `invokedynamic` call site is linked through
    fn dynamic_method(&self, method: OwningMethodIndex, call_site: u32) -> Option<ResolvedCallee>;

    /// Whether the interface method reference actually names a method which `java/lang/Object`
    /// declares as final, which the verifier should have rejected
    fn interface_method_is_final_in_object(&self, method: OwningMethodIndex, cp: CpIndex) -> bool;

    fn constant(&self, method: OwningMethodIndex, cp: CpIndex, kind: ConstantKind)
        -> ConstantAttributes;

    /// The call site table entry for an `invokedynamic`
    fn call_site_table_entry(
        &self,
        method: OwningMethodIndex,
        call_site: u32,
    ) -> ConstantAttributes;

    /// The method type table entry for an `invokehandle`
    fn method_type_table_entry(&self, method: OwningMethodIndex, cp: CpIndex)
        -> ConstantAttributes;

    /// Offsets of the instance fields of `class` which are never written after construction.
    /// This is potentially expensive, so is only asked once per class.
    fn class_lookahead(&self, class: ClassId) -> Vec<u32>;
}
