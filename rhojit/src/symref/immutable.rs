//! Tracking of field references whose value never changes once the object is constructed.

use rhojit_base::id::{ClassId, SymRefNumber};

use crate::{chtable::ActiveClassTable, Hotness};

use super::{alias::SymRefSet, oracle::ConstantPoolOracle, SymbolReferenceTable};

/// Classes whose instance fields are all immutable
pub const IMMUTABLE_CLASSES: [&str; 9] = [
    "java/lang/Boolean",
    "java/lang/Character",
    "java/lang/Byte",
    "java/lang/Short",
    "java/lang/Integer",
    "java/lang/Long",
    "java/lang/Float",
    "java/lang/Double",
    "java/lang/String",
];

/// The references to immutable fields of one class
#[derive(Debug)]
pub struct ImmutableInfo {
    class: ClassId,
    sym_refs: SymRefSet,
}
impl ImmutableInfo {
    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    #[must_use]
    pub fn sym_refs(&self) -> &SymRefSet {
        &self.sym_refs
    }
}

impl SymbolReferenceTable {
    /// Decide whether the shadow `number` is a field that is never written after construction,
    /// and if it is then remember that.
    ///
    /// Fields of the well known immutable classes always are. Otherwise private or final fields
    /// of initialized final classes are checked against the class lookahead, which is done at
    /// most once per class and only for hot compilations.
    pub fn check_immutable(
        &mut self,
        oracle: &dyn ConstantPoolOracle,
        classes: Option<&mut ActiveClassTable<'_>>,
        number: SymRefNumber,
    ) {
        let symref = self.reference(number);
        let (owning, cp, offset) = (symref.owning_method(), symref.cp_index(), symref.offset);
        let symbol = self.symbol(symref.symbol());
        if !symbol.is_shadow() || cp < 0 {
            return;
        }
        let candidate = (symbol.is_private() || symbol.is_final()) && !symbol.is_array_shadow();

        if self.immutable_field_aliasing {
            if let Some(name) = oracle.class_name_of_field(owning, cp) {
                if let Some(position) = IMMUTABLE_CLASSES.iter().position(|c| *c == name) {
                    self.has_immutable = true;
                    self.immutable_class_refs[position].insert(number);
                }
            }
        }

        if !candidate {
            return;
        }

        let class = if let Some(class) = oracle.class_of_field(owning, cp) {
            class
        } else {
            return;
        };
        let info = if let Some(info) = classes.and_then(|table| table.find_class_info_mut(class)) {
            info
        } else {
            return;
        };
        if !info.is_initialized() || !oracle.is_class_final(class) {
            return;
        }

        if !info.is_lookahead_done() && self.class_lookahead && self.hotness >= Hotness::Hot {
            let fields = oracle.class_lookahead(class);
            tracing::debug!(
                "Class lookahead on {:X} found {} immutable fields",
                class.get(),
                fields.len()
            );
            info.set_field_info(fields);
        }

        if info.is_immutable_field(offset) {
            self.has_immutable = true;
            self.find_or_create_immutable_info(class)
                .sym_refs
                .insert(number);
        }
    }

    /// Whether the reference was found to be to an immutable field
    #[must_use]
    pub fn is_immutable(&self, number: SymRefNumber) -> bool {
        if !self.has_immutable {
            return false;
        }

        self.immutable_class_refs
            .iter()
            .any(|refs| refs.contains(number))
            || self
                .immutable_infos
                .iter()
                .any(|info| info.sym_refs.contains(number))
    }

    pub fn find_or_create_immutable_info(&mut self, class: ClassId) -> &mut ImmutableInfo {
        let position = self
            .immutable_infos
            .iter()
            .position(|info| info.class == class);
        let position = if let Some(position) = position {
            position
        } else {
            self.immutable_infos.push(ImmutableInfo {
                class,
                sym_refs: SymRefSet::new(),
            });
            self.immutable_infos.len() - 1
        };
        &mut self.immutable_infos[position]
    }

    #[must_use]
    pub fn immutable_info(&self, class: ClassId) -> Option<&ImmutableInfo> {
        self.immutable_infos.iter().find(|info| info.class == class)
    }
}

#[cfg(test)]
mod tests {
    use rhojit_base::types::DataType;

    use crate::{
        chtable::{tests::TestHost, PersistentChTable},
        symref::{
            oracle::FieldAttributes,
            tests::{resolved_field, TestOracle, INTEGER, POINT},
            SymbolReferenceTable,
        },
        Hotness, JitConfig,
    };

    #[test]
    fn test_allow_list() {
        let mut oracle = TestOracle::default();
        oracle.field(0, 1, "Integer.value", resolved_field(12, DataType::Int32, INTEGER));
        oracle.fields.get_mut(&(0, 1)).unwrap().class_name = "java/lang/Integer";
        oracle.field(0, 2, "Point.x", resolved_field(8, DataType::Int32, POINT));
        oracle.field(0, 3, "Integer.value", FieldAttributes::unresolved(DataType::Int32));
        oracle.fields.get_mut(&(0, 3)).unwrap().class_name = "java/lang/Integer";

        // Tagged when the shadow is created
        let mut table = SymbolReferenceTable::new(&JitConfig::new(), Hotness::Warm);
        let value = table.find_or_create_shadow_symbol(&oracle, None, 0, 1, false).unwrap();
        let x = table.find_or_create_shadow_symbol(&oracle, None, 0, 2, false).unwrap();
        assert!(table.is_immutable(value));
        assert!(!table.is_immutable(x));
        assert_eq!(
            table.find_or_create_shadow_symbol(&oracle, None, 0, 1, true).unwrap(),
            value
        );

        // Unresolved references are left alone
        let unresolved = table.find_or_create_shadow_symbol(&oracle, None, 0, 3, false).unwrap();
        assert!(!table.is_immutable(unresolved));

        let mut config = JitConfig::new();
        config.disable_immutable_field_aliasing = true;
        let mut table = SymbolReferenceTable::new(&config, Hotness::Warm);
        let value = table.find_or_create_shadow_symbol(&oracle, None, 0, 1, false).unwrap();
        assert!(!table.is_immutable(value));
    }

    #[test]
    fn test_check_existing_reference() {
        let mut oracle = TestOracle::default();
        oracle.field(0, 1, "Integer.value", resolved_field(12, DataType::Int32, INTEGER));
        oracle.fields.get_mut(&(0, 1)).unwrap().class_name = "java/lang/Integer";

        let mut table = SymbolReferenceTable::new(&JitConfig::new(), Hotness::Warm);
        let value = table.find_or_create_shadow_symbol(&oracle, None, 0, 1, false).unwrap();
        // Checking again doesn't change anything
        table.check_immutable(&oracle, None, value);
        assert!(table.is_immutable(value));
    }

    #[test]
    fn test_lookahead_once_when_hot() {
        let mut host = TestHost::new();
        host.add(0x100, "java/lang/Object", None);
        let point = host.add(POINT.get(), "Point", Some(0x100));

        let mut oracle = TestOracle::default();
        let mut x = resolved_field(8, DataType::Int32, POINT);
        x.is_final = true;
        let mut y = resolved_field(12, DataType::Int32, POINT);
        y.private = true;
        oracle.field(0, 1, "Point.x", x);
        oracle.field(0, 2, "Point.y", y);
        oracle.field(0, 3, "Point.z", resolved_field(16, DataType::Int32, POINT));
        oracle.final_classes.push(point);
        oracle.lookahead.insert(point, vec![8]);

        let ch = PersistentChTable::new(&JitConfig::new());
        ch.activate(&host);
        let mut active = ch.active().unwrap();
        active.class_got_initialized(point, 10);

        // Too cold to bother looking ahead
        let mut table = SymbolReferenceTable::new(&JitConfig::new(), Hotness::Warm);
        let x_ref = table
            .find_or_create_shadow_symbol(&oracle, Some(&mut active), 0, 1, false)
            .unwrap();
        assert!(!table.is_immutable(x_ref));
        assert_eq!(oracle.lookaheads.get(), 0);

        let mut table = SymbolReferenceTable::new(&JitConfig::new(), Hotness::Hot);
        let x_ref = table
            .find_or_create_shadow_symbol(&oracle, Some(&mut active), 0, 1, false)
            .unwrap();
        let y_ref = table
            .find_or_create_shadow_symbol(&oracle, Some(&mut active), 0, 2, false)
            .unwrap();
        // Neither private nor final, so never looked at
        let z_ref = table
            .find_or_create_shadow_symbol(&oracle, Some(&mut active), 0, 3, false)
            .unwrap();
        assert!(table.is_immutable(x_ref));
        assert!(!table.is_immutable(y_ref));
        assert!(!table.is_immutable(z_ref));
        assert_eq!(oracle.lookaheads.get(), 1);
        assert_eq!(
            table.immutable_info(point).map(|info| info.sym_refs().len()),
            Some(1)
        );

        // The result is kept with the class, so a later compilation doesn't repeat it
        let mut table = SymbolReferenceTable::new(&JitConfig::new(), Hotness::Scorching);
        let x_ref = table
            .find_or_create_shadow_symbol(&oracle, Some(&mut active), 0, 1, false)
            .unwrap();
        assert!(table.is_immutable(x_ref));
        assert_eq!(oracle.lookaheads.get(), 1);

        // Without a class table only the well known classes are recognized
        let mut table = SymbolReferenceTable::new(&JitConfig::new(), Hotness::Scorching);
        let x_ref = table.find_or_create_shadow_symbol(&oracle, None, 0, 1, false).unwrap();
        assert!(!table.is_immutable(x_ref));
    }
}
