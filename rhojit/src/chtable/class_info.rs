use rhojit_base::id::ClassId;
use smallvec::SmallVec;

bitflags::bitflags! {
    pub struct ClassInfoFlags: u8 {
        /// Instances of the class may have their monitor reserved
        const RESERVABLE = 1 << 0;
        const HAS_ANNOTATIONS = 1 << 1;
        /// A static final field of the class was written after initialization
        const CANNOT_TRUST_STATIC_FINAL = 1 << 2;
        /// The class has been replaced by a redefinition
        const REDEFINED = 1 << 3;
    }
}

/// Result of checking a class against the shared class cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcvResult {
    NotYetValidated,
    Success,
    Failure,
}

/// The largest timestamp a class can record, in milliseconds since startup
pub const MAX_TIMESTAMP: u16 = 0xFFFF;

/// What the class table knows about a single loaded class.
/// Subclasses are stored by id, the table owns every info.
#[derive(Debug, Clone)]
pub struct PersistentClassInfo {
    class: ClassId,
    initialized: bool,
    sub_classes: SmallVec<[ClassId; 4]>,
    /// When the class was initialized, in milliseconds since startup
    timestamp: u16,
    flags: ClassInfoFlags,
    name_length: Option<u32>,
    ccv_result: CcvResult,
    unloaded: bool,
    /// Offsets of the fields that are never written after initialization.
    /// `None` until the class has been looked ahead at.
    field_info: Option<SmallVec<[u32; 4]>>,
}
impl PersistentClassInfo {
    #[must_use]
    pub fn new(class: ClassId) -> PersistentClassInfo {
        PersistentClassInfo {
            class,
            initialized: false,
            sub_classes: SmallVec::new(),
            timestamp: 0,
            flags: ClassInfoFlags::empty(),
            name_length: None,
            ccv_result: CcvResult::NotYetValidated,
            unloaded: false,
            field_info: None,
        }
    }

    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// `elapsed_ms` is the time since startup, which saturates at [`MAX_TIMESTAMP`]
    pub fn set_initialized(&mut self, elapsed_ms: u64) {
        self.initialized = true;
        self.timestamp = u16::try_from(elapsed_ms).unwrap_or(MAX_TIMESTAMP);
    }

    #[must_use]
    pub fn timestamp(&self) -> u16 {
        self.timestamp
    }

    #[must_use]
    pub fn sub_classes(&self) -> &[ClassId] {
        &self.sub_classes
    }

    pub fn add_sub_class(&mut self, sub: ClassId) {
        self.sub_classes.push(sub);
    }

    /// Remove one occurrence of `sub`, returning whether it was there
    pub fn remove_a_sub_class(&mut self, sub: ClassId) -> bool {
        if let Some(position) = self.sub_classes.iter().position(|x| *x == sub) {
            self.sub_classes.remove(position);
            true
        } else {
            false
        }
    }

    pub fn remove_sub_classes(&mut self) {
        self.sub_classes.clear();
    }

    pub fn remove_unloaded_sub_classes(&mut self, is_unloaded: impl Fn(ClassId) -> bool) {
        self.sub_classes.retain(|sub| !is_unloaded(*sub));
    }

    #[must_use]
    pub fn flags(&self) -> ClassInfoFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ClassInfoFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: ClassInfoFlags) {
        self.flags.remove(flag);
    }

    #[must_use]
    pub fn name_length(&self) -> Option<u32> {
        self.name_length
    }

    pub fn set_name_length(&mut self, length: u32) {
        self.name_length = Some(length);
    }

    #[must_use]
    pub fn ccv_result(&self) -> CcvResult {
        self.ccv_result
    }

    pub fn set_ccv_result(&mut self, result: CcvResult) {
        self.ccv_result = result;
    }

    #[must_use]
    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }

    pub fn set_unloaded(&mut self) {
        self.unloaded = true;
    }

    #[must_use]
    pub fn is_lookahead_done(&self) -> bool {
        self.field_info.is_some()
    }

    /// Record the immutable field offsets found by looking ahead at the class
    pub fn set_field_info(&mut self, immutable_offsets: impl IntoIterator<Item = u32>) {
        self.field_info = Some(immutable_offsets.into_iter().collect());
    }

    #[must_use]
    pub fn field_info(&self) -> Option<&[u32]> {
        self.field_info.as_deref()
    }

    #[must_use]
    pub fn is_immutable_field(&self, offset: u32) -> bool {
        self.field_info
            .as_ref()
            .map_or(false, |fields| fields.contains(&offset))
    }
}
