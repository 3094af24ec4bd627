#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
// These highlight the entire function
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Too error prone
#![allow(clippy::similar_names)]
// Annoying. Really shouldn't highlight the entire thing.
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::struct_excessive_bools)]

//! The runtime side of the jit: the tables which remember what compiled code assumed about the
//! running program, and which patch that code when those assumptions break.
//!
//! Lock ordering: when both are needed, the class table lock is taken before the assumption
//! table lock.

use assumption::PatchTarget;
use chtable::{class_info::ClassInfoFlags, ClassHost, PersistentChTable};
use code_memory::{CodeMemory, CodePatchError};
use jit_options::{JitOptions, OptionValueError};
use rat::AssumptionTable;
use rhojit_base::{address_set::DEFAULT_MAX_ADDRESS_RANGES, id::ClassId};

pub mod assumption;
pub mod chtable;
pub mod code_memory;
pub mod guards;
pub mod rat;
pub mod symref;
pub mod unloaded;

pub const ENV_TRACING_LEVEL: &str = "RHOJIT_LOG_LEVEL";
pub const DEFAULT_TRACING_LEVEL: tracing::Level = tracing::Level::WARN;

/// Default cap on the number of subclasses an implementor collection will look at before giving up
pub const DEFAULT_MAX_VISITED_SUBCLASSES: usize = 500;

/// How hot a compiled body is. Ordered from coldest to hottest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hotness {
    NoOpt,
    Cold,
    Warm,
    Hot,
    VeryHot,
    Scorching,
}
impl Hotness {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Hotness> {
        Some(match name {
            "noOpt" => Hotness::NoOpt,
            "cold" => Hotness::Cold,
            "warm" => Hotness::Warm,
            "hot" => Hotness::Hot,
            "veryHot" => Hotness::VeryHot,
            "scorching" => Hotness::Scorching,
            _ => return None,
        })
    }
}

/// Configuration for the runtime tables.
/// This is read once, when the tables are created, and never consulted from global state after.
#[derive(Debug, Clone)]
pub struct JitConfig {
    pub tracing_level: tracing::Level,
    /// The architecture that patch sites are encoded for
    pub target: PatchTarget,
    /// Bucket count for class extend assumptions, `0` for the default
    pub class_extend_rat_size: usize,
    /// Bucket count for method override assumptions, `0` for the default
    pub method_override_rat_size: usize,
    /// Bucket count for unresolved redefinition PIC assumptions, `0` for the default
    pub class_redefinition_upic_rat_size: usize,
    /// Whether classes come out of a shared class cache, which means far more class extend
    /// assumptions tend to be made
    pub shared_class_cache: bool,
    /// Hot code replace. Classes may be redefined.
    pub hcr_enabled: bool,
    /// Compensate and drop every assumption every tenth insertion of a kind.
    /// This is a debugging aid for shaking out missing guards.
    pub rat_purging: bool,
    /// Number of ranges in each of the unloaded address sets, `0` for the default
    pub max_unloaded_address_ranges: usize,
    /// The implementor collections give up after looking at this many subclasses
    pub max_visited_subclasses: usize,
    /// Disable all class hierarchy based answers
    pub disable_ch_opts: bool,
    /// Once a mutable generic int shadow exists, new shadows alias with it conservatively
    pub disable_conservative_generic_int_shadow_aliasing: bool,
    /// Don't tag fields of the well known immutable classes
    pub disable_immutable_field_aliasing: bool,
    /// Don't run class lookahead when checking field immutability at high opt levels
    pub disable_class_lookahead: bool,
    /// A single implementation is only used for devirtualization once it has been compiled at
    /// this hotness
    pub jitted_implementer_hotness: Hotness,
}
impl JitConfig {
    #[must_use]
    pub fn new() -> JitConfig {
        let tracing_level = JitConfig::compute_tracing_level();
        JitConfig {
            tracing_level,
            target: PatchTarget::host(),
            class_extend_rat_size: 0,
            method_override_rat_size: 0,
            class_redefinition_upic_rat_size: 0,
            shared_class_cache: false,
            hcr_enabled: false,
            rat_purging: false,
            max_unloaded_address_ranges: 0,
            max_visited_subclasses: DEFAULT_MAX_VISITED_SUBCLASSES,
            disable_ch_opts: false,
            disable_conservative_generic_int_shadow_aliasing: false,
            disable_immutable_field_aliasing: false,
            disable_class_lookahead: false,
            jitted_implementer_hotness: Hotness::Warm,
        }
    }

    /// The default configuration with `options` applied on top
    pub fn from_options(options: &JitOptions) -> Result<JitConfig, ConfigError> {
        let mut config = JitConfig::new();
        config.apply_options(options)?;
        Ok(config)
    }

    #[must_use]
    pub fn compute_tracing_level() -> tracing::Level {
        let env_log = std::env::var(ENV_TRACING_LEVEL);
        if let Ok(env_log) = env_log {
            if env_log.eq_ignore_ascii_case("trace") || env_log == "*" {
                tracing::Level::TRACE
            } else if env_log.eq_ignore_ascii_case("debug") {
                tracing::Level::DEBUG
            } else if env_log.eq_ignore_ascii_case("info") {
                tracing::Level::INFO
            } else if env_log.eq_ignore_ascii_case("warn") {
                tracing::Level::WARN
            } else if env_log.eq_ignore_ascii_case("error") {
                tracing::Level::ERROR
            } else {
                DEFAULT_TRACING_LEVEL
            }
        } else {
            DEFAULT_TRACING_LEVEL
        }
    }

    /// The number of ranges each unloaded address set is created with
    #[must_use]
    pub fn unloaded_address_ranges(&self) -> usize {
        if self.max_unloaded_address_ranges < 1 {
            DEFAULT_MAX_ADDRESS_RANGES
        } else {
            self.max_unloaded_address_ranges
        }
    }

    /// Apply options parsed from an option string.
    /// Unknown options are ignored (with a warning) since the option string is shared with
    /// other parts of the jit.
    pub fn apply_options(&mut self, options: &JitOptions) -> Result<(), ConfigError> {
        for option in options.iter() {
            let name = option.name.as_str();
            match name {
                "enableRATPurging" => self.rat_purging = true,
                "sharedClassCache" => self.shared_class_cache = true,
                "enableHCR" => self.hcr_enabled = true,
                "disableCHOpts" => self.disable_ch_opts = true,
                "disableConservativeGenericIntShadowAliasing" => {
                    self.disable_conservative_generic_int_shadow_aliasing = true;
                }
                "disableImmutableFieldAliasing" => self.disable_immutable_field_aliasing = true,
                "disableClassLookahead" => self.disable_class_lookahead = true,
                "classExtendRatSize" => {
                    self.class_extend_rat_size = require_usize(options, name)?;
                }
                "methodOverrideRatSize" => {
                    self.method_override_rat_size = require_usize(options, name)?;
                }
                "classRedefinitionUPICRatSize" => {
                    self.class_redefinition_upic_rat_size = require_usize(options, name)?;
                }
                "maxUnloadedAddressRanges" => {
                    self.max_unloaded_address_ranges = require_usize(options, name)?;
                }
                "maxNumVisitedSubclasses" => {
                    self.max_visited_subclasses = require_usize(options, name)?;
                }
                "target" => {
                    let value = options.value(name).unwrap_or("");
                    self.target = PatchTarget::from_name(value)
                        .ok_or_else(|| ConfigError::UnknownTarget(value.to_owned()))?;
                }
                "jittedImplementerHotness" => {
                    let value = options.value(name).unwrap_or("");
                    self.jitted_implementer_hotness = Hotness::from_name(value)
                        .ok_or_else(|| ConfigError::UnknownHotness(value.to_owned()))?;
                }
                _ => tracing::warn!("Ignoring unrecognized jit option '{}'", name),
            }
        }

        Ok(())
    }
}

fn require_usize(options: &JitOptions, name: &str) -> Result<usize, ConfigError> {
    options
        .value_usize(name)?
        .ok_or_else(|| ConfigError::MissingValue(name.to_owned()))
}

impl Default for JitConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The option needs a value but was given as a flag
    MissingValue(String),
    /// The value of an option was not valid
    BadValue(OptionValueError),
    /// The patch target name was not one that we know
    UnknownTarget(String),
    UnknownHotness(String),
}
impl From<OptionValueError> for ConfigError {
    fn from(err: OptionValueError) -> Self {
        Self::BadValue(err)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum AssumptionError {
    /// The assumption could not be allocated.
    /// The guard it was for can't be relied on, so the caller must use the conservative path.
    AllocationFailure,
    /// Patching the code failed
    Patch(CodePatchError),
    /// A table invariant did not hold. This is a bug in the caller.
    InternalConsistency(&'static str),
}
impl From<CodePatchError> for AssumptionError {
    fn from(err: CodePatchError) -> Self {
        Self::Patch(err)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum ClassTableError {
    /// The class was already in the table
    DuplicateClass(ClassId),
    /// The class table could not grow
    AllocationFailure,
    /// The host failed to walk its loaded classes
    WalkFailed,
    /// The class table has not been activated
    NotActive,
    Assumption(AssumptionError),
}
impl From<AssumptionError> for ClassTableError {
    fn from(err: AssumptionError) -> Self {
        Self::Assumption(err)
    }
}

/// The runtime tables shared by every compilation
pub struct JitRuntime<M: CodeMemory> {
    config: JitConfig,
    assumptions: AssumptionTable<M>,
    ch_table: PersistentChTable,
}
impl<M: CodeMemory> JitRuntime<M> {
    pub fn new(config: JitConfig, code: M) -> JitRuntime<M> {
        let assumptions = AssumptionTable::new(&config, code);
        let ch_table = PersistentChTable::new(&config);
        JitRuntime {
            config,
            assumptions,
            ch_table,
        }
    }

    #[must_use]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    #[must_use]
    pub fn assumptions(&self) -> &AssumptionTable<M> {
        &self.assumptions
    }

    #[must_use]
    pub fn ch_table(&self) -> &PersistentChTable {
        &self.ch_table
    }

    /// Whether the class is unloaded, or is a class that has been replaced by a redefinition.
    pub fn is_obsolete_class(&self, class: ClassId, host: &dyn ClassHost) -> bool {
        if self.assumptions.is_unloaded_class(class.get()) {
            return true;
        }

        let is_known_class = self
            .ch_table
            .active()
            .map_or(false, |table| table.find_class_info(class).is_some());
        // It's not a class we know of, so it can't be a replaced class
        is_known_class && host.class_has_been_replaced(class)
    }

    /// A class finished loading. Its superclasses and interfaces are now extended, which
    /// compensates every class extend assumption on them.
    pub fn class_loaded(
        &self,
        host: &dyn ClassHost,
        class: ClassId,
    ) -> Result<usize, ClassTableError> {
        let mut table = self.ch_table.active().ok_or(ClassTableError::NotActive)?;
        table.class_got_loaded(host, class)?;

        let mut assumptions = self.assumptions.lock();
        Ok(table.notify_superclasses_of_extension(host, class, &mut assumptions)?)
    }

    /// A class is being unloaded, along with `size` bytes of method code at `method_start`
    pub fn class_unloaded(
        &self,
        class: ClassId,
        method_start: usize,
        size: u32,
    ) -> Result<usize, ClassTableError> {
        if let Some(mut table) = self.ch_table.active() {
            table.class_got_unloaded(class);
        }

        let mut assumptions = self.assumptions.lock();
        assumptions
            .unloaded_mut()
            .add_unloaded_class(class, method_start, size);
        Ok(assumptions.notify_class_unload_event(class, class)?)
    }

    /// A static final field of `class` was written to after the class was initialized
    pub fn static_final_field_modified(&self, class: ClassId) -> Result<usize, ClassTableError> {
        if let Some(mut table) = self.ch_table.active() {
            if let Some(info) = table.find_class_info_mut(class) {
                info.set_flag(ClassInfoFlags::CANNOT_TRUST_STATIC_FINAL);
            }
        }

        let mut assumptions = self.assumptions.lock();
        Ok(assumptions.notify_illegal_static_final_field_modification_event(class)?)
    }

    /// `old` was replaced by `new`
    pub fn class_redefined(&self, old: ClassId, new: ClassId) -> Result<(), ClassTableError> {
        if let Some(mut table) = self.ch_table.active() {
            table.class_got_redefined(old, new);
        }

        let mut assumptions = self.assumptions.lock();
        Ok(assumptions.notify_class_redefinition_event(old, new)?)
    }
}
