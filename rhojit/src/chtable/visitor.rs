use rhojit_base::{
    id::ClassId,
    util::{new_address_hash_set, AddressHashSet, AddressMap},
};

use super::{class_info::PersistentClassInfo, ClassHost};

/// Something that is shown each live subclass under a root, depth first
pub(crate) trait SubclassVisitor {
    /// Returns whether the walk should go into the subclasses of `info`
    fn visit_subclass(&mut self, info: &PersistentClassInfo, depth: usize) -> bool;

    fn should_stop(&self) -> bool;
}

/// Walk the subclasses of `root`, not including `root` itself.
/// Unloaded classes (and so everything only reachable through them) are skipped.
pub(crate) fn walk_subclasses(
    classes: &AddressMap<ClassId, PersistentClassInfo>,
    host: &dyn ClassHost,
    root: ClassId,
    visitor: &mut dyn SubclassVisitor,
) {
    let info = if let Some(info) = classes.get(&root) {
        info
    } else {
        return;
    };

    // Through interfaces (or from the top of the hierarchy) the same class can be reached twice
    let might_visit_more_than_once = host.is_interface(root) || host.class_depth(root) == 0;
    let mut walk = Walk {
        classes,
        visited: might_visit_more_than_once.then(new_address_hash_set),
    };
    walk.visit_subclasses(info, 1, visitor);
}

struct Walk<'a> {
    classes: &'a AddressMap<ClassId, PersistentClassInfo>,
    visited: Option<AddressHashSet<ClassId>>,
}
impl<'a> Walk<'a> {
    fn visit_subclasses(
        &mut self,
        info: &PersistentClassInfo,
        depth: usize,
        visitor: &mut dyn SubclassVisitor,
    ) {
        let classes = self.classes;
        for sub in info.sub_classes() {
            let sub_info = if let Some(sub_info) = classes.get(sub) {
                sub_info
            } else {
                continue;
            };
            if sub_info.is_unloaded() {
                continue;
            }

            if let Some(visited) = &mut self.visited {
                if !visited.insert(*sub) {
                    continue;
                }
            }

            let recurse = visitor.visit_subclass(sub_info, depth);
            if recurse && !visitor.should_stop() {
                self.visit_subclasses(sub_info, depth + 1, visitor);
            }

            if visitor.should_stop() {
                break;
            }
        }
    }
}

/// Collect classes, optionally stopping at a count
pub(crate) struct CollectClasses<F: FnMut(&PersistentClassInfo) -> Option<bool>> {
    pub classes: Vec<ClassId>,
    /// Decides what to do with a class. `None` leaves it out but still recurses into its
    /// subclasses, otherwise the class is collected and the value says whether to recurse.
    filter: F,
    limit: Option<usize>,
    stop: bool,
}
impl<F: FnMut(&PersistentClassInfo) -> Option<bool>> CollectClasses<F> {
    pub fn new(filter: F, limit: Option<usize>) -> CollectClasses<F> {
        CollectClasses {
            classes: Vec::new(),
            filter,
            limit,
            stop: false,
        }
    }
}
impl<F: FnMut(&PersistentClassInfo) -> Option<bool>> SubclassVisitor for CollectClasses<F> {
    fn visit_subclass(&mut self, info: &PersistentClassInfo, _depth: usize) -> bool {
        if let Some(recurse) = (self.filter)(info) {
            self.classes.push(info.class());
            if self.limit.map_or(false, |limit| self.classes.len() >= limit) {
                self.stop = true;
            }
            recurse
        } else {
            true
        }
    }

    fn should_stop(&self) -> bool {
        self.stop
    }
}
