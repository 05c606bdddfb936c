//! Insertion of new primitives into existing relations

use rustc_hash::{FxHashMap, FxHashSet};

use crate::osm::{Member, OsmElement, Relation};

macro_rules! dprintln {
    ($($arg:tt)*) => (#[cfg(debug_assertions)] println!($($arg)*));
}

/// Default tag-key prefix marking relation memberships on input features
pub const MEMBER_OF_PREFIX: &str = "_member_of_";

/// Updater owning a store of existing relations and the set of modified ids
///
/// The store is loaded once from the OSM source; every update replaces the
/// stored relation with a copy holding the additional member, so the modified
/// set can be emitted at any point.
pub struct RelationUpdater {
    relations_db: FxHashMap<i64, Relation>,
    modified: FxHashSet<i64>,
}

impl RelationUpdater {
    pub fn new(relations_db: FxHashMap<i64, Relation>) -> RelationUpdater {
        RelationUpdater {
            relations_db,
            modified: FxHashSet::default(),
        }
    }

    /// Add `object` as a member of every relation named by its prefixed tags.
    ///
    /// Tag values are comma-separated relation ids; ids missing from the store
    /// are skipped. The new member carries an empty role and is inserted
    /// before the member whose ref equals `at_id` when one exists, otherwise
    /// appended.
    pub fn modify_with(&mut self, object: &OsmElement, key_prefix: &str, at_id: Option<i64>) {
        let relation_ids: Vec<i64> = object
            .tags()
            .iter()
            .filter(|tag| tag.key.starts_with(key_prefix))
            .flat_map(|tag| tag.value.split(','))
            .filter_map(|value| value.trim().parse().ok())
            .collect();

        for relation_id in relation_ids {
            let Some(existing) = self.relations_db.get(&relation_id) else {
                dprintln!(
                    "Skipping relation {relation_id} for object {}: not in relation store",
                    object.id()
                );
                continue;
            };

            let member = Member {
                ref_: object.id(),
                type_: object.member_type(),
                role: String::new(),
            };
            let mut updated = existing.clone();
            let index = at_id
                .and_then(|at| updated.members.iter().position(|m| m.ref_ == at))
                .unwrap_or(updated.members.len());
            updated.members.insert(index, member);

            self.relations_db.insert(relation_id, updated);
            self.modified.insert(relation_id);
        }
    }

    /// Relations modified so far, in id order.
    pub fn modified_relations(&self) -> Vec<&Relation> {
        let mut ids: Vec<i64> = self.modified.iter().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| self.relations_db.get(id))
            .collect()
    }

    pub fn modified_ids(&self) -> &FxHashSet<i64> {
        &self.modified
    }
}
