use std::collections::HashMap;
use std::sync::Arc;

use crate::state::VariableTable;

use super::{EntityBehavior, EntityFlags};

pub type EntityTypeId = u16;

/// Per-type constructor: the variable table, default flags, and the
/// behavior that gives entities of this type their logic.
pub trait EntityFactory {
    fn flags(&self) -> EntityFlags;
    fn table(&self) -> &Arc<VariableTable>;
    fn create_behavior(&self) -> Box<dyn EntityBehavior>;
}

/// Closure-backed factory, enough for most types.
pub struct BasicEntityFactory {
    flags: EntityFlags,
    table: Arc<VariableTable>,
    constructor: Box<dyn Fn() -> Box<dyn EntityBehavior>>,
}

impl BasicEntityFactory {
    pub fn new(
        flags: EntityFlags,
        table: Arc<VariableTable>,
        constructor: impl Fn() -> Box<dyn EntityBehavior> + 'static,
    ) -> Self {
        Self {
            flags,
            table,
            constructor: Box::new(constructor),
        }
    }
}

impl EntityFactory for BasicEntityFactory {
    fn flags(&self) -> EntityFlags {
        self.flags
    }

    fn table(&self) -> &Arc<VariableTable> {
        &self.table
    }

    fn create_behavior(&self) -> Box<dyn EntityBehavior> {
        (self.constructor)()
    }
}

/// Immutable-after-bootstrap table of entity factories keyed by type id.
#[derive(Default)]
pub struct EntityRegistry {
    factories: HashMap<EntityTypeId, Box<dyn EntityFactory>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_id: EntityTypeId, factory: Box<dyn EntityFactory>) {
        if self.factories.insert(type_id, factory).is_some() {
            log::warn!("entity type {type_id} registered twice");
        }
    }

    pub fn get(&self, type_id: EntityTypeId) -> Option<&dyn EntityFactory> {
        self.factories.get(&type_id).map(|f| f.as_ref())
    }
}
