use std::sync::Arc;

use glam::{Quat, Vec3};

use crate::entity::EntityId;
use crate::session::WireId;

use super::variable::{Value, Var, VariableFlags, VariableKind};

/// Two 32-bit dirty-mask words bound the ordinal space.
pub const MAX_VARIABLES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("type declares more than {MAX_VARIABLES} variables")]
    TooManyVariables,
    #[error("duplicate variable tag {0}")]
    DuplicateTag(u16),
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub tag: u16,
    pub kind: VariableKind,
    pub flags: VariableFlags,
    pub ordinal: u8,
    pub default: Value,
}

/// Immutable per-type descriptor: variables in ordinal order plus the
/// subset lists the copy/interpolate passes iterate.
#[derive(Debug)]
pub struct VariableTable {
    variables: Vec<Variable>,
    decl_to_ordinal: Vec<u8>,
    predicted: Vec<u8>,
    interpolated: Vec<u8>,
    immediate: Vec<u8>,
}

impl VariableTable {
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, ordinal: usize) -> &Variable {
        &self.variables[ordinal]
    }

    pub fn predicted_ordinals(&self) -> &[u8] {
        &self.predicted
    }

    pub fn interpolated_ordinals(&self) -> &[u8] {
        &self.interpolated
    }

    /// Ordinals of variables that are neither predicted nor interpolated.
    pub fn immediate_ordinals(&self) -> &[u8] {
        &self.immediate
    }

    pub(crate) fn ordinal_of_index(&self, decl_index: usize) -> usize {
        self.decl_to_ordinal[decl_index] as usize
    }

    pub fn default_values(&self) -> Vec<Value> {
        self.variables.iter().map(|v| v.default.clone()).collect()
    }
}

struct Declaration {
    tag: u16,
    kind: VariableKind,
    flags: VariableFlags,
    priority: i32,
}

/// Declares the variables of one entity state type. Ordinals are assigned
/// at `build` by ascending priority, ties broken by declaration order, so
/// wire layout is independent of registration order across versions.
#[derive(Default)]
pub struct TableBuilder {
    declarations: Vec<Declaration>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, tag: u16, kind: VariableKind, flags: VariableFlags, priority: i32) -> u8 {
        let index = self.declarations.len() as u8;
        self.declarations.push(Declaration {
            tag,
            kind,
            flags,
            priority,
        });
        index
    }

    pub fn int32(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<i32> {
        Var::new(self.push(tag, VariableKind::Int32, flags, priority))
    }

    pub fn varint(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<i32> {
        Var::new(self.push(tag, VariableKind::VarInt, flags, priority))
    }

    pub fn uint(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<u32> {
        Var::new(self.push(tag, VariableKind::Uint, flags, priority))
    }

    pub fn float(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<f32> {
        Var::new(self.push(tag, VariableKind::Float, flags, priority))
    }

    pub fn vec3(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<Vec3> {
        Var::new(self.push(tag, VariableKind::Vec3, flags, priority))
    }

    pub fn quaternion(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<Quat> {
        Var::new(self.push(tag, VariableKind::Quaternion, flags, priority))
    }

    pub fn color(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<u32> {
        Var::new(self.push(tag, VariableKind::Color, flags, priority))
    }

    pub fn string(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<String> {
        Var::new(self.push(tag, VariableKind::String, flags, priority))
    }

    pub fn user_id(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<WireId> {
        Var::new(self.push(tag, VariableKind::UserId, flags, priority))
    }

    pub fn entity_id(&mut self, tag: u16, flags: VariableFlags, priority: i32) -> Var<EntityId> {
        Var::new(self.push(tag, VariableKind::EntityId, flags, priority))
    }

    pub fn build(self) -> Result<Arc<VariableTable>, TableError> {
        if self.declarations.len() > MAX_VARIABLES {
            return Err(TableError::TooManyVariables);
        }
        for (i, decl) in self.declarations.iter().enumerate() {
            if self.declarations[..i].iter().any(|d| d.tag == decl.tag) {
                return Err(TableError::DuplicateTag(decl.tag));
            }
        }

        let mut order: Vec<usize> = (0..self.declarations.len()).collect();
        order.sort_by_key(|&i| (self.declarations[i].priority, i));

        let mut variables = Vec::with_capacity(order.len());
        let mut decl_to_ordinal = vec![0u8; order.len()];
        let mut predicted = Vec::new();
        let mut interpolated = Vec::new();
        let mut immediate = Vec::new();

        for (ordinal, &decl_index) in order.iter().enumerate() {
            let decl = &self.declarations[decl_index];
            decl_to_ordinal[decl_index] = ordinal as u8;
            if decl.flags.contains(VariableFlags::PREDICTED) {
                predicted.push(ordinal as u8);
            }
            if decl.flags.contains(VariableFlags::INTERPOLATED) {
                interpolated.push(ordinal as u8);
            }
            if !decl
                .flags
                .intersects(VariableFlags::PREDICTED | VariableFlags::INTERPOLATED)
            {
                immediate.push(ordinal as u8);
            }
            variables.push(Variable {
                tag: decl.tag,
                kind: decl.kind,
                flags: decl.flags,
                ordinal: ordinal as u8,
                default: Value::default_for(decl.kind),
            });
        }

        Ok(Arc::new(VariableTable {
            variables,
            decl_to_ordinal,
            predicted,
            interpolated,
            immediate,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_priority_then_declaration_order() {
        let mut builder = TableBuilder::new();
        let late = builder.float(1, VariableFlags::empty(), 10);
        let first = builder.float(2, VariableFlags::empty(), 0);
        let second = builder.float(3, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();

        assert_eq!(table.ordinal_of_index(first.index()), 0);
        assert_eq!(table.ordinal_of_index(second.index()), 1);
        assert_eq!(table.ordinal_of_index(late.index()), 2);
        assert_eq!(table.variable(2).tag, 1);
    }

    #[test]
    fn subset_lists_partition_by_flags() {
        let mut builder = TableBuilder::new();
        builder.float(1, VariableFlags::PREDICTED, 0);
        builder.float(2, VariableFlags::INTERPOLATED, 0);
        builder.float(3, VariableFlags::PREDICTED | VariableFlags::INTERPOLATED, 0);
        builder.float(4, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();

        assert_eq!(table.predicted_ordinals(), &[0, 2]);
        assert_eq!(table.interpolated_ordinals(), &[1, 2]);
        assert_eq!(table.immediate_ordinals(), &[3]);
    }

    #[test]
    fn duplicate_tags_rejected() {
        let mut builder = TableBuilder::new();
        builder.float(7, VariableFlags::empty(), 0);
        builder.int32(7, VariableFlags::empty(), 0);
        assert!(matches!(builder.build(), Err(TableError::DuplicateTag(7))));
    }

    #[test]
    fn too_many_variables_rejected() {
        let mut builder = TableBuilder::new();
        for tag in 0..=MAX_VARIABLES as u16 {
            builder.float(tag, VariableFlags::empty(), 0);
        }
        assert!(matches!(builder.build(), Err(TableError::TooManyVariables)));
    }
}
