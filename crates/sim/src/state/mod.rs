mod table;
mod variable;

use std::sync::Arc;

use crate::wire::{PacketReader, PacketWriter, WireError};

pub use table::{MAX_VARIABLES, TableBuilder, TableError, Variable, VariableTable};
pub use variable::{Value, Var, VarValue, VariableFlags, VariableKind};

use variable::{interpolate_value, read_value, write_value};

/// All replicable data for one entity: value slots in ordinal order, a
/// 64-bit dirty mask, and a timestamp used when the state is held as a
/// history snapshot.
#[derive(Debug, Clone)]
pub struct EntityState {
    table: Arc<VariableTable>,
    values: Vec<Value>,
    dirty: u64,
    time: f64,
}

impl EntityState {
    pub fn new(table: Arc<VariableTable>) -> Self {
        let values = table.default_values();
        Self {
            table,
            values,
            dirty: 0,
            time: 0.0,
        }
    }

    pub fn table(&self) -> &Arc<VariableTable> {
        &self.table
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn get<T: VarValue>(&self, var: Var<T>) -> T {
        let ordinal = self.table.ordinal_of_index(var.index());
        T::from_value(&self.values[ordinal])
    }

    pub fn set<T: VarValue>(&mut self, var: Var<T>, value: T) {
        let ordinal = self.table.ordinal_of_index(var.index());
        if value.store(&mut self.values[ordinal]) {
            self.dirty |= 1 << ordinal;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    pub fn dirty_mask(&self) -> u64 {
        self.dirty
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = 0;
    }

    /// Serializes every variable in ordinal order. Used by create records,
    /// where the receiver has no prior state.
    pub fn write_all(&self, writer: &mut PacketWriter) {
        for variable in self.table.variables() {
            write_value(&self.values[variable.ordinal as usize], variable.flags, writer);
        }
    }

    pub fn read_all(&mut self, reader: &mut PacketReader<'_>) -> Result<(), WireError> {
        for i in 0..self.table.len() {
            let variable = self.table.variable(i);
            self.values[i] = read_value(variable.kind, variable.flags, reader)?;
        }
        self.dirty = if self.table.len() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.table.len()) - 1
        };
        Ok(())
    }

    /// Serializes only dirty variables, keyed by the mask split into two
    /// 32-bit words. The high word is present only for wide tables.
    pub fn write_delta(&self, writer: &mut PacketWriter) {
        let lo = (self.dirty & 0xffff_ffff) as u32;
        writer.write_varint(lo as u64);
        self.write_masked(writer, lo, 0);

        if self.table.len() > 31 {
            let hi = (self.dirty >> 32) as u32;
            writer.write_varint(hi as u64);
            self.write_masked(writer, hi, 32);
        }
    }

    fn write_masked(&self, writer: &mut PacketWriter, mask: u32, base: usize) {
        for bit in 0..32 {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let ordinal = base + bit;
            let variable = self.table.variable(ordinal);
            write_value(&self.values[ordinal], variable.flags, writer);
        }
    }

    pub fn read_delta(&mut self, reader: &mut PacketReader<'_>) -> Result<(), WireError> {
        let lo = reader.read_varint()? as u32;
        self.read_masked(reader, lo, 0)?;

        if self.table.len() > 31 {
            let hi = reader.read_varint()? as u32;
            self.read_masked(reader, hi, 32)?;
        }
        Ok(())
    }

    fn read_masked(
        &mut self,
        reader: &mut PacketReader<'_>,
        mask: u32,
        base: usize,
    ) -> Result<(), WireError> {
        for bit in 0..32 {
            if mask & (1 << bit) == 0 {
                continue;
            }
            let ordinal = base + bit;
            if ordinal >= self.table.len() {
                // Ordinals this peer does not know about; a newer (or
                // hostile) sender. Ignore the remaining bits.
                log::debug!("skipping unknown variable ordinal {ordinal}");
                break;
            }
            let variable = self.table.variable(ordinal);
            self.values[ordinal] = read_value(variable.kind, variable.flags, reader)?;
            self.dirty |= 1 << ordinal;
        }
        Ok(())
    }

    pub fn copy_all(&mut self, source: &EntityState) {
        self.values.clone_from_slice(&source.values);
    }

    fn copy_ordinals(&mut self, source: &EntityState, ordinals: &[u8]) {
        for &ordinal in ordinals {
            self.values[ordinal as usize] = source.values[ordinal as usize].clone();
        }
    }

    /// Copies variables that are neither predicted nor interpolated.
    pub fn copy_immediate(&mut self, source: &EntityState) {
        let table = self.table.clone();
        self.copy_ordinals(source, table.immediate_ordinals());
    }

    pub fn copy_predicted(&mut self, source: &EntityState) {
        let table = self.table.clone();
        self.copy_ordinals(source, table.predicted_ordinals());
    }

    pub fn copy_interpolated(&mut self, source: &EntityState) {
        let table = self.table.clone();
        self.copy_ordinals(source, table.interpolated_ordinals());
    }

    /// Blends interpolated variables between two snapshots into this state.
    /// When `skip_predicted` is set (the owning entity is predicted),
    /// variables that are also predicted are left alone so interpolation
    /// does not trample prediction output.
    pub fn interpolate(
        &mut self,
        from: &EntityState,
        to: &EntityState,
        t: f32,
        skip_predicted: bool,
    ) {
        let table = self.table.clone();
        for &ordinal in table.interpolated_ordinals() {
            let variable = table.variable(ordinal as usize);
            if skip_predicted && variable.flags.contains(VariableFlags::PREDICTED) {
                continue;
            }
            let ordinal = ordinal as usize;
            self.values[ordinal] =
                interpolate_value(&from.values[ordinal], &to.values[ordinal], t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_float_table() -> (Arc<VariableTable>, Var<f32>) {
        let mut builder = TableBuilder::new();
        let value = builder.float(1, VariableFlags::empty(), 0);
        (builder.build().unwrap(), value)
    }

    #[test]
    fn delta_roundtrip_single_variable() {
        let (table, value) = single_float_table();
        let mut state = EntityState::new(table.clone());
        state.set(value, 3.5);

        let mut writer = PacketWriter::new();
        state.write_delta(&mut writer);

        let mut incoming = EntityState::new(table);
        let mut reader = PacketReader::new(writer.bytes());
        incoming.read_delta(&mut reader).unwrap();

        assert_eq!(incoming.get(value), 3.5);
        incoming.reset_dirty();
        assert_eq!(incoming.dirty_mask(), 0);
    }

    #[test]
    fn delta_skips_clean_variables() {
        let mut builder = TableBuilder::new();
        let a = builder.float(1, VariableFlags::empty(), 0);
        let b = builder.float(2, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();

        let mut sender = EntityState::new(table.clone());
        sender.set(a, 1.0);
        sender.set(b, 2.0);
        sender.reset_dirty();
        sender.set(b, 5.0);

        let mut writer = PacketWriter::new();
        sender.write_delta(&mut writer);

        let mut receiver = EntityState::new(table);
        receiver.set(a, 9.0);
        receiver.reset_dirty();

        let mut reader = PacketReader::new(writer.bytes());
        receiver.read_delta(&mut reader).unwrap();

        // Only `b` travelled; `a` keeps the receiver's value.
        assert_eq!(receiver.get(a), 9.0);
        assert_eq!(receiver.get(b), 5.0);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn set_to_same_value_stays_clean() {
        let (table, value) = single_float_table();
        let mut state = EntityState::new(table);
        state.set(value, 0.0);
        assert!(!state.is_dirty());
        state.set(value, 1.0);
        assert!(state.is_dirty());
    }

    #[test]
    fn copy_subsets_respect_flags() {
        let mut builder = TableBuilder::new();
        let predicted = builder.float(1, VariableFlags::PREDICTED, 0);
        let interpolated = builder.float(2, VariableFlags::INTERPOLATED, 0);
        let immediate = builder.float(3, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();

        let mut source = EntityState::new(table.clone());
        source.set(predicted, 1.0);
        source.set(interpolated, 2.0);
        source.set(immediate, 3.0);

        let mut target = EntityState::new(table.clone());
        target.copy_predicted(&source);
        assert_eq!(target.get(predicted), 1.0);
        assert_eq!(target.get(interpolated), 0.0);
        assert_eq!(target.get(immediate), 0.0);

        let mut target = EntityState::new(table.clone());
        target.copy_immediate(&source);
        assert_eq!(target.get(immediate), 3.0);
        assert_eq!(target.get(predicted), 0.0);

        let mut target = EntityState::new(table);
        target.copy_interpolated(&source);
        assert_eq!(target.get(interpolated), 2.0);
    }

    #[test]
    fn interpolate_skips_predicted_when_asked() {
        let mut builder = TableBuilder::new();
        let blended = builder.float(1, VariableFlags::INTERPOLATED, 0);
        let owned = builder.float(
            2,
            VariableFlags::INTERPOLATED | VariableFlags::PREDICTED,
            0,
        );
        let table = builder.build().unwrap();

        let mut from = EntityState::new(table.clone());
        from.set(blended, 0.0);
        from.set(owned, 0.0);
        let mut to = EntityState::new(table.clone());
        to.set(blended, 10.0);
        to.set(owned, 10.0);

        let mut out = EntityState::new(table.clone());
        out.set(owned, 42.0);
        out.interpolate(&from, &to, 0.5, true);
        assert_eq!(out.get(blended), 5.0);
        assert_eq!(out.get(owned), 42.0);

        let mut out = EntityState::new(table);
        out.interpolate(&from, &to, 0.5, false);
        assert_eq!(out.get(owned), 5.0);
    }

    #[test]
    fn full_write_roundtrip() {
        let mut builder = TableBuilder::new();
        let health = builder.varint(1, VariableFlags::empty(), 0);
        let name = builder.string(2, VariableFlags::empty(), 0);
        let tint = builder.color(3, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();

        let mut state = EntityState::new(table.clone());
        state.set(health, -125);
        state.set(name, "drone".to_string());
        state.set(tint, 0xff33_2211);

        let mut writer = PacketWriter::new();
        state.write_all(&mut writer);

        let mut incoming = EntityState::new(table);
        let mut reader = PacketReader::new(writer.bytes());
        incoming.read_all(&mut reader).unwrap();

        assert_eq!(incoming.get(health), -125);
        assert_eq!(incoming.get(name), "drone");
        assert_eq!(incoming.get(tint), 0xff33_2211);
    }
}
