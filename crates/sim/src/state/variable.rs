use std::marker::PhantomData;

use bitflags::bitflags;
use glam::{Quat, Vec3};

use crate::entity::EntityId;
use crate::session::WireId;
use crate::wire::{PacketReader, PacketWriter, WireError};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VariableFlags: u8 {
        /// The variable changes nearly every tick; sorted toward low
        /// ordinals so it lands in the first dirty-mask word.
        const UPDATED_FREQUENTLY = 1 << 0;
        /// Rolled forward on the client by unacknowledged commands.
        const PREDICTED = 1 << 1;
        /// Blended between server snapshots on the client.
        const INTERPOLATED = 1 << 2;
        /// Unit-length quaternion; w is dropped on the wire.
        const NORMALIZED = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Int32,
    VarInt,
    Uint,
    Float,
    Vec3,
    Quaternion,
    Color,
    String,
    UserId,
    EntityId,
}

/// Runtime value slot for one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    VarInt(i32),
    Uint(u32),
    Float(f32),
    Vec3(Vec3),
    Quaternion(Quat),
    Color(u32),
    String(String),
    UserId(WireId),
    EntityId(EntityId),
}

impl Value {
    pub fn default_for(kind: VariableKind) -> Value {
        match kind {
            VariableKind::Int32 => Value::Int32(0),
            VariableKind::VarInt => Value::VarInt(0),
            VariableKind::Uint => Value::Uint(0),
            VariableKind::Float => Value::Float(0.0),
            VariableKind::Vec3 => Value::Vec3(Vec3::ZERO),
            VariableKind::Quaternion => Value::Quaternion(Quat::IDENTITY),
            VariableKind::Color => Value::Color(0),
            VariableKind::String => Value::String(String::new()),
            VariableKind::UserId => Value::UserId(0),
            VariableKind::EntityId => Value::EntityId(0),
        }
    }
}

/// Typed handle to a declared variable. The index is the declaration
/// position; the table maps it to the wire ordinal.
pub struct Var<T> {
    index: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Var<T> {
    pub(crate) fn new(index: u8) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Var<T> {}

impl<T> std::fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Var({})", self.index)
    }
}

/// Conversion between Rust types and value slots. `store` reports whether
/// the slot actually changed so setters can skip dirtying.
pub trait VarValue: Clone {
    fn from_value(value: &Value) -> Self;
    fn store(self, slot: &mut Value) -> bool;
}

impl VarValue for i32 {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Int32(v) | Value::VarInt(v) => *v,
            _ => 0,
        }
    }

    fn store(self, slot: &mut Value) -> bool {
        match slot {
            Value::Int32(v) | Value::VarInt(v) => {
                let changed = *v != self;
                *v = self;
                changed
            }
            _ => false,
        }
    }
}

impl VarValue for u32 {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Uint(v) | Value::Color(v) | Value::UserId(v) | Value::EntityId(v) => *v,
            _ => 0,
        }
    }

    fn store(self, slot: &mut Value) -> bool {
        match slot {
            Value::Uint(v) | Value::Color(v) | Value::UserId(v) | Value::EntityId(v) => {
                let changed = *v != self;
                *v = self;
                changed
            }
            _ => false,
        }
    }
}

impl VarValue for f32 {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Float(v) => *v,
            _ => 0.0,
        }
    }

    fn store(self, slot: &mut Value) -> bool {
        match slot {
            Value::Float(v) => {
                let changed = *v != self;
                *v = self;
                changed
            }
            _ => false,
        }
    }
}

impl VarValue for Vec3 {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Vec3(v) => *v,
            _ => Vec3::ZERO,
        }
    }

    fn store(self, slot: &mut Value) -> bool {
        match slot {
            Value::Vec3(v) => {
                let changed = *v != self;
                *v = self;
                changed
            }
            _ => false,
        }
    }
}

impl VarValue for Quat {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Quaternion(v) => *v,
            _ => Quat::IDENTITY,
        }
    }

    fn store(self, slot: &mut Value) -> bool {
        match slot {
            Value::Quaternion(v) => {
                let changed = *v != self;
                *v = self;
                changed
            }
            _ => false,
        }
    }
}

impl VarValue for String {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(v) => v.clone(),
            _ => String::new(),
        }
    }

    fn store(self, slot: &mut Value) -> bool {
        match slot {
            Value::String(v) => {
                let changed = *v != self;
                *v = self;
                changed
            }
            _ => false,
        }
    }
}

pub(crate) fn write_value(value: &Value, flags: VariableFlags, writer: &mut PacketWriter) {
    match value {
        Value::Int32(v) => writer.write_i32(*v),
        Value::VarInt(v) => writer.write_svarint(*v as i64),
        Value::Uint(v) => writer.write_varint(*v as u64),
        Value::Float(v) => writer.write_f32(*v),
        Value::Vec3(v) => {
            writer.write_f32(v.x);
            writer.write_f32(v.y);
            writer.write_f32(v.z);
        }
        Value::Quaternion(q) => {
            writer.write_f32(q.x);
            writer.write_f32(q.y);
            writer.write_f32(q.z);
            if !flags.contains(VariableFlags::NORMALIZED) {
                writer.write_f32(q.w);
            }
        }
        Value::Color(v) => writer.write_u32(*v),
        Value::String(v) => writer.write_string(v),
        Value::UserId(v) => writer.write_varint(*v as u64),
        Value::EntityId(v) => writer.write_entity_id(*v),
    }
}

pub(crate) fn read_value(
    kind: VariableKind,
    flags: VariableFlags,
    reader: &mut PacketReader<'_>,
) -> Result<Value, WireError> {
    Ok(match kind {
        VariableKind::Int32 => Value::Int32(reader.read_i32()?),
        VariableKind::VarInt => Value::VarInt(reader.read_svarint()? as i32),
        VariableKind::Uint => Value::Uint(reader.read_varint()? as u32),
        VariableKind::Float => Value::Float(reader.read_f32()?),
        VariableKind::Vec3 => {
            let x = reader.read_f32()?;
            let y = reader.read_f32()?;
            let z = reader.read_f32()?;
            Value::Vec3(Vec3::new(x, y, z))
        }
        VariableKind::Quaternion => {
            let x = reader.read_f32()?;
            let y = reader.read_f32()?;
            let z = reader.read_f32()?;
            let w = if flags.contains(VariableFlags::NORMALIZED) {
                (1.0 - x * x - y * y - z * z).max(0.0).sqrt()
            } else {
                reader.read_f32()?
            };
            Value::Quaternion(Quat::from_xyzw(x, y, z, w))
        }
        VariableKind::Color => Value::Color(reader.read_u32()?),
        VariableKind::String => Value::String(reader.read_string()?),
        VariableKind::UserId => Value::UserId(reader.read_varint()? as WireId),
        VariableKind::EntityId => Value::EntityId(reader.read_entity_id()?),
    })
}

/// Blends `from` toward `to` per the kind's rule. Kinds without a blend rule
/// snap to the target once `t >= 1`.
pub(crate) fn interpolate_value(from: &Value, to: &Value, t: f32) -> Value {
    match (from, to) {
        (Value::Float(a), Value::Float(b)) => Value::Float(a + (b - a) * t),
        (Value::Vec3(a), Value::Vec3(b)) => Value::Vec3(a.lerp(*b, t)),
        (Value::Quaternion(a), Value::Quaternion(b)) => {
            Value::Quaternion(a.slerp(*b, t).normalize())
        }
        (Value::Color(a), Value::Color(b)) => Value::Color(lerp_color(*a, *b, t)),
        _ => {
            if t >= 1.0 {
                to.clone()
            } else {
                from.clone()
            }
        }
    }
}

fn lerp_color(from: u32, to: u32, t: f32) -> u32 {
    let mut out = 0u32;
    for shift in [0, 8, 16, 24] {
        let a = ((from >> shift) & 0xff) as f32;
        let b = ((to >> shift) & 0xff) as f32;
        let channel = (a + (b - a) * t).round().clamp(0.0, 255.0) as u32;
        out |= channel << shift;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_quaternion_drops_w() {
        let q = Quat::from_rotation_y(std::f32::consts::FRAC_PI_3);
        let mut writer = PacketWriter::new();
        write_value(
            &Value::Quaternion(q),
            VariableFlags::NORMALIZED,
            &mut writer,
        );
        assert_eq!(writer.len(), 12);

        let mut reader = PacketReader::new(writer.bytes());
        let value = read_value(
            VariableKind::Quaternion,
            VariableFlags::NORMALIZED,
            &mut reader,
        )
        .unwrap();
        match value {
            Value::Quaternion(restored) => {
                assert!((restored.w - q.w).abs() < 1e-4);
                assert!((restored.y - q.y).abs() < 1e-6);
            }
            _ => panic!("expected quaternion"),
        }
    }

    #[test]
    fn color_lerp_is_channelwise() {
        let black = 0xff00_0000u32;
        let white = 0xffff_ffffu32;
        let mid = lerp_color(black, white, 0.5);
        assert_eq!(mid & 0xff, 128);
        assert_eq!((mid >> 24) & 0xff, 255);
    }

    #[test]
    fn discrete_kinds_snap_at_end() {
        let a = Value::String("a".into());
        let b = Value::String("b".into());
        assert_eq!(interpolate_value(&a, &b, 0.9), a);
        assert_eq!(interpolate_value(&a, &b, 1.0), b);
    }
}
