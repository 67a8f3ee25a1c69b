//! Argument values bound to kernel parameters.

use crate::sampler::Sampler;
use firtree_ir::{ConstValue, Type};
use glam::{Mat2, Mat3, Mat4, Vec2, Vec3, Vec4};
use std::hash::Hasher;

/// An immutable tagged value: scalar, vector, matrix, sampler handle or a
/// typed null. Matrices serialise row-major.
#[derive(Clone, Debug)]
pub enum Value {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat2(Mat2),
    Mat3(Mat3),
    Mat4(Mat4),
    Sampler(Sampler),
    /// Placeholder for an unset ("image default") parameter. A provider
    /// with a null binding is invalid until the parameter is set.
    Null(Type),
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Float(_) => Type::Float,
            Value::Int(_) => Type::Int,
            Value::Bool(_) => Type::Bool,
            Value::Vec2(_) => Type::Vec2,
            Value::Vec3(_) => Type::Vec3,
            Value::Vec4(_) => Type::Vec4,
            Value::Mat2(_) => Type::Mat2,
            Value::Mat3(_) => Type::Mat3,
            Value::Mat4(_) => Type::Mat4,
            Value::Sampler(_) => Type::Sampler,
            Value::Null(ty) => *ty,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    pub fn as_sampler(&self) -> Option<&Sampler> {
        match self {
            Value::Sampler(s) => Some(s),
            _ => None,
        }
    }

    /// Flattened f32 lanes, row-major for matrices. `None` for samplers and
    /// nulls.
    pub fn to_lanes(&self) -> Option<Vec<f32>> {
        Some(match self {
            Value::Float(v) => vec![*v],
            Value::Int(v) => vec![*v as f32],
            Value::Bool(v) => vec![if *v { 1.0 } else { 0.0 }],
            Value::Vec2(v) => v.to_array().to_vec(),
            Value::Vec3(v) => v.to_array().to_vec(),
            Value::Vec4(v) => v.to_array().to_vec(),
            // glam stores column-major; transpose to serialise row-major.
            Value::Mat2(m) => m.transpose().to_cols_array().to_vec(),
            Value::Mat3(m) => m.transpose().to_cols_array().to_vec(),
            Value::Mat4(m) => m.transpose().to_cols_array().to_vec(),
            Value::Sampler(_) | Value::Null(_) => return None,
        })
    }

    /// Convert to an IR constant for link-time substitution of static
    /// parameters. `None` for samplers and nulls.
    pub fn to_const(&self) -> Option<ConstValue> {
        match self {
            Value::Int(v) => Some(ConstValue::Int(*v)),
            Value::Bool(v) => Some(ConstValue::Bool(*v)),
            other => {
                let lanes = other.to_lanes()?;
                ConstValue::from_lanes(other.ty(), &lanes)
            }
        }
    }

    /// Feed the value's tag and component bytes into a hasher; used for the
    /// static-parameter part of the JIT cache key.
    pub fn hash_into(&self, h: &mut impl Hasher) {
        h.write_u8(match self {
            Value::Float(_) => 0,
            Value::Int(_) => 1,
            Value::Bool(_) => 2,
            Value::Vec2(_) => 3,
            Value::Vec3(_) => 4,
            Value::Vec4(_) => 5,
            Value::Mat2(_) => 6,
            Value::Mat3(_) => 7,
            Value::Mat4(_) => 8,
            Value::Sampler(_) => 9,
            Value::Null(_) => 10,
        });
        match self {
            Value::Int(v) => h.write_i32(*v),
            Value::Bool(v) => h.write_u8(*v as u8),
            Value::Sampler(s) => h.write_usize(s.id()),
            Value::Null(ty) => h.write_u8(ty.lanes() as u8),
            other => {
                for lane in other.to_lanes().unwrap() {
                    h.write_u32(lane.to_bits());
                }
            }
        }
    }
}

impl PartialEq for Value {
    /// Two values are equal iff tag, shape and component bytes match.
    /// Samplers compare by identity.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Sampler(a), Value::Sampler(b)) => a.id() == b.id(),
            (Value::Null(a), Value::Null(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (a, b) => {
                a.ty() == b.ty()
                    && match (a.to_lanes(), b.to_lanes()) {
                        (Some(a), Some(b)) => {
                            a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits())
                        }
                        _ => false,
                    }
            }
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Value {
        Value::Float(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<Vec2> for Value {
    fn from(v: Vec2) -> Value {
        Value::Vec2(v)
    }
}

impl From<Vec3> for Value {
    fn from(v: Vec3) -> Value {
        Value::Vec3(v)
    }
}

impl From<Vec4> for Value {
    fn from(v: Vec4) -> Value {
        Value::Vec4(v)
    }
}

impl From<Sampler> for Value {
    fn from(s: Sampler) -> Value {
        Value::Sampler(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_componentwise() {
        assert_eq!(Value::Vec2(Vec2::new(1.0, 2.0)), Value::Vec2(Vec2::new(1.0, 2.0)));
        assert_ne!(Value::Vec2(Vec2::new(1.0, 2.0)), Value::Vec2(Vec2::new(1.0, 2.5)));
        assert_ne!(Value::Float(1.0), Value::Int(1));
    }

    #[test]
    fn matrices_serialise_row_major() {
        // Row-major [[1, 2], [3, 4]].
        let m = Mat2::from_cols(Vec2::new(1.0, 3.0), Vec2::new(2.0, 4.0));
        assert_eq!(Value::Mat2(m).to_lanes().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn null_is_typed() {
        let v = Value::Null(Type::Vec4);
        assert!(v.is_null());
        assert_eq!(v.ty(), Type::Vec4);
        assert_eq!(v.to_const(), None);
    }
}
