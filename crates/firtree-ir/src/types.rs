use std::fmt;

/// Scalar, vector, matrix and sampler types of the kernel language.
///
/// The set is closed: there are no user-defined types. Matrices are square
/// and stored row-major.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
    Sampler,
}

impl Type {
    /// Number of f32 lanes a value of this type occupies when flattened.
    ///
    /// `Bool` and `Int` count as one lane; `Void` and `Sampler` have none.
    pub fn lanes(self) -> usize {
        match self {
            Type::Void | Type::Sampler => 0,
            Type::Bool | Type::Int | Type::Float => 1,
            Type::Vec2 => 2,
            Type::Vec3 => 3,
            Type::Vec4 => 4,
            Type::Mat2 => 4,
            Type::Mat3 => 9,
            Type::Mat4 => 16,
        }
    }

    pub fn is_scalar(self) -> bool {
        matches!(self, Type::Bool | Type::Int | Type::Float)
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Type::Vec2 | Type::Vec3 | Type::Vec4)
    }

    pub fn is_matrix(self) -> bool {
        matches!(self, Type::Mat2 | Type::Mat3 | Type::Mat4)
    }

    /// Vector type with the given number of lanes.
    pub fn vector(lanes: usize) -> Option<Type> {
        match lanes {
            1 => Some(Type::Float),
            2 => Some(Type::Vec2),
            3 => Some(Type::Vec3),
            4 => Some(Type::Vec4),
            _ => None,
        }
    }

    /// For matrices, the row/column dimension; for vectors, the lane count.
    pub fn dim(self) -> usize {
        match self {
            Type::Mat2 => 2,
            Type::Mat3 => 3,
            Type::Mat4 => 4,
            other => other.lanes(),
        }
    }

    /// The type of one row of a matrix, or of one lane of a vector.
    pub fn element(self) -> Option<Type> {
        match self {
            Type::Vec2 | Type::Vec3 | Type::Vec4 => Some(Type::Float),
            Type::Mat2 => Some(Type::Vec2),
            Type::Mat3 => Some(Type::Vec3),
            Type::Mat4 => Some(Type::Vec4),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Void => "void",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::Vec2 => "vec2",
            Type::Vec3 => "vec3",
            Type::Vec4 => "vec4",
            Type::Mat2 => "mat2",
            Type::Mat3 => "mat3",
            Type::Mat4 => "mat4",
            Type::Sampler => "sampler",
        };
        f.write_str(name)
    }
}

/// Parameter passing direction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ParamDirection {
    #[default]
    In,
    Out,
    InOut,
}

/// A declared function parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub direction: ParamDirection,
    /// Static parameters are link-time constants; the linker substitutes
    /// their bound value and they never reach the generated code.
    pub is_static: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type) -> Param {
        Param {
            name: name.into(),
            ty,
            direction: ParamDirection::In,
            is_static: false,
        }
    }

    /// Whether the parameter is passed by reference (`out`/`inout`).
    pub fn by_ref(&self) -> bool {
        self.direction != ParamDirection::In
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_counts() {
        assert_eq!(Type::Float.lanes(), 1);
        assert_eq!(Type::Vec3.lanes(), 3);
        assert_eq!(Type::Mat3.lanes(), 9);
        assert_eq!(Type::Sampler.lanes(), 0);
        assert_eq!(Type::vector(4), Some(Type::Vec4));
        assert_eq!(Type::vector(5), None);
    }
}
