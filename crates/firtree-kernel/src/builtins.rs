//! Builtin function table and overload resolution.
//!
//! The table is the closed catalogue of callable builtins; three of them
//! (plus the coordinate helpers derived from them) are sampler intrinsics
//! that the linker specialises instead of the backend lowering them.

use firtree_ir::{BuiltinFunc, Type};
use once_cell::sync::Lazy;

/// Sampler intrinsics and other calls with dedicated IR instructions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Intrinsic {
    DestCoord,
    Sample,
    SamplerCoord,
    SamplerTransform,
    SamplerOrigin,
    SamplerSize,
    SamplerExtent,
    Emit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuiltinKind {
    Func(BuiltinFunc),
    Intrinsic(Intrinsic),
}

/// One overload of a builtin.
#[derive(Clone, Debug)]
pub struct BuiltinSig {
    pub name: &'static str,
    pub params: Vec<Type>,
    pub ret: Type,
    pub kind: BuiltinKind,
}

const VECS: [Type; 4] = [Type::Float, Type::Vec2, Type::Vec3, Type::Vec4];

fn componentwise(table: &mut Vec<BuiltinSig>, name: &'static str, func: BuiltinFunc, arity: usize) {
    for ty in VECS {
        table.push(BuiltinSig {
            name,
            params: vec![ty; arity],
            ret: ty,
            kind: BuiltinKind::Func(func),
        });
    }
}

/// The builtin overload table, in declaration order.
pub static BUILTINS: Lazy<Vec<BuiltinSig>> = Lazy::new(|| {
    use BuiltinFunc::*;
    let mut t = Vec::new();

    // Angle and trigonometric functions.
    componentwise(&mut t, "radians", Radians, 1);
    componentwise(&mut t, "degrees", Degrees, 1);
    componentwise(&mut t, "sin", Sin, 1);
    componentwise(&mut t, "cos", Cos, 1);
    componentwise(&mut t, "tan", Tan, 1);
    componentwise(&mut t, "asin", Asin, 1);
    componentwise(&mut t, "acos", Acos, 1);
    componentwise(&mut t, "atan", Atan, 1);
    for ty in VECS {
        t.push(BuiltinSig { name: "atan", params: vec![ty, ty], ret: ty, kind: BuiltinKind::Func(Atan2) });
    }

    // Exponential functions.
    componentwise(&mut t, "pow", Pow, 2);
    componentwise(&mut t, "exp", Exp, 1);
    componentwise(&mut t, "log", Log, 1);
    componentwise(&mut t, "exp2", Exp2, 1);
    componentwise(&mut t, "log2", Log2, 1);
    componentwise(&mut t, "sqrt", Sqrt, 1);
    componentwise(&mut t, "inversesqrt", InverseSqrt, 1);

    // Common maths functions.
    componentwise(&mut t, "abs", Abs, 1);
    componentwise(&mut t, "sign", Sign, 1);
    componentwise(&mut t, "floor", Floor, 1);
    componentwise(&mut t, "ceil", Ceil, 1);
    componentwise(&mut t, "fract", Fract, 1);
    for (name, func) in [("mod", Mod), ("min", Min), ("max", Max)] {
        t.push(BuiltinSig { name, params: vec![Type::Float, Type::Float], ret: Type::Float, kind: BuiltinKind::Func(func) });
        for ty in [Type::Vec2, Type::Vec3, Type::Vec4] {
            t.push(BuiltinSig { name, params: vec![ty, Type::Float], ret: ty, kind: BuiltinKind::Func(func) });
            t.push(BuiltinSig { name, params: vec![ty, ty], ret: ty, kind: BuiltinKind::Func(func) });
        }
    }
    t.push(BuiltinSig {
        name: "clamp",
        params: vec![Type::Float, Type::Float, Type::Float],
        ret: Type::Float,
        kind: BuiltinKind::Func(Clamp),
    });
    for ty in [Type::Vec2, Type::Vec3, Type::Vec4] {
        t.push(BuiltinSig { name: "clamp", params: vec![ty, Type::Float, Type::Float], ret: ty, kind: BuiltinKind::Func(Clamp) });
        t.push(BuiltinSig { name: "clamp", params: vec![ty, ty, ty], ret: ty, kind: BuiltinKind::Func(Clamp) });
    }
    t.push(BuiltinSig {
        name: "mix",
        params: vec![Type::Float, Type::Float, Type::Float],
        ret: Type::Float,
        kind: BuiltinKind::Func(Mix),
    });
    for ty in [Type::Vec2, Type::Vec3, Type::Vec4] {
        t.push(BuiltinSig { name: "mix", params: vec![ty, ty, Type::Float], ret: ty, kind: BuiltinKind::Func(Mix) });
        t.push(BuiltinSig { name: "mix", params: vec![ty, ty, ty], ret: ty, kind: BuiltinKind::Func(Mix) });
    }
    t.push(BuiltinSig {
        name: "step",
        params: vec![Type::Float, Type::Float],
        ret: Type::Float,
        kind: BuiltinKind::Func(Step),
    });
    for ty in [Type::Vec2, Type::Vec3, Type::Vec4] {
        t.push(BuiltinSig { name: "step", params: vec![Type::Float, ty], ret: ty, kind: BuiltinKind::Func(Step) });
        t.push(BuiltinSig { name: "step", params: vec![ty, ty], ret: ty, kind: BuiltinKind::Func(Step) });
    }

    // Geometric functions.
    for ty in VECS {
        t.push(BuiltinSig { name: "length", params: vec![ty], ret: Type::Float, kind: BuiltinKind::Func(Length) });
    }
    for ty in [Type::Vec2, Type::Vec3, Type::Vec4] {
        t.push(BuiltinSig { name: "dot", params: vec![ty, ty], ret: Type::Float, kind: BuiltinKind::Func(Dot) });
    }
    t.push(BuiltinSig {
        name: "cross",
        params: vec![Type::Vec3, Type::Vec3],
        ret: Type::Vec3,
        kind: BuiltinKind::Func(Cross),
    });
    for ty in [Type::Vec2, Type::Vec3, Type::Vec4] {
        t.push(BuiltinSig { name: "normalize", params: vec![ty], ret: ty, kind: BuiltinKind::Func(Normalize) });
        t.push(BuiltinSig { name: "reflect", params: vec![ty, ty], ret: ty, kind: BuiltinKind::Func(Reflect) });
    }

    // Kernel helper functions.
    componentwise(&mut t, "compare", Compare, 3);
    t.push(BuiltinSig {
        name: "premultiply",
        params: vec![Type::Vec4],
        ret: Type::Vec4,
        kind: BuiltinKind::Func(Premultiply),
    });
    t.push(BuiltinSig {
        name: "unpremultiply",
        params: vec![Type::Vec4],
        ret: Type::Vec4,
        kind: BuiltinKind::Func(Unpremultiply),
    });

    // Sampler functions.
    t.push(BuiltinSig {
        name: "destCoord",
        params: vec![],
        ret: Type::Vec2,
        kind: BuiltinKind::Intrinsic(Intrinsic::DestCoord),
    });
    t.push(BuiltinSig {
        name: "samplerCoord",
        params: vec![Type::Sampler],
        ret: Type::Vec2,
        kind: BuiltinKind::Intrinsic(Intrinsic::SamplerCoord),
    });
    t.push(BuiltinSig {
        name: "samplerTransform",
        params: vec![Type::Sampler, Type::Vec2],
        ret: Type::Vec2,
        kind: BuiltinKind::Intrinsic(Intrinsic::SamplerTransform),
    });
    t.push(BuiltinSig {
        name: "samplerOrigin",
        params: vec![Type::Sampler],
        ret: Type::Vec2,
        kind: BuiltinKind::Intrinsic(Intrinsic::SamplerOrigin),
    });
    t.push(BuiltinSig {
        name: "samplerSize",
        params: vec![Type::Sampler],
        ret: Type::Vec2,
        kind: BuiltinKind::Intrinsic(Intrinsic::SamplerSize),
    });
    t.push(BuiltinSig {
        name: "samplerExtent",
        params: vec![Type::Sampler],
        ret: Type::Vec4,
        kind: BuiltinKind::Intrinsic(Intrinsic::SamplerExtent),
    });
    t.push(BuiltinSig {
        name: "sample",
        params: vec![Type::Sampler, Type::Vec2],
        ret: Type::Vec4,
        kind: BuiltinKind::Intrinsic(Intrinsic::Sample),
    });

    // Reduce output.
    for ty in VECS {
        t.push(BuiltinSig {
            name: "emit",
            params: vec![ty],
            ret: Type::Void,
            kind: BuiltinKind::Intrinsic(Intrinsic::Emit),
        });
    }

    t
});

/// How an argument fits a parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Coercion {
    Exact,
    /// `int` promoted to `float`.
    IntToFloat,
    /// Scalar broadcast to a vector (after `int`→`float` if needed).
    Broadcast,
}

/// Whether `arg` can be passed where `param` is expected, and at what cost.
pub fn coerce(arg: Type, param: Type) -> Option<Coercion> {
    if arg == param {
        return Some(Coercion::Exact);
    }
    if arg == Type::Int && param == Type::Float {
        return Some(Coercion::IntToFloat);
    }
    if (arg == Type::Float || arg == Type::Int) && param.is_vector() {
        return Some(Coercion::Broadcast);
    }
    None
}

pub enum Resolution<'a> {
    Match {
        sig: &'a BuiltinSig,
        coercions: Vec<Coercion>,
    },
    /// The name exists but no overload (or more than one, ambiguously)
    /// accepts the argument types.
    NoMatch,
    /// No builtin of this name exists at all.
    UnknownName,
}

fn coercion_cost(c: Coercion) -> u32 {
    match c {
        Coercion::Exact => 0,
        Coercion::IntToFloat => 1,
        Coercion::Broadcast => 2,
    }
}

/// Resolve a builtin call. Exact matches win; otherwise the candidate with
/// the cheapest promotions is chosen, and cost ties are rejected as
/// ambiguous ("no matching overload").
pub fn resolve(name: &str, args: &[Type]) -> Resolution<'static> {
    let mut known_name = false;
    let mut best: Option<(&'static BuiltinSig, Vec<Coercion>, u32)> = None;
    let mut tied = false;
    for sig in BUILTINS.iter() {
        if sig.name != name {
            continue;
        }
        known_name = true;
        if sig.params.len() != args.len() {
            continue;
        }
        let mut coercions = Vec::with_capacity(args.len());
        let mut ok = true;
        for (arg, param) in args.iter().zip(&sig.params) {
            match coerce(*arg, *param) {
                Some(c) => coercions.push(c),
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let cost: u32 = coercions.iter().map(|c| coercion_cost(*c)).sum();
        if cost == 0 {
            return Resolution::Match { sig, coercions };
        }
        match &best {
            Some((_, _, best_cost)) if *best_cost < cost => {}
            Some((_, _, best_cost)) if *best_cost == cost => tied = true,
            _ => {
                best = Some((sig, coercions, cost));
                tied = false;
            }
        }
    }
    if !known_name {
        return Resolution::UnknownName;
    }
    match best {
        Some((sig, coercions, _)) if !tied => Resolution::Match { sig, coercions },
        _ => Resolution::NoMatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_overloads_resolve() {
        // Every table entry with value-typed parameters resolves to itself.
        for sig in BUILTINS.iter() {
            match resolve(sig.name, &sig.params) {
                Resolution::Match { sig: found, coercions } => {
                    assert_eq!(found.ret, sig.ret, "{}", sig.name);
                    assert!(coercions.iter().all(|c| *c == Coercion::Exact));
                }
                _ => panic!("exact overload of {} did not resolve", sig.name),
            }
        }
    }

    #[test]
    fn scalar_broadcast_promotion() {
        match resolve("mod", &[Type::Vec2, Type::Int]) {
            Resolution::Match { sig, coercions } => {
                assert_eq!(sig.params, vec![Type::Vec2, Type::Float]);
                assert_eq!(coercions[1], Coercion::IntToFloat);
            }
            _ => panic!("mod(vec2, int) should resolve via promotion"),
        }
    }

    #[test]
    fn missing_overload_is_rejected() {
        // There is no matrix sine.
        assert!(matches!(resolve("sin", &[Type::Mat2]), Resolution::NoMatch));
        assert!(matches!(resolve("frobnicate", &[Type::Float]), Resolution::UnknownName));
    }

    #[test]
    fn sampler_intrinsics_are_flagged() {
        match resolve("sample", &[Type::Sampler, Type::Vec2]) {
            Resolution::Match { sig, .. } => {
                assert_eq!(sig.kind, BuiltinKind::Intrinsic(Intrinsic::Sample));
            }
            _ => panic!(),
        }
    }
}
