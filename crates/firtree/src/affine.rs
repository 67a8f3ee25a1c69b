//! 2D affine transforms attached to samplers.

use glam::Vec2;

/// A 2×3 affine transform. Serialises as `[m11, m12, m21, m22, tx, ty]`,
/// row-major: `x' = m11·x + m12·y + tx`, `y' = m21·x + m22·y + ty`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AffineTransform {
    pub m11: f32,
    pub m12: f32,
    pub m21: f32,
    pub m22: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Default for AffineTransform {
    fn default() -> AffineTransform {
        AffineTransform::IDENTITY
    }
}

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        m11: 1.0,
        m12: 0.0,
        m21: 0.0,
        m22: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn from_elements(elements: [f32; 6]) -> AffineTransform {
        let [m11, m12, m21, m22, tx, ty] = elements;
        AffineTransform { m11, m12, m21, m22, tx, ty }
    }

    pub fn to_elements(self) -> [f32; 6] {
        [self.m11, self.m12, self.m21, self.m22, self.tx, self.ty]
    }

    pub fn scale(sx: f32, sy: f32) -> AffineTransform {
        AffineTransform { m11: sx, m22: sy, ..AffineTransform::IDENTITY }
    }

    pub fn translate(tx: f32, ty: f32) -> AffineTransform {
        AffineTransform { tx, ty, ..AffineTransform::IDENTITY }
    }

    pub fn is_identity(self) -> bool {
        self == AffineTransform::IDENTITY
    }

    pub fn apply(self, p: Vec2) -> Vec2 {
        Vec2::new(
            self.m11 * p.x + self.m12 * p.y + self.tx,
            self.m21 * p.x + self.m22 * p.y + self.ty,
        )
    }

    /// `self ∘ other`: applies `other` first.
    pub fn compose(self, other: AffineTransform) -> AffineTransform {
        AffineTransform {
            m11: self.m11 * other.m11 + self.m12 * other.m21,
            m12: self.m11 * other.m12 + self.m12 * other.m22,
            m21: self.m21 * other.m11 + self.m22 * other.m21,
            m22: self.m21 * other.m12 + self.m22 * other.m22,
            tx: self.m11 * other.tx + self.m12 * other.ty + self.tx,
            ty: self.m21 * other.tx + self.m22 * other.ty + self.ty,
        }
    }

    pub fn invert(self) -> Option<AffineTransform> {
        let det = self.m11 * self.m22 - self.m12 * self.m21;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        let m11 = self.m22 * inv;
        let m12 = -self.m12 * inv;
        let m21 = -self.m21 * inv;
        let m22 = self.m11 * inv;
        Some(AffineTransform {
            m11,
            m12,
            m21,
            m22,
            tx: -(m11 * self.tx + m12 * self.ty),
            ty: -(m21 * self.tx + m22 * self.ty),
        })
    }

    /// Axis-aligned bounding box of an `(x, y, w, h)` rectangle mapped
    /// through this transform.
    pub fn apply_extent(self, extent: [f32; 4]) -> [f32; 4] {
        let [x, y, w, h] = extent;
        let corners = [
            self.apply(Vec2::new(x, y)),
            self.apply(Vec2::new(x + w, y)),
            self.apply(Vec2::new(x, y + h)),
            self.apply(Vec2::new(x + w, y + h)),
        ];
        let mut min = corners[0];
        let mut max = corners[0];
        for c in &corners[1..] {
            min = min.min(*c);
            max = max.max(*c);
        }
        [min.x, min.y, max.x - min.x, max.y - min.y]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_applies() {
        let t = AffineTransform::from_elements([2.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        assert_eq!(t.apply(Vec2::new(3.0, 5.0)), Vec2::new(6.0, 10.0));
    }

    #[test]
    fn compose_matches_sequential_application() {
        let a = AffineTransform::scale(2.0, 3.0);
        let b = AffineTransform::translate(1.0, -1.0);
        let p = Vec2::new(0.5, 4.0);
        assert_eq!(a.compose(b).apply(p), a.apply(b.apply(p)));
    }

    #[test]
    fn inverse_round_trips() {
        let t = AffineTransform::from_elements([2.0, 1.0, 0.5, 3.0, 4.0, -2.0]);
        let inv = t.invert().unwrap();
        let p = Vec2::new(7.0, -3.0);
        let q = inv.apply(t.apply(p));
        assert!((q - p).length() < 1e-4);
    }

    #[test]
    fn extent_mapping_is_a_bounding_box() {
        let t = AffineTransform::scale(2.0, 2.0);
        assert_eq!(t.apply_extent([0.0, 0.0, 4.0, 4.0]), [0.0, 0.0, 8.0, 8.0]);
    }
}
