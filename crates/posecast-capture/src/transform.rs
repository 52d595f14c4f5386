//! Minimal rigid-transform math for tracker output.

/// A 3-component vector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const ONE: Self = Self::new(1.0, 1.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl From<[f32; 3]> for Vec3 {
    fn from(v: [f32; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// A rotation quaternion: one real and three imaginary components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat {
    pub real: f32,
    pub imag: Vec3,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        real: 1.0,
        imag: Vec3::ZERO,
    };

    pub const fn new(real: f32, ix: f32, iy: f32, iz: f32) -> Self {
        Self {
            real,
            imag: Vec3::new(ix, iy, iz),
        }
    }

    /// Rotation of `angle` radians about a unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let (sin, cos) = (angle * 0.5).sin_cos();
        Self::new(cos, axis.x * sin, axis.y * sin, axis.z * sin)
    }

    pub fn norm(self) -> f32 {
        (self.real * self.real + self.imag.x * self.imag.x + self.imag.y * self.imag.y
            + self.imag.z * self.imag.z)
            .sqrt()
    }

    /// Unit-length copy; identity for a degenerate quaternion.
    pub fn normalized(self) -> Self {
        let norm = self.norm();
        if norm <= f32::EPSILON || !norm.is_finite() {
            return Self::IDENTITY;
        }
        Self::new(
            self.real / norm,
            self.imag.x / norm,
            self.imag.y / norm,
            self.imag.z / norm,
        )
    }

    pub fn is_finite(self) -> bool {
        self.real.is_finite() && self.imag.is_finite()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Translation, rotation and scale of one joint or anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    /// Translation-only transform.
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    /// Decompose a column-major 4x4 affine matrix (`m[column][row]`).
    ///
    /// Scale is the length of each basis column; the rotation is taken from
    /// the normalized basis. Shear is not representable and is discarded.
    pub fn from_matrix(m: &[[f32; 4]; 4]) -> Self {
        let translation = Vec3::new(m[3][0], m[3][1], m[3][2]);
        let scale = Vec3::new(
            Vec3::new(m[0][0], m[0][1], m[0][2]).length(),
            Vec3::new(m[1][0], m[1][1], m[1][2]).length(),
            Vec3::new(m[2][0], m[2][1], m[2][2]).length(),
        );

        let sx = if scale.x > f32::EPSILON { scale.x } else { 1.0 };
        let sy = if scale.y > f32::EPSILON { scale.y } else { 1.0 };
        let sz = if scale.z > f32::EPSILON { scale.z } else { 1.0 };

        // r(row, col)
        let r = |row: usize, col: usize| {
            let s = [sx, sy, sz][col];
            m[col][row] / s
        };

        let trace = r(0, 0) + r(1, 1) + r(2, 2);
        let rotation = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Quat::new(
                0.25 * s,
                (r(2, 1) - r(1, 2)) / s,
                (r(0, 2) - r(2, 0)) / s,
                (r(1, 0) - r(0, 1)) / s,
            )
        } else if r(0, 0) > r(1, 1) && r(0, 0) > r(2, 2) {
            let s = (1.0 + r(0, 0) - r(1, 1) - r(2, 2)).sqrt() * 2.0;
            Quat::new(
                (r(2, 1) - r(1, 2)) / s,
                0.25 * s,
                (r(0, 1) + r(1, 0)) / s,
                (r(0, 2) + r(2, 0)) / s,
            )
        } else if r(1, 1) > r(2, 2) {
            let s = (1.0 + r(1, 1) - r(0, 0) - r(2, 2)).sqrt() * 2.0;
            Quat::new(
                (r(0, 2) - r(2, 0)) / s,
                (r(0, 1) + r(1, 0)) / s,
                0.25 * s,
                (r(1, 2) + r(2, 1)) / s,
            )
        } else {
            let s = (1.0 + r(2, 2) - r(0, 0) - r(1, 1)).sqrt() * 2.0;
            Quat::new(
                (r(1, 0) - r(0, 1)) / s,
                (r(0, 2) + r(2, 0)) / s,
                (r(1, 2) + r(2, 1)) / s,
                0.25 * s,
            )
        };

        Self {
            translation,
            rotation: rotation.normalized(),
            scale,
        }
    }

    /// Compose back into a column-major 4x4 matrix.
    pub fn to_matrix(&self) -> [[f32; 4]; 4] {
        let q = self.rotation.normalized();
        let (w, x, y, z) = (q.real, q.imag.x, q.imag.y, q.imag.z);

        let rot = [
            [1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y - z * w), 2.0 * (x * z + y * w)],
            [2.0 * (x * y + z * w), 1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z - x * w)],
            [2.0 * (x * z - y * w), 2.0 * (y * z + x * w), 1.0 - 2.0 * (x * x + y * y)],
        ];
        let scale = [self.scale.x, self.scale.y, self.scale.z];

        let mut m = [[0.0f32; 4]; 4];
        for (col, column) in m.iter_mut().take(3).enumerate() {
            for row in 0..3 {
                column[row] = rot[row][col] * scale[col];
            }
        }
        m[3] = [self.translation.x, self.translation.y, self.translation.z, 1.0];
        m
    }

    /// Whether every component is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.rotation.is_finite() && self.scale.is_finite()
    }
}
