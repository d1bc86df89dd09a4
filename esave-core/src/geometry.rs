/*!
Conversions between small geometric aggregates and flat float arrays.

Vectors, rotations and colors are never stored through their own serde
representation. They go into a save file as `Vec<f32>` (via the
`set_vector*`/`set_quaternion`/`set_color` accessors on
[`SaveFile`](crate::SaveFile)) or as a [`SavableVector`], and come back out
through the explicit constructors in this module.

Array arity rules when reading back:

* vectors accept 2, 3 or 4 elements; missing components are zero and extra
  components are ignored
* quaternions need exactly 4 elements
* colors accept 3 (alpha defaults to 1.0) or 4 elements

Anything else logs a warning and yields the zero value.
*/

use glam::{Quat, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// An RGBA color with float channels
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Color = Color::rgba(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: Color = Color::rgba(0.0, 0.0, 0.0, 1.0);

    /// Opaque color
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Color from a 3 (RGB) or 4 (RGBA) element array
    pub fn from_floats(values: &[f32]) -> Self {
        match values {
            [r, g, b] => Self::rgb(*r, *g, *b),
            [r, g, b, a] => Self::rgba(*r, *g, *b, *a),
            _ => {
                warn!(len = values.len(), "Float array is not a valid color");
                Self::default()
            }
        }
    }
}

/// Position, rotation and scale of an object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub local_position: Vec3,
    pub rotation: Quat,
    pub local_rotation: Quat,
    pub local_scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            local_position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            local_rotation: Quat::IDENTITY,
            local_scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Copy position, rotation and scale from a saved transform
    pub fn copy_from(&mut self, saved: &SavableTransform) {
        *self = saved.to_transform();
    }
}

/// Flattening into float arrays
///
/// `to_float2`/`to_float3`/`to_float4` take the leading components and pad
/// with zeros, so a `Vec2` flattens to `[x, y, 0, 0]` with `to_float4`.
pub trait ToFloats {
    /// All four components, zero padded
    fn components(&self) -> [f32; 4];

    fn to_float2(&self) -> Vec<f32> {
        self.components()[..2].to_vec()
    }

    fn to_float3(&self) -> Vec<f32> {
        self.components()[..3].to_vec()
    }

    fn to_float4(&self) -> Vec<f32> {
        self.components().to_vec()
    }
}

impl ToFloats for Vec2 {
    fn components(&self) -> [f32; 4] {
        [self.x, self.y, 0.0, 0.0]
    }
}

impl ToFloats for Vec3 {
    fn components(&self) -> [f32; 4] {
        [self.x, self.y, self.z, 0.0]
    }
}

impl ToFloats for Vec4 {
    fn components(&self) -> [f32; 4] {
        self.to_array()
    }
}

impl ToFloats for Quat {
    fn components(&self) -> [f32; 4] {
        self.to_array()
    }
}

impl ToFloats for Color {
    fn components(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn vector_components(values: &[f32], kind: &str) -> [f32; 4] {
    match values.len() {
        2..=4 => {
            let mut out = [0.0; 4];
            out[..values.len()].copy_from_slice(values);
            out
        }
        len => {
            warn!(len, kind, "Float array has no recognized vector arity");
            [0.0; 4]
        }
    }
}

/// `Vec2` from the first two elements of a 2/3/4 element array
pub fn vector2_from_floats(values: &[f32]) -> Vec2 {
    let [x, y, _, _] = vector_components(values, "Vec2");
    Vec2::new(x, y)
}

/// `Vec3` from a 2/3/4 element array
pub fn vector3_from_floats(values: &[f32]) -> Vec3 {
    let [x, y, z, _] = vector_components(values, "Vec3");
    Vec3::new(x, y, z)
}

/// `Vec4` from a 2/3/4 element array
pub fn vector4_from_floats(values: &[f32]) -> Vec4 {
    Vec4::from_array(vector_components(values, "Vec4"))
}

/// Quaternion from an `[x, y, z, w]` array
pub fn quat_from_floats(values: &[f32]) -> Quat {
    match values {
        [x, y, z, w] => Quat::from_xyzw(*x, *y, *z, *w),
        _ => {
            warn!(len = values.len(), "Float array is not a valid quaternion");
            Quat::from_xyzw(0.0, 0.0, 0.0, 0.0)
        }
    }
}

/// Canonical four-float record for vectors, rotations and colors
///
/// Colors map to `x = r, y = g, z = b, w = a`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct SavableVector {
    #[serde(with = "crate::savable::non_finite")]
    pub x: f32,
    #[serde(with = "crate::savable::non_finite")]
    pub y: f32,
    #[serde(with = "crate::savable::non_finite")]
    pub z: f32,
    #[serde(with = "crate::savable::non_finite")]
    pub w: f32,
}

impl SavableVector {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn from_vec2(v: Vec2) -> Self {
        Self::new(v.x, v.y, 0.0, 0.0)
    }

    pub fn from_vec3(v: Vec3) -> Self {
        Self::new(v.x, v.y, v.z, 0.0)
    }

    pub fn from_vec4(v: Vec4) -> Self {
        let [x, y, z, w] = v.to_array();
        Self::new(x, y, z, w)
    }

    pub fn from_quat(q: Quat) -> Self {
        let [x, y, z, w] = q.to_array();
        Self::new(x, y, z, w)
    }

    pub fn from_color(c: Color) -> Self {
        Self::new(c.r, c.g, c.b, c.a)
    }

    pub fn vec2(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    pub fn vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn vec4(&self) -> Vec4 {
        Vec4::new(self.x, self.y, self.z, self.w)
    }

    pub fn quat(&self) -> Quat {
        Quat::from_xyzw(self.x, self.y, self.z, self.w)
    }

    pub fn color(&self) -> Color {
        Color::rgba(self.x, self.y, self.z, self.w)
    }
}

/// Saved form of a [`Transform`]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct SavableTransform {
    pub position: SavableVector,
    pub local_position: SavableVector,
    pub rotation: SavableVector,
    pub local_rotation: SavableVector,
    pub local_scale: SavableVector,
}

impl SavableTransform {
    pub fn from_transform(transform: &Transform) -> Self {
        Self {
            position: SavableVector::from_vec3(transform.position),
            local_position: SavableVector::from_vec3(transform.local_position),
            rotation: SavableVector::from_quat(transform.rotation),
            local_rotation: SavableVector::from_quat(transform.local_rotation),
            local_scale: SavableVector::from_vec3(transform.local_scale),
        }
    }

    pub fn to_transform(&self) -> Transform {
        Transform {
            position: self.position.vec3(),
            local_position: self.local_position.vec3(),
            rotation: self.rotation.quat(),
            local_rotation: self.local_rotation.quat(),
            local_scale: self.local_scale.vec3(),
        }
    }
}

crate::impl_savable!(
    SavableVector => "SavableVector",
    SavableTransform => "SavableTransform",
);
