// Per-frame transforms for the vertex shader

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

const DEGREES_PER_SECOND: f32 = 90.0;
const EYE: Vec3 = Vec3::new(2.0, 2.0, 2.0);
const FOV_Y_DEGREES: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 10.0;

/// Matches the `UniformBufferObject` block at binding 0 (std140)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Model spinning about +Z, seen from (2, 2, 2) with +Z up
    pub fn at(elapsed_secs: f32, extent: vk::Extent2D) -> Self {
        let model = Mat4::from_rotation_z((elapsed_secs * DEGREES_PER_SECOND).to_radians());
        let view = Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR);
        // Clip space Y points down in Vulkan
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn layout_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 192);
    }

    #[test]
    fn rotates_a_quarter_turn_per_second() {
        let start = UniformBufferObject::at(0.0, EXTENT);
        assert_eq!(start.model, Mat4::IDENTITY);

        let one_second = UniformBufferObject::at(1.0, EXTENT);
        assert!(approx(one_second.model.transform_point3(Vec3::X), Vec3::Y));

        let four_seconds = UniformBufferObject::at(4.0, EXTENT);
        assert!(approx(four_seconds.model.transform_point3(Vec3::X), Vec3::X));
    }

    #[test]
    fn camera_looks_at_origin_from_the_corner() {
        let ubo = UniformBufferObject::at(0.0, EXTENT);

        assert!(approx(ubo.view.transform_point3(EYE), Vec3::ZERO));
        let origin = ubo.view.transform_point3(Vec3::ZERO);
        assert!(approx(origin, Vec3::new(0.0, 0.0, -EYE.length())));
    }

    #[test]
    fn projection_flips_y_and_maps_depth_to_unit_range() {
        let ubo = UniformBufferObject::at(0.0, EXTENT);
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!(ubo.proj.x_axis.x > 0.0);

        // Aspect ratio lives in the x scale
        let ratio = ubo.proj.y_axis.y.abs() / ubo.proj.x_axis.x;
        assert!((ratio - 800.0 / 600.0).abs() < 1e-4);

        let depth = |z: f32| {
            let clip = ubo.proj * Vec4::new(0.0, 0.0, -z, 1.0);
            clip.z / clip.w
        };
        assert!(depth(Z_NEAR).abs() < 1e-5);
        assert!((depth(Z_FAR) - 1.0).abs() < 1e-5);

        // A point above the axis lands in the upper half of the image,
        // which is negative Y in Vulkan clip space
        let clip = ubo.proj * Vec4::new(0.0, 1.0, -5.0, 1.0);
        assert!(clip.y < 0.0);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let ubo = UniformBufferObject::at(0.0, vk::Extent2D { width: 10, height: 0 });
        assert!(ubo.proj.x_axis.x.is_finite());
    }
}
