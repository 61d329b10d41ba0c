//! GPU-side record layouts.
//!
//! Every struct here is `#[repr(C)]` and mirrors the shader-side std430 (storage
//! buffers) or std140 (uniform block) declaration byte for byte, padding
//! fields included. Only `[f32; 4]`/`[f32; 2]` members are used so the Rust and
//! GLSL layouts agree without implicit padding.

use bytemuck::{Pod, Zeroable};

use crate::scene::{GlyphQuad, IconQuad, ImageQuad, Quad};

/// Uniform block shared by every pipeline.
///
/// Layout (std140):
/// - viewport_size: `vec2` (8 bytes) - logical pixels
/// - scale_factor: `float` (4 bytes)
/// - _pad0: `float` (4 bytes)
/// - glyph_atlas_size: `vec2` (8 bytes)
/// - vector_atlas_size: `vec2` (8 bytes)
/// - image_atlas_size: `vec2` (8 bytes)
/// - _pad1: `vec2` (8 bytes)
///   Total: 48 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    pub viewport_size: [f32; 2],
    pub scale_factor: f32,
    pub _pad0: f32,
    pub glyph_atlas_size: [f32; 2],
    pub vector_atlas_size: [f32; 2],
    pub image_atlas_size: [f32; 2],
    pub _pad1: [f32; 2],
}

impl Uniforms {
    /// Uniforms for a viewport of `width`x`height` logical pixels.
    pub fn for_viewport(width: f32, height: f32, scale_factor: f32) -> Self {
        Self {
            viewport_size: [width, height],
            scale_factor,
            ..Self::default()
        }
    }
}

/// Untextured primitive instance (96 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuPrimitive {
    /// Bounds (x, y, width, height)
    pub bounds: [f32; 4],
    /// Fill color (RGBA, straight alpha)
    pub color: [f32; 4],
    /// Border color (RGBA, straight alpha)
    pub border_color: [f32; 4],
    /// Corner radii (top-left, top-right, bottom-right, bottom-left)
    pub corner_radii: [f32; 4],
    /// Clip bounds (x, y, width, height)
    pub clip_bounds: [f32; 4],
    /// Border (width, 0, 0, 0)
    pub border: [f32; 4],
}

/// Glyph instance sampling the R8 glyph atlas (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuGlyph {
    pub bounds: [f32; 4],
    /// UV coordinates in atlas (u_min, v_min, u_max, v_max)
    pub uv_bounds: [f32; 4],
    pub color: [f32; 4],
    pub clip_bounds: [f32; 4],
}

/// Vector-icon instance sampling the premultiplied vector atlas (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuSvg {
    pub bounds: [f32; 4],
    pub uv_bounds: [f32; 4],
    pub tint: [f32; 4],
    pub clip_bounds: [f32; 4],
}

/// Bitmap image instance sampling the RGBA image atlas (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuImage {
    pub bounds: [f32; 4],
    pub uv_bounds: [f32; 4],
    pub clip_bounds: [f32; 4],
    /// (opacity, corner_radius, 0, 0)
    pub params: [f32; 4],
}

impl From<&Quad> for GpuPrimitive {
    fn from(quad: &Quad) -> Self {
        Self {
            bounds: quad.bounds.to_array(),
            color: quad.color.to_array(),
            border_color: quad.border_color.to_array(),
            corner_radii: quad.corner_radii,
            clip_bounds: quad.clip.to_array(),
            border: [quad.border_width, 0.0, 0.0, 0.0],
        }
    }
}

impl From<&GlyphQuad> for GpuGlyph {
    fn from(glyph: &GlyphQuad) -> Self {
        Self {
            bounds: glyph.bounds.to_array(),
            uv_bounds: glyph.uv.to_array(),
            color: glyph.color.to_array(),
            clip_bounds: glyph.clip.to_array(),
        }
    }
}

impl From<&IconQuad> for GpuSvg {
    fn from(icon: &IconQuad) -> Self {
        Self {
            bounds: icon.bounds.to_array(),
            uv_bounds: icon.uv.to_array(),
            tint: icon.tint.to_array(),
            clip_bounds: icon.clip.to_array(),
        }
    }
}

impl From<&ImageQuad> for GpuImage {
    fn from(image: &ImageQuad) -> Self {
        Self {
            bounds: image.bounds.to_array(),
            uv_bounds: image.uv.to_array(),
            clip_bounds: image.clip.to_array(),
            params: [image.opacity, image.corner_radius, 0.0, 0.0],
        }
    }
}

/// Converts `src` records into the mapped instance array `dst`, returning the
/// number of instances written. Never allocates.
pub(crate) fn write_instances<'s, S, G>(dst: &mut [G], src: &'s [S]) -> usize
where
    G: From<&'s S> + Pod,
{
    let count = src.len().min(dst.len());
    for (out, record) in dst.iter_mut().zip(&src[..count]) {
        *out = G::from(record);
    }
    count
}
