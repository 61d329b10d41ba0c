//! Scene-side draw records handed to the renderer each frame.
//!
//! The layout engine produces a [`Scene`]: four bounded lists of instances, one
//! per [`DrawKind`]. Capacities are static; the producer culls or truncates
//! before handing the scene over.

/// Maximum number of untextured primitives per frame.
pub const MAX_PRIMITIVES: usize = 4096;
/// Maximum number of glyph quads per frame.
pub const MAX_GLYPHS: usize = 8192;
/// Maximum number of vector-icon quads per frame.
pub const MAX_VECTORS: usize = 2048;
/// Maximum number of bitmap-image quads per frame.
pub const MAX_IMAGES: usize = 1024;

/// The four instanced draw kinds, in recording order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawKind {
    Primitive,
    Glyph,
    Vector,
    Image,
}

impl DrawKind {
    pub const ALL: [DrawKind; 4] = [
        DrawKind::Primitive,
        DrawKind::Glyph,
        DrawKind::Vector,
        DrawKind::Image,
    ];

    pub const fn index(self) -> usize {
        match self {
            DrawKind::Primitive => 0,
            DrawKind::Glyph => 1,
            DrawKind::Vector => 2,
            DrawKind::Image => 3,
        }
    }

    /// Per-frame instance capacity of this kind's storage buffer.
    pub const fn capacity(self) -> usize {
        match self {
            DrawKind::Primitive => MAX_PRIMITIVES,
            DrawKind::Glyph => MAX_GLYPHS,
            DrawKind::Vector => MAX_VECTORS,
            DrawKind::Image => MAX_IMAGES,
        }
    }

    /// Whether the kind samples one of the texture atlases.
    pub const fn is_textured(self) -> bool {
        !matches!(self, DrawKind::Primitive)
    }
}

/// Axis-aligned rectangle in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A clip rectangle large enough to never clip anything.
    pub const UNCLIPPED: Rect = Rect::new(-16384.0, -16384.0, 32768.0, 32768.0);

    pub(crate) fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

/// Straight-alpha RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const WHITE: Color = Color::rgba(1.0, 1.0, 1.0, 1.0);
    pub const TRANSPARENT: Color = Color::rgba(0.0, 0.0, 0.0, 0.0);

    pub(crate) fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Normalised atlas coordinates (u_min, v_min, u_max, v_max).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UvRect {
    pub u_min: f32,
    pub v_min: f32,
    pub u_max: f32,
    pub v_max: f32,
}

impl UvRect {
    pub(crate) fn to_array(self) -> [f32; 4] {
        [self.u_min, self.v_min, self.u_max, self.v_max]
    }
}

/// Untextured rounded rectangle with optional border.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub bounds: Rect,
    pub color: Color,
    pub border_color: Color,
    pub border_width: f32,
    /// Corner radii: top-left, top-right, bottom-right, bottom-left.
    pub corner_radii: [f32; 4],
    pub clip: Rect,
}

impl Default for Quad {
    fn default() -> Self {
        Self {
            bounds: Rect::default(),
            color: Color::WHITE,
            border_color: Color::TRANSPARENT,
            border_width: 0.0,
            corner_radii: [0.0; 4],
            clip: Rect::UNCLIPPED,
        }
    }
}

/// A single glyph sampled from the R8 glyph atlas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlyphQuad {
    pub bounds: Rect,
    pub uv: UvRect,
    pub color: Color,
    pub clip: Rect,
}

/// A vector icon sampled from the premultiplied RGBA vector atlas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IconQuad {
    pub bounds: Rect,
    pub uv: UvRect,
    pub tint: Color,
    pub clip: Rect,
}

/// A bitmap image sampled from the RGBA image atlas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageQuad {
    pub bounds: Rect,
    pub uv: UvRect,
    pub clip: Rect,
    pub opacity: f32,
    pub corner_radius: f32,
}

/// Everything the renderer draws in one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scene<'a> {
    pub primitives: &'a [Quad],
    pub glyphs: &'a [GlyphQuad],
    pub vectors: &'a [IconQuad],
    pub images: &'a [ImageQuad],
}

impl<'a> Scene<'a> {
    /// Instance count for `kind`, clamped to the kind's capacity.
    pub fn instance_count(&self, kind: DrawKind) -> usize {
        let len = match kind {
            DrawKind::Primitive => self.primitives.len(),
            DrawKind::Glyph => self.glyphs.len(),
            DrawKind::Vector => self.vectors.len(),
            DrawKind::Image => self.images.len(),
        };
        debug_assert!(
            len <= kind.capacity(),
            "{kind:?}: {len} instances exceed capacity {}",
            kind.capacity()
        );
        len.min(kind.capacity())
    }

    pub fn is_empty(&self) -> bool {
        DrawKind::ALL.iter().all(|&kind| self.instance_count(kind) == 0)
    }
}
