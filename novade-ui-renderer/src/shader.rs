//! SPIR-V loading for the four draw-kind pipelines.

use ash::{util::read_spv, vk};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

use crate::error::{RendererError, Result, ShaderStage, Subsystem, VkResultExt};
use crate::scene::DrawKind;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Vertex and fragment SPIR-V for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderPair {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
}

impl ShaderPair {
    pub fn new(vertex: impl Into<Vec<u8>>, fragment: impl Into<Vec<u8>>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    pub fn stage(&self, stage: ShaderStage) -> &[u8] {
        match stage {
            ShaderStage::Vertex => &self.vertex,
            ShaderStage::Fragment => &self.fragment,
        }
    }
}

/// Shader bytecode for every [`DrawKind`], indexed by [`DrawKind::index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderSet {
    pairs: [ShaderPair; 4],
}

impl ShaderSet {
    pub fn new(
        primitive: ShaderPair,
        glyph: ShaderPair,
        vector: ShaderPair,
        image: ShaderPair,
    ) -> Self {
        Self {
            pairs: [primitive, glyph, vector, image],
        }
    }

    /// Loads `{primitive,glyph,vector,image}.{vert,frag}.spv` from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::default();
        for kind in DrawKind::ALL {
            let stem = file_stem(kind);
            let read = |ext: &str| {
                let path = dir.join(format!("{stem}.{ext}.spv"));
                std::fs::read(&path).map_err(|source| RendererError::ShaderIo { path, source })
            };
            set.pairs[kind.index()] = ShaderPair {
                vertex: read("vert")?,
                fragment: read("frag")?,
            };
            debug!("Loaded {:?} shaders from {:?}.", kind, dir);
        }
        Ok(set)
    }

    pub fn pair(&self, kind: DrawKind) -> &ShaderPair {
        &self.pairs[kind.index()]
    }

    /// Checks every stage for well-formed SPIR-V framing.
    pub fn validate(&self) -> Result<()> {
        for kind in DrawKind::ALL {
            for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
                validate_spirv(self.pair(kind).stage(stage)).map_err(|reason| {
                    RendererError::InvalidShader {
                        kind,
                        stage,
                        reason,
                    }
                })?;
            }
        }
        Ok(())
    }
}

fn file_stem(kind: DrawKind) -> &'static str {
    match kind {
        DrawKind::Primitive => "primitive",
        DrawKind::Glyph => "glyph",
        DrawKind::Vector => "vector",
        DrawKind::Image => "image",
    }
}

/// Rejects byte strings that cannot be SPIR-V: empty, not word-sized, or
/// missing the magic number in either byte order.
pub(crate) fn validate_spirv(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.is_empty() {
        return Err("bytecode is empty".to_string());
    }
    if bytes.len() % 4 != 0 {
        return Err(format!("length {} is not a multiple of 4", bytes.len()));
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if u32::from_le_bytes(magic) != SPIRV_MAGIC && u32::from_be_bytes(magic) != SPIRV_MAGIC {
        return Err(format!("bad magic number {:#010x}", u32::from_le_bytes(magic)));
    }
    Ok(())
}

/// Shader module destroyed on drop. Only needed while pipelines are built.
pub(crate) struct ShaderModule<'d> {
    device: &'d ash::Device,
    pub handle: vk::ShaderModule,
}

impl<'d> ShaderModule<'d> {
    pub fn new(
        device: &'d ash::Device,
        kind: DrawKind,
        stage: ShaderStage,
        spirv_bytes: &[u8],
    ) -> Result<Self> {
        let invalid = |reason: String| RendererError::InvalidShader {
            kind,
            stage,
            reason,
        };
        validate_spirv(spirv_bytes).map_err(invalid)?;
        let code = read_spv(&mut Cursor::new(spirv_bytes)).map_err(|err| invalid(err.to_string()))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let handle = unsafe { device.create_shader_module(&create_info, None) }
            .in_subsystem(Subsystem::PipelineFactory, "vkCreateShaderModule")?;
        Ok(Self { device, handle })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    /// Smallest byte string that passes framing checks.
    pub(crate) fn fake_spirv() -> Vec<u8> {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        bytes
    }

    #[rstest]
    #[case::empty(vec![], "empty")]
    #[case::unaligned(vec![0x03, 0x02, 0x23, 0x07, 0x00], "multiple of 4")]
    #[case::wrong_magic(vec![0xde, 0xad, 0xbe, 0xef], "magic")]
    fn malformed_spirv_is_rejected(#[case] bytes: Vec<u8>, #[case] needle: &str) {
        let reason = validate_spirv(&bytes).unwrap_err();
        assert!(reason.contains(needle), "{reason}");
    }

    #[test]
    fn big_endian_magic_is_accepted() {
        let mut bytes = SPIRV_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        assert!(validate_spirv(&bytes).is_ok());
    }

    #[test]
    fn validate_names_the_failing_kind_and_stage() {
        let good = ShaderPair::new(fake_spirv(), fake_spirv());
        let bad = ShaderPair::new(fake_spirv(), vec![1, 2, 3]);
        let set = ShaderSet::new(good.clone(), good.clone(), bad, good);
        match set.validate() {
            Err(RendererError::InvalidShader { kind, stage, .. }) => {
                assert_eq!(kind, DrawKind::Vector);
                assert_eq!(stage, ShaderStage::Fragment);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn load_dir_reads_all_eight_files() {
        let dir = tempfile::tempdir().unwrap();
        for stem in ["primitive", "glyph", "vector", "image"] {
            for ext in ["vert", "frag"] {
                std::fs::write(dir.path().join(format!("{stem}.{ext}.spv")), fake_spirv()).unwrap();
            }
        }
        let set = ShaderSet::load_dir(dir.path()).unwrap();
        set.validate().unwrap();
        assert_eq!(set.pair(DrawKind::Image).fragment, fake_spirv());
    }

    #[test]
    fn load_dir_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShaderSet::load_dir(dir.path()).unwrap_err();
        match err {
            RendererError::ShaderIo { path, .. } => assert!(path.ends_with("primitive.vert.spv")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
