//! Creation descriptors and state values accepted by [`Renderer`].
//!
//! These types are backend-neutral; the `vk_*` conversions are crate
//! internal.
//!
//! [`Renderer`]: crate::Renderer

use bitflags::bitflags;
use pen_gpu::ash::vk;
pub use pen_gpu::shader::ShaderStage;

use crate::error::RendererError;
use crate::pool::ResourceHandle;

// ---------------------------------------------------------------------------
// Clear state
// ---------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearFlags: u32 {
        const COLOUR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// What the next pass clears its targets to. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct ClearState {
    pub flags: ClearFlags,
    pub colour: [f32; 4],
    pub depth: f32,
    pub stencil: u8,
    /// Per-target colours; colour target `i` uses `mrt[i]` when present.
    pub mrt: Vec<[f32; 4]>,
}

impl Default for ClearState {
    fn default() -> Self {
        Self {
            flags: ClearFlags::empty(),
            colour: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
            mrt: Vec::new(),
        }
    }
}

impl ClearState {
    pub fn colour(rgba: [f32; 4]) -> Self {
        Self {
            flags: ClearFlags::COLOUR,
            colour: rgba,
            ..Self::default()
        }
    }

    pub fn colour_depth(rgba: [f32; 4], depth: f32) -> Self {
        Self {
            flags: ClearFlags::COLOUR | ClearFlags::DEPTH,
            colour: rgba,
            depth,
            ..Self::default()
        }
    }

    pub fn colour_for_target(&self, index: usize) -> [f32; 4] {
        self.mrt.get(index).copied().unwrap_or(self.colour)
    }
}

// ---------------------------------------------------------------------------
// Shaders and input layouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ShaderLoadParams<'a> {
    /// SPIR-V byte code.
    pub byte_code: &'a [u8],
    pub stage: ShaderStage,
    pub entry_point: &'a str,
}

impl<'a> ShaderLoadParams<'a> {
    pub fn new(byte_code: &'a [u8], stage: ShaderStage) -> Self {
        Self {
            byte_code,
            stage,
            entry_point: "main",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    UInt,
    UInt2,
    UInt4,
    UByte4,
    UByte4Norm,
    Half2,
    Half4,
}

impl VertexFormat {
    pub(crate) fn vk_format(self) -> vk::Format {
        match self {
            VertexFormat::Float => vk::Format::R32_SFLOAT,
            VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::UInt => vk::Format::R32_UINT,
            VertexFormat::UInt2 => vk::Format::R32G32_UINT,
            VertexFormat::UInt4 => vk::Format::R32G32B32A32_UINT,
            VertexFormat::UByte4 => vk::Format::R8G8B8A8_UINT,
            VertexFormat::UByte4Norm => vk::Format::R8G8B8A8_UNORM,
            VertexFormat::Half2 => vk::Format::R16G16_SFLOAT,
            VertexFormat::Half4 => vk::Format::R16G16B16A16_SFLOAT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputElement {
    pub location: u32,
    pub binding: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputBinding {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InputLayoutDesc {
    pub bindings: Vec<InputBinding>,
    pub elements: Vec<InputElement>,
}

impl InputLayoutDesc {
    /// Every element must reference a declared binding and every location
    /// must be unique.
    pub(crate) fn validate(&self) -> Result<(), RendererError> {
        for (i, element) in self.elements.iter().enumerate() {
            if !self.bindings.iter().any(|b| b.binding == element.binding) {
                return Err(RendererError::InvalidDescriptor(format!(
                    "input element at location {} uses undeclared binding {}",
                    element.location, element.binding
                )));
            }
            if self.elements[..i]
                .iter()
                .any(|e| e.location == element.location)
            {
                return Err(RendererError::InvalidDescriptor(format!(
                    "input location {} declared twice",
                    element.location
                )));
            }
        }
        Ok(())
    }
}

/// A vertex shader, an optional fragment shader and an optional input
/// layout validated and bound as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderLinkParams {
    pub vertex: ResourceHandle,
    pub fragment: Option<ResourceHandle>,
    pub input_layout: Option<ResourceHandle>,
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        /// Read/write storage buffer.
        const STRUCTURED = 1 << 3;
    }
}

impl BindFlags {
    pub(crate) fn vk_usage(self) -> vk::BufferUsageFlags {
        let mut usage =
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if self.contains(BindFlags::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(BindFlags::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(BindFlags::CONSTANT) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(BindFlags::STRUCTURED) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuAccess {
    /// GPU-only; contents come from the initial data.
    #[default]
    None,
    /// Updated from the CPU through `update_buffer`.
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub bind: BindFlags,
    pub cpu_access: CpuAccess,
    pub data: Option<&'a [u8]>,
}

impl BufferDesc<'_> {
    pub(crate) fn validate(&self) -> Result<(), RendererError> {
        if self.size == 0 {
            return Err(RendererError::InvalidDescriptor(
                "buffer size must be non-zero".to_owned(),
            ));
        }
        if self.bind.is_empty() {
            return Err(RendererError::InvalidDescriptor(
                "buffer needs at least one bind flag".to_owned(),
            ));
        }
        if let Some(data) = self.data
            && data.len() as u64 > self.size
        {
            return Err(RendererError::DataLength {
                expected: self.size,
                actual: data.len() as u64,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Textures and render targets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    D16,
    D24S8,
    D32Float,
    D32FloatS8,
}

impl TextureFormat {
    pub(crate) fn vk_format(self) -> vk::Format {
        match self {
            TextureFormat::R8Unorm => vk::Format::R8_UNORM,
            TextureFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
            TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            TextureFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            TextureFormat::R16Float => vk::Format::R16_SFLOAT,
            TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            TextureFormat::R32Float => vk::Format::R32_SFLOAT,
            TextureFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
            TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            TextureFormat::D16 => vk::Format::D16_UNORM,
            TextureFormat::D24S8 => vk::Format::D24_UNORM_S8_UINT,
            TextureFormat::D32Float => vk::Format::D32_SFLOAT,
            TextureFormat::D32FloatS8 => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float | TextureFormat::D16 => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8Srgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8Srgb
            | TextureFormat::R32Float
            | TextureFormat::D24S8
            | TextureFormat::D32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float | TextureFormat::D32FloatS8 => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::D16
                | TextureFormat::D24S8
                | TextureFormat::D32Float
                | TextureFormat::D32FloatS8
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::D24S8 | TextureFormat::D32FloatS8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureKind {
    #[default]
    Texture2D,
    Array(u32),
    /// Six faces in +X, -X, +Y, -Y, +Z, -Z order.
    Cube,
}

impl TextureKind {
    pub fn layers(self) -> u32 {
        match self {
            TextureKind::Texture2D => 1,
            TextureKind::Array(n) => n,
            TextureKind::Cube => 6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDesc<'a> {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub kind: TextureKind,
    /// Tightly packed texels, layer after layer.
    pub data: Option<&'a [u8]>,
}

impl TextureDesc<'_> {
    pub fn layer_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel())
    }

    pub(crate) fn validate(&self) -> Result<(), RendererError> {
        if self.width == 0 || self.height == 0 || self.kind.layers() == 0 {
            return Err(RendererError::InvalidDescriptor(format!(
                "texture of {}x{} with {} layers",
                self.width,
                self.height,
                self.kind.layers()
            )));
        }
        if self.format.is_depth() && self.data.is_some() {
            return Err(RendererError::InvalidDescriptor(
                "depth textures cannot be created with initial data".to_owned(),
            ));
        }
        if let Some(data) = self.data {
            let expected = self.layer_bytes() * u64::from(self.kind.layers());
            if data.len() as u64 != expected {
                return Err(RendererError::DataLength {
                    expected,
                    actual: data.len() as u64,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderTargetSize {
    Fixed { width: u32, height: u32 },
    /// Scaled from the window extent and recreated on resize.
    WindowRatio(f32),
}

impl RenderTargetSize {
    pub(crate) fn resolve(self, window: vk::Extent2D) -> vk::Extent2D {
        match self {
            RenderTargetSize::Fixed { width, height } => vk::Extent2D { width, height },
            RenderTargetSize::WindowRatio(ratio) => vk::Extent2D {
                width: ((window.width as f32 * ratio) as u32).max(1),
                height: ((window.height as f32 * ratio) as u32).max(1),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTargetDesc {
    pub size: RenderTargetSize,
    pub format: TextureFormat,
    pub samples: u32,
    pub kind: TextureKind,
    /// Surfaced through `get_info` style tooling only.
    pub track: bool,
}

impl RenderTargetDesc {
    pub fn new(size: RenderTargetSize, format: TextureFormat) -> Self {
        Self {
            size,
            format,
            samples: 1,
            kind: TextureKind::Texture2D,
            track: false,
        }
    }

    pub(crate) fn vk_samples(&self) -> Result<vk::SampleCountFlags, RendererError> {
        Ok(match self.samples {
            1 => vk::SampleCountFlags::TYPE_1,
            2 => vk::SampleCountFlags::TYPE_2,
            4 => vk::SampleCountFlags::TYPE_4,
            8 => vk::SampleCountFlags::TYPE_8,
            16 => vk::SampleCountFlags::TYPE_16,
            other => {
                return Err(RendererError::InvalidDescriptor(format!(
                    "unsupported sample count {other}"
                )));
            }
        })
    }

    pub(crate) fn validate(&self) -> Result<(), RendererError> {
        self.vk_samples()?;
        if self.samples > 1 && self.kind != TextureKind::Texture2D {
            return Err(RendererError::InvalidDescriptor(
                "multisampled render targets must be single-layer".to_owned(),
            ));
        }
        if self.kind.layers() == 0 {
            return Err(RendererError::InvalidDescriptor(
                "render target needs at least one layer".to_owned(),
            ));
        }
        if let RenderTargetSize::Fixed { width, height } = self.size
            && (width == 0 || height == 0)
        {
            return Err(RendererError::InvalidDescriptor(format!(
                "render target of {width}x{height}"
            )));
        }
        if let RenderTargetSize::WindowRatio(ratio) = self.size
            && !(ratio > 0.0 && ratio.is_finite())
        {
            return Err(RendererError::InvalidDescriptor(format!(
                "render target window ratio {ratio}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Point,
    #[default]
    Linear,
}

impl Filter {
    fn vk_filter(self) -> vk::Filter {
        match self {
            Filter::Point => vk::Filter::NEAREST,
            Filter::Linear => vk::Filter::LINEAR,
        }
    }

    fn vk_mipmap_mode(self) -> vk::SamplerMipmapMode {
        match self {
            Filter::Point => vk::SamplerMipmapMode::NEAREST,
            Filter::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
}

impl AddressMode {
    fn vk_address_mode(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
            AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
            AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

impl ComparisonFunc {
    pub(crate) fn vk_compare_op(self) -> vk::CompareOp {
        match self {
            ComparisonFunc::Never => vk::CompareOp::NEVER,
            ComparisonFunc::Less => vk::CompareOp::LESS,
            ComparisonFunc::Equal => vk::CompareOp::EQUAL,
            ComparisonFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            ComparisonFunc::Greater => vk::CompareOp::GREATER,
            ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
            ComparisonFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            ComparisonFunc::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: Option<f32>,
    /// Turns the sampler into a comparison sampler.
    pub comparison: Option<ComparisonFunc>,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            comparison: None,
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

impl SamplerDesc {
    pub(crate) fn to_gpu(self) -> pen_gpu::sampler::SamplerDesc {
        pen_gpu::sampler::SamplerDesc {
            mag_filter: self.mag_filter.vk_filter(),
            min_filter: self.min_filter.vk_filter(),
            mipmap_mode: self.mip_filter.vk_mipmap_mode(),
            address_u: self.address_u.vk_address_mode(),
            address_v: self.address_v.vk_address_mode(),
            address_w: self.address_w.vk_address_mode(),
            mip_lod_bias: self.mip_lod_bias,
            max_anisotropy: self.max_anisotropy,
            compare_op: self.comparison.map(ComparisonFunc::vk_compare_op),
            min_lod: self.min_lod,
            max_lod: self.max_lod.min(vk::LOD_CLAMP_NONE),
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-function states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RasterizerDesc {
    pub fill: FillMode,
    pub cull: CullMode,
    pub front_ccw: bool,
    pub depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    /// `false` clamps depth instead of clipping.
    pub depth_clip: bool,
}

impl RasterizerDesc {
    pub(crate) fn to_gpu(self) -> pen_gpu::pipeline::RasterState {
        let has_bias = self.depth_bias != 0.0 || self.slope_scaled_depth_bias != 0.0;
        pen_gpu::pipeline::RasterState {
            polygon_mode: match self.fill {
                FillMode::Solid => vk::PolygonMode::FILL,
                FillMode::Wireframe => vk::PolygonMode::LINE,
            },
            cull_mode: match self.cull {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Front => vk::CullModeFlags::FRONT,
                CullMode::Back => vk::CullModeFlags::BACK,
            },
            front_face: if self.front_ccw {
                vk::FrontFace::COUNTER_CLOCKWISE
            } else {
                vk::FrontFace::CLOCKWISE
            },
            depth_clamp: !self.depth_clip,
            depth_bias: has_bias.then_some((
                self.depth_bias,
                self.depth_bias_clamp,
                self.slope_scaled_depth_bias,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColour,
    InvSrcColour,
    SrcAlpha,
    InvSrcAlpha,
    DstColour,
    InvDstColour,
    DstAlpha,
    InvDstAlpha,
}

impl BlendFactor {
    fn vk_factor(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColour => vk::BlendFactor::SRC_COLOR,
            BlendFactor::InvSrcColour => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstColour => vk::BlendFactor::DST_COLOR,
            BlendFactor::InvDstColour => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::InvDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

impl BlendOp {
    fn vk_op(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::RevSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetBlend {
    pub enabled: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub op_alpha: BlendOp,
    /// RGBA bits, red lowest.
    pub write_mask: u8,
}

impl Default for RenderTargetBlend {
    fn default() -> Self {
        Self {
            enabled: false,
            src: BlendFactor::One,
            dst: BlendFactor::Zero,
            op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            op_alpha: BlendOp::Add,
            write_mask: 0x0f,
        }
    }
}

impl RenderTargetBlend {
    pub fn alpha() -> Self {
        Self {
            enabled: true,
            src: BlendFactor::SrcAlpha,
            dst: BlendFactor::InvSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::InvSrcAlpha,
            ..Self::default()
        }
    }

    fn to_gpu(self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(self.enabled)
            .src_color_blend_factor(self.src.vk_factor())
            .dst_color_blend_factor(self.dst.vk_factor())
            .color_blend_op(self.op.vk_op())
            .src_alpha_blend_factor(self.src_alpha.vk_factor())
            .dst_alpha_blend_factor(self.dst_alpha.vk_factor())
            .alpha_blend_op(self.op_alpha.vk_op())
            .color_write_mask(vk::ColorComponentFlags::from_raw(u32::from(
                self.write_mask & 0x0f,
            )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlendDesc {
    pub alpha_to_coverage: bool,
    /// One entry applies to every target; otherwise entry `i` is target
    /// `i`.
    pub targets: Vec<RenderTargetBlend>,
}

impl BlendDesc {
    pub(crate) fn to_gpu(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        self.targets.iter().map(|t| t.to_gpu()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

impl StencilOp {
    fn vk_op(self) -> vk::StencilOp {
        match self {
            StencilOp::Keep => vk::StencilOp::KEEP,
            StencilOp::Zero => vk::StencilOp::ZERO,
            StencilOp::Replace => vk::StencilOp::REPLACE,
            StencilOp::IncrSat => vk::StencilOp::INCREMENT_AND_CLAMP,
            StencilOp::DecrSat => vk::StencilOp::DECREMENT_AND_CLAMP,
            StencilOp::Invert => vk::StencilOp::INVERT,
            StencilOp::Incr => vk::StencilOp::INCREMENT_AND_WRAP,
            StencilOp::Decr => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilFaceDesc {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub func: ComparisonFunc,
}

impl Default for StencilFaceDesc {
    fn default() -> Self {
        Self {
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
            func: ComparisonFunc::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFaceDesc,
    pub back: StencilFaceDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_enable: false,
            depth_write: false,
            depth_func: ComparisonFunc::Less,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front: StencilFaceDesc::default(),
            back: StencilFaceDesc::default(),
        }
    }
}

impl DepthStencilDesc {
    pub(crate) fn to_gpu(self) -> pen_gpu::pipeline::DepthStencilState {
        let face = |f: StencilFaceDesc| {
            vk::StencilOpState::default()
                .fail_op(f.fail.vk_op())
                .depth_fail_op(f.depth_fail.vk_op())
                .pass_op(f.pass.vk_op())
                .compare_op(f.func.vk_compare_op())
                .compare_mask(u32::from(self.stencil_read_mask))
                .write_mask(u32::from(self.stencil_write_mask))
        };
        pen_gpu::pipeline::DepthStencilState {
            depth_test: self.depth_enable,
            depth_write: self.depth_enable && self.depth_write,
            depth_compare: self.depth_func.vk_compare_op(),
            stencil_test: self.stencil_enable,
            front: face(self.front),
            back: face(self.back),
        }
    }
}

// ---------------------------------------------------------------------------
// Draw-time values
// ---------------------------------------------------------------------------

/// A viewport in pixels, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub(crate) fn to_vk(self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

/// A scissor rectangle as edges in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub(crate) fn to_vk(self) -> vk::Rect2D {
        let left = self.left.max(0.0);
        let top = self.top.max(0.0);
        vk::Rect2D {
            offset: vk::Offset2D {
                x: left as i32,
                y: top as i32,
            },
            extent: vk::Extent2D {
                width: (self.right - left).max(0.0) as u32,
                height: (self.bottom - top).max(0.0) as u32,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub(crate) fn vk_topology(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub(crate) fn vk_index_type(self) -> vk::IndexType {
        match self {
            IndexFormat::U16 => vk::IndexType::UINT16,
            IndexFormat::U32 => vk::IndexType::UINT32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mrt_colours_override_main_colour() {
        let mut clear = ClearState::colour([0.0, 0.0, 1.0, 1.0]);
        clear.mrt = vec![[1.0, 0.0, 0.0, 1.0]];
        assert_eq!(clear.colour_for_target(0), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(clear.colour_for_target(1), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn texture_data_length_is_checked() {
        let data = vec![0u8; 4 * 4 * 4 * 6];
        let mut desc = TextureDesc {
            width: 4,
            height: 4,
            format: TextureFormat::Rgba8Unorm,
            kind: TextureKind::Cube,
            data: Some(&data),
        };
        assert!(desc.validate().is_ok());
        desc.kind = TextureKind::Texture2D;
        assert!(matches!(
            desc.validate(),
            Err(RendererError::DataLength {
                expected: 64,
                actual: 384
            })
        ));
    }

    #[test]
    fn buffer_desc_validation() {
        let data = [0u8; 32];
        let ok = BufferDesc {
            size: 32,
            bind: BindFlags::VERTEX,
            cpu_access: CpuAccess::None,
            data: Some(&data),
        };
        assert!(ok.validate().is_ok());
        assert!(BufferDesc { size: 16, ..ok }.validate().is_err());
        assert!(
            BufferDesc {
                bind: BindFlags::empty(),
                ..ok
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn input_layout_rejects_unknown_binding_and_duplicate_location() {
        let mut layout = InputLayoutDesc {
            bindings: vec![InputBinding {
                binding: 0,
                stride: 16,
                per_instance: false,
            }],
            elements: vec![InputElement {
                location: 0,
                binding: 0,
                format: VertexFormat::Float4,
                offset: 0,
            }],
        };
        assert!(layout.validate().is_ok());
        layout.elements.push(InputElement {
            location: 0,
            binding: 0,
            format: VertexFormat::Float2,
            offset: 0,
        });
        assert!(layout.validate().is_err());
        layout.elements[1].location = 1;
        layout.elements[1].binding = 3;
        assert!(layout.validate().is_err());
    }

    #[test]
    fn render_target_validation() {
        let mut desc =
            RenderTargetDesc::new(RenderTargetSize::WindowRatio(0.5), TextureFormat::Rgba8Unorm);
        assert!(desc.validate().is_ok());
        desc.samples = 3;
        assert!(desc.validate().is_err());
        desc.samples = 4;
        desc.kind = TextureKind::Cube;
        assert!(desc.validate().is_err());
        desc.samples = 1;
        assert!(desc.validate().is_ok());
        desc.size = RenderTargetSize::WindowRatio(0.0);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn window_ratio_never_reaches_zero() {
        let window = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let half = RenderTargetSize::WindowRatio(0.5).resolve(window);
        assert_eq!((half.width, half.height), (400, 300));
        let tiny = RenderTargetSize::WindowRatio(0.0001).resolve(window);
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn scissor_rect_clamps_negative_edges() {
        let rect = Rect {
            left: -10.0,
            top: 5.0,
            right: 100.0,
            bottom: 50.0,
        };
        let vk_rect = rect.to_vk();
        assert_eq!(vk_rect.offset.x, 0);
        assert_eq!(vk_rect.offset.y, 5);
        assert_eq!(vk_rect.extent.width, 100);
        assert_eq!(vk_rect.extent.height, 45);
    }

    #[test]
    fn depth_write_requires_depth_test() {
        let desc = DepthStencilDesc {
            depth_enable: false,
            depth_write: true,
            ..DepthStencilDesc::default()
        };
        assert!(!desc.to_gpu().depth_write);
    }
}
