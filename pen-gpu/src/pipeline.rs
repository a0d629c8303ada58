use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::shader::{EntryPoint, ShaderStage};

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// An owned `VkPipelineLayout`, shared between pipelines through `Arc`.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// # Safety
    /// Every set layout must come from `device` and outlive the pipelines
    /// built with this layout.
    pub unsafe fn new(
        device: &Arc<Device>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        // SAFETY: caller guarantees the set layouts belong to device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }?;
        // SAFETY: handle was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name pipeline layout {:?}: {e}", handle);
        }
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: every pipeline holds an Arc to its layout, so none remain.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("A graphics pipeline needs a vertex stage")]
    MissingVertexStage,

    #[error("A compute pipeline needs exactly one compute stage, got {0:?}")]
    NotCompute(ShaderStage),

    #[error("Vulkan error creating pipeline: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Fixed-function state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_clamp: bool,
    /// `(constant factor, clamp, slope factor)`.
    pub depth_bias: Option<(f32, f32, f32)>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_clamp: false,
            depth_bias: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub stencil_test: bool,
    pub front: vk::StencilOpState,
    pub back: vk::StencilOpState,
}

/// Per-attachment blend states. A single entry applies to every colour
/// attachment; missing entries write all channels unblended.
fn color_blend_attachments(
    attachment_count: usize,
    blend: &[vk::PipelineColorBlendAttachmentState],
) -> Vec<vk::PipelineColorBlendAttachmentState> {
    let opaque = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    (0..attachment_count)
        .map(|i| match blend {
            [single] => *single,
            many => many.get(i).copied().unwrap_or(opaque),
        })
        .collect()
}

const DYNAMIC_STATES: [vk::DynamicState; 3] = [
    vk::DynamicState::VIEWPORT,
    vk::DynamicState::SCISSOR,
    vk::DynamicState::STENCIL_REFERENCE,
];

// ---------------------------------------------------------------------------
// GraphicsPipeline
// ---------------------------------------------------------------------------

/// Description of a [`GraphicsPipeline`] for subpass 0 of `render_pass`.
///
/// Viewport, scissor and stencil reference are always dynamic.
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [EntryPoint<'a>],
    pub layout: Arc<PipelineLayout>,
    pub render_pass: vk::RenderPass,
    pub color_attachment_count: usize,
    pub samples: vk::SampleCountFlags,
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub raster: RasterState,
    pub depth_stencil: DepthStencilState,
    pub blend: &'a [vk::PipelineColorBlendAttachmentState],
    pub alpha_to_coverage: bool,
}

pub struct GraphicsPipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl GraphicsPipeline {
    /// # Safety
    /// `desc.render_pass` must be a live render pass of `device` whose
    /// subpass 0 has `desc.color_attachment_count` colour attachments of
    /// `desc.samples` samples.
    pub unsafe fn new(
        device: &Arc<Device>,
        desc: &GraphicsPipelineDesc<'_>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if !desc.stages.iter().any(|s| s.stage() == ShaderStage::Vertex) {
            return Err(CreatePipelineError::MissingVertexStage);
        }

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = desc
            .stages
            .iter()
            .map(|ep| ep.as_pipeline_stage_create_info())
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(desc.topology);

        // Counts must be declared even though the values are dynamic.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let raster = &desc.raster;
        let (bias_constant, bias_clamp, bias_slope) =
            raster.depth_bias.unwrap_or_default();
        let rasterization_state =
            vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(raster.polygon_mode)
                .cull_mode(raster.cull_mode)
                .front_face(raster.front_face)
                .depth_clamp_enable(raster.depth_clamp)
                .depth_bias_enable(raster.depth_bias.is_some())
                .depth_bias_constant_factor(bias_constant)
                .depth_bias_clamp(bias_clamp)
                .depth_bias_slope_factor(bias_slope)
                .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples)
            .alpha_to_coverage_enable(desc.alpha_to_coverage);

        let ds = &desc.depth_stencil;
        let depth_stencil_state =
            vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(ds.depth_test)
                .depth_write_enable(ds.depth_write)
                .depth_compare_op(ds.depth_compare)
                .stencil_test_enable(ds.stencil_test)
                .front(ds.front)
                .back(ds.back)
                .max_depth_bounds(1.0);

        let color_blend_attachments =
            color_blend_attachments(desc.color_attachment_count, desc.blend);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&DYNAMIC_STATES);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.raw_handle())
            .render_pass(desc.render_pass)
            .subpass(0);

        // SAFETY: every referenced handle comes from device and the caller
        // guarantees render pass compatibility.
        let handle = unsafe { device.create_raw_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::Vulkan)?;

        // SAFETY: handle is a valid pipeline created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name pipeline {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout: Arc::clone(&desc.layout),
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping graphics pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent; in-flight work using it
        // completed before the owner dropped it.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// ComputePipeline
// ---------------------------------------------------------------------------

pub struct ComputePipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("handle", &self.handle)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl ComputePipeline {
    pub fn new(
        device: &Arc<Device>,
        stage: &EntryPoint<'_>,
        layout: &Arc<PipelineLayout>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if stage.stage() != ShaderStage::Compute {
            return Err(CreatePipelineError::NotCompute(stage.stage()));
        }
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage.as_pipeline_stage_create_info())
            .layout(layout.raw_handle());

        // SAFETY: the module and layout both come from device.
        let handle = unsafe { device.create_raw_compute_pipeline(&create_info) }
            .map_err(CreatePipelineError::Vulkan)?;

        // SAFETY: handle is a valid pipeline created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name pipeline {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            layout: Arc::clone(layout),
        })
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping compute pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent; in-flight work using it
        // completed before the owner dropped it.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_blend_state_applies_to_all_attachments() {
        let additive = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let states = color_blend_attachments(3, &[additive]);
        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|s| s.blend_enable == vk::TRUE));
    }

    #[test]
    fn missing_blend_states_are_opaque() {
        let states = color_blend_attachments(2, &[]);
        assert_eq!(states.len(), 2);
        for state in states {
            assert_eq!(state.blend_enable, vk::FALSE);
            assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
        }
    }

    #[test]
    fn per_attachment_blend_states_are_positional() {
        let first = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::R);
        let second = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::G);
        let states = color_blend_attachments(3, &[first, second]);
        assert_eq!(states[0].color_write_mask, vk::ColorComponentFlags::R);
        assert_eq!(states[1].color_write_mask, vk::ColorComponentFlags::G);
        assert_eq!(states[2].color_write_mask, vk::ColorComponentFlags::RGBA);
    }
}
