//! Turning pending state into commands: render passes, pipelines,
//! descriptor sets, draws, dispatches and the end-of-frame present.

use std::ffi::CString;
use std::sync::Arc;

use pen_gpu::ash::vk;
use pen_gpu::command::CommandBuffer;
use pen_gpu::descriptor::{DescriptorSet, DescriptorWrites};
use pen_gpu::image::layout_transition;
use pen_gpu::pipeline::{ComputePipeline, GraphicsPipeline, GraphicsPipelineDesc};
use pen_gpu::render_pass::{Framebuffer, RenderPassDesc};
use pen_gpu::shader::ShaderStage;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::{Renderer, require_stage};
use crate::context::{
    ActiveFrame, Retired, SET_CONSTANT_BUFFERS, SET_STRUCTURED_BUFFERS, SET_TEXTURES,
};
use crate::desc::{DepthStencilDesc, PrimitiveTopology, RasterizerDesc, Rect, Viewport};
use crate::error::RendererError;
use crate::pipeline_cache::{GraphicsPipelineKey, compatible_pass};
use crate::pool::ResourceHandle;
use crate::resource::{Resource, ResourceKind};
use crate::state::{
    FrameState, TargetInfo, check_target_compat, clear_values, clears_backbuffer_by_transfer,
    describe_pass, workgroup_count,
};

/// Per-frame recording bookkeeping, reset when a frame begins.
#[derive(Debug, Default)]
pub(super) struct RecordingState {
    pass: Option<OpenPass>,
    /// Layout of the acquired swapchain image as of the last recorded
    /// command.
    backbuffer_layout: vk::ImageLayout,
    labels: u32,
    graphics_pipeline: Option<vk::Pipeline>,
    descriptor_sets: Option<[vk::DescriptorSet; 3]>,
}

#[derive(Debug)]
struct OpenPass {
    /// The pass with load ops erased, as pipelines are keyed.
    compatible: RenderPassDesc,
    extent: vk::Extent2D,
    samples: vk::SampleCountFlags,
    colour_targets: Vec<ResourceHandle>,
}

/// Viewport and scissor for a pass of `extent`, defaulting to all of it.
fn dynamic_state(
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    extent: vk::Extent2D,
) -> (vk::Viewport, vk::Rect2D) {
    let viewport = viewport
        .unwrap_or_else(|| Viewport::full(extent.width, extent.height))
        .to_vk();
    let scissor = scissor.map_or(
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        },
        Rect::to_vk,
    );
    (viewport, scissor)
}

/// Every layer of a colour image, for resolves.
fn resolve_region(extent: vk::Extent2D, layers: u32) -> vk::ImageResolve {
    let subresource = vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(layers);
    vk::ImageResolve::default()
        .src_subresource(subresource)
        .dst_subresource(subresource)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
}

/// # Safety
/// `cmd` must be recording outside a render pass and `image` must be a
/// swapchain image in `old` when the barrier executes.
unsafe fn transition_backbuffer(
    cmd: &mut CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    if old == new {
        return;
    }
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1);
    let barrier = layout_transition(image, range, old, new);
    let dependency =
        vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
    // SAFETY: caller guarantees recording state and the old layout.
    unsafe { cmd.pipeline_barrier2(&dependency) };
}

impl<W: HasDisplayHandle + HasWindowHandle> Renderer<W> {
    // -----------------------------------------------------------------------
    // Frame and pass management
    // -----------------------------------------------------------------------

    /// The recording frame, beginning one if idle. `None` while the window
    /// is minimised.
    fn begin_recording(
        &mut self,
        operation: &'static str,
    ) -> Result<Option<ActiveFrame>, RendererError> {
        let next = self.frame_state.record(operation)?;
        if self.context.is_minimised() {
            tracing::trace!("Window minimised, skipping {operation}");
            return Ok(None);
        }
        let Some(frame) = self.context.begin_frame()? else {
            return Ok(None);
        };
        if self.frame_state != next {
            self.frame_state = next;
            self.recording = RecordingState::default();
            self.state.descriptors_dirty = true;
        }
        Ok(Some(frame))
    }

    fn target_info(&self, handle: ResourceHandle) -> Result<TargetInfo, RendererError> {
        match self.resources.get(handle)? {
            Resource::Backbuffer => {
                let swapchain = self.context.swapchain();
                Ok(TargetInfo {
                    format: swapchain.format(),
                    samples: vk::SampleCountFlags::TYPE_1,
                    extent: swapchain.extent(),
                    has_stencil: false,
                    is_backbuffer: true,
                })
            }
            Resource::RenderTarget(target) => Ok(TargetInfo {
                format: target.image.format(),
                samples: target.image.samples(),
                extent: target.extent(),
                has_stencil: target.desc.format.has_stencil(),
                is_backbuffer: false,
            }),
            other => Err(RendererError::KindMismatch {
                handle,
                expected: ResourceKind::RenderTarget,
                actual: other.kind(),
            }),
        }
    }

    fn attachment_view(
        &self,
        frame: ActiveFrame,
        handle: ResourceHandle,
        slice: u32,
    ) -> Result<vk::ImageView, RendererError> {
        match self.resources.get(handle)? {
            Resource::Backbuffer => Ok(self.context.backbuffer_view(frame)),
            _ => self.resources.render_target(handle)?.layer_view(slice),
        }
    }

    /// Record a transition of render target `handle` to `layout` unless it
    /// is already there.
    fn move_target(
        &mut self,
        frame: ActiveFrame,
        handle: ResourceHandle,
        layout: vk::ImageLayout,
    ) -> Result<(), RendererError> {
        let target = self.resources.render_target_mut(handle)?;
        if target.layout == layout {
            return Ok(());
        }
        let cmd = self.context.command_buffer(frame);
        // SAFETY: no pass is open while targets move, and the tracked layout
        // is the one the previous recorded command left the image in.
        unsafe { target.image.record_transition(cmd, target.layout, layout) };
        target.layout = layout;
        Ok(())
    }

    /// Move the acquired image into colour-attachment layout, clearing it
    /// by transfer first when `clear_colour` is given.
    fn prepare_backbuffer(&mut self, frame: ActiveFrame, clear_colour: Option<[f32; 4]>) {
        let image = self.context.backbuffer_image(frame);
        let old = self.recording.backbuffer_layout;
        let cmd = self.context.command_buffer(frame);
        // SAFETY: no pass is open and the tracked layout is the image's
        // layout as of the previous command.
        unsafe {
            match clear_colour {
                Some(colour) => {
                    transition_backbuffer(cmd, image, old, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                    let range = vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1);
                    cmd.clear_color_image(
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        colour,
                        range,
                    );
                    transition_backbuffer(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    );
                }
                None => transition_backbuffer(
                    cmd,
                    image,
                    old,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
            }
        }
        self.recording.backbuffer_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }

    /// End any open pass and begin one for the bound targets, applying a
    /// requested clear.
    fn begin_pass(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        self.end_pass(frame)?;

        let colour_handles = self.state.colour_targets.clone();
        let depth_handle = self.state.depth_target;
        let colour = colour_handles
            .iter()
            .map(|&handle| self.target_info(handle))
            .collect::<Result<Vec<_>, _>>()?;
        let depth = depth_handle
            .map(|handle| self.target_info(handle))
            .transpose()?;
        check_target_compat(&colour, depth.as_ref())?;

        let clear = match self.state.clear_state {
            Some(handle) if self.state.clear_requested => {
                Some(self.resources.clear_state(handle)?.clone())
            }
            _ => None,
        };
        let transfer_clear = clears_backbuffer_by_transfer(
            clear.as_ref(),
            &colour,
            self.context
                .swapchain()
                .usage()
                .contains(vk::ImageUsageFlags::TRANSFER_DST),
        );
        let colour_slice = self.state.effective_colour_slice();
        let depth_slice = self.state.effective_depth_slice();

        for (index, (&handle, info)) in colour_handles.iter().zip(&colour).enumerate() {
            if info.is_backbuffer {
                let clear_colour = clear
                    .as_ref()
                    .filter(|_| transfer_clear)
                    .map(|c| c.colour_for_target(index));
                self.prepare_backbuffer(frame, clear_colour);
            } else {
                self.move_target(frame, handle, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
            }
        }
        if let Some(handle) = depth_handle {
            self.move_target(
                frame,
                handle,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )?;
        }

        let desc = describe_pass(&colour, depth.as_ref(), clear.as_ref(), transfer_clear);
        let device = Arc::clone(self.context.device());
        let render_pass = self.pipelines.render_pass(&device, &desc)?;

        let mut views = Vec::with_capacity(colour.len() + 1);
        for &handle in &colour_handles {
            views.push(self.attachment_view(frame, handle, colour_slice)?);
        }
        if let Some(handle) = depth_handle {
            views.push(self.attachment_view(frame, handle, depth_slice)?);
        }
        let first = colour.first().or(depth.as_ref());
        let extent = first.map_or(self.context.swapchain().extent(), |t| t.extent);
        let samples = first.map_or(vk::SampleCountFlags::TYPE_1, |t| t.samples);

        // SAFETY: the views belong to the bound targets, ordered like the
        // pass attachments; the targets are retired no earlier than this
        // frame, like the framebuffer.
        let name = self.context.debug_name("frame framebuffer");
        let framebuffer = unsafe { Framebuffer::new(&render_pass, &views, extent, name) }?;

        let clear_values = clear_values(colour.len(), depth.is_some(), clear.as_ref());
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw_handle())
            .framebuffer(framebuffer.raw_handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&clear_values);
        let cmd = self.context.command_buffer(frame);
        // SAFETY: no pass is open and every attachment was moved to its
        // attachment layout above.
        unsafe { cmd.begin_render_pass(&begin) };
        self.garbage.push(frame.index, Retired::Framebuffer(framebuffer));

        tracing::trace!(
            "Began pass with {} colour targets, depth: {}, clear: {}",
            colour.len(),
            depth.is_some(),
            clear.is_some()
        );
        self.recording.pass = Some(OpenPass {
            compatible: compatible_pass(&desc),
            extent,
            samples,
            colour_targets: colour_handles,
        });
        self.recording.graphics_pipeline = None;
        self.state.consume_clear();
        Ok(())
    }

    /// Close the open pass, if any, and run the configured colour resolve.
    fn end_pass(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        let Some(pass) = self.recording.pass.take() else {
            return Ok(());
        };
        // SAFETY: a pass is open on this frame's command buffer.
        unsafe { self.context.command_buffer(frame).end_render_pass() };
        if let Some(resolve) = self.state.resolve_colour
            && pass.colour_targets.contains(&resolve)
        {
            self.record_resolve(frame, resolve)?;
        }
        Ok(())
    }

    fn record_resolve(
        &mut self,
        frame: ActiveFrame,
        handle: ResourceHandle,
    ) -> Result<(), RendererError> {
        let target = self.resources.render_target_mut(handle)?;
        let Some(resolve) = target.resolve.as_mut() else {
            return Err(RendererError::InvalidDescriptor(format!(
                "render target {handle} is not a multisampled colour target"
            )));
        };
        let region = resolve_region(target.image.extent(), target.image.desc().array_layers);
        let cmd = self.context.command_buffer(frame);
        // SAFETY: no pass is open; both layouts are tracked and the images
        // share extent, format and layer count.
        unsafe {
            target.image.record_transition(
                cmd,
                target.layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );
            resolve.image.record_transition(
                cmd,
                resolve.layout,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            cmd.resolve_image(
                target.image.raw_image(),
                resolve.image.raw_image(),
                std::slice::from_ref(&region),
            );
            resolve.image.record_transition(
                cmd,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
        target.layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        resolve.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        tracing::trace!("Resolved render target {handle}");
        Ok(())
    }

    /// Move sampled single-sample render targets into shader-read layout.
    /// Ends the open pass if a transition is needed.
    fn prepare_sampled_targets(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        let bound: Vec<ResourceHandle> = self
            .state
            .textures
            .iter()
            .flatten()
            .map(|binding| binding.texture)
            .collect();
        for handle in bound {
            let Resource::RenderTarget(target) = self.resources.get(handle)? else {
                continue;
            };
            if target.resolve.is_some()
                || target.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            {
                continue;
            }
            if self.state.is_target(handle) {
                return Err(RendererError::TargetMismatch(format!(
                    "render target {handle} is bound as both a texture and an attachment"
                )));
            }
            if self.recording.pass.is_some() {
                self.end_pass(frame)?;
            }
            self.move_target(frame, handle, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    fn sampled_view(&self, handle: ResourceHandle) -> Result<vk::ImageView, RendererError> {
        match self.resources.get(handle)? {
            Resource::Texture(texture) => Ok(texture.view.raw_image_view()),
            Resource::RenderTarget(target) => match (&target.resolve, &target.sampled_view) {
                (Some(resolve), _) => Ok(resolve.view.raw_image_view()),
                (None, Some(view)) => Ok(view.raw_image_view()),
                (None, None) => Err(RendererError::InvalidDescriptor(format!(
                    "depth-stencil target {handle} cannot be sampled"
                ))),
            },
            other => Err(RendererError::KindMismatch {
                handle,
                expected: ResourceKind::Texture,
                actual: other.kind(),
            }),
        }
    }

    /// Write descriptor sets for the bound buffers and textures when they
    /// changed, then bind them at `bind_point`.
    fn bind_descriptors(
        &mut self,
        frame: ActiveFrame,
        bind_point: vk::PipelineBindPoint,
    ) -> Result<(), RendererError> {
        let sets = match self.recording.descriptor_sets {
            Some(sets) if !self.state.descriptors_dirty => sets,
            _ => {
                let sets = self.write_descriptor_sets(frame)?;
                self.recording.descriptor_sets = Some(sets);
                self.state.descriptors_dirty = false;
                sets
            }
        };
        let layout = self.context.bindings.pipeline_layout.raw_handle();
        let cmd = self.context.command_buffer(frame);
        // SAFETY: every pipeline is built against the shared layout the sets
        // were allocated for.
        unsafe { cmd.bind_descriptor_sets(bind_point, layout, 0, &sets) };
        Ok(())
    }

    fn write_descriptor_sets(
        &mut self,
        frame: ActiveFrame,
    ) -> Result<[vk::DescriptorSet; 3], RendererError> {
        let allocated = self.context.allocate_descriptor_sets(
            frame,
            &[SET_CONSTANT_BUFFERS, SET_TEXTURES, SET_STRUCTURED_BUFFERS],
        )?;
        let Ok([constants, textures, structured]) = <[DescriptorSet; 3]>::try_from(allocated)
        else {
            return Err(RendererError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };

        let mut writes = DescriptorWrites::new();
        for (binding, handle) in self.state.constant_buffers.iter().enumerate() {
            let Some(handle) = *handle else { continue };
            let buffer = self.resources.buffer_mut(handle)?.bind_handle(frame.slot)?;
            writes.uniform_buffer(&constants, binding as u32, &buffer, 0, vk::WHOLE_SIZE);
        }
        for (binding, handle) in self.state.structured_buffers.iter().enumerate() {
            let Some(handle) = *handle else { continue };
            let buffer = self.resources.buffer_mut(handle)?.bind_handle(frame.slot)?;
            writes.storage_buffer(&structured, binding as u32, &buffer, 0, vk::WHOLE_SIZE);
        }
        for (binding, texture) in self.state.textures.iter().enumerate() {
            let Some(texture) = *texture else { continue };
            let view = self.sampled_view(texture.texture)?;
            let sampler = self.resources.sampler(texture.sampler)?.raw_sampler();
            writes.combined_image_sampler(
                &textures,
                binding as u32,
                view,
                sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
        // SAFETY: the sets were just allocated from this frame's pools, and
        // every referenced object lives in the pool or is retired no earlier
        // than this frame.
        unsafe { writes.apply(self.context.device()) };
        Ok([constants, textures, structured].map(|set| set.raw_descriptor_set()))
    }

    /// Resolve the bound shaders and fixed-function state into a pipeline
    /// for the open pass and bind it.
    fn bind_graphics_pipeline(
        &mut self,
        frame: ActiveFrame,
        topology: PrimitiveTopology,
    ) -> Result<(), RendererError> {
        let Some(pass) = self.recording.pass.as_ref() else {
            return Err(RendererError::TargetMismatch("no render pass is open".to_owned()));
        };

        let vertex_handle = self
            .state
            .vertex_shader
            .ok_or(RendererError::MissingShader(ShaderStage::Vertex))?;
        let vertex = self.resources.shader(vertex_handle)?;
        require_stage(vertex, vertex_handle, ShaderStage::Vertex)?;
        let fragment = match self.state.fragment_shader {
            Some(handle) => {
                let shader = self.resources.shader(handle)?;
                require_stage(shader, handle, ShaderStage::Fragment)?;
                Some(shader)
            }
            None => None,
        };
        let input = self
            .state
            .input_layout
            .map(|h| self.resources.input_layout(h))
            .transpose()?;
        let raster = self
            .state
            .rasterizer_state
            .map(|h| self.resources.rasterizer_state(h))
            .transpose()?;
        let blend = self
            .state
            .blend_state
            .map(|h| self.resources.blend_state(h))
            .transpose()?;
        let depth_stencil = self
            .state
            .depth_stencil_state
            .map(|h| self.resources.depth_stencil_state(h))
            .transpose()?;

        let key = GraphicsPipelineKey {
            vertex: vertex.id,
            fragment: fragment.map(|s| s.id),
            input_layout: input.map(|l| l.id),
            rasterizer: raster.map(|r| r.id),
            blend: blend.map(|b| b.id),
            depth_stencil: depth_stencil.map(|d| d.id),
            topology,
            pass: pass.compatible.clone(),
        };

        let device = Arc::clone(self.context.device());
        let render_pass = self.pipelines.render_pass(&device, &pass.compatible)?;
        let layout = Arc::clone(&self.context.bindings.pipeline_layout);
        let colour_count = pass.compatible.color.len();
        let name = self.context.debug_name("graphics pipeline");
        let samples = pass.samples;

        let pipeline = self.pipelines.graphics(key, || {
            let mut stages = vec![vertex
                .module
                .entry_point(&vertex.entry_point, ShaderStage::Vertex)?];
            if let Some(fragment) = fragment {
                stages.push(
                    fragment
                        .module
                        .entry_point(&fragment.entry_point, ShaderStage::Fragment)?,
                );
            }
            let desc = GraphicsPipelineDesc {
                stages: &stages,
                layout,
                render_pass: render_pass.raw_handle(),
                color_attachment_count: colour_count,
                samples,
                vertex_bindings: input.map_or(&[][..], |l| l.bindings.as_slice()),
                vertex_attributes: input.map_or(&[][..], |l| l.attributes.as_slice()),
                topology: topology.vk_topology(),
                raster: raster.map_or_else(|| RasterizerDesc::default().to_gpu(), |r| r.state),
                depth_stencil: depth_stencil
                    .map_or_else(|| DepthStencilDesc::default().to_gpu(), |d| d.state),
                blend: blend.map_or(&[][..], |b| b.attachments.as_slice()),
                alpha_to_coverage: blend.is_some_and(|b| b.alpha_to_coverage),
            };
            // SAFETY: the render pass is cached for the renderer's lifetime
            // and was described with this colour count and sample count.
            Ok(unsafe { GraphicsPipeline::new(&device, &desc, name) }?)
        })?;
        let raw = pipeline.raw_handle();

        if self.recording.graphics_pipeline != Some(raw) {
            let cmd = self.context.command_buffer(frame);
            // SAFETY: the pipeline is compatible with the open pass.
            unsafe { cmd.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, raw) };
            self.recording.graphics_pipeline = Some(raw);
        }
        Ok(())
    }

    fn bind_vertex_buffers(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        for (binding, vertex_buffer) in self.state.vertex_buffers.iter().enumerate() {
            let Some(vertex_buffer) = vertex_buffer else {
                continue;
            };
            let buffer = self
                .resources
                .buffer_mut(vertex_buffer.buffer)?
                .bind_handle(frame.slot)?;
            let cmd = self.context.command_buffer(frame);
            // SAFETY: the buffer was checked for vertex usage when bound.
            unsafe { cmd.bind_vertex_buffers(binding as u32, &[buffer], &[vertex_buffer.offset]) };
        }
        Ok(())
    }

    fn bind_index_buffer(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        let index = self
            .state
            .index_buffer
            .ok_or_else(|| RendererError::InvalidDescriptor("no index buffer bound".to_owned()))?;
        let buffer = self
            .resources
            .buffer_mut(index.buffer)?
            .bind_handle(frame.slot)?;
        let cmd = self.context.command_buffer(frame);
        // SAFETY: the buffer was checked for index usage when bound.
        unsafe { cmd.bind_index_buffer(buffer, index.offset, index.format.vk_index_type()) };
        Ok(())
    }

    /// Everything a draw needs: an open pass, a pipeline, buffers,
    /// descriptors and dynamic state. `None` while minimised or when no
    /// vertex shader is bound, in which case only the pass is recorded.
    fn prepare_draw(
        &mut self,
        operation: &'static str,
        topology: PrimitiveTopology,
        indexed: bool,
    ) -> Result<Option<ActiveFrame>, RendererError> {
        let Some(frame) = self.begin_recording(operation)? else {
            return Ok(None);
        };
        self.prepare_sampled_targets(frame)?;
        if self.recording.pass.is_none() || self.state.pass_dirty {
            self.begin_pass(frame)?;
        }
        if self.state.vertex_shader.is_none() {
            // The pass, and with it any requested clear, is still recorded.
            tracing::trace!("No vertex shader bound, {operation} records no primitives");
            return Ok(None);
        }
        self.bind_graphics_pipeline(frame, topology)?;
        self.bind_vertex_buffers(frame)?;
        if indexed {
            self.bind_index_buffer(frame)?;
        }
        self.bind_descriptors(frame, vk::PipelineBindPoint::GRAPHICS)?;

        let extent = self
            .recording
            .pass
            .as_ref()
            .map_or(self.context.swapchain().extent(), |p| p.extent);
        let (viewport, scissor) = dynamic_state(self.state.viewport, self.state.scissor, extent);
        let stencil_ref = self.state.stencil_ref;
        let cmd = self.context.command_buffer(frame);
        // SAFETY: every pipeline declares viewport, scissor and stencil
        // reference as dynamic.
        unsafe {
            cmd.set_viewport(&[viewport]);
            cmd.set_scissor(&[scissor]);
            cmd.set_stencil_reference(stencil_ref);
        }
        Ok(Some(frame))
    }

    // -----------------------------------------------------------------------
    // Draws and dispatches
    // -----------------------------------------------------------------------

    pub fn draw(
        &mut self,
        vertex_count: u32,
        start_vertex: u32,
        topology: PrimitiveTopology,
    ) -> Result<(), RendererError> {
        let Some(frame) = self.prepare_draw("draw", topology, false)? else {
            return Ok(());
        };
        // SAFETY: prepare_draw left a pass open with a pipeline and dynamic
        // state bound.
        unsafe {
            self.context
                .command_buffer(frame)
                .draw(vertex_count, 1, start_vertex, 0)
        };
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
        topology: PrimitiveTopology,
    ) -> Result<(), RendererError> {
        self.draw_indexed_instanced(index_count, 1, start_index, base_vertex, 0, topology)
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count_per_instance: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
        topology: PrimitiveTopology,
    ) -> Result<(), RendererError> {
        let Some(frame) = self.prepare_draw("draw indexed", topology, true)? else {
            return Ok(());
        };
        // SAFETY: prepare_draw left a pass open with a pipeline, index
        // buffer and dynamic state bound.
        unsafe {
            self.context.command_buffer(frame).draw_indexed(
                index_count_per_instance,
                instance_count,
                start_index,
                base_vertex,
                start_instance,
            )
        };
        Ok(())
    }

    /// Stream-out is not available in this backend.
    pub fn draw_auto(&mut self) -> Result<(), RendererError> {
        Err(RendererError::Unsupported("stream-out draws"))
    }

    /// Run the bound compute shader over `grid` threads in groups of
    /// `threads`. Ends any open render pass.
    pub fn dispatch_compute(
        &mut self,
        grid: [u32; 3],
        threads: [u32; 3],
    ) -> Result<(), RendererError> {
        let Some(frame) = self.begin_recording("dispatch")? else {
            return Ok(());
        };
        self.end_pass(frame)?;
        self.prepare_sampled_targets(frame)?;

        let handle = self
            .state
            .compute_shader
            .ok_or(RendererError::MissingShader(ShaderStage::Compute))?;
        let shader = self.resources.shader(handle)?;
        require_stage(shader, handle, ShaderStage::Compute)?;
        let device = Arc::clone(self.context.device());
        let layout = Arc::clone(&self.context.bindings.pipeline_layout);
        let name = self.context.debug_name("compute pipeline");
        let pipeline = self
            .pipelines
            .compute(shader.id, || {
                let entry = shader
                    .module
                    .entry_point(&shader.entry_point, ShaderStage::Compute)?;
                Ok(ComputePipeline::new(&device, &entry, &layout, name)?)
            })?
            .raw_handle();

        let cmd = self.context.command_buffer(frame);
        // SAFETY: recording outside a render pass.
        unsafe { cmd.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline) };
        self.bind_descriptors(frame, vk::PipelineBindPoint::COMPUTE)?;

        let groups = workgroup_count(grid, threads);
        let barrier = [vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)
            .src_access_mask(vk::AccessFlags2::SHADER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)];
        let cmd = self.context.command_buffer(frame);
        // SAFETY: a compute pipeline and its descriptor sets are bound and
        // no pass is open.
        unsafe {
            cmd.dispatch(groups);
            cmd.pipeline_barrier2(&vk::DependencyInfo::default().memory_barriers(&barrier));
        }
        tracing::trace!("Dispatched {groups:?} workgroups");
        Ok(())
    }

    /// Resolve an MSAA render target into its single-sample image now.
    pub fn resolve_target(&mut self, target: ResourceHandle) -> Result<(), RendererError> {
        if self.resources.render_target(target)?.resolve.is_none() {
            return Err(RendererError::InvalidDescriptor(format!(
                "render target {target} is not a multisampled colour target"
            )));
        }
        let Some(frame) = self.begin_recording("resolve a target")? else {
            return Ok(());
        };
        self.end_pass(frame)?;
        self.record_resolve(frame, target)
    }

    // -----------------------------------------------------------------------
    // Frame control
    // -----------------------------------------------------------------------

    /// Request a clear with `clear_state` for the next pass. `colour_face`
    /// and `depth_face` pick the array layer of cube or array targets.
    pub fn clear(
        &mut self,
        clear_state: ResourceHandle,
        colour_face: Option<u32>,
        depth_face: Option<u32>,
    ) -> Result<(), RendererError> {
        self.resources.clear_state(clear_state)?;
        self.state.set_clear(clear_state, colour_face, depth_face);
        Ok(())
    }

    pub fn push_perf_marker(&mut self, name: &str) -> Result<(), RendererError> {
        if !self.context.device().has_debug_utils() {
            return Ok(());
        }
        let label = CString::new(name)?;
        let Some(frame) = self.begin_recording("push a perf marker")? else {
            return Ok(());
        };
        // SAFETY: the frame's command buffer is recording.
        unsafe { self.context.command_buffer(frame).begin_label(&label) };
        self.recording.labels += 1;
        Ok(())
    }

    pub fn pop_perf_marker(&mut self) -> Result<(), RendererError> {
        if !self.context.device().has_debug_utils() {
            return Ok(());
        }
        let open = self.frame_state == FrameState::Recording && self.recording.labels > 0;
        let frame = match self.context.active_frame() {
            Some(frame) if open => frame,
            _ => {
                tracing::warn!("pop_perf_marker without a matching push in this frame");
                return Ok(());
            }
        };
        // SAFETY: a label region is open on this command buffer.
        unsafe { self.context.command_buffer(frame).end_label() };
        self.recording.labels -= 1;
        Ok(())
    }

    fn finish_recording(&mut self, frame: ActiveFrame) -> Result<(), RendererError> {
        let clear_pending = self.state.clear_requested
            && (!self.state.colour_targets.is_empty() || self.state.depth_target.is_some());
        if clear_pending {
            self.begin_pass(frame)?;
        }
        self.end_pass(frame)?;

        let labels = std::mem::take(&mut self.recording.labels);
        let image = self.context.backbuffer_image(frame);
        let old = self.recording.backbuffer_layout;
        let cmd = self.context.command_buffer(frame);
        // SAFETY: no pass is open; open label regions are closed before the
        // buffer ends and the image layout is tracked.
        unsafe {
            for _ in 0..labels {
                cmd.end_label();
            }
            transition_backbuffer(cmd, image, old, vk::ImageLayout::PRESENT_SRC_KHR);
            cmd.end()?;
        }
        self.recording.backbuffer_layout = vk::ImageLayout::PRESENT_SRC_KHR;
        Ok(())
    }

    /// Finish the frame and present it.
    ///
    /// A frame that failed to submit stays ended; calling `present` again
    /// retries the submission.
    pub fn present(&mut self) -> Result<(), RendererError> {
        let _span = tracing::trace_span!("present").entered();
        if !self.frame_state.awaiting_submit() {
            let Some(frame) = self.begin_recording("present")? else {
                return Ok(());
            };
            self.finish_recording(frame)?;
            self.frame_state = FrameState::Ended;
        }

        let frame = self
            .context
            .active_frame()
            .ok_or(RendererError::InvalidFrameState {
                operation: "present",
                state: self.frame_state,
            })?;
        let result = self.context.submit_and_present(frame);
        self.frame_state = FrameState::after_submit(self.context.active_frame().is_some());
        if self.frame_state == FrameState::Idle {
            self.recording = RecordingState::default();
            self.collect_garbage();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 640,
        height: 480,
    };

    #[test]
    fn dynamic_state_defaults_to_the_whole_target() {
        let (viewport, scissor) = dynamic_state(None, None, EXTENT);
        assert_eq!((viewport.width, viewport.height), (640.0, 480.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
        assert_eq!((scissor.extent.width, scissor.extent.height), (640, 480));
    }

    #[test]
    fn dynamic_state_keeps_explicit_values() {
        let (viewport, scissor) = dynamic_state(
            Some(Viewport {
                x: 10.0,
                y: 20.0,
                width: 100.0,
                height: 50.0,
                min_depth: 0.0,
                max_depth: 0.5,
            }),
            Some(Rect {
                left: 5.0,
                top: 6.0,
                right: 105.0,
                bottom: 56.0,
            }),
            EXTENT,
        );
        assert_eq!((viewport.x, viewport.y, viewport.max_depth), (10.0, 20.0, 0.5));
        assert_eq!((scissor.offset.x, scissor.offset.y), (5, 6));
        assert_eq!((scissor.extent.width, scissor.extent.height), (100, 50));
    }

    #[test]
    fn resolve_covers_every_layer() {
        let region = resolve_region(EXTENT, 6);
        assert_eq!(region.src_subresource.layer_count, 6);
        assert_eq!(region.dst_subresource.layer_count, 6);
        assert_eq!(region.src_subresource.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!((region.extent.width, region.extent.height, region.extent.depth), (640, 480, 1));
    }

    #[test]
    fn fresh_recording_state() {
        let state = RecordingState::default();
        assert!(state.pass.is_none());
        assert_eq!(state.backbuffer_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(state.labels, 0);
        assert!(state.descriptor_sets.is_none());
    }
}
