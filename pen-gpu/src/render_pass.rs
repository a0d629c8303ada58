//! Single-subpass render passes ([`RenderPass`]) and their
//! [`Framebuffer`]s.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateRenderPassError {
    #[error("{0} colour attachments requested, at most {max} are supported", max = MAX_COLOR_ATTACHMENTS)]
    TooManyColorAttachments(usize),

    #[error("Render pass has no attachments")]
    NoAttachments,

    #[error("Vulkan error creating render pass: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateFramebufferError {
    #[error("Framebuffer has {actual} views, render pass expects {expected}")]
    AttachmentCountMismatch { expected: usize, actual: usize },

    #[error("Vulkan error creating framebuffer: {0}")]
    Vulkan(vk::Result),
}

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// One attachment of a render pass. The same layout is used on entry and
/// exit; transitions around the pass are recorded by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    pub color: Vec<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
}

struct SubpassLayout {
    attachments: Vec<vk::AttachmentDescription>,
    color_refs: Vec<vk::AttachmentReference>,
    depth_ref: Option<vk::AttachmentReference>,
}

/// Attachment `i` is colour target `i` in bound order; depth comes last.
fn subpass_layout(desc: &RenderPassDesc) -> SubpassLayout {
    let color_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    let depth_layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;

    let mut attachments: Vec<vk::AttachmentDescription> = desc
        .color
        .iter()
        .map(|a| {
            vk::AttachmentDescription::default()
                .format(a.format)
                .samples(a.samples)
                .load_op(a.load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(color_layout)
                .final_layout(color_layout)
        })
        .collect();
    let color_refs = (0..desc.color.len() as u32)
        .map(|attachment| vk::AttachmentReference {
            attachment,
            layout: color_layout,
        })
        .collect();

    let depth_ref = desc.depth.map(|d| {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(d.format)
                .samples(d.samples)
                .load_op(d.load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(d.stencil_load_op)
                .stencil_store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(depth_layout)
                .final_layout(depth_layout),
        );
        vk::AttachmentReference {
            attachment: desc.color.len() as u32,
            layout: depth_layout,
        }
    });

    SubpassLayout {
        attachments,
        color_refs,
        depth_ref,
    }
}

pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
    attachment_count: usize,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("attachment_count", &self.attachment_count)
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    pub fn new(
        device: &Arc<Device>,
        desc: &RenderPassDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateRenderPassError> {
        if desc.color.len() > MAX_COLOR_ATTACHMENTS {
            return Err(CreateRenderPassError::TooManyColorAttachments(
                desc.color.len(),
            ));
        }
        if desc.color.is_empty() && desc.depth.is_none() {
            return Err(CreateRenderPassError::NoAttachments);
        }

        let layout = subpass_layout(desc);
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&layout.color_refs);
        if let Some(depth_ref) = layout.depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let attachment_access = vk::AccessFlags::COLOR_ATTACHMENT_READ
            | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(attachment_stages)
                .src_access_mask(attachment_access)
                .dst_access_mask(attachment_access),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(
                    vk::PipelineStageFlags::FRAGMENT_SHADER
                        | vk::PipelineStageFlags::TRANSFER,
                )
                .src_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .dst_access_mask(
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ,
                ),
        ];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&layout.attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);

        // SAFETY: create_info only points at locals that outlive the call.
        let handle = unsafe { device.create_raw_render_pass(&create_info) }
            .map_err(CreateRenderPassError::Vulkan)?;

        // SAFETY: handle was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name render pass {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            attachment_count: layout.attachments.len(),
        })
    }

    pub fn raw_handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn attachment_count(&self) -> usize {
        self.attachment_count
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        // SAFETY: framebuffers hold an Arc to their render pass and owners
        // wait for the GPU before dropping.
        unsafe { self.parent.destroy_raw_render_pass(self.handle) };
    }
}

pub struct Framebuffer {
    parent: Arc<Device>,
    _render_pass: Arc<RenderPass>,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// # Safety
    /// `views` must be live image views of `render_pass`'s device, ordered
    /// like its attachments, and must outlive the framebuffer.
    pub unsafe fn new(
        render_pass: &Arc<RenderPass>,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        name: Option<&str>,
    ) -> Result<Self, CreateFramebufferError> {
        if views.len() != render_pass.attachment_count {
            return Err(CreateFramebufferError::AttachmentCountMismatch {
                expected: render_pass.attachment_count,
                actual: views.len(),
            });
        }
        let device = &render_pass.parent;
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        // SAFETY: caller guarantees view validity and ordering.
        let handle = unsafe { device.create_raw_framebuffer(&create_info) }
            .map_err(CreateFramebufferError::Vulkan)?;

        // SAFETY: handle was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name framebuffer {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            _render_pass: Arc::clone(render_pass),
            handle,
            extent,
        })
    }

    pub fn raw_handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping framebuffer {:?}", self.handle);
        // SAFETY: handle was created from parent; owners wait for the GPU
        // before dropping.
        unsafe { self.parent.destroy_raw_framebuffer(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(load_op: vk::AttachmentLoadOp) -> AttachmentDesc {
        AttachmentDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        }
    }

    #[test]
    fn colour_attachments_keep_bound_order() {
        let mut first = color(vk::AttachmentLoadOp::CLEAR);
        first.format = vk::Format::R16G16B16A16_SFLOAT;
        let desc = RenderPassDesc {
            color: vec![first, color(vk::AttachmentLoadOp::LOAD)],
            depth: None,
        };
        let layout = subpass_layout(&desc);

        assert_eq!(layout.attachments.len(), 2);
        assert_eq!(layout.attachments[0].format, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(layout.attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(layout.attachments[1].load_op, vk::AttachmentLoadOp::LOAD);
        let indices: Vec<u32> =
            layout.color_refs.iter().map(|r| r.attachment).collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(layout.depth_ref.is_none());
        assert!(layout.attachments.iter().all(|a| {
            a.store_op == vk::AttachmentStoreOp::STORE
                && a.initial_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        }));
    }

    #[test]
    fn depth_attachment_follows_colour() {
        let desc = RenderPassDesc {
            color: vec![color(vk::AttachmentLoadOp::LOAD)],
            depth: Some(AttachmentDesc {
                format: vk::Format::D24_UNORM_S8_UINT,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                stencil_load_op: vk::AttachmentLoadOp::LOAD,
            }),
        };
        let layout = subpass_layout(&desc);

        let depth_ref = layout.depth_ref.expect("depth reference");
        assert_eq!(depth_ref.attachment, 1);
        assert_eq!(
            depth_ref.layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(layout.attachments[1].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(
            layout.attachments[1].stencil_load_op,
            vk::AttachmentLoadOp::LOAD
        );
    }

    #[test]
    fn depth_only_pass_has_no_colour_refs() {
        let desc = RenderPassDesc {
            color: Vec::new(),
            depth: Some(AttachmentDesc {
                format: vk::Format::D32_SFLOAT,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            }),
        };
        let layout = subpass_layout(&desc);
        assert!(layout.color_refs.is_empty());
        assert_eq!(layout.depth_ref.map(|r| r.attachment), Some(0));
    }
}
