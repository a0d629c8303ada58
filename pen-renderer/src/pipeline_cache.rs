//! Pipelines and render passes keyed by the state that shaped them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use pen_gpu::ash::vk;
use pen_gpu::device::Device;
use pen_gpu::pipeline::{ComputePipeline, GraphicsPipeline};
use pen_gpu::render_pass::{RenderPass, RenderPassDesc};

use crate::desc::PrimitiveTopology;
use crate::error::RendererError;
use crate::resource::ObjectId;

/// Everything a graphics pipeline is built from. Load ops are erased from
/// `pass` since they do not affect render pass compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GraphicsPipelineKey {
    pub vertex: ObjectId,
    pub fragment: Option<ObjectId>,
    pub input_layout: Option<ObjectId>,
    pub rasterizer: Option<ObjectId>,
    pub blend: Option<ObjectId>,
    pub depth_stencil: Option<ObjectId>,
    pub topology: PrimitiveTopology,
    pub pass: RenderPassDesc,
}

impl GraphicsPipelineKey {
    fn uses(&self, id: ObjectId) -> bool {
        self.vertex == id
            || [
                self.fragment,
                self.input_layout,
                self.rasterizer,
                self.blend,
                self.depth_stencil,
            ]
            .contains(&Some(id))
    }
}

/// `desc` with every load op set to `LOAD`, the form pipelines are built
/// against.
pub(crate) fn compatible_pass(desc: &RenderPassDesc) -> RenderPassDesc {
    let erase = |mut a: pen_gpu::render_pass::AttachmentDesc| {
        a.load_op = vk::AttachmentLoadOp::LOAD;
        a.stencil_load_op = vk::AttachmentLoadOp::LOAD;
        a
    };
    RenderPassDesc {
        color: desc.color.iter().copied().map(erase).collect(),
        depth: desc.depth.map(erase),
    }
}

fn get_or_try_insert<'a, K, V, E>(
    map: &'a mut HashMap<K, V>,
    key: K,
    build: impl FnOnce() -> Result<V, E>,
) -> Result<&'a V, E>
where
    K: Eq + Hash,
{
    use std::collections::hash_map::Entry;
    match map.entry(key) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => Ok(entry.insert(build()?)),
    }
}

#[derive(Default)]
pub(crate) struct PipelineCache {
    render_passes: HashMap<RenderPassDesc, Arc<RenderPass>>,
    graphics: HashMap<GraphicsPipelineKey, GraphicsPipeline>,
    compute: HashMap<ObjectId, ComputePipeline>,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("render_passes", &self.render_passes.len())
            .field("graphics", &self.graphics.len())
            .field("compute", &self.compute.len())
            .finish()
    }
}

impl PipelineCache {
    pub fn render_pass(
        &mut self,
        device: &Arc<Device>,
        desc: &RenderPassDesc,
    ) -> Result<Arc<RenderPass>, RendererError> {
        if let Some(pass) = self.render_passes.get(desc) {
            return Ok(Arc::clone(pass));
        }
        tracing::debug!(
            "Creating render pass with {} colour attachments, depth: {}",
            desc.color.len(),
            desc.depth.is_some()
        );
        let pass = Arc::new(RenderPass::new(device, desc, Some("cached render pass"))?);
        self.render_passes.insert(desc.clone(), Arc::clone(&pass));
        Ok(pass)
    }

    pub fn graphics(
        &mut self,
        key: GraphicsPipelineKey,
        build: impl FnOnce() -> Result<GraphicsPipeline, RendererError>,
    ) -> Result<&GraphicsPipeline, RendererError> {
        get_or_try_insert(&mut self.graphics, key, || {
            tracing::debug!("Pipeline cache miss, building graphics pipeline");
            build()
        })
    }

    pub fn compute(
        &mut self,
        shader: ObjectId,
        build: impl FnOnce() -> Result<ComputePipeline, RendererError>,
    ) -> Result<&ComputePipeline, RendererError> {
        get_or_try_insert(&mut self.compute, shader, || {
            tracing::debug!("Pipeline cache miss, building compute pipeline");
            build()
        })
    }

    /// Remove every pipeline built from object `id`. The caller keeps them
    /// alive until in-flight frames are done with them.
    pub fn evict(&mut self, id: ObjectId) -> (Vec<GraphicsPipeline>, Option<ComputePipeline>) {
        let stale: Vec<_> = self
            .graphics
            .keys()
            .filter(|k| k.uses(id))
            .cloned()
            .collect();
        let graphics = stale
            .iter()
            .filter_map(|k| self.graphics.remove(k))
            .collect();
        (graphics, self.compute.remove(&id))
    }

    pub fn len(&self) -> usize {
        self.graphics.len() + self.compute.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    use pen_gpu::render_pass::AttachmentDesc;

    fn attachment(load_op: vk::AttachmentLoadOp) -> AttachmentDesc {
        AttachmentDesc {
            format: vk::Format::B8G8R8A8_UNORM,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        }
    }

    fn key(pass: RenderPassDesc) -> GraphicsPipelineKey {
        GraphicsPipelineKey {
            vertex: 1,
            fragment: Some(2),
            input_layout: None,
            rasterizer: None,
            blend: Some(3),
            depth_stencil: None,
            topology: PrimitiveTopology::TriangleList,
            pass,
        }
    }

    fn hash_of(key: &GraphicsPipelineKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn load_ops_do_not_split_pipelines() {
        let clearing = RenderPassDesc {
            color: vec![attachment(vk::AttachmentLoadOp::CLEAR)],
            depth: None,
        };
        let loading = RenderPassDesc {
            color: vec![attachment(vk::AttachmentLoadOp::LOAD)],
            depth: None,
        };
        let a = key(compatible_pass(&clearing));
        let b = key(compatible_pass(&loading));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn state_changes_split_pipelines() {
        let pass = compatible_pass(&RenderPassDesc {
            color: vec![attachment(vk::AttachmentLoadOp::LOAD)],
            depth: None,
        });
        let base = key(pass.clone());
        let strip = GraphicsPipelineKey {
            topology: PrimitiveTopology::TriangleStrip,
            ..base.clone()
        };
        let other_blend = GraphicsPipelineKey {
            blend: Some(4),
            ..base.clone()
        };
        let two_targets = key(RenderPassDesc {
            color: vec![pass.color[0]; 2],
            depth: None,
        });
        assert_ne!(base, strip);
        assert_ne!(base, other_blend);
        assert_ne!(base, two_targets);
    }

    #[test]
    fn key_knows_its_objects() {
        let k = key(RenderPassDesc::default());
        assert!(k.uses(1));
        assert!(k.uses(3));
        assert!(!k.uses(4));
    }

    #[test]
    fn builds_once_per_key() {
        let builds = RefCell::new(0);
        let mut map: HashMap<u32, u32> = HashMap::new();
        for _ in 0..3 {
            let value = get_or_try_insert(&mut map, 7, || {
                *builds.borrow_mut() += 1;
                Ok::<_, ()>(70)
            })
            .unwrap();
            assert_eq!(*value, 70);
        }
        assert_eq!(*builds.borrow(), 1);
    }

    #[test]
    fn failed_build_is_not_cached() {
        let mut map: HashMap<u32, u32> = HashMap::new();
        assert!(get_or_try_insert(&mut map, 1, || Err("boom")).is_err());
        assert!(map.is_empty());
        assert_eq!(*get_or_try_insert(&mut map, 1, || Ok::<_, ()>(5)).unwrap(), 5);
    }
}
