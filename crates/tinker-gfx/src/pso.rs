//! Pipeline state object permutation cache.
//!
//! Every graphics shader owns a `blend × depth` table of pipelines sharing
//! one pipeline layout. The shader's recipe (bytecode, attachment formats,
//! set layouts) is kept after the table is torn down, so a later request
//! rebuilds the permutation on demand.

use crate::backend::{
    DescriptorSetLayoutId, GraphicsBackend, GraphicsPipelineDesc, PipelineId, PipelineLayoutId,
    ShaderStages,
};
use crate::descriptor::DescriptorSystem;
use crate::error::{fatal, Result};
use hashbrown::HashMap;
use tinker_core::limits::{MAX_DESCRIPTOR_SETS_PER_SHADER, MIN_PUSH_CONSTANTS_SIZE};
use tinker_core::{BlendState, DepthState, DescriptorLayoutId, ImageFormat, ShaderId};
use tracing::{debug, info};

/// Everything needed to build a graphics shader's permutations.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineInfo<'a> {
    pub vertex_code: &'a [u32],
    pub fragment_code: &'a [u32],
    /// May contain [`ImageFormat::SwapChainFormat`].
    pub color_formats: &'a [ImageFormat],
    /// [`ImageFormat::Invalid`] for no depth attachment.
    pub depth_format: ImageFormat,
    pub descriptor_layouts: &'a [DescriptorLayoutId],
    /// Permutations the caller never uses.
    pub skip: &'a [(BlendState, DepthState)],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PsoCell {
    Uncompiled,
    Compiled(PipelineId),
    Incompatible,
}

struct GraphicsRecipe {
    vertex_code: Vec<u32>,
    fragment_code: Vec<u32>,
    color_formats: Vec<ImageFormat>,
    depth_format: ImageFormat,
    set_layouts: Vec<DescriptorSetLayoutId>,
}

struct GraphicsShader {
    recipe: GraphicsRecipe,
    layout: Option<PipelineLayoutId>,
    cells: [[PsoCell; DepthState::COUNT]; BlendState::COUNT],
}

struct ComputeShader {
    code: Vec<u32>,
    set_layouts: Vec<DescriptorSetLayoutId>,
    compiled: Option<(PipelineId, PipelineLayoutId)>,
}

const GRAPHICS_PUSH_STAGES: ShaderStages = ShaderStages::VERTEX.union(ShaderStages::FRAGMENT);

pub struct PsoCache {
    graphics: HashMap<ShaderId, GraphicsShader>,
    compute: HashMap<ShaderId, ComputeShader>,
    swap_chain_format: ImageFormat,
}

impl Default for PsoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PsoCache {
    pub fn new() -> Self {
        Self {
            graphics: HashMap::new(),
            compute: HashMap::new(),
            swap_chain_format: ImageFormat::Bgra8Srgb,
        }
    }

    /// Format substituted for [`ImageFormat::SwapChainFormat`] at compile
    /// time. Existing pipelines are not rebuilt.
    pub fn set_swap_chain_format(&mut self, format: ImageFormat) {
        self.swap_chain_format = format;
    }

    pub fn swap_chain_format(&self) -> ImageFormat {
        self.swap_chain_format
    }

    /// Build the layout and every compatible permutation of `shader`.
    /// Creating a shader whose table is still compiled is fatal.
    pub fn create_graphics_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        descriptors: &DescriptorSystem,
        shader: ShaderId,
        info: &GraphicsPipelineInfo<'_>,
    ) -> Result<()> {
        if self.graphics.get(&shader).is_some_and(|s| s.layout.is_some()) {
            fatal(format!("graphics pipeline {shader} is already compiled"));
        }
        let empty_colors = info.color_formats.is_empty();
        let mut cells = [[PsoCell::Uncompiled; DepthState::COUNT]; BlendState::COUNT];
        for blend in BlendState::ALL {
            for depth in DepthState::ALL {
                let no_color = blend == BlendState::NoColorAttachment;
                if no_color != empty_colors || info.skip.contains(&(blend, depth)) {
                    cells[blend.index()][depth.index()] = PsoCell::Incompatible;
                }
            }
        }
        let entry = GraphicsShader {
            recipe: GraphicsRecipe {
                vertex_code: info.vertex_code.to_vec(),
                fragment_code: info.fragment_code.to_vec(),
                color_formats: info.color_formats.to_vec(),
                depth_format: info.depth_format,
                set_layouts: resolve_set_layouts(descriptors, info.descriptor_layouts),
            },
            layout: None,
            cells,
        };
        self.graphics.insert(shader, entry);

        let mut compiled = 0;
        for blend in BlendState::ALL {
            for depth in DepthState::ALL {
                if self.cell(shader, blend, depth) == PsoCell::Uncompiled {
                    self.graphics_pipeline(backend, shader, blend, depth)?;
                    compiled += 1;
                }
            }
        }
        debug!("Compiled {compiled} permutations of graphics shader {shader}");
        Ok(())
    }

    /// The pipeline for a permutation, compiling it if it was torn down.
    /// Unknown shaders and incompatible permutations are fatal.
    pub fn graphics_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shader: ShaderId,
        blend: BlendState,
        depth: DepthState,
    ) -> Result<PipelineId> {
        let layout = self.graphics_layout(backend, shader)?;
        let swap_chain_format = self.swap_chain_format;
        let entry = self.graphics_entry_mut(shader);
        match entry.cells[blend.index()][depth.index()] {
            PsoCell::Compiled(pipeline) => Ok(pipeline),
            PsoCell::Incompatible => fatal(format!(
                "permutation ({blend:?}, {depth:?}) of shader {shader} is incompatible"
            )),
            PsoCell::Uncompiled => {
                let color_formats: Vec<ImageFormat> = entry
                    .recipe
                    .color_formats
                    .iter()
                    .map(|format| match format {
                        ImageFormat::SwapChainFormat => swap_chain_format,
                        other => *other,
                    })
                    .collect();
                let pipeline = backend.create_graphics_pipeline(&GraphicsPipelineDesc {
                    layout,
                    vertex_code: &entry.recipe.vertex_code,
                    fragment_code: &entry.recipe.fragment_code,
                    blend,
                    depth,
                    color_formats: &color_formats,
                    depth_format: entry.recipe.depth_format,
                })?;
                entry.cells[blend.index()][depth.index()] = PsoCell::Compiled(pipeline);
                Ok(pipeline)
            }
        }
    }

    /// The shared pipeline layout of `shader`, rebuilt if torn down.
    pub fn graphics_layout(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shader: ShaderId,
    ) -> Result<PipelineLayoutId> {
        let entry = self.graphics_entry_mut(shader);
        if let Some(layout) = entry.layout {
            return Ok(layout);
        }
        let layout = backend.create_pipeline_layout(
            &entry.recipe.set_layouts,
            MIN_PUSH_CONSTANTS_SIZE,
            GRAPHICS_PUSH_STAGES,
        )?;
        entry.layout = Some(layout);
        Ok(layout)
    }

    pub fn is_compiled(&self, shader: ShaderId, blend: BlendState, depth: DepthState) -> bool {
        matches!(self.cell(shader, blend, depth), PsoCell::Compiled(_))
    }

    /// Wait idle and forget `shader` entirely.
    pub fn destroy_graphics_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shader: ShaderId,
    ) -> Result<()> {
        backend.wait_idle()?;
        let Some(mut entry) = self.graphics.remove(&shader) else {
            fatal(format!("destroy of unknown graphics pipeline {shader}"));
        };
        release_graphics(backend, &mut entry);
        Ok(())
    }

    pub fn create_compute_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        descriptors: &DescriptorSystem,
        shader: ShaderId,
        code: &[u32],
        descriptor_layouts: &[DescriptorLayoutId],
    ) -> Result<()> {
        if self
            .compute
            .get(&shader)
            .is_some_and(|s| s.compiled.is_some())
        {
            fatal(format!("compute pipeline {shader} is already compiled"));
        }
        self.compute.insert(
            shader,
            ComputeShader {
                code: code.to_vec(),
                set_layouts: resolve_set_layouts(descriptors, descriptor_layouts),
                compiled: None,
            },
        );
        self.compute_pipeline(backend, shader)?;
        Ok(())
    }

    /// Pipeline and layout of a compute shader, rebuilt if torn down.
    pub fn compute_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shader: ShaderId,
    ) -> Result<(PipelineId, PipelineLayoutId)> {
        let Some(entry) = self.compute.get_mut(&shader) else {
            fatal(format!("no compute pipeline for shader {shader}"));
        };
        if let Some(compiled) = entry.compiled {
            return Ok(compiled);
        }
        let layout = backend.create_pipeline_layout(
            &entry.set_layouts,
            MIN_PUSH_CONSTANTS_SIZE,
            ShaderStages::COMPUTE,
        )?;
        let pipeline = match backend.create_compute_pipeline(layout, &entry.code) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                backend.destroy_pipeline_layout(layout);
                return Err(err);
            }
        };
        entry.compiled = Some((pipeline, layout));
        Ok((pipeline, layout))
    }

    pub fn destroy_compute_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shader: ShaderId,
    ) -> Result<()> {
        backend.wait_idle()?;
        let Some(mut entry) = self.compute.remove(&shader) else {
            fatal(format!("destroy of unknown compute pipeline {shader}"));
        };
        release_compute(backend, &mut entry);
        Ok(())
    }

    /// Tear down every compiled object. Recipes are kept, so the next
    /// request for a permutation rebuilds it.
    pub fn destroy_all_pso_perms(&mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        backend.wait_idle()?;
        for entry in self.graphics.values_mut() {
            release_graphics(backend, entry);
        }
        for entry in self.compute.values_mut() {
            release_compute(backend, entry);
        }
        info!(
            "Destroyed all PSO permutations ({} graphics, {} compute shaders)",
            self.graphics.len(),
            self.compute.len()
        );
        Ok(())
    }

    /// Release everything, recipes included.
    pub fn destroy(mut self, backend: &mut dyn GraphicsBackend) -> Result<()> {
        self.destroy_all_pso_perms(backend)?;
        self.graphics.clear();
        self.compute.clear();
        Ok(())
    }

    fn cell(&self, shader: ShaderId, blend: BlendState, depth: DepthState) -> PsoCell {
        self.graphics
            .get(&shader)
            .map_or(PsoCell::Uncompiled, |entry| {
                entry.cells[blend.index()][depth.index()]
            })
    }

    #[track_caller]
    fn graphics_entry_mut(&mut self, shader: ShaderId) -> &mut GraphicsShader {
        match self.graphics.get_mut(&shader) {
            Some(entry) => entry,
            None => fatal(format!("no graphics pipeline for shader {shader}")),
        }
    }
}

fn resolve_set_layouts(
    descriptors: &DescriptorSystem,
    layouts: &[DescriptorLayoutId],
) -> Vec<DescriptorSetLayoutId> {
    if layouts.len() > MAX_DESCRIPTOR_SETS_PER_SHADER {
        fatal(format!(
            "{} descriptor layouts exceed the per-shader limit of {MAX_DESCRIPTOR_SETS_PER_SHADER}",
            layouts.len()
        ));
    }
    layouts.iter().map(|id| descriptors.set_layout(*id)).collect()
}

fn release_graphics(backend: &mut dyn GraphicsBackend, entry: &mut GraphicsShader) {
    for cell in entry.cells.iter_mut().flatten() {
        if let PsoCell::Compiled(pipeline) = *cell {
            backend.destroy_pipeline(pipeline);
            *cell = PsoCell::Uncompiled;
        }
    }
    if let Some(layout) = entry.layout.take() {
        backend.destroy_pipeline_layout(layout);
    }
}

fn release_compute(backend: &mut dyn GraphicsBackend, entry: &mut ComputeShader) {
    if let Some((pipeline, layout)) = entry.compiled.take() {
        backend.destroy_pipeline(pipeline);
        backend.destroy_pipeline_layout(layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null::{NullBackend, NullControl};
    use crate::descriptor::{DescriptorLayout, LayoutBinding};
    use tinker_core::DescriptorType;

    const CODE: &[u32] = &[0x0723_0203, 0, 0, 0];
    const COLOR: &[ImageFormat] = &[ImageFormat::SwapChainFormat];

    fn setup() -> (NullBackend, NullControl, DescriptorSystem, PsoCache) {
        let mut backend = NullBackend::new();
        let control = backend.control();
        let mut descriptors = DescriptorSystem::new(&mut backend).unwrap();
        descriptors
            .create_layout(
                &mut backend,
                0,
                &DescriptorLayout::new(&[LayoutBinding::new(DescriptorType::Buffer)]),
            )
            .unwrap();
        (backend, control, descriptors, PsoCache::new())
    }

    fn info<'a>(
        colors: &'a [ImageFormat],
        skip: &'a [(BlendState, DepthState)],
    ) -> GraphicsPipelineInfo<'a> {
        GraphicsPipelineInfo {
            vertex_code: CODE,
            fragment_code: CODE,
            color_formats: colors,
            depth_format: ImageFormat::Depth32F,
            descriptor_layouts: &[0],
            skip,
        }
    }

    #[test]
    fn color_targets_compile_every_blending_permutation() {
        let (mut backend, control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        assert_eq!(control.live_pipelines(), 2 * DepthState::COUNT);
        assert!(!pso.is_compiled(1, BlendState::NoColorAttachment, DepthState::OffCcw));
    }

    #[test]
    fn depth_only_compiles_no_color_permutations() {
        let (mut backend, control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(&[], &[]))
            .unwrap();
        assert_eq!(control.live_pipelines(), DepthState::COUNT);
        assert!(pso.is_compiled(1, BlendState::NoColorAttachment, DepthState::TestOnWriteOnCcw));
    }

    #[test]
    fn skipped_permutations_are_not_built() {
        let (mut backend, control, descriptors, mut pso) = setup();
        let skip = [(BlendState::AlphaBlend, DepthState::OffNoCull)];
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &skip))
            .unwrap();
        assert_eq!(control.live_pipelines(), 2 * DepthState::COUNT - 1);
        assert!(!pso.is_compiled(1, BlendState::AlphaBlend, DepthState::OffNoCull));
    }

    #[test]
    fn repeated_requests_return_the_same_pipeline() {
        let (mut backend, _control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        let a = pso
            .graphics_pipeline(&mut backend, 1, BlendState::Replace, DepthState::OffCcw)
            .unwrap();
        let b = pso
            .graphics_pipeline(&mut backend, 1, BlendState::Replace, DepthState::OffCcw)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn destroy_all_rebuilds_fresh() {
        let (mut backend, control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        pso.create_compute_pipeline(&mut backend, &descriptors, 7, CODE, &[0])
            .unwrap();
        let before = pso
            .graphics_pipeline(&mut backend, 1, BlendState::Replace, DepthState::OffCcw)
            .unwrap();

        pso.destroy_all_pso_perms(&mut backend).unwrap();
        assert_eq!(control.live_pipelines(), 0);
        assert!(!pso.is_compiled(1, BlendState::Replace, DepthState::OffCcw));

        let after = pso
            .graphics_pipeline(&mut backend, 1, BlendState::Replace, DepthState::OffCcw)
            .unwrap();
        assert_ne!(before, after);
        assert_eq!(control.live_pipelines(), 1);
        pso.compute_pipeline(&mut backend, 7).unwrap();
        assert_eq!(control.live_pipelines(), 2);
    }

    #[test]
    #[should_panic(expected = "already compiled")]
    fn compiling_twice_is_fatal() {
        let (mut backend, _control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
    }

    #[test]
    fn recreate_after_destroy_is_allowed() {
        let (mut backend, control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        pso.destroy_graphics_pipeline(&mut backend, 1).unwrap();
        assert_eq!(control.live_pipelines(), 0);
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        assert_eq!(control.live_pipelines(), 2 * DepthState::COUNT);
    }

    #[test]
    #[should_panic(expected = "is incompatible")]
    fn incompatible_permutation_is_fatal() {
        let (mut backend, _control, descriptors, mut pso) = setup();
        pso.create_graphics_pipeline(&mut backend, &descriptors, 1, &info(COLOR, &[]))
            .unwrap();
        let _ = pso.graphics_pipeline(
            &mut backend,
            1,
            BlendState::NoColorAttachment,
            DepthState::OffCcw,
        );
    }
}
