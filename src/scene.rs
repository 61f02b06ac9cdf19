use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::{
    allocator::{Allocator, TransferToken, UniformSlice},
    buffer::Buffer,
    descriptors::{write_descriptor_set, DescriptorResource, Technique},
    error::{RenderError, RenderResult},
    image::{AttachmentState, Image, ImageDesc, SamplerKind},
    render_targets::{RenderTargets, BLANK},
    Context,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub colour: [f32; 4],
}

impl Vertex {
    pub fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        vec![
            attribute(
                0,
                vk::Format::R32G32B32_SFLOAT,
                bytemuck::offset_of!(Vertex, position),
            ),
            attribute(1, vk::Format::R32G32_SFLOAT, bytemuck::offset_of!(Vertex, uv)),
            attribute(
                2,
                vk::Format::R32G32B32_SFLOAT,
                bytemuck::offset_of!(Vertex, normal),
            ),
            attribute(
                3,
                vk::Format::R32G32B32A32_SFLOAT,
                bytemuck::offset_of!(Vertex, tangent),
            ),
            attribute(
                4,
                vk::Format::R32G32B32A32_SFLOAT,
                bytemuck::offset_of!(Vertex, colour),
            ),
        ]
    }
}

/// A decoded RGBA8 texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// A range of the owning model's indices drawn with one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    /// Relative to the model's first index.
    pub first_index: u32,
    pub index_count: u32,
    pub render: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub name: String,
    pub transform: Mat4,
    pub base_colour_factor: Vec4,
    pub base_colour: Option<TextureData>,
    pub primitives: Vec<Primitive>,
}

/// A model as handed over by the loader. Indices are relative to the model's own first vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub meshes: Vec<MeshData>,
}

/// Per-mesh uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct MeshUniforms {
    pub model: Mat4,
    pub previous_model: Mat4,
    pub base_colour_factor: Vec4,
    /// x: has base colour texture.
    pub flags: Vec4,
}

/// GPU side state of one mesh. Fields stay empty until their allocation succeeds, so a mesh whose
/// upload failed halfway can still be released.
#[derive(Default)]
pub struct MeshGpu {
    pub uniforms: Option<UniformSlice>,
    pub descriptor_set: vk::DescriptorSet,
    pub texture: Option<Image>,
}

#[derive(Default)]
pub struct ModelGpu {
    pub meshes: Vec<MeshGpu>,
    uploads: Vec<TransferToken>,
}

/// Everything a [`ModelGpu`] holds, sorted by how it has to be freed.
#[derive(Default)]
pub struct GpuResources {
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub uniforms: Vec<UniformSlice>,
    pub textures: Vec<Image>,
    pub uploads: Vec<TransferToken>,
}

impl ModelGpu {
    /// Geometry and textures have all landed on the GPU.
    pub fn is_resident(&self) -> bool {
        self.uploads.iter().all(TransferToken::is_complete)
    }

    /// Split into the resources that were actually created.
    pub fn into_resources(self) -> GpuResources {
        let mut resources = GpuResources {
            uploads: self.uploads,
            ..Default::default()
        };
        for mesh in self.meshes {
            if mesh.descriptor_set != vk::DescriptorSet::null() {
                resources.descriptor_sets.push(mesh.descriptor_set);
            }
            resources.uniforms.extend(mesh.uniforms);
            resources.textures.extend(mesh.texture);
        }
        resources
    }
}

/// One entry of the scene list.
pub struct SceneModel {
    pub name: String,
    pub data: Arc<ModelData>,
    pub base_vertex: u32,
    pub base_index: u32,
    pub render: bool,
    pub transform: Mat4,
    previous_transform: Mat4,
    /// Moved down by a removal and not staged at the new offsets yet.
    needs_restage: bool,
    pub gpu: Option<ModelGpu>,
}

/// The parameters of one `vkCmdDrawIndexed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub mesh: usize,
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
}

impl SceneModel {
    /// Draw calls for every render-enabled primitive, or nothing when the model itself is hidden.
    pub fn draw_calls(&self) -> impl Iterator<Item = DrawCall> + '_ {
        let base_index = self.base_index;
        let vertex_offset = self.base_vertex as i32;
        self.data
            .meshes
            .iter()
            .enumerate()
            .filter(move |_| self.render)
            .flat_map(move |(mesh, data)| {
                data.primitives
                    .iter()
                    .filter(|primitive| primitive.render)
                    .map(move |primitive| DrawCall {
                        mesh,
                        first_index: base_index + primitive.first_index,
                        index_count: primitive.index_count,
                        vertex_offset,
                    })
            })
    }

    pub fn is_resident(&self) -> bool {
        !self.needs_restage && self.gpu.as_ref().is_some_and(ModelGpu::is_resident)
    }

    pub fn needs_restage(&self) -> bool {
        self.needs_restage
    }

    fn vertex_count(&self) -> u32 {
        self.data.vertices.len() as u32
    }

    fn index_count(&self) -> u32 {
        self.data.indices.len() as u32
    }
}

/// The ordered list of loaded models, packed back to back into the scene-wide geometry buffers.
pub struct Scene {
    pub models: Vec<SceneModel>,
    capacity: (u32, u32),
}

impl Scene {
    /// `capacity` is (vertices, indices).
    pub fn new(capacity: (u32, u32)) -> Self {
        Self {
            models: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// First free (vertex, index) slot.
    pub fn next_offsets(&self) -> (u32, u32) {
        self.models.last().map_or((0, 0), |last| {
            (
                last.base_vertex + last.vertex_count(),
                last.base_index + last.index_count(),
            )
        })
    }

    /// Append a model right after the last one. Returns its index.
    pub fn push(&mut self, data: Arc<ModelData>) -> RenderResult<usize> {
        let (base_vertex, base_index) = self.next_offsets();
        let vertices = data.vertices.len() as u32;
        let indices = data.indices.len() as u32;
        if base_vertex + vertices > self.capacity.0 {
            return Err(RenderError::DeviceMemoryExhausted {
                requested: (vertices as usize * std::mem::size_of::<Vertex>()) as u64,
            });
        }
        if base_index + indices > self.capacity.1 {
            return Err(RenderError::DeviceMemoryExhausted {
                requested: indices as u64 * 4,
            });
        }

        self.models.push(SceneModel {
            name: data.name.clone(),
            data,
            base_vertex,
            base_index,
            render: true,
            transform: Mat4::IDENTITY,
            previous_transform: Mat4::IDENTITY,
            needs_restage: false,
            gpu: None,
        });
        Ok(self.models.len() - 1)
    }

    /// Take model `index` out of the list. Every later model shifts down one index and is moved
    /// down in the geometry buffers. Moved models are hidden until [`restage_moved`] stages them
    /// at the new offsets; their indices are returned.
    pub fn remove(&mut self, index: usize) -> Option<(SceneModel, Vec<usize>)> {
        if index >= self.models.len() {
            return None;
        }
        let removed = self.models.remove(index);

        let (mut base_vertex, mut base_index) = match index.checked_sub(1) {
            Some(previous) => {
                let previous = &self.models[previous];
                (
                    previous.base_vertex + previous.vertex_count(),
                    previous.base_index + previous.index_count(),
                )
            }
            None => (0, 0),
        };

        let mut moved = Vec::new();
        for (i, model) in self.models.iter_mut().enumerate().skip(index) {
            if model.base_vertex != base_vertex || model.base_index != base_index {
                model.base_vertex = base_vertex;
                model.base_index = base_index;
                model.needs_restage = true;
                moved.push(i);
            }
            base_vertex += model.vertex_count();
            base_index += model.index_count();
        }

        Some((removed, moved))
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|m| m.name == name)
    }
}

/// The scene-wide vertex and index buffers every model is packed into.
pub struct SceneGeometry {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
}

impl SceneGeometry {
    pub fn new(allocator: &mut Allocator, capacity: (u32, u32)) -> RenderResult<Self> {
        let vertex_buffer = Buffer::new(
            allocator,
            capacity.0 as u64 * std::mem::size_of::<Vertex>() as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "Scene Vertices",
        )?;
        let index_buffer = Buffer::new(
            allocator,
            capacity.1 as u64 * std::mem::size_of::<u32>() as u64,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "Scene Indices",
        )?;
        Ok(Self {
            vertex_buffer,
            index_buffer,
        })
    }

    /// Stage a model's geometry at its current offsets.
    pub fn stage(
        &self,
        allocator: &mut Allocator,
        model: &SceneModel,
    ) -> RenderResult<Vec<TransferToken>> {
        Ok(vec![
            self.vertex_buffer.upload(
                allocator,
                &model.data.vertices,
                model.base_vertex as u64 * std::mem::size_of::<Vertex>() as u64,
            )?,
            self.index_buffer.upload(
                allocator,
                &model.data.indices,
                model.base_index as u64 * std::mem::size_of::<u32>() as u64,
            )?,
        ])
    }

    pub fn bind(&self, context: &Context, command_buffer: vk::CommandBuffer) {
        unsafe {
            context.device.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                &[self.vertex_buffer.handle],
                &[0],
            );
            context.device.cmd_bind_index_buffer(
                command_buffer,
                self.index_buffer.handle,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    pub fn destroy(&mut self, allocator: &mut Allocator) {
        self.vertex_buffer.destroy(allocator);
        self.index_buffer.destroy(allocator);
    }
}

/// Create the GPU side of a freshly pushed model: geometry uploads, textures, per-mesh uniforms
/// and descriptor sets.
///
/// On error the model keeps whatever was created before the failure; [`release_model`] frees it.
pub fn upload_model(
    allocator: &mut Allocator,
    geometry: &SceneGeometry,
    targets: &RenderTargets,
    model: &mut SceneModel,
) -> RenderResult<()> {
    let context = allocator.context.clone();
    let uploads = geometry.stage(allocator, model)?;
    let gpu = model.gpu.insert(ModelGpu {
        meshes: Vec::with_capacity(model.data.meshes.len()),
        uploads,
    });

    for mesh in &model.data.meshes {
        let mut mesh_gpu = MeshGpu::default();
        let uploaded = upload_mesh(
            allocator,
            &context,
            targets,
            mesh,
            &mut mesh_gpu,
            &mut gpu.uploads,
        );
        gpu.meshes.push(mesh_gpu);
        uploaded?;
    }

    log::debug!(
        "Uploading {} ({} vertices at {}, {} indices at {})",
        model.name,
        model.data.vertices.len(),
        model.base_vertex,
        model.data.indices.len(),
        model.base_index
    );
    Ok(())
}

fn upload_mesh(
    allocator: &mut Allocator,
    context: &Context,
    targets: &RenderTargets,
    mesh: &MeshData,
    mesh_gpu: &mut MeshGpu,
    uploads: &mut Vec<TransferToken>,
) -> RenderResult<()> {
    if let Some(texture) = &mesh.base_colour {
        let extent = vk::Extent2D {
            width: texture.width,
            height: texture.height,
        };
        let image = mesh_gpu.texture.insert(Image::new(
            allocator,
            &ImageDesc::new(&mesh.name, vk::Format::R8G8B8A8_UNORM, extent)
                .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
                .sampler(SamplerKind::Material),
        )?);
        uploads.push(allocator.stage_image_transfer(&texture.rgba, image.handle, extent, 1)?);
        image.assume_state(AttachmentState::Sampled);
    }

    let uniforms = *mesh_gpu
        .uniforms
        .insert(allocator.uniforms.allocate_for::<MeshUniforms>()?);
    mesh_gpu.descriptor_set = context.allocate_descriptor_set(Technique::Mesh)?;
    context.set_debug_label(mesh_gpu.descriptor_set, &mesh.name);

    let sampled = match &mesh_gpu.texture {
        Some(image) => DescriptorResource::Image {
            view: image.view,
            sampler: image.sampler,
        },
        None => targets.descriptor(BLANK)?,
    };
    unsafe {
        write_descriptor_set(
            &context.device,
            Technique::Mesh,
            mesh_gpu.descriptor_set,
            &[allocator.uniforms.descriptor(&uniforms), sampled],
        )
    }
}

/// Stage a model's geometry again after it was moved down by a removal. The model stays hidden
/// until this succeeds.
pub fn restage_model(
    allocator: &mut Allocator,
    geometry: &SceneGeometry,
    model: &mut SceneModel,
) -> RenderResult<()> {
    let uploads = geometry.stage(allocator, model)?;
    if let Some(gpu) = &mut model.gpu {
        gpu.uploads.retain(|token| !token.is_complete());
        gpu.uploads.extend(uploads);
    }
    model.needs_restage = false;
    Ok(())
}

/// Restage every model a removal moved, stopping at the first failure.
pub fn restage_moved(
    allocator: &mut Allocator,
    geometry: &SceneGeometry,
    scene: &mut Scene,
) -> RenderResult<()> {
    for model in scene.models.iter_mut().filter(|model| model.needs_restage) {
        restage_model(allocator, geometry, model)?;
    }
    Ok(())
}

/// Write this frame's mesh uniforms.
pub fn update_model_uniforms(allocator: &Allocator, model: &mut SceneModel) {
    let Some(gpu) = &model.gpu else {
        return;
    };
    for (mesh, data) in gpu.meshes.iter().zip(&model.data.meshes) {
        let uniforms = MeshUniforms {
            model: model.transform * data.transform,
            previous_model: model.previous_transform * data.transform,
            base_colour_factor: data.base_colour_factor,
            flags: Vec4::new(mesh.texture.is_some() as u32 as f32, 0.0, 0.0, 0.0),
        };
        if let Some(slice) = &mesh.uniforms {
            allocator.uniforms.write(slice, &uniforms);
        }
    }
    model.previous_transform = model.transform;
}

/// Free everything the model holds on the GPU, including what a failed upload left behind. The
/// device must not be using any of it.
pub fn release_model(allocator: &mut Allocator, model: &mut SceneModel) {
    let Some(gpu) = model.gpu.take() else {
        return;
    };
    let resources = gpu.into_resources();
    allocator.cancel_transfers(&resources.uploads);

    let context = allocator.context.clone();
    context.free_descriptor_sets(&resources.descriptor_sets);
    for slice in resources.uniforms {
        allocator.uniforms.free(slice);
    }
    for mut texture in resources.textures {
        texture.destroy(allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::UniformBlocks;

    fn model(name: &str, vertices: usize, indices: usize) -> ModelData {
        ModelData {
            name: name.to_string(),
            vertices: vec![Vertex::default(); vertices],
            indices: (0..indices as u32).collect(),
            meshes: vec![MeshData {
                name: format!("{name}_mesh"),
                transform: Mat4::IDENTITY,
                base_colour_factor: Vec4::ONE,
                base_colour: None,
                primitives: vec![
                    Primitive {
                        first_index: 0,
                        index_count: indices as u32 / 2,
                        render: true,
                    },
                    Primitive {
                        first_index: indices as u32 / 2,
                        index_count: indices as u32 - indices as u32 / 2,
                        render: true,
                    },
                ],
            }],
        }
    }

    fn assert_contiguous(scene: &Scene) {
        let (mut vertex, mut index) = (0, 0);
        for model in &scene.models {
            assert_eq!(model.base_vertex, vertex, "{}", model.name);
            assert_eq!(model.base_index, index, "{}", model.name);
            vertex += model.vertex_count();
            index += model.index_count();
        }
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 64);
        let attributes = Vertex::attributes();
        assert_eq!(attributes.len(), 5);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[4].offset, 48);
    }

    #[test]
    fn models_are_packed_back_to_back() {
        let mut scene = Scene::new((1000, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        scene.push(Arc::new(model("b", 20, 60))).unwrap();
        scene.push(Arc::new(model("c", 5, 9))).unwrap();
        assert_contiguous(&scene);
        assert_eq!(scene.next_offsets(), (35, 99));
    }

    #[test]
    fn removal_shifts_and_repacks_later_models() {
        let mut scene = Scene::new((1000, 1000));
        for (name, v, i) in [("a", 10, 30), ("b", 20, 60), ("c", 5, 9), ("d", 7, 12)] {
            scene.push(Arc::new(model(name, v, i))).unwrap();
        }

        let (removed, moved) = scene.remove(2).unwrap();
        assert_eq!(removed.name, "c");
        assert_eq!(moved, vec![2]);
        assert_eq!(scene.models[2].name, "d");
        assert_eq!(scene.models[2].base_vertex, 30);
        assert_contiguous(&scene);

        let (_, moved) = scene.remove(0).unwrap();
        assert_eq!(moved, vec![0, 1]);
        assert_contiguous(&scene);
        assert!(scene.remove(5).is_none());
    }

    #[test]
    fn removing_the_last_model_moves_nothing() {
        let mut scene = Scene::new((1000, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        scene.push(Arc::new(model("b", 10, 30))).unwrap();
        let (_, moved) = scene.remove(1).unwrap();
        assert!(moved.is_empty());
        assert_eq!(scene.next_offsets(), (10, 30));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut scene = Scene::new((16, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        assert!(matches!(
            scene.push(Arc::new(model("b", 10, 30))),
            Err(RenderError::DeviceMemoryExhausted { .. })
        ));
        assert_eq!(scene.len(), 1);
    }

    #[test]
    fn draw_calls_respect_render_flags() {
        let mut scene = Scene::new((1000, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        let mut data = model("b", 8, 12);
        data.meshes[0].primitives[1].render = false;
        scene.push(Arc::new(data)).unwrap();

        let calls: Vec<_> = scene.models[1].draw_calls().collect();
        assert_eq!(
            calls,
            vec![DrawCall {
                mesh: 0,
                first_index: 30,
                index_count: 6,
                vertex_offset: 10,
            }]
        );

        scene.models[0].render = false;
        assert_eq!(scene.models[0].draw_calls().count(), 0);
    }

    #[test]
    fn dropping_a_failed_upload_frees_its_offsets() {
        let mut scene = Scene::new((1000, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        let failed = scene.push(Arc::new(model("huge", 20, 60))).unwrap();

        let (removed, moved) = scene.remove(failed).unwrap();
        assert_eq!(removed.name, "huge");
        assert!(moved.is_empty());

        let next = scene.push(Arc::new(model("b", 5, 9))).unwrap();
        assert_eq!(next, 1);
        assert_eq!((scene.models[1].base_vertex, scene.models[1].base_index), (10, 30));
        assert_contiguous(&scene);
    }

    #[test]
    fn half_uploaded_models_give_back_what_they_took() {
        use ash::vk::Handle;

        let mut blocks = UniformBlocks::new(4096);
        let size = std::mem::size_of::<MeshUniforms>() as u64;
        let first = blocks.allocate(size).unwrap();
        let second = blocks.allocate(size).unwrap();

        // The second mesh failed right after getting its uniforms, the third never started.
        let gpu = ModelGpu {
            meshes: vec![
                MeshGpu {
                    uniforms: Some(first),
                    descriptor_set: vk::DescriptorSet::from_raw(7),
                    texture: None,
                },
                MeshGpu {
                    uniforms: Some(second),
                    ..Default::default()
                },
                MeshGpu::default(),
            ],
            uploads: vec![TransferToken::completed(), TransferToken::completed()],
        };

        let resources = gpu.into_resources();
        assert_eq!(resources.descriptor_sets, vec![vk::DescriptorSet::from_raw(7)]);
        assert_eq!(resources.uniforms.len(), 2);
        assert!(resources.textures.is_empty());
        assert_eq!(resources.uploads.len(), 2);

        for slice in resources.uniforms {
            blocks.free(slice);
        }
        assert_eq!(blocks.in_use(), 0);
    }

    #[test]
    fn moved_models_stay_hidden_until_restaged() {
        let mut scene = Scene::new((1000, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        scene.push(Arc::new(model("b", 10, 30))).unwrap();
        scene.models[1].gpu = Some(ModelGpu::default());
        assert!(scene.models[1].is_resident());

        scene.remove(0).unwrap();
        assert!(scene.models[0].needs_restage());
        assert!(!scene.models[0].is_resident());
    }

    #[test]
    fn models_without_gpu_data_are_not_resident() {
        let mut scene = Scene::new((1000, 1000));
        scene.push(Arc::new(model("a", 10, 30))).unwrap();
        assert!(!scene.models[0].is_resident());
    }
}
