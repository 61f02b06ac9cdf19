use std::collections::HashMap;

use ash::vk;

use crate::{
    error::{RenderError, RenderResult},
    settings::MAX_SHADOW_LIGHTS,
};

/// Every technique with its own descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technique {
    Composition,
    Ssao,
    SsaoBlur,
    Ssr,
    Fxaa,
    BrightFilter,
    GaussianBlurH,
    GaussianBlurV,
    Combine,
    MotionBlur,
    Shadows,
    Skybox,
    Mesh,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    CombinedImageSampler,
    UniformBuffer,
    StorageBuffer,
}

impl BindingKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// One entry of a technique's binding contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: BindingKind,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

const fn sampled(binding: u32) -> BindingDesc {
    BindingDesc {
        binding,
        kind: BindingKind::CombinedImageSampler,
        count: 1,
        stages: vk::ShaderStageFlags::FRAGMENT,
    }
}

const fn uniform(binding: u32, stages: vk::ShaderStageFlags) -> BindingDesc {
    BindingDesc {
        binding,
        kind: BindingKind::UniformBuffer,
        count: 1,
        stages,
    }
}

const FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;
const VERTEX: vk::ShaderStageFlags = vk::ShaderStageFlags::VERTEX;

const COMPOSITION: &[BindingDesc] = &[
    sampled(0), // albedo
    sampled(1), // depth
    sampled(2), // normal
    sampled(3), // srm
    uniform(4, FRAGMENT),
    sampled(5), // ambient occlusion
    sampled(6), // reflections
    sampled(7), // emissive
    sampled(8), // sky
    BindingDesc {
        binding: 9,
        kind: BindingKind::CombinedImageSampler,
        count: MAX_SHADOW_LIGHTS as u32,
        stages: FRAGMENT,
    },
];
const SSAO: &[BindingDesc] = &[
    sampled(0),
    sampled(1),
    sampled(2),
    uniform(3, FRAGMENT),
    uniform(4, FRAGMENT),
];
const SSR: &[BindingDesc] = &[
    sampled(0),
    sampled(1),
    sampled(2),
    sampled(3),
    uniform(4, FRAGMENT),
];
const SINGLE_INPUT: &[BindingDesc] = &[sampled(0)];
const COMBINE: &[BindingDesc] = &[sampled(0), sampled(1)];
const MOTION_BLUR: &[BindingDesc] = &[sampled(0), sampled(1), sampled(2), uniform(3, FRAGMENT)];
const SHADOWS: &[BindingDesc] = &[uniform(0, VERTEX)];
const SKYBOX: &[BindingDesc] = &[uniform(0, VERTEX), sampled(1)];
const MESH: &[BindingDesc] = &[
    uniform(0, vk::ShaderStageFlags::from_raw(
        vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
    )),
    sampled(1),
];
const COMPUTE: &[BindingDesc] = &[BindingDesc {
    binding: 0,
    kind: BindingKind::StorageBuffer,
    count: 1,
    stages: vk::ShaderStageFlags::COMPUTE,
}];

impl Technique {
    pub const ALL: [Technique; 14] = [
        Technique::Composition,
        Technique::Ssao,
        Technique::SsaoBlur,
        Technique::Ssr,
        Technique::Fxaa,
        Technique::BrightFilter,
        Technique::GaussianBlurH,
        Technique::GaussianBlurV,
        Technique::Combine,
        Technique::MotionBlur,
        Technique::Shadows,
        Technique::Skybox,
        Technique::Mesh,
        Technique::Compute,
    ];

    /// The binding contract for this technique's descriptor set.
    pub fn bindings(self) -> &'static [BindingDesc] {
        match self {
            Technique::Composition => COMPOSITION,
            Technique::Ssao => SSAO,
            Technique::Ssr => SSR,
            Technique::SsaoBlur
            | Technique::Fxaa
            | Technique::BrightFilter
            | Technique::GaussianBlurH
            | Technique::GaussianBlurV => SINGLE_INPUT,
            Technique::Combine => COMBINE,
            Technique::MotionBlur => MOTION_BLUR,
            Technique::Shadows => SHADOWS,
            Technique::Skybox => SKYBOX,
            Technique::Mesh => MESH,
            Technique::Compute => COMPUTE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Technique::Composition => "composition",
            Technique::Ssao => "ssao",
            Technique::SsaoBlur => "ssao_blur",
            Technique::Ssr => "ssr",
            Technique::Fxaa => "fxaa",
            Technique::BrightFilter => "bright_filter",
            Technique::GaussianBlurH => "gaussian_blur_h",
            Technique::GaussianBlurV => "gaussian_blur_v",
            Technique::Combine => "combine",
            Technique::MotionBlur => "motion_blur",
            Technique::Shadows => "shadows",
            Technique::Skybox => "skybox",
            Technique::Mesh => "mesh",
            Technique::Compute => "compute",
        }
    }
}

/// Process-wide cache of set layouts, one per [`Technique`].
///
/// Lives inside the [`crate::Context`]; layouts are created the first time a pipeline or
/// descriptor set asks for them and destroyed together at shutdown.
#[derive(Default)]
pub struct DescriptorLayouts {
    layouts: HashMap<Technique, vk::DescriptorSetLayout>,
}

impl DescriptorLayouts {
    pub fn get_or_create(
        &mut self,
        device: &ash::Device,
        technique: Technique,
    ) -> RenderResult<vk::DescriptorSetLayout> {
        if let Some(layout) = self.layouts.get(&technique) {
            return Ok(*layout);
        }

        let bindings: Vec<_> = technique
            .bindings()
            .iter()
            .map(|desc| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(desc.binding)
                    .descriptor_type(desc.kind.descriptor_type())
                    .descriptor_count(desc.count)
                    .stage_flags(desc.stages)
            })
            .collect();

        let layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
        }?;
        log::debug!("Created descriptor set layout for {}", technique.name());

        self.layouts.insert(technique, layout);
        Ok(layout)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn destroy_all(&mut self, device: &ash::Device) {
        for (_, layout) in self.layouts.drain() {
            unsafe { device.destroy_descriptor_set_layout(layout, None) };
        }
    }
}

/// A resource to write into one binding of a descriptor set.
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorResource {
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
    ImageArray(Vec<(vk::ImageView, vk::Sampler)>),
    Uniform {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Storage {
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    },
}

impl DescriptorResource {
    fn kind(&self) -> BindingKind {
        match self {
            DescriptorResource::Image { .. } | DescriptorResource::ImageArray(_) => {
                BindingKind::CombinedImageSampler
            }
            DescriptorResource::Uniform { .. } => BindingKind::UniformBuffer,
            DescriptorResource::Storage { .. } => BindingKind::StorageBuffer,
        }
    }

    fn count(&self) -> u32 {
        match self {
            DescriptorResource::ImageArray(images) => images.len() as u32,
            _ => 1,
        }
    }
}

/// Check `resources` against the binding contract of `technique`, in binding order.
pub fn validate_resources(
    technique: Technique,
    resources: &[DescriptorResource],
) -> RenderResult<()> {
    let bindings = technique.bindings();
    if bindings.len() != resources.len() {
        return Err(RenderError::DescriptorMismatch {
            technique: technique.name(),
            reason: format!(
                "expected {} bindings, got {}",
                bindings.len(),
                resources.len()
            ),
        });
    }

    for (desc, resource) in bindings.iter().zip(resources) {
        if desc.kind != resource.kind() || desc.count != resource.count() {
            return Err(RenderError::DescriptorMismatch {
                technique: technique.name(),
                reason: format!(
                    "binding {} wants {} x {:?}, got {} x {:?}",
                    desc.binding,
                    desc.count,
                    desc.kind,
                    resource.count(),
                    resource.kind()
                ),
            });
        }
    }

    Ok(())
}

/// Write every binding of `set` in one `vkUpdateDescriptorSets` call.
///
/// ## Safety
/// `set` must not be in use by a command buffer that is pending execution.
pub unsafe fn write_descriptor_set(
    device: &ash::Device,
    technique: Technique,
    set: vk::DescriptorSet,
    resources: &[DescriptorResource],
) -> RenderResult<()> {
    validate_resources(technique, resources)?;

    // The writes borrow these, so they have to be fully built first.
    let image_infos: Vec<Vec<vk::DescriptorImageInfo>> = resources
        .iter()
        .map(|resource| match resource {
            DescriptorResource::Image { view, sampler } => vec![image_info(*view, *sampler)],
            DescriptorResource::ImageArray(images) => images
                .iter()
                .map(|(view, sampler)| image_info(*view, *sampler))
                .collect(),
            _ => Vec::new(),
        })
        .collect();
    let buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = resources
        .iter()
        .map(|resource| match resource {
            DescriptorResource::Uniform {
                buffer,
                offset,
                range,
            } => vec![vk::DescriptorBufferInfo::default()
                .buffer(*buffer)
                .offset(*offset)
                .range(*range)],
            DescriptorResource::Storage { buffer, range } => {
                vec![vk::DescriptorBufferInfo::default()
                    .buffer(*buffer)
                    .range(*range)]
            }
            _ => Vec::new(),
        })
        .collect();

    let writes: Vec<vk::WriteDescriptorSet> = technique
        .bindings()
        .iter()
        .enumerate()
        .map(|(i, desc)| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(desc.binding)
                .descriptor_type(desc.kind.descriptor_type());
            match desc.kind {
                BindingKind::CombinedImageSampler => write.image_info(&image_infos[i]),
                BindingKind::UniformBuffer | BindingKind::StorageBuffer => {
                    write.buffer_info(&buffer_infos[i])
                }
            }
        })
        .collect();

    device.update_descriptor_sets(&writes, &[]);
    Ok(())
}

fn image_info(view: vk::ImageView, sampler: vk::Sampler) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(view)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> DescriptorResource {
        DescriptorResource::Image {
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        }
    }

    fn uniform_buffer() -> DescriptorResource {
        DescriptorResource::Uniform {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 256,
        }
    }

    #[test]
    fn binding_numbers_are_dense() {
        for technique in Technique::ALL {
            for (i, desc) in technique.bindings().iter().enumerate() {
                assert_eq!(desc.binding, i as u32, "{}", technique.name());
                assert!(desc.count >= 1);
            }
        }
    }

    #[test]
    fn ssr_contract_matches() {
        let resources = [image(), image(), image(), image(), uniform_buffer()];
        assert!(validate_resources(Technique::Ssr, &resources).is_ok());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let resources = [image(), image(), image(), image(), image()];
        let error = validate_resources(Technique::Ssr, &resources).unwrap_err();
        assert!(matches!(
            error,
            RenderError::DescriptorMismatch {
                technique: "ssr",
                ..
            }
        ));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        assert!(validate_resources(Technique::Fxaa, &[]).is_err());
        assert!(validate_resources(Technique::Fxaa, &[image(), image()]).is_err());
    }

    #[test]
    fn shadow_map_array_needs_every_slot() {
        let mut resources = vec![
            image(),
            image(),
            image(),
            image(),
            uniform_buffer(),
            image(),
            image(),
            image(),
            image(),
        ];
        resources.push(DescriptorResource::ImageArray(vec![
            (vk::ImageView::null(), vk::Sampler::null());
            MAX_SHADOW_LIGHTS - 1
        ]));
        assert!(validate_resources(Technique::Composition, &resources).is_err());

        resources.pop();
        resources.push(DescriptorResource::ImageArray(vec![
            (vk::ImageView::null(), vk::Sampler::null());
            MAX_SHADOW_LIGHTS
        ]));
        assert!(validate_resources(Technique::Composition, &resources).is_ok());
    }
}
