//! Shared setup for the device integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use forge_rhi::backend::HeadlessBackend;
use forge_rhi::handle::{PipelineLayoutHandle, ShaderHandle, TextureHandle, TextureViewHandle};
use forge_rhi::types::{
    DescriptorBindingInfo, DescriptorKind, Format, PipelineLayoutInfo, ShaderInfo, ShaderStage,
    ShaderStages, TextureInfo, TextureLayout, TextureUsage, TextureViewInfo,
};
use forge_rhi::{Device, DeviceConfig};

/// A warm device over a fresh headless backend.
pub fn device() -> (Arc<HeadlessBackend>, Device) {
    device_with(DeviceConfig::default())
}

pub fn device_with(config: DeviceConfig) -> (Arc<HeadlessBackend>, Device) {
    let _ = forge_core::try_init_logging();
    let backend = Arc::new(HeadlessBackend::new());
    let mut device = Device::new(backend.clone(), config).unwrap();
    device.new_frame().unwrap();
    (backend, device)
}

/// The SPIR-V magic number, enough for the headless backend.
pub fn spirv() -> Vec<u8> {
    0x0723_0203u32.to_le_bytes().to_vec()
}

/// Shaders, a layout and an offscreen color target to draw into.
pub struct DrawSetup {
    pub layout: PipelineLayoutHandle,
    pub vertex: ShaderHandle,
    pub fragment: ShaderHandle,
    pub target: TextureHandle,
    pub target_view: TextureViewHandle,
}

impl DrawSetup {
    pub fn new(device: &mut Device) -> Self {
        let layout = device
            .create_pipeline_layout(
                &PipelineLayoutInfo::new()
                    .with_set(vec![DescriptorBindingInfo::new(
                        0,
                        DescriptorKind::UniformBuffer,
                        ShaderStages::VERTEX,
                    )])
                    .with_set(vec![
                        DescriptorBindingInfo::new(0, DescriptorKind::SampledTexture, ShaderStages::FRAGMENT),
                        DescriptorBindingInfo::new(1, DescriptorKind::Sampler, ShaderStages::FRAGMENT),
                    ]),
            )
            .unwrap();
        let vertex = device
            .create_shader(&ShaderInfo::new(ShaderStage::Vertex, spirv()))
            .unwrap();
        let fragment = device
            .create_shader(&ShaderInfo::new(ShaderStage::Fragment, spirv()))
            .unwrap();
        let target = device
            .create_texture(
                &TextureInfo::new_2d(
                    Format::Rgba8Unorm,
                    8,
                    8,
                    TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC,
                )
                .with_layout(TextureLayout::ColorAttachment),
                None,
            )
            .unwrap();
        let target_view = device
            .create_texture_view(&TextureViewInfo::new(target, Format::Undefined))
            .unwrap();
        Self {
            layout,
            vertex,
            fragment,
            target,
            target_view,
        }
    }

    pub fn destroy(self, device: &mut Device) {
        device.destroy_texture_view(self.target_view);
        device.destroy_texture(self.target);
        device.destroy_shader(self.fragment);
        device.destroy_shader(self.vertex);
        device.destroy_pipeline_layout(self.layout);
    }
}
