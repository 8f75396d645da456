//! forge - frame loop demo.
//!
//! Loads `forge.toml` (or the path given as the first argument), creates the
//! configured backend and a device, uploads a triangle and a checkerboard
//! texture, then renders a fixed number of frames into an offscreen target
//! with draws recorded from several worker threads.

mod config;
mod scene;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use forge_rhi::backend::{Backend, HeadlessBackend};
use forge_rhi::command_list::CommandList;
use forge_rhi::handle::{
    BufferHandle, PipelineLayoutHandle, SamplerHandle, ShaderHandle, TextureHandle, TextureViewHandle,
};
use forge_rhi::pipeline::{PipelineInstanceState, VertexInputRate, VertexLayout};
use forge_rhi::render_pass::{ColorAttachment, LoadOp, RenderPassBeginInfo};
use forge_rhi::types::{
    BufferInfo, BufferUsage, DescriptorBindingInfo, DescriptorKind, Format, MemoryUsage, PipelineLayoutInfo,
    QueueType, SamplerInfo, ShaderInfo, ShaderStage, ShaderStages, TextureInfo, TextureLayout, TextureUsage,
    TextureViewInfo,
};
use forge_rhi::{Device, RhiResult};
use forge_vulkan::VulkanBackend;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, BackendKind};
use crate::scene::{TRANSFORM_STRIDE, Transform, Vertex};

const CHECKERBOARD_SIZE: u32 = 64;
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

/// Everything the demo creates on the device.
struct Demo {
    vertex_buffer: BufferHandle,
    uniform_buffer: BufferHandle,
    texture: TextureHandle,
    texture_view: TextureViewHandle,
    sampler: SamplerHandle,
    layout: PipelineLayoutHandle,
    vertex_shader: ShaderHandle,
    fragment_shader: ShaderHandle,
    target: TextureHandle,
    target_view: TextureViewHandle,
    width: u32,
    height: u32,
    workers: usize,
    draws_per_worker: u32,
}

impl Demo {
    fn new(device: &mut Device, config: &AppConfig) -> Result<Self> {
        let vertices = scene::triangle();
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = device.create_buffer(
            &BufferInfo::new(
                vertex_bytes.len() as u64,
                BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
                MemoryUsage::GpuOnly,
            ),
            Some(vertex_bytes),
        )?;

        // One transform per worker for every frame of the ring.
        let slots = config.device.frames_in_flight as u64 * config.worker_threads as u64;
        let uniform_buffer = device.create_buffer(
            &BufferInfo::new(slots * TRANSFORM_STRIDE, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu),
            None,
        )?;

        let texels = scene::checkerboard(CHECKERBOARD_SIZE, 8);
        let texture = device.create_texture(
            &TextureInfo::new_2d(
                Format::Rgba8Unorm,
                CHECKERBOARD_SIZE,
                CHECKERBOARD_SIZE,
                TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST,
            )
            .with_layout(TextureLayout::ShaderReadOnly),
            Some(&texels),
        )?;
        let texture_view = device.create_texture_view(&TextureViewInfo::new(texture, Format::Undefined))?;
        let sampler = device.create_sampler(&SamplerInfo::default())?;

        let layout = device.create_pipeline_layout(
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
        )?;

        let headless = config.backend == BackendKind::Headless;
        let vertex_shader = device.create_shader(&ShaderInfo::new(
            ShaderStage::Vertex,
            load_spirv(&config.shader_dir.join("triangle.vert.spv"), headless)?,
        ))?;
        let fragment_shader = device.create_shader(&ShaderInfo::new(
            ShaderStage::Fragment,
            load_spirv(&config.shader_dir.join("triangle.frag.spv"), headless)?,
        ))?;

        let target = device.create_texture(
            &TextureInfo::new_2d(
                Format::Rgba8Unorm,
                config.width,
                config.height,
                TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC,
            )
            .with_layout(TextureLayout::ColorAttachment),
            None,
        )?;
        let target_view = device.create_texture_view(&TextureViewInfo::new(target, Format::Undefined))?;

        info!(
            "Demo resources ready: {}x{} target, {} workers x {} draws",
            config.width, config.height, config.worker_threads, config.draws_per_worker
        );
        Ok(Self {
            vertex_buffer,
            uniform_buffer,
            texture,
            texture_view,
            sampler,
            layout,
            vertex_shader,
            fragment_shader,
            target,
            target_view,
            width: config.width,
            height: config.height,
            workers: config.worker_threads,
            draws_per_worker: config.draws_per_worker,
        })
    }

    fn instance_state(&self) -> PipelineInstanceState {
        let vertex_layout = VertexLayout::new()
            .with_binding(0, Vertex::STRIDE, VertexInputRate::Vertex)
            .with_attribute(0, 0, Format::Rgb32Float, 0)
            .with_attribute(1, 0, Format::Rgb32Float, Vertex::COLOR_OFFSET)
            .with_attribute(2, 0, Format::Rg32Float, Vertex::UV_OFFSET);
        PipelineInstanceState::new(self.layout, self.vertex_shader)
            .with_fragment_shader(self.fragment_shader)
            .with_vertex_layout(vertex_layout)
    }

    /// Writes this frame's transforms, records one list per worker and
    /// submits them in worker order. The first worker clears the target.
    fn render_frame(&self, device: &mut Device, frame: u32) -> Result<()> {
        let aspect = self.width as f32 / self.height as f32;
        let slot_base = device.frame_index() * self.workers;
        for worker in 0..self.workers {
            let transform = scene::worker_transform(worker, self.workers, frame, aspect);
            let offset = (slot_base + worker) as u64 * TRANSFORM_STRIDE;
            device.write_buffer(self.uniform_buffer, offset, bytemuck::bytes_of(&transform))?;
        }

        let recorder: &Device = device;
        let lists = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.workers)
                .map(|worker| scope.spawn(move || self.record_worker(recorder, worker, slot_base + worker)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect::<RhiResult<Vec<_>>>()
        })?;

        for list in lists {
            device.submit(list)?;
        }
        debug!("Frame {} recorded by {} workers", frame, self.workers);
        Ok(())
    }

    fn record_worker(&self, device: &Device, worker: usize, slot: usize) -> RhiResult<CommandList> {
        let mut list = device.allocate_cmd_list(QueueType::Graphics)?;
        let mut color = ColorAttachment::new(self.target_view).with_clear_color(CLEAR_COLOR);
        if worker > 0 {
            color = color.with_load_op(LoadOp::Load);
        }
        list.begin_render_pass(
            device,
            &RenderPassBeginInfo::new(self.width, self.height).with_color_attachment(color),
        )?;

        list.set_pipeline_instance_state(self.instance_state());
        list.bind_ubo(
            0,
            0,
            self.uniform_buffer,
            slot as u64 * TRANSFORM_STRIDE,
            std::mem::size_of::<Transform>() as u64,
        );
        list.bind_texture(1, 0, self.texture_view);
        list.bind_sampler(1, 1, self.sampler);
        list.bind_vertex_buffers(device, 0, &[self.vertex_buffer], &[0]);
        for draw in 0..self.draws_per_worker {
            // The shader offsets each instance by its index.
            list.draw(device, 3, 1, 0, draw)?;
        }
        list.end_render_pass(device);
        Ok(list)
    }

    fn destroy(self, device: &mut Device) {
        device.destroy_texture_view(self.target_view);
        device.destroy_texture(self.target);
        device.destroy_shader(self.fragment_shader);
        device.destroy_shader(self.vertex_shader);
        device.destroy_pipeline_layout(self.layout);
        device.destroy_sampler(self.sampler);
        device.destroy_texture_view(self.texture_view);
        device.destroy_texture(self.texture);
        device.destroy_buffer(self.uniform_buffer);
        device.destroy_buffer(self.vertex_buffer);
    }
}

/// Reads a SPIR-V file. The headless backend only checks the magic number,
/// so it runs without compiled shaders.
fn load_spirv(path: &Path, headless: bool) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(code) => Ok(code),
        Err(e) if headless && e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} not found; using an empty module for the headless backend", path.display());
            Ok(0x0723_0203u32.to_le_bytes().to_vec())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read shader {}", path.display())),
    }
}

fn create_backend(config: &AppConfig) -> Result<Arc<dyn Backend>> {
    Ok(match config.backend {
        BackendKind::Headless => Arc::new(HeadlessBackend::new()),
        BackendKind::Vulkan => {
            Arc::new(VulkanBackend::new(&config.vulkan, None).context("failed to create the Vulkan backend")?)
        }
    })
}

fn main() -> Result<()> {
    forge_core::init_logging();

    let path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("forge.toml"), PathBuf::from);
    let config: AppConfig = forge_core::config::load_or_default(&path)?;
    config.validate()?;
    info!("Starting forge with the {:?} backend for {} frames", config.backend, config.frames);

    let backend = create_backend(&config)?;
    info!("Backend '{}' created", backend.name());
    let mut device = Device::new(backend, config.device.clone())?;

    device.new_frame()?;
    let demo = Demo::new(&mut device, &config)?;
    for frame in 0..config.frames {
        if frame > 0 {
            device.new_frame()?;
        }
        demo.render_frame(&mut device, frame)?;
        device.end_frame()?;
    }

    device.wait_gpu_idle()?;
    info!(
        "Rendered {} frames with {} cached pipeline(s)",
        config.frames,
        device.cached_pipelines()
    );
    demo.destroy(&mut device);
    device.destroy();
    info!("Shutdown complete");
    Ok(())
}
