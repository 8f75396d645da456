//! Command recording: lazy pipeline and descriptor resolution, object
//! caches, multi-threaded recording.

mod common;

use std::thread;

use common::DrawSetup;
use forge_rhi::command_list::CommandList;
use forge_rhi::handle::BufferHandle;
use forge_rhi::pipeline::{CullMode, PipelineInstanceState, PrimitiveTopology};
use forge_rhi::render_pass::{AttachmentDesc, ColorAttachment, LoadOp, RenderPassBeginInfo, RenderPassInfo, StoreOp};
use forge_rhi::types::{
    BufferInfo, BufferUsage, Format, MemoryUsage, QueueType, SamplerInfo, TextureLayout,
};
use forge_rhi::{Device, RhiError};

fn uniform_buffer(device: &mut Device) -> BufferHandle {
    let info = BufferInfo::new(64, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu);
    device.create_buffer(&info, Some(&[0; 64])).unwrap()
}

fn instance_state(setup: &DrawSetup) -> PipelineInstanceState {
    PipelineInstanceState::new(setup.layout, setup.vertex).with_fragment_shader(setup.fragment)
}

/// Records one render pass into the setup's target with `draws` draws.
fn record(device: &Device, setup: &DrawSetup, ubo: BufferHandle, draws: u32) -> CommandList {
    let mut list = device.allocate_cmd_list(QueueType::Graphics).unwrap();
    list.begin_render_pass(
        device,
        &RenderPassBeginInfo::new(8, 8)
            .with_color_attachment(ColorAttachment::new(setup.target_view).with_clear_color([1.0, 0.0, 0.0, 1.0])),
    )
    .unwrap();
    list.set_pipeline_instance_state(instance_state(setup));
    list.bind_ubo(0, 0, ubo, 0, 64);
    for _ in 0..draws {
        list.draw(device, 3, 1, 0, 0).unwrap();
    }
    list.end_render_pass(device);
    list
}

#[test]
fn test_render_pass_cache_is_structural() {
    let (backend, mut device) = common::device();

    let make = || RenderPassInfo {
        color_attachments: vec![AttachmentDesc {
            format: Format::Rgba8Unorm,
            samples: 1,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            layout: TextureLayout::ColorAttachment,
        }],
        depth_attachment: None,
    };
    let first = device.create_or_find_render_pass(&make()).unwrap();
    let second = device.create_or_find_render_pass(&make()).unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.stats().render_passes_created, 1);

    let mut other = make();
    other.color_attachments[0].load_op = LoadOp::Load;
    assert_ne!(device.create_or_find_render_pass(&other).unwrap(), first);
    assert_eq!(device.cached_render_passes(), 2);

    device.destroy();
    assert_eq!(backend.stats().render_passes_destroyed, 2);
}

#[test]
fn test_idle_render_pass_evicted_on_ninth_frame() {
    let (backend, mut device) = common::device();

    let info = RenderPassInfo::default();
    let native = device.create_or_find_render_pass(&info).unwrap();

    for _ in 0..8 {
        device.new_frame().unwrap();
    }
    assert_eq!(device.cached_render_passes(), 1);
    assert_eq!(backend.stats().render_passes_destroyed, 0);

    device.new_frame().unwrap();
    assert_eq!(device.cached_render_passes(), 0);
    assert_eq!(backend.stats().render_passes_destroyed, 1);

    // A later lookup creates a fresh object.
    assert_ne!(device.create_or_find_render_pass(&info).unwrap(), native);
    device.destroy();
}

#[test]
fn test_lookup_keeps_cache_entry_alive() {
    let (_backend, mut device) = common::device();

    let info = RenderPassInfo::default();
    let native = device.create_or_find_render_pass(&info).unwrap();
    for _ in 0..20 {
        device.new_frame().unwrap();
        assert_eq!(device.create_or_find_render_pass(&info).unwrap(), native);
    }
    device.destroy();
}

#[test]
fn test_pipeline_bound_once_for_identical_draws() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    let list = record(&device, &setup, ubo, 2);
    device.submit(list).unwrap();
    device.end_frame().unwrap();

    let stats = backend.stats();
    assert_eq!(stats.draw_calls, 2);
    assert_eq!(stats.bind_pipeline_calls, 1);
    assert_eq!(stats.bind_descriptor_set_calls, 1);
    assert_eq!(stats.pipelines_created, 1);
    assert_eq!(device.cached_pipelines(), 1);

    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_changed_instance_state_rebinds() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    let mut list = device.allocate_cmd_list(QueueType::Graphics).unwrap();
    list.begin_render_pass(
        &device,
        &RenderPassBeginInfo::new(8, 8).with_color_attachment(ColorAttachment::new(setup.target_view)),
    )
    .unwrap();
    list.bind_ubo(0, 0, ubo, 0, 64);

    list.set_pipeline_instance_state(instance_state(&setup));
    list.draw(&device, 3, 1, 0, 0).unwrap();
    // Setting an equal state is not a change.
    list.set_pipeline_instance_state(instance_state(&setup));
    list.draw(&device, 3, 1, 0, 0).unwrap();
    assert_eq!(backend.stats().bind_pipeline_calls, 1);

    list.set_pipeline_instance_state(instance_state(&setup).with_cull_mode(CullMode::None));
    list.draw(&device, 3, 1, 0, 0).unwrap();
    assert_eq!(backend.stats().bind_pipeline_calls, 2);

    // Back to the first state: cached, but it differs from what is bound.
    list.set_pipeline_instance_state(instance_state(&setup));
    list.draw(&device, 3, 1, 0, 0).unwrap();
    assert_eq!(backend.stats().bind_pipeline_calls, 3);
    assert_eq!(backend.stats().pipelines_created, 2);

    list.end_render_pass(&device);
    device.submit(list).unwrap();
    device.end_frame().unwrap();

    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_pipeline_cached_across_frames() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    for _ in 0..4 {
        let list = record(&device, &setup, ubo, 1);
        device.submit(list).unwrap();
        device.end_frame().unwrap();
        device.new_frame().unwrap();
    }
    let stats = backend.stats();
    assert_eq!(stats.pipelines_created, 1);
    assert_eq!(stats.render_passes_created, 1);
    assert_eq!(stats.draw_calls, 4);
    // A fresh bind per list, since each list starts with nothing bound.
    assert_eq!(stats.bind_pipeline_calls, 4);

    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
}

#[test]
fn test_undeclared_bindings_are_filtered() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);
    let sampler = device.create_sampler(&SamplerInfo::default()).unwrap();

    let mut list = device.allocate_cmd_list(QueueType::Graphics).unwrap();
    list.begin_render_pass(
        &device,
        &RenderPassBeginInfo::new(8, 8).with_color_attachment(ColorAttachment::new(setup.target_view)),
    )
    .unwrap();
    list.set_pipeline_instance_state(instance_state(&setup));
    list.bind_ubo(0, 0, ubo, 0, 64);
    // Stale bindings the layout does not declare.
    list.bind_sampler(0, 7, sampler);
    list.bind_ssbo(3, 0, ubo, 0, 64);
    // Set 1 only partially bound.
    list.bind_sampler(1, 1, sampler);
    list.draw(&device, 3, 1, 0, 0).unwrap();
    list.end_render_pass(&device);
    device.submit(list).unwrap();
    device.end_frame().unwrap();

    let stats = backend.stats();
    assert_eq!(stats.descriptor_sets_allocated, 2);
    assert_eq!(stats.bind_descriptor_set_calls, 2);

    // Sets are freed when the list is recycled.
    device.new_frame().unwrap();
    device.new_frame().unwrap();
    assert_eq!(backend.stats().descriptor_sets_freed, 2);

    device.destroy_sampler(sampler);
    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_render_pass_clears_target() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    let list = record(&device, &setup, ubo, 0);
    device.submit(list).unwrap();
    device.end_frame().unwrap();

    let texels = backend.texture_contents(device.texture(setup.target).native()).unwrap();
    assert_eq!(texels.len(), 8 * 8 * 4);
    assert!(texels.chunks(4).all(|texel| texel == [255, 0, 0, 255]));

    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
}

#[test]
fn test_recording_from_worker_threads() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    let mut live = Vec::new();
    for _ in 0..8 {
        let lists: Vec<CommandList> = thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| record(&device, &setup, ubo, 2)))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let threads: std::collections::HashSet<_> = lists.iter().map(CommandList::thread).collect();
        assert_eq!(threads.len(), 4);

        for list in lists {
            device.submit(list).unwrap();
        }
        device.end_frame().unwrap();
        device.new_frame().unwrap();
        live.push(backend.live_objects());
    }

    // Pools of finished threads are released once both frame slots have
    // cycled, so the object count stops growing.
    assert!(live[3..].iter().all(|&count| count == live[3]), "{live:?}");

    let stats = backend.stats();
    assert_eq!(stats.draw_calls, 64);
    // Every thread builds the same pipeline; the cache holds one.
    assert_eq!(stats.pipelines_created, 1);
    assert_eq!(device.cached_pipelines(), 1);

    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_destroyed_shader_drops_its_pipelines() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    let list = record(&device, &setup, ubo, 1);
    device.submit(list).unwrap();
    device.end_frame().unwrap();
    assert_eq!(device.cached_pipelines(), 1);

    device.destroy_shader(setup.fragment);
    device.new_frame().unwrap();
    assert_eq!(device.cached_pipelines(), 1);
    device.new_frame().unwrap();
    assert_eq!(device.cached_pipelines(), 0);
    assert_eq!(backend.stats().pipelines_destroyed, 1);

    device.destroy_buffer(ubo);
    device.destroy_texture_view(setup.target_view);
    device.destroy_texture(setup.target);
    device.destroy_shader(setup.vertex);
    device.destroy_pipeline_layout(setup.layout);
    device.destroy();
}

#[test]
fn test_pipeline_failure_is_reported_and_not_cached() {
    let (backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);
    let ubo = uniform_buffer(&mut device);

    let mut list = device.allocate_cmd_list(QueueType::Graphics).unwrap();
    list.begin_render_pass(
        &device,
        &RenderPassBeginInfo::new(8, 8).with_color_attachment(ColorAttachment::new(setup.target_view)),
    )
    .unwrap();
    list.set_pipeline_instance_state(instance_state(&setup).with_topology(PrimitiveTopology::LineList));
    list.bind_ubo(0, 0, ubo, 0, 64);

    backend.fail_next_create();
    assert!(matches!(list.draw(&device, 2, 1, 0, 0), Err(RhiError::OutOfMemory(_))));
    assert_eq!(device.cached_pipelines(), 0);

    // The next draw retries and succeeds.
    list.draw(&device, 2, 1, 0, 0).unwrap();
    assert_eq!(device.cached_pipelines(), 1);
    assert_eq!(backend.stats().draw_calls, 1);

    list.end_render_pass(&device);
    device.submit(list).unwrap();
    device.destroy_buffer(ubo);
    setup.destroy(&mut device);
    device.destroy();
}

#[test]
#[should_panic(expected = "outside a render pass")]
fn test_draw_outside_render_pass_panics() {
    let (_backend, mut device) = common::device();
    let setup = DrawSetup::new(&mut device);

    let mut list = device.allocate_cmd_list(QueueType::Graphics).unwrap();
    list.set_pipeline_instance_state(instance_state(&setup));
    let _ = list.draw(&device, 3, 1, 0, 0);
}
