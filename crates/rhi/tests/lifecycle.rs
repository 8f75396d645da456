//! Resource creation, upload and deferred destruction over the headless
//! backend.

mod common;

use std::thread;

use forge_rhi::handle::ResourceType;
use forge_rhi::types::{
    BufferInfo, BufferUsage, Format, MemoryUsage, QueueType, SamplerInfo, TextureInfo,
    TextureLayout, TextureUsage, TextureViewInfo,
};
use forge_rhi::{DeviceConfig, RhiError};

#[test]
fn test_cpu_visible_buffer_upload() {
    let (backend, mut device) = common::device();

    let info = BufferInfo::new(256, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu);
    let buffer = device.create_buffer(&info, Some(&[0xAB; 256])).unwrap();
    // Written through a mapping; no staging buffer involved.
    assert_eq!(device.live_count(ResourceType::Buffer), 1);

    device.wait_gpu_idle().unwrap();
    {
        let mapping = device.map_buffer(buffer).unwrap();
        assert_eq!(mapping.len(), 256);
        assert!(mapping.as_slice().iter().all(|&b| b == 0xAB));
    }

    device.destroy_buffer(buffer);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_gpu_only_buffer_upload_goes_through_staging() {
    let (backend, mut device) = common::device();

    let data: Vec<u8> = (0..=255).collect();
    let info = BufferInfo::new(512, BufferUsage::VERTEX | BufferUsage::TRANSFER_DST, MemoryUsage::GpuOnly);
    let buffer = device.create_buffer(&info, Some(&data)).unwrap();
    assert_eq!(device.live_count(ResourceType::Buffer), 2);

    device.end_frame().unwrap();
    let contents = backend.buffer_contents(device.buffer(buffer).native()).unwrap();
    assert_eq!(&contents[..256], data.as_slice());
    assert!(contents[256..].iter().all(|&b| b == 0));

    device.new_frame().unwrap();
    device.new_frame().unwrap();
    assert_eq!(device.live_count(ResourceType::Buffer), 1);

    device.destroy_buffer(buffer);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
}

#[test]
fn test_texture_staged_upload() {
    let (backend, mut device) = common::device();

    let info = TextureInfo::new_2d(
        Format::Rgba8Unorm,
        4,
        4,
        TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST,
    )
    .with_layout(TextureLayout::ShaderReadOnly);
    let pixels: Vec<u8> = (0..64).collect();
    let texture = device.create_texture(&info, Some(&pixels)).unwrap();

    // Exactly one staging buffer appears...
    assert_eq!(device.live_count(ResourceType::Buffer), 1);
    assert_eq!(backend.stats().buffers_created, 1);

    device.end_frame().unwrap();
    let native = device.texture(texture).native();
    assert_eq!(backend.texture_layout(native), Some(TextureLayout::ShaderReadOnly));
    assert_eq!(backend.texture_contents(native).unwrap(), pixels);

    device.new_frame().unwrap();
    assert_eq!(device.live_count(ResourceType::Buffer), 1);
    device.end_frame().unwrap();
    device.new_frame().unwrap();

    // ...and is gone once the frame that used it comes around again.
    assert_eq!(device.live_count(ResourceType::Buffer), 0);
    assert_eq!(backend.stats().buffers_destroyed, 1);

    device.destroy_texture(texture);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_texture_without_data_reaches_requested_layout() {
    let (backend, mut device) = common::device();

    let info = TextureInfo::new_2d(Format::Rgba8Unorm, 2, 2, TextureUsage::STORAGE)
        .with_layout(TextureLayout::General);
    let texture = device.create_texture(&info, None).unwrap();
    assert_eq!(device.live_count(ResourceType::Buffer), 0);

    device.end_frame().unwrap();
    let native = device.texture(texture).native();
    assert_eq!(backend.texture_layout(native), Some(TextureLayout::General));

    device.destroy_texture(texture);
    device.destroy();
}

#[test]
fn test_texture_data_size_must_match() {
    let (backend, mut device) = common::device();

    let info = TextureInfo::new_2d(Format::Rgba8Unorm, 4, 4, TextureUsage::SAMPLED);
    let result = device.create_texture(&info, Some(&[0; 12]));
    assert!(matches!(result, Err(RhiError::InvalidArgument(_))));
    assert_eq!(backend.stats().textures_created, 0);

    device.destroy();
}

#[test]
fn test_deferred_destruction_double_buffered() {
    let (backend, mut device) = common::device();
    assert_eq!(device.frame_index(), 0);

    let info = TextureInfo::new_2d(Format::Rgba8Unorm, 4, 4, TextureUsage::SAMPLED);
    let texture = device.create_texture(&info, None).unwrap();
    device.destroy_texture(texture);

    // Still usable for the rest of the frame.
    assert!(device.is_valid(texture));
    assert_eq!(device.texture(texture).info().width, 4);
    assert_eq!(device.pending_releases(), 1);

    device.end_frame().unwrap();
    device.new_frame().unwrap();
    assert_eq!(device.frame_index(), 1);
    assert!(device.is_valid(texture));
    assert_eq!(backend.stats().textures_destroyed, 0);

    device.end_frame().unwrap();
    device.new_frame().unwrap();
    assert_eq!(device.frame_index(), 0);
    assert!(!device.is_valid(texture));
    assert_eq!(backend.stats().textures_destroyed, 1);
    assert_eq!(device.pending_releases(), 0);

    device.destroy();
}

#[test]
fn test_deferred_destruction_triple_buffered() {
    let config = DeviceConfig {
        frames_in_flight: 3,
        ..Default::default()
    };
    let (_backend, mut device) = common::device_with(config);

    let sampler = device.create_sampler(&SamplerInfo::default()).unwrap();
    device.destroy_sampler(sampler);

    for _ in 0..2 {
        device.end_frame().unwrap();
        device.new_frame().unwrap();
        assert!(device.is_valid(sampler));
    }
    device.end_frame().unwrap();
    device.new_frame().unwrap();
    assert!(!device.is_valid(sampler));

    device.destroy();
}

#[test]
fn test_views_are_released_before_their_textures() {
    let (backend, mut device) = common::device();

    let info = TextureInfo::new_2d(Format::Rgba8Unorm, 4, 4, TextureUsage::SAMPLED);
    let texture = device.create_texture(&info, None).unwrap();
    let view = device
        .create_texture_view(&TextureViewInfo::new(texture, Format::Undefined))
        .unwrap();
    assert_eq!(device.texture_view(view).info().format, Format::Rgba8Unorm);

    // Destroyed in the "wrong" order on purpose.
    device.destroy_texture(texture);
    device.destroy_texture_view(view);
    device.new_frame().unwrap();
    device.new_frame().unwrap();

    assert_eq!(device.live_count(ResourceType::Texture), 0);
    assert_eq!(device.live_count(ResourceType::TextureView), 0);
    assert_eq!(backend.stats().validation_errors, 0);
    device.destroy();
}

#[test]
fn test_failed_creation_leaves_nothing_behind() {
    let (backend, mut device) = common::device();

    backend.fail_next_create();
    let info = BufferInfo::new(64, BufferUsage::STORAGE, MemoryUsage::GpuOnly);
    let result = device.create_buffer(&info, None);
    assert!(matches!(result, Err(RhiError::OutOfMemory(_))));
    assert_eq!(device.live_count(ResourceType::Buffer), 0);

    backend.fail_next_create();
    let info = TextureInfo::new_2d(Format::Rgba8Unorm, 4, 4, TextureUsage::SAMPLED);
    assert!(device.create_texture(&info, Some(&[0; 64])).is_err());
    assert_eq!(device.live_count(ResourceType::Texture), 0);
    assert_eq!(device.live_count(ResourceType::Buffer), 0);

    // The next creation succeeds again.
    let sampler = device.create_sampler(&SamplerInfo::default()).unwrap();
    device.destroy_sampler(sampler);
    device.destroy();
    assert_eq!(backend.live_objects(), 0);
}

#[test]
fn test_wait_gpu_idle_trims_command_pools() {
    let (backend, mut device) = common::device();

    for _ in 0..3 {
        let list = device.allocate_cmd_list(QueueType::Transfer).unwrap();
        device.submit(list).unwrap();
    }
    device.wait_gpu_idle().unwrap();

    let stats = backend.stats();
    assert_eq!(stats.command_lists_allocated, 3);
    assert_eq!(stats.command_lists_freed, 3);
    assert!(stats.pool_trims >= 1);

    // Recording works again after a trim.
    let list = device.allocate_cmd_list(QueueType::Transfer).unwrap();
    device.submit(list).unwrap();
    device.end_frame().unwrap();

    device.destroy();
    assert_eq!(backend.live_objects(), 0);
}

#[test]
fn test_command_lists_are_recycled_across_frames() {
    let (backend, mut device) = common::device();

    for _ in 0..6 {
        let list = device.allocate_cmd_list(QueueType::Graphics).unwrap();
        device.submit(list).unwrap();
        device.end_frame().unwrap();
        device.new_frame().unwrap();
    }

    // One list per frame slot, reused ever after.
    let stats = backend.stats();
    assert_eq!(stats.command_lists_allocated, 2);
    assert_eq!(stats.submissions, 6);
    assert!(stats.pool_resets >= 4);

    device.destroy();
    assert_eq!(backend.live_objects(), 0);
}

#[test]
fn test_short_lived_recording_threads_do_not_leak_pools() {
    let (backend, mut device) = common::device();

    let mut samples = Vec::new();
    for frame in 1..=40 {
        let list = thread::scope(|s| {
            s.spawn(|| device.allocate_cmd_list(QueueType::Graphics).unwrap())
                .join()
                .unwrap()
        });
        device.submit(list).unwrap();
        device.end_frame().unwrap();
        device.new_frame().unwrap();

        if frame % 10 == 0 {
            let stats = backend.stats();
            let lists = stats.command_lists_allocated - stats.command_lists_freed;
            samples.push((backend.live_objects(), lists));
        }
    }

    assert!(samples.iter().all(|&sample| sample == samples[0]), "{samples:?}");
    assert_eq!(backend.stats().submissions, 40);

    device.destroy();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
fn test_destroy_releases_everything() {
    let (backend, mut device) = common::device();

    let setup = common::DrawSetup::new(&mut device);
    let buffer = device
        .create_buffer(&BufferInfo::new(64, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu), None)
        .unwrap();
    let sampler = device.create_sampler(&SamplerInfo::default()).unwrap();

    // Destroyed in the final frame, never released by a new_frame.
    setup.destroy(&mut device);
    device.destroy_buffer(buffer);
    device.destroy_sampler(sampler);
    device.destroy();

    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.stats().validation_errors, 0);
}

#[test]
#[should_panic(expected = "live resources")]
fn test_leaked_resource_is_fatal() {
    let (_backend, mut device) = common::device();
    let info = BufferInfo::new(64, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu);
    let _leaked = device.create_buffer(&info, None).unwrap();
    device.destroy();
}
