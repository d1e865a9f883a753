//! Swapchain creation, recreation and teardown against the mock device.

use std::collections::BTreeMap;

use ash::vk::{self, Handle};
use kestrel_core::PresentModePreference;
use kestrel_gpu::{GpuError, Swapchain};
use kestrel_test::{Event, MockDevice, ResourceKind};

const fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

#[test]
fn per_image_resources_match_image_count() {
    for (min, max) in [(1, 0), (2, 3), (2, 4), (3, 3), (4, 0)] {
        let device = MockDevice::with_image_counts(min, max);
        let mut swapchain =
            Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate)
                .unwrap();

        let count = swapchain.image_count();
        assert_eq!(swapchain.images().len(), count);
        assert_eq!(swapchain.views().len(), count);
        assert_eq!(swapchain.render_complete_semaphores().len(), count);
        assert!(count as u32 >= min, "{count} images below minimum {min}");
        if max > 0 {
            assert!(count as u32 <= max, "{count} images above maximum {max}");
        }

        swapchain.destroy(&device);
        assert_eq!(device.live_table(), BTreeMap::new());
        device.assert_clean();
    }
}

#[test]
fn repeated_resize_keeps_handle_counts_stable() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    let before = device.live_table();
    assert_eq!(before.get(&ResourceKind::Swapchain), Some(&1));

    for _ in 0..8 {
        swapchain.resize(&device, extent(1280, 720)).unwrap();
        assert_eq!(device.live_table(), before);
        assert_eq!(swapchain.extent(), extent(1280, 720));
        assert_eq!(swapchain.format().format, vk::Format::B8G8R8A8_SRGB);
    }

    swapchain.destroy(&device);
    device.assert_clean();
}

#[test]
fn resize_waits_idle_once_before_destroying_anything() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    device.clear_events();

    swapchain.resize(&device, extent(640, 480)).unwrap();

    let events = device.events();
    assert_eq!(events[0], Event::WaitIdle);
    assert!(matches!(events[1], Event::Destroyed(..)));
    assert_eq!(device.count(|e| *e == Event::WaitIdle), 1);
    assert_eq!(swapchain.extent(), extent(640, 480));
}

#[test]
fn previous_chain_is_hint_and_outlives_its_replacement_creation() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    swapchain.resize(&device, extent(1920, 1080)).unwrap();

    let records = device.swapchains();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].replaces, None);
    assert_eq!(records[1].replaces, Some(records[0].handle));

    let events = device.events();
    let created = events
        .iter()
        .position(|e| *e == Event::Created(ResourceKind::Swapchain, records[1].handle))
        .unwrap();
    let destroyed = events
        .iter()
        .position(|e| *e == Event::Destroyed(ResourceKind::Swapchain, records[0].handle))
        .unwrap();
    assert!(created < destroyed);

    swapchain.destroy(&device);
    device.assert_clean();
}

#[test]
fn failed_creation_retires_the_previous_chain() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();

    device.fail_next_swapchain(vk::Result::ERROR_INITIALIZATION_FAILED);
    let result = swapchain.resize(&device, extent(1280, 720));
    assert!(matches!(result, Err(GpuError::SwapchainCreation(_))));
    assert_eq!(swapchain.handle(), vk::SwapchainKHR::null());
    assert_eq!(device.live_table(), BTreeMap::new());

    swapchain.resize(&device, extent(1280, 720)).unwrap();
    let records = device.swapchains();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].replaces, None);
    assert_eq!(swapchain.views().len(), swapchain.image_count());

    swapchain.destroy(&device);
    device.assert_clean();
}

#[test]
fn rejected_surface_keeps_the_current_chain_as_hint() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    let first = swapchain.handle();

    device.set_surface_extent(Some((0, 0)));
    let result = swapchain.resize(&device, extent(1280, 720));
    assert!(matches!(result, Err(GpuError::SwapchainOutOfDate)));
    assert_eq!(swapchain.handle(), first);
    assert_eq!(device.live(ResourceKind::Swapchain), 1);

    device.set_surface_extent(None);
    swapchain.resize(&device, extent(1280, 720)).unwrap();
    let records = device.swapchains();
    assert_eq!(records[1].replaces, Some(first.as_raw()));

    swapchain.destroy(&device);
    device.assert_clean();
}

#[test]
fn zero_requested_extent_is_rejected() {
    let device = MockDevice::new();
    let result = Swapchain::create(&device, extent(0, 720), PresentModePreference::Immediate);
    assert!(matches!(result, Err(GpuError::InvalidArgument(_))));
    assert!(device.swapchains().is_empty());
}

#[test]
fn zero_surface_extent_reports_out_of_date() {
    let device = MockDevice::new();
    device.set_surface_extent(Some((0, 0)));
    let result = Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate);
    assert!(matches!(result, Err(GpuError::SwapchainOutOfDate)));
    assert!(device.swapchains().is_empty());
}

#[test]
fn fixed_surface_extent_wins_over_request() {
    let device = MockDevice::new();
    device.set_surface_extent(Some((800, 600)));
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    assert_eq!(swapchain.extent(), extent(800, 600));
    swapchain.destroy(&device);
}

#[test]
fn present_mode_falls_back_to_fifo() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::IMMEDIATE);
    swapchain.destroy(&device);

    device.set_present_modes(&[vk::PresentModeKHR::FIFO]);
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Mailbox).unwrap();
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::FIFO);

    // The preference survives recreation.
    device.set_present_modes(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]);
    swapchain.resize(&device, extent(1280, 720)).unwrap();
    assert_eq!(swapchain.present_mode(), vk::PresentModeKHR::MAILBOX);
    swapchain.destroy(&device);
    device.assert_clean();
}

#[test]
fn image_lookup_rejects_out_of_range_index() {
    let device = MockDevice::new();
    let mut swapchain =
        Swapchain::create(&device, extent(1280, 720), PresentModePreference::Immediate).unwrap();
    let count = swapchain.image_count() as u32;

    let last = swapchain.image(count - 1).unwrap();
    assert_eq!(last.view, swapchain.views()[count as usize - 1]);
    assert!(matches!(
        swapchain.image(count),
        Err(GpuError::InvalidState(_))
    ));
    swapchain.destroy(&device);
}
