//! Frame pacing scenarios driven through the real renderer.

use std::collections::BTreeMap;

use ash::vk::{self, Handle};
use kestrel_core::constants::MAX_FRAMES_IN_FLIGHT;
use kestrel_gpu::{FrameOutcome, GpuError, Renderer, RendererSettings, SkipReason};
use kestrel_test::{
    mock_renderer, AcquireStep, Event, MockDevice, PresentStep, ResourceKind, ScriptedTarget,
};

fn draw(renderer: &mut Renderer<MockDevice>, target: &mut ScriptedTarget) -> FrameOutcome {
    renderer.draw_frame(target, |_, _| Ok(())).unwrap()
}

fn is_presented(outcome: &FrameOutcome) -> bool {
    matches!(outcome, FrameOutcome::Presented { .. })
}

#[test]
fn every_slot_is_allocated_up_front() {
    let (renderer, _target) = mock_renderer(2);
    let device = renderer.device();

    assert_eq!(renderer.in_flight_count(), 2);
    assert_eq!(renderer.frames().capacity(), MAX_FRAMES_IN_FLIGHT);
    assert_eq!(device.created(ResourceKind::CommandPool), MAX_FRAMES_IN_FLIGHT);
    assert_eq!(device.live(ResourceKind::Fence), MAX_FRAMES_IN_FLIGHT);
    device.assert_clean();
}

#[test]
fn in_flight_changes_never_allocate() {
    let (mut renderer, mut target) = mock_renderer(2);
    let pools = renderer.device().created(ResourceKind::CommandPool);
    let fences = renderer.device().created(ResourceKind::Fence);

    for (requested, applied) in [(1, 1), (3, 3), (5, MAX_FRAMES_IN_FLIGHT), (0, 1), (2, 2)] {
        assert_eq!(renderer.set_in_flight_count(requested), applied);
        for _ in 0..4 {
            let outcome = draw(&mut renderer, &mut target);
            match outcome {
                FrameOutcome::Presented { slot, .. } => assert!(slot < applied),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    let device = renderer.device();
    assert_eq!(device.created(ResourceKind::CommandPool), pools);
    assert_eq!(device.created(ResourceKind::Fence), fences);
    device.assert_clean();
}

#[test]
fn render_complete_signals_follow_acquired_image() {
    let (mut renderer, mut target) = mock_renderer(2);
    assert_eq!(renderer.swapchain().image_count(), 3);
    let acquire_order = [0, 1, 0, 2, 1];
    renderer
        .device()
        .script_acquire(acquire_order.map(AcquireStep::Image));

    for _ in 0..acquire_order.len() {
        assert!(is_presented(&draw(&mut renderer, &mut target)));
    }

    let per_image: Vec<u64> = renderer
        .swapchain()
        .render_complete_semaphores()
        .iter()
        .map(|s| s.as_raw())
        .collect();
    let expected: Vec<u64> = acquire_order.iter().map(|&i| per_image[i as usize]).collect();

    let device = renderer.device();
    let submits = device.submits();
    let signaled: Vec<u64> = submits.iter().map(|s| s.signal).collect();
    assert_eq!(signaled, expected);
    assert_eq!(device.presented(), acquire_order.to_vec());

    // Presentation waits on exactly what the matching submit signaled.
    let present_waits: Vec<u64> = device
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Present { wait, .. } => Some(*wait),
            _ => None,
        })
        .collect();
    assert_eq!(present_waits, expected);

    // Acquire semaphores and fences rotate by slot instead.
    let slots = renderer.frames().slots();
    let waits: Vec<u64> = submits.iter().map(|s| s.wait).collect();
    let slot_semaphores: Vec<u64> = [0, 1, 0, 1, 0]
        .iter()
        .map(|&i| slots[i].image_acquired.as_raw())
        .collect();
    assert_eq!(waits, slot_semaphores);
    device.assert_clean();
}

#[test]
fn out_of_date_acquire_skips_one_frame_and_recreates_once() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().script_acquire([
        AcquireStep::Image(0),
        AcquireStep::Image(1),
        AcquireStep::OutOfDate,
        AcquireStep::Image(0),
        AcquireStep::Image(1),
    ]);

    let outcomes: Vec<FrameOutcome> = (0..5).map(|_| draw(&mut renderer, &mut target)).collect();

    assert!(is_presented(&outcomes[0]));
    assert!(is_presented(&outcomes[1]));
    assert_eq!(
        outcomes[2],
        FrameOutcome::Skipped(SkipReason::SwapchainOutOfDate)
    );
    assert!(is_presented(&outcomes[3]));
    assert!(is_presented(&outcomes[4]));

    let device = renderer.device();
    assert_eq!(device.swapchains().len(), 2);
    assert_eq!(device.submits().len(), 4);
    assert_eq!(device.presented(), vec![0, 1, 0, 1]);
    assert_eq!(device.count(|e| *e == Event::WaitIdle), 1);
    assert_eq!(renderer.frame_number(), 4);
    assert_eq!(renderer.swapchain_generation(), 1);

    // The skipped frame did not advance the rotation.
    let slots: Vec<usize> = outcomes
        .iter()
        .filter_map(|o| match o {
            FrameOutcome::Presented { slot, .. } => Some(*slot),
            _ => None,
        })
        .collect();
    assert_eq!(slots, vec![0, 1, 0, 1]);

    renderer.shutdown();
    let device = renderer.device();
    assert_eq!(device.count(|e| *e == Event::WaitIdle), 2);
    assert_eq!(device.live_table(), BTreeMap::new());
    device.assert_clean();
}

#[test]
fn idle_wait_immediately_precedes_each_resize_and_shutdown() {
    let (mut renderer, mut target) = mock_renderer(2);

    // Coalesced into a single rebuild.
    renderer.request_resize();
    renderer.request_resize();
    draw(&mut renderer, &mut target);

    renderer.device().script_present([PresentStep::Suboptimal]);
    let outcome = draw(&mut renderer, &mut target);
    assert!(matches!(
        outcome,
        FrameOutcome::Presented {
            swapchain_recreated: true,
            ..
        }
    ));

    draw(&mut renderer, &mut target);
    renderer.shutdown();

    let device = renderer.device();
    let resizes = device.swapchains().len() - 1;
    assert_eq!(resizes, 2);

    let events = device.events();
    let idle_waits: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| **e == Event::WaitIdle)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(idle_waits.len(), resizes + 1);
    for i in idle_waits {
        assert!(
            matches!(events[i + 1], Event::Destroyed(..)),
            "idle wait at {i} followed by {:?}",
            events[i + 1]
        );
    }
    device.assert_clean();
}

#[test]
fn minimized_window_blocks_initial_swapchain() {
    let mut target = ScriptedTarget::minimized_then([(0, 0), (1280, 720)]);
    let renderer =
        Renderer::new(MockDevice::new(), &mut target, RendererSettings::default()).unwrap();

    assert_eq!(target.waits(), 2);
    let records = renderer.device().swapchains();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].extent,
        vk::Extent2D {
            width: 1280,
            height: 720
        }
    );
    renderer.device().assert_clean();
}

#[test]
fn minimized_window_blocks_recreation_until_restored() {
    let (mut renderer, mut target) = mock_renderer(2);
    draw(&mut renderer, &mut target);

    target.set_size(0, 0);
    target.queue_sizes([(0, 0), (1024, 768)]);
    renderer.request_resize();
    assert!(is_presented(&draw(&mut renderer, &mut target)));

    assert_eq!(target.waits(), 2);
    let device = renderer.device();
    for record in device.swapchains() {
        assert!(record.extent.width > 0 && record.extent.height > 0);
    }
    assert_eq!(
        renderer.swapchain().extent(),
        vk::Extent2D {
            width: 1024,
            height: 768
        }
    );
    device.assert_clean();
}

#[test]
fn closing_minimized_window_at_startup_stops_waiting() {
    let mut target = ScriptedTarget::minimized_then([(0, 0)]).close_when_exhausted();
    let result = Renderer::new(MockDevice::new(), &mut target, RendererSettings::default());

    assert!(matches!(result, Err(GpuError::TargetClosed)));
    assert_eq!(target.waits(), 2);
}

#[test]
fn closing_minimized_window_mid_run_skips_frames() {
    let (mut renderer, target) = mock_renderer(2);
    let mut target = target.close_when_exhausted();
    draw(&mut renderer, &mut target);

    target.set_size(0, 0);
    renderer.request_resize();
    assert_eq!(
        draw(&mut renderer, &mut target),
        FrameOutcome::Skipped(SkipReason::TargetClosed)
    );
    assert_eq!(
        draw(&mut renderer, &mut target),
        FrameOutcome::Skipped(SkipReason::TargetClosed)
    );
    assert!(renderer.resize_pending());
    assert_eq!(target.waits(), 2);
    assert_eq!(renderer.device().swapchains().len(), 1);

    renderer.shutdown();
    assert_eq!(renderer.device().live_table(), BTreeMap::new());
    renderer.device().assert_clean();
}

#[test]
fn stale_surface_during_rebuild_skips_until_it_settles() {
    let (mut renderer, mut target) = mock_renderer(2);
    draw(&mut renderer, &mut target);

    renderer.device().set_surface_extent(Some((0, 0)));
    renderer.device().script_acquire([AcquireStep::OutOfDate]);
    assert_eq!(
        draw(&mut renderer, &mut target),
        FrameOutcome::Skipped(SkipReason::SwapchainOutOfDate)
    );
    assert!(renderer.resize_pending());

    // Still zero: the pending rebuild is retried and skipped again.
    assert_eq!(
        draw(&mut renderer, &mut target),
        FrameOutcome::Skipped(SkipReason::SwapchainOutOfDate)
    );
    assert_eq!(renderer.swapchain_generation(), 0);

    renderer.device().set_surface_extent(None);
    assert!(is_presented(&draw(&mut renderer, &mut target)));
    assert!(!renderer.resize_pending());
    assert_eq!(renderer.swapchain_generation(), 1);

    let device = renderer.device();
    let records = device.swapchains();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].replaces, Some(records[0].handle));
    assert_eq!(device.submits().len(), 2);
    device.assert_clean();
}

#[test]
fn failed_rebuild_retires_the_previous_chain() {
    let (mut renderer, mut target) = mock_renderer(2);
    draw(&mut renderer, &mut target);

    renderer
        .device()
        .fail_next_swapchain(vk::Result::ERROR_OUT_OF_DATE_KHR);
    renderer.request_resize();
    assert_eq!(
        draw(&mut renderer, &mut target),
        FrameOutcome::Skipped(SkipReason::SwapchainOutOfDate)
    );
    assert_eq!(renderer.device().live(ResourceKind::Swapchain), 0);

    assert!(is_presented(&draw(&mut renderer, &mut target)));
    let device = renderer.device();
    let records = device.swapchains();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].replaces, None);
    device.assert_clean();
}

#[test]
fn frame_is_recorded_between_explicit_transitions() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().clear_events();

    renderer
        .draw_frame(&mut target, |device, frame| {
            device.note(format!("draw slot {} image {}", frame.slot, frame.image_index));
            Ok(())
        })
        .unwrap();

    insta::assert_snapshot!(renderer.device().trace(), @r"
    wait_fence
    acquire Image(0)
    reset_fence
    reset_pool
    begin
    label color attachment transition
    transition UNDEFINED -> COLOR_ATTACHMENT_OPTIMAL
    end_label
    label rendering
    begin_rendering 1280x720 clear
    note draw slot 0 image 0
    end_rendering
    end_label
    label present transition
    transition COLOR_ATTACHMENT_OPTIMAL -> PRESENT_SRC
    end_label
    end
    submit
    present 0
    ");
}

#[test]
fn failed_submission_recovers_the_slot() {
    let (mut renderer, mut target) = mock_renderer(2);
    draw(&mut renderer, &mut target);
    let slot = renderer.frames().current_index();
    let old_fence = renderer.frames().current().fence;

    renderer
        .device()
        .fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
    let result = renderer.draw_frame(&mut target, |_, _| Ok(()));
    assert!(matches!(
        result,
        Err(GpuError::SubmissionFailed(vk::Result::ERROR_DEVICE_LOST))
    ));
    assert!(renderer.resize_pending());
    assert_eq!(renderer.frames().current_index(), slot);
    assert_ne!(renderer.frames().current().fence, old_fence);

    for _ in 0..3 {
        assert!(is_presented(&draw(&mut renderer, &mut target)));
    }

    let device = renderer.device();
    assert_eq!(device.swapchains().len(), 2);
    assert_eq!(device.created(ResourceKind::CommandPool), MAX_FRAMES_IN_FLIGHT);
    assert_eq!(device.live(ResourceKind::Fence), MAX_FRAMES_IN_FLIGHT);
    device.assert_clean();
}

#[test]
fn failed_recording_still_closes_the_pass() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().clear_events();

    let result = renderer.draw_frame(&mut target, |_, _| {
        Err(GpuError::Recording("pipeline missing".into()))
    });
    assert!(matches!(result, Err(GpuError::Recording(_))));

    let device = renderer.device();
    assert_eq!(device.count(|e| *e == Event::EndRendering), 1);
    assert!(device.submits().is_empty());
    assert!(device.presented().is_empty());

    assert!(is_presented(&draw(&mut renderer, &mut target)));
    renderer.device().assert_clean();
}

#[test]
fn present_failure_is_reported_and_rotation_moves_on() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer
        .device()
        .script_present([PresentStep::Fail(vk::Result::ERROR_DEVICE_LOST)]);

    let result = renderer.draw_frame(&mut target, |_, _| Ok(()));
    assert!(matches!(
        result,
        Err(GpuError::PresentationFailed(vk::Result::ERROR_DEVICE_LOST))
    ));
    assert_eq!(renderer.frames().current_index(), 1);
    assert!(renderer.resize_pending());

    assert!(is_presented(&draw(&mut renderer, &mut target)));
    renderer.device().assert_clean();
}

#[test]
fn out_of_date_present_recreates_after_advancing() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().script_present([PresentStep::OutOfDate]);

    let outcome = draw(&mut renderer, &mut target);
    assert_eq!(
        outcome,
        FrameOutcome::Presented {
            image_index: 0,
            slot: 0,
            swapchain_recreated: true,
        }
    );
    assert_eq!(renderer.frames().current_index(), 1);
    assert_eq!(renderer.swapchain_generation(), 1);
    renderer.device().assert_clean();
}

#[test]
fn suboptimal_acquire_is_deferred_until_after_present() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer
        .device()
        .script_acquire([AcquireStep::Suboptimal(0)]);

    let outcome = draw(&mut renderer, &mut target);
    assert!(matches!(
        outcome,
        FrameOutcome::Presented {
            swapchain_recreated: true,
            ..
        }
    ));
    let device = renderer.device();
    assert_eq!(device.presented(), vec![0]);
    assert_eq!(device.swapchains().len(), 2);
}

#[test]
fn fence_timeout_leaves_the_slot_untouched() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().time_out_fence_waits(1);
    renderer.device().clear_events();

    assert_eq!(draw(&mut renderer, &mut target), FrameOutcome::TimedOut);
    let device = renderer.device();
    assert_eq!(device.count(|e| matches!(e, Event::ResetFence(_))), 0);
    assert_eq!(device.count(|e| matches!(e, Event::Acquire { .. })), 0);
    assert_eq!(renderer.frames().current_index(), 0);

    assert!(is_presented(&draw(&mut renderer, &mut target)));
}

#[test]
fn acquire_timeout_resets_nothing() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().script_acquire([AcquireStep::Timeout]);
    renderer.device().clear_events();

    assert_eq!(draw(&mut renderer, &mut target), FrameOutcome::TimedOut);
    assert_eq!(
        renderer
            .device()
            .count(|e| matches!(e, Event::ResetFence(_))),
        0
    );
    assert!(is_presented(&draw(&mut renderer, &mut target)));
    renderer.device().assert_clean();
}

#[test]
fn lost_surface_skips_and_rebuilds_next_frame() {
    let (mut renderer, mut target) = mock_renderer(2);
    renderer.device().script_acquire([AcquireStep::SurfaceLost]);

    assert_eq!(
        draw(&mut renderer, &mut target),
        FrameOutcome::Skipped(SkipReason::SurfaceLost)
    );
    assert!(renderer.resize_pending());
    assert_eq!(renderer.device().swapchains().len(), 1);

    assert!(is_presented(&draw(&mut renderer, &mut target)));
    assert!(!renderer.resize_pending());
    assert_eq!(renderer.device().swapchains().len(), 2);
}

#[test]
fn shutdown_is_idempotent_and_releases_everything() {
    let (mut renderer, mut target) = mock_renderer(3);
    for _ in 0..4 {
        draw(&mut renderer, &mut target);
    }

    renderer.shutdown();
    renderer.shutdown();

    let device = renderer.device();
    assert_eq!(device.count(|e| *e == Event::WaitIdle), 1);
    assert_eq!(device.live_table(), BTreeMap::new());
    device.assert_clean();

    let result = renderer.draw_frame(&mut target, |_, _| Ok(()));
    assert!(matches!(result, Err(GpuError::InvalidState(_))));
}
