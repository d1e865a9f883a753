//! Recording [`RenderDevice`] double.
//!
//! Handles are fake integers. Every call is appended to an event log, live
//! handles are tracked per kind, and semaphore and fence states are checked
//! the way the validation layer would, with violations collected instead of
//! reported.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::fmt::Write;

use ash::vk::{self, Handle};
use kestrel_gpu::{
    AcquiredImage, ColorTarget, FrameSubmit, GpuError, ImageTransition, RenderDevice,
    SurfaceSupport, SwapchainDesc,
};
use tracing::trace;

/// Kinds of handles whose lifetime the mock tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Swapchain,
    ImageView,
    Semaphore,
    Fence,
    CommandPool,
}

/// What the next `acquire_next_image` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStep {
    Image(u32),
    Suboptimal(u32),
    OutOfDate,
    SurfaceLost,
    Timeout,
}

/// What the next `present` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStep {
    Ok,
    Suboptimal,
    OutOfDate,
    SurfaceLost,
    Fail(vk::Result),
}

/// One recorded device call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WaitIdle,
    Created(ResourceKind, u64),
    Destroyed(ResourceKind, u64),
    WaitFence(u64),
    ResetFence(u64),
    ResetPool(u64),
    AllocateCommandBuffer(u64),
    Acquire { signal: u64, step: AcquireStep },
    Begin(u64),
    End(u64),
    Transition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    BeginRendering { width: u32, height: u32, cleared: bool },
    EndRendering,
    BeginLabel(String),
    EndLabel,
    Submit(SubmitRecord),
    Present { image_index: u32, wait: u64 },
    /// Free-form marker pushed by a test, usually from a record callback.
    Note(String),
}

/// Semaphores and fence of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRecord {
    pub command_buffer: u64,
    pub wait: u64,
    pub signal: u64,
    pub fence: u64,
}

/// A swapchain the mock built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRecord {
    pub handle: u64,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Raw handle of the chain passed as the recreation hint.
    pub replaces: Option<u64>,
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    support: SurfaceSupport,
    live: BTreeMap<u64, ResourceKind>,
    created: BTreeMap<ResourceKind, usize>,
    swapchain_images: HashMap<u64, Vec<vk::Image>>,
    swapchains: Vec<SwapchainRecord>,
    /// Chains already passed as a recreation hint.
    retired: HashSet<u64>,
    signaled_semaphores: HashSet<u64>,
    signaled_fences: HashSet<u64>,
    acquire_script: VecDeque<AcquireStep>,
    present_script: VecDeque<PresentStep>,
    fence_timeouts: usize,
    submit_failure: Option<vk::Result>,
    swapchain_failure: Option<vk::Result>,
    next_image: u32,
    events: Vec<Event>,
    violations: Vec<String>,
}

impl MockState {
    fn alloc(&mut self, kind: ResourceKind) -> u64 {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.live.insert(raw, kind);
        *self.created.entry(kind).or_default() += 1;
        self.events.push(Event::Created(kind, raw));
        raw
    }

    fn release(&mut self, kind: ResourceKind, raw: u64) {
        match self.live.remove(&raw) {
            Some(live_kind) if live_kind == kind => {}
            Some(live_kind) => self
                .violations
                .push(format!("destroyed {live_kind:?} {raw} as {kind:?}")),
            None => self
                .violations
                .push(format!("destroyed unknown or freed {kind:?} {raw}")),
        }
        self.events.push(Event::Destroyed(kind, raw));
    }

    fn check_live(&mut self, kind: ResourceKind, raw: u64, action: &str) {
        if self.live.get(&raw) != Some(&kind) {
            self.violations
                .push(format!("{action} on dead or unknown {kind:?} {raw}"));
        }
    }

    fn signal(&mut self, semaphore: u64, action: &str) {
        self.check_live(ResourceKind::Semaphore, semaphore, action);
        if !self.signaled_semaphores.insert(semaphore) {
            self.violations
                .push(format!("{action} signals semaphore {semaphore} that is already pending"));
        }
    }

    fn consume(&mut self, semaphore: u64, action: &str) {
        self.check_live(ResourceKind::Semaphore, semaphore, action);
        if !self.signaled_semaphores.remove(&semaphore) {
            self.violations
                .push(format!("{action} waits on semaphore {semaphore} that has no signal"));
        }
    }
}

/// In-memory device that records instead of rendering.
///
/// Submissions complete instantly: `submit` signals its fence right away.
#[derive(Debug)]
pub struct MockDevice {
    state: RefCell<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A device whose surface takes any extent, wants 2 to 4 images and
    /// supports FIFO, mailbox and immediate presentation.
    pub fn new() -> Self {
        Self::with_image_counts(2, 4)
    }

    /// Like [`MockDevice::new`] with the given surface image-count limits.
    /// `max_images == 0` means uncapped.
    pub fn with_image_counts(min_images: u32, max_images: u32) -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 8192,
                height: 8192,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };
        let support = SurfaceSupport {
            capabilities,
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
            ],
        };

        Self {
            state: RefCell::new(MockState {
                next_handle: 0,
                support,
                live: BTreeMap::new(),
                created: BTreeMap::new(),
                swapchain_images: HashMap::new(),
                swapchains: Vec::new(),
                retired: HashSet::new(),
                signaled_semaphores: HashSet::new(),
                signaled_fences: HashSet::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                fence_timeouts: 0,
                submit_failure: None,
                swapchain_failure: None,
                next_image: 0,
                events: Vec::new(),
                violations: Vec::new(),
            }),
        }
    }

    /// Fix the surface extent, as a compositor does. `None` lets the
    /// swapchain pick from the requested size.
    pub fn set_surface_extent(&self, extent: Option<(u32, u32)>) {
        let (width, height) = extent.unwrap_or((u32::MAX, u32::MAX));
        self.state.borrow_mut().support.capabilities.current_extent =
            vk::Extent2D { width, height };
    }

    /// Restrict the present modes the surface reports.
    pub fn set_present_modes(&self, modes: &[vk::PresentModeKHR]) {
        self.state.borrow_mut().support.present_modes = modes.to_vec();
    }

    /// Queue acquire results. Once the script runs out, images are handed
    /// out round-robin.
    pub fn script_acquire(&self, steps: impl IntoIterator<Item = AcquireStep>) {
        self.state.borrow_mut().acquire_script.extend(steps);
    }

    /// Queue present results. Once the script runs out, presents succeed.
    pub fn script_present(&self, steps: impl IntoIterator<Item = PresentStep>) {
        self.state.borrow_mut().present_script.extend(steps);
    }

    /// Make the next `count` fence waits time out.
    pub fn time_out_fence_waits(&self, count: usize) {
        self.state.borrow_mut().fence_timeouts = count;
    }

    /// Make the next submission fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.borrow_mut().submit_failure = Some(result);
    }

    /// Make the next swapchain creation fail with `result`. The recreation
    /// hint is still retired, as on a real driver.
    pub fn fail_next_swapchain(&self, result: vk::Result) {
        self.state.borrow_mut().swapchain_failure = Some(result);
    }

    /// Push a marker into the event log.
    pub fn note(&self, text: impl Into<String>) {
        self.state.borrow_mut().events.push(Event::Note(text.into()));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.state.borrow().events.iter().filter(|e| predicate(e)).count()
    }

    /// Handles of `kind` created and not yet destroyed.
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.state
            .borrow()
            .live
            .values()
            .filter(|&&k| k == kind)
            .count()
    }

    /// Handles of `kind` created over the device's lifetime.
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.state
            .borrow()
            .created
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Live handle counts of every kind, for comparing snapshots.
    pub fn live_table(&self) -> BTreeMap<ResourceKind, usize> {
        let mut table = BTreeMap::new();
        for &kind in self.state.borrow().live.values() {
            *table.entry(kind).or_default() += 1;
        }
        table
    }

    pub fn swapchains(&self) -> Vec<SwapchainRecord> {
        self.state.borrow().swapchains.clone()
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Submit(record) => Some(*record),
                _ => None,
            })
            .collect()
    }

    /// Image indices passed to `present`, in order.
    pub fn presented(&self) -> Vec<u32> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Present { image_index, .. } => Some(*image_index),
                _ => None,
            })
            .collect()
    }

    /// Lifetime or synchronization misuse seen so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    /// Panic with the collected violations, if any.
    pub fn assert_clean(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "device misuse: {violations:#?}");
    }

    /// The event log as text, without handle values, for snapshots.
    pub fn trace(&self) -> String {
        let mut out = String::new();
        for event in &self.state.borrow().events {
            let line = match event {
                Event::WaitIdle => "wait_idle".to_string(),
                Event::Created(kind, _) => format!("create {kind:?}"),
                Event::Destroyed(kind, _) => format!("destroy {kind:?}"),
                Event::WaitFence(_) => "wait_fence".to_string(),
                Event::ResetFence(_) => "reset_fence".to_string(),
                Event::ResetPool(_) => "reset_pool".to_string(),
                Event::AllocateCommandBuffer(_) => "allocate_command_buffer".to_string(),
                Event::Acquire { step, .. } => format!("acquire {step:?}"),
                Event::Begin(_) => "begin".to_string(),
                Event::End(_) => "end".to_string(),
                Event::Transition { old, new } => {
                    format!("transition {} -> {}", layout_name(*old), layout_name(*new))
                }
                Event::BeginRendering {
                    width,
                    height,
                    cleared,
                } => format!(
                    "begin_rendering {width}x{height}{}",
                    if *cleared { " clear" } else { "" }
                ),
                Event::EndRendering => "end_rendering".to_string(),
                Event::BeginLabel(name) => format!("label {name}"),
                Event::EndLabel => "end_label".to_string(),
                Event::Submit(_) => "submit".to_string(),
                Event::Present { image_index, .. } => format!("present {image_index}"),
                Event::Note(text) => format!("note {text}"),
            };
            let _ = writeln!(out, "{line}");
        }
        out
    }
}

fn layout_name(layout: vk::ImageLayout) -> &'static str {
    match layout {
        vk::ImageLayout::UNDEFINED => "UNDEFINED",
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => "COLOR_ATTACHMENT_OPTIMAL",
        vk::ImageLayout::PRESENT_SRC_KHR => "PRESENT_SRC",
        _ => "OTHER",
    }
}

impl RenderDevice for MockDevice {
    fn wait_idle(&self) -> kestrel_gpu::Result<()> {
        self.state.borrow_mut().events.push(Event::WaitIdle);
        Ok(())
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn surface_support(&self) -> kestrel_gpu::Result<SurfaceSupport> {
        Ok(self.state.borrow().support.clone())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> kestrel_gpu::Result<vk::SwapchainKHR> {
        let mut state = self.state.borrow_mut();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            state.violations.push(format!(
                "swapchain created with zero extent {}x{}",
                desc.extent.width, desc.extent.height
            ));
        }
        let replaces = (old != vk::SwapchainKHR::null()).then(|| old.as_raw());
        if let Some(raw) = replaces {
            state.check_live(ResourceKind::Swapchain, raw, "recreation hint");
            if !state.retired.insert(raw) {
                state
                    .violations
                    .push(format!("retired swapchain {raw} passed as a recreation hint again"));
            }
        }

        if let Some(result) = state.swapchain_failure.take() {
            return Err(match result {
                vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::SwapchainOutOfDate,
                vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
                other => GpuError::SwapchainCreation(other.to_string()),
            });
        }

        let raw = state.alloc(ResourceKind::Swapchain);
        let images = (0..desc.min_image_count)
            .map(|i| vk::Image::from_raw(0x1_0000_0000 + raw * 16 + u64::from(i)))
            .collect();
        state.swapchain_images.insert(raw, images);
        state.swapchains.push(SwapchainRecord {
            handle: raw,
            extent: desc.extent,
            image_count: desc.min_image_count,
            present_mode: desc.present_mode,
            replaces,
        });
        state.next_image = 0;
        trace!("mock swapchain {raw} replaces {replaces:?}");
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.swapchain_images.remove(&swapchain.as_raw());
        state.release(ResourceKind::Swapchain, swapchain.as_raw());
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> kestrel_gpu::Result<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchain_images
            .get(&swapchain.as_raw())
            .cloned()
            .ok_or_else(|| GpuError::InvalidState("unknown swapchain".into()))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> kestrel_gpu::Result<vk::ImageView> {
        let raw = self.state.borrow_mut().alloc(ResourceKind::ImageView);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state
            .borrow_mut()
            .release(ResourceKind::ImageView, view.as_raw());
    }

    fn create_semaphore(&self) -> kestrel_gpu::Result<vk::Semaphore> {
        let raw = self.state.borrow_mut().alloc(ResourceKind::Semaphore);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        state.signaled_semaphores.remove(&semaphore.as_raw());
        state.release(ResourceKind::Semaphore, semaphore.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> kestrel_gpu::Result<vk::Fence> {
        let mut state = self.state.borrow_mut();
        let raw = state.alloc(ResourceKind::Fence);
        if signaled {
            state.signaled_fences.insert(raw);
        }
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        state.signaled_fences.remove(&fence.as_raw());
        state.release(ResourceKind::Fence, fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> kestrel_gpu::Result<()> {
        let mut state = self.state.borrow_mut();
        let raw = fence.as_raw();
        state.events.push(Event::WaitFence(raw));
        state.check_live(ResourceKind::Fence, raw, "wait");
        if state.fence_timeouts > 0 {
            state.fence_timeouts -= 1;
            return Err(GpuError::Timeout);
        }
        if state.signaled_fences.contains(&raw) {
            Ok(())
        } else {
            // Nothing pending will ever signal it.
            Err(GpuError::Timeout)
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> kestrel_gpu::Result<()> {
        let mut state = self.state.borrow_mut();
        let raw = fence.as_raw();
        state.events.push(Event::ResetFence(raw));
        state.check_live(ResourceKind::Fence, raw, "reset");
        state.signaled_fences.remove(&raw);
        Ok(())
    }

    fn create_command_pool(&self, _queue_family: u32) -> kestrel_gpu::Result<vk::CommandPool> {
        let raw = self.state.borrow_mut().alloc(ResourceKind::CommandPool);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state
            .borrow_mut()
            .release(ResourceKind::CommandPool, pool.as_raw());
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> kestrel_gpu::Result<()> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::ResetPool(pool.as_raw()));
        state.check_live(ResourceKind::CommandPool, pool.as_raw(), "reset");
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> kestrel_gpu::Result<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        state.check_live(ResourceKind::CommandPool, pool.as_raw(), "allocate");
        state.events.push(Event::AllocateCommandBuffer(pool.as_raw()));
        state.next_handle += 1;
        Ok(vk::CommandBuffer::from_raw(state.next_handle))
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        _timeout_ns: u64,
    ) -> kestrel_gpu::Result<AcquiredImage> {
        let mut state = self.state.borrow_mut();
        state.check_live(ResourceKind::Swapchain, swapchain.as_raw(), "acquire");
        if state.retired.contains(&swapchain.as_raw()) {
            state
                .violations
                .push(format!("acquire from retired swapchain {}", swapchain.as_raw()));
        }

        let image_count = state
            .swapchain_images
            .get(&swapchain.as_raw())
            .map_or(0, |images| images.len() as u32);
        let fallback = AcquireStep::Image(state.next_image);
        let step = state.acquire_script.pop_front().unwrap_or(fallback);
        state.events.push(Event::Acquire {
            signal: signal.as_raw(),
            step,
        });

        let acquired = match step {
            AcquireStep::Image(index) => AcquiredImage {
                index,
                suboptimal: false,
            },
            AcquireStep::Suboptimal(index) => AcquiredImage {
                index,
                suboptimal: true,
            },
            AcquireStep::OutOfDate => return Err(GpuError::SwapchainOutOfDate),
            AcquireStep::SurfaceLost => return Err(GpuError::SurfaceLost),
            AcquireStep::Timeout => return Err(GpuError::Timeout),
        };
        if acquired.index >= image_count {
            state.violations.push(format!(
                "scripted image {} out of range for {image_count} images",
                acquired.index
            ));
        }
        state.next_image = (acquired.index + 1) % image_count.max(1);
        state.signal(signal.as_raw(), "acquire");
        Ok(acquired)
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> kestrel_gpu::Result<()> {
        self.state.borrow_mut().events.push(Event::Begin(cmd.as_raw()));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> kestrel_gpu::Result<()> {
        self.state.borrow_mut().events.push(Event::End(cmd.as_raw()));
        Ok(())
    }

    fn cmd_transition_image(&self, _cmd: vk::CommandBuffer, transition: &ImageTransition) {
        self.state.borrow_mut().events.push(Event::Transition {
            old: transition.old_layout,
            new: transition.new_layout,
        });
    }

    fn cmd_begin_rendering(&self, _cmd: vk::CommandBuffer, target: &ColorTarget) {
        self.state.borrow_mut().events.push(Event::BeginRendering {
            width: target.extent.width,
            height: target.extent.height,
            cleared: target.clear.is_some(),
        });
    }

    fn cmd_end_rendering(&self, _cmd: vk::CommandBuffer) {
        self.state.borrow_mut().events.push(Event::EndRendering);
    }

    fn cmd_begin_label(&self, _cmd: vk::CommandBuffer, name: &CStr, _color: [f32; 4]) {
        self.state
            .borrow_mut()
            .events
            .push(Event::BeginLabel(name.to_string_lossy().into_owned()));
    }

    fn cmd_end_label(&self, _cmd: vk::CommandBuffer) {
        self.state.borrow_mut().events.push(Event::EndLabel);
    }

    fn submit(&self, submit: &FrameSubmit) -> kestrel_gpu::Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(result) = state.submit_failure.take() {
            return Err(GpuError::SubmissionFailed(result));
        }

        let record = SubmitRecord {
            command_buffer: submit.command_buffer.as_raw(),
            wait: submit.wait.as_raw(),
            signal: submit.signal.as_raw(),
            fence: submit.fence.as_raw(),
        };
        state.events.push(Event::Submit(record));

        state.consume(record.wait, "submit");
        state.signal(record.signal, "submit");
        state.check_live(ResourceKind::Fence, record.fence, "submit");
        if !state.signaled_fences.insert(record.fence) {
            state
                .violations
                .push(format!("submit with fence {} still signaled", record.fence));
        }
        Ok(())
    }

    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> kestrel_gpu::Result<bool> {
        let mut state = self.state.borrow_mut();
        state.check_live(ResourceKind::Swapchain, swapchain.as_raw(), "present");
        state.events.push(Event::Present {
            image_index,
            wait: wait.as_raw(),
        });
        state.consume(wait.as_raw(), "present");

        match state.present_script.pop_front().unwrap_or(PresentStep::Ok) {
            PresentStep::Ok => Ok(false),
            PresentStep::Suboptimal => Ok(true),
            PresentStep::OutOfDate => Err(GpuError::SwapchainOutOfDate),
            PresentStep::SurfaceLost => Err(GpuError::SurfaceLost),
            PresentStep::Fail(result) => Err(GpuError::PresentationFailed(result)),
        }
    }
}
