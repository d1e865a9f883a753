//! Scripted [`DrawableTarget`] double.

use std::collections::VecDeque;

use kestrel_gpu::DrawableTarget;

/// Window stand-in whose drawable size changes only when the renderer waits
/// for events.
#[derive(Debug, Clone)]
pub struct ScriptedTarget {
    size: (u32, u32),
    pending: VecDeque<(u32, u32)>,
    waits: usize,
    close_when_exhausted: bool,
}

impl ScriptedTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            pending: VecDeque::new(),
            waits: 0,
            close_when_exhausted: false,
        }
    }

    /// Start at `(0, 0)`, as a minimized window, and report each of `sizes`
    /// after successive event waits.
    pub fn minimized_then(sizes: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut target = Self::new(0, 0);
        target.pending.extend(sizes);
        target
    }

    /// Change the reported size immediately.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.size = (width, height);
    }

    /// Sizes to report after the next event waits.
    pub fn queue_sizes(&mut self, sizes: impl IntoIterator<Item = (u32, u32)>) {
        self.pending.extend(sizes);
    }

    /// Report the target as closed, instead of panicking, once the queued
    /// sizes run out.
    #[must_use]
    pub fn close_when_exhausted(mut self) -> Self {
        self.close_when_exhausted = true;
        self
    }

    /// Number of `wait_for_events` calls so far.
    pub const fn waits(&self) -> usize {
        self.waits
    }
}

impl DrawableTarget for ScriptedTarget {
    fn drawable_size(&self) -> (u32, u32) {
        self.size
    }

    fn wait_for_events(&mut self) -> bool {
        self.waits += 1;
        match self.pending.pop_front() {
            Some(size) => {
                self.size = size;
                true
            }
            None if self.close_when_exhausted => false,
            None => panic!(
                "renderer waited for events with no scripted size left (stuck at {:?})",
                self.size
            ),
        }
    }
}
