// Frame lifecycle
//
// FRAME FLOW (per slot, N = MAX_FRAMES_IN_FLIGHT):
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait_fence ─> acquire ─> reset_fence ─> uniforms ─> record ─>       │
// │  submit ─> present ─> (recreate?) ─> next slot                       │
// └──────────────────────────────────────────────────────────────────────┘
//
// The state machine lives here, independent of Vulkan handles. The renderer
// implements `FrameTarget` to perform each step against the GPU.

use anyhow::Result;
use ash::vk;

/// Frames the CPU may prepare while the GPU is still working on earlier ones
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Whether the swapchain still matches the surface exactly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Optimal,
    /// Usable, but should be recreated
    Suboptimal,
}

impl SwapchainStatus {
    pub fn from_suboptimal(suboptimal: bool) -> Self {
        if suboptimal {
            Self::Suboptimal
        } else {
            Self::Optimal
        }
    }
}

/// Errors on the acquire/present path. Only `OutOfDate` is recoverable.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("swapchain is out of date")]
    OutOfDate,
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<vk::Result> for FrameError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            other => Self::Fatal(anyhow::Error::new(other)),
        }
    }
}

/// One step of the frame, performed against a concrete renderer
pub trait FrameTarget {
    /// Current size of the window's drawable area
    fn drawable_extent(&self) -> vk::Extent2D;

    /// Block until the GPU has finished the last submission from `slot`
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    fn acquire_image(&mut self, slot: usize) -> Result<(u32, SwapchainStatus), FrameError>;

    /// Mark the slot's fence unsignaled ahead of a new submission
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    fn update_uniforms(&mut self, slot: usize) -> Result<()>;

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn submit(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<SwapchainStatus, FrameError>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Destroy and rebuild every swapchain-dependent resource at `extent`
    fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, then the swapchain was rebuilt
    PresentedAndRecreated,
    /// Nothing was submitted (out-of-date acquire or zero-sized window)
    Skipped,
}

/// Round-robin slot tracking plus the resize/recreate flags
#[derive(Debug, Default)]
pub struct FrameLoop {
    current_slot: usize,
    frames_submitted: u64,
    recreations: u64,
    framebuffer_resized: bool,
    recreate_pending: bool,
}

impl FrameLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    /// Called from the window's resize handler; consumed at present time.
    /// Returns true when the new size is drawable, in which case the caller
    /// must request a redraw: a suspended loop requests none on its own.
    pub fn notify_resized(&mut self, extent: vk::Extent2D) -> bool {
        self.framebuffer_resized = true;
        extent.width > 0 && extent.height > 0
    }

    /// True while a recreation waits for a non-zero drawable area
    pub fn is_suspended(&self) -> bool {
        self.recreate_pending
    }

    pub fn draw_frame<T: FrameTarget>(&mut self, target: &mut T) -> Result<FrameOutcome> {
        if self.recreate_pending && !self.recreate_swapchain(target)? {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.current_slot;

        // STEP 1: Wait until the GPU is done with this slot
        target.wait_for_slot(slot)?;

        // STEP 2: Acquire next swapchain image
        let image_index = match target.acquire_image(slot) {
            Ok((index, _)) => index,
            Err(FrameError::OutOfDate) => {
                log::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain(target)?;
                return Ok(FrameOutcome::Skipped);
            }
            Err(FrameError::Fatal(e)) => {
                return Err(e.context("Failed to acquire swap chain image"));
            }
        };

        // Only reset once we know work will be submitted, or the next wait
        // on this slot would never return
        target.reset_slot(slot)?;

        // STEP 3: Record
        target.update_uniforms(slot)?;
        target.record(slot, image_index)?;

        // STEP 4: Submit
        target.submit(slot)?;

        // STEP 5: Present
        let needs_recreate = match target.present(slot, image_index) {
            Ok(SwapchainStatus::Optimal) => self.framebuffer_resized,
            Ok(SwapchainStatus::Suboptimal) | Err(FrameError::OutOfDate) => true,
            Err(FrameError::Fatal(e)) => {
                return Err(e.context("Failed to present swap chain image"));
            }
        };

        let outcome = if needs_recreate && self.recreate_swapchain(target)? {
            FrameOutcome::PresentedAndRecreated
        } else {
            FrameOutcome::Presented
        };

        // STEP 6: Advance to next frame
        self.current_slot = (self.current_slot + 1) % MAX_FRAMES_IN_FLIGHT;
        self.frames_submitted += 1;

        Ok(outcome)
    }

    /// Returns false when the drawable area is empty and the rebuild has
    /// been deferred
    fn recreate_swapchain<T: FrameTarget>(&mut self, target: &mut T) -> Result<bool> {
        let extent = target.drawable_extent();
        if extent.width == 0 || extent.height == 0 {
            if !self.recreate_pending {
                log::debug!("Drawable area is empty, deferring swapchain recreation");
            }
            self.recreate_pending = true;
            return Ok(false);
        }

        // No in-flight command buffer may reference what is about to go
        target.wait_idle()?;
        target.rebuild_swapchain(extent)?;

        self.recreate_pending = false;
        self.framebuffer_resized = false;
        self.recreations += 1;

        log::info!("Swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Uniforms(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        WaitIdle,
        Rebuild,
    }

    /// Simulates the GPU: a submitted slot stays in flight until its fence
    /// is waited on, or the device goes idle.
    struct MockTarget {
        calls: Vec<Call>,
        extent: vk::Extent2D,
        in_flight: [bool; MAX_FRAMES_IN_FLIGHT],
        acquire_results: VecDeque<Result<SwapchainStatus, FrameError>>,
        present_results: VecDeque<Result<SwapchainStatus, FrameError>>,
        next_image: u32,
        violations: Vec<String>,
    }

    impl MockTarget {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                extent: vk::Extent2D { width: 800, height: 600 },
                in_flight: [false; MAX_FRAMES_IN_FLIGHT],
                acquire_results: VecDeque::new(),
                present_results: VecDeque::new(),
                next_image: 0,
                violations: Vec::new(),
            }
        }

        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }

        fn recorded_slots(&self) -> Vec<usize> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Record(slot, _) => Some(*slot),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameTarget for MockTarget {
        fn drawable_extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.in_flight[slot] = false;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<(u32, SwapchainStatus), FrameError> {
            self.calls.push(Call::Acquire(slot));
            let status = self
                .acquire_results
                .pop_front()
                .unwrap_or(Ok(SwapchainStatus::Optimal))?;
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok((index, status))
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            Ok(())
        }

        fn update_uniforms(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Uniforms(slot));
            if self.in_flight[slot] {
                self.violations.push(format!("uniforms of slot {} written while in flight", slot));
            }
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.calls.push(Call::Record(slot, image_index));
            if self.in_flight[slot] {
                self.violations.push(format!("slot {} recorded while in flight", slot));
            }
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Submit(slot));
            self.in_flight[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<SwapchainStatus, FrameError> {
            self.calls.push(Call::Present(slot, image_index));
            self.present_results
                .pop_front()
                .unwrap_or(Ok(SwapchainStatus::Optimal))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.calls.push(Call::WaitIdle);
            self.in_flight = [false; MAX_FRAMES_IN_FLIGHT];
            Ok(())
        }

        fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
            self.calls.push(Call::Rebuild);
            if self.in_flight.iter().any(|&busy| busy) {
                self.violations.push("swapchain rebuilt with work in flight".to_string());
            }
            if extent.width == 0 || extent.height == 0 {
                self.violations.push("swapchain rebuilt with zero extent".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn slots_cycle_modulo_frames_in_flight() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();

        for _ in 0..5 {
            assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Presented);
        }

        assert_eq!(target.recorded_slots(), vec![0, 1, 0, 1, 0]);
        assert_eq!(frames.frames_submitted(), 5);
        assert_eq!(frames.current_slot(), 1);
        assert!(target.violations.is_empty(), "{:?}", target.violations);
    }

    #[test]
    fn steps_run_in_order() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();

        frames.draw_frame(&mut target).unwrap();

        assert_eq!(
            target.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Uniforms(0),
                Call::Record(0, 0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
    }

    #[test]
    fn slot_is_waited_on_before_every_reuse() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();

        for _ in 0..8 {
            frames.draw_frame(&mut target).unwrap();
        }

        for (i, call) in target.calls.iter().enumerate() {
            if let Call::Record(slot, _) = call {
                let last_wait = target.calls[..i]
                    .iter()
                    .rposition(|c| *c == Call::Wait(*slot));
                let last_submit = target.calls[..i]
                    .iter()
                    .rposition(|c| *c == Call::Submit(*slot));
                if let Some(submit) = last_submit {
                    assert!(last_wait.unwrap() > submit);
                }
            }
        }
        assert!(target.violations.is_empty(), "{:?}", target.violations);
    }

    #[test]
    fn out_of_date_acquire_recreates_without_advancing() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();
        target.acquire_results.push_back(Err(FrameError::OutOfDate));

        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Skipped);
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.recreations(), 1);
        assert_eq!(target.count(&Call::Submit(0)), 0);
        assert_eq!(target.count(&Call::Reset(0)), 0);

        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Presented);
        assert_eq!(target.recorded_slots(), vec![0]);
    }

    #[test]
    fn suboptimal_acquire_still_draws() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();
        target.acquire_results.push_back(Ok(SwapchainStatus::Suboptimal));

        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Presented);
        assert_eq!(frames.recreations(), 0);
    }

    #[test]
    fn suboptimal_or_out_of_date_present_recreates_and_advances() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();
        target.present_results.push_back(Ok(SwapchainStatus::Suboptimal));
        target.present_results.push_back(Err(FrameError::OutOfDate));

        assert_eq!(
            frames.draw_frame(&mut target).unwrap(),
            FrameOutcome::PresentedAndRecreated
        );
        assert_eq!(frames.current_slot(), 1);
        assert_eq!(
            frames.draw_frame(&mut target).unwrap(),
            FrameOutcome::PresentedAndRecreated
        );
        assert_eq!(frames.current_slot(), 0);
        assert_eq!(frames.recreations(), 2);
    }

    #[test]
    fn idle_wait_precedes_every_rebuild() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();
        target.present_results.push_back(Ok(SwapchainStatus::Suboptimal));

        frames.draw_frame(&mut target).unwrap();
        frames.draw_frame(&mut target).unwrap();

        let rebuild = target.calls.iter().position(|c| *c == Call::Rebuild).unwrap();
        assert_eq!(target.calls[rebuild - 1], Call::WaitIdle);
        assert!(target.violations.is_empty(), "{:?}", target.violations);
    }

    #[test]
    fn one_rebuild_per_resize_event() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();

        frames.notify_resized(target.extent);
        for _ in 0..3 {
            frames.draw_frame(&mut target).unwrap();
        }
        assert_eq!(frames.recreations(), 1);

        frames.notify_resized(target.extent);
        for _ in 0..3 {
            frames.draw_frame(&mut target).unwrap();
        }
        assert_eq!(frames.recreations(), 2);
        assert_eq!(target.count(&Call::Rebuild), 2);
    }

    #[test]
    fn minimized_window_defers_recreation() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();

        target.extent = vk::Extent2D { width: 0, height: 0 };
        assert!(!frames.notify_resized(target.extent));

        // Presents once, then the rebuild is deferred
        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Presented);
        assert!(frames.is_suspended());
        assert_eq!(frames.recreations(), 0);

        let acquires = target.count(&Call::Acquire(1));
        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Skipped);
        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Skipped);
        assert_eq!(target.count(&Call::Acquire(1)), acquires);

        // Restored: one rebuild, then drawing resumes
        target.extent = vk::Extent2D { width: 1024, height: 768 };
        assert!(frames.notify_resized(target.extent));
        assert_eq!(frames.draw_frame(&mut target).unwrap(), FrameOutcome::Presented);
        assert!(!frames.is_suspended());
        assert_eq!(frames.recreations(), 1);
        assert!(target.violations.is_empty(), "{:?}", target.violations);
    }

    #[test]
    fn only_drawable_sizes_ask_for_a_redraw() {
        let mut frames = FrameLoop::new();

        assert!(!frames.notify_resized(vk::Extent2D { width: 0, height: 0 }));
        assert!(!frames.notify_resized(vk::Extent2D { width: 640, height: 0 }));
        assert!(frames.notify_resized(vk::Extent2D { width: 1, height: 1 }));
    }

    #[test]
    fn fatal_acquire_error_propagates() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();
        target
            .acquire_results
            .push_back(Err(FrameError::from(vk::Result::ERROR_DEVICE_LOST)));

        let err = frames.draw_frame(&mut target).unwrap_err();
        assert!(format!("{:#}", err).contains("acquire"));
        assert_eq!(frames.recreations(), 0);
    }

    #[test]
    fn fatal_present_error_propagates() {
        let mut frames = FrameLoop::new();
        let mut target = MockTarget::new();
        target
            .present_results
            .push_back(Err(FrameError::from(vk::Result::ERROR_SURFACE_LOST_KHR)));

        assert!(frames.draw_frame(&mut target).is_err());
        assert_eq!(frames.frames_submitted(), 0);
    }

    #[test]
    fn vulkan_results_map_to_error_kinds() {
        assert!(matches!(
            FrameError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            FrameError::OutOfDate
        ));
        assert!(matches!(
            FrameError::from(vk::Result::ERROR_DEVICE_LOST),
            FrameError::Fatal(_)
        ));
    }
}
