use ash::vk;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, Subsystem, VkResultExt};
use crate::FRAMES_IN_FLIGHT;

/// Semaphores and fence owned by one frame slot.
pub struct FrameSyncPrimitives {
    device: Arc<ash::Device>,
    pub image_available_semaphore: vk::Semaphore,
    pub render_finished_semaphore: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSyncPrimitives {
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        let semaphore_create_info = vk::SemaphoreCreateInfo::builder();

        let image_available_semaphore =
            unsafe { device.create_semaphore(&semaphore_create_info, None) }
                .in_subsystem(Subsystem::FrameCoordinator, "vkCreateSemaphore (image available)")?;

        let created = unsafe { device.create_semaphore(&semaphore_create_info, None) };
        let render_finished_semaphore = match created {
            Ok(semaphore) => semaphore,
            Err(result) => {
                unsafe { device.destroy_semaphore(image_available_semaphore, None) };
                let operation = "vkCreateSemaphore (render finished)";
                return Err(result).in_subsystem(Subsystem::FrameCoordinator, operation);
            }
        };

        // Signaled so the first wait on a fresh slot returns immediately.
        let fence_create_info =
            vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight_fence = match unsafe { device.create_fence(&fence_create_info, None) } {
            Ok(fence) => fence,
            Err(result) => {
                unsafe {
                    device.destroy_semaphore(image_available_semaphore, None);
                    device.destroy_semaphore(render_finished_semaphore, None);
                }
                return Err(result).in_subsystem(Subsystem::FrameCoordinator, "vkCreateFence");
            }
        };

        Ok(Self {
            device,
            image_available_semaphore,
            render_finished_semaphore,
            in_flight_fence,
        })
    }

    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .in_subsystem(Subsystem::FrameCoordinator, "vkWaitForFences")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.in_flight_fence]) }
            .in_subsystem(Subsystem::FrameCoordinator, "vkResetFences")
    }

    pub fn is_signaled(&self) -> Result<bool> {
        unsafe { self.device.get_fence_status(self.in_flight_fence) }
            .in_subsystem(Subsystem::FrameCoordinator, "vkGetFenceStatus")
    }
}

impl Drop for FrameSyncPrimitives {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.image_available_semaphore, None);
            self.device.destroy_semaphore(self.render_finished_semaphore, None);
            self.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Read access to the per-slot fences.
///
/// Atlas recreation waits on the fences of every slot other than the current
/// one before rewriting their descriptor sets. The seam lets that ordering be
/// checked without a device.
pub trait SlotFences {
    fn slot_count(&self) -> usize;
    /// Blocks until `slot`'s last submission has finished.
    fn wait(&self, slot: usize) -> Result<()>;
    fn is_signaled(&self, slot: usize) -> Result<bool>;
}

impl SlotFences for Vec<FrameSyncPrimitives> {
    fn slot_count(&self) -> usize {
        self.len()
    }

    fn wait(&self, slot: usize) -> Result<()> {
        self[slot].wait()
    }

    fn is_signaled(&self, slot: usize) -> Result<bool> {
        self[slot].is_signaled()
    }
}

/// Waits on every slot's fence. Used by resize and surface rebuilds.
pub fn wait_all(fences: &dyn SlotFences) -> Result<()> {
    for slot in 0..fences.slot_count() {
        fences.wait(slot)?;
    }
    Ok(())
}

/// Waits on every slot's fence except `current`.
pub fn wait_others(fences: &dyn SlotFences, current: usize) -> Result<()> {
    for slot in (0..fences.slot_count()).filter(|&slot| slot != current) {
        trace!("Waiting on slot {} before rewriting its descriptors.", slot);
        fences.wait(slot)?;
    }
    Ok(())
}

/// Round-robin slot bookkeeping for the frame coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePacer {
    current: usize,
    submitted: u64,
    in_flight: [bool; FRAMES_IN_FLIGHT],
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePacer {
    pub const fn new() -> Self {
        Self {
            current: 0,
            submitted: 0,
            in_flight: [false; FRAMES_IN_FLIGHT],
        }
    }

    /// Slot the next frame will use.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Number of frames submitted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Records that the current slot's fence has been waited on.
    pub fn retire_current(&mut self) {
        self.in_flight[self.current] = false;
    }

    pub fn retire_all(&mut self) {
        self.in_flight = [false; FRAMES_IN_FLIGHT];
    }

    /// Records a submission on the current slot and moves to the next one.
    pub fn submit_and_advance(&mut self) -> usize {
        let slot = self.current;
        self.in_flight[slot] = true;
        self.submitted += 1;
        self.current = (self.current + 1) % FRAMES_IN_FLIGHT;
        slot
    }

    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.in_flight[slot]
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.iter().filter(|&&busy| busy).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Fences that record the order in which slots were waited on.
    pub(crate) struct RecordingFences {
        pub signaled: RefCell<Vec<bool>>,
        pub waits: RefCell<Vec<usize>>,
    }

    impl RecordingFences {
        pub(crate) fn new(signaled: &[bool]) -> Self {
            Self {
                signaled: RefCell::new(signaled.to_vec()),
                waits: RefCell::new(Vec::new()),
            }
        }
    }

    impl SlotFences for RecordingFences {
        fn slot_count(&self) -> usize {
            self.signaled.borrow().len()
        }

        fn wait(&self, slot: usize) -> Result<()> {
            self.waits.borrow_mut().push(slot);
            self.signaled.borrow_mut()[slot] = true;
            Ok(())
        }

        fn is_signaled(&self, slot: usize) -> Result<bool> {
            Ok(self.signaled.borrow()[slot])
        }
    }

    #[test]
    fn wait_others_skips_current_slot() {
        let fences = RecordingFences::new(&[true, false, false]);
        wait_others(&fences, 0).unwrap();
        assert_eq!(*fences.waits.borrow(), vec![1, 2]);
        assert!((0..3).all(|slot| fences.is_signaled(slot).unwrap()));
    }

    #[test]
    fn wait_all_visits_every_slot() {
        let fences = RecordingFences::new(&[false, false, false]);
        wait_all(&fences).unwrap();
        assert_eq!(*fences.waits.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn slots_are_reused_every_n_frames() {
        let mut pacer = FramePacer::new();
        let mut used = Vec::new();
        for _ in 0..10 {
            pacer.retire_current();
            used.push(pacer.submit_and_advance());
        }
        assert_eq!(used, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
        for (frame, &slot) in used.iter().enumerate().skip(FRAMES_IN_FLIGHT) {
            assert_eq!(slot, used[frame - FRAMES_IN_FLIGHT]);
        }
        assert_eq!(pacer.submitted(), 10);
        assert_eq!(pacer.current_slot(), 10 % FRAMES_IN_FLIGHT);
    }

    #[test]
    fn in_flight_count_never_exceeds_slot_count() {
        let mut pacer = FramePacer::new();
        for frame in 0..10 {
            pacer.retire_current();
            pacer.submit_and_advance();
            assert_eq!(pacer.in_flight_count(), (frame + 1).min(FRAMES_IN_FLIGHT));
        }
        pacer.retire_all();
        assert_eq!(pacer.in_flight_count(), 0);
    }
}
