use std::sync::Arc;

use ash::vk::{self};

use crate::error::RenderError;

use super::{command_pool::CommandPool, context::Context};

/// One queue, one recording context in flight. `begin_one_shot` hands out a
/// context that borrows the engine mutably, so a second context cannot be
/// opened until `submit_and_wait` has returned.
pub struct CommandEngine {
    context: Arc<Context>,
    command_pool: CommandPool,
}

impl CommandEngine {
    pub fn new(context: Arc<Context>) -> Result<Self, RenderError> {
        let command_pool = CommandPool::new(context.clone())?;
        Ok(Self {
            context,
            command_pool,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Allocates a fresh command buffer and begins a one-time-submit
    /// recording.
    pub fn begin_one_shot(&mut self) -> Result<CommandContext<'_>, RenderError> {
        let device = &self.context.device;

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(*self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info) }?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(err) = unsafe { device.begin_command_buffer(command_buffer, &begin_info) } {
            unsafe {
                device.free_command_buffers(
                    *self.command_pool,
                    std::slice::from_ref(&command_buffer),
                )
            };
            return Err(err.into());
        }

        Ok(CommandContext {
            command_buffer,
            engine: self,
        })
    }
}

/// A single-use recording scope: record, then `submit_and_wait` exactly once.
/// The backing storage is released when the context goes away, submitted or
/// not.
#[must_use]
pub struct CommandContext<'a> {
    command_buffer: vk::CommandBuffer,
    engine: &'a mut CommandEngine,
}

/// Proof that a submission has been waited on to completion. Only
/// `submit_and_wait` constructs one; APIs that need "the device is done with
/// those commands" take it as a parameter.
pub struct CompletionToken(());

impl CommandContext<'_> {
    pub fn context(&self) -> &Arc<Context> {
        &self.engine.context
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Ends recording, submits to the queue, and blocks until the device
    /// signals the fence. This is the only place the calling thread stalls.
    pub fn submit_and_wait(self) -> Result<CompletionToken, RenderError> {
        let context = self.engine.context.clone();
        let device = &context.device;
        let command_buffer = self.command_buffer;

        unsafe { device.end_command_buffer(command_buffer) }
            .map_err(RenderError::SubmissionFailure)?;

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;

        let submit_info =
            vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));

        let submitted = unsafe {
            device.queue_submit(context.queue, std::slice::from_ref(&submit_info), fence)
        };
        let waited = submitted.and_then(|()| unsafe {
            device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        });

        unsafe { device.destroy_fence(fence, None) };

        waited.map_err(RenderError::SubmissionFailure)?;

        Ok(CompletionToken(()))
    }
}

impl Drop for CommandContext<'_> {
    fn drop(&mut self) {
        unsafe {
            self.engine.context.device.free_command_buffers(
                *self.engine.command_pool,
                std::slice::from_ref(&self.command_buffer),
            )
        }
    }
}
