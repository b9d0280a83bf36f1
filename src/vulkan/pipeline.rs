use std::ffi::CStr;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;

use crate::error::RenderError;
use crate::shader_interface::PushConstants;

use super::context::Context;

const SHADER_ENTRY_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Loads a pre-compiled SPIR-V program, trying each search path in order.
pub fn load_program(
    search_paths: &[PathBuf],
    file_name: &str,
) -> Result<Vec<u32>, RenderError> {
    let path = find_program(search_paths, file_name)
        .ok_or_else(|| RenderError::ProgramNotFound(PathBuf::from(file_name)))?;

    let bytes =
        std::fs::read(&path).map_err(|_| RenderError::ProgramNotFound(path.clone()))?;
    ash::util::read_spv(&mut Cursor::new(&bytes))
        .map_err(|_| RenderError::ProgramInvalid(path))
}

fn find_program(search_paths: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    search_paths
        .iter()
        .map(|search_path| search_path.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// Compiled compute program plus the pipeline layout it dispatches with.
pub struct ComputePipeline {
    context: Arc<Context>,
    shader_module: vk::ShaderModule,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl ComputePipeline {
    pub fn new(
        context: Arc<Context>,
        code: &[u32],
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<Self, RenderError> {
        let device = &context.device;

        let shader_module = {
            let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
            unsafe { device.create_shader_module(&create_info, None) }?
        };

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<PushConstants>() as u32)
            .build();

        let pipeline_layout = {
            let create_info = vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(std::slice::from_ref(&set_layout))
                .push_constant_ranges(std::slice::from_ref(&push_constant_range));
            match unsafe { device.create_pipeline_layout(&create_info, None) } {
                Ok(layout) => layout,
                Err(err) => {
                    unsafe { device.destroy_shader_module(shader_module, None) };
                    return Err(err.into());
                }
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(SHADER_ENTRY_NAME);

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage.build())
            .layout(pipeline_layout);

        let pipeline = match unsafe {
            device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
                unsafe { device.destroy_shader_module(shader_module, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            context,
            shader_module,
            pipeline_layout,
            pipeline,
        })
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_pipeline(self.pipeline, None) };
        unsafe { device.destroy_pipeline_layout(self.pipeline_layout, None) };
        unsafe { device.destroy_shader_module(self.shader_module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_reports_not_found() {
        let search_paths = [PathBuf::from("shaders"), std::env::temp_dir()];
        let err = load_program(&search_paths, "does-not-exist.comp.spv").unwrap_err();
        assert!(matches!(err, RenderError::ProgramNotFound(_)));
    }

    #[test]
    fn program_is_found_on_a_later_search_path() {
        let dir = std::env::temp_dir();
        let path = dir.join("raybake_find_program_test.spv");
        std::fs::write(&path, [0u8; 8]).unwrap();

        let search_paths = [PathBuf::from("definitely-missing"), dir];
        let found = find_program(&search_paths, "raybake_find_program_test.spv").unwrap();
        assert_eq!(found, path);

        std::fs::remove_file(path).ok();
    }
}
