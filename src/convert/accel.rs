//! Compute-shader converter
//!
//! Input, output and staging buffers are created once per session and reused
//! for every frame. Each frame is one dispatch (two when grey runs as its own
//! pass); results are copied out into freshly allocated frame buffers.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, instrument};
use wgpu::*;

use crate::capture::frame::{ColorOrder, Frame, PixelLayout, RawFrame, Resolution};
use crate::convert::{alloc_outputs, yuv, AccelerationContext, ConverterKind, ConverterParams, FrameConverter, FrameGate, Produced};
use crate::error::ConvertError;

const WORKGROUP_SIZE: u32 = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    width: u32,
    height: u32,
    chroma_width: u32,
    bgra: u32,
}

struct Readback {
    output: Buffer,
    staging: Buffer,
    len: u64,
}

pub struct AcceleratedConverter {
    gate: FrameGate,
    params: ConverterParams,
    ctx: Arc<AccelerationContext>,
    passes: Vec<ComputePipeline>,
    bind_group: BindGroup,
    input: Buffer,
    rgba: Readback,
    grey: Option<Readback>,
    workgroups: u32,
    packed: Vec<u8>,
}

fn acceleration_error(err: impl std::fmt::Display) -> ConvertError {
    ConvertError::Acceleration(err.to_string())
}

/// The kernel packs four pixels per invocation
pub fn check_kernel_size(layout: PixelLayout, res: Resolution) -> Result<(), ConvertError> {
    if !layout.is_convertible() {
        return Err(ConvertError::UnsupportedLayout(layout));
    }
    if res.is_empty() || res.width % 4 != 0 {
        return Err(acceleration_error(format!(
            "{res} is not supported by the compute kernel"
        )));
    }
    Ok(())
}

impl AcceleratedConverter {
    /// Build the session's kernel and buffers.
    ///
    /// Fails when the width is not a multiple of four, the frame exceeds the
    /// device's storage limits, or the device rejects any of the objects.
    #[instrument(skip_all, fields(camera = %params.camera_id, resolution = %params.resolution))]
    pub fn new(params: ConverterParams, ctx: Arc<AccelerationContext>) -> Result<Self, ConvertError> {
        check_kernel_size(params.layout, params.resolution)?;
        let res = params.resolution;
        let device = ctx.device();
        let max_binding = u64::from(device.limits().max_storage_buffer_binding_size);
        if res.rgba_len() as u64 > max_binding {
            return Err(acceleration_error(format!(
                "{res} exceeds the device storage limit of {max_binding} bytes"
            )));
        }

        device.push_error_scope(ErrorFilter::Validation);
        device.push_error_scope(ErrorFilter::OutOfMemory);
        let built = Self::build(params, ctx.clone());
        let oom = pollster::block_on(device.pop_error_scope());
        let invalid = pollster::block_on(device.pop_error_scope());
        if let Some(err) = oom.or(invalid) {
            return Err(acceleration_error(err));
        }
        let converter = built?;
        debug!(passes = converter.passes.len(), "Accelerated converter ready");
        Ok(converter)
    }

    fn build(params: ConverterParams, ctx: Arc<AccelerationContext>) -> Result<Self, ConvertError> {
        let device = ctx.device();
        let res = params.resolution;
        let (chroma_width, _) = yuv::chroma_dims(res);
        let input_len = yuv::i420_len(res);

        let mut packed = Vec::new();
        packed
            .try_reserve_exact(input_len)
            .map_err(|_| ConvertError::OutOfMemory { bytes: input_len })?;

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("yuv_to_rgba"),
            source: ShaderSource::Wgsl(include_str!("yuv_to_rgba.wgsl").into()),
        });

        let storage = |binding: u32, read_only: bool| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("yuv_to_rgba layout"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage(1, true),
                storage(2, false),
                storage(3, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("yuv_to_rgba pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let entry_points: &[&str] = match (params.grey, params.grey_separate) {
            (false, _) => &["convert_rgba"],
            (true, false) => &["convert_fused"],
            (true, true) => &["convert_rgba", "convert_grey"],
        };
        let passes = entry_points
            .iter()
            .map(|&entry| {
                device.create_compute_pipeline(&ComputePipelineDescriptor {
                    label: Some(entry),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .collect();

        let uniforms = Params {
            width: res.width,
            height: res.height,
            chroma_width: chroma_width as u32,
            bgra: u32::from(params.color_order == ColorOrder::Bgra),
        };
        let uniform = device.create_buffer(&BufferDescriptor {
            label: Some("yuv_to_rgba params"),
            size: std::mem::size_of::<Params>() as u64,
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        ctx.queue().write_buffer(&uniform, 0, bytemuck::bytes_of(&uniforms));

        let input = device.create_buffer(&BufferDescriptor {
            label: Some("yuv input"),
            size: input_len as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let rgba = Self::readback(device, "rgba", res.rgba_len() as u64);
        let grey = params
            .grey
            .then(|| Self::readback(device, "grey", res.pixel_count() as u64));
        // the layout always binds a grey buffer, even when no pass writes it
        let grey_placeholder;
        let grey_binding = match &grey {
            Some(readback) => &readback.output,
            None => {
                grey_placeholder = device.create_buffer(&BufferDescriptor {
                    label: Some("grey placeholder"),
                    size: 4,
                    usage: BufferUsages::STORAGE,
                    mapped_at_creation: false,
                });
                &grey_placeholder
            }
        };

        let bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("yuv_to_rgba bindings"),
            layout: &layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: uniform.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: input.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: rgba.output.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 3,
                    resource: grey_binding.as_entire_binding(),
                },
            ],
        });

        let quads = (res.width / 4) * res.height;
        Ok(Self {
            gate: FrameGate::new(&params),
            workgroups: quads.div_ceil(WORKGROUP_SIZE),
            params,
            passes,
            bind_group,
            input,
            rgba,
            grey,
            packed,
            ctx,
        })
    }

    fn readback(device: &Device, label: &str, len: u64) -> Readback {
        let output = device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size: len,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size: len,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Readback {
            output,
            staging,
            len,
        }
    }

    fn dispatch(&self) {
        let mut encoder = self
            .ctx
            .device()
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("yuv_to_rgba"),
            });
        for pipeline in &self.passes {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("yuv_to_rgba pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(self.workgroups, 1, 1);
        }
        for readback in std::iter::once(&self.rgba).chain(self.grey.as_ref()) {
            encoder.copy_buffer_to_buffer(&readback.output, 0, &readback.staging, 0, readback.len);
        }
        self.ctx.queue().submit(Some(encoder.finish()));
    }

    /// Map a staging buffer and copy it into `out`
    fn read(&self, readback: &Readback, out: &mut [u8]) -> Result<(), ConvertError> {
        let slice = readback.staging.slice(..);
        let (tx, rx) = flume::bounded(1);
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.ctx.device().poll(Maintain::Wait);
        rx.recv()
            .map_err(acceleration_error)?
            .map_err(acceleration_error)?;
        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped);
        }
        readback.staging.unmap();
        Ok(())
    }
}

impl FrameConverter for AcceleratedConverter {
    fn kind(&self) -> ConverterKind {
        ConverterKind::Accelerated
    }

    fn gate(&mut self) -> &mut FrameGate {
        &mut self.gate
    }

    fn produce_frame(&mut self, raw: &RawFrame, timestamp: u64) -> Result<Produced, ConvertError> {
        let res: Resolution = raw.resolution();
        if res != self.params.resolution {
            return Err(ConvertError::BufferSize {
                what: "frame",
                expected: self.params.resolution.rgba_len(),
                actual: res.rgba_len(),
            });
        }

        yuv::repack_planar(&raw.planes, res, &mut self.packed)?;
        self.ctx.queue().write_buffer(&self.input, 0, &self.packed);
        self.dispatch();

        let (mut rgba, mut grey) = alloc_outputs(res, self.params.grey)?;
        self.read(&self.rgba, &mut rgba)?;
        if let (Some(readback), Some(out)) = (self.grey.as_ref(), grey.as_mut()) {
            self.read(readback, out)?;
        }

        let frame = Frame::new(
            self.params.camera_id.clone(),
            self.params.color_order,
            timestamp,
            res,
            rgba,
            grey,
        )?;
        Ok(Produced::Frame(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_size_needs_width_multiple_of_four() {
        let layout = PixelLayout::Planar420;
        assert!(check_kernel_size(layout, Resolution::new(640, 480)).is_ok());
        assert!(check_kernel_size(layout, Resolution::new(4, 1)).is_ok());
        for res in [
            Resolution::new(0, 480),
            Resolution::new(640, 0),
            Resolution::new(6, 4),
            Resolution::new(642, 480),
        ] {
            assert!(
                matches!(check_kernel_size(layout, res), Err(ConvertError::Acceleration(_))),
                "{res} accepted"
            );
        }
    }

    #[test]
    fn kernel_rejects_compressed_layouts() {
        assert!(matches!(
            check_kernel_size(PixelLayout::Jpeg, Resolution::new(640, 480)),
            Err(ConvertError::UnsupportedLayout(PixelLayout::Jpeg))
        ));
    }
}
