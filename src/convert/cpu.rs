use crate::capture::frame::{Frame, PixelLayout, RawFrame};
use crate::convert::{alloc_outputs, yuv, ConverterKind, ConverterParams, FrameConverter, FrameGate, Produced};
use crate::error::ConvertError;
use crate::pipeline::sink::YuvFrame;

/// Byte-shuffling converter running entirely on the worker thread.
///
/// Planar frames are repacked into contiguous I420 and handed to the sink's
/// `enqueue_yuv`; semi-planar frames are converted here straight from their
/// strided planes.
pub struct CpuConverter {
    gate: FrameGate,
    params: ConverterParams,
}

impl CpuConverter {
    pub fn new(params: ConverterParams) -> Result<Self, ConvertError> {
        if !params.layout.is_convertible() {
            return Err(ConvertError::UnsupportedLayout(params.layout));
        }
        Ok(Self {
            gate: FrameGate::new(&params),
            params,
        })
    }

    fn planar(&self, raw: &RawFrame, timestamp: u64) -> Result<Produced, ConvertError> {
        let resolution = raw.resolution();
        let len = yuv::i420_len(resolution);
        let mut packed = Vec::new();
        packed
            .try_reserve_exact(len)
            .map_err(|_| ConvertError::OutOfMemory { bytes: len })?;
        yuv::repack_planar(&raw.planes, resolution, &mut packed)?;

        let (rgba, grey) = alloc_outputs(resolution, self.params.grey)?;
        Ok(Produced::Yuv(YuvFrame {
            camera_id: self.params.camera_id.clone(),
            color_order: self.params.color_order,
            timestamp,
            resolution,
            yuv: packed,
            rgba,
            grey,
        }))
    }

    fn semi_planar(&self, raw: &RawFrame, timestamp: u64) -> Result<Produced, ConvertError> {
        let resolution = raw.resolution();
        let (mut rgba, mut grey) = alloc_outputs(resolution, self.params.grey)?;
        yuv::semi_planar_to_rgba(
            &raw.planes,
            resolution,
            self.params.color_order,
            &mut rgba,
            grey.as_deref_mut(),
        )?;
        let frame = Frame::new(
            self.params.camera_id.clone(),
            self.params.color_order,
            timestamp,
            resolution,
            rgba,
            grey,
        )?;
        Ok(Produced::Frame(frame))
    }
}

impl FrameConverter for CpuConverter {
    fn kind(&self) -> ConverterKind {
        ConverterKind::Cpu
    }

    fn gate(&mut self) -> &mut FrameGate {
        &mut self.gate
    }

    fn produce_frame(&mut self, raw: &RawFrame, timestamp: u64) -> Result<Produced, ConvertError> {
        match raw.layout {
            PixelLayout::Planar420 => self.planar(raw, timestamp),
            PixelLayout::SemiPlanar420 => self.semi_planar(raw, timestamp),
            other => Err(ConvertError::UnsupportedLayout(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Resolution;
    use crate::convert::tests::{planar_frame, semi_planar_frame, params, TestHost, TestSink};
    use crate::convert::FrameOutcome;
    use std::sync::Arc;

    #[test]
    fn planar_output_sizes() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(6, 4);
        let mut conv = CpuConverter::new(params(PixelLayout::Planar420, res, true, sink.clone())).unwrap();
        assert_eq!(
            conv.on_frame_available(&planar_frame(res), &TestHost::default()),
            FrameOutcome::Delivered
        );

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames[0].rgba.len(), 6 * 4 * 4);
        assert_eq!(frames[0].grey.as_ref().map(|g| g.len()), Some(6 * 4));
    }

    #[test]
    fn semi_planar_output_sizes() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(8, 6);
        let mut conv = CpuConverter::new(params(PixelLayout::SemiPlanar420, res, true, sink.clone())).unwrap();
        conv.on_frame_available(&semi_planar_frame(res), &TestHost::default());

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames[0].rgba.len(), 8 * 6 * 4);
        assert_eq!(frames[0].grey.as_ref().map(|g| g.len()), Some(8 * 6));
    }

    #[test]
    fn grey_off_omits_buffer() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(4, 4);
        let mut conv = CpuConverter::new(params(PixelLayout::Planar420, res, false, sink.clone())).unwrap();
        conv.on_frame_available(&planar_frame(res), &TestHost::default());
        assert!(sink.frames.lock().unwrap()[0].grey.is_none());
    }

    #[test]
    fn rejects_unconvertible_layout() {
        let sink = Arc::new(TestSink::default());
        assert!(matches!(
            CpuConverter::new(params(PixelLayout::Jpeg, Resolution::new(4, 4), false, sink)),
            Err(ConvertError::UnsupportedLayout(PixelLayout::Jpeg))
        ));
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let sink = Arc::new(TestSink::default());
        let res = Resolution::new(4, 4);
        let mut conv = CpuConverter::new(params(PixelLayout::Planar420, res, false, sink.clone())).unwrap();
        let mut raw = planar_frame(res);
        raw.planes[2].data = raw.planes[2].data.slice(..1);
        assert_eq!(
            conv.on_frame_available(&raw, &TestHost::default()),
            FrameOutcome::Failed
        );
        assert!(sink.frames.lock().unwrap().is_empty());
    }
}
