//! Turns one graph-owned buffer into an owned, three-channel frame

use std::ops::Deref;
use std::time::Instant;

use bytes::Bytes;

use crate::capture::frame::{strip_padding, DecodedFrame, FrameGeometry, FrameMetadata, WireFormat};
use crate::error::{DropReason, MapError};

/// A buffer lent to us by the media graph for the duration of one callback.
pub trait InboundBuffer {
    /// Read-only view of the buffer memory; dropping it releases the mapping.
    type Map<'a>: Deref<Target = [u8]>
    where
        Self: 'a;

    fn map_readable(&self) -> Result<Self::Map<'_>, MapError>;

    /// Wire format advertised alongside the buffer, if any
    fn format(&self) -> Option<WireFormat> {
        None
    }
}

/// Size and layout checks for inbound buffers
#[derive(Debug, Clone)]
pub struct FrameValidator {
    geometry: FrameGeometry,
    format: WireFormat,
}

impl FrameValidator {
    pub fn new(geometry: FrameGeometry, format: WireFormat) -> Self {
        Self { geometry, format }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Map, check, strip and copy `buffer`. The mapping is held only inside
    /// this call and is released on every return path.
    pub fn decode<B: InboundBuffer>(
        &self,
        buffer: &B,
        sequence: u64,
        timestamp: Instant,
    ) -> Result<DecodedFrame, DropReason> {
        let format = buffer.format().unwrap_or(self.format);

        let pixels = {
            let map = buffer.map_readable().map_err(|_| DropReason::MapFailed)?;

            let expected = self.geometry.wire_len(format);
            if map.len() < expected {
                return Err(DropReason::SizeMismatch {
                    expected,
                    actual: map.len(),
                });
            }

            // Anything past one frame is stride or pool padding.
            strip_padding(&map[..expected], format)
        };

        if pixels.is_empty() || pixels.len() != self.geometry.decoded_len() {
            return Err(DropReason::Corrupt);
        }

        Ok(DecodedFrame {
            data: Bytes::from(pixels),
            meta: FrameMetadata {
                sequence,
                width: self.geometry.width,
                height: self.geometry.height,
                order: format.channel_order(),
            },
            timestamp,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    /// Test buffer that records how many mappings are outstanding
    pub(crate) struct TrackedBuffer {
        pub data: Vec<u8>,
        pub fail_map: bool,
        pub format: Option<WireFormat>,
        pub live_maps: Cell<i32>,
        pub total_maps: Cell<u32>,
    }

    impl TrackedBuffer {
        pub fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                fail_map: false,
                format: None,
                live_maps: Cell::new(0),
                total_maps: Cell::new(0),
            }
        }
    }

    pub(crate) struct TrackedMap<'a> {
        owner: &'a TrackedBuffer,
    }

    impl Deref for TrackedMap<'_> {
        type Target = [u8];

        fn deref(&self) -> &[u8] {
            &self.owner.data
        }
    }

    impl Drop for TrackedMap<'_> {
        fn drop(&mut self) {
            self.owner.live_maps.set(self.owner.live_maps.get() - 1);
        }
    }

    impl InboundBuffer for TrackedBuffer {
        type Map<'a> = TrackedMap<'a>;

        fn map_readable(&self) -> Result<TrackedMap<'_>, MapError> {
            if self.fail_map {
                return Err(MapError);
            }
            self.live_maps.set(self.live_maps.get() + 1);
            self.total_maps.set(self.total_maps.get() + 1);
            Ok(TrackedMap { owner: self })
        }

        fn format(&self) -> Option<WireFormat> {
            self.format
        }
    }

    fn validator() -> FrameValidator {
        FrameValidator::new(FrameGeometry::new(2, 2), WireFormat::Bgrx)
    }

    #[test]
    fn full_buffer_becomes_three_channel_frame() {
        let data: Vec<u8> = (0..16).collect();
        let buffer = TrackedBuffer::new(data);

        let frame = validator().decode(&buffer, 7, Instant::now()).unwrap();

        assert_eq!(frame.len(), 2 * 2 * 3);
        assert_eq!(&frame.data[..], &[0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14]);
        assert_eq!(frame.meta.sequence, 7);
        assert_eq!(buffer.live_maps.get(), 0);
    }

    #[test]
    fn oversized_buffer_is_truncated_to_one_frame() {
        let buffer = TrackedBuffer::new(vec![1; 40]);
        let frame = validator().decode(&buffer, 1, Instant::now()).unwrap();
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn undersized_buffer_is_rejected_and_unmapped() {
        let buffer = TrackedBuffer::new(vec![0; 15]);

        let err = validator().decode(&buffer, 1, Instant::now()).unwrap_err();

        assert_eq!(
            err,
            DropReason::SizeMismatch {
                expected: 16,
                actual: 15
            }
        );
        assert_eq!(buffer.total_maps.get(), 1);
        assert_eq!(buffer.live_maps.get(), 0);
    }

    #[test]
    fn mapping_failure_is_classified() {
        let mut buffer = TrackedBuffer::new(vec![0; 16]);
        buffer.fail_map = true;

        let err = validator().decode(&buffer, 1, Instant::now()).unwrap_err();

        assert_eq!(err, DropReason::MapFailed);
        assert_eq!(buffer.live_maps.get(), 0);
    }

    #[test]
    fn zero_area_geometry_is_corrupt() {
        let validator = FrameValidator::new(FrameGeometry::new(0, 4), WireFormat::Bgrx);
        let buffer = TrackedBuffer::new(vec![0; 8]);

        let err = validator.decode(&buffer, 1, Instant::now()).unwrap_err();

        assert_eq!(err, DropReason::Corrupt);
        assert_eq!(buffer.live_maps.get(), 0);
    }

    #[test]
    fn declared_format_overrides_configured_layout() {
        let mut buffer = TrackedBuffer::new(vec![3; 12]);
        buffer.format = Some(WireFormat::Rgb);

        let frame = validator().decode(&buffer, 1, Instant::now()).unwrap();

        assert_eq!(frame.len(), 12);
        assert_eq!(frame.meta.order, crate::capture::frame::ChannelOrder::Rgb);
    }
}
