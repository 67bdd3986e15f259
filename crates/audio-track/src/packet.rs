//! Compressed packets handed from the demuxer to a track.
//!
//! A [`Packet`] is either a payload or the empty end-of-stream marker. Packets move through
//! the pipeline by value; there is no `Clone`.

/// Payload and timing of one compressed packet.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketFields {
    /// Container stream (track) the packet belongs to.
    pub stream_index: u32,
    /// Presentation timestamp in stream time-base ticks, when the container knows it.
    pub pts: Option<i64>,
    /// Duration in time-base ticks.
    pub duration: u64,
    /// Compressed bytes.
    pub data: Box<[u8]>,
}

/// One unit of compressed audio, or the end-of-stream marker.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Packet {
    fields: Option<PacketFields>,
}

impl Packet {
    pub fn new(fields: PacketFields) -> Self {
        Self {
            fields: Some(fields),
        }
    }

    /// The empty packet that tells the decoder and the sink no more data follows.
    pub fn end_of_stream() -> Self {
        Self { fields: None }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_none()
    }

    pub fn fields(&self) -> Option<&PacketFields> {
        self.fields.as_ref()
    }

    pub fn into_fields(self) -> Option<PacketFields> {
        self.fields
    }
}

impl From<symphonia::core::formats::Packet> for Packet {
    fn from(packet: symphonia::core::formats::Packet) -> Self {
        Packet::new(PacketFields {
            stream_index: packet.track_id(),
            pts: i64::try_from(packet.ts()).ok(),
            duration: packet.dur(),
            data: packet.data,
        })
    }
}

impl PacketFields {
    /// Rebuild a symphonia packet for codec decoders.
    ///
    /// Symphonia timestamps are unsigned; unknown or negative timestamps map to 0.
    pub fn to_symphonia(&self) -> symphonia::core::formats::Packet {
        let ts = self.pts.and_then(|v| u64::try_from(v).ok()).unwrap_or(0);
        symphonia::core::formats::Packet::new_from_slice(
            self.stream_index,
            ts,
            self.duration,
            &self.data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_of_stream_is_empty() {
        let packet = Packet::end_of_stream();
        assert!(packet.is_empty());
        assert!(packet.fields().is_none());
        assert_eq!(packet, Packet::default());
    }

    #[test]
    fn from_symphonia_keeps_timing() {
        let src = symphonia::core::formats::Packet::new_from_slice(3, 4410, 1152, &[1, 2, 3]);
        let packet = Packet::from(src);
        let fields = packet.fields().unwrap();
        assert_eq!(fields.stream_index, 3);
        assert_eq!(fields.pts, Some(4410));
        assert_eq!(fields.duration, 1152);
        assert_eq!(&*fields.data, &[1, 2, 3]);
    }

    #[test]
    fn to_symphonia_clamps_unknown_pts() {
        let fields = PacketFields {
            stream_index: 1,
            pts: None,
            duration: 10,
            data: vec![9u8].into_boxed_slice(),
        };
        let out = fields.to_symphonia();
        assert_eq!(out.ts(), 0);
        assert_eq!(out.track_id(), 1);
        assert_eq!(out.buf(), &[9]);

        let negative = PacketFields { pts: Some(-5), ..fields };
        assert_eq!(negative.to_symphonia().ts(), 0);
    }
}
