use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{H264_PAYLOAD_TYPE, Packetizer, VIDEO_CLOCK_RATE};

/// Largest NAL unit sent unfragmented; also the FU-A payload budget.
pub const MTU_SAFE: usize = 1400;

pub const NAL_NON_IDR_SLICE: u8 = 1;
pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
const NAL_FU_A: u8 = 28;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// `nal_unit_type` from the NAL header byte.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// H.264 RTP packetizer (RFC 6184).
///
/// - **Single NAL Unit** (§5.6): NALs up to [`MTU_SAFE`] bytes are sent
///   as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): larger NALs are split across multiple
///   RTP packets. The 1-byte NAL header is dropped and each fragment
///   carries a 2-byte FU header instead:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
/// The RTP marker bit goes on the last packet of an access unit.
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
}

impl H264Packetizer {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mtu: MTU_SAFE,
        }
    }

    /// Payload type 96 with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc() -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(H264_PAYLOAD_TYPE),
            mtu: MTU_SAFE,
        }
    }

    fn single_packet(&mut self, nal: &[u8], marker: bool) -> Vec<u8> {
        let hdr = self.header.write(marker);
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal.len());
        packet.extend_from_slice(&hdr);
        packet.extend_from_slice(nal);
        packet
    }

    fn fragment(&mut self, nal: &[u8], marker: bool) -> Vec<Vec<u8>> {
        let nal_header = nal[0];
        let nal_type = nal_header & 0x1f;
        let fu_indicator = (nal_header & 0x60) | NAL_FU_A;
        let payload = &nal[1..];

        let max_fragment = self.mtu - 2;
        let count = payload.len().div_ceil(max_fragment);
        let mut packets = Vec::with_capacity(count);

        for (i, chunk) in payload.chunks(max_fragment).enumerate() {
            let first = i == 0;
            let last = i + 1 == count;

            let mut fu_header = nal_type;
            if first {
                fu_header |= FU_START;
            }
            if last {
                fu_header |= FU_END;
            }

            let hdr = self.header.write(marker && last);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );
        packets
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes
    /// and returns the NAL data between them, excluding the start codes.
    /// The start code length is tracked per NAL so mixed 3- and 4-byte start
    /// codes split correctly.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        let mut i = 0usize;
        // (nal_data_start_index, start_code_length)
        let mut starts: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                starts.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                starts.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        let mut nal_units = Vec::with_capacity(starts.len());
        for (idx, &(start, _)) in starts.iter().enumerate() {
            let end = match starts.get(idx + 1) {
                Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
                None => data.len(),
            };
            if start < end {
                nal_units.push(data[start..end].to_vec());
            }
        }
        nal_units
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, nal: &[u8], timestamp: u32, marker: bool) -> Vec<Vec<u8>> {
        if nal.is_empty() {
            return Vec::new();
        }
        self.header.set_timestamp(timestamp);
        if nal.len() <= self.mtu {
            vec![self.single_packet(nal, marker)]
        } else {
            self.fragment(nal, marker)
        }
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn rtp_timestamp(&self) -> u32 {
        self.header.timestamp()
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }
}
