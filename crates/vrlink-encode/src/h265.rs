//! Minimal H.265 access-unit splitter.
//!
//! Only what reassembly needs: NAL boundaries, the PPS flag that changes
//! the slice header layout, and `slice_segment_address` of every slice.
//! The encoder is configured with 16x16 CTUs, so a CTB address is a unit
//! index.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::BitstreamError;

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

/// A slice header never needs more than this many unescaped bytes to reach
/// `slice_segment_address`.
const SLICE_HEADER_PREFIX: usize = 32;

/// Reads bits MSB-first from an RBSP.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// # Errors
    ///
    /// Returns [`BitstreamError::Truncated`] past the end of the data.
    pub fn read_bit(&mut self) -> Result<bool, BitstreamError> {
        let byte = self.data.get(self.pos / 8).ok_or(BitstreamError::Truncated)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read `count` (at most 32) bits as an unsigned value.
    ///
    /// # Errors
    ///
    /// Returns [`BitstreamError::Truncated`] past the end of the data.
    pub fn read_bits(&mut self, count: u32) -> Result<u32, BitstreamError> {
        debug_assert!(count <= 32);
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        u32::try_from(value).map_err(|_| BitstreamError::InvalidCode)
    }

    /// Read an unsigned exp-Golomb code, `ue(v)`.
    ///
    /// # Errors
    ///
    /// Returns [`BitstreamError::InvalidCode`] if the prefix exceeds 31
    /// zeros, or [`BitstreamError::Truncated`].
    pub fn read_ue(&mut self) -> Result<u32, BitstreamError> {
        let mut zeros = 0;
        while !self.read_bit()? {
            zeros += 1;
            if zeros > 31 {
                return Err(BitstreamError::InvalidCode);
            }
        }
        let suffix = u64::from(self.read_bits(zeros)?);
        u32::try_from((1u64 << zeros) - 1 + suffix).map_err(|_| BitstreamError::InvalidCode)
    }
}

/// Strip emulation-prevention bytes, keeping at most `limit` output bytes.
#[must_use]
pub fn unescape(data: &[u8], limit: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().min(limit));
    let mut zeros = 0;
    for &b in data {
        if out.len() >= limit {
            break;
        }
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// One NAL unit located inside an Annex B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Start of the start code.
    pub start: usize,
    /// First byte of the NAL header.
    pub header: usize,
    /// One past the last byte.
    pub end: usize,
}

impl NalUnit {
    /// `nal_unit_type`, or `None` if the unit is too short for a header.
    #[must_use]
    pub fn kind(&self, data: &[u8]) -> Option<u8> {
        if self.end < self.header + 2 {
            return None;
        }
        Some((data[self.header] >> 1) & 0x3f)
    }

    /// Bytes after the two-byte NAL header, still escaped.
    #[must_use]
    pub fn body<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[(self.header + 2).min(self.end)..self.end]
    }
}

/// Locate every NAL unit in an Annex B byte stream.
///
/// Each unit's range starts at its start code (three or four bytes) so that
/// it can be forwarded as is.
#[must_use]
pub fn split_annexb(data: &[u8]) -> Vec<NalUnit> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(start, header)) in starts.iter().enumerate() {
        let end = starts.get(n + 1).map_or(data.len(), |&(next, _)| next);
        units.push(NalUnit { start, header, end });
    }
    units
}

/// Compressed output of one access unit, ready for reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Parameter sets and other prefix NAL units.
    Header(Bytes),
    /// One slice segment plus any suffix NAL units following it.
    Slice {
        first_unit: u32,
        last_unit: u32,
        payload: Bytes,
    },
}

/// Result of [`SliceParser::parse_access_unit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAccessUnit {
    /// Header fragments, followed by the slices when they all parsed.
    pub fragments: Vec<Fragment>,
    /// Why the slices were dropped, if they were.
    pub error: Option<BitstreamError>,
}

struct SliceSpan {
    address: u32,
    start: usize,
    end: usize,
}

/// Splits access units into fragments, tracking PPS state across frames.
pub struct SliceParser {
    total_units: u32,
    address_bits: u32,
    /// `dependent_slice_segments_enabled_flag` by PPS id.
    pps: HashMap<u32, bool>,
}

impl SliceParser {
    #[must_use]
    pub fn new(total_units: u32) -> Self {
        let address_bits = if total_units > 1 {
            u32::BITS - (total_units - 1).leading_zeros()
        } else {
            0
        };
        Self {
            total_units,
            address_bits,
            pps: HashMap::new(),
        }
    }

    /// Split one access unit into header and slice fragments.
    ///
    /// Headers come first, in stream order, and are kept even when the
    /// slices are unusable. Slices come in stream order with their unit
    /// ranges derived from the next slice's address. A slice header that
    /// cannot be parsed drops every slice of the unit, since the ranges of
    /// its neighbours are then unknown.
    pub fn parse_access_unit(&mut self, au: &Bytes) -> ParsedAccessUnit {
        let mut fragments = Vec::new();
        let mut slices: Vec<SliceSpan> = Vec::new();
        let mut error = None;

        for nal in split_annexb(au) {
            let Some(kind) = nal.kind(au) else {
                continue;
            };
            match kind {
                0..=31 => match self.slice_address(kind, nal.body(au)) {
                    Ok(address) => slices.push(SliceSpan {
                        address,
                        start: nal.start,
                        end: nal.end,
                    }),
                    Err(e) => {
                        error.get_or_insert(e);
                    }
                },
                36..=38 | 40 => match slices.last_mut() {
                    Some(last) => last.end = nal.end,
                    None => fragments.push(Fragment::Header(au.slice(nal.start..nal.end))),
                },
                _ => {
                    if kind == NAL_PPS {
                        if let Err(e) = self.parse_pps(nal.body(au)) {
                            error.get_or_insert(e);
                        }
                    }
                    if matches!(kind, NAL_VPS | NAL_SPS) {
                        tracing::trace!(kind, "parameter set");
                    }
                    fragments.push(Fragment::Header(au.slice(nal.start..nal.end)));
                }
            }
        }

        if error.is_none() && slices.is_empty() {
            error = Some(BitstreamError::NoSlice);
        }
        if error.is_some() {
            return ParsedAccessUnit { fragments, error };
        }

        let mut addresses: Vec<u32> = slices.iter().map(|s| s.address).collect();
        addresses.sort_unstable();
        for slice in slices {
            let idx = addresses.partition_point(|&a| a <= slice.address);
            let last_unit = addresses
                .get(idx)
                .map_or(self.total_units - 1, |&next| next - 1);
            fragments.push(Fragment::Slice {
                first_unit: slice.address,
                last_unit,
                payload: au.slice(slice.start..slice.end),
            });
        }
        ParsedAccessUnit { fragments, error: None }
    }

    fn parse_pps(&mut self, body: &[u8]) -> Result<(), BitstreamError> {
        let rbsp = unescape(body, 8);
        let mut r = BitReader::new(&rbsp);
        let pps_id = r.read_ue()?;
        let _sps_id = r.read_ue()?;
        let dependent_slices = r.read_bit()?;
        self.pps.insert(pps_id, dependent_slices);
        Ok(())
    }

    fn slice_address(&self, kind: u8, body: &[u8]) -> Result<u32, BitstreamError> {
        let rbsp = unescape(body, SLICE_HEADER_PREFIX);
        let mut r = BitReader::new(&rbsp);
        let first_slice_segment_in_pic = r.read_bit()?;
        if (16..=23).contains(&kind) {
            let _no_output_of_prior_pics = r.read_bit()?;
        }
        let pps_id = r.read_ue()?;
        let dependent_slices = *self.pps.get(&pps_id).ok_or(BitstreamError::UnknownPps(pps_id))?;
        if first_slice_segment_in_pic {
            return Ok(0);
        }
        if dependent_slices {
            let _dependent_slice_segment = r.read_bit()?;
        }
        let address = r.read_bits(self.address_bits)?;
        if address >= self.total_units {
            return Err(BitstreamError::AddressOutOfRange {
                address,
                total: self.total_units,
            });
        }
        Ok(address)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Bit-level writer for building test NAL units.
    #[derive(Default)]
    pub(crate) struct BitWriter {
        bytes: Vec<u8>,
        bits: u32,
    }

    impl BitWriter {
        pub(crate) fn bit(&mut self, bit: bool) -> &mut Self {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if bit {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
            self
        }

        pub(crate) fn bits(&mut self, value: u32, count: u32) -> &mut Self {
            for i in (0..count).rev() {
                self.bit((value >> i) & 1 == 1);
            }
            self
        }

        pub(crate) fn ue(&mut self, value: u32) -> &mut Self {
            let code = u64::from(value) + 1;
            let len = u64::BITS - code.leading_zeros();
            for _ in 1..len {
                self.bit(false);
            }
            for i in (0..len).rev() {
                self.bit((code >> i) & 1 == 1);
            }
            self
        }

        /// Stop bit, alignment and emulation prevention.
        pub(crate) fn finish(&mut self) -> Vec<u8> {
            self.bit(true);
            let mut out = Vec::new();
            let mut zeros = 0;
            for &b in &self.bytes {
                if zeros >= 2 && b <= 3 {
                    out.push(3);
                    zeros = 0;
                }
                zeros = if b == 0 { zeros + 1 } else { 0 };
                out.push(b);
            }
            out
        }
    }

    pub(crate) fn nal(kind: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, kind << 1, 1];
        out.extend_from_slice(rbsp);
        out
    }

    pub(crate) fn pps(id: u32, dependent_slices: bool) -> Vec<u8> {
        let rbsp = BitWriter::default().ue(id).ue(0).bit(dependent_slices).bits(0, 7).finish();
        nal(NAL_PPS, &rbsp)
    }

    /// Slice segment on PPS 0 with 120 units (7 address bits).
    pub(crate) fn slice(kind: u8, address: u32, dependent: Option<bool>) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.bit(address == 0);
        if (16..=23).contains(&kind) {
            w.bit(false);
        }
        w.ue(0);
        if address != 0 {
            if let Some(flag) = dependent {
                w.bit(flag);
            }
            w.bits(address, 7);
        }
        w.bits(0x5a, 8).bits(0, 16).bits(0xa5, 8);
        nal(kind, &w.finish())
    }

    fn parse_ok(parser: &mut SliceParser, au: &Bytes) -> Vec<Fragment> {
        let parsed = parser.parse_access_unit(au);
        assert_eq!(parsed.error, None);
        parsed.fragments
    }

    fn slices(fragments: &[Fragment]) -> Vec<(u32, u32)> {
        fragments
            .iter()
            .filter_map(|f| match f {
                Fragment::Slice {
                    first_unit,
                    last_unit,
                    ..
                } => Some((*first_unit, *last_unit)),
                Fragment::Header(_) => None,
            })
            .collect()
    }

    #[test]
    fn reads_exp_golomb_values() {
        let data = BitWriter::default().ue(0).ue(1).ue(2).ue(41).bits(5, 3).finish();
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue(), Ok(0));
        assert_eq!(r.read_ue(), Ok(1));
        assert_eq!(r.read_ue(), Ok(2));
        assert_eq!(r.read_ue(), Ok(41));
        assert_eq!(r.read_bits(3), Ok(5));
    }

    #[test]
    fn runs_out_of_bits() {
        let mut r = BitReader::new(&[0xff]);
        assert_eq!(r.read_bits(8), Ok(0xff));
        assert_eq!(r.read_bit(), Err(BitstreamError::Truncated));
    }

    #[test]
    fn removes_emulation_prevention() {
        assert_eq!(unescape(&[0, 0, 3, 1, 0, 0, 3, 0], 16), vec![0, 0, 1, 0, 0, 0]);
        assert_eq!(unescape(&[1, 2, 3, 4, 5], 2), vec![1, 2]);
    }

    #[test]
    fn splits_three_and_four_byte_start_codes() {
        let data = [0, 0, 0, 1, 0x40, 1, 9, 0, 0, 1, 0x42, 1, 0, 0, 0, 1, 0x44, 1];
        let units = split_annexb(&data);
        assert_eq!(units.len(), 3);
        assert_eq!((units[0].start, units[0].header, units[0].end), (0, 4, 7));
        assert_eq!((units[1].start, units[1].header, units[1].end), (7, 10, 12));
        assert_eq!((units[2].start, units[2].header, units[2].end), (12, 16, 18));
        assert_eq!(units[0].kind(&data), Some(NAL_VPS));
        assert_eq!(units[1].kind(&data), Some(NAL_SPS));
        assert_eq!(units[2].kind(&data), Some(NAL_PPS));
    }

    #[test]
    fn access_unit_yields_headers_then_ranged_slices() {
        let suffix_sei = nal(40, &[0x80]);
        let mut au = Vec::new();
        au.extend(nal(NAL_VPS, &[0x0c, 0x80]));
        au.extend(nal(NAL_SPS, &[0x01, 0x80]));
        au.extend(pps(0, false));
        au.extend(nal(39, &[0x05, 0x80]));
        au.extend(slice(19, 0, None));
        au.extend(slice(19, 40, None));
        au.extend(slice(19, 80, None));
        au.extend(&suffix_sei);
        let au = Bytes::from(au);

        let mut parser = SliceParser::new(120);
        let fragments = parse_ok(&mut parser, &au);
        assert_eq!(fragments.len(), 7);
        assert!(fragments[..4].iter().all(|f| matches!(f, Fragment::Header(_))));
        assert_eq!(slices(&fragments), vec![(0, 39), (40, 79), (80, 119)]);

        let Fragment::Slice { payload, .. } = &fragments[6] else {
            panic!("expected slice");
        };
        assert!(payload.ends_with(&suffix_sei));

        let total: usize = fragments
            .iter()
            .map(|f| match f {
                Fragment::Header(b) | Fragment::Slice { payload: b, .. } => b.len(),
            })
            .sum();
        assert_eq!(total, au.len());
    }

    #[test]
    fn ranges_follow_addresses_not_stream_order() {
        let mut au = pps(0, false);
        au.extend(slice(1, 64, None));
        au.extend(slice(1, 0, None));
        au.extend(slice(1, 100, None));
        let mut parser = SliceParser::new(120);
        let fragments = parse_ok(&mut parser, &Bytes::from(au));
        assert_eq!(slices(&fragments), vec![(64, 99), (0, 63), (100, 119)]);
    }

    #[test]
    fn dependent_slice_flag_shifts_address() {
        let mut au = pps(0, true);
        au.extend(slice(1, 0, Some(false)));
        au.extend(slice(1, 60, Some(true)));
        let mut parser = SliceParser::new(120);
        let fragments = parse_ok(&mut parser, &Bytes::from(au));
        assert_eq!(slices(&fragments), vec![(0, 59), (60, 119)]);
    }

    #[test]
    fn pps_state_persists_across_access_units() {
        let mut parser = SliceParser::new(120);
        let mut first = pps(0, false);
        first.extend(slice(19, 0, None));
        parse_ok(&mut parser, &Bytes::from(first));

        let mut second = slice(1, 0, None);
        second.extend(slice(1, 30, None));
        let fragments = parse_ok(&mut parser, &Bytes::from(second));
        assert_eq!(slices(&fragments), vec![(0, 29), (30, 119)]);
    }

    #[test]
    fn slice_without_pps_is_rejected() {
        let mut parser = SliceParser::new(120);
        let parsed = parser.parse_access_unit(&Bytes::from(slice(1, 0, None)));
        assert_eq!(parsed.error, Some(BitstreamError::UnknownPps(0)));
        assert!(parsed.fragments.is_empty());
    }

    #[test]
    fn header_only_unit_keeps_parameter_sets() {
        let vps = nal(NAL_VPS, &[0x0c, 0x80]);
        let pps = pps(0, false);
        let au = Bytes::from([vps.clone(), pps.clone()].concat());

        let mut parser = SliceParser::new(120);
        let parsed = parser.parse_access_unit(&au);
        assert_eq!(parsed.error, Some(BitstreamError::NoSlice));
        assert_eq!(
            parsed.fragments,
            vec![
                Fragment::Header(Bytes::from(vps)),
                Fragment::Header(Bytes::from(pps)),
            ]
        );
    }

    #[test]
    fn broken_slice_keeps_headers_and_drops_slices() {
        let pps = pps(0, false);
        let mut au = pps.clone();
        au.extend(slice(1, 0, None));
        // Address 127 is outside a 120-unit frame.
        au.extend(slice(1, 127, None));

        let mut parser = SliceParser::new(120);
        let parsed = parser.parse_access_unit(&Bytes::from(au));
        assert_eq!(
            parsed.error,
            Some(BitstreamError::AddressOutOfRange {
                address: 127,
                total: 120
            })
        );
        assert_eq!(parsed.fragments, vec![Fragment::Header(Bytes::from(pps))]);
    }

    #[test]
    fn address_bits_match_frame_size() {
        assert_eq!(SliceParser::new(1).address_bits, 0);
        assert_eq!(SliceParser::new(8).address_bits, 3);
        assert_eq!(SliceParser::new(9).address_bits, 4);
        assert_eq!(SliceParser::new(120).address_bits, 7);
    }
}
