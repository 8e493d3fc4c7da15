//! Minimal Annex-B plumbing for the host HEVC bitstream: NAL unit
//! splitting that preserves the exact start-code prefixes, the two-byte
//! NAL header, and NAL encapsulation with emulation prevention.
//!
//! This is deliberately shallow. Slice headers are not decoded; the driver
//! only needs the NAL type, the temporal id, and the
//! `first_slice_segment_in_pic_flag` bit to find picture boundaries.

use std::io::{self, Read, Write};

use anyhow::{bail, Result};
use bit::BitIndex;
use log::warn;
use num_enum::TryFromPrimitive;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// HEVC NAL unit types (Rec. ITU-T H.265, Table 7-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NalUnitType {
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    Vps = 32,
    Sps = 33,
    Pps = 34,
    Aud = 35,
    Eos = 36,
    Eob = 37,
    Fd = 38,
    PrefixSei = 39,
    SuffixSei = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NalUnitType {
    /// Whether this type carries a coded slice segment.
    #[must_use]
    pub fn is_vcl(self) -> bool {
        (self as u8) <= 31
    }

    /// Whether this type is an intra random access point, at which a
    /// decoder may join the stream with no prior state.
    #[must_use]
    pub fn is_irap(self) -> bool {
        (16..=23).contains(&(self as u8))
    }
}

/// The two-byte HEVC NAL unit header.
#[derive(Debug, Clone, Copy)]
pub struct NalHeader {
    pub nal_unit_type: NalUnitType,
    pub nuh_layer_id: u8,
    pub temporal_id: u8,
}

impl NalHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            bail!("NAL unit of {} bytes is too short for a header", data.len());
        }
        let nal_unit_type = NalUnitType::try_from(data[0].bit_range(1..7))
            .expect("every 6-bit value is a NAL unit type");
        let nuh_layer_id = (u8::from(data[0].bit(0)) << 5) | data[1].bit_range(3..8);
        let temporal_id = data[1].bit_range(0..3).saturating_sub(1);
        Ok(Self {
            nal_unit_type,
            nuh_layer_id,
            temporal_id,
        })
    }
}

/// One NAL unit plus the zero bytes that preceded its start code, so the
/// unit can be copied back out byte-identically.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub leading_zeros: usize,
    pub data: Vec<u8>,
}

impl NalUnit {
    /// Whether this unit opens a new picture: a VCL unit whose
    /// `first_slice_segment_in_pic_flag` (the first slice-header bit after
    /// the NAL header) is set.
    #[must_use]
    pub fn is_first_slice_of_picture(&self, header: NalHeader) -> bool {
        header.nal_unit_type.is_vcl() && self.data.len() >= 3 && self.data[2].bit(7)
    }
}

/// Splits an Annex-B byte stream into NAL units.
pub struct AnnexBReader<R: Read> {
    reader: R,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> AnnexBReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            pos: 0,
            eof: false,
        }
    }

    /// Returns the next NAL unit, or `None` at end of stream.
    pub fn next_nal(&mut self) -> Result<Option<NalUnit>> {
        self.buffer.drain(..self.pos);
        self.pos = 0;

        let Some(start_code) = self.find_start_code()? else {
            if self.buffer.iter().any(|&byte| byte != 0) {
                warn!(
                    "Ignoring {} bytes of trailing data with no start code",
                    self.buffer.len()
                );
            }
            self.pos = self.buffer.len();
            return Ok(None);
        };

        // Zero bytes directly before the start code belong to this unit's
        // prefix; anything before those is garbage.
        let leading_zeros = self.buffer[..start_code]
            .iter()
            .rev()
            .take_while(|&&byte| byte == 0)
            .count();
        if leading_zeros < start_code {
            warn!(
                "Ignoring {} bytes before start code",
                start_code - leading_zeros
            );
        }

        let data_start = start_code + 1;
        let data_end = self.find_nal_end(data_start)?;
        self.pos = data_end;

        Ok(Some(NalUnit {
            leading_zeros,
            data: self.buffer[data_start..data_end].to_vec(),
        }))
    }

    /// Position of the `0x01` terminating the next three-byte start code.
    fn find_start_code(&mut self) -> Result<Option<usize>> {
        let mut search_from = 0;
        loop {
            if let Some(offset) = self.buffer[search_from..]
                .windows(3)
                .position(|window| matches!(window, [0, 0, 1]))
            {
                return Ok(Some(search_from + offset + 2));
            }
            search_from = self.buffer.len().saturating_sub(2);
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Position just past the NAL unit starting at `from`: the start of the
    /// next `00 00 00` or `00 00 01` window, or the end of the stream.
    fn find_nal_end(&mut self, from: usize) -> Result<usize> {
        let mut search_from = from;
        loop {
            if let Some(offset) = self.buffer[search_from..]
                .windows(3)
                .position(|window| matches!(window, [0, 0, 0] | [0, 0, 1]))
            {
                return Ok(search_from + offset);
            }
            search_from = self.buffer.len().saturating_sub(2).max(from);
            if !self.fill()? {
                return Ok(self.buffer.len());
            }
        }
    }

    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let start = self.buffer.len();
        self.buffer.resize(start + READ_CHUNK_SIZE, 0);
        let read = loop {
            match self.reader.read(&mut self.buffer[start..]) {
                Ok(read) => break read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.buffer.truncate(start);
                    return Err(e.into());
                }
            }
        };
        self.buffer.truncate(start + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(read > 0)
    }
}

/// Writes a NAL unit back out with the same prefix it was read with.
pub fn write_nal<W: Write>(writer: &mut W, nal: &NalUnit) -> Result<()> {
    writer.write_all(&vec![0; nal.leading_zeros])?;
    writer.write_all(&[1])?;
    writer.write_all(&nal.data)?;
    Ok(())
}

/// Wraps an RBSP in a NAL unit: two-byte header (layer id 0) plus
/// emulation-prevention bytes, behind a three-byte start code.
#[must_use]
pub fn encapsulate(nal_unit_type: NalUnitType, temporal_id: u8, rbsp: &[u8]) -> NalUnit {
    let mut data = Vec::with_capacity(rbsp.len() + 8);
    let mut zero_run = 0;
    push_escaped(&mut data, &mut zero_run, (nal_unit_type as u8) << 1);
    push_escaped(&mut data, &mut zero_run, temporal_id + 1);
    for &byte in rbsp {
        push_escaped(&mut data, &mut zero_run, byte);
    }
    NalUnit {
        leading_zeros: 2,
        data,
    }
}

fn push_escaped(data: &mut Vec<u8>, zero_run: &mut usize, byte: u8) {
    if *zero_run >= 2 && byte <= 0x03 {
        data.push(0x03);
        *zero_run = 0;
    }
    data.push(byte);
    *zero_run = if byte == 0 { *zero_run + 1 } else { 0 };
}

#[cfg(test)]
mod tests {
    use super::{encapsulate, write_nal, AnnexBReader, NalHeader, NalUnit, NalUnitType};

    const STREAM: &[u8] = &[
        0, 0, 0, 1, 0x40, 0x01, 0xFF, 0xAC, // VPS with a four-byte start code
        0, 0, 1, 0x26, 0x01, 0x80, 0x12, // IDR_W_RADL, first slice
        0, 0, 1, 0x02, 0x01, 0x80, 0x34, 0x00, 0x00, // TRAIL_R ending in zeros
    ];

    fn read_all(stream: &[u8]) -> Vec<NalUnit> {
        let mut reader = AnnexBReader::new(stream);
        let mut nals = Vec::new();
        while let Some(nal) = reader.next_nal().unwrap() {
            nals.push(nal);
        }
        nals
    }

    #[test]
    fn splits_nal_units_and_prefixes() {
        let nals = read_all(STREAM);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0].leading_zeros, 3);
        assert_eq!(nals[0].data, vec![0x40, 0x01, 0xFF, 0xAC]);
        assert_eq!(nals[1].leading_zeros, 2);
        assert_eq!(nals[2].data, vec![0x02, 0x01, 0x80, 0x34, 0x00, 0x00]);
    }

    #[test]
    fn pass_through_is_byte_identical() {
        let mut out = Vec::new();
        for nal in read_all(STREAM) {
            write_nal(&mut out, &nal).unwrap();
        }
        assert_eq!(out, STREAM);
    }

    #[test]
    fn reports_empty_nal_units() {
        let stream = [0u8, 0, 1, 0, 0, 1, 0x40, 0x01, 0xAA];
        let nals = read_all(&stream);
        assert_eq!(nals.len(), 2);
        assert!(nals[0].data.is_empty());
        assert_eq!(nals[1].data, vec![0x40, 0x01, 0xAA]);
    }

    #[test]
    fn parses_nal_headers() {
        let header = NalHeader::parse(&[0x4E, 0x01]).unwrap();
        assert_eq!(header.nal_unit_type, NalUnitType::PrefixSei);
        assert_eq!(header.nuh_layer_id, 0);
        assert_eq!(header.temporal_id, 0);

        let header = NalHeader::parse(&[0x26, 0x03]).unwrap();
        assert_eq!(header.nal_unit_type, NalUnitType::IdrWRadl);
        assert!(header.nal_unit_type.is_irap());
        assert!(header.nal_unit_type.is_vcl());
        assert_eq!(header.temporal_id, 2);

        assert!(NalHeader::parse(&[0x4E]).is_err());
    }

    #[test]
    fn detects_picture_boundaries() {
        let first = NalUnit {
            leading_zeros: 2,
            data: vec![0x02, 0x01, 0x80],
        };
        let not_first = NalUnit {
            leading_zeros: 2,
            data: vec![0x02, 0x01, 0x40],
        };
        let vps = NalUnit {
            leading_zeros: 2,
            data: vec![0x40, 0x01, 0x80],
        };
        assert!(first.is_first_slice_of_picture(NalHeader::parse(&first.data).unwrap()));
        assert!(!not_first.is_first_slice_of_picture(NalHeader::parse(&not_first.data).unwrap()));
        assert!(!vps.is_first_slice_of_picture(NalHeader::parse(&vps.data).unwrap()));
    }

    #[test]
    fn encapsulation_inserts_emulation_prevention() {
        let nal = encapsulate(NalUnitType::PrefixSei, 0, &[0x00, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(nal.data[..2], [0x4E, 0x01]);
        assert_eq!(nal.data[2..], [0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01]);
    }

    #[test]
    fn encapsulation_leaves_clean_payloads_alone() {
        let rbsp = [0x04, 0x07, 0xB5, 0x58, 0x90, 0x01, 0x80, 0xC0, 0x00, 0x80];
        let nal = encapsulate(NalUnitType::PrefixSei, 1, &rbsp);
        assert_eq!(nal.data[..2], [0x4E, 0x02]);
        assert_eq!(nal.data[2..], rbsp);
    }
}
