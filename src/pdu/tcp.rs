// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains support for parsing and writing TCP segments.
//!
//! [Here]'s a useful depiction of the TCP header layout (watch out for the MSB 0 bit numbering.)
//!
//! [Here]: https://en.wikipedia.org/wiki/Transmission_Control_Protocol#TCP_segment_structure

use std::result::Result;

use bitflags::bitflags;

use crate::pdu::bytes::{NetworkBytes, NetworkBytesMut};

const SOURCE_PORT_OFFSET: usize = 0;
const DESTINATION_PORT_OFFSET: usize = 2;
const SEQ_NUMBER_OFFSET: usize = 4;
const ACK_NUMBER_OFFSET: usize = 8;
const DATAOFF_RSVD_NS_OFFSET: usize = 12;
const FLAGS_AFTER_NS_OFFSET: usize = 13;
const WINDOW_SIZE_OFFSET: usize = 14;
const CHECKSUM_OFFSET: usize = 16;
const URG_POINTER_OFFSET: usize = 18;
const OPTIONS_OFFSET: usize = 20;

/// Maximum length of a TCP header, options included.
pub const MAX_HEADER_LEN: usize = 60;

const OPTION_KIND_EOL: u8 = 0x00;
const OPTION_KIND_NOP: u8 = 0x01;
const OPTION_KIND_MSS: u8 = 0x02;
const OPTION_KIND_WND_SCALE: u8 = 0x03;

const OPTION_LEN_MSS: usize = 0x04;
const OPTION_LEN_WND_SCALE: usize = 0x03;

// An arbitrarily chosen value, used for sanity checks.
const MSS_MIN: u16 = 100;

// Largest shift the window scale option may carry (RFC 7323).
const WND_SCALE_MAX: u8 = 14;

bitflags! {
    /// Represents the TCP header flags, with the exception of `NS`.
    ///
    /// These values operate on the header byte which contains every other flag besides `NS`.
    pub struct Flags: u8 {
        /// Congestion window reduced.
        const CWR = 1 << 7;
        /// ECN-echo.
        const ECE = 1 << 6;
        /// Urgent pointer.
        const URG = 1 << 5;
        /// The acknowledgement number field is valid.
        const ACK = 1 << 4;
        /// Push flag.
        const PSH = 1 << 3;
        /// Reset the connection.
        const RST = 1 << 2;
        /// SYN flag.
        const SYN = 1 << 1;
        /// FIN flag.
        const FIN = 1 << 0;
    }
}

/// Describes the errors which may occur while handling TCP segments.
#[derive(Debug, PartialEq)]
pub enum Error {
    /// Invalid header length.
    HeaderLen,
    /// The MSS option contains an invalid value.
    MssOption,
    /// An option carries an invalid length field.
    OptionLen,
    /// The specified slice is shorter than the header length.
    SliceTooShort,
}

/// Relevant options parsed out of a `SYN` segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SynOptions {
    /// Maximum segment size advertised by the sender.
    pub mss: u16,
    /// Window scale advertised by the sender; `-1` when the option is absent.
    pub wnd_scale: i8,
}

/// Parses the TCP options of a `SYN` segment, looking for `MSS` and `window scale`.
///
/// When the `MSS` option is missing, the returned value holds the protocol minimum of 536. A
/// missing `window scale` option is reported as `-1`, which tells the rest of the code not to
/// advertise the option in the reply either.
pub fn parse_syn_options(options: &[u8]) -> Result<SynOptions, Error> {
    let mut mss = crate::tcp::MSS_DEFAULT;
    let mut wnd_scale: i8 = -1;
    let mut i = 0;

    // All TCP options (except EOL and NOP) are encoded using x bytes (x >= 2), where the first
    // byte represents the option kind, the second is the option length (including these first
    // two bytes), and finally the next x - 2 bytes represent option data.
    while i < options.len() {
        match options[i] {
            OPTION_KIND_EOL => break,
            OPTION_KIND_NOP => {
                i += 1;
                continue;
            }
            OPTION_KIND_MSS => {
                if i + OPTION_LEN_MSS > options.len()
                    || options[i + 1] as usize != OPTION_LEN_MSS
                {
                    return Err(Error::MssOption);
                }
                let value = options.ntohs_unchecked(i + 2);
                if value < MSS_MIN {
                    return Err(Error::MssOption);
                }
                mss = value;
                i += OPTION_LEN_MSS;
            }
            OPTION_KIND_WND_SCALE => {
                if i + OPTION_LEN_WND_SCALE > options.len()
                    || options[i + 1] as usize != OPTION_LEN_WND_SCALE
                {
                    return Err(Error::OptionLen);
                }
                // Values beyond the maximum shift are taken as the maximum (RFC 7323, 2.3).
                wnd_scale = std::cmp::min(options[i + 2], WND_SCALE_MAX) as i8;
                i += OPTION_LEN_WND_SCALE;
            }
            _ => {
                // Some other option; skip opt_len bytes in total. A length below 2 cannot be
                // stepped over and makes the whole option list unusable.
                let opt_len = options
                    .get(i + 1)
                    .map(|&len| len as usize)
                    .ok_or(Error::OptionLen)?;
                if opt_len < 2 {
                    return Err(Error::OptionLen);
                }
                i += opt_len;
            }
        }
    }

    Ok(SynOptions { mss, wnd_scale })
}

/// Interprets a byte slice as a TCP segment.
#[derive(Debug)]
pub struct TcpSegment<'a> {
    bytes: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Interprets `bytes` as a TCP segment without any validity checks.
    ///
    /// # Panics
    ///
    /// This method does not panic, but further method calls on the resulting object may panic if
    /// `bytes` contains invalid input.
    #[inline]
    pub fn from_bytes_unchecked(bytes: &'a [u8]) -> Self {
        TcpSegment { bytes }
    }

    /// Attempts to interpret `bytes` as a TCP segment, checking the validity of the header
    /// length.
    ///
    /// Checksum validation is left to the device model underneath, which usually offloads it.
    #[inline]
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < OPTIONS_OFFSET {
            return Err(Error::SliceTooShort);
        }

        let segment = Self::from_bytes_unchecked(bytes);
        let header_len = segment.header_len();

        if header_len < OPTIONS_OFFSET || header_len > std::cmp::min(MAX_HEADER_LEN, bytes.len())
        {
            return Err(Error::HeaderLen);
        }

        Ok(segment)
    }

    /// Returns the source port.
    #[inline]
    pub fn source_port(&self) -> u16 {
        self.bytes.ntohs_unchecked(SOURCE_PORT_OFFSET)
    }

    /// Returns the destination port.
    #[inline]
    pub fn destination_port(&self) -> u16 {
        self.bytes.ntohs_unchecked(DESTINATION_PORT_OFFSET)
    }

    /// Returns the sequence number.
    #[inline]
    pub fn sequence_number(&self) -> u32 {
        self.bytes.ntohl_unchecked(SEQ_NUMBER_OFFSET)
    }

    /// Returns the acknowledgement number (only valid if the `ACK` flag is set).
    #[inline]
    pub fn ack_number(&self) -> u32 {
        self.bytes.ntohl_unchecked(ACK_NUMBER_OFFSET)
    }

    /// Returns the length of the header.
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.bytes[DATAOFF_RSVD_NS_OFFSET] >> 4) as usize * 4
    }

    /// Returns the TCP header flags, with the exception of `NS`.
    #[inline]
    pub fn flags_after_ns(&self) -> Flags {
        Flags::from_bits_truncate(self.bytes[FLAGS_AFTER_NS_OFFSET])
    }

    /// Returns the value of the `window size` header field.
    #[inline]
    pub fn window_size(&self) -> u16 {
        self.bytes.ntohs_unchecked(WINDOW_SIZE_OFFSET)
    }

    /// Returns the value of the `checksum` header field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        self.bytes.ntohs_unchecked(CHECKSUM_OFFSET)
    }

    /// Returns the TCP header options as a byte slice.
    ///
    /// # Panics
    ///
    /// This method may panic if the value of `header_len` is invalid.
    #[inline]
    pub fn options_unchecked(&self, header_len: usize) -> &[u8] {
        &self.bytes[OPTIONS_OFFSET..header_len]
    }

    /// Parses the `SYN` options carried by the segment.
    pub fn parse_syn_options(&self) -> Result<SynOptions, Error> {
        parse_syn_options(self.options_unchecked(self.header_len()))
    }

    /// Returns the length of the segment.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when the segment carries no bytes at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the length of the payload.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.len() - self.header_len()
    }
}

/// Writes a TCP control segment (no payload) to `buf` and returns its length.
///
/// The `NS` flag, `checksum` and `urgent pointer` fields are set to 0; checksum computation
/// belongs to the layer which knows the enclosing packet's addresses. The `MSS` and
/// `window scale` options are emitted only when requested; the window scale option is padded
/// with a leading `NOP` so the header length stays a multiple of 4.
pub fn write_segment(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq_number: u32,
    ack_number: u32,
    flags_after_ns: Flags,
    window_size: u16,
    mss_option: Option<u16>,
    wnd_scale_option: Option<u8>,
) -> Result<usize, Error> {
    let mut options_len = 0;
    if mss_option.is_some() {
        options_len += OPTION_LEN_MSS;
    }
    if wnd_scale_option.is_some() {
        options_len += OPTION_LEN_WND_SCALE + 1;
    }

    let header_len = OPTIONS_OFFSET + options_len;
    if buf.len() < header_len {
        return Err(Error::SliceTooShort);
    }

    buf.htons_unchecked(SOURCE_PORT_OFFSET, src_port);
    buf.htons_unchecked(DESTINATION_PORT_OFFSET, dst_port);
    buf.htonl_unchecked(SEQ_NUMBER_OFFSET, seq_number);
    buf.htonl_unchecked(ACK_NUMBER_OFFSET, ack_number);
    buf[DATAOFF_RSVD_NS_OFFSET] = (header_len as u8) << 2;
    buf[FLAGS_AFTER_NS_OFFSET] = flags_after_ns.bits();
    buf.htons_unchecked(WINDOW_SIZE_OFFSET, window_size);
    buf.htons_unchecked(CHECKSUM_OFFSET, 0);
    buf.htons_unchecked(URG_POINTER_OFFSET, 0);

    let mut i = OPTIONS_OFFSET;
    if let Some(value) = mss_option {
        buf[i] = OPTION_KIND_MSS;
        buf[i + 1] = OPTION_LEN_MSS as u8;
        buf.htons_unchecked(i + 2, value);
        i += OPTION_LEN_MSS;
    }
    if let Some(shift) = wnd_scale_option {
        buf[i] = OPTION_KIND_NOP;
        buf[i + 1] = OPTION_KIND_WND_SCALE;
        buf[i + 2] = OPTION_LEN_WND_SCALE as u8;
        buf[i + 3] = shift;
    }

    Ok(header_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::MSS_DEFAULT;

    #[test]
    fn test_write_and_parse() {
        let mut buf = [0u8; MAX_HEADER_LEN];

        let len = write_segment(
            buf.as_mut(),
            80,
            5555,
            0x0102_0304,
            0x1112_1314,
            Flags::SYN | Flags::ACK,
            14600,
            Some(1460),
            Some(7),
        )
        .unwrap();
        assert_eq!(len, 28);

        let s = TcpSegment::from_bytes(&buf[..len]).unwrap();
        assert_eq!(s.source_port(), 80);
        assert_eq!(s.destination_port(), 5555);
        assert_eq!(s.sequence_number(), 0x0102_0304);
        assert_eq!(s.ack_number(), 0x1112_1314);
        assert_eq!(s.flags_after_ns(), Flags::SYN | Flags::ACK);
        assert_eq!(s.window_size(), 14600);
        assert_eq!(s.checksum(), 0);
        assert_eq!(s.header_len(), len);
        assert_eq!(s.payload_len(), 0);

        let opts = s.parse_syn_options().unwrap();
        assert_eq!(
            opts,
            SynOptions {
                mss: 1460,
                wnd_scale: 7,
            }
        );
    }

    #[test]
    fn test_write_without_options() {
        let mut buf = [0u8; MAX_HEADER_LEN];
        let len =
            write_segment(buf.as_mut(), 80, 5555, 1, 2, Flags::ACK, 100, None, None).unwrap();
        assert_eq!(len, OPTIONS_OFFSET);

        let s = TcpSegment::from_bytes(&buf[..len]).unwrap();
        assert_eq!(
            s.parse_syn_options().unwrap(),
            SynOptions {
                mss: MSS_DEFAULT,
                wnd_scale: -1,
            }
        );

        // A buffer which cannot hold the requested options.
        assert_eq!(
            write_segment(
                &mut buf[..22],
                80,
                5555,
                1,
                2,
                Flags::SYN,
                100,
                Some(536),
                None
            )
            .unwrap_err(),
            Error::SliceTooShort
        );
    }

    #[test]
    fn test_parse_syn_options() {
        // MSS below the sanity minimum.
        let bad_mss = [OPTION_KIND_MSS, 4, 0, 99];
        assert_eq!(parse_syn_options(&bad_mss), Err(Error::MssOption));

        // MSS option truncated by the end of the header.
        let truncated = [OPTION_KIND_NOP, OPTION_KIND_MSS, 4, 5];
        assert_eq!(parse_syn_options(&truncated), Err(Error::MssOption));

        // A zero length on an unknown option would loop forever if stepped over.
        let zero_len = [0xfe, 0];
        assert_eq!(parse_syn_options(&zero_len), Err(Error::OptionLen));

        // Unknown options are skipped, EOL stops the walk.
        let skippable = [
            0xfe,
            4,
            0xaa,
            0xbb,
            OPTION_KIND_MSS,
            4,
            0x05,
            0xb4,
            OPTION_KIND_EOL,
            OPTION_KIND_WND_SCALE,
            3,
            2,
        ];
        assert_eq!(
            parse_syn_options(&skippable).unwrap(),
            SynOptions {
                mss: 1460,
                wnd_scale: -1,
            }
        );

        // An oversized window scale shift is clamped.
        let big_shift = [OPTION_KIND_WND_SCALE, 3, 30];
        assert_eq!(parse_syn_options(&big_shift).unwrap().wnd_scale, 14);
    }

    #[test]
    fn test_from_bytes_errors() {
        let mut buf = [0u8; MAX_HEADER_LEN];
        let len =
            write_segment(buf.as_mut(), 80, 5555, 1, 2, Flags::ACK, 100, None, None).unwrap();

        // Shorter than the minimum header.
        assert_eq!(
            TcpSegment::from_bytes(&buf[..OPTIONS_OFFSET - 1]).unwrap_err(),
            Error::SliceTooShort
        );

        // Header length pointing beyond the end of the slice.
        buf[DATAOFF_RSVD_NS_OFFSET] = (MAX_HEADER_LEN as u8) << 2;
        assert_eq!(
            TcpSegment::from_bytes(&buf[..len]).unwrap_err(),
            Error::HeaderLen
        );

        // Header length below the minimum.
        buf[DATAOFF_RSVD_NS_OFFSET] = 4 << 4;
        assert_eq!(
            TcpSegment::from_bytes(&buf[..len]).unwrap_err(),
            Error::HeaderLen
        );
    }
}
