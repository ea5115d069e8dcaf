use std::mem;

use super::{
    Error, SessionId, sdnv,
    segment::{
        CancelReason, DataSegment, DataSegmentMetadata, Extension, Extensions, ReceptionClaim,
        ReportSegment, Segment, SegmentBody, SegmentType,
    },
};

// Upper bound on speculative buffer reservations made from attacker-supplied
// length fields; buffers still grow on demand as real bytes arrive.
const MAX_SPECULATIVE_RESERVE: usize = 4096;

/// Receives segments as the parser completes them.
pub trait SegmentSink {
    fn segment(&mut self, segment: Segment);

    /// Fired as soon as the header's originator SDNV has been decoded, before
    /// the rest of the segment is parsed, so that a caller can route large
    /// segments without buffering them.
    #[allow(unused_variables)]
    fn session_originator_engine_id_decoded(&mut self, session_originator_engine_id: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainState {
    Header,
    DataContent,
    ReportContent,
    ReportAckContent,
    CancelContentByte,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    ControlByte,
    SessionOriginatorEngineIdSdnv,
    SessionNumberSdnv,
    NumExtensionsByte,
    ExtensionTagByte,
    ExtensionLengthSdnv,
    ExtensionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrailerState {
    ExtensionTagByte,
    ExtensionLengthSdnv,
    ExtensionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataState {
    ClientServiceIdSdnv,
    OffsetSdnv,
    LengthSdnv,
    CheckpointSerialNumberSdnv,
    ReportSerialNumberSdnv,
    ClientServiceData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportState {
    ReportSerialNumberSdnv,
    CheckpointSerialNumberSdnv,
    UpperBoundSdnv,
    LowerBoundSdnv,
    ReceptionClaimCountSdnv,
    ReceptionClaimOffsetSdnv,
    ReceptionClaimLengthSdnv,
}

/// Streaming, resumable segment parser.
///
/// The parser is an explicit state machine so that a byte-at-a-time feed
/// produces exactly the same segments as a bulk feed. On malformed input it
/// resets itself to the initial state and returns an error without having
/// delivered a partial segment.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use ltp_server_codec::SessionId;
/// use ltp_server_codec::parser::{Parser, SegmentSink};
/// use ltp_server_codec::segment::*;
///
/// #[derive(Default)]
/// struct Sink(Vec<Segment>);
///
/// impl SegmentSink for Sink {
///     fn segment(&mut self, segment: Segment) {
///         self.0.push(segment);
///     }
/// }
///
/// let segment = Segment {
///     session_id: SessionId::new(100, 7),
///     extensions: Extensions::default(),
///     body: SegmentBody::ReportAck {
///         report_serial_number: 42,
///     },
/// };
///
/// let mut bytes = BytesMut::new();
/// segment.encode(&mut bytes);
///
/// let mut parser = Parser::default();
/// let mut sink = Sink::default();
/// parser.parse(&bytes, &mut sink).unwrap();
///
/// assert!(parser.is_idle());
/// assert_eq!(sink.0, vec![segment]);
/// ```
pub struct Parser {
    main_state: MainState,
    header_state: HeaderState,
    trailer_state: TrailerState,
    data_state: DataState,
    report_state: ReportState,
    sdnv_buf: Vec<u8>,

    segment_type: SegmentType,
    session_originator_engine_id: u64,
    session_number: u64,
    header_extension_count: u8,
    trailer_extension_count: u8,
    extensions: Extensions,
    extension_tag: u8,
    extension_length: u64,
    extension_value: Vec<u8>,

    data: DataSegmentMetadata,
    payload: Vec<u8>,

    report: ReportSegment,
    claim_count: u64,
    claim_offset: u64,

    report_ack_serial_number: u64,
    cancel_reason: CancelReason,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            main_state: MainState::Header,
            header_state: HeaderState::ControlByte,
            trailer_state: TrailerState::ExtensionTagByte,
            data_state: DataState::ClientServiceIdSdnv,
            report_state: ReportState::ReportSerialNumberSdnv,
            sdnv_buf: Vec::with_capacity(sdnv::MAX_LENGTH_U64),
            segment_type: SegmentType::RedData,
            session_originator_engine_id: 0,
            session_number: 0,
            header_extension_count: 0,
            trailer_extension_count: 0,
            extensions: Extensions::default(),
            extension_tag: 0,
            extension_length: 0,
            extension_value: Vec::new(),
            data: DataSegmentMetadata::default(),
            payload: Vec::new(),
            report: ReportSegment::default(),
            claim_count: 0,
            claim_offset: 0,
            report_ack_serial_number: 0,
            cancel_reason: CancelReason::Reserved,
        }
    }
}

impl Parser {
    /// True when no segment is partially parsed.
    pub fn is_idle(&self) -> bool {
        self.main_state == MainState::Header && self.header_state == HeaderState::ControlByte
    }

    /// Discard any partially parsed segment and return to the initial state.
    pub fn reset(&mut self) {
        self.main_state = MainState::Header;
        self.header_state = HeaderState::ControlByte;
        self.trailer_state = TrailerState::ExtensionTagByte;
        self.data_state = DataState::ClientServiceIdSdnv;
        self.report_state = ReportState::ReportSerialNumberSdnv;
        self.sdnv_buf.clear();
        self.extensions = Extensions::default();
        self.extension_value = Vec::new();
        self.payload = Vec::new();
        self.report = ReportSegment::default();
    }

    /// Feed bytes into the parser, delivering every completed segment to
    /// `sink`. Segments may span multiple calls; a call may complete several
    /// segments. On error the parser has already been reset.
    pub fn parse(&mut self, bytes: &[u8], sink: &mut impl SegmentSink) -> Result<(), Error> {
        self.parse_inner(bytes, sink).inspect_err(|_| self.reset())
    }

    fn parse_inner(&mut self, bytes: &[u8], sink: &mut impl SegmentSink) -> Result<(), Error> {
        let mut index = 0;
        while index < bytes.len() {
            let byte = bytes[index];
            index += 1;

            match self.main_state {
                MainState::Header => self.handle_header_byte(byte, sink)?,
                MainState::DataContent => {
                    self.handle_data_byte(byte, bytes, &mut index, sink)?;
                }
                MainState::ReportContent => self.handle_report_byte(byte, sink)?,
                MainState::ReportAckContent => {
                    if let Some(value) = self.accumulate_sdnv(byte)? {
                        self.report_ack_serial_number = value;
                        self.finish_body(sink);
                    }
                }
                MainState::CancelContentByte => {
                    self.cancel_reason = CancelReason::try_from(byte)
                        .ok()
                        .filter(|reason| *reason != CancelReason::Reserved)
                        .ok_or(Error::UnknownCancelReason(byte))?;
                    self.finish_body(sink);
                }
                MainState::Trailer => {
                    self.handle_trailer_byte(byte, bytes, &mut index, sink)?;
                }
            }
        }

        Ok(())
    }

    fn accumulate_sdnv(&mut self, byte: u8) -> Result<Option<u64>, Error> {
        self.sdnv_buf.push(byte);
        if self.sdnv_buf.len() > sdnv::MAX_LENGTH_U64 {
            return Err(Error::SdnvTooLong);
        }

        if byte & 0x80 != 0 {
            return Ok(None);
        }

        let (value, consumed) = sdnv::decode_u64(&self.sdnv_buf)?;
        if consumed != self.sdnv_buf.len() {
            return Err(Error::InvalidInput);
        }

        self.sdnv_buf.clear();
        Ok(Some(value))
    }

    fn handle_header_byte(&mut self, byte: u8, sink: &mut impl SegmentSink) -> Result<(), Error> {
        match self.header_state {
            HeaderState::ControlByte => {
                let version = byte >> 4;
                if version != 0 {
                    return Err(Error::UnsupportedVersion(version));
                }

                self.segment_type = SegmentType::try_from(byte & 0x0F)
                    .map_err(|_| Error::UndefinedSegmentType(byte & 0x0F))?;
                self.sdnv_buf.clear();
                self.header_state = HeaderState::SessionOriginatorEngineIdSdnv;
            }
            HeaderState::SessionOriginatorEngineIdSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.session_originator_engine_id = value;
                    sink.session_originator_engine_id_decoded(value);
                    self.header_state = HeaderState::SessionNumberSdnv;
                }
            }
            HeaderState::SessionNumberSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.session_number = value;
                    self.header_state = HeaderState::NumExtensionsByte;
                }
            }
            HeaderState::NumExtensionsByte => {
                self.header_extension_count = byte >> 4;
                self.trailer_extension_count = byte & 0x0F;
                self.extensions.header.clear();
                self.extensions.trailer.clear();
                if self.header_extension_count > 0 {
                    self.header_state = HeaderState::ExtensionTagByte;
                } else {
                    self.begin_content(sink);
                }
            }
            HeaderState::ExtensionTagByte => {
                self.extension_tag = byte;
                self.header_state = HeaderState::ExtensionLengthSdnv;
            }
            HeaderState::ExtensionLengthSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.extension_length = value;
                    self.prepare_extension_value();
                    if value == 0 {
                        self.push_header_extension(sink);
                    } else {
                        self.header_state = HeaderState::ExtensionValue;
                    }
                }
            }
            HeaderState::ExtensionValue => {
                self.extension_value.push(byte);
                if self.extension_value.len() as u64 == self.extension_length {
                    self.push_header_extension(sink);
                }
            }
        }

        Ok(())
    }

    fn prepare_extension_value(&mut self) {
        self.extension_value.clear();
        self.extension_value
            .reserve((self.extension_length as usize).min(MAX_SPECULATIVE_RESERVE));
    }

    fn push_header_extension(&mut self, sink: &mut impl SegmentSink) {
        self.extensions.header.push(Extension {
            tag: self.extension_tag,
            value: mem::take(&mut self.extension_value),
        });

        if (self.extensions.header.len() as u8) < self.header_extension_count {
            self.header_state = HeaderState::ExtensionTagByte;
        } else {
            self.begin_content(sink);
        }
    }

    fn begin_content(&mut self, sink: &mut impl SegmentSink) {
        self.sdnv_buf.clear();
        match self.segment_type {
            kind if kind.is_data() => {
                self.data = DataSegmentMetadata::default();
                self.data_state = DataState::ClientServiceIdSdnv;
                self.main_state = MainState::DataContent;
            }
            SegmentType::ReportSegment => {
                self.report = ReportSegment::default();
                self.report_state = ReportState::ReportSerialNumberSdnv;
                self.main_state = MainState::ReportContent;
            }
            SegmentType::ReportAckSegment => {
                self.main_state = MainState::ReportAckContent;
            }
            SegmentType::CancelSegmentFromSender | SegmentType::CancelSegmentFromReceiver => {
                self.main_state = MainState::CancelContentByte;
            }
            // cancel acks carry no content at all
            _ => self.finish_body(sink),
        }
    }

    fn finish_body(&mut self, sink: &mut impl SegmentSink) {
        if self.trailer_extension_count > 0 {
            self.trailer_state = TrailerState::ExtensionTagByte;
            self.main_state = MainState::Trailer;
        } else {
            self.emit(sink);
        }
    }

    fn emit(&mut self, sink: &mut impl SegmentSink) {
        let body = match self.segment_type {
            kind if kind.is_data() => SegmentBody::Data(DataSegment {
                segment_type: kind,
                metadata: self.data,
                payload: mem::take(&mut self.payload),
            }),
            SegmentType::ReportSegment => SegmentBody::Report(mem::take(&mut self.report)),
            SegmentType::ReportAckSegment => SegmentBody::ReportAck {
                report_serial_number: self.report_ack_serial_number,
            },
            SegmentType::CancelSegmentFromSender | SegmentType::CancelSegmentFromReceiver => {
                SegmentBody::Cancel {
                    from_sender: self.segment_type == SegmentType::CancelSegmentFromSender,
                    reason: self.cancel_reason,
                }
            }
            _ => SegmentBody::CancelAck {
                to_sender: self.segment_type == SegmentType::CancelAckToSender,
            },
        };

        sink.segment(Segment {
            session_id: SessionId::new(self.session_originator_engine_id, self.session_number),
            extensions: mem::take(&mut self.extensions),
            body,
        });

        self.main_state = MainState::Header;
        self.header_state = HeaderState::ControlByte;
    }

    fn handle_data_byte(
        &mut self,
        byte: u8,
        bytes: &[u8],
        index: &mut usize,
        sink: &mut impl SegmentSink,
    ) -> Result<(), Error> {
        match self.data_state {
            DataState::ClientServiceIdSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.data.client_service_id = value;
                    self.data_state = DataState::OffsetSdnv;
                }
            }
            DataState::OffsetSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.data.offset = value;
                    self.data_state = DataState::LengthSdnv;
                }
            }
            DataState::LengthSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    if value == 0 {
                        return Err(Error::ZeroDataLength);
                    }

                    self.data.length = value;
                    if self.segment_type.is_checkpoint() {
                        self.data_state = DataState::CheckpointSerialNumberSdnv;
                    } else {
                        self.prepare_payload();
                        self.data_state = DataState::ClientServiceData;
                    }
                }
            }
            DataState::CheckpointSerialNumberSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.data.checkpoint_serial_number = Some(value);
                    self.data_state = DataState::ReportSerialNumberSdnv;
                }
            }
            DataState::ReportSerialNumberSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.data.report_serial_number = Some(value);
                    self.prepare_payload();
                    self.data_state = DataState::ClientServiceData;
                }
            }
            DataState::ClientServiceData => {
                self.payload.push(byte);

                // bulk-copy whatever else of the payload is already buffered
                let remaining = (self.data.length as usize) - self.payload.len();
                let available = bytes.len() - *index;
                let run = remaining.min(available);
                if run > 0 {
                    self.payload.extend_from_slice(&bytes[*index..*index + run]);
                    *index += run;
                }

                if self.payload.len() as u64 == self.data.length {
                    self.finish_body(sink);
                }
            }
        }

        Ok(())
    }

    fn prepare_payload(&mut self) {
        self.payload.clear();
        self.payload
            .reserve((self.data.length as usize).min(MAX_SPECULATIVE_RESERVE));
    }

    fn handle_report_byte(&mut self, byte: u8, sink: &mut impl SegmentSink) -> Result<(), Error> {
        match self.report_state {
            ReportState::ReportSerialNumberSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.report.report_serial_number = value;
                    self.report_state = ReportState::CheckpointSerialNumberSdnv;
                }
            }
            ReportState::CheckpointSerialNumberSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.report.checkpoint_serial_number = value;
                    self.report_state = ReportState::UpperBoundSdnv;
                }
            }
            ReportState::UpperBoundSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.report.upper_bound = value;
                    self.report_state = ReportState::LowerBoundSdnv;
                }
            }
            ReportState::LowerBoundSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.report.lower_bound = value;
                    self.report_state = ReportState::ReceptionClaimCountSdnv;
                }
            }
            ReportState::ReceptionClaimCountSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    if value == 0 {
                        return Err(Error::ZeroClaimCount);
                    }

                    self.claim_count = value;
                    self.report.claims.clear();
                    self.report
                        .claims
                        .reserve((value as usize).min(MAX_SPECULATIVE_RESERVE));
                    self.report_state = ReportState::ReceptionClaimOffsetSdnv;
                }
            }
            ReportState::ReceptionClaimOffsetSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.claim_offset = value;
                    self.report_state = ReportState::ReceptionClaimLengthSdnv;
                }
            }
            ReportState::ReceptionClaimLengthSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    if value == 0 {
                        return Err(Error::ZeroClaimLength);
                    }

                    self.report.claims.push(ReceptionClaim {
                        offset: self.claim_offset,
                        length: value,
                    });

                    if (self.report.claims.len() as u64) < self.claim_count {
                        self.report_state = ReportState::ReceptionClaimOffsetSdnv;
                    } else {
                        self.finish_body(sink);
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_trailer_byte(
        &mut self,
        byte: u8,
        bytes: &[u8],
        index: &mut usize,
        sink: &mut impl SegmentSink,
    ) -> Result<(), Error> {
        match self.trailer_state {
            TrailerState::ExtensionTagByte => {
                self.extension_tag = byte;
                self.sdnv_buf.clear();
                self.trailer_state = TrailerState::ExtensionLengthSdnv;
            }
            TrailerState::ExtensionLengthSdnv => {
                if let Some(value) = self.accumulate_sdnv(byte)? {
                    self.extension_length = value;
                    self.prepare_extension_value();
                    if value == 0 {
                        self.push_trailer_extension(sink);
                    } else {
                        self.trailer_state = TrailerState::ExtensionValue;
                    }
                }
            }
            TrailerState::ExtensionValue => {
                self.extension_value.push(byte);

                let remaining = (self.extension_length as usize) - self.extension_value.len();
                let run = remaining.min(bytes.len() - *index);
                if run > 0 {
                    self.extension_value
                        .extend_from_slice(&bytes[*index..*index + run]);
                    *index += run;
                }

                if self.extension_value.len() as u64 == self.extension_length {
                    self.push_trailer_extension(sink);
                }
            }
        }

        Ok(())
    }

    fn push_trailer_extension(&mut self, sink: &mut impl SegmentSink) {
        self.extensions.trailer.push(Extension {
            tag: self.extension_tag,
            value: mem::take(&mut self.extension_value),
        });

        if (self.extensions.trailer.len() as u8) < self.trailer_extension_count {
            self.trailer_state = TrailerState::ExtensionTagByte;
        } else {
            self.emit(sink);
        }
    }
}
