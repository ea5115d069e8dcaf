use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{SessionId, sdnv};

/// Segment type, carried in the low nibble of the first header byte.
///
/// The high nibble of that byte is the protocol version and must be zero.
/// Values 5, 6, 10 and 11 are undefined by the protocol and never parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SegmentType {
    RedData = 0,
    RedDataCheckpoint = 1,
    RedDataCheckpointEndOfRedPart = 2,
    RedDataCheckpointEndOfRedPartEndOfBlock = 3,
    GreenData = 4,
    GreenDataEndOfBlock = 7,
    ReportSegment = 8,
    ReportAckSegment = 9,
    CancelSegmentFromSender = 12,
    CancelAckToSender = 13,
    CancelSegmentFromReceiver = 14,
    CancelAckToReceiver = 15,
}

impl SegmentType {
    pub fn is_data(self) -> bool {
        (self as u8) <= 7
    }

    pub fn is_red(self) -> bool {
        (self as u8) <= 3
    }

    pub fn is_green(self) -> bool {
        matches!(self, Self::GreenData | Self::GreenDataEndOfBlock)
    }

    /// Checkpoints additionally carry checkpoint and report serial numbers.
    pub fn is_checkpoint(self) -> bool {
        matches!(
            self,
            Self::RedDataCheckpoint
                | Self::RedDataCheckpointEndOfRedPart
                | Self::RedDataCheckpointEndOfRedPartEndOfBlock
        )
    }

    pub fn is_end_of_red_part(self) -> bool {
        matches!(
            self,
            Self::RedDataCheckpointEndOfRedPart | Self::RedDataCheckpointEndOfRedPartEndOfBlock
        )
    }

    pub fn is_end_of_block(self) -> bool {
        matches!(
            self,
            Self::RedDataCheckpointEndOfRedPartEndOfBlock | Self::GreenDataEndOfBlock
        )
    }
}

/// Reason code carried by both cancel segment directions.
///
/// `Reserved` never appears on the wire; it marks a non-cancelled session
/// close in internal bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CancelReason {
    UserCancelled = 0,
    Unreachable = 1,
    RetransmitLimitExceeded = 2,
    Miscolored = 3,
    SystemCancelled = 4,
    RetransmitCycleLimitExceeded = 5,
    Reserved = 255,
}

/// One header or trailer extension TLV.
///
/// Unknown tags are tolerated and passed through to segment consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub tag: u8,
    pub value: Vec<u8>,
}

/// Header and trailer extension lists of one segment.
///
/// Each list is limited to 15 entries because both counts share a single
/// header byte, header count in the high nibble and trailer count in the low.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    pub header: Vec<Extension>,
    pub trailer: Vec<Extension>,
}

impl Extensions {
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.trailer.is_empty()
    }
}

/// Data segment fields other than the client service data itself.
///
/// The serial numbers are present exactly when the segment is a checkpoint;
/// a non-zero report serial number marks the checkpoint as a response to
/// that report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSegmentMetadata {
    pub client_service_id: u64,
    pub offset: u64,
    pub length: u64,
    pub checkpoint_serial_number: Option<u64>,
    pub report_serial_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub segment_type: SegmentType,
    pub metadata: DataSegmentMetadata,
    pub payload: Vec<u8>,
}

/// One contiguous run of received block bytes claimed by a report.
///
/// The offset is relative to the report's lower bound and the length is
/// always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionClaim {
    pub offset: u64,
    pub length: u64,
}

/// Reception report covering the scope `[lower_bound, upper_bound)`.
///
/// A zero checkpoint serial number marks an asynchronous report; otherwise it
/// names the checkpoint whose arrival triggered the report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSegment {
    pub report_serial_number: u64,
    pub checkpoint_serial_number: u64,
    pub upper_bound: u64,
    pub lower_bound: u64,
    pub claims: Vec<ReceptionClaim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentBody {
    Data(DataSegment),
    Report(ReportSegment),
    ReportAck { report_serial_number: u64 },
    Cancel { from_sender: bool, reason: CancelReason },
    CancelAck { to_sender: bool },
}

/// A fully parsed segment: common header plus the type-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub session_id: SessionId,
    pub extensions: Extensions,
    pub body: SegmentBody,
}

impl Segment {
    pub fn segment_type(&self) -> SegmentType {
        match &self.body {
            SegmentBody::Data(data) => data.segment_type,
            SegmentBody::Report(_) => SegmentType::ReportSegment,
            SegmentBody::ReportAck { .. } => SegmentType::ReportAckSegment,
            SegmentBody::Cancel { from_sender: true, .. } => SegmentType::CancelSegmentFromSender,
            SegmentBody::Cancel { from_sender: false, .. } => {
                SegmentType::CancelSegmentFromReceiver
            }
            SegmentBody::CancelAck { to_sender: true } => SegmentType::CancelAckToSender,
            SegmentBody::CancelAck { to_sender: false } => SegmentType::CancelAckToReceiver,
        }
    }

    /// Serialize the whole segment into a contiguous datagram.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use ltp_server_codec::SessionId;
    /// use ltp_server_codec::segment::*;
    ///
    /// let segment = Segment {
    ///     session_id: SessionId::new(5, 12),
    ///     extensions: Extensions::default(),
    ///     body: SegmentBody::ReportAck {
    ///         report_serial_number: 0xABC,
    ///     },
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    /// segment.encode(&mut bytes);
    ///
    /// assert_eq!(&bytes[..], &[0x09, 0x05, 0x0C, 0x00, 0x95, 0x3C]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        encode_header(self.segment_type(), self.session_id, &self.extensions, bytes);

        match &self.body {
            SegmentBody::Data(data) => {
                encode_data_segment_metadata(&data.metadata, bytes);
                bytes.extend_from_slice(&data.payload);
            }
            SegmentBody::Report(report) => report.encode_content(bytes),
            SegmentBody::ReportAck { report_serial_number } => {
                sdnv::encode_u64(*report_serial_number, bytes);
            }
            SegmentBody::Cancel { reason, .. } => {
                bytes.put_u8((*reason).into());
            }
            SegmentBody::CancelAck { .. } => {}
        }

        encode_extension_list(&self.extensions.trailer, bytes);
    }
}

fn encode_extension_list(extensions: &[Extension], bytes: &mut BytesMut) {
    for extension in extensions {
        bytes.put_u8(extension.tag);
        sdnv::encode_u64(extension.value.len() as u64, bytes);
        bytes.extend_from_slice(&extension.value);
    }
}

fn encode_header(
    segment_type: SegmentType,
    session_id: SessionId,
    extensions: &Extensions,
    bytes: &mut BytesMut,
) {
    debug_assert!(extensions.header.len() <= 15 && extensions.trailer.len() <= 15);

    bytes.clear();
    bytes.put_u8(segment_type.into());
    sdnv::encode_u64(session_id.originator, bytes);
    sdnv::encode_u64(session_id.number, bytes);
    bytes.put_u8(((extensions.header.len() as u8) << 4) | extensions.trailer.len() as u8);
    encode_extension_list(&extensions.header, bytes);
}

fn encode_data_segment_metadata(metadata: &DataSegmentMetadata, bytes: &mut BytesMut) {
    sdnv::encode_u64(metadata.client_service_id, bytes);
    sdnv::encode_u64(metadata.offset, bytes);
    sdnv::encode_u64(metadata.length, bytes);
    if let Some(checkpoint_serial_number) = metadata.checkpoint_serial_number {
        sdnv::encode_u64(checkpoint_serial_number, bytes);
        sdnv::encode_u64(metadata.report_serial_number.unwrap_or(0), bytes);
    }
}

/// Serialize a data segment header without its client service data.
///
/// The payload is expected to follow as a separate scatter-gather fragment
/// borrowed from the sender's block, with `metadata.length` giving its size.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use ltp_server_codec::SessionId;
/// use ltp_server_codec::segment::*;
///
/// let metadata = DataSegmentMetadata {
///     client_service_id: 2,
///     offset: 0,
///     length: 3,
///     checkpoint_serial_number: None,
///     report_serial_number: None,
/// };
///
/// let mut bytes = BytesMut::new();
/// encode_data_segment_header(
///     SegmentType::RedData,
///     SessionId::new(1, 9),
///     &metadata,
///     &mut bytes,
/// );
///
/// assert_eq!(&bytes[..], &[0x00, 0x01, 0x09, 0x00, 0x02, 0x00, 0x03]);
/// ```
pub fn encode_data_segment_header(
    segment_type: SegmentType,
    session_id: SessionId,
    metadata: &DataSegmentMetadata,
    bytes: &mut BytesMut,
) {
    debug_assert!(segment_type.is_data());
    debug_assert!(segment_type.is_checkpoint() == metadata.checkpoint_serial_number.is_some());

    encode_header(segment_type, session_id, &Extensions::default(), bytes);
    encode_data_segment_metadata(metadata, bytes);
}

impl ReportSegment {
    fn encode_content(&self, bytes: &mut BytesMut) {
        sdnv::encode_u64(self.report_serial_number, bytes);
        sdnv::encode_u64(self.checkpoint_serial_number, bytes);
        sdnv::encode_u64(self.upper_bound, bytes);
        sdnv::encode_u64(self.lower_bound, bytes);
        sdnv::encode_u64(self.claims.len() as u64, bytes);
        for claim in &self.claims {
            sdnv::encode_u64(claim.offset, bytes);
            sdnv::encode_u64(claim.length, bytes);
        }
    }

    /// Serialize a complete report segment packet.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use ltp_server_codec::SessionId;
    /// use ltp_server_codec::segment::*;
    ///
    /// let report = ReportSegment {
    ///     report_serial_number: 7,
    ///     checkpoint_serial_number: 1,
    ///     upper_bound: 44,
    ///     lower_bound: 0,
    ///     claims: vec![ReceptionClaim { offset: 0, length: 44 }],
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    /// report.encode(SessionId::new(1, 2), &mut bytes);
    ///
    /// assert_eq!(&bytes[..], &[0x08, 0x01, 0x02, 0x00, 0x07, 0x01, 0x2C, 0x00, 0x01, 0x00, 0x2C]);
    /// ```
    pub fn encode(&self, session_id: SessionId, bytes: &mut BytesMut) {
        debug_assert!(!self.claims.is_empty());

        encode_header(SegmentType::ReportSegment, session_id, &Extensions::default(), bytes);
        self.encode_content(bytes);
    }
}

/// Serialize a complete report acknowledgement packet.
pub fn encode_report_ack(session_id: SessionId, report_serial_number: u64, bytes: &mut BytesMut) {
    encode_header(SegmentType::ReportAckSegment, session_id, &Extensions::default(), bytes);
    sdnv::encode_u64(report_serial_number, bytes);
}

/// Serialize a complete cancel segment packet for either direction.
pub fn encode_cancel_segment(
    from_sender: bool,
    session_id: SessionId,
    reason: CancelReason,
    bytes: &mut BytesMut,
) {
    let segment_type = if from_sender {
        SegmentType::CancelSegmentFromSender
    } else {
        SegmentType::CancelSegmentFromReceiver
    };

    encode_header(segment_type, session_id, &Extensions::default(), bytes);
    bytes.put_u8(reason.into());
}

/// Serialize a complete cancel acknowledgement packet for either direction.
pub fn encode_cancel_ack(to_sender: bool, session_id: SessionId, bytes: &mut BytesMut) {
    let segment_type = if to_sender {
        SegmentType::CancelAckToSender
    } else {
        SegmentType::CancelAckToReceiver
    };

    encode_header(segment_type, session_id, &Extensions::default(), bytes);
}
