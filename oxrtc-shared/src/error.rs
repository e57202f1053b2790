use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("packet too big")]
    ErrPacketTooBig,

    //SDP errors
    #[error("malformed sdp line: {0}")]
    ErrMalformedSdpLine(String),
    #[error("malformed media line: {0}")]
    ErrMalformedMediaLine(String),
    #[error("malformed connection line: {0}")]
    ErrMalformedConnectionLine(String),
    #[error("malformed candidate attribute: {0}")]
    ErrMalformedCandidate(String),
    #[error("malformed fingerprint attribute: {0}")]
    ErrMalformedFingerprint(String),
    #[error("unknown setup role: {0}")]
    ErrUnknownSetupRole(String),
    #[error("forbidden RTP payload type {0}")]
    ErrForbiddenPayloadType(u8),
    #[error("unknown sdp type: {0}")]
    ErrUnknownSdpType(String),

    //STUN errors
    #[error("unexpected EOF: not enough bytes to read header")]
    ErrUnexpectedHeaderEof,
    #[error("invalid magic cookie: {0:#x}")]
    ErrInvalidMagicCookie(u32),
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,
    #[error("attribute not found")]
    ErrAttributeNotFound,
    #[error("integrity check failed")]
    ErrIntegrityMismatch,
    #[error("fingerprint check failed")]
    ErrFingerprintMismatch,
    #[error("invalid length of IP value")]
    ErrBadIpLength,
    #[error("unexpected STUN message class/method")]
    ErrUnexpectedStunMessage,

    //ICE errors
    #[error("local username fragment is less than 24 bits long")]
    ErrLocalUfragInsufficientBits,
    #[error("local password is less than 128 bits long")]
    ErrLocalPwdInsufficientBits,
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,
    #[error("username mismatch")]
    ErrMismatchUsername,
    #[error("agent is closed")]
    ErrAgentClosed,

    //DTLS errors
    #[error("conn is closed")]
    ErrConnClosed,
    #[error("handshake is in progress")]
    ErrHandshakeInProgress,
    #[error("handshake timed out")]
    ErrHandshakeTimeout,
    #[error("invalid content type {0}")]
    ErrInvalidContentType(u8),
    #[error("unsupported protocol version")]
    ErrUnsupportedProtocolVersion,
    #[error("packet length and declared length do not match")]
    ErrInvalidPacketLength,
    #[error("invalid handshake type {0}")]
    ErrInvalidHandshakeType(u8),
    #[error("remote certificate does not match SDP fingerprint")]
    ErrCertificateFingerprintMismatch,
    #[error("record decryption failed")]
    ErrDecryptFailed,
    #[error("alert is fatal or close notify")]
    ErrAlertFatalOrClose,
    #[error("no certificate provided")]
    ErrInvalidCertificate,

    //SRTP errors
    #[error("failed to verify auth tag")]
    ErrFailedToVerifyAuthTag,
    #[error("duplicated packet")]
    ErrDuplicated,
    #[error("packet is too short to be RTP packet")]
    ErrTooShortRtp,
    #[error("packet is too short to be RTCP packet")]
    ErrTooShortRtcp,
    #[error("SRTP master key is not long enough")]
    ErrShortSrtpMasterKey,
    #[error("SRTP master salt is not long enough")]
    ErrShortSrtpMasterSalt,

    //SCTP errors
    #[error("raw is too small for a SCTP chunk")]
    ErrChunkHeaderTooSmall,
    #[error("chunk has invalid length")]
    ErrChunkHeaderInvalidLength,
    #[error("raw is smaller than the minimum length for a SCTP packet")]
    ErrPacketRawTooSmall,
    #[error("checksum mismatch theirs")]
    ErrChecksumMismatch,
    #[error("failed to unmarshal, contains unknown chunk type {0}")]
    ErrUnmarshalUnknownChunkType(u8),
    #[error("init chunk must not be bundled with any other chunk")]
    ErrInitChunkBundled,
    #[error("init chunk expects a verification tag of 0 on the packet")]
    ErrInitChunkVerifyTagNotZero,
    #[error("no cookie in InitAck")]
    ErrInitAckNoCookie,
    #[error("association aborted: {0}")]
    ErrAssociationAborted(String),
    #[error("sending payload data in non-Established state")]
    ErrAssociationNotEstablished,
    #[error("shutdown called in non-Established state")]
    ErrShutdownNonEstablished,
    #[error("stream closed")]
    ErrStreamClosed,
    #[error("stream not existed")]
    ErrStreamNotExisted,
    #[error("outbound packet larger than maximum message size")]
    ErrOutboundPacketTooLarge,

    //RTP/RTCP errors
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("invalid packet version")]
    ErrBadVersion,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("packet too short to be read")]
    ErrPacketTooShort,
    #[error("wrong packet type")]
    ErrWrongType,
    #[error("invalid total lost count")]
    ErrInvalidTotalLost,
    #[error("too many reports")]
    ErrTooManyReports,
    #[error("missing REMB identifier")]
    ErrMissingRembIdentifier,

    //Data Channel errors
    #[error("DataChannel message is not long enough to determine type: (expected: {expected}, actual: {actual})")]
    UnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("unknown MessageType {0}")]
    InvalidMessageType(u8),
    #[error("unknown ChannelType {0}")]
    InvalidChannelType(u8),
    #[error("data channel closed")]
    ErrDataChannelClosed,
    #[error("data channel label exceeds size limit")]
    ErrStringSizeLimit,
    #[error("max data channel id reached")]
    ErrMaxDataChannelID,
    #[error("both max_packet_life_time and max_retransmits was set")]
    ErrRetransmitsOrPacketLifeTime,

    //PeerConnection errors
    #[error("connection closed")]
    ErrConnectionClosed,
    #[error("invalid signaling state transition: {0}")]
    ErrInvalidSignalingStateTransition(String),
    #[error("remote description is not set")]
    ErrNoRemoteDescription,
    #[error("cannot negotiate with no media and no data channels")]
    ErrNothingToNegotiate,
    #[error("set_remote_description called with no fingerprint")]
    ErrSessionDescriptionNoFingerprint,
    #[error("set_remote_description called with no ice-ufrag")]
    ErrSessionDescriptionMissingIceUfrag,
    #[error("set_remote_description called with no ice-pwd")]
    ErrSessionDescriptionMissingIcePwd,

    #[error("{0}")]
    Other(String),
}
