use bytes::BytesMut;
use log::{debug, trace, warn};
use rand::RngCore;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext};

use crate::crypto::{
    self, Certificate, CipherState, KeySchedule, SrtpKeyingMaterial, VERIFY_DATA_LEN,
};
use crate::handshake::{
    encode_certificate, encode_client_key_exchange, encode_server_key_exchange,
    parse_certificate, parse_client_key_exchange, parse_server_key_exchange, ClientHello,
    HandshakeMessage, HandshakeType, ServerHello, CIPHER_SUITE,
};
use crate::record::{gcm_additional_data, ContentType, Record};

const ALERT_LEVEL_WARNING: u8 = 1;
const ALERT_LEVEL_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DtlsRole {
    /// `a=setup:active`, initiates the handshake.
    Client,
    /// `a=setup:passive`, awaits the ClientHello.
    Server,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlsEvent {
    HandshakeComplete,
    ApplicationData(BytesMut),
}

#[derive(Debug, Clone)]
pub struct DtlsConfig {
    pub certificate: Certificate,
    /// Expected SHA-256 fingerprint of the peer certificate, from the
    /// remote description. The handshake fails without it.
    pub remote_fingerprint: String,
    pub role: DtlsRole,
    pub initial_rto: Duration,
    pub max_retransmits: u8,
}

impl DtlsConfig {
    pub fn new(certificate: Certificate, remote_fingerprint: String, role: DtlsRole) -> Self {
        Self {
            certificate,
            remote_fingerprint,
            role,
            initial_rto: Duration::from_secs(1),
            max_retransmits: 7,
        }
    }
}

/// Sans-I/O DTLS endpoint: feed it tagged datagrams and instants, drain
/// transmits and events.
pub struct DtlsEndpoint {
    role: DtlsRole,
    state: HandshakeState,

    certificate: Certificate,
    remote_fingerprint: String,

    client_random: [u8; 32],
    server_random: [u8; 32],
    local_private: Option<EphemeralPrivateKey>,
    remote_public: Option<Vec<u8>>,
    master_secret: Option<Vec<u8>>,
    key_schedule: Option<KeySchedule>,

    /// Concatenation of every handshake message exchanged so far, in
    /// DTLS framing, for the Finished hashes.
    transcript: Vec<u8>,

    next_send_seq: u16,
    next_recv_seq: u16,
    write_epoch: u16,
    read_epoch: u16,
    /// Record sequence numbers per write epoch.
    record_seq: [u64; 2],

    /// Last sent flight, kept verbatim for retransmission.
    last_flight: Vec<u8>,
    flight_sent_at: Option<Instant>,
    retransmit_count: u8,
    initial_rto: Duration,
    max_retransmits: u8,

    transport: Option<TransportContext>,

    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<DtlsEvent>,
}

impl DtlsEndpoint {
    pub fn new(config: DtlsConfig) -> Self {
        Self {
            role: config.role,
            state: HandshakeState::New,
            certificate: config.certificate,
            remote_fingerprint: config.remote_fingerprint,
            client_random: [0u8; 32],
            server_random: [0u8; 32],
            local_private: None,
            remote_public: None,
            master_secret: None,
            key_schedule: None,
            transcript: vec![],
            next_send_seq: 0,
            next_recv_seq: 0,
            write_epoch: 0,
            read_epoch: 0,
            record_seq: [0; 2],
            last_flight: vec![],
            flight_sent_at: None,
            retransmit_count: 0,
            initial_rto: config.initial_rto,
            max_retransmits: config.max_retransmits,
            transport: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.state == HandshakeState::Connected
    }

    pub fn local_fingerprint(&self) -> &str {
        &self.certificate.fingerprint
    }

    /// Kicks off the handshake. Only the client sends anything here; the
    /// server arms itself and waits for the ClientHello.
    pub fn start_handshake(&mut self, transport: TransportContext, now: Instant) -> Result<()> {
        if self.state != HandshakeState::New {
            return Err(Error::ErrHandshakeInProgress);
        }
        self.transport = Some(transport);
        self.state = HandshakeState::Connecting;
        if self.role == DtlsRole::Client {
            rand::rng().fill_bytes(&mut self.client_random);
            let hello = self.stage_handshake(HandshakeType::ClientHello, ClientHello::encode(self.client_random));
            let mut flight = vec![];
            self.push_handshake_record(hello, &mut flight);
            self.send_flight(flight, now);
        }
        Ok(())
    }

    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.state == HandshakeState::Closed || self.state == HandshakeState::Failed {
            return Err(Error::ErrConnClosed);
        }
        self.transport = Some(msg.transport);
        let records = Record::decode_all(&msg.message)?;
        for record in records {
            self.handle_record(record, msg.now)?;
        }
        Ok(())
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.state != HandshakeState::Connecting {
            return Ok(());
        }
        let Some(sent_at) = self.flight_sent_at else {
            return Ok(());
        };
        if now < sent_at + self.rto() {
            return Ok(());
        }
        if self.retransmit_count >= self.max_retransmits {
            warn!("dtls handshake timed out after {} retransmits", self.retransmit_count);
            self.state = HandshakeState::Failed;
            return Err(Error::ErrHandshakeTimeout);
        }
        self.retransmit_count += 1;
        self.flight_sent_at = Some(now);
        debug!("retransmitting dtls flight, attempt {}", self.retransmit_count);
        self.queue_datagram(self.last_flight.clone(), now);
        Ok(())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state != HandshakeState::Connecting {
            return None;
        }
        self.flight_sent_at.map(|t| t + self.rto())
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<DtlsEvent> {
        self.events.pop_front()
    }

    /// Sends application data (the SCTP association rides on this).
    pub fn write(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if self.state != HandshakeState::Connected {
            return Err(Error::ErrHandshakeInProgress);
        }
        let mut datagram = vec![];
        self.push_encrypted_record(ContentType::ApplicationData, data, &mut datagram)?;
        self.queue_datagram(datagram, now);
        Ok(())
    }

    /// SRTP master keys per RFC 5705 export, available once connected.
    pub fn export_srtp_keying_material(&self) -> Result<SrtpKeyingMaterial> {
        if self.state != HandshakeState::Connected {
            return Err(Error::ErrHandshakeInProgress);
        }
        let master = self.master_secret.as_ref().ok_or(Error::ErrHandshakeInProgress)?;
        Ok(crypto::export_srtp_keying_material(
            master,
            &self.client_random,
            &self.server_random,
        ))
    }

    /// Sends close_notify and tears the endpoint down.
    pub fn close(&mut self, now: Instant) {
        if self.state == HandshakeState::Closed {
            return;
        }
        if self.transport.is_some() {
            let alert = [ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY];
            let mut datagram = vec![];
            if self.write_epoch == 1 {
                let _ = self.push_encrypted_record(ContentType::Alert, &alert, &mut datagram);
            } else {
                self.push_plain_record(ContentType::Alert, alert.to_vec(), &mut datagram);
            }
            self.queue_datagram(datagram, now);
        }
        self.state = HandshakeState::Closed;
        self.flight_sent_at = None;
    }

    fn rto(&self) -> Duration {
        self.initial_rto * 2u32.saturating_pow(u32::from(self.retransmit_count.min(6)))
    }

    fn handle_record(&mut self, record: Record, now: Instant) -> Result<()> {
        let payload = if record.epoch == 0 {
            record.payload.clone()
        } else {
            if record.epoch > self.read_epoch {
                // encrypted record before the peer's ChangeCipherSpec
                trace!("dropping epoch {} record before cipher change", record.epoch);
                return Ok(());
            }
            let aad_template = gcm_additional_data(
                record.content_type,
                record.epoch,
                record.sequence_number,
                0,
            );
            self.open_record(&aad_template, &record)?
        };

        match record.content_type {
            ContentType::Handshake => self.handle_handshake_payload(&payload, now),
            ContentType::ChangeCipherSpec => {
                self.read_epoch = 1;
                Ok(())
            }
            ContentType::Alert => {
                let (level, description) = match payload.as_slice() {
                    [l, d, ..] => (*l, *d),
                    _ => return Err(Error::ErrInvalidPacketLength),
                };
                debug!("dtls alert level {level} description {description}");
                if level == ALERT_LEVEL_FATAL || description == ALERT_CLOSE_NOTIFY {
                    self.state = HandshakeState::Closed;
                    return Err(Error::ErrAlertFatalOrClose);
                }
                Ok(())
            }
            ContentType::ApplicationData => {
                if self.state == HandshakeState::Connected {
                    self.events
                        .push_back(DtlsEvent::ApplicationData(BytesMut::from(&payload[..])));
                } else {
                    trace!("dropping early application data");
                }
                Ok(())
            }
        }
    }

    fn open_record(&self, aad_template: &[u8; 13], record: &Record) -> Result<Vec<u8>> {
        let cipher = self.read_cipher()?;
        let overhead = crypto::GCM_EXPLICIT_NONCE_LEN + crypto::GCM_TAG_LEN;
        if record.payload.len() < overhead {
            return Err(Error::ErrInvalidPacketLength);
        }
        let mut aad = *aad_template;
        let plaintext_len = (record.payload.len() - overhead) as u16;
        aad[11..13].copy_from_slice(&plaintext_len.to_be_bytes());
        cipher.open(&aad, &record.payload)
    }

    fn handle_handshake_payload(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        for message in HandshakeMessage::decode_all(payload)? {
            if message.message_seq < self.next_recv_seq {
                // the peer did not see our last flight, replay it
                trace!("duplicate handshake message seq {}", message.message_seq);
                if !self.last_flight.is_empty() {
                    self.queue_datagram(self.last_flight.clone(), now);
                }
                continue;
            }
            if message.message_seq > self.next_recv_seq {
                trace!("out of order handshake message seq {}", message.message_seq);
                continue;
            }
            self.next_recv_seq += 1;
            self.transcript.extend_from_slice(&message.encode());
            self.handle_handshake_message(message, now)?;
        }
        Ok(())
    }

    fn handle_handshake_message(&mut self, message: HandshakeMessage, now: Instant) -> Result<()> {
        match (self.role, message.typ) {
            (DtlsRole::Server, HandshakeType::ClientHello) => {
                let hello = ClientHello::parse(&message.body)?;
                if !hello.cipher_suites.contains(&CIPHER_SUITE) || !hello.offers_srtp {
                    return Err(Error::ErrUnsupportedProtocolVersion);
                }
                self.client_random = hello.random;
                rand::rng().fill_bytes(&mut self.server_random);
                self.generate_key_pair()?;
                let public_key = self.local_public_key()?;

                // transcript must contain the ClientHello before our flight
                let server_hello =
                    self.stage_handshake(HandshakeType::ServerHello, ServerHello::encode(self.server_random));
                let certificate = self.stage_handshake(
                    HandshakeType::Certificate,
                    encode_certificate(&self.certificate.der.clone()),
                );
                let key_exchange = self.stage_handshake(
                    HandshakeType::ServerKeyExchange,
                    encode_server_key_exchange(&public_key),
                );
                let hello_done = self.stage_handshake(HandshakeType::ServerHelloDone, vec![]);

                let mut flight = vec![];
                self.push_handshake_record(server_hello, &mut flight);
                self.push_handshake_record(certificate, &mut flight);
                self.push_handshake_record(key_exchange, &mut flight);
                self.push_handshake_record(hello_done, &mut flight);
                self.send_flight(flight, now);
                Ok(())
            }
            (DtlsRole::Client, HandshakeType::ServerHello) => {
                let hello = ServerHello::parse(&message.body)?;
                if hello.cipher_suite != CIPHER_SUITE || !hello.offers_srtp {
                    return Err(Error::ErrUnsupportedProtocolVersion);
                }
                self.server_random = hello.random;
                Ok(())
            }
            (_, HandshakeType::Certificate) => {
                let der = parse_certificate(&message.body)?;
                self.verify_peer_certificate(&der)
            }
            (DtlsRole::Client, HandshakeType::ServerKeyExchange) => {
                self.remote_public = Some(parse_server_key_exchange(&message.body)?);
                Ok(())
            }
            (DtlsRole::Client, HandshakeType::ServerHelloDone) => {
                self.generate_key_pair()?;
                let public_key = self.local_public_key()?;
                self.derive_keys()?;

                let certificate = self.stage_handshake(
                    HandshakeType::Certificate,
                    encode_certificate(&self.certificate.der.clone()),
                );
                let key_exchange = self.stage_handshake(
                    HandshakeType::ClientKeyExchange,
                    encode_client_key_exchange(&public_key),
                );
                let finished = self.stage_handshake(
                    HandshakeType::Finished,
                    crypto::verify_data(
                        self.master_secret.as_ref().ok_or(Error::ErrHandshakeInProgress)?,
                        &self.transcript_hash(),
                        true,
                    ),
                );

                let mut flight = vec![];
                self.push_handshake_record(certificate, &mut flight);
                self.push_handshake_record(key_exchange, &mut flight);
                self.push_change_cipher_spec(&mut flight);
                self.push_encrypted_handshake_record(&finished, &mut flight)?;
                self.send_flight(flight, now);
                Ok(())
            }
            (DtlsRole::Server, HandshakeType::ClientKeyExchange) => {
                self.remote_public = Some(parse_client_key_exchange(&message.body)?);
                self.derive_keys()
            }
            (_, HandshakeType::Finished) => self.handle_finished(message, now),
            _ => Err(Error::ErrInvalidHandshakeType(message.typ.value())),
        }
    }

    fn handle_finished(&mut self, message: HandshakeMessage, now: Instant) -> Result<()> {
        // the hash excludes this very message, which was already appended
        let encoded = message.encode();
        let hash_end = self.transcript.len() - encoded.len();
        let hash = Sha256::digest(&self.transcript[..hash_end]).to_vec();

        let master = self
            .master_secret
            .as_ref()
            .ok_or(Error::ErrHandshakeInProgress)?;
        let expected = crypto::verify_data(master, &hash, self.role == DtlsRole::Server);
        if message.body.len() != VERIFY_DATA_LEN || message.body != expected {
            self.state = HandshakeState::Failed;
            return Err(Error::ErrIntegrityMismatch);
        }

        if self.role == DtlsRole::Server {
            let finished = self.stage_handshake(
                HandshakeType::Finished,
                crypto::verify_data(
                    self.master_secret.as_ref().ok_or(Error::ErrHandshakeInProgress)?,
                    &self.transcript_hash(),
                    false,
                ),
            );
            let mut flight = vec![];
            self.push_change_cipher_spec(&mut flight);
            self.push_encrypted_handshake_record(&finished, &mut flight)?;
            self.send_flight(flight, now);
        } else {
            // client flights end here, nothing left to retransmit
            self.flight_sent_at = None;
        }
        debug!("dtls handshake complete as {:?}", self.role);
        self.state = HandshakeState::Connected;
        self.events.push_back(DtlsEvent::HandshakeComplete);
        Ok(())
    }

    fn verify_peer_certificate(&mut self, der: &[u8]) -> Result<()> {
        let fingerprint = crypto::fingerprint_of(der);
        if !fingerprint.eq_ignore_ascii_case(&self.remote_fingerprint) {
            warn!("certificate fingerprint mismatch");
            self.state = HandshakeState::Failed;
            return Err(Error::ErrCertificateFingerprintMismatch);
        }
        Ok(())
    }

    fn generate_key_pair(&mut self) -> Result<()> {
        let rng = ring::rand::SystemRandom::new();
        let private =
            EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| Error::ErrDecryptFailed)?;
        self.local_private = Some(private);
        Ok(())
    }

    fn local_public_key(&self) -> Result<Vec<u8>> {
        let private = self.local_private.as_ref().ok_or(Error::ErrHandshakeInProgress)?;
        Ok(private
            .compute_public_key()
            .map_err(|_| Error::ErrDecryptFailed)?
            .as_ref()
            .to_vec())
    }

    fn derive_keys(&mut self) -> Result<()> {
        let private = self.local_private.take().ok_or(Error::ErrHandshakeInProgress)?;
        let remote_public = self
            .remote_public
            .as_ref()
            .ok_or(Error::ErrHandshakeInProgress)?;
        let peer = UnparsedPublicKey::new(&X25519, remote_public.clone());
        let pre_master = agree_ephemeral(private, &peer, |secret| secret.to_vec())
            .map_err(|_| Error::ErrDecryptFailed)?;

        let master = crypto::master_secret(&pre_master, &self.client_random, &self.server_random);
        self.key_schedule = Some(KeySchedule::new(
            &master,
            &self.client_random,
            &self.server_random,
        )?);
        self.master_secret = Some(master);
        Ok(())
    }

    fn transcript_hash(&self) -> Vec<u8> {
        Sha256::digest(&self.transcript).to_vec()
    }

    /// Encodes a handshake message, records it in the transcript, and
    /// advances the send sequence.
    fn stage_handshake(&mut self, typ: HandshakeType, body: Vec<u8>) -> HandshakeMessage {
        let message = HandshakeMessage {
            typ,
            message_seq: self.next_send_seq,
            body,
        };
        self.next_send_seq += 1;
        self.transcript.extend_from_slice(&message.encode());
        message
    }

    fn push_handshake_record(&mut self, message: HandshakeMessage, out: &mut Vec<u8>) {
        self.push_plain_record(ContentType::Handshake, message.encode(), out);
    }

    fn push_plain_record(&mut self, content_type: ContentType, payload: Vec<u8>, out: &mut Vec<u8>) {
        let record = Record {
            content_type,
            epoch: 0,
            sequence_number: self.record_seq[0],
            payload,
        };
        self.record_seq[0] += 1;
        record.encode(out);
    }

    fn push_change_cipher_spec(&mut self, out: &mut Vec<u8>) {
        self.push_plain_record(ContentType::ChangeCipherSpec, vec![1], out);
        self.write_epoch = 1;
    }

    fn push_encrypted_handshake_record(&mut self, message: &HandshakeMessage, out: &mut Vec<u8>) -> Result<()> {
        self.push_encrypted_record(ContentType::Handshake, &message.encode(), out)
    }

    fn push_encrypted_record(
        &mut self,
        content_type: ContentType,
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let sequence_number = self.record_seq[1];
        let aad = gcm_additional_data(content_type, 1, sequence_number, plaintext.len());
        let sealed = self.write_cipher()?.seal(&aad, plaintext)?;
        let record = Record {
            content_type,
            epoch: 1,
            sequence_number,
            payload: sealed,
        };
        self.record_seq[1] += 1;
        record.encode(out);
        Ok(())
    }

    fn write_cipher(&self) -> Result<&CipherState> {
        let schedule = self.key_schedule.as_ref().ok_or(Error::ErrHandshakeInProgress)?;
        Ok(match self.role {
            DtlsRole::Client => &schedule.client_write,
            DtlsRole::Server => &schedule.server_write,
        })
    }

    fn read_cipher(&self) -> Result<&CipherState> {
        let schedule = self.key_schedule.as_ref().ok_or(Error::ErrHandshakeInProgress)?;
        Ok(match self.role {
            DtlsRole::Client => &schedule.server_write,
            DtlsRole::Server => &schedule.client_write,
        })
    }

    fn send_flight(&mut self, datagram: Vec<u8>, now: Instant) {
        self.last_flight = datagram.clone();
        self.flight_sent_at = Some(now);
        self.retransmit_count = 0;
        self.queue_datagram(datagram, now);
    }

    fn queue_datagram(&mut self, datagram: Vec<u8>, now: Instant) {
        let Some(transport) = self.transport else {
            return;
        };
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport,
            message: BytesMut::from(&datagram[..]),
        });
    }
}

#[cfg(test)]
mod endpoint_test {
    use super::*;

    fn pair() -> (DtlsEndpoint, DtlsEndpoint) {
        let client_cert = Certificate::generate().unwrap();
        let server_cert = Certificate::generate().unwrap();
        let client = DtlsEndpoint::new(DtlsConfig::new(
            client_cert.clone(),
            server_cert.fingerprint.clone(),
            DtlsRole::Client,
        ));
        let server = DtlsEndpoint::new(DtlsConfig::new(
            server_cert,
            client_cert.fingerprint,
            DtlsRole::Server,
        ));
        (client, server)
    }

    fn transport() -> TransportContext {
        TransportContext::default()
    }

    fn shuttle(from: &mut DtlsEndpoint, to: &mut DtlsEndpoint, now: Instant) {
        while let Some(t) = from.poll_transmit() {
            to.handle_read(TaggedBytesMut {
                now,
                transport: t.transport,
                message: t.message,
            })
            .unwrap();
        }
    }

    fn run_handshake(client: &mut DtlsEndpoint, server: &mut DtlsEndpoint) {
        let now = Instant::now();
        server.start_handshake(transport(), now).unwrap();
        client.start_handshake(transport(), now).unwrap();
        for _ in 0..4 {
            shuttle(client, server, now);
            shuttle(server, client, now);
        }
        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());
    }

    #[test]
    fn test_handshake_completes() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);
        assert_eq!(client.poll_event(), Some(DtlsEvent::HandshakeComplete));
        assert_eq!(server.poll_event(), Some(DtlsEvent::HandshakeComplete));
    }

    #[test]
    fn test_application_data_both_ways() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);
        client.poll_event();
        server.poll_event();

        let now = Instant::now();
        client.write(b"from client", now).unwrap();
        shuttle(&mut client, &mut server, now);
        assert_eq!(
            server.poll_event(),
            Some(DtlsEvent::ApplicationData(BytesMut::from(&b"from client"[..])))
        );

        server.write(b"from server", now).unwrap();
        shuttle(&mut server, &mut client, now);
        assert_eq!(
            client.poll_event(),
            Some(DtlsEvent::ApplicationData(BytesMut::from(&b"from server"[..])))
        );
    }

    #[test]
    fn test_keying_material_matches() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);
        let client_material = client.export_srtp_keying_material().unwrap();
        let server_material = server.export_srtp_keying_material().unwrap();
        assert_eq!(client_material, server_material);
    }

    #[test]
    fn test_fingerprint_mismatch_aborts() {
        let (mut client, _) = pair();
        // the server the client actually talks to has a different cert
        let other_cert = Certificate::generate().unwrap();
        let mut imposter = DtlsEndpoint::new(DtlsConfig::new(
            other_cert,
            client.local_fingerprint().to_string(),
            DtlsRole::Server,
        ));

        let now = Instant::now();
        imposter.start_handshake(transport(), now).unwrap();
        client.start_handshake(transport(), now).unwrap();

        // CH over, server flight back; the client must refuse the cert
        while let Some(t) = client.poll_transmit() {
            imposter
                .handle_read(TaggedBytesMut {
                    now,
                    transport: t.transport,
                    message: t.message,
                })
                .unwrap();
        }
        let mut rejected = false;
        while let Some(t) = imposter.poll_transmit() {
            if client
                .handle_read(TaggedBytesMut {
                    now,
                    transport: t.transport,
                    message: t.message,
                })
                .is_err()
            {
                rejected = true;
            }
        }
        assert!(rejected);
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_lost_flight_is_retransmitted() {
        let (mut client, mut server) = pair();
        let mut now = Instant::now();
        server.start_handshake(transport(), now).unwrap();
        client.start_handshake(transport(), now).unwrap();

        // drop the first ClientHello on the floor
        assert!(client.poll_transmit().is_some());
        assert!(client.poll_transmit().is_none());

        now += Duration::from_secs(2);
        client.handle_timeout(now).unwrap();
        for _ in 0..4 {
            shuttle(&mut client, &mut server, now);
            shuttle(&mut server, &mut client, now);
        }
        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());
    }

    #[test]
    fn test_write_before_handshake_fails() {
        let (mut client, _) = pair();
        assert_eq!(
            client.write(b"too soon", Instant::now()).err(),
            Some(Error::ErrHandshakeInProgress)
        );
    }

    #[test]
    fn test_close_notify_closes_peer() {
        let (mut client, mut server) = pair();
        run_handshake(&mut client, &mut server);
        let now = Instant::now();
        client.close(now);
        let t = client.poll_transmit().unwrap();
        let err = server.handle_read(TaggedBytesMut {
            now,
            transport: t.transport,
            message: t.message,
        });
        assert_eq!(err.err(), Some(Error::ErrAlertFatalOrClose));
        assert_eq!(server.state(), HandshakeState::Closed);
    }
}
