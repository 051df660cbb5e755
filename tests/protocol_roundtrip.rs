//! End-to-end relay crypto against a mock 3-hop relay chain.
//!
//! The mock relays hold the same key material a real guard/middle/exit
//! would derive from the ntor handshake, keep their cipher state across
//! cells, and verify rolling digests exactly as the protocol requires.

use ctr::cipher::{KeyIvInit, StreamCipher};
use tor_client::protocol::{
    decrypt_inbound, encrypt_outbound, Aes128Ctr, Cell, CircuitKeys, Hop, RelayCell,
    RelayCommand, RollingDigest,
};

fn keys(tag: u8) -> CircuitKeys {
    let mut okm = [0u8; 72];
    for (i, b) in okm.iter_mut().enumerate() {
        *b = tag.wrapping_mul(37).wrapping_add(i as u8 ^ 0x5A);
    }
    CircuitKeys::split_key_material(&okm)
}

/// The relay-side view of one hop: forward decryption cipher, forward
/// digest check, backward stamping + encryption.
struct MockRelay {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: RollingDigest,
    backward_digest: RollingDigest,
}

impl MockRelay {
    fn new(k: &CircuitKeys) -> Self {
        let zero_iv = [0u8; 16];
        Self {
            forward_cipher: Aes128Ctr::new((&k.forward_key).into(), (&zero_iv).into()),
            backward_cipher: Aes128Ctr::new((&k.backward_key).into(), (&zero_iv).into()),
            forward_digest: RollingDigest::seeded(&k.forward_digest_seed),
            backward_digest: RollingDigest::seeded(&k.backward_digest_seed),
        }
    }

    /// Peel one forward layer (what every relay does on the way out).
    fn peel(&mut self, payload: &mut [u8]) {
        self.forward_cipher.apply_keystream(payload);
    }

    /// Exit-side check: recognized == 0 and the rolling digest matches.
    fn verify_and_parse(&mut self, payload: &[u8]) -> Option<RelayCell> {
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        if recognized != 0 {
            return None;
        }
        let received = [payload[5], payload[6], payload[7], payload[8]];
        let mut zeroed = payload.to_vec();
        zeroed[5..9].copy_from_slice(&[0; 4]);
        self.forward_digest.update(&zeroed);
        if self.forward_digest.digest4() != received {
            return None;
        }
        RelayCell::decode(payload).ok()
    }

    /// Exit-side origination of a backward cell.
    fn originate_backward(&mut self, cell: &RelayCell) -> Vec<u8> {
        let mut payload = cell.encode().unwrap();
        payload[5..9].copy_from_slice(&[0; 4]);
        self.backward_digest.update(&payload);
        let digest = self.backward_digest.digest4();
        payload[5..9].copy_from_slice(&digest);
        self.backward_cipher.apply_keystream(&mut payload);
        payload
    }

    /// Middle/guard relays add their backward layer.
    fn wrap_backward(&mut self, payload: &mut [u8]) {
        self.backward_cipher.apply_keystream(payload);
    }
}

fn build_chain() -> (Vec<Hop>, Vec<MockRelay>) {
    let mut hops = Vec::new();
    let mut relays = Vec::new();
    for tag in 1..=3u8 {
        let k = keys(tag);
        hops.push(Hop::new([tag; 20], None, &k));
        relays.push(MockRelay::new(&k));
    }
    (hops, relays)
}

#[test]
fn outbound_cell_decrypts_exactly_at_exit() {
    let (mut hops, mut relays) = build_chain();

    let cell = RelayCell::new(RelayCommand::Data, 42, b"hello".to_vec()).unwrap();
    let mut wire = encrypt_outbound(&mut hops, 2, &cell).unwrap();
    assert_eq!(wire.len(), Cell::PAYLOAD_SIZE);

    // Guard and middle peel their layers; neither sees recognized == 0
    // with a valid digest.
    relays[0].peel(&mut wire);
    assert_ne!(u16::from_be_bytes([wire[1], wire[2]]), 0);
    relays[1].peel(&mut wire);
    assert_ne!(u16::from_be_bytes([wire[1], wire[2]]), 0);

    // The exit peels the last layer and the cell checks out.
    relays[2].peel(&mut wire);
    let parsed = relays[2].verify_and_parse(&wire).expect("exit must claim");
    assert_eq!(parsed.command, RelayCommand::Data);
    assert_eq!(parsed.stream_id, 42);
    assert_eq!(parsed.data, b"hello");
}

#[test]
fn backward_cell_claimed_by_exit_hop() {
    let (mut hops, mut relays) = build_chain();

    let cell = RelayCell::new(RelayCommand::Data, 7, b"response".to_vec()).unwrap();
    let mut wire = relays[2].originate_backward(&cell);
    relays[1].wrap_backward(&mut wire);
    relays[0].wrap_backward(&mut wire);

    let (source, parsed) = decrypt_inbound(&mut hops, &wire).unwrap();
    assert_eq!(source, 2);
    assert_eq!(parsed.data, b"response");
}

#[test]
fn ten_mebibytes_roundtrip_through_chain() {
    let (mut hops, mut relays) = build_chain();

    // Deterministic pseudo-random payload
    let total = 10 * 1024 * 1024;
    let mut data = vec![0u8; total];
    let mut state: u32 = 0x1234_5678;
    for b in data.iter_mut() {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        *b = (state >> 24) as u8;
    }

    let mut received = Vec::with_capacity(total);
    for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
        let cell = RelayCell::new(RelayCommand::Data, 9, chunk.to_vec()).unwrap();
        let mut wire = encrypt_outbound(&mut hops, 2, &cell).unwrap();
        relays[0].peel(&mut wire);
        relays[1].peel(&mut wire);
        relays[2].peel(&mut wire);
        let parsed = relays[2]
            .verify_and_parse(&wire)
            .expect("every cell must verify");
        received.extend_from_slice(&parsed.data);
    }

    assert_eq!(received.len(), total);
    assert_eq!(received, data);
}

#[test]
fn tampered_cell_claimed_by_no_hop() {
    let (mut hops, mut relays) = build_chain();

    let cell = RelayCell::new(RelayCommand::Data, 3, b"payload".to_vec()).unwrap();
    let mut wire = relays[2].originate_backward(&cell);
    relays[1].wrap_backward(&mut wire);

    // Flip one ciphertext byte between hop2 and hop1 wrapping.
    wire[100] ^= 0x01;
    relays[0].wrap_backward(&mut wire);

    let err = decrypt_inbound(&mut hops, &wire).unwrap_err();
    assert!(err.is_fatal_for_circuit(), "tamper must destroy the circuit");
}

#[test]
fn outbound_tamper_fails_exit_digest() {
    let (mut hops, mut relays) = build_chain();

    let cell = RelayCell::new(RelayCommand::Data, 1, b"abc".to_vec()).unwrap();
    let mut wire = encrypt_outbound(&mut hops, 2, &cell).unwrap();

    relays[0].peel(&mut wire);
    wire[200] ^= 0x01; // middle tampers
    relays[1].peel(&mut wire);
    relays[2].peel(&mut wire);

    assert!(relays[2].verify_and_parse(&wire).is_none());
}

#[test]
fn interleaved_directions_keep_separate_state() {
    let (mut hops, mut relays) = build_chain();

    for round in 0..50u16 {
        // Outbound
        let body = format!("request {}", round).into_bytes();
        let cell = RelayCell::new(RelayCommand::Data, 4, body.clone()).unwrap();
        let mut wire = encrypt_outbound(&mut hops, 2, &cell).unwrap();
        relays[0].peel(&mut wire);
        relays[1].peel(&mut wire);
        relays[2].peel(&mut wire);
        let parsed = relays[2].verify_and_parse(&wire).unwrap();
        assert_eq!(parsed.data, body);

        // Backward
        let body = format!("reply {}", round).into_bytes();
        let cell = RelayCell::new(RelayCommand::Data, 4, body.clone()).unwrap();
        let mut wire = relays[2].originate_backward(&cell);
        relays[1].wrap_backward(&mut wire);
        relays[0].wrap_backward(&mut wire);
        let (source, parsed) = decrypt_inbound(&mut hops, &wire).unwrap();
        assert_eq!(source, 2);
        assert_eq!(parsed.data, body);
    }
}

#[test]
fn middle_hop_cells_claimed_at_middle() {
    let (mut hops, mut relays) = build_chain();

    // A TRUNCATED-style cell from the middle hop reaches us wrapped only
    // by the guard and middle layers.
    let cell = RelayCell::new(RelayCommand::Sendme, 0, Vec::new()).unwrap();
    let mut wire = relays[1].originate_backward(&cell);
    relays[0].wrap_backward(&mut wire);

    let (source, parsed) = decrypt_inbound(&mut hops, &wire).unwrap();
    assert_eq!(source, 1);
    assert_eq!(parsed.command, RelayCommand::Sendme);
}
