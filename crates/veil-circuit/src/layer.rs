//! Layered encryption of relay cell payloads.
//!
//! One layer is `nonce(12) || ChaCha20-Poly1305(key, data)` with associated
//! data `circuit_id_be || direction_tag`, so a layer cannot be replayed onto
//! another circuit or turned around.
//!
//! Outbound, the client addresses a [`RelayBody`] to one hop and seals it
//! under that hop's forward key; every earlier hop gets a `forward` body
//! around the sealed remainder under its own key. Each relay removes
//! exactly its own layer, so a hop learns only what is addressed to it and
//! where to pass the rest. Inbound, each relay adds one layer with its
//! backward key and the client removes them entry first.

use veil_crypto::chacha20;
use veil_transport::RelayBody;
use veil_types::{CircuitId, Direction};

use crate::handshake::HopSecret;
use crate::{CircuitError, Result};

fn associated_data(circuit_id: CircuitId, direction: Direction) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&circuit_id.to_be_bytes());
    aad[8] = direction.tag();
    aad
}

/// Add one layer.
pub fn wrap(
    key: &[u8; 32],
    circuit_id: CircuitId,
    direction: Direction,
    payload: &[u8],
) -> Result<Vec<u8>> {
    Ok(chacha20::seal(
        key,
        payload,
        &associated_data(circuit_id, direction),
    )?)
}

/// Remove one layer.
///
/// # Errors
///
/// Returns [`crate::CircuitError::Crypto`] if the layer was not produced
/// with `key` for this circuit and direction.
pub fn peel(
    key: &[u8; 32],
    circuit_id: CircuitId,
    direction: Direction,
    payload: &[u8],
) -> Result<Vec<u8>> {
    Ok(chacha20::open(
        key,
        payload,
        &associated_data(circuit_id, direction),
    )?)
}

/// Client side: address `body` to the last hop in `hops` (entry first).
///
/// # Errors
///
/// Returns [`CircuitError::ProtocolViolation`] for an empty hop list.
pub fn seal_onion(hops: &[HopSecret], circuit_id: CircuitId, body: &RelayBody) -> Result<Vec<u8>> {
    let Some((target, earlier)) = hops.split_last() else {
        return Err(CircuitError::ProtocolViolation(format!(
            "circuit {circuit_id} has no hop to address"
        )));
    };
    let mut onion = wrap(
        target.forward_key(),
        circuit_id,
        Direction::Outbound,
        &body.to_bytes()?,
    )?;
    for hop in earlier.iter().rev() {
        let forward = RelayBody::Forward { payload: onion };
        onion = wrap(
            hop.forward_key(),
            circuit_id,
            Direction::Outbound,
            &forward.to_bytes()?,
        )?;
    }
    Ok(onion)
}

/// Relay side: remove this hop's outbound layer and read the body under it.
///
/// # Errors
///
/// Returns [`CircuitError::Crypto`] if the layer is not ours and
/// [`CircuitError::MalformedPacket`] if what is under it is not a body.
pub fn open_layer(secret: &HopSecret, circuit_id: CircuitId, payload: &[u8]) -> Result<RelayBody> {
    let plain = peel(secret.forward_key(), circuit_id, Direction::Outbound, payload)?;
    Ok(RelayBody::from_bytes(&plain)?)
}

/// Relay side: put an answer under this hop's inbound layer.
pub fn close_layer(secret: &HopSecret, circuit_id: CircuitId, body: &RelayBody) -> Result<Vec<u8>> {
    wrap(
        secret.backward_key(),
        circuit_id,
        Direction::Inbound,
        &body.to_bytes()?,
    )
}

/// Client side: remove every hop's inbound layer, entry first, and read the
/// answer under them.
pub fn peel_onion(hops: &[HopSecret], circuit_id: CircuitId, payload: &[u8]) -> Result<RelayBody> {
    let mut inner = payload.to_vec();
    for hop in hops {
        inner = peel(hop.backward_key(), circuit_id, Direction::Inbound, &inner)?;
    }
    Ok(RelayBody::from_bytes(&inner)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hops() -> Vec<HopSecret> {
        (1..=3u8).map(|i| HopSecret::from_seed([i; 32])).collect()
    }

    fn data(payload: &[u8]) -> RelayBody {
        RelayBody::Data {
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_each_relay_opens_one_outbound_layer() {
        let hops = hops();
        let id = CircuitId(10);
        let mut cell = seal_onion(&hops, id, &data(b"payload")).expect("seal");
        for hop in &hops[..2] {
            match open_layer(hop, id, &cell).expect("open") {
                RelayBody::Forward { payload } => cell = payload,
                other => unreachable!("expected forward, got {other:?}"),
            }
        }
        assert_eq!(open_layer(&hops[2], id, &cell).expect("open"), data(b"payload"));
    }

    #[test]
    fn test_extend_target_is_hidden_from_earlier_hops() {
        let hops = hops();
        let id = CircuitId(13);
        let extend = RelayBody::Extend {
            address: "10.9.8.7".into(),
            port: 4321,
            public_value: [6u8; 32],
        };
        let mut cell = seal_onion(&hops, id, &extend).expect("seal");
        for hop in &hops[..2] {
            let RelayBody::Forward { payload } = open_layer(hop, id, &cell).expect("open") else {
                unreachable!("earlier hops only see forward bodies");
            };
            assert!(!payload.windows(8).any(|w| w == b"10.9.8.7"));
            cell = payload;
        }
        assert_eq!(open_layer(&hops[2], id, &cell).expect("open"), extend);
    }

    #[test]
    fn test_client_peels_inbound_layers_entry_first() {
        let hops = hops();
        let id = CircuitId(11);
        let mut cell = close_layer(&hops[2], id, &data(b"reply")).expect("exit layer");
        for hop in hops[..2].iter().rev() {
            cell = wrap(hop.backward_key(), id, Direction::Inbound, &cell).expect("wrap");
        }
        assert_eq!(peel_onion(&hops, id, &cell).expect("peel"), data(b"reply"));
        assert!(matches!(
            peel_onion(&hops[..2], id, &cell),
            Err(CircuitError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_out_of_order_open_fails() {
        let hops = hops();
        let id = CircuitId(12);
        let cell = seal_onion(&hops, id, &data(b"x")).expect("seal");
        assert!(matches!(
            open_layer(&hops[1], id, &cell),
            Err(CircuitError::Crypto(_))
        ));
    }

    #[test]
    fn test_layer_is_bound_to_circuit_and_direction() {
        let hop = HopSecret::from_seed([9u8; 32]);
        let sealed = wrap(hop.forward_key(), CircuitId(1), Direction::Outbound, b"x")
            .expect("wrap");
        assert!(peel(hop.forward_key(), CircuitId(2), Direction::Outbound, &sealed).is_err());
        assert!(peel(hop.forward_key(), CircuitId(1), Direction::Inbound, &sealed).is_err());
    }

    #[test]
    fn test_nothing_to_seal_without_hops() {
        assert!(matches!(
            seal_onion(&[], CircuitId(1), &data(b"x")),
            Err(CircuitError::ProtocolViolation(_))
        ));
    }
}
