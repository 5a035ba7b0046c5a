//! Path selection.
//!
//! Relays are sampled uniformly at random without replacement; the order of
//! the returned path is random too, so the registry's insertion order does
//! not decide who becomes the entry or the exit.

use rand::seq::index;
use tracing::debug;
use veil_types::NodeRegistration;

use crate::{CircuitError, Result};

/// Pick `hops` distinct relays from `registry`, in hop order (entry first).
///
/// # Errors
///
/// Returns [`CircuitError::InsufficientNodes`] if the registry has fewer than
/// `hops` entries. A zero-length path is rejected the same way.
pub fn select_path(registry: &[NodeRegistration], hops: usize) -> Result<Vec<NodeRegistration>> {
    if hops == 0 {
        return Err(CircuitError::InsufficientNodes {
            need: 1,
            have: registry.len(),
        });
    }
    if registry.len() < hops {
        return Err(CircuitError::InsufficientNodes {
            need: hops,
            have: registry.len(),
        });
    }

    let mut rng = rand::thread_rng();
    let path: Vec<NodeRegistration> = index::sample(&mut rng, registry.len(), hops)
        .into_iter()
        .map(|i| registry[i].clone())
        .collect();

    debug!(hops, available = registry.len(), "selected circuit path");
    Ok(path)
}
