use crate::hash_id::Id20;

/// Client prefix in Azureus style: dash, two-letter client id, four
/// version chars, dash.
const PEER_ID_PREFIX: &[u8; 8] = b"-RP1000-";

pub fn generate_peer_id() -> Id20 {
    let mut peer_id = [0u8; 20];
    cryptow::random_fill(&mut peer_id[8..]);
    // keep the random tail printable, like the reference clients do
    const POOL: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    for b in peer_id[8..].iter_mut() {
        *b = POOL[*b as usize % POOL.len()];
    }
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    Id20::new(peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let id = generate_peer_id();
        assert_eq!(&id.0[..8], PEER_ID_PREFIX);
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_peer_ids_differ() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
