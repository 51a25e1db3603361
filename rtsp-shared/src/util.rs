use rand::{Rng, rng};

const RUNES_ALPHA_NUMBER: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a random alphanumeric sequence of the requested length.
pub fn random_alpha_number(n: usize) -> String {
    let mut rng = rng();

    (0..n)
        .map(|_| {
            let idx = rng.random_range(0..RUNES_ALPHA_NUMBER.len());
            RUNES_ALPHA_NUMBER[idx] as char
        })
        .collect()
}

/// Secret opaque session identifier: 32 alphanumeric characters.
pub fn generate_session_id() -> String {
    random_alpha_number(32)
}

/// 16-byte random nonce rendered as lowercase hex.
pub fn generate_nonce() -> String {
    let mut rng = rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_length_and_charset() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_nonce_is_hex() {
        let n = generate_nonce();
        assert_eq!(n.len(), 32);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
