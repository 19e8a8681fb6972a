//! VM Identity generation (spec §3).
//!
//! An opaque 20-character lower-alphanumeric string, unique per run and
//! never reused: the jailer's VM ID, a chroot path segment, and the run
//! registry's cache directory name all share this one value.

use rand::Rng as _;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LENGTH: usize = 20;

/// Generates a fresh, random VM identity.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..LENGTH)
        .map(|_| {
            let idx = rng.r#gen::<usize>() % ALPHABET.len();
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_twenty_char_lower_alphanumeric() {
        let id = generate();
        assert_eq!(id.len(), LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn successive_ids_differ() {
        assert_ne!(generate(), generate());
    }
}
