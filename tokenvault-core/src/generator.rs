//! Token generator registry and the built-in format-preserving generators.
//!
//! The registry is process-wide: reads take the shared lock per generation,
//! registration takes the exclusive lock and refuses ids that are already
//! taken. Generators are pure functions of the supplied randomness and must
//! not take other core locks.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{TokenError, TokenResult};
use crate::luhn;

/// Randomness source handed to generators. Fills the buffer completely.
pub type RandFn<'a> = dyn FnMut(&mut [u8]) -> TokenResult<()> + 'a;

/// A token generator: `(randomness, value, mask out) -> token`.
pub type Generator =
    Arc<dyn Fn(&mut RandFn<'_>, &str, Option<&mut String>) -> TokenResult<String> + Send + Sync>;

/// Built-in token formats.
///
/// The discriminants are the wire-level format ids stored in vault metadata;
/// custom generators may claim any id not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TokenFormat {
    /// Replace every character with a random upper/lower/digit/punctuation
    /// character.
    Random = 0,
    /// Replace characters drawing only from the character classes present in
    /// the input; punctuation is never used.
    FpRandom = 1,
    /// Digits-only replacement; non-digits are dropped.
    Date = 2,
    /// Letters-only replacement; digits and punctuation are dropped.
    Email = 3,
    /// Preserve the last 4 characters; the result passes Luhn.
    LastFour = 4,
    /// Preserve the first 6 characters; the result passes Luhn.
    FirstSix = 5,
    /// Preserve the first 2 and last 4 characters; the result passes Luhn.
    FirstTwoLastFour = 6,
    /// Preserve the first 6 and last 4 characters; the result passes Luhn.
    FirstSixLastFour = 7,
    /// Preserve the last 4 characters; the result fails Luhn.
    LastFourNoLuhn = 8,
    /// Preserve the first 6 characters; the result fails Luhn.
    FirstSixNoLuhn = 9,
    /// Preserve the first 2 and last 4 characters; the result fails Luhn.
    FirstTwoLastFourNoLuhn = 10,
    /// Preserve the first 6 and last 4 characters; the result fails Luhn.
    FirstSixLastFourNoLuhn = 11,
}

impl TokenFormat {
    /// The wire-level format id.
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }
}

type GeneratorMap = HashMap<u32, Generator>;

fn registry() -> &'static RwLock<GeneratorMap> {
    static REGISTRY: OnceLock<RwLock<GeneratorMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(builtins()))
}

/// Registers a generator for a format id.
///
/// Returns `false` without replacing anything when the id is already taken.
pub fn register(id: u32, generator: Generator) -> bool {
    let mut map = registry().write().unwrap_or_else(std::sync::PoisonError::into_inner);
    if map.contains_key(&id) {
        return false;
    }
    map.insert(id, generator);
    true
}

/// Looks up the generator for a format id.
#[must_use]
pub fn lookup(id: u32) -> Option<Generator> {
    registry()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(&id)
        .cloned()
}

fn builtins() -> GeneratorMap {
    let mut map = GeneratorMap::new();
    let preserved = |front: usize, back: usize, pass_luhn: bool| -> Generator {
        Arc::new(move |rand: &mut RandFn<'_>, value: &str, mask: Option<&mut String>| {
            generate_preserved(rand, value, mask, front, back, pass_luhn)
        })
    };

    map.insert(
        TokenFormat::Random.id(),
        Arc::new(|rand: &mut RandFn<'_>, value: &str, mask: Option<&mut String>| {
            generate_random(rand, value, mask, true, true, true, true)
        }) as Generator,
    );
    map.insert(
        TokenFormat::FpRandom.id(),
        Arc::new(|rand: &mut RandFn<'_>, value: &str, mask: Option<&mut String>| {
            generate_format_preserving(rand, value, mask)
        }) as Generator,
    );
    map.insert(
        TokenFormat::Date.id(),
        Arc::new(|rand: &mut RandFn<'_>, value: &str, mask: Option<&mut String>| {
            generate_random(rand, value, mask, false, false, true, false)
        }) as Generator,
    );
    map.insert(
        TokenFormat::Email.id(),
        Arc::new(|rand: &mut RandFn<'_>, value: &str, mask: Option<&mut String>| {
            generate_random(rand, value, mask, true, true, false, false)
        }) as Generator,
    );
    map.insert(TokenFormat::LastFour.id(), preserved(0, 4, true));
    map.insert(TokenFormat::FirstSix.id(), preserved(6, 0, true));
    map.insert(TokenFormat::FirstTwoLastFour.id(), preserved(2, 4, true));
    map.insert(TokenFormat::FirstSixLastFour.id(), preserved(6, 4, true));
    map.insert(TokenFormat::LastFourNoLuhn.id(), preserved(0, 4, false));
    map.insert(TokenFormat::FirstSixNoLuhn.id(), preserved(6, 0, false));
    map.insert(TokenFormat::FirstTwoLastFourNoLuhn.id(), preserved(2, 4, false));
    map.insert(TokenFormat::FirstSixLastFourNoLuhn.id(), preserved(6, 4, false));
    map
}

const NUMERICS: &[u8] = b"0123456789";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const PUNCT: &[u8] = b"!@#$%^&*()-=_+{}[]:\";'<>?,./";

const MAX_DRAW_ATTEMPTS: usize = 3;
const DRAW_BLOCK: usize = 256;

/// Replaces characters of the selected classes with random characters drawn
/// from the union of those classes; characters outside every selected class
/// are dropped.
///
/// The whole draw retries when the output equals the input verbatim.
///
/// # Errors
///
/// `TokenGeneration` after three failed draws; randomness errors propagate.
pub fn generate_random(
    rand: &mut RandFn<'_>,
    value: &str,
    mask: Option<&mut String>,
    upper: bool,
    lower: bool,
    digits: bool,
    punct: bool,
) -> TokenResult<String> {
    let mut alphabet = Vec::new();
    if digits {
        alphabet.extend_from_slice(NUMERICS);
    }
    if upper {
        alphabet.extend_from_slice(UPPER);
    }
    if lower {
        alphabet.extend_from_slice(LOWER);
    }
    if punct {
        alphabet.extend_from_slice(PUNCT);
    }

    let selectable = |ch: char| {
        (digits && ch.is_ascii_digit())
            || (upper && ch.is_ascii_uppercase())
            || (lower && ch.is_ascii_lowercase())
            || (punct && ch.is_ascii_punctuation())
    };

    let mut buf = vec![0u8; value.len().min(DRAW_BLOCK)];
    let mut token = None;
    for _ in 0..MAX_DRAW_ATTEMPTS {
        rand(&mut buf)?;
        let mut cursor = 0;
        let mut out = String::with_capacity(value.len());
        for ch in value.chars() {
            if !selectable(ch) {
                continue;
            }
            if cursor == buf.len() {
                rand(&mut buf)?;
                cursor = 0;
            }
            out.push(char::from(alphabet[buf[cursor] as usize % alphabet.len()]));
            cursor += 1;
        }
        if out != value {
            token = Some(out);
            break;
        }
    }

    let Some(token) = token else {
        return Err(TokenError::TokenGeneration(
            "too many token generation attempts".to_string(),
        ));
    };

    if let Some(mask) = mask {
        mask.clear();
        mask.extend(value.chars().map(|_| '*'));
    }

    Ok(token)
}

/// Replacement drawing only from the character classes present in the input.
///
/// # Errors
///
/// See [`generate_random`].
pub fn generate_format_preserving(
    rand: &mut RandFn<'_>,
    value: &str,
    mask: Option<&mut String>,
) -> TokenResult<String> {
    let mut upper = false;
    let mut lower = false;
    let mut digits = false;

    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits = true;
        } else if ch.is_ascii_alphabetic() {
            if ch.is_ascii_uppercase() {
                upper = true;
            } else {
                lower = true;
            }
        }
        if digits && upper && lower {
            break;
        }
    }

    generate_random(rand, value, mask, upper, lower, digits, false)
}

/// Preserves `front` leading and `back` trailing characters, regenerating the
/// middle as random digits until the whole candidate's Luhn check matches the
/// requested polarity.
///
/// # Errors
///
/// `TokenRange` when the preserved lengths meet or exceed the value length;
/// generation errors from the middle draw propagate.
pub fn generate_preserved(
    rand: &mut RandFn<'_>,
    value: &str,
    mask: Option<&mut String>,
    front: usize,
    back: usize,
    pass_luhn: bool,
) -> TokenResult<String> {
    let chars: Vec<char> = value.chars().collect();
    if front + back >= chars.len() {
        return Err(TokenError::TokenRange { front, back });
    }

    let prefix: String = chars[..front].iter().collect();
    let middle_src: String = chars[front..chars.len() - back].iter().collect();
    let suffix: String = chars[chars.len() - back..].iter().collect();

    loop {
        let middle = generate_random(rand, &middle_src, None, false, false, true, false)?;
        let candidate = format!("{prefix}{middle}{suffix}");
        if luhn::check(&candidate) == pass_luhn {
            if let Some(mask) = mask {
                mask.push_str(&prefix);
                mask.extend(middle_src.chars().map(|_| '*'));
                mask.push_str(&suffix);
            }
            return Ok(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Randomness that walks an incrementing byte counter.
    fn counter_rand() -> impl FnMut(&mut [u8]) -> TokenResult<()> {
        let mut next = 0u8;
        move |buf: &mut [u8]| {
            for byte in buf {
                *byte = next;
                next = next.wrapping_add(17);
            }
            Ok(())
        }
    }

    fn zero_rand(buf: &mut [u8]) -> TokenResult<()> {
        buf.fill(0);
        Ok(())
    }

    #[test]
    fn test_random_replaces_every_character() {
        let mut rand = counter_rand();
        let mut mask = String::new();
        let token = generate_random(&mut rand, "Card-1234", Some(&mut mask), true, true, true, true)
            .expect("generate");
        assert_eq!(token.len(), 9);
        assert_ne!(token, "Card-1234");
        assert_eq!(mask, "*********");
    }

    #[test]
    fn test_random_drops_unselected_classes() {
        let mut rand = counter_rand();
        let token = generate_random(&mut rand, "ab12CD", None, false, false, true, false)
            .expect("generate");
        // Only the two digits were selectable.
        assert_eq!(token.len(), 2);
        assert!(token.chars().all(|ch| ch.is_ascii_digit()));
    }

    #[test]
    fn test_random_exhausts_after_three_identical_draws() {
        // With a zero stream every draw maps "000" back onto itself.
        let mut rand = zero_rand;
        match generate_random(&mut rand, "000", None, false, false, true, false) {
            Err(TokenError::TokenGeneration(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_format_preserving_detects_classes() {
        let mut rand = counter_rand();
        let token =
            generate_format_preserving(&mut rand, "AB-12-xy", None).expect("generate");
        // Punctuation is dropped; the rest draws from upper+lower+digits.
        assert_eq!(token.len(), 6);
        assert!(token.chars().all(char::is_alphanumeric));
    }

    #[test]
    fn test_format_preserving_digits_only_input() {
        let mut rand = counter_rand();
        let token = generate_format_preserving(&mut rand, "20260802", None).expect("generate");
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|ch| ch.is_ascii_digit()));
    }

    #[test]
    fn test_email_format_keeps_letters_only() {
        let generator = lookup(TokenFormat::Email.id()).expect("generator");
        let mut rand = counter_rand();
        let token = generator(&mut rand, "user@host.org", None).expect("generate");
        assert_eq!(token.len(), "userhostorg".len());
        assert!(token.chars().all(|ch| ch.is_ascii_alphabetic()));
    }

    #[test]
    fn test_preserved_keeps_edges_and_luhn_polarity() {
        let value = "6044342464567232";
        for (format, front, back, pass) in [
            (TokenFormat::LastFour, 0, 4, true),
            (TokenFormat::FirstSix, 6, 0, true),
            (TokenFormat::FirstTwoLastFour, 2, 4, true),
            (TokenFormat::FirstSixLastFour, 6, 4, true),
            (TokenFormat::LastFourNoLuhn, 0, 4, false),
            (TokenFormat::FirstSixNoLuhn, 6, 0, false),
            (TokenFormat::FirstTwoLastFourNoLuhn, 2, 4, false),
            (TokenFormat::FirstSixLastFourNoLuhn, 6, 4, false),
        ] {
            let generator = lookup(format.id()).expect("generator");
            let mut rand = counter_rand();
            let token = generator(&mut rand, value, None).expect("generate");
            assert_eq!(token.len(), value.len(), "{format:?}");
            assert_eq!(&token[..front], &value[..front], "{format:?}");
            assert_eq!(&token[value.len() - back..], &value[value.len() - back..], "{format:?}");
            assert_eq!(crate::luhn::check(&token), pass, "{format:?}");
        }
    }

    #[test]
    fn test_preserved_mask_shape() {
        let mut rand = counter_rand();
        let mut mask = String::new();
        generate_preserved(&mut rand, "6044342464567232", Some(&mut mask), 6, 4, true)
            .expect("generate");
        assert_eq!(mask, "604434******7232");
    }

    #[test]
    fn test_preserved_rejects_short_values() {
        let mut rand = counter_rand();
        match generate_preserved(&mut rand, "12345678", None, 6, 4, true) {
            Err(TokenError::TokenRange { front: 6, back: 4 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_registry_rejects_taken_ids() {
        let custom: Generator =
            Arc::new(|_rand: &mut RandFn<'_>, value: &str, _mask: Option<&mut String>| {
                Ok(value.to_string())
            });
        assert!(!register(TokenFormat::Random.id(), Arc::clone(&custom)));
        assert!(register(9001, Arc::clone(&custom)));
        assert!(!register(9001, custom));
    }

    #[test]
    fn test_registry_lookup() {
        assert!(lookup(TokenFormat::Random.id()).is_some());
        assert!(lookup(8888).is_none());
    }
}
