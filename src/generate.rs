//! Random passwords from selectable character classes.

use zeroize::Zeroizing;

use crate::crypto::random_bytes;
use crate::error::GeneratorError;

pub const MIN_LENGTH: usize = 10;
pub const MAX_LENGTH: usize = 200;
pub const DEFAULT_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CharClass {
    Upper,
    Lower,
    Digits,
    Dash,
    Underscore,
    Space,
    Special,
    Brackets,
}

impl CharClass {
    pub const ALL: [CharClass; 8] = [
        CharClass::Upper,
        CharClass::Lower,
        CharClass::Digits,
        CharClass::Dash,
        CharClass::Underscore,
        CharClass::Space,
        CharClass::Special,
        CharClass::Brackets,
    ];

    /// Classes used when none are chosen.
    pub const DEFAULT: [CharClass; 3] = [CharClass::Upper, CharClass::Lower, CharClass::Digits];

    pub fn chars(self) -> &'static [u8] {
        match self {
            CharClass::Upper => b"ABCDEFGHIJKLMNOPQRSTUVWXYZ",
            CharClass::Lower => b"abcdefghijklmnopqrstuvwxyz",
            CharClass::Digits => b"0123456789",
            CharClass::Dash => b"-",
            CharClass::Underscore => b"_",
            CharClass::Space => b" ",
            CharClass::Special => b"`~!@#$%^&*+=",
            CharClass::Brackets => b"()[]{}",
        }
    }
}

/// Buffered OS randomness with unbiased draws below a bound.
struct Draw {
    buf: Zeroizing<[u8; 64]>,
    pos: usize,
}

impl Draw {
    fn new() -> Self {
        Self {
            buf: Zeroizing::new([0; 64]),
            pos: 64,
        }
    }

    fn byte(&mut self) -> Result<u8, GeneratorError> {
        if self.pos == self.buf.len() {
            *self.buf = random_bytes().map_err(|_| GeneratorError::RandomUnavailable)?;
            self.pos = 0;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Uniform in `0..n` for `1 <= n <= 256`. Bytes at or above the largest
    /// multiple of `n` are rejected and redrawn.
    fn below(&mut self, n: usize) -> Result<usize, GeneratorError> {
        debug_assert!((1..=256).contains(&n));
        let zone = 256 - 256 % n;
        loop {
            let b = self.byte()? as usize;
            if b < zone {
                return Ok(b % n);
            }
        }
    }
}

/// Generates a password of `length` characters.
///
/// Every selected class appears at least once; the remaining positions are
/// drawn from the union of the classes and the result is shuffled.
pub fn generate(length: usize, classes: &[CharClass]) -> Result<Zeroizing<String>, GeneratorError> {
    if !(MIN_LENGTH..=MAX_LENGTH).contains(&length) {
        return Err(GeneratorError::LengthOutOfRange {
            length,
            min: MIN_LENGTH,
            max: MAX_LENGTH,
        });
    }

    let mut selected = classes.to_vec();
    selected.sort();
    selected.dedup();
    if selected.is_empty() {
        return Err(GeneratorError::NoCharacterClasses);
    }
    let alphabet: Vec<u8> = selected.iter().flat_map(|c| c.chars()).copied().collect();

    let mut draw = Draw::new();
    let mut out = Zeroizing::new(Vec::with_capacity(length));
    for class in &selected {
        let chars = class.chars();
        out.push(chars[draw.below(chars.len())?]);
    }
    while out.len() < length {
        out.push(alphabet[draw.below(alphabet.len())?]);
    }

    // Fisher-Yates
    for i in (1..out.len()).rev() {
        let j = draw.below(i + 1)?;
        out.swap(i, j);
    }

    let mut password = Zeroizing::new(String::with_capacity(length));
    password.extend(out.iter().map(|&b| char::from(b)));
    Ok(password)
}
