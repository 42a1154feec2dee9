//! Fragment groups back to actions.

use thiserror::Error;
use crate::isa::action::{Action, Opcode, ParamType, Parameter};
use crate::isa::fragment::{self, Fragment, FragmentType};
use crate::word::{WordError, WordLength};

/// Decodes complete fragment groups.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    word: WordLength,
}

impl Decoder {
    pub fn new(word: WordLength) -> Self {
        Self { word }
    }

    pub fn word(&self) -> WordLength {
        self.word
    }

    /// Sort a group by index and split it into typed words.
    pub fn words(&self, group: &[Fragment]) -> Result<Vec<(FragmentType, i64)>, DecodeError> {
        if !fragment::is_complete(group) {
            return Err(DecodeError::Incomplete {
                received: group.len(),
                expected: group.first().map_or(0, Fragment::group_size),
            });
        }

        let mut sorted = group.to_vec();
        sorted.sort_by_key(|f| f.index);

        let size = self.word.bytes();
        sorted
            .chunks(size)
            .map(|chunk| {
                let bytes: Vec<u8> = chunk.iter().map(|f| f.value).collect();
                let value = self.word.decode(&bytes).map_err(DecodeError::Word)?;
                Ok((chunk[0].kind, value))
            })
            .collect()
    }

    /// Decode an instruction group: opcode word, optional location, parameters.
    pub fn decode(&self, group: &[Fragment]) -> Result<Action, DecodeError> {
        let words = self.words(group)?;
        let mut words = words.into_iter();

        let (_, code) = words.next().ok_or(DecodeError::Empty)?;
        let opcode = Opcode::from_code(code).ok_or(DecodeError::InvalidOpcode(code))?;

        let location = words.next().map(to_parameter);
        let parameters = words.map(to_parameter).collect();

        let head = &group[0];
        Ok(Action {
            key: head.key,
            signal: head.signal,
            origin: head.origin,
            opcode,
            location,
            parameters,
        })
    }
}

/// Undo the register index shift using the explicit type tag.
fn to_parameter((kind, value): (FragmentType, i64)) -> Parameter {
    let kind = ParamType::from(kind);
    let value = match kind {
        ParamType::Register => -(value + 1),
        _ => value,
    };
    Parameter { value, kind }
}

/// Errors that can occur during decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("incomplete group: {received} of {expected} fragments")]
    Incomplete { received: usize, expected: usize },

    #[error("empty instruction group")]
    Empty,

    #[error("invalid opcode: {0}")]
    InvalidOpcode(i64),

    #[error("malformed word: {0}")]
    Word(WordError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::encoder::Encoder;
    use crate::isa::fragment::{Origin, Signal};

    fn encoder(word: WordLength) -> Encoder {
        Encoder::new(&["A".into(), "B".into(), "C".into()], word)
    }

    #[test]
    fn test_decode_mov() {
        for word in WordLength::ALL {
            let group = encoder(word).encode(2, "mov", &["C", "-5"], Signal::Write, Origin::Loader).unwrap();
            let action = Decoder::new(word).decode(&group).unwrap();
            assert_eq!(action.key, 2);
            assert_eq!(action.opcode, Opcode::Mov);
            assert_eq!(action.location, Some(Parameter::register(2)));
            assert_eq!(action.parameters, vec![Parameter::literal(-5)]);
        }
    }

    #[test]
    fn test_decode_shuffled() {
        let mut group = encoder(WordLength::Bits32)
            .encode(0, "imul", &["A", "0x1f", "B"], Signal::Write, Origin::Loader)
            .unwrap();
        group.reverse();
        group.swap(1, 7);

        let action = Decoder::new(WordLength::Bits32).decode(&group).unwrap();
        assert_eq!(action.opcode, Opcode::Imul);
        assert_eq!(action.location, Some(Parameter::register(0)));
        assert_eq!(action.parameters, vec![Parameter::memory(0x1f), Parameter::register(1)]);
    }

    #[test]
    fn test_decode_null_has_no_location() {
        let group = encoder(WordLength::Bits16).encode(0, "NULL", &[], Signal::Write, Origin::Loader).unwrap();
        let action = Decoder::new(WordLength::Bits16).decode(&group).unwrap();
        assert_eq!(action.opcode, Opcode::Null);
        assert_eq!(action.location, None);
        assert!(action.parameters.is_empty());
    }

    #[test]
    fn test_incomplete_rejected() {
        let mut group = encoder(WordLength::Bits16).encode(0, "inc", &["A"], Signal::Write, Origin::Loader).unwrap();
        group.pop();
        assert!(matches!(
            Decoder::new(WordLength::Bits16).decode(&group),
            Err(DecodeError::Incomplete { received: 3, expected: 4 })
        ));
    }

    #[test]
    fn test_invalid_opcode() {
        let enc = encoder(WordLength::Bits16);
        let group = enc
            .encode_words(0, Signal::Write, Origin::Loader, &[(FragmentType::Call, 40)])
            .unwrap();
        assert_eq!(Decoder::new(WordLength::Bits16).decode(&group), Err(DecodeError::InvalidOpcode(40)));
    }

    #[test]
    fn test_truncated_word() {
        let enc = encoder(WordLength::Bits16);
        let mut bytes: Vec<_> = enc.expand(FragmentType::Call, Opcode::Inc.code()).unwrap();
        bytes.push((FragmentType::Register, 0));
        let group = fragment::stamp(0, Signal::Write, Origin::Loader, &bytes);
        assert!(matches!(Decoder::new(WordLength::Bits16).decode(&group), Err(DecodeError::Word(_))));
    }
}
