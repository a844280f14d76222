//! The result channel.
//!
//! Benchmark contexts report exactly one [`TimingSample`] each over the
//! result endpoint. The harness is the only reader and is blocked in a
//! receive while a context writes, so the endpoint needs no buffering.
//!
//! A sample wider than one machine word is split into two words, most
//! significant first. The message label carries the [`Role`] of the sender.
use arrayvec::ArrayVec;
use serde::Deserialize;

use crate::{
    counter::{CounterWidth, TimingSample},
    kernel::{CPtr, Ipc, Message, Primitive, Terminated, Word},
    roles::Role,
};

/// The width of a message register on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "u32")]
pub enum WordWidth {
    Bits32,
    Bits64,
}

impl WordWidth {
    /// The word width of the host.
    pub const NATIVE: Self = if usize::BITS == 64 {
        Self::Bits64
    } else {
        Self::Bits32
    };

    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }

    pub const fn mask(self) -> Word {
        match self {
            Self::Bits32 => u32::MAX as Word,
            Self::Bits64 => u64::MAX,
        }
    }
}

impl Default for WordWidth {
    fn default() -> Self {
        Self::NATIVE
    }
}

impl TryFrom<u32> for WordWidth {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            32 => Ok(Self::Bits32),
            64 => Ok(Self::Bits64),
            _ => Err(format!("unsupported word width: {bits}")),
        }
    }
}

/// Describes how a [`TimingSample`] is laid out in message registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    pub counter: CounterWidth,
    pub word: WordWidth,
}

impl SampleLayout {
    /// The number of message registers used by one sample.
    pub const fn length(self) -> usize {
        if self.counter.bits() > self.word.bits() {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("A result message must carry one or two words, but it carried {0}.")]
    BadLength(usize),
    #[error("The word {0:#x} does not fit in a message register.")]
    WordOutOfRange(Word),
    #[error("The message label {0} does not identify a reporting role.")]
    UnknownLabel(Word),
}

/// A decoded result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub role: Role,
    pub sample: TimingSample,
}

impl Report {
    pub fn decode(msg: &Message, word: WordWidth) -> Result<Self, ChannelError> {
        let role = Role::from_label(msg.label).ok_or(ChannelError::UnknownLabel(msg.label))?;
        let sample = decode_sample(&msg.words, word)?;
        Ok(Self { role, sample })
    }
}

/// Split `sample` into message registers, most significant word first.
pub fn encode_sample(sample: TimingSample, layout: SampleLayout) -> ArrayVec<Word, 2> {
    let length = layout.length();
    let shift = if length > 1 { layout.word.bits() } else { 0 };
    let mut rest = sample & layout.counter.mask();
    let mut words = [0; 2];
    for i in (0..length).rev() {
        words[i] = rest & layout.word.mask();
        if shift > 0 {
            rest >>= shift;
        }
    }
    words[..length].iter().copied().collect()
}

/// Reassemble a sample from message registers by shifting the accumulated
/// value left by the word width and adding each subsequent word.
pub fn decode_sample(words: &[Word], word: WordWidth) -> Result<TimingSample, ChannelError> {
    let shift = match words.len() {
        1 => 0,
        2 if word.bits() < TimingSample::BITS => word.bits(),
        n => return Err(ChannelError::BadLength(n)),
    };

    let mut acc: TimingSample = 0;
    for &w in words {
        if w & !word.mask() != 0 {
            return Err(ChannelError::WordOutOfRange(w));
        }
        acc = (acc << shift) + w;
    }
    Ok(acc)
}

/// Send `sample` to the harness on `result_ep`, identifying the sender as
/// `role`. Blocks until the harness takes the message.
pub fn send_result(
    ipc: &impl Ipc,
    result_ep: CPtr,
    role: Role,
    sample: TimingSample,
    layout: SampleLayout,
) -> Result<(), Terminated> {
    let mut msg = Message::new(role.label());
    msg.words.extend(encode_sample(sample, layout));
    ipc.invoke(Primitive::Send, result_ep, &mut msg)
}
