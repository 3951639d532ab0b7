use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use safetensors::SafeTensorError;

use crate::{storage::AllocRegime, tensor::DType};

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// The optimizer engine's error type.
///
/// Every variant except `Io`, `Checkpoint` and `Config` signals a broken invariant of the
/// training state, callers are expected to stop training instead of retrying.
#[derive(Debug)]
pub enum OptimErr {
    UnknownAlgorithm(String),
    MissingMiniBatchSize,
    EmptyMiniBatch,
    RationalAdjustmentUnsupported {
        actual: usize,
        reference: usize,
    },
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    TypeMismatch {
        what: &'static str,
        got: DType,
        expected: DType,
    },
    RegimeChanged {
        reserved: AllocRegime,
        requested: AllocRegime,
    },
    ArenaExhausted {
        requested: usize,
        available: usize,
    },
    ShardCountMismatch {
        optimizers: usize,
        backends: usize,
    },
    EmptyShardGroup,
    UnknownShard {
        shard: usize,
        shards: usize,
    },
    AlgorithmMismatch {
        shard: usize,
        got: &'static str,
        expected: &'static str,
    },
    StateNotAllocated {
        algorithm: &'static str,
        shard: usize,
    },
    MomentLengthMismatch {
        mt: usize,
        vt: usize,
    },
    InvalidItem {
        name: String,
        reason: String,
    },
    Io(io::Error),
    Checkpoint(SafeTensorError),
    Config(serde_json::Error),
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::UnknownAlgorithm(name) => write!(f, "unknown optimizer kind: {name}"),
            OptimErr::MissingMiniBatchSize => f.write_str(
                "using rational optimizer auto-adjustment with a trainer that does not provide the minibatch size",
            ),
            OptimErr::EmptyMiniBatch => {
                f.write_str("optimizer auto-adjustment needs a non-empty minibatch")
            }
            OptimErr::RationalAdjustmentUnsupported { actual, reference } => write!(
                f,
                "adagrad does not support rational hyper-parameter adjustment, got minibatch size {actual} for reference {reference}"
            ),
            OptimErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "there's a size mismatch between {a} and {b}, got {got} and expected {expected}"
            ),
            OptimErr::TypeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} has element type {got}, expected {expected}"),
            OptimErr::RegimeChanged {
                reserved,
                requested,
            } => write!(
                f,
                "shadow arena was reserved for the {reserved} regime, update requested {requested}"
            ),
            OptimErr::ArenaExhausted {
                requested,
                available,
            } => write!(
                f,
                "arena exhausted, requested {requested} bytes with {available} bytes available"
            ),
            OptimErr::ShardCountMismatch {
                optimizers,
                backends,
            } => write!(
                f,
                "got {optimizers} optimizer shards but {backends} backends"
            ),
            OptimErr::EmptyShardGroup => f.write_str("a shard group needs at least one backend"),
            OptimErr::UnknownShard { shard, shards } => write!(
                f,
                "collective addressed shard {shard} of a group of {shards} shards"
            ),
            OptimErr::AlgorithmMismatch {
                shard,
                got,
                expected,
            } => write!(f, "shard {shard} runs {got}, expected {expected}"),
            OptimErr::StateNotAllocated { algorithm, shard } => write!(
                f,
                "{algorithm} state of shard {shard} was never allocated, nothing to save"
            ),
            OptimErr::MomentLengthMismatch { mt, vt } => write!(
                f,
                "adam moments have different sizes, first moment {mt} and second moment {vt}"
            ),
            OptimErr::InvalidItem { name, reason } => {
                write!(f, "invalid checkpoint item {name}: {reason}")
            }
            OptimErr::Io(e) => write!(f, "io error: {e}"),
            OptimErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            OptimErr::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl Error for OptimErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OptimErr::Io(e) => Some(e),
            OptimErr::Checkpoint(e) => Some(e),
            OptimErr::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OptimErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SafeTensorError> for OptimErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<serde_json::Error> for OptimErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value)
    }
}
