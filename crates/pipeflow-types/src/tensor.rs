// Tensors flowing between pipeline nodes.
//
// A `Tensor` is a typed view (precision + shape + byte window) over shared,
// reference-counted storage. Demultiplexed shards are views into their
// parent's storage; the storage is freed when the last view is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PipeflowError, Result};

// ── Precision ─────────────────────────────────────────────────────────────────

/// Element type of a tensor.
///
/// Numeric discriminants are part of the plugin ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Precision {
    Unspecified = 0,
    Fp32        = 1,
    Fp16        = 2,
    U8          = 3,
    I8          = 4,
    U16         = 5,
    I16         = 6,
    I32         = 7,
    Fp64        = 8,
    I64         = 9,
}

impl Precision {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Unspecified),
            1 => Some(Self::Fp32),
            2 => Some(Self::Fp16),
            3 => Some(Self::U8),
            4 => Some(Self::I8),
            5 => Some(Self::U16),
            6 => Some(Self::I16),
            7 => Some(Self::I32),
            8 => Some(Self::Fp64),
            9 => Some(Self::I64),
            _ => None,
        }
    }

    /// Bytes per element. `Unspecified` has no defined width.
    pub fn element_bytes(&self) -> Option<usize> {
        match self {
            Self::Unspecified => None,
            Self::U8 | Self::I8 => Some(1),
            Self::Fp16 | Self::U16 | Self::I16 => Some(2),
            Self::Fp32 | Self::I32 => Some(4),
            Self::Fp64 | Self::I64 => Some(8),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Fp32 => "FP32",
            Self::Fp16 => "FP16",
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::U16 => "U16",
            Self::I16 => "I16",
            Self::I32 => "I32",
            Self::Fp64 => "FP64",
            Self::I64 => "I64",
        };
        f.write_str(name)
    }
}

// ── Tensor Spec ───────────────────────────────────────────────────────────────

/// One dimension of a declared shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    Any,
    Fixed(usize),
}

impl Dimension {
    pub fn accepts(&self, actual: usize) -> bool {
        match self {
            Self::Any => true,
            Self::Fixed(expected) => *expected == actual,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("-1"),
            Self::Fixed(d) => write!(f, "{d}"),
        }
    }
}

/// Declared metadata of a named tensor, as reported by plugin metadata
/// queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<Dimension>,
    pub precision: Precision,
}

impl TensorSpec {
    /// True when `shape` has the declared rank and every fixed dimension
    /// matches.
    pub fn accepts_shape(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self.shape.iter().zip(shape).all(|(d, actual)| d.accepts(*actual))
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        write!(f, "{} [{}] {}", self.name, dims.join(","), self.precision)
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

/// Backing memory of one or more tensors.
///
/// Implemented for `Vec<u8>` (engine-owned data) and by the plugin crate for
/// buffers that must be handed back to the plugin that produced them.
pub trait TensorStorage: Send + Sync + fmt::Debug {
    fn bytes(&self) -> &[u8];
}

impl TensorStorage for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

// ── Tensor ────────────────────────────────────────────────────────────────────

/// Named tensors exchanged between nodes.
pub type TensorMap = BTreeMap<String, Tensor>;

#[derive(Clone)]
pub struct Tensor {
    precision: Precision,
    shape: Vec<usize>,
    storage: Arc<dyn TensorStorage>,
    offset: usize,
    len: usize,
}

impl Tensor {
    /// Wrap the whole of `storage` as a tensor of the given shape.
    pub fn new(
        precision: Precision,
        shape: Vec<usize>,
        storage: Arc<dyn TensorStorage>,
    ) -> Result<Self> {
        let len = storage.bytes().len();
        Self::view(precision, shape, storage, 0, len)
    }

    /// Build a view of `len` bytes starting at `offset` in `storage`.
    pub fn view(
        precision: Precision,
        shape: Vec<usize>,
        storage: Arc<dyn TensorStorage>,
        offset: usize,
        len: usize,
    ) -> Result<Self> {
        let available = storage.bytes().len();
        match offset.checked_add(len) {
            Some(end) if end <= available => {}
            _ => {
                return Err(PipeflowError::Tensor(format!(
                    "view [{offset}, +{len}) exceeds storage of {available} bytes"
                )));
            }
        }
        if let Some(expected) = expected_bytes(precision, &shape) {
            if expected != len {
                return Err(PipeflowError::Tensor(format!(
                    "shape {shape:?} of {precision} needs {expected} bytes, got {len}"
                )));
            }
        }
        Ok(Self { precision, shape, storage, offset, len })
    }

    pub fn from_bytes(precision: Precision, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        Self::new(precision, shape, Arc::new(data))
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(Precision::Fp32, shape, data)
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.precision != Precision::Fp32 {
            return Err(PipeflowError::Tensor(format!(
                "expected FP32 tensor, got {}",
                self.precision
            )));
        }
        Ok(self
            .bytes()
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    pub fn bytes(&self) -> &[u8] {
        &self.storage.bytes()[self.offset..self.offset + self.len]
    }

    pub fn leading_dim(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    /// True when both tensors are views over the same allocation.
    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Number of live handles on the backing storage.
    pub fn storage_handles(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Slice along the leading dimension into zero-copy views.
    ///
    /// Each view has the parent shape minus its first dimension and keeps the
    /// parent storage alive.
    pub fn split_leading(&self) -> Result<Vec<Tensor>> {
        let Some((&count, rest)) = self.shape.split_first() else {
            return Err(PipeflowError::Tensor("cannot split a scalar tensor".into()));
        };
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.len % count != 0 {
            return Err(PipeflowError::Tensor(format!(
                "{} bytes do not divide into {count} shards",
                self.len
            )));
        }
        let step = self.len / count;
        (0..count)
            .map(|i| {
                Tensor::view(
                    self.precision,
                    rest.to_vec(),
                    Arc::clone(&self.storage),
                    self.offset + i * step,
                    step,
                )
            })
            .collect()
    }

    /// Concatenate equally shaped shards under new leading dimensions.
    ///
    /// `leading` lists the dimensions to prepend; their product must equal
    /// `shards.len()`. Shards are laid out in slice order.
    pub fn stack(shards: &[Tensor], leading: &[usize]) -> Result<Tensor> {
        let Some(first) = shards.first() else {
            return Err(PipeflowError::Tensor("cannot stack zero shards".into()));
        };
        let expected: usize = leading.iter().product();
        if expected != shards.len() {
            return Err(PipeflowError::Tensor(format!(
                "leading dims {leading:?} describe {expected} shards, got {}",
                shards.len()
            )));
        }
        let mut data = Vec::with_capacity(first.len * shards.len());
        for shard in shards {
            if shard.shape != first.shape || shard.precision != first.precision {
                return Err(PipeflowError::Tensor(format!(
                    "shard {:?} {} does not match {:?} {}",
                    shard.shape, shard.precision, first.shape, first.precision
                )));
            }
            data.extend_from_slice(shard.bytes());
        }
        let mut shape = leading.to_vec();
        shape.extend_from_slice(&first.shape);
        Tensor::from_bytes(first.precision, shape, data)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("precision", &self.precision)
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

fn expected_bytes(precision: Precision, shape: &[usize]) -> Option<usize> {
    let width = precision.element_bytes()?;
    shape
        .iter()
        .try_fold(width, |acc, d| acc.checked_mul(*d))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
