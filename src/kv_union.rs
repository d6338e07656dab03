//! # Key-Value Union
//!
//! Linear-time merges over sorted, duplicate-free key sequences.
//!
//! Values are stored flattened: key `i` owns `lens[i]` consecutive values, or
//! a uniform width of `vals.len() / keys.len()` when `lens` is empty. Both
//! inputs of a merge must be strictly increasing; this is checked while merging
//! so a violation is reported instead of producing a silently wrong union.

use std::fmt;
use std::ops::AddAssign;

/// How a value is combined into the output when both sides hold the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// Sum the two contributions
    Plus,
    /// Keep the value of the right-hand side
    Assign,
}

/// Errors raised by key-value merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Keys are not strictly increasing at the given position
    Unsorted { position: usize },
    /// Value buffer does not match the keys and lengths
    LengthMismatch { keys: usize, vals: usize },
    /// Both sides hold a key with a different number of values
    WidthMismatch { position: usize, left: usize, right: usize },
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Unsorted { position } => {
                write!(f, "keys are not strictly increasing at position {position}")
            }
            KvError::LengthMismatch { keys, vals } => {
                write!(f, "{vals} values do not fit {keys} keys")
            }
            KvError::WidthMismatch {
                position,
                left,
                right,
            } => write!(
                f,
                "key at position {position} has {left} values on one side and {right} on the other"
            ),
        }
    }
}

impl std::error::Error for KvError {}

/// Borrowed view of a key-value sequence.
#[derive(Debug, Clone, Copy)]
pub struct KvSlice<'a, K, V> {
    pub keys: &'a [K],
    pub vals: &'a [V],
    pub lens: &'a [u32],
}

impl<'a, K, V> KvSlice<'a, K, V> {
    pub fn new(keys: &'a [K], vals: &'a [V], lens: &'a [u32]) -> Self {
        Self { keys, vals, lens }
    }

    /// Uniform width, or `None` when per-key lengths are given.
    fn uniform_width(&self) -> Result<Option<usize>, KvError> {
        if !self.lens.is_empty() {
            if self.lens.len() != self.keys.len() {
                return Err(KvError::LengthMismatch {
                    keys: self.keys.len(),
                    vals: self.lens.len(),
                });
            }
            let total: usize = self.lens.iter().map(|&l| l as usize).sum();
            if total != self.vals.len() {
                return Err(KvError::LengthMismatch {
                    keys: self.keys.len(),
                    vals: self.vals.len(),
                });
            }
            return Ok(None);
        }
        if self.keys.is_empty() {
            return if self.vals.is_empty() {
                Ok(Some(0))
            } else {
                Err(KvError::LengthMismatch {
                    keys: 0,
                    vals: self.vals.len(),
                })
            };
        }
        if self.vals.len() % self.keys.len() != 0 {
            return Err(KvError::LengthMismatch {
                keys: self.keys.len(),
                vals: self.vals.len(),
            });
        }
        Ok(Some(self.vals.len() / self.keys.len()))
    }
}

/// Owned result of a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvMerged<K, V> {
    pub keys: Vec<K>,
    pub vals: Vec<V>,
    /// Empty when every key has the same width
    pub lens: Vec<u32>,
}

struct Cursor<'a, K, V> {
    kv: KvSlice<'a, K, V>,
    width: Option<usize>,
    key: usize,
    val: usize,
}

impl<'a, K: Copy + Ord, V> Cursor<'a, K, V> {
    fn new(kv: KvSlice<'a, K, V>) -> Result<Self, KvError> {
        let width = kv.uniform_width()?;
        Ok(Self {
            kv,
            width,
            key: 0,
            val: 0,
        })
    }

    fn peek(&self) -> Option<K> {
        self.kv.keys.get(self.key).copied()
    }

    fn width_at(&self, i: usize) -> usize {
        match self.width {
            Some(w) => w,
            None => self.kv.lens[i] as usize,
        }
    }

    /// Consume the current key, returning its values.
    fn advance(&mut self) -> Result<&'a [V], KvError> {
        let i = self.key;
        if i > 0 && self.kv.keys[i - 1] >= self.kv.keys[i] {
            return Err(KvError::Unsorted { position: i });
        }
        let w = self.width_at(i);
        let vals = &self.kv.vals[self.val..self.val + w];
        self.key += 1;
        self.val += w;
        Ok(vals)
    }
}

/// Merge `left` and `right` into their sorted union.
///
/// Runs in `O(|left| + |right|)`. Values of keys present on both sides are
/// combined with `op`. The output uses a uniform width when both inputs share
/// one, and explicit lengths otherwise.
pub fn kv_union<K, V>(
    left: KvSlice<'_, K, V>,
    right: KvSlice<'_, K, V>,
    op: AssignOp,
) -> Result<KvMerged<K, V>, KvError>
where
    K: Copy + Ord,
    V: Copy + AddAssign,
{
    let mut a = Cursor::new(left)?;
    let mut b = Cursor::new(right)?;

    let uniform = match (a.width, b.width) {
        (Some(x), Some(y)) if x == y || left.keys.is_empty() || right.keys.is_empty() => {
            Some(if left.keys.is_empty() { y } else { x })
        }
        _ => None,
    };

    let capacity = left.keys.len() + right.keys.len();
    let mut out = KvMerged {
        keys: Vec::with_capacity(capacity),
        vals: Vec::with_capacity(left.vals.len() + right.vals.len()),
        lens: Vec::new(),
    };
    if uniform.is_none() {
        out.lens.reserve(capacity);
    }

    loop {
        let position = out.keys.len();
        let take_left = match (a.peek(), b.peek()) {
            (None, None) => break,
            (Some(ka), Some(kb)) if ka == kb => {
                let va = a.advance()?;
                let vb = b.advance()?;
                if va.len() != vb.len() {
                    return Err(KvError::WidthMismatch {
                        position,
                        left: va.len(),
                        right: vb.len(),
                    });
                }
                out.keys.push(ka);
                match op {
                    AssignOp::Plus => out.vals.extend(va.iter().zip(vb).map(|(&x, &y)| {
                        let mut sum = x;
                        sum += y;
                        sum
                    })),
                    AssignOp::Assign => out.vals.extend_from_slice(vb),
                }
                if uniform.is_none() {
                    out.lens.push(va.len() as u32);
                }
                continue;
            }
            (Some(ka), Some(kb)) => ka < kb,
            (Some(_), None) => true,
            (None, Some(_)) => false,
        };

        let cursor = if take_left { &mut a } else { &mut b };
        let key = cursor.kv.keys[cursor.key];
        let vals = cursor.advance()?;
        out.keys.push(key);
        out.vals.extend_from_slice(vals);
        if uniform.is_none() {
            out.lens.push(vals.len() as u32);
        }
    }

    Ok(out)
}

/// Look up each of `query` in the sorted dictionary `dict_keys` and return the
/// matching value, or `missing` when absent.
///
/// Both sequences must be strictly increasing; runs in
/// `O(|dict_keys| + |query|)`.
pub fn kv_match<K, V>(
    dict_keys: &[K],
    dict_vals: &[V],
    query: &[K],
    missing: V,
) -> Result<Vec<V>, KvError>
where
    K: Copy + Ord,
    V: Copy,
{
    if dict_keys.len() != dict_vals.len() {
        return Err(KvError::LengthMismatch {
            keys: dict_keys.len(),
            vals: dict_vals.len(),
        });
    }
    if let Some(position) = (1..dict_keys.len()).find(|&i| dict_keys[i - 1] >= dict_keys[i]) {
        return Err(KvError::Unsorted { position });
    }
    let mut out = Vec::with_capacity(query.len());
    let mut d = 0;
    for (i, &q) in query.iter().enumerate() {
        if i > 0 && query[i - 1] >= q {
            return Err(KvError::Unsorted { position: i });
        }
        while d < dict_keys.len() && dict_keys[d] < q {
            d += 1;
        }
        if d < dict_keys.len() && dict_keys[d] == q {
            out.push(dict_vals[d]);
        } else {
            out.push(missing);
        }
    }
    Ok(out)
}

/// Sorted union of key sets without values.
pub fn key_union<K: Copy + Ord>(left: &[K], right: &[K]) -> Vec<K> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if left[i] < right[j] {
            out.push(left[i]);
            i += 1;
        } else if right[j] < left[i] {
            out.push(right[j]);
            j += 1;
        } else {
            out.push(left[i]);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    out
}
