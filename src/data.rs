//! The in-memory `Data` value: a fixed-width inline area plus a heap of
//! variable-length payloads (§3.2), its flatten/unflatten codec (§4.C),
//! typed indexed accessors, and pretty-printing.

use std::cell::RefCell;
use std::rc::Rc;
use std::{error, fmt};

use crate::bytes::{self, Reader, Writer};
use crate::time::LabradTime;
use crate::types::Type;

/// Errors raised by codec and accessor operations on `Data` (§7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The subtype navigated to does not match the requested scalar variant.
    TypeMismatch {
        expected: &'static str,
        actual: String,
        path: Vec<usize>,
    },
    /// Tried to index into a type that is neither `List` nor `Cluster`.
    NonIndexableType { actual: String, path: Vec<usize> },
    /// Too few indices were given to resolve a `List`'s shape-walk.
    PartialIndex { needed: usize, got: usize },
    /// `set_array_shape`'s `shape.len()` did not match the list's depth.
    ShapeMismatch { expected: usize, got: usize },
    /// Truncated input, an inconsistent/unassigned heap index, or a buffer
    /// too short to hold the declared payload.
    Codec(CodecError),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, actual, path } => write!(
                f,
                "type mismatch at {path:?}: expected {expected}, found {actual}"
            ),
            Self::NonIndexableType { actual, path } => {
                write!(f, "cannot index into non-composite type {actual} at {path:?}")
            }
            Self::PartialIndex { needed, got } => {
                write!(f, "not enough indices to resolve list shape: needed {needed}, got {got}")
            }
            Self::ShapeMismatch { expected, got } => {
                write!(f, "shape length {got} does not match list depth {expected}")
            }
            Self::Codec(err) => err.fmt(f),
        }
    }
}

impl error::Error for DataError {}

impl DataError {
    fn from_bytes(err: bytes::Error) -> DataError {
        DataError::Codec(CodecError::Bytes(err))
    }
}

impl From<CodecError> for DataError {
    fn from(err: CodecError) -> Self {
        DataError::Codec(err)
    }
}

/// Errors specific to the byte-level flatten/unflatten walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A variable-width slot was read before it was ever assigned.
    InconsistentHeapIndex,
    /// Propagated from the byte-primitive layer.
    Bytes(bytes::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InconsistentHeapIndex => f.write_str("read through an unassigned heap slot"),
            Self::Bytes(err) => err.fmt(f),
        }
    }
}

impl error::Error for CodecError {}

impl From<bytes::Error> for CodecError {
    fn from(err: bytes::Error) -> Self {
        CodecError::Bytes(err)
    }
}

/// Where a `Data`'s inline bytes actually live: the root inline buffer, or
/// a slot on the shared heap (reached while navigating into a `List`
/// element or a `Str`/`Error` sub-field).
#[derive(Clone)]
enum Storage {
    Inline(Rc<RefCell<Vec<u8>>>),
    Heap(Rc<RefCell<Vec<Vec<u8>>>>, usize),
}

impl Storage {
    fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Storage::Inline(b) => f(&b.borrow()),
            Storage::Heap(h, idx) => f(&h.borrow()[*idx]),
        }
    }

    fn with_buf_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        match self {
            Storage::Inline(b) => f(&mut b.borrow_mut()),
            Storage::Heap(h, idx) => f(&mut h.borrow_mut()[*idx]),
        }
    }
}

/// A LabRAD value: a `Type` plus storage (§3.2).
///
/// A value constructed via `Data::new`/`Data::unflatten` owns its inline
/// buffer and heap exclusively. A value returned by `get_data` is a view:
/// it shares storage with whatever it was navigated from, and must not
/// outlive it.
pub struct Data {
    ty: Type,
    storage: Storage,
    offset: usize,
    heap: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Data {
    /// Construct a fresh, owned value of `ty`. The inline area is
    /// initialized to `0xFF` (sentinel `-1` when read as `i32`) so
    /// variable-width slots report "unassigned" until first set — bulk
    /// zeroing here would silently break that contract.
    #[must_use]
    pub fn new(ty: Type) -> Data {
        let width = ty.inline_width();
        Data {
            storage: Storage::Inline(Rc::new(RefCell::new(vec![0xFFu8; width]))),
            offset: 0,
            heap: Rc::new(RefCell::new(Vec::new())),
            ty,
        }
    }

    #[must_use]
    pub fn data_type(&self) -> &Type {
        &self.ty
    }

    /// A shallow, storage-sharing view onto `self` at the same location.
    fn share(&self) -> Data {
        Data {
            ty: self.ty.clone(),
            storage: self.storage.clone(),
            offset: self.offset,
            heap: Rc::clone(&self.heap),
        }
    }

    fn child(&self, ty: Type, offset: usize) -> Data {
        Data {
            ty,
            storage: self.storage.clone(),
            offset,
            heap: Rc::clone(&self.heap),
        }
    }

    fn heap_child(&self, ty: Type, heap_idx: usize, offset: usize) -> Data {
        Data {
            ty,
            storage: Storage::Heap(Rc::clone(&self.heap), heap_idx),
            offset,
            heap: Rc::clone(&self.heap),
        }
    }

    // -- raw inline access -------------------------------------------------

    fn read_bool(&self) -> bool {
        self.storage.with_buf(|b| bytes::read_bool(b, self.offset))
    }

    fn write_bool(&self, v: bool) {
        self.storage.with_buf_mut(|b| bytes::write_bool(b, self.offset, v));
    }

    fn read_i32(&self) -> i32 {
        self.storage.with_buf(|b| bytes::read_i32(b, self.offset))
    }

    fn write_i32(&self, v: i32) {
        self.storage.with_buf_mut(|b| bytes::write_i32(b, self.offset, v));
    }

    fn read_u32(&self) -> u32 {
        self.storage.with_buf(|b| bytes::read_u32(b, self.offset))
    }

    fn write_u32(&self, v: u32) {
        self.storage.with_buf_mut(|b| bytes::write_u32(b, self.offset, v));
    }

    fn read_f64(&self) -> f64 {
        self.storage.with_buf(|b| bytes::read_f64(b, self.offset))
    }

    fn write_f64(&self, v: f64) {
        self.storage.with_buf_mut(|b| bytes::write_f64(b, self.offset, v));
    }

    fn read_complex(&self) -> (f64, f64) {
        self.storage.with_buf(|b| bytes::read_complex(b, self.offset))
    }

    fn write_complex(&self, v: (f64, f64)) {
        self.storage.with_buf_mut(|b| bytes::write_complex(b, self.offset, v));
    }

    fn read_time(&self) -> LabradTime {
        let seconds = self.storage.with_buf(|b| bytes::read_u64(b, self.offset));
        let fraction = self.storage.with_buf(|b| bytes::read_u64(b, self.offset + 8));
        LabradTime::new(seconds, fraction)
    }

    fn write_time(&self, t: LabradTime) {
        self.storage.with_buf_mut(|b| {
            bytes::write_u64(b, self.offset, t.seconds);
            bytes::write_u64(b, self.offset + 8, t.fraction);
        });
    }

    // -- heap slot handling --------------------------------------------------

    /// Interprets the i32 at `self.offset` as a heap index. This is only
    /// meaningful for `Data` values whose own inline slot *is* a heap
    /// index: `Str`, a list's trailing index word, or an `Error`'s message
    /// word.
    fn heap_slot(&self) -> Option<usize> {
        let idx = self.read_i32();
        if idx < 0 {
            None
        } else {
            Some(idx as usize)
        }
    }

    /// Write `data` into this slot's heap entry, reusing the existing
    /// entry (and inline index) if one is already assigned. This is what
    /// keeps repeated `set_bytes` on the same path from growing the heap
    /// unboundedly (§3.2, §8 "Heap reuse").
    fn set_heap_bytes(&self, data: Vec<u8>) -> usize {
        match self.heap_slot() {
            Some(idx) => {
                self.heap.borrow_mut()[idx] = data;
                idx
            }
            None => {
                let idx = {
                    let mut h = self.heap.borrow_mut();
                    let idx = h.len();
                    h.push(data);
                    idx
                };
                self.write_i32(idx as i32);
                idx
            }
        }
    }

    /// A synthetic `Str`-shaped view over the heap-index word that
    /// trails a list's shape dimensions.
    fn list_heap_index_view(&self, depth: usize) -> Data {
        self.child(Type::Str, self.offset + 4 * depth)
    }

    fn read_shape_raw(&self, depth: usize) -> Vec<i32> {
        (0..depth)
            .map(|i| self.storage.with_buf(|b| bytes::read_i32(b, self.offset + 4 * i)))
            .collect()
    }

    fn read_shape_checked(&self, depth: usize) -> Result<Vec<usize>, DataError> {
        let raw = self.read_shape_raw(depth);
        raw.into_iter()
            .map(|d| {
                if d < 0 {
                    Err(DataError::Codec(CodecError::InconsistentHeapIndex))
                } else {
                    Ok(d as usize)
                }
            })
            .collect()
    }

    // -- indexing -----------------------------------------------------------

    /// Navigate `indices` starting from `self`, per §4.C "Indexing
    /// semantics": a `Cluster` index selects a child; a `List` consumes
    /// `depth` indices as a shape-walk before any remaining index
    /// descends into the element type. Any other type fails the moment
    /// an index is asked of it.
    fn navigate(&self, indices: &[usize]) -> Result<Data, DataError> {
        if indices.is_empty() {
            return Ok(self.share());
        }
        match &self.ty {
            Type::Cluster { children, offsets } => {
                let i = indices[0];
                if i >= children.len() {
                    return Err(DataError::PartialIndex { needed: 1, got: 0 });
                }
                let view = self.child(children[i].clone(), self.offset + offsets[i]);
                view.navigate(&indices[1..])
            }
            Type::List { element, depth } => {
                let depth = *depth;
                if indices.len() < depth {
                    return Err(DataError::PartialIndex { needed: depth, got: indices.len() });
                }
                let shape = self.read_shape_checked(depth)?;
                let mut flat = 0usize;
                let mut stride = 1usize;
                for d in (0..depth).rev() {
                    let i = indices[d];
                    if i >= shape[d] {
                        return Err(DataError::PartialIndex { needed: depth, got: indices.len() });
                    }
                    flat += i * stride;
                    stride *= shape[d];
                }
                let elem_w = element.inline_width();
                let idx_view = self.list_heap_index_view(depth);
                let heap_idx = idx_view
                    .heap_slot()
                    .ok_or(DataError::Codec(CodecError::InconsistentHeapIndex))?;
                let view = self.heap_child((**element).clone(), heap_idx, flat * elem_w);
                view.navigate(&indices[depth..])
            }
            other => Err(DataError::NonIndexableType {
                actual: other.tag(),
                path: indices.to_vec(),
            }),
        }
    }

    /// Navigate to a (possibly nested) sub-value, returning a view.
    pub fn get_data(&self, indices: &[usize]) -> Result<Data, DataError> {
        self.navigate(indices)
    }

    fn mismatch(actual: &Type, expected: &'static str, indices: &[usize]) -> DataError {
        DataError::TypeMismatch {
            expected,
            actual: actual.tag(),
            path: indices.to_vec(),
        }
    }

    // -- scalar accessor trios -----------------------------------------------

    #[must_use]
    pub fn is_bool(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Bool))
    }

    pub fn get_bool(&self, indices: &[usize]) -> Result<bool, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Bool => Ok(v.read_bool()),
            _ => Err(Self::mismatch(&v.ty, "bool", indices)),
        }
    }

    pub fn set_bool(&mut self, value: bool, indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Bool => {
                v.write_bool(value);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "bool", indices)),
        }
    }

    #[must_use]
    pub fn is_int(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Int))
    }

    pub fn get_int(&self, indices: &[usize]) -> Result<i32, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Int => Ok(v.read_i32()),
            _ => Err(Self::mismatch(&v.ty, "int", indices)),
        }
    }

    pub fn set_int(&mut self, value: i32, indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Int => {
                v.write_i32(value);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "int", indices)),
        }
    }

    #[must_use]
    pub fn is_word(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Word))
    }

    pub fn get_word(&self, indices: &[usize]) -> Result<u32, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Word => Ok(v.read_u32()),
            _ => Err(Self::mismatch(&v.ty, "word", indices)),
        }
    }

    pub fn set_word(&mut self, value: u32, indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Word => {
                v.write_u32(value);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "word", indices)),
        }
    }

    #[must_use]
    pub fn is_value(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Value(_)))
    }

    pub fn get_value(&self, indices: &[usize]) -> Result<f64, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Value(_) => Ok(v.read_f64()),
            _ => Err(Self::mismatch(&v.ty, "value", indices)),
        }
    }

    pub fn set_value(&mut self, value: f64, indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Value(_) => {
                v.write_f64(value);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "value", indices)),
        }
    }

    #[must_use]
    pub fn is_complex(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Complex(_)))
    }

    pub fn get_complex(&self, indices: &[usize]) -> Result<(f64, f64), DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Complex(_) => Ok(v.read_complex()),
            _ => Err(Self::mismatch(&v.ty, "complex", indices)),
        }
    }

    pub fn set_complex(&mut self, value: (f64, f64), indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Complex(_) => {
                v.write_complex(value);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "complex", indices)),
        }
    }

    #[must_use]
    pub fn is_time(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Time))
    }

    pub fn get_time(&self, indices: &[usize]) -> Result<LabradTime, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Time => Ok(v.read_time()),
            _ => Err(Self::mismatch(&v.ty, "time", indices)),
        }
    }

    /// Writes `seconds` at this slot's first 8 bytes and `fraction` at the
    /// next 8 — two consecutive slots, matching `get_time`'s assumption
    /// (§9 open question).
    pub fn set_time(&mut self, value: LabradTime, indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Time => {
                v.write_time(value);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "time", indices)),
        }
    }

    #[must_use]
    pub fn is_string(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Str))
    }

    /// The canonical, byte-transparent accessor: raw payload bytes with
    /// no encoding assumed. An unassigned slot reads as empty.
    pub fn get_bytes(&self, indices: &[usize]) -> Result<Vec<u8>, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Str => Ok(v
                .heap_slot()
                .map(|idx| v.heap.borrow()[idx].clone())
                .unwrap_or_default()),
            _ => Err(Self::mismatch(&v.ty, "string", indices)),
        }
    }

    pub fn set_bytes(&mut self, data: &[u8], indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match v.ty {
            Type::Str => {
                v.set_heap_bytes(data.to_vec());
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "string", indices)),
        }
    }

    /// Convenience over `get_bytes` assuming ISO-8859-1: every byte maps
    /// to the Unicode scalar of the same ordinal. Not the canonical path
    /// (see module docs); prefer `get_bytes` when the payload is not
    /// known to be text.
    pub fn get_string(&self, indices: &[usize]) -> Result<String, DataError> {
        Ok(self.get_bytes(indices)?.iter().map(|&b| b as char).collect())
    }

    /// Convenience over `set_bytes`. Only round-trips losslessly for
    /// strings whose characters are all in the Latin-1 range; anything
    /// outside it is the caller's responsibility to avoid (use
    /// `set_bytes` directly for arbitrary payloads).
    pub fn set_string(&mut self, s: &str, indices: &[usize]) -> Result<&mut Data, DataError> {
        let latin1: Vec<u8> = s.chars().map(|c| c as u32 as u8).collect();
        self.set_bytes(&latin1, indices)
    }

    #[must_use]
    pub fn is_error(&self, indices: &[usize]) -> bool {
        self.navigate(indices).is_ok_and(|v| matches!(v.ty, Type::Error { .. }))
    }

    pub fn get_error(&self, indices: &[usize]) -> Result<(i32, String), DataError> {
        let v = self.navigate(indices)?;
        match &v.ty {
            Type::Error { .. } => {
                let code = v.read_i32();
                let str_view = v.child(Type::Str, v.offset + 4);
                let msg: String = str_view
                    .heap_slot()
                    .map(|idx| v.heap.borrow()[idx].clone())
                    .unwrap_or_default()
                    .iter()
                    .map(|&b| b as char)
                    .collect();
                Ok((code, msg))
            }
            _ => Err(Self::mismatch(&v.ty, "error", indices)),
        }
    }

    pub fn set_error(&mut self, code: i32, message: &str, indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        match &v.ty {
            Type::Error { .. } => {
                v.write_i32(code);
                let latin1: Vec<u8> = message.chars().map(|c| c as u32 as u8).collect();
                v.child(Type::Str, v.offset + 4).set_heap_bytes(latin1);
                Ok(self)
            }
            _ => Err(Self::mismatch(&v.ty, "error", indices)),
        }
    }

    /// A view over the error's payload sub-value, for setting/reading the
    /// nested `T` in `Error(T)`. Not reachable through `get_data`'s
    /// generic index navigation (`Error` is not a composite type for
    /// indexing purposes per §4.C), since the code/message fields have
    /// their own dedicated accessors above.
    pub fn error_payload(&self, indices: &[usize]) -> Result<Data, DataError> {
        let v = self.navigate(indices)?;
        match &v.ty {
            Type::Error { payload } => Ok(v.child((**payload).clone(), v.offset + 8)),
            _ => Err(Self::mismatch(&v.ty, "error", indices)),
        }
    }

    // -- list shape ----------------------------------------------------------

    /// Shorthand for `set_array_shape(&[n], indices)` on a depth-1 list.
    pub fn set_array_size(&mut self, n: usize, indices: &[usize]) -> Result<&mut Data, DataError> {
        self.set_array_shape(&[n], indices)
    }

    /// Allocate the element buffer for a `List` and record its shape.
    /// `shape.len()` must equal the list's depth.
    pub fn set_array_shape(&mut self, shape: &[usize], indices: &[usize]) -> Result<&mut Data, DataError> {
        let v = self.navigate(indices)?;
        let (element, depth) = match &v.ty {
            Type::List { element, depth } => ((**element).clone(), *depth),
            other => return Err(Self::mismatch(other, "list", indices)),
        };
        if shape.len() != depth {
            return Err(DataError::ShapeMismatch { expected: depth, got: shape.len() });
        }
        for (i, &dim) in shape.iter().enumerate() {
            v.storage.with_buf_mut(|b| bytes::write_i32(b, v.offset + 4 * i, dim as i32));
        }
        let total: usize = shape.iter().product();
        let elem_w = element.inline_width();
        v.list_heap_index_view(depth).set_heap_bytes(vec![0xFFu8; total * elem_w]);
        Ok(self)
    }

    // -- flatten / unflatten --------------------------------------------------

    /// Encode this value's wire representation (§4.C).
    #[must_use]
    pub fn flatten(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.flatten_into(&mut w);
        w.into_bytes()
    }

    fn flatten_into(&self, w: &mut Writer) {
        match &self.ty {
            Type::Empty => {}
            Type::Bool => w.write_bool(self.read_bool()),
            Type::Int => w.write_i32(self.read_i32()),
            Type::Word => w.write_u32(self.read_u32()),
            Type::Value(_) => w.write_f64(self.read_f64()),
            Type::Complex(_) => {
                let (re, im) = self.read_complex();
                w.write_f64(re);
                w.write_f64(im);
            }
            Type::Time => {
                let t = self.read_time();
                w.write_u64(t.seconds);
                w.write_u64(t.fraction);
            }
            Type::Str => {
                let bytes = self
                    .heap_slot()
                    .map(|idx| self.heap.borrow()[idx].clone())
                    .unwrap_or_default();
                w.write_str_bytes(&bytes);
            }
            Type::List { element, depth } => {
                let depth = *depth;
                let shape: Vec<usize> = self
                    .read_shape_raw(depth)
                    .into_iter()
                    .map(|d| d.max(0) as usize)
                    .collect();
                for &d in &shape {
                    w.write_i32(d as i32);
                }
                let total: usize = shape.iter().product();
                let elem_w = element.inline_width();
                let idx_view = self.list_heap_index_view(depth);
                match idx_view.heap_slot() {
                    Some(hi) if element.is_fixed() => {
                        w.write_bytes(&self.heap.borrow()[hi]);
                    }
                    Some(hi) => {
                        for i in 0..total {
                            self.heap_child((**element).clone(), hi, i * elem_w).flatten_into(w);
                        }
                    }
                    None if element.is_fixed() => {
                        w.write_bytes(&vec![0u8; total * elem_w]);
                    }
                    None => {
                        for _ in 0..total {
                            Data::new((**element).clone()).flatten_into(w);
                        }
                    }
                }
            }
            Type::Cluster { children, offsets } => {
                for (child, &off) in children.iter().zip(offsets) {
                    self.child(child.clone(), self.offset + off).flatten_into(w);
                }
            }
            Type::Error { payload } => {
                w.write_i32(self.read_i32());
                self.child(Type::Str, self.offset + 4).flatten_into(w);
                self.child((**payload).clone(), self.offset + 8).flatten_into(w);
            }
        }
    }

    /// Decode `bytes` as `ty`, the exact inverse of `flatten` (§4.C).
    pub fn unflatten(bytes_in: &[u8], ty: Type) -> Result<Data, DataError> {
        let mut r = Reader::new(bytes_in);
        let data = Data::new(ty);
        data.unflatten_into(&mut r)?;
        Ok(data)
    }

    fn unflatten_into(&self, r: &mut Reader<'_>) -> Result<(), DataError> {
        match &self.ty {
            Type::Empty => Ok(()),
            Type::Bool => {
                self.write_bool(r.read_bool().map_err(DataError::from_bytes)?);
                Ok(())
            }
            Type::Int => {
                self.write_i32(r.read_i32().map_err(DataError::from_bytes)?);
                Ok(())
            }
            Type::Word => {
                self.write_u32(r.read_u32().map_err(DataError::from_bytes)?);
                Ok(())
            }
            Type::Value(_) => {
                self.write_f64(r.read_f64().map_err(DataError::from_bytes)?);
                Ok(())
            }
            Type::Complex(_) => {
                let re = r.read_f64().map_err(DataError::from_bytes)?;
                let im = r.read_f64().map_err(DataError::from_bytes)?;
                self.write_complex((re, im));
                Ok(())
            }
            Type::Time => {
                let seconds = r.read_u64().map_err(DataError::from_bytes)?;
                let fraction = r.read_u64().map_err(DataError::from_bytes)?;
                self.write_time(LabradTime::new(seconds, fraction));
                Ok(())
            }
            Type::Str => {
                let payload = r.read_str_bytes().map_err(DataError::from_bytes)?.to_vec();
                self.set_heap_bytes(payload);
                Ok(())
            }
            Type::List { element, depth } => {
                let depth = *depth;
                let mut shape = Vec::with_capacity(depth);
                for i in 0..depth {
                    let d = r.read_i32().map_err(DataError::from_bytes)?;
                    self.storage.with_buf_mut(|b| bytes::write_i32(b, self.offset + 4 * i, d));
                    shape.push(d.max(0) as usize);
                }
                let total: usize = shape.iter().product();
                let elem_w = element.inline_width();
                let idx_view = self.list_heap_index_view(depth);
                if element.is_fixed() {
                    let raw = r.read_bytes(total * elem_w).map_err(DataError::from_bytes)?.to_vec();
                    idx_view.set_heap_bytes(raw);
                } else {
                    let hidx = idx_view.set_heap_bytes(vec![0xFFu8; total * elem_w]);
                    for i in 0..total {
                        self.heap_child((**element).clone(), hidx, i * elem_w)
                            .unflatten_into(r)?;
                    }
                }
                Ok(())
            }
            Type::Cluster { children, offsets } => {
                for (child, &off) in children.iter().zip(offsets) {
                    self.child(child.clone(), self.offset + off).unflatten_into(r)?;
                }
                Ok(())
            }
            Type::Error { payload } => {
                self.write_i32(r.read_i32().map_err(DataError::from_bytes)?);
                let msg = r.read_str_bytes().map_err(DataError::from_bytes)?.to_vec();
                self.child(Type::Str, self.offset + 4).set_heap_bytes(msg);
                self.child((**payload).clone(), self.offset + 8).unflatten_into(r)
            }
        }
    }

    // -- deep clone ------------------------------------------------------------

    /// Build a standalone inline buffer representing `self`'s subtree,
    /// pushing any heap-backed payloads onto `new_heap` and rewriting
    /// inline heap indices to point at the copies.
    fn deep_copy_buf(&self, new_heap: &Rc<RefCell<Vec<Vec<u8>>>>) -> Vec<u8> {
        let width = self.ty.inline_width();
        let mut buf = vec![0xFFu8; width];
        match &self.ty {
            Type::Empty => {}
            Type::Bool | Type::Int | Type::Word | Type::Value(_) | Type::Complex(_) | Type::Time => {
                let src = self.storage.with_buf(|b| b[self.offset..self.offset + width].to_vec());
                buf.copy_from_slice(&src);
            }
            Type::Str => match self.heap_slot() {
                Some(idx) => {
                    let data = self.heap.borrow()[idx].clone();
                    let new_idx = push_heap(new_heap, data);
                    bytes::write_i32(&mut buf, 0, new_idx as i32);
                }
                None => bytes::write_i32(&mut buf, 0, -1),
            },
            Type::List { element, depth } => {
                let depth = *depth;
                let shape = self.read_shape_raw(depth);
                for (i, &d) in shape.iter().enumerate() {
                    bytes::write_i32(&mut buf, 4 * i, d);
                }
                let idx_view = self.list_heap_index_view(depth);
                match idx_view.heap_slot() {
                    Some(hi) => {
                        let total: usize = shape.iter().map(|&d| d.max(0) as usize).product();
                        let elem_w = element.inline_width();
                        let new_buf = if element.is_fixed() {
                            self.heap.borrow()[hi].clone()
                        } else {
                            let mut out = Vec::with_capacity(total * elem_w);
                            for i in 0..total {
                                let elem_view = self.heap_child((**element).clone(), hi, i * elem_w);
                                out.extend(elem_view.deep_copy_buf(new_heap));
                            }
                            out
                        };
                        let new_idx = push_heap(new_heap, new_buf);
                        bytes::write_i32(&mut buf, 4 * depth, new_idx as i32);
                    }
                    None => bytes::write_i32(&mut buf, 4 * depth, -1),
                }
            }
            Type::Cluster { children, offsets } => {
                for (child, &off) in children.iter().zip(offsets) {
                    let view = self.child(child.clone(), self.offset + off);
                    let child_buf = view.deep_copy_buf(new_heap);
                    buf[off..off + child.inline_width()].copy_from_slice(&child_buf);
                }
            }
            Type::Error { payload } => {
                bytes::write_i32(&mut buf, 0, self.read_i32());
                let str_buf = self.child(Type::Str, self.offset + 4).deep_copy_buf(new_heap);
                buf[4..8].copy_from_slice(&str_buf);
                let payload_buf = self
                    .child((**payload).clone(), self.offset + 8)
                    .deep_copy_buf(new_heap);
                buf[8..8 + payload.inline_width()].copy_from_slice(&payload_buf);
            }
        }
        buf
    }

    // -- pretty-printing ---------------------------------------------------

    /// Stable, locale-independent rendering of the value (§4.C).
    #[must_use]
    pub fn pretty(&self) -> String {
        match &self.ty {
            Type::Empty => "_".to_string(),
            Type::Bool => self.read_bool().to_string(),
            Type::Int => self.read_i32().to_string(),
            Type::Word => self.read_u32().to_string(),
            Type::Value(units) => with_units(self.read_f64().to_string(), units),
            Type::Complex(units) => {
                let (re, im) = self.read_complex();
                with_units(format!("{re}+{im}i"), units)
            }
            Type::Time => self.read_time().to_iso_string(),
            Type::Str => format!("\"{}\"", self.get_string(&[]).unwrap_or_default()),
            Type::List { element, depth } => {
                let depth = *depth;
                let shape: Vec<usize> = self
                    .read_shape_raw(depth)
                    .into_iter()
                    .map(|d| d.max(0) as usize)
                    .collect();
                let idx_view = self.list_heap_index_view(depth);
                let heap_idx = idx_view.heap_slot();
                let elem_w = element.inline_width();
                let mut prefix = Vec::with_capacity(depth);
                render_list_dim(0, &shape, &mut prefix, &|idx| {
                    let flat = flat_index(&shape, idx);
                    let view = match heap_idx {
                        Some(hi) => self.heap_child((**element).clone(), hi, flat * elem_w),
                        None => Data::new((**element).clone()),
                    };
                    view.pretty()
                })
            }
            Type::Cluster { children, offsets } => {
                let parts: Vec<String> = children
                    .iter()
                    .zip(offsets)
                    .map(|(c, &o)| self.child(c.clone(), self.offset + o).pretty())
                    .collect();
                format!("({})", parts.join(", "))
            }
            Type::Error { payload } => {
                let (code, msg) = self.get_error(&[]).unwrap_or((0, String::new()));
                if matches!(payload.as_ref(), Type::Empty) {
                    format!("Error({code}, \"{msg}\")")
                } else {
                    let pretty_payload = self.child((**payload).clone(), self.offset + 8).pretty();
                    format!("Error({code}, \"{msg}\", {pretty_payload})")
                }
            }
        }
    }
}

impl Clone for Data {
    /// Deep copy: the result owns an independent inline buffer and heap,
    /// sharing nothing with `self` (§3.2).
    fn clone(&self) -> Data {
        let new_heap = Rc::new(RefCell::new(Vec::new()));
        let buf = self.deep_copy_buf(&new_heap);
        Data {
            ty: self.ty.clone(),
            storage: Storage::Inline(Rc::new(RefCell::new(buf))),
            offset: 0,
            heap: new_heap,
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("type", &self.ty.tag())
            .field("value", &self.pretty())
            .finish()
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

fn push_heap(heap: &Rc<RefCell<Vec<Vec<u8>>>>, data: Vec<u8>) -> usize {
    let mut h = heap.borrow_mut();
    let idx = h.len();
    h.push(data);
    idx
}

fn with_units(body: String, units: &Option<String>) -> String {
    match units {
        Some(u) => format!("{body} [{u}]"),
        None => body,
    }
}

fn flat_index(shape: &[usize], indices: &[usize]) -> usize {
    let mut flat = 0;
    let mut stride = 1;
    for d in (0..shape.len()).rev() {
        flat += indices[d] * stride;
        stride *= shape[d];
    }
    flat
}

fn render_list_dim(
    dim: usize,
    shape: &[usize],
    prefix: &mut Vec<usize>,
    render_elem: &dyn Fn(&[usize]) -> String,
) -> String {
    if dim == shape.len() {
        return render_elem(prefix);
    }
    let mut parts = Vec::with_capacity(shape[dim]);
    for i in 0..shape[dim] {
        prefix.push(i);
        parts.push(render_list_dim(dim + 1, shape, prefix, render_elem));
        prefix.pop();
    }
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(tag: &str) -> Data {
        Data::new(Type::parse(tag).unwrap())
    }

    #[test]
    fn scalar_int_flatten() {
        let mut v = d("i");
        v.set_int(1, &[]).unwrap();
        assert_eq!(v.flatten(), [0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn string_flatten() {
        let mut v = d("s");
        v.set_string("ab", &[]).unwrap();
        assert_eq!(v.flatten(), [0x00, 0x00, 0x00, 0x02, b'a', b'b']);
    }

    #[test]
    fn cluster_flatten() {
        let mut v = d("(bi)");
        v.set_bool(true, &[0]).unwrap();
        v.set_int(-1, &[1]).unwrap();
        assert_eq!(v.flatten(), [0x01, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn list_flatten_flat() {
        let mut v = d("*i");
        v.set_array_size(3, &[]).unwrap();
        v.set_int(7, &[0]).unwrap();
        v.set_int(8, &[1]).unwrap();
        v.set_int(9, &[2]).unwrap();
        assert_eq!(
            v.flatten(),
            [0, 0, 0, 3, 0, 0, 0, 7, 0, 0, 0, 8, 0, 0, 0, 9]
        );
    }

    #[test]
    fn nested_list_shape() {
        let mut v = d("*2i");
        v.set_array_shape(&[2, 2], &[]).unwrap();
        v.set_int(1, &[0, 0]).unwrap();
        v.set_int(2, &[0, 1]).unwrap();
        v.set_int(3, &[1, 0]).unwrap();
        v.set_int(4, &[1, 1]).unwrap();
        let flat = v.flatten();
        assert_eq!(&flat[0..8], [0, 0, 0, 2, 0, 0, 0, 2]);
        assert_eq!(&flat[8..24], [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4]);
    }

    #[test]
    fn round_trip_nested_cluster_and_list() {
        let ty = Type::parse("(i*s)").unwrap();
        let mut v = Data::new(ty.clone());
        v.set_int(5, &[0]).unwrap();
        v.set_array_size(2, &[1]).unwrap();
        v.set_string("a", &[1, 0]).unwrap();
        v.set_string("bcd", &[1, 1]).unwrap();
        let flat = v.flatten();
        let back = Data::unflatten(&flat, ty).unwrap();
        assert_eq!(back.get_int(&[0]).unwrap(), 5);
        assert_eq!(back.get_string(&[1, 0]).unwrap(), "a");
        assert_eq!(back.get_string(&[1, 1]).unwrap(), "bcd");
        assert_eq!(back.flatten(), flat);
    }

    #[test]
    fn view_coherence() {
        let mut v = d("(ii)");
        v.set_int(10, &[0]).unwrap();
        v.set_int(20, &[1]).unwrap();
        let view = v.get_data(&[1]).unwrap();
        assert_eq!(view.get_int(&[]).unwrap(), 20);
        v.set_int(99, &[1]).unwrap();
        assert_eq!(view.get_int(&[]).unwrap(), 99);
    }

    #[test]
    fn heap_reuse_on_repeated_set() {
        let mut v = d("s");
        v.set_bytes(b"a", &[]).unwrap();
        v.set_bytes(b"longer value", &[]).unwrap();
        assert_eq!(v.heap.borrow().len(), 1);
        assert_eq!(v.get_bytes(&[]).unwrap(), b"longer value");
    }

    #[test]
    fn clone_is_independent() {
        let mut v = d("s");
        v.set_bytes(b"hello", &[]).unwrap();
        let mut copy = v.clone();
        copy.set_bytes(b"world", &[]).unwrap();
        assert_eq!(v.get_bytes(&[]).unwrap(), b"hello");
        assert_eq!(copy.get_bytes(&[]).unwrap(), b"world");
    }

    #[test]
    fn type_mismatch_error() {
        let v = d("i");
        let err = v.get_bool(&[]).unwrap_err();
        assert!(matches!(err, DataError::TypeMismatch { expected: "bool", .. }));
    }

    #[test]
    fn non_indexable_type_error() {
        let v = d("i");
        let err = v.get_data(&[0]).unwrap_err();
        assert!(matches!(err, DataError::NonIndexableType { .. }));
    }

    #[test]
    fn partial_index_error() {
        let v = d("*2i");
        let err = v.get_data(&[0]).unwrap_err();
        assert!(matches!(err, DataError::PartialIndex { needed: 2, got: 1 }));
    }

    #[test]
    fn shape_mismatch_error() {
        let mut v = d("*2i");
        let err = v.set_array_shape(&[1], &[]).unwrap_err();
        assert_eq!(err, DataError::ShapeMismatch { expected: 2, got: 1 });
    }

    #[test]
    fn empty_list_is_four_bytes() {
        let mut v = d("*i");
        v.set_array_size(0, &[]).unwrap();
        assert_eq!(v.flatten(), [0, 0, 0, 0]);
    }

    #[test]
    fn error_type_round_trip_with_payload() {
        let ty = Type::parse("Ei").unwrap();
        let mut v = Data::new(ty.clone());
        v.set_error(7, "bad thing", &[]).unwrap();
        v.error_payload(&[]).unwrap().set_int(42, &[]).unwrap();
        let flat = v.flatten();
        let back = Data::unflatten(&flat, ty).unwrap();
        assert_eq!(back.get_error(&[]).unwrap(), (7, "bad thing".to_string()));
        assert_eq!(back.error_payload(&[]).unwrap().get_int(&[]).unwrap(), 42);
    }

    #[test]
    fn nested_error_payload_terminates() {
        let ty = Type::parse("EE").unwrap();
        let mut v = Data::new(ty.clone());
        v.set_error(1, "outer", &[]).unwrap();
        let mut inner = v.error_payload(&[]).unwrap();
        inner.set_error(2, "inner", &[]).unwrap();
        // inner is a view; writes are visible through v as well.
        let flat = v.flatten();
        let back = Data::unflatten(&flat, ty).unwrap();
        assert_eq!(back.get_error(&[]).unwrap(), (1, "outer".to_string()));
        assert_eq!(
            back.error_payload(&[]).unwrap().get_error(&[]).unwrap(),
            (2, "inner".to_string())
        );
    }

    #[test]
    fn pretty_print_cluster_and_list() {
        let mut v = d("(i*i)");
        v.set_int(1, &[0]).unwrap();
        v.set_array_size(2, &[1]).unwrap();
        v.set_int(10, &[1, 0]).unwrap();
        v.set_int(20, &[1, 1]).unwrap();
        assert_eq!(v.pretty(), "(1, [10, 20])");
    }

    #[test]
    fn pretty_print_value_with_units() {
        let mut v = Data::new(Type::parse("v[m]").unwrap());
        v.set_value(3.5, &[]).unwrap();
        assert_eq!(v.pretty(), "3.5 [m]");
    }
}
