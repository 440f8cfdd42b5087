//! Input registry and the shared-memory batch buffer manager.
//!
//! Each registered input owns at most one live buffer segment at a time,
//! identified across processes by a monotonically increasing tag. The reuse
//! policy per call:
//!
//! 1. a slab token whose tag matches the live buffer reuses it in place
//!    (the caller already wrote the rows through [`SlabSlice`]);
//! 2. a buffer whose non-batch dimensions match and whose batch capacity
//!    covers the new batch is overwritten head-first, no reallocation;
//! 3. otherwise a fresh segment is allocated under a new tag, sized with 5%
//!    slack on the batch axis so small growth does not reallocate every
//!    call.
//!
//! Buffer segments are self-describing (dtype, dims, capacity in a fixed
//! header) so a worker can map one knowing nothing but its path.

use crate::paths::RunPaths;
use crate::sync::{SharedRegion, SyncError};
use crate::tensor::{Dtype, HostTensor};
use crate::{Error, Result};
use std::sync::atomic::Ordering;

/// Handle to a registered input, used to declare functions and pass
/// keyword arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputVar {
    pub(crate) id: usize,
    pub(crate) name: String,
    pub(crate) dtype: Dtype,
}

impl InputVar {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }
}

/// Token naming rows already staged in an input's live buffer.
#[derive(Clone, Copy, Debug)]
pub struct SlabToken {
    pub(crate) input_id: usize,
    pub(crate) tag: u64,
    pub(crate) rows: usize,
}

/// Mutable view over an input's buffer, for staging rows in place.
pub struct SlabSlice<'a> {
    pub(crate) token: SlabToken,
    pub(crate) region: &'a SharedRegion,
    pub(crate) dtype: Dtype,
    pub(crate) row_width: usize,
}

impl SlabSlice<'_> {
    /// The token to pass back through [`crate::Args::slab`].
    pub fn token(&self) -> SlabToken {
        self.token
    }

    /// Fills the slab from a tensor of exactly the slab's shape.
    pub fn fill(&mut self, tensor: &HostTensor) -> Result<()> {
        if tensor.dtype() != self.dtype {
            return Err(Error::DtypeMismatch {
                expected: self.dtype,
                got: tensor.dtype(),
            });
        }
        let expected = self.token.rows * self.row_width * self.dtype.size_of();
        let bytes = tensor.data().as_bytes();
        if bytes.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: vec![self.token.rows, self.row_width],
                got: tensor.shape().to_vec(),
            });
        }
        self.region.write_bytes(DATA_OFFSET, bytes);
        Ok(())
    }
}

/// Fixed header at the front of every buffer segment.
pub(crate) const DATA_OFFSET: usize = 128;
const MAX_DIMS: usize = 8;
const MAGIC: u64 = 0x4c53_4942; // "LSIB"

const OFF_MAGIC: usize = 0;
const OFF_DTYPE: usize = 8;
const OFF_NDIM: usize = 12;
const OFF_DIMS: usize = 16; // dims[0] is the batch-axis capacity

fn dtype_code(dtype: Dtype) -> u32 {
    match dtype {
        Dtype::F32 => 0,
        Dtype::F64 => 1,
        Dtype::I32 => 2,
        Dtype::I64 => 3,
    }
}

fn dtype_from_code(code: u32) -> Option<Dtype> {
    match code {
        0 => Some(Dtype::F32),
        1 => Some(Dtype::F64),
        2 => Some(Dtype::I32),
        3 => Some(Dtype::I64),
        _ => None,
    }
}

/// Parsed buffer-segment header: dtype plus dims with the batch capacity in
/// `dims[0]`.
pub(crate) struct BufferHeader {
    pub dtype: Dtype,
    pub dims: Vec<usize>,
}

impl BufferHeader {
    pub fn capacity_rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    pub fn row_width(&self) -> usize {
        self.dims.iter().skip(1).product()
    }
}

pub(crate) fn write_header(region: &SharedRegion, dtype: Dtype, dims: &[usize]) {
    debug_assert!(dims.len() <= MAX_DIMS);
    region
        .atomic_u32(OFF_DTYPE)
        .store(dtype_code(dtype), Ordering::Relaxed);
    region
        .atomic_u32(OFF_NDIM)
        .store(dims.len() as u32, Ordering::Relaxed);
    for (i, &d) in dims.iter().enumerate() {
        region
            .atomic_u64(OFF_DIMS + 8 * i)
            .store(d as u64, Ordering::Relaxed);
    }
    region.atomic_u64(OFF_MAGIC).store(MAGIC, Ordering::Release);
}

pub(crate) fn read_header(region: &SharedRegion) -> Result<BufferHeader> {
    if region.len() < DATA_OFFSET
        || region.atomic_u64(OFF_MAGIC).load(Ordering::Acquire) != MAGIC
    {
        return Err(SyncError::BadMagic {
            path: region.path().to_path_buf(),
        }
        .into());
    }
    let code = region.atomic_u32(OFF_DTYPE).load(Ordering::Relaxed);
    let dtype = dtype_from_code(code)
        .ok_or_else(|| Error::Config(format!("unknown dtype code {code} in buffer header")))?;
    let ndim = region.atomic_u32(OFF_NDIM).load(Ordering::Relaxed) as usize;
    if ndim > MAX_DIMS {
        return Err(Error::Config(format!("buffer header claims {ndim} dims")).into());
    }
    let dims = (0..ndim)
        .map(|i| region.atomic_u64(OFF_DIMS + 8 * i).load(Ordering::Relaxed) as usize)
        .collect();
    Ok(BufferHeader { dtype, dims })
}

/// The master-side live buffer for one input.
pub(crate) struct InputBuffer {
    pub region: SharedRegion,
    pub tag: u64,
    pub capacity_rows: usize,
    pub tail: Vec<usize>,
}

impl InputBuffer {
    pub fn row_width(&self) -> usize {
        self.tail.iter().product()
    }
}

pub(crate) struct InputEntry {
    pub name: String,
    pub dtype: Dtype,
    pub buffer: Option<InputBuffer>,
}

#[derive(Default)]
pub(crate) struct InputRegistry {
    entries: Vec<InputEntry>,
    next_tag: u64,
}

impl InputRegistry {
    pub fn register(&mut self, name: &str, dtype: Dtype) -> Result<InputVar> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(Error::Config(format!(
                "input name {name:?} is already registered"
            )));
        }
        let id = self.entries.len();
        self.entries.push(InputEntry {
            name: name.to_string(),
            dtype,
            buffer: None,
        });
        Ok(InputVar {
            id,
            name: name.to_string(),
            dtype,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, id: usize) -> &InputEntry {
        &self.entries[id]
    }

    pub fn names_and_dtypes(&self) -> Vec<(String, Dtype)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.dtype))
            .collect()
    }

    /// Ensures input `id` has a live buffer with the given non-batch dims and
    /// capacity for `rows`, allocating under a fresh tag if needed. Returns
    /// whether a new segment was allocated.
    pub fn ensure_buffer(
        &mut self,
        paths: &RunPaths,
        id: usize,
        tail: &[usize],
        rows: usize,
    ) -> Result<bool> {
        let entry = &mut self.entries[id];
        if let Some(buf) = &entry.buffer {
            if buf.tail == tail && buf.capacity_rows >= rows {
                return Ok(false);
            }
        }
        // Capacity is ceil(rows * 1.05), minimum one row.
        let capacity = (rows * 21).div_ceil(20).max(1);
        let row_width: usize = tail.iter().product();
        let nbytes = DATA_OFFSET + capacity * row_width * entry.dtype.size_of();
        self.next_tag += 1;
        let tag = self.next_tag;
        let region = SharedRegion::create(&paths.input_buffer(id, tag), nbytes.max(DATA_OFFSET))?;
        let mut dims = vec![capacity];
        dims.extend_from_slice(tail);
        write_header(&region, entry.dtype, &dims);
        let old = entry.buffer.replace(InputBuffer {
            region,
            tag,
            capacity_rows: capacity,
            tail: tail.to_vec(),
        });
        if let Some(old) = old {
            // The previous generation is unreachable once the new tag is
            // published; reclaim its disk space.
            let _ = std::fs::remove_file(old.region.path());
        }
        Ok(true)
    }

    /// Stages a caller-provided batch into input `id`'s buffer, reusing or
    /// reallocating per the policy above. Returns the live tag.
    pub fn stage(&mut self, paths: &RunPaths, id: usize, tensor: &HostTensor) -> Result<u64> {
        let entry = &self.entries[id];
        if tensor.dtype() != entry.dtype {
            return Err(Error::DtypeMismatch {
                expected: entry.dtype,
                got: tensor.dtype(),
            });
        }
        let tail: Vec<usize> = tensor.shape().iter().skip(1).copied().collect();
        self.ensure_buffer(paths, id, &tail, tensor.rows())?;
        let entry = &self.entries[id];
        let buf = entry
            .buffer
            .as_ref()
            .ok_or_else(|| Error::Engine("input buffer vanished after ensure".into()))?;
        buf.region.write_bytes(DATA_OFFSET, tensor.data().as_bytes());
        Ok(buf.tag)
    }

    /// The live buffer for input `id`, if any.
    pub fn buffer(&self, id: usize) -> Option<&InputBuffer> {
        self.entries[id].buffer.as_ref()
    }

    /// Bytes of the live rows `range` for input `id`.
    pub fn view_bytes(&self, id: usize, start_row: usize, rows: usize) -> Result<&[u8]> {
        let buf = self.buffer(id).ok_or_else(|| {
            Error::Engine(format!("input {id} has no staged buffer"))
        })?;
        let row_bytes = buf.row_width() * self.entries[id].dtype.size_of();
        Ok(buf
            .region
            .bytes(DATA_OFFSET + start_row * row_bytes, rows * row_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::HostTensor;

    fn registry_with_input(dir: &std::path::Path) -> (RunPaths, InputRegistry, InputVar) {
        let paths = RunPaths::new(dir);
        let mut reg = InputRegistry::default();
        let var = reg.register("x", Dtype::F32).unwrap();
        (paths, reg, var)
    }

    #[test]
    fn stage_allocates_with_slack() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, mut reg, var) = registry_with_input(dir.path());
        let t = HostTensor::from_vec(vec![0.0f32; 100 * 3], &[100, 3]).unwrap();
        let tag = reg.stage(&paths, var.id(), &t).unwrap();
        assert_eq!(tag, 1);
        let buf = reg.buffer(var.id()).unwrap();
        assert_eq!(buf.capacity_rows, 105);
        assert_eq!(buf.tail, vec![3]);
    }

    #[test]
    fn smaller_batch_reuses_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, mut reg, var) = registry_with_input(dir.path());
        let big = HostTensor::from_vec(vec![1.0f32; 100 * 3], &[100, 3]).unwrap();
        let small = HostTensor::from_vec(vec![2.0f32; 80 * 3], &[80, 3]).unwrap();
        let tag1 = reg.stage(&paths, var.id(), &big).unwrap();
        let tag2 = reg.stage(&paths, var.id(), &small).unwrap();
        assert_eq!(tag1, tag2, "capacity covered the smaller batch");
        // Head rows hold the new data.
        let bytes = reg.view_bytes(var.id(), 0, 80).unwrap();
        assert!(bytes[..4] == 2.0f32.to_ne_bytes());
    }

    #[test]
    fn growth_within_slack_reuses_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, mut reg, var) = registry_with_input(dir.path());
        let t100 = HostTensor::from_vec(vec![0.0f32; 100], &[100]).unwrap();
        let t104 = HostTensor::from_vec(vec![0.0f32; 104], &[104]).unwrap();
        let tag1 = reg.stage(&paths, var.id(), &t100).unwrap();
        let tag2 = reg.stage(&paths, var.id(), &t104).unwrap();
        assert_eq!(tag1, tag2, "104 rows fit the 105-row capacity");
    }

    #[test]
    fn new_tail_reallocates_under_fresh_tag() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, mut reg, var) = registry_with_input(dir.path());
        let a = HostTensor::from_vec(vec![0.0f32; 10 * 3], &[10, 3]).unwrap();
        let b = HostTensor::from_vec(vec![0.0f32; 10 * 4], &[10, 4]).unwrap();
        let tag1 = reg.stage(&paths, var.id(), &a).unwrap();
        let tag2 = reg.stage(&paths, var.id(), &b).unwrap();
        assert!(tag2 > tag1);
    }

    #[test]
    fn bigger_batch_reallocates_under_fresh_tag() {
        let dir = tempfile::tempdir().unwrap();
        let (paths, mut reg, var) = registry_with_input(dir.path());
        let a = HostTensor::from_vec(vec![0.0f32; 100], &[100]).unwrap();
        let b = HostTensor::from_vec(vec![0.0f32; 200], &[200]).unwrap();
        let tag1 = reg.stage(&paths, var.id(), &a).unwrap();
        let tag2 = reg.stage(&paths, var.id(), &b).unwrap();
        assert!(tag2 > tag1);
        assert_eq!(reg.buffer(var.id()).unwrap().capacity_rows, 210);
    }

    #[test]
    fn header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.seg");
        let region = SharedRegion::create(&path, DATA_OFFSET + 64).unwrap();
        write_header(&region, Dtype::I64, &[5, 2, 2]);
        let header = read_header(&SharedRegion::open(&path).unwrap()).unwrap();
        assert_eq!(header.dtype, Dtype::I64);
        assert_eq!(header.dims, vec![5, 2, 2]);
        assert_eq!(header.capacity_rows(), 5);
        assert_eq!(header.row_width(), 4);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut reg = InputRegistry::default();
        reg.register("x", Dtype::F32).unwrap();
        assert!(reg.register("x", Dtype::F64).is_err());
    }
}
